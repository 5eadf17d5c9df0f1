//! Char-boundary-safe shortening for log output.

/// Longest prefix of `s` with at most `max_chars` characters.
pub fn safe_truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Like [`safe_truncate`] but marks elided content with `...`.
pub fn preview(s: &str, max_chars: usize) -> String {
    let head = safe_truncate(s, max_chars);
    if head.len() < s.len() {
        format!("{}...", head)
    } else {
        head.to_string()
    }
}

/// Keep the first four characters of a secret and mask the rest.
pub fn mask_secret(secret: &str) -> String {
    let head = safe_truncate(secret, 4);
    let hidden = secret.chars().count() - head.chars().count();
    format!("{}{}", head, "*".repeat(hidden.min(8)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(safe_truncate("héllo", 2), "hé");
        assert_eq!(safe_truncate("hi", 10), "hi");
        assert_eq!(preview("2@abcdef", 4), "2@ab...");
        assert_eq!(preview("short", 5), "short");
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("abcdefgh"), "abcd****");
        assert_eq!(mask_secret("abc"), "abc");
        assert_eq!(mask_secret(&"k".repeat(40)), "kkkk********");
    }
}
