use chromiumoxide::browser::{Browser, BrowserConfig as CdpBrowserConfig};
use chromiumoxide::cdp::browser_protocol::dom::SetFileInputFilesParams;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::element::Element;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::Deserialize;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ClientError, ClientEvent, ClientFactory, EventSender, MediaFile, MessagingClient};
use crate::models::{BrowserConfig, ClientInfo};

const WEB_URL: &str = "https://web.whatsapp.com";

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const LAUNCH_ARGS: &[&str] = &[
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--disable-accelerated-2d-canvas",
    "--no-first-run",
    "--no-zygote",
    "--single-process",
    "--disable-gpu",
];

const COMPOSE_BOX: &str = "footer div[contenteditable='true']";
const SEND_BUTTON: &str = "footer span[data-icon='send'], footer button[aria-label='Send']";
const ATTACH_BUTTON: &str = "footer span[data-icon='plus'], footer span[data-icon='clip']";
const FILE_INPUT: &str = "input[type='file']";
const CAPTION_BOX: &str = "div[role='dialog'] div[contenteditable='true'], div[contenteditable='true'][data-lexical-editor]";
const MEDIA_SEND_BUTTON: &str = "div[role='dialog'] span[data-icon='send'], span[data-icon='wds-ic-send-filled']";

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const ELEMENT_POLL: Duration = Duration::from_millis(500);
const CHAT_TIMEOUT: Duration = Duration::from_secs(45);
const ACK_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_PROBE_FAILURES: u32 = 5;

/// Reads the login state off the page in one round trip.
const PROBE_JS: &str = r#"(() => {
    const read = (k) => {
        const v = window.localStorage.getItem(k);
        if (!v) return null;
        try { return JSON.parse(v); } catch (e) { return v; }
    };
    const qr = document.querySelector('div[data-ref]');
    const ready = !!document.querySelector('#pane-side');
    const loading = !qr && !ready && !!document.querySelector('progress, [data-testid="startup"]');
    return {
        qr: qr ? qr.getAttribute('data-ref') : null,
        ready: ready,
        loading: loading,
        wid: ready ? read('last-wid-md') || read('last-wid') : null,
        pushname: ready ? read('me-display-name') : null,
        platform: ready ? read('WAWebPlatform') : null
    };
})()"#;

const LAST_OUTGOING_JS: &str = r#"(() => {
    const nodes = document.querySelectorAll('[data-id^="true_"]');
    return nodes.length ? nodes[nodes.length - 1].getAttribute('data-id') : '';
})()"#;

const CLEAR_STORAGE_JS: &str = r#"(() => {
    window.localStorage.clear();
    if (window.indexedDB && window.indexedDB.databases) {
        window.indexedDB.databases().then((dbs) => dbs.forEach((d) => window.indexedDB.deleteDatabase(d.name)));
    }
    return true;
})()"#;

fn browser_err(e: impl std::fmt::Display) -> ClientError {
    ClientError::Browser(e.to_string())
}

// ============================================================================
// Page state tracking
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Probe {
    pub qr: Option<String>,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub loading: bool,
    pub wid: Option<String>,
    pub pushname: Option<String>,
    pub platform: Option<String>,
}

/// Turns successive page probes into lifecycle events.
#[derive(Debug, Default)]
pub(crate) struct PageWatch {
    last_qr: Option<String>,
    authenticated: bool,
    ready: bool,
}

impl PageWatch {
    pub fn observe(&mut self, probe: &Probe) -> Vec<ClientEvent> {
        let mut events = Vec::new();

        if let Some(qr) = &probe.qr {
            if self.ready || self.authenticated {
                // device was unlinked from the phone
                events.push(ClientEvent::Disconnected("LOGOUT".to_string()));
                self.ready = false;
                self.authenticated = false;
            }
            if self.last_qr.as_deref() != Some(qr.as_str()) {
                self.last_qr = Some(qr.clone());
                events.push(ClientEvent::Qr(qr.clone()));
            }
            return events;
        }

        if !self.authenticated && (probe.ready || (probe.loading && self.last_qr.is_some())) {
            self.authenticated = true;
            events.push(ClientEvent::Authenticated);
        }

        if probe.ready && !self.ready {
            self.ready = true;
            self.last_qr = None;
            events.push(ClientEvent::Ready(ClientInfo {
                pushname: probe.pushname.clone().unwrap_or_else(|| "Unknown".to_string()),
                wid: probe.wid.clone().unwrap_or_default(),
                platform: probe.platform.clone().unwrap_or_else(|| "Unknown".to_string()),
            }));
        }

        events
    }
}

// ============================================================================
// Client
// ============================================================================

struct Runtime {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
    watcher: JoinHandle<()>,
}

/// One headless Chromium per session, profile persisted under the session dir.
pub struct BrowserClient {
    session_id: String,
    profile_dir: PathBuf,
    options: BrowserConfig,
    events: EventSender,
    runtime: Mutex<Option<Runtime>>,
    /// The composer is shared page state; sends must not interleave.
    send_lock: Mutex<()>,
}

impl BrowserClient {
    pub fn new(
        session_id: &str,
        profile_dir: PathBuf,
        options: BrowserConfig,
        events: EventSender,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            profile_dir,
            options,
            events,
            runtime: Mutex::new(None),
            send_lock: Mutex::new(()),
        }
    }

    async fn page(&self) -> Result<Page, ClientError> {
        let runtime = self.runtime.lock().await;
        runtime
            .as_ref()
            .map(|rt| rt.page.clone())
            .ok_or(ClientError::NotInitialized)
    }

    async fn open_chat(&self, page: &Page, chat_id: &str, text: Option<&str>) -> Result<(), ClientError> {
        let (phone, server) = chat_id.split_once('@').unwrap_or((chat_id, "c.us"));
        if server != "c.us" {
            return Err(ClientError::UnsupportedRecipient(chat_id.to_string()));
        }

        let mut url = format!("{}/send?phone={}", WEB_URL, phone);
        if let Some(text) = text {
            url.push_str("&text=");
            url.push_str(&urlencoding::encode(text));
        }

        debug!("[{}] opening chat {}", self.session_id, phone);
        page.goto(url).await.map_err(browser_err)?;
        wait_for(page, COMPOSE_BOX, CHAT_TIMEOUT, "chat composer").await?;
        Ok(())
    }

    fn spawn_watcher(&self, page: Page) -> JoinHandle<()> {
        let events = self.events.clone();
        let session_id = self.session_id.clone();

        tokio::spawn(async move {
            let mut watch = PageWatch::default();
            let mut failures = 0u32;

            loop {
                tokio::time::sleep(POLL_INTERVAL).await;

                let probe = match page.evaluate(PROBE_JS).await {
                    Ok(result) => {
                        failures = 0;
                        result.into_value::<Probe>().unwrap_or_default()
                    }
                    Err(e) => {
                        failures += 1;
                        debug!("[{}] page probe failed ({}): {}", session_id, failures, e);
                        if failures >= MAX_PROBE_FAILURES {
                            let _ = events.send(ClientEvent::Disconnected(format!("browser unreachable: {}", e)));
                            break;
                        }
                        continue;
                    }
                };

                for event in watch.observe(&probe) {
                    if events.send(event).is_err() {
                        // registry dropped the session
                        return;
                    }
                }
            }
        })
    }
}

async fn wait_for(
    page: &Page,
    selector: &str,
    timeout: Duration,
    what: &'static str,
) -> Result<Element, ClientError> {
    let started = Instant::now();
    loop {
        if let Ok(element) = page.find_element(selector).await {
            return Ok(element);
        }
        if started.elapsed() >= timeout {
            return Err(ClientError::Timeout(what));
        }
        tokio::time::sleep(ELEMENT_POLL).await;
    }
}

async fn last_outgoing_id(page: &Page) -> String {
    match page.evaluate(LAST_OUTGOING_JS).await {
        Ok(result) => result.into_value::<String>().unwrap_or_default(),
        Err(_) => String::new(),
    }
}

/// Wait until a new outgoing message bubble shows up and return its id.
async fn wait_for_ack(page: &Page, previous: &str) -> Result<String, ClientError> {
    let started = Instant::now();
    loop {
        let current = last_outgoing_id(page).await;
        if !current.is_empty() && current != previous {
            return Ok(current);
        }
        if started.elapsed() >= ACK_TIMEOUT {
            return Err(ClientError::Timeout("message acknowledgement"));
        }
        tokio::time::sleep(ELEMENT_POLL).await;
    }
}

#[async_trait::async_trait]
impl MessagingClient for BrowserClient {
    async fn initialize(&self) -> Result<(), ClientError> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return Ok(());
        }

        info!("[{}] Launching headless Chromium via chromiumoxide...", self.session_id);

        let mut builder = CdpBrowserConfig::builder()
            .user_data_dir(&self.profile_dir)
            .no_sandbox()
            .args(LAUNCH_ARGS.iter().copied());
        if let Some(exe) = &self.options.chrome_executable {
            builder = builder.chrome_executable(exe);
        }
        if self.options.headful {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(ClientError::Browser)?;

        let (browser, mut handler) = Browser::launch(config).await.map_err(browser_err)?;

        // Spawn the CDP event loop
        let handler = tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
        });

        let page = browser.new_page("about:blank").await.map_err(browser_err)?;
        page.set_user_agent(SetUserAgentOverrideParams::new(USER_AGENT))
            .await
            .map_err(browser_err)?;
        page.goto(WEB_URL).await.map_err(browser_err)?;

        let watcher = self.spawn_watcher(page.clone());
        *runtime = Some(Runtime {
            browser,
            page,
            handler,
            watcher,
        });

        info!("[{}] web client loaded", self.session_id);
        Ok(())
    }

    async fn send_text(&self, chat_id: &str, body: &str) -> Result<String, ClientError> {
        let _guard = self.send_lock.lock().await;
        let page = self.page().await?;

        let previous = last_outgoing_id(&page).await;
        self.open_chat(&page, chat_id, Some(body)).await?;

        let button = wait_for(&page, SEND_BUTTON, CHAT_TIMEOUT, "send button").await?;
        button.click().await.map_err(browser_err)?;

        wait_for_ack(&page, &previous).await
    }

    async fn send_media(
        &self,
        chat_id: &str,
        media: &MediaFile,
        caption: Option<&str>,
    ) -> Result<String, ClientError> {
        let _guard = self.send_lock.lock().await;
        let page = self.page().await?;

        let previous = last_outgoing_id(&page).await;
        self.open_chat(&page, chat_id, None).await?;

        let attach = wait_for(&page, ATTACH_BUTTON, CHAT_TIMEOUT, "attach button").await?;
        attach.click().await.map_err(browser_err)?;

        let input = wait_for(&page, FILE_INPUT, CHAT_TIMEOUT, "file input").await?;
        let params = SetFileInputFilesParams::builder()
            .files(vec![media.path.to_string_lossy().to_string()])
            .backend_node_id(input.backend_node_id.clone())
            .build()
            .map_err(ClientError::Browser)?;
        page.execute(params).await.map_err(browser_err)?;

        if let Some(caption) = caption.filter(|c| !c.is_empty()) {
            let caption_box = wait_for(&page, CAPTION_BOX, CHAT_TIMEOUT, "caption box").await?;
            caption_box.click().await.map_err(browser_err)?;
            caption_box.type_str(caption).await.map_err(browser_err)?;
        }

        let button = wait_for(&page, MEDIA_SEND_BUTTON, CHAT_TIMEOUT, "media send button").await?;
        button.click().await.map_err(browser_err)?;

        debug!("[{}] sent {} ({})", self.session_id, media.file_name, media.mime_type);
        wait_for_ack(&page, &previous).await
    }

    async fn logout(&self) -> Result<(), ClientError> {
        let page = self.page().await?;
        page.evaluate(CLEAR_STORAGE_JS).await.map_err(browser_err)?;
        info!("[{}] cleared web client storage", self.session_id);
        Ok(())
    }

    async fn destroy(&self) -> Result<(), ClientError> {
        let Some(mut rt) = self.runtime.lock().await.take() else {
            return Ok(());
        };

        rt.watcher.abort();
        if let Err(e) = rt.browser.close().await {
            warn!("[{}] browser close failed: {}", self.session_id, e);
        }
        let _ = rt.browser.wait().await;
        rt.handler.abort();

        info!("[{}] browser closed", self.session_id);
        Ok(())
    }
}

/// Builds a [`BrowserClient`] with its profile under `<session_path>/<id>`.
pub struct BrowserClientFactory {
    session_path: PathBuf,
    options: BrowserConfig,
}

impl BrowserClientFactory {
    pub fn new(session_path: PathBuf, options: BrowserConfig) -> Self {
        Self {
            session_path,
            options,
        }
    }
}

impl ClientFactory for BrowserClientFactory {
    fn create(&self, session_id: &str, events: EventSender) -> Arc<dyn MessagingClient> {
        Arc::new(BrowserClient::new(
            session_id,
            self.session_path.join(session_id),
            self.options.clone(),
            events,
        ))
    }
}
