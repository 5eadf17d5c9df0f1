pub mod api_server;
pub mod config;
pub mod logger;
pub mod rate_limit;
pub mod security;
pub mod sessions;
pub mod validation;
pub mod whatsapp;

pub use config::*;
#[allow(unused_imports)]
pub use logger::*;
