pub mod api;
pub mod config;
pub mod session;

pub use api::*;
pub use config::*;
pub use session::*;
