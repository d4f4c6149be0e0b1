pub mod browser;
pub mod config;
pub mod notify;

pub use browser::{Browser, BrowserError};
pub use config::BrowserConfig;
