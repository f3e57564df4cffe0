pub mod app_state;
pub mod cache;
pub mod config;
pub mod hls;
pub mod http;
pub mod logging;
pub mod resolver;
