// ESP-IDF bindings for the update core

pub mod flash;
pub mod http_client;
pub mod system;
pub mod web_server;

pub use flash::{EspBootControl, EspFlash};
pub use http_client::EspHttpClient;
pub use system::{EspSystem, StaConnectivity};
