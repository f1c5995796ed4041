pub mod bindings;
pub mod cloudflare;
pub mod config;
pub mod deploy;
pub mod dispatch;
pub mod error;
pub mod finalize;
pub mod manifest;
pub mod preview;
pub mod proxy;
pub mod router;
pub mod telemetry;
pub mod upload;
pub mod websocket;
