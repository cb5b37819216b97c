pub mod app;
pub mod config;
pub mod logging;
pub mod migrations;
pub mod router;
pub mod server;
