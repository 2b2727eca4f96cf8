// src/lib.rs
pub mod cgi;
pub mod config;
pub mod conn;
pub mod error;
pub mod handler;
pub mod http;
pub mod listing;
pub mod logging;
pub mod multipart;
pub mod parser;
pub mod poller;
pub mod server;
pub mod slab;
pub mod syscalls;
mod worker;

// Re-exports for users
pub use config::{Config, ConfigError, Location, ServerConfig};
pub use error::{ServeError, ServeResult};
pub use http::{Method, RequestData, Response};
pub use logging::{init_logging, init_logging_with_level};
pub use server::{Server, Shutdown};
pub use worker::MAX_CONNECTIONS;
