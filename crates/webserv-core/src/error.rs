use crate::config::ConfigError;
use crate::parser::ParseError;
use std::io;
use std::net::SocketAddr;

/// Central error type for the webserv engine.
///
/// Only startup paths return these to the caller. Failures that belong to a
/// single connection are logged and contained inside the event loop.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The configuration file could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Error during HTTP request parsing.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    /// A listening socket could not be created for a configured address.
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// Every configured address failed to bind.
    #[error("no valid listen addresses available, cannot start server")]
    NoListeners,
}

pub type ServeResult<T> = Result<T, ServeError>;
