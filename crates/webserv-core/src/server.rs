// src/server.rs
use crate::config::Config;
use crate::error::{ServeError, ServeResult};
use crate::poller::{Interest, Poller, Role};
use crate::syscalls::{self, create_pipe, write_nonblocking};
use crate::worker::{Listener, Worker};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

/// Cloneable handle that stops a running [`Server`] from any thread.
///
/// Triggering sets a flag and writes one byte to a self-pipe the event loop
/// watches, so a loop blocked in `poll(2)` wakes immediately.
#[derive(Debug, Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    wake: Arc<OwnedFd>,
}

impl Shutdown {
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        let _ = write_nonblocking(self.wake.as_raw_fd(), &[1]);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

pub struct Server {
    worker: Worker,
    addrs: Vec<SocketAddr>,
    shutdown: Shutdown,
}

impl Server {
    /// Open one listening socket per distinct configured address.
    ///
    /// Addresses that fail to bind are logged and skipped; startup only
    /// fails when none of them could be opened.
    pub fn bind(config: Config) -> ServeResult<Self> {
        let mut poller = Poller::new();
        let mut listeners = HashMap::new();
        let mut addrs = Vec::new();

        for (addr, candidates) in config.listen_groups() {
            match syscalls::create_listen_socket(&addr) {
                Ok(listener) => {
                    let local = listener.local_addr()?;
                    info!("listening on {}", local);
                    let fd = listener.as_raw_fd();
                    poller.register(fd, Role::Listener, Interest::READ);
                    listeners.insert(fd, Listener { listener, candidates });
                    addrs.push(local);
                }
                Err(source) => {
                    let err = ServeError::Bind { addr, source };
                    error!("{}", err);
                }
            }
        }
        if listeners.is_empty() {
            return Err(ServeError::NoListeners);
        }

        let (wake_rx, wake_tx) = create_pipe()?;
        poller.register(wake_rx.as_raw_fd(), Role::Waker, Interest::READ);
        let shutdown = Shutdown {
            flag: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(wake_tx),
        };

        Ok(Self {
            worker: Worker::new(config, poller, listeners, wake_rx),
            addrs,
            shutdown,
        })
    }

    /// Bound addresses, with ephemeral ports resolved.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Run the event loop on the calling thread until shutdown is triggered.
    pub fn run(mut self) -> ServeResult<()> {
        info!("server started with {} listener(s)", self.addrs.len());
        let result = self.worker.run(&self.shutdown);
        info!("server stopped");
        result
    }
}
