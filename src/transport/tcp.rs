//! OPC over TCP: one thread per connection, messages handled in order.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::{dispatch, is_timeout, Dispatch, TransportError, POLL_INTERVAL};
use crate::ingest::FrameStore;
use crate::opc::OpcStream;

const READ_CHUNK: usize = 65_536;

pub struct TcpTransport {
    listener: TcpListener,
    store: Arc<FrameStore>,
    config_json: Arc<str>,
}

impl TcpTransport {
    /// Bind the listener.
    ///
    /// # Arguments
    /// * `addr` - Address to listen on
    /// * `store` - Frame store receiving pixel data
    /// * `config_json` - Reply to "get config" requests
    pub fn bind(
        addr: SocketAddr,
        store: Arc<FrameStore>,
        config_json: Arc<str>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).map_err(|source| TransportError::Bind {
            proto: "tcp",
            addr,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| TransportError::Setup {
                proto: "tcp",
                source,
            })?;
        Ok(TcpTransport {
            listener,
            store,
            config_json,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` is raised, then wait for every
    /// connection thread to finish.
    pub fn run(self, shutdown: Arc<AtomicBool>) {
        if let Ok(addr) = self.local_addr() {
            log::info!("[tcp] Starting TCP server on {}", addr);
        }

        let mut connections: Vec<JoinHandle<()>> = Vec::new();
        while !shutdown.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    log::info!("[tcp] Connection from {}", peer);
                    let store = Arc::clone(&self.store);
                    let config_json = Arc::clone(&self.config_json);
                    let shutdown = Arc::clone(&shutdown);
                    let spawned = thread::Builder::new()
                        .name(format!("tcp-{}", peer))
                        .spawn(move || {
                            if let Err(e) =
                                serve_connection(stream, &store, &config_json, &shutdown)
                            {
                                log::warn!("[tcp] Connection from {} failed: {}", peer, e);
                            }
                            log::info!("[tcp] Connection from {} closed", peer);
                        });
                    match spawned {
                        Ok(handle) => connections.push(handle),
                        // The stream moved into the failed closure and is closed
                        Err(e) => log::error!("[tcp] Dropping connection from {}: {}", peer, e),
                    }
                }
                Err(e) if is_timeout(&e) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    log::warn!("[tcp] accept failed: {}", e);
                    thread::sleep(POLL_INTERVAL);
                }
            }
            connections.retain(|h| !h.is_finished());
        }

        for handle in connections {
            let _ = handle.join();
        }
        log::info!("[tcp] TCP server stopped");
    }
}

fn serve_connection(
    mut stream: TcpStream,
    store: &FrameStore,
    config_json: &str,
    shutdown: &AtomicBool,
) -> io::Result<()> {
    // Accepted sockets may inherit non-blocking mode from the listener
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;

    let mut opc = OpcStream::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    while !shutdown.load(Ordering::Relaxed) {
        let n = match stream.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if is_timeout(&e) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        opc.extend(&chunk[..n]);

        let mut config_requests = 0;
        opc.drain(|msg| {
            if dispatch(msg, store, "tcp") == Dispatch::ConfigRequested {
                config_requests += 1;
            }
        });
        for _ in 0..config_requests {
            log::info!("[tcp] Responding to config request");
            // NUL-terminated for C clients
            stream.write_all(config_json.as_bytes())?;
            stream.write_all(&[0])?;
        }
    }
    Ok(())
}
