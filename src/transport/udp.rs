//! OPC over UDP: one message per datagram.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{dispatch, is_timeout, Dispatch, TransportError, POLL_INTERVAL};
use crate::frame::FrameLayout;
use crate::ingest::FrameStore;
use crate::opc::{parse, HEADER_LEN};

/// Largest UDP payload over IPv4.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

pub struct UdpTransport {
    socket: UdpSocket,
    store: Arc<FrameStore>,
}

impl UdpTransport {
    /// Bind the socket, refusing layouts whose full frame cannot fit in a
    /// single datagram.
    pub fn bind(addr: SocketAddr, store: Arc<FrameStore>) -> Result<Self, TransportError> {
        let layout = store.layout();
        check_layout(layout)?;

        let socket = UdpSocket::bind(addr).map_err(|source| TransportError::Bind {
            proto: "udp",
            addr,
            source,
        })?;
        socket
            .set_read_timeout(Some(POLL_INTERVAL))
            .map_err(|source| TransportError::Setup {
                proto: "udp",
                source,
            })?;
        Ok(UdpTransport { socket, store })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn run(self, shutdown: &AtomicBool) {
        if let Ok(addr) = self.local_addr() {
            log::info!("[udp] Starting UDP server on {}", addr);
        }

        let mut buf = vec![0u8; 65_536];
        while !shutdown.load(Ordering::Relaxed) {
            let n = match self.socket.recv(&mut buf) {
                Ok(n) => n,
                Err(e) if is_timeout(&e) => continue,
                Err(e) => {
                    log::warn!("[udp] recv failed: {}", e);
                    continue;
                }
            };

            // Datagrams with an incomplete message are dropped
            if let Some((msg, _)) = parse(&buf[..n]) {
                if dispatch(msg, &self.store, "udp") == Dispatch::ConfigRequested {
                    log::warn!("[udp] Config request received but not supported on UDP");
                }
            }
        }
        log::info!("[udp] UDP server stopped");
    }
}

/// Ensure a full frame fits in one OPC datagram.
pub fn check_layout(layout: FrameLayout) -> Result<(), TransportError> {
    let required = layout.byte_len() + HEADER_LEN;
    if required > MAX_UDP_PAYLOAD {
        return Err(TransportError::PacketTooLarge {
            leds: layout.pixel_count(),
            required,
        });
    }
    Ok(())
}
