//! E1.31 (streaming ACN) receiver.
//!
//! Each universe 1..=N carries the pixel data of strip N-1. Packets are
//! merged into one aggregate frame, and the whole frame is submitted after
//! every accepted packet.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{is_timeout, TransportError, POLL_INTERVAL};
use crate::frame::FrameLayout;
use crate::ingest::FrameStore;

/// Root, framing and DMP layer headers preceding the DMX data.
pub const E131_HEADER_LEN: usize = 126;
const SEQUENCE_OFFSET: usize = 111;
const UNIVERSE_OFFSET: usize = 113;
/// A sequence number this far behind the last one is treated as a restart.
const SEQUENCE_RESTART_GAP: u8 = 64;
const BACKPRESSURE_SLEEP: Duration = Duration::from_millis(1);

/// Fields of an E1.31 data packet used by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct E131Packet<'a> {
    pub sequence: u8,
    pub universe: u16,
    pub data: &'a [u8],
}

/// Extract sequence, universe and DMX data; `None` if the packet is too short.
pub fn parse_e131(packet: &[u8]) -> Option<E131Packet<'_>> {
    if packet.len() < E131_HEADER_LEN {
        return None;
    }
    Some(E131Packet {
        sequence: packet[SEQUENCE_OFFSET],
        universe: u16::from_be_bytes([packet[UNIVERSE_OFFSET], packet[UNIVERSE_OFFSET + 1]]),
        data: &packet[E131_HEADER_LEN..],
    })
}

/// Multicast group carrying `universe`.
pub fn multicast_group(universe: u16) -> Ipv4Addr {
    let [hi, lo] = universe.to_be_bytes();
    Ipv4Addr::new(239, 255, hi, lo)
}

/// Result of handling one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum E131Outcome {
    /// Data for `strip` was merged and the frame submitted
    Submitted { strip: usize },
    TooShort(usize),
    OutOfOrder { sequence: u8, last: u8 },
    UniverseOutOfRange(u16),
}

/// Packet handling state, independent of the socket.
pub struct E131Receiver {
    store: Arc<FrameStore>,
    layout: FrameLayout,
    frame: Vec<u8>,
    last_sequence: Option<u8>,
    packets_since_update: usize,
    counter_at_update: u64,
}

impl E131Receiver {
    pub fn new(store: Arc<FrameStore>) -> Self {
        let layout = store.layout();
        let counter_at_update = store.frame_counter();
        E131Receiver {
            store,
            layout,
            frame: vec![0; layout.byte_len()],
            last_sequence: None,
            packets_since_update: 0,
            counter_at_update,
        }
    }

    fn in_sequence(&self, sequence: u8) -> bool {
        match self.last_sequence {
            None => true,
            Some(last) => sequence >= last || last - sequence > SEQUENCE_RESTART_GAP,
        }
    }

    /// Merge one datagram into the aggregate frame and submit it.
    pub fn handle_packet(&mut self, packet: &[u8]) -> E131Outcome {
        let Some(p) = parse_e131(packet) else {
            log::debug!("[e131] packet too small: {} < {}", packet.len(), E131_HEADER_LEN);
            return E131Outcome::TooShort(packet.len());
        };

        if !self.in_sequence(p.sequence) {
            let last = self.last_sequence.unwrap_or_default();
            log::debug!("[e131] out of order packet; current {}, old {}", p.sequence, last);
            return E131Outcome::OutOfOrder {
                sequence: p.sequence,
                last,
            };
        }
        self.last_sequence = Some(p.sequence);

        let strips = self.layout.strips;
        if p.universe == 0 || usize::from(p.universe) > strips {
            log::warn!(
                "[e131] DMX universe {} out of bounds [1,{}]",
                p.universe,
                strips
            );
            return E131Outcome::UniverseOutOfRange(p.universe);
        }

        let strip = usize::from(p.universe) - 1;
        let offset = strip * self.layout.leds_per_strip * 3;
        let len = p.data.len().min(self.frame.len() - offset);
        self.frame[offset..offset + len].copy_from_slice(&p.data[..len]);

        self.store.submit_frame(&self.frame, true);
        E131Outcome::Submitted { strip }
    }

    /// Count a received packet. Returns true once a packet per strip has
    /// arrived without the renderer completing a tick.
    pub fn note_packet(&mut self) -> bool {
        self.packets_since_update += 1;
        let counter = self.store.frame_counter();
        if counter != self.counter_at_update {
            self.packets_since_update = 0;
            self.counter_at_update = counter;
        }
        self.packets_since_update >= self.layout.strips
    }

    /// Block until the renderer advances its frame counter.
    pub fn wait_for_render(&self, shutdown: &AtomicBool) {
        while self.store.frame_counter() == self.counter_at_update
            && !shutdown.load(Ordering::Relaxed)
        {
            thread::sleep(BACKPRESSURE_SLEEP);
        }
    }
}

pub struct E131Transport {
    socket: UdpSocket,
    receiver: E131Receiver,
}

impl E131Transport {
    /// Bind the socket and join the multicast group of every used universe.
    pub fn bind(addr: SocketAddr, store: Arc<FrameStore>) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).map_err(|source| TransportError::Bind {
            proto: "e131",
            addr,
            source,
        })?;
        socket
            .set_read_timeout(Some(POLL_INTERVAL))
            .map_err(|source| TransportError::Setup {
                proto: "e131",
                source,
            })?;

        let receiver = E131Receiver::new(store);
        if let IpAddr::V4(iface) = addr.ip() {
            let mut failed = 0;
            for universe in 1..=receiver.layout.strips as u16 {
                let group = multicast_group(universe);
                if let Err(e) = socket.join_multicast_v4(&group, &iface) {
                    log::debug!("[e131] failed to join {}: {}", group, e);
                    failed += 1;
                }
            }
            if failed > 0 {
                log::warn!("[e131] failed to join {} multicast groups", failed);
            }
        }

        Ok(E131Transport { socket, receiver })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn run(mut self, shutdown: &AtomicBool) {
        if let Ok(addr) = self.local_addr() {
            log::info!("[e131] Starting UDP server on {}", addr);
        }

        let mut buf = vec![0u8; 65_536];
        while !shutdown.load(Ordering::Relaxed) {
            let n = match self.socket.recv(&mut buf) {
                Ok(n) => n,
                Err(e) if is_timeout(&e) => continue,
                Err(e) => {
                    log::warn!("[e131] recv failed: {}", e);
                    continue;
                }
            };

            self.receiver.handle_packet(&buf[..n]);
            if self.receiver.note_packet() {
                self.receiver.wait_for_render(shutdown);
            }
        }
        log::info!("[e131] E1.31 server stopped");
    }
}
