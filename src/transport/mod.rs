//! Network listeners feeding the ingestion API.
//!
//! Each listener runs on its own OS thread and polls the shared shutdown
//! flag between blocking reads.

mod e131;
mod tcp;
mod udp;

pub use e131::{
    multicast_group, parse_e131, E131Outcome, E131Packet, E131Receiver, E131Transport, E131_HEADER_LEN,
};
pub use tcp::TcpTransport;
pub use udp::{check_layout, UdpTransport, MAX_UDP_PAYLOAD};

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::ingest::FrameStore;
use crate::opc::{OpcCommand, OpcMessage};

/// How long a blocking read waits before re-checking the shutdown flag.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors raised while starting a listener.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("[{proto}] bind {addr} failed: {source}")]
    Bind {
        proto: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("[{proto}] socket setup failed: {source}")]
    Setup {
        proto: &'static str,
        #[source]
        source: io::Error,
    },
    #[error(
        "[udp] OPC command for {leds} LEDs cannot fit in a UDP packet ({required} > 65507 bytes). \
         Reduce --count or --strip-count, or disable UDP with --udp-port 0"
    )]
    PacketTooLarge { leds: usize, required: usize },
}

/// What the transport should do after a message was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Done,
    ConfigRequested,
}

/// Route one OPC message. Pixel data is submitted as a remote frame.
pub(crate) fn dispatch(msg: OpcMessage<'_>, store: &FrameStore, tag: &str) -> Dispatch {
    match msg.command {
        OpcCommand::SetPixels(pixels) => {
            store.submit_frame(pixels, true);
            Dispatch::Done
        }
        OpcCommand::GetConfig => Dispatch::ConfigRequested,
        OpcCommand::UnsupportedSystem(id) => {
            log::warn!("[{}] Received command for unsupported system-id: {}", tag, id);
            Dispatch::Done
        }
        OpcCommand::UnsupportedSysex(cmd) => {
            log::warn!("[{}] Received unsupported system command: {}", tag, cmd);
            Dispatch::Done
        }
        OpcCommand::MalformedSysex => {
            log::warn!("[{}] Received truncated system-exclusive message", tag);
            Dispatch::Done
        }
        OpcCommand::Unsupported(cmd) => {
            log::debug!("[{}] Ignoring OPC command {}", tag, cmd);
            Dispatch::Done
        }
    }
}

/// True for the error kinds a read timeout produces.
pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
