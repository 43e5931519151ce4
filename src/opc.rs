//! Open Pixel Control message framing.
//!
//! Every message is a 4-byte header (channel, command, big-endian payload
//! length) followed by the payload. Command 0 carries RGB pixel data;
//! command 255 is a system-exclusive message whose first two payload bytes
//! name the target system.

/// Header length in bytes.
pub const HEADER_LEN: usize = 4;
/// Set pixel colors.
pub const CMD_SET_PIXELS: u8 = 0;
/// System-exclusive message.
pub const CMD_SYSTEM_EXCLUSIVE: u8 = 255;
/// System id answered by this server.
pub const SYSTEM_ID: u16 = 2;
/// System-exclusive sub-command requesting the server configuration.
pub const SYSEX_GET_CONFIG: u8 = 1;
/// A stream buffer holding more than this without a complete message is
/// considered garbage and discarded.
pub const MAX_PENDING_BYTES: usize = 100_000;

/// Decoded command of one OPC message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcCommand<'a> {
    /// Raw RGB bytes for the whole frame
    SetPixels(&'a [u8]),
    /// Request for the server configuration as JSON
    GetConfig,
    /// System-exclusive message for another system id
    UnsupportedSystem(u16),
    /// System-exclusive message for this server with an unknown sub-command
    UnsupportedSysex(u8),
    /// System-exclusive message too short to carry a system id and sub-command
    MalformedSysex,
    /// Any other command byte
    Unsupported(u8),
}

/// One complete OPC message borrowed from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcMessage<'a> {
    pub channel: u8,
    pub command: OpcCommand<'a>,
}

/// Decode the first message in `buf`.
///
/// Returns the message and the number of bytes it occupied, or `None`
/// when `buf` does not yet hold a complete message.
pub fn parse(buf: &[u8]) -> Option<(OpcMessage<'_>, usize)> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let channel = buf[0];
    let command = buf[1];
    let len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
    let total = HEADER_LEN + len;
    let payload = buf.get(HEADER_LEN..total)?;

    let command = match command {
        CMD_SET_PIXELS => OpcCommand::SetPixels(payload),
        CMD_SYSTEM_EXCLUSIVE => parse_sysex(payload),
        other => OpcCommand::Unsupported(other),
    };
    Some((OpcMessage { channel, command }, total))
}

fn parse_sysex(payload: &[u8]) -> OpcCommand<'_> {
    let &[hi, lo, sub, ..] = payload else {
        return OpcCommand::MalformedSysex;
    };
    let system_id = u16::from_be_bytes([hi, lo]);
    if system_id != SYSTEM_ID {
        return OpcCommand::UnsupportedSystem(system_id);
    }
    match sub {
        SYSEX_GET_CONFIG => OpcCommand::GetConfig,
        other => OpcCommand::UnsupportedSysex(other),
    }
}

/// Build an OPC message. Payloads longer than 65535 bytes are truncated.
pub fn encode(channel: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len().min(usize::from(u16::MAX));
    let mut msg = Vec::with_capacity(HEADER_LEN + len);
    msg.push(channel);
    msg.push(command);
    msg.extend_from_slice(&(len as u16).to_be_bytes());
    msg.extend_from_slice(&payload[..len]);
    msg
}

/// Build a "get config" system-exclusive request.
pub fn encode_get_config() -> Vec<u8> {
    let id = SYSTEM_ID.to_be_bytes();
    encode(0, CMD_SYSTEM_EXCLUSIVE, &[id[0], id[1], SYSEX_GET_CONFIG])
}

/// Reassembles OPC messages from a byte stream.
#[derive(Debug, Default)]
pub struct OpcStream {
    buf: Vec<u8>,
}

impl OpcStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes waiting for the rest of their message.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Hand every complete message to `handle`, in arrival order, and drop
    /// the consumed bytes. Returns the number of messages handled.
    ///
    /// If more than [`MAX_PENDING_BYTES`] remain afterwards the buffer is
    /// cleared.
    pub fn drain<F>(&mut self, mut handle: F) -> usize
    where
        F: FnMut(OpcMessage<'_>),
    {
        let mut offset = 0;
        let mut count = 0;
        while let Some((msg, used)) = parse(&self.buf[offset..]) {
            handle(msg);
            offset += used;
            count += 1;
        }
        self.buf.drain(..offset);

        if self.buf.len() > MAX_PENDING_BYTES {
            log::warn!(
                "[opc] Discarding {} buffered bytes without a complete message",
                self.buf.len()
            );
            self.buf.clear();
        }
        count
    }
}
