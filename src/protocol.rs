//! Framed binary wire protocol for document synchronization.
//!
//! Every frame starts with a variable-length unsigned integer discriminant:
//!
//! ```text
//! ┌────────────┬───────────────────────────────────────────┐
//! │ frame type │ payload                                   │
//! │ varuint    │                                           │
//! ├────────────┼───────────────────────────────────────────┤
//! │ 0 (sync)   │ varuint sub-type + length-prefixed bytes  │
//! │ 1 (presence)│ length-prefixed presence update          │
//! │ other      │ ignored by receivers                      │
//! └────────────┴───────────────────────────────────────────┘
//! ```
//!
//! Sync sub-types follow the classic three-step CRDT handshake:
//! `0` carries a state vector (step 1), `1` carries a state diff (step 2),
//! `2` carries an incremental update. A receiver answers step 1 with step 2
//! and applies step 2 and updates alike.
//!
//! Varuints use the little-endian 7-bit group encoding with a continuation
//! bit, the same shape the CRDT update blobs themselves use.

/// Frame discriminant: CRDT sync protocol.
pub const FRAME_SYNC: u64 = 0;
/// Frame discriminant: presence (cursor/selection awareness).
pub const FRAME_PRESENCE: u64 = 1;

/// Sync sub-type: state vector announcement (step 1).
pub const SYNC_STEP1: u64 = 0;
/// Sync sub-type: state diff response (step 2).
pub const SYNC_STEP2: u64 = 1;
/// Sync sub-type: incremental update.
pub const SYNC_UPDATE: u64 = 2;

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Input ended in the middle of a varuint or byte array.
    UnexpectedEof,
    /// Varuint wider than 64 bits.
    VarIntOverflow,
    /// Declared payload length exceeds the remaining input.
    LengthOutOfBounds(u64),
    /// Sync frame with an unknown sub-type.
    UnknownSyncType(u64),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of frame"),
            Self::VarIntOverflow => write!(f, "varuint exceeds 64 bits"),
            Self::LengthOutOfBounds(n) => write!(f, "declared length {n} exceeds frame"),
            Self::UnknownSyncType(t) => write!(f, "unknown sync sub-type {t}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Append-only frame encoder.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(64) }
    }

    /// Write a varuint: 7 bits per byte, LSB group first, high bit = more.
    pub fn write_var_u64(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    /// Write a length-prefixed byte array.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_var_u64(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor-based frame decoder.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn read_var_u64(&mut self) -> Result<u64, ProtocolError> {
        let mut value: u64 = 0;
        let mut shift: u32 = 0;
        loop {
            let byte = *self.buf.get(self.pos).ok_or(ProtocolError::UnexpectedEof)?;
            self.pos += 1;
            if shift == 63 && byte > 1 {
                return Err(ProtocolError::VarIntOverflow);
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(ProtocolError::VarIntOverflow);
            }
        }
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_var_u64()?;
        let end = self
            .pos
            .checked_add(len as usize)
            .filter(|end| *end <= self.buf.len())
            .ok_or(ProtocolError::LengthOutOfBounds(len))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Sync(SyncMessage),
    Presence(Vec<u8>),
    /// Reserved discriminant; receivers ignore it.
    Unknown(u64),
}

/// A decoded sync-frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// State vector of the sender (step 1).
    Step1(Vec<u8>),
    /// State diff covering what the receiver was missing (step 2).
    Step2(Vec<u8>),
    /// Incremental update blob.
    Update(Vec<u8>),
}

impl Frame {
    /// Decode one frame from raw socket bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut dec = Decoder::new(bytes);
        match dec.read_var_u64()? {
            FRAME_SYNC => {
                let sub = dec.read_var_u64()?;
                let payload = dec.read_bytes()?.to_vec();
                let msg = match sub {
                    SYNC_STEP1 => SyncMessage::Step1(payload),
                    SYNC_STEP2 => SyncMessage::Step2(payload),
                    SYNC_UPDATE => SyncMessage::Update(payload),
                    other => return Err(ProtocolError::UnknownSyncType(other)),
                };
                Ok(Frame::Sync(msg))
            }
            FRAME_PRESENCE => Ok(Frame::Presence(dec.read_bytes()?.to_vec())),
            other => Ok(Frame::Unknown(other)),
        }
    }
}

/// Encode a sync-step-1 frame carrying a state vector.
pub fn sync_step1(state_vector: &[u8]) -> Vec<u8> {
    sync_frame(SYNC_STEP1, state_vector)
}

/// Encode a sync-step-2 frame carrying a state diff.
pub fn sync_step2(diff: &[u8]) -> Vec<u8> {
    sync_frame(SYNC_STEP2, diff)
}

/// Encode a sync-update frame carrying an incremental update blob.
pub fn sync_update(update: &[u8]) -> Vec<u8> {
    sync_frame(SYNC_UPDATE, update)
}

fn sync_frame(sub: u64, payload: &[u8]) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.write_var_u64(FRAME_SYNC);
    enc.write_var_u64(sub);
    enc.write_bytes(payload);
    enc.into_vec()
}

/// Encode a presence frame carrying an opaque presence update.
pub fn presence_frame(update: &[u8]) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.write_var_u64(FRAME_PRESENCE);
    enc.write_bytes(update);
    enc.into_vec()
}
