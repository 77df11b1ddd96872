// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Define the texwind engine protocol message types and constants.
// Author: Lukas Bower

//! Engine protocol data model shared by the driver and its tests.

use alloc::string::String;
use alloc::vec::Vec;

/// Literal the driver writes on accept.
pub const HANDSHAKE_SERVER: &[u8; 12] = b"TEXPRESSOS01";
/// Literal the engine must answer with.
pub const HANDSHAKE_CLIENT: &[u8; 12] = b"TEXPRESSOC01";

/// File identifier chosen by the engine. Small non-negative integers index
/// the driver's cell table; [`STDOUT_FID`] addresses the stdout stream.
pub type FileId = i32;

/// Pseudo file id used by `WRIT` to append to the engine's stdout stream.
pub const STDOUT_FID: FileId = -1;

/// Packed ASCII tag of a four-letter mnemonic, as it appears on the wire.
pub(crate) const fn pack(mnemonic: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*mnemonic)
}

/// Wire tags, grouped by direction.
pub(crate) mod tag {
    use super::pack;

    pub const Q_OPEN: u32 = pack(b"OPEN");
    pub const Q_READ: u32 = pack(b"READ");
    pub const Q_WRIT: u32 = pack(b"WRIT");
    pub const Q_CLOS: u32 = pack(b"CLOS");
    pub const Q_SIZE: u32 = pack(b"SIZE");
    pub const Q_SEEN: u32 = pack(b"SEEN");
    pub const Q_GPIC: u32 = pack(b"GPIC");
    pub const Q_SPIC: u32 = pack(b"SPIC");
    pub const Q_CHLD: u32 = pack(b"CHLD");

    pub const A_DONE: u32 = pack(b"DONE");
    pub const A_PASS: u32 = pack(b"PASS");
    pub const A_SIZE: u32 = pack(b"SIZE");
    pub const A_READ: u32 = pack(b"READ");
    pub const A_FORK: u32 = pack(b"FORK");
    pub const A_OPEN: u32 = pack(b"OPEN");
    pub const A_GPIC: u32 = pack(b"GPIC");

    pub const C_FLSH: u32 = pack(b"FLSH");
}

/// Errors produced while encoding or decoding protocol messages.
///
/// Truncation is not an error: incremental decoders report it as `Ok(None)`
/// so the transport can refill its buffer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    /// Encountered a tag that names no known message.
    #[error("unknown message tag 0x{0:08x}")]
    UnknownTag(u32),
    /// A path or mode string was not valid UTF-8.
    #[error("invalid utf8 in string field")]
    InvalidUtf8,
    /// A length field exceeded the protocol maximum.
    #[error("declared payload of {0} bytes exceeds the frame limit")]
    Oversized(u32),
}

/// Hard ceiling on a single length-prefixed payload. The engine never ships
/// more than one write buffer at a time; anything past this is a corrupt
/// frame, not a large document.
pub(crate) const MAX_PAYLOAD: u32 = 1 << 30;

/// Bounding-box cache for an included picture, as exchanged by `SPIC`/`GPIC`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PicCache {
    /// Picture type discriminator chosen by the engine.
    pub kind: i32,
    /// Page of the picture the bounds refer to.
    pub page: i32,
    /// Bounding box, in the engine's units.
    pub bounds: [f32; 4],
}

/// Request envelope: engine-relative timestamp plus the concrete message.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Milliseconds since the engine started, sampled by the engine.
    pub time_ms: u32,
    /// The concrete request payload.
    pub body: RequestBody,
}

/// Requests the engine sends to the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// `OPEN` associates a file id with a path for subsequent I/O.
    Open {
        /// File id chosen by the engine.
        fid: FileId,
        /// Logical path of the file.
        path: String,
        /// fopen-style mode string; only the first letter matters.
        mode: String,
    },
    /// `READ` asks for a byte range of an open file.
    Read {
        /// Open file id.
        fid: FileId,
        /// Byte offset of the read.
        pos: u32,
        /// Maximum number of bytes wanted.
        size: u32,
    },
    /// `WRIT` stores bytes into an output file (or stdout for fid −1).
    Write {
        /// Open file id, or [`STDOUT_FID`].
        fid: FileId,
        /// Byte offset of the write.
        pos: u32,
        /// Payload bytes.
        data: Vec<u8>,
    },
    /// `CLOS` releases a file id.
    Close {
        /// File id to release.
        fid: FileId,
    },
    /// `SIZE` asks for the effective length of an open file.
    Size {
        /// Open file id.
        fid: FileId,
    },
    /// `SEEN` reports the engine's read progress in an open file.
    Seen {
        /// Open file id.
        fid: FileId,
        /// Largest byte offset the engine has consumed.
        pos: u32,
    },
    /// `GPIC` queries the cached bounding box of a picture.
    Gpic {
        /// Logical path of the picture.
        path: String,
        /// Picture type discriminator.
        kind: i32,
        /// Page number.
        page: i32,
    },
    /// `SPIC` stores the bounding box of a picture.
    Spic {
        /// Logical path of the picture.
        path: String,
        /// Cached type, page and bounds.
        cache: PicCache,
    },
    /// `CHLD` announces a forked child; its socket travels as an ancillary
    /// file descriptor alongside this message, not in the byte stream.
    Child {
        /// Process id of the forked child.
        pid: u32,
    },
}

impl RequestBody {
    /// Wire mnemonic of this request, for diagnostics.
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        match self {
            RequestBody::Open { .. } => "OPEN",
            RequestBody::Read { .. } => "READ",
            RequestBody::Write { .. } => "WRIT",
            RequestBody::Close { .. } => "CLOS",
            RequestBody::Size { .. } => "SIZE",
            RequestBody::Seen { .. } => "SEEN",
            RequestBody::Gpic { .. } => "GPIC",
            RequestBody::Spic { .. } => "SPIC",
            RequestBody::Child { .. } => "CHLD",
        }
    }
}

/// Replies the driver sends back to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Acknowledge a request that returns nothing.
    Done,
    /// Decline: the engine should fall back to its own logic.
    Pass,
    /// Order the engine to fork a snapshot and re-issue the read.
    Fork,
    /// Effective length of the file.
    Size(u32),
    /// Bytes read from the file.
    Read(Vec<u8>),
    /// Canonical path of the opened file.
    Open(Vec<u8>),
    /// Cached picture bounds.
    Gpic([f32; 4]),
}

impl Reply {
    /// Wire mnemonic of this reply, for diagnostics.
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Reply::Done => "DONE",
            Reply::Pass => "PASS",
            Reply::Fork => "FORK",
            Reply::Size(_) => "SIZE",
            Reply::Read(_) => "READ",
            Reply::Open(_) => "OPEN",
            Reply::Gpic(_) => "GPIC",
        }
    }
}

/// Unsolicited control messages the driver may push to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Ask the engine to flush its buffered output and report progress.
    Flush,
}
