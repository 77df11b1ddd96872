// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Encode and decode texwind engine-driver wire messages without std dependencies.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![no_std]

//! Wire codec for the texwind engine driver protocol.
//!
//! The sandboxed TeX engine talks to the driver over a UNIX stream socket.
//! Every message starts with a four-byte tag (the packed ASCII of a
//! four-letter mnemonic); requests carry an engine-relative millisecond
//! timestamp next, then the body. All integers are little-endian, strings
//! are zero-terminated, and byte blocks are length-prefixed.
//!
//! This crate is pure: it never touches a socket. Decoding is incremental —
//! a frame cut short decodes to "need more bytes" instead of an error, so a
//! buffering transport can simply refill and retry.

extern crate alloc;

mod codec;
mod types;

pub use codec::{
    decode_control, decode_reply, decode_request, encode_control, encode_reply, encode_request,
};
pub use types::{
    Control, FileId, PicCache, Reply, Request, RequestBody, WireError, HANDSHAKE_CLIENT,
    HANDSHAKE_SERVER, STDOUT_FID,
};
