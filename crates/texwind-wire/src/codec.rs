// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Incremental encode/decode of texwind protocol frames.
// Author: Lukas Bower

//! Encode/decode helpers for engine protocol frames.
//!
//! Decoders work on a byte slice that may hold an incomplete frame: they
//! return `Ok(None)` when more input is needed and `Ok(Some((message,
//! consumed)))` once a whole frame is available. Nothing is consumed until a
//! frame decodes completely, so callers can retry with a longer slice.

use alloc::string::String;
use alloc::vec::Vec;
use core::str;

use crate::types::{tag, Control, PicCache, Reply, Request, RequestBody, WireError, MAX_PAYLOAD};

/// Decode one request frame from the front of `input`.
pub fn decode_request(input: &[u8]) -> Result<Option<(Request, usize)>, WireError> {
    let mut cur = Cursor::new(input);
    let Some(tag) = cur.u32() else {
        return Ok(None);
    };
    let Some(time_ms) = cur.u32() else {
        return Ok(None);
    };
    let body = match tag {
        tag::Q_OPEN => {
            let Some(fid) = cur.i32() else { return Ok(None) };
            let Some(path) = cur.zstr()? else {
                return Ok(None);
            };
            let Some(mode) = cur.zstr()? else {
                return Ok(None);
            };
            RequestBody::Open { fid, path, mode }
        }
        tag::Q_READ => {
            let (Some(fid), Some(pos), Some(size)) = (cur.i32(), cur.u32(), cur.u32()) else {
                return Ok(None);
            };
            RequestBody::Read { fid, pos, size }
        }
        tag::Q_WRIT => {
            let (Some(fid), Some(pos), Some(size)) = (cur.i32(), cur.u32(), cur.u32()) else {
                return Ok(None);
            };
            if size > MAX_PAYLOAD {
                return Err(WireError::Oversized(size));
            }
            let Some(data) = cur.bytes(size as usize) else {
                return Ok(None);
            };
            RequestBody::Write {
                fid,
                pos,
                data: data.to_vec(),
            }
        }
        tag::Q_CLOS => {
            let Some(fid) = cur.i32() else { return Ok(None) };
            RequestBody::Close { fid }
        }
        tag::Q_SIZE => {
            let Some(fid) = cur.i32() else { return Ok(None) };
            RequestBody::Size { fid }
        }
        tag::Q_SEEN => {
            let (Some(fid), Some(pos)) = (cur.i32(), cur.u32()) else {
                return Ok(None);
            };
            RequestBody::Seen { fid, pos }
        }
        tag::Q_GPIC => {
            let Some(path) = cur.zstr()? else {
                return Ok(None);
            };
            let (Some(kind), Some(page)) = (cur.i32(), cur.i32()) else {
                return Ok(None);
            };
            RequestBody::Gpic { path, kind, page }
        }
        tag::Q_SPIC => {
            let Some(path) = cur.zstr()? else {
                return Ok(None);
            };
            let (Some(kind), Some(page)) = (cur.i32(), cur.i32()) else {
                return Ok(None);
            };
            let Some(bounds) = cur.bounds() else {
                return Ok(None);
            };
            RequestBody::Spic {
                path,
                cache: PicCache { kind, page, bounds },
            }
        }
        tag::Q_CHLD => {
            let Some(pid) = cur.u32() else { return Ok(None) };
            RequestBody::Child { pid }
        }
        other => return Err(WireError::UnknownTag(other)),
    };
    Ok(Some((Request { time_ms, body }, cur.pos)))
}

/// Decode one reply frame from the front of `input`.
pub fn decode_reply(input: &[u8]) -> Result<Option<(Reply, usize)>, WireError> {
    let mut cur = Cursor::new(input);
    let Some(tag) = cur.u32() else {
        return Ok(None);
    };
    let reply = match tag {
        tag::A_DONE => Reply::Done,
        tag::A_PASS => Reply::Pass,
        tag::A_FORK => Reply::Fork,
        tag::A_SIZE => {
            let Some(size) = cur.u32() else { return Ok(None) };
            Reply::Size(size)
        }
        tag::A_READ | tag::A_OPEN => {
            let Some(size) = cur.u32() else { return Ok(None) };
            if size > MAX_PAYLOAD {
                return Err(WireError::Oversized(size));
            }
            let Some(data) = cur.bytes(size as usize) else {
                return Ok(None);
            };
            if tag == tag::A_READ {
                Reply::Read(data.to_vec())
            } else {
                Reply::Open(data.to_vec())
            }
        }
        tag::A_GPIC => {
            let Some(bounds) = cur.bounds() else {
                return Ok(None);
            };
            Reply::Gpic(bounds)
        }
        other => return Err(WireError::UnknownTag(other)),
    };
    Ok(Some((reply, cur.pos)))
}

/// Decode one control frame from the front of `input`.
pub fn decode_control(input: &[u8]) -> Result<Option<(Control, usize)>, WireError> {
    let mut cur = Cursor::new(input);
    let Some(tag) = cur.u32() else {
        return Ok(None);
    };
    match tag {
        tag::C_FLSH => Ok(Some((Control::Flush, cur.pos))),
        other => Err(WireError::UnknownTag(other)),
    }
}

/// Encode a request the way the engine would send it.
#[must_use]
pub fn encode_request(request: &Request) -> Vec<u8> {
    let mut out = Vec::new();
    match &request.body {
        RequestBody::Open { fid, path, mode } => {
            put_u32(&mut out, tag::Q_OPEN);
            put_u32(&mut out, request.time_ms);
            put_i32(&mut out, *fid);
            put_zstr(&mut out, path);
            put_zstr(&mut out, mode);
        }
        RequestBody::Read { fid, pos, size } => {
            put_u32(&mut out, tag::Q_READ);
            put_u32(&mut out, request.time_ms);
            put_i32(&mut out, *fid);
            put_u32(&mut out, *pos);
            put_u32(&mut out, *size);
        }
        RequestBody::Write { fid, pos, data } => {
            put_u32(&mut out, tag::Q_WRIT);
            put_u32(&mut out, request.time_ms);
            put_i32(&mut out, *fid);
            put_u32(&mut out, *pos);
            put_u32(&mut out, data.len() as u32);
            out.extend_from_slice(data);
        }
        RequestBody::Close { fid } => {
            put_u32(&mut out, tag::Q_CLOS);
            put_u32(&mut out, request.time_ms);
            put_i32(&mut out, *fid);
        }
        RequestBody::Size { fid } => {
            put_u32(&mut out, tag::Q_SIZE);
            put_u32(&mut out, request.time_ms);
            put_i32(&mut out, *fid);
        }
        RequestBody::Seen { fid, pos } => {
            put_u32(&mut out, tag::Q_SEEN);
            put_u32(&mut out, request.time_ms);
            put_i32(&mut out, *fid);
            put_u32(&mut out, *pos);
        }
        RequestBody::Gpic { path, kind, page } => {
            put_u32(&mut out, tag::Q_GPIC);
            put_u32(&mut out, request.time_ms);
            put_zstr(&mut out, path);
            put_i32(&mut out, *kind);
            put_i32(&mut out, *page);
        }
        RequestBody::Spic { path, cache } => {
            put_u32(&mut out, tag::Q_SPIC);
            put_u32(&mut out, request.time_ms);
            put_zstr(&mut out, path);
            put_i32(&mut out, cache.kind);
            put_i32(&mut out, cache.page);
            for b in cache.bounds {
                put_f32(&mut out, b);
            }
        }
        RequestBody::Child { pid } => {
            put_u32(&mut out, tag::Q_CHLD);
            put_u32(&mut out, request.time_ms);
            put_u32(&mut out, *pid);
        }
    }
    out
}

/// Encode a reply the way the driver sends it.
#[must_use]
pub fn encode_reply(reply: &Reply) -> Vec<u8> {
    let mut out = Vec::new();
    match reply {
        Reply::Done => put_u32(&mut out, tag::A_DONE),
        Reply::Pass => put_u32(&mut out, tag::A_PASS),
        Reply::Fork => put_u32(&mut out, tag::A_FORK),
        Reply::Size(size) => {
            put_u32(&mut out, tag::A_SIZE);
            put_u32(&mut out, *size);
        }
        Reply::Read(data) => {
            put_u32(&mut out, tag::A_READ);
            put_u32(&mut out, data.len() as u32);
            out.extend_from_slice(data);
        }
        Reply::Open(data) => {
            put_u32(&mut out, tag::A_OPEN);
            put_u32(&mut out, data.len() as u32);
            out.extend_from_slice(data);
        }
        Reply::Gpic(bounds) => {
            put_u32(&mut out, tag::A_GPIC);
            for b in *bounds {
                put_f32(&mut out, b);
            }
        }
    }
    out
}

/// Encode a control message.
#[must_use]
pub fn encode_control(control: &Control) -> Vec<u8> {
    let mut out = Vec::new();
    match control {
        Control::Flush => put_u32(&mut out, tag::C_FLSH),
    }
    out
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_f32(out: &mut Vec<u8>, value: f32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_zstr(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(value.as_bytes());
    out.push(0);
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u32(&mut self) -> Option<u32> {
        let bytes = self.bytes(4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self) -> Option<i32> {
        self.u32().map(|v| v as i32)
    }

    fn f32(&mut self) -> Option<f32> {
        self.u32().map(f32::from_bits)
    }

    fn bounds(&mut self) -> Option<[f32; 4]> {
        Some([self.f32()?, self.f32()?, self.f32()?, self.f32()?])
    }

    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.buf.len() {
            return None;
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    /// Zero-terminated string. `Ok(None)` while the terminator is missing.
    fn zstr(&mut self) -> Result<Option<String>, WireError> {
        let rest = &self.buf[self.pos..];
        let Some(nul) = rest.iter().position(|&b| b == 0) else {
            return Ok(None);
        };
        let text = str::from_utf8(&rest[..nul]).map_err(|_| WireError::InvalidUtf8)?;
        self.pos += nul + 1;
        Ok(Some(String::from(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn open_request_round_trips() {
        let req = Request {
            time_ms: 125,
            body: RequestBody::Open {
                fid: 3,
                path: String::from("main.tex"),
                mode: String::from("rb"),
            },
        };
        let frame = encode_request(&req);
        let (decoded, used) = decode_request(&frame).unwrap().unwrap();
        assert_eq!(decoded, req);
        assert_eq!(used, frame.len());
    }

    #[test]
    fn truncated_write_needs_more() {
        let req = Request {
            time_ms: 0,
            body: RequestBody::Write {
                fid: 5,
                pos: 16,
                data: vec![1, 2, 3, 4, 5, 6, 7, 8],
            },
        };
        let frame = encode_request(&req);
        for cut in 0..frame.len() {
            assert_eq!(decode_request(&frame[..cut]).unwrap(), None, "cut {cut}");
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut frame = Vec::new();
        put_u32(&mut frame, u32::from_le_bytes(*b"NOPE"));
        put_u32(&mut frame, 0);
        assert_eq!(
            decode_request(&frame),
            Err(WireError::UnknownTag(u32::from_le_bytes(*b"NOPE")))
        );
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut frame = Vec::new();
        put_u32(&mut frame, tag::Q_WRIT);
        put_u32(&mut frame, 0);
        put_i32(&mut frame, 1);
        put_u32(&mut frame, 0);
        put_u32(&mut frame, u32::MAX);
        assert!(matches!(
            decode_request(&frame),
            Err(WireError::Oversized(_))
        ));
    }

    #[test]
    fn non_utf8_path_is_rejected() {
        let mut frame = Vec::new();
        put_u32(&mut frame, tag::Q_GPIC);
        put_u32(&mut frame, 0);
        frame.extend_from_slice(&[0xff, 0xfe, 0x00]);
        put_i32(&mut frame, 0);
        put_i32(&mut frame, 0);
        assert_eq!(decode_request(&frame), Err(WireError::InvalidUtf8));
    }

    #[test]
    fn flush_control_round_trips() {
        let frame = encode_control(&Control::Flush);
        let (decoded, used) = decode_control(&frame).unwrap().unwrap();
        assert_eq!(decoded, Control::Flush);
        assert_eq!(used, frame.len());
    }
}
