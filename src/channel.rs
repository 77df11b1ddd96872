// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Buffered bidirectional transport bound to one engine socket.
// Author: Lukas Bower

//! Buffered transport for one engine connection.
//!
//! The channel owns the UNIX stream socket of the current head engine, a
//! fixed receive ring, a fixed transmit ring, and a growable scratch buffer
//! that assembles the rare frame larger than the ring (big `WRIT`
//! payloads). Ancillary `SCM_RIGHTS` descriptors — the forked child's
//! socket travelling with `CHLD` — land in a single-slot holder.
//!
//! End-of-stream (engine death) is reported as `Ok(None)`; `ECONNRESET`
//! counts as end-of-stream. Frame-level garbage and a second descriptor
//! arriving before the first was consumed are protocol errors and fail the
//! whole driver.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use texwind_wire::{
    decode_request, encode_control, encode_reply, Control, Reply, Request, HANDSHAKE_CLIENT,
    HANDSHAKE_SERVER,
};

/// Size of the fixed receive and transmit rings.
pub const BUF_SIZE: usize = 4096;

/// Buffered engine transport. One per driver; rebound to each new head
/// process socket.
pub struct Channel {
    stream: Option<UnixStream>,
    rx: Box<[u8; BUF_SIZE]>,
    rx_pos: usize,
    rx_len: usize,
    tx: Box<[u8; BUF_SIZE]>,
    tx_len: usize,
    scratch: Vec<u8>,
    passed_fd: Option<OwnedFd>,
}

impl Channel {
    /// Create a channel with no socket bound yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stream: None,
            rx: Box::new([0; BUF_SIZE]),
            rx_pos: 0,
            rx_len: 0,
            tx: Box::new([0; BUF_SIZE]),
            tx_len: 0,
            scratch: Vec::new(),
            passed_fd: None,
        }
    }

    /// Bind the channel to a new engine socket, dropping buffered data.
    pub fn set_stream(&mut self, stream: UnixStream) {
        self.stream = Some(stream);
        self.reset();
    }

    /// Drop the bound socket, if any.
    pub fn clear_stream(&mut self) {
        self.stream = None;
        self.reset();
    }

    /// Discard buffered input and output. Used when switching to a forked
    /// child: bytes in flight belong to the parent's conversation.
    pub fn reset(&mut self) {
        self.rx_pos = 0;
        self.rx_len = 0;
        self.tx_len = 0;
        self.scratch.clear();
    }

    /// Take the descriptor that arrived with the last `CHLD`, if any.
    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        self.passed_fd.take()
    }

    /// Run the protocol handshake on the bound socket. Returns false when
    /// the peer answered with the wrong literal or hung up.
    pub fn handshake(&mut self) -> Result<bool> {
        self.write_all(&HANDSHAKE_SERVER[..])?;
        self.flush()?;
        let mut answer = [0u8; HANDSHAKE_CLIENT.len()];
        let mut got = 0;
        while got < answer.len() {
            let n = self.recv(&mut answer[got..])?;
            if n == 0 {
                return Ok(false);
            }
            got += n;
        }
        self.reset();
        Ok(&answer == HANDSHAKE_CLIENT)
    }

    /// True when a request is buffered or the socket becomes readable
    /// within `timeout_ms`.
    pub fn has_pending(&mut self, timeout_ms: i32) -> Result<bool> {
        if self.rx_pos != self.rx_len {
            return Ok(true);
        }
        let fd = self.stream()?.as_raw_fd();
        loop {
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let n = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if n >= 0 {
                return Ok(n > 0);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err).context("poll on engine socket");
            }
        }
    }

    /// Peek the tag of the next request without consuming it. `None` on
    /// end-of-stream.
    pub fn peek_tag(&mut self) -> Result<Option<u32>> {
        while self.rx_len - self.rx_pos < 4 {
            if !self.fill_ring()? {
                return Ok(None);
            }
        }
        let b = &self.rx[self.rx_pos..self.rx_pos + 4];
        Ok(Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]])))
    }

    /// Read one request, blocking until a whole frame is available.
    /// `None` means the engine closed the connection.
    pub fn read_request(&mut self) -> Result<Option<Request>> {
        loop {
            let window = &self.rx[self.rx_pos..self.rx_len];
            match decode_request(window)? {
                Some((request, used)) => {
                    self.rx_pos += used;
                    return Ok(Some(request));
                }
                None => {
                    if self.rx_len - self.rx_pos == BUF_SIZE {
                        // Frame outgrew the ring; assemble it in the scratch.
                        return self.read_oversized();
                    }
                    if !self.fill_ring()? {
                        if self.rx_len != self.rx_pos {
                            bail!("engine hung up mid-frame");
                        }
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn read_oversized(&mut self) -> Result<Option<Request>> {
        debug!("assembling oversized frame in scratch buffer");
        let mut spill = mem::take(&mut self.scratch);
        spill.clear();
        spill.extend_from_slice(&self.rx[self.rx_pos..self.rx_len]);
        self.rx_pos = 0;
        self.rx_len = 0;
        let outcome = loop {
            match decode_request(&spill)? {
                Some((request, used)) => {
                    // Pipelined bytes past the frame go back to the ring;
                    // chunked reads keep them smaller than the ring.
                    let leftover = spill.len() - used;
                    self.rx[..leftover].copy_from_slice(&spill[used..]);
                    self.rx_len = leftover;
                    break Some(request);
                }
                None => {
                    let mut chunk = [0u8; BUF_SIZE];
                    let n = self.recv(&mut chunk)?;
                    if n == 0 {
                        bail!("engine hung up mid-frame");
                    }
                    spill.extend_from_slice(&chunk[..n]);
                }
            }
        };
        self.scratch = spill;
        Ok(outcome)
    }

    /// Queue a reply for the engine.
    pub fn write_reply(&mut self, reply: &Reply) -> Result<()> {
        debug!("-> {}", reply.mnemonic());
        let frame = encode_reply(reply);
        self.write_all(&frame)
    }

    /// Queue an unsolicited control message.
    pub fn write_control(&mut self, control: &Control) -> Result<()> {
        let frame = encode_control(control);
        self.write_all(&frame)
    }

    /// Flush buffered output to the socket.
    pub fn flush(&mut self) -> Result<()> {
        if self.tx_len == 0 {
            return Ok(());
        }
        let fd = self.stream()?.as_raw_fd();
        let len = self.tx_len;
        self.tx_len = 0;
        send_all(fd, &self.tx[..len])
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        if self.tx_len + bytes.len() <= BUF_SIZE {
            self.tx[self.tx_len..self.tx_len + bytes.len()].copy_from_slice(bytes);
            self.tx_len += bytes.len();
            return Ok(());
        }
        self.flush()?;
        if bytes.len() > BUF_SIZE {
            let fd = self.stream()?.as_raw_fd();
            return send_all(fd, bytes);
        }
        self.tx[..bytes.len()].copy_from_slice(bytes);
        self.tx_len = bytes.len();
        Ok(())
    }

    fn fill_ring(&mut self) -> Result<bool> {
        if self.rx_pos > 0 {
            self.rx.copy_within(self.rx_pos..self.rx_len, 0);
            self.rx_len -= self.rx_pos;
            self.rx_pos = 0;
        }
        let free_at = self.rx_len;
        let mut chunk = [0u8; BUF_SIZE];
        let room = BUF_SIZE - free_at;
        let n = self.recv(&mut chunk[..room])?;
        if n == 0 {
            return Ok(false);
        }
        self.rx[free_at..free_at + n].copy_from_slice(&chunk[..n]);
        self.rx_len += n;
        Ok(true)
    }

    /// `recvmsg` with room for one ancillary descriptor. Returns the byte
    /// count; 0 means end-of-stream (including `ECONNRESET`).
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let fd = self.stream()?.as_raw_fd();
        // Room for one cmsg header plus a single descriptor, aligned for
        // the cmsghdr walk.
        let mut cmsg_space = [0u64; 8];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_space.as_mut_ptr().cast();
        msg.msg_controllen = mem::size_of_val(&cmsg_space);

        let received = loop {
            let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ECONNRESET) => {
                    warn!("engine socket reset during read");
                    return Ok(0);
                }
                _ => return Err(err).context("recvmsg on engine socket"),
            }
        };

        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        if !cmsg.is_null() {
            let header = unsafe { &*cmsg };
            if header.cmsg_level != libc::SOL_SOCKET || header.cmsg_type != libc::SCM_RIGHTS {
                bail!("unexpected ancillary message on engine socket");
            }
            let payload = header.cmsg_len as usize - unsafe { libc::CMSG_LEN(0) } as usize;
            if payload != mem::size_of::<i32>() {
                bail!("expected exactly one descriptor, got {} bytes", payload);
            }
            if self.passed_fd.is_some() {
                bail!("descriptor received while one is already pending");
            }
            let raw = unsafe { *(libc::CMSG_DATA(cmsg) as *const i32) };
            self.passed_fd = Some(unsafe { OwnedFd::from_raw_fd(raw) });
        }

        Ok(received)
    }

    fn stream(&self) -> Result<&UnixStream> {
        self.stream
            .as_ref()
            .context("channel has no engine socket bound")
    }
}

fn send_all(fd: i32, mut bytes: &[u8]) -> Result<()> {
    while !bytes.is_empty() {
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                // Write-side reset means the engine died; the read side
                // will report end-of-stream.
                Some(libc::ECONNRESET) | Some(libc::EPIPE) => {
                    warn!("engine socket reset during write");
                    return Ok(());
                }
                _ => return Err(err).context("write to engine socket"),
            }
        }
        bytes = &bytes[n as usize..];
    }
    Ok(())
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}
