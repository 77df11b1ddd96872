// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Interfaces to the preview collaborators fed by engine output.
// Author: Lukas Bower

//! Seams to the preview pipeline.
//!
//! Decoding DVI/XDV and SynCTeX data is not this crate's business; the
//! driver only pushes output buffers across these traits and replays them
//! after a rollback. The binary wires in logging placeholders, the GUI
//! links real decoders, and tests substitute recording doubles.

use log::info;

/// Consumer of the typeset document output (xdv/dvi/pdf bytes).
pub trait DocumentDecoder {
    /// Forget everything; a fresh document output was opened.
    fn reset(&mut self);
    /// The document buffer changed (grew, or was truncated by a rollback).
    fn update(&mut self, data: &[u8]);
    /// Number of complete pages decoded so far.
    fn page_count(&self) -> usize;
    /// True once the engine has produced any document bytes.
    fn output_started(&self) -> bool;
}

/// Position in the rendered document resolved by a forward-sync query.
/// The coordinates are whatever units the decoder indexes; the driver
/// passes them through untouched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncPosition {
    /// Page containing the source location.
    pub page: usize,
    /// Horizontal position on the page.
    pub x: f32,
    /// Vertical position on the page.
    pub y: f32,
}

/// Consumer of the SynCTeX index output.
pub trait SynctexDecoder {
    /// The synctex buffer changed (grew, or was truncated by a rollback).
    fn update(&mut self, data: &[u8]);
    /// Drop decoded state past `len` bytes of input.
    fn rollback(&mut self, len: usize);
    /// Number of pages indexed so far.
    fn page_count(&self) -> usize;
    /// Resolve a source location to a document position, once the index
    /// covers it.
    fn forward(&mut self, _path: &str, _line: usize) -> Option<SyncPosition> {
        None
    }
}

/// Engine console streams mirrored to the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// The engine's stdout.
    Out,
    /// The TeX log file.
    Log,
}

impl OutputStream {
    /// Stream name used on the editor pipe.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            OutputStream::Out => "out",
            OutputStream::Log => "log",
        }
    }
}

/// Sink for console output mirrored to the editor.
pub trait EditorFeed {
    /// New bytes appended to a stream.
    fn append(&mut self, stream: OutputStream, tail: &[u8]);
    /// A rollback truncated a stream to `len` bytes.
    fn truncate(&mut self, stream: OutputStream, len: usize);
    /// A forward-sync query resolved to a document position.
    fn synctex(&mut self, _position: SyncPosition) {}
    /// A batch of updates is complete.
    fn flush(&mut self);
}

/// Document placeholder that only tracks sizes and narrates updates.
#[derive(Debug, Default)]
pub struct LoggingDocument {
    len: usize,
}

impl DocumentDecoder for LoggingDocument {
    fn reset(&mut self) {
        self.len = 0;
    }

    fn update(&mut self, data: &[u8]) {
        if data.len() < self.len {
            info!("document truncated to {} bytes", data.len());
        }
        self.len = data.len();
    }

    fn page_count(&self) -> usize {
        0
    }

    fn output_started(&self) -> bool {
        self.len > 0
    }
}

/// Synctex placeholder that only tracks sizes.
#[derive(Debug, Default)]
pub struct LoggingSynctex {
    len: usize,
}

impl SynctexDecoder for LoggingSynctex {
    fn update(&mut self, data: &[u8]) {
        self.len = data.len();
    }

    fn rollback(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    fn page_count(&self) -> usize {
        0
    }
}
