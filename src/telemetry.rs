// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Optional JSON-lines journal of engine requests for postmortems.
// Author: Lukas Bower

//! Request telemetry.
//!
//! When enabled, every engine request is appended to a JSON-lines file with
//! its engine clock and a short detail string. Replaying a session from
//! this journal is the quickest way to reproduce a rollback bug without
//! the editor attached.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use texwind_wire::{Request, RequestBody};

#[derive(Serialize)]
struct RequestEvent<'a> {
    ms: u32,
    op: &'static str,
    detail: &'a str,
}

/// JSON-lines request journal.
pub struct Telemetry {
    file: File,
}

impl Telemetry {
    /// Open (or create) the journal file in append mode.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening telemetry journal {}", path.display()))?;
        Ok(Self { file })
    }

    /// Append one request to the journal. Errors are swallowed after the
    /// journal opened; losing telemetry must never stall the driver.
    pub fn record(&mut self, request: &Request) {
        let detail = detail_of(&request.body);
        let event = RequestEvent {
            ms: request.time_ms,
            op: request.body.mnemonic(),
            detail: &detail,
        };
        if let Ok(line) = serde_json::to_string(&event) {
            let _ = writeln!(self.file, "{line}");
        }
    }
}

fn detail_of(body: &RequestBody) -> String {
    match body {
        RequestBody::Open { fid, path, mode } => format!("fid {fid} {path} mode {mode}"),
        RequestBody::Read { fid, pos, size } => format!("fid {fid} pos {pos} size {size}"),
        RequestBody::Write { fid, pos, data } => {
            format!("fid {fid} pos {pos} size {}", data.len())
        }
        RequestBody::Close { fid } | RequestBody::Size { fid } => format!("fid {fid}"),
        RequestBody::Seen { fid, pos } => format!("fid {fid} pos {pos}"),
        RequestBody::Gpic { path, kind, page } | RequestBody::Spic {
            path,
            cache: texwind_wire::PicCache { kind, page, .. },
        } => format!("{path} kind {kind} page {page}"),
        RequestBody::Child { pid } => format!("pid {pid}"),
    }
}
