// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Drive the engine: answer its file requests, snapshot it, rewind it.
// Author: Lukas Bower

//! The engine driver.
//!
//! Single-threaded by construction: the only concurrency is the engine
//! processes on the far side of their sockets, and the only suspension
//! points are bounded polls. Per step the driver answers at most one
//! request. Edits arrive as transactions (`begin_changes` /
//! `notify_file_changes` / `detect_changes` / `end_changes`); ending a
//! transaction that invalidated observations plans fences, kills the
//! now-wrong snapshots, rolls the journal back to the surviving one and
//! lets the engine re-run into the changed bytes.

use std::os::unix::net::UnixStream;
use std::path::Path;
use std::rc::Rc;

use anyhow::{bail, ensure, Context, Result};
use log::{debug, info, warn};
use texwind_wire::{Control, PicCache, Reply, Request, RequestBody, STDOUT_FID};

use crate::channel::Channel;
use crate::fence::{self, Fence, FencePolicy};
use crate::fleet::{Fleet, ProcessRecord};
use crate::journal::{Journal, Mark};
use crate::preview::{DocumentDecoder, EditorFeed, OutputStream, SynctexDecoder};
use crate::spawn::{self, EngineConfig};
use crate::telemetry::Telemetry;
use crate::trace::Trace;
use crate::vfs::{
    divergence, AccessLevel, CellRef, CellTable, EntryId, FsStat, Vfs, MAX_FILES, SEEN_MISSING,
};

/// Poll budget for one driver iteration and for edit-time drains.
const POLL_BUDGET_MS: i32 = 10;

/// Whether the typeset job can make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// An engine process is connected and can be stepped.
    Running,
    /// No live engine; a restart is required to continue.
    Terminated,
}

/// Driver configuration beyond the engine launch itself.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// How to launch the engine.
    pub engine: EngineConfig,
    /// Primary source file handed to the engine.
    pub primary: String,
    /// Colon-joined directory list for input file resolution.
    pub inclusion_path: String,
    /// Minimum engine-clock distance between snapshots.
    pub snapshot_interval_ms: u32,
    /// Fence placement tuning.
    pub fence_policy: FencePolicy,
}

struct EditTransaction {
    trace_len: usize,
    offset: i64,
    flush: bool,
}

/// The driver. Owns the virtual filesystem, the undo journal, the trace,
/// the snapshot fleet and the engine channel; everything else reaches it
/// through the preview traits.
pub struct Driver {
    config: DriverConfig,
    vfs: Vfs,
    cells: CellTable,
    journal: Journal,
    trace: Trace,
    fleet: Fleet,
    fences: Vec<Fence>,
    channel: Channel,
    restart_mark: Mark,
    document: Box<dyn DocumentDecoder>,
    synctex: Box<dyn SynctexDecoder>,
    editor: Box<dyn EditorFeed>,
    txn: Option<EditTransaction>,
    telemetry: Option<Telemetry>,
}

impl Driver {
    /// Build a driver around its collaborators. No engine is launched
    /// until the first [`Driver::step`] with restart enabled.
    pub fn new(
        config: DriverConfig,
        document: Box<dyn DocumentDecoder>,
        synctex: Box<dyn SynctexDecoder>,
        editor: Box<dyn EditorFeed>,
    ) -> Self {
        spawn::ignore_sigchld();
        let vfs = Vfs::new(&config.inclusion_path);
        let mut journal = Journal::new();
        let restart_mark = journal.snapshot();
        Self {
            config,
            vfs,
            cells: CellTable::new(),
            journal,
            trace: Trace::new(),
            fleet: Fleet::new(),
            fences: Vec::new(),
            channel: Channel::new(),
            restart_mark,
            document,
            synctex,
            editor,
            txn: None,
            telemetry: None,
        }
    }

    /// Start recording request telemetry to `path`.
    pub fn enable_telemetry(&mut self, path: &Path) -> Result<()> {
        self.telemetry = Some(Telemetry::open(path)?);
        Ok(())
    }

    /// Whether the job can currently make progress.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        if self.fleet.is_empty() || self.fleet.head().stream.is_none() {
            JobStatus::Terminated
        } else {
            JobStatus::Running
        }
    }

    /// Answer at most one engine request. With `restart_if_needed`, an
    /// empty fleet first relaunches the engine from the primary. Returns
    /// whether a request was handled.
    pub fn step(&mut self, restart_if_needed: bool) -> Result<bool> {
        if restart_if_needed {
            self.prepare_process()?;
        }
        if self.status() != JobStatus::Running {
            return Ok(false);
        }
        if !self.channel.has_pending(POLL_BUDGET_MS)? {
            return Ok(false);
        }
        match self.channel.read_request()? {
            Some(request) => {
                if let Some(telemetry) = &mut self.telemetry {
                    telemetry.record(&request);
                }
                self.answer(request)?;
                self.channel.flush()?;
                Ok(true)
            }
            None => {
                info!("engine closed its socket");
                self.drop_head();
                Ok(false)
            }
        }
    }

    /// Number of pages the document decoder has produced.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.document.page_count()
    }

    /// Find or create the entry for a logical path.
    pub fn find_file(&mut self, path: &str) -> EntryId {
        self.vfs.lookup_or_create(path)
    }

    /// The snapshot fleet, for inspection.
    #[must_use]
    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    /// The observation trace, for inspection.
    #[must_use]
    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    /// Pending fences, for inspection.
    #[must_use]
    pub fn fences(&self) -> &[Fence] {
        &self.fences
    }

    /// The virtual filesystem, for inspection.
    #[must_use]
    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    /// The open-file cells, for inspection.
    #[must_use]
    pub fn cells(&self) -> &CellTable {
        &self.cells
    }

    // ------------------------------------------------------------------
    // Engine lifecycle

    fn prepare_process(&mut self) -> Result<()> {
        if !self.fleet.is_empty() {
            return Ok(());
        }
        let (pid, stream) = spawn::launch(&self.config.engine, &self.config.primary)?;
        self.attach_engine(pid, stream)
    }

    /// Adopt an engine process launched by the caller as the root of a
    /// fresh fleet, and run the protocol handshake with it. For hosts
    /// that manage the engine lifecycle themselves.
    pub fn attach_engine(&mut self, pid: i32, stream: UnixStream) -> Result<()> {
        ensure!(self.fleet.is_empty(), "an engine is already attached");
        self.rollback_journal(self.restart_mark);
        self.trace.revert_to(0, &mut self.vfs);
        self.channel.set_stream(stream.try_clone().context("adopting engine socket")?);
        self.fleet.push(ProcessRecord {
            pid,
            stream: Some(stream),
            trace_len: 0,
            mark: self.restart_mark,
        });
        ensure!(self.channel.handshake()?, "engine handshake failed");
        Ok(())
    }

    /// The head died: pop it and promote the previous snapshot, if any.
    fn drop_head(&mut self) {
        if self.fleet.is_empty() {
            return;
        }
        self.pop_process();
        if self.fleet.is_empty() {
            info!("no snapshot left, job terminated until restart");
        }
    }

    /// Pop the head process, rewinding trace and journal to the new head.
    fn pop_process(&mut self) {
        if let Some(mut record) = self.fleet.pop() {
            record.close();
        }
        let (mark, trace_len) = match self.fleet.records().last() {
            Some(head) => (head.mark, head.trace_len),
            None => (self.restart_mark, 0),
        };
        self.trace.revert_to(trace_len, &mut self.vfs);
        self.rollback_journal(mark);
        match self.fleet.records().last().and_then(|head| head.stream.as_ref()) {
            Some(stream) => match stream.try_clone() {
                Ok(dup) => self.channel.set_stream(dup),
                Err(err) => {
                    warn!("cannot adopt snapshot socket: {err}");
                    self.channel.clear_stream();
                }
            },
            None => self.channel.clear_stream(),
        }
    }

    /// Roll the journal back to `mark` without disturbing input truth:
    /// editor overlays and disk snapshots reflect the present, not the
    /// engine run, so they are captured and re-asserted around the rewind.
    fn rollback_journal(&mut self, mark: Mark) {
        let inputs: Vec<(EntryId, Option<Rc<[u8]>>, Option<Rc<[u8]>>, Option<FsStat>)> = self
            .vfs
            .ids()
            .map(|id| {
                let entry = self.vfs.entry(id);
                (
                    id,
                    entry.edit_data.clone(),
                    entry.fs_data.clone(),
                    entry.fs_stat,
                )
            })
            .collect();
        self.journal.rollback(mark, &mut self.vfs, &mut self.cells);
        for (id, edit, fs, stat) in inputs {
            let entry = self.vfs.entry(id);
            if entry.edit_data != edit {
                self.vfs.set_edit_data(&mut self.journal, id, edit);
            }
            let entry = self.vfs.entry(id);
            if entry.fs_data != fs || entry.fs_stat != stat {
                self.vfs.set_fs_layer(&mut self.journal, id, fs, stat);
            }
        }
    }

    // ------------------------------------------------------------------
    // Request dispatch

    fn answer(&mut self, request: Request) -> Result<()> {
        debug!("<- {} at {}ms", request.body.mnemonic(), request.time_ms);
        let time = request.time_ms;
        match request.body {
            RequestBody::Open { fid, path, mode } => self.handle_open(time, fid, &path, &mode),
            RequestBody::Read { fid, pos, size } => self.handle_read(time, fid, pos, size),
            RequestBody::Write { fid, pos, data } => self.handle_write(fid, pos, &data),
            RequestBody::Close { fid } => self.handle_close(fid),
            RequestBody::Size { fid } => self.handle_size(fid),
            RequestBody::Seen { fid, pos } => self.handle_seen(time, fid, pos),
            RequestBody::Child { pid } => self.handle_child(pid),
            RequestBody::Gpic { path, kind, page } => self.handle_gpic(&path, kind, page),
            RequestBody::Spic { path, cache } => self.handle_spic(&path, cache),
        }
    }

    fn checked_fid(&self, fid: i32) -> Result<usize> {
        ensure!(
            (0..MAX_FILES as i32).contains(&fid),
            "file id {fid} out of range"
        );
        Ok(fid as usize)
    }

    fn cell_entry(&self, fid: i32) -> Result<EntryId> {
        let slot = self.checked_fid(fid)?;
        self.cells
            .get(CellRef::Table(slot as u16))
            .with_context(|| format!("file id {fid} is not open"))
    }

    /// Journal and trace one observation of `id` growing to `seen`.
    fn observe(&mut self, id: EntryId, seen: i32, time: u32) {
        let prior = self.vfs.entry(id).seen;
        let boundary = self.fleet.at_snapshot_boundary(self.trace.len());
        self.trace.record(boundary, id, prior, time);
        self.vfs.set_seen(&mut self.journal, id, seen);
        self.fleet.head_mut().trace_len = self.trace.len();
    }

    fn handle_open(&mut self, time: u32, fid: i32, path: &str, mode: &str) -> Result<()> {
        let slot = self.checked_fid(fid)? as u16;
        ensure!(
            self.cells.get(CellRef::Table(slot)).is_none(),
            "file id {fid} opened twice"
        );
        let read_mode = match mode.as_bytes().first() {
            Some(b'r') => true,
            Some(b'w') => false,
            _ => bail!("unsupported open mode {mode:?} for {path}"),
        };

        if read_mode {
            let known = self
                .vfs
                .lookup(path)
                .is_some_and(|id| self.vfs.entry(id).effective().is_some());
            if !known && self.vfs.resolve(path).is_none() {
                // Nothing anywhere: let the engine fall back to its own
                // search, and remember we watched the file not exist.
                let id = self.vfs.lookup_or_create(path);
                self.observe(id, SEEN_MISSING, time);
                return self.reply(Reply::Pass);
            }
        }

        let id = self.vfs.lookup_or_create(path);
        self.cells
            .set(&mut self.journal, CellRef::Table(slot), Some(id));
        if self.vfs.entry(id).seen < 0 {
            self.observe(id, 0, time);
        }

        if read_mode {
            self.load_for_read(id, path)?;
        } else {
            let saved = self.vfs.saved_mut(&mut self.journal, id);
            saved.data = Some(Vec::with_capacity(1024));
            saved.level = AccessLevel::Write;
            self.bind_output_slot(id, path)?;
        }

        let canonical = self.vfs.entry(id).path().as_bytes().to_vec();
        self.reply(Reply::Open(canonical))
    }

    /// Make sure a read-mode entry has content loaded.
    fn load_for_read(&mut self, id: EntryId, path: &str) -> Result<()> {
        if self.vfs.entry(id).saved.level >= AccessLevel::Read {
            return Ok(());
        }
        match self.vfs.resolve(path) {
            None => {
                ensure!(
                    self.vfs.entry(id).edit_data.is_some(),
                    "open of {path} with no content anywhere"
                );
                self.vfs.saved_mut(&mut self.journal, id).level = AccessLevel::Read;
            }
            Some((disk_path, stat)) => {
                let data = std::fs::read(&disk_path)
                    .with_context(|| format!("reading {}", disk_path.display()))?;
                self.vfs
                    .set_fs_layer(&mut self.journal, id, Some(Rc::from(data)), Some(stat));
                self.vfs.saved_mut(&mut self.journal, id).level = AccessLevel::Read;
            }
        }
        Ok(())
    }

    /// Attach a freshly opened write-mode entry to its output singleton.
    fn bind_output_slot(&mut self, id: EntryId, path: &str) -> Result<()> {
        if path == "stdout" {
            ensure!(self.cells.stdout.is_none(), "engine opened two stdouts");
            self.cells.set(&mut self.journal, CellRef::Stdout, Some(id));
            return Ok(());
        }
        let Some(extension) = path.rsplit('.').next().filter(|ext| *ext != path) else {
            return Ok(());
        };
        match extension {
            "xdv" | "dvi" | "pdf" => {
                ensure!(
                    self.cells.document.is_none(),
                    "engine opened two document outputs"
                );
                self.cells
                    .set(&mut self.journal, CellRef::Document, Some(id));
                self.document.reset();
                info!("{path} is the output document");
            }
            "synctex" => {
                ensure!(
                    self.cells.synctex.is_none(),
                    "engine opened two synctex outputs"
                );
                self.cells.set(&mut self.journal, CellRef::Synctex, Some(id));
                self.synctex.rollback(0);
                info!("{path} is the synctex index");
            }
            "log" => {
                ensure!(self.cells.log.is_none(), "engine opened two log outputs");
                self.cells.set(&mut self.journal, CellRef::Log, Some(id));
                info!("{path} is the log file");
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_read(&mut self, time: u32, fid: i32, pos: u32, size: u32) -> Result<()> {
        let id = self.cell_entry(fid)?;
        let entry = self.vfs.entry(id);
        ensure!(
            entry.saved.level >= AccessLevel::Read,
            "read from unopened {}",
            entry.path()
        );
        let len = entry.effective_len();
        let pos = pos as usize;
        ensure!(
            pos <= len,
            "read past end of {} ({pos} > {len})",
            entry.path()
        );
        let mut count = (size as usize).min(len - pos);

        let mut fork = false;
        if let Some(fence) = self.fences.last().copied() {
            if fence.entry == id && fence.position < pos + count {
                ensure!(
                    fence.position >= pos,
                    "read at {pos} is already past the fence at {}",
                    fence.position
                );
                count = fence.position - pos;
                fork = count == 0;
            }
        }
        if fork {
            self.fences.pop();
        } else if !self.need_snapshot(time) {
            let data = self.vfs.entry(id).effective().expect("length checked")
                [pos..pos + count]
                .to_vec();
            return self.reply(Reply::Read(data));
        }
        self.reply(Reply::Fork)
    }

    /// Snapshot policy: no forks while fences pend; otherwise fork once
    /// the engine clock moved past the interval since the last snapshot
    /// and at least one new observation was traced.
    fn need_snapshot(&self, time: u32) -> bool {
        if !self.fences.is_empty() {
            return false;
        }
        let records = self.fleet.records();
        let n = records.len();
        let last_time = if n > 1 {
            let prev = &records[n - 2];
            if records[n - 1].trace_len == prev.trace_len {
                return false;
            }
            if prev.trace_len == 0 {
                0
            } else {
                self.trace.get(prev.trace_len - 1).time_ms
            }
        } else {
            if self.trace.is_empty() {
                return false;
            }
            // Forking before any output breaks system-font loading on
            // platforms where fork does not carry the font service.
            #[cfg(target_os = "macos")]
            if !self.document.output_started() {
                return false;
            }
            0
        };
        time > last_time + self.config.snapshot_interval_ms
    }

    fn handle_write(&mut self, fid: i32, pos: u32, data: &[u8]) -> Result<()> {
        let mut pos = pos as usize;
        let id = if fid == STDOUT_FID {
            ensure!(pos == 0, "stdout writes are append-only");
            match self.cells.stdout {
                Some(id) => id,
                None => {
                    let id = self.vfs.lookup_or_create("stdout");
                    if self.vfs.entry(id).saved.data.is_none() {
                        let saved = self.vfs.saved_mut(&mut self.journal, id);
                        saved.data = Some(Vec::with_capacity(1024));
                        saved.level = AccessLevel::Write;
                    }
                    self.cells.set(&mut self.journal, CellRef::Stdout, Some(id));
                    id
                }
            }
        } else {
            self.cell_entry(fid)?
        };

        let entry = self.vfs.entry(id);
        ensure!(
            entry.saved.level == AccessLevel::Write,
            "write to read-only {}",
            entry.path()
        );
        if fid == STDOUT_FID {
            pos = entry.saved.data.as_ref().map_or(0, Vec::len);
        }

        {
            let saved = self.vfs.saved_mut(&mut self.journal, id);
            let buffer = saved.data.as_mut().expect("write level implies a buffer");
            if pos + data.len() > buffer.len() {
                buffer.resize(pos, 0);
                buffer.extend_from_slice(data);
            } else {
                buffer[pos..pos + data.len()].copy_from_slice(data);
            }
        }

        self.publish_output(id, pos);
        self.reply(Reply::Done)
    }

    /// Push a freshly written output buffer to whichever collaborator
    /// tracks it.
    fn publish_output(&mut self, id: EntryId, pos: usize) {
        let data = self
            .vfs
            .entry(id)
            .saved
            .data
            .as_deref()
            .expect("published entry has a buffer");
        if self.cells.document == Some(id) {
            let before = self.document.page_count();
            self.document.update(data);
            let after = self.document.page_count();
            if before != after {
                info!("document is {after} pages long");
            }
        } else if self.cells.synctex == Some(id) {
            self.synctex.update(data);
        } else if self.cells.log == Some(id) {
            self.editor.append(OutputStream::Log, &data[pos..]);
        } else if self.cells.stdout == Some(id) {
            self.editor.append(OutputStream::Out, &data[pos..]);
        }
    }

    fn handle_close(&mut self, fid: i32) -> Result<()> {
        let slot = self.checked_fid(fid)? as u16;
        let id = self
            .cells
            .get(CellRef::Table(slot))
            .with_context(|| format!("close of unopened file id {fid}"))?;
        self.cells.set(&mut self.journal, CellRef::Table(slot), None);

        // stdout and log detach on close; document and synctex stay bound
        // so their decoders keep tracking the same buffer across runs.
        if self.cells.stdout == Some(id) {
            self.cells.set(&mut self.journal, CellRef::Stdout, None);
        }
        if self.cells.log == Some(id) {
            self.cells.set(&mut self.journal, CellRef::Log, None);
        }
        if self.cells.document == Some(id) {
            info!("document output finished");
        }
        self.reply(Reply::Done)
    }

    fn handle_size(&mut self, fid: i32) -> Result<()> {
        let id = self.cell_entry(fid)?;
        let entry = self.vfs.entry(id);
        ensure!(
            entry.saved.level >= AccessLevel::Read,
            "size of unopened {}",
            entry.path()
        );
        self.reply(Reply::Size(entry.effective_len() as u32))
    }

    fn handle_seen(&mut self, time: u32, fid: i32, pos: u32) -> Result<()> {
        let id = self.cell_entry(fid)?;
        let entry = self.vfs.entry(id);
        ensure!(
            entry.saved.level >= AccessLevel::Read,
            "seen for unopened {}",
            entry.path()
        );
        let pos = pos as i32;
        if let Some(fence) = self.fences.last() {
            ensure!(
                fence.entry != id || pos <= fence.position as i32,
                "seen position {pos} violates the fence at {} in {}",
                fence.position,
                self.vfs.entry(id).path()
            );
        }
        // A reopened file may report a smaller position; only growth counts.
        if pos > self.vfs.entry(id).seen {
            self.observe(id, pos, time);
        }
        Ok(())
    }

    fn handle_child(&mut self, pid: u32) -> Result<()> {
        let fd = self
            .channel
            .take_fd()
            .context("CHLD arrived without a descriptor")?;
        if self.fleet.is_full() {
            self.fleet.decimate();
        }
        let mark = self.journal.snapshot();
        let trace_len = self.trace.len();
        self.fleet.head_mut().mark = mark;

        // Acknowledge on the parent's socket before adopting the child.
        self.channel.write_reply(&Reply::Done)?;
        self.channel.flush()?;

        let stream = UnixStream::from(fd);
        let dup = stream.try_clone().context("adopting child socket")?;
        self.fleet.push(ProcessRecord {
            pid: pid as i32,
            stream: Some(stream),
            trace_len,
            mark,
        });
        self.channel.set_stream(dup);
        info!("snapshot pid {pid} at trace position {trace_len}");
        Ok(())
    }

    fn handle_gpic(&mut self, path: &str, kind: i32, page: i32) -> Result<()> {
        let cached = self.vfs.lookup(path).and_then(|id| {
            let entry = self.vfs.entry(id);
            if entry.saved.level != AccessLevel::Read {
                return None;
            }
            entry
                .pic_cache
                .filter(|cache| cache.kind == kind && cache.page == page)
        });
        match cached {
            Some(cache) => self.reply(Reply::Gpic(cache.bounds)),
            None => self.reply(Reply::Pass),
        }
    }

    fn handle_spic(&mut self, path: &str, cache: PicCache) -> Result<()> {
        if let Some(id) = self.vfs.lookup(path) {
            if self.vfs.entry(id).saved.level == AccessLevel::Read {
                self.vfs.set_pic_cache(&mut self.journal, id, Some(cache));
            }
        }
        self.reply(Reply::Done)
    }

    fn reply(&mut self, reply: Reply) -> Result<()> {
        self.channel.write_reply(&reply)
    }

    // ------------------------------------------------------------------
    // Edit transactions

    /// Start an edit transaction. Nesting is a driver bug.
    pub fn begin_changes(&mut self) -> Result<()> {
        ensure!(self.txn.is_none(), "edit transaction already open");
        self.txn = Some(EditTransaction {
            trace_len: self.trace.len(),
            offset: -1,
            flush: false,
        });
        Ok(())
    }

    /// Report that `id` changed from byte `offset` on. Rewinds the trace
    /// cursor of the open transaction past every invalidated observation.
    pub fn notify_file_changes(&mut self, id: EntryId, offset: usize) -> Result<()> {
        ensure!(self.txn.is_some(), "file change outside a transaction");
        let changed = offset as i32;

        if self.vfs.entry(id).seen < changed {
            if self.txn.as_ref().expect("checked").trace_len == self.trace.len() {
                // The engine may not have flushed the observation that this
                // edit invalidates; drain its pending SEENs first.
                if self.drain_pending_seen()? {
                    return Ok(());
                }
                self.txn.as_mut().expect("checked").trace_len = self.trace.len();
            }
            if self.vfs.entry(id).seen < changed {
                return Ok(());
            }
        }

        let mut trace_len = self.txn.as_ref().expect("checked").trace_len;
        while self.vfs.entry(id).seen >= changed {
            ensure!(trace_len > 0, "invalidated observation not in the trace");
            trace_len -= 1;
            let record = *self.trace.get(trace_len);
            self.vfs.entry_mut(record.entry).seen = record.seen;
        }
        ensure!(
            self.trace.get(trace_len).entry == id,
            "trace rewind for {} stopped on a different file",
            self.vfs.entry(id).path()
        );
        let txn = self.txn.as_mut().expect("checked");
        txn.trace_len = trace_len;
        txn.offset = i64::from(changed);
        Ok(())
    }

    /// Re-check every tracked file against the disk and fold any changes
    /// into the open transaction.
    pub fn detect_changes(&mut self) -> Result<()> {
        ensure!(self.txn.is_some(), "scan outside a transaction");
        let changes = self.vfs.scan(&mut self.journal);
        for change in changes {
            self.notify_file_changes(change.entry, change.offset)?;
        }
        Ok(())
    }

    /// Close the transaction. Returns true when snapshots were rolled
    /// back; false when nothing the engine observed was touched (a pure
    /// flush request pings the engine instead).
    pub fn end_changes(&mut self) -> Result<bool> {
        let txn = self.txn.take().context("end of transaction without begin")?;
        let mut trace_len = txn.trace_len;
        let mut offset = txn.offset;

        if trace_len == self.trace.len() {
            if !txn.flush {
                return Ok(false);
            }
            if self.status() == JobStatus::Running {
                self.channel.write_control(&Control::Flush)?;
                self.channel.flush()?;
                return Ok(false);
            }
            // Dead head and observations may be stale: force a one-record
            // rewind so the engine re-covers the tail on restart.
            if trace_len == 0 {
                return Ok(false);
            }
            trace_len -= 1;
            let record = *self.trace.get(trace_len);
            self.vfs.entry_mut(record.entry).seen = record.seen;
            if trace_len > 0 {
                offset = i64::from(self.trace.get(trace_len).seen);
            }
        }

        info!(
            "rewound trace from {} to {} entries",
            self.trace.len(),
            trace_len
        );

        let plan = fence::plan(
            &self.config.fence_policy,
            &self.trace,
            &self.vfs,
            &self.fleet,
            trace_len,
            offset,
        );
        self.fences = plan.fences;
        self.rollback_processes(plan.target);
        Ok(true)
    }

    /// Kill every snapshot past `target`, rewind trace and journal to the
    /// surviving head, and replay the output decoders from the truncated
    /// buffers.
    fn rollback_processes(&mut self, target: usize) {
        info!(
            "rolling back to trace position {target}, {} bytes of document output",
            self.output_len(self.cells.document)
        );
        while !self.fleet.is_empty() && self.fleet.head().trace_len > target {
            self.pop_process();
        }
        let trace_len = if self.fleet.is_empty() {
            0
        } else {
            self.fleet.head().trace_len
        };
        self.trace.revert_to(trace_len, &mut self.vfs);

        match self.cells.document.map(|id| self.vfs.entry(id)) {
            Some(entry) => {
                self.document
                    .update(entry.saved.data.as_deref().unwrap_or(&[]));
            }
            None => self.document.reset(),
        }
        match self.cells.synctex.map(|id| self.vfs.entry(id)) {
            Some(entry) => {
                self.synctex
                    .update(entry.saved.data.as_deref().unwrap_or(&[]));
            }
            None => self.synctex.rollback(0),
        }
        let out_len = self.output_len(self.cells.stdout);
        self.editor.truncate(OutputStream::Out, out_len);
        let log_len = self.output_len(self.cells.log);
        self.editor.truncate(OutputStream::Log, log_len);
        self.editor.flush();
        info!(
            "after rollback: {} bytes of document output",
            self.output_len(self.cells.document)
        );
    }

    fn output_len(&self, cell: Option<EntryId>) -> usize {
        cell.and_then(|id| self.vfs.entry(id).saved.data.as_ref().map(Vec::len))
            .unwrap_or(0)
    }

    /// Process pending `SEEN` messages so the driver's view of the engine
    /// is current before deciding what an edit invalidates. Returns true
    /// when nothing new was reported. A head that cannot answer within
    /// the poll budget is assumed stuck and killed.
    fn drain_pending_seen(&mut self) -> Result<bool> {
        if self.txn.as_ref().is_some_and(|txn| txn.flush) {
            return Ok(true);
        }
        if let Some(txn) = self.txn.as_mut() {
            txn.flush = true;
        }
        if self.status() != JobStatus::Running {
            return Ok(true);
        }
        let mut nothing_seen = true;
        loop {
            if !self.channel.has_pending(POLL_BUDGET_MS)? {
                warn!("engine did not answer within {POLL_BUDGET_MS}ms, killing it");
                self.fleet.head_mut().close();
                break;
            }
            match self.channel.peek_tag()? {
                Some(tag) if tag == u32::from_le_bytes(*b"SEEN") => {
                    match self.channel.read_request()? {
                        Some(request) => {
                            self.answer(request)?;
                            nothing_seen = false;
                        }
                        None => {
                            self.fleet.head_mut().close();
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
        Ok(nothing_seen)
    }

    // ------------------------------------------------------------------
    // Editor-side mutations

    /// Install a full overlay for `path`, as sent by the editor's `open`.
    pub fn open_overlay(&mut self, path: &str, contents: Vec<u8>) -> Result<()> {
        let id = self.find_file(path);
        let current = self.input_content(id);
        let Some(offset) = divergence(&current, &contents) else {
            return Ok(());
        };
        self.vfs
            .set_edit_data(&mut self.journal, id, Some(Rc::from(contents)));
        self.notify_file_changes(id, offset)
    }

    /// Drop the overlay for `path`, as sent by the editor's `close`.
    pub fn close_overlay(&mut self, path: &str) -> Result<()> {
        let id = self.find_file(path);
        if self.vfs.entry(id).edit_data.is_none() {
            return Ok(());
        }
        let current = self.input_content(id);
        let disk: Vec<u8> = self
            .vfs
            .entry(id)
            .fs_data
            .as_deref()
            .unwrap_or(&[])
            .to_vec();
        self.vfs.set_edit_data(&mut self.journal, id, None);
        match divergence(&current, &disk) {
            Some(offset) => self.notify_file_changes(id, offset),
            None => Ok(()),
        }
    }

    /// Byte splice from the editor's `change`.
    pub fn splice(&mut self, path: &str, offset: usize, remove: usize, insert: &[u8]) -> Result<()> {
        let id = self.find_file(path);
        let current = self.input_content(id);
        let start = offset.min(current.len());
        let end = start.saturating_add(remove).min(current.len());
        let mut next = Vec::with_capacity(current.len() - (end - start) + insert.len());
        next.extend_from_slice(&current[..start]);
        next.extend_from_slice(insert);
        next.extend_from_slice(&current[end..]);
        if next == current {
            return Ok(());
        }
        self.vfs
            .set_edit_data(&mut self.journal, id, Some(Rc::from(next)));
        self.notify_file_changes(id, start)
    }

    /// Line splice from the editor's `change-lines`. `line` is 1-based;
    /// `count` lines (including their newlines) are replaced by `insert`,
    /// which gets a terminating newline if it lacks one.
    pub fn splice_lines(
        &mut self,
        path: &str,
        line: usize,
        count: usize,
        insert: &str,
    ) -> Result<()> {
        let id = self.find_file(path);
        let current = self.input_content(id);
        let start = line_offset(&current, line.saturating_sub(1));
        let end = line_offset(&current, line.saturating_sub(1) + count);
        let mut text = insert.as_bytes().to_vec();
        if !text.is_empty() && !text.ends_with(b"\n") {
            text.push(b'\n');
        }
        self.splice(path, start, end - start, &text)
    }

    /// Resolve an editor forward-sync request and report the position on
    /// the editor pipe, when the synctex decoder can answer.
    pub fn synctex_forward(&mut self, path: &str, line: usize) {
        match self.synctex.forward(path, line) {
            Some(position) => self.editor.synctex(position),
            None => debug!("no synctex position for {path}:{line}"),
        }
    }

    /// Editable content of an entry: overlay, else disk, never engine
    /// output.
    fn input_content(&self, id: EntryId) -> Vec<u8> {
        let entry = self.vfs.entry(id);
        entry
            .edit_data
            .as_deref()
            .or(entry.fs_data.as_deref())
            .unwrap_or(&[])
            .to_vec()
    }
}

/// Byte offset of the start of 0-based line `line`; content length when
/// the line is past the end.
fn line_offset(content: &[u8], line: usize) -> usize {
    let mut offset = 0;
    for _ in 0..line {
        match content[offset..].iter().position(|&b| b == b'\n') {
            Some(nl) => offset += nl + 1,
            None => return content.len(),
        }
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_offsets_resolve_against_newlines() {
        let text = b"one\ntwo\nthree\n";
        assert_eq!(line_offset(text, 0), 0);
        assert_eq!(line_offset(text, 1), 4);
        assert_eq!(line_offset(text, 2), 8);
        assert_eq!(line_offset(text, 3), 14);
        assert_eq!(line_offset(text, 9), 14);
    }
}
