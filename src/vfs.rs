// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Versioned virtual filesystem backing the engine's file requests.
// Author: Lukas Bower

//! Virtual filesystem with layered file contents.
//!
//! Every logical path the engine touches gets a [`FileEntry`] in a slab
//! arena, addressed by a stable [`EntryId`]. An entry carries up to three
//! content layers: a snapshot of the real file (`fs_data`/`fs_stat`), the
//! editor overlay (`edit_data`), and whatever the engine wrote back
//! (`saved`). The engine always sees the strongest layer: saved, then
//! overlay, then disk.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, info};
use texwind_wire::PicCache;

use crate::journal::Journal;

/// Upper bound on simultaneously open engine file ids.
pub const MAX_FILES: usize = 1024;

/// `seen` value of an entry the engine has never observed.
pub const SEEN_NEVER: i32 = -1;
/// `seen` value of an entry the engine observed to be absent.
pub const SEEN_MISSING: i32 = i32::MAX;

/// Stable index of a [`FileEntry`] in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub(crate) u32);

/// Strongest access the engine has taken on an entry in the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum AccessLevel {
    /// Not opened yet.
    #[default]
    None,
    /// Opened for reading.
    Read,
    /// Opened for writing; the entry is an engine output.
    Write,
}

/// Identity of the real file backing an entry, for change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStat {
    pub dev: u64,
    pub ino: u64,
    pub size: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
}

impl FsStat {
    fn of(meta: &fs::Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
            size: meta.size(),
            mtime_sec: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
        }
    }
}

/// Engine-written output layer of an entry.
#[derive(Debug, Default)]
pub struct SavedLayer {
    /// Output buffer, present once the engine opened the entry for writing.
    pub data: Option<Vec<u8>>,
    /// Strongest access taken so far.
    pub level: AccessLevel,
}

/// One logical file, with all its content layers and observation state.
#[derive(Debug)]
pub struct FileEntry {
    path: String,
    /// Bytes last read from the real filesystem.
    pub fs_data: Option<Rc<[u8]>>,
    /// Identity of the real file at last fetch.
    pub fs_stat: Option<FsStat>,
    /// Editor overlay content.
    pub edit_data: Option<Rc<[u8]>>,
    /// Engine output layer.
    pub saved: SavedLayer,
    /// Largest read offset observed, [`SEEN_NEVER`] or [`SEEN_MISSING`].
    pub seen: i32,
    /// Last picture bounds the engine registered for this path.
    pub pic_cache: Option<PicCache>,
    /// Journal generation stamps for the hot fields.
    pub(crate) saved_gen: u64,
    pub(crate) seen_gen: u64,
}

impl FileEntry {
    fn new(path: String) -> Self {
        Self {
            path,
            fs_data: None,
            fs_stat: None,
            edit_data: None,
            saved: SavedLayer::default(),
            seen: SEEN_NEVER,
            pic_cache: None,
            saved_gen: 0,
            seen_gen: 0,
        }
    }

    /// Logical path of this entry.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The bytes an engine read sees: saved output, else overlay, else disk.
    #[must_use]
    pub fn effective(&self) -> Option<&[u8]> {
        if let Some(data) = &self.saved.data {
            return Some(data);
        }
        if let Some(data) = &self.edit_data {
            return Some(data);
        }
        self.fs_data.as_deref()
    }

    /// Effective length, zero when no layer is present.
    #[must_use]
    pub fn effective_len(&self) -> usize {
        self.effective().map_or(0, <[u8]>::len)
    }
}

/// Outcome of re-checking one entry against the real filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanChange {
    /// Entry whose backing file changed.
    pub entry: EntryId,
    /// First invalidated byte offset.
    pub offset: usize,
}

/// Arena of file entries plus the path index and inclusion search path.
pub struct Vfs {
    entries: Vec<FileEntry>,
    by_path: HashMap<String, EntryId>,
    search_path: Vec<PathBuf>,
}

impl Vfs {
    /// Create an empty filesystem. `inclusion_path` is a colon-joined list
    /// of directories searched when a relative path misses.
    #[must_use]
    pub fn new(inclusion_path: &str) -> Self {
        let search_path = inclusion_path
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .collect();
        Self {
            entries: Vec::new(),
            by_path: HashMap::new(),
            search_path,
        }
    }

    /// Borrow an entry.
    #[must_use]
    pub fn entry(&self, id: EntryId) -> &FileEntry {
        &self.entries[id.0 as usize]
    }

    /// Borrow an entry mutably. Prefer the journaled mutators; this is for
    /// the journal itself and for read-mostly bookkeeping.
    pub(crate) fn entry_mut(&mut self, id: EntryId) -> &mut FileEntry {
        &mut self.entries[id.0 as usize]
    }

    /// Find an existing entry for a logical path.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<EntryId> {
        self.by_path.get(&normalize_path(path)).copied()
    }

    /// Find or create the entry for a logical path.
    pub fn lookup_or_create(&mut self, path: &str) -> EntryId {
        let path = normalize_path(path);
        if let Some(id) = self.by_path.get(&path) {
            return *id;
        }
        let id = EntryId(self.entries.len() as u32);
        self.entries.push(FileEntry::new(path.clone()));
        self.by_path.insert(path, id);
        id
    }

    /// Iterate over all entry ids.
    pub fn ids(&self) -> impl Iterator<Item = EntryId> {
        (0..self.entries.len() as u32).map(EntryId)
    }

    /// Resolve a logical path against the disk, trying the path itself and
    /// then every inclusion directory. Returns the winning path and its
    /// metadata.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<(PathBuf, FsStat)> {
        let direct = Path::new(path);
        if let Ok(meta) = fs::metadata(direct) {
            return Some((direct.to_path_buf(), FsStat::of(&meta)));
        }
        if direct.is_absolute() {
            return None;
        }
        let name = normalize_path(path);
        for dir in &self.search_path {
            let candidate = dir.join(&name);
            if let Ok(meta) = fs::metadata(&candidate) {
                return Some((candidate, FsStat::of(&meta)));
            }
        }
        None
    }

    /// Replace the editor overlay of an entry.
    pub fn set_edit_data(&mut self, journal: &mut Journal, id: EntryId, data: Option<Rc<[u8]>>) {
        let entry = &mut self.entries[id.0 as usize];
        journal.record_edit_data(id, entry.edit_data.clone());
        entry.edit_data = data;
    }

    /// Replace the disk layer of an entry.
    pub fn set_fs_layer(
        &mut self,
        journal: &mut Journal,
        id: EntryId,
        data: Option<Rc<[u8]>>,
        stat: Option<FsStat>,
    ) {
        let entry = &mut self.entries[id.0 as usize];
        journal.record_fs_layer(id, entry.fs_data.clone(), entry.fs_stat);
        entry.fs_data = data;
        entry.fs_stat = stat;
    }

    /// Replace the picture cache of an entry.
    pub fn set_pic_cache(&mut self, journal: &mut Journal, id: EntryId, cache: Option<PicCache>) {
        let entry = &mut self.entries[id.0 as usize];
        journal.record_pic_cache(id, entry.pic_cache);
        entry.pic_cache = cache;
    }

    /// Update the observation high-water mark of an entry.
    pub fn set_seen(&mut self, journal: &mut Journal, id: EntryId, seen: i32) {
        let entry = &mut self.entries[id.0 as usize];
        journal.record_seen(id, entry);
        entry.seen = seen;
    }

    /// Journal the output layer before mutating it through the returned
    /// reference.
    pub fn saved_mut(&mut self, journal: &mut Journal, id: EntryId) -> &mut SavedLayer {
        let entry = &mut self.entries[id.0 as usize];
        journal.record_saved(id, entry);
        &mut entry.saved
    }

    /// Re-check every entry that has a captured disk identity and no editor
    /// overlay. Entries whose backing file changed get their disk layer
    /// reloaded and are reported with the first invalidated offset; a file
    /// that disappeared or shrank invalidates from offset zero.
    pub fn scan(&mut self, journal: &mut Journal) -> Vec<ScanChange> {
        let mut changes = Vec::new();
        for id in self.ids().collect::<Vec<_>>() {
            let entry = self.entry(id);
            if entry.saved.level < AccessLevel::Read
                || entry.fs_stat.is_none()
                || entry.edit_data.is_some()
            {
                continue;
            }
            debug!("scanning {}", entry.path());
            let old_stat = entry.fs_stat.expect("checked above");
            let Some((disk_path, new_stat)) = self.resolve(entry.path()) else {
                info!("{} removed from disk", self.entry(id).path());
                self.set_fs_layer(journal, id, None, None);
                self.set_pic_cache(journal, id, None);
                changes.push(ScanChange {
                    entry: id,
                    offset: 0,
                });
                continue;
            };
            if stat_same(&old_stat, &new_stat) {
                continue;
            }
            let Ok(new_data) = fs::read(&disk_path) else {
                continue;
            };
            let old_data = self.entry(id).fs_data.clone().unwrap_or_else(|| Rc::from(&[][..]));
            let offset = match divergence(&old_data, &new_data) {
                None => {
                    // Identity changed but content did not; just refresh the stat.
                    self.set_fs_layer(journal, id, Some(old_data), Some(new_stat));
                    continue;
                }
                Some(offset) => offset,
            };
            info!(
                "{} changed on disk, first invalidated byte {}",
                self.entry(id).path(),
                offset
            );
            self.set_fs_layer(journal, id, Some(Rc::from(new_data)), Some(new_stat));
            self.set_pic_cache(journal, id, None);
            changes.push(ScanChange { entry: id, offset });
        }
        changes
    }
}

/// Compare the change-detection fields of two stats.
fn stat_same(a: &FsStat, b: &FsStat) -> bool {
    a == b
}

/// First invalidated byte offset between two contents, or `None` when they
/// are identical. A shrunk file invalidates everything.
pub(crate) fn divergence(old: &[u8], new: &[u8]) -> Option<usize> {
    if new.len() < old.len() {
        return Some(0);
    }
    if old == new {
        return None;
    }
    let common = old.len().min(new.len());
    let mut i = 0;
    while i < common && old[i] == new[i] {
        i += 1;
    }
    Some(i)
}

/// Strip a leading `./` and collapse duplicate slashes.
fn normalize_path(path: &str) -> String {
    let mut rest = path;
    while let Some(stripped) = rest.strip_prefix("./") {
        rest = stripped.trim_start_matches('/');
    }
    let mut out = String::with_capacity(rest.len());
    let mut prev_slash = false;
    for c in rest.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    out
}

/// Reference to one slot of the open-file table or an output singleton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellRef {
    /// Slot of the fid-indexed table.
    Table(u16),
    /// Engine stdout stream.
    Stdout,
    /// Main typeset output (xdv/dvi/pdf).
    Document,
    /// SynCTeX index output.
    Synctex,
    /// TeX log file output.
    Log,
}

/// Open-file table: fid-indexed cells plus the four output singletons.
pub struct CellTable {
    table: Vec<Option<EntryId>>,
    /// Entry bound to the engine's stdout stream, if any.
    pub stdout: Option<EntryId>,
    /// Entry bound to the typeset document output, if any.
    pub document: Option<EntryId>,
    /// Entry bound to the SynCTeX output, if any.
    pub synctex: Option<EntryId>,
    /// Entry bound to the log output, if any.
    pub log: Option<EntryId>,
}

impl CellTable {
    /// Create an empty table of [`MAX_FILES`] cells.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: vec![None; MAX_FILES],
            stdout: None,
            document: None,
            synctex: None,
            log: None,
        }
    }

    /// Entry currently held by a cell.
    #[must_use]
    pub fn get(&self, cell: CellRef) -> Option<EntryId> {
        match cell {
            CellRef::Table(slot) => self.table[slot as usize],
            CellRef::Stdout => self.stdout,
            CellRef::Document => self.document,
            CellRef::Synctex => self.synctex,
            CellRef::Log => self.log,
        }
    }

    /// Point a cell at an entry (or clear it), journaling the prior value.
    pub fn set(&mut self, journal: &mut Journal, cell: CellRef, entry: Option<EntryId>) {
        journal.record_cell(cell, self.get(cell));
        self.assign(cell, entry);
    }

    pub(crate) fn assign(&mut self, cell: CellRef, entry: Option<EntryId>) {
        match cell {
            CellRef::Table(slot) => self.table[slot as usize] = entry,
            CellRef::Stdout => self.stdout = entry,
            CellRef::Document => self.document = entry,
            CellRef::Synctex => self.synctex = entry,
            CellRef::Log => self.log = entry,
        }
    }
}

impl Default for CellTable {
    fn default() -> Self {
        Self::new()
    }
}
