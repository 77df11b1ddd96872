// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Undo journal of virtual filesystem mutations with savepoint rollback.
// Author: Lukas Bower

//! Append-only undo journal for the virtual filesystem.
//!
//! Every mutation of a file entry field or open-file cell records the prior
//! value before the change lands. [`Journal::snapshot`] returns an opaque
//! [`Mark`]; [`Journal::rollback`] undoes everything recorded after a mark
//! in LIFO order, which is how the driver rewinds the filesystem to the
//! state a forked engine snapshot observed.
//!
//! Records are deltas keyed by [`EntryId`] (a stable slab index), never
//! pointers. Output buffers are append-only within an engine run, so their
//! undo record only keeps the prior length; truncation restores them.

use std::rc::Rc;

use texwind_wire::PicCache;

use crate::vfs::{AccessLevel, CellRef, CellTable, EntryId, FileEntry, FsStat, Vfs};

/// Savepoint in the journal. Opaque to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark {
    len: usize,
}

#[derive(Debug)]
enum Record {
    /// Prior output-layer state: buffer length (`None` = no buffer) + level.
    Saved {
        id: EntryId,
        len: Option<usize>,
        level: AccessLevel,
        stamp: u64,
    },
    /// Prior observation high-water mark.
    Seen { id: EntryId, seen: i32, stamp: u64 },
    /// Prior editor overlay.
    EditData {
        id: EntryId,
        prior: Option<Rc<[u8]>>,
    },
    /// Prior disk layer.
    FsLayer {
        id: EntryId,
        data: Option<Rc<[u8]>>,
        stat: Option<FsStat>,
    },
    /// Prior picture cache.
    Pic {
        id: EntryId,
        prior: Option<PicCache>,
    },
    /// Prior cell pointer.
    Cell {
        cell: CellRef,
        prior: Option<EntryId>,
    },
}

/// The undo journal. One per driver.
pub struct Journal {
    records: Vec<Record>,
    /// Mark generation; bumped by every snapshot and rollback. Entries
    /// stamp their hot fields with the generation that last recorded them,
    /// so repeated mutations between two marks journal only once.
    generation: u64,
}

impl Journal {
    /// Create an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            generation: 1,
        }
    }

    /// Number of records currently held. Diagnostic only.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Take a savepoint. Mutations recorded after this call are undone by
    /// rolling back to the returned mark.
    pub fn snapshot(&mut self) -> Mark {
        self.generation += 1;
        Mark {
            len: self.records.len(),
        }
    }

    /// Record the output layer of `entry` if this generation has not yet.
    pub(crate) fn record_saved(&mut self, id: EntryId, entry: &mut FileEntry) {
        if entry.saved_gen == self.generation {
            return;
        }
        self.records.push(Record::Saved {
            id,
            len: entry.saved.data.as_ref().map(Vec::len),
            level: entry.saved.level,
            stamp: entry.saved_gen,
        });
        entry.saved_gen = self.generation;
    }

    /// Record the `seen` mark of `entry` if this generation has not yet.
    pub(crate) fn record_seen(&mut self, id: EntryId, entry: &mut FileEntry) {
        if entry.seen_gen == self.generation {
            return;
        }
        self.records.push(Record::Seen {
            id,
            seen: entry.seen,
            stamp: entry.seen_gen,
        });
        entry.seen_gen = self.generation;
    }

    pub(crate) fn record_edit_data(&mut self, id: EntryId, prior: Option<Rc<[u8]>>) {
        self.records.push(Record::EditData { id, prior });
    }

    pub(crate) fn record_fs_layer(
        &mut self,
        id: EntryId,
        data: Option<Rc<[u8]>>,
        stat: Option<FsStat>,
    ) {
        self.records.push(Record::FsLayer { id, data, stat });
    }

    pub(crate) fn record_pic_cache(&mut self, id: EntryId, prior: Option<PicCache>) {
        self.records.push(Record::Pic { id, prior });
    }

    pub(crate) fn record_cell(&mut self, cell: CellRef, prior: Option<EntryId>) {
        self.records.push(Record::Cell { cell, prior });
    }

    /// Undo every mutation recorded after `mark`, in LIFO order.
    ///
    /// Panics when `mark` lies beyond the current journal length; that can
    /// only happen if a caller kept a mark across a rollback that consumed
    /// it, which is a driver bug.
    pub fn rollback(&mut self, mark: Mark, vfs: &mut Vfs, cells: &mut CellTable) {
        assert!(
            mark.len <= self.records.len(),
            "rollback to a consumed mark: {} > {}",
            mark.len,
            self.records.len()
        );
        while self.records.len() > mark.len {
            match self.records.pop().expect("length checked") {
                Record::Saved {
                    id,
                    len,
                    level,
                    stamp,
                } => {
                    let entry = vfs.entry_mut(id);
                    match len {
                        Some(prior_len) => {
                            let data = entry
                                .saved
                                .data
                                .as_mut()
                                .expect("output buffer existed at record time");
                            data.truncate(prior_len);
                        }
                        None => entry.saved.data = None,
                    }
                    entry.saved.level = level;
                    entry.saved_gen = stamp;
                }
                Record::Seen { id, seen, stamp } => {
                    let entry = vfs.entry_mut(id);
                    entry.seen = seen;
                    entry.seen_gen = stamp;
                }
                Record::EditData { id, prior } => {
                    vfs.entry_mut(id).edit_data = prior;
                }
                Record::FsLayer { id, data, stat } => {
                    let entry = vfs.entry_mut(id);
                    entry.fs_data = data;
                    entry.fs_stat = stat;
                }
                Record::Pic { id, prior } => {
                    vfs.entry_mut(id).pic_cache = prior;
                }
                Record::Cell { cell, prior } => {
                    cells.assign(cell, prior);
                }
            }
        }
        self.generation += 1;
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::SEEN_NEVER;

    #[test]
    fn rollback_restores_all_fields() {
        let mut vfs = Vfs::new("");
        let mut cells = CellTable::new();
        let mut journal = Journal::new();
        let id = vfs.lookup_or_create("body.tex");

        vfs.set_edit_data(&mut journal, id, Some(Rc::from(&b"v1"[..])));
        vfs.set_seen(&mut journal, id, 2);
        cells.set(&mut journal, CellRef::Table(3), Some(id));
        let mark = journal.snapshot();

        vfs.set_edit_data(&mut journal, id, Some(Rc::from(&b"v2 longer"[..])));
        vfs.set_seen(&mut journal, id, 9);
        vfs.set_pic_cache(
            &mut journal,
            id,
            Some(PicCache {
                kind: 1,
                page: 2,
                bounds: [0.0; 4],
            }),
        );
        cells.set(&mut journal, CellRef::Table(3), None);
        cells.set(&mut journal, CellRef::Log, Some(id));

        journal.rollback(mark, &mut vfs, &mut cells);

        let entry = vfs.entry(id);
        assert_eq!(entry.edit_data.as_deref(), Some(&b"v1"[..]));
        assert_eq!(entry.seen, 2);
        assert_eq!(entry.pic_cache, None);
        assert_eq!(cells.get(CellRef::Table(3)), Some(id));
        assert_eq!(cells.get(CellRef::Log), None);
    }

    #[test]
    fn output_buffer_rolls_back_to_recorded_length() {
        let mut vfs = Vfs::new("");
        let mut cells = CellTable::new();
        let mut journal = Journal::new();
        let id = vfs.lookup_or_create("main.xdv");

        {
            let saved = vfs.saved_mut(&mut journal, id);
            saved.data = Some(b"page one".to_vec());
            saved.level = AccessLevel::Write;
        }
        let mark = journal.snapshot();
        vfs.saved_mut(&mut journal, id)
            .data
            .as_mut()
            .unwrap()
            .extend_from_slice(b" page two");

        journal.rollback(mark, &mut vfs, &mut cells);
        assert_eq!(vfs.entry(id).saved.data.as_deref(), Some(&b"page one"[..]));
        assert_eq!(vfs.entry(id).saved.level, AccessLevel::Write);
    }

    #[test]
    fn hot_fields_record_once_per_generation() {
        let mut vfs = Vfs::new("");
        let mut journal = Journal::new();
        let id = vfs.lookup_or_create("a.tex");

        vfs.set_seen(&mut journal, id, 1);
        vfs.set_seen(&mut journal, id, 2);
        vfs.set_seen(&mut journal, id, 3);
        assert_eq!(journal.len(), 1);

        journal.snapshot();
        vfs.set_seen(&mut journal, id, 4);
        vfs.set_seen(&mut journal, id, 5);
        assert_eq!(journal.len(), 2);
    }

    #[test]
    fn nested_marks_unwind_in_order() {
        let mut vfs = Vfs::new("");
        let mut cells = CellTable::new();
        let mut journal = Journal::new();
        let id = vfs.lookup_or_create("a.tex");

        let outer = journal.snapshot();
        vfs.set_seen(&mut journal, id, 10);
        let inner = journal.snapshot();
        vfs.set_seen(&mut journal, id, 20);

        journal.rollback(inner, &mut vfs, &mut cells);
        assert_eq!(vfs.entry(id).seen, 10);
        journal.rollback(outer, &mut vfs, &mut cells);
        assert_eq!(vfs.entry(id).seen, SEEN_NEVER);
    }
}
