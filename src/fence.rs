// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Plan read-position fences that force snapshot forks near an edit.
// Author: Lukas Bower

//! Fence planning.
//!
//! After an edit invalidates part of the trace, the engine re-runs from an
//! older snapshot and will read the changed region again. Fences are read
//! barriers placed just before the invalidated byte and at geometrically
//! spaced earlier times; the first read that crosses one is answered with a
//! fork order instead of data, so the re-run leaves behind cheap re-entry
//! points in case the next edit lands nearby.

use log::info;

use crate::fleet::Fleet;
use crate::trace::Trace;
use crate::vfs::{AccessLevel, EntryId, Vfs, SEEN_MISSING, SEEN_NEVER};

/// Upper bound on pending fences.
pub const MAX_FENCES: usize = 16;

/// A read barrier: the first read of `entry` reaching `position` forks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fence {
    /// Guarded entry.
    pub entry: EntryId,
    /// Byte position of the barrier.
    pub position: usize,
}

/// Tuning constants for fence placement. The values are hand-tuned; only
/// the structure (an aligned barrier plus a doubling backoff walk) is
/// semantic.
#[derive(Debug, Clone, Copy)]
pub struct FencePolicy {
    /// Alignment of the barrier placed before the edited byte.
    pub alignment: usize,
    /// Gap between the invalidated record and the first backoff probe.
    pub probe_gap_ms: u32,
    /// Initial spacing of the backoff walk; doubles per fence.
    pub initial_backoff_ms: u32,
}

impl Default for FencePolicy {
    fn default() -> Self {
        Self {
            alignment: 64,
            probe_gap_ms: 10,
            initial_backoff_ms: 50,
        }
    }
}

/// Result of planning: fences in placement order (the last is tripped
/// first) and the trace length to rewind to.
#[derive(Debug, Default)]
pub struct FencePlan {
    /// Planned fences; treated as a stack by the driver.
    pub fences: Vec<Fence>,
    /// Target trace length for the snapshot rollback.
    pub target: usize,
}

/// True when a trace record can host a fence: a finite read position in a
/// file the engine only reads.
fn possible_fence(vfs: &Vfs, entry: EntryId, seen: i32) -> bool {
    if seen == SEEN_MISSING || seen == SEEN_NEVER {
        return false;
    }
    vfs.entry(entry).saved.level <= AccessLevel::Read
}

/// Plan fences for an edit that invalidated trace index `reverted` at byte
/// `offset` (−1 when unknown) of the record's entry.
#[must_use]
pub fn plan(
    policy: &FencePolicy,
    trace: &Trace,
    vfs: &Vfs,
    fleet: &Fleet,
    reverted: usize,
    offset: i64,
) -> FencePlan {
    let mut plan = FencePlan {
        fences: Vec::new(),
        target: reverted,
    };
    if reverted == 0 {
        return plan;
    }
    assert!(
        trace.len() > reverted,
        "invalidated index {} is not inside the trace ({} records)",
        reverted,
        trace.len()
    );

    let first = trace.get(reverted);
    let align = policy.alignment.max(1) as i64;
    let mut barrier = (offset - align) & !(align - 1);
    if barrier < i64::from(first.seen) {
        barrier = i64::from(first.seen);
    }
    if barrier < 0 {
        barrier = 0;
    }
    plan.fences.push(Fence {
        entry: first.entry,
        position: barrier as usize,
    });
    info!(
        "fence 0 at trace position {}, file {}, offset {}",
        reverted,
        vfs.entry(first.entry).path(),
        barrier
    );

    // Rewind at most to the newest snapshot at or before the edit.
    let floor = fleet
        .records()
        .iter()
        .rev()
        .map(|p| p.trace_len)
        .find(|&len| len <= reverted);

    let mut time = first.time_ms.saturating_sub(policy.probe_gap_ms);
    let mut delta = policy.initial_backoff_ms;
    let mut index = reverted;
    loop {
        let done = match floor {
            Some(len) => index <= len,
            None => false,
        };
        if done || plan.fences.len() >= MAX_FENCES {
            break;
        }
        let record = trace.get(index);
        if record.time_ms <= time && possible_fence(vfs, record.entry, record.seen) {
            plan.fences.push(Fence {
                entry: record.entry,
                position: record.seen.max(0) as usize,
            });
            info!(
                "fence {} at trace position {}, file {}, offset {}",
                plan.fences.len() - 1,
                index,
                vfs.entry(record.entry).path(),
                record.seen.max(0)
            );
            time = time.saturating_sub(delta);
            delta *= 2;
        }
        if index == 0 {
            break;
        }
        index -= 1;
    }

    plan.target = index;
    plan
}
