// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Track the bounded fleet of checkpointed engine processes.
// Author: Lukas Bower

//! Snapshot fleet.
//!
//! Every live engine process is a rewindable checkpoint: the root (index 0)
//! was launched by exec, every later one is a fork of its predecessor taken
//! mid-run. A record pairs the OS process with the trace prefix it had
//! observed and the journal mark taken at fork time; rewinding to a
//! snapshot means popping newer processes, reverting the trace to its
//! prefix and rolling the journal back to its mark.

use std::os::unix::net::UnixStream;

use log::info;

use crate::journal::Mark;

/// Ceiling on simultaneously live engine processes.
pub const MAX_PROCESSES: usize = 32;

/// How many of the newest snapshots decimation always keeps.
const DECIMATE_KEEP_RECENT: usize = 8;

/// One live checkpointed engine process.
#[derive(Debug)]
pub struct ProcessRecord {
    /// OS process id.
    pub pid: i32,
    /// Connected socket, `None` once the process died or was killed.
    pub stream: Option<UnixStream>,
    /// Trace prefix length observed when this process became a checkpoint.
    pub trace_len: usize,
    /// Journal savepoint taken at fork time (restart mark for the root).
    pub mark: Mark,
}

impl ProcessRecord {
    /// Send `SIGTERM` and drop the socket. Safe to call twice.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            info!("terminating engine pid {}", self.pid);
            unsafe { libc::kill(self.pid, libc::SIGTERM) };
            drop(stream);
        }
    }
}

impl Drop for ProcessRecord {
    fn drop(&mut self) {
        self.close();
    }
}

/// Ordered list of live checkpoints, root first.
#[derive(Debug, Default)]
pub struct Fleet {
    processes: Vec<ProcessRecord>,
}

impl Fleet {
    /// Create an empty fleet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live checkpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    /// True when no engine is running; the job is terminated until a
    /// restart.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// True when another fork would overflow the fleet.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.processes.len() >= MAX_PROCESSES
    }

    /// All records, root first.
    #[must_use]
    pub fn records(&self) -> &[ProcessRecord] {
        &self.processes
    }

    /// The newest checkpoint, which is the running engine.
    ///
    /// Panics on an empty fleet; callers must check
    /// [`Fleet::is_empty`] first.
    #[must_use]
    pub fn head(&self) -> &ProcessRecord {
        self.processes.last().expect("fleet is empty")
    }

    /// Mutable access to the newest checkpoint.
    pub fn head_mut(&mut self) -> &mut ProcessRecord {
        self.processes.last_mut().expect("fleet is empty")
    }

    /// Push a new head. The caller is responsible for the trace-prefix
    /// ordering invariant.
    pub fn push(&mut self, record: ProcessRecord) {
        debug_assert!(self.processes.len() < MAX_PROCESSES);
        debug_assert!(
            self.processes
                .last()
                .is_none_or(|head| head.trace_len <= record.trace_len),
            "snapshot trace prefixes must not decrease"
        );
        self.processes.push(record);
    }

    /// Remove and return the newest checkpoint.
    pub fn pop(&mut self) -> Option<ProcessRecord> {
        self.processes.pop()
    }

    /// True when the head's trace position is also the previous
    /// checkpoint's prefix, i.e. the last trace record belongs to a
    /// snapshot boundary and must not be coalesced away.
    #[must_use]
    pub fn at_snapshot_boundary(&self, trace_len: usize) -> bool {
        let n = self.processes.len();
        n >= 2 && self.processes[n - 2].trace_len == trace_len
    }

    /// Halve the older part of the fleet to make room for new snapshots:
    /// the newest [`DECIMATE_KEEP_RECENT`] survive, and of the rest every
    /// second checkpoint (counting from the root, which always survives)
    /// is kept. Evicted processes are terminated.
    pub fn decimate(&mut self) {
        self.log_fleet("before decimation");
        let older = self.processes.len().saturating_sub(DECIMATE_KEEP_RECENT);
        let mut index = 0;
        self.processes.retain_mut(|record| {
            let keep = index >= older || index % 2 == 0;
            index += 1;
            if !keep {
                record.close();
            }
            keep
        });
        self.log_fleet("after decimation");
    }

    /// Terminate every process and empty the fleet.
    pub fn kill_all(&mut self) {
        for record in &mut self.processes {
            record.close();
        }
        self.processes.clear();
    }

    fn log_fleet(&self, label: &str) {
        info!("{label}:");
        for record in &self.processes {
            info!(
                "- trace position {} [pid {}]",
                record.trace_len, record.pid
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;

    fn record(pid: i32, trace_len: usize, mark: Mark) -> ProcessRecord {
        ProcessRecord {
            pid,
            stream: None,
            trace_len,
            mark,
        }
    }

    #[test]
    fn decimation_keeps_root_order_and_recent() {
        let mark = Journal::new().snapshot();
        let mut fleet = Fleet::new();
        for i in 0..MAX_PROCESSES {
            fleet.push(record(1000 + i as i32, i, mark));
        }
        fleet.decimate();

        assert_eq!(fleet.len(), 20);
        assert_eq!(fleet.records()[0].pid, 1000, "root must survive");
        let positions: Vec<usize> = fleet.records().iter().map(|p| p.trace_len).collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted, "ordering must be preserved");
        // The newest eight are untouched.
        assert_eq!(
            &positions[positions.len() - 8..],
            &[24, 25, 26, 27, 28, 29, 30, 31][..]
        );
    }

    #[test]
    fn boundary_detection_matches_previous_prefix() {
        let mark = Journal::new().snapshot();
        let mut fleet = Fleet::new();
        fleet.push(record(1, 0, mark));
        fleet.push(record(2, 5, mark));
        assert!(fleet.at_snapshot_boundary(5));
        assert!(!fleet.at_snapshot_boundary(7));
    }
}
