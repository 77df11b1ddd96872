// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: End-to-end driver scenarios against a scripted engine.
// Author: Lukas Bower

//! Drive the full request loop with a scripted engine on a real
//! socketpair: handshake, reads, snapshots via FORK/CHLD, fences, edit
//! rollbacks and restarts. The engine side runs in the test itself;
//! socket buffering keeps the lockstep deterministic without threads.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Child, Command};
use std::rc::Rc;

use serial_test::serial;
use tempfile::TempDir;
use texwind::driver::{Driver, DriverConfig, JobStatus};
use texwind::fence::FencePolicy;
use texwind::preview::{DocumentDecoder, EditorFeed, OutputStream, SyncPosition, SynctexDecoder};
use texwind::spawn::EngineConfig;
use texwind_wire::{
    decode_control, decode_reply, encode_request, Control, PicCache, Reply, Request, RequestBody,
    HANDSHAKE_CLIENT, HANDSHAKE_SERVER,
};

const PRIMARY: &str = "a.tex";
const CONTENT: &[u8] =
    b"\\documentclass[12pt]{article}\n\n\\begin{document}\nVirtual file content\n\n\\end{document}\n";
/// Byte offset of line 4 ("Virtual file content").
const LINE4: usize = 48;

/// XDV page marker recognized by the recording decoder below.
const BOP: u8 = 0x8B;

// ---------------------------------------------------------------------
// Recording collaborators

#[derive(Default)]
struct DocState {
    data: Vec<u8>,
    resets: usize,
    updates: usize,
}

#[derive(Clone, Default)]
struct RecordingDoc(Rc<RefCell<DocState>>);

impl DocumentDecoder for RecordingDoc {
    fn reset(&mut self) {
        let mut state = self.0.borrow_mut();
        state.data.clear();
        state.resets += 1;
    }

    fn update(&mut self, data: &[u8]) {
        let mut state = self.0.borrow_mut();
        state.data = data.to_vec();
        state.updates += 1;
    }

    fn page_count(&self) -> usize {
        self.0.borrow().data.iter().filter(|&&b| b == BOP).count()
    }

    fn output_started(&self) -> bool {
        !self.0.borrow().data.is_empty()
    }
}

#[derive(Clone, Default)]
struct RecordingSynctex(Rc<RefCell<Vec<u8>>>);

impl SynctexDecoder for RecordingSynctex {
    fn update(&mut self, data: &[u8]) {
        *self.0.borrow_mut() = data.to_vec();
    }

    fn rollback(&mut self, len: usize) {
        self.0.borrow_mut().truncate(len);
    }

    fn page_count(&self) -> usize {
        0
    }

    fn forward(&mut self, path: &str, _line: usize) -> Option<SyncPosition> {
        (path == PRIMARY).then_some(SyncPosition {
            page: 1,
            x: 72.0,
            y: 144.0,
        })
    }
}

#[derive(Default)]
struct FeedState {
    out: Vec<u8>,
    log: Vec<u8>,
    sync: Vec<SyncPosition>,
    truncates: usize,
}

#[derive(Clone, Default)]
struct RecordingFeed(Rc<RefCell<FeedState>>);

impl EditorFeed for RecordingFeed {
    fn append(&mut self, stream: OutputStream, tail: &[u8]) {
        let mut state = self.0.borrow_mut();
        match stream {
            OutputStream::Out => state.out.extend_from_slice(tail),
            OutputStream::Log => state.log.extend_from_slice(tail),
        }
    }

    fn truncate(&mut self, stream: OutputStream, len: usize) {
        let mut state = self.0.borrow_mut();
        match stream {
            OutputStream::Out => state.out.truncate(len),
            OutputStream::Log => state.log.truncate(len),
        }
        state.truncates += 1;
    }

    fn synctex(&mut self, position: SyncPosition) {
        self.0.borrow_mut().sync.push(position);
    }

    fn flush(&mut self) {}
}

// ---------------------------------------------------------------------
// Scripted engine

struct ScriptEngine {
    stream: UnixStream,
    rx: Vec<u8>,
    clock: u32,
}

impl ScriptEngine {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            rx: Vec::new(),
            clock: 0,
        }
    }

    fn preload_handshake(&mut self) {
        self.stream.write_all(HANDSHAKE_CLIENT).unwrap();
    }

    fn expect_greeting(&mut self) {
        let mut greeting = [0u8; 12];
        self.stream.read_exact(&mut greeting).unwrap();
        assert_eq!(&greeting, HANDSHAKE_SERVER);
    }

    fn send(&mut self, body: RequestBody) {
        let frame = encode_request(&Request {
            time_ms: self.clock,
            body,
        });
        self.stream.write_all(&frame).unwrap();
    }

    /// Send `CHLD` with the child's driver-side socket attached.
    fn send_child(&mut self, pid: u32, fd: RawFd) {
        let frame = encode_request(&Request {
            time_ms: self.clock,
            body: RequestBody::Child { pid },
        });
        let mut cmsg_space = [0u64; 8];
        let mut iov = libc::iovec {
            iov_base: frame.as_ptr() as *mut libc::c_void,
            iov_len: frame.len(),
        };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_space.as_mut_ptr().cast();
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(4) } as usize;
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(4) as usize;
            *(libc::CMSG_DATA(cmsg) as *mut i32) = fd;
        }
        let sent = unsafe { libc::sendmsg(self.stream.as_raw_fd(), &msg, 0) };
        assert_eq!(sent as usize, frame.len());
    }

    fn reply(&mut self) -> Reply {
        loop {
            if let Some((reply, used)) = decode_reply(&self.rx).unwrap() {
                self.rx.drain(..used);
                return reply;
            }
            self.fill();
        }
    }

    fn control(&mut self) -> Control {
        loop {
            if let Some((control, used)) = decode_control(&self.rx).unwrap() {
                self.rx.drain(..used);
                return control;
            }
            self.fill();
        }
    }

    fn fill(&mut self) {
        let mut chunk = [0u8; 4096];
        let n = self.stream.read(&mut chunk).unwrap();
        assert!(n > 0, "driver hung up unexpectedly");
        self.rx.extend_from_slice(&chunk[..n]);
    }
}

// ---------------------------------------------------------------------
// Harness

fn decoy() -> Child {
    Command::new("sleep").arg("60").spawn().expect("spawn sleep")
}

fn new_driver(
    tmp: &Path,
    doc: RecordingDoc,
    synctex: RecordingSynctex,
    feed: RecordingFeed,
) -> Driver {
    let config = DriverConfig {
        engine: EngineConfig {
            program: "/bin/false".into(),
            bundle_url: "texpresso-bundle://0,0,0".into(),
        },
        primary: PRIMARY.into(),
        inclusion_path: tmp.display().to_string(),
        snapshot_interval_ms: 500,
        fence_policy: FencePolicy::default(),
    };
    Driver::new(config, Box::new(doc), Box::new(synctex), Box::new(feed))
}

fn attach(driver: &mut Driver) -> (ScriptEngine, Child) {
    let (ours, theirs) = UnixStream::pair().unwrap();
    let child = decoy();
    let mut engine = ScriptEngine::new(theirs);
    engine.preload_handshake();
    driver.attach_engine(child.id() as i32, ours).unwrap();
    engine.expect_greeting();
    (engine, child)
}

fn step(driver: &mut Driver) {
    assert!(driver.step(false).unwrap(), "expected a request to handle");
}

fn open_primary(driver: &mut Driver) {
    driver.begin_changes().unwrap();
    driver.open_overlay(PRIMARY, CONTENT.to_vec()).unwrap();
    assert!(!driver.end_changes().unwrap());
}

/// Run the common opening: engine opens and reads the primary, then
/// opens the document output and writes one page.
fn typeset_first_page(driver: &mut Driver, engine: &mut ScriptEngine) {
    engine.clock = 5;
    engine.send(RequestBody::Open {
        fid: 0,
        path: PRIMARY.into(),
        mode: "r".into(),
    });
    step(driver);
    assert_eq!(engine.reply(), Reply::Open(PRIMARY.as_bytes().to_vec()));

    engine.send(RequestBody::Read {
        fid: 0,
        pos: 0,
        size: 4096,
    });
    step(driver);
    assert_eq!(engine.reply(), Reply::Read(CONTENT.to_vec()));

    engine.clock = 10;
    engine.send(RequestBody::Seen { fid: 0, pos: 40 });
    step(driver);

    engine.clock = 20;
    engine.send(RequestBody::Open {
        fid: 1,
        path: "main.xdv".into(),
        mode: "wb".into(),
    });
    step(driver);
    assert_eq!(engine.reply(), Reply::Open(b"main.xdv".to_vec()));

    engine.clock = 30;
    engine.send(RequestBody::Write {
        fid: 1,
        pos: 0,
        data: page_one().to_vec(),
    });
    step(driver);
    assert_eq!(engine.reply(), Reply::Done);
}

fn page_one() -> Vec<u8> {
    let mut page = vec![BOP];
    page.extend_from_slice(b"page-one");
    page
}

fn page_two() -> Vec<u8> {
    let mut page = vec![BOP];
    page.extend_from_slice(b"page-two");
    page
}

/// Fork a snapshot: a read past the interval gets FORK, the engine
/// answers CHLD with a fresh socket, and the child becomes the head.
fn fork_snapshot(driver: &mut Driver, engine: &mut ScriptEngine, clock: u32) -> (ScriptEngine, Child) {
    engine.clock = clock;
    engine.send(RequestBody::Read {
        fid: 0,
        pos: 45,
        size: 4,
    });
    step(driver);
    assert_eq!(engine.reply(), Reply::Fork);

    let (child_driver_end, child_engine_end) = UnixStream::pair().unwrap();
    let child = decoy();
    engine.send_child(child.id(), child_driver_end.as_raw_fd());
    step(driver);
    assert_eq!(engine.reply(), Reply::Done);
    drop(child_driver_end);

    let mut child_engine = ScriptEngine::new(child_engine_end);
    child_engine.clock = clock + 1;
    // The child re-issues the read the fork interrupted.
    child_engine.send(RequestBody::Read {
        fid: 0,
        pos: 45,
        size: 4,
    });
    step(driver);
    assert_eq!(child_engine.reply(), Reply::Read(CONTENT[45..49].to_vec()));
    (child_engine, child)
}

// ---------------------------------------------------------------------
// Scenarios

#[test]
#[serial]
fn fresh_run_produces_one_page_and_forks_after_the_interval() {
    let tmp = TempDir::new().unwrap();
    let doc = RecordingDoc::default();
    let mut driver = new_driver(
        tmp.path(),
        doc.clone(),
        RecordingSynctex::default(),
        RecordingFeed::default(),
    );
    open_primary(&mut driver);
    let (mut engine, _root) = attach(&mut driver);

    typeset_first_page(&mut driver, &mut engine);
    assert_eq!(driver.fleet().len(), 1, "no fork before the interval");
    assert_eq!(driver.page_count(), 1);
    assert!(doc.output_started());

    let (_child_engine, _child) = fork_snapshot(&mut driver, &mut engine, 700);
    assert_eq!(driver.fleet().len(), 2);
    let positions: Vec<usize> = driver
        .fleet()
        .records()
        .iter()
        .map(|p| p.trace_len)
        .collect();
    let mut sorted = positions.clone();
    sorted.sort_unstable();
    assert_eq!(positions, sorted, "snapshot trace prefixes must increase");
}

#[test]
#[serial]
fn line_edit_rolls_back_to_the_snapshot_and_fences_the_region() {
    let tmp = TempDir::new().unwrap();
    let doc = RecordingDoc::default();
    let mut driver = new_driver(
        tmp.path(),
        doc.clone(),
        RecordingSynctex::default(),
        RecordingFeed::default(),
    );
    open_primary(&mut driver);
    let (mut engine, root) = attach(&mut driver);
    typeset_first_page(&mut driver, &mut engine);

    let (mut child_engine, _child) = fork_snapshot(&mut driver, &mut engine, 600);

    // The child reads past the future edit and emits a second page.
    child_engine.clock = 610;
    child_engine.send(RequestBody::Seen { fid: 0, pos: 80 });
    step(&mut driver);
    child_engine.clock = 620;
    child_engine.send(RequestBody::Write {
        fid: 1,
        pos: page_one().len() as u32,
        data: page_two().to_vec(),
    });
    step(&mut driver);
    assert_eq!(child_engine.reply(), Reply::Done);
    assert_eq!(driver.page_count(), 2);

    // Replace line 4.
    driver.begin_changes().unwrap();
    driver
        .splice_lines(PRIMARY, 4, 1, "Edited virtual file content")
        .unwrap();
    assert!(driver.end_changes().unwrap());

    // The child is gone, the pre-edit snapshot is the head again.
    assert_eq!(driver.fleet().len(), 1);
    assert_eq!(driver.fleet().records()[0].pid, root.id() as i32);
    // The document was replayed from the surviving prefix.
    assert_eq!(driver.page_count(), 1);

    // One fence guards the edited region, 64-aligned below the edit but
    // clamped to the surviving seen position.
    let a = driver.vfs().lookup(PRIMARY).unwrap();
    let fences = driver.fences();
    assert_eq!(fences.len(), 1);
    assert_eq!(fences[0].entry, a);
    assert_eq!(fences[0].position, 40);
    assert!(LINE4 >= fences[0].position);

    // The promoted engine re-reads toward the edit and trips the fence.
    engine.clock = 650;
    engine.send(RequestBody::Read {
        fid: 0,
        pos: 40,
        size: 8,
    });
    step(&mut driver);
    assert_eq!(engine.reply(), Reply::Fork);
    assert!(driver.fences().is_empty(), "tripped fence must pop");
}

#[test]
#[serial]
fn append_at_end_of_file_skips_the_rollback() {
    let tmp = TempDir::new().unwrap();
    let mut driver = new_driver(
        tmp.path(),
        RecordingDoc::default(),
        RecordingSynctex::default(),
        RecordingFeed::default(),
    );
    open_primary(&mut driver);
    let (mut engine, _root) = attach(&mut driver);

    engine.send(RequestBody::Open {
        fid: 0,
        path: PRIMARY.into(),
        mode: "r".into(),
    });
    step(&mut driver);
    assert_eq!(engine.reply(), Reply::Open(PRIMARY.as_bytes().to_vec()));
    engine.send(RequestBody::Seen {
        fid: 0,
        pos: (CONTENT.len() - 1) as u32,
    });
    step(&mut driver);
    let trace_before = driver.trace().len();

    // A request is in flight while the editor appends at the end.
    engine.send(RequestBody::Size { fid: 0 });

    driver.begin_changes().unwrap();
    driver
        .splice(PRIMARY, CONTENT.len(), 0, b"extra paragraph\n")
        .unwrap();
    assert!(!driver.end_changes().unwrap(), "append must not roll back");

    assert_eq!(driver.fleet().len(), 1);
    assert_eq!(driver.trace().len(), trace_before);
    assert!(driver.fences().is_empty());

    // The engine is asked to flush, then resumes and sees the new size.
    assert_eq!(engine.control(), Control::Flush);
    step(&mut driver);
    assert_eq!(
        engine.reply(),
        Reply::Size((CONTENT.len() + b"extra paragraph\n".len()) as u32)
    );
}

#[test]
#[serial]
fn noop_edit_leaves_snapshots_and_trace_alone() {
    let tmp = TempDir::new().unwrap();
    let mut driver = new_driver(
        tmp.path(),
        RecordingDoc::default(),
        RecordingSynctex::default(),
        RecordingFeed::default(),
    );
    open_primary(&mut driver);
    let (mut engine, _root) = attach(&mut driver);
    typeset_first_page(&mut driver, &mut engine);

    let fleet_before = driver.fleet().len();
    let trace_before = driver.trace().len();

    driver.begin_changes().unwrap();
    driver.splice(PRIMARY, 10, 0, b"").unwrap();
    assert!(!driver.end_changes().unwrap());

    assert_eq!(driver.fleet().len(), fleet_before);
    assert_eq!(driver.trace().len(), trace_before);
    assert!(driver.fences().is_empty());
}

#[test]
#[serial]
fn deleted_include_rewinds_to_scratch_and_terminates_for_restart() {
    let tmp = TempDir::new().unwrap();
    let sub = tmp.path().join("sub.tex");
    std::fs::write(&sub, vec![b'x'; 120]).unwrap();

    let mut driver = new_driver(
        tmp.path(),
        RecordingDoc::default(),
        RecordingSynctex::default(),
        RecordingFeed::default(),
    );
    open_primary(&mut driver);
    let (mut engine, _root) = attach(&mut driver);

    engine.clock = 5;
    engine.send(RequestBody::Open {
        fid: 0,
        path: PRIMARY.into(),
        mode: "r".into(),
    });
    step(&mut driver);
    assert_eq!(engine.reply(), Reply::Open(PRIMARY.as_bytes().to_vec()));
    engine.send(RequestBody::Seen { fid: 0, pos: 20 });
    step(&mut driver);

    engine.clock = 15;
    engine.send(RequestBody::Open {
        fid: 2,
        path: "sub.tex".into(),
        mode: "r".into(),
    });
    step(&mut driver);
    assert_eq!(engine.reply(), Reply::Open(b"sub.tex".to_vec()));
    engine.send(RequestBody::Seen { fid: 2, pos: 99 });
    step(&mut driver);

    std::fs::remove_file(&sub).unwrap();

    driver.begin_changes().unwrap();
    driver.detect_changes().unwrap();
    assert!(driver.end_changes().unwrap());

    // Even the root observed the removed file, so everything is gone
    // until a restart re-runs the engine from scratch.
    assert!(driver.fleet().is_empty());
    assert_eq!(driver.status(), JobStatus::Terminated);
    assert_eq!(driver.trace().len(), 0);
    let sub_id = driver.vfs().lookup("sub.tex").unwrap();
    assert!(driver
        .fences()
        .iter()
        .any(|fence| fence.entry == sub_id && fence.position == 0));
}

#[test]
#[serial]
fn picture_cache_answers_exact_queries_only() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("fig.pdf"), b"%PDF-1.7 pretend").unwrap();

    let mut driver = new_driver(
        tmp.path(),
        RecordingDoc::default(),
        RecordingSynctex::default(),
        RecordingFeed::default(),
    );
    open_primary(&mut driver);
    let (mut engine, _root) = attach(&mut driver);

    engine.send(RequestBody::Open {
        fid: 3,
        path: "fig.pdf".into(),
        mode: "r".into(),
    });
    step(&mut driver);
    assert_eq!(engine.reply(), Reply::Open(b"fig.pdf".to_vec()));

    let bounds = [1.0, 2.0, 3.0, 4.0];
    engine.send(RequestBody::Spic {
        path: "fig.pdf".into(),
        cache: PicCache {
            kind: 1,
            page: 2,
            bounds,
        },
    });
    step(&mut driver);
    assert_eq!(engine.reply(), Reply::Done);

    engine.send(RequestBody::Gpic {
        path: "fig.pdf".into(),
        kind: 1,
        page: 2,
    });
    step(&mut driver);
    assert_eq!(engine.reply(), Reply::Gpic(bounds));

    for (kind, page) in [(1, 3), (0, 2)] {
        engine.send(RequestBody::Gpic {
            path: "fig.pdf".into(),
            kind,
            page,
        });
        step(&mut driver);
        assert_eq!(engine.reply(), Reply::Pass);
    }

    engine.send(RequestBody::Gpic {
        path: "other.pdf".into(),
        kind: 1,
        page: 2,
    });
    step(&mut driver);
    assert_eq!(engine.reply(), Reply::Pass);
}

#[test]
#[serial]
fn duplicate_document_output_is_a_protocol_error() {
    let tmp = TempDir::new().unwrap();
    let mut driver = new_driver(
        tmp.path(),
        RecordingDoc::default(),
        RecordingSynctex::default(),
        RecordingFeed::default(),
    );
    open_primary(&mut driver);
    let (mut engine, _root) = attach(&mut driver);

    engine.send(RequestBody::Open {
        fid: 1,
        path: "main.xdv".into(),
        mode: "wb".into(),
    });
    step(&mut driver);
    assert_eq!(engine.reply(), Reply::Open(b"main.xdv".to_vec()));

    engine.send(RequestBody::Open {
        fid: 2,
        path: "other.dvi".into(),
        mode: "wb".into(),
    });
    assert!(driver.step(false).is_err(), "second document must be fatal");
}

#[test]
#[serial]
fn synctex_forward_reports_a_position_to_the_editor() {
    let tmp = TempDir::new().unwrap();
    let feed = RecordingFeed::default();
    let mut driver = new_driver(
        tmp.path(),
        RecordingDoc::default(),
        RecordingSynctex::default(),
        feed.clone(),
    );
    open_primary(&mut driver);

    driver.synctex_forward(PRIMARY, 4);
    // A location the decoder cannot resolve produces no message.
    driver.synctex_forward("unknown.tex", 1);

    assert_eq!(
        feed.0.borrow().sync,
        vec![SyncPosition {
            page: 1,
            x: 72.0,
            y: 144.0,
        }]
    );
}

#[test]
#[serial]
fn decimation_terminates_evicted_engines() {
    texwind::spawn::ignore_sigchld();
    let mut fleet = texwind::fleet::Fleet::new();
    let mut journal = texwind::journal::Journal::new();
    let mut keepers = Vec::new();
    let mut pids = Vec::new();
    for i in 0..32 {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let child = decoy();
        pids.push(child.id() as i32);
        keepers.push((child, theirs));
        fleet.push(texwind::fleet::ProcessRecord {
            pid: pids[i],
            stream: Some(ours),
            trace_len: i,
            mark: journal.snapshot(),
        });
    }

    fleet.decimate();
    assert_eq!(fleet.len(), 20);
    std::thread::sleep(std::time::Duration::from_millis(200));

    let survivors: Vec<i32> = fleet.records().iter().map(|p| p.pid).collect();
    for pid in &pids {
        let alive = unsafe { libc::kill(*pid, 0) } == 0;
        assert_eq!(
            alive,
            survivors.contains(pid),
            "pid {pid} has the wrong fate after decimation"
        );
    }
    fleet.kill_all();
}

#[test]
#[serial]
fn console_output_reaches_the_editor_feed() {
    let tmp = TempDir::new().unwrap();
    let feed = RecordingFeed::default();
    let mut driver = new_driver(
        tmp.path(),
        RecordingDoc::default(),
        RecordingSynctex::default(),
        feed.clone(),
    );
    open_primary(&mut driver);
    let (mut engine, _root) = attach(&mut driver);

    engine.send(RequestBody::Write {
        fid: -1,
        pos: 0,
        data: b"This is TeX\n".to_vec(),
    });
    step(&mut driver);
    assert_eq!(engine.reply(), Reply::Done);
    engine.send(RequestBody::Write {
        fid: -1,
        pos: 0,
        data: b"(a.tex)\n".to_vec(),
    });
    step(&mut driver);
    assert_eq!(engine.reply(), Reply::Done);

    assert_eq!(feed.0.borrow().out, b"This is TeX\n(a.tex)\n");
}
