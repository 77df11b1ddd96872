// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Launch the sandboxed TeX engine with its driver socket attached.
// Author: Lukas Bower

//! Engine process launcher.
//!
//! The engine child gets one end of a `socketpair` and finds its descriptor
//! number in the `TEXPRESSO_FD` environment variable. Its stdout is folded
//! onto stderr so the typeset job's console output cannot corrupt the
//! editor pipe on our stdout.

use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use log::info;

/// Environment variable carrying the engine-side socket number.
pub const ENGINE_FD_VAR: &str = "TEXPRESSO_FD";

/// How to launch the engine binary.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine executable (a tectonic with the texpresso backend).
    pub program: String,
    /// URL of the resource bundle the engine should fetch from.
    pub bundle_url: String,
}

impl EngineConfig {
    fn argv(&self, primary: &str) -> Vec<String> {
        vec![
            "-X".into(),
            "texpresso".into(),
            "--bundle".into(),
            self.bundle_url.clone(),
            "--untrusted".into(),
            "--synctex".into(),
            "--outfmt".into(),
            "xdv".into(),
            "-Z".into(),
            "continue-on-errors".into(),
            primary.into(),
        ]
    }
}

/// Launch the engine on `primary`. Returns the child pid and the driver
/// side of the socket.
pub fn launch(config: &EngineConfig, primary: &str) -> Result<(i32, UnixStream)> {
    let (driver_fd, engine_fd) = inheritable_socketpair()?;

    let child = Command::new(&config.program)
        .args(config.argv(primary))
        .env(ENGINE_FD_VAR, engine_fd.to_string())
        .stdout(stderr_stdio()?)
        .spawn()
        .with_context(|| format!("launching engine {}", config.program))?;

    // Our copy of the engine side must close so end-of-stream propagates
    // when the engine dies.
    unsafe { libc::close(engine_fd) };

    let pid = child.id() as i32;
    info!("launched engine pid {} ({})", pid, config.program);
    drop(child);
    Ok((pid, driver_fd.into()))
}

/// `socketpair` whose engine end stays open across exec.
fn inheritable_socketpair() -> Result<(OwnedFd, i32)> {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("socketpair for engine");
    }
    let driver = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    // Keep close-on-exec off the engine end; the child must inherit it.
    // The driver end is ours alone.
    unsafe { libc::fcntl(fds[0], libc::F_SETFD, libc::FD_CLOEXEC) };
    Ok((driver, fds[1]))
}

fn stderr_stdio() -> Result<Stdio> {
    let duped = unsafe { libc::dup(libc::STDERR_FILENO) };
    if duped < 0 {
        return Err(std::io::Error::last_os_error()).context("dup stderr for engine stdout");
    }
    Ok(unsafe { Stdio::from_raw_fd(duped) })
}

/// Ignore `SIGCHLD` so terminated snapshots never turn into zombies; the
/// driver reaps by kill + close and never waits.
pub fn ignore_sigchld() {
    unsafe {
        libc::signal(libc::SIGCHLD, libc::SIG_IGN);
    }
}
