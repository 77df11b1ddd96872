// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Hand the engine its resource-bundle descriptors.
// Author: Lukas Bower

//! Resource bundle plumbing.
//!
//! The engine fetches fonts and format files over a three-descriptor
//! protocol (request pipe, response pipe, lock file) that this crate never
//! interprets; it only wires the descriptors up and encodes them in the
//! `texpresso-bundle://` URL passed on the engine command line. When no
//! fetcher command is configured, the engine's own bundle URL (typically
//! https) is passed through untouched.

use std::fs::OpenOptions;
use std::os::fd::{FromRawFd, IntoRawFd};
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use log::info;

/// A running bundle fetcher and the engine-visible URL for it.
pub struct BundleServer {
    url: String,
    pid: i32,
}

impl BundleServer {
    /// Spawn `command` (via the shell) as the bundle fetcher. The fetcher
    /// reads requests on its stdin and writes responses on its stdout;
    /// the engine gets the opposite pipe ends plus a lock file under
    /// `cache_dir`.
    pub fn start(command: &str, cache_dir: &Path) -> Result<Self> {
        let (request_read, request_write) = plain_pipe()?;
        let (response_read, response_write) = plain_pipe()?;

        std::fs::create_dir_all(cache_dir)
            .with_context(|| format!("creating bundle cache {}", cache_dir.display()))?;
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(cache_dir.join("bundle.lock"))
            .context("opening bundle lock file")?;
        let lock_fd = lock.into_raw_fd();
        clear_cloexec(lock_fd);

        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .stdin(unsafe { Stdio::from_raw_fd(request_read) })
            .stdout(unsafe { Stdio::from_raw_fd(response_write) })
            .spawn()
            .with_context(|| format!("launching bundle fetcher {command:?}"))?;
        let pid = child.id() as i32;
        drop(child);
        info!("bundle fetcher pid {pid}: {command}");

        // The engine reads responses and writes requests.
        clear_cloexec(response_read);
        clear_cloexec(request_write);
        let url = format!("texpresso-bundle://{response_read},{request_write},{lock_fd}");
        Ok(Self { url, pid })
    }

    /// Engine-visible bundle URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetcher process id.
    #[must_use]
    pub fn pid(&self) -> i32 {
        self.pid
    }
}

impl Drop for BundleServer {
    fn drop(&mut self) {
        unsafe { libc::kill(self.pid, libc::SIGTERM) };
    }
}

fn plain_pipe() -> Result<(i32, i32)> {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("pipe for bundle fetcher");
    }
    Ok((fds[0], fds[1]))
}

fn clear_cloexec(fd: i32) {
    unsafe { libc::fcntl(fd, libc::F_SETFD, 0) };
}
