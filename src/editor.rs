// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Decode editor commands and emit driver messages on the editor pipe.
// Author: Lukas Bower

//! Editor pipe: inbound commands and outbound messages.
//!
//! The editor talks line-delimited s-expressions on our stdin and reads
//! `(append …)` / `(truncate …)` messages from our stdout. Malformed
//! commands are reported and skipped; a broken editor must not take the
//! typesetting session down with it.

use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use log::warn;

use crate::preview::{EditorFeed, OutputStream, SyncPosition};
use crate::sexp::{self, Value};

/// One decoded editor command.
#[derive(Debug, Clone, PartialEq)]
pub enum EditorCommand {
    /// `(open "path" "contents")` — install a full overlay.
    Open {
        /// Logical path of the buffer.
        path: String,
        /// Entire buffer contents.
        contents: String,
    },
    /// `(close "path")` — drop the overlay, back to the on-disk file.
    Close {
        /// Logical path of the buffer.
        path: String,
    },
    /// `(change "path" offset length "text")` — byte-level splice.
    Change {
        /// Logical path of the buffer.
        path: String,
        /// Byte offset of the splice.
        offset: usize,
        /// Bytes removed at the offset.
        remove: usize,
        /// Replacement text.
        insert: String,
    },
    /// `(change-lines "path" line count "text")` — line-level splice,
    /// 1-based first line.
    ChangeLines {
        /// Logical path of the buffer.
        path: String,
        /// First replaced line, 1-based.
        line: usize,
        /// Number of replaced lines.
        count: usize,
        /// Replacement text.
        insert: String,
    },
    /// `(theme (r g b) (r g b))` — background and foreground colors.
    Theme {
        /// Background color.
        bg: [f32; 3],
        /// Foreground color.
        fg: [f32; 3],
    },
    /// `(rescan)` — re-check tracked files against the disk.
    Rescan,
    /// `(synctex-forward "path" line)` — request a forward sync.
    SynctexForward {
        /// Source path.
        path: String,
        /// Source line.
        line: usize,
    },
}

/// Decode one command line.
pub fn parse_command(line: &str) -> Result<EditorCommand> {
    let value = sexp::parse(line)?;
    let Value::List(items) = value else {
        bail!("editor command must be a list: {line:?}");
    };
    let name = items
        .first()
        .and_then(Value::as_atom)
        .with_context(|| format!("editor command without a name: {line:?}"))?;
    let args = &items[1..];
    match name {
        "open" => Ok(EditorCommand::Open {
            path: string_arg(args, 0)?,
            contents: string_arg(args, 1)?,
        }),
        "close" => Ok(EditorCommand::Close {
            path: string_arg(args, 0)?,
        }),
        "change" => Ok(EditorCommand::Change {
            path: string_arg(args, 0)?,
            offset: int_arg(args, 1)?,
            remove: int_arg(args, 2)?,
            insert: string_arg(args, 3)?,
        }),
        "change-lines" => Ok(EditorCommand::ChangeLines {
            path: string_arg(args, 0)?,
            line: int_arg(args, 1)?,
            count: int_arg(args, 2)?,
            insert: string_arg(args, 3)?,
        }),
        "theme" => Ok(EditorCommand::Theme {
            bg: color_arg(args, 0)?,
            fg: color_arg(args, 1)?,
        }),
        "rescan" => Ok(EditorCommand::Rescan),
        "synctex-forward" => Ok(EditorCommand::SynctexForward {
            path: string_arg(args, 0)?,
            line: int_arg(args, 1)?,
        }),
        other => bail!("unknown editor command {other:?}"),
    }
}

fn string_arg(args: &[Value], index: usize) -> Result<String> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .with_context(|| format!("argument {index} must be a string"))
}

fn int_arg(args: &[Value], index: usize) -> Result<usize> {
    let n = args
        .get(index)
        .and_then(Value::as_int)
        .with_context(|| format!("argument {index} must be an integer"))?;
    usize::try_from(n).with_context(|| format!("argument {index} must not be negative"))
}

fn color_arg(args: &[Value], index: usize) -> Result<[f32; 3]> {
    let Some(Value::List(parts)) = args.get(index) else {
        bail!("argument {index} must be a color triple");
    };
    if parts.len() != 3 {
        bail!("argument {index} must have three components");
    }
    let mut color = [0.0; 3];
    for (slot, part) in color.iter_mut().zip(parts) {
        *slot = part
            .as_float()
            .with_context(|| format!("argument {index} has a non-numeric component"))?
            as f32;
    }
    Ok(color)
}

/// Nonblocking line reader over the editor's end of our stdin.
pub struct EditorPipe {
    buf: Vec<u8>,
    closed: bool,
}

impl EditorPipe {
    /// Wrap stdin.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            closed: false,
        }
    }

    /// True once the editor hung up and every buffered line was consumed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed && !self.buf.contains(&b'\n')
    }

    /// Return the next complete line, waiting at most `timeout_ms`.
    pub fn poll_line(&mut self, timeout_ms: i32) -> Result<Option<String>> {
        loop {
            if let Some(nl) = self.buf.iter().position(|&b| b == b'\n') {
                let rest = self.buf.split_off(nl + 1);
                let mut line = std::mem::replace(&mut self.buf, rest);
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                let line = String::from_utf8(line).context("editor sent non-utf8 line")?;
                return Ok(Some(line));
            }
            if self.closed || !readable(libc::STDIN_FILENO, timeout_ms)? {
                return Ok(None);
            }
            let mut chunk = [0u8; 4096];
            let n = unsafe { libc::read(libc::STDIN_FILENO, chunk.as_mut_ptr().cast(), chunk.len()) };
            match n {
                0 => self.closed = true,
                n if n < 0 => {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::EINTR) {
                        return Err(err).context("read from editor pipe");
                    }
                }
                n => self.buf.extend_from_slice(&chunk[..n as usize]),
            }
        }
    }
}

impl Default for EditorPipe {
    fn default() -> Self {
        Self::new()
    }
}

fn readable(fd: i32, timeout_ms: i32) -> Result<bool> {
    loop {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if n >= 0 {
            return Ok(n > 0);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err).context("poll on editor pipe");
        }
    }
}

/// Editor feed that emits `(append …)` / `(truncate …)` lines on stdout.
/// Every line is flushed immediately; the editor reacts to single
/// messages, not batches.
#[derive(Debug, Default)]
pub struct SexpFeed;

impl SexpFeed {
    /// Create a feed over stdout.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn emit(&mut self, line: &str) {
        let stdout = io::stdout();
        let mut lock = stdout.lock();
        if writeln!(lock, "{line}").and_then(|()| lock.flush()).is_err() {
            warn!("editor pipe is gone, dropping message");
        }
    }
}

impl EditorFeed for SexpFeed {
    fn append(&mut self, stream: OutputStream, tail: &[u8]) {
        if tail.is_empty() {
            return;
        }
        let mut line = format!("(append {} ", stream.name());
        sexp::write_string(&mut line, tail);
        line.push(')');
        self.emit(&line);
    }

    fn truncate(&mut self, stream: OutputStream, len: usize) {
        self.emit(&format!("(truncate {} {len})", stream.name()));
    }

    fn synctex(&mut self, position: SyncPosition) {
        self.emit(&format!(
            "(synctex {} {} {})",
            position.page, position.x, position.y
        ));
    }

    fn flush(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_the_core_commands() {
        assert_eq!(
            parse_command(r#"(open "a.tex" "contents")"#).unwrap(),
            EditorCommand::Open {
                path: "a.tex".into(),
                contents: "contents".into(),
            }
        );
        assert_eq!(
            parse_command(r#"(change-lines "a.tex" 4 1 "Edited")"#).unwrap(),
            EditorCommand::ChangeLines {
                path: "a.tex".into(),
                line: 4,
                count: 1,
                insert: "Edited".into(),
            }
        );
        assert_eq!(parse_command("(rescan)").unwrap(), EditorCommand::Rescan);
    }

    #[test]
    fn decodes_theme_colors() {
        let EditorCommand::Theme { bg, fg } =
            parse_command("(theme (0.0 0.5 1.0) (1 1 1))").unwrap()
        else {
            panic!("expected a theme command");
        };
        assert_eq!(bg, [0.0, 0.5, 1.0]);
        assert_eq!(fg, [1.0, 1.0, 1.0]);
    }

    #[test]
    fn rejects_bad_commands() {
        assert!(parse_command("(open)").is_err());
        assert!(parse_command("(change \"a\" -4 0 \"x\")").is_err());
        assert!(parse_command("(warp 9)").is_err());
        assert!(parse_command("open").is_err());
    }
}
