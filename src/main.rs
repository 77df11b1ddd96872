// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: CLI entry point for the texwind previewer driver.
// Author: Lukas Bower

//! CLI entry point for the texwind previewer driver.
//!
//! Reads editor commands on stdin, writes editor messages on stdout, and
//! drives the TeX engine over its socket in between. All diagnostics go
//! to stderr through `env_logger`.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use texwind::bundle::BundleServer;
use texwind::editor::{self, EditorCommand, EditorPipe, SexpFeed};
use texwind::fence::FencePolicy;
use texwind::preview::{LoggingDocument, LoggingSynctex};
use texwind::{Driver, DriverConfig, EngineConfig, JobStatus};

#[derive(Debug, Parser)]
#[command(author = "Lukas Bower", version, about = "Incremental TeX previewer driver")]
struct Cli {
    /// Primary TeX source file.
    primary: String,

    /// Engine binary (a tectonic build with the texpresso backend).
    #[arg(long, default_value = "tectonic")]
    engine: String,

    /// Colon-joined directories searched for input files.
    #[arg(long, default_value = "")]
    inclusion_path: String,

    /// Bundle URL handed to the engine when no fetcher command is set.
    #[arg(long, default_value = "https://relay.fullyjustified.net/default_bundle.tar")]
    bundle: String,

    /// Shell command serving the bundle protocol on stdin/stdout.
    #[arg(long)]
    bundle_command: Option<String>,

    /// Cache directory for the bundle lock file.
    #[arg(long, default_value = ".texwind")]
    cache_dir: PathBuf,

    /// Minimum engine-clock distance between snapshots, in milliseconds.
    #[arg(long, default_value_t = 500)]
    snapshot_interval_ms: u32,

    /// Alignment of the fence placed just before an edited byte.
    #[arg(long, default_value_t = 64)]
    fence_alignment: usize,

    /// Initial backoff of the fence walk, in milliseconds.
    #[arg(long, default_value_t = 50)]
    fence_backoff_ms: u32,

    /// Append request telemetry to this JSON-lines file.
    #[arg(long, value_name = "FILE")]
    telemetry: Option<PathBuf>,
}

/// Consecutive engine deaths tolerated before giving up.
const MAX_RESTARTS: u32 = 5;

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let bundle_server = match &cli.bundle_command {
        Some(command) => Some(BundleServer::start(command, &cli.cache_dir)?),
        None => None,
    };
    let bundle_url = bundle_server
        .as_ref()
        .map_or(cli.bundle.clone(), |server| server.url().to_owned());

    let config = DriverConfig {
        engine: EngineConfig {
            program: cli.engine.clone(),
            bundle_url,
        },
        primary: cli.primary.clone(),
        inclusion_path: cli.inclusion_path.clone(),
        snapshot_interval_ms: cli.snapshot_interval_ms,
        fence_policy: FencePolicy {
            alignment: cli.fence_alignment,
            initial_backoff_ms: cli.fence_backoff_ms,
            ..FencePolicy::default()
        },
    };

    let mut driver = Driver::new(
        config,
        Box::new(LoggingDocument::default()),
        Box::new(LoggingSynctex::default()),
        Box::new(SexpFeed::new()),
    );
    let telemetry = cli
        .telemetry
        .clone()
        .or_else(|| std::env::var_os("TEXWIND_TRACE").map(PathBuf::from));
    if let Some(path) = &telemetry {
        driver.enable_telemetry(path)?;
    }

    let mut pipe = EditorPipe::new();
    let mut consecutive_deaths = 0u32;

    loop {
        let worked = driver.step(true)?;
        if worked {
            consecutive_deaths = 0;
        } else if driver.status() == JobStatus::Terminated {
            consecutive_deaths += 1;
            if consecutive_deaths > MAX_RESTARTS {
                bail!("engine died {MAX_RESTARTS} times in a row, giving up");
            }
        }

        while let Some(line) = pipe.poll_line(0)? {
            if line.is_empty() {
                continue;
            }
            match editor::parse_command(&line) {
                Ok(command) => apply_command(&mut driver, command)?,
                Err(err) => warn!("ignoring editor command: {err:#}"),
            }
        }
        if pipe.is_closed() {
            info!("editor closed the pipe, shutting down");
            return Ok(());
        }
    }
}

fn apply_command(driver: &mut Driver, command: EditorCommand) -> Result<()> {
    match command {
        EditorCommand::Open { path, contents } => {
            driver.begin_changes()?;
            driver.open_overlay(&path, contents.into_bytes())?;
            finish(driver)
        }
        EditorCommand::Close { path } => {
            driver.begin_changes()?;
            driver.close_overlay(&path)?;
            finish(driver)
        }
        EditorCommand::Change {
            path,
            offset,
            remove,
            insert,
        } => {
            driver.begin_changes()?;
            driver.splice(&path, offset, remove, insert.as_bytes())?;
            finish(driver)
        }
        EditorCommand::ChangeLines {
            path,
            line,
            count,
            insert,
        } => {
            driver.begin_changes()?;
            driver.splice_lines(&path, line, count, &insert)?;
            finish(driver)
        }
        EditorCommand::Rescan => {
            driver.begin_changes()?;
            driver.detect_changes()?;
            finish(driver)
        }
        EditorCommand::Theme { bg, fg } => {
            info!("theme updated: bg {bg:?} fg {fg:?}");
            Ok(())
        }
        EditorCommand::SynctexForward { path, line } => {
            driver.synctex_forward(&path, line);
            Ok(())
        }
    }
}

fn finish(driver: &mut Driver) -> Result<()> {
    let rolled_back = driver
        .end_changes()
        .context("applying the editor change")?;
    if rolled_back {
        info!("rolled back to trace length {}", driver.trace().len());
    }
    Ok(())
}
