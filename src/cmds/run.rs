// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The main long-running subcommand: loads config, builds a
//! [`crate::runtime::Runtime`], and waits for `SIGINT`/`SIGTERM` to shut
//! it down gracefully. A second signal after the first forces an
//! immediate exit rather than waiting on an already-requested graceful
//! shutdown.

use crate::config::Config;
use crate::runtime::Runtime;
use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
/// Starts ingest, recording, and retention for every configured stream.
pub struct Args {
    #[bpaf(external(super::parse_config_path))]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    let rt = builder
        .enable_all()
        .build()
        .map_err(|e| base::err!(Internal, "building tokio runtime: {e}"))?;
    rt.block_on(async_run(&args))
}

async fn async_run(args: &Args) -> Result<i32, Error> {
    let config = Config::load(&args.config)?;
    let mut runtime = Runtime::start(&config, tokio::runtime::Handle::current())?;

    let mut int = signal(SignalKind::interrupt())
        .map_err(|e| base::err!(Internal, "installing SIGINT handler: {e}"))?;
    let mut term = signal(SignalKind::terminate())
        .map_err(|e| base::err!(Internal, "installing SIGTERM handler: {e}"))?;

    tokio::select! {
        _ = int.recv() => info!("received SIGINT; shutting down gracefully"),
        _ = term.recv() => info!("received SIGTERM; shutting down gracefully"),
    }

    // A worker mid-backoff-sleep can take up to one backoff interval to
    // notice shutdown (spec.md §4.1); give the operator an escape hatch
    // rather than blocking the process on it indefinitely.
    tokio::select! {
        _ = int.recv() => {
            info!("received second signal; exiting immediately without draining workers");
            return Ok(1);
        }
        _ = term.recv() => {
            info!("received second signal; exiting immediately without draining workers");
            return Ok(1);
        }
        _ = tokio::task::spawn_blocking(move || runtime.shutdown()) => {}
    }
    Ok(0)
}
