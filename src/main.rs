// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::Error;
use bpaf::Bpaf;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

mod cmds;
mod config;
mod event_bus;
mod h264;
mod hls_writer;
mod ingest;
mod motion_buffer;
mod motion_trigger;
mod mp4_writer;
mod packet;
mod query_api;
mod retention;
mod router;
mod runtime;
mod segment_writer;
mod supervisor;

/// LightNVR: a lightweight network video recorder core.
#[derive(Bpaf, Debug)]
#[bpaf(options, version(env!("CARGO_PKG_VERSION")))]
enum Args {
    Run(#[bpaf(external(cmds::run::args))] cmds::run::Args),
    Init(#[bpaf(external(cmds::init::args))] cmds::init::Args),
    Check(#[bpaf(external(cmds::check::args))] cmds::check::Args),
}

impl Args {
    fn run(self) -> Result<i32, Error> {
        match self {
            Args::Run(a) => cmds::run::run(a),
            Args::Init(a) => cmds::init::run(a),
            Args::Check(a) => cmds::check::run(a),
        }
    }
}

fn main() {
    base::tracing_setup::install();

    let progname = std::env::args_os().next().map(PathBuf::from);
    let progname = progname
        .as_deref()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let args = match args().fallback_to_usage().run_inner(bpaf::Args::current_args().set_name(progname)) {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    tracing::trace!("parsed command-line arguments: {args:#?}");

    match args.run() {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            std::process::exit(1);
        }
        Ok(rv) => {
            debug!("exiting with status {}", rv);
            std::process::exit(rv)
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn bpaf_invariants() {
        super::args().check_invariants(false);
    }
}
