// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand that runs startup reconciliation (spec.md §4.5) against an
//! existing database and recordings directory without starting any
//! stream workers, and reports what it found.

use crate::config::Config;
use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use tracing::info;

#[derive(Bpaf, Debug)]
#[bpaf(command("check"))]
/// Reconciles the segment index against the recordings directory.
pub struct Args {
    #[bpaf(external(super::parse_config_path))]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = Config::load(&args.config)?;
    let mut conn = rusqlite::Connection::open(&config.db_path)
        .map_err(|e| base::err!(Unavailable, "opening {}: {e}", config.db_path.display()))?;
    db::migrate::upgrade(&mut conn)?;
    let report = db::reconcile::reconcile(&conn, &config.recordings_root)?;
    info!(
        rows_orphaned = report.rows_orphaned,
        files_orphaned = report.files_orphaned,
        "check complete"
    );
    Ok(0)
}
