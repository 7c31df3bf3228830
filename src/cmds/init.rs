// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand that creates the database and recordings directory, runs
//! migrations, and persists the configured streams, without starting any
//! stream workers. Run once before the first `run`, or after editing the
//! config file to add streams.

use crate::config::Config;
use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use tracing::info;

#[derive(Bpaf, Debug)]
#[bpaf(command("init"))]
/// Initializes the database and recordings directory from the config file.
pub struct Args {
    #[bpaf(external(super::parse_config_path))]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = Config::load(&args.config)?;
    std::fs::create_dir_all(&config.recordings_root)
        .map_err(|e| base::err!(Unavailable, "creating {}: {e}", config.recordings_root.display()))?;
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| base::err!(Unavailable, "creating {}: {e}", parent.display()))?;
    }
    let mut conn = rusqlite::Connection::open(&config.db_path)
        .map_err(|e| base::err!(Unavailable, "opening {}: {e}", config.db_path.display()))?;
    db::migrate::upgrade(&mut conn)?;
    config.ensure_streams_persisted(&conn)?;

    if db::auth::count(&conn)? == 0 {
        if let (Ok(user), Ok(password)) =
            (std::env::var("LIGHTNVR_ADMIN_USER"), std::env::var("LIGHTNVR_ADMIN_PASSWORD"))
        {
            db::auth::create(&conn, &user, &password, db::auth::Role::Admin)?;
            info!(username = %user, "created initial admin user");
        } else {
            info!(
                "no users exist yet; set LIGHTNVR_ADMIN_USER/LIGHTNVR_ADMIN_PASSWORD and rerun init to create one"
            );
        }
    }

    info!(
        db_path = %config.db_path.display(),
        recordings_root = %config.recordings_root.display(),
        streams = config.streams.len(),
        "initialized"
    );
    Ok(0)
}
