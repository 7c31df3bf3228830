// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use bpaf::Parser;
use std::path::PathBuf;

pub mod check;
pub mod init;
pub mod run;

const DEFAULT_CONFIG_PATH: &str = "/etc/lightnvr/config.toml";

/// Shared `--config PATH` argument, reused by every subcommand that
/// needs it.
pub(crate) fn parse_config_path() -> impl Parser<PathBuf> {
    bpaf::long("config")
        .help("Path to the TOML configuration file.")
        .argument::<PathBuf>("PATH")
        .fallback(DEFAULT_CONFIG_PATH.into())
        .debug_fallback()
}
