// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Ambient infrastructure shared by every `lightnvr` crate: the clock
//! abstraction, the error taxonomy, cooperative shutdown, time/size
//! parsing, and `tracing` setup. Nothing here is specific to recording.

pub mod clock;
pub mod error;
pub mod shutdown;
pub mod strutil;
pub mod time;
pub mod tracing_setup;

pub use crate::error::{Error, ErrorKind, ResultExt};
