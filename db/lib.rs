// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The embedded recording-metadata database: streams, sealed segments,
//! motion events, users, and detection results, all in one sqlite file
//! opened in WAL mode with a single writer connection.
//!
//! Nothing here speaks HTTP or owns a socket; this crate is a library of
//! row types and queries over a `rusqlite::Connection` the caller opens
//! and brings up to date with [`migrate::upgrade`].

pub mod auth;
pub mod detection;
pub mod migrate;
pub mod motion;
pub mod reconcile;
pub mod schema;
pub mod segment;
pub mod stream;

#[cfg(test)]
pub mod testutil;
