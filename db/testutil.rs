// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! An in-memory database fixture for unit tests, matching
//! `moonfire_db::testutil::TestDb`'s role: a fully-migrated connection
//! behind the same lock discipline the rest of the crate expects.

use std::sync::{Mutex, MutexGuard};

pub struct TestDb {
    conn: Mutex<rusqlite::Connection>,
}

impl TestDb {
    pub fn new() -> Self {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        crate::migrate::upgrade(&mut conn).unwrap();
        TestDb { conn: Mutex::new(conn) }
    }

    pub fn conn(&self) -> MutexGuard<'_, rusqlite::Connection> {
        self.conn.lock().unwrap()
    }
}

impl Default for TestDb {
    fn default() -> Self {
        Self::new()
    }
}
