// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The `users` table and password hashing. Session handling, tokens, and
//! the actual login endpoint live in the (out-of-scope) web layer; this
//! module only owns the row and the hash/verify primitives it needs.

use base::{err, Error};
use rusqlite::{Connection, OptionalExtension};
use std::num::NonZeroU32;

const PBKDF2_ITERATIONS: u32 = 210_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = ring::digest::SHA256_OUTPUT_LEN;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Admin,
    Viewer,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Viewer => "viewer",
        }
    }

    fn parse(s: &str) -> Role {
        match s {
            "admin" => Role::Admin,
            _ => Role::Viewer,
        }
    }
}

#[derive(Clone, Debug)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub role: Role,
}

/// Hashes `password` with a fresh random salt, returning
/// `pbkdf2$<iterations>$<hex salt>$<hex hash>`, stored verbatim in
/// `users.password_hash`.
pub fn hash_password(password: &str) -> String {
    let rng = ring::rand::SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    ring::rand::SecureRandom::fill(&rng, &mut salt).expect("system RNG failure");
    let mut out = [0u8; HASH_LEN];
    ring::pbkdf2::derive(
        ring::pbkdf2::PBKDF2_HMAC_SHA256,
        NonZeroU32::new(PBKDF2_ITERATIONS).unwrap(),
        &salt,
        password.as_bytes(),
        &mut out,
    );
    format!(
        "pbkdf2${}${}${}",
        PBKDF2_ITERATIONS,
        base::strutil::hex(&salt),
        base::strutil::hex_any(&out),
    )
}

/// Verifies `password` against a hash produced by [`hash_password`].
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((iterations, salt, hash)) = parse_hash(stored) else {
        return false;
    };
    let Some(iterations) = NonZeroU32::new(iterations) else {
        return false;
    };
    ring::pbkdf2::verify(
        ring::pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        &salt,
        password.as_bytes(),
        &hash,
    )
    .is_ok()
}

fn parse_hash(stored: &str) -> Option<(u32, Vec<u8>, Vec<u8>)> {
    let mut parts = stored.splitn(4, '$');
    if parts.next()? != "pbkdf2" {
        return None;
    }
    let iterations: u32 = parts.next()?.parse().ok()?;
    let salt = base::strutil::dehex_any(parts.next()?.as_bytes())?;
    let hash = base::strutil::dehex_any(parts.next()?.as_bytes())?;
    Some((iterations, salt, hash))
}

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    let role: String = row.get("role")?;
    Ok(User {
        id: row.get("id")?,
        username: row.get("username")?,
        password_hash: row.get("password_hash")?,
        role: Role::parse(&role),
    })
}

pub fn create(conn: &Connection, username: &str, password: &str, role: Role) -> Result<i64, Error> {
    let hash = hash_password(password);
    conn.execute(
        "INSERT INTO users (username, password_hash, role) VALUES (?1, ?2, ?3)",
        rusqlite::params![username, hash, role.as_str()],
    )
    .map_err(|e| match e.sqlite_error_code() {
        Some(rusqlite::ErrorCode::ConstraintViolation) => {
            err!(AlreadyExists, "user {:?} already exists", username)
        }
        _ => Error::from(e),
    })?;
    Ok(conn.last_insert_rowid())
}

pub fn get_by_username(conn: &Connection, username: &str) -> Result<User, Error> {
    conn.query_row("SELECT * FROM users WHERE username = ?1", [username], row_to_user)
        .optional()?
        .ok_or_else(|| err!(NotFound, "no such user {:?}", username))
}

pub fn count(conn: &Connection) -> Result<i64, Error> {
    Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn hash_round_trips() {
        let h = hash_password("correct horse battery staple");
        assert!(verify_password("correct horse battery staple", &h));
        assert!(!verify_password("wrong", &h));
    }

    #[test]
    fn two_hashes_of_same_password_differ() {
        // distinct random salts.
        assert_ne!(hash_password("same"), hash_password("same"));
    }

    #[test]
    fn create_and_fetch() {
        let db = testutil::TestDb::new();
        create(&db.conn(), "admin", "hunter2", Role::Admin).unwrap();
        let u = get_by_username(&db.conn(), "admin").unwrap();
        assert!(verify_password("hunter2", &u.password_hash));
        assert_eq!(u.role, Role::Admin);
    }

    #[test]
    fn duplicate_username_rejected() {
        let db = testutil::TestDb::new();
        create(&db.conn(), "dup", "a", Role::Viewer).unwrap();
        assert!(create(&db.conn(), "dup", "b", Role::Viewer).is_err());
    }
}
