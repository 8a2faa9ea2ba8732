/*
 * passwords.rs
 * Copyright (C) 2026 The Mailboat Contributors
 *
 * This file is part of Mailboat, a self-hosted mail server.
 *
 * Mailboat is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Mailboat is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Mailboat.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Password hashing with argon2id at SENSITIVE cost, base64-wrapped.
//!
//! Hashing and verification are CPU-bound and must run on the blocking
//! worker pool; the `_sync` variants exist for the pool closure and for
//! tests, everything else calls the async wrappers.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::Semaphore;
use tokio::task;

/// argon2id SENSITIVE cost: 4 passes over 1 GiB, single lane.
const OPSLIMIT_SENSITIVE: u32 = 4;
const MEMLIMIT_SENSITIVE_KIB: u32 = 1024 * 1024;

/// Each hash pass touches the full memory cost; concurrent hashes are
/// capped process-wide.
static HASHING_SLOTS: Semaphore = Semaphore::const_new(2);

#[derive(Debug)]
pub enum PasswordError {
    /// The hash function itself failed (bad parameters, allocation).
    Hash(String),
    /// The stored hash is not valid base64-wrapped PHC text.
    Encoding(String),
    /// The worker pool rejected or lost the task.
    Pool(String),
}

impl std::fmt::Display for PasswordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PasswordError::Hash(m) => write!(f, "password hashing: {}", m),
            PasswordError::Encoding(m) => write!(f, "password hash encoding: {}", m),
            PasswordError::Pool(m) => write!(f, "worker pool: {}", m),
        }
    }
}

impl std::error::Error for PasswordError {}

impl From<argon2::password_hash::Error> for PasswordError {
    fn from(e: argon2::password_hash::Error) -> Self {
        PasswordError::Hash(e.to_string())
    }
}

impl From<task::JoinError> for PasswordError {
    fn from(e: task::JoinError) -> Self {
        PasswordError::Pool(e.to_string())
    }
}

fn hasher() -> Result<Argon2<'static>, PasswordError> {
    let params = Params::new(MEMLIMIT_SENSITIVE_KIB, OPSLIMIT_SENSITIVE, 1, None)
        .map_err(|e| PasswordError::Hash(e.to_string()))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Hash `password`; the result is the PHC string wrapped in base64 so it
/// stays opaque ASCII in stored records.
pub fn password_hashing_sync(password: &[u8]) -> Result<String, PasswordError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = hasher()?.hash_password(password, &salt)?.to_string();
    Ok(BASE64.encode(hash.as_bytes()))
}

/// Verify `password` against a hash produced by `password_hashing`.
/// A mismatch is `Ok(false)`; only malformed input is an error.
pub fn password_check_sync(password: &[u8], password_b64hash: &str) -> Result<bool, PasswordError> {
    let raw = BASE64
        .decode(password_b64hash.as_bytes())
        .map_err(|e| PasswordError::Encoding(e.to_string()))?;
    let phc = String::from_utf8(raw).map_err(|e| PasswordError::Encoding(e.to_string()))?;
    let parsed = PasswordHash::new(&phc).map_err(|e| PasswordError::Encoding(e.to_string()))?;
    match hasher()?.verify_password(password, &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// `password_hashing_sync` on the blocking worker pool.
pub async fn password_hashing(password: Vec<u8>) -> Result<String, PasswordError> {
    let _slot = HASHING_SLOTS
        .acquire()
        .await
        .map_err(|e| PasswordError::Pool(e.to_string()))?;
    task::spawn_blocking(move || password_hashing_sync(&password)).await?
}

/// `password_check_sync` on the blocking worker pool.
pub async fn password_check(password: Vec<u8>, password_b64hash: String) -> Result<bool, PasswordError> {
    let _slot = HASHING_SLOTS
        .acquire()
        .await
        .map_err(|e| PasswordError::Pool(e.to_string()))?;
    task::spawn_blocking(move || password_check_sync(&password, &password_b64hash)).await?
}
