//! Per-account secrets. Only a salted SHA-256 digest is ever stored; the
//! stored form is `<salt hex>$<digest hex>`.

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::limits::{MAX_SECRET_LEN, MIN_SECRET_LEN};

const SALT_LEN: usize = 16;

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

fn digest(salt: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b"$");
    hasher.update(secret.as_bytes());
    hex_encode(&hasher.finalize())
}

/// Length bounds only; the secret is otherwise opaque.
pub fn check_secret(secret: &str) -> Result<(), String> {
    let len = secret.chars().count();
    if len < MIN_SECRET_LEN {
        return Err(format!("password must be at least {MIN_SECRET_LEN} characters"));
    }
    if len > MAX_SECRET_LEN {
        return Err(format!("password must be at most {MAX_SECRET_LEN} characters"));
    }
    Ok(())
}

pub fn hash_secret(secret: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt = hex_encode(&salt);
    let digest = digest(&salt, secret);
    format!("{salt}${digest}")
}

pub fn verify_secret(secret: &str, stored: &str) -> bool {
    match stored.split_once('$') {
        Some((salt, expected)) => constant_time_eq(digest(salt, secret).as_bytes(), expected.as_bytes()),
        None => false,
    }
}

/// Comparison time depends only on the lengths.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
