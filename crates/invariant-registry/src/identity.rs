//! Persistent peer identities.
//!
//! Every persistent component owns a random 256-bit id generated on first
//! use and stored as 64 hex characters in an `id` file beside its data.
//! In-memory components draw a fresh id per process.

use std::fs;
use std::path::Path;

use rand::RngCore;

/// Generate a fresh random 64-hex identity.
pub fn random_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Load the identity stored in `<dir>/id`, creating it on first use.
pub fn load_or_create(dir: impl AsRef<Path>) -> std::io::Result<String> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let path = dir.join("id");
    if let Ok(data) = fs::read_to_string(&path) {
        let trimmed = data.trim();
        if trimmed.len() == 64 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(trimmed.to_string());
        }
    }
    let id = random_id();
    fs::write(&path, &id)?;
    Ok(id)
}
