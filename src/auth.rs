use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Stored format: `sha256$<salt>$<hex digest of salt+password>`.
/// Early workspaces stored a bare unsalted sha256 hex digest; `verify`
/// still accepts those and reports that the hash should be rewritten.
pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    format!("sha256${}${}", salt, digest_hex(&salt, password))
}

pub struct Verification {
    pub valid: bool,
    pub needs_rehash: bool,
}

pub fn verify_password(stored: &str, password: &str) -> Verification {
    let mut parts = stored.splitn(3, '$');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("sha256"), Some(salt), Some(hex)) => Verification {
            valid: digest_hex(salt, password) == hex,
            needs_rehash: false,
        },
        _ => {
            // Legacy unsalted digest.
            let valid = digest_hex("", password) == stored;
            Verification {
                valid,
                needs_rehash: valid,
            }
        }
    }
}

fn digest_hex(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    let out = hasher.finalize();
    let mut hex = String::with_capacity(out.len() * 2);
    for b in out {
        hex.push_str(&format!("{:02x}", b));
    }
    hex
}

/// Produce the legacy unsalted digest. Only used to seed fixtures and tests
/// that exercise the opportunistic upgrade path.
#[allow(dead_code)]
pub fn legacy_hash(password: &str) -> String {
    digest_hex("", password)
}
