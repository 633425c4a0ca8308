//! Per-run session secret.
//!
//! The secret is handed to the trusted test harness inside the sandbox and
//! must appear in every score record the harness prints. Student code that
//! does not know it cannot forge a score line.

use rand::distr::Alphanumeric;
use rand::Rng;

/// 32 alphanumeric characters, roughly 190 bits.
const SECRET_LENGTH: usize = 32;

/// Generate a fresh secret from the thread-local CSPRNG.
pub fn generate() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LENGTH)
        .map(char::from)
        .collect()
}
