//! Master-key derivation.
//!
//! PBKDF2-HMAC-SHA256 with a fixed iteration count. The parameters are part
//! of the on-disk format: changing them would orphan every existing vault,
//! so the format version in vault metadata is the only upgrade path.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::aead::KEY_SIZE;

/// PBKDF2 iteration count. Fixed by the vault format.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Derives a 256-bit master key from a password and salt.
///
/// Deterministic: identical inputs always produce the identical key. The
/// result is wrapped in `Zeroizing` so intermediate copies are erased when
/// dropped.
pub fn derive_master_key(password: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut *key);
    key
}
