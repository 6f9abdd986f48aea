//! # Citadel Crypto
//!
//! Core cryptographic primitives for the Citadel secrets vault.
//!
//! This crate provides the fixed cryptographic protocol the vault is built
//! on:
//! - Symmetric encryption (AES-256-GCM) with base64 wire framing
//! - Master-key derivation from a password (PBKDF2-HMAC-SHA256, 100k rounds)
//! - Secure random generation (OS CSPRNG)
//! - Memory-safe key types with automatic zeroization
//!
//! ## Security
//!
//! All sensitive key material is automatically zeroized when dropped.
//! Keys implement `Debug` with redacted output to prevent accidental logging.
//!
//! ## Example
//!
//! ```
//! use citadel_crypto::{aead, MasterKey};
//!
//! let salt = citadel_crypto::random::generate_salt();
//! let key = MasterKey::derive("correct horse battery staple", &salt);
//!
//! let blob = aead::encrypt(key.as_bytes(), b"secret message").unwrap();
//! let plaintext = aead::decrypt(key.as_bytes(), &blob).unwrap();
//!
//! assert_eq!(&*plaintext, b"secret message");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aead;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod random;

pub use error::CryptoError;
pub use keys::MasterKey;
