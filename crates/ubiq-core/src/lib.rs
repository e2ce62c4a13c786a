//! Client library for the Ubiq platform.
//!
//! Plaintexts are encrypted with data keys that only ever leave the
//! key-management service wrapped; the client unwraps them locally with
//! a passphrase-protected RSA private key. Two modes are supported:
//!
//! * **unstructured** — arbitrary byte streams under AES-256-GCM, with a
//!   self-describing header so decryption can recover the key;
//! * **structured** — format-preserving FF1 over named datasets, where
//!   ciphertexts keep the input's length, alphabet and passthrough
//!   characters.
//!
//! Every operation consults per-credential TTL caches before calling
//! the server, signs its HTTP requests, and records a usage event that
//! a background worker batches back to the platform.
//!
//! ```no_run
//! use ubiq_core::{Credentials, encrypt, decrypt};
//!
//! # fn main() -> ubiq_core::Result<()> {
//! let creds = Credentials::new(None, None, None, None)?;
//! let ct = encrypt(&creds, b"a secret")?;
//! assert_eq!(decrypt(&creds, &ct)?, b"a secret");
//! creds.close()?;
//! # Ok(())
//! # }
//! ```

mod algorithm;
mod auth;
mod cache;
mod client;
mod config;
mod credentials;
mod decrypt;
mod encrypt;
mod error;
mod events;
mod header;
pub mod structured;

#[cfg(test)]
mod testing;

pub use algorithm::Algorithm;
pub use config::{Configuration, TimestampGranularity};
pub use credentials::{Credentials, CredentialsBuilder};
pub use decrypt::{decrypt, Decryption};
pub use encrypt::{encrypt, Encryption};
pub use error::{Error, Result};
pub use header::{Header, FLAG_AAD};

/// Default host when neither the credentials nor the environment name
/// one.
pub const UBIQ_HOST: &str = "api.ubiqsecurity.com";
