//! Structured (format-preserving) encryption.
//!
//! A dataset definition fetched from the server governs one field type:
//! its input and output alphabets, passthrough characters and rules,
//! length bounds, and the FF1 tweak parameters. Ciphertexts preserve
//! the input's length and passthrough positions, and the first output
//! character additionally carries the key number used.

mod dataset;
mod decrypt;
mod encrypt;
mod ff1;
mod ffx;
mod format;

pub use dataset::{Dataset, PassthroughRule};
pub use decrypt::{decrypt, Decryption};
pub use encrypt::{encrypt, encrypt_for_search, Encryption};
