//! Shared fixtures for unit tests.

use base64::{engine::general_purpose, Engine as _};
use rand::rngs::OsRng;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;

/// Generate an RSA keypair, returning the passphrase-encrypted PKCS#8
/// PEM (as the server would send it) and the public half for wrapping
/// test data keys.
pub(crate) fn test_keypair(passphrase: &str) -> (String, RsaPublicKey) {
    let private = RsaPrivateKey::new(&mut OsRng, 2048).expect("generate rsa key");
    let public = RsaPublicKey::from(&private);
    let pem = private
        .to_pkcs8_encrypted_pem(&mut OsRng, passphrase.as_bytes(), LineEnding::LF)
        .expect("encrypt private key")
        .to_string();
    (pem, public)
}

/// OAEP-SHA1 wrap of `data_key`, base64-encoded.
pub(crate) fn wrap_data_key(public: &RsaPublicKey, data_key: &[u8]) -> String {
    let wrapped = public
        .encrypt(&mut OsRng, Oaep::new::<Sha1>(), data_key)
        .expect("wrap data key");
    general_purpose::STANDARD.encode(wrapped)
}
