//! Mocked-KMS fixture shared by the integration tests.
//!
//! Stands in for the platform: generates an RSA keypair, serves the
//! passphrase-encrypted private key and OAEP-wrapped data keys from a
//! local mock server, and builds `Credentials` pointed at it.

#![allow(dead_code)]

use base64::{engine::general_purpose, Engine as _};
use mockito::{Mock, ServerGuard};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use ubiq_core::{Configuration, Credentials};

pub const PASSPHRASE: &str = "crypto-access-passphrase";
pub const PAPI: &str = "test-access-id";

pub struct MockKms {
    pub server: ServerGuard,
    pub pem: String,
    pub public: RsaPublicKey,
}

impl MockKms {
    pub fn start() -> Self {
        let private = RsaPrivateKey::new(&mut OsRng, 2048).expect("generate rsa key");
        let public = RsaPublicKey::from(&private);
        let pem = private
            .to_pkcs8_encrypted_pem(&mut OsRng, PASSPHRASE.as_bytes(), LineEnding::LF)
            .expect("encrypt private key")
            .to_string();
        MockKms {
            server: mockito::Server::new(),
            pem,
            public,
        }
    }

    pub fn wrap(&self, data_key: &[u8]) -> String {
        let wrapped = self
            .public
            .encrypt(&mut OsRng, Oaep::new::<Sha1>(), data_key)
            .expect("wrap data key");
        general_purpose::STANDARD.encode(wrapped)
    }

    pub fn data_key() -> Vec<u8> {
        let mut key = vec![0u8; 32];
        OsRng.fill_bytes(&mut key);
        key
    }

    /// Credentials wired to the mock server. Synchronous event
    /// reporting unless the configuration says otherwise, so tests
    /// control every outbound request.
    pub fn credentials(&self, config: Configuration) -> Credentials {
        Credentials::builder()
            .access_key_id(PAPI)
            .secret_signing_key("test-signing-key")
            .secret_crypto_access_key(PASSPHRASE)
            .host(&self.server.url())
            .configuration(config)
            .build()
            .expect("build credentials")
    }

    pub fn sync_config() -> Configuration {
        Configuration::from_json(r#"{ "event_reporting": { "synchronous": true } }"#)
            .expect("config")
    }

    /// POST /api/v0/encryption/key returning a fresh-wrapped data key.
    pub fn mock_encryption_key(&mut self, data_key: &[u8], max_uses: u32) -> Mock {
        let body = serde_json::json!({
            "encrypted_private_key": self.pem,
            "wrapped_data_key": self.wrap(data_key),
            "encrypted_data_key":
                general_purpose::STANDARD.encode(b"server-wrapped-blob".as_slice()),
            "key_fingerprint": "test-fingerprint",
            "encryption_session": "test-session",
            "max_uses": max_uses,
            "security_model": { "algorithm": "aes-256-gcm", "enable_data_fragmentation": false }
        });
        self.server
            .mock("POST", "/api/v0/encryption/key")
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create()
    }

    /// POST /api/v0/decryption/key returning the same data key.
    pub fn mock_decryption_key(&mut self, data_key: &[u8]) -> Mock {
        let body = serde_json::json!({
            "encrypted_private_key": self.pem,
            "wrapped_data_key": self.wrap(data_key),
            "key_fingerprint": "test-fingerprint",
            "encryption_session": "test-session"
        });
        self.server
            .mock("POST", "/api/v0/decryption/key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create()
    }

    /// GET /api/v0/ffs for the given dataset definition.
    pub fn mock_dataset(&mut self, dataset: &serde_json::Value) -> Mock {
        let name = dataset["name"].as_str().expect("dataset name");
        let path = format!("/api/v0/ffs?ffs_name={name}&papi={PAPI}");
        self.server
            .mock("GET", path.as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(dataset.to_string())
            .create()
    }

    fn key_body(&self, data_key: &[u8], key_number: i32) -> String {
        serde_json::json!({
            "encrypted_private_key": self.pem,
            "wrapped_data_key": self.wrap(data_key),
            "key_number": key_number.to_string()
        })
        .to_string()
    }

    /// GET /api/v0/fpe/key for the current key.
    pub fn mock_current_key(&mut self, dataset: &str, data_key: &[u8], key_number: i32) -> Mock {
        let path = format!("/api/v0/fpe/key?ffs_name={dataset}&papi={PAPI}");
        let body = self.key_body(data_key, key_number);
        self.server
            .mock("GET", path.as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create()
    }

    /// GET /api/v0/fpe/key for an explicit key number.
    pub fn mock_numbered_key(&mut self, dataset: &str, data_key: &[u8], key_number: i32) -> Mock {
        let path = format!("/api/v0/fpe/key?ffs_name={dataset}&papi={PAPI}&key_number={key_number}");
        let body = self.key_body(data_key, key_number);
        self.server
            .mock("GET", path.as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create()
    }

    /// GET /api/v0/fpe/def_keys with one wrapped key per entry,
    /// key numbers being the indexes.
    pub fn mock_all_keys(&mut self, dataset: &str, data_keys: &[Vec<u8>]) -> Mock {
        let wrapped: Vec<String> = data_keys.iter().map(|k| self.wrap(k)).collect();
        let body = serde_json::json!({
            dataset: {
                "encrypted_private_key": self.pem,
                "keys": wrapped
            }
        });
        let path = format!("/api/v0/fpe/def_keys?ffs_name={dataset}&papi={PAPI}");
        self.server
            .mock("GET", path.as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create()
    }

    /// POST /api/v3/tracking/events whose body matches `pattern`.
    pub fn mock_tracking(&mut self, pattern: &str, hits: usize) -> Mock {
        self.server
            .mock("POST", "/api/v3/tracking/events")
            .match_body(mockito::Matcher::Regex(pattern.to_string()))
            .with_status(200)
            .with_body("{}")
            .expect(hits)
            .create()
    }
}

/// Standard SSN-style dataset: digits in, alphanumerics out, dashes
/// passed through, three bits of key number in the leading character.
pub fn ssn_dataset() -> serde_json::Value {
    serde_json::json!({
        "name": "SSN",
        "encryption_algorithm": "FF1",
        "input_character_set": "0123456789",
        "output_character_set":
            "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ",
        "passthrough": "-",
        "passthrough_rules": [],
        "tweak": general_purpose::STANDARD.encode([57u8, 56, 55, 54, 53, 52, 51, 50, 49, 48]),
        "tweak_min_len": 0,
        "tweak_max_len": 255,
        "msb_encoding_bits": 3,
        "min_input_length": 6,
        "max_input_length": 255
    })
}
