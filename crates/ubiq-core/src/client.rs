//! Signed HTTP client for the Ubiq key-management service.
//!
//! All paths hang off `<host>/api/v0/` except event tracking, which is a
//! v3 endpoint. Responses are JSON; non-2xx responses become
//! [`Error::Transport`] carrying the URL, status, a reason (preferring a
//! `message` field from a JSON error body) and the raw body. Key
//! unwrapping happens locally: the server hands back a passphrase-
//! protected RSA private key (PKCS#8 PEM) and an RSA-OAEP-SHA1 wrapped
//! symmetric key.

use std::collections::HashMap;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use reqwest::blocking::{Client as HttpClient, Request, Response};
use reqwest::Method;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Oaep, RsaPrivateKey};
use serde::{Deserialize, Deserializer, Serialize};
use sha1::Sha1;
use tracing::debug;
use zeroize::Zeroizing;

use crate::auth;
use crate::error::{Error, Result};
use crate::structured::Dataset;

/// A key record as it came off the wire: the data key is still wrapped
/// and the private key still passphrase-protected. Safe to cache at rest.
#[derive(Debug, Clone, Deserialize)]
pub struct WrappedDataKey {
    pub encrypted_private_key: String,
    /// Base64 of the RSA-OAEP wrapped symmetric key.
    pub wrapped_data_key: String,
    #[serde(default, deserialize_with = "de_key_number")]
    pub key_number: i32,
    #[serde(default)]
    pub key_fingerprint: String,
    #[serde(default)]
    pub encryption_session: Option<String>,
}

/// A usable key: the unwrapped symmetric key plus the identifiers needed
/// for billing and server updates. Key material is zeroized on drop.
#[derive(Debug, Clone)]
pub struct DataKey {
    pub raw: Zeroizing<Vec<u8>>,
    pub key_number: i32,
    pub key_fingerprint: String,
    pub encryption_session: Option<String>,
}

impl WrappedDataKey {
    /// Unwrap into a usable key with the crypto access passphrase.
    pub fn unwrap_key(&self, passphrase: &str) -> Result<DataKey> {
        let private_key = load_private_key(&self.encrypted_private_key, passphrase)?;
        let raw = unwrap_with(&private_key, &self.wrapped_data_key)?;
        Ok(DataKey {
            raw,
            key_number: self.key_number,
            key_fingerprint: self.key_fingerprint.clone(),
            encryption_session: self.encryption_session.clone(),
        })
    }
}

/// Response to a new-encryption-key request; the server may cap `uses`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewEncryptionKey {
    #[serde(flatten)]
    pub key: WrappedDataKey,
    /// Base64 of the data key wrapped by the *server's* master key;
    /// opaque to the client, embedded in every ciphertext header.
    pub encrypted_data_key: String,
    pub max_uses: u32,
    pub security_model: SecurityModel,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityModel {
    pub algorithm: String,
}

#[derive(Debug, Deserialize)]
struct DefKeysEntry {
    encrypted_private_key: String,
    keys: Vec<String>,
}

/// Signed, synchronous KMS client. Cheap to clone; safe to share across
/// threads.
#[derive(Debug, Clone)]
pub struct KmsClient {
    http: HttpClient,
    host: String,
    papi: String,
    sapi: String,
}

impl KmsClient {
    pub fn new(host: &str, papi: &str, sapi: &str, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = HttpClient::builder();
        if let Some(t) = timeout {
            builder = builder.timeout(t);
        }
        let http = builder
            .build()
            .map_err(|e| transport_error(host, &e))?;
        Ok(KmsClient {
            http,
            host: host.trim_end_matches('/').to_string(),
            papi: papi.to_string(),
            sapi: sapi.to_string(),
        })
    }

    fn v0(&self, path: &str) -> String {
        format!("{}/api/v0/{path}", self.host)
    }

    /// Sign and execute, mapping non-2xx to `Error::Transport`.
    fn execute(&self, mut req: Request) -> Result<Response> {
        let url = req.url().to_string();
        auth::sign(&mut req, &self.papi, &self.sapi)?;
        let resp = self
            .http
            .execute(req)
            .map_err(|e| transport_error(&url, &e))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().unwrap_or_default();
        // Prefer the message the server put in a JSON error body.
        let reason = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str().map(str::to_string)))
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string());
        Err(Error::Transport {
            url,
            status: status.as_u16(),
            reason,
            body,
        })
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let req = self
            .http
            .request(Method::GET, &url)
            .query(query)
            .build()
            .map_err(|e| transport_error(&url, &e))?;
        decode_json(self.execute(req)?)
    }

    fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        body: &B,
    ) -> Result<T> {
        decode_json(self.post(url, body)?)
    }

    fn post<B: Serialize>(&self, url: String, body: &B) -> Result<Response> {
        let bytes =
            serde_json::to_vec(body).map_err(|e| Error::Crypto(format!("encode body: {e}")))?;
        let req = self
            .http
            .request(Method::POST, &url)
            .body(bytes)
            .build()
            .map_err(|e| transport_error(&url, &e))?;
        self.execute(req)
    }

    /// POST `decryption/key`: have the server re-wrap a data key found in
    /// a ciphertext header for this client.
    pub fn fetch_decrypt_key(&self, wrapped_data_key: &[u8]) -> Result<WrappedDataKey> {
        debug!(target: "ubiq::client", "fetching decryption key");
        self.post_json(
            self.v0("decryption/key"),
            &serde_json::json!({
                "encrypted_data_key": general_purpose::STANDARD.encode(wrapped_data_key),
            }),
        )
    }

    /// POST `encryption/key`: request a fresh data key good for `uses`
    /// encryptions (the server may return a lower `max_uses`).
    pub fn fetch_encryption_key(&self, uses: u32) -> Result<NewEncryptionKey> {
        debug!(target: "ubiq::client", uses, "fetching encryption key");
        self.post_json(
            self.v0("encryption/key"),
            &serde_json::json!({ "uses": uses }),
        )
    }

    /// GET `ffs`: fetch a dataset (FFS) definition by name.
    pub fn fetch_dataset(&self, name: &str) -> Result<Dataset> {
        debug!(target: "ubiq::client", dataset = name, "fetching dataset definition");
        self.get_json(
            self.v0("ffs"),
            &[("ffs_name", name), ("papi", &self.papi)],
        )
    }

    /// GET `fpe/key`: fetch a structured key; `None` means "current".
    pub fn fetch_key(&self, dataset_name: &str, key_number: Option<i32>) -> Result<WrappedDataKey> {
        debug!(target: "ubiq::client", dataset = dataset_name, ?key_number, "fetching structured key");
        let url = self.v0("fpe/key");
        let number;
        let mut query = vec![("ffs_name", dataset_name), ("papi", self.papi.as_str())];
        if let Some(n) = key_number {
            number = n.to_string();
            query.push(("key_number", number.as_str()));
        }
        self.get_json(url, &query)
    }

    /// GET `fpe/def_keys`: every wrapped key for a dataset plus the one
    /// private key that unwraps them all.
    pub fn fetch_all_keys(&self, dataset_name: &str) -> Result<(String, Vec<String>)> {
        debug!(target: "ubiq::client", dataset = dataset_name, "fetching all keys");
        let mut map: HashMap<String, DefKeysEntry> = self.get_json(
            self.v0("fpe/def_keys"),
            &[("ffs_name", dataset_name), ("papi", &self.papi)],
        )?;
        let entry = map
            .remove(dataset_name)
            .ok_or_else(|| Error::Crypto(format!("no keys returned for dataset {dataset_name}")))?;
        Ok((entry.encrypted_private_key, entry.keys))
    }

    /// PATCH `encryption/key/<fingerprint>/<session>` with the
    /// requested/actual use counts. Best-effort: callers swallow errors.
    pub fn update_encryption_key_usage(
        &self,
        fingerprint: &str,
        session: &str,
        requested: u32,
        actual: u32,
    ) -> Result<()> {
        let url = self.v0(&format!("encryption/key/{fingerprint}/{session}"));
        let bytes = serde_json::to_vec(&serde_json::json!({
            "requested": requested,
            "actual": actual,
        }))
        .map_err(|e| Error::Crypto(format!("encode body: {e}")))?;
        let req = self
            .http
            .request(Method::PATCH, &url)
            .body(bytes)
            .build()
            .map_err(|e| transport_error(&url, &e))?;
        self.execute(req).map(|_| ())
    }

    /// POST the usage report to the v3 tracking endpoint.
    pub fn post_events(&self, usage: &serde_json::Value) -> Result<()> {
        let url = format!("{}/api/v3/tracking/events", self.host);
        self.post(url, usage).map(|_| ())
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T> {
    let bytes = resp
        .bytes()
        .map_err(|e| Error::Crypto(format!("read response: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::Crypto(format!("decode response: {e}")))
}

fn transport_error(url: &str, err: &dyn std::fmt::Display) -> Error {
    Error::Transport {
        url: url.to_string(),
        status: 0,
        reason: err.to_string(),
        body: String::new(),
    }
}

/// Load the client's RSA private key from its passphrase-protected
/// PKCS#8 PEM form.
pub(crate) fn load_private_key(pem: &str, passphrase: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_encrypted_pem(pem, passphrase.as_bytes())
        .map_err(|e| Error::Crypto(format!("private key: {e}")))
}

/// RSA-OAEP(MGF1-SHA1, SHA1, no label) unwrap of a base64 wrapped key.
pub(crate) fn unwrap_with(
    private_key: &RsaPrivateKey,
    wrapped_b64: &str,
) -> Result<Zeroizing<Vec<u8>>> {
    let wrapped = general_purpose::STANDARD
        .decode(wrapped_b64)
        .map_err(|e| Error::Crypto(format!("wrapped data key: {e}")))?;
    private_key
        .decrypt(Oaep::new::<Sha1>(), &wrapped)
        .map(Zeroizing::new)
        .map_err(|e| Error::Crypto(format!("unwrap data key: {e}")))
}

// The server is inconsistent about whether key_number is a JSON number
// or a string; accept both.
fn de_key_number<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<i32, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i32),
        Text(String),
    }
    match Raw::deserialize(d)? {
        Raw::Num(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_keypair;
    use rand::rngs::OsRng;

    #[test]
    fn unwrap_round_trip() {
        let (pem, public) = test_keypair("passphrase");
        let data_key = [0x42u8; 32];
        let wrapped = public
            .encrypt(&mut OsRng, Oaep::new::<Sha1>(), &data_key)
            .unwrap();

        let record = WrappedDataKey {
            encrypted_private_key: pem,
            wrapped_data_key: general_purpose::STANDARD.encode(wrapped),
            key_number: 3,
            key_fingerprint: "fp".into(),
            encryption_session: None,
        };
        let key = record.unwrap_key("passphrase").unwrap();
        assert_eq!(&key.raw[..], &data_key);
        assert_eq!(key.key_number, 3);
    }

    #[test]
    fn wrong_passphrase_is_a_crypto_error() {
        let (pem, public) = test_keypair("right");
        let wrapped = public
            .encrypt(&mut OsRng, Oaep::new::<Sha1>(), &[1u8; 32])
            .unwrap();
        let record = WrappedDataKey {
            encrypted_private_key: pem,
            wrapped_data_key: general_purpose::STANDARD.encode(wrapped),
            key_number: 0,
            key_fingerprint: String::new(),
            encryption_session: None,
        };
        assert!(matches!(record.unwrap_key("wrong"), Err(Error::Crypto(_))));
    }

    #[test]
    fn key_number_accepts_string_or_number() {
        let a: WrappedDataKey = serde_json::from_str(
            r#"{"encrypted_private_key":"p","wrapped_data_key":"w","key_number":"7"}"#,
        )
        .unwrap();
        assert_eq!(a.key_number, 7);
        let b: WrappedDataKey = serde_json::from_str(
            r#"{"encrypted_private_key":"p","wrapped_data_key":"w","key_number":7}"#,
        )
        .unwrap();
        assert_eq!(b.key_number, 7);
    }
}
