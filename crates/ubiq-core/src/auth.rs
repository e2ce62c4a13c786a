//! HTTP message signing for the Ubiq platform.
//!
//! Every request carries a `Signature` header computed per the IETF
//! httpbis-message-signatures draft: an HMAC-SHA-512 over a fixed,
//! ordered list of headers plus the synthetic `(request-target)` and
//! `(created)` items. The signer is stateless and deterministic given
//! the request, the clock and the credentials.

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::blocking::Request;
use reqwest::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, DATE, HOST};
use sha2::{Digest, Sha512};

use crate::error::{Error, Result};

type HmacSha512 = Hmac<Sha512>;

// Headers considered for the signature, in signing order. Synthetic
// items come first; real headers are skipped when absent.
const SIGNED_HEADERS: &[&str] = &[
    "(created)",
    "(request-target)",
    "Content-Length",
    "Content-Type",
    "Date",
    "Digest",
    "Host",
];

/// Sign `req` in place with the current clock.
pub(crate) fn sign(req: &mut Request, access_id: &str, signing_key: &str) -> Result<()> {
    sign_at(req, access_id, signing_key, Utc::now())
}

/// Sign `req` in place as of `now`. Split out so tests can pin the clock
/// and verify the signature byte-for-byte.
pub(crate) fn sign_at(
    req: &mut Request,
    access_id: &str,
    signing_key: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    // '(request-target)' is 'method_lowercase path[?query]'
    let url = req.url().clone();
    let mut request_target =
        format!("{} {}", req.method().as_str().to_lowercase(), url.path());
    if let Some(query) = url.query() {
        request_target.push('?');
        request_target.push_str(query);
    }

    let created = now.timestamp().to_string();

    // Body bytes drive both Content-Length and the Digest; an absent
    // body digests as empty.
    let body: Vec<u8> = req
        .body()
        .and_then(|b| b.as_bytes())
        .map(<[u8]>::to_vec)
        .unwrap_or_default();
    let has_body = req.body().is_some();

    let headers = req.headers_mut();
    headers.insert(CONTENT_TYPE, header_value("application/json")?);

    // The Host header must be present to be signed. The port is elided
    // when it is the default for the scheme (the url crate normalizes
    // default ports away).
    if !headers.contains_key(HOST) {
        let mut host = url.host_str().unwrap_or_default().to_string();
        if let Some(port) = url.port() {
            host.push(':');
            host.push_str(&port.to_string());
        }
        headers.insert(HOST, header_value(&host)?);
    }

    if !headers.contains_key(DATE) {
        let date = now.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        headers.insert(DATE, header_value(&date)?);
    }

    if has_body && !headers.contains_key(CONTENT_LENGTH) {
        headers.insert(CONTENT_LENGTH, header_value(&body.len().to_string())?);
    }

    // The Digest header is always set/overridden, even for empty bodies.
    let digest = format!(
        "SHA-512={}",
        general_purpose::STANDARD.encode(Sha512::digest(&body))
    );
    headers.insert("Digest", header_value(&digest)?);

    let mut mac = HmacSha512::new_from_slice(signing_key.as_bytes())
        .map_err(|e| Error::Crypto(format!("signing key: {e}")))?;
    let mut signed_names = Vec::with_capacity(SIGNED_HEADERS.len());

    for &name in SIGNED_HEADERS {
        let value = match name {
            "(created)" => Some(created.clone()),
            "(request-target)" => Some(request_target.clone()),
            _ => headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        };
        if let Some(value) = value {
            let lower = name.to_lowercase();
            mac.update(format!("{lower}: {value}\n").as_bytes());
            signed_names.push(lower);
        }
    }

    let signature = general_purpose::STANDARD.encode(mac.finalize().into_bytes());
    let header = format!(
        "keyId=\"{access_id}\", algorithm=\"hmac-sha512\", created={created}, \
         headers=\"{}\", signature=\"{signature}\"",
        signed_names.join(" ")
    );
    req.headers_mut().insert("Signature", header_value(&header)?);

    Ok(())
}

fn header_value(s: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(s).map_err(|e| Error::Crypto(format!("header value: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::blocking::Client;

    fn signed_get(url: &str) -> Request {
        let client = Client::new();
        let mut req = client.get(url).build().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap();
        sign_at(&mut req, "papi-id", "sapi-secret", now).unwrap();
        req
    }

    #[test]
    fn signature_is_deterministic() {
        let a = signed_get("https://api.example.test/api/v0/ffs?ffs_name=SSN&papi=x");
        let b = signed_get("https://api.example.test/api/v0/ffs?ffs_name=SSN&papi=x");
        assert_eq!(a.headers()["Signature"], b.headers()["Signature"]);
        assert_eq!(a.headers()["Digest"], b.headers()["Digest"]);
        assert_eq!(a.headers()["Date"], b.headers()["Date"]);
    }

    #[test]
    fn empty_body_digest_is_the_sha512_of_nothing() {
        let req = signed_get("https://api.example.test/api/v0/ffs");
        // SHA-512 of the empty string, base64-encoded
        assert_eq!(
            req.headers()["Digest"].to_str().unwrap(),
            "SHA-512=z4PhNX7vuL3xVChQ1m2AB9Yg5AULVxXcg/SpIdNs6c5H0NE8XYXysP+DGNKHfuwvY7kxvUdBeoGlODJ6+SfaPg=="
        );
    }

    #[test]
    fn header_fields_and_order() {
        let req = signed_get("https://api.example.test/api/v0/ffs?papi=x");
        let sig = req.headers()["Signature"].to_str().unwrap();
        assert!(sig.starts_with("keyId=\"papi-id\", algorithm=\"hmac-sha512\", created=1706788800, "));
        // GET carries no body, so content-length is not signed
        assert!(sig.contains("headers=\"(created) (request-target) content-type date digest host\""));
        assert_eq!(req.headers()[HOST], "api.example.test");
        assert_eq!(req.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(
            req.headers()[DATE].to_str().unwrap(),
            "Thu, 01 Feb 2024 12:00:00 GMT"
        );
    }

    #[test]
    fn explicit_port_is_kept_in_host() {
        let req = signed_get("http://localhost:8080/api/v0/ffs");
        assert_eq!(req.headers()[HOST], "localhost:8080");

        // default ports are normalized away by the url parser
        let req = signed_get("https://api.example.test:443/api/v0/ffs");
        assert_eq!(req.headers()[HOST], "api.example.test");
    }

    #[test]
    fn body_is_signed_with_content_length() {
        let client = Client::new();
        let mut req = client
            .post("https://api.example.test/api/v0/encryption/key")
            .body(r#"{"uses":1}"#)
            .build()
            .unwrap();
        let now = Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap();
        sign_at(&mut req, "id", "key", now).unwrap();

        assert_eq!(req.headers()[CONTENT_LENGTH], "10");
        let sig = req.headers()["Signature"].to_str().unwrap();
        assert!(sig.contains(
            "headers=\"(created) (request-target) content-length content-type date digest host\""
        ));
    }
}
