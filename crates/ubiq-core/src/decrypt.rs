//! Unstructured decryption.
//!
//! A [`Decryption`] session consumes a byte stream that may carry
//! several concatenated pieces. Bytes are buffered until the
//! self-describing header is complete, the wrapped key inside it is sent
//! to the server for unwrapping (or reused, when it matches the previous
//! piece's key), and the remainder is decrypted when [`end`] verifies
//! the trailing tag. The caller frames pieces with
//! `begin → update* → end`; after `end` the session is back at the start
//! of the state machine and may be fed the next piece.
//!
//! [`end`]: Decryption::end

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::algorithm::Algorithm;
use crate::client::DataKey;
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::events::{BillingAction, DatasetType};
use crate::header::Header;

/// A key held across pieces, tagged with the digest of the wrapped blob
/// it came from so reuse can be recognized without another server trip.
struct SessionKey {
    client_id: [u8; 32],
    key: DataKey,
}

pub struct Decryption {
    creds: Credentials,
    buf: Vec<u8>,
    header: Option<Header>,
    algorithm: Option<&'static Algorithm>,
    key: Option<SessionKey>,
    in_piece: bool,
}

impl Decryption {
    pub fn new(creds: &Credentials) -> Self {
        Decryption {
            creds: creds.clone(),
            buf: Vec::new(),
            header: None,
            algorithm: None,
            key: None,
            in_piece: false,
        }
    }

    /// Start a piece. Takes no data: nothing can be decided until the
    /// header arrives via [`update`](Self::update).
    pub fn begin(&mut self) -> Result<Vec<u8>> {
        if self.in_piece {
            return Err(Error::IllegalState("decryption already in progress"));
        }
        self.in_piece = true;
        Ok(Vec::new())
    }

    /// Feed ciphertext in stream order. The header is parsed as soon as
    /// it is complete (fetching or reusing the key); plaintext is
    /// withheld until [`end`](Self::end) verifies the tag, so the
    /// returned buffer is always empty.
    pub fn update(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if !self.in_piece {
            return Err(Error::IllegalState("no decryption in progress"));
        }
        self.buf.extend_from_slice(data);

        if self.header.is_none() {
            if let Some((header, consumed)) = Header::parse(&self.buf)? {
                self.buf.drain(..consumed);
                self.algorithm = Some(Algorithm::by_id(header.algorithm)?);
                self.acquire_key(&header)?;
                self.header = Some(header);
            }
        }
        Ok(Vec::new())
    }

    /// Finish the piece: verifies the tag over everything buffered and
    /// returns the plaintext. The session keeps its key afterwards, so a
    /// following piece wrapped with the same key skips the server.
    pub fn end(&mut self) -> Result<Vec<u8>> {
        if !self.in_piece {
            return Err(Error::IllegalState("no decryption in progress"));
        }

        let result = self.finish_piece();

        // whatever happened, the piece is over
        self.buf.clear();
        self.header = None;
        self.algorithm = None;
        self.in_piece = false;

        result
    }

    fn finish_piece(&mut self) -> Result<Vec<u8>> {
        let header = self
            .header
            .as_ref()
            .ok_or_else(|| Error::InvalidHeader("incomplete header".into()))?;
        let algorithm = self.algorithm.ok_or_else(|| {
            Error::InvalidHeader("incomplete header".into())
        })?;
        if self.buf.len() < algorithm.tag_len {
            return Err(Error::InvalidLength(
                "ciphertext truncated below tag length".into(),
            ));
        }
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| Error::Crypto("no session key".into()))?;

        let aad = if header.aad_enabled() {
            header.serialize()
        } else {
            Vec::new()
        };

        let cipher = Aes256Gcm::new_from_slice(&key.key.raw)
            .map_err(|e| Error::Crypto(format!("cipher init: {e}")))?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&header.iv),
                Payload {
                    msg: &self.buf,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::Crypto("integrity check failed".into()))?;

        self.creds.add_event(
            "",
            "",
            BillingAction::Decrypt,
            DatasetType::Unstructured,
            key.key.key_number,
        );
        Ok(plaintext)
    }

    /// Reuse the held key when the header carries the same wrapped blob;
    /// otherwise drop it and ask the server.
    fn acquire_key(&mut self, header: &Header) -> Result<()> {
        let client_id: [u8; 32] = Sha256::digest(&header.wrapped_data_key).into();

        if let Some(existing) = &self.key {
            if existing.client_id == client_id {
                return Ok(());
            }
            self.key = None;
        }

        let key = self.creds.unstructured_key(&header.wrapped_data_key)?;
        debug!(target: "ubiq::decrypt", client_id = %hex::encode(client_id), "session key ready");
        self.key = Some(SessionKey { client_id, key });
        Ok(())
    }

    /// Abort any piece in progress and forget the held key.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.header = None;
        self.algorithm = None;
        self.key = None;
        self.in_piece = false;
    }
}

/// One-shot convenience: decrypt a complete `header || ciphertext || tag`
/// buffer.
pub fn decrypt(creds: &Credentials, data: &[u8]) -> Result<Vec<u8>> {
    let mut dec = Decryption::new(creds);
    let mut out = dec.begin()?;
    out.extend(dec.update(data)?);
    out.extend(dec.end()?);
    creds.process_events_sync()?;
    Ok(out)
}
