//! Unstructured encryption.
//!
//! An [`Encryption`] session owns one data key, good for up to
//! `max_uses` independent pieces. Each piece is framed as a
//! self-describing header followed by the AES-256-GCM ciphertext with
//! the 16-byte tag appended. The header's flags byte is zero unless the
//! caller opts into binding the header bytes as AEAD associated data.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use tracing::debug;

use crate::algorithm::Algorithm;
use crate::client::DataKey;
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::events::{BillingAction, DatasetType};
use crate::header::Header;

struct Piece {
    header: Vec<u8>,
    iv: [u8; 12],
    plaintext: Vec<u8>,
    authenticated: bool,
}

pub struct Encryption {
    creds: Credentials,
    key: DataKey,
    /// The data key wrapped by the server's master key; embedded in
    /// every header so the server can recover it at decrypt time.
    encrypted_data_key: Vec<u8>,
    algorithm: &'static Algorithm,
    uses: u32,
    max_uses: u32,
    authenticate_header: bool,
    piece: Option<Piece>,
    closed: bool,
}

impl Encryption {
    /// Request a data key usable for `uses` encryptions. The server may
    /// grant fewer; the session enforces whichever bound came back.
    pub fn new(creds: &Credentials, uses: u32) -> Result<Self> {
        let resp = creds.client().fetch_encryption_key(uses)?;
        let algorithm = Algorithm::by_name(&resp.security_model.algorithm)?;

        let key = resp.key.unwrap_key(creds.secret_crypto_access_key())?;
        if key.raw.len() != algorithm.key_len {
            return Err(Error::Crypto(format!(
                "unexpected data key length {}",
                key.raw.len()
            )));
        }
        let encrypted_data_key = general_purpose::STANDARD
            .decode(&resp.encrypted_data_key)
            .map_err(|e| Error::Crypto(format!("encrypted data key: {e}")))?;

        Ok(Encryption {
            creds: creds.clone(),
            key,
            encrypted_data_key,
            algorithm,
            uses: 0,
            max_uses: resp.max_uses,
            authenticate_header: false,
            piece: None,
            closed: false,
        })
    }

    /// Bind the header bytes of subsequent pieces as AEAD associated
    /// data. Off by default; the header's flags byte records the choice
    /// so decryption honors it.
    pub fn authenticate_header(&mut self, enable: bool) {
        self.authenticate_header = enable;
    }

    /// Start a piece: burns one use and returns the header bytes that
    /// must lead the ciphertext stream.
    pub fn begin(&mut self) -> Result<Vec<u8>> {
        if self.piece.is_some() {
            return Err(Error::IllegalState("encryption already in progress"));
        }
        if self.uses >= self.max_uses {
            return Err(Error::QuotaExceeded);
        }
        self.uses += 1;

        let mut iv = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let header = Header::new(
            self.algorithm.id,
            iv.to_vec(),
            self.encrypted_data_key.clone(),
            self.authenticate_header,
        )
        .serialize();

        self.creds.add_event(
            "",
            "",
            BillingAction::Encrypt,
            DatasetType::Unstructured,
            self.key.key_number,
        );

        self.piece = Some(Piece {
            header: header.clone(),
            iv,
            plaintext: Vec::new(),
            authenticated: self.authenticate_header,
        });
        Ok(header)
    }

    /// Feed plaintext. Ciphertext is withheld until [`end`](Self::end)
    /// so the tag can be computed over the whole piece; the returned
    /// buffer is always empty.
    pub fn update(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let piece = self
            .piece
            .as_mut()
            .ok_or(Error::IllegalState("no encryption in progress"))?;
        piece.plaintext.extend_from_slice(plaintext);
        Ok(Vec::new())
    }

    /// Finish the piece: returns the ciphertext with the 16-byte tag
    /// appended. When header authentication was requested, the header
    /// bytes are bound as associated data.
    pub fn end(&mut self) -> Result<Vec<u8>> {
        let piece = self
            .piece
            .take()
            .ok_or(Error::IllegalState("no encryption in progress"))?;

        let aad: &[u8] = if piece.authenticated { &piece.header } else { &[] };
        let cipher = Aes256Gcm::new_from_slice(&self.key.raw)
            .map_err(|e| Error::Crypto(format!("cipher init: {e}")))?;
        cipher
            .encrypt(
                Nonce::from_slice(&piece.iv),
                Payload {
                    msg: &piece.plaintext,
                    aad,
                },
            )
            .map_err(|_| Error::Crypto("encryption failed".into()))
    }

    /// Report unused uses back to the server. Best-effort: failures are
    /// swallowed, and `Drop` calls this too. Call it explicitly when the
    /// report matters.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.uses >= self.max_uses {
            return;
        }
        if let Some(session) = self.key.encryption_session.clone() {
            let result = self.creds.client().update_encryption_key_usage(
                &self.key.key_fingerprint,
                &session,
                self.max_uses,
                self.uses,
            );
            if let Err(e) = result {
                debug!(target: "ubiq::encrypt", error = %e, "usage update failed");
            }
        }
    }
}

impl Drop for Encryption {
    fn drop(&mut self) {
        self.close();
    }
}

/// One-shot convenience: encrypt `plaintext` with a fresh single-use
/// key, returning `header || ciphertext || tag`.
pub fn encrypt(creds: &Credentials, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut enc = Encryption::new(creds, 1)?;
    let mut out = enc.begin()?;
    out.extend(enc.update(plaintext)?);
    out.extend(enc.end()?);
    enc.close();
    creds.process_events_sync()?;
    Ok(out)
}
