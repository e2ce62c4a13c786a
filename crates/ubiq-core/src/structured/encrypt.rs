//! Structured (format-preserving) encryption front end.

use base64::{engine::general_purpose, Engine as _};

use crate::client::DataKey;
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::events::{BillingAction, DatasetType};
use crate::structured::dataset::Dataset;
use crate::structured::ff1;
use crate::structured::format;

/// Build an FF1 context for a dataset/key pair, rejecting any other
/// server-side algorithm.
pub(crate) fn ff1_context(dataset: &Dataset, key: &DataKey) -> Result<ff1::Context> {
    if dataset.encryption_algorithm != "FF1" {
        return Err(Error::UnsupportedAlgorithm(
            dataset.encryption_algorithm.clone(),
        ));
    }
    let tweak = general_purpose::STANDARD
        .decode(&dataset.tweak)
        .map_err(|e| Error::Crypto(format!("dataset tweak: {e}")))?;
    let ics: Vec<char> = dataset.input_character_set.chars().collect();
    ff1::Context::new(
        &key.raw,
        tweak,
        dataset.tweak_min_len,
        dataset.tweak_max_len,
        ics.len(),
        ics,
    )
}

/// A dataset's definition and current key, reusable across many
/// plaintexts. FPE is deterministic: the same input under the same key
/// and tweak always yields the same ciphertext.
pub struct Encryption {
    creds: Credentials,
    dataset: Dataset,
    ics: Vec<char>,
    ocs: Vec<char>,
    key: DataKey,
    ctx: ff1::Context,
}

impl Encryption {
    pub fn new(creds: &Credentials, dataset_name: &str) -> Result<Self> {
        let dataset = creds.dataset(dataset_name)?;
        let key = creds.structured_key(dataset_name, -1)?;
        let ctx = ff1_context(&dataset, &key)?;
        Ok(Encryption {
            creds: creds.clone(),
            ics: dataset.input_character_set.chars().collect(),
            ocs: dataset.output_character_set.chars().collect(),
            dataset,
            key,
            ctx,
        })
    }

    /// Encrypt one value with the dataset's current key. `tweak`
    /// overrides the dataset tweak for this call.
    pub fn cipher(&self, plaintext: &str, tweak: Option<&[u8]>) -> Result<String> {
        let (fmt, trimmed, rules) = format::fmt_input(
            plaintext,
            &self.dataset.passthrough,
            &self.dataset.input_character_set,
            &self.dataset.output_character_set,
            &self.dataset.passthrough_rules,
        )?;

        let len = trimmed.len();
        if len < self.dataset.min_input_length || len > self.dataset.max_input_length {
            return Err(Error::length(
                len,
                self.dataset.min_input_length,
                self.dataset.max_input_length,
            ));
        }

        let ct = self.ctx.encrypt(&trimmed, tweak)?;
        let ct = format::str_convert_radix(&ct, &self.ics, &self.ocs)?;
        let ct = format::encode_key_number(
            &ct,
            &self.ocs,
            self.key.key_number,
            self.dataset.msb_encoding_bits,
        )?;

        self.creds.add_event(
            &self.dataset.name,
            "",
            BillingAction::Encrypt,
            DatasetType::Structured,
            self.key.key_number,
        );

        format::fmt_output(&fmt, &ct, &rules)
    }

    /// Encrypt one value under *every* key of the dataset, ordered by
    /// key number, for point-equality search over stored ciphertexts.
    /// The current-key ciphertext from [`cipher`](Self::cipher) is a
    /// member of the result.
    pub fn cipher_for_search(&self, plaintext: &str, tweak: Option<&[u8]>) -> Result<Vec<String>> {
        let keys = self.creds.structured_keys_all(&self.dataset.name)?;

        let (fmt, trimmed, rules) = format::fmt_input(
            plaintext,
            &self.dataset.passthrough,
            &self.dataset.input_character_set,
            &self.dataset.output_character_set,
            &self.dataset.passthrough_rules,
        )?;

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let ctx = ff1_context(&self.dataset, &key)?;
            let ct = ctx.encrypt(&trimmed, tweak)?;
            let ct = format::str_convert_radix(&ct, &self.ics, &self.ocs)?;
            let ct = format::encode_key_number(
                &ct,
                &self.ocs,
                key.key_number,
                self.dataset.msb_encoding_bits,
            )?;
            out.push(format::fmt_output(&fmt, &ct, &rules)?);
        }
        Ok(out)
    }
}

/// Encrypt `plaintext` under the named dataset's current key.
pub fn encrypt(
    creds: &Credentials,
    dataset_name: &str,
    plaintext: &str,
    tweak: Option<&[u8]>,
) -> Result<String> {
    let result = Encryption::new(creds, dataset_name)?.cipher(plaintext, tweak)?;
    creds.process_events_sync()?;
    Ok(result)
}

/// Encrypt `plaintext` under every key of the named dataset.
pub fn encrypt_for_search(
    creds: &Credentials,
    dataset_name: &str,
    plaintext: &str,
    tweak: Option<&[u8]>,
) -> Result<Vec<String>> {
    let result = Encryption::new(creds, dataset_name)?.cipher_for_search(plaintext, tweak)?;
    creds.process_events_sync()?;
    Ok(result)
}
