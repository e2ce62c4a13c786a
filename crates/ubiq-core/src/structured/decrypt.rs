//! Structured (format-preserving) decryption front end.

use crate::client::DataKey;
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::events::{BillingAction, DatasetType};
use crate::structured::dataset::Dataset;
use crate::structured::encrypt::ff1_context;
use crate::structured::ff1;
use crate::structured::format;

/// Decryption state for one dataset. The key is fetched lazily: the
/// ciphertext itself says which key number produced it, and the context
/// is rebuilt only when that number changes.
pub struct Decryption {
    creds: Credentials,
    dataset: Dataset,
    ics: Vec<char>,
    ocs: Vec<char>,
    key: Option<(DataKey, ff1::Context)>,
}

impl Decryption {
    pub fn new(creds: &Credentials, dataset_name: &str) -> Result<Self> {
        let dataset = creds.dataset(dataset_name)?;
        Ok(Decryption {
            creds: creds.clone(),
            ics: dataset.input_character_set.chars().collect(),
            ocs: dataset.output_character_set.chars().collect(),
            dataset,
            key: None,
        })
    }

    /// Decrypt one value. `tweak` must match whatever was used at
    /// encrypt time.
    pub fn cipher(&mut self, ciphertext: &str, tweak: Option<&[u8]>) -> Result<String> {
        // alphabets swap roles on the way back in
        let (fmt, trimmed, rules) = format::fmt_input(
            ciphertext,
            &self.dataset.passthrough,
            &self.dataset.output_character_set,
            &self.dataset.input_character_set,
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

        let (trimmed, key_number) =
            format::decode_key_number(&trimmed, &self.ocs, self.dataset.msb_encoding_bits)?;

        if self.key.as_ref().map(|(k, _)| k.key_number) != Some(key_number) {
            let key = self
                .creds
                .structured_key(&self.dataset.name, key_number)?;
            let ctx = ff1_context(&self.dataset, &key)?;
            self.key = Some((key, ctx));
        }

        let converted = format::str_convert_radix(&trimmed, &self.ocs, &self.ics)?;
        let (_, ctx) = self.key.as_ref().ok_or_else(|| {
            Error::Crypto("no structured key".into())
        })?;
        let pt = ctx.decrypt(&converted, tweak)?;

        self.creds.add_event(
            &self.dataset.name,
            "",
            BillingAction::Decrypt,
            DatasetType::Structured,
            key_number,
        );

        format::fmt_output(&fmt, &pt, &rules)
    }
}

/// Decrypt `ciphertext` under the named dataset.
pub fn decrypt(
    creds: &Credentials,
    dataset_name: &str,
    ciphertext: &str,
    tweak: Option<&[u8]>,
) -> Result<String> {
    let result = Decryption::new(creds, dataset_name)?.cipher(ciphertext, tweak)?;
    creds.process_events_sync()?;
    Ok(result)
}
