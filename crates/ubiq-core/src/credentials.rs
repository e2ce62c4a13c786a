//! Credentials and the per-credential runtime they own.
//!
//! A [`Credentials`] value carries the three API secrets and the host,
//! plus everything scoped to them: the effective [`Configuration`], the
//! signed KMS client, the dataset/key caches and the usage-event
//! aggregator with its processor. It is cheap to clone and safe to share
//! across threads.
//!
//! Sources, in precedence order: explicit values, process environment
//! (`UBIQ_ACCESS_KEY_ID`, `UBIQ_SECRET_SIGNING_KEY`,
//! `UBIQ_SECRET_CRYPTO_ACCESS_KEY`, `UBIQ_SERVER`), and an INI-style
//! credentials file (default `~/.ubiq/credentials`) where a named
//! profile overrides the `[default]` section.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use zeroize::Zeroizing;

use crate::cache::{Caches, DatasetId, StructuredKeyId, UnstructuredKeyId};
use crate::client::{self, DataKey, KmsClient, WrappedDataKey};
use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::events::{BillingAction, DatasetType, EventAggregator, EventProcessor, FlushGate};
use crate::structured::Dataset;
use crate::UBIQ_HOST;

struct Inner {
    access_key_id: String,
    secret_signing_key: String,
    secret_crypto_access_key: Zeroizing<String>,
    host: String,
    config: Arc<Configuration>,
    client: KmsClient,
    caches: Caches,
    events: Arc<EventAggregator>,
    processor: Mutex<Option<EventProcessor>>,
    sync_gate: Option<FlushGate>,
}

#[derive(Clone)]
pub struct Credentials {
    inner: Arc<Inner>,
}

/// Staged construction for [`Credentials`].
#[derive(Default)]
pub struct CredentialsBuilder {
    access_key_id: Option<String>,
    secret_signing_key: Option<String>,
    secret_crypto_access_key: Option<String>,
    host: Option<String>,
    credentials_file: Option<PathBuf>,
    profile: Option<String>,
    configuration: Option<Configuration>,
    request_timeout: Option<Duration>,
}

impl CredentialsBuilder {
    pub fn access_key_id(mut self, v: &str) -> Self {
        self.access_key_id = Some(v.to_string());
        self
    }

    pub fn secret_signing_key(mut self, v: &str) -> Self {
        self.secret_signing_key = Some(v.to_string());
        self
    }

    pub fn secret_crypto_access_key(mut self, v: &str) -> Self {
        self.secret_crypto_access_key = Some(v.to_string());
        self
    }

    pub fn host(mut self, v: &str) -> Self {
        self.host = Some(v.to_string());
        self
    }

    /// Read missing fields from this credentials file instead of the
    /// default `~/.ubiq/credentials`.
    pub fn credentials_file(mut self, path: &Path) -> Self {
        self.credentials_file = Some(path.to_path_buf());
        self
    }

    pub fn profile(mut self, name: &str) -> Self {
        self.profile = Some(name.to_string());
        self
    }

    /// Use this configuration instead of loading the configuration file.
    pub fn configuration(mut self, config: Configuration) -> Self {
        self.configuration = Some(config);
        self
    }

    /// Deadline applied to every KMS call made through these
    /// credentials.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<Credentials> {
        let from_env = |name: &'static str| std::env::var(name).ok().filter(|v| !v.is_empty());

        let mut access_key_id = self.access_key_id.or_else(|| from_env("UBIQ_ACCESS_KEY_ID"));
        let mut secret_signing_key = self
            .secret_signing_key
            .or_else(|| from_env("UBIQ_SECRET_SIGNING_KEY"));
        let mut secret_crypto_access_key = self
            .secret_crypto_access_key
            .or_else(|| from_env("UBIQ_SECRET_CRYPTO_ACCESS_KEY"));
        let mut host = self.host.or_else(|| from_env("UBIQ_SERVER"));

        // Whatever is still missing comes from the credentials file, the
        // requested profile overriding [default].
        if access_key_id.is_none()
            || secret_signing_key.is_none()
            || secret_crypto_access_key.is_none()
        {
            let path = match &self.credentials_file {
                Some(p) => p.clone(),
                None => default_credentials_path(),
            };
            if path.exists() {
                let file = CredentialsFile::load(&path)?;
                let profile = self.profile.as_deref().unwrap_or("default");
                access_key_id = access_key_id.or_else(|| file.get(profile, "access_key_id"));
                secret_signing_key =
                    secret_signing_key.or_else(|| file.get(profile, "secret_signing_key"));
                secret_crypto_access_key = secret_crypto_access_key
                    .or_else(|| file.get(profile, "secret_crypto_access_key"));
                host = host.or_else(|| file.get(profile, "server"));
            }
        }

        let access_key_id = access_key_id.ok_or(Error::CredentialsMissing("access_key_id"))?;
        let secret_signing_key =
            secret_signing_key.ok_or(Error::CredentialsMissing("secret_signing_key"))?;
        let secret_crypto_access_key = secret_crypto_access_key
            .ok_or(Error::CredentialsMissing("secret_crypto_access_key"))?;
        let host = normalize_host(host.as_deref().unwrap_or(UBIQ_HOST));

        let config = Arc::new(match self.configuration {
            Some(c) => c,
            None => Configuration::load(None)?,
        });

        let client = KmsClient::new(
            &host,
            &access_key_id,
            &secret_signing_key,
            self.request_timeout,
        )?;
        let caches = Caches::new(&config);
        let events = Arc::new(EventAggregator::new(client.clone(), Arc::clone(&config)));

        let synchronous = config.event_reporting.synchronous;
        let processor = if synchronous {
            None
        } else {
            Some(EventProcessor::start(
                Arc::clone(&events),
                Arc::clone(&config),
            ))
        };

        Ok(Credentials {
            inner: Arc::new(Inner {
                access_key_id,
                secret_signing_key,
                secret_crypto_access_key: Zeroizing::new(secret_crypto_access_key),
                host,
                sync_gate: synchronous.then(|| FlushGate::new(&config)),
                config,
                client,
                caches,
                events,
                processor: Mutex::new(processor),
            }),
        })
    }
}

impl Credentials {
    pub fn builder() -> CredentialsBuilder {
        CredentialsBuilder::default()
    }

    /// Explicit values with environment fallback for anything omitted.
    pub fn new(
        access_key_id: Option<&str>,
        secret_signing_key: Option<&str>,
        secret_crypto_access_key: Option<&str>,
        host: Option<&str>,
    ) -> Result<Self> {
        let mut builder = Credentials::builder();
        if let Some(v) = access_key_id {
            builder = builder.access_key_id(v);
        }
        if let Some(v) = secret_signing_key {
            builder = builder.secret_signing_key(v);
        }
        if let Some(v) = secret_crypto_access_key {
            builder = builder.secret_crypto_access_key(v);
        }
        if let Some(v) = host {
            builder = builder.host(v);
        }
        builder.build()
    }

    /// Load from a credentials file (default `~/.ubiq/credentials`),
    /// profile overriding `[default]`.
    pub fn from_file(path: Option<&Path>, profile: Option<&str>) -> Result<Self> {
        let mut builder = Credentials::builder();
        if let Some(p) = path {
            builder = builder.credentials_file(p);
        }
        if let Some(p) = profile {
            builder = builder.profile(p);
        }
        builder.build()
    }

    pub fn access_key_id(&self) -> &str {
        &self.inner.access_key_id
    }

    pub fn secret_signing_key(&self) -> &str {
        &self.inner.secret_signing_key
    }

    pub(crate) fn secret_crypto_access_key(&self) -> &str {
        &self.inner.secret_crypto_access_key
    }

    /// Normalized host, always carrying a scheme.
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn configuration(&self) -> &Configuration {
        &self.inner.config
    }

    pub(crate) fn client(&self) -> &KmsClient {
        &self.inner.client
    }

    /// Attach user metadata (valid JSON, at most 1024 characters) to
    /// every subsequently reported usage event.
    pub fn set_event_metadata(&self, metadata: &str) -> Result<()> {
        self.inner.events.set_user_defined(metadata)
    }

    /// Most recent background flush failure, if any.
    pub fn last_event_error(&self) -> Option<Error> {
        let guard = self.inner.processor.lock().expect("processor lock");
        guard.as_ref().and_then(|p| p.last_error())
    }

    /// Flush queued usage events now, regardless of thresholds.
    pub fn process_events(&self) -> Result<()> {
        self.inner.events.process()
    }

    /// Stop the background processor (if any) and flush the remainder.
    /// Reliable event delivery requires calling this before exit;
    /// `Drop` performs the same close on a best-effort basis.
    pub fn close(&self) -> Result<()> {
        let processor = self.inner.processor.lock().expect("processor lock").take();
        match processor {
            Some(mut p) => {
                p.graceful_close();
                match p.last_error() {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
            // synchronous mode: flush inline
            None => self.inner.events.process(),
        }
    }

    pub(crate) fn add_event(
        &self,
        dataset: &str,
        dataset_group: &str,
        action: BillingAction,
        dataset_type: DatasetType,
        key_number: i32,
    ) {
        self.inner.events.add_event(
            &self.inner.access_key_id,
            dataset,
            dataset_group,
            action,
            dataset_type,
            key_number,
            1,
        );
    }

    /// In synchronous reporting mode, flush through the gate from the
    /// calling thread. No-op when the background worker owns flushing.
    pub(crate) fn process_events_sync(&self) -> Result<()> {
        let Some(gate) = &self.inner.sync_gate else {
            return Ok(());
        };
        if gate.should_flush(self.inner.events.count()) {
            self.inner.events.process()?;
            gate.reset();
        }
        Ok(())
    }

    /// Evict a cached dataset definition (all definitions when `None`),
    /// forcing the next structured operation to refetch it.
    pub fn flush_dataset(&self, name: Option<&str>) {
        self.inner
            .caches
            .flush_dataset(&self.inner.access_key_id, name);
    }

    /// Evict one cached structured key; `-1` drops the "current" slot.
    pub fn flush_key(&self, dataset_name: &str, key_number: i32) {
        let id = self.structured_key_id(dataset_name, key_number);
        self.inner.caches.flush_structured_key(Some(&id));
    }

    /// Evict every cached structured key for these credentials.
    pub fn flush_keys(&self) {
        self.inner.caches.flush_structured_key(None);
    }

    pub(crate) fn dataset(&self, name: &str) -> Result<Dataset> {
        let id = DatasetId {
            papi: self.inner.access_key_id.clone(),
            name: name.to_string(),
        };
        self.inner
            .caches
            .dataset(id, || self.inner.client.fetch_dataset(name))
    }

    fn structured_key_id(&self, dataset_name: &str, key_number: i32) -> StructuredKeyId {
        StructuredKeyId {
            host: self.inner.host.clone(),
            papi: self.inner.access_key_id.clone(),
            sapi: self.inner.secret_signing_key.clone(),
            srsa: self.inner.secret_crypto_access_key.to_string(),
            dataset: dataset_name.to_string(),
            key_number,
        }
    }

    /// Structured key by number; `-1` asks the server for the current
    /// key and caches it under both identities.
    pub(crate) fn structured_key(&self, dataset_name: &str, key_number: i32) -> Result<DataKey> {
        let id = self.structured_key_id(dataset_name, key_number);
        self.inner.caches.structured_key(id, || {
            let n = (key_number >= 0).then_some(key_number);
            self.inner.client.fetch_key(dataset_name, n)
        })
    }

    /// Every key defined for a dataset, ordered by key number.
    pub(crate) fn structured_keys_all(&self, dataset_name: &str) -> Result<Vec<DataKey>> {
        let (pem, wrapped_keys) = self.inner.client.fetch_all_keys(dataset_name)?;
        let private_key = client::load_private_key(&pem, self.secret_crypto_access_key())?;

        let mut out = Vec::with_capacity(wrapped_keys.len());
        for (n, wrapped) in wrapped_keys.into_iter().enumerate() {
            let n = n as i32;
            let id = self.structured_key_id(dataset_name, n);
            if let Some(hit) = self.inner.caches.peek_structured_key(&id) {
                out.push(hit?);
                continue;
            }

            let raw = client::unwrap_with(&private_key, &wrapped)?;
            let key = DataKey {
                raw,
                key_number: n,
                key_fingerprint: String::new(),
                encryption_session: None,
            };
            let record = WrappedDataKey {
                encrypted_private_key: pem.clone(),
                wrapped_data_key: wrapped,
                key_number: n,
                key_fingerprint: String::new(),
                encryption_session: None,
            };
            self.inner.caches.insert_structured_key(id, record, &key);
            out.push(key);
        }
        Ok(out)
    }

    /// Key for an unstructured ciphertext header, via the decrypt-key
    /// cache when enabled.
    pub(crate) fn unstructured_key(&self, wrapped_data_key: &[u8]) -> Result<DataKey> {
        let id = UnstructuredKeyId {
            papi: self.inner.access_key_id.clone(),
            wrapped_data_key: wrapped_data_key.to_vec(),
        };
        self.inner
            .caches
            .unstructured_key(id, self.secret_crypto_access_key(), || {
                self.inner.client.fetch_decrypt_key(wrapped_data_key)
            })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.inner.access_key_id)
            .field("host", &self.inner.host)
            .finish_non_exhaustive()
    }
}

/// Prefix `https://` when no scheme is present; strip trailing slashes.
pub(crate) fn normalize_host(host: &str) -> String {
    let trimmed = host.trim_end_matches('/');
    if trimmed.to_lowercase().starts_with("http") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

fn default_credentials_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ubiq")
        .join("credentials")
}

/// Minimal INI reader: `[section]` headers, `key = value` pairs, `#`/`;`
/// comments. Keys are looked up case-insensitively so `SERVER` and
/// `server` both work, as in the credential files the other SDKs read.
struct CredentialsFile {
    sections: HashMap<String, HashMap<String, String>>,
}

impl CredentialsFile {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigInvalid(format!("credentials file {}: {e}", path.display()))
        })?;
        Ok(Self::parse(&text))
    }

    fn parse(text: &str) -> Self {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current = String::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                current = line[1..line.len() - 1].trim().to_string();
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                sections
                    .entry(current.clone())
                    .or_default()
                    .insert(key.trim().to_lowercase(), value.trim().to_string());
            }
        }
        CredentialsFile { sections }
    }

    /// Profile value, falling back to `[default]`.
    fn get(&self, profile: &str, key: &str) -> Option<String> {
        self.sections
            .get(profile)
            .and_then(|s| s.get(key))
            .or_else(|| self.sections.get("default").and_then(|s| s.get(key)))
            .cloned()
    }
}
