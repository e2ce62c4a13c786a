//! Usage-event aggregation and reporting.
//!
//! Every encrypt/decrypt records one event. Events with the same
//! coalescing key (credential, dataset, action, key number, user
//! metadata) are summed into a single record under one mutex; a
//! background worker (or, in synchronous mode, the calling thread)
//! periodically swaps the map out atomically and POSTs the batch to the
//! tracking endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::client::KmsClient;
use crate::config::{Configuration, TimestampGranularity};
use crate::error::{Error, Result};

pub(crate) const PRODUCT: &str = "ubiq-rust";
pub(crate) const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BillingAction {
    Encrypt,
    Decrypt,
}

impl BillingAction {
    fn as_str(self) -> &'static str {
        match self {
            BillingAction::Encrypt => "encrypt",
            BillingAction::Decrypt => "decrypt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetType {
    Unstructured,
    Structured,
}

impl DatasetType {
    fn as_str(self) -> &'static str {
        match self {
            DatasetType::Unstructured => "unstructured",
            DatasetType::Structured => "structured",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EventKey {
    api_key: String,
    dataset: String,
    dataset_group: String,
    action: BillingAction,
    dataset_type: DatasetType,
    key_number: i32,
    user_defined: String,
}

#[derive(Debug, Clone)]
struct EventRecord {
    count: u64,
    first_call: DateTime<Utc>,
    last_call: DateTime<Utc>,
}

#[derive(Default)]
struct EventMap {
    events: HashMap<EventKey, EventRecord>,
    total: u64,
}

#[derive(Serialize)]
struct ReportedEvent {
    datasets: String,
    dataset_groups: String,
    dataset_type: &'static str,
    api_key: String,
    count: u64,
    key_number: i32,
    action: &'static str,
    product: &'static str,
    product_version: &'static str,
    #[serde(rename = "user-agent")]
    user_agent: String,
    api_version: &'static str,
    first_call_timestamp: String,
    last_call_timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_defined: Option<serde_json::Value>,
}

/// Floor a timestamp to the configured granularity. Half-day granules
/// are measured from UTC midnight, so they snap to hour 0 or 12.
fn bin_timestamp(ts: DateTime<Utc>, granularity: TimestampGranularity) -> String {
    let granule = granularity.granule_micros();
    let micros = ts.timestamp_micros();
    let floored = micros - micros.rem_euclid(granule);
    let ts = DateTime::from_timestamp_micros(floored).unwrap_or(ts);
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Process-local coalescing map plus the client used to report it.
pub struct EventAggregator {
    map: Mutex<EventMap>,
    client: KmsClient,
    config: Arc<Configuration>,
    user_defined: Mutex<Option<String>>,
}

impl EventAggregator {
    pub(crate) fn new(client: KmsClient, config: Arc<Configuration>) -> Self {
        EventAggregator {
            map: Mutex::new(EventMap::default()),
            client,
            config,
            user_defined: Mutex::new(None),
        }
    }

    /// Attach caller metadata to every subsequent event. Must be valid
    /// JSON of at most 1024 characters; it joins the coalescing key.
    pub fn set_user_defined(&self, metadata: &str) -> Result<()> {
        if metadata.chars().count() > 1024 {
            return Err(Error::ConfigInvalid(
                "user defined metadata exceeds 1024 characters".into(),
            ));
        }
        serde_json::from_str::<serde_json::Value>(metadata)
            .map_err(|e| Error::ConfigInvalid(format!("user defined metadata: {e}")))?;
        *self.user_defined.lock().expect("metadata lock") = Some(metadata.to_string());
        Ok(())
    }

    pub(crate) fn add_event(
        &self,
        api_key: &str,
        dataset: &str,
        dataset_group: &str,
        action: BillingAction,
        dataset_type: DatasetType,
        key_number: i32,
        count: u64,
    ) {
        let user_defined = self
            .user_defined
            .lock()
            .expect("metadata lock")
            .clone()
            .unwrap_or_default();
        let key = EventKey {
            api_key: api_key.to_string(),
            dataset: dataset.to_string(),
            dataset_group: dataset_group.to_string(),
            action,
            dataset_type,
            key_number,
            user_defined,
        };

        let now = Utc::now();
        let mut map = self.map.lock().expect("event map lock");
        let record = map.events.entry(key).or_insert_with(|| EventRecord {
            count: 0,
            first_call: now,
            last_call: now,
        });
        record.count += count;
        record.last_call = now;
        map.total += count;
    }

    /// Number of operations currently queued.
    pub fn count(&self) -> u64 {
        self.map.lock().expect("event map lock").total
    }

    /// Serialize and POST all queued events, leaving an empty map behind.
    /// The swap is atomic with respect to `add_event`; the POST happens
    /// outside the lock.
    pub(crate) fn process(&self) -> Result<()> {
        let verbose = self.config.logging.verbose;
        let drained = {
            let mut map = self.map.lock().expect("event map lock");
            if map.total == 0 {
                if verbose {
                    debug!(target: "ubiq::events", "no events, skipping processing");
                }
                return Ok(());
            }
            std::mem::take(&mut *map)
        };

        if verbose {
            debug!(target: "ubiq::events", count = drained.total, "processing events");
        }

        let granularity = self.config.event_reporting.timestamp_granularity;
        let usage: Vec<ReportedEvent> = drained
            .events
            .into_iter()
            .map(|(key, record)| ReportedEvent {
                datasets: key.dataset,
                dataset_groups: key.dataset_group,
                dataset_type: key.dataset_type.as_str(),
                api_key: key.api_key,
                count: record.count,
                key_number: key.key_number,
                action: key.action.as_str(),
                product: PRODUCT,
                product_version: VERSION,
                user_agent: format!("{PRODUCT}/{VERSION}"),
                api_version: "V3",
                first_call_timestamp: bin_timestamp(record.first_call, granularity),
                last_call_timestamp: bin_timestamp(record.last_call, granularity),
                user_defined: serde_json::from_str(&key.user_defined).ok(),
            })
            .collect();

        self.client
            .post_events(&serde_json::json!({ "usage": usage }))
    }
}

/// Threshold/deadline gate shared by the background worker and the
/// synchronous path: flush when the queue is large enough or the flush
/// interval has elapsed, never otherwise.
pub(crate) struct FlushGate {
    minimum_count: u64,
    flush_interval: Duration,
    next_flush: Mutex<Instant>,
}

impl FlushGate {
    pub fn new(config: &Configuration) -> Self {
        let flush_interval = Duration::from_secs(config.event_reporting.flush_interval);
        FlushGate {
            minimum_count: config.event_reporting.minimum_count as u64,
            flush_interval,
            next_flush: Mutex::new(Instant::now() + flush_interval),
        }
    }

    pub fn should_flush(&self, queued: u64) -> bool {
        queued >= self.minimum_count
            || Instant::now() >= *self.next_flush.lock().expect("flush deadline lock")
    }

    pub fn reset(&self) {
        *self.next_flush.lock().expect("flush deadline lock") =
            Instant::now() + self.flush_interval;
    }
}

struct WorkerShared {
    stop: Mutex<bool>,
    wake: Condvar,
    last_error: Mutex<Option<Error>>,
}

/// Background reporter. Wakes every `wake_interval` seconds, flushes
/// through a [`FlushGate`], and performs one final flush on
/// [`EventProcessor::graceful_close`]. Flush errors either get trapped
/// (logged when verbose) or parked in an error sink the owner can read;
/// the worker itself never dies early.
pub struct EventProcessor {
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
}

impl EventProcessor {
    pub(crate) fn start(aggregator: Arc<EventAggregator>, config: Arc<Configuration>) -> Self {
        let shared = Arc::new(WorkerShared {
            stop: Mutex::new(false),
            wake: Condvar::new(),
            last_error: Mutex::new(None),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("ubiq-events".into())
            .spawn(move || run_worker(&aggregator, &config, &worker_shared))
            .expect("spawn event worker");

        EventProcessor {
            shared,
            handle: Some(handle),
        }
    }

    /// Most recent flush failure (when `trap_exceptions` is off).
    /// Reading clears the slot.
    pub fn last_error(&self) -> Option<Error> {
        self.shared.last_error.lock().expect("error sink lock").take()
    }

    /// Stop the worker and flush whatever is still queued. Idempotent.
    pub fn graceful_close(&mut self) {
        if let Some(handle) = self.handle.take() {
            *self.shared.stop.lock().expect("stop lock") = true;
            self.shared.wake.notify_all();
            let _ = handle.join();
        }
    }
}

impl Drop for EventProcessor {
    fn drop(&mut self) {
        self.graceful_close();
    }
}

fn run_worker(
    aggregator: &EventAggregator,
    config: &Configuration,
    shared: &WorkerShared,
) {
    let wake_interval = Duration::from_secs(config.event_reporting.wake_interval);
    let gate = FlushGate::new(config);

    loop {
        let stopped = {
            let guard = shared.stop.lock().expect("stop lock");
            let (guard, _) = shared
                .wake
                .wait_timeout(guard, wake_interval)
                .expect("stop lock");
            *guard
        };
        if stopped {
            break;
        }

        if gate.should_flush(aggregator.count()) {
            flush(aggregator, config, shared);
            gate.reset();
        }
    }

    // final flush on shutdown
    if config.logging.verbose {
        debug!(target: "ubiq::events", "closing event processor");
    }
    flush(aggregator, config, shared);
}

fn flush(aggregator: &EventAggregator, config: &Configuration, shared: &WorkerShared) {
    if let Err(e) = aggregator.process() {
        if config.event_reporting.trap_exceptions {
            if config.logging.verbose {
                warn!(target: "ubiq::events", error = %e, "event flush failed (trapped)");
            }
        } else {
            *shared.last_error.lock().expect("error sink lock") = Some(e);
        }
    }
}
