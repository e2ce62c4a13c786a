//! Usage-event coalescing and flush-trigger tests against a mocked KMS.

mod common;

use std::time::Duration;

use common::MockKms;
use ubiq_core::{encrypt, Configuration, Encryption};

#[test]
fn background_worker_flushes_on_minimum_count_and_on_close() {
    let mut kms = MockKms::start();
    let data_key = MockKms::data_key();
    kms.mock_encryption_key(&data_key, 200);
    // 120 coalesced operations cross the minimum count of 50 at the
    // first wake; the remainder rides the final flush at close
    let threshold_flush = kms.mock_tracking(r#""count":120,"#, 1);
    let final_flush = kms.mock_tracking(r#""count":5,"#, 1);

    let config = Configuration::from_json(
        r#"{
            "event_reporting": {
                "wake_interval": 1,
                "minimum_count": 50,
                "flush_interval": 90
            }
        }"#,
    )
    .unwrap();
    let creds = kms.credentials(config);

    let mut enc = Encryption::new(&creds, 200).unwrap();
    for _ in 0..120 {
        let mut ct = enc.begin().unwrap();
        ct.extend(enc.update(b"billed bytes").unwrap());
        ct.extend(enc.end().unwrap());
    }

    std::thread::sleep(Duration::from_millis(2500));
    threshold_flush.assert();

    for _ in 0..5 {
        let mut ct = enc.begin().unwrap();
        ct.extend(enc.update(b"more").unwrap());
        ct.extend(enc.end().unwrap());
    }
    drop(enc);
    creds.close().unwrap();
    final_flush.assert();
}

#[test]
fn below_threshold_nothing_flushes_before_the_deadline() {
    let mut kms = MockKms::start();
    let data_key = MockKms::data_key();
    kms.mock_encryption_key(&data_key, 50);
    let tracking = kms.mock_tracking(r#""usage""#, 0);

    let config = Configuration::from_json(
        r#"{
            "event_reporting": {
                "wake_interval": 1,
                "minimum_count": 50,
                "flush_interval": 3600
            }
        }"#,
    )
    .unwrap();
    let creds = kms.credentials(config);

    let mut enc = Encryption::new(&creds, 50).unwrap();
    for _ in 0..5 {
        let mut ct = enc.begin().unwrap();
        ct.extend(enc.update(b"under the radar").unwrap());
        ct.extend(enc.end().unwrap());
    }

    // two wakes pass; neither trigger holds
    std::thread::sleep(Duration::from_millis(2500));
    tracking.assert();
}

#[test]
fn synchronous_mode_flushes_from_the_calling_thread() {
    let mut kms = MockKms::start();
    let data_key = MockKms::data_key();
    kms.mock_encryption_key(&data_key, 1);
    // three one-shot encrypts coalesce into a single event of count 3
    let tracking = kms.mock_tracking(r#""count":3,"#, 1);

    let config = Configuration::from_json(
        r#"{
            "event_reporting": {
                "synchronous": true,
                "minimum_count": 3,
                "flush_interval": 3600
            }
        }"#,
    )
    .unwrap();
    let creds = kms.credentials(config);

    encrypt(&creds, b"one").unwrap();
    encrypt(&creds, b"two").unwrap();
    encrypt(&creds, b"three").unwrap();

    tracking.assert();
}

#[test]
fn user_defined_metadata_rides_along() {
    let mut kms = MockKms::start();
    let data_key = MockKms::data_key();
    kms.mock_encryption_key(&data_key, 1);
    let tracking = kms.mock_tracking(r#""user_defined":\{"env":"integration"\}"#, 1);

    let config = Configuration::from_json(
        r#"{
            "event_reporting": { "synchronous": true, "minimum_count": 1 }
        }"#,
    )
    .unwrap();
    let creds = kms.credentials(config);
    creds.set_event_metadata(r#"{"env":"integration"}"#).unwrap();

    encrypt(&creds, b"tagged").unwrap();
    tracking.assert();
}

#[test]
fn close_in_synchronous_mode_flushes_the_remainder() {
    let mut kms = MockKms::start();
    let data_key = MockKms::data_key();
    kms.mock_encryption_key(&data_key, 1);
    let tracking = kms.mock_tracking(r#""count":1,"#, 1);

    let creds = kms.credentials(MockKms::sync_config());
    encrypt(&creds, b"flush me at close").unwrap();
    // default minimum count (50) not reached: nothing flushed yet
    creds.close().unwrap();
    tracking.assert();
}
