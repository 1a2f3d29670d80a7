#![no_main]

use gardener::types::{PackageRecord, PrInfoRecord, VersionRecord};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Corrupt store bytes must surface as errors, never panics, and a
    // record that parses must survive a canonical round trip.
    if let Ok(record) = serde_json::from_slice::<VersionRecord>(data) {
        let bytes = gardener::backends::canonical_json_bytes(&record).unwrap();
        let again: VersionRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(again, record);
    }
    if let Ok(record) = serde_json::from_slice::<PrInfoRecord>(data) {
        let bytes = gardener::backends::canonical_json_bytes(&record).unwrap();
        let again: PrInfoRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(again, record);
    }
    let _ = serde_json::from_slice::<PackageRecord>(data);
});
