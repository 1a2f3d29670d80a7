//! Property-based tests for cross-module invariants.
//!
//! These hold for all inputs, not just the fixtures the unit tests use:
//! - every record shape round-trips through the store's canonical JSON;
//! - fingerprints are canonical: equal content means equal digest;
//! - shard assignment partitions any population completely;
//! - the stored `new_version` never decreases, whatever order probe
//!   results arrive in.

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use serde_json::json;

    use crate::types::*;

    fn package_name_strategy() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_-]{0,19}".prop_map(|s| s.to_lowercase())
    }

    fn version_strategy() -> impl Strategy<Value = String> {
        (0u64..100, 0u64..100, 0u64..100).prop_map(|(a, b, c)| format!("{a}.{b}.{c}"))
    }

    fn bad_state_strategy() -> impl Strategy<Value = BadState> {
        prop_oneof![
            Just(BadState::Clear),
            ("[a-z_]{1,12}", ".{0,30}").prop_map(|(kind, reason)| BadState::flagged(&kind, reason)),
        ]
    }

    proptest! {
        #[test]
        fn version_record_round_trips(
            new_version in proptest::option::of(version_strategy()),
            attempts in prop::collection::btree_map(version_strategy(), 0u32..10, 0..4),
            bad in bad_state_strategy(),
        ) {
            let record = VersionRecord {
                new_version,
                new_version_attempts: attempts,
                bad,
            };
            let bytes = crate::backends::canonical_json_bytes(&record).unwrap();
            let parsed: VersionRecord = serde_json::from_slice(&bytes).unwrap();
            prop_assert_eq!(parsed, record);
        }

        #[test]
        fn pr_info_record_round_trips(
            packages in prop::collection::vec(
                (package_name_strategy(), version_strategy(), 0u8..3),
                0..5,
            ),
            smithy in proptest::option::of("[0-9.]{1,8}"),
        ) {
            let prs: Vec<PrEntry> = packages
                .into_iter()
                .enumerate()
                .map(|(idx, (name, version, state))| PrEntry {
                    fingerprint: Fingerprint::new(
                        json!({"migrator": "version", "package": name, "target": version}),
                    ),
                    state: match state {
                        0 => PrState::Open,
                        1 => PrState::Merged,
                        _ => PrState::Closed,
                    },
                    url: None,
                    number: Some(idx as u64 + 1),
                    forge_id: Some(1000 + idx as u64),
                    opened_at: Utc.timestamp_opt(1_700_000_000 + idx as i64, 0).unwrap(),
                    closed_at: None,
                })
                .collect();
            let record = PrInfoRecord {
                prs,
                bad: BadState::Clear,
                smithy_version: smithy,
                pinning_version: None,
            };

            let bytes = crate::backends::canonical_json_bytes(&record).unwrap();
            let parsed: PrInfoRecord = serde_json::from_slice(&bytes).unwrap();
            prop_assert_eq!(parsed, record);
        }

        #[test]
        fn package_record_round_trips_with_extras(
            name in package_name_strategy(),
            version in proptest::option::of(version_strategy()),
            archived in any::<bool>(),
            extra_key in "[a-z_]{1,10}",
            extra_value in "[a-zA-Z0-9 ]{0,20}",
        ) {
            let mut record = PackageRecord::new(&name);
            record.version = version;
            record.archived = archived;
            record.extra.insert(extra_key, json!(extra_value));

            let bytes = crate::backends::canonical_json_bytes(&record).unwrap();
            let parsed: PackageRecord = serde_json::from_slice(&bytes).unwrap();
            prop_assert_eq!(parsed, record);
        }

        #[test]
        fn fingerprints_are_canonical_under_key_order(
            a in "[a-z]{1,8}",
            b in "[a-z]{1,8}",
            value in version_strategy(),
        ) {
            prop_assume!(a != b);
            let mut forward = serde_json::Map::new();
            forward.insert(a.clone(), json!(value));
            forward.insert(b.clone(), json!(1));
            let mut backward = serde_json::Map::new();
            backward.insert(b, json!(1));
            backward.insert(a, json!(value));

            let fp1 = Fingerprint::new(serde_json::Value::Object(forward));
            let fp2 = Fingerprint::new(serde_json::Value::Object(backward));
            prop_assert_eq!(&fp1, &fp2);
            prop_assert_eq!(fp1.digest(), fp2.digest());
            prop_assert_eq!(fp1.canonical(), fp2.canonical());
        }

        #[test]
        fn sharding_partitions_every_population(
            names in prop::collection::btree_set(package_name_strategy(), 1..40),
            n_jobs in 1u32..8,
        ) {
            let mut seen: BTreeMap<String, u32> = BTreeMap::new();
            for job in 0..n_jobs {
                for name in &names {
                    if crate::versions::shard_for(name, n_jobs) == job {
                        prop_assert!(
                            seen.insert(name.clone(), job).is_none(),
                            "package assigned to two shards"
                        );
                    }
                }
            }
            prop_assert_eq!(seen.len(), names.len());
        }

        #[test]
        fn new_version_is_monotone_under_any_probe_order(
            versions in prop::collection::vec(version_strategy(), 1..10),
        ) {
            // Replay the monotonicity rule the pipeline applies and check
            // the stored value only ever moves up.
            let mut stored: Option<String> = None;
            let mut high_water: Option<String> = None;
            for candidate in &versions {
                let keep_existing = stored
                    .as_deref()
                    .is_some_and(|existing| {
                        gardener_vercmp::compare(candidate, existing) == std::cmp::Ordering::Less
                    });
                if !keep_existing {
                    stored = Some(candidate.clone());
                }

                if let (Some(current), Some(peak)) = (&stored, &high_water) {
                    prop_assert_ne!(
                        gardener_vercmp::compare(current, peak),
                        std::cmp::Ordering::Less,
                        "stored version moved backwards"
                    );
                }
                if high_water.is_none()
                    || gardener_vercmp::compare(
                        stored.as_deref().unwrap(),
                        high_water.as_deref().unwrap(),
                    ) == std::cmp::Ordering::Greater
                {
                    high_water = stored.clone();
                }
            }
        }
    }
}
