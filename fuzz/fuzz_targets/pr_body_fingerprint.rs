#![no_main]

use gardener::migrators::{fingerprint_from_pr_body, pr_body_with_fingerprint};
use gardener::types::Fingerprint;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str)| {
    let (narrative, noise) = data;

    // Recovery never panics on arbitrary PR bodies.
    let _ = fingerprint_from_pr_body(noise);

    // A body the bot wrote always yields its fingerprint back, whatever
    // narrative surrounds the fence.
    let fingerprint = Fingerprint::new(serde_json::json!({
        "migrator": "version",
        "target": "1.2.3",
    }));
    let body = pr_body_with_fingerprint(narrative, &fingerprint, None);
    assert_eq!(fingerprint_from_pr_body(&body), Some(fingerprint));
});
