#![no_main]

use std::time::Duration;

use gardener_retry::{BackoffKind, RetryConfig, delay_for_attempt};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (u32, u8, u64, u64, u8)| {
    let (attempt, kind_byte, base_ms, max_ms, jitter_byte) = data;

    let attempt = attempt % 100 + 1;
    let kind = match kind_byte % 4 {
        0 => BackoffKind::Immediate,
        1 => BackoffKind::Exponential,
        2 => BackoffKind::Linear,
        _ => BackoffKind::Constant,
    };
    let base_delay = Duration::from_millis(base_ms % 10_000 + 1);
    let max_delay = Duration::from_millis(max_ms % 300_000 + 100);
    let jitter = f64::from(jitter_byte) / 255.0;

    let config = RetryConfig {
        kind,
        max_attempts: 100,
        base_delay,
        max_delay,
        jitter,
    };
    let delay = delay_for_attempt(&config, attempt);

    if kind == BackoffKind::Immediate {
        assert_eq!(delay, Duration::ZERO);
    }
    // Jitter widens the band by at most (1 + jitter), rounding included.
    let bound = max_delay.mul_f64(1.0 + jitter) + Duration::from_millis(1);
    assert!(delay <= bound);
});
