#![no_main]

use gardener_shard::{ShardScheme, escape_key, unescape_key};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, u8)| {
    let (key, depth) = data;
    if key.is_empty() {
        return;
    }

    assert_eq!(unescape_key(&escape_key(key)), Some(key.to_string()));

    let scheme = ShardScheme::new(usize::from(depth % 8));
    let path = scheme.path_for(key);
    assert_eq!(scheme.key_from_path(&path), Some(key.to_string()));
});
