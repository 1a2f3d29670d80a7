#![no_main]

use gardener_vercmp::{Version, compare};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;

    // Parsing never panics, whatever the input.
    let va = Version::parse(a);
    let vb = Version::parse(b);

    // Antisymmetry and reflexivity of the total order.
    assert_eq!(compare(a, b), compare(b, a).reverse());
    assert_eq!(compare(a, a), std::cmp::Ordering::Equal);

    // Opaque versions always sort below parseable ones.
    if va.is_parseable() && !vb.is_parseable() {
        assert_eq!(compare(a, b), std::cmp::Ordering::Greater);
    }
});
