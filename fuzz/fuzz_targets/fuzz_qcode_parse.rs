#![no_main]
use libfuzzer_sys::fuzz_target;
use qcode_sync::core::scheme::{compose, parse_qcode};
use qcode_sync::SchemeVersion;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    let Some(parsed) = parse_qcode(text) else {
        for version in [SchemeVersion::V1, SchemeVersion::V2] {
            assert!(!version.primary().matches(text));
            assert!(!version.slot().matches(text));
        }
        return;
    };

    // Anything that parses recomposes to a primary id of the same version.
    let primary = compose(&parsed.prefix, parsed.sequence);
    assert!(parsed.version.primary().matches(&primary), "{} -> {}", text, primary);
    if parsed.slot.is_none() {
        assert_eq!(primary, text);
    }
});
