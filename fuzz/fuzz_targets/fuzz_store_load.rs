#![no_main]
use libfuzzer_sys::fuzz_target;
use qcode_sync::core::store::open_store;
use qcode_sync::{Coverage, StoreKind};

// Malformed store files must fail with an error, never panic.
fuzz_target!(|data: &[u8]| {
    let path = std::env::temp_dir().join(format!("qcode-fuzz-{}.json", std::process::id()));
    if std::fs::write(&path, data).is_err() {
        return;
    }

    for kind in [StoreKind::List, StoreKind::Dict, StoreKind::Slotted, StoreKind::Tabular] {
        if let Ok(store) = open_store(kind, "fuzz", &path, Coverage::Full) {
            let _ = store.snapshot();
            let _ = store.derived_identifiers();
        }
    }

    std::fs::remove_file(&path).ok();
});
