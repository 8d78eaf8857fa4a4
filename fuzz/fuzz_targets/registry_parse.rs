#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        let dir = std::env::temp_dir().join("kavi-fuzz-registry");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("registry.toml");
        if std::fs::write(&path, text).is_ok() {
            // Arbitrary registry contents must never panic the loader.
            let _ = kavi::registry::load(&path);
        }
    }
});
