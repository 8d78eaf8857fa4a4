#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(log) = std::str::from_utf8(data) {
        let a = kavi_classify::classify(log, None);
        let b = kavi_classify::classify(log, None);
        assert_eq!(a, b);
    }
});
