#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(log) = std::str::from_utf8(data) {
        let failure = kavi_classify::classify(log, None);
        let base = "=== kavi build packet v1 ===\nname: fuzz\n";
        let enriched = kavi::packet::append_retry_section(base, &failure, 2);
        assert!(enriched.starts_with(base.trim_end()));
        // Enrichment is idempotent in content for equal inputs.
        assert_eq!(enriched, kavi::packet::append_retry_section(base, &failure, 2));
    }
});
