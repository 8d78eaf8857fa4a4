#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(source) = std::str::from_utf8(data) {
        let rules = kavi_policy::RuleSet::builtin();
        let a = rules.scan(source);
        let b = rules.scan(source);
        assert_eq!(a, b);
    }
});
