#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(schema) = serde_json::from_str::<kavi_schema::IoSchema>(text) {
            // Validation must never panic, whatever the value.
            let _ = schema.validate(&serde_json::json!({}));
            let _ = schema.validate(&serde_json::json!({"x": 1}));
            let _ = schema.to_packet_line();
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
            let schema = kavi_schema::IoSchema::from_pairs([
                ("a", kavi_schema::FieldType::Str),
                ("b", kavi_schema::FieldType::Int),
            ]);
            let _ = schema.validate(&value);
        }
    }
});
