#![no_main]

use libfuzzer_sys::fuzz_target;
use spellvault_core::spell::{decode_spell, SpellCodec, MAX_FRAMED_SPELL_LEN};

fuzz_target!(|data: &[u8]| {
    // decode_spell must never panic — it should always return Ok or Err.
    if let Ok(payload) = decode_spell(data) {
        // Framing and field encodings are canonical: accepted bytes re-encode exactly
        let codec = SpellCodec::with_max_len(MAX_FRAMED_SPELL_LEN);
        let encoded = codec.encode(&payload).expect("decoded payload re-encodes");
        assert_eq!(encoded, data);
    }
});
