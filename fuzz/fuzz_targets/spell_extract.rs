#![no_main]

use bitcoin::ScriptBuf;
use libfuzzer_sys::fuzz_target;
use spellvault_core::spell::extract_spell;

fuzz_target!(|data: &[u8]| {
    // Arbitrary output scripts: only OP_RETURN spells are considered, never a panic
    let script = ScriptBuf::from_bytes(data.to_vec());
    let _ = extract_spell(&script);
});
