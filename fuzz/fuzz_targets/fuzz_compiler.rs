#![no_main]

use khonsu_compiler::compiler::compile;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // The compiler must never panic on any input — errors are fine, panics are bugs.
    let _ = compile(data, "fuzz");
});
