#![no_main]

use khonsu_compiler::lexer::Lexer;
use khonsu_compiler::token::Token;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // The lexer must never panic on any input — errors are fine, panics are bugs.
    let mut lexer = Lexer::new(data);
    loop {
        match lexer.advance() {
            Ok(st) => {
                if st.token == Token::Eos {
                    break;
                }
            }
            Err(_) => break,
        }
    }
});
