use khonsu_compiler::compiler::{compile, Chunk};
use khonsu_compiler::opcode::{Instruction, OpCode, MULT_RET};
use khonsu_compiler::proto::Proto;

/// Compile a source string, panicking on error.
pub fn compile_str(source: &str) -> Chunk {
    compile(source.as_bytes(), "test").unwrap_or_else(|e| {
        panic!("compile failed: {e}\nsource:\n{source}");
    })
}

/// Compile a source string and expect an error; returns the message.
pub fn compile_str_err(source: &str) -> String {
    match compile(source.as_bytes(), "test") {
        Err(e) => e.message,
        Ok(_) => panic!("expected compile error, got success\nsource:\n{source}"),
    }
}

/// Check if a Proto contains a specific opcode.
pub fn has_opcode(proto: &Proto, op: OpCode) -> bool {
    proto.code.iter().any(|i| i.opcode() == op)
}

/// Count occurrences of an opcode in a Proto.
#[allow(dead_code)]
pub fn count_opcode(proto: &Proto, op: OpCode) -> usize {
    proto.code.iter().filter(|i| i.opcode() == op).count()
}

/// Find the pc of the first instruction with a given opcode.
#[allow(dead_code)]
pub fn find_opcode(proto: &Proto, op: OpCode) -> Option<usize> {
    proto.code.iter().position(|i| i.opcode() == op)
}

/// The opcode sequence of a Proto.
pub fn opcodes(proto: &Proto) -> Vec<OpCode> {
    proto.code.iter().map(|i| i.opcode()).collect()
}

/// The string value of string-pool entry `idx`.
#[allow(dead_code)]
pub fn kstr(chunk: &Chunk, proto: &Proto, idx: usize) -> String {
    String::from_utf8_lossy(chunk.strings.get_bytes(proto.kstr[idx])).into_owned()
}

/// The B operands of every CALL instruction, in emission order.
pub fn call_results(proto: &Proto) -> Vec<u32> {
    proto
        .code
        .iter()
        .filter(|i| i.opcode() == OpCode::Call)
        .map(|i| i.arg_b())
        .collect()
}

/// Walk a Proto's code linearly, accumulating each instruction's stack
/// effect the way the compiler's symbolic tracker does. Returns
/// `(final_depth, max_depth)`; panics on underflow.
pub fn simulate_stack(proto: &Proto) -> (i32, i32) {
    let mut depth = 0i32;
    let mut max = 0i32;
    for (pc, inst) in proto.code.iter().enumerate() {
        match inst.opcode() {
            OpCode::Call => {
                // the call consumes the function and its arguments
                let b = inst.arg_b();
                let results = if b == MULT_RET { 0 } else { b as i32 };
                depth = inst.arg_a() as i32 + results;
            }
            OpCode::RetCode => {
                depth = inst.arg_u() as i32;
            }
            _ => {
                depth += inst
                    .stack_delta()
                    .unwrap_or_else(|| panic!("unexpected variable-effect opcode at {pc}"));
            }
        }
        assert!(depth >= 0, "stack underflow at pc {pc}: {inst:?}");
        if depth > max {
            max = depth;
        }
    }
    (depth, max)
}

/// Assert that every jump in the Proto (and its children) lands inside
/// `[0, code_len]`.
pub fn check_jump_bounds(proto: &Proto) {
    for (pc, inst) in proto.code.iter().enumerate() {
        if inst.opcode().is_jump() {
            let target = pc as i64 + 1 + inst.arg_s() as i64;
            assert!(
                target >= 0 && target <= proto.code.len() as i64,
                "jump at pc {pc} lands at {target}, out of [0, {}]",
                proto.code.len()
            );
        }
    }
    for child in &proto.kproto {
        check_jump_bounds(child);
    }
}

/// Assert max-stack soundness for a Proto and all of its children.
pub fn check_max_stack(proto: &Proto) {
    let (_, max) = simulate_stack(proto);
    assert!(
        max <= proto.max_stack_size as i32,
        "simulated depth {max} exceeds declared max {}",
        proto.max_stack_size
    );
    for child in &proto.kproto {
        check_max_stack(child);
    }
}

/// Shorthand for asserting an exact opcode sequence.
#[allow(dead_code)]
pub fn assert_code(proto: &Proto, expected: &[OpCode]) {
    assert_eq!(opcodes(proto), expected.to_vec());
}

/// An instruction by pc, for operand assertions.
pub fn at(proto: &Proto, pc: usize) -> Instruction {
    proto.code[pc]
}
