/// Bytecode disassembler: human-readable listing of a compiled Proto.
use crate::opcode::{Instruction, InstructionFormat, OpCode, MULT_RET};
use crate::proto::Proto;
use khonsu_core::string::StringInterner;
use std::fmt::Write;

/// Disassemble a complete Proto into a human-readable string.
pub fn disassemble(proto: &Proto, strings: &StringInterner) -> String {
    let mut out = String::new();
    disassemble_proto(&mut out, proto, strings, 0);
    out
}

fn disassemble_proto(out: &mut String, proto: &Proto, strings: &StringInterner, level: usize) {
    let indent = "  ".repeat(level);

    let vararg = if proto.is_vararg { "+" } else { "" };
    writeln!(
        out,
        "{indent}function ({}{vararg} params, {} max stack, {} strings, {} numbers, {} functions)",
        proto.num_params,
        proto.max_stack_size,
        proto.kstr.len(),
        proto.knum.len(),
        proto.kproto.len(),
    )
    .unwrap();

    for (pc, inst) in proto.code.iter().enumerate() {
        write!(out, "{indent}\t{pc}\t").unwrap();
        disasm_instruction(out, pc, inst, proto, strings);
        writeln!(out).unwrap();
    }

    if !proto.kstr.is_empty() {
        writeln!(out, "{indent}strings ({}):", proto.kstr.len()).unwrap();
        for (i, id) in proto.kstr.iter().enumerate() {
            let bytes = strings.get_bytes(*id);
            if let Ok(s) = std::str::from_utf8(bytes) {
                writeln!(out, "{indent}\t{i}\t\"{s}\"").unwrap();
            } else {
                writeln!(out, "{indent}\t{i}\t<binary string>").unwrap();
            }
        }
    }

    if !proto.knum.is_empty() {
        writeln!(out, "{indent}numbers ({}):", proto.knum.len()).unwrap();
        for (i, n) in proto.knum.iter().enumerate() {
            writeln!(out, "{indent}\t{i}\t{n}").unwrap();
        }
    }

    for (i, p) in proto.kproto.iter().enumerate() {
        writeln!(out, "{indent}function [{i}]:").unwrap();
        disassemble_proto(out, p, strings, level + 1);
    }
}

/// Disassemble a single instruction into the output string.
pub fn disasm_instruction(
    out: &mut String,
    pc: usize,
    inst: &Instruction,
    proto: &Proto,
    strings: &StringInterner,
) {
    let op = inst.opcode();
    write!(out, "{:<12}", op.name()).unwrap();

    match op.format() {
        InstructionFormat::IO => {}
        InstructionFormat::IU => {
            write!(out, "{}", inst.arg_u()).unwrap();
            match op {
                OpCode::PushString | OpCode::GetGlobal | OpCode::SetGlobal | OpCode::PushSelf => {
                    let idx = inst.arg_u() as usize;
                    if let Some(id) = proto.kstr.get(idx) {
                        if let Ok(s) = std::str::from_utf8(strings.get_bytes(*id)) {
                            write!(out, "\t; \"{s}\"").unwrap();
                        }
                    }
                }
                OpCode::PushNum => {
                    let idx = inst.arg_u() as usize;
                    if let Some(n) = proto.knum.get(idx) {
                        write!(out, "\t; {n}").unwrap();
                    }
                }
                _ => {}
            }
        }
        InstructionFormat::IS => {
            write!(out, "{}", inst.arg_s()).unwrap();
            if op.is_jump() {
                let target = pc as i32 + 1 + inst.arg_s();
                write!(out, "\t; to {target}").unwrap();
            }
        }
        InstructionFormat::IAB => {
            write!(out, "{} {}", inst.arg_a(), inst.arg_b()).unwrap();
            if op == OpCode::Call && inst.arg_b() == MULT_RET {
                write!(out, "\t; all results").unwrap();
            } else if op == OpCode::Closure {
                write!(out, "\t; function [{}]", inst.arg_a()).unwrap();
            }
        }
    }
}
