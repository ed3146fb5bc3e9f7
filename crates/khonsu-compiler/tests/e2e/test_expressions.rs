use super::helpers::*;
use khonsu_compiler::opcode::{OpCode, MULT_RET};

#[test]
fn e2e_left_associative_arithmetic() {
    let c = compile_str("return 1 - 2 - 3");
    assert_code(
        &c.proto,
        &[
            OpCode::PushInt,
            OpCode::PushInt,
            OpCode::Sub,
            OpCode::PushInt,
            OpCode::Sub,
            OpCode::RetCode,
            OpCode::EndCode,
        ],
    );
}

#[test]
fn e2e_power_right_associative() {
    let c = compile_str("return 2 ^ 3 ^ 2");
    assert_code(
        &c.proto,
        &[
            OpCode::PushInt,
            OpCode::PushInt,
            OpCode::PushInt,
            OpCode::Pow,
            OpCode::Pow,
            OpCode::RetCode,
            OpCode::EndCode,
        ],
    );
}

#[test]
fn e2e_precedence_mul_over_add() {
    let c = compile_str("return 1 + 2 * 3");
    assert_code(
        &c.proto,
        &[
            OpCode::PushInt,
            OpCode::PushInt,
            OpCode::PushInt,
            OpCode::Mult,
            OpCode::Add,
            OpCode::RetCode,
            OpCode::EndCode,
        ],
    );
}

#[test]
fn e2e_comparison_binds_loosest() {
    let c = compile_str("return 1 + 2 < 3 .. 4");
    // (1 + 2) < (3 .. 4)
    assert_code(
        &c.proto,
        &[
            OpCode::PushInt,
            OpCode::PushInt,
            OpCode::Add,
            OpCode::PushInt,
            OpCode::PushInt,
            OpCode::Concat,
            OpCode::Lt,
            OpCode::RetCode,
            OpCode::EndCode,
        ],
    );
}

#[test]
fn e2e_unary_not_binds_tighter_than_eq() {
    // `not 1 == 2` parses as (not 1) == 2
    let c = compile_str("return not 1 == 2");
    assert_code(
        &c.proto,
        &[
            OpCode::PushInt,
            OpCode::Not,
            OpCode::PushInt,
            OpCode::Eq,
            OpCode::RetCode,
            OpCode::EndCode,
        ],
    );
}

#[test]
fn e2e_unary_minus_looser_than_pow() {
    // `-2 ^ 2` parses as -(2 ^ 2)
    let c = compile_str("return -2 ^ 2");
    assert_code(
        &c.proto,
        &[
            OpCode::PushInt,
            OpCode::PushInt,
            OpCode::Pow,
            OpCode::Minus,
            OpCode::RetCode,
            OpCode::EndCode,
        ],
    );
}

#[test]
fn e2e_double_unary() {
    let c = compile_str("return not not x");
    assert_code(
        &c.proto,
        &[
            OpCode::GetGlobal,
            OpCode::Not,
            OpCode::Not,
            OpCode::RetCode,
            OpCode::EndCode,
        ],
    );
}

#[test]
fn e2e_and_short_circuit_jump() {
    let c = compile_str("return a and b");
    assert_code(
        &c.proto,
        &[
            OpCode::GetGlobal,
            OpCode::OnFJmp,
            OpCode::GetGlobal,
            OpCode::RetCode,
            OpCode::EndCode,
        ],
    );
    // the jump goes just past the right operand
    assert_eq!(at(&c.proto, 1).arg_s(), 1);
}

#[test]
fn e2e_or_short_circuit_jump() {
    let c = compile_str("return a or b or c");
    assert_code(
        &c.proto,
        &[
            OpCode::GetGlobal,
            OpCode::OnTJmp,
            OpCode::GetGlobal,
            OpCode::OnTJmp,
            OpCode::GetGlobal,
            OpCode::RetCode,
            OpCode::EndCode,
        ],
    );
    assert_eq!(at(&c.proto, 1).arg_s(), 1);
    assert_eq!(at(&c.proto, 3).arg_s(), 1);
}

#[test]
fn e2e_and_within_or() {
    // `a and b or c`: and binds tighter via the outer loop's left-to-right
    // chaining over materialised operands
    let c = compile_str("return a and b or c");
    assert!(has_opcode(&c.proto, OpCode::OnFJmp));
    assert!(has_opcode(&c.proto, OpCode::OnTJmp));
    check_jump_bounds(&c.proto);
}

#[test]
fn e2e_comparisons_emit_distinct_opcodes() {
    let ops = [
        ("==", OpCode::Eq),
        ("~=", OpCode::Neq),
        (">", OpCode::Gt),
        ("<", OpCode::Lt),
        ("<=", OpCode::Le),
        (">=", OpCode::Ge),
    ];
    for (sym, op) in ops {
        let c = compile_str(&format!("return a {sym} b"));
        assert!(has_opcode(&c.proto, op), "missing {op:?} for '{sym}'");
    }
}

#[test]
fn e2e_small_integer_inline() {
    let c = compile_str("return 42");
    assert_eq!(at(&c.proto, 0).opcode(), OpCode::PushInt);
    assert_eq!(at(&c.proto, 0).arg_s(), 42);
    assert!(c.proto.knum.is_empty());
}

#[test]
fn e2e_fractional_number_uses_pool() {
    let c = compile_str("return 0.5");
    assert_eq!(at(&c.proto, 0).opcode(), OpCode::PushNum);
    assert_eq!(c.proto.knum, vec![0.5]);
}

#[test]
fn e2e_huge_number_uses_pool() {
    let c = compile_str("return 1e18");
    assert_eq!(at(&c.proto, 0).opcode(), OpCode::PushNum);
}

#[test]
fn e2e_number_pool_dedup() {
    let c = compile_str("return 0.5 + 0.5");
    assert_eq!(c.proto.knum.len(), 1);
}

#[test]
fn e2e_nil_is_pushnil() {
    let c = compile_str("return nil");
    assert_eq!(at(&c.proto, 0).opcode(), OpCode::PushNil);
    assert_eq!(at(&c.proto, 0).arg_u(), 0);
}

#[test]
fn e2e_indexed_read() {
    let c = compile_str("return t[k]");
    assert_code(
        &c.proto,
        &[
            OpCode::GetGlobal,
            OpCode::GetGlobal,
            OpCode::GetTable,
            OpCode::RetCode,
            OpCode::EndCode,
        ],
    );
}

#[test]
fn e2e_dotted_read_pushes_key_string() {
    let c = compile_str("return t.x");
    assert_code(
        &c.proto,
        &[
            OpCode::GetGlobal,
            OpCode::PushString,
            OpCode::GetTable,
            OpCode::RetCode,
            OpCode::EndCode,
        ],
    );
    assert_eq!(kstr(&c, &c.proto, at(&c.proto, 1).arg_u() as usize), "x");
}

#[test]
fn e2e_chained_index() {
    let c = compile_str("return t.a.b");
    assert_code(
        &c.proto,
        &[
            OpCode::GetGlobal,
            OpCode::PushString,
            OpCode::GetTable,
            OpCode::PushString,
            OpCode::GetTable,
            OpCode::RetCode,
            OpCode::EndCode,
        ],
    );
}

#[test]
fn e2e_call_in_expression_returns_one_value() {
    let c = compile_str("return f() + 1");
    // the call is closed to exactly one result by the addition
    assert_eq!(call_results(&c.proto), vec![1]);
}

#[test]
fn e2e_parenthesised_call_stays_open() {
    // parentheses do not truncate a call's results
    let c = compile_str("return (f())");
    assert_eq!(call_results(&c.proto), vec![MULT_RET]);
}

#[test]
fn e2e_method_call_pushes_self() {
    let c = compile_str("return t:m(1)");
    assert!(has_opcode(&c.proto, OpCode::PushSelf));
    let self_pc = find_opcode(&c.proto, OpCode::PushSelf).unwrap();
    assert_eq!(kstr(&c, &c.proto, at(&c.proto, self_pc).arg_u() as usize), "m");
}

#[test]
fn e2e_string_call_sugar() {
    let c = compile_str("return f \"arg\"");
    assert_code(
        &c.proto,
        &[
            OpCode::GetGlobal,
            OpCode::PushString,
            OpCode::Call,
            OpCode::RetCode,
            OpCode::EndCode,
        ],
    );
}

#[test]
fn e2e_constructor_call_sugar() {
    let c = compile_str("return f{1}");
    assert!(has_opcode(&c.proto, OpCode::CreateTable));
    assert!(has_opcode(&c.proto, OpCode::Call));
}

#[test]
fn e2e_concat_chain() {
    let c = compile_str("return a .. b .. c");
    assert_eq!(count_opcode(&c.proto, OpCode::Concat), 2);
}

#[test]
fn e2e_upvalue_expression() {
    let c = compile_str("function f()\nlocal x\nreturn function() return %x end\nend");
    let inner = &c.proto.kproto[0].kproto[0];
    assert_eq!(at(inner, 0).opcode(), OpCode::PushUpvalue);
    assert_eq!(at(inner, 0).arg_u(), 0);
}

#[test]
fn e2e_upvalue_dedup() {
    let c = compile_str("function f()\nlocal x\nreturn function() return %x + %x end\nend");
    let f = &c.proto.kproto[0];
    // one upvalue captured, referenced twice
    let closure_pc = find_opcode(f, OpCode::Closure).unwrap();
    assert_eq!(at(f, closure_pc).arg_b(), 1);
    assert_eq!(count_opcode(&f.kproto[0], OpCode::PushUpvalue), 2);
}
