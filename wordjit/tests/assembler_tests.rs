mod common;

use common::*;
use wordjit::{Assembler, OpCode};

#[test]
fn loop_source_assembles_to_expected_layout() {
    let program = assemble(COUNT_TO_TWENTY).expect("assemble");
    assert_eq!(program.constants, vec![Value::Int(0), Value::Int(20), Value::Int(1)]);
    assert_eq!(program.local_slots(), 2);

    let instructions = program.decode().expect("decode");
    let brfalse = instructions
        .iter()
        .find(|instruction| instruction.opcode == OpCode::Brfalse)
        .expect("brfalse");
    let done = program.operand_u32(brfalse.ip + 1).expect("operand") as usize;
    assert_eq!(program.code[done], OpCode::Ldloc as u8);
    assert_eq!(program.code.last(), Some(&(OpCode::Ret as u8)));

    let br = instructions
        .iter()
        .find(|instruction| instruction.opcode == OpCode::Br)
        .expect("br");
    let top = program.operand_u32(br.ip + 1).expect("operand");
    assert_eq!(top, 14);
}

#[test]
fn data_section_defines_named_constants() {
    let source = r#"
    .data
        const limit 10
        string greeting "hi # not a comment\n"
    .code
        ldc greeting
        ldc limit
        ldc 2.5
        ldc true
        ret
    "#;
    let program = assemble(source).expect("assemble");
    assert_eq!(
        program.constants,
        vec![
            Value::Int(10),
            Value::String("hi # not a comment\n".to_string()),
            Value::Float(2.5),
            Value::Bool(true),
        ]
    );
    assert_eq!(&program.code[..5], &[OpCode::Ldc as u8, 1, 0, 0, 0]);
}

#[test]
fn builder_matches_text_form() {
    let mut assembler = Assembler::new();
    assembler.push_const(Value::Int(3));
    assembler.label("again").expect("label");
    assembler.op(OpCode::Dup);
    assembler.brfalse("again");
    assembler.call(1, 2);
    assembler.op(OpCode::Ret);
    let built = assembler.finish_program().expect("finish");

    let parsed = assemble(
        r#"
        ldc 3
    .label again
        dup
        brfalse again
        call 1 2
        ret
    "#,
    )
    .expect("assemble");
    assert_eq!(built, parsed);
}

#[test]
fn errors_carry_line_numbers() {
    let cases = [
        ("nop\nfrobnicate", 2, "unknown opcode"),
        ("top:", 1, "labels are declared"),
        (".label a\n.label a", 2, "duplicate label"),
        ("ldloc missing", 1, "unknown local"),
        ("ret extra", 1, "unexpected token"),
        ("br 4", 1, "must be labels"),
        (".const x 1\n.const x 2", 2, "duplicate const"),
        ("ldc \"open", 1, "unterminated"),
        (".data\nadd", 2, "data section"),
        (".bogus", 1, "unknown directive"),
        ("call 1", 1, "missing argument count"),
    ];
    for (source, line, message) in cases {
        let err = assemble(source).expect_err(source);
        assert_eq!(err.line, line, "{source}: {err}");
        assert!(err.message.contains(message), "{source}: {err}");
    }
}

#[rustfmt::skip]
#[test]
fn locals_can_be_named_or_numbered() {
    let program = assemble(
        r#"
    .local a
    .local b 5
    .local c
        ldloc a
        stloc b
        ldloc c
        stloc 7
        ret
    "#,
    )
    .expect("assemble");
    assert_eq!(
        program.code,
        vec![
            OpCode::Ldloc as u8, 0,
            OpCode::Stloc as u8, 5,
            OpCode::Ldloc as u8, 1,
            OpCode::Stloc as u8, 7,
            OpCode::Ret as u8,
        ]
    );
    assert_eq!(program.local_slots(), 8);
}
