mod common;

use common::*;
use proptest::prelude::*;

fn run_to_halt(vm: &mut Vm) -> Result<(), VmError> {
    loop {
        match vm.run()? {
            VmStatus::Halted => return Ok(()),
            VmStatus::Yielded => {}
        }
    }
}

/// Runs `source` interpreted and compiled and checks both end in the
/// same state. Returns the compiled vm.
fn run_both(source: &str, setup: impl Fn(&mut Vm)) -> (Vm, Result<(), String>) {
    let mut interpreted = vm_from_source(source, false);
    setup(&mut interpreted);
    let interpreted_result = run_to_halt(&mut interpreted).map_err(|err| err.to_string());

    let mut compiled = vm_from_source(source, native_jit_supported());
    setup(&mut compiled);
    let compiled_result = run_to_halt(&mut compiled).map_err(|err| err.to_string());

    assert_eq!(interpreted_result, compiled_result);
    assert_eq!(interpreted.stack(), compiled.stack());
    assert_eq!(interpreted.locals(), compiled.locals());
    (compiled, compiled_result)
}

#[test]
fn loop_matches_interpreter() {
    let (vm, result) = run_both(COUNT_TO_TWENTY, |_| {});
    assert!(result.is_ok());
    assert_eq!(vm.stack(), &[Value::Int(190)]);
    assert_eq!(vm.locals(), &[Value::Int(20), Value::Int(190)]);
    if native_jit_supported() {
        assert!(vm.is_native_compiled());
        assert_eq!(vm.native_exec_count(), 1);
    }
}

#[test]
fn jit_dump_lists_native_code() {
    let mut vm = vm_from_source(COUNT_TO_TWENTY, native_jit_supported());
    run_to_halt(&mut vm).expect("run");
    let dump = vm.dump_jit_info();
    if native_jit_supported() {
        assert!(dump.contains("fn main"), "dump:\n{dump}");
        assert!(dump.contains("trap"));
        let native = vm.native_code_handle().expect("native code");
        let json = native.listing().to_json().expect("json");
        assert!(json.contains("\"dispatchable\""));
    } else {
        assert!(dump.contains("not compiled"));
    }
}

#[test]
fn yield_resumes_through_secondary_entry() {
    let source = r#"
        ldc 1
        call 0 1
        ldc 2
        add
        ret
    "#;
    let mut vm = vm_from_source(source, native_jit_supported());
    vm.register_function(Box::new(YieldOnce { yielded: false }));

    assert_eq!(vm.run().expect("first run"), VmStatus::Yielded);
    assert_eq!(vm.ip(), 5);
    assert_eq!(vm.stack(), &[Value::Int(1)]);

    assert_eq!(vm.resume().expect("resume"), VmStatus::Halted);
    assert_eq!(vm.stack(), &[Value::Int(44)]);
    if native_jit_supported() {
        let native = vm.native_code_handle().expect("native code");
        let entry = native.entry_for_ip(5).expect("secondary entry for the call");
        let function = native.function().expect("function");
        assert!(function.secondary_entry(5).is_some());
        assert_ne!(entry, function.start);
        assert_eq!(vm.native_exec_count(), 2);
    }
}

#[test]
fn host_calls_match_interpreter() {
    let source = r#"
        ldc 40
        call 0 1
        call 0 1
        ret
    "#;
    let (vm, result) = run_both(source, |vm| {
        vm.register_function(Box::new(AddOne));
    });
    assert!(result.is_ok());
    assert_eq!(vm.stack(), &[Value::Int(42)]);
}

#[test]
fn runtime_errors_match_interpreter() {
    let (_, result) = run_both("ldc 1\nldc 0\ndiv\nret", |_| {});
    assert_eq!(result, Err(VmError::DivisionByZero.to_string()));

    let (_, result) = run_both("pop\nret", |_| {});
    assert_eq!(result, Err(VmError::StackUnderflow.to_string()));

    let (_, result) = run_both("call 0 0\nret", |vm| {
        vm.register_static_function(static_fail);
    });
    assert_eq!(result, Err("host error: refused".to_string()));
}

#[test]
fn conditional_branch_error_goes_through_trap() {
    let source = r#"
        ldc 5
        brfalse end
    .label end
        ret
    "#;
    let (_, result) = run_both(source, |_| {});
    assert_eq!(result, Err(VmError::TypeMismatch("bool").to_string()));
}

#[test]
fn falling_off_the_end_is_a_bounds_error() {
    let (_, result) = run_both("ldc 1\nnop", |_| {});
    assert_eq!(result, Err(VmError::BytecodeBounds.to_string()));
}

#[rustfmt::skip]
#[test]
fn untranslatable_bytecode_falls_back_to_interpreter() {
    // br into the middle of its own operand, never taken.
    let code = vec![
        wordjit::OpCode::Ldc as u8, 0, 0, 0, 0,
        wordjit::OpCode::Ret as u8,
        wordjit::OpCode::Br as u8, 8, 0, 0, 0,
    ];
    let mut vm = Vm::new(Program::new(vec![Value::Int(9)], code));
    vm.set_jit_config(jit(true));
    assert_eq!(vm.run().expect("run"), VmStatus::Halted);
    assert_eq!(vm.stack(), &[Value::Int(9)]);
    assert!(!vm.is_native_compiled());
    assert_eq!(vm.native_exec_count(), 0);
}

#[test]
fn disabled_jit_never_compiles() {
    let mut vm = vm_from_source(COUNT_TO_TWENTY, false);
    run_to_halt(&mut vm).expect("run");
    assert!(!vm.is_native_compiled());
    assert_eq!(vm.native_exec_count(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn arithmetic_matches_interpreter(a in -10_000i64..10_000, b in 1i64..500) {
        let source = format!(
            "ldc {a}\nldc {b}\nmul\nldc {a}\nsub\nldc {b}\ndiv\nldc {b}\nclt\nret"
        );
        let (_, result) = run_both(&source, |_| {});
        prop_assert!(result.is_ok());
    }
}
