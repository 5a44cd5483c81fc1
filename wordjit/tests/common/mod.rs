#![allow(dead_code, unused_imports)]

pub use wordjit::{
    CallOutcome, HostFunction, JitConfig, Program, Value, Vm, VmError, VmStatus, assemble,
};

pub const COUNT_TO_TWENTY: &str = r#"
.local i
.local sum
    ldc 0
    stloc i
    ldc 0
    stloc sum
.label top
    ldloc i
    ldc 20
    clt
    brfalse done
    ldloc sum
    ldloc i
    add
    stloc sum
    ldloc i
    ldc 1
    add
    stloc i
    br top
.label done
    ldloc sum
    ret
"#;

pub fn native_jit_supported() -> bool {
    wordjit::native_jit_supported()
}

pub fn jit(enabled: bool) -> JitConfig {
    JitConfig {
        enabled,
        ..JitConfig::default()
    }
}

pub fn vm_from_source(source: &str, jit_enabled: bool) -> Vm {
    let program = assemble(source).expect("assemble should succeed");
    let mut vm = Vm::new(program);
    vm.set_jit_config(jit(jit_enabled));
    vm
}

pub struct YieldOnce {
    pub yielded: bool,
}

impl HostFunction for YieldOnce {
    fn call(&mut self, _vm: &mut Vm, _args: &[Value]) -> Result<CallOutcome, VmError> {
        if !self.yielded {
            self.yielded = true;
            Ok(CallOutcome::Yield)
        } else {
            Ok(CallOutcome::Return(vec![Value::Int(42)]))
        }
    }
}

pub struct AddOne;

impl HostFunction for AddOne {
    fn call(&mut self, _vm: &mut Vm, args: &[Value]) -> Result<CallOutcome, VmError> {
        let value = match args.first() {
            Some(Value::Int(value)) => *value,
            _ => 0,
        };
        Ok(CallOutcome::Return(vec![Value::Int(value + 1)]))
    }
}

pub fn static_fail(_vm: &mut Vm, _args: &[Value]) -> Result<CallOutcome, VmError> {
    Err(VmError::HostError("refused".to_string()))
}
