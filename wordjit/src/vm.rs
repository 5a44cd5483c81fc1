use std::ffi::c_void;
use std::rc::Rc;

use tracing::debug;

use crate::codegen::{CodegenError, WordOffset};
use crate::jit::{self, JitConfig, NativeCode};

mod bridge;

pub(crate) use bridge::{jit_branch_bridge, jit_op_bridge};

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
}

#[derive(Clone, Copy, Debug)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn to_float(self) -> f64 {
        match self {
            Number::Int(value) => value as f64,
            Number::Float(value) => value,
        }
    }
}

impl Value {
    fn into_int(self) -> VmResult<i64> {
        match self {
            Value::Int(value) => Ok(value),
            _ => Err(VmError::TypeMismatch("int")),
        }
    }

    fn into_number(self) -> VmResult<Number> {
        match self {
            Value::Int(value) => Ok(Number::Int(value)),
            Value::Float(value) => Ok(Number::Float(value)),
            _ => Err(VmError::TypeMismatch("number")),
        }
    }

    fn into_bool(self) -> VmResult<bool> {
        match self {
            Value::Bool(value) => Ok(value),
            _ => Err(VmError::TypeMismatch("bool")),
        }
    }
}

#[derive(Debug)]
pub enum VmError {
    StackUnderflow,
    TypeMismatch(&'static str),
    DivisionByZero,
    InvalidShift(i64),
    InvalidConstant(u32),
    InvalidLocal(u8),
    InvalidCall(u16),
    InvalidOpcode(u8),
    BytecodeBounds,
    HostError(String),
    Codegen(CodegenError),
    Native(String),
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::StackUnderflow => write!(f, "stack underflow"),
            VmError::TypeMismatch(expected) => write!(f, "type mismatch: expected {expected}"),
            VmError::DivisionByZero => write!(f, "division by zero"),
            VmError::InvalidShift(value) => {
                write!(f, "invalid shift amount {value}, expected 0..63")
            }
            VmError::InvalidConstant(index) => write!(f, "invalid constant {index}"),
            VmError::InvalidLocal(index) => write!(f, "invalid local {index}"),
            VmError::InvalidCall(index) => write!(f, "invalid call target {index}"),
            VmError::InvalidOpcode(opcode) => write!(f, "invalid opcode {opcode}"),
            VmError::BytecodeBounds => write!(f, "bytecode bounds"),
            VmError::HostError(message) => write!(f, "host error: {message}"),
            VmError::Codegen(err) => write!(f, "code generation failed: {err}"),
            VmError::Native(message) => write!(f, "native code error: {message}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::Codegen(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CodegenError> for VmError {
    fn from(err: CodegenError) -> Self {
        VmError::Codegen(err)
    }
}

pub type VmResult<T> = Result<T, VmError>;

#[derive(Clone, Debug, PartialEq)]
pub struct Program {
    pub constants: Vec<Value>,
    pub code: Vec<u8>,
}

/// Decoded position of one opcode in a program's bytecode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub ip: usize,
    pub opcode: OpCode,
}

impl Instruction {
    pub fn encoded_len(&self) -> usize {
        1 + self.opcode.operand_len()
    }

    pub fn next_ip(&self) -> usize {
        self.ip + self.encoded_len()
    }
}

impl Program {
    pub fn new(constants: Vec<Value>, code: Vec<u8>) -> Self {
        Self { constants, code }
    }

    /// Splits the bytecode into instructions. Fails on unknown opcodes and
    /// on operands running past the end of the code.
    pub fn decode(&self) -> VmResult<Vec<Instruction>> {
        let mut instructions = Vec::new();
        let mut ip = 0usize;
        while ip < self.code.len() {
            let byte = self.code[ip];
            let opcode = OpCode::from_byte(byte).ok_or(VmError::InvalidOpcode(byte))?;
            let instruction = Instruction { ip, opcode };
            if instruction.next_ip() > self.code.len() {
                return Err(VmError::BytecodeBounds);
            }
            instructions.push(instruction);
            ip = instruction.next_ip();
        }
        Ok(instructions)
    }

    pub fn operand_u32(&self, at: usize) -> Option<u32> {
        let bytes = self.code.get(at..at + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Number of local slots the bytecode touches.
    pub fn local_slots(&self) -> usize {
        let Ok(instructions) = self.decode() else {
            return 0;
        };
        instructions
            .iter()
            .filter(|instruction| matches!(instruction.opcode, OpCode::Ldloc | OpCode::Stloc))
            .filter_map(|instruction| self.code.get(instruction.ip + 1))
            .map(|index| *index as usize + 1)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Nop = 0x00,
    Ret = 0x01,
    Ldc = 0x02,
    Add = 0x03,
    Sub = 0x04,
    Mul = 0x05,
    Div = 0x06,
    Neg = 0x07,
    Ceq = 0x08,
    Clt = 0x09,
    Cgt = 0x0A,
    Br = 0x0B,
    Brfalse = 0x0C,
    Pop = 0x0D,
    Dup = 0x0E,
    Ldloc = 0x0F,
    Stloc = 0x10,
    Call = 0x11,
    Shl = 0x12,
    Shr = 0x13,
}

const OPCODES: [(OpCode, &str); 20] = [
    (OpCode::Nop, "nop"),
    (OpCode::Ret, "ret"),
    (OpCode::Ldc, "ldc"),
    (OpCode::Add, "add"),
    (OpCode::Sub, "sub"),
    (OpCode::Mul, "mul"),
    (OpCode::Div, "div"),
    (OpCode::Neg, "neg"),
    (OpCode::Ceq, "ceq"),
    (OpCode::Clt, "clt"),
    (OpCode::Cgt, "cgt"),
    (OpCode::Br, "br"),
    (OpCode::Brfalse, "brfalse"),
    (OpCode::Pop, "pop"),
    (OpCode::Dup, "dup"),
    (OpCode::Ldloc, "ldloc"),
    (OpCode::Stloc, "stloc"),
    (OpCode::Call, "call"),
    (OpCode::Shl, "shl"),
    (OpCode::Shr, "shr"),
];

impl OpCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        OPCODES.get(byte as usize).map(|(opcode, _)| *opcode)
    }

    pub fn mnemonic(self) -> &'static str {
        OPCODES[self as usize].1
    }

    pub fn parse_mnemonic(op: &str) -> Option<Self> {
        OPCODES
            .iter()
            .find(|(_, mnemonic)| *mnemonic == op)
            .map(|(opcode, _)| *opcode)
    }

    /// Bytes of immediate operand following the opcode byte.
    pub fn operand_len(self) -> usize {
        match self {
            OpCode::Ldc | OpCode::Br | OpCode::Brfalse => 4,
            OpCode::Call => 3,
            OpCode::Ldloc | OpCode::Stloc => 1,
            _ => 0,
        }
    }

    pub fn is_branch(self) -> bool {
        matches!(self, OpCode::Br | OpCode::Brfalse)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmStatus {
    Halted,
    Yielded,
}

impl VmStatus {
    /// Status value compiled code returns for this outcome.
    pub fn code(self) -> i32 {
        match self {
            VmStatus::Halted => jit::STATUS_HALTED,
            VmStatus::Yielded => jit::STATUS_YIELDED,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum CallOutcome {
    Return(Vec<Value>),
    Yield,
}

pub trait HostFunction {
    fn call(&mut self, vm: &mut Vm, args: &[Value]) -> VmResult<CallOutcome>;
}

pub type StaticHostFunction = fn(&mut Vm, &[Value]) -> VmResult<CallOutcome>;

enum VmHostFunction {
    Dynamic(Box<dyn HostFunction>),
    Static(StaticHostFunction),
}

pub(crate) enum StepOutcome {
    Continue,
    Halted,
    Yielded,
}

enum NativeState {
    Untried,
    Ready(Rc<NativeCode>),
    Unavailable,
}

#[derive(Clone, Copy)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
}

impl Arith {
    fn ints(self, lhs: i64, rhs: i64) -> VmResult<i64> {
        match self {
            Arith::Add => Ok(lhs.wrapping_add(rhs)),
            Arith::Sub => Ok(lhs.wrapping_sub(rhs)),
            Arith::Mul => Ok(lhs.wrapping_mul(rhs)),
            Arith::Div if rhs == 0 => Err(VmError::DivisionByZero),
            Arith::Div => Ok(lhs.wrapping_div(rhs)),
        }
    }

    fn floats(self, lhs: f64, rhs: f64) -> VmResult<f64> {
        match self {
            Arith::Add => Ok(lhs + rhs),
            Arith::Sub => Ok(lhs - rhs),
            Arith::Mul => Ok(lhs * rhs),
            Arith::Div if rhs == 0.0 => Err(VmError::DivisionByZero),
            Arith::Div => Ok(lhs / rhs),
        }
    }
}

pub struct Vm {
    program: Program,
    ip: usize,
    stack: Vec<Value>,
    locals: Vec<Value>,
    host_functions: Vec<VmHostFunction>,
    call_depth: usize,
    jit: JitConfig,
    native: NativeState,
    native_exec_count: u64,
}

impl Vm {
    /// Creates a vm with as many locals as the bytecode addresses.
    pub fn new(program: Program) -> Self {
        let local_count = program.local_slots();
        Self::with_locals(program, local_count)
    }

    pub fn with_locals(program: Program, local_count: usize) -> Self {
        Self {
            program,
            ip: 0,
            stack: Vec::new(),
            locals: vec![Value::Int(0); local_count],
            host_functions: Vec::new(),
            call_depth: 0,
            jit: JitConfig::default(),
            native: NativeState::Untried,
            native_exec_count: 0,
        }
    }

    pub fn register_function(&mut self, function: Box<dyn HostFunction>) -> u16 {
        let index = self.host_functions.len() as u16;
        self.host_functions.push(VmHostFunction::Dynamic(function));
        index
    }

    pub fn register_static_function(&mut self, function: StaticHostFunction) -> u16 {
        let index = self.host_functions.len() as u16;
        self.host_functions.push(VmHostFunction::Static(function));
        index
    }

    pub fn set_jit_config(&mut self, config: JitConfig) {
        self.jit = config;
        self.native = NativeState::Untried;
    }

    pub fn jit_config(&self) -> &JitConfig {
        &self.jit
    }

    /// Runs until the program returns or a host function yields.
    ///
    /// With the jit enabled the bytecode is compiled on first use and
    /// execution enters native code whenever the current ip has an entry
    /// point: the start of the program, or a call that yielded.
    pub fn run(&mut self) -> VmResult<VmStatus> {
        if let Some(native) = self.native_code()?
            && let Some(entry) = native.entry_for_ip(self.ip)
        {
            return self.run_native(&native, entry);
        }
        self.run_interpreter()
    }

    pub fn resume(&mut self) -> VmResult<VmStatus> {
        self.run()
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn locals(&self) -> &[Value] {
        &self.locals
    }

    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn call_depth(&self) -> usize {
        self.call_depth
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn is_native_compiled(&self) -> bool {
        matches!(self.native, NativeState::Ready(_))
    }

    pub fn native_exec_count(&self) -> u64 {
        self.native_exec_count
    }

    pub fn native_code_handle(&self) -> Option<Rc<NativeCode>> {
        match &self.native {
            NativeState::Ready(code) => Some(Rc::clone(code)),
            _ => None,
        }
    }

    pub fn dump_jit_info(&self) -> String {
        let mut out = format!(
            "jit: enabled={} native executions={}\n",
            self.jit.enabled, self.native_exec_count
        );
        match &self.native {
            NativeState::Untried => out.push_str("  native code: not compiled\n"),
            NativeState::Unavailable => out.push_str("  native code: unavailable\n"),
            NativeState::Ready(code) => {
                out.push_str(&format!("  native code at {:?}\n", code.program().base()));
                out.push_str(&code.listing().to_string());
            }
        }
        out
    }

    fn native_code(&mut self) -> VmResult<Option<Rc<NativeCode>>> {
        if !self.jit.enabled {
            return Ok(None);
        }
        match &self.native {
            NativeState::Ready(code) => return Ok(Some(Rc::clone(code))),
            NativeState::Unavailable => return Ok(None),
            NativeState::Untried => {}
        }
        match NativeCode::compile(&self.program, &self.jit)? {
            Some(code) => {
                let code = Rc::new(code);
                self.native = NativeState::Ready(Rc::clone(&code));
                Ok(Some(code))
            }
            None => {
                self.native = NativeState::Unavailable;
                Ok(None)
            }
        }
    }

    fn run_native(&mut self, native: &NativeCode, entry: WordOffset) -> VmResult<VmStatus> {
        bridge::clear_bridge_error();
        debug!(ip = self.ip, %entry, "entering native code");
        let ctx = self as *mut Vm as *mut c_void;
        // The program's helpers are this module's bridges, which expect a
        // `*mut Vm` that outlives the call.
        let status = unsafe { native.program().call_compiled(entry, ctx)? };
        self.native_exec_count = self.native_exec_count.saturating_add(1);
        match status {
            jit::STATUS_HALTED => Ok(VmStatus::Halted),
            jit::STATUS_YIELDED => Ok(VmStatus::Yielded),
            jit::STATUS_BOUNDS => Err(VmError::BytecodeBounds),
            jit::STATUS_ERROR => Err(bridge::take_bridge_error().unwrap_or_else(|| {
                VmError::Native("bridge reported failure without an error".to_string())
            })),
            other => Err(VmError::Native(format!(
                "unexpected native return status {other}"
            ))),
        }
    }

    fn run_interpreter(&mut self) -> VmResult<VmStatus> {
        loop {
            let opcode = self.read_u8()?;
            match self.execute_interpreter_instruction(opcode)? {
                StepOutcome::Continue => {}
                StepOutcome::Halted => return Ok(VmStatus::Halted),
                StepOutcome::Yielded => return Ok(VmStatus::Yielded),
            }
        }
    }

    /// Executes the opcode whose byte sits just before `self.ip`.
    pub(crate) fn execute_interpreter_instruction(&mut self, opcode: u8) -> VmResult<StepOutcome> {
        let Some(opcode) = OpCode::from_byte(opcode) else {
            return Err(VmError::InvalidOpcode(opcode));
        };
        match opcode {
            OpCode::Nop => {}
            OpCode::Ret => return Ok(StepOutcome::Halted),
            OpCode::Ldc => {
                let index = self.read_u32()?;
                let value = self
                    .program
                    .constants
                    .get(index as usize)
                    .cloned()
                    .ok_or(VmError::InvalidConstant(index))?;
                self.stack.push(value);
            }
            OpCode::Add => self.arith(Arith::Add)?,
            OpCode::Sub => self.arith(Arith::Sub)?,
            OpCode::Mul => self.arith(Arith::Mul)?,
            OpCode::Div => self.arith(Arith::Div)?,
            OpCode::Neg => {
                let value = match self.pop()?.into_number()? {
                    Number::Int(value) => Value::Int(value.wrapping_neg()),
                    Number::Float(value) => Value::Float(-value),
                };
                self.stack.push(value);
            }
            OpCode::Ceq => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                self.stack.push(Value::Bool(lhs == rhs));
            }
            OpCode::Clt => self.compare(|ordering| ordering.is_lt())?,
            OpCode::Cgt => self.compare(|ordering| ordering.is_gt())?,
            OpCode::Br => {
                let target = self.read_u32()? as usize;
                self.jump_to(target)?;
            }
            OpCode::Brfalse => {
                let target = self.read_u32()? as usize;
                if !self.pop()?.into_bool()? {
                    self.jump_to(target)?;
                }
            }
            OpCode::Pop => {
                self.pop()?;
            }
            OpCode::Dup => {
                let top = self.stack.last().cloned().ok_or(VmError::StackUnderflow)?;
                self.stack.push(top);
            }
            OpCode::Ldloc => {
                let index = self.read_u8()?;
                let value = self
                    .locals
                    .get(index as usize)
                    .cloned()
                    .ok_or(VmError::InvalidLocal(index))?;
                self.stack.push(value);
            }
            OpCode::Stloc => {
                let index = self.read_u8()?;
                let value = self.pop()?;
                *self
                    .locals
                    .get_mut(index as usize)
                    .ok_or(VmError::InvalidLocal(index))? = value;
            }
            OpCode::Call => {
                let call_ip = self.ip - 1;
                let index = self.read_u16()?;
                let argc = self.read_u8()?;
                if self.execute_host_call(index, argc, call_ip)? {
                    return Ok(StepOutcome::Yielded);
                }
            }
            OpCode::Shl | OpCode::Shr => {
                let amount = self.pop()?.into_int()?;
                if !(0..=63).contains(&amount) {
                    return Err(VmError::InvalidShift(amount));
                }
                let value = self.pop()?.into_int()?;
                let shifted = if opcode == OpCode::Shl {
                    value << amount
                } else {
                    value >> amount
                };
                self.stack.push(Value::Int(shifted));
            }
        }
        Ok(StepOutcome::Continue)
    }

    /// Runs one instruction on behalf of compiled code. The instruction is
    /// found from the return address of the helper call that got here.
    pub(crate) fn execute_native_op(
        &mut self,
        opcode: u32,
        return_address: *const u8,
    ) -> VmResult<StepOutcome> {
        let (_, _, ip) = self.native_site(return_address)?;
        self.ip = ip + 1;
        self.execute_interpreter_instruction(opcode as u8)
    }

    /// Runs a conditional branch for compiled code and returns the native
    /// address to continue at.
    pub(crate) fn execute_native_branch(
        &mut self,
        opcode: u32,
        return_address: *const u8,
    ) -> VmResult<*const u8> {
        let (native, pc, ip) = self.native_site(return_address)?;
        self.ip = ip + 1;
        self.execute_interpreter_instruction(opcode as u8)?;
        let fallthrough = Instruction {
            ip,
            opcode: OpCode::Brfalse,
        }
        .next_ip();
        let resolver = native.program().resolver();
        let address = if self.ip == fallthrough {
            resolver.skip_inline_jump_address(pc)?
        } else {
            resolver.inline_jump_address(pc)?
        };
        Ok(address)
    }

    pub(crate) fn native_trap_address(&self, return_address: *const u8) -> VmResult<*const u8> {
        let (native, pc, _) = self.native_site(return_address)?;
        Ok(native.program().resolver().trap_address(pc)?)
    }

    fn native_site(
        &self,
        return_address: *const u8,
    ) -> VmResult<(Rc<NativeCode>, WordOffset, usize)> {
        let NativeState::Ready(native) = &self.native else {
            return Err(VmError::Native("no compiled code is active".to_string()));
        };
        let pc = native.program().resolver().current_pc(return_address)?;
        let ip = native
            .ip_at(pc)
            .ok_or_else(|| VmError::Native(format!("no instruction recorded at call site {pc}")))?;
        Ok((Rc::clone(native), pc, ip))
    }

    fn pop(&mut self) -> VmResult<Value> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn arith(&mut self, op: Arith) -> VmResult<()> {
        let rhs = self.pop()?.into_number()?;
        let lhs = self.pop()?.into_number()?;
        let result = match (lhs, rhs) {
            (Number::Int(lhs), Number::Int(rhs)) => Value::Int(op.ints(lhs, rhs)?),
            (lhs, rhs) => Value::Float(op.floats(lhs.to_float(), rhs.to_float())?),
        };
        self.stack.push(result);
        Ok(())
    }

    fn compare(&mut self, accept: impl FnOnce(std::cmp::Ordering) -> bool) -> VmResult<()> {
        let rhs = self.pop()?.into_number()?;
        let lhs = self.pop()?.into_number()?;
        let ordering = match (lhs, rhs) {
            (Number::Int(lhs), Number::Int(rhs)) => Some(lhs.cmp(&rhs)),
            (lhs, rhs) => lhs.to_float().partial_cmp(&rhs.to_float()),
        };
        self.stack
            .push(Value::Bool(ordering.is_some_and(accept)));
        Ok(())
    }

    /// Returns true when the host function yielded. A yield puts the
    /// arguments back and rewinds `ip` to the call so it runs again on
    /// resume.
    fn execute_host_call(&mut self, index: u16, argc: u8, call_ip: usize) -> VmResult<bool> {
        let argc = argc as usize;
        if self.stack.len() < argc {
            return Err(VmError::StackUnderflow);
        }
        let args = self.stack.split_off(self.stack.len() - argc);

        // Host functions get `&mut Vm`, so the callee is detached from the
        // table for the duration of the call.
        let mut function = match self.host_functions.get_mut(index as usize) {
            None => {
                self.stack.extend(args);
                return Err(VmError::InvalidCall(index));
            }
            Some(VmHostFunction::Static(function)) => VmHostFunction::Static(*function),
            Some(slot) => {
                std::mem::replace(slot, VmHostFunction::Static(detached_host_function))
            }
        };

        self.call_depth += 1;
        let outcome = match &mut function {
            VmHostFunction::Dynamic(function) => function.call(self, &args),
            VmHostFunction::Static(function) => function(self, &args),
        };
        self.call_depth = self.call_depth.saturating_sub(1);
        if let VmHostFunction::Dynamic(_) = function
            && let Some(slot) = self.host_functions.get_mut(index as usize)
        {
            *slot = function;
        }

        match outcome? {
            CallOutcome::Return(values) => {
                self.stack.extend(values);
                Ok(false)
            }
            CallOutcome::Yield => {
                self.stack.extend(args);
                self.ip = call_ip;
                Ok(true)
            }
        }
    }

    fn read_u8(&mut self) -> VmResult<u8> {
        let value = *self.program.code.get(self.ip).ok_or(VmError::BytecodeBounds)?;
        self.ip += 1;
        Ok(value)
    }

    fn read_u16(&mut self) -> VmResult<u16> {
        let lo = self.read_u8()?;
        let hi = self.read_u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn read_u32(&mut self) -> VmResult<u32> {
        let value = self
            .program
            .operand_u32(self.ip)
            .ok_or(VmError::BytecodeBounds)?;
        self.ip += 4;
        Ok(value)
    }

    fn jump_to(&mut self, target: usize) -> VmResult<()> {
        if target >= self.program.code.len() {
            return Err(VmError::BytecodeBounds);
        }
        self.ip = target;
        Ok(())
    }
}

fn detached_host_function(_vm: &mut Vm, _args: &[Value]) -> VmResult<CallOutcome> {
    Err(VmError::HostError(
        "host function called itself re-entrantly".to_string(),
    ))
}
