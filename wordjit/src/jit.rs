use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, trace};

use crate::codegen::{
    CodeListing, CompiledProgram, FunctionId, FunctionRecord, HostArch, Label, TargetArch,
    WordOffset,
};
use crate::native::FrozenProgram;
use crate::vm::{Instruction, OpCode, Program, VmError, VmResult, jit_branch_bridge, jit_op_bridge};

/// Status values shared by compiled code and its helpers. Zero keeps
/// executing, anything else unwinds to the epilogue and is returned.
pub const STATUS_CONTINUE: i32 = 0;
pub const STATUS_HALTED: i32 = 1;
pub const STATUS_YIELDED: i32 = 2;
pub const STATUS_ERROR: i32 = 3;
pub const STATUS_BOUNDS: i32 = 4;

const MAIN_FUNCTION: &str = "main";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JitConfig {
    pub enabled: bool,
    /// Words reserved up front in the code buffer.
    pub initial_capacity_words: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: native_jit_supported(),
            initial_capacity_words: 256,
        }
    }
}

pub fn native_jit_supported() -> bool {
    cfg!(any(unix, windows))
}

/// Addresses of the helpers translated code calls into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BridgeAddresses {
    pub op: u64,
    pub branch: u64,
}

impl BridgeAddresses {
    pub fn host() -> Self {
        Self {
            op: jit_op_bridge as usize as u64,
            branch: jit_branch_bridge as usize as u64,
        }
    }
}

/// Result of lowering bytecode for one backend.
pub struct Translation<A: TargetArch> {
    pub program: CompiledProgram<A>,
    pub function: FunctionId,
    /// Helper call sites mapped to the bytecode ip they execute.
    pub call_sites: BTreeMap<WordOffset, usize>,
}

/// Lowers `program` into a single native function.
///
/// Every instruction becomes a helper call except `nop` and `br`, which
/// are emitted natively. `brfalse` calls a helper that returns the native
/// address to continue at, read from the inline jump placed after the
/// call. Each `call` gets a secondary entry so a yielded host call can be
/// resumed without going back through the interpreter.
///
/// Returns `None` when the bytecode cannot be translated (undecodable, or
/// a branch into the middle of an instruction); the interpreter handles it
/// instead.
pub fn translate<A: TargetArch>(
    program: &Program,
    config: &JitConfig,
    bridges: BridgeAddresses,
) -> VmResult<Option<Translation<A>>> {
    let instructions = match program.decode() {
        Ok(instructions) => instructions,
        Err(err) => {
            debug!(error = %err, "bytecode not translatable");
            return Ok(None);
        }
    };
    if instructions.is_empty() {
        return Ok(None);
    }
    let boundaries: HashSet<usize> = instructions.iter().map(|instruction| instruction.ip).collect();
    for instruction in instructions.iter().filter(|instruction| instruction.opcode.is_branch()) {
        let target = branch_target(program, instruction)?;
        if !boundaries.contains(&target) {
            debug!(ip = instruction.ip, target, "branch target is not an instruction");
            return Ok(None);
        }
    }

    let mut compiled = CompiledProgram::<A>::with_capacity(config.initial_capacity_words)?;
    let mut call_sites = BTreeMap::new();
    let function = {
        let mut session = compiled.session();
        session.begin_function(MAIN_FUNCTION)?;
        let exit = session.exit_label()?;
        let mut labels = HashMap::with_capacity(instructions.len());
        for instruction in &instructions {
            labels.insert(instruction.ip, session.new_label()?);
        }

        for instruction in &instructions {
            if instruction.opcode == OpCode::Call {
                session.emit_entry(instruction.ip as u32)?;
            }
            session.bind_label(label_at(&labels, instruction.ip)?)?;
            trace!(
                ip = instruction.ip,
                op = instruction.opcode.mnemonic(),
                at = %session.position(),
                "lower"
            );
            let opcode = u32::from(instruction.opcode as u8);
            match instruction.opcode {
                OpCode::Nop => {
                    session.emit_nop()?;
                }
                OpCode::Br => {
                    let target = branch_target(program, instruction)?;
                    session.emit_branch(label_at(&labels, target)?)?;
                }
                OpCode::Brfalse => {
                    let target = branch_target(program, instruction)?;
                    let pc = session.emit_helper_call(bridges.branch, opcode)?;
                    session.emit_jump_dispatch()?;
                    session.emit_inline_jump(label_at(&labels, target)?)?;
                    call_sites.insert(pc, instruction.ip);
                }
                _ => {
                    let pc = session.emit_helper_call(bridges.op, opcode)?;
                    session.emit_status_check(exit)?;
                    call_sites.insert(pc, instruction.ip);
                }
            }
        }

        // Falling off the end of the bytecode.
        session.emit_set_status(STATUS_BOUNDS as u8)?;
        session.emit_branch(exit)?;
        session.mark_trap()?;
        session.emit_set_status(STATUS_ERROR as u8)?;
        session.end_function()?
    };

    debug!(
        arch = A::SPEC.name,
        instructions = instructions.len(),
        words = compiled.code().len_words(),
        "translated bytecode"
    );
    Ok(Some(Translation {
        program: compiled,
        function,
        call_sites,
    }))
}

fn branch_target(program: &Program, instruction: &Instruction) -> VmResult<usize> {
    program
        .operand_u32(instruction.ip + 1)
        .map(|target| target as usize)
        .ok_or(VmError::BytecodeBounds)
}

fn label_at(labels: &HashMap<usize, Label>, ip: usize) -> VmResult<Label> {
    labels
        .get(&ip)
        .copied()
        .ok_or_else(|| VmError::Native(format!("no label for ip {ip}")))
}

/// Host-executable translation of a program.
#[derive(Debug)]
pub struct NativeCode {
    program: FrozenProgram<HostArch>,
    function: FunctionId,
    call_sites: BTreeMap<WordOffset, usize>,
}

impl NativeCode {
    pub fn compile(program: &Program, config: &JitConfig) -> VmResult<Option<Self>> {
        let Some(translation) = translate::<HostArch>(program, config, BridgeAddresses::host())?
        else {
            return Ok(None);
        };
        let frozen = translation.program.freeze()?;
        Ok(Some(Self {
            program: frozen,
            function: translation.function,
            call_sites: translation.call_sites,
        }))
    }

    pub fn program(&self) -> &FrozenProgram<HostArch> {
        &self.program
    }

    pub fn function(&self) -> Option<&FunctionRecord> {
        self.program.function(self.function)
    }

    pub fn ip_at(&self, pc: WordOffset) -> Option<usize> {
        self.call_sites.get(&pc).copied()
    }

    /// Native entry for resuming at bytecode `ip`, if there is one.
    pub fn entry_for_ip(&self, ip: usize) -> Option<WordOffset> {
        let function = self.function()?;
        if ip == 0 {
            return Some(function.start);
        }
        function
            .secondary_entry(u32::try_from(ip).ok()?)
            .map(|entry| entry.prologue)
    }

    pub fn listing(&self) -> CodeListing {
        self.program.listing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::Assembler;
    use crate::codegen::{AArch64, Arm32, X86_64};
    use crate::vm::Value;

    const BRIDGES: BridgeAddresses = BridgeAddresses {
        op: 0x1000,
        branch: 0x2000,
    };

    fn countdown() -> Program {
        // local0 = 3; while local0 > 0 { local0 = local0 - 1 }; ret
        let mut asm = Assembler::new();
        asm.push_const(Value::Int(3));
        asm.stloc(0);
        asm.label("top").expect("label");
        asm.ldloc(0);
        asm.push_const(Value::Int(0));
        asm.op(OpCode::Cgt);
        asm.brfalse("done");
        asm.ldloc(0);
        asm.push_const(Value::Int(1));
        asm.op(OpCode::Sub);
        asm.stloc(0);
        asm.br("top");
        asm.label("done").expect("label");
        asm.op(OpCode::Ret);
        asm.finish_program().expect("assemble")
    }

    fn check_translation<A: TargetArch>() {
        let program = countdown();
        let translation = translate::<A>(&program, &JitConfig::default(), BRIDGES)
            .expect("translate")
            .expect("translatable");
        let record = translation
            .program
            .function(translation.function)
            .expect("record");
        assert_eq!(record.name, MAIN_FUNCTION);
        assert!(record.trap.is_some());
        // Every instruction except `br` goes through a helper.
        assert_eq!(translation.call_sites.len(), 11);
        assert!(translation.call_sites.values().any(|ip| *ip == 15));
        for pc in translation.call_sites.keys() {
            assert!(record.contains(*pc));
        }
    }

    #[test]
    fn countdown_translates_on_every_backend() {
        check_translation::<Arm32>();
        check_translation::<AArch64>();
        check_translation::<X86_64>();
    }

    #[test]
    fn branch_into_operand_is_not_translated() {
        let program = Program::new(
            vec![],
            vec![OpCode::Br as u8, 2, 0, 0, 0, OpCode::Ret as u8],
        );
        let translation =
            translate::<X86_64>(&program, &JitConfig::default(), BRIDGES).expect("translate");
        assert!(translation.is_none());
    }

    #[test]
    fn calls_get_secondary_entries() {
        let mut asm = Assembler::new();
        asm.op(OpCode::Nop);
        asm.call(0, 0);
        asm.op(OpCode::Ret);
        let program = asm.finish_program().expect("assemble");
        let translation = translate::<AArch64>(&program, &JitConfig::default(), BRIDGES)
            .expect("translate")
            .expect("translatable");
        let record = translation
            .program
            .function(translation.function)
            .expect("record");
        let entry = record.secondary_entry(1).expect("entry for call");
        assert_eq!(
            entry.resume.get() - entry.prologue.get(),
            AArch64::SPEC.entry_prologue_size
        );
        assert!(record.secondary_entry(0).is_none());
    }
}
