pub mod assembler;
pub mod codegen;
pub mod jit;
#[cfg(feature = "cli")]
pub mod logging;
pub mod native;
pub mod vm;

pub use assembler::{AsmParseError, Assembler, AssemblerError, assemble};
pub use codegen::{
    ArchSpec, CodeBuffer, CodeListing, CodegenError, CodegenResult, CodegenSession,
    CompiledProgram, FunctionId, FunctionRecord, FunctionState, HostArch, Label, SecondaryEntry,
    TargetArch, WordOffset,
};
pub use jit::{BridgeAddresses, JitConfig, NativeCode, Translation, native_jit_supported, translate};
pub use native::{CompiledEntry, EntryPoint, ExecutableMemory, FrozenProgram, PcResolver};
pub use vm::{
    CallOutcome, HostFunction, Instruction, OpCode, Program, StaticHostFunction, Value, Vm,
    VmError, VmResult, VmStatus,
};
