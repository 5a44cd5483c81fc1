use super::{CodeBuffer, CodegenError, CodegenResult, WordOffset};

mod aarch64;
mod arm32;
mod x86_64;

pub use aarch64::AArch64;
pub use arm32::Arm32;
pub use x86_64::X86_64;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "arm")))]
compile_error!(
    "wordjit only targets x86_64, aarch64 and arm: no instruction cache flush is known for this architecture"
);

#[cfg(target_arch = "x86_64")]
pub type HostArch = X86_64;

#[cfg(target_arch = "aarch64")]
pub type HostArch = AArch64;

#[cfg(target_arch = "arm")]
pub type HostArch = Arm32;

/// Fixed sequence sizes of one backend, all in words.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArchSpec {
    pub name: &'static str,
    pub word_bytes: usize,
    /// Words between a function's raw start and its real entry point.
    pub entry_prologue_size: u32,
    pub epilogue_size: u32,
    /// Words from the start of a helper call site to the address the
    /// helper returns to.
    pub call_site_size: u32,
    /// Words between a call site's return address and an inline jump
    /// operand, i.e. the dispatch that consumes the helper's result.
    pub jump_epilogue_size: u32,
    pub status_check_size: u32,
    pub branch_size: u32,
}

/// Instruction encoder for one target architecture.
///
/// Every method appends whole words. A backend may keep per-function state
/// (register usage, placeholders awaiting a final value) which `reset`
/// drops and `finish_function` resolves.
pub trait TargetArch: Default {
    const SPEC: ArchSpec;
    /// True when code for this backend can run in the current process.
    const IS_HOST: bool;

    /// Saves callee-saved state, pins the context argument and zeroes the
    /// status register. Emits exactly `entry_prologue_size` words.
    fn emit_prologue(&mut self, code: &mut CodeBuffer) -> CodegenResult<()>;

    /// Restores what the prologue saved and returns the status register.
    fn emit_epilogue(&mut self, code: &mut CodeBuffer) -> CodegenResult<()>;

    /// Backpatches placeholders once the whole function body is known.
    fn finish_function(&mut self, _code: &mut CodeBuffer) -> CodegenResult<()> {
        Ok(())
    }

    fn reset(&mut self);

    /// Calls `helper(ctx, arg, return_address)`, leaving its result in the
    /// status register. Returns the offset of the first word of the site.
    fn emit_helper_call(
        &mut self,
        code: &mut CodeBuffer,
        helper: u64,
        arg: u32,
    ) -> CodegenResult<WordOffset>;

    /// Jumps to the address held in the status register.
    fn emit_jump_dispatch(&mut self, code: &mut CodeBuffer) -> CodegenResult<WordOffset>;

    /// Conditional branch taken when the status register is non-zero.
    /// Returns the offset of the patchable branch word.
    fn emit_status_check(&mut self, code: &mut CodeBuffer) -> CodegenResult<WordOffset>;

    /// Unconditional branch. Returns the offset of the patchable branch word.
    fn emit_branch(&mut self, code: &mut CodeBuffer) -> CodegenResult<WordOffset>;

    fn emit_set_status(&mut self, code: &mut CodeBuffer, status: u8) -> CodegenResult<WordOffset>;

    fn emit_nop(&mut self, code: &mut CodeBuffer) -> CodegenResult<WordOffset>;

    /// Points the branch word at `at` to `target`.
    fn patch_branch(code: &mut CodeBuffer, at: WordOffset, target: WordOffset)
    -> CodegenResult<()>;

    /// Decodes the destination of the branch word at `at`.
    fn branch_target(code: &CodeBuffer, at: WordOffset) -> CodegenResult<WordOffset>;

    /// Makes freshly written bytes visible to instruction fetch.
    fn flush_icache(start: *const u8, len: usize);
}

/// Flushes the instruction cache for `len` bytes at `start` using the
/// backend `A`. Call after writing code and before executing it.
pub fn flush_instruction_cache<A: TargetArch>(start: *const u8, len: usize) {
    if start.is_null() || len == 0 {
        return;
    }
    A::flush_icache(start, len);
}

fn word_distance(from: WordOffset, to: WordOffset) -> i64 {
    i64::from(to.get()) - i64::from(from.get())
}

fn signed_field(
    displacement: i64,
    bits: u32,
    at: WordOffset,
    target: WordOffset,
) -> CodegenResult<u32> {
    let limit = 1i64 << (bits - 1);
    if displacement < -limit || displacement >= limit {
        return Err(CodegenError::BranchOutOfRange { at, target });
    }
    Ok((displacement as u32) & ((1u32 << bits) - 1))
}

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 32 - bits;
    i64::from(((value << shift) as i32) >> shift)
}

fn offset_from(at: WordOffset, displacement: i64) -> CodegenResult<WordOffset> {
    let target = i64::from(at.get()) + displacement;
    u32::try_from(target)
        .map(WordOffset::new)
        .map_err(|_| CodegenError::BranchOutOfRange {
            at,
            target: WordOffset::new(0),
        })
}
