use crate::codegen::{CodegenError, CodegenResult, FunctionRecord, TargetArch, WordOffset};

use super::FrozenProgram;

/// Logical pc of the helper call site that returns to `return_offset`.
pub fn pc_for_return_offset<A: TargetArch>(return_offset: WordOffset) -> CodegenResult<WordOffset> {
    return_offset
        .checked_sub(A::SPEC.call_site_size)
        .ok_or(CodegenError::InvalidEntry(return_offset))
}

/// Offset of the inline jump operand that follows the call site at `pc`.
/// `None` when it would not fit in a word offset.
pub fn inline_operand_offset<A: TargetArch>(pc: WordOffset) -> Option<WordOffset> {
    pc.checked_add(A::SPEC.call_site_size)?
        .checked_add(A::SPEC.jump_epilogue_size)
}

/// First word past the call site at `pc`, its dispatch and its operand.
pub fn skip_inline_jump_offset<A: TargetArch>(pc: WordOffset) -> Option<WordOffset> {
    inline_operand_offset::<A>(pc)?.checked_add(1)
}

/// Maps hardware return addresses seen by helpers back to word offsets in
/// a frozen program, and reads the inline jump operands placed after
/// call sites.
pub struct PcResolver<'p, A: TargetArch> {
    program: &'p FrozenProgram<A>,
}

impl<'p, A: TargetArch> PcResolver<'p, A> {
    pub fn new(program: &'p FrozenProgram<A>) -> Self {
        Self { program }
    }

    pub fn current_pc(&self, return_address: *const u8) -> CodegenResult<WordOffset> {
        let return_offset = self.program.offset_of_address(return_address)?;
        pc_for_return_offset::<A>(return_offset)
    }

    pub fn read_inline_jump(&self, pc: WordOffset) -> CodegenResult<i32> {
        let operand = self.operand_offset(pc)?;
        Ok(self.program.read_word(operand)? as i32)
    }

    pub fn inline_jump_target(&self, pc: WordOffset) -> CodegenResult<WordOffset> {
        let operand = self.operand_offset(pc)?;
        let distance = self.read_inline_jump(pc)?;
        let target = i64::from(operand.get()) + i64::from(distance);
        u32::try_from(target)
            .ok()
            .map(WordOffset::new)
            .filter(|target| target.get() < self.program.len_words())
            .ok_or(CodegenError::BranchOutOfRange {
                at: operand,
                target: WordOffset::new(target.clamp(0, i64::from(u32::MAX)) as u32),
            })
    }

    pub fn skip_inline_jump(&self, pc: WordOffset) -> CodegenResult<WordOffset> {
        skip_inline_jump_offset::<A>(pc).ok_or_else(|| self.out_of_range(pc))
    }

    pub fn inline_jump_address(&self, pc: WordOffset) -> CodegenResult<*const u8> {
        self.program.address_of(self.inline_jump_target(pc)?)
    }

    pub fn skip_inline_jump_address(&self, pc: WordOffset) -> CodegenResult<*const u8> {
        self.program.address_of(self.skip_inline_jump(pc)?)
    }

    fn operand_offset(&self, pc: WordOffset) -> CodegenResult<WordOffset> {
        inline_operand_offset::<A>(pc).ok_or_else(|| self.out_of_range(pc))
    }

    fn out_of_range(&self, pc: WordOffset) -> CodegenError {
        CodegenError::OffsetOutOfRange {
            offset: pc,
            len_words: self.program.len_words() as usize,
        }
    }

    pub fn function_at(&self, pc: WordOffset) -> Option<&'p FunctionRecord> {
        self.program.function_at(pc)
    }

    /// Address of the trap stub of the function containing `pc`.
    pub fn trap_address(&self, pc: WordOffset) -> CodegenResult<*const u8> {
        let trap = self
            .function_at(pc)
            .and_then(|function| function.trap)
            .ok_or(CodegenError::InvalidEntry(pc))?;
        self.program.address_of(trap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{AArch64, Arm32, X86_64};
    use proptest::prelude::*;

    fn check_call_site_mapping<A: TargetArch>(entry: u32) {
        let after_prologue = WordOffset::new(entry) + A::SPEC.entry_prologue_size;
        let return_offset = after_prologue + A::SPEC.call_site_size;
        assert_eq!(
            pc_for_return_offset::<A>(return_offset).expect("pc"),
            after_prologue
        );
        assert_eq!(
            skip_inline_jump_offset::<A>(after_prologue),
            Some(return_offset + A::SPEC.jump_epilogue_size + 1)
        );
    }

    #[test]
    fn return_offset_before_any_call_site_is_rejected() {
        let err = pc_for_return_offset::<X86_64>(WordOffset::new(3)).expect_err("too small");
        assert_eq!(err, CodegenError::InvalidEntry(WordOffset::new(3)));
    }

    #[test]
    fn operand_offsets_past_the_word_range_are_none() {
        let pc = WordOffset::new(u32::MAX - 3);
        assert_eq!(inline_operand_offset::<X86_64>(pc), None);
        assert_eq!(skip_inline_jump_offset::<AArch64>(pc), None);
        let last = WordOffset::new(u32::MAX - Arm32::SPEC.call_site_size - 1);
        assert_eq!(
            inline_operand_offset::<Arm32>(last),
            Some(WordOffset::new(u32::MAX))
        );
        assert_eq!(skip_inline_jump_offset::<Arm32>(last), None);
    }

    proptest! {
        #[test]
        fn first_call_site_after_prologue_maps_back(entry in 0u32..1_000_000) {
            check_call_site_mapping::<Arm32>(entry);
            check_call_site_mapping::<AArch64>(entry);
            check_call_site_mapping::<X86_64>(entry);
        }
    }
}
