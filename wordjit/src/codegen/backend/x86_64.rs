use super::{
    ArchSpec, CodeBuffer, CodegenError, CodegenResult, TargetArch, WordOffset, word_distance,
};

const WIN64: bool = cfg!(windows);

const NOP: u8 = 0x90;
const NOP4: [u8; 4] = [0x0F, 0x1F, 0x40, 0x00];

// push rbp; mov rbp, rsp | push rbx; xor eax, eax | mov rbx, <arg0> | sub rsp, 0x28
const PROLOGUE_FRAME: [u8; 4] = [0x55, 0x48, 0x89, 0xE5];
const PROLOGUE_SAVE: [u8; 4] = [0x53, 0x31, 0xC0, NOP];
const PROLOGUE_RESERVE: [u8; 4] = [0x48, 0x83, 0xEC, 0x28];
const EPILOGUE_RELEASE: [u8; 4] = [0x48, 0x83, 0xC4, 0x28];
const EPILOGUE_RETURN: [u8; 4] = [0x5B, 0x5D, 0xC3, NOP];

const JNZ_PREFIX: [u8; 4] = [0x85, 0xC0, 0x0F, 0x85];
const JMP_PREFIX: [u8; 4] = [NOP, NOP, NOP, 0xE9];
const JMP_RAX: [u8; 4] = [0xFF, 0xE0, NOP, NOP];

/// x86-64. Instructions are packed into 4-byte words, padding with NOPs
/// where an instruction would otherwise leave a word partly filled.
///
/// Branch words hold a rel32 measured from the end of that same word, so
/// the opcode bytes always sit at the tail of the preceding word.
#[derive(Debug, Default)]
pub struct X86_64;

impl X86_64 {
    fn emit_bytes(code: &mut CodeBuffer, bytes: &[u8]) -> CodegenResult<WordOffset> {
        let start = code.position();
        for chunk in bytes.chunks(4) {
            let mut word = [NOP; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            code.emit_word(u32::from_le_bytes(word))?;
        }
        Ok(start)
    }
}

impl TargetArch for X86_64 {
    const SPEC: ArchSpec = ArchSpec {
        name: "x86_64",
        word_bytes: 4,
        entry_prologue_size: 4,
        epilogue_size: 2,
        call_site_size: 8,
        jump_epilogue_size: 1,
        status_check_size: 2,
        branch_size: 2,
    };
    const IS_HOST: bool = cfg!(target_arch = "x86_64");

    fn emit_prologue(&mut self, code: &mut CodeBuffer) -> CodegenResult<()> {
        let pin_context: [u8; 4] = if WIN64 {
            [0x48, 0x89, 0xCB, NOP]
        } else {
            [0x48, 0x89, 0xFB, NOP]
        };
        let mut bytes = Vec::with_capacity(16);
        bytes.extend_from_slice(&PROLOGUE_FRAME);
        bytes.extend_from_slice(&PROLOGUE_SAVE);
        bytes.extend_from_slice(&pin_context);
        bytes.extend_from_slice(&PROLOGUE_RESERVE);
        Self::emit_bytes(code, &bytes)?;
        Ok(())
    }

    fn emit_epilogue(&mut self, code: &mut CodeBuffer) -> CodegenResult<()> {
        let mut bytes = Vec::with_capacity(8);
        bytes.extend_from_slice(&EPILOGUE_RELEASE);
        bytes.extend_from_slice(&EPILOGUE_RETURN);
        Self::emit_bytes(code, &bytes)?;
        Ok(())
    }

    fn reset(&mut self) {}

    fn emit_helper_call(
        &mut self,
        code: &mut CodeBuffer,
        helper: u64,
        arg: u32,
    ) -> CodegenResult<WordOffset> {
        let mut bytes = Vec::with_capacity(32);
        // mov <arg0>, rbx
        if WIN64 {
            bytes.extend_from_slice(&[0x48, 0x89, 0xD9, NOP]);
        } else {
            bytes.extend_from_slice(&[0x48, 0x89, 0xDF, NOP]);
        }
        // mov <arg1:32>, imm32
        bytes.push(if WIN64 { 0xBA } else { 0xBE });
        bytes.extend_from_slice(&arg.to_le_bytes());
        bytes.extend_from_slice(&[NOP, NOP, NOP]);
        // lea <arg2>, [rip + 13], the address right after `call rax`
        if WIN64 {
            bytes.extend_from_slice(&[0x4C, 0x8D, 0x05]);
        } else {
            bytes.extend_from_slice(&[0x48, 0x8D, 0x15]);
        }
        bytes.extend_from_slice(&13i32.to_le_bytes());
        bytes.push(NOP);
        // mov rax, imm64; call rax
        bytes.extend_from_slice(&[0x48, 0xB8]);
        bytes.extend_from_slice(&helper.to_le_bytes());
        bytes.extend_from_slice(&[0xFF, 0xD0]);
        debug_assert_eq!(bytes.len(), Self::SPEC.call_site_size as usize * 4);
        Self::emit_bytes(code, &bytes)
    }

    fn emit_jump_dispatch(&mut self, code: &mut CodeBuffer) -> CodegenResult<WordOffset> {
        Self::emit_bytes(code, &JMP_RAX)
    }

    fn emit_status_check(&mut self, code: &mut CodeBuffer) -> CodegenResult<WordOffset> {
        Self::emit_bytes(code, &JNZ_PREFIX)?;
        code.emit_word(0)
    }

    fn emit_branch(&mut self, code: &mut CodeBuffer) -> CodegenResult<WordOffset> {
        Self::emit_bytes(code, &JMP_PREFIX)?;
        code.emit_word(0)
    }

    fn emit_set_status(&mut self, code: &mut CodeBuffer, status: u8) -> CodegenResult<WordOffset> {
        // xor eax, eax; mov al, imm8
        Self::emit_bytes(code, &[0x31, 0xC0, 0xB0, status])
    }

    fn emit_nop(&mut self, code: &mut CodeBuffer) -> CodegenResult<WordOffset> {
        Self::emit_bytes(code, &NOP4)
    }

    fn patch_branch(
        code: &mut CodeBuffer,
        at: WordOffset,
        target: WordOffset,
    ) -> CodegenResult<()> {
        ensure_branch_word(code, at)?;
        let rel_bytes = (word_distance(at, target) - 1) * 4;
        let rel = i32::try_from(rel_bytes)
            .map_err(|_| CodegenError::BranchOutOfRange { at, target })?;
        code.patch_word(at, rel as u32)
    }

    fn branch_target(code: &CodeBuffer, at: WordOffset) -> CodegenResult<WordOffset> {
        ensure_branch_word(code, at)?;
        let rel_bytes = i64::from(code.read_word(at)? as i32);
        if rel_bytes % 4 != 0 {
            return Err(CodegenError::MisalignedAddress(rel_bytes.unsigned_abs() as usize));
        }
        super::offset_from(at, rel_bytes / 4 + 1)
    }

    fn flush_icache(_start: *const u8, _len: usize) {
        // Instruction fetch is coherent with data writes; only keep the
        // compiler from sinking the copy past the call into the code.
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

fn ensure_branch_word(code: &CodeBuffer, at: WordOffset) -> CodegenResult<()> {
    let word = code.read_word(at)?;
    let opcode_word = match at.get().checked_sub(1) {
        Some(prev) => code.read_word(WordOffset::new(prev))?.to_le_bytes(),
        None => return Err(CodegenError::NotABranch { at, word }),
    };
    if opcode_word == JNZ_PREFIX || opcode_word == JMP_PREFIX {
        Ok(())
    } else {
        Err(CodegenError::NotABranch { at, word })
    }
}
