use super::{
    ArchSpec, CodeBuffer, CodegenError, CodegenResult, TargetArch, WordOffset, offset_from,
    sign_extend, signed_field, word_distance,
};

const OP_B: u32 = 0x1400_0000;
const OP_CBNZ_W0: u32 = 0x3500_0000;
const OP_NOP: u32 = 0xD503_201F;
const OP_RET: u32 = 0xD65F_03C0;
const OP_BR_X0: u32 = 0xD61F_0000;
const OP_BLR_X16: u32 = 0xD63F_0200;

// x19 keeps the context pointer across helper calls.
const STP_FP_LR_PRE: u32 = 0xA9BE_7BFD;
// mov x29, sp
const MOV_FP_SP: u32 = 0x9100_03FD;
const STP_X19_X20: u32 = 0xA901_53F3;
const LDP_X19_X20: u32 = 0xA941_53F3;
const LDP_FP_LR_POST: u32 = 0xA8C2_7BFD;
const MOV_X19_X0: u32 = 0xAA00_03F3;
const MOV_X0_X19: u32 = 0xAA13_03E0;

const REG_W0: u32 = 0;
const REG_W1: u32 = 1;
const REG_X16: u32 = 16;

/// ARMv8-A, A64 encoding.
#[derive(Debug, Default)]
pub struct AArch64;

impl TargetArch for AArch64 {
    const SPEC: ArchSpec = ArchSpec {
        name: "aarch64",
        word_bytes: 4,
        entry_prologue_size: 5,
        epilogue_size: 3,
        call_site_size: 9,
        jump_epilogue_size: 1,
        status_check_size: 1,
        branch_size: 1,
    };
    const IS_HOST: bool = cfg!(target_arch = "aarch64");

    fn emit_prologue(&mut self, code: &mut CodeBuffer) -> CodegenResult<()> {
        code.emit_words(&[
            STP_FP_LR_PRE,
            MOV_FP_SP,
            STP_X19_X20,
            MOV_X19_X0,
            movz_w(REG_W0, 0, 0),
        ])?;
        Ok(())
    }

    fn emit_epilogue(&mut self, code: &mut CodeBuffer) -> CodegenResult<()> {
        code.emit_words(&[LDP_X19_X20, LDP_FP_LR_POST, OP_RET])?;
        Ok(())
    }

    fn reset(&mut self) {}

    fn emit_helper_call(
        &mut self,
        code: &mut CodeBuffer,
        helper: u64,
        arg: u32,
    ) -> CodegenResult<WordOffset> {
        let start = code.emit_word(MOV_X0_X19)?;
        code.emit_word(movz_w(REG_W1, arg & 0xFFFF, 0))?;
        code.emit_word(movk_w(REG_W1, arg >> 16, 1))?;
        // adr x2 sits three words in; the return address follows blr,
        // six words later.
        code.emit_word(adr(2, 24))?;
        for (index, half) in (0..4u32).zip(helper_halves(helper)) {
            let word = if index == 0 {
                movz_x(REG_X16, half, 0)
            } else {
                movk_x(REG_X16, half, index)
            };
            code.emit_word(word)?;
        }
        code.emit_word(OP_BLR_X16)?;
        Ok(start)
    }

    fn emit_jump_dispatch(&mut self, code: &mut CodeBuffer) -> CodegenResult<WordOffset> {
        code.emit_word(OP_BR_X0)
    }

    fn emit_status_check(&mut self, code: &mut CodeBuffer) -> CodegenResult<WordOffset> {
        code.emit_word(OP_CBNZ_W0)
    }

    fn emit_branch(&mut self, code: &mut CodeBuffer) -> CodegenResult<WordOffset> {
        code.emit_word(OP_B)
    }

    fn emit_set_status(&mut self, code: &mut CodeBuffer, status: u8) -> CodegenResult<WordOffset> {
        code.emit_word(movz_w(REG_W0, u32::from(status), 0))
    }

    fn emit_nop(&mut self, code: &mut CodeBuffer) -> CodegenResult<WordOffset> {
        code.emit_word(OP_NOP)
    }

    fn patch_branch(
        code: &mut CodeBuffer,
        at: WordOffset,
        target: WordOffset,
    ) -> CodegenResult<()> {
        let word = code.read_word(at)?;
        let displacement = word_distance(at, target);
        let patched = match BranchForm::of(word) {
            Some(BranchForm::Imm26) => {
                (word & 0xFC00_0000) | signed_field(displacement, 26, at, target)?
            }
            Some(BranchForm::Imm19) => {
                (word & 0xFF00_001F) | (signed_field(displacement, 19, at, target)? << 5)
            }
            None => return Err(CodegenError::NotABranch { at, word }),
        };
        code.patch_word(at, patched)
    }

    fn branch_target(code: &CodeBuffer, at: WordOffset) -> CodegenResult<WordOffset> {
        let word = code.read_word(at)?;
        let displacement = match BranchForm::of(word) {
            Some(BranchForm::Imm26) => sign_extend(word & 0x03FF_FFFF, 26),
            Some(BranchForm::Imm19) => sign_extend((word >> 5) & 0x7_FFFF, 19),
            None => return Err(CodegenError::NotABranch { at, word }),
        };
        offset_from(at, displacement)
    }

    fn flush_icache(start: *const u8, len: usize) {
        #[cfg(target_arch = "aarch64")]
        crate::native::memory::clear_icache(start, len);
        #[cfg(not(target_arch = "aarch64"))]
        let _ = (start, len);
    }
}

enum BranchForm {
    Imm26,
    Imm19,
}

impl BranchForm {
    fn of(word: u32) -> Option<Self> {
        if word & 0xFC00_0000 == OP_B {
            Some(Self::Imm26)
        } else if word & 0x7F00_0000 == OP_CBNZ_W0 {
            Some(Self::Imm19)
        } else {
            None
        }
    }
}

fn helper_halves(helper: u64) -> [u32; 4] {
    [
        (helper & 0xFFFF) as u32,
        ((helper >> 16) & 0xFFFF) as u32,
        ((helper >> 32) & 0xFFFF) as u32,
        ((helper >> 48) & 0xFFFF) as u32,
    ]
}

fn movz_w(rd: u32, imm16: u32, shift: u32) -> u32 {
    0x5280_0000 | (shift << 21) | ((imm16 & 0xFFFF) << 5) | rd
}

fn movk_w(rd: u32, imm16: u32, shift: u32) -> u32 {
    0x7280_0000 | (shift << 21) | ((imm16 & 0xFFFF) << 5) | rd
}

fn movz_x(rd: u32, imm16: u32, shift: u32) -> u32 {
    0xD280_0000 | (shift << 21) | ((imm16 & 0xFFFF) << 5) | rd
}

fn movk_x(rd: u32, imm16: u32, shift: u32) -> u32 {
    0xF280_0000 | (shift << 21) | ((imm16 & 0xFFFF) << 5) | rd
}

fn adr(rd: u32, bytes: u32) -> u32 {
    0x1000_0000 | ((bytes & 0x3) << 29) | (((bytes >> 2) & 0x7_FFFF) << 5) | rd
}
