use super::{
    ArchSpec, CodeBuffer, CodegenError, CodegenResult, TargetArch, WordOffset, offset_from,
    sign_extend, signed_field, word_distance,
};

const COND_AL: u32 = 0xE000_0000;
const COND_NE: u32 = 0x1000_0000;

const REG_R0: u32 = 0;
const REG_R1: u32 = 1;
const REG_R2: u32 = 2;
const REG_R4: u32 = 4;
/// Holds the context pointer for the whole function.
const REG_CTX: u32 = 8;
const REG_IP: u32 = 12;
const REG_LR: u32 = 14;
const REG_PC: u32 = 15;

const CALLEE_SAVED: u32 = 0x0FF0;

const OP_PUSH: u32 = 0xE92D_0000;
const OP_POP: u32 = 0xE8BD_0000;
const OP_NOP: u32 = 0xE1A0_0000;

const DP_MOV: u32 = 0xD;
const DP_ORR: u32 = 0xC;
const DP_ADD: u32 = 0x4;
const DP_CMP: u32 = 0xA;

/// 32-bit ARM (A32 encoding).
///
/// Register save masks depend on which callee-saved registers the body
/// used, so prologues and epilogues are emitted with empty `push`/`pop`
/// masks and patched in `finish_function`.
#[derive(Debug, Default)]
pub struct Arm32 {
    dirty: u32,
    push_sites: Vec<WordOffset>,
    pop_sites: Vec<WordOffset>,
}

impl Arm32 {
    fn save_mask(&self) -> u32 {
        let mut mask = (self.dirty & CALLEE_SAVED) | (1 << REG_CTX) | (1 << REG_LR);
        // The AAPCS wants sp 8-byte aligned at public interfaces.
        if mask.count_ones() % 2 != 0 {
            mask |= 1 << REG_R4;
        }
        mask
    }

    fn set_reg(&mut self, code: &mut CodeBuffer, reg: u32, value: u32) -> CodegenResult<()> {
        if CALLEE_SAVED & (1 << reg) != 0 {
            self.dirty |= 1 << reg;
        }
        for word in set_reg_sequence(reg, value) {
            code.emit_word(word)?;
        }
        Ok(())
    }
}

impl TargetArch for Arm32 {
    const SPEC: ArchSpec = ArchSpec {
        name: "arm32",
        word_bytes: 4,
        entry_prologue_size: 4,
        epilogue_size: 2,
        call_site_size: 11,
        jump_epilogue_size: 1,
        status_check_size: 2,
        branch_size: 1,
    };
    const IS_HOST: bool = cfg!(target_arch = "arm");

    fn emit_prologue(&mut self, code: &mut CodeBuffer) -> CodegenResult<()> {
        self.dirty |= 1 << REG_CTX;
        let push = code.emit_word(OP_PUSH)?;
        self.push_sites.push(push);
        code.emit_word(mov_reg(REG_CTX, REG_R0))?;
        code.emit_word(dp_imm(DP_MOV, 0, REG_R0, 0, 0))?;
        code.emit_word(OP_NOP)?;
        Ok(())
    }

    fn emit_epilogue(&mut self, code: &mut CodeBuffer) -> CodegenResult<()> {
        let pop = code.emit_word(OP_POP)?;
        self.pop_sites.push(pop);
        code.emit_word(bx(REG_LR))?;
        Ok(())
    }

    fn finish_function(&mut self, code: &mut CodeBuffer) -> CodegenResult<()> {
        let mask = self.save_mask();
        for &at in &self.push_sites {
            code.patch_word(at, OP_PUSH | mask)?;
        }
        for &at in &self.pop_sites {
            code.patch_word(at, OP_POP | mask)?;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.dirty = 0;
        self.push_sites.clear();
        self.pop_sites.clear();
    }

    fn emit_helper_call(
        &mut self,
        code: &mut CodeBuffer,
        helper: u64,
        arg: u32,
    ) -> CodegenResult<WordOffset> {
        let helper = u32::try_from(helper).map_err(|_| CodegenError::AddressOutOfRange(helper))?;
        let start = code.emit_word(mov_reg(REG_R0, REG_CTX))?;
        self.set_reg(code, REG_R1, arg)?;
        // pc reads two words ahead of the add; the return address is the
        // word after `blx`, four words further on.
        code.emit_word(dp_imm(DP_ADD, REG_PC, REG_R2, 0, 16))?;
        self.set_reg(code, REG_IP, helper)?;
        code.emit_word(blx(REG_IP))?;
        Ok(start)
    }

    fn emit_jump_dispatch(&mut self, code: &mut CodeBuffer) -> CodegenResult<WordOffset> {
        code.emit_word(bx(REG_R0))
    }

    fn emit_status_check(&mut self, code: &mut CodeBuffer) -> CodegenResult<WordOffset> {
        code.emit_word(dp_imm(DP_CMP, REG_R0, 0, 0, 0) | (1 << 20))?;
        code.emit_word(COND_NE | 0x0A00_0000)
    }

    fn emit_branch(&mut self, code: &mut CodeBuffer) -> CodegenResult<WordOffset> {
        code.emit_word(COND_AL | 0x0A00_0000)
    }

    fn emit_set_status(&mut self, code: &mut CodeBuffer, status: u8) -> CodegenResult<WordOffset> {
        code.emit_word(dp_imm(DP_MOV, 0, REG_R0, 0, u32::from(status)))
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
        if !is_branch(word) {
            return Err(CodegenError::NotABranch { at, word });
        }
        let imm = signed_field(word_distance(at, target) - 2, 24, at, target)?;
        code.patch_word(at, (word & 0xFF00_0000) | imm)
    }

    fn branch_target(code: &CodeBuffer, at: WordOffset) -> CodegenResult<WordOffset> {
        let word = code.read_word(at)?;
        if !is_branch(word) {
            return Err(CodegenError::NotABranch { at, word });
        }
        offset_from(at, sign_extend(word & 0x00FF_FFFF, 24) + 2)
    }

    fn flush_icache(start: *const u8, len: usize) {
        #[cfg(target_arch = "arm")]
        crate::native::memory::clear_icache(start, len);
        #[cfg(not(target_arch = "arm"))]
        let _ = (start, len);
    }
}

fn is_branch(word: u32) -> bool {
    word & 0x0F00_0000 == 0x0A00_0000
}

fn dp_imm(opcode: u32, rn: u32, rd: u32, rotate: u32, imm8: u32) -> u32 {
    COND_AL | (1 << 25) | (opcode << 21) | (rn << 16) | (rd << 12) | (rotate << 8) | (imm8 & 0xFF)
}

fn mov_reg(rd: u32, rm: u32) -> u32 {
    COND_AL | (DP_MOV << 21) | (rd << 12) | rm
}

fn bx(rm: u32) -> u32 {
    0xE12F_FF10 | rm
}

fn blx(rm: u32) -> u32 {
    0xE12F_FF30 | rm
}

/// Loads a 32-bit constant with a fixed four-instruction sequence so call
/// sites keep a constant size whatever the value.
fn set_reg_sequence(reg: u32, value: u32) -> [u32; 4] {
    let bytes = value.to_le_bytes();
    [
        dp_imm(DP_MOV, 0, reg, 0, u32::from(bytes[0])),
        dp_imm(DP_ORR, reg, reg, 12, u32::from(bytes[1])),
        dp_imm(DP_ORR, reg, reg, 8, u32::from(bytes[2])),
        dp_imm(DP_ORR, reg, reg, 4, u32::from(bytes[3])),
    ]
}
