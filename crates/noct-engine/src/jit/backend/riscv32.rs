//! RISC-V 32 template backend
//!
//! Same register conventions as the 64-bit backend (`s10` env, `s11`
//! slot base, `s8`/`s9` comparison pair), with 32-bit loads and stores
//! throughout: a value is 8 bytes here, the payload at offset 4, and a
//! pointer immediate is a plain `lui`/`addi` pair.

use crate::jit::backend::TemplateBackend;
use crate::jit::codebuf::{BranchPatch, HelperArg, JitContext, PatchKind};

const ZERO: u32 = 0;
const RA: u32 = 1;
const SP: u32 = 2;
const T0: u32 = 5;
const T1: u32 = 6;
const T2: u32 = 7;
const S8: u32 = 24;
const S9: u32 = 25;
const S10: u32 = 26;
const S11: u32 = 27;
const A0: u32 = 10;

macro_rules! emit {
    ($e:expr) => {
        if !$e {
            return false;
        }
    };
}

fn i_type(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    ((imm as u32 & 0xFFF) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn s_type(imm: i32, rs2: u32, rs1: u32, funct3: u32, opcode: u32) -> u32 {
    let imm = imm as u32 & 0xFFF;
    ((imm >> 5) << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | ((imm & 0x1F) << 7) | opcode
}

fn b_type(imm: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
    let imm = imm as u32;
    (((imm >> 12) & 1) << 31)
        | (((imm >> 5) & 0x3F) << 25)
        | (rs2 << 20)
        | (rs1 << 15)
        | (funct3 << 12)
        | (((imm >> 1) & 0xF) << 8)
        | (((imm >> 11) & 1) << 7)
        | 0x63
}

fn jal_word(rd: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    (((imm >> 20) & 1) << 31)
        | (((imm >> 1) & 0x3FF) << 21)
        | (((imm >> 11) & 1) << 20)
        | (((imm >> 12) & 0xFF) << 12)
        | (rd << 7)
        | 0x6F
}

fn addi(ctx: &mut JitContext<'_>, rd: u32, rs: u32, imm: i32) -> bool {
    ctx.put_u32(i_type(imm, rs, 0, rd, 0x13))
}

fn lw(ctx: &mut JitContext<'_>, rd: u32, rs: u32, imm: i32) -> bool {
    ctx.put_u32(i_type(imm, rs, 2, rd, 0x03))
}

fn sw(ctx: &mut JitContext<'_>, rs2: u32, rs1: u32, imm: i32) -> bool {
    ctx.put_u32(s_type(imm, rs2, rs1, 2, 0x23))
}

/// Materialize a 32-bit value (`lui` + `addi`).
fn li32(ctx: &mut JitContext<'_>, rd: u32, imm: u32) -> bool {
    let imm = imm as i32;
    if (-2048..2048).contains(&imm) {
        return addi(ctx, rd, ZERO, imm);
    }
    let hi = (imm as u32).wrapping_add(0x800) >> 12;
    let lo = imm - ((hi << 12) as i32);
    emit!(ctx.put_u32((hi << 12) | (rd << 7) | 0x37));
    addi(ctx, rd, rd, lo)
}

/// `bne a0, x0, +8; jal x0, <exception>`
fn check_helper_result(ctx: &mut JitContext<'_>) -> bool {
    emit!(ctx.put_u32(b_type(8, ZERO, A0, 1)));
    let disp = ctx.exception_addr as i64 - ctx.addr() as i64;
    if !(-(1 << 20)..1 << 20).contains(&disp) {
        ctx.branch_too_far();
        return false;
    }
    ctx.put_u32(jal_word(ZERO, disp as i32))
}

const FRAME: i32 = 32;
const SAVED: [(u32, i32); 5] = [(RA, 0), (S8, 4), (S9, 8), (S10, 12), (S11, 16)];

pub(crate) struct RiscV32;

impl TemplateBackend for RiscV32 {
    fn prologue(ctx: &mut JitContext<'_>) -> bool {
        emit!(addi(ctx, SP, SP, -FRAME));
        for (reg, off) in SAVED {
            emit!(sw(ctx, reg, SP, off));
        }
        emit!(addi(ctx, S10, A0, 0));
        emit!(lw(ctx, T0, S10, 0));
        emit!(lw(ctx, S11, T0, 0));

        let skip_at = ctx.addr();
        emit!(ctx.put_u32(0));

        ctx.exception_addr = ctx.addr();
        for (reg, off) in SAVED {
            emit!(lw(ctx, reg, SP, off));
        }
        emit!(addi(ctx, SP, SP, FRAME));
        emit!(addi(ctx, A0, ZERO, 0));
        emit!(ctx.put_u32(i_type(0, RA, 0, ZERO, 0x67)));

        let disp = (ctx.addr() - skip_at) as i32;
        ctx.patch_u32_at(skip_at, jal_word(ZERO, disp));
        true
    }

    fn epilogue(ctx: &mut JitContext<'_>) -> bool {
        for (reg, off) in SAVED {
            emit!(lw(ctx, reg, SP, off));
        }
        emit!(addi(ctx, SP, SP, FRAME));
        emit!(addi(ctx, A0, ZERO, 1));
        ctx.put_u32(i_type(0, RA, 0, ZERO, 0x67))
    }

    fn helper_call(ctx: &mut JitContext<'_>, f: usize, args: &[HelperArg]) -> bool {
        debug_assert!(args.len() <= 8);
        for (i, &arg) in args.iter().enumerate() {
            let rd = A0 + i as u32;
            match arg {
                HelperArg::Env => emit!(addi(ctx, rd, S10, 0)),
                HelperArg::Imm(imm) => emit!(li32(ctx, rd, imm)),
                HelperArg::Ptr(ptr) => emit!(li32(ctx, rd, ptr as u32)),
                HelperArg::SlotAddr(off) => {
                    emit!(addi(ctx, rd, S11, off as i32));
                }
            }
        }
        emit!(li32(ctx, T0, f as u32));
        emit!(ctx.put_u32(i_type(0, T0, 0, RA, 0x67)));
        check_helper_result(ctx)
    }

    fn line_info(ctx: &mut JitContext<'_>, line: u32) -> bool {
        emit!(li32(ctx, T0, line));
        sw(ctx, T0, S10, 4)
    }

    fn assign(ctx: &mut JitContext<'_>, dst_off: u32, src_off: u32) -> bool {
        emit!(addi(ctx, T0, S11, dst_off as i32));
        emit!(addi(ctx, T1, S11, src_off as i32));
        emit!(lw(ctx, T2, T1, 0));
        emit!(sw(ctx, T2, T0, 0));
        emit!(lw(ctx, T2, T1, 4));
        sw(ctx, T2, T0, 4)
    }

    fn const32(ctx: &mut JitContext<'_>, dst_off: u32, tag: u32, payload: u32) -> bool {
        emit!(addi(ctx, T0, S11, dst_off as i32));
        emit!(li32(ctx, T1, tag));
        emit!(sw(ctx, T1, T0, 0));
        emit!(li32(ctx, T1, payload));
        sw(ctx, T1, T0, 4)
    }

    fn inc(ctx: &mut JitContext<'_>, dst_off: u32) -> bool {
        emit!(addi(ctx, T0, S11, dst_off as i32));
        emit!(lw(ctx, T1, T0, 4));
        emit!(addi(ctx, T1, T1, 1));
        sw(ctx, T1, T0, 4)
    }

    fn eqi(ctx: &mut JitContext<'_>, src1_off: u32, src2_off: u32) -> bool {
        emit!(lw(ctx, S8, S11, src1_off as i32 + 4));
        lw(ctx, S9, S11, src2_off as i32 + 4)
    }

    fn test_slot(ctx: &mut JitContext<'_>, cond_off: u32) -> bool {
        emit!(lw(ctx, S8, S11, cond_off as i32 + 4));
        addi(ctx, S9, ZERO, 0)
    }

    fn branch_placeholder(ctx: &mut JitContext<'_>, kind: PatchKind) -> bool {
        match kind {
            PatchKind::Always => ctx.put_u32(jal_word(ZERO, 0)),
            PatchKind::IfEqual => {
                emit!(ctx.put_u32(b_type(8, S9, S8, 1)));
                ctx.put_u32(jal_word(ZERO, 0))
            }
            PatchKind::IfNotEqual => {
                emit!(ctx.put_u32(b_type(8, S9, S8, 0)));
                ctx.put_u32(jal_word(ZERO, 0))
            }
        }
    }

    fn embed_args(ctx: &mut JitContext<'_>, args: &[u16]) -> Option<usize> {
        if args.is_empty() {
            return Some(0);
        }
        if !ctx.put_u32(jal_word(ZERO, 4 * (1 + args.len() as i32))) {
            return None;
        }
        let addr = ctx.addr();
        for &arg in args {
            if !ctx.put_u32(arg as u32) {
                return None;
            }
        }
        Some(addr)
    }

    fn apply_patch(ctx: &mut JitContext<'_>, patch: &BranchPatch, target: usize) -> bool {
        let jal_at = match patch.kind {
            PatchKind::Always => patch.addr,
            _ => patch.addr + 4,
        };
        let disp = target as i64 - jal_at as i64;
        if !(-(1 << 20)..1 << 20).contains(&disp) {
            ctx.branch_too_far();
            return false;
        }
        ctx.patch_u32_at(jal_at, jal_word(ZERO, disp as i32));
        true
    }
}
