//! ARM64 template backend
//!
//! Register conventions inside a compiled function:
//! - `x0`: environment pointer
//! - `x1`: `&env.frame.tmpvar[0]`
//!
//! Both are argument registers, so every helper call stacks them (with
//! the link register) and restores them before the failure branch.
//! Helper arguments ride in `x0`..`x7`; the AAPCS64 register file covers
//! the widest helper (THISCALL, eight arguments) without stack traffic.
//! Branches are `b` (imm26) and `b.cond` (imm19), patched after layout.

use crate::jit::backend::TemplateBackend;
use crate::jit::codebuf::{BranchPatch, HelperArg, JitContext, PatchKind};

const XZR: u32 = 31;
const SCRATCH: u32 = 9;

macro_rules! emit {
    ($e:expr) => {
        if !$e {
            return false;
        }
    };
}

/// `stp ra, rb, [sp, #-16]!`
fn stp_push(ctx: &mut JitContext<'_>, ra: u32, rb: u32) -> bool {
    ctx.put_u32(0xA9BF_03E0 | (rb << 10) | ra)
}

/// `ldp ra, rb, [sp], #16`
fn ldp_pop(ctx: &mut JitContext<'_>, ra: u32, rb: u32) -> bool {
    ctx.put_u32(0xA8C1_03E0 | (rb << 10) | ra)
}

/// `movz xd, #imm16, lsl #(hw*16)`
fn movz(ctx: &mut JitContext<'_>, rd: u32, imm16: u32, hw: u32) -> bool {
    ctx.put_u32(0xD280_0000 | (hw << 21) | (imm16 << 5) | rd)
}

/// `movk xd, #imm16, lsl #(hw*16)`
fn movk(ctx: &mut JitContext<'_>, rd: u32, imm16: u32, hw: u32) -> bool {
    ctx.put_u32(0xF280_0000 | (hw << 21) | (imm16 << 5) | rd)
}

/// Materialize a 32-bit immediate.
fn mov_imm32(ctx: &mut JitContext<'_>, rd: u32, imm: u32) -> bool {
    emit!(movz(ctx, rd, imm & 0xFFFF, 0));
    if imm >> 16 != 0 {
        emit!(movk(ctx, rd, imm >> 16, 1));
    }
    true
}

/// Materialize a 64-bit immediate (helper and operand addresses).
fn mov_imm64(ctx: &mut JitContext<'_>, rd: u32, imm: u64) -> bool {
    emit!(movz(ctx, rd, (imm & 0xFFFF) as u32, 0));
    emit!(movk(ctx, rd, ((imm >> 16) & 0xFFFF) as u32, 1));
    emit!(movk(ctx, rd, ((imm >> 32) & 0xFFFF) as u32, 2));
    movk(ctx, rd, ((imm >> 48) & 0xFFFF) as u32, 3)
}

/// `add xd, xn, xm`
fn add_reg(ctx: &mut JitContext<'_>, rd: u32, rn: u32, rm: u32) -> bool {
    ctx.put_u32(0x8B00_0000 | (rm << 16) | (rn << 5) | rd)
}

/// `ldr xd, [xn, #imm]` (8-scaled)
fn ldr_x(ctx: &mut JitContext<'_>, rt: u32, rn: u32, imm: u32) -> bool {
    ctx.put_u32(0xF940_0000 | ((imm / 8) << 10) | (rn << 5) | rt)
}

/// `str xt, [xn, #imm]` (8-scaled)
fn str_x(ctx: &mut JitContext<'_>, rt: u32, rn: u32, imm: u32) -> bool {
    ctx.put_u32(0xF900_0000 | ((imm / 8) << 10) | (rn << 5) | rt)
}

/// `ldr wt, [xn, #imm]` (4-scaled)
fn ldr_w(ctx: &mut JitContext<'_>, rt: u32, rn: u32, imm: u32) -> bool {
    ctx.put_u32(0xB940_0000 | ((imm / 4) << 10) | (rn << 5) | rt)
}

/// `str wt, [xn, #imm]` (4-scaled)
fn str_w(ctx: &mut JitContext<'_>, rt: u32, rn: u32, imm: u32) -> bool {
    ctx.put_u32(0xB900_0000 | ((imm / 4) << 10) | (rn << 5) | rt)
}

/// Address of slot at `off` into `rd` (clobbers `SCRATCH`).
fn slot_addr(ctx: &mut JitContext<'_>, rd: u32, off: u32) -> bool {
    emit!(mov_imm32(ctx, SCRATCH, off));
    add_reg(ctx, rd, 1, SCRATCH)
}

/// Patchable pc-relative branch word.
fn branch_word(kind: PatchKind, disp_words: i32) -> u32 {
    match kind {
        PatchKind::Always => 0x1400_0000 | (disp_words as u32 & 0x03FF_FFFF),
        PatchKind::IfEqual => 0x5400_0000 | ((disp_words as u32 & 0x7_FFFF) << 5),
        PatchKind::IfNotEqual => 0x5400_0001 | ((disp_words as u32 & 0x7_FFFF) << 5),
    }
}

fn branch_in_range(kind: PatchKind, disp_words: i64) -> bool {
    match kind {
        PatchKind::Always => (-(1 << 25)..1 << 25).contains(&disp_words),
        _ => (-(1 << 18)..1 << 18).contains(&disp_words),
    }
}

pub(crate) struct Arm64;

impl TemplateBackend for Arm64 {
    fn prologue(ctx: &mut JitContext<'_>) -> bool {
        // Save the whole register file pairwise.
        let pairs: [(u32, u32); 16] = [
            (29, 30), (27, 28), (25, 26), (23, 24), (21, 22), (19, 20),
            (17, 18), (15, 16), (13, 14), (11, 12), (9, 10), (7, 8),
            (5, 6), (3, 4), (1, 2), (XZR, 0),
        ];
        for (ra, rb) in pairs {
            emit!(stp_push(ctx, ra, rb));
        }
        // x1 = *env.frame = &tmpvar[0]
        emit!(ldr_x(ctx, 1, 0, 0));
        emit!(ldr_x(ctx, 1, 1, 0));

        // Skip the exception epilogue; patched once its length is known.
        let skip_at = ctx.addr();
        emit!(ctx.put_u32(0));

        ctx.exception_addr = ctx.addr();
        for (ra, rb) in pairs.iter().rev() {
            emit!(ldp_pop(ctx, *ra, *rb));
        }
        emit!(movz(ctx, 0, 0, 0));
        emit!(ctx.put_u32(0xD65F_03C0));

        let disp = ((ctx.addr() - skip_at) / 4) as i32;
        ctx.patch_u32_at(skip_at, branch_word(PatchKind::Always, disp));
        true
    }

    fn epilogue(ctx: &mut JitContext<'_>) -> bool {
        let pairs: [(u32, u32); 16] = [
            (29, 30), (27, 28), (25, 26), (23, 24), (21, 22), (19, 20),
            (17, 18), (15, 16), (13, 14), (11, 12), (9, 10), (7, 8),
            (5, 6), (3, 4), (1, 2), (XZR, 0),
        ];
        for (ra, rb) in pairs.iter().rev() {
            emit!(ldp_pop(ctx, *ra, *rb));
        }
        emit!(movz(ctx, 0, 1, 0));
        ctx.put_u32(0xD65F_03C0)
    }

    fn helper_call(ctx: &mut JitContext<'_>, f: usize, args: &[HelperArg]) -> bool {
        debug_assert!(args.len() <= 8);
        emit!(stp_push(ctx, 0, 1));
        emit!(stp_push(ctx, 30, XZR));

        for (i, &arg) in args.iter().enumerate() {
            let rd = i as u32;
            match arg {
                // Position 0: x0 already holds the environment.
                HelperArg::Env => debug_assert_eq!(i, 0),
                HelperArg::Imm(imm) => emit!(mov_imm32(ctx, rd, imm)),
                HelperArg::Ptr(ptr) => emit!(mov_imm64(ctx, rd, ptr as u64)),
                HelperArg::SlotAddr(off) => {
                    debug_assert_eq!(i, 1);
                    emit!(slot_addr(ctx, rd, off));
                }
            }
        }

        emit!(mov_imm64(ctx, SCRATCH, f as u64));
        emit!(ctx.put_u32(0xD63F_0000 | (SCRATCH << 5)));

        // uxtb w0, w0; cmp w0, #0; restore; b.eq exception
        emit!(ctx.put_u32(0x5300_1C00));
        emit!(ctx.put_u32(0x7100_001F));
        emit!(ldp_pop(ctx, 30, SCRATCH));
        emit!(ldp_pop(ctx, 0, 1));

        let disp = (ctx.exception_addr as i64 - ctx.addr() as i64) / 4;
        if !branch_in_range(PatchKind::IfEqual, disp) {
            ctx.branch_too_far();
            return false;
        }
        ctx.put_u32(branch_word(PatchKind::IfEqual, disp as i32))
    }

    fn line_info(ctx: &mut JitContext<'_>, line: u32) -> bool {
        emit!(mov_imm32(ctx, 2, line));
        str_x(ctx, 2, 0, 8)
    }

    fn assign(ctx: &mut JitContext<'_>, dst_off: u32, src_off: u32) -> bool {
        emit!(slot_addr(ctx, 2, dst_off));
        emit!(slot_addr(ctx, 3, src_off));
        emit!(ldr_x(ctx, 4, 3, 0));
        emit!(ldr_x(ctx, 5, 3, 8));
        emit!(str_x(ctx, 4, 2, 0));
        str_x(ctx, 5, 2, 8)
    }

    fn const32(ctx: &mut JitContext<'_>, dst_off: u32, tag: u32, payload: u32) -> bool {
        emit!(slot_addr(ctx, 2, dst_off));
        emit!(mov_imm32(ctx, 3, tag));
        emit!(str_w(ctx, 3, 2, 0));
        emit!(mov_imm32(ctx, 3, payload));
        str_w(ctx, 3, 2, 8)
    }

    fn inc(ctx: &mut JitContext<'_>, dst_off: u32) -> bool {
        emit!(slot_addr(ctx, 2, dst_off));
        emit!(ldr_w(ctx, 3, 2, 8));
        // add w3, w3, #1
        emit!(ctx.put_u32(0x1100_0463));
        str_w(ctx, 3, 2, 8)
    }

    fn eqi(ctx: &mut JitContext<'_>, src1_off: u32, src2_off: u32) -> bool {
        emit!(slot_addr(ctx, 3, src1_off));
        emit!(ldr_w(ctx, 3, 3, 8));
        emit!(slot_addr(ctx, 4, src2_off));
        emit!(ldr_w(ctx, 4, 4, 8));
        // cmp w3, w4
        ctx.put_u32(0x6B04_007F)
    }

    fn test_slot(ctx: &mut JitContext<'_>, cond_off: u32) -> bool {
        emit!(slot_addr(ctx, 2, cond_off));
        emit!(ldr_w(ctx, 3, 2, 8));
        // cmp w3, #0
        ctx.put_u32(0x7100_007F)
    }

    fn branch_placeholder(ctx: &mut JitContext<'_>, kind: PatchKind) -> bool {
        ctx.put_u32(branch_word(kind, 0))
    }

    fn embed_args(ctx: &mut JitContext<'_>, args: &[u16]) -> Option<usize> {
        if args.is_empty() {
            return Some(0);
        }
        // b over the vector
        if !ctx.put_u32(branch_word(PatchKind::Always, 1 + args.len() as i32)) {
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
        let disp = (target as i64 - patch.addr as i64) / 4;
        if !branch_in_range(patch.kind, disp) {
            ctx.branch_too_far();
            return false;
        }
        ctx.patch_u32_at(patch.addr, branch_word(patch.kind, disp as i32));
        true
    }
}
