//! ARM32 (A32) template backend
//!
//! Register conventions inside a compiled function:
//! - `r4`: environment pointer
//! - `r5`: `&env.frame.tmpvar[0]`
//!
//! Values are 8 bytes on this target with the payload at offset 4.
//! Helper arguments ride in `r0`..`r3` with the overflow stored below a
//! fixed 16-byte stack reservation; `r12` is the scratch register. All
//! branches are `b<cond>` with a 24-bit word displacement (±32 MB).

use crate::jit::backend::TemplateBackend;
use crate::jit::codebuf::{BranchPatch, HelperArg, JitContext, PatchKind};

const COND_EQ: u32 = 0x0;
const COND_NE: u32 = 0x1;
const COND_AL: u32 = 0xE;

const R4: u32 = 4;
const R5: u32 = 5;
const R12: u32 = 12;

/// r0-r12 plus lr, for the prologue/epilogue register walks.
const REG_MASK: u32 = 0x5FFF;

macro_rules! emit {
    ($e:expr) => {
        if !$e {
            return false;
        }
    };
}

/// `movw rd, #imm16`
fn movw(ctx: &mut JitContext<'_>, rd: u32, imm16: u32) -> bool {
    ctx.put_u32(0xE300_0000 | ((imm16 >> 12) << 16) | (rd << 12) | (imm16 & 0xFFF))
}

/// `movt rd, #imm16`
fn movt(ctx: &mut JitContext<'_>, rd: u32, imm16: u32) -> bool {
    ctx.put_u32(0xE340_0000 | ((imm16 >> 12) << 16) | (rd << 12) | (imm16 & 0xFFF))
}

/// Materialize a 32-bit immediate.
fn mov_imm32(ctx: &mut JitContext<'_>, rd: u32, imm: u32) -> bool {
    emit!(movw(ctx, rd, imm & 0xFFFF));
    if imm >> 16 != 0 {
        emit!(movt(ctx, rd, imm >> 16));
    }
    true
}

/// `ldr rd, [rn, #imm12]`
fn ldr(ctx: &mut JitContext<'_>, rd: u32, rn: u32, imm: u32) -> bool {
    ctx.put_u32(0xE590_0000 | (rn << 16) | (rd << 12) | imm)
}

/// `str rd, [rn, #imm12]`
fn str(ctx: &mut JitContext<'_>, rd: u32, rn: u32, imm: u32) -> bool {
    ctx.put_u32(0xE580_0000 | (rn << 16) | (rd << 12) | imm)
}

/// `add rd, rn, rm`
fn add_reg(ctx: &mut JitContext<'_>, rd: u32, rn: u32, rm: u32) -> bool {
    ctx.put_u32(0xE080_0000 | (rn << 16) | (rd << 12) | rm)
}

/// Slot address `r5 + off` into `rd` (clobbers `r12`).
fn slot_addr(ctx: &mut JitContext<'_>, rd: u32, off: u32) -> bool {
    emit!(mov_imm32(ctx, R12, off));
    add_reg(ctx, rd, R5, R12)
}

fn branch_word(cond: u32, disp: i32) -> u32 {
    // The displacement is measured from PC+8.
    let imm24 = ((disp - 8) >> 2) as u32 & 0x00FF_FFFF;
    (cond << 28) | 0x0A00_0000 | imm24
}

pub(crate) struct Arm32;

impl TemplateBackend for Arm32 {
    fn prologue(ctx: &mut JitContext<'_>) -> bool {
        // push {r0-r12, lr}
        emit!(ctx.put_u32(0xE92D_0000 | REG_MASK));
        // r4 = env (arrives in r0); r5 = *env.frame
        emit!(ctx.put_u32(0xE1A0_4000));
        emit!(ldr(ctx, R5, R4, 0));
        emit!(ldr(ctx, R5, R5, 0));

        let skip_at = ctx.addr();
        emit!(ctx.put_u32(0));

        ctx.exception_addr = ctx.addr();
        // pop {r0-r12, lr}; mov r0, #0; bx lr
        emit!(ctx.put_u32(0xE8BD_0000 | REG_MASK));
        emit!(ctx.put_u32(0xE3A0_0000));
        emit!(ctx.put_u32(0xE12F_FF1E));

        let disp = (ctx.addr() - skip_at) as i32;
        ctx.patch_u32_at(skip_at, branch_word(COND_AL, disp));
        true
    }

    fn epilogue(ctx: &mut JitContext<'_>) -> bool {
        emit!(ctx.put_u32(0xE8BD_0000 | REG_MASK));
        // mov r0, #1; bx lr
        emit!(ctx.put_u32(0xE3A0_0001));
        ctx.put_u32(0xE12F_FF1E)
    }

    fn helper_call(ctx: &mut JitContext<'_>, f: usize, args: &[HelperArg]) -> bool {
        debug_assert!(args.len() <= 8);
        let stack_count = args.len().saturating_sub(4);
        if stack_count > 0 {
            // sub sp, sp, #16
            emit!(ctx.put_u32(0xE24D_D010));
            for (i, &arg) in args.iter().enumerate().skip(4) {
                match arg {
                    HelperArg::Env => emit!(ctx.put_u32(0xE1A0_C004)), // mov r12, r4
                    HelperArg::Imm(imm) => emit!(mov_imm32(ctx, R12, imm)),
                    HelperArg::Ptr(ptr) => emit!(mov_imm32(ctx, R12, ptr as u32)),
                    HelperArg::SlotAddr(_) => unreachable!("slot address is position 1 only"),
                }
                emit!(str(ctx, R12, 13, ((i - 4) * 4) as u32));
            }
        }
        for (i, &arg) in args.iter().take(4).enumerate() {
            let rd = i as u32;
            match arg {
                HelperArg::Env => emit!(ctx.put_u32(0xE1A0_0004 | (rd << 12))), // mov rd, r4
                HelperArg::Imm(imm) => emit!(mov_imm32(ctx, rd, imm)),
                HelperArg::Ptr(ptr) => emit!(mov_imm32(ctx, rd, ptr as u32)),
                HelperArg::SlotAddr(off) => {
                    debug_assert_eq!(i, 1);
                    emit!(slot_addr(ctx, rd, off));
                }
            }
        }
        emit!(mov_imm32(ctx, R12, f as u32));
        // blx r12
        emit!(ctx.put_u32(0xE12F_FF3C));
        if stack_count > 0 {
            // add sp, sp, #16
            emit!(ctx.put_u32(0xE28D_D010));
        }
        // cmp r0, #0; beq exception
        emit!(ctx.put_u32(0xE350_0000));
        let disp = ctx.exception_addr as i64 - ctx.addr() as i64;
        if !(-(1 << 25)..1 << 25).contains(&disp) {
            ctx.branch_too_far();
            return false;
        }
        ctx.put_u32(branch_word(COND_EQ, disp as i32))
    }

    fn line_info(ctx: &mut JitContext<'_>, line: u32) -> bool {
        emit!(mov_imm32(ctx, R12, line));
        str(ctx, R12, R4, 4)
    }

    fn assign(ctx: &mut JitContext<'_>, dst_off: u32, src_off: u32) -> bool {
        emit!(slot_addr(ctx, 0, dst_off));
        emit!(slot_addr(ctx, 1, src_off));
        emit!(ldr(ctx, 2, 1, 0));
        emit!(str(ctx, 2, 0, 0));
        emit!(ldr(ctx, 2, 1, 4));
        str(ctx, 2, 0, 4)
    }

    fn const32(ctx: &mut JitContext<'_>, dst_off: u32, tag: u32, payload: u32) -> bool {
        emit!(slot_addr(ctx, 0, dst_off));
        emit!(mov_imm32(ctx, 1, tag));
        emit!(str(ctx, 1, 0, 0));
        emit!(mov_imm32(ctx, 1, payload));
        str(ctx, 1, 0, 4)
    }

    fn inc(ctx: &mut JitContext<'_>, dst_off: u32) -> bool {
        emit!(slot_addr(ctx, 0, dst_off));
        emit!(ldr(ctx, 1, 0, 4));
        // add r1, r1, #1
        emit!(ctx.put_u32(0xE281_1001));
        str(ctx, 1, 0, 4)
    }

    fn eqi(ctx: &mut JitContext<'_>, src1_off: u32, src2_off: u32) -> bool {
        emit!(slot_addr(ctx, 0, src1_off));
        emit!(ldr(ctx, 0, 0, 4));
        emit!(slot_addr(ctx, 1, src2_off));
        emit!(ldr(ctx, 1, 1, 4));
        // cmp r0, r1
        ctx.put_u32(0xE150_0001)
    }

    fn test_slot(ctx: &mut JitContext<'_>, cond_off: u32) -> bool {
        emit!(slot_addr(ctx, 0, cond_off));
        emit!(ldr(ctx, 0, 0, 4));
        // cmp r0, #0
        ctx.put_u32(0xE350_0000)
    }

    fn branch_placeholder(ctx: &mut JitContext<'_>, kind: PatchKind) -> bool {
        let cond = match kind {
            PatchKind::Always => COND_AL,
            PatchKind::IfEqual => COND_EQ,
            PatchKind::IfNotEqual => COND_NE,
        };
        ctx.put_u32(branch_word(cond, 8))
    }

    fn embed_args(ctx: &mut JitContext<'_>, args: &[u16]) -> Option<usize> {
        if args.is_empty() {
            return Some(0);
        }
        if !ctx.put_u32(branch_word(COND_AL, 4 * (1 + args.len() as i32))) {
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
        let cond = match patch.kind {
            PatchKind::Always => COND_AL,
            PatchKind::IfEqual => COND_EQ,
            PatchKind::IfNotEqual => COND_NE,
        };
        let disp = target as i64 - patch.addr as i64;
        if !(-(1 << 25)..1 << 25).contains(&disp) {
            ctx.branch_too_far();
            return false;
        }
        ctx.patch_u32_at(patch.addr, branch_word(cond, disp as i32));
        true
    }
}
