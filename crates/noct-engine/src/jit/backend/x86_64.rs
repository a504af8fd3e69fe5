//! x86-64 template backend
//!
//! Register conventions inside a compiled function:
//! - `r14`: environment pointer
//! - `r15`: `&env.frame.tmpvar[0]`
//! - `r13`: absolute address of the per-function exception epilogue
//!
//! Helper calls marshal per the SysV ABI (rdi, rsi, rdx, rcx, r8, r9,
//! then stack) or, on Windows hosts, the Microsoft x64 ABI (rcx, rdx,
//! r8, r9, stack above the 32-byte shadow). Branch displacements are
//! rel32, patched after layout.

use crate::jit::backend::TemplateBackend;
use crate::jit::codebuf::{BranchPatch, HelperArg, JitContext, PatchKind};

const IS_MSABI: bool = cfg!(windows);

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RSI: u8 = 6;
const RDI: u8 = 7;
const R8: u8 = 8;
const R9: u8 = 9;

/// SysV integer argument registers, in order.
const SYSV_ARGS: [u8; 6] = [RDI, RSI, RDX, RCX, R8, R9];

/// Microsoft x64 argument registers, in order.
const MS_ARGS: [u8; 4] = [RCX, RDX, R8, R9];

macro_rules! emit {
    ($e:expr) => {
        if !$e {
            return false;
        }
    };
}

fn put(ctx: &mut JitContext<'_>, bytes: &[u8]) -> bool {
    for &byte in bytes {
        if !ctx.put_u8(byte) {
            return false;
        }
    }
    true
}

/// `mov r32, imm32` — zero-extends into the full register.
fn mov_reg_imm32(ctx: &mut JitContext<'_>, reg: u8, imm: u32) -> bool {
    if reg >= 8 {
        emit!(ctx.put_u8(0x41));
    }
    emit!(ctx.put_u8(0xB8 + (reg & 7)));
    ctx.put_u32(imm)
}

/// `movabs r64, imm64`
fn mov_reg_imm64(ctx: &mut JitContext<'_>, reg: u8, imm: u64) -> bool {
    emit!(ctx.put_u8(if reg >= 8 { 0x49 } else { 0x48 }));
    emit!(ctx.put_u8(0xB8 + (reg & 7)));
    ctx.put_u64(imm)
}

/// `mov r64, r14` — the environment pointer.
fn mov_reg_env(ctx: &mut JitContext<'_>, reg: u8) -> bool {
    let rex = 0x4C | u8::from(reg >= 8);
    put(ctx, &[rex, 0x89, 0xC0 | (6 << 3) | (reg & 7)])
}

/// `add r64, r15` — the slot base.
fn add_reg_base(ctx: &mut JitContext<'_>, reg: u8) -> bool {
    let rex = 0x4C | u8::from(reg >= 8);
    put(ctx, &[rex, 0x01, 0xC0 | (7 << 3) | (reg & 7)])
}

/// Materialize one helper argument into `reg`.
fn materialize(ctx: &mut JitContext<'_>, reg: u8, arg: HelperArg) -> bool {
    match arg {
        HelperArg::Env => mov_reg_env(ctx, reg),
        HelperArg::Imm(imm) => mov_reg_imm32(ctx, reg, imm),
        HelperArg::Ptr(ptr) => mov_reg_imm64(ctx, reg, ptr as u64),
        HelperArg::SlotAddr(off) => {
            emit!(mov_reg_imm32(ctx, reg, off));
            add_reg_base(ctx, reg)
        }
    }
}

/// `test al, al; jne +3; jmp *r13` — the shared failure check.
fn check_helper_result(ctx: &mut JitContext<'_>) -> bool {
    put(ctx, &[0x84, 0xC0, 0x75, 0x03, 0x41, 0xFF, 0xE5])
}

fn sysv_helper_call(ctx: &mut JitContext<'_>, f: usize, args: &[HelperArg]) -> bool {
    let stack_count = args.len().saturating_sub(SYSV_ARGS.len());
    if stack_count > 0 {
        // Keep 16-byte alignment across the call.
        let frame = (stack_count * 8 + 15) & !15;
        emit!(put(ctx, &[0x48, 0x83, 0xEC, frame as u8]));
        for (i, &arg) in args[SYSV_ARGS.len()..].iter().enumerate() {
            emit!(materialize(ctx, RAX, arg));
            // mov [rsp + i*8], rax
            emit!(put(ctx, &[0x48, 0x89, 0x44, 0x24, (i * 8) as u8]));
        }
        for (i, &arg) in args.iter().take(SYSV_ARGS.len()).enumerate() {
            emit!(materialize(ctx, SYSV_ARGS[i], arg));
        }
        emit!(mov_reg_imm64(ctx, RAX, f as u64));
        emit!(put(ctx, &[0xFF, 0xD0]));
        emit!(put(ctx, &[0x48, 0x83, 0xC4, frame as u8]));
    } else {
        for (i, &arg) in args.iter().enumerate() {
            emit!(materialize(ctx, SYSV_ARGS[i], arg));
        }
        emit!(mov_reg_imm64(ctx, RAX, f as u64));
        emit!(put(ctx, &[0xFF, 0xD0]));
    }
    check_helper_result(ctx)
}

fn ms_helper_call(ctx: &mut JitContext<'_>, f: usize, args: &[HelperArg]) -> bool {
    // 32-byte shadow space plus any stack arguments, 16-aligned.
    let stack_count = args.len().saturating_sub(MS_ARGS.len());
    let frame = (32 + stack_count * 8 + 15) & !15;
    emit!(put(ctx, &[0x48, 0x83, 0xEC, frame as u8]));
    for (i, &arg) in args.iter().enumerate().skip(MS_ARGS.len()) {
        emit!(materialize(ctx, RAX, arg));
        // mov [rsp + 32 + (i-4)*8], rax
        let disp = 32 + (i - MS_ARGS.len()) * 8;
        emit!(put(ctx, &[0x48, 0x89, 0x44, 0x24, disp as u8]));
    }
    for (i, &arg) in args.iter().take(MS_ARGS.len()).enumerate() {
        emit!(materialize(ctx, MS_ARGS[i], arg));
    }
    emit!(mov_reg_imm64(ctx, RAX, f as u64));
    emit!(put(ctx, &[0xFF, 0xD0]));
    emit!(put(ctx, &[0x48, 0x83, 0xC4, frame as u8]));
    check_helper_result(ctx)
}

/// `pop` sequence shared by the exception and success epilogues.
fn emit_restore(ctx: &mut JitContext<'_>) -> bool {
    if IS_MSABI {
        emit!(put(ctx, &[0x48, 0x83, 0xC4, 0x08]));
        emit!(put(ctx, &[0x41, 0x5F, 0x41, 0x5E, 0x41, 0x5D, 0x41, 0x5C]));
    } else {
        emit!(put(ctx, &[0x41, 0x5F, 0x41, 0x5E, 0x41, 0x5D]));
    }
    put(ctx, &[0x5E, 0x5F, 0x5A, 0x59, 0x5B, 0x58])
}

pub(crate) struct X86_64;

impl TemplateBackend for X86_64 {
    fn prologue(ctx: &mut JitContext<'_>) -> bool {
        // push rax, rbx, rcx, rdx, rdi, rsi, (r12,) r13, r14, r15
        emit!(put(ctx, &[0x50, 0x53, 0x51, 0x52, 0x57, 0x56]));
        if IS_MSABI {
            emit!(put(ctx, &[0x41, 0x54]));
        }
        emit!(put(ctx, &[0x41, 0x55, 0x41, 0x56, 0x41, 0x57]));
        if IS_MSABI {
            // sub rsp, 8 (16-byte alignment) and env arrives in rcx.
            emit!(put(ctx, &[0x48, 0x83, 0xEC, 0x08]));
            emit!(put(ctx, &[0x49, 0x89, 0xCE]));
        } else {
            // mov r14, rdi
            emit!(put(ctx, &[0x49, 0x89, 0xFE]));
        }
        // mov rax, [r14]; mov r15, [rax]
        emit!(put(ctx, &[0x49, 0x8B, 0x06, 0x4C, 0x8B, 0x38]));

        // r13 = the exception epilogue, right behind the 2-byte skip jump.
        let handler = ctx.addr() + 10 + 2;
        emit!(put(ctx, &[0x49, 0xBD]));
        emit!(ctx.put_u64(handler as u64));

        // The handler body length decides the skip displacement.
        let skip = if IS_MSABI { 0x1A } else { 0x14 };
        emit!(put(ctx, &[0xEB, skip]));

        ctx.exception_addr = ctx.addr();
        emit!(emit_restore(ctx));
        // mov rax, 0; ret
        emit!(put(ctx, &[0x48, 0xC7, 0xC0, 0x00, 0x00, 0x00, 0x00, 0xC3]));
        debug_assert_eq!(ctx.addr(), handler + skip as usize);
        true
    }

    fn epilogue(ctx: &mut JitContext<'_>) -> bool {
        emit!(emit_restore(ctx));
        // mov rax, 1; ret
        put(ctx, &[0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00, 0xC3])
    }

    fn helper_call(ctx: &mut JitContext<'_>, f: usize, args: &[HelperArg]) -> bool {
        if IS_MSABI {
            ms_helper_call(ctx, f, args)
        } else {
            sysv_helper_call(ctx, f, args)
        }
    }

    fn line_info(ctx: &mut JitContext<'_>, line: u32) -> bool {
        // mov rax, line; mov [r14+8], rax
        emit!(put(ctx, &[0x48, 0xC7, 0xC0]));
        emit!(ctx.put_u32(line));
        put(ctx, &[0x49, 0x89, 0x46, 0x08])
    }

    fn assign(ctx: &mut JitContext<'_>, dst_off: u32, src_off: u32) -> bool {
        // rax = base + dst, rbx = base + src, copy 16 bytes through
        // rcx/rdx.
        emit!(put(ctx, &[0x48, 0xC7, 0xC0]));
        emit!(ctx.put_u32(dst_off));
        emit!(put(ctx, &[0x48, 0xC7, 0xC3]));
        emit!(ctx.put_u32(src_off));
        emit!(add_reg_base(ctx, RAX));
        emit!(add_reg_base(ctx, RBX));
        emit!(put(ctx, &[0x48, 0x8B, 0x0B]));
        emit!(put(ctx, &[0x48, 0x8B, 0x53, 0x08]));
        emit!(put(ctx, &[0x48, 0x89, 0x08]));
        put(ctx, &[0x48, 0x89, 0x50, 0x08])
    }

    fn const32(ctx: &mut JitContext<'_>, dst_off: u32, tag: u32, payload: u32) -> bool {
        // rax = base + dst; [rax] = tag; [rax+8] = payload
        emit!(put(ctx, &[0x48, 0xC7, 0xC0]));
        emit!(ctx.put_u32(dst_off));
        emit!(add_reg_base(ctx, RAX));
        emit!(put(ctx, &[0xC7, 0x00]));
        emit!(ctx.put_u32(tag));
        emit!(put(ctx, &[0xC7, 0x40, 0x08]));
        ctx.put_u32(payload)
    }

    fn inc(ctx: &mut JitContext<'_>, dst_off: u32) -> bool {
        // rax = base + dst; add dword [rax+8], 1
        emit!(put(ctx, &[0x48, 0xC7, 0xC0]));
        emit!(ctx.put_u32(dst_off));
        emit!(add_reg_base(ctx, RAX));
        put(ctx, &[0x83, 0x40, 0x08, 0x01])
    }

    fn eqi(ctx: &mut JitContext<'_>, src1_off: u32, src2_off: u32) -> bool {
        // eax = src1 payload, ebx = src2 payload, cmp sets the flags the
        // following conditional branch consumes.
        emit!(put(ctx, &[0x48, 0xC7, 0xC0]));
        emit!(ctx.put_u32(src1_off));
        emit!(add_reg_base(ctx, RAX));
        emit!(put(ctx, &[0x8B, 0x40, 0x08]));
        emit!(put(ctx, &[0x48, 0xC7, 0xC3]));
        emit!(ctx.put_u32(src2_off));
        emit!(add_reg_base(ctx, RBX));
        emit!(put(ctx, &[0x8B, 0x5B, 0x08]));
        put(ctx, &[0x39, 0xD8])
    }

    fn test_slot(ctx: &mut JitContext<'_>, cond_off: u32) -> bool {
        // rax = base + cond; cmp dword [rax+8], 0
        emit!(put(ctx, &[0x48, 0xC7, 0xC0]));
        emit!(ctx.put_u32(cond_off));
        emit!(add_reg_base(ctx, RAX));
        put(ctx, &[0x83, 0x78, 0x08, 0x00])
    }

    fn branch_placeholder(ctx: &mut JitContext<'_>, kind: PatchKind) -> bool {
        match kind {
            PatchKind::Always => {
                emit!(ctx.put_u8(0xE9));
            }
            PatchKind::IfEqual => {
                emit!(put(ctx, &[0x0F, 0x84]));
            }
            PatchKind::IfNotEqual => {
                emit!(put(ctx, &[0x0F, 0x85]));
            }
        }
        ctx.put_u32(0)
    }

    fn embed_args(ctx: &mut JitContext<'_>, args: &[u16]) -> Option<usize> {
        if args.is_empty() {
            return Some(0);
        }
        // jmp over the vector
        if !ctx.put_u8(0xE9) || !ctx.put_u32(4 * args.len() as u32) {
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
        let (insn_len, disp_at) = match patch.kind {
            PatchKind::Always => (5usize, patch.addr + 1),
            PatchKind::IfEqual | PatchKind::IfNotEqual => (6usize, patch.addr + 2),
        };
        let disp = target as i64 - (patch.addr + insn_len) as i64;
        if disp < i32::MIN as i64 || disp > i32::MAX as i64 {
            ctx.branch_too_far();
            return false;
        }
        ctx.patch_u32_at(disp_at, disp as u32);
        true
    }
}
