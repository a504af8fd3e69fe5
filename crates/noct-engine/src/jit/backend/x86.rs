//! x86 (32-bit) template backend
//!
//! No register is spared to hold the runtime state across the body, so
//! the prologue parks it in a small ebp frame:
//! - `[ebp-4]`: `&env.frame.tmpvar[0]`
//! - `[ebp-8]`: environment pointer
//! - `[ebp-12]`: absolute address of the exception epilogue
//!
//! Values are 8 bytes with the payload at offset 4. Helper calls push
//! their arguments cdecl right-to-left and jump through `[ebp-12]` on a
//! false return. Branches are rel32, patched after layout.

use crate::jit::backend::TemplateBackend;
use crate::jit::codebuf::{BranchPatch, HelperArg, JitContext, PatchKind};

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

/// `mov eax, <slot base>; add eax, #off` — leaves the slot address in
/// eax.
fn slot_addr_eax(ctx: &mut JitContext<'_>, off: u32) -> bool {
    // mov eax, [ebp-4]; add eax, imm32
    emit!(put(ctx, &[0x8B, 0x45, 0xFC, 0x05]));
    ctx.put_u32(off)
}

/// Push one helper argument (cdecl, so the caller iterates
/// right-to-left).
fn push_arg(ctx: &mut JitContext<'_>, arg: HelperArg) -> bool {
    match arg {
        HelperArg::Env => {
            // push dword [ebp-8]
            put(ctx, &[0xFF, 0x75, 0xF8])
        }
        HelperArg::Imm(imm) => {
            emit!(ctx.put_u8(0x68));
            ctx.put_u32(imm)
        }
        HelperArg::Ptr(ptr) => {
            emit!(ctx.put_u8(0x68));
            ctx.put_u32(ptr as u32)
        }
        HelperArg::SlotAddr(off) => {
            emit!(slot_addr_eax(ctx, off));
            ctx.put_u8(0x50)
        }
    }
}

pub(crate) struct X86;

impl TemplateBackend for X86 {
    fn prologue(ctx: &mut JitContext<'_>) -> bool {
        // The environment pointer is the one cdecl argument.
        // mov eax, [esp+4]
        emit!(put(ctx, &[0x8B, 0x44, 0x24, 0x04]));
        // push ebx/ecx/edx/edi/esi/ebp; mov ebp, esp; sub esp, 12
        emit!(put(ctx, &[0x53, 0x51, 0x52, 0x57, 0x56, 0x55, 0x89, 0xE5, 0x83, 0xEC, 0x0C]));
        // [ebp-8] = env; [ebp-4] = *env.frame
        emit!(put(ctx, &[0x89, 0x45, 0xF8, 0x8B, 0x00, 0x8B, 0x00, 0x89, 0x45, 0xFC]));

        // [ebp-12] = the exception epilogue, behind the 2-byte skip jump.
        let handler = ctx.addr() + 7 + 2;
        emit!(put(ctx, &[0xC7, 0x45, 0xF4]));
        emit!(ctx.put_u32(handler as u32));
        // jmp over the handler (15 bytes)
        emit!(put(ctx, &[0xEB, 0x0F]));

        ctx.exception_addr = ctx.addr();
        // add esp, 12; pop ebp/esi/edi/edx/ecx/ebx; mov eax, 0; ret
        emit!(put(ctx, &[0x83, 0xC4, 0x0C, 0x5D, 0x5E, 0x5F, 0x5A, 0x59, 0x5B, 0xB8]));
        emit!(ctx.put_u32(0));
        emit!(ctx.put_u8(0xC3));
        debug_assert_eq!(ctx.addr(), handler + 0x0F);
        true
    }

    fn epilogue(ctx: &mut JitContext<'_>) -> bool {
        emit!(put(ctx, &[0x83, 0xC4, 0x0C, 0x5D, 0x5E, 0x5F, 0x5A, 0x59, 0x5B, 0xB8]));
        emit!(ctx.put_u32(1));
        ctx.put_u8(0xC3)
    }

    fn helper_call(ctx: &mut JitContext<'_>, f: usize, args: &[HelperArg]) -> bool {
        for &arg in args.iter().rev() {
            emit!(push_arg(ctx, arg));
        }
        // mov eax, f; call eax; add esp, 4n
        emit!(ctx.put_u8(0xB8));
        emit!(ctx.put_u32(f as u32));
        emit!(put(ctx, &[0xFF, 0xD0]));
        emit!(put(ctx, &[0x83, 0xC4, (4 * args.len()) as u8]));
        // test al, al; jne +3; jmp [ebp-12]
        put(ctx, &[0x84, 0xC0, 0x75, 0x03, 0xFF, 0x65, 0xF4])
    }

    fn line_info(ctx: &mut JitContext<'_>, line: u32) -> bool {
        // mov eax, [ebp-8]; mov dword [eax+4], line
        emit!(put(ctx, &[0x8B, 0x45, 0xF8, 0xC7, 0x40, 0x04]));
        ctx.put_u32(line)
    }

    fn assign(ctx: &mut JitContext<'_>, dst_off: u32, src_off: u32) -> bool {
        emit!(slot_addr_eax(ctx, dst_off));
        // mov edx, eax
        emit!(put(ctx, &[0x89, 0xC2]));
        emit!(slot_addr_eax(ctx, src_off));
        // mov ecx, [eax]; mov [edx], ecx; mov ecx, [eax+4]; mov [edx+4], ecx
        put(ctx, &[0x8B, 0x08, 0x89, 0x0A, 0x8B, 0x48, 0x04, 0x89, 0x4A, 0x04])
    }

    fn const32(ctx: &mut JitContext<'_>, dst_off: u32, tag: u32, payload: u32) -> bool {
        emit!(slot_addr_eax(ctx, dst_off));
        // mov dword [eax], tag; mov dword [eax+4], payload
        emit!(put(ctx, &[0xC7, 0x00]));
        emit!(ctx.put_u32(tag));
        emit!(put(ctx, &[0xC7, 0x40, 0x04]));
        ctx.put_u32(payload)
    }

    fn inc(ctx: &mut JitContext<'_>, dst_off: u32) -> bool {
        emit!(slot_addr_eax(ctx, dst_off));
        // add dword [eax+4], 1
        put(ctx, &[0x83, 0x40, 0x04, 0x01])
    }

    fn eqi(ctx: &mut JitContext<'_>, src1_off: u32, src2_off: u32) -> bool {
        emit!(slot_addr_eax(ctx, src1_off));
        // mov ecx, [eax+4]
        emit!(put(ctx, &[0x8B, 0x48, 0x04]));
        emit!(slot_addr_eax(ctx, src2_off));
        // mov eax, [eax+4]; cmp ecx, eax
        put(ctx, &[0x8B, 0x40, 0x04, 0x39, 0xC1])
    }

    fn test_slot(ctx: &mut JitContext<'_>, cond_off: u32) -> bool {
        emit!(slot_addr_eax(ctx, cond_off));
        // cmp dword [eax+4], 0
        put(ctx, &[0x83, 0x78, 0x04, 0x00])
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
