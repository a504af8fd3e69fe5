//! Per-architecture template backends
//!
//! One shared driver walks the bytecode and dispatches to a backend
//! implementing [`TemplateBackend`]: a fixed template per opcode, a
//! shared argument-marshalling routine per ABI for the helper calls, and
//! delayed branch patching against the logical-PC map. Backends exist
//! for x86, x86-64, ARM32, ARM64, and RISC-V 32/64; anything else gets
//! the no-op stub and stays on the interpreter.

pub(crate) mod stub;

#[cfg(target_arch = "x86")]
pub(crate) mod x86;
#[cfg(target_arch = "x86_64")]
pub(crate) mod x86_64;
#[cfg(target_arch = "arm")]
pub(crate) mod arm32;
#[cfg(target_arch = "aarch64")]
pub(crate) mod arm64;
#[cfg(target_arch = "riscv32")]
pub(crate) mod riscv32;
#[cfg(target_arch = "riscv64")]
pub(crate) mod riscv64;

use crate::jit::codebuf::{BranchPatch, HelperArg, JitContext, PatchKind};
use crate::vm::exec;
use crate::vm::frame::Env;
use crate::vm::value::Value;
use noct_bytecode::{Opcode, ARG_MAX};

/// Whether this build has a working backend and code-memory layer.
pub(crate) const SUPPORTED: bool = cfg!(unix)
    && cfg!(any(
        target_arch = "x86",
        target_arch = "x86_64",
        target_arch = "arm",
        target_arch = "aarch64",
        target_arch = "riscv32",
        target_arch = "riscv64",
    ));

/// Compile the context's function with the native backend.
pub(crate) fn build(ctx: &mut JitContext<'_>) -> bool {
    #[cfg(target_arch = "x86")]
    return translate::<x86::X86>(ctx);
    #[cfg(target_arch = "x86_64")]
    return translate::<x86_64::X86_64>(ctx);
    #[cfg(target_arch = "arm")]
    return translate::<arm32::Arm32>(ctx);
    #[cfg(target_arch = "aarch64")]
    return translate::<arm64::Arm64>(ctx);
    #[cfg(target_arch = "riscv32")]
    return translate::<riscv32::RiscV32>(ctx);
    #[cfg(target_arch = "riscv64")]
    return translate::<riscv64::RiscV64>(ctx);
    #[allow(unreachable_code)]
    translate::<stub::Stub>(ctx)
}

/// The emission primitives a backend provides. Everything else — operand
/// decoding, helper selection, patch bookkeeping — lives in the shared
/// driver.
pub(crate) trait TemplateBackend {
    /// Emit the register-saving prologue and the per-function exception
    /// epilogue, recording its address in `ctx.exception_addr`.
    fn prologue(ctx: &mut JitContext<'_>) -> bool;

    /// Emit the success epilogue (restore registers, return true).
    fn epilogue(ctx: &mut JitContext<'_>) -> bool;

    /// Marshal `args` per the host ABI, call the helper at `f`, and
    /// branch to the exception epilogue when it returns false.
    /// A `SlotAddr` argument may appear at position 1 only: backends
    /// whose slot-base register doubles as an argument register consume
    /// it before it is clobbered.
    fn helper_call(ctx: &mut JitContext<'_>, f: usize, args: &[HelperArg]) -> bool;

    /// `env.line = line`
    fn line_info(ctx: &mut JitContext<'_>, line: u32) -> bool;

    /// Bitwise copy of one slot to another (byte offsets).
    fn assign(ctx: &mut JitContext<'_>, dst_off: u32, src_off: u32) -> bool;

    /// Store a tag and a 32-bit payload into a slot (ICONST/FCONST).
    fn const32(ctx: &mut JitContext<'_>, dst_off: u32, tag: u32, payload: u32) -> bool;

    /// Increment a slot's integer payload in place.
    fn inc(ctx: &mut JitContext<'_>, dst_off: u32) -> bool;

    /// Compare two slots' integer payloads, leaving the condition state
    /// for a following conditional branch placeholder.
    fn eqi(ctx: &mut JitContext<'_>, src1_off: u32, src2_off: u32) -> bool;

    /// Compare a slot's integer payload against zero, leaving the
    /// condition state.
    fn test_slot(ctx: &mut JitContext<'_>, cond_off: u32) -> bool;

    /// Emit a patchable branch of the given kind with a zero
    /// displacement. The driver records the patch entry first.
    fn branch_placeholder(ctx: &mut JitContext<'_>, kind: PatchKind) -> bool;

    /// Embed a call's slot-index vector into the code stream behind a
    /// short jump; returns its address (0 when `args` is empty).
    fn embed_args(ctx: &mut JitContext<'_>, args: &[u16]) -> Option<usize>;

    /// Resolve one branch patch against the target's native address.
    fn apply_patch(ctx: &mut JitContext<'_>, patch: &BranchPatch, target: usize) -> bool;
}

// Helper-address shims: the template stores plain code addresses the
// generated calls jump through.

fn helper3(f: extern "C" fn(*mut Env, i32, i32, i32) -> bool) -> usize {
    f as usize
}

fn helper2(f: extern "C" fn(*mut Env, i32, i32) -> bool) -> usize {
    f as usize
}

/// Shared translation driver.
pub(crate) fn translate<B: TemplateBackend>(ctx: &mut JitContext<'_>) -> bool {
    let slot = std::mem::size_of::<Value>() as u32;
    let float_tag = 1u32;

    macro_rules! decode {
        ($e:expr) => {
            match $e {
                Ok(v) => v,
                Err(_) => {
                    ctx.broken_bytecode();
                    return false;
                }
            }
        };
    }
    macro_rules! emit {
        ($e:expr) => {
            if !$e {
                return false;
            }
        };
    }

    emit!(B::prologue(ctx));

    while !ctx.reader.at_end() {
        emit!(ctx.record_pc(ctx.reader.pc() as u32));
        let op = decode!(ctx.reader.opcode());
        match op {
            Opcode::LineInfo => {
                let line = decode!(ctx.reader.imm32());
                emit!(B::line_info(ctx, line));
            }
            Opcode::Assign => {
                let dst = decode!(ctx.reader.tmpvar()) as u32;
                let src = decode!(ctx.reader.tmpvar()) as u32;
                emit!(B::assign(ctx, dst * slot, src * slot));
            }
            Opcode::IConst => {
                let dst = decode!(ctx.reader.tmpvar()) as u32;
                let value = decode!(ctx.reader.imm32());
                emit!(B::const32(ctx, dst * slot, 0, value));
            }
            Opcode::FConst => {
                let dst = decode!(ctx.reader.tmpvar()) as u32;
                let bits = decode!(ctx.reader.imm32());
                emit!(B::const32(ctx, dst * slot, float_tag, bits));
            }
            Opcode::SConst => {
                let dst = decode!(ctx.reader.tmpvar()) as u32;
                let s = decode!(ctx.reader.string());
                emit!(B::helper_call(
                    ctx,
                    exec::make_string_with_hash as extern "C" fn(*mut Env, *mut Value, *const u8, u32, u32) -> bool
                        as usize,
                    &[
                        HelperArg::Env,
                        HelperArg::SlotAddr(dst * slot),
                        HelperArg::Ptr(s.bytes.as_ptr() as usize),
                        HelperArg::Imm(s.bytes.len() as u32),
                        HelperArg::Imm(s.hash),
                    ],
                ));
            }
            Opcode::AConst | Opcode::DConst => {
                let dst = decode!(ctx.reader.tmpvar()) as u32;
                let f = if op == Opcode::AConst {
                    exec::make_empty_array as extern "C" fn(*mut Env, *mut Value) -> bool as usize
                } else {
                    exec::make_empty_dict as extern "C" fn(*mut Env, *mut Value) -> bool as usize
                };
                emit!(B::helper_call(
                    ctx,
                    f,
                    &[HelperArg::Env, HelperArg::SlotAddr(dst * slot)],
                ));
            }
            Opcode::Inc => {
                let dst = decode!(ctx.reader.tmpvar()) as u32;
                emit!(B::inc(ctx, dst * slot));
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::Lt
            | Opcode::Lte
            | Opcode::Eq
            | Opcode::Neq
            | Opcode::Gte
            | Opcode::Gt
            | Opcode::LoadArray
            | Opcode::StoreArray
            | Opcode::GetDictKeyByIndex
            | Opcode::GetDictValByIndex => {
                let a = decode!(ctx.reader.tmpvar()) as u32;
                let b = decode!(ctx.reader.tmpvar()) as u32;
                let c = decode!(ctx.reader.tmpvar()) as u32;
                let f = match op {
                    Opcode::Add => helper3(exec::add_helper),
                    Opcode::Sub => helper3(exec::sub_helper),
                    Opcode::Mul => helper3(exec::mul_helper),
                    Opcode::Div => helper3(exec::div_helper),
                    Opcode::Mod => helper3(exec::mod_helper),
                    Opcode::And => helper3(exec::and_helper),
                    Opcode::Or => helper3(exec::or_helper),
                    Opcode::Xor => helper3(exec::xor_helper),
                    Opcode::Shl => helper3(exec::shl_helper),
                    Opcode::Shr => helper3(exec::shr_helper),
                    Opcode::Lt => helper3(exec::lt_helper),
                    Opcode::Lte => helper3(exec::lte_helper),
                    Opcode::Eq => helper3(exec::eq_helper),
                    Opcode::Neq => helper3(exec::neq_helper),
                    Opcode::Gte => helper3(exec::gte_helper),
                    Opcode::Gt => helper3(exec::gt_helper),
                    Opcode::LoadArray => helper3(exec::load_array_helper),
                    Opcode::StoreArray => helper3(exec::store_array_helper),
                    Opcode::GetDictKeyByIndex => helper3(exec::get_dict_key_by_index_helper),
                    _ => helper3(exec::get_dict_val_by_index_helper),
                };
                emit!(B::helper_call(
                    ctx,
                    f,
                    &[
                        HelperArg::Env,
                        HelperArg::Imm(a),
                        HelperArg::Imm(b),
                        HelperArg::Imm(c),
                    ],
                ));
            }
            Opcode::Neg | Opcode::Not | Opcode::Len => {
                let dst = decode!(ctx.reader.tmpvar()) as u32;
                let src = decode!(ctx.reader.tmpvar()) as u32;
                let f = match op {
                    Opcode::Neg => helper2(exec::neg_helper),
                    Opcode::Not => helper2(exec::not_helper),
                    _ => helper2(exec::len_helper),
                };
                emit!(B::helper_call(
                    ctx,
                    f,
                    &[HelperArg::Env, HelperArg::Imm(dst), HelperArg::Imm(src)],
                ));
            }
            Opcode::EqI => {
                let _dst = decode!(ctx.reader.tmpvar());
                let src1 = decode!(ctx.reader.tmpvar()) as u32;
                let src2 = decode!(ctx.reader.tmpvar()) as u32;
                emit!(B::eqi(ctx, src1 * slot, src2 * slot));
            }
            Opcode::LoadSymbol => {
                let dst = decode!(ctx.reader.tmpvar()) as u32;
                let name = decode!(ctx.reader.string());
                emit!(B::helper_call(
                    ctx,
                    exec::load_symbol_helper as extern "C" fn(*mut Env, i32, *const u8, u32, u32) -> bool
                        as usize,
                    &[
                        HelperArg::Env,
                        HelperArg::Imm(dst),
                        HelperArg::Ptr(name.bytes.as_ptr() as usize),
                        HelperArg::Imm(name.bytes.len() as u32),
                        HelperArg::Imm(name.hash),
                    ],
                ));
            }
            Opcode::StoreSymbol => {
                let name = decode!(ctx.reader.string());
                let src = decode!(ctx.reader.tmpvar()) as u32;
                emit!(B::helper_call(
                    ctx,
                    exec::store_symbol_helper as extern "C" fn(*mut Env, *const u8, u32, u32, i32) -> bool
                        as usize,
                    &[
                        HelperArg::Env,
                        HelperArg::Ptr(name.bytes.as_ptr() as usize),
                        HelperArg::Imm(name.bytes.len() as u32),
                        HelperArg::Imm(name.hash),
                        HelperArg::Imm(src),
                    ],
                ));
            }
            Opcode::LoadDot => {
                let dst = decode!(ctx.reader.tmpvar()) as u32;
                let dict = decode!(ctx.reader.tmpvar()) as u32;
                let field = decode!(ctx.reader.string());
                emit!(B::helper_call(
                    ctx,
                    exec::load_dot_helper
                        as extern "C" fn(*mut Env, i32, i32, *const u8, u32, u32) -> bool
                        as usize,
                    &[
                        HelperArg::Env,
                        HelperArg::Imm(dst),
                        HelperArg::Imm(dict),
                        HelperArg::Ptr(field.bytes.as_ptr() as usize),
                        HelperArg::Imm(field.bytes.len() as u32),
                        HelperArg::Imm(field.hash),
                    ],
                ));
            }
            Opcode::StoreDot => {
                let dict = decode!(ctx.reader.tmpvar()) as u32;
                let field = decode!(ctx.reader.string());
                let src = decode!(ctx.reader.tmpvar()) as u32;
                emit!(B::helper_call(
                    ctx,
                    exec::store_dot_helper
                        as extern "C" fn(*mut Env, i32, *const u8, u32, u32, i32) -> bool
                        as usize,
                    &[
                        HelperArg::Env,
                        HelperArg::Imm(dict),
                        HelperArg::Ptr(field.bytes.as_ptr() as usize),
                        HelperArg::Imm(field.bytes.len() as u32),
                        HelperArg::Imm(field.hash),
                        HelperArg::Imm(src),
                    ],
                ));
            }
            Opcode::Call => {
                let dst = decode!(ctx.reader.tmpvar()) as u32;
                let func = decode!(ctx.reader.tmpvar()) as u32;
                let count = decode!(ctx.reader.arg_count());
                let mut args = [0u16; ARG_MAX];
                for arg in args.iter_mut().take(count as usize) {
                    *arg = decode!(ctx.reader.tmpvar());
                }
                let vec_addr = match B::embed_args(ctx, &args[..count as usize]) {
                    Some(addr) => addr,
                    None => return false,
                };
                emit!(B::helper_call(
                    ctx,
                    exec::call_helper as extern "C" fn(*mut Env, i32, i32, i32, *const i32) -> bool
                        as usize,
                    &[
                        HelperArg::Env,
                        HelperArg::Imm(dst),
                        HelperArg::Imm(func),
                        HelperArg::Imm(count as u32),
                        HelperArg::Ptr(vec_addr),
                    ],
                ));
            }
            Opcode::ThisCall => {
                let dst = decode!(ctx.reader.tmpvar()) as u32;
                let recv = decode!(ctx.reader.tmpvar()) as u32;
                let name = decode!(ctx.reader.string());
                let count = decode!(ctx.reader.arg_count());
                let mut args = [0u16; ARG_MAX];
                for arg in args.iter_mut().take(count as usize) {
                    *arg = decode!(ctx.reader.tmpvar());
                }
                let vec_addr = match B::embed_args(ctx, &args[..count as usize]) {
                    Some(addr) => addr,
                    None => return false,
                };
                emit!(B::helper_call(
                    ctx,
                    exec::this_call_helper
                        as extern "C" fn(*mut Env, i32, i32, *const u8, u32, u32, i32, *const i32) -> bool
                        as usize,
                    &[
                        HelperArg::Env,
                        HelperArg::Imm(dst),
                        HelperArg::Imm(recv),
                        HelperArg::Ptr(name.bytes.as_ptr() as usize),
                        HelperArg::Imm(name.bytes.len() as u32),
                        HelperArg::Imm(name.hash),
                        HelperArg::Imm(count as u32),
                        HelperArg::Ptr(vec_addr),
                    ],
                ));
            }
            Opcode::Jmp => {
                let target = decode!(ctx.reader.imm32());
                if !ctx.check_jump_target(target) {
                    return false;
                }
                emit!(ctx.add_patch(target, PatchKind::Always));
                emit!(B::branch_placeholder(ctx, PatchKind::Always));
            }
            Opcode::JmpIfTrue | Opcode::JmpIfFalse => {
                let cond = decode!(ctx.reader.tmpvar()) as u32;
                let target = decode!(ctx.reader.imm32());
                if !ctx.check_jump_target(target) {
                    return false;
                }
                let kind = if op == Opcode::JmpIfTrue {
                    PatchKind::IfNotEqual
                } else {
                    PatchKind::IfEqual
                };
                emit!(B::test_slot(ctx, cond * slot));
                emit!(ctx.add_patch(target, kind));
                emit!(B::branch_placeholder(ctx, kind));
            }
            Opcode::JmpIfEq => {
                let target = decode!(ctx.reader.imm32());
                if !ctx.check_jump_target(target) {
                    return false;
                }
                emit!(ctx.add_patch(target, PatchKind::IfEqual));
                emit!(B::branch_placeholder(ctx, PatchKind::IfEqual));
            }
        }
    }

    // The one-past-the-end PC is a valid jump target (function return).
    emit!(ctx.record_pc(ctx.reader.len() as u32));
    emit!(B::epilogue(ctx));

    let patches = std::mem::take(&mut ctx.patches);
    for patch in &patches {
        let target = match ctx.native_for_lpc(patch.lpc) {
            Some(addr) => addr,
            None => {
                ctx.broken_bytecode();
                return false;
            }
        };
        if !B::apply_patch(ctx, patch, target) {
            return false;
        }
    }
    true
}
