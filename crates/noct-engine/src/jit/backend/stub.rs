//! No-op backend for architectures without a template generator
//! (MIPS, PowerPC, and anything else unlisted). Building "succeeds"
//! without emitting, the function keeps no native entry, and execution
//! stays on the interpreter. `SUPPORTED` keeps this backend from ever
//! being dispatched into.

use crate::jit::backend::TemplateBackend;
use crate::jit::codebuf::{BranchPatch, HelperArg, JitContext, PatchKind};

pub(crate) struct Stub;

impl TemplateBackend for Stub {
    fn prologue(_ctx: &mut JitContext<'_>) -> bool {
        true
    }

    fn epilogue(_ctx: &mut JitContext<'_>) -> bool {
        true
    }

    fn helper_call(_ctx: &mut JitContext<'_>, _f: usize, _args: &[HelperArg]) -> bool {
        true
    }

    fn line_info(_ctx: &mut JitContext<'_>, _line: u32) -> bool {
        true
    }

    fn assign(_ctx: &mut JitContext<'_>, _dst_off: u32, _src_off: u32) -> bool {
        true
    }

    fn const32(_ctx: &mut JitContext<'_>, _dst_off: u32, _tag: u32, _payload: u32) -> bool {
        true
    }

    fn inc(_ctx: &mut JitContext<'_>, _dst_off: u32) -> bool {
        true
    }

    fn eqi(_ctx: &mut JitContext<'_>, _src1_off: u32, _src2_off: u32) -> bool {
        true
    }

    fn test_slot(_ctx: &mut JitContext<'_>, _cond_off: u32) -> bool {
        true
    }

    fn branch_placeholder(_ctx: &mut JitContext<'_>, _kind: PatchKind) -> bool {
        true
    }

    fn embed_args(_ctx: &mut JitContext<'_>, _args: &[u16]) -> Option<usize> {
        Some(0)
    }

    fn apply_patch(_ctx: &mut JitContext<'_>, _patch: &BranchPatch, _target: usize) -> bool {
        true
    }
}
