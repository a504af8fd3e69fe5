//! Code region and emission context
//!
//! One mapped region backs every JIT-compiled function of a VM. A build
//! appends to the region through a [`JitContext`], which also carries the
//! per-function logical-PC-to-native map and the delayed branch patch
//! table. Both tables are capped; overflow fails the build for that
//! function.

use crate::jit::memory;
use crate::vm::error::ErrorKind;
use crate::vm::frame::Env;
use crate::vm::object::FuncObj;
use crate::vm_error;
use noct_bytecode::BytecodeReader;

/// Cap on per-function logical-PC entries.
pub(crate) const PC_ENTRY_MAX: usize = 2048;

/// Cap on per-function branch patches.
pub(crate) const BRANCH_PATCH_MAX: usize = 2048;

/// The mapped code region of one VM.
pub(crate) struct CodeRegion {
    base: *mut u8,
    size: usize,
    cursor: usize,
    pub(crate) writable: bool,
}

impl CodeRegion {
    /// Map a fresh region. Returns `None` when the host cannot provide
    /// code memory.
    pub(crate) fn map(size: usize) -> Option<CodeRegion> {
        let base = memory::map_region(size)?;
        Some(CodeRegion { base, size, cursor: 0, writable: true })
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.base
    }

    pub(crate) fn make_writable(&mut self) {
        if !self.writable {
            memory::make_writable(self.base, self.size);
            self.writable = true;
        }
    }

    pub(crate) fn make_executable(&mut self) {
        if self.writable {
            memory::make_executable(self.base, self.size);
            self.writable = false;
        }
    }
}

impl Drop for CodeRegion {
    fn drop(&mut self) {
        memory::unmap_region(self.base, self.size);
    }
}

/// Branch flavors a backend can leave for patching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PatchKind {
    /// Unconditional
    Always,
    /// Taken when the recorded condition was equal / zero
    IfEqual,
    /// Taken when the recorded condition was not equal / non-zero
    IfNotEqual,
}

/// A branch emitted with a zero displacement, resolved after the whole
/// function is laid out.
pub(crate) struct BranchPatch {
    /// Absolute address of the branch instruction
    pub(crate) addr: usize,
    /// Logical-PC target
    pub(crate) lpc: u32,
    pub(crate) kind: PatchKind,
}

/// Emission context for one function build.
pub(crate) struct JitContext<'a> {
    pub(crate) env: *mut Env,
    pub(crate) func: &'a FuncObj,
    /// Operand cursor over the function body
    pub(crate) reader: BytecodeReader<'a>,
    region_base: *mut u8,
    region_limit: usize,
    /// Offset of the next byte to write, region-relative
    cursor: usize,
    /// Offset this function's code starts at
    pub(crate) entry: usize,
    /// Absolute address of the per-function exception epilogue
    pub(crate) exception_addr: usize,
    pc_map: Vec<(u32, usize)>,
    pub(crate) patches: Vec<BranchPatch>,
}

impl<'a> JitContext<'a> {
    pub(crate) fn new(env: *mut Env, func: &'a FuncObj, region: &CodeRegion) -> JitContext<'a> {
        JitContext {
            env,
            func,
            reader: BytecodeReader::new(&func.bytecode, func.tmpvar_count.max(1)),
            region_base: region.base,
            region_limit: region.size,
            cursor: region.cursor,
            entry: region.cursor,
            exception_addr: 0,
            pc_map: Vec::new(),
            patches: Vec::new(),
        }
    }

    /// Hand the final cursor back to the region after a successful build.
    pub(crate) fn commit_cursor(&self, region: &mut CodeRegion) {
        region.cursor = self.cursor;
    }

    /// Absolute address of the next byte to emit.
    #[inline]
    pub(crate) fn addr(&self) -> usize {
        self.region_base as usize + self.cursor
    }

    fn code_too_big(&mut self) {
        vm_error!(self.env, ErrorKind::CodeTooBig, "Code too big.");
    }

    /// Emit one byte.
    pub(crate) fn put_u8(&mut self, byte: u8) -> bool {
        if self.cursor + 1 > self.region_limit {
            self.code_too_big();
            return false;
        }
        unsafe {
            *self.region_base.add(self.cursor) = byte;
        }
        self.cursor += 1;
        true
    }

    /// Emit a little-endian 32-bit word (an instruction word on the
    /// fixed-width ISAs, an immediate on x86).
    pub(crate) fn put_u32(&mut self, word: u32) -> bool {
        if self.cursor + 4 > self.region_limit {
            self.code_too_big();
            return false;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                word.to_le_bytes().as_ptr(),
                self.region_base.add(self.cursor),
                4,
            );
        }
        self.cursor += 4;
        true
    }

    /// Emit a little-endian 64-bit immediate.
    pub(crate) fn put_u64(&mut self, word: u64) -> bool {
        if self.cursor + 8 > self.region_limit {
            self.code_too_big();
            return false;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                word.to_le_bytes().as_ptr(),
                self.region_base.add(self.cursor),
                8,
            );
        }
        self.cursor += 8;
        true
    }

    /// Pad with `filler` until the cursor is `align`-aligned (for
    /// embedded argument vectors).
    pub(crate) fn align_to(&mut self, align: usize, filler: u8) -> bool {
        while self.addr() % align != 0 {
            if !self.put_u8(filler) {
                return false;
            }
        }
        true
    }

    /// Overwrite a previously emitted 32-bit word at an absolute address
    /// (branch patching; the region is still writable).
    pub(crate) fn patch_u32_at(&mut self, addr: usize, word: u32) {
        debug_assert!(addr >= self.region_base as usize);
        debug_assert!(addr + 4 <= self.region_base as usize + self.region_limit);
        unsafe {
            std::ptr::copy_nonoverlapping(word.to_le_bytes().as_ptr(), addr as *mut u8, 4);
        }
    }

    /// Record the native address for the instruction starting at `lpc`.
    pub(crate) fn record_pc(&mut self, lpc: u32) -> bool {
        if self.pc_map.len() >= PC_ENTRY_MAX {
            self.code_too_big();
            return false;
        }
        self.pc_map.push((lpc, self.addr()));
        true
    }

    /// Native address previously recorded for `lpc`.
    pub(crate) fn native_for_lpc(&self, lpc: u32) -> Option<usize> {
        self.pc_map
            .iter()
            .find(|&&(entry_lpc, _)| entry_lpc == lpc)
            .map(|&(_, addr)| addr)
    }

    /// Queue a branch for patching. The caller emits the placeholder.
    pub(crate) fn add_patch(&mut self, lpc: u32, kind: PatchKind) -> bool {
        if self.patches.len() >= BRANCH_PATCH_MAX {
            self.code_too_big();
            return false;
        }
        self.patches.push(BranchPatch { addr: self.addr(), lpc, kind });
        true
    }

    /// Validate a decoded jump target: anything past one-beyond-the-end
    /// is broken bytecode.
    pub(crate) fn check_jump_target(&mut self, target: u32) -> bool {
        if target as usize > self.func.bytecode.len() {
            vm_error!(self.env, ErrorKind::BrokenBytecode, "Broken bytecode.");
            return false;
        }
        true
    }

    /// Report a branch whose displacement exceeds the ISA's range.
    pub(crate) fn branch_too_far(&mut self) {
        vm_error!(self.env, ErrorKind::BranchTooFar, "Branch too far.");
    }

    /// Report undecodable bytecode.
    pub(crate) fn broken_bytecode(&mut self) {
        vm_error!(self.env, ErrorKind::BrokenBytecode, "Broken bytecode.");
    }
}

/// Argument kinds the shared per-ABI marshaller materializes for a
/// helper call.
#[derive(Debug, Clone, Copy)]
pub(crate) enum HelperArg {
    /// The environment pointer kept in a reserved register
    Env,
    /// A 32-bit immediate (slot index, length, hash, count)
    Imm(u32),
    /// A full pointer immediate (string operand, embedded arg vector)
    Ptr(usize),
    /// The address of a temporary slot: tmpvar base plus a byte offset
    SlotAddr(u32),
}
