//! Frames and execution environments
//!
//! A frame is one activation record: a fixed-capacity array of temporary
//! slots (the register file of the call), the running function, and the
//! local pin list declared by native code. An environment is a per-thread
//! execution context owning a bounded stack of inline frames, the current
//! source line, and the error buffers.
//!
//! Layout contract: generated code addresses `env.frame` at offset 0,
//! `env.line` at offset 8, and `frame.tmpvar` at offset 0 of the frame.
//! These offsets are baked into every JIT template.

use crate::vm::error::{ErrorKind, VmError, ERROR_MSG_MAX, FILE_NAME_MAX};
use crate::vm::object::FuncObj;
use crate::vm::value::Value;
use crate::vm::Vm;
use std::fmt;

/// Maximum nested call depth.
pub const FRAME_MAX: usize = 32;

/// Temporary slots available to one frame.
pub const TMPVAR_SLOTS: usize = noct_bytecode::TMPVAR_MAX;

/// Capacity of the VM-wide pin list.
pub const GLOBAL_PIN_MAX: usize = 64;

/// Capacity of a frame's local pin list.
pub const LOCAL_PIN_MAX: usize = 32;

/// One activation record.
#[repr(C)]
pub struct Frame {
    /// Slot base pointer. Offset 0: the JIT loads it with a single
    /// dereference of the frame pointer.
    pub(crate) tmpvar: *mut Value,
    /// Addressable slots for the running function
    pub(crate) tmpvar_size: i32,
    /// The running function
    pub(crate) func: *mut FuncObj,
    /// Values native code declared live, popped with the frame
    pub(crate) pinned: [*mut Value; LOCAL_PIN_MAX],
    pub(crate) pinned_count: i32,
    /// Inline slot storage referenced by `tmpvar`
    pub(crate) tmpvar_alloc: [Value; TMPVAR_SLOTS],
}

impl Frame {
    /// Pointer to slot `index`. The index must have been validated
    /// against `tmpvar_size` by the decoder.
    #[inline]
    pub(crate) fn slot(&self, index: usize) -> *mut Value {
        debug_assert!(index < self.tmpvar_size as usize);
        unsafe { self.tmpvar.add(index) }
    }
}

/// A per-thread execution context.
#[repr(C)]
pub struct Env {
    /// Current frame. Offset 0 — JIT contract.
    pub(crate) frame: *mut Frame,
    /// Current source line, updated by LINEINFO. Offset 8 — JIT contract.
    /// Generated code may store a full word here, clobbering the pad.
    pub(crate) line: i32,
    pub(crate) _pad: i32,
    /// Owning VM
    pub(crate) vm: *mut Vm,
    /// Index of the current frame, -1 when idle
    pub(crate) cur_frame_index: i32,
    /// Error kind as a byte: 0 = none, otherwise kind + 1
    pub(crate) error_kind: u8,
    /// Error message buffer and its length
    pub(crate) error_msg: [u8; ERROR_MSG_MAX],
    pub(crate) error_msg_len: u32,
    /// File name of the executing function
    pub(crate) file_name: [u8; FILE_NAME_MAX],
    pub(crate) file_name_len: u32,
    /// Inline frame storage
    pub(crate) frames: [Frame; FRAME_MAX],
}

struct CappedWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl fmt::Write for CappedWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let remaining = self.buf.len() - self.len;
        let n = s.len().min(remaining);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

impl Env {
    /// Allocate a zeroed environment. All-zero bytes are a valid idle
    /// state: null frame, `Int(0)` slots, empty buffers.
    pub(crate) fn new_boxed(vm: *mut Vm) -> Box<Env> {
        unsafe {
            let layout = std::alloc::Layout::new::<Env>();
            let raw = std::alloc::alloc_zeroed(layout) as *mut Env;
            assert!(!raw.is_null(), "environment allocation failed");
            (*raw).vm = vm;
            (*raw).cur_frame_index = -1;
            Box::from_raw(raw)
        }
    }

    /// The owning VM.
    #[inline]
    pub(crate) fn vm(&self) -> &'static mut Vm {
        unsafe { &mut *self.vm }
    }

    /// The current frame, if any call is active.
    #[inline]
    pub(crate) fn current_frame(&self) -> Option<&'static mut Frame> {
        if self.frame.is_null() {
            None
        } else {
            Some(unsafe { &mut *self.frame })
        }
    }

    /// Push a frame for `func`, zero its slots, and copy `args` into the
    /// leading slots. Fails with a stack-overflow fault at the depth cap.
    pub(crate) fn push_frame(&mut self, func: *mut FuncObj, args: &[Value]) -> bool {
        if self.cur_frame_index + 1 >= FRAME_MAX as i32 {
            self.set_error(ErrorKind::StackOverflow, format_args!("Stack overflow."));
            return false;
        }
        self.cur_frame_index += 1;
        let tmpvar_size = unsafe { (*func).tmpvar_count.max(1) as i32 };
        let frame = &mut self.frames[self.cur_frame_index as usize];
        frame.tmpvar = frame.tmpvar_alloc.as_mut_ptr();
        frame.tmpvar_size = tmpvar_size;
        frame.func = func;
        frame.pinned_count = 0;
        for slot in frame.tmpvar_alloc[..tmpvar_size as usize].iter_mut() {
            *slot = Value::zero();
        }
        let n = args.len().min(tmpvar_size as usize);
        frame.tmpvar_alloc[..n].copy_from_slice(&args[..n]);
        self.frame = frame;
        true
    }

    /// Pop the current frame.
    pub(crate) fn pop_frame(&mut self) {
        debug_assert!(self.cur_frame_index >= 0);
        self.cur_frame_index -= 1;
        self.frame = if self.cur_frame_index < 0 {
            std::ptr::null_mut()
        } else {
            &mut self.frames[self.cur_frame_index as usize]
        };
    }

    /// Frames 0..=current, for root scanning.
    pub(crate) fn active_frames(&mut self) -> &mut [Frame] {
        let count = (self.cur_frame_index + 1).max(0) as usize;
        &mut self.frames[..count]
    }

    /// Record an error: kind, formatted message (capped), and the current
    /// file/line. Later errors overwrite earlier ones; the first failure
    /// aborts execution, so the final state is the first fault of the
    /// unwinding call.
    pub(crate) fn set_error(&mut self, kind: ErrorKind, args: fmt::Arguments<'_>) {
        use fmt::Write;
        let mut writer = CappedWriter { buf: &mut self.error_msg, len: 0 };
        let _ = writer.write_fmt(args);
        self.error_msg_len = writer.len as u32;
        self.error_kind = kind as u8 + 1;
    }

    /// Copy the executing function's file name into the diagnostics
    /// buffer.
    pub(crate) fn set_file_name(&mut self, name: &str) {
        let n = name.len().min(FILE_NAME_MAX);
        self.file_name[..n].copy_from_slice(&name.as_bytes()[..n]);
        self.file_name_len = n as u32;
    }

    /// The recorded error kind, if an error has been set.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.error_kind {
            0 => None,
            byte => Some(match byte - 1 {
                0 => ErrorKind::Type,
                1 => ErrorKind::DivisionByZero,
                2 => ErrorKind::Index,
                3 => ErrorKind::Key,
                4 => ErrorKind::Name,
                5 => ErrorKind::BrokenBytecode,
                6 => ErrorKind::OutOfMemory,
                7 => ErrorKind::CodeTooBig,
                8 => ErrorKind::BranchTooFar,
                9 => ErrorKind::MemoryMapFailed,
                10 => ErrorKind::StackOverflow,
                11 => ErrorKind::Compile,
                _ => ErrorKind::Api,
            }),
        }
    }

    /// The recorded error message.
    pub fn error_message(&self) -> String {
        String::from_utf8_lossy(&self.error_msg[..self.error_msg_len as usize]).into_owned()
    }

    /// The file name captured with the error.
    pub fn error_file(&self) -> String {
        String::from_utf8_lossy(&self.file_name[..self.file_name_len as usize]).into_owned()
    }

    /// The line captured by the most recent LINEINFO instruction.
    pub fn error_line(&self) -> i32 {
        self.line
    }

    /// Build the host-facing error from the recorded state.
    pub(crate) fn vm_error(&self) -> VmError {
        VmError {
            kind: self.error_kind().unwrap_or(ErrorKind::Api),
            message: self.error_message(),
            file: self.error_file(),
            line: self.line,
        }
    }
}

/// Record an error on an environment given by raw pointer.
#[macro_export]
macro_rules! vm_error {
    ($env:expr, $kind:expr, $($arg:tt)*) => {{
        #[allow(unused_unsafe)]
        unsafe {
            (*$env).set_error($kind, format_args!($($arg)*));
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_env_layout_contract() {
        assert_eq!(offset_of!(Env, frame), 0);
        assert_eq!(offset_of!(Env, line), std::mem::size_of::<usize>());
        assert_eq!(offset_of!(Frame, tmpvar), 0);
    }

    #[test]
    fn test_error_message_truncates() {
        let mut env = Env::new_boxed(std::ptr::null_mut());
        let long = "x".repeat(ERROR_MSG_MAX * 2);
        env.set_error(ErrorKind::Type, format_args!("{long}"));
        assert_eq!(env.error_message().len(), ERROR_MSG_MAX);
        assert_eq!(env.error_kind(), Some(ErrorKind::Type));
    }

    #[test]
    fn test_error_kind_round_trip() {
        let mut env = Env::new_boxed(std::ptr::null_mut());
        for kind in [
            ErrorKind::Type,
            ErrorKind::DivisionByZero,
            ErrorKind::Index,
            ErrorKind::Key,
            ErrorKind::Name,
            ErrorKind::BrokenBytecode,
            ErrorKind::OutOfMemory,
            ErrorKind::CodeTooBig,
            ErrorKind::BranchTooFar,
            ErrorKind::MemoryMapFailed,
            ErrorKind::StackOverflow,
            ErrorKind::Compile,
            ErrorKind::Api,
        ] {
            env.set_error(kind, format_args!("probe"));
            assert_eq!(env.error_kind(), Some(kind));
        }
    }
}
