//! Just-in-time compilation
//!
//! Template-based native code generation over the shared bytecode. Each
//! backend expands every opcode into a fixed instruction sequence; the
//! non-trivial ones marshal arguments per the host ABI and call the same
//! execution helpers the interpreter uses. One writable-or-executable
//! region per VM backs all compiled functions; `jit_commit` performs the
//! writable-to-executable transition before compiled code is entered.
//!
//! Without the `jit` feature (or on hosts with no code-memory backend)
//! building is a no-op and execution stays on the interpreter.

#[cfg(feature = "jit")]
pub(crate) mod backend;
#[cfg(feature = "jit")]
pub(crate) mod codebuf;
#[cfg(feature = "jit")]
pub(crate) mod memory;

use crate::vm::frame::Env;
use crate::vm::object::FuncObj;
use crate::vm::{Vm, VmOptions};

/// Per-VM JIT state: the code region and the pending-commit flag.
pub(crate) struct JitState {
    /// Code has been emitted since the last executable transition
    pub(crate) dirty: bool,
    /// Generated frames currently on the native stack. Builds are
    /// deferred while non-zero: flipping the region writable would pull
    /// the execute permission out from under the running code.
    pub(crate) active: u32,
    #[cfg(feature = "jit")]
    pub(crate) region: Option<codebuf::CodeRegion>,
    #[cfg(feature = "jit")]
    code_size: usize,
    /// Single-writer rule: only one thread compiles at a time
    #[cfg(feature = "jit")]
    build_lock: parking_lot::Mutex<()>,
}

impl JitState {
    pub(crate) fn new(options: &VmOptions) -> JitState {
        let _ = options;
        JitState {
            dirty: false,
            active: 0,
            #[cfg(feature = "jit")]
            region: None,
            #[cfg(feature = "jit")]
            code_size: options.jit_code_size,
            #[cfg(feature = "jit")]
            build_lock: parking_lot::Mutex::new(()),
        }
    }
}

/// Compile `func` into the VM's code region and install its entry point.
/// Returns `false` with the environment error state set on a fatal
/// code-generation failure. On targets without a backend this is a
/// no-op returning `true`; the function simply keeps interpreting.
#[cfg(feature = "jit")]
pub(crate) fn jit_build(env: *mut Env, func: *mut FuncObj) -> bool {
    use crate::vm::error::ErrorKind;
    use crate::vm_error;

    if !backend::SUPPORTED {
        return true;
    }
    unsafe {
        let vm = (*env).vm();
        let lock: *const parking_lot::Mutex<()> = &vm.jit.build_lock;
        let _guard = (*lock).lock();

        if vm.jit.region.is_none() {
            match codebuf::CodeRegion::map(vm.jit.code_size) {
                Some(region) => vm.jit.region = Some(region),
                None => {
                    vm_error!(env, ErrorKind::MemoryMapFailed, "Memory mapping failed.");
                    return false;
                }
            }
        }
        let region = vm.jit.region.as_mut().unwrap();
        region.make_writable();

        let mut ctx = codebuf::JitContext::new(env, &*func, region);
        if !backend::build(&mut ctx) {
            return false;
        }
        let entry = region.base().add(ctx.entry);
        ctx.commit_cursor(region);
        (*func).jit_code = Some(std::mem::transmute::<*mut u8, extern "C" fn(*mut Env) -> bool>(
            entry,
        ));
        vm.jit.dirty = true;
        true
    }
}

#[cfg(not(feature = "jit"))]
pub(crate) fn jit_build(_env: *mut Env, _func: *mut FuncObj) -> bool {
    true
}

/// Transition the region executable after emission. Called before any
/// compiled entry is dispatched.
pub(crate) fn jit_commit(vm: &mut Vm) {
    #[cfg(feature = "jit")]
    if let Some(region) = vm.jit.region.as_mut() {
        region.make_executable();
    }
    vm.jit.dirty = false;
}

/// Release the code region. Every compiled entry dies with it.
pub(crate) fn jit_free(vm: &mut Vm) {
    #[cfg(feature = "jit")]
    {
        vm.jit.region = None;
    }
    vm.jit.dirty = false;
}
