//! VM runtime
//!
//! This module owns the runtime state: the global symbol table, the
//! function registry, the GC heap, the environment list, the pin lists,
//! and the JIT code region. The embedding surface lives on [`Env`]
//! (see `api`); the [`Vm`] is the top-level owner the host keeps alive.

pub mod api;
pub mod error;
pub mod exec;
pub mod frame;
pub mod gc;
pub mod globals;
pub mod interp;
pub mod object;
pub mod value;

pub use gc::GcStats;
pub use object::NativeFn;

use crate::vm::frame::{Env, GLOBAL_PIN_MAX};
use crate::vm::globals::SymbolTable;
use crate::vm::object::FuncObj;
use crate::vm::value::Value;
use rustc_hash::FxHashMap;

/// Configuration knobs fixed at VM creation.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Enable JIT emission and dispatch
    pub jit_enable: bool,
    /// Call count at which a bytecode function is compiled
    pub jit_threshold: u32,
    /// Size of the shared code region backing all compiled functions
    pub jit_code_size: usize,
    /// Reserved for the compiler front end; the core ignores it
    pub optimize: u32,
    /// Nursery region size in bytes
    pub gc_nursery_size: usize,
    /// Graduate region size in bytes
    pub gc_graduate_size: usize,
    /// Tenure region size in bytes
    pub gc_tenure_size: usize,
    /// Per-object size at which an allocation goes to the large-object
    /// list
    pub gc_lop_threshold: usize,
    /// Collections an object must survive before promotion
    pub gc_promotion_threshold: u8,
}

impl Default for VmOptions {
    fn default() -> VmOptions {
        VmOptions {
            jit_enable: true,
            jit_threshold: 50,
            jit_code_size: 16 * 1024 * 1024,
            optimize: 0,
            gc_nursery_size: 256 * 1024,
            gc_graduate_size: 512 * 1024,
            gc_tenure_size: 4 * 1024 * 1024,
            gc_lop_threshold: 8 * 1024,
            gc_promotion_threshold: 1,
        }
    }
}

/// Hook invoked by `register_source`. The core consumes byte images; an
/// embedder that wants source registration installs a compiler producing
/// the image format of `noct-bytecode`.
pub trait SourceCompiler {
    /// Compile `source` into image bytes.
    fn compile(&mut self, file_name: &str, source: &str) -> Result<Vec<u8>, String>;
}

/// The top-level runtime owner.
///
/// A `Vm` is handed out boxed so the environments' back-pointers stay
/// valid for its whole lifetime. Destroying it destroys every
/// environment, every function, every heap object, and the JIT code
/// region.
pub struct Vm {
    pub(crate) options: VmOptions,
    pub(crate) globals: SymbolTable,
    /// Function registry; functions live until the VM is destroyed
    pub(crate) funcs: Vec<Box<FuncObj>>,
    /// Intrinsic method table consulted by THISCALL before the receiver
    pub(crate) intrinsics: FxHashMap<String, *mut FuncObj>,
    pub(crate) gc: gc::GcHeap,
    pub(crate) envs: Vec<Box<Env>>,
    /// VM-wide pin list (host values that survive between calls)
    pub(crate) pinned: Vec<*mut Value>,
    pub(crate) jit: crate::jit::JitState,
    pub(crate) compiler: Option<Box<dyn SourceCompiler>>,
    /// FFI calls currently on foreign stacks (parallel-GC build)
    #[cfg(feature = "parallel")]
    pub(crate) in_flight: std::sync::atomic::AtomicI32,
}

impl Vm {
    /// Create a VM with its default environment.
    pub fn new(options: VmOptions) -> Box<Vm> {
        let mut vm = Box::new(Vm {
            gc: gc::GcHeap::new(&options),
            jit: crate::jit::JitState::new(&options),
            options,
            globals: SymbolTable::default(),
            funcs: Vec::new(),
            intrinsics: FxHashMap::default(),
            envs: Vec::new(),
            pinned: Vec::with_capacity(GLOBAL_PIN_MAX),
            compiler: None,
            #[cfg(feature = "parallel")]
            in_flight: std::sync::atomic::AtomicI32::new(0),
        });
        let vm_ptr: *mut Vm = &mut *vm;
        vm.envs.push(Env::new_boxed(vm_ptr));
        vm
    }

    /// The environment created with the VM.
    pub fn default_env(&mut self) -> &mut Env {
        &mut self.envs[0]
    }

    /// Create an environment for another OS thread. Environments share
    /// the VM heap; concurrent execution requires the parallel-GC build.
    #[cfg(feature = "parallel")]
    pub fn create_thread_env(&mut self) -> &mut Env {
        let vm_ptr: *mut Vm = self;
        self.envs.push(Env::new_boxed(vm_ptr));
        self.envs.last_mut().unwrap()
    }

    /// Install the compiler used by `register_source`.
    pub fn set_compiler(&mut self, compiler: Box<dyn SourceCompiler>) {
        self.compiler = Some(compiler);
    }

    /// The configuration this VM was created with.
    pub fn options(&self) -> &VmOptions {
        &self.options
    }

    /// Collector counters.
    pub fn gc_stats(&self) -> &GcStats {
        &self.gc.stats
    }

    pub(crate) fn register_func(&mut self, func: FuncObj) -> *mut FuncObj {
        self.funcs.push(Box::new(func));
        let ptr: *mut FuncObj = &mut **self.funcs.last_mut().unwrap();
        ptr
    }

    /// Spin until no FFI call is in flight, then collect. The counter is
    /// maintained by the enter/exit paths of the embedding API.
    #[cfg(feature = "parallel")]
    pub(crate) fn wait_for_in_flight(&self) {
        use std::sync::atomic::Ordering;
        while self.in_flight.load(Ordering::Acquire) > 0 {
            std::hint::spin_loop();
        }
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        crate::jit::jit_free(self);
    }
}
