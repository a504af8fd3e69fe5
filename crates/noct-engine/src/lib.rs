//! Noct VM Core Runtime
//!
//! This crate provides the execution substrate for the Noct scripting
//! language:
//! - **Value model**: a 16-byte tagged value with six variants (`vm::value`)
//! - **Object model**: string/array/dictionary/function heap objects with
//!   GC headers and copy-on-resize forwarding (`vm::object`)
//! - **GC**: a generational, exact collector with young collection,
//!   full mark-sweep, and sliding compaction (`vm::gc`)
//! - **Interpreter**: a fetch-decode-dispatch loop over the register-style
//!   instruction set (`vm::interp`)
//! - **JIT**: per-architecture template code generators sharing the
//!   interpreter's execution helpers (`jit`, behind the `jit` feature)
//! - **Embedding API**: VM/environment lifecycle, registration, calls,
//!   pinning, and diagnostics (`vm`)
//!
//! # Example
//!
//! ```rust,ignore
//! use noct_bytecode::{BytecodeEncoder, FunctionImage, FunctionRecord};
//! use noct_engine::{Value, Vm, VmOptions};
//!
//! let mut enc = BytecodeEncoder::new();
//! enc.iconst(0, 42);
//! let image = FunctionImage {
//!     functions: vec![FunctionRecord {
//!         name: "main".into(),
//!         file_name: "main.nc".into(),
//!         params: vec![],
//!         tmpvar_count: 1,
//!         body: enc.finish(),
//!     }],
//! };
//!
//! let mut vm = Vm::new(VmOptions::default());
//! let env = vm.default_env();
//! env.register_bytecode(&image.to_bytes()).unwrap();
//! let ret = env.enter_vm("main", &[]).unwrap();
//! assert_eq!(ret.as_int(), Some(42));
//! ```

#![warn(rust_2018_idioms)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::not_unsafe_ptr_arg_deref)]
#![allow(clippy::too_many_arguments)]

pub mod jit;
pub mod vm;

pub use vm::error::{ErrorKind, VmError};
pub use vm::frame::Env;
pub use vm::value::{Value, ValueType};
pub use vm::{GcStats, NativeFn, SourceCompiler, Vm, VmOptions};
