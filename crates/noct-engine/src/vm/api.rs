//! Embedding API
//!
//! The host-facing surface, exposed as methods on [`Env`]: registration,
//! entry, value construction and access, container operations, pinning,
//! GC control, and diagnostics. Native functions registered through
//! [`Env::register_cfunc`] receive the same `&mut Env` and use the
//! argument/return helpers at the bottom of this module.
//!
//! Any value a native function holds across a call back into the VM
//! (including any allocation) must be pinned so the collector can see and
//! rewrite it; see [`Env::pin_local`] and [`Env::pin_global`].

use crate::vm::error::ErrorKind;
use crate::vm::exec;
use crate::vm::frame::{Env, GLOBAL_PIN_MAX, LOCAL_PIN_MAX};
use crate::vm::gc::collect;
use crate::vm::object::{self, ArrayObj, DictObj, FuncObj, GcHeader, NativeFn, ObjKind};
use crate::vm::value::{Value, ValueType};
use crate::vm::error::VmError;
use noct_bytecode::{verify_function, FunctionRecord, ImageReader, ARG_MAX};
use std::fmt;

impl Env {
    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Compile `source` with the installed compiler and register the
    /// resulting functions.
    pub fn register_source(&mut self, file_name: &str, source: &str) -> Result<(), VmError> {
        let vm = self.vm();
        let mut compiler = match vm.compiler.take() {
            Some(compiler) => compiler,
            None => {
                return Err(VmError::new(
                    ErrorKind::Compile,
                    "No compiler installed for source registration.",
                ))
            }
        };
        let result = compiler.compile(file_name, source);
        self.vm().compiler = Some(compiler);
        let image = result.map_err(|message| VmError::new(ErrorKind::Compile, message))?;
        self.register_bytecode(&image)
    }

    /// Parse, verify, and install a byte image. Installation is
    /// all-or-nothing: a malformed record rejects the whole image before
    /// any function is bound.
    pub fn register_bytecode(&mut self, data: &[u8]) -> Result<(), VmError> {
        let image = ImageReader::parse(data)
            .map_err(|err| VmError::new(ErrorKind::BrokenBytecode, err.to_string()))?;
        for func in &image.functions {
            verify_function(&func.body, func.tmpvar_count.max(1))
                .map_err(|err| VmError::new(ErrorKind::BrokenBytecode, err.to_string()))?;
        }
        for record in image.functions {
            self.install_function(record);
        }
        Ok(())
    }

    fn install_function(&mut self, record: FunctionRecord) {
        let vm = self.vm();
        let name = record.name.clone();
        let func = vm.register_func(FuncObj {
            head: func_header(),
            name: record.name,
            params: record.params,
            file_name: record.file_name,
            bytecode: record.body,
            tmpvar_count: record.tmpvar_count.max(1),
            call_count: 0,
            jit_code: None,
            native: None,
        });
        vm.globals.set_by_name(&name, Value::func(func));
    }

    /// Register a native function and bind it as a global. The returned
    /// value is the function, callable through [`Env::call`].
    pub fn register_cfunc(
        &mut self,
        name: &str,
        params: &[&str],
        cfunc: NativeFn,
    ) -> Result<Value, VmError> {
        if params.len() > ARG_MAX {
            return Err(VmError::new(ErrorKind::Api, "Too many parameters."));
        }
        let vm = self.vm();
        let func = vm.register_func(FuncObj {
            head: func_header(),
            name: name.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            file_name: String::new(),
            bytecode: Vec::new(),
            tmpvar_count: (params.len() as u16).max(1),
            call_count: 0,
            jit_code: None,
            native: Some(cfunc),
        });
        vm.globals.set_by_name(name, Value::func(func));
        Ok(Value::func(func))
    }

    /// Bind a function into the intrinsic method table consulted by
    /// THISCALL before the receiver dictionary.
    pub fn register_intrinsic_method(&mut self, name: &str, func: Value) -> Result<(), VmError> {
        let func_obj = func
            .as_func_obj()
            .ok_or_else(|| VmError::new(ErrorKind::Type, "Not a function."))?;
        self.vm().intrinsics.insert(name.to_string(), func_obj);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Entry
    // -----------------------------------------------------------------------

    /// Resolve a global function by name and call it. On success the
    /// error state is untouched; on failure the error accessors describe
    /// the first fault.
    pub fn enter_vm(&mut self, func_name: &str, args: &[Value]) -> Result<Value, VmError> {
        self.commit_jit();
        self.ffi_enter();
        let mut ret = Value::zero();
        let ok = exec::call_with_name(self, func_name, args, &mut ret);
        self.ffi_exit();
        if ok {
            Ok(ret)
        } else {
            Err(self.vm_error())
        }
    }

    /// Call a function value directly.
    pub fn call(&mut self, func: Value, args: &[Value]) -> Result<Value, VmError> {
        let func_obj = func
            .as_func_obj()
            .ok_or_else(|| VmError::new(ErrorKind::Type, "Not a function."))?;
        self.commit_jit();
        self.ffi_enter();
        let mut ret = Value::zero();
        let ok = exec::call_func(self, func_obj, args, &mut ret);
        self.ffi_exit();
        if ok {
            Ok(ret)
        } else {
            Err(self.vm_error())
        }
    }

    fn commit_jit(&mut self) {
        let vm = self.vm();
        if vm.jit.dirty {
            crate::jit::jit_commit(vm);
        }
    }

    #[inline]
    fn ffi_enter(&mut self) {
        #[cfg(feature = "parallel")]
        self.vm()
            .in_flight
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    }

    #[inline]
    fn ffi_exit(&mut self) {
        #[cfg(feature = "parallel")]
        self.vm()
            .in_flight
            .fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
    }

    // -----------------------------------------------------------------------
    // Value construction and access
    // -----------------------------------------------------------------------

    /// Make a string value from UTF-8 text.
    pub fn make_string(&mut self, text: &str) -> Result<Value, VmError> {
        let obj = object::alloc_string(self, text.as_bytes(), None);
        if obj.is_null() {
            return Err(self.vm_error());
        }
        Ok(Value::string(obj))
    }

    /// Make a string value from format arguments.
    pub fn make_string_format(&mut self, args: fmt::Arguments<'_>) -> Result<Value, VmError> {
        self.make_string(&args.to_string())
    }

    /// Make an empty array value.
    pub fn make_empty_array(&mut self) -> Result<Value, VmError> {
        let obj = object::alloc_array(self);
        if obj.is_null() {
            return Err(self.vm_error());
        }
        Ok(Value::array(obj))
    }

    /// Make an empty dictionary value.
    pub fn make_empty_dict(&mut self) -> Result<Value, VmError> {
        let obj = object::alloc_dict(self);
        if obj.is_null() {
            return Err(self.vm_error());
        }
        Ok(Value::dict(obj))
    }

    /// Integer payload of an `Int` value.
    pub fn get_int(&mut self, val: &Value) -> Result<i32, VmError> {
        val.as_int()
            .ok_or_else(|| self.type_error("Value is not an integer."))
    }

    /// Float payload of a `Float` value.
    pub fn get_float(&mut self, val: &Value) -> Result<f32, VmError> {
        val.as_float()
            .ok_or_else(|| self.type_error("Value is not a float."))
    }

    /// Borrow the content of a `String` value. The borrow is valid while
    /// the value is kept alive (slot, pin, or global); string buffers do
    /// not move under compaction.
    pub fn get_string<'a>(&mut self, val: &'a Value) -> Result<std::borrow::Cow<'a, str>, VmError> {
        match val.as_string_obj() {
            Some(obj) => Ok(unsafe { (*obj).as_str() }),
            None => Err(self.type_error("Value is not a string.")),
        }
    }

    fn type_error(&mut self, message: &str) -> VmError {
        self.set_error(ErrorKind::Type, format_args!("{message}"));
        self.vm_error()
    }

    // -----------------------------------------------------------------------
    // Array API
    // -----------------------------------------------------------------------

    fn expect_array(&mut self, val: &Value) -> Result<*mut ArrayObj, VmError> {
        val.as_array_obj()
            .ok_or_else(|| self.type_error("Not an array."))
    }

    /// Element count of an array value.
    pub fn get_array_size(&mut self, val: &Value) -> Result<u32, VmError> {
        let arr = self.expect_array(val)?;
        Ok(unsafe { (*ArrayObj::latest(arr)).size as u32 })
    }

    /// Read one element of an array value.
    pub fn get_array_elem(&mut self, val: &Value, index: u32) -> Result<Value, VmError> {
        let arr = self.expect_array(val)?;
        let mut out = Value::zero();
        if !object::get_array_elem(self, arr, index as i32, &mut out) {
            return Err(self.vm_error());
        }
        Ok(out)
    }

    /// Write one element, growing the array when the index is past the
    /// end. `val` must be GC-visible (pinned, a slot, or a global).
    pub fn set_array_elem(&mut self, val: &mut Value, index: u32, elem: &Value) -> Result<(), VmError> {
        self.expect_array(val)?;
        let ok = unsafe {
            object::set_array_elem(self, &mut val.payload.array, index as i32, elem)
        };
        if ok {
            Ok(())
        } else {
            Err(self.vm_error())
        }
    }

    /// Resize an array value. `val` must be GC-visible.
    pub fn resize_array(&mut self, val: &mut Value, size: u32) -> Result<(), VmError> {
        self.expect_array(val)?;
        let ok = unsafe { object::resize_array(self, &mut val.payload.array, size as usize) };
        if ok {
            Ok(())
        } else {
            Err(self.vm_error())
        }
    }

    /// Shallow copy of an array value. `src` must be GC-visible.
    pub fn make_array_copy(&mut self, src: &mut Value) -> Result<Value, VmError> {
        self.expect_array(src)?;
        let copy = object::copy_array(self, src);
        if copy.is_null() {
            return Err(self.vm_error());
        }
        Ok(Value::array(copy))
    }

    // -----------------------------------------------------------------------
    // Dictionary API
    // -----------------------------------------------------------------------

    fn expect_dict(&mut self, val: &Value) -> Result<*mut DictObj, VmError> {
        val.as_dict_obj()
            .ok_or_else(|| self.type_error("Not a dictionary."))
    }

    /// Entry count of a dictionary value.
    pub fn get_dict_size(&mut self, val: &Value) -> Result<u32, VmError> {
        let dict = self.expect_dict(val)?;
        Ok(unsafe { (*DictObj::latest(dict)).size as u32 })
    }

    /// Whether `key` is present.
    pub fn check_dict_key(&mut self, val: &Value, key: &str) -> Result<bool, VmError> {
        let dict = self.expect_dict(val)?;
        Ok(object::check_dict_key(dict, key.as_bytes()))
    }

    /// The i-th key in insertion order.
    pub fn get_dict_key_by_index(&mut self, val: &Value, index: u32) -> Result<Value, VmError> {
        let dict = self.expect_dict(val)?;
        let mut out = Value::zero();
        if !object::get_dict_key_by_index(self, dict, index as i32, &mut out) {
            return Err(self.vm_error());
        }
        Ok(out)
    }

    /// The i-th value in insertion order.
    pub fn get_dict_value_by_index(&mut self, val: &Value, index: u32) -> Result<Value, VmError> {
        let dict = self.expect_dict(val)?;
        let mut out = Value::zero();
        if !object::get_dict_value_by_index(self, dict, index as i32, &mut out) {
            return Err(self.vm_error());
        }
        Ok(out)
    }

    /// Look up `key`; a missing key is an error.
    pub fn get_dict_elem(&mut self, val: &Value, key: &str) -> Result<Value, VmError> {
        let dict = self.expect_dict(val)?;
        let mut out = Value::zero();
        let hash = noct_bytecode::string_hash(key.as_bytes());
        if !object::get_dict_elem(self, dict, key.as_bytes(), hash, &mut out) {
            return Err(self.vm_error());
        }
        Ok(out)
    }

    /// Insert or replace `key`. `val` must be GC-visible.
    pub fn set_dict_elem(&mut self, val: &mut Value, key: &str, elem: &Value) -> Result<(), VmError> {
        self.expect_dict(val)?;
        let hash = noct_bytecode::string_hash(key.as_bytes());
        let ok = unsafe {
            object::set_dict_elem(self, &mut val.payload.dict, key.as_bytes(), hash, elem)
        };
        if ok {
            Ok(())
        } else {
            Err(self.vm_error())
        }
    }

    /// Remove `key`, faulting when it is missing. Single-threaded build
    /// only; the parallel build compiles this out.
    #[cfg(not(feature = "parallel"))]
    pub fn remove_dict_elem(&mut self, val: &Value, key: &str) -> Result<(), VmError> {
        let dict = self.expect_dict(val)?;
        if !object::remove_dict_elem(self, dict, key.as_bytes()) {
            return Err(self.vm_error());
        }
        Ok(())
    }

    /// Shallow copy of a dictionary value. `src` must be GC-visible.
    pub fn make_dict_copy(&mut self, src: &mut Value) -> Result<Value, VmError> {
        self.expect_dict(src)?;
        let copy = object::copy_dict(self, src);
        if copy.is_null() {
            return Err(self.vm_error());
        }
        Ok(Value::dict(copy))
    }

    // -----------------------------------------------------------------------
    // Globals
    // -----------------------------------------------------------------------

    /// Whether a global binding exists.
    pub fn check_global(&mut self, name: &str) -> bool {
        self.vm().globals.get_by_name(name).is_some()
    }

    /// Read a global binding.
    pub fn get_global(&mut self, name: &str) -> Result<Value, VmError> {
        match self.vm().globals.get_by_name(name) {
            Some(entry) => Ok(entry.value),
            None => {
                self.set_error(
                    ErrorKind::Name,
                    format_args!("Symbol \"{name}\" not found."),
                );
                Err(self.vm_error())
            }
        }
    }

    /// Write (or create) a global binding.
    pub fn set_global(&mut self, name: &str, val: &Value) {
        self.vm().globals.set_by_name(name, *val);
    }

    // -----------------------------------------------------------------------
    // Native-function argument and return helpers
    // -----------------------------------------------------------------------

    /// Read argument `index` of the current native call.
    pub fn get_arg(&mut self, index: u32) -> Value {
        match self.current_frame() {
            Some(frame) if (index as i32) < frame.tmpvar_size => unsafe {
                *frame.slot(index as usize)
            },
            _ => Value::zero(),
        }
    }

    /// Set the return value of the current native call.
    pub fn set_return(&mut self, val: &Value) {
        if let Some(frame) = self.current_frame() {
            unsafe {
                *frame.slot(0) = *val;
            }
        }
    }

    fn arg_error(&mut self, index: u32, expected: &str) -> VmError {
        let param = self
            .current_frame()
            .map(|frame| unsafe {
                (&(*frame.func)
                    .params)
                    .get(index as usize)
                    .cloned()
                    .unwrap_or_default()
            })
            .unwrap_or_default();
        self.set_error(
            ErrorKind::Type,
            format_args!("Argument ({index}: {param}) not {expected}."),
        );
        self.vm_error()
    }

    /// Argument `index`, checked to be an integer.
    pub fn get_arg_int(&mut self, index: u32) -> Result<i32, VmError> {
        let val = self.get_arg(index);
        val.as_int().ok_or_else(|| self.arg_error(index, "an integer"))
    }

    /// Argument `index`, checked to be a float.
    pub fn get_arg_float(&mut self, index: u32) -> Result<f32, VmError> {
        let val = self.get_arg(index);
        val.as_float().ok_or_else(|| self.arg_error(index, "a float"))
    }

    /// Argument `index`, checked to be a string; returns its content.
    pub fn get_arg_string(&mut self, index: u32) -> Result<String, VmError> {
        let val = self.get_arg(index);
        match val.as_string_obj() {
            Some(obj) => Ok(unsafe { (*obj).as_str().into_owned() }),
            None => Err(self.arg_error(index, "a string")),
        }
    }

    /// Argument `index`, checked to be an array.
    pub fn get_arg_array(&mut self, index: u32) -> Result<Value, VmError> {
        let val = self.get_arg(index);
        if val.value_type() == ValueType::Array {
            Ok(val)
        } else {
            Err(self.arg_error(index, "an array"))
        }
    }

    /// Argument `index`, checked to be a dictionary.
    pub fn get_arg_dict(&mut self, index: u32) -> Result<Value, VmError> {
        let val = self.get_arg(index);
        if val.value_type() == ValueType::Dict {
            Ok(val)
        } else {
            Err(self.arg_error(index, "a dictionary"))
        }
    }

    /// Argument `index`, checked to be a function.
    pub fn get_arg_func(&mut self, index: u32) -> Result<Value, VmError> {
        let val = self.get_arg(index);
        if val.value_type() == ValueType::Func {
            Ok(val)
        } else {
            Err(self.arg_error(index, "a function"))
        }
    }

    /// Return an integer from the current native call.
    pub fn set_return_int(&mut self, i: i32) {
        self.set_return(&Value::int(i));
    }

    /// Return a float from the current native call.
    pub fn set_return_float(&mut self, f: f32) {
        self.set_return(&Value::float(f));
    }

    /// Return a string from the current native call.
    pub fn set_return_string(&mut self, text: &str) -> Result<(), VmError> {
        let val = self.make_string(text)?;
        self.set_return(&val);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pinning
    // -----------------------------------------------------------------------

    /// Declare a host-owned value as a root for the VM's lifetime (until
    /// unpinned). The location must stay valid while pinned; the
    /// collector reads and rewrites it.
    pub fn pin_global(&mut self, val: *mut Value) -> Result<(), VmError> {
        let vm = self.vm();
        if vm.pinned.len() >= GLOBAL_PIN_MAX {
            return Err(VmError::new(ErrorKind::Api, "Too many pinned values."));
        }
        vm.pinned.push(val);
        Ok(())
    }

    /// Remove a global pin. Unpinning a value that is not pinned is an
    /// error.
    pub fn unpin_global(&mut self, val: *mut Value) -> Result<(), VmError> {
        let vm = self.vm();
        match vm.pinned.iter().position(|&p| p == val) {
            Some(pos) => {
                vm.pinned.swap_remove(pos);
                Ok(())
            }
            None => Err(VmError::new(ErrorKind::Api, "Value is not pinned.")),
        }
    }

    /// Declare native-code locals as roots for the duration of the
    /// current frame. The pins drop automatically when the native
    /// function returns.
    pub fn pin_local(&mut self, vals: &[*mut Value]) -> Result<(), VmError> {
        let frame = match self.current_frame() {
            Some(frame) => frame,
            None => return Err(VmError::new(ErrorKind::Api, "No active frame.")),
        };
        if frame.pinned_count as usize + vals.len() > LOCAL_PIN_MAX {
            return Err(VmError::new(ErrorKind::Api, "Too many pinned values."));
        }
        for &val in vals {
            frame.pinned[frame.pinned_count as usize] = val;
            frame.pinned_count += 1;
        }
        Ok(())
    }

    /// Remove local pins. Unpinning a value that is not pinned is an
    /// error.
    pub fn unpin_local(&mut self, vals: &[*mut Value]) -> Result<(), VmError> {
        let frame = match self.current_frame() {
            Some(frame) => frame,
            None => return Err(VmError::new(ErrorKind::Api, "No active frame.")),
        };
        for &val in vals {
            let count = frame.pinned_count as usize;
            match frame.pinned[..count].iter().position(|&p| p == val) {
                Some(pos) => {
                    frame.pinned[pos] = frame.pinned[count - 1];
                    frame.pinned_count -= 1;
                }
                None => return Err(VmError::new(ErrorKind::Api, "Value is not pinned.")),
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // GC control and diagnostics
    // -----------------------------------------------------------------------

    /// Collect the young generations.
    pub fn fast_gc(&mut self) {
        collect::fast_gc(self.vm());
    }

    /// Mark-sweep every generation.
    pub fn full_gc(&mut self) {
        collect::full_gc(self.vm());
    }

    /// Full collection plus sliding compaction of tenure.
    pub fn compact_gc(&mut self) {
        collect::compact_gc(self.vm());
    }

    /// Live heap bytes.
    pub fn get_heap_usage(&mut self) -> usize {
        self.vm().gc.heap_usage()
    }

    /// Record an error from a native function. The message becomes
    /// visible through the error accessors after the call fails.
    pub fn error(&mut self, kind: ErrorKind, args: fmt::Arguments<'_>) {
        self.set_error(kind, args);
    }

    /// Record the canonical out-of-memory error.
    pub fn out_of_memory(&mut self) {
        self.set_error(ErrorKind::OutOfMemory, format_args!("Out-of-memory."));
    }
}

fn func_header() -> GcHeader {
    GcHeader {
        kind: ObjKind::Func as u8,
        gen: crate::vm::object::Generation::Large as u8,
        marked: false,
        age: 0,
        size: std::mem::size_of::<FuncObj>() as u32,
        forward: std::ptr::null_mut(),
    }
}
