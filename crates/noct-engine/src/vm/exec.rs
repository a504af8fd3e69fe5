//! Execution helpers
//!
//! One helper per non-trivial opcode, shared verbatim by the interpreter
//! and the generated code: the JIT marshals the same argument lists and
//! calls through these `extern "C"` entry points. A helper reads the
//! current frame's slots by index, performs the type-directed operation,
//! and writes the result; returning `false` means the helper has recorded
//! the error state on the environment.

use crate::vm::error::ErrorKind;
use crate::vm::frame::Env;
use crate::vm::interp;
use crate::vm::object::{self, ArrayObj, DictObj, FuncObj};
use crate::vm::value::{Value, ValueType};
use crate::vm_error;
use noct_bytecode::{string_hash, ARG_MAX};
use once_cell::sync::Lazy;

/// Hash of the special `length` field selector.
static LENGTH_HASH: Lazy<u32> = Lazy::new(|| string_hash(b"length"));

#[inline]
unsafe fn slot(env: *mut Env, index: i32) -> *mut Value {
    (*(*env).frame).slot(index as usize)
}

/// Format a value the way string concatenation renders operands: `%d`
/// for integers, `%f` for floats.
fn format_int(i: i32) -> String {
    format!("{i}")
}

fn format_float(f: f32) -> String {
    format!("{f:.6}")
}

unsafe fn string_content(value: &Value) -> String {
    let obj = &*value.as_string_obj().expect("string operand");
    String::from_utf8_lossy(obj.bytes()).into_owned()
}

unsafe fn write_string(env: *mut Env, dst: *mut Value, content: &str) -> bool {
    let obj = object::alloc_string(env, content.as_bytes(), None);
    if obj.is_null() {
        return false;
    }
    *dst = Value::string(obj);
    true
}

// ---------------------------------------------------------------------------
// Arithmetic
// ---------------------------------------------------------------------------

/// ADD: overloaded over the `{Int, Float, String}` lattice. Mixed
/// numerics widen to float; any string operand produces a formatted
/// concatenation. Integer addition wraps.
pub extern "C" fn add_helper(env: *mut Env, dst: i32, src1: i32, src2: i32) -> bool {
    unsafe {
        let a = *slot(env, src1);
        let b = *slot(env, src2);
        let out = slot(env, dst);
        match (a.value_type(), b.value_type()) {
            (ValueType::Int, ValueType::Int) => {
                *out = Value::int(a.raw_int().wrapping_add(b.raw_int()));
            }
            (ValueType::Int, ValueType::Float) => {
                *out = Value::float(a.raw_int() as f32 + b.as_float().unwrap());
            }
            (ValueType::Float, ValueType::Int) => {
                *out = Value::float(a.as_float().unwrap() + b.raw_int() as f32);
            }
            (ValueType::Float, ValueType::Float) => {
                *out = Value::float(a.as_float().unwrap() + b.as_float().unwrap());
            }
            (ValueType::Int, ValueType::String) => {
                let text = format!("{}{}", format_int(a.raw_int()), string_content(&b));
                return write_string(env, out, &text);
            }
            (ValueType::Float, ValueType::String) => {
                let text = format!("{}{}", format_float(a.as_float().unwrap()), string_content(&b));
                return write_string(env, out, &text);
            }
            (ValueType::String, ValueType::Int) => {
                let text = format!("{}{}", string_content(&a), format_int(b.raw_int()));
                return write_string(env, out, &text);
            }
            (ValueType::String, ValueType::Float) => {
                let text = format!("{}{}", string_content(&a), format_float(b.as_float().unwrap()));
                return write_string(env, out, &text);
            }
            (ValueType::String, ValueType::String) => {
                let text = format!("{}{}", string_content(&a), string_content(&b));
                return write_string(env, out, &text);
            }
            _ => {
                vm_error!(env, ErrorKind::Type, "Value is not a number or a string.");
                return false;
            }
        }
        true
    }
}

macro_rules! numeric_binary_helper {
    ($name:ident, $int_op:ident, $float_op:tt) => {
        /// Numeric operation with Int/Float widening; integer results wrap.
        pub extern "C" fn $name(env: *mut Env, dst: i32, src1: i32, src2: i32) -> bool {
            unsafe {
                let a = *slot(env, src1);
                let b = *slot(env, src2);
                let out = slot(env, dst);
                match (a.value_type(), b.value_type()) {
                    (ValueType::Int, ValueType::Int) => {
                        *out = Value::int(a.raw_int().$int_op(b.raw_int()));
                    }
                    (ValueType::Int, ValueType::Float) => {
                        *out = Value::float((a.raw_int() as f32) $float_op b.as_float().unwrap());
                    }
                    (ValueType::Float, ValueType::Int) => {
                        *out = Value::float(a.as_float().unwrap() $float_op (b.raw_int() as f32));
                    }
                    (ValueType::Float, ValueType::Float) => {
                        *out = Value::float(a.as_float().unwrap() $float_op b.as_float().unwrap());
                    }
                    _ => {
                        vm_error!(env, ErrorKind::Type, "Value is not a number.");
                        return false;
                    }
                }
                true
            }
        }
    };
}

numeric_binary_helper!(sub_helper, wrapping_sub, -);
numeric_binary_helper!(mul_helper, wrapping_mul, *);

/// DIV: numeric with widening; a zero divisor of either kind faults.
pub extern "C" fn div_helper(env: *mut Env, dst: i32, src1: i32, src2: i32) -> bool {
    unsafe {
        let a = *slot(env, src1);
        let b = *slot(env, src2);
        let out = slot(env, dst);
        match (a.value_type(), b.value_type()) {
            (ValueType::Int, ValueType::Int) => {
                if b.raw_int() == 0 {
                    vm_error!(env, ErrorKind::DivisionByZero, "Division by zero.");
                    return false;
                }
                *out = Value::int(a.raw_int().wrapping_div(b.raw_int()));
            }
            (ValueType::Int, ValueType::Float) => {
                if b.as_float().unwrap() == 0.0 {
                    vm_error!(env, ErrorKind::DivisionByZero, "Division by zero.");
                    return false;
                }
                *out = Value::float(a.raw_int() as f32 / b.as_float().unwrap());
            }
            (ValueType::Float, ValueType::Int) => {
                if b.raw_int() == 0 {
                    vm_error!(env, ErrorKind::DivisionByZero, "Division by zero.");
                    return false;
                }
                *out = Value::float(a.as_float().unwrap() / b.raw_int() as f32);
            }
            (ValueType::Float, ValueType::Float) => {
                if b.as_float().unwrap() == 0.0 {
                    vm_error!(env, ErrorKind::DivisionByZero, "Division by zero.");
                    return false;
                }
                *out = Value::float(a.as_float().unwrap() / b.as_float().unwrap());
            }
            _ => {
                vm_error!(env, ErrorKind::Type, "Value is not a number.");
                return false;
            }
        }
        true
    }
}

/// MOD: integer only; a zero modulus faults like division.
pub extern "C" fn mod_helper(env: *mut Env, dst: i32, src1: i32, src2: i32) -> bool {
    unsafe {
        let a = *slot(env, src1);
        let b = *slot(env, src2);
        let out = slot(env, dst);
        match (a.as_int(), b.as_int()) {
            (Some(x), Some(y)) => {
                if y == 0 {
                    vm_error!(env, ErrorKind::DivisionByZero, "Division by zero.");
                    return false;
                }
                *out = Value::int(x.wrapping_rem(y));
                true
            }
            _ => {
                vm_error!(env, ErrorKind::Type, "Value is not an integer.");
                false
            }
        }
    }
}

macro_rules! integer_binary_helper {
    ($name:ident, $op:tt) => {
        /// Integer-only bitwise operation.
        pub extern "C" fn $name(env: *mut Env, dst: i32, src1: i32, src2: i32) -> bool {
            unsafe {
                let a = *slot(env, src1);
                let b = *slot(env, src2);
                let out = slot(env, dst);
                match (a.as_int(), b.as_int()) {
                    (Some(x), Some(y)) => {
                        *out = Value::int(x $op y);
                        true
                    }
                    _ => {
                        vm_error!(env, ErrorKind::Type, "Value is not an integer.");
                        false
                    }
                }
            }
        }
    };
}

integer_binary_helper!(and_helper, &);
integer_binary_helper!(or_helper, |);
integer_binary_helper!(xor_helper, ^);

macro_rules! shift_helper {
    ($name:ident, $op:tt) => {
        /// Integer shift. Counts outside 0..32 produce `Int(0)` rather
        /// than inheriting host behavior.
        pub extern "C" fn $name(env: *mut Env, dst: i32, src1: i32, src2: i32) -> bool {
            unsafe {
                let a = *slot(env, src1);
                let b = *slot(env, src2);
                let out = slot(env, dst);
                match (a.as_int(), b.as_int()) {
                    (Some(x), Some(count)) => {
                        *out = if (0..32).contains(&count) {
                            Value::int(x $op count)
                        } else {
                            Value::int(0)
                        };
                        true
                    }
                    _ => {
                        vm_error!(env, ErrorKind::Type, "Value is not an integer.");
                        false
                    }
                }
            }
        }
    };
}

shift_helper!(shl_helper, <<);
shift_helper!(shr_helper, >>);

/// NEG: arithmetic negation of an integer or float.
pub extern "C" fn neg_helper(env: *mut Env, dst: i32, src: i32) -> bool {
    unsafe {
        let a = *slot(env, src);
        let out = slot(env, dst);
        match a.value_type() {
            ValueType::Int => {
                *out = Value::int(a.raw_int().wrapping_neg());
                true
            }
            ValueType::Float => {
                *out = Value::float(-a.as_float().unwrap());
                true
            }
            _ => {
                vm_error!(env, ErrorKind::Type, "Value is not a number.");
                false
            }
        }
    }
}

/// NOT: logical negation of an integer.
pub extern "C" fn not_helper(env: *mut Env, dst: i32, src: i32) -> bool {
    unsafe {
        let a = *slot(env, src);
        let out = slot(env, dst);
        match a.as_int() {
            Some(x) => {
                *out = Value::int(if x == 0 { 1 } else { 0 });
                true
            }
            None => {
                vm_error!(env, ErrorKind::Type, "Value is not an integer.");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

macro_rules! ordering_helper {
    ($name:ident, $op:tt) => {
        /// Ordering comparison: numeric with widening, or lexicographic
        /// byte order for string/string. The result is `Int(0)`/`Int(1)`.
        pub extern "C" fn $name(env: *mut Env, dst: i32, src1: i32, src2: i32) -> bool {
            unsafe {
                let a = *slot(env, src1);
                let b = *slot(env, src2);
                let out = slot(env, dst);
                let result = match (a.value_type(), b.value_type()) {
                    (ValueType::Int, ValueType::Int) => a.raw_int() $op b.raw_int(),
                    (ValueType::Int, ValueType::Float) => {
                        (a.raw_int() as f32) $op b.as_float().unwrap()
                    }
                    (ValueType::Float, ValueType::Int) => {
                        a.as_float().unwrap() $op (b.raw_int() as f32)
                    }
                    (ValueType::Float, ValueType::Float) => {
                        a.as_float().unwrap() $op b.as_float().unwrap()
                    }
                    (ValueType::String, ValueType::String) => {
                        let lhs = &*a.as_string_obj().unwrap();
                        let rhs = &*b.as_string_obj().unwrap();
                        lhs.bytes() $op rhs.bytes()
                    }
                    (ValueType::String, _) => {
                        vm_error!(env, ErrorKind::Type, "Value is not a string.");
                        return false;
                    }
                    _ => {
                        vm_error!(env, ErrorKind::Type, "Value is not a number or a string.");
                        return false;
                    }
                };
                *out = Value::int(if result { 1 } else { 0 });
                true
            }
        }
    };
}

ordering_helper!(lt_helper, <);
ordering_helper!(lte_helper, <=);
ordering_helper!(gt_helper, >);
ordering_helper!(gte_helper, >=);

unsafe fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.value_type(), b.value_type()) {
        (ValueType::Int, ValueType::Int) => a.raw_int() == b.raw_int(),
        (ValueType::Int, ValueType::Float) => (a.raw_int() as f32) == b.as_float().unwrap(),
        (ValueType::Float, ValueType::Int) => a.as_float().unwrap() == (b.raw_int() as f32),
        (ValueType::Float, ValueType::Float) => a.as_float().unwrap() == b.as_float().unwrap(),
        (ValueType::String, ValueType::String) => {
            // Hash-first: cache both hashes, compare them before bytes.
            let lhs = &mut *a.as_string_obj().unwrap();
            let rhs = &mut *b.as_string_obj().unwrap();
            lhs.cache_hash();
            rhs.cache_hash();
            lhs.len == rhs.len && lhs.hash == rhs.hash && lhs.bytes() == rhs.bytes()
        }
        _ => false,
    }
}

/// EQ: total equality. Cross-type comparisons yield 0 rather than fault.
pub extern "C" fn eq_helper(env: *mut Env, dst: i32, src1: i32, src2: i32) -> bool {
    unsafe {
        let a = *slot(env, src1);
        let b = *slot(env, src2);
        let equal = values_equal(&a, &b);
        *slot(env, dst) = Value::int(if equal { 1 } else { 0 });
        true
    }
}

/// NEQ: total inequality.
pub extern "C" fn neq_helper(env: *mut Env, dst: i32, src1: i32, src2: i32) -> bool {
    unsafe {
        let a = *slot(env, src1);
        let b = *slot(env, src2);
        let equal = values_equal(&a, &b);
        *slot(env, dst) = Value::int(if equal { 0 } else { 1 });
        true
    }
}

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

/// LOADARRAY: indexed read from an array (Int subscript) or a dictionary
/// (String subscript).
pub extern "C" fn load_array_helper(env: *mut Env, dst: i32, container: i32, subscript: i32) -> bool {
    unsafe {
        let container_val = *slot(env, container);
        let subscript_val = *slot(env, subscript);
        let mut result = Value::zero();
        match container_val.value_type() {
            ValueType::Array => {
                let index = match subscript_val.as_int() {
                    Some(i) => i,
                    None => {
                        vm_error!(env, ErrorKind::Type, "Subscript not an integer.");
                        return false;
                    }
                };
                if !object::get_array_elem(env, container_val.as_array_obj().unwrap(), index, &mut result) {
                    return false;
                }
            }
            ValueType::Dict => {
                let key = match subscript_val.as_string_obj() {
                    Some(obj) => &mut *obj,
                    None => {
                        vm_error!(env, ErrorKind::Type, "Subscript not a string.");
                        return false;
                    }
                };
                let hash = key.cache_hash();
                let key_bytes = key.bytes().to_vec();
                if !object::get_dict_elem(env, container_val.as_dict_obj().unwrap(), &key_bytes, hash, &mut result) {
                    return false;
                }
            }
            _ => {
                vm_error!(env, ErrorKind::Type, "Not an array or a dictionary.");
                return false;
            }
        }
        *slot(env, dst) = result;
        true
    }
}

/// STOREARRAY: indexed write. Array writes past the end grow the array
/// with `Int(0)` fill; dictionary writes insert or replace.
pub extern "C" fn store_array_helper(env: *mut Env, container: i32, subscript: i32, value: i32) -> bool {
    unsafe {
        let container_slot = slot(env, container);
        let subscript_val = *slot(env, subscript);
        // The stored value is read through its slot, not copied: a grow
        // inside the store may collect, and the collector rewrites slots.
        let value_slot = slot(env, value) as *const Value;
        match (*container_slot).value_type() {
            ValueType::Array => {
                let index = match subscript_val.as_int() {
                    Some(i) => i,
                    None => {
                        vm_error!(env, ErrorKind::Type, "Subscript not an integer.");
                        return false;
                    }
                };
                object::set_array_elem(env, &mut (*container_slot).payload.array, index, value_slot)
            }
            ValueType::Dict => {
                let key = match subscript_val.as_string_obj() {
                    Some(obj) => &mut *obj,
                    None => {
                        vm_error!(env, ErrorKind::Type, "Subscript not a string.");
                        return false;
                    }
                };
                let hash = key.cache_hash();
                let key_bytes = key.bytes().to_vec();
                object::set_dict_elem(
                    env,
                    &mut (*container_slot).payload.dict,
                    &key_bytes,
                    hash,
                    value_slot,
                )
            }
            _ => {
                vm_error!(env, ErrorKind::Type, "Not an array or a dictionary.");
                false
            }
        }
    }
}

/// LEN: byte length for strings (excluding the terminator), element
/// count for arrays and dictionaries.
pub extern "C" fn len_helper(env: *mut Env, dst: i32, src: i32) -> bool {
    unsafe {
        let a = *slot(env, src);
        let out = slot(env, dst);
        match a.value_type() {
            ValueType::String => {
                let obj = &*a.as_string_obj().unwrap();
                *out = Value::int((obj.len - 1) as i32);
            }
            ValueType::Array => {
                let arr = ArrayObj::latest(a.as_array_obj().unwrap());
                *out = Value::int((*arr).size as i32);
            }
            ValueType::Dict => {
                let dict = DictObj::latest(a.as_dict_obj().unwrap());
                *out = Value::int((*dict).size as i32);
            }
            _ => {
                vm_error!(env, ErrorKind::Type, "Value is not a string, an array, or a dictionary.");
                return false;
            }
        }
        true
    }
}

/// GETDICTKEYBYINDEX: the i-th key in insertion order.
pub extern "C" fn get_dict_key_by_index_helper(env: *mut Env, dst: i32, dict: i32, subscript: i32) -> bool {
    unsafe {
        let dict_val = *slot(env, dict);
        let subscript_val = *slot(env, subscript);
        let dict_obj = match dict_val.as_dict_obj() {
            Some(obj) => obj,
            None => {
                vm_error!(env, ErrorKind::Type, "Not a dictionary.");
                return false;
            }
        };
        let index = match subscript_val.as_int() {
            Some(i) => i,
            None => {
                vm_error!(env, ErrorKind::Type, "Subscript not an integer.");
                return false;
            }
        };
        let mut result = Value::zero();
        if !object::get_dict_key_by_index(env, dict_obj, index, &mut result) {
            return false;
        }
        *slot(env, dst) = result;
        true
    }
}

/// GETDICTVALBYINDEX: the i-th value in insertion order.
pub extern "C" fn get_dict_val_by_index_helper(env: *mut Env, dst: i32, dict: i32, subscript: i32) -> bool {
    unsafe {
        let dict_val = *slot(env, dict);
        let subscript_val = *slot(env, subscript);
        let dict_obj = match dict_val.as_dict_obj() {
            Some(obj) => obj,
            None => {
                vm_error!(env, ErrorKind::Type, "Not a dictionary.");
                return false;
            }
        };
        let index = match subscript_val.as_int() {
            Some(i) => i,
            None => {
                vm_error!(env, ErrorKind::Type, "Subscript not an integer.");
                return false;
            }
        };
        let mut result = Value::zero();
        if !object::get_dict_value_by_index(env, dict_obj, index, &mut result) {
            return false;
        }
        *slot(env, dst) = result;
        true
    }
}

// ---------------------------------------------------------------------------
// Symbols and member access
// ---------------------------------------------------------------------------

unsafe fn operand_bytes<'a>(data: *const u8, len: u32) -> &'a [u8] {
    std::slice::from_raw_parts(data, len as usize)
}

/// LOADSYMBOL: read a global, hash first.
pub extern "C" fn load_symbol_helper(env: *mut Env, dst: i32, name: *const u8, len: u32, hash: u32) -> bool {
    unsafe {
        let name = operand_bytes(name, len);
        let vm = (*env).vm();
        match vm.globals.get(name, hash) {
            Some(entry) => {
                *slot(env, dst) = entry.value;
                true
            }
            None => {
                vm_error!(
                    env,
                    ErrorKind::Name,
                    "Symbol \"{}\" not found.",
                    String::from_utf8_lossy(name)
                );
                false
            }
        }
    }
}

/// STORESYMBOL: write (or create) a global.
pub extern "C" fn store_symbol_helper(env: *mut Env, name: *const u8, len: u32, hash: u32, src: i32) -> bool {
    unsafe {
        let name = operand_bytes(name, len);
        let value = *slot(env, src);
        let vm = (*env).vm();
        vm.globals
            .set(&String::from_utf8_lossy(name), hash, value);
        true
    }
}

/// LOADDOT: `container.field`, where the `length` field (hash-matched
/// first) reads the natural length of a string, array, or dictionary;
/// any other field requires a dictionary.
pub extern "C" fn load_dot_helper(env: *mut Env, dst: i32, dict: i32, field: *const u8, len: u32, hash: u32) -> bool {
    unsafe {
        let field = operand_bytes(field, len);
        let container = *slot(env, dict);

        if len == 6 && hash == *LENGTH_HASH && field == b"length" {
            match container.value_type() {
                ValueType::Dict => {
                    let obj = DictObj::latest(container.as_dict_obj().unwrap());
                    *slot(env, dst) = Value::int((*obj).size as i32);
                    return true;
                }
                ValueType::Array => {
                    let obj = ArrayObj::latest(container.as_array_obj().unwrap());
                    *slot(env, dst) = Value::int((*obj).size as i32);
                    return true;
                }
                ValueType::String => {
                    let obj = &*container.as_string_obj().unwrap();
                    *slot(env, dst) = Value::int((obj.len - 1) as i32);
                    return true;
                }
                _ => {}
            }
        }

        let dict_obj = match container.as_dict_obj() {
            Some(obj) => obj,
            None => {
                vm_error!(env, ErrorKind::Type, "Not a dictionary.");
                return false;
            }
        };
        let mut result = Value::zero();
        if !object::get_dict_elem(env, dict_obj, field, hash, &mut result) {
            return false;
        }
        *slot(env, dst) = result;
        true
    }
}

/// STOREDOT: `dict.field = src`.
pub extern "C" fn store_dot_helper(env: *mut Env, dict: i32, field: *const u8, len: u32, hash: u32, src: i32) -> bool {
    unsafe {
        let field = operand_bytes(field, len);
        let dict_slot = slot(env, dict);
        if (*dict_slot).value_type() != ValueType::Dict {
            vm_error!(env, ErrorKind::Type, "Not a dictionary.");
            return false;
        }
        let value_slot = slot(env, src) as *const Value;
        object::set_dict_elem(env, &mut (*dict_slot).payload.dict, field, hash, value_slot)
    }
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

/// Invoke `func` with `args`: push a frame, copy the arguments into its
/// leading slots, dispatch to native code, JIT code, or the interpreter,
/// and copy slot 0 out as the return value.
pub(crate) fn call_func(env: *mut Env, func: *mut FuncObj, args: &[Value], ret: &mut Value) -> bool {
    unsafe {
        let env_ref = &mut *env;
        if !env_ref.push_frame(func, args) {
            return false;
        }
        env_ref.set_file_name(&(*func).file_name);

        let ok = if let Some(native) = (*func).native {
            native(env_ref)
        } else {
            (*func).call_count = (*func).call_count.saturating_add(1);
            let vm = env_ref.vm();
            // Build once the counter reaches the threshold, but never
            // while generated code is on the stack: emission flips the
            // shared region writable.
            if vm.options.jit_enable
                && vm.jit.active == 0
                && (*func).jit_code.is_none()
                && vm.options.jit_threshold != 0
                && (*func).call_count >= vm.options.jit_threshold
                && !crate::jit::jit_build(env, func)
            {
                env_ref.pop_frame();
                return false;
            }
            match (*func).jit_code {
                // Dispatch into generated code only once the region has
                // been transitioned back to executable.
                Some(entry) if !env_ref.vm().jit.dirty => {
                    env_ref.vm().jit.active += 1;
                    let ok = entry(env);
                    env_ref.vm().jit.active -= 1;
                    ok
                }
                _ => interp::run(env, func),
            }
        };

        if ok {
            *ret = *(*env_ref.frame).slot(0);
        }
        env_ref.pop_frame();
        ok
    }
}

/// Resolve a global by name and call it.
pub(crate) fn call_with_name(env: *mut Env, name: &str, args: &[Value], ret: &mut Value) -> bool {
    unsafe {
        let vm = (*env).vm();
        let func = match vm.globals.get_by_name(name) {
            Some(entry) => match entry.value.as_func_obj() {
                Some(func) => func,
                None => {
                    vm_error!(env, ErrorKind::Type, "Not a function.");
                    return false;
                }
            },
            None => {
                vm_error!(env, ErrorKind::Name, "Symbol \"{}\" not found.", name);
                return false;
            }
        };
        call_func(env, func, args, ret)
    }
}

/// CALL: resolve the callee slot, gather arguments, invoke.
pub extern "C" fn call_helper(env: *mut Env, dst: i32, func: i32, arg_count: i32, args: *const i32) -> bool {
    unsafe {
        let callee = match (*slot(env, func)).as_func_obj() {
            Some(f) => f,
            None => {
                vm_error!(env, ErrorKind::Type, "Not a function.");
                return false;
            }
        };

        let mut arg_values = [Value::zero(); ARG_MAX];
        for i in 0..arg_count as usize {
            let index = *args.add(i);
            arg_values[i] = *slot(env, index);
        }

        let mut ret = Value::zero();
        if !call_func(env, callee, &arg_values[..arg_count as usize], &mut ret) {
            return false;
        }
        *slot(env, dst) = ret;
        true
    }
}

/// THISCALL: resolve the method by the intrinsic table first, then by a
/// lookup on the receiver dictionary; the receiver rides as the first
/// argument.
pub extern "C" fn this_call_helper(
    env: *mut Env,
    dst: i32,
    obj: i32,
    name: *const u8,
    name_len: u32,
    name_hash: u32,
    arg_count: i32,
    args: *const i32,
) -> bool {
    unsafe {
        let name = operand_bytes(name, name_len);
        let receiver = *slot(env, obj);
        let vm = (*env).vm();

        let callee = match vm.intrinsics.get(std::str::from_utf8(name).unwrap_or("")) {
            Some(&func) => func,
            None => {
                let dict_obj = match receiver.as_dict_obj() {
                    Some(d) => d,
                    None => {
                        vm_error!(env, ErrorKind::Type, "Not a dictionary.");
                        return false;
                    }
                };
                let mut method = Value::zero();
                if !object::get_dict_elem(env, dict_obj, name, name_hash, &mut method) {
                    return false;
                }
                match method.as_func_obj() {
                    Some(f) => f,
                    None => {
                        vm_error!(env, ErrorKind::Type, "Not a function.");
                        return false;
                    }
                }
            }
        };

        // Receiver plus up to ARG_MAX explicit arguments.
        let mut arg_values = [Value::zero(); ARG_MAX + 1];
        arg_values[0] = receiver;
        for i in 0..arg_count as usize {
            let index = *args.add(i);
            arg_values[i + 1] = *slot(env, index);
        }

        let mut ret = Value::zero();
        if !call_func(env, callee, &arg_values[..arg_count as usize + 1], &mut ret) {
            return false;
        }
        *slot(env, dst) = ret;
        true
    }
}

// ---------------------------------------------------------------------------
// Constant construction (called by generated code)
// ---------------------------------------------------------------------------

/// SCONST: intern a string operand with its image hash into `dst`.
pub extern "C" fn make_string_with_hash(env: *mut Env, dst: *mut Value, data: *const u8, len: u32, hash: u32) -> bool {
    unsafe {
        let bytes = operand_bytes(data, len);
        let obj = object::alloc_string(env, bytes, Some(hash));
        if obj.is_null() {
            return false;
        }
        *dst = Value::string(obj);
        true
    }
}

/// ACONST: a fresh empty array into `dst`.
pub extern "C" fn make_empty_array(env: *mut Env, dst: *mut Value) -> bool {
    unsafe {
        let obj = object::alloc_array(env);
        if obj.is_null() {
            return false;
        }
        *dst = Value::array(obj);
        true
    }
}

/// DCONST: a fresh empty dictionary into `dst`.
pub extern "C" fn make_empty_dict(env: *mut Env, dst: *mut Value) -> bool {
    unsafe {
        let obj = object::alloc_dict(env);
        if obj.is_null() {
            return false;
        }
        *dst = Value::dict(obj);
        true
    }
}
