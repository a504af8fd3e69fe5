//! The Noct tagged value
//!
//! A value is a fixed-layout tagged union: the tag word at offset 0 and an
//! 8-byte payload at offset 8 on 64-bit targets (offset 4 on 32-bit). The
//! JIT writes tags and payloads at those offsets directly, so the layout
//! is part of the native-code ABI. An all-zero value is `Int(0)`; frames
//! are zeroed rather than initialized slot by slot.

use crate::vm::object::{ArrayObj, DictObj, FuncObj, GcHeader, StringObj};

/// Tag word values. These are written by generated code; renumbering them
/// invalidates every JIT template.
pub(crate) const TAG_INT: u32 = 0;
pub(crate) const TAG_FLOAT: u32 = 1;
pub(crate) const TAG_STRING: u32 = 2;
pub(crate) const TAG_ARRAY: u32 = 3;
pub(crate) const TAG_DICT: u32 = 4;
pub(crate) const TAG_FUNC: u32 = 5;

/// The variant of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// 32-bit signed integer
    Int,
    /// 32-bit float
    Float,
    /// Immutable string object
    String,
    /// Array object
    Array,
    /// Dictionary object
    Dict,
    /// Function object
    Func,
}

/// Payload half of a value. Which field is live is decided by the tag.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) union Payload {
    pub i: i32,
    pub f: f32,
    pub string: *mut StringObj,
    pub array: *mut ArrayObj,
    pub dict: *mut DictObj,
    pub func: *mut FuncObj,
    pub obj: *mut GcHeader,
}

/// A Noct value: 16 bytes on 64-bit targets, 8 on 32-bit.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Value {
    pub(crate) tag: u32,
    pub(crate) payload: Payload,
}

impl Value {
    /// The zero value, `Int(0)`.
    #[inline]
    pub const fn zero() -> Value {
        Value {
            tag: TAG_INT,
            payload: Payload { i: 0 },
        }
    }

    /// Make an integer value.
    #[inline]
    pub const fn int(i: i32) -> Value {
        Value {
            tag: TAG_INT,
            payload: Payload { i },
        }
    }

    /// Make a float value.
    #[inline]
    pub const fn float(f: f32) -> Value {
        Value {
            tag: TAG_FLOAT,
            payload: Payload { f },
        }
    }

    #[inline]
    pub(crate) fn string(obj: *mut StringObj) -> Value {
        Value {
            tag: TAG_STRING,
            payload: Payload { string: obj },
        }
    }

    #[inline]
    pub(crate) fn array(obj: *mut ArrayObj) -> Value {
        Value {
            tag: TAG_ARRAY,
            payload: Payload { array: obj },
        }
    }

    #[inline]
    pub(crate) fn dict(obj: *mut DictObj) -> Value {
        Value {
            tag: TAG_DICT,
            payload: Payload { dict: obj },
        }
    }

    #[inline]
    pub(crate) fn func(obj: *mut FuncObj) -> Value {
        Value {
            tag: TAG_FUNC,
            payload: Payload { func: obj },
        }
    }

    /// The variant of this value.
    #[inline]
    pub fn value_type(&self) -> ValueType {
        match self.tag {
            TAG_INT => ValueType::Int,
            TAG_FLOAT => ValueType::Float,
            TAG_STRING => ValueType::String,
            TAG_ARRAY => ValueType::Array,
            TAG_DICT => ValueType::Dict,
            TAG_FUNC => ValueType::Func,
            _ => ValueType::Int,
        }
    }

    /// Integer payload, if this is an `Int`.
    #[inline]
    pub fn as_int(&self) -> Option<i32> {
        if self.tag == TAG_INT {
            Some(unsafe { self.payload.i })
        } else {
            None
        }
    }

    /// Float payload, if this is a `Float`.
    #[inline]
    pub fn as_float(&self) -> Option<f32> {
        if self.tag == TAG_FLOAT {
            Some(unsafe { self.payload.f })
        } else {
            None
        }
    }

    /// Whether this value references a heap object.
    #[inline]
    pub fn is_ref(&self) -> bool {
        matches!(self.tag, TAG_STRING | TAG_ARRAY | TAG_DICT | TAG_FUNC)
    }

    /// The integer payload read without a tag check. Used where the
    /// instruction set defines behavior on the raw payload (INC, the
    /// conditional jumps, EQI).
    #[inline]
    pub(crate) fn raw_int(&self) -> i32 {
        unsafe { self.payload.i }
    }

    #[inline]
    pub(crate) fn as_string_obj(&self) -> Option<*mut StringObj> {
        if self.tag == TAG_STRING {
            Some(unsafe { self.payload.string })
        } else {
            None
        }
    }

    #[inline]
    pub(crate) fn as_array_obj(&self) -> Option<*mut ArrayObj> {
        if self.tag == TAG_ARRAY {
            Some(unsafe { self.payload.array })
        } else {
            None
        }
    }

    #[inline]
    pub(crate) fn as_dict_obj(&self) -> Option<*mut DictObj> {
        if self.tag == TAG_DICT {
            Some(unsafe { self.payload.dict })
        } else {
            None
        }
    }

    #[inline]
    pub(crate) fn as_func_obj(&self) -> Option<*mut FuncObj> {
        if self.tag == TAG_FUNC {
            Some(unsafe { self.payload.func })
        } else {
            None
        }
    }

    /// The referenced object header, if any.
    #[inline]
    pub(crate) fn obj_header(&self) -> Option<*mut GcHeader> {
        if self.is_ref() {
            Some(unsafe { self.payload.obj })
        } else {
            None
        }
    }

    #[inline]
    pub(crate) fn set_obj_header(&mut self, header: *mut GcHeader) {
        debug_assert!(self.is_ref());
        self.payload.obj = header;
    }
}

impl Default for Value {
    fn default() -> Value {
        Value::zero()
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.tag {
            TAG_INT => write!(f, "Int({})", unsafe { self.payload.i }),
            TAG_FLOAT => write!(f, "Float({})", unsafe { self.payload.f }),
            TAG_STRING => write!(f, "String({:p})", unsafe { self.payload.string }),
            TAG_ARRAY => write!(f, "Array({:p})", unsafe { self.payload.array }),
            TAG_DICT => write!(f, "Dict({:p})", unsafe { self.payload.dict }),
            TAG_FUNC => write!(f, "Func({:p})", unsafe { self.payload.func }),
            tag => write!(f, "Invalid(tag={tag})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, offset_of, size_of};

    #[test]
    fn test_layout_contract() {
        #[cfg(target_pointer_width = "64")]
        {
            assert_eq!(size_of::<Value>(), 16);
            assert_eq!(offset_of!(Value, payload), 8);
        }
        #[cfg(target_pointer_width = "32")]
        {
            assert_eq!(size_of::<Value>(), 8);
            assert_eq!(offset_of!(Value, payload), 4);
        }
        assert_eq!(offset_of!(Value, tag), 0);
        assert_eq!(align_of::<Value>(), size_of::<usize>());
    }

    #[test]
    fn test_zeroed_bytes_decode_as_int_zero() {
        let value: Value = unsafe { std::mem::zeroed() };
        assert_eq!(value.value_type(), ValueType::Int);
        assert_eq!(value.as_int(), Some(0));
    }

    #[test]
    fn test_int_float_round_trip() {
        assert_eq!(Value::int(-7).as_int(), Some(-7));
        assert_eq!(Value::float(2.5).as_float(), Some(2.5));
        assert_eq!(Value::int(1).as_float(), None);
        assert_eq!(Value::float(1.0).as_int(), None);
    }
}
