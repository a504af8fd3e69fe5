//! Heap object model
//!
//! Every heap object starts with a [`GcHeader`]. Object records are small
//! fixed-size structs allocated inside the GC regions; their variable
//! payloads (string bytes, array/dict tables) are separate raw allocations
//! owned by the record and freed when the record dies. Payload buffers
//! never move, so `&str` borrows handed to native code stay valid across
//! compaction.
//!
//! Arrays and dictionaries grow by copy-on-resize: a grow past capacity
//! allocates a replacement object and links the old shell's `newer` field
//! to it. Readers holding a stale reference chase `newer` to the latest
//! object; the collector keeps the whole chain alive.

use crate::vm::error::ErrorKind;
use crate::vm::frame::Env;
use crate::vm::gc;
use crate::vm::value::Value;
use crate::vm_error;
use noct_bytecode::string_hash;
use std::alloc::{alloc_zeroed, dealloc, Layout};

/// Object kind byte in the header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    /// A swept hole inside a region; skipped by walkers
    Free = 0,
    /// Immutable string
    String = 1,
    /// Array
    Array = 2,
    /// Dictionary
    Dict = 3,
    /// Function (registry-owned, never swept)
    Func = 4,
}

/// Generation tag in the header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Generation {
    /// Fresh allocations
    Nursery = 0,
    /// Survivors of one young collection
    Graduate = 1,
    /// Long-lived objects; compacted by `compact_gc`
    Tenure = 2,
    /// Out-of-line large objects and registry-owned functions
    Large = 3,
}

/// GC header stored at the front of every heap object.
#[repr(C)]
#[derive(Debug)]
pub struct GcHeader {
    /// Object kind ([`ObjKind`] as u8)
    pub kind: u8,
    /// Generation tag ([`Generation`] as u8)
    pub gen: u8,
    /// Mark bit (true = reachable in the current mark phase)
    pub marked: bool,
    /// Survived collections, for the promotion decision
    pub age: u8,
    /// Total record size in bytes, including the header, 8-aligned
    pub size: u32,
    /// Forwarding pointer installed during compaction
    pub forward: *mut GcHeader,
}

impl GcHeader {
    pub(crate) fn kind(&self) -> ObjKind {
        match self.kind {
            1 => ObjKind::String,
            2 => ObjKind::Array,
            3 => ObjKind::Dict,
            4 => ObjKind::Func,
            _ => ObjKind::Free,
        }
    }

    pub(crate) fn generation(&self) -> Generation {
        match self.gen {
            0 => Generation::Nursery,
            1 => Generation::Graduate,
            2 => Generation::Tenure,
            _ => Generation::Large,
        }
    }
}

/// Immutable string object. `len` includes the NUL terminator kept at the
/// end of `data` so borrowed pointers can be handed to C-style consumers.
#[repr(C)]
pub struct StringObj {
    /// GC header
    pub head: GcHeader,
    /// NUL-terminated byte buffer
    pub data: *mut u8,
    /// Byte length including the NUL
    pub len: usize,
    /// Cached FNV-1a hash of the content (excluding NUL)
    pub hash: u32,
    /// Whether `hash` has been computed
    pub hash_cached: bool,
}

impl StringObj {
    /// Content bytes, excluding the NUL.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data, self.len - 1) }
    }

    /// Content as UTF-8, replacing invalid sequences.
    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.bytes())
    }

    /// Fill the hash cache on first use. The content never mutates, so a
    /// cached hash stays valid for the object's lifetime.
    pub fn cache_hash(&mut self) -> u32 {
        if !self.hash_cached {
            self.hash = string_hash(self.bytes());
            self.hash_cached = true;
        }
        self.hash
    }

    /// Hash-first equality against raw key bytes.
    pub(crate) fn equals_bytes(&mut self, bytes: &[u8], hash: u32) -> bool {
        self.cache_hash();
        self.len - 1 == bytes.len() && self.hash == hash && self.bytes() == bytes
    }
}

/// Array object with power-of-two capacity and copy-on-resize forwarding.
#[repr(C)]
pub struct ArrayObj {
    /// GC header
    pub head: GcHeader,
    /// Allocated slots in `table`
    pub capacity: usize,
    /// Current element count
    pub size: usize,
    /// Value table (zeroed slots read as `Int(0)`)
    pub table: *mut Value,
    /// Replacement object installed by a grow past capacity
    pub newer: *mut ArrayObj,
    /// Reader snapshot counter (parallel-GC build)
    #[cfg(feature = "parallel")]
    pub counter: std::sync::atomic::AtomicI32,
}

impl ArrayObj {
    /// Chase the copy-on-resize chain to the latest object.
    #[inline]
    pub fn latest(obj: *mut ArrayObj) -> *mut ArrayObj {
        let mut cur = obj;
        unsafe {
            while !(*cur).newer.is_null() {
                cur = (*cur).newer;
            }
        }
        cur
    }
}

/// Tombstone marker in a dictionary key table. An empty slot is the zero
/// value `Int(0)`; a removed slot is `Int(1)`. Occupied slots hold string
/// values, so neither sentinel collides with a real key.
const KEY_TOMBSTONE: i32 = 1;

/// Dictionary object: open-addressed parallel key/value tables plus an
/// insertion-order index of slot numbers.
#[repr(C)]
pub struct DictObj {
    /// GC header
    pub head: GcHeader,
    /// Allocated slots in each table (power of two, or zero before first
    /// insertion)
    pub capacity: usize,
    /// Present entries
    pub size: usize,
    /// Occupied slots including tombstones
    pub used: usize,
    /// Key table (string values, or the empty/tombstone sentinels)
    pub keys: *mut Value,
    /// Value table, parallel to `keys`
    pub values: *mut Value,
    /// Insertion-order index: `size` slot numbers
    pub order: *mut u32,
    /// Replacement object installed by a grow
    pub newer: *mut DictObj,
    /// Reader snapshot counter (parallel-GC build)
    #[cfg(feature = "parallel")]
    pub counter: std::sync::atomic::AtomicI32,
}

impl DictObj {
    /// Chase the copy-on-resize chain to the latest object.
    #[inline]
    pub fn latest(obj: *mut DictObj) -> *mut DictObj {
        let mut cur = obj;
        unsafe {
            while !(*cur).newer.is_null() {
                cur = (*cur).newer;
            }
        }
        cur
    }

    #[inline]
    fn key_at(&self, slot: usize) -> Value {
        unsafe { *self.keys.add(slot) }
    }

    fn slot_state(&self, slot: usize) -> SlotState {
        let key = self.key_at(slot);
        if key.is_ref() {
            SlotState::Occupied
        } else if key.raw_int() == KEY_TOMBSTONE {
            SlotState::Tombstone
        } else {
            SlotState::Empty
        }
    }

    /// Find the slot holding `key`, if present.
    pub(crate) fn find_slot(&self, key: &[u8], hash: u32) -> Option<usize> {
        if self.capacity == 0 {
            return None;
        }
        let mask = self.capacity - 1;
        let mut slot = hash as usize & mask;
        for _ in 0..self.capacity {
            match self.slot_state(slot) {
                SlotState::Empty => return None,
                SlotState::Occupied => {
                    let k = unsafe { &mut *self.key_at(slot).as_string_obj().unwrap() };
                    if k.equals_bytes(key, hash) {
                        return Some(slot);
                    }
                }
                SlotState::Tombstone => {}
            }
            slot = (slot + 1) & mask;
        }
        None
    }

    /// Slot number of the i-th present entry in insertion order.
    pub(crate) fn order_slot(&self, index: usize) -> Option<usize> {
        if index >= self.size {
            return None;
        }
        Some(unsafe { *self.order.add(index) } as usize)
    }
}

#[derive(PartialEq)]
enum SlotState {
    Empty,
    Tombstone,
    Occupied,
}

/// Signature of a registered native function.
pub type NativeFn = fn(&mut Env) -> bool;

/// Function object: either a bytecode body or a native function pointer,
/// never both. Functions are owned by the VM's registry and live until
/// the VM is destroyed; the collector treats them as leaves.
#[repr(C)]
pub struct FuncObj {
    /// GC header (kind Func, generation Large)
    pub head: GcHeader,
    /// Function name
    pub name: String,
    /// Parameter names in declaration order
    pub params: Vec<String>,
    /// Source file name, copied into the env on call for diagnostics
    pub file_name: String,
    /// Byte image of the body (empty for native functions)
    pub bytecode: Vec<u8>,
    /// Temporary slots the body may address
    pub tmpvar_count: u16,
    /// Call counter driving the JIT hotness policy
    pub call_count: u32,
    /// Native entry emitted by the JIT, once built and committed
    pub jit_code: Option<extern "C" fn(*mut Env) -> bool>,
    /// Native function pointer (None for bytecode functions)
    pub native: Option<NativeFn>,
}

impl FuncObj {
    #[inline]
    pub(crate) fn is_native(&self) -> bool {
        self.native.is_some()
    }
}

// ---------------------------------------------------------------------------
// Payload buffers
// ---------------------------------------------------------------------------

pub(crate) unsafe fn alloc_value_table(count: usize) -> *mut Value {
    if count == 0 {
        return std::ptr::null_mut();
    }
    let layout = Layout::array::<Value>(count).expect("table layout");
    alloc_zeroed(layout) as *mut Value
}

pub(crate) unsafe fn free_value_table(table: *mut Value, count: usize) {
    if !table.is_null() && count != 0 {
        dealloc(table as *mut u8, Layout::array::<Value>(count).expect("table layout"));
    }
}

unsafe fn alloc_bytes(count: usize) -> *mut u8 {
    alloc_zeroed(Layout::array::<u8>(count).expect("byte layout"))
}

unsafe fn free_bytes(data: *mut u8, count: usize) {
    if !data.is_null() && count != 0 {
        dealloc(data, Layout::array::<u8>(count).expect("byte layout"));
    }
}

unsafe fn alloc_order_table(count: usize) -> *mut u32 {
    if count == 0 {
        return std::ptr::null_mut();
    }
    alloc_zeroed(Layout::array::<u32>(count).expect("order layout")) as *mut u32
}

unsafe fn free_order_table(order: *mut u32, count: usize) {
    if !order.is_null() && count != 0 {
        dealloc(order as *mut u8, Layout::array::<u32>(count).expect("order layout"));
    }
}

/// Free the out-of-line payload of a dead object record. Called by the
/// sweep phases; the record itself is region memory.
pub(crate) unsafe fn free_object_payload(header: *mut GcHeader) {
    match (*header).kind() {
        ObjKind::String => {
            let s = header as *mut StringObj;
            free_bytes((*s).data, (*s).len);
        }
        ObjKind::Array => {
            let a = header as *mut ArrayObj;
            free_value_table((*a).table, (*a).capacity);
        }
        ObjKind::Dict => {
            let d = header as *mut DictObj;
            free_value_table((*d).keys, (*d).capacity);
            free_value_table((*d).values, (*d).capacity);
            free_order_table((*d).order, (*d).capacity);
        }
        ObjKind::Free | ObjKind::Func => {}
    }
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Allocate a string object. `hash` carries the precomputed image hash for
/// SCONST operands; plain construction leaves the cache empty.
pub(crate) fn alloc_string(env: *mut Env, bytes: &[u8], hash: Option<u32>) -> *mut StringObj {
    unsafe {
        let data = alloc_bytes(bytes.len() + 1);
        if data.is_null() {
            out_of_memory(env);
            return std::ptr::null_mut();
        }
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), data, bytes.len());
        *data.add(bytes.len()) = 0;

        let header = gc::alloc_object(env, ObjKind::String, std::mem::size_of::<StringObj>());
        if header.is_null() {
            free_bytes(data, bytes.len() + 1);
            return std::ptr::null_mut();
        }
        let obj = header as *mut StringObj;
        (*obj).data = data;
        (*obj).len = bytes.len() + 1;
        (*obj).hash = hash.unwrap_or(0);
        (*obj).hash_cached = hash.is_some();
        obj
    }
}

fn alloc_array_with_capacity(env: *mut Env, capacity: usize) -> *mut ArrayObj {
    unsafe {
        let table = if capacity > 0 {
            let t = alloc_value_table(capacity);
            if t.is_null() {
                out_of_memory(env);
                return std::ptr::null_mut();
            }
            t
        } else {
            std::ptr::null_mut()
        };

        let header = gc::alloc_object(env, ObjKind::Array, std::mem::size_of::<ArrayObj>());
        if header.is_null() {
            free_value_table(table, capacity);
            return std::ptr::null_mut();
        }
        let obj = header as *mut ArrayObj;
        (*obj).capacity = capacity;
        (*obj).size = 0;
        (*obj).table = table;
        (*obj).newer = std::ptr::null_mut();
        obj
    }
}

/// Allocate an empty array object.
pub(crate) fn alloc_array(env: *mut Env) -> *mut ArrayObj {
    alloc_array_with_capacity(env, 0)
}

fn alloc_dict_with_capacity(env: *mut Env, capacity: usize) -> *mut DictObj {
    unsafe {
        let (keys, values, order) = if capacity > 0 {
            let keys = alloc_value_table(capacity);
            let values = alloc_value_table(capacity);
            let order = alloc_order_table(capacity);
            if keys.is_null() || values.is_null() || order.is_null() {
                free_value_table(keys, capacity);
                free_value_table(values, capacity);
                free_order_table(order, capacity);
                out_of_memory(env);
                return std::ptr::null_mut();
            }
            (keys, values, order)
        } else {
            (std::ptr::null_mut(), std::ptr::null_mut(), std::ptr::null_mut())
        };

        let header = gc::alloc_object(env, ObjKind::Dict, std::mem::size_of::<DictObj>());
        if header.is_null() {
            free_value_table(keys, capacity);
            free_value_table(values, capacity);
            free_order_table(order, capacity);
            return std::ptr::null_mut();
        }
        let obj = header as *mut DictObj;
        (*obj).capacity = capacity;
        (*obj).size = 0;
        (*obj).used = 0;
        (*obj).keys = keys;
        (*obj).values = values;
        (*obj).order = order;
        (*obj).newer = std::ptr::null_mut();
        obj
    }
}

/// Allocate an empty dictionary object.
pub(crate) fn alloc_dict(env: *mut Env) -> *mut DictObj {
    alloc_dict_with_capacity(env, 0)
}

fn out_of_memory(env: *mut Env) {
    unsafe {
        (*env).set_error(ErrorKind::OutOfMemory, format_args!("Out-of-memory."));
    }
}

// ---------------------------------------------------------------------------
// Array operations
// ---------------------------------------------------------------------------

/// Read one element. Negative or past-the-end indexes fault.
pub(crate) fn get_array_elem(env: *mut Env, arr: *mut ArrayObj, index: i32, out: &mut Value) -> bool {
    unsafe {
        let arr = ArrayObj::latest(arr);
        if index < 0 || index as usize >= (*arr).size {
            vm_error!(env, ErrorKind::Index, "Array index {} is out of range.", index);
            return false;
        }
        *out = *(*arr).table.add(index as usize);
        true
    }
}

/// Write one element, growing the array (zero-filled) when the index is
/// at or past the current size.
///
/// `arr` must alias a GC-visible location (a frame slot, a pinned value,
/// or a global): a grow allocates, and a collection during that
/// allocation rewrites the reference through the root. The same contract
/// applies to every `&mut *mut` container argument in this module.
pub(crate) fn set_array_elem(env: *mut Env, arr: &mut *mut ArrayObj, index: i32, val: *const Value) -> bool {
    unsafe {
        if index < 0 {
            vm_error!(env, ErrorKind::Index, "Array index {} is out of range.", index);
            return false;
        }
        *arr = ArrayObj::latest(*arr);
        if index as usize >= (**arr).size && !resize_array(env, arr, index as usize + 1) {
            return false;
        }
        // Read the value only now: a collection during the grow may have
        // rewritten it through its root.
        let latest = *arr;
        *(*latest).table.add(index as usize) = *val;
        true
    }
}

/// Resize an array. Growing past capacity allocates a replacement object
/// and links the old shell's `newer` field; the caller's reference is
/// updated to the latest object.
pub(crate) fn resize_array(env: *mut Env, arr: &mut *mut ArrayObj, new_size: usize) -> bool {
    unsafe {
        *arr = ArrayObj::latest(*arr);
        let old = *arr;
        if new_size <= (*old).capacity {
            // Slots between the old and new size must read as Int(0).
            if new_size > (*old).size {
                for i in (*old).size..new_size {
                    *(*old).table.add(i) = Value::zero();
                }
            }
            (*old).size = new_size;
            return true;
        }

        let new_capacity = new_size.max(16).next_power_of_two();
        let new_obj = alloc_array_with_capacity(env, new_capacity);
        if new_obj.is_null() {
            return false;
        }
        // The allocation may have collected and moved the old object;
        // re-read through the root.
        let old = ArrayObj::latest(*arr);
        std::ptr::copy_nonoverlapping((*old).table, (*new_obj).table, (*old).size);
        (*new_obj).size = new_size;
        (*old).newer = new_obj;
        *arr = new_obj;
        true
    }
}

/// Shallow copy of an array. `src` must be a GC-visible value of array
/// type.
pub(crate) fn copy_array(env: *mut Env, src: *mut Value) -> *mut ArrayObj {
    unsafe {
        let size = (*ArrayObj::latest((*src).payload.array)).size;
        let copy = alloc_array_with_capacity(env, size.max(16).next_power_of_two());
        if copy.is_null() {
            return std::ptr::null_mut();
        }
        let from = ArrayObj::latest((*src).payload.array);
        std::ptr::copy_nonoverlapping((*from).table, (*copy).table, size);
        (*copy).size = size;
        copy
    }
}

// ---------------------------------------------------------------------------
// Dictionary operations
// ---------------------------------------------------------------------------

/// Look up a key. A missing key faults with a key error.
pub(crate) fn get_dict_elem(
    env: *mut Env,
    dict: *mut DictObj,
    key: &[u8],
    hash: u32,
    out: &mut Value,
) -> bool {
    unsafe {
        let dict = DictObj::latest(dict);
        match (*dict).find_slot(key, hash) {
            Some(slot) => {
                *out = *(*dict).values.add(slot);
                true
            }
            None => {
                vm_error!(
                    env,
                    ErrorKind::Key,
                    "Key \"{}\" not found.",
                    String::from_utf8_lossy(key)
                );
                false
            }
        }
    }
}

/// Whether a key is present.
pub(crate) fn check_dict_key(dict: *mut DictObj, key: &[u8]) -> bool {
    unsafe {
        let dict = DictObj::latest(dict);
        (*dict).find_slot(key, string_hash(key)).is_some()
    }
}

/// Insert or replace a key. Updates `*dict` when a grow replaces the
/// object.
pub(crate) fn set_dict_elem(
    env: *mut Env,
    dict: &mut *mut DictObj,
    key: &[u8],
    hash: u32,
    val: *const Value,
) -> bool {
    unsafe {
        *dict = DictObj::latest(*dict);

        if let Some(slot) = (**dict).find_slot(key, hash) {
            *(**dict).values.add(slot) = *val;
            return true;
        }

        // Grow at 3/4 occupancy (counting tombstones, collapsed by the
        // rebuild).
        if ((**dict).capacity == 0 || ((**dict).used + 1) * 4 > (**dict).capacity * 3)
            && !grow_dict(env, dict)
        {
            return false;
        }

        // The key string must be a heap object; intern the bytes. The
        // value being inserted lives in a caller-visible slot, so it
        // survives this allocation.
        let key_obj = alloc_string(env, key, Some(hash));
        if key_obj.is_null() {
            return false;
        }
        let latest = DictObj::latest(*dict);
        *dict = latest;

        let mask = (*latest).capacity - 1;
        let mut slot = hash as usize & mask;
        loop {
            match (*latest).slot_state(slot) {
                SlotState::Occupied => slot = (slot + 1) & mask,
                SlotState::Empty => {
                    (*latest).used += 1;
                    break;
                }
                SlotState::Tombstone => break,
            }
        }
        *(*latest).keys.add(slot) = Value::string(key_obj);
        *(*latest).values.add(slot) = *val;
        *(*latest).order.add((*latest).size) = slot as u32;
        (*latest).size += 1;
        *dict = latest;
        true
    }
}

/// Rebuild into a replacement object with doubled capacity, collapsing
/// tombstones and preserving insertion order.
fn grow_dict(env: *mut Env, dict: &mut *mut DictObj) -> bool {
    unsafe {
        let old = DictObj::latest(*dict);
        let new_capacity = ((*old).capacity * 2).max(8);
        let new_obj = alloc_dict_with_capacity(env, new_capacity);
        if new_obj.is_null() {
            return false;
        }
        let old = DictObj::latest(*dict);

        let mask = new_capacity - 1;
        for i in 0..(*old).size {
            let old_slot = *(*old).order.add(i) as usize;
            let key = *(*old).keys.add(old_slot);
            let key_obj = &mut *key.as_string_obj().expect("occupied slot holds a string key");
            let hash = key_obj.cache_hash();

            let mut slot = hash as usize & mask;
            while (*new_obj).slot_state(slot) == SlotState::Occupied {
                slot = (slot + 1) & mask;
            }
            *(*new_obj).keys.add(slot) = key;
            *(*new_obj).values.add(slot) = *(*old).values.add(old_slot);
            *(*new_obj).order.add(i) = slot as u32;
        }
        (*new_obj).size = (*old).size;
        (*new_obj).used = (*old).size;
        (*old).newer = new_obj;
        *dict = new_obj;
        true
    }
}

/// Fetch the i-th key in insertion order.
pub(crate) fn get_dict_key_by_index(env: *mut Env, dict: *mut DictObj, index: i32, out: &mut Value) -> bool {
    unsafe {
        let dict = DictObj::latest(dict);
        if index < 0 {
            vm_error!(env, ErrorKind::Index, "Dictionary index {} is out of range.", index);
            return false;
        }
        match (*dict).order_slot(index as usize) {
            Some(slot) => {
                *out = *(*dict).keys.add(slot);
                true
            }
            None => {
                vm_error!(env, ErrorKind::Index, "Dictionary index {} is out of range.", index);
                false
            }
        }
    }
}

/// Fetch the i-th value in insertion order.
pub(crate) fn get_dict_value_by_index(env: *mut Env, dict: *mut DictObj, index: i32, out: &mut Value) -> bool {
    unsafe {
        let dict = DictObj::latest(dict);
        if index < 0 {
            vm_error!(env, ErrorKind::Index, "Dictionary index {} is out of range.", index);
            return false;
        }
        match (*dict).order_slot(index as usize) {
            Some(slot) => {
                *out = *(*dict).values.add(slot);
                true
            }
            None => {
                vm_error!(env, ErrorKind::Index, "Dictionary index {} is out of range.", index);
                false
            }
        }
    }
}

/// Remove a key, leaving a tombstone. Not compiled in the parallel build,
/// where a writer invalidating an in-flight reader's probe sequence is
/// not yet safe.
#[cfg(not(feature = "parallel"))]
pub(crate) fn remove_dict_elem(env: *mut Env, dict: *mut DictObj, key: &[u8]) -> bool {
    unsafe {
        let dict = DictObj::latest(dict);
        let hash = string_hash(key);
        let slot = match (*dict).find_slot(key, hash) {
            Some(slot) => slot,
            None => {
                vm_error!(
                    env,
                    ErrorKind::Key,
                    "Key \"{}\" not found.",
                    String::from_utf8_lossy(key)
                );
                return false;
            }
        };
        *(*dict).keys.add(slot) = Value::int(KEY_TOMBSTONE);
        *(*dict).values.add(slot) = Value::zero();

        // Drop the slot from the insertion-order index.
        let size = (*dict).size;
        let mut pos = size;
        for i in 0..size {
            if *(*dict).order.add(i) as usize == slot {
                pos = i;
                break;
            }
        }
        debug_assert!(pos < size);
        for i in pos..size - 1 {
            *(*dict).order.add(i) = *(*dict).order.add(i + 1);
        }
        (*dict).size = size - 1;
        true
    }
}

/// Shallow copy of a dictionary, preserving insertion order. `src` must
/// be a GC-visible value of dictionary type.
pub(crate) fn copy_dict(env: *mut Env, src: *mut Value) -> *mut DictObj {
    unsafe {
        let capacity = ((*DictObj::latest((*src).payload.dict)).size.max(4) * 2).next_power_of_two();
        let copy = alloc_dict_with_capacity(env, capacity);
        if copy.is_null() {
            return std::ptr::null_mut();
        }
        let src = DictObj::latest((*src).payload.dict);

        let mask = capacity - 1;
        for i in 0..(*src).size {
            let old_slot = *(*src).order.add(i) as usize;
            let key = *(*src).keys.add(old_slot);
            let key_obj = &mut *key.as_string_obj().expect("occupied slot holds a string key");
            let hash = key_obj.cache_hash();

            let mut slot = hash as usize & mask;
            while (*copy).slot_state(slot) == SlotState::Occupied {
                slot = (slot + 1) & mask;
            }
            *(*copy).keys.add(slot) = key;
            *(*copy).values.add(slot) = *(*src).values.add(old_slot);
            *(*copy).order.add(i) = slot as u32;
        }
        (*copy).size = (*src).size;
        (*copy).used = (*src).size;
        copy
    }
}
