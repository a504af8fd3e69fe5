//! Generational heap
//!
//! Three contiguous bump regions (nursery, graduate, tenure) plus an
//! out-of-line large-object list. Object records are small and uniform;
//! their variable payloads live in separate raw allocations owned by the
//! record (see `vm::object`). Fresh allocations land in the nursery; the
//! young collector evacuates survivors one generation older; the full
//! collector mark-sweeps every generation in place; compaction slides
//! tenure to squeeze the holes out.

pub(crate) mod collect;

use crate::vm::error::ErrorKind;
use crate::vm::frame::Env;
use crate::vm::object::{free_object_payload, GcHeader, Generation, ObjKind};
use crate::vm::VmOptions;
use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};

pub use collect::GcStats;

const REGION_ALIGN: usize = 8;

#[inline]
fn align_up(size: usize) -> usize {
    (size + REGION_ALIGN - 1) & !(REGION_ALIGN - 1)
}

/// One contiguous bump-allocated generation.
pub(crate) struct Region {
    base: *mut u8,
    size: usize,
    cursor: usize,
    gen: Generation,
}

impl Region {
    fn new(gen: Generation, size: usize) -> Region {
        let size = align_up(size.max(4096));
        let base = unsafe { alloc(Layout::from_size_align(size, REGION_ALIGN).unwrap()) };
        assert!(!base.is_null(), "region allocation failed");
        Region { base, size, cursor: 0, gen }
    }

    pub(crate) fn generation(&self) -> Generation {
        self.gen
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.base
    }

    pub(crate) fn cursor(&self) -> usize {
        self.cursor
    }

    pub(crate) fn set_cursor(&mut self, cursor: usize) {
        debug_assert!(cursor <= self.size);
        self.cursor = cursor;
    }

    /// Bump-allocate `size` bytes (already aligned). The caller writes the
    /// header before the next possible collection point.
    pub(crate) fn alloc(&mut self, size: usize) -> Option<*mut GcHeader> {
        debug_assert_eq!(size % REGION_ALIGN, 0);
        if self.cursor + size > self.size {
            return None;
        }
        let ptr = unsafe { self.base.add(self.cursor) } as *mut GcHeader;
        self.cursor += size;
        Some(ptr)
    }

    /// Walk every record (including free holes) in address order.
    pub(crate) fn walk(&self) -> RegionWalker {
        RegionWalker {
            cur: self.base,
            end: unsafe { self.base.add(self.cursor) },
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.base, Layout::from_size_align(self.size, REGION_ALIGN).unwrap());
        }
    }
}

pub(crate) struct RegionWalker {
    cur: *mut u8,
    end: *mut u8,
}

impl Iterator for RegionWalker {
    type Item = *mut GcHeader;

    fn next(&mut self) -> Option<*mut GcHeader> {
        if self.cur >= self.end {
            return None;
        }
        let header = self.cur as *mut GcHeader;
        let size = unsafe { (*header).size } as usize;
        debug_assert!(size >= std::mem::size_of::<GcHeader>());
        self.cur = unsafe { self.cur.add(size) };
        Some(header)
    }
}

/// The VM's heap state.
pub(crate) struct GcHeap {
    pub(crate) nursery: Region,
    pub(crate) graduate: Region,
    pub(crate) tenure: Region,
    pub(crate) large: Vec<*mut GcHeader>,
    pub(crate) lop_threshold: usize,
    pub(crate) promotion_threshold: u8,
    pub(crate) stats: GcStats,
}

impl GcHeap {
    pub(crate) fn new(options: &VmOptions) -> GcHeap {
        GcHeap {
            nursery: Region::new(Generation::Nursery, options.gc_nursery_size),
            graduate: Region::new(Generation::Graduate, options.gc_graduate_size),
            tenure: Region::new(Generation::Tenure, options.gc_tenure_size),
            large: Vec::new(),
            lop_threshold: options.gc_lop_threshold,
            promotion_threshold: options.gc_promotion_threshold.max(1),
            stats: GcStats::default(),
        }
    }

    /// Live bytes across every generation and the large-object list.
    pub(crate) fn heap_usage(&self) -> usize {
        let mut total = 0;
        for region in [&self.nursery, &self.graduate, &self.tenure] {
            for header in region.walk() {
                unsafe {
                    if (*header).kind() != ObjKind::Free {
                        total += (*header).size as usize;
                    }
                }
            }
        }
        for &header in &self.large {
            total += unsafe { (*header).size } as usize;
        }
        total
    }

    fn alloc_large(&mut self, kind: ObjKind, size: usize) -> Option<*mut GcHeader> {
        let layout = Layout::from_size_align(size, REGION_ALIGN).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) } as *mut GcHeader;
        if ptr.is_null() {
            return None;
        }
        init_header(ptr, kind, Generation::Large, size);
        self.large.push(ptr);
        Some(ptr)
    }
}

impl Drop for GcHeap {
    fn drop(&mut self) {
        // Destroying the VM frees every heap object: release the payload
        // buffers; the regions release their backing memory below.
        unsafe {
            for region in [&self.nursery, &self.graduate, &self.tenure] {
                for header in region.walk() {
                    if (*header).kind() != ObjKind::Free {
                        free_object_payload(header);
                    }
                }
            }
            for &header in &self.large {
                free_object_payload(header);
                let size = (*header).size as usize;
                dealloc(header as *mut u8, Layout::from_size_align(size, REGION_ALIGN).unwrap());
            }
            self.large.clear();
        }
    }
}

fn init_header(header: *mut GcHeader, kind: ObjKind, gen: Generation, size: usize) {
    unsafe {
        (*header).kind = kind as u8;
        (*header).gen = gen as u8;
        (*header).marked = false;
        (*header).age = 0;
        (*header).size = size as u32;
        (*header).forward = std::ptr::null_mut();
    }
}

/// Allocate an object record. Fresh records land in the nursery; records
/// at or above the large-object threshold go to the out-of-line list.
/// Allocation pressure triggers a young collection, then compaction, in
/// that order; exhaustion reports out-of-memory on the environment and
/// returns null.
pub(crate) fn alloc_object(env: *mut Env, kind: ObjKind, size: usize) -> *mut GcHeader {
    unsafe {
        let vm = (*env).vm();
        let size = align_up(size);

        if size >= vm.gc.lop_threshold {
            if let Some(header) = vm.gc.alloc_large(kind, size) {
                return header;
            }
            (*env).set_error(ErrorKind::OutOfMemory, format_args!("Out-of-memory."));
            return std::ptr::null_mut();
        }

        if let Some(header) = vm.gc.nursery.alloc(size) {
            init_header(header, kind, Generation::Nursery, size);
            return header;
        }

        collect::fast_gc(vm);
        if let Some(header) = vm.gc.nursery.alloc(size) {
            init_header(header, kind, Generation::Nursery, size);
            return header;
        }

        // The nursery is full of survivors; fall back to tenure, squeezing
        // it first if the bump cursor is at the end.
        if let Some(header) = vm.gc.tenure.alloc(size) {
            init_header(header, kind, Generation::Tenure, size);
            return header;
        }
        collect::compact_gc(vm);
        if let Some(header) = vm.gc.tenure.alloc(size) {
            init_header(header, kind, Generation::Tenure, size);
            return header;
        }

        (*env).set_error(ErrorKind::OutOfMemory, format_args!("Out-of-memory."));
        std::ptr::null_mut()
    }
}
