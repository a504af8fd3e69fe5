//! Collection algorithms
//!
//! Three modes share one root walker and one tracer:
//! - `fast_gc`: young generations only. Live nursery/graduate records are
//!   evacuated one generation older (or slid to the front of their own
//!   region when the older region is full), then every reference is
//!   rewritten through a relocation table. Old-to-young pointers are found
//!   by scanning the whole old generation in place of write barriers.
//! - `full_gc`: stop-the-world mark-sweep over every generation. Dead
//!   records become free holes; nothing moves.
//! - `compact_gc`: `full_gc`, then a sliding compaction of tenure using
//!   forwarding pointers installed in the headers.

use crate::vm::gc::Region;
use crate::vm::object::{
    free_object_payload, ArrayObj, DictObj, GcHeader, Generation, ObjKind,
};
use crate::vm::value::Value;
use crate::vm::Vm;
use rustc_hash::FxHashMap;
use std::alloc::{dealloc, Layout};

/// Collector counters, visible to the host for tests and tuning.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Young collections run
    pub fast_collections: usize,
    /// Full collections run
    pub full_collections: usize,
    /// Compactions run
    pub compactions: usize,
    /// Bytes freed by the most recent collection
    pub last_freed_bytes: usize,
    /// Bytes freed over the VM lifetime
    pub total_freed_bytes: usize,
}

impl GcStats {
    fn record(&mut self, freed: usize) {
        self.last_freed_bytes = freed;
        self.total_freed_bytes += freed;
    }
}

#[inline]
unsafe fn is_young(header: *mut GcHeader) -> bool {
    matches!(
        (*header).generation(),
        Generation::Nursery | Generation::Graduate
    )
}

/// Visit every GC-visible value slot: all temporary slots of all active
/// frames of all environments, the local and global pin lists, and the
/// symbol table.
unsafe fn for_each_root(vm: *mut Vm, f: &mut dyn FnMut(*mut Value)) {
    let vm = &mut *vm;
    for env in vm.envs.iter_mut() {
        for frame in env.active_frames() {
            for i in 0..frame.tmpvar_size as usize {
                f(frame.slot(i));
            }
            for j in 0..frame.pinned_count as usize {
                f(frame.pinned[j]);
            }
        }
    }
    for &pin in &vm.pinned {
        f(pin);
    }
    for value in vm.globals.values_mut() {
        f(value as *mut Value);
    }
}

/// Push the children of an object. A record with a `newer` forward is a
/// forwarding shell: its replacement holds a superset of its references,
/// so only the forward is followed. Strings and functions are leaves.
unsafe fn trace_object(header: *mut GcHeader, visit: &mut dyn FnMut(*mut GcHeader)) {
    match (*header).kind() {
        ObjKind::Free | ObjKind::String | ObjKind::Func => {}
        ObjKind::Array => {
            let arr = header as *mut ArrayObj;
            if !(*arr).newer.is_null() {
                visit((*arr).newer as *mut GcHeader);
                return;
            }
            for i in 0..(*arr).size {
                let value = *(*arr).table.add(i);
                if let Some(child) = value.obj_header() {
                    visit(child);
                }
            }
        }
        ObjKind::Dict => {
            let dict = header as *mut DictObj;
            if !(*dict).newer.is_null() {
                visit((*dict).newer as *mut GcHeader);
                return;
            }
            for i in 0..(*dict).size {
                let slot = (*dict).order_slot(i).expect("order index within size");
                if let Some(child) = (*(*dict).keys.add(slot)).obj_header() {
                    visit(child);
                }
                if let Some(child) = (*(*dict).values.add(slot)).obj_header() {
                    visit(child);
                }
            }
        }
    }
}

/// Rewrite the references held by an object through `resolve`.
unsafe fn fix_object_refs(
    header: *mut GcHeader,
    resolve: &dyn Fn(*mut GcHeader) -> Option<*mut GcHeader>,
) {
    let fix_value = |slot: *mut Value| unsafe {
        if let Some(obj) = (*slot).obj_header() {
            if let Some(moved) = resolve(obj) {
                (*slot).set_obj_header(moved);
            }
        }
    };
    match (*header).kind() {
        ObjKind::Free | ObjKind::String | ObjKind::Func => {}
        ObjKind::Array => {
            let arr = header as *mut ArrayObj;
            if let Some(moved) = resolve((*arr).newer as *mut GcHeader) {
                (*arr).newer = moved as *mut ArrayObj;
            }
            for i in 0..(*arr).size {
                fix_value((*arr).table.add(i));
            }
        }
        ObjKind::Dict => {
            let dict = header as *mut DictObj;
            if let Some(moved) = resolve((*dict).newer as *mut GcHeader) {
                (*dict).newer = moved as *mut DictObj;
            }
            for i in 0..(*dict).capacity {
                fix_value((*dict).keys.add(i));
                fix_value((*dict).values.add(i));
            }
        }
    }
}

/// Rewrite every reference in the VM (roots and object tables) through
/// `resolve`.
unsafe fn fix_all_refs(vm: *mut Vm, resolve: &dyn Fn(*mut GcHeader) -> Option<*mut GcHeader>) {
    for_each_root(vm, &mut |slot| unsafe {
        if let Some(obj) = (*slot).obj_header() {
            if let Some(moved) = resolve(obj) {
                (*slot).set_obj_header(moved);
            }
        }
    });
    let gc = &mut (*vm).gc;
    for region in [&gc.nursery, &gc.graduate, &gc.tenure] {
        for header in region.walk() {
            fix_object_refs(header, resolve);
        }
    }
    for &header in &gc.large {
        fix_object_refs(header, resolve);
    }
}

// ---------------------------------------------------------------------------
// Young collection
// ---------------------------------------------------------------------------

/// Evacuate the live records of `region`: promote survivors whose age
/// reached the threshold into `target`, slide the rest to the front of
/// their own region. Relocations are recorded in `moved`. Returns bytes
/// freed.
unsafe fn evacuate_region(
    region: &mut Region,
    target: &mut Region,
    promotion_threshold: u8,
    moved: &mut FxHashMap<usize, usize>,
) -> usize {
    let records: Vec<*mut GcHeader> = region.walk().collect();
    let base = region.base();
    let mut new_cursor = 0usize;
    let mut freed = 0usize;

    for header in records {
        let size = (*header).size as usize;
        if (*header).kind() == ObjKind::Free {
            continue;
        }
        if !(*header).marked {
            free_object_payload(header);
            freed += size;
            continue;
        }

        let age = (*header).age.saturating_add(1);
        (*header).age = age;

        let mut dest: *mut GcHeader = std::ptr::null_mut();
        let mut new_gen = region.generation();
        if age >= promotion_threshold {
            if let Some(promoted) = target.alloc(size) {
                dest = promoted;
                new_gen = target.generation();
                (*header).age = 0;
            }
            // Target full: the record stays in its generation this cycle.
        }
        if dest.is_null() {
            dest = base.add(new_cursor) as *mut GcHeader;
            new_cursor += size;
        }

        if dest != header {
            // Sliding only moves records toward the region base, so an
            // in-region copy never overlaps ahead of the walk.
            std::ptr::copy(header as *const u8, dest as *mut u8, size);
            moved.insert(header as usize, dest as usize);
        }
        (*dest).gen = new_gen as u8;
        (*dest).marked = false;
        (*dest).forward = std::ptr::null_mut();
    }

    region.set_cursor(new_cursor);
    freed
}

/// Young collection: mark nursery + graduate from the roots and a whole
/// old-generation scan, evacuate survivors one generation older, rewrite
/// references.
pub(crate) fn fast_gc(vm: &mut Vm) {
    unsafe {
        #[cfg(feature = "parallel")]
        vm.wait_for_in_flight();

        let vm_ptr = vm as *mut Vm;

        // Clear young marks.
        for region in [&vm.gc.nursery, &vm.gc.graduate] {
            for header in region.walk() {
                (*header).marked = false;
            }
        }

        // Seed the worklist from the roots.
        let mut worklist: Vec<*mut GcHeader> = Vec::new();
        for_each_root(vm_ptr, &mut |slot| unsafe {
            if let Some(obj) = (*slot).obj_header() {
                if is_young(obj) {
                    worklist.push(obj);
                }
            }
        });

        // No write barrier: scan the whole old generation for pointers
        // into the young generations.
        for header in vm.gc.tenure.walk() {
            if (*header).kind() != ObjKind::Free {
                trace_object(header, &mut |child| unsafe {
                    if is_young(child) {
                        worklist.push(child);
                    }
                });
            }
        }
        for &header in &vm.gc.large {
            trace_object(header, &mut |child| unsafe {
                if is_young(child) {
                    worklist.push(child);
                }
            });
        }

        // Drain.
        while let Some(header) = worklist.pop() {
            if (*header).marked {
                continue;
            }
            (*header).marked = true;
            trace_object(header, &mut |child| unsafe {
                if is_young(child) && !(*child).marked {
                    worklist.push(child);
                }
            });
        }

        // Evacuate, oldest young generation first so nursery promotions
        // append after the graduate slide.
        let mut moved: FxHashMap<usize, usize> = FxHashMap::default();
        let promotion_threshold = vm.gc.promotion_threshold;
        let gc = &mut vm.gc;
        let mut freed = evacuate_region(
            &mut gc.graduate,
            &mut gc.tenure,
            promotion_threshold,
            &mut moved,
        );
        freed += evacuate_region(
            &mut gc.nursery,
            &mut gc.graduate,
            promotion_threshold,
            &mut moved,
        );

        if !moved.is_empty() {
            fix_all_refs(vm_ptr, &|obj| {
                moved
                    .get(&(obj as usize))
                    .map(|&new_addr| new_addr as *mut GcHeader)
            });
        }

        vm.gc.stats.fast_collections += 1;
        vm.gc.stats.record(freed);
    }
}

// ---------------------------------------------------------------------------
// Full collection
// ---------------------------------------------------------------------------

unsafe fn mark_everything(vm: &mut Vm) {
    let vm_ptr = vm as *mut Vm;
    for region in [&vm.gc.nursery, &vm.gc.graduate, &vm.gc.tenure] {
        for header in region.walk() {
            (*header).marked = false;
        }
    }
    for &header in &vm.gc.large {
        (*header).marked = false;
    }

    let mut worklist: Vec<*mut GcHeader> = Vec::new();
    for_each_root(vm_ptr, &mut |slot| unsafe {
        if let Some(obj) = (*slot).obj_header() {
            worklist.push(obj);
        }
    });
    while let Some(header) = worklist.pop() {
        if (*header).marked {
            continue;
        }
        (*header).marked = true;
        trace_object(header, &mut |child| unsafe {
            if !(*child).marked {
                worklist.push(child);
            }
        });
    }
}

unsafe fn sweep(vm: &mut Vm) -> usize {
    let mut freed = 0usize;
    for region in [&vm.gc.nursery, &vm.gc.graduate, &vm.gc.tenure] {
        for header in region.walk() {
            if (*header).kind() != ObjKind::Free && !(*header).marked {
                free_object_payload(header);
                freed += (*header).size as usize;
                (*header).kind = ObjKind::Free as u8;
            }
        }
    }
    vm.gc.large.retain(|&header| unsafe {
        if (*header).marked {
            true
        } else {
            free_object_payload(header);
            let size = (*header).size as usize;
            freed += size;
            dealloc(
                header as *mut u8,
                Layout::from_size_align(size, 8).unwrap(),
            );
            false
        }
    });
    freed
}

/// Full collection: stop-the-world mark-sweep over every generation.
/// Nothing moves; dead records become free holes reclaimed by the next
/// young collection (nursery, graduate) or compaction (tenure).
pub(crate) fn full_gc(vm: &mut Vm) {
    unsafe {
        #[cfg(feature = "parallel")]
        vm.wait_for_in_flight();

        mark_everything(vm);
        let freed = sweep(vm);
        vm.gc.stats.full_collections += 1;
        vm.gc.stats.record(freed);
    }
}

// ---------------------------------------------------------------------------
// Compaction
// ---------------------------------------------------------------------------

/// Full collection followed by a sliding compaction of tenure: install
/// forwarding pointers, rewrite every reference, then slide the live
/// records down over the holes. Record sizes never change.
pub(crate) fn compact_gc(vm: &mut Vm) {
    full_gc(vm);
    unsafe {
        let vm_ptr = vm as *mut Vm;

        // Pass 1: forwarding addresses.
        let base = vm.gc.tenure.base();
        let mut new_cursor = 0usize;
        for header in vm.gc.tenure.walk() {
            if (*header).kind() == ObjKind::Free {
                (*header).forward = std::ptr::null_mut();
                continue;
            }
            (*header).forward = base.add(new_cursor) as *mut GcHeader;
            new_cursor += (*header).size as usize;
        }

        // Pass 2: rewrite references through the forwarding pointers
        // while the old headers are still in place.
        let tenure_base = vm.gc.tenure.base() as usize;
        let tenure_end = tenure_base + vm.gc.tenure.cursor();
        fix_all_refs(vm_ptr, &|obj| unsafe {
            let addr = obj as usize;
            if addr >= tenure_base && addr < tenure_end {
                let forward = (*obj).forward;
                if !forward.is_null() && forward != obj {
                    return Some(forward);
                }
            }
            None
        });

        // Pass 3: slide. Ascending order keeps each copy ahead of its
        // destination.
        let plan: Vec<*mut GcHeader> = vm.gc.tenure.walk().collect();
        for header in plan {
            if (*header).kind() == ObjKind::Free {
                continue;
            }
            let dest = (*header).forward;
            let size = (*header).size as usize;
            if dest != header {
                std::ptr::copy(header as *const u8, dest as *mut u8, size);
            }
            (*dest).forward = std::ptr::null_mut();
        }
        vm.gc.tenure.set_cursor(new_cursor);

        vm.gc.stats.compactions += 1;
    }
}
