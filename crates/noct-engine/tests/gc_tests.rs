//! Garbage collector integration tests
//!
//! Pinning, promotion, copy-on-resize forwarding, compaction identity,
//! and collection under allocation pressure, driven through the public
//! API with small regions so every path actually runs.

use noct_bytecode::{BytecodeEncoder, FunctionImage, FunctionRecord, Opcode};
use noct_engine::{Value, Vm, VmOptions};

fn small_heap() -> Box<Vm> {
    Vm::new(VmOptions {
        jit_enable: false,
        gc_nursery_size: 4 * 1024,
        gc_graduate_size: 8 * 1024,
        gc_tenure_size: 256 * 1024,
        ..VmOptions::default()
    })
}

fn single(name: &str, tmpvars: u16, body: Vec<u8>) -> Vec<u8> {
    FunctionImage {
        functions: vec![FunctionRecord {
            name: name.to_string(),
            file_name: format!("{name}.nc"),
            params: vec![],
            tmpvar_count: tmpvars,
            body,
        }],
    }
    .to_bytes()
}

#[test]
fn test_pinned_value_survives_collections() {
    let mut vm = small_heap();
    let env = vm.default_env();

    let mut held = env.make_string("keep me").unwrap();
    env.pin_global(&mut held).unwrap();

    // Churn enough garbage to force several young collections.
    for i in 0..5_000 {
        let _garbage = env.make_string(&format!("tmp {i}")).unwrap();
    }
    env.full_gc();
    env.compact_gc();

    assert_eq!(env.get_string(&held).unwrap(), "keep me");
    env.unpin_global(&mut held).unwrap();
}

#[test]
fn test_unpinned_value_is_collected() {
    let mut vm = small_heap();
    let env = vm.default_env();

    let _dropped = env.make_string("gone").unwrap();
    let before = env.get_heap_usage();
    env.full_gc();
    let after = env.get_heap_usage();
    assert!(after < before);
}

#[test]
fn test_unpin_of_unpinned_value_is_error() {
    let mut vm = small_heap();
    let env = vm.default_env();
    let mut v = Value::int(1);
    assert!(env.unpin_global(&mut v).is_err());
}

#[test]
fn test_pin_unpin_balance() {
    let mut vm = small_heap();
    let env = vm.default_env();
    let mut a = env.make_string("a").unwrap();
    let mut b = env.make_string("b").unwrap();
    env.pin_global(&mut a).unwrap();
    env.pin_global(&mut b).unwrap();
    env.unpin_global(&mut b).unwrap();
    env.unpin_global(&mut a).unwrap();
    assert!(env.unpin_global(&mut a).is_err());
}

#[test]
fn test_array_copy_on_resize_forwarding() {
    let mut vm = small_heap();
    let env = vm.default_env();

    let mut arr = env.make_empty_array().unwrap();
    env.pin_global(&mut arr).unwrap();

    // Grow well past the initial capacity so the object is replaced
    // several times; the pinned reference must keep converging on the
    // latest shell.
    for i in 0..200 {
        let elem = Value::int(i);
        env.set_array_elem(&mut arr, i as u32, &elem).unwrap();
    }
    env.fast_gc();
    for i in 0..200 {
        assert_eq!(env.get_array_elem(&arr, i as u32).unwrap().as_int(), Some(i));
    }
    env.unpin_global(&mut arr).unwrap();
}

#[test]
fn test_array_shallow_copy_is_independent() {
    let mut vm = small_heap();
    let env = vm.default_env();

    let mut arr = env.make_empty_array().unwrap();
    env.pin_global(&mut arr).unwrap();
    for i in 0..10 {
        env.set_array_elem(&mut arr, i, &Value::int(i as i32)).unwrap();
    }

    let mut copy = env.make_array_copy(&mut arr).unwrap();
    env.pin_global(&mut copy).unwrap();
    for i in 0..10 {
        assert_eq!(env.get_array_elem(&copy, i).unwrap().as_int(), Some(i as i32));
    }

    // Mutating one does not affect the other.
    env.set_array_elem(&mut arr, 0, &Value::int(99)).unwrap();
    assert_eq!(env.get_array_elem(&copy, 0).unwrap().as_int(), Some(0));
    env.set_array_elem(&mut copy, 1, &Value::int(-1)).unwrap();
    assert_eq!(env.get_array_elem(&arr, 1).unwrap().as_int(), Some(1));

    env.unpin_global(&mut copy).unwrap();
    env.unpin_global(&mut arr).unwrap();
}

#[test]
fn test_dict_shallow_copy_matches_at_copy_time() {
    let mut vm = small_heap();
    let env = vm.default_env();

    let mut dict = env.make_empty_dict().unwrap();
    env.pin_global(&mut dict).unwrap();
    for (k, v) in [("one", 1), ("two", 2), ("three", 3)] {
        env.set_dict_elem(&mut dict, k, &Value::int(v)).unwrap();
    }

    let mut copy = env.make_dict_copy(&mut dict).unwrap();
    env.pin_global(&mut copy).unwrap();
    for (k, v) in [("one", 1), ("two", 2), ("three", 3)] {
        assert_eq!(env.get_dict_elem(&copy, k).unwrap().as_int(), Some(v));
    }
    env.set_dict_elem(&mut dict, "one", &Value::int(10)).unwrap();
    assert_eq!(env.get_dict_elem(&copy, "one").unwrap().as_int(), Some(1));

    env.unpin_global(&mut copy).unwrap();
    env.unpin_global(&mut dict).unwrap();
}

#[cfg(not(feature = "parallel"))]
#[test]
fn test_dict_remove_and_order() {
    let mut vm = small_heap();
    let env = vm.default_env();

    let mut dict = env.make_empty_dict().unwrap();
    env.pin_global(&mut dict).unwrap();
    for (k, v) in [("a", 1), ("b", 2), ("c", 3)] {
        env.set_dict_elem(&mut dict, k, &Value::int(v)).unwrap();
    }
    env.remove_dict_elem(&dict, "b").unwrap();

    assert_eq!(env.get_dict_size(&dict).unwrap(), 2);
    assert!(!env.check_dict_key(&dict, "b").unwrap());
    assert!(env.remove_dict_elem(&dict, "b").is_err());

    // Iteration order skips the removed key but keeps insertion order.
    let k0 = env.get_dict_key_by_index(&dict, 0).unwrap();
    let k1 = env.get_dict_key_by_index(&dict, 1).unwrap();
    assert_eq!(env.get_string(&k0).unwrap(), "a");
    assert_eq!(env.get_string(&k1).unwrap(), "c");
    assert!(env.get_dict_key_by_index(&dict, 2).is_err());

    // Re-inserting after removal appends at the end.
    env.set_dict_elem(&mut dict, "b", &Value::int(9)).unwrap();
    let k2 = env.get_dict_key_by_index(&dict, 2).unwrap();
    assert_eq!(env.get_string(&k2).unwrap(), "b");

    env.unpin_global(&mut dict).unwrap();
}

#[test]
fn test_compaction_preserves_content() {
    let mut vm = small_heap();
    let env = vm.default_env();

    // Build a graph in script, promote it to tenure via collections,
    // punch holes with garbage, then compact and re-check contents.
    let mut enc = BytecodeEncoder::new();
    enc.dconst(1)
        .sconst(2, "answer")
        .iconst(3, 42)
        .store_array(1, 2, 3)
        .aconst(4)
        .iconst(5, 0)
        .store_array(4, 5, 1) // a[0] = d (a cycle-capable nesting)
        .assign(0, 4);
    env.register_bytecode(&single("build", 8, enc.finish())).unwrap();

    let mut graph = env.enter_vm("build", &[]).unwrap();
    env.pin_global(&mut graph).unwrap();

    for _ in 0..3 {
        env.fast_gc();
    }
    for i in 0..2_000 {
        let _garbage = env.make_string(&format!("hole {i}")).unwrap();
    }
    env.compact_gc();

    let dict = env.get_array_elem(&graph, 0).unwrap();
    assert_eq!(env.get_dict_elem(&dict, "answer").unwrap().as_int(), Some(42));
    env.unpin_global(&mut graph).unwrap();
}

#[test]
fn test_cycles_are_collected() {
    let mut vm = small_heap();
    let env = vm.default_env();

    // d["self"] = d — a cycle that reference counting could never free.
    let mut enc = BytecodeEncoder::new();
    enc.dconst(1).sconst(2, "self").store_array(1, 2, 1).iconst(0, 0);
    env.register_bytecode(&single("cycle", 4, enc.finish())).unwrap();
    env.enter_vm("cycle", &[]).unwrap();

    let before = env.get_heap_usage();
    env.full_gc();
    let after = env.get_heap_usage();
    assert!(after < before, "cycle not collected: {before} -> {after}");
}

#[test]
fn test_promotion_is_one_generation_per_collection() {
    let mut vm = small_heap();
    let env = vm.default_env();

    let mut held = env.make_string("promoted").unwrap();
    env.pin_global(&mut held).unwrap();

    // One young collection moves a nursery object at most into graduate;
    // only the next one may reach tenure. Observable contract: content
    // stays intact the whole way through.
    for _ in 0..4 {
        env.fast_gc();
        assert_eq!(env.get_string(&held).unwrap(), "promoted");
    }
    env.unpin_global(&mut held).unwrap();
}

#[test]
fn test_large_objects_go_off_region() {
    let mut vm = Vm::new(VmOptions {
        jit_enable: false,
        gc_lop_threshold: 32, // below the record size, forcing the off-region path
        ..VmOptions::default()
    });
    let env = vm.default_env();

    let mut v = env.make_string("large-object path").unwrap();
    env.pin_global(&mut v).unwrap();
    env.full_gc();
    assert_eq!(env.get_string(&v).unwrap(), "large-object path");
    env.unpin_global(&mut v).unwrap();
    env.full_gc();
}

#[test]
fn test_heap_usage_accounting() {
    let mut vm = small_heap();
    let env = vm.default_env();
    let baseline = env.get_heap_usage();

    let mut v = env.make_string("accounted").unwrap();
    env.pin_global(&mut v).unwrap();
    assert!(env.get_heap_usage() > baseline);

    env.unpin_global(&mut v).unwrap();
    env.full_gc();
    assert_eq!(env.get_heap_usage(), baseline);
}
