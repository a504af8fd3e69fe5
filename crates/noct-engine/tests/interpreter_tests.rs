//! Interpreter integration tests
//!
//! Hand-assembled byte images driven through the public API: arithmetic
//! widening, string concatenation, containers, control flow, calls, and
//! the runtime fault paths.

use noct_bytecode::{BytecodeEncoder, FunctionImage, FunctionRecord, Opcode};
use noct_engine::{ErrorKind, Value, ValueType, Vm, VmOptions};

fn function(name: &str, params: &[&str], tmpvars: u16, body: Vec<u8>) -> FunctionRecord {
    FunctionRecord {
        name: name.to_string(),
        file_name: format!("{name}.nc"),
        params: params.iter().map(|p| p.to_string()).collect(),
        tmpvar_count: tmpvars,
        body,
    }
}

fn single(name: &str, params: &[&str], tmpvars: u16, body: Vec<u8>) -> Vec<u8> {
    FunctionImage {
        functions: vec![function(name, params, tmpvars, body)],
    }
    .to_bytes()
}

fn interpreter_vm() -> Box<Vm> {
    Vm::new(VmOptions {
        jit_enable: false,
        ..VmOptions::default()
    })
}

#[test]
fn test_arithmetic_widening() {
    // return 1 + 2.5;
    let mut enc = BytecodeEncoder::new();
    enc.line_info(1)
        .iconst(1, 1)
        .fconst(2, 2.5)
        .binary(Opcode::Add, 0, 1, 2);

    let mut vm = interpreter_vm();
    let env = vm.default_env();
    env.register_bytecode(&single("f", &[], 4, enc.finish())).unwrap();
    let ret = env.enter_vm("f", &[]).unwrap();
    assert_eq!(ret.as_float(), Some(3.5));
}

#[test]
fn test_string_concat_with_int() {
    // return "x=" + 42;
    let mut enc = BytecodeEncoder::new();
    enc.sconst(1, "x=").iconst(2, 42).binary(Opcode::Add, 0, 1, 2);

    let mut vm = interpreter_vm();
    let env = vm.default_env();
    env.register_bytecode(&single("f", &[], 4, enc.finish())).unwrap();
    let ret = env.enter_vm("f", &[]).unwrap();
    assert_eq!(env.get_string(&ret).unwrap(), "x=42");
}

#[test]
fn test_string_concat_length_adds() {
    let mut enc = BytecodeEncoder::new();
    enc.sconst(1, "abc").sconst(2, "defg").binary(Opcode::Add, 0, 1, 2);

    let mut vm = interpreter_vm();
    let env = vm.default_env();
    env.register_bytecode(&single("f", &[], 4, enc.finish())).unwrap();
    let ret = env.enter_vm("f", &[]).unwrap();
    assert_eq!(env.get_string(&ret).unwrap().len(), 3 + 4);
}

#[test]
fn test_dict_length_field() {
    // var d = {}; d["a"] = 1; d["b"] = 2; return d.length;
    let mut enc = BytecodeEncoder::new();
    enc.dconst(1)
        .sconst(2, "a")
        .iconst(3, 1)
        .store_array(1, 2, 3)
        .sconst(2, "b")
        .iconst(3, 2)
        .store_array(1, 2, 3)
        .load_dot(0, 1, "length");

    let mut vm = interpreter_vm();
    let env = vm.default_env();
    env.register_bytecode(&single("f", &[], 4, enc.finish())).unwrap();
    let ret = env.enter_vm("f", &[]).unwrap();
    assert_eq!(ret.as_int(), Some(2));
}

#[test]
fn test_array_grow_fills_zero() {
    // var a = []; a[3] = 9; return a;
    let mut enc = BytecodeEncoder::new();
    enc.aconst(0).iconst(1, 3).iconst(2, 9).store_array(0, 1, 2);

    let mut vm = interpreter_vm();
    let env = vm.default_env();
    env.register_bytecode(&single("f", &[], 4, enc.finish())).unwrap();
    let ret = env.enter_vm("f", &[]).unwrap();

    assert_eq!(env.get_array_size(&ret).unwrap(), 4);
    assert_eq!(env.get_array_elem(&ret, 0).unwrap().as_int(), Some(0));
    assert_eq!(env.get_array_elem(&ret, 3).unwrap().as_int(), Some(9));
}

#[test]
fn test_missing_key_faults() {
    // var d = {}; return d["x"];
    let mut enc = BytecodeEncoder::new();
    enc.line_info(2).dconst(1).sconst(2, "x").load_array(0, 1, 2);

    let mut vm = interpreter_vm();
    let env = vm.default_env();
    env.register_bytecode(&single("f", &[], 4, enc.finish())).unwrap();
    let err = env.enter_vm("f", &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Key);
    assert!(err.message.to_lowercase().contains("key"), "{}", err.message);
    assert_eq!(err.line, 2);
    assert_eq!(err.file, "f.nc");
}

#[test]
fn test_division_by_zero_int_and_float() {
    for (make_divisor, _label) in [
        (Box::new(|enc: &mut BytecodeEncoder| {
            enc.iconst(2, 0);
        }) as Box<dyn Fn(&mut BytecodeEncoder)>, "int"),
        (Box::new(|enc: &mut BytecodeEncoder| {
            enc.fconst(2, 0.0);
        }), "float"),
        (Box::new(|enc: &mut BytecodeEncoder| {
            enc.fconst(2, -0.0);
        }), "negative zero"),
    ] {
        let mut enc = BytecodeEncoder::new();
        enc.iconst(1, 10);
        make_divisor(&mut enc);
        enc.binary(Opcode::Div, 0, 1, 2);

        let mut vm = interpreter_vm();
        let env = vm.default_env();
        env.register_bytecode(&single("f", &[], 4, enc.finish())).unwrap();
        let err = env.enter_vm("f", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DivisionByZero);
    }
}

#[test]
fn test_array_index_out_of_range() {
    // a = []; a[0] = 7; read a[index]
    for index in [-1i32, 1] {
        let mut enc = BytecodeEncoder::new();
        enc.aconst(1)
            .iconst(2, 0)
            .iconst(3, 7)
            .store_array(1, 2, 3)
            .iconst(2, index)
            .load_array(0, 1, 2);

        let mut vm = interpreter_vm();
        let env = vm.default_env();
        env.register_bytecode(&single("f", &[], 4, enc.finish())).unwrap();
        let err = env.enter_vm("f", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Index, "index {index}");
    }
}

#[test]
fn test_jump_to_end_returns() {
    let mut enc = BytecodeEncoder::new();
    enc.iconst(0, 5);
    let end = enc.pc() + 5;
    enc.jmp(end);
    let mut vm = interpreter_vm();
    let env = vm.default_env();
    env.register_bytecode(&single("f", &[], 4, enc.finish())).unwrap();
    assert_eq!(env.enter_vm("f", &[]).unwrap().as_int(), Some(5));
}

#[test]
fn test_jump_past_end_rejected_at_install() {
    let mut enc = BytecodeEncoder::new();
    enc.jmp(6);
    let mut vm = interpreter_vm();
    let env = vm.default_env();
    let err = env.register_bytecode(&single("f", &[], 4, enc.finish())).unwrap_err();
    assert_eq!(err.kind, ErrorKind::BrokenBytecode);
}

#[test]
fn test_truncated_image_rejected() {
    let mut enc = BytecodeEncoder::new();
    enc.iconst(0, 1);
    let bytes = single("f", &[], 4, enc.finish());
    let mut vm = interpreter_vm();
    let env = vm.default_env();
    assert!(env.register_bytecode(&bytes[..bytes.len() - 1]).is_err());
    // The bad image must not have bound anything.
    assert!(!env.check_global("f"));
}

#[test]
fn test_loop_with_eqi_fusion() {
    // i = 0; loop: if (i == 10) done; i++; goto loop; return i;
    let mut enc = BytecodeEncoder::new();
    enc.iconst(0, 0).iconst(1, 10);
    let loop_top = enc.pc();
    enc.binary(Opcode::EqI, 2, 0, 1);
    let exit_jump = enc.pc();
    enc.jmp_if_eq(0);
    enc.inc(0);
    enc.jmp(loop_top);
    let done = enc.pc();
    enc.patch_jump(exit_jump, done);

    let mut vm = interpreter_vm();
    let env = vm.default_env();
    env.register_bytecode(&single("f", &[], 4, enc.finish())).unwrap();
    assert_eq!(env.enter_vm("f", &[]).unwrap().as_int(), Some(10));
}

#[test]
fn test_conditional_jumps() {
    // return (a < b) ? 1 : 2  via JMPIFTRUE
    let mut enc = BytecodeEncoder::new();
    enc.binary(Opcode::Lt, 3, 1, 2);
    let branch = enc.pc();
    enc.jmp_if_true(3, 0);
    enc.iconst(0, 2);
    let to_end = enc.pc();
    enc.jmp(0);
    let true_arm = enc.pc();
    enc.iconst(0, 1);
    let end = enc.pc();
    enc.patch_jump(branch, true_arm);
    enc.patch_jump(to_end, end);

    let mut vm = interpreter_vm();
    let env = vm.default_env();
    env.register_bytecode(&single("f", &["a", "b"], 8, enc.finish())).unwrap();
    let lt = env.enter_vm("f", &[Value::int(1), Value::int(5)]).unwrap();
    assert_eq!(lt.as_int(), Some(1));
    let ge = env.enter_vm("f", &[Value::int(5), Value::int(1)]).unwrap();
    assert_eq!(ge.as_int(), Some(2));
}

#[test]
fn test_integer_ops_and_shift_bounds() {
    // ((a xor b) shl c) shr c with out-of-range counts folded to zero
    let mut enc = BytecodeEncoder::new();
    enc.iconst(1, 6)
        .iconst(2, 3)
        .binary(Opcode::Xor, 3, 1, 2) // 5
        .iconst(4, 40)
        .binary(Opcode::Shl, 0, 3, 4); // count 40 -> 0

    let mut vm = interpreter_vm();
    let env = vm.default_env();
    env.register_bytecode(&single("f", &[], 8, enc.finish())).unwrap();
    assert_eq!(env.enter_vm("f", &[]).unwrap().as_int(), Some(0));
}

#[test]
fn test_int_add_wraps() {
    let mut enc = BytecodeEncoder::new();
    enc.iconst(1, i32::MAX).iconst(2, 1).binary(Opcode::Add, 0, 1, 2);
    let mut vm = interpreter_vm();
    let env = vm.default_env();
    env.register_bytecode(&single("f", &[], 4, enc.finish())).unwrap();
    assert_eq!(env.enter_vm("f", &[]).unwrap().as_int(), Some(i32::MIN));
}

#[test]
fn test_equality_is_total_across_types() {
    // return 1 == "1";  (cross-type compares to 0, not a fault)
    let mut enc = BytecodeEncoder::new();
    enc.iconst(1, 1).sconst(2, "1").binary(Opcode::Eq, 0, 1, 2);
    let mut vm = interpreter_vm();
    let env = vm.default_env();
    env.register_bytecode(&single("f", &[], 4, enc.finish())).unwrap();
    assert_eq!(env.enter_vm("f", &[]).unwrap().as_int(), Some(0));

    let mut enc = BytecodeEncoder::new();
    enc.iconst(1, 1).sconst(2, "1").binary(Opcode::Neq, 0, 1, 2);
    env.register_bytecode(&single("g", &[], 4, enc.finish())).unwrap();
    assert_eq!(env.enter_vm("g", &[]).unwrap().as_int(), Some(1));
}

#[test]
fn test_string_ordering() {
    let mut enc = BytecodeEncoder::new();
    enc.sconst(1, "apple").sconst(2, "banana").binary(Opcode::Lt, 0, 1, 2);
    let mut vm = interpreter_vm();
    let env = vm.default_env();
    env.register_bytecode(&single("f", &[], 4, enc.finish())).unwrap();
    assert_eq!(env.enter_vm("f", &[]).unwrap().as_int(), Some(1));
}

#[test]
fn test_globals_across_calls() {
    // set: counter = a;  get: return counter;
    let mut set = BytecodeEncoder::new();
    set.store_symbol("counter", 0);
    let mut get = BytecodeEncoder::new();
    get.load_symbol(0, "counter");

    let image = FunctionImage {
        functions: vec![
            function("set", &["a"], 4, set.finish()),
            function("get", &[], 4, get.finish()),
        ],
    };

    let mut vm = interpreter_vm();
    let env = vm.default_env();
    env.register_bytecode(&image.to_bytes()).unwrap();
    env.enter_vm("set", &[Value::int(7)]).unwrap();
    assert_eq!(env.enter_vm("get", &[]).unwrap().as_int(), Some(7));
    assert_eq!(env.get_global("counter").unwrap().as_int(), Some(7));
}

#[test]
fn test_unknown_symbol_faults() {
    let mut enc = BytecodeEncoder::new();
    enc.load_symbol(0, "nope");
    let mut vm = interpreter_vm();
    let env = vm.default_env();
    env.register_bytecode(&single("f", &[], 4, enc.finish())).unwrap();
    let err = env.enter_vm("f", &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Name);
}

#[test]
fn test_call_between_script_functions() {
    // add(a, b) { return a + b; }   main() { return add(40, 2); }
    let mut add = BytecodeEncoder::new();
    add.binary(Opcode::Add, 0, 0, 1);
    let mut main = BytecodeEncoder::new();
    main.load_symbol(1, "add")
        .iconst(2, 40)
        .iconst(3, 2)
        .call(0, 1, &[2, 3]);

    let image = FunctionImage {
        functions: vec![
            function("add", &["a", "b"], 4, add.finish()),
            function("main", &[], 8, main.finish()),
        ],
    };

    let mut vm = interpreter_vm();
    let env = vm.default_env();
    env.register_bytecode(&image.to_bytes()).unwrap();
    assert_eq!(env.enter_vm("main", &[]).unwrap().as_int(), Some(42));
}

#[test]
fn test_recursion_depth_capped() {
    // f() { return f(); }
    let mut enc = BytecodeEncoder::new();
    enc.load_symbol(1, "f").call(0, 1, &[]);
    let mut vm = interpreter_vm();
    let env = vm.default_env();
    env.register_bytecode(&single("f", &[], 4, enc.finish())).unwrap();
    let err = env.enter_vm("f", &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::StackOverflow);
}

#[test]
fn test_this_call_on_receiver_dict() {
    // method(this, x) { return x + 1; }
    // main() { var d = {}; d["plus1"] = method; return d.plus1(41); }
    let mut method = BytecodeEncoder::new();
    method.iconst(2, 1).binary(Opcode::Add, 0, 1, 2);
    let mut main = BytecodeEncoder::new();
    main.dconst(1)
        .load_symbol(2, "method")
        .store_dot(1, "plus1", 2)
        .iconst(3, 41)
        .this_call(0, 1, "plus1", &[3]);

    let image = FunctionImage {
        functions: vec![
            function("method", &["this", "x"], 4, method.finish()),
            function("main", &[], 8, main.finish()),
        ],
    };

    let mut vm = interpreter_vm();
    let env = vm.default_env();
    env.register_bytecode(&image.to_bytes()).unwrap();
    assert_eq!(env.enter_vm("main", &[]).unwrap().as_int(), Some(42));
}

#[test]
fn test_this_call_intrinsic_comes_first() {
    // The intrinsic table resolves before the receiver dictionary, and
    // the receiver need not be a dictionary at all.
    fn twice(env: &mut noct_engine::Env) -> bool {
        let receiver = match env.get_arg_int(0) {
            Ok(i) => i,
            Err(_) => return false,
        };
        env.set_return_int(receiver * 2);
        true
    }

    let mut main = BytecodeEncoder::new();
    main.iconst(1, 21).this_call(0, 1, "twice", &[]);

    let mut vm = interpreter_vm();
    let env = vm.default_env();
    let func = env.register_cfunc("twice", &["this"], twice).unwrap();
    env.register_intrinsic_method("twice", func).unwrap();
    env.register_bytecode(&single("main", &[], 4, main.finish())).unwrap();
    assert_eq!(env.enter_vm("main", &[]).unwrap().as_int(), Some(42));
}

#[test]
fn test_dict_enumeration_order() {
    // d = {b: 2, a: 1, c: 3}; return [key(i), val(i)] probes
    let mut enc = BytecodeEncoder::new();
    enc.dconst(1);
    for (key, val) in [("b", 2), ("a", 1), ("c", 3)] {
        enc.sconst(2, key).iconst(3, val).store_array(1, 2, 3);
    }
    // return key at index 1 ("a")
    enc.iconst(4, 1).get_dict_key_by_index(0, 1, 4);

    let mut vm = interpreter_vm();
    let env = vm.default_env();
    env.register_bytecode(&single("f", &[], 8, enc.finish())).unwrap();
    let key = env.enter_vm("f", &[]).unwrap();
    assert_eq!(env.get_string(&key).unwrap(), "a");
}

#[test]
fn test_string_concat_loop_under_gc_pressure() {
    // s = ""; i = 0; while (i != 1000) { s = s + "a"; i++; } return s;
    let mut enc = BytecodeEncoder::new();
    enc.sconst(0, "").iconst(1, 0).iconst(2, 1000).sconst(3, "a");
    let loop_top = enc.pc();
    enc.binary(Opcode::EqI, 4, 1, 2);
    let exit_jump = enc.pc();
    enc.jmp_if_eq(0);
    enc.binary(Opcode::Add, 0, 0, 3);
    enc.inc(1);
    enc.jmp(loop_top);
    let done = enc.pc();
    enc.patch_jump(exit_jump, done);

    let mut vm = Vm::new(VmOptions {
        jit_enable: false,
        gc_nursery_size: 4 * 1024,
        gc_graduate_size: 8 * 1024,
        ..VmOptions::default()
    });
    let env = vm.default_env();
    env.register_bytecode(&single("f", &[], 8, enc.finish())).unwrap();
    let ret = env.enter_vm("f", &[]).unwrap();
    assert_eq!(ret.value_type(), ValueType::String);
    assert_eq!(env.get_string(&ret).unwrap().len(), 1000);

    // Collections must have happened for the intermediates.
    assert!(vm.gc_stats().fast_collections > 0);

    // A full collection afterwards drops the intermediate strings.
    let before = vm.default_env().get_heap_usage();
    vm.default_env().full_gc();
    let after = vm.default_env().get_heap_usage();
    assert!(after < before, "usage {before} -> {after}");
}

#[test]
fn test_error_state_untouched_on_success() {
    let mut enc = BytecodeEncoder::new();
    enc.iconst(0, 1);
    let mut vm = interpreter_vm();
    let env = vm.default_env();
    env.register_bytecode(&single("f", &[], 4, enc.finish())).unwrap();
    env.enter_vm("f", &[]).unwrap();
    assert_eq!(env.error_message(), "");
    assert_eq!(env.error_kind(), None);
}

#[test]
fn test_recursive_concat() {
    // f(n) { if (n == 0) return ""; return "a" + f(n - 1); }
    let mut enc = BytecodeEncoder::new();
    enc.iconst(1, 0);
    enc.binary(Opcode::EqI, 2, 0, 1);
    let base_jump = enc.pc();
    enc.jmp_if_eq(0);
    enc.iconst(2, 1);
    enc.binary(Opcode::Sub, 3, 0, 2);
    enc.load_symbol(4, "f");
    enc.call(5, 4, &[3]);
    enc.sconst(6, "a");
    enc.binary(Opcode::Add, 0, 6, 5);
    let skip_base = enc.pc();
    enc.jmp(0);
    let base = enc.pc();
    enc.sconst(0, "");
    let end = enc.pc();
    enc.patch_jump(base_jump, base);
    enc.patch_jump(skip_base, end);

    let mut vm = interpreter_vm();
    let env = vm.default_env();
    env.register_bytecode(&single("f", &["n"], 8, enc.finish())).unwrap();
    let ret = env.enter_vm("f", &[Value::int(20)]).unwrap();
    assert_eq!(env.get_string(&ret).unwrap(), "a".repeat(20));
}
