//! Embedding API integration tests
//!
//! Native function registration, argument/return helpers, local pins,
//! nested entry, the compiler seam, and error propagation across the
//! native boundary.

use noct_bytecode::{BytecodeEncoder, FunctionImage, FunctionRecord, Opcode};
use noct_engine::{Env, ErrorKind, SourceCompiler, Value, Vm, VmOptions};

fn single(name: &str, params: &[&str], tmpvars: u16, body: Vec<u8>) -> Vec<u8> {
    FunctionImage {
        functions: vec![FunctionRecord {
            name: name.to_string(),
            file_name: format!("{name}.nc"),
            params: params.iter().map(|p| p.to_string()).collect(),
            tmpvar_count: tmpvars,
            body,
        }],
    }
    .to_bytes()
}

fn new_vm() -> Box<Vm> {
    Vm::new(VmOptions {
        jit_enable: false,
        ..VmOptions::default()
    })
}

#[test]
fn test_native_function_args_and_return() {
    fn add(env: &mut Env) -> bool {
        let a = match env.get_arg_int(0) {
            Ok(v) => v,
            Err(_) => return false,
        };
        let b = match env.get_arg_int(1) {
            Ok(v) => v,
            Err(_) => return false,
        };
        env.set_return_int(a + b);
        true
    }

    let mut vm = new_vm();
    let env = vm.default_env();
    env.register_cfunc("add", &["a", "b"], add).unwrap();
    let ret = env.enter_vm("add", &[Value::int(40), Value::int(2)]).unwrap();
    assert_eq!(ret.as_int(), Some(42));
}

#[test]
fn test_native_type_check_names_the_parameter() {
    fn wants_int(env: &mut Env) -> bool {
        env.get_arg_int(0).is_ok()
    }

    let mut vm = new_vm();
    let env = vm.default_env();
    env.register_cfunc("wants_int", &["count"], wants_int).unwrap();
    let err = env.enter_vm("wants_int", &[Value::float(1.0)]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
    assert!(err.message.contains("count"), "{}", err.message);
}

#[test]
fn test_native_error_reaches_the_host() {
    fn fail(env: &mut Env) -> bool {
        env.error(ErrorKind::Api, format_args!("host refused: {}", 7));
        false
    }

    let mut vm = new_vm();
    let env = vm.default_env();
    env.register_cfunc("fail", &[], fail).unwrap();
    let err = env.enter_vm("fail", &[]).unwrap_err();
    assert_eq!(err.message, "host refused: 7");
}

#[test]
fn test_script_calls_native() {
    fn triple(env: &mut Env) -> bool {
        let x = match env.get_arg_int(0) {
            Ok(v) => v,
            Err(_) => return false,
        };
        env.set_return_int(x * 3);
        true
    }

    // main() { return triple(14); }
    let mut enc = BytecodeEncoder::new();
    enc.load_symbol(1, "triple").iconst(2, 14).call(0, 1, &[2]);

    let mut vm = new_vm();
    let env = vm.default_env();
    env.register_cfunc("triple", &["x"], triple).unwrap();
    env.register_bytecode(&single("main", &[], 4, enc.finish())).unwrap();
    assert_eq!(env.enter_vm("main", &[]).unwrap().as_int(), Some(42));
}

#[test]
fn test_native_reenters_the_vm() {
    // Script "inner" doubles; native "outer" calls it back through
    // enter_vm and adds one.
    fn outer(env: &mut Env) -> bool {
        let x = match env.get_arg_int(0) {
            Ok(v) => v,
            Err(_) => return false,
        };
        let inner = match env.enter_vm("inner", &[Value::int(x)]) {
            Ok(v) => v,
            Err(_) => return false,
        };
        let doubled = match env.get_int(&inner) {
            Ok(v) => v,
            Err(_) => return false,
        };
        env.set_return_int(doubled + 1);
        true
    }

    let mut enc = BytecodeEncoder::new();
    enc.iconst(2, 2).binary(Opcode::Mul, 0, 0, 2);

    let mut vm = new_vm();
    let env = vm.default_env();
    env.register_bytecode(&single("inner", &["x"], 4, enc.finish())).unwrap();
    env.register_cfunc("outer", &["x"], outer).unwrap();
    assert_eq!(env.enter_vm("outer", &[Value::int(20)]).unwrap().as_int(), Some(41));
}

#[test]
fn test_local_pins_guard_native_allocations() {
    // A native function that allocates, then allocates again; the first
    // value must be pinned to survive a collection between the two.
    fn build_pair(env: &mut Env) -> bool {
        let mut first = match env.make_string("first") {
            Ok(v) => v,
            Err(_) => return false,
        };
        if env.pin_local(&[&mut first as *mut Value]).is_err() {
            return false;
        }
        // Allocation pressure that may collect.
        for i in 0..2_000 {
            if env.make_string(&format!("churn {i}")).is_err() {
                return false;
            }
        }
        let ok = env.get_string(&first).map(|s| s == "first").unwrap_or(false);
        if env.unpin_local(&[&mut first as *mut Value]).is_err() {
            return false;
        }
        env.set_return_int(if ok { 1 } else { 0 });
        true
    }

    let mut vm = Vm::new(VmOptions {
        jit_enable: false,
        gc_nursery_size: 4 * 1024,
        ..VmOptions::default()
    });
    let env = vm.default_env();
    env.register_cfunc("build_pair", &[], build_pair).unwrap();
    assert_eq!(env.enter_vm("build_pair", &[]).unwrap().as_int(), Some(1));
}

#[test]
fn test_call_by_function_value() {
    let mut enc = BytecodeEncoder::new();
    enc.iconst(0, 9);
    let mut vm = new_vm();
    let env = vm.default_env();
    env.register_bytecode(&single("nine", &[], 4, enc.finish())).unwrap();

    let func = env.get_global("nine").unwrap();
    assert_eq!(env.call(func, &[]).unwrap().as_int(), Some(9));
    assert!(env.call(Value::int(3), &[]).is_err());
}

#[test]
fn test_enter_vm_unknown_function() {
    let mut vm = new_vm();
    let env = vm.default_env();
    let err = env.enter_vm("missing", &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Name);
}

#[test]
fn test_register_source_without_compiler() {
    let mut vm = new_vm();
    let env = vm.default_env();
    let err = env.register_source("a.nc", "fn f() {}").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Compile);
}

#[test]
fn test_register_source_with_compiler() {
    // A toy compiler: ignores the source text and emits `fn meaning()`
    // returning 42, tagged with the registered file name.
    struct FixedCompiler;
    impl SourceCompiler for FixedCompiler {
        fn compile(&mut self, file_name: &str, _source: &str) -> Result<Vec<u8>, String> {
            let mut enc = BytecodeEncoder::new();
            enc.iconst(0, 42);
            Ok(FunctionImage {
                functions: vec![FunctionRecord {
                    name: "meaning".to_string(),
                    file_name: file_name.to_string(),
                    params: vec![],
                    tmpvar_count: 4,
                    body: enc.finish(),
                }],
            }
            .to_bytes())
        }
    }

    let mut vm = new_vm();
    vm.set_compiler(Box::new(FixedCompiler));
    let env = vm.default_env();
    env.register_source("meaning.nc", "whatever").unwrap();
    assert_eq!(env.enter_vm("meaning", &[]).unwrap().as_int(), Some(42));
}

#[test]
fn test_typed_container_accessors() {
    let mut vm = new_vm();
    let env = vm.default_env();

    let mut dict = env.make_empty_dict().unwrap();
    env.pin_global(&mut dict).unwrap();
    // The inserted string must be rooted across the insert, which can
    // allocate (key interning) and therefore collect.
    let mut s = env.make_string("v").unwrap();
    env.pin_global(&mut s).unwrap();
    env.set_dict_elem(&mut dict, "k", &s).unwrap();
    env.unpin_global(&mut s).unwrap();

    let v = env.get_dict_elem(&dict, "k").unwrap();
    assert_eq!(env.get_string(&v).unwrap(), "v");
    assert!(env.get_int(&v).is_err());
    assert!(env.get_dict_elem(&dict, "absent").is_err());
    env.unpin_global(&mut dict).unwrap();
}

#[test]
fn test_resize_array_shrink_and_grow() {
    let mut vm = new_vm();
    let env = vm.default_env();

    let mut arr = env.make_empty_array().unwrap();
    env.pin_global(&mut arr).unwrap();
    for i in 0..8 {
        env.set_array_elem(&mut arr, i, &Value::int(i as i32)).unwrap();
    }
    env.resize_array(&mut arr, 3).unwrap();
    assert_eq!(env.get_array_size(&arr).unwrap(), 3);

    // Growing back fills the reopened slots with Int(0).
    env.resize_array(&mut arr, 6).unwrap();
    assert_eq!(env.get_array_elem(&arr, 5).unwrap().as_int(), Some(0));
    assert_eq!(env.get_array_elem(&arr, 2).unwrap().as_int(), Some(2));
    env.unpin_global(&mut arr).unwrap();
}

#[test]
fn test_set_return_string() {
    fn greet(env: &mut Env) -> bool {
        env.set_return_string("hello").is_ok()
    }
    let mut vm = new_vm();
    let env = vm.default_env();
    env.register_cfunc("greet", &[], greet).unwrap();
    let ret = env.enter_vm("greet", &[]).unwrap();
    assert_eq!(env.get_string(&ret).unwrap(), "hello");
}
