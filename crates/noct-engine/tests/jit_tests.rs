//! JIT integration tests
//!
//! Each script runs with the JIT threshold at 1 and is entered several
//! times: the first call interprets and compiles, the commit happens at
//! the next `enter_vm` boundary, and the following calls dispatch into
//! generated code. Results must match the interpreter exactly.

#![cfg(all(
    unix,
    any(
        target_arch = "x86",
        target_arch = "x86_64",
        target_arch = "arm",
        target_arch = "aarch64",
        target_arch = "riscv32",
        target_arch = "riscv64",
    )
))]

use noct_bytecode::{BytecodeEncoder, FunctionImage, FunctionRecord, Opcode};
use noct_engine::{Value, Vm, VmOptions};

fn function(name: &str, params: &[&str], tmpvars: u16, body: Vec<u8>) -> FunctionRecord {
    FunctionRecord {
        name: name.to_string(),
        file_name: format!("{name}.nc"),
        params: params.iter().map(|p| p.to_string()).collect(),
        tmpvar_count: tmpvars,
        body,
    }
}

fn jit_vm() -> Box<Vm> {
    Vm::new(VmOptions {
        jit_enable: true,
        jit_threshold: 1,
        ..VmOptions::default()
    })
}

/// Run `name` several times — interpret-and-compile on the first call,
/// generated code afterwards — and return the last (JIT-dispatched)
/// result for the test's assertions.
fn run_repeatedly(vm: &mut Vm, name: &str, args: &[Value]) -> Value {
    let env = vm.default_env();
    let mut last = env.enter_vm(name, args).unwrap();
    for _ in 0..4 {
        last = env.enter_vm(name, args).unwrap();
    }
    last
}

#[test]
fn test_jit_constants_and_assign() {
    let mut enc = BytecodeEncoder::new();
    enc.iconst(1, 41).inc(1).assign(0, 1);
    let image = FunctionImage {
        functions: vec![function("f", &[], 4, enc.finish())],
    };

    let mut vm = jit_vm();
    vm.default_env().register_bytecode(&image.to_bytes()).unwrap();
    assert_eq!(run_repeatedly(&mut vm, "f", &[]).as_int(), Some(42));
}

#[test]
fn test_jit_float_constant() {
    let mut enc = BytecodeEncoder::new();
    enc.fconst(1, 1.25).fconst(2, 2.25).binary(Opcode::Add, 0, 1, 2);
    let image = FunctionImage {
        functions: vec![function("f", &[], 4, enc.finish())],
    };

    let mut vm = jit_vm();
    vm.default_env().register_bytecode(&image.to_bytes()).unwrap();
    assert_eq!(run_repeatedly(&mut vm, "f", &[]).as_float(), Some(3.5));
}

#[test]
fn test_jit_helper_error_path() {
    // Division by zero must unwind out of generated code through the
    // exception epilogue.
    let mut enc = BytecodeEncoder::new();
    enc.iconst(1, 1).iconst(2, 0).binary(Opcode::Div, 0, 1, 2);
    let image = FunctionImage {
        functions: vec![function("f", &[], 4, enc.finish())],
    };

    let mut vm = jit_vm();
    let env = vm.default_env();
    env.register_bytecode(&image.to_bytes()).unwrap();
    for _ in 0..3 {
        assert!(env.enter_vm("f", &[]).is_err());
    }
}

#[test]
fn test_jit_loop_sum() {
    // sum = 0; i = 0; while (i != n) { sum = sum + i; i++; } return sum;
    let mut enc = BytecodeEncoder::new();
    enc.iconst(1, 0).iconst(2, 0);
    let loop_top = enc.pc();
    enc.binary(Opcode::EqI, 3, 2, 0);
    let exit_jump = enc.pc();
    enc.jmp_if_eq(0);
    enc.binary(Opcode::Add, 1, 1, 2);
    enc.inc(2);
    enc.jmp(loop_top);
    let done = enc.pc();
    enc.patch_jump(exit_jump, done);
    enc.assign(0, 1);
    let image = FunctionImage {
        functions: vec![function("sum", &["n"], 8, enc.finish())],
    };

    let mut vm = jit_vm();
    vm.default_env().register_bytecode(&image.to_bytes()).unwrap();
    let ret = run_repeatedly(&mut vm, "sum", &[Value::int(100)]);
    assert_eq!(ret.as_int(), Some(4950));
}

#[test]
fn test_jit_conditional_jumps() {
    // return a < b ? 1 : 2;
    let mut enc = BytecodeEncoder::new();
    enc.binary(Opcode::Lt, 3, 0, 1);
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
    let image = FunctionImage {
        functions: vec![function("min2", &["a", "b"], 8, enc.finish())],
    };

    let mut vm = jit_vm();
    vm.default_env().register_bytecode(&image.to_bytes()).unwrap();
    assert_eq!(
        run_repeatedly(&mut vm, "min2", &[Value::int(1), Value::int(5)]).as_int(),
        Some(1)
    );
    assert_eq!(
        run_repeatedly(&mut vm, "min2", &[Value::int(5), Value::int(1)]).as_int(),
        Some(2)
    );
}

#[test]
fn test_jit_strings_and_containers() {
    // d = {}; d["k"] = "x=" + 42; a = []; a[2] = d; return a[2]["k"];
    let mut enc = BytecodeEncoder::new();
    enc.dconst(1)
        .sconst(2, "x=")
        .iconst(3, 42)
        .binary(Opcode::Add, 4, 2, 3)
        .sconst(5, "k")
        .store_array(1, 5, 4)
        .aconst(6)
        .iconst(7, 2)
        .store_array(6, 7, 1)
        .load_array(8, 6, 7)
        .load_array(0, 8, 5);
    let image = FunctionImage {
        functions: vec![function("f", &[], 12, enc.finish())],
    };

    let mut vm = jit_vm();
    vm.default_env().register_bytecode(&image.to_bytes()).unwrap();
    let ret = run_repeatedly(&mut vm, "f", &[]);
    assert_eq!(vm.default_env().get_string(&ret).unwrap(), "x=42");
}

#[test]
fn test_jit_calls_with_embedded_arg_vectors() {
    // add3(a, b, c) { return a + b + c; }
    // main() { return add3(1, 2, 3) + add3(10, 20, 30); }
    let mut add3 = BytecodeEncoder::new();
    add3.binary(Opcode::Add, 3, 0, 1).binary(Opcode::Add, 0, 3, 2);

    let mut main = BytecodeEncoder::new();
    main.load_symbol(1, "add3")
        .iconst(2, 1)
        .iconst(3, 2)
        .iconst(4, 3)
        .call(5, 1, &[2, 3, 4])
        .iconst(2, 10)
        .iconst(3, 20)
        .iconst(4, 30)
        .call(6, 1, &[2, 3, 4])
        .binary(Opcode::Add, 0, 5, 6);

    let image = FunctionImage {
        functions: vec![
            function("add3", &["a", "b", "c"], 8, add3.finish()),
            function("main", &[], 8, main.finish()),
        ],
    };

    let mut vm = jit_vm();
    vm.default_env().register_bytecode(&image.to_bytes()).unwrap();
    assert_eq!(run_repeatedly(&mut vm, "main", &[]).as_int(), Some(66));
}

#[test]
fn test_jit_this_call_and_symbols() {
    // method(this, x) { return x * 2; }
    // main() { var d = {}; d["twice"] = method; total = d.twice(21); return total; }
    let mut method = BytecodeEncoder::new();
    method.iconst(2, 2).binary(Opcode::Mul, 0, 1, 2);

    let mut main = BytecodeEncoder::new();
    main.dconst(1)
        .load_symbol(2, "method")
        .store_dot(1, "twice", 2)
        .iconst(3, 21)
        .this_call(4, 1, "twice", &[3])
        .store_symbol("total", 4)
        .load_symbol(0, "total");

    let image = FunctionImage {
        functions: vec![
            function("method", &["this", "x"], 4, method.finish()),
            function("main", &[], 8, main.finish()),
        ],
    };

    let mut vm = jit_vm();
    vm.default_env().register_bytecode(&image.to_bytes()).unwrap();
    assert_eq!(run_repeatedly(&mut vm, "main", &[]).as_int(), Some(42));
}

#[test]
fn test_jit_gc_interaction() {
    // Generated code must keep its frame roots visible across the
    // collections its helper calls trigger.
    let mut enc = BytecodeEncoder::new();
    enc.sconst(1, "").iconst(2, 0).iconst(3, 200).sconst(4, "ab");
    let loop_top = enc.pc();
    enc.binary(Opcode::EqI, 5, 2, 3);
    let exit_jump = enc.pc();
    enc.jmp_if_eq(0);
    enc.binary(Opcode::Add, 1, 1, 4);
    enc.inc(2);
    enc.jmp(loop_top);
    let done = enc.pc();
    enc.patch_jump(exit_jump, done);
    enc.assign(0, 1);
    let image = FunctionImage {
        functions: vec![function("f", &[], 8, enc.finish())],
    };

    let mut vm = Vm::new(VmOptions {
        jit_enable: true,
        jit_threshold: 1,
        gc_nursery_size: 4 * 1024,
        gc_graduate_size: 8 * 1024,
        ..VmOptions::default()
    });
    vm.default_env().register_bytecode(&image.to_bytes()).unwrap();
    let ret = run_repeatedly(&mut vm, "f", &[]);
    assert_eq!(vm.default_env().get_string(&ret).unwrap().len(), 400);
}
