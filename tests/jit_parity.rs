//! Interpreter / JIT equivalence
//!
//! For every accepted program and context here, the compiled image must
//! return the same 64-bit value as the interpreter.

#![cfg(target_arch = "x86_64")]

mod common;

use std::sync::Arc;

use bpftron::{Insn, Opcode, UpdateFlag, Vm};
use common::*;

/// Run `insns` through both engines on a copy of `ctx` each and assert
/// identical results.
fn assert_parity(insns: &[Insn], ctx: &[u8]) -> u64 {
    let mut prog = load_verified(insns);

    let mut interp_ctx = ctx.to_vec();
    let interp =
        unsafe { Vm::new(&prog).exec(interp_ctx.as_mut_ptr(), interp_ctx.len()) };

    prog.jit_compile().expect("x86_64 backend is available");
    let mut jit_ctx = ctx.to_vec();
    let jit = unsafe {
        prog.jit_image()
            .unwrap()
            .call(jit_ctx.as_mut_ptr(), jit_ctx.len())
    };

    assert_eq!(interp, jit, "engines disagree for {:?}", insns);
    assert_eq!(interp_ctx, jit_ctx, "context divergence for {:?}", insns);
    interp
}

fn alu_program(op: Opcode, lhs: i32, rhs: i32) -> Vec<Insn> {
    vec![
        mov64(0, lhs),
        Insn::new(op, 0, 1, 0, rhs),
        exit(),
    ]
}

#[test]
fn test_alu64_imm_parity() {
    use Opcode::*;
    for op in [
        Add64Imm, Sub64Imm, Mul64Imm, Div64Imm, Or64Imm, And64Imm, Lsh64Imm, Rsh64Imm,
        Mod64Imm, Xor64Imm, Mov64Imm, Arsh64Imm,
    ] {
        for (lhs, rhs) in [(13, 7), (-13, 7), (0, 3), (i32::MAX, 2), (-1, 33)] {
            assert_parity(&alu_program(op, lhs, rhs), &[]);
        }
    }
}

#[test]
fn test_alu32_imm_parity() {
    use Opcode::*;
    for op in [
        Add32Imm, Sub32Imm, Mul32Imm, Div32Imm, Or32Imm, And32Imm, Lsh32Imm, Rsh32Imm,
        Mod32Imm, Xor32Imm, Mov32Imm, Arsh32Imm,
    ] {
        for (lhs, rhs) in [(13, 7), (-13, 7), (0, 3), (i32::MAX, 2), (-1, 31)] {
            assert_parity(&alu_program(op, lhs, rhs), &[]);
        }
    }
}

#[test]
fn test_alu_reg_parity() {
    use Opcode::*;
    for op in [
        Add64Reg, Sub64Reg, Mul64Reg, Div64Reg, Or64Reg, And64Reg, Lsh64Reg, Rsh64Reg,
        Mod64Reg, Xor64Reg, Mov64Reg, Arsh64Reg, Add32Reg, Sub32Reg, Mul32Reg, Div32Reg,
        Or32Reg, And32Reg, Lsh32Reg, Rsh32Reg, Mod32Reg, Xor32Reg, Mov32Reg, Arsh32Reg,
    ] {
        for (lhs, rhs) in [(100, 9), (-100, 9), (7, 0), (-1, 63)] {
            let insns = [
                mov64(0, lhs),
                mov64(2, rhs),
                Insn::new(op, 0, 2, 0, 0),
                exit(),
            ];
            assert_parity(&insns, &[]);
        }
    }
}

#[test]
fn test_neg_parity() {
    for op in [Opcode::Neg64, Opcode::Neg32] {
        for value in [0, 1, -1, i32::MAX, i32::MIN] {
            let insns = [mov64(0, value), Insn::new(op, 0, 0, 0, 0), exit()];
            assert_parity(&insns, &[]);
        }
    }
}

#[test]
fn test_division_by_zero_parity() {
    use Opcode::*;
    for op in [Div64Reg, Div32Reg, Mod64Reg, Mod32Reg] {
        let insns = [
            mov64(0, -77),
            mov64(2, 0),
            Insn::new(op, 0, 2, 0, 0),
            exit(),
        ];
        assert_parity(&insns, &[]);
    }
}

#[test]
fn test_endian_parity() {
    for op in [Opcode::Le, Opcode::Be] {
        for width in [16, 32, 64] {
            let insns = [
                mov64(0, 0x1234_5678),
                Insn::new(Opcode::Lsh64Imm, 0, 0, 0, 8),
                Insn::new(Opcode::Or64Imm, 0, 0, 0, 0x9a),
                Insn::new(op, 0, 0, 0, width),
                exit(),
            ];
            assert_parity(&insns, &[]);
        }
    }
}

#[test]
fn test_lddw_parity() {
    let [lo, hi] = Insn::lddw(0, 0xfedc_ba98_7654_3210);
    assert_parity(&[lo, hi, exit()], &[]);
}

#[test]
fn test_branch_parity_every_condition() {
    use Opcode::*;
    let ops = [
        JeqImm, JneImm, JgtImm, JgeImm, JltImm, JleImm, JsetImm, JsgtImm, JsgeImm, JsltImm,
        JsleImm, JeqReg, JneReg, JgtReg, JgeReg, JltReg, JleReg, JsetReg, JsgtReg, JsgeReg,
        JsltReg, JsleReg,
    ];
    for op in ops {
        for (lhs, rhs) in [(5, 5), (5, 9), (9, 5), (-5, 5), (5, -5), (-5, -5)] {
            // r0 = 1 when the branch is taken, 2 otherwise.
            let insns = [
                mov64(3, lhs),
                mov64(4, rhs),
                mov64(0, 1),
                Insn::new(op, 3, 4, 1, rhs),
                mov64(0, 2),
                exit(),
            ];
            assert_parity(&insns, &[]);
        }
    }
}

#[test]
fn test_memory_parity_loads_and_stores() {
    use Opcode::*;
    // Exercise every width through the scratch stack, then hash the
    // bytes back out of the context.
    let insns = [
        mov64(2, -2),
        Insn::new(Stxdw, 10, 2, -8, 0),
        Insn::new(Stxw, 10, 2, -12, 0),
        Insn::new(Stxh, 10, 2, -14, 0),
        Insn::new(Stxb, 10, 2, -15, 0),
        Insn::new(Stdw, 10, 0, -24, -3),
        Insn::new(Stw, 10, 0, -28, -4),
        Insn::new(Sth, 10, 0, -30, 300),
        Insn::new(Stb, 10, 0, -31, 77),
        Insn::new(Ldxdw, 0, 10, -8, 0),
        Insn::new(Ldxw, 3, 10, -12, 0),
        add64_reg(0, 3),
        Insn::new(Ldxh, 3, 10, -14, 0),
        add64_reg(0, 3),
        Insn::new(Ldxb, 3, 10, -15, 0),
        add64_reg(0, 3),
        Insn::new(Ldxsw, 3, 10, -28, 0),
        add64_reg(0, 3),
        Insn::new(Ldxsh, 3, 10, -14, 0),
        add64_reg(0, 3),
        Insn::new(Ldxsb, 3, 10, -15, 0),
        add64_reg(0, 3),
        exit(),
    ];
    assert_parity(&insns, &[]);
}

#[test]
fn test_context_store_parity() {
    let insns = [
        ldxdw(0, 1, 0),
        add64(0, 1),
        Insn::new(Opcode::Stxdw, 1, 0, 8, 0),
        exit(),
    ];
    let mut ctx = [0u8; 16];
    ctx[..8].copy_from_slice(&41u64.to_le_bytes());
    assert_eq!(assert_parity(&insns, &ctx), 42);
}

#[test]
fn test_loop_parity() {
    // Sum 1..=1000 with a backward branch.
    let insns = [
        mov64(1, 1000),
        mov64(0, 0),
        add64_reg(0, 1),
        add64(1, -1),
        Insn::new(Opcode::JneImm, 1, 0, -3, 0),
        exit(),
    ];
    assert_eq!(assert_parity(&insns, &[]), 500_500);
}

#[test]
fn test_instruction_cap_parity() {
    // Infinite loop: both engines abort with 0.
    assert_eq!(assert_parity(&[mov64(0, 3), ja(-2), exit()], &[]), 0);
    // A loop that finishes just under the cap returns its value in both.
    let insns = [
        mov64(1, 200_000),
        mov64(0, 7),
        add64(1, -1),
        Insn::new(Opcode::JneImm, 1, 0, -2, 0),
        exit(),
    ];
    assert_eq!(assert_parity(&insns, &[]), 7);
}

#[test]
fn test_map_helper_parity() {
    let insns = [
        stw(10, -4, 7),
        mov64(1, 0),
        mov64_reg(2, 10),
        add64(2, -4),
        call(1),
        jeq(0, 0, 1),
        ldxw(0, 0, 0),
        exit(),
    ];
    let mut prog = load_verified(&insns);
    let map = Arc::new(hash_map(4, 4, 16));
    prog.attach_map(0, map.clone()).unwrap();
    map.update(&7u32.to_le_bytes(), &1234u32.to_le_bytes(), UpdateFlag::Any)
        .unwrap();

    let interp = unsafe { Vm::new(&prog).exec(std::ptr::null_mut(), 0) };
    prog.jit_compile().unwrap();
    let jit = unsafe { prog.jit_image().unwrap().call(std::ptr::null_mut(), 0) };
    assert_eq!(interp, 1234);
    assert_eq!(jit, 1234);
}

#[test]
fn test_map_update_helper_parity() {
    // Insert a key, then read it back host-side after each engine runs.
    let insns = [
        stw(10, -8, 21),
        stw(10, -4, 63),
        mov64(1, 0),
        mov64_reg(2, 10),
        add64(2, -8),
        mov64_reg(3, 10),
        add64(3, -4),
        mov64(4, 0),
        call(2),
        exit(),
    ];
    let mut prog = load_verified(&insns);
    let map = Arc::new(hash_map(4, 4, 16));
    prog.attach_map(0, map.clone()).unwrap();

    let interp = unsafe { Vm::new(&prog).exec(std::ptr::null_mut(), 0) };
    assert_eq!(interp, 0);
    map.delete(&21u32.to_le_bytes()).unwrap();

    prog.jit_compile().unwrap();
    let jit = unsafe { prog.jit_image().unwrap().call(std::ptr::null_mut(), 0) };
    assert_eq!(jit, 0);
    let mut out = [0u8; 4];
    map.lookup(&21u32.to_le_bytes(), &mut out).unwrap();
    assert_eq!(u32::from_le_bytes(out), 63);
}

#[test]
fn test_run_prefers_jit_after_compile() {
    let mut prog = load_verified(&[mov64(0, 11), exit()]);
    let before = unsafe { prog.run(std::ptr::null_mut(), 0) };
    prog.jit_compile().unwrap();
    assert!(prog.jit_image().is_some());
    let after = unsafe { prog.run(std::ptr::null_mut(), 0) };
    assert_eq!(before, after);
}
