//! Shared utilities for integration tests
//!
//! Mnemonic-style instruction constructors so test programs read like
//! assembly listings, plus tracing initialization.

#![allow(dead_code)]

use std::sync::Once;

use bpftron::{Insn, Map, MapAttr, MapType, Opcode, ProgAttr, ProgType, Program};

static TRACING: Once = Once::new();

/// Install a subscriber once per test binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Build a TEST-type program from an instruction listing.
pub fn load(insns: &[Insn]) -> Program {
    init_tracing();
    Program::new(&ProgAttr {
        prog_type: ProgType::Test,
        insns,
    })
    .expect("program attributes are valid")
}

/// Build and verify in one step.
pub fn load_verified(insns: &[Insn]) -> Program {
    let prog = load(insns);
    prog.verify().expect("test program should verify");
    prog
}

pub fn hash_map(key_size: u32, value_size: u32, max_entries: u32) -> Map {
    Map::new(MapAttr {
        map_type: MapType::HashTable,
        key_size,
        value_size,
        max_entries,
        flags: 0,
    })
    .expect("map attributes are valid")
}

pub fn array_map(value_size: u32, max_entries: u32) -> Map {
    Map::new(MapAttr {
        map_type: MapType::Array,
        key_size: 4,
        value_size,
        max_entries,
        flags: 0,
    })
    .expect("map attributes are valid")
}

// ===========================================================================
// Mnemonic constructors
// ===========================================================================

pub fn mov64(dst: u8, imm: i32) -> Insn {
    Insn::new(Opcode::Mov64Imm, dst, 0, 0, imm)
}

pub fn mov64_reg(dst: u8, src: u8) -> Insn {
    Insn::new(Opcode::Mov64Reg, dst, src, 0, 0)
}

pub fn mov32(dst: u8, imm: i32) -> Insn {
    Insn::new(Opcode::Mov32Imm, dst, 0, 0, imm)
}

pub fn add64(dst: u8, imm: i32) -> Insn {
    Insn::new(Opcode::Add64Imm, dst, 0, 0, imm)
}

pub fn add64_reg(dst: u8, src: u8) -> Insn {
    Insn::new(Opcode::Add64Reg, dst, src, 0, 0)
}

pub fn stw(dst: u8, off: i16, imm: i32) -> Insn {
    Insn::new(Opcode::Stw, dst, 0, off, imm)
}

pub fn stxdw(dst: u8, off: i16, src: u8) -> Insn {
    Insn::new(Opcode::Stxdw, dst, src, off, 0)
}

pub fn ldxw(dst: u8, src: u8, off: i16) -> Insn {
    Insn::new(Opcode::Ldxw, dst, src, off, 0)
}

pub fn ldxdw(dst: u8, src: u8, off: i16) -> Insn {
    Insn::new(Opcode::Ldxdw, dst, src, off, 0)
}

pub fn ja(off: i16) -> Insn {
    Insn::new(Opcode::Ja, 0, 0, off, 0)
}

pub fn jeq(dst: u8, imm: i32, off: i16) -> Insn {
    Insn::new(Opcode::JeqImm, dst, 0, off, imm)
}

pub fn call(helper: i32) -> Insn {
    Insn::new(Opcode::Call, 0, 0, 0, helper)
}

pub fn exit() -> Insn {
    Insn::new(Opcode::Exit, 0, 0, 0, 0)
}
