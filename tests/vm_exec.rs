//! End-to-end program lifecycle and execution tests
//!
//! Load → verify → attach → execute flows driven through the public
//! surface, the way the control plane drives them.

mod common;

use std::sync::Arc;

use bpftron::{Error, Insn, Opcode, ProgAttr, ProgType, Program, UpdateFlag};
use common::*;

#[test]
fn test_invalid_type_tag_is_rejected() {
    assert_eq!(ProgType::from_raw(0), Err(Error::InvalidArgument));
    assert_eq!(ProgType::from_raw(2), Err(Error::InvalidArgument));
    assert_eq!(ProgType::from_raw(u32::MAX), Err(Error::InvalidArgument));
}

#[test]
fn test_empty_program_is_rejected() {
    let attr = ProgAttr {
        prog_type: ProgType::Test,
        insns: &[],
    };
    assert_eq!(Program::new(&attr).err(), Some(Error::InvalidArgument));
}

#[test]
fn test_exit_only_program_returns_initial_r0() {
    let prog = load_verified(&[exit()]);
    let ret = unsafe { prog.run(std::ptr::null_mut(), 0) };
    assert_eq!(ret, 0);
}

#[test]
fn test_program_reads_its_context() {
    let prog = load_verified(&[ldxdw(0, 1, 0), exit()]);
    let mut ctx = 0x00c0_ffeeu64.to_le_bytes();
    let ret = unsafe { prog.run(ctx.as_mut_ptr(), ctx.len()) };
    assert_eq!(ret, 0x00c0_ffee);
}

#[test]
fn test_program_writes_its_context() {
    let prog = load_verified(&[
        mov64(2, 0x55),
        Insn::new(Opcode::Stxdw, 1, 2, 0, 0),
        mov64(0, 1),
        exit(),
    ]);
    let mut ctx = [0u8; 8];
    let ret = unsafe { prog.run(ctx.as_mut_ptr(), ctx.len()) };
    assert_eq!(ret, 1);
    assert_eq!(u64::from_le_bytes(ctx), 0x55);
}

#[test]
fn test_test_run_reports_last_retval() {
    let prog = load_verified(&[mov64(0, 5), exit()]);
    let mut ctx = [0u8; 8];
    let result = unsafe { prog.test_run(&mut ctx, 10) };
    assert_eq!(result.retval, 5);
}

#[test]
fn test_lookup_helper_reads_attached_map() {
    // r0 = map[7] via map_lookup_elem on slot 0, or 0 on a miss.
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
    let prog = load_verified(&insns);
    let map = Arc::new(hash_map(4, 4, 16));
    prog.attach_map(0, map.clone()).unwrap();

    // Miss first, then hit after the host stores a value.
    let ret = unsafe { prog.run(std::ptr::null_mut(), 0) };
    assert_eq!(ret, 0);

    map.update(&7u32.to_le_bytes(), &42u32.to_le_bytes(), UpdateFlag::Any)
        .unwrap();
    let ret = unsafe { prog.run(std::ptr::null_mut(), 0) };
    assert_eq!(ret, 42);
}

#[test]
fn test_update_helper_writes_attached_map() {
    // map[7] = 99 via map_update_elem with the ANY flag.
    let insns = [
        stw(10, -8, 7),
        stw(10, -4, 99),
        mov64(1, 0),
        mov64_reg(2, 10),
        add64(2, -8),
        mov64_reg(3, 10),
        add64(3, -4),
        mov64(4, 0),
        call(2),
        exit(),
    ];
    let prog = load_verified(&insns);
    let map = Arc::new(hash_map(4, 4, 16));
    prog.attach_map(0, map.clone()).unwrap();

    let ret = unsafe { prog.run(std::ptr::null_mut(), 0) };
    assert_eq!(ret, 0);

    let mut out = [0u8; 4];
    map.lookup(&7u32.to_le_bytes(), &mut out).unwrap();
    assert_eq!(u32::from_le_bytes(out), 99);
}

#[test]
fn test_delete_helper_removes_from_attached_map() {
    let insns = [
        stw(10, -4, 7),
        mov64(1, 0),
        mov64_reg(2, 10),
        add64(2, -4),
        call(3),
        exit(),
    ];
    let prog = load_verified(&insns);
    let map = Arc::new(hash_map(4, 4, 16));
    prog.attach_map(0, map.clone()).unwrap();

    map.update(&7u32.to_le_bytes(), &[1; 4], UpdateFlag::Any)
        .unwrap();
    let ret = unsafe { prog.run(std::ptr::null_mut(), 0) };
    assert_eq!(ret, 0);
    let mut out = [0u8; 4];
    assert_eq!(
        map.lookup(&7u32.to_le_bytes(), &mut out),
        Err(Error::NotFound)
    );

    // A second delete reports -ENOENT to the program.
    let ret = unsafe { prog.run(std::ptr::null_mut(), 0) };
    assert_eq!(ret, (-2i64) as u64);
}

#[test]
fn test_unbound_slot_reports_like_a_miss() {
    // Lookup against a slot nothing was attached to.
    let insns = [
        stw(10, -4, 7),
        mov64(1, 5),
        mov64_reg(2, 10),
        add64(2, -4),
        call(1),
        exit(),
    ];
    let prog = load_verified(&insns);
    let ret = unsafe { prog.run(std::ptr::null_mut(), 0) };
    assert_eq!(ret, 0);

    // Update against an unbound slot is -EINVAL.
    let insns = [
        stw(10, -8, 7),
        stw(10, -4, 1),
        mov64(1, 5),
        mov64_reg(2, 10),
        add64(2, -8),
        mov64_reg(3, 10),
        add64(3, -4),
        mov64(4, 0),
        call(2),
        exit(),
    ];
    let prog = load_verified(&insns);
    let ret = unsafe { prog.run(std::ptr::null_mut(), 0) };
    assert_eq!(ret, (-22i64) as u64);
}

#[test]
fn test_update_helper_surfaces_busy_at_capacity() {
    // One-entry map: the second distinct key cannot be inserted.
    let insns = [
        stw(10, -8, 1),
        stw(10, -4, 11),
        mov64(1, 0),
        mov64_reg(2, 10),
        add64(2, -8),
        mov64_reg(3, 10),
        add64(3, -4),
        mov64(4, 0),
        call(2),
        exit(),
    ];
    let prog = load_verified(&insns);
    let map = Arc::new(hash_map(4, 4, 1));
    prog.attach_map(0, map.clone()).unwrap();

    map.update(&9u32.to_le_bytes(), &[0; 4], UpdateFlag::Any)
        .unwrap();
    let ret = unsafe { prog.run(std::ptr::null_mut(), 0) };
    assert_eq!(ret, (-16i64) as u64);
}

#[test]
fn test_instruction_cap_bounds_infinite_loops() {
    let prog = load_verified(&[mov64(0, 1), ja(-2), exit()]);
    let ret = unsafe { prog.run(std::ptr::null_mut(), 0) };
    assert_eq!(ret, 0);
}

#[test]
fn test_reentrant_execution_on_distinct_contexts() {
    // Each thread doubles its own context word in place.
    let insns = [
        ldxdw(0, 1, 0),
        add64_reg(0, 0),
        Insn::new(Opcode::Stxdw, 1, 0, 0, 0),
        exit(),
    ];
    let prog = Arc::new(load_verified(&insns));
    let threads: Vec<_> = (0..8u64)
        .map(|seed| {
            let prog = prog.clone();
            std::thread::spawn(move || {
                let mut ctx = (seed + 1).to_le_bytes();
                let ret = unsafe { prog.run(ctx.as_mut_ptr(), ctx.len()) };
                assert_eq!(ret, (seed + 1) * 2);
                assert_eq!(u64::from_le_bytes(ctx), (seed + 1) * 2);
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }
}
