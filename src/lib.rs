//! bpftron - portable eBPF runtime
//!
//! A runtime for the restricted 64-bit register bytecode: programs
//! supplied by user code are statically validated, then interpreted or
//! JIT-compiled, and executed against typed in-memory maps that both the
//! host and the running program read and write.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                     Program attributes                            │
//! │              (type, instruction vector)                           │
//! └───────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                      Program object                               │
//! │     owned bytecode · attached-map slots · optional JIT image      │
//! └───────────────────────────────────────────────────────────────────┘
//!                  │                               │
//!                  ▼                               ▼
//! ┌───────────────────────────┐   ┌───────────────────────────────────┐
//! │         Verifier          │   │            Execution              │
//! │  structural admission:    │   │  ┌─────────────┐ ┌─────────────┐  │
//! │  opcode table · registers │   │  │ Interpreter │ │ x86_64 JIT  │  │
//! │  branch targets · lddw    │   │  └─────────────┘ └─────────────┘  │
//! │  pairs · trailing exit    │   │         │  map helpers  │         │
//! └───────────────────────────┘   │         ▼               ▼         │
//!                                 │  ┌─────────────────────────────┐  │
//!                                 │  │  Maps (array · hashtable)   │  │
//!                                 │  │  block arena · epoch GC     │  │
//!                                 │  └─────────────────────────────┘  │
//!                                 └───────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use bpftron::{Insn, Opcode, ProgAttr, ProgType, Program};
//!
//! // mov r0, 42; exit
//! let insns = [
//!     Insn::new(Opcode::Mov64Imm, 0, 0, 0, 42),
//!     Insn::new(Opcode::Exit, 0, 0, 0, 0),
//! ];
//! let prog = Program::new(&ProgAttr {
//!     prog_type: ProgType::Test,
//!     insns: &insns,
//! })
//! .unwrap();
//! prog.verify().unwrap();
//!
//! // SAFETY: the program only touches its registers.
//! let ret = unsafe { prog.run(std::ptr::null_mut(), 0) };
//! assert_eq!(ret, 42);
//! ```
//!
//! # Safety model
//!
//! The verifier is structural: it admits programs whose shape is sound
//! but does not prove their loads and stores stay in bounds. Execution
//! entry points are therefore `unsafe`; hosts admitting untrusted
//! bytecode must bound-check by construction (contexts and maps the
//! program can address) or extend verification with range tracking.

pub mod alloc;
pub mod epoch;
pub mod error;
pub mod helpers;
pub mod insn;
pub mod jit;
pub mod maps;
pub mod opcodes;
pub mod prog;
pub mod verifier;
pub mod vm;

pub use error::{Error, Result};
pub use helpers::HelperId;
pub use insn::{Insn, INSN_SIZE};
pub use jit::{JitError, JitImage};
pub use maps::{Map, MapAttr, MapType, UpdateFlag, MAX_KEY_SIZE, MAX_VALUE_SIZE};
pub use opcodes::Opcode;
pub use prog::{ProgAttr, ProgType, Program, TestRunResult, MAX_ATTACHED_MAPS, MAX_INSNS};
pub use verifier::VerifyError;
pub use vm::{Vm, INSN_LIMIT, STACK_SIZE};

pub use alloc::BlockAlloc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_verify_run() {
        let insns = [
            Insn::new(Opcode::Mov64Imm, 0, 0, 0, 21),
            Insn::new(Opcode::Add64Reg, 0, 0, 0, 0),
            Insn::new(Opcode::Exit, 0, 0, 0, 0),
        ];
        let prog = Program::new(&ProgAttr {
            prog_type: ProgType::Test,
            insns: &insns,
        })
        .unwrap();
        prog.verify().unwrap();
        let ret = unsafe { prog.run(std::ptr::null_mut(), 0) };
        assert_eq!(ret, 42);
    }

    #[test]
    fn test_rejected_program_surfaces_invalid_argument() {
        let insns = [Insn::new(Opcode::Mov64Imm, 0, 0, 0, 1)];
        let prog = Program::new(&ProgAttr {
            prog_type: ProgType::Test,
            insns: &insns,
        })
        .unwrap();
        assert_eq!(prog.verify(), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_map_round_trip_through_public_surface() {
        let map = Map::new(MapAttr {
            map_type: MapType::HashTable,
            key_size: 8,
            value_size: 8,
            max_entries: 16,
            flags: 0,
        })
        .unwrap();
        map.update(&1u64.to_le_bytes(), &2u64.to_le_bytes(), UpdateFlag::Any)
            .unwrap();
        let mut out = [0u8; 8];
        map.lookup(&1u64.to_le_bytes(), &mut out).unwrap();
        assert_eq!(u64::from_le_bytes(out), 2);
    }
}
