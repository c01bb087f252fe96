//! Program object
//!
//! A program binds an owned instruction vector, its type, the table of
//! attached maps, and (optionally) a JIT-compiled image into one loadable
//! unit. The instruction stream refers to attached maps by slot index;
//! the table translates slots into shared map references at helper-call
//! time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::helpers::HelperId;
use crate::insn::Insn;
use crate::jit::{self, JitImage, JitResult};
use crate::maps::Map;
use crate::verifier;
use crate::vm::Vm;

/// Longest admissible program, in instruction slots.
pub const MAX_INSNS: usize = 4096;

/// Attached-map table capacity per program.
pub const MAX_ATTACHED_MAPS: usize = 64;

/// Program type enumeration.
///
/// Each type resolves its own operation set at init; today that is the
/// helper admission predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgType {
    /// Host-driven test execution
    Test,
}

impl ProgType {
    /// Decode a control-plane type tag; the zero tag and everything past
    /// the defined range are rejected, so sentinel types are
    /// unconstructible.
    pub fn from_raw(raw: u32) -> Result<ProgType> {
        match raw {
            1 => Ok(ProgType::Test),
            _ => Err(Error::InvalidArgument),
        }
    }

    /// The control-plane tag for this type.
    pub fn as_raw(self) -> u32 {
        match self {
            ProgType::Test => 1,
        }
    }

    /// Whether programs of this type may call `helper`.
    pub fn admits_helper(self, helper: HelperId) -> bool {
        match self {
            ProgType::Test => matches!(
                helper,
                HelperId::MapLookupElem | HelperId::MapUpdateElem | HelperId::MapDeleteElem
            ),
        }
    }
}

/// Program creation attributes.
#[derive(Debug, Clone, Copy)]
pub struct ProgAttr<'a> {
    pub prog_type: ProgType,
    /// Instruction vector, copied into the program; non-empty, at most
    /// [`MAX_INSNS`] slots
    pub insns: &'a [Insn],
}

/// Slot-indexed table of attached maps.
///
/// Held behind an `Arc` so its address is stable for the lifetime of the
/// program; the JIT embeds a pointer to it in generated code.
pub struct MapTable {
    slots: RwLock<[Option<Arc<Map>>; MAX_ATTACHED_MAPS]>,
}

impl MapTable {
    fn new() -> MapTable {
        MapTable {
            slots: RwLock::new(std::array::from_fn(|_| None)),
        }
    }

    /// Resolve a slot to its map, if bound.
    pub fn get(&self, slot: usize) -> Option<Arc<Map>> {
        self.slots.read().get(slot)?.clone()
    }

    fn bind(&self, slot: usize, map: Arc<Map>) -> Result<()> {
        let mut slots = self.slots.write();
        let entry = slots.get_mut(slot).ok_or(Error::InvalidArgument)?;
        if entry.is_some() {
            return Err(Error::AlreadyExists);
        }
        *entry = Some(map);
        Ok(())
    }
}

/// A loadable program: owned bytecode, type, attached maps, and an
/// optional JIT image.
pub struct Program {
    prog_type: ProgType,
    insns: Box<[Insn]>,
    // Declared before `maps` so the image (which embeds the table's
    // address) drops first.
    jit: Option<JitImage>,
    maps: Arc<MapTable>,
}

/// Outcome of [`Program::test_run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestRunResult {
    /// R0 of the final repetition
    pub retval: u64,
    /// Mean wall time per repetition
    pub duration: Duration,
}

impl Program {
    /// Validate `attr` and build the program, copying the instructions
    /// into an owned buffer. The attached-map table starts empty and the
    /// JIT image unset.
    pub fn new(attr: &ProgAttr<'_>) -> Result<Program> {
        if attr.insns.is_empty() || attr.insns.len() > MAX_INSNS {
            return Err(Error::InvalidArgument);
        }
        tracing::debug!(
            prog_type = ?attr.prog_type,
            len = attr.insns.len(),
            "program created"
        );
        Ok(Program {
            prog_type: attr.prog_type,
            insns: attr.insns.into(),
            jit: None,
            maps: Arc::new(MapTable::new()),
        })
    }

    #[inline]
    pub fn prog_type(&self) -> ProgType {
        self.prog_type
    }

    #[inline]
    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    /// The program's attached-map table.
    #[inline]
    pub fn map_table(&self) -> &Arc<MapTable> {
        &self.maps
    }

    /// Bind `map` into `slot`.
    ///
    /// Fails with invalid-argument when the slot is out of range and
    /// exists-error when it is already bound.
    pub fn attach_map(&self, slot: usize, map: Arc<Map>) -> Result<()> {
        self.maps.bind(slot, map)
    }

    /// Run the structural verifier over the instruction vector.
    pub fn verify(&self) -> Result<()> {
        verifier::check(&self.insns).map_err(|err| {
            tracing::debug!(%err, "program rejected");
            Error::from(err)
        })
    }

    /// Compile the program to native code, replacing any prior image.
    ///
    /// On targets without a JIT backend this reports
    /// [`jit::JitError::UnsupportedArch`] and the interpreter remains in
    /// use; the two engines are interchangeable at the call site.
    pub fn jit_compile(&mut self) -> JitResult<()> {
        let image = jit::compile(self)?;
        self.jit = Some(image);
        Ok(())
    }

    /// The compiled image, when [`Program::jit_compile`] has succeeded.
    #[inline]
    pub fn jit_image(&self) -> Option<&JitImage> {
        self.jit.as_ref()
    }

    /// Execute against `ctx`, via the JIT image when present.
    ///
    /// # Safety
    ///
    /// The verifier is structural and does not prove memory safety: the
    /// caller must have verified the program and vouches that its loads
    /// and stores only touch `ctx`, the scratch stack, and map values.
    pub unsafe fn run(&self, ctx: *mut u8, ctx_len: usize) -> u64 {
        match &self.jit {
            Some(image) => image.call(ctx, ctx_len),
            None => Vm::new(self).exec(ctx, ctx_len),
        }
    }

    /// Execute `repeat` times against a caller buffer, reporting the last
    /// return value and mean per-run wall time. Services the control
    /// plane's run-program-test command.
    ///
    /// # Safety
    ///
    /// Same contract as [`Program::run`].
    pub unsafe fn test_run(&self, ctx: &mut [u8], repeat: u32) -> TestRunResult {
        let repeat = repeat.max(1);
        let start = Instant::now();
        let mut retval = 0;
        for _ in 0..repeat {
            retval = self.run(ctx.as_mut_ptr(), ctx.len());
        }
        TestRunResult {
            retval,
            duration: start.elapsed() / repeat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maps::{MapAttr, MapType};
    use crate::opcodes::Opcode;

    fn exit_prog() -> Vec<Insn> {
        vec![Insn::new(Opcode::Exit, 0, 0, 0, 0)]
    }

    fn test_map() -> Arc<Map> {
        Arc::new(
            Map::new(MapAttr {
                map_type: MapType::Array,
                key_size: 4,
                value_size: 8,
                max_entries: 4,
                flags: 0,
            })
            .unwrap(),
        )
    }

    #[test]
    fn test_prog_type_tags() {
        assert_eq!(ProgType::from_raw(1).unwrap(), ProgType::Test);
        assert_eq!(ProgType::from_raw(0), Err(Error::InvalidArgument));
        assert_eq!(ProgType::from_raw(2), Err(Error::InvalidArgument));
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
    fn test_oversized_program_is_rejected() {
        let insns = vec![Insn::new(Opcode::Exit, 0, 0, 0, 0); MAX_INSNS + 1];
        let attr = ProgAttr {
            prog_type: ProgType::Test,
            insns: &insns,
        };
        assert_eq!(Program::new(&attr).err(), Some(Error::InvalidArgument));
    }

    #[test]
    fn test_equal_attrs_build_equal_programs() {
        let insns = exit_prog();
        let attr = ProgAttr {
            prog_type: ProgType::Test,
            insns: &insns,
        };
        let a = Program::new(&attr).unwrap();
        let b = Program::new(&attr).unwrap();
        assert_eq!(a.insns(), b.insns());
        assert_eq!(a.prog_type(), b.prog_type());
    }

    #[test]
    fn test_attach_map_slot_rules() {
        let insns = exit_prog();
        let prog = Program::new(&ProgAttr {
            prog_type: ProgType::Test,
            insns: &insns,
        })
        .unwrap();

        prog.attach_map(0, test_map()).unwrap();
        assert_eq!(
            prog.attach_map(0, test_map()),
            Err(Error::AlreadyExists)
        );
        assert_eq!(
            prog.attach_map(MAX_ATTACHED_MAPS, test_map()),
            Err(Error::InvalidArgument)
        );
        assert!(prog.map_table().get(0).is_some());
        assert!(prog.map_table().get(1).is_none());
    }

    #[test]
    fn test_helper_admission() {
        assert!(ProgType::Test.admits_helper(HelperId::MapLookupElem));
        assert!(ProgType::Test.admits_helper(HelperId::MapUpdateElem));
        assert!(ProgType::Test.admits_helper(HelperId::MapDeleteElem));
    }
}
