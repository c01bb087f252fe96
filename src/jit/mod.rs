//! Template JIT compilation
//!
//! Translates verified programs to native code obeying the interpreter's
//! entry contract: a function taking a context pointer and length and
//! returning the 64-bit R0. The two engines are interchangeable at the
//! call site and bit-equal in their results for every accepted program.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                   Verified instructions                    │
//! └────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │              Per-architecture template emitter             │
//! │   fixed encoding per opcode · stack-resident registers     │
//! │   rel32 branch fixups · block-granular instruction budget  │
//! └────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │                  JitImage (W^X code buffer)                │
//! │   anonymous mapping sealed read+execute · embedded map     │
//! │   table pointer · epoch-pinned entry shim                  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only x86_64 has a backend today; other targets report
//! [`JitError::UnsupportedArch`] and call sites fall back to the
//! interpreter.
//!
//! # Modules
//!
//! - [`runtime`]: helper-call shims entered from generated code
//! - [`x86_64`]: the template emitter

#[cfg(target_arch = "x86_64")]
mod runtime;
#[cfg(target_arch = "x86_64")]
mod x86_64;

use std::fmt;
use std::io;
use std::mem;
use std::sync::Arc;

use memmap2::{Mmap, MmapMut};

use crate::epoch;
use crate::prog::{MapTable, Program};
use crate::verifier::{self, VerifyError};

/// Result alias for JIT compilation.
pub type JitResult<T> = Result<T, JitError>;

/// Errors surfaced by JIT compilation.
#[derive(Debug)]
pub enum JitError {
    /// No backend for the current target architecture
    UnsupportedArch,
    /// The program failed verification
    Rejected(VerifyError),
    /// The code mapping could not be created or sealed
    CodeAlloc(io::Error),
}

impl fmt::Display for JitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedArch => write!(f, "no JIT backend for this architecture"),
            Self::Rejected(err) => write!(f, "program rejected: {}", err),
            Self::CodeAlloc(err) => write!(f, "code buffer allocation failed: {}", err),
        }
    }
}

impl std::error::Error for JitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CodeAlloc(err) => Some(err),
            _ => None,
        }
    }
}

/// A compiled program image: executable code plus the map table its
/// helper calls resolve slots through.
pub struct JitImage {
    code: Mmap,
    code_len: usize,
    maps: Arc<MapTable>,
}

impl JitImage {
    /// The emitted machine code.
    pub fn code(&self) -> &[u8] {
        &self.code[..self.code_len]
    }

    /// The table whose address is embedded in the generated helper calls.
    /// The image holds its own reference so the pointer outlives the code.
    pub fn map_table(&self) -> &Arc<MapTable> {
        &self.maps
    }

    /// Invoke the compiled program.
    ///
    /// Pins an epoch guard around the native call so helper-returned
    /// value pointers stay valid until the program exits, exactly as
    /// under the interpreter.
    ///
    /// # Safety
    ///
    /// Same contract as [`crate::vm::Vm::exec`].
    pub unsafe fn call(&self, ctx: *mut u8, ctx_len: usize) -> u64 {
        let _guard = epoch::pin();
        let entry: unsafe extern "C" fn(*mut u8, u64) -> u64 =
            mem::transmute(self.code.as_ptr());
        entry(ctx, ctx_len as u64)
    }
}

/// Verify and compile `prog`, producing an executable image.
pub fn compile(prog: &Program) -> JitResult<JitImage> {
    verifier::check(prog.insns()).map_err(JitError::Rejected)?;

    #[cfg(target_arch = "x86_64")]
    {
        let code = x86_64::compile(prog.insns(), prog.prog_type(), prog.map_table());
        tracing::debug!(
            insns = prog.insns().len(),
            code_bytes = code.len(),
            "jit compiled"
        );
        seal(&code, prog.map_table().clone())
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        Err(JitError::UnsupportedArch)
    }
}

/// Copy emitted code into an anonymous mapping and seal it executable.
#[cfg_attr(not(target_arch = "x86_64"), allow(dead_code))]
fn seal(code: &[u8], maps: Arc<MapTable>) -> JitResult<JitImage> {
    let mut buf = MmapMut::map_anon(code.len().max(1)).map_err(JitError::CodeAlloc)?;
    buf[..code.len()].copy_from_slice(code);
    let sealed = buf.make_exec().map_err(JitError::CodeAlloc)?;
    Ok(JitImage {
        code: sealed,
        code_len: code.len(),
        maps,
    })
}
