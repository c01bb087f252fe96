//! Helper functions callable from bytecode
//!
//! The CALL opcode's immediate selects a helper by id. Helpers receive
//! R1..R5 and return in R0; R1 carries the attached-map slot index for
//! the map helpers, and pointers arrive as raw register values. One
//! dispatch path serves both the interpreter and the JIT's call shims.

use std::slice;

use crate::epoch;
use crate::maps::UpdateFlag;
use crate::prog::MapTable;

/// Helper function identifiers.
///
/// Ids follow the Linux helper numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum HelperId {
    /// (slot, key_ptr) → value pointer, or 0 when absent
    MapLookupElem = 1,
    /// (slot, key_ptr, value_ptr, flags) → 0 or -errno
    MapUpdateElem = 2,
    /// (slot, key_ptr) → 0 or -errno
    MapDeleteElem = 3,
}

impl HelperId {
    /// Decode a CALL immediate.
    pub fn from_raw(raw: i32) -> Option<HelperId> {
        match raw {
            1 => Some(HelperId::MapLookupElem),
            2 => Some(HelperId::MapUpdateElem),
            3 => Some(HelperId::MapDeleteElem),
            _ => None,
        }
    }
}

/// Dispatch a helper call on behalf of a running program.
///
/// The caller has already checked admission for its program type. An
/// unbound slot reports like the operation's own failure mode (lookup
/// misses, update and delete return `-EINVAL`), identically under the
/// interpreter and the JIT.
///
/// # Safety
///
/// `args` holds program register values: the key and value arguments must
/// point to readable memory of the map's key and value sizes. The caller
/// must hold an epoch pin spanning its whole execution so that a returned
/// value pointer stays valid until the program exits.
pub(crate) unsafe fn call(id: HelperId, table: &MapTable, args: [u64; 5]) -> u64 {
    let Some(map) = table.get(args[0] as usize) else {
        return match id {
            HelperId::MapLookupElem => 0,
            _ => crate::error::Error::InvalidArgument.to_reg(),
        };
    };
    let key = slice::from_raw_parts(args[1] as *const u8, map.key_size());

    match id {
        HelperId::MapLookupElem => {
            let guard = epoch::pin();
            match map.lookup_kern(key, &guard) {
                Some(value) => value.as_ptr() as u64,
                None => 0,
            }
        }
        HelperId::MapUpdateElem => {
            let value = slice::from_raw_parts(args[2] as *const u8, map.value_size());
            let update = UpdateFlag::from_raw(args[3]).and_then(|flag| map.update(key, value, flag));
            match update {
                Ok(()) => 0,
                Err(err) => err.to_reg(),
            }
        }
        HelperId::MapDeleteElem => match map.delete(key) {
            Ok(()) => 0,
            Err(err) => err.to_reg(),
        },
    }
}
