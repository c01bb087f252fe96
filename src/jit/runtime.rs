//! Runtime support entered from generated code
//!
//! One shim per helper id, all with the same C ABI: the program's map
//! table pointer followed by the five helper argument registers. The
//! emitter loads R1..R5 into the SysV argument registers, materializes
//! the table pointer, and calls through one of these.

use crate::helpers::{self, HelperId};
use crate::prog::MapTable;

/// # Safety
///
/// Called only from generated code whose image holds the `Arc` behind
/// `table`; argument registers carry the running program's R1..R5.
pub(super) unsafe extern "C" fn map_lookup(
    table: *const MapTable,
    r1: u64,
    r2: u64,
    r3: u64,
    r4: u64,
    r5: u64,
) -> u64 {
    helpers::call(HelperId::MapLookupElem, &*table, [r1, r2, r3, r4, r5])
}

/// # Safety
///
/// See [`map_lookup`].
pub(super) unsafe extern "C" fn map_update(
    table: *const MapTable,
    r1: u64,
    r2: u64,
    r3: u64,
    r4: u64,
    r5: u64,
) -> u64 {
    helpers::call(HelperId::MapUpdateElem, &*table, [r1, r2, r3, r4, r5])
}

/// # Safety
///
/// See [`map_lookup`].
pub(super) unsafe extern "C" fn map_delete(
    table: *const MapTable,
    r1: u64,
    r2: u64,
    r3: u64,
    r4: u64,
    r5: u64,
) -> u64 {
    helpers::call(HelperId::MapDeleteElem, &*table, [r1, r2, r3, r4, r5])
}

/// Resolve a helper id to its shim's entry address.
pub(super) fn shim_addr(id: HelperId) -> u64 {
    match id {
        HelperId::MapLookupElem => map_lookup as usize as u64,
        HelperId::MapUpdateElem => map_update as usize as u64,
        HelperId::MapDeleteElem => map_delete as usize as u64,
    }
}
