//! Map subsystem
//!
//! Maps are the only shared mutable state between the host and running
//! programs: typed, bounded-capacity key→value containers with
//! linearisable single-operation semantics. Two backends are provided,
//! a fixed-capacity array indexed by 32-bit keys and a fixed-capacity
//! hash table over arbitrary byte-string keys.
//!
//! The host-facing operations copy keys and values by value; no caller
//! buffer is ever retained. Running programs use [`Map::lookup_kern`],
//! which returns an interior pointer valid for the caller's epoch guard:
//! removals defer reclamation to the grace period (see [`crate::epoch`]).
//!
//! Dispatch is a closed type enum matched exhaustively; constructing a
//! map of an undefined type is rejected at the attribute boundary, so no
//! stubbed "bad type" backend exists.

mod array;
mod hash;

use std::ptr::NonNull;

use crate::epoch::Guard;
use crate::error::{Error, Result};

use array::ArrayMap;
use hash::HashTable;

/// Largest admissible key, in bytes.
pub const MAX_KEY_SIZE: u32 = 64;

/// Largest admissible value, in bytes.
pub const MAX_VALUE_SIZE: u32 = 65536;

/// Map type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapType {
    /// Fixed-size array; keys are 32-bit indices in `0..max_entries`
    Array,
    /// Fixed-capacity hash table over arbitrary byte-string keys
    HashTable,
}

impl MapType {
    /// Decode a control-plane type tag. The zero tag is reserved-invalid
    /// and everything past the defined range is rejected, so sentinel
    /// types are unconstructible.
    pub fn from_raw(raw: u32) -> Result<MapType> {
        match raw {
            1 => Ok(MapType::Array),
            2 => Ok(MapType::HashTable),
            _ => Err(Error::InvalidArgument),
        }
    }

    /// The control-plane tag for this type.
    pub fn as_raw(self) -> u32 {
        match self {
            MapType::Array => 1,
            MapType::HashTable => 2,
        }
    }
}

/// Update disposition flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFlag {
    /// Insert or overwrite
    Any,
    /// Fail with exists-error when the key is present
    NoExist,
    /// Fail with not-found when the key is absent
    Exist,
}

impl UpdateFlag {
    /// Decode the flag word passed by a program or the control plane.
    pub fn from_raw(raw: u64) -> Result<UpdateFlag> {
        match raw {
            0 => Ok(UpdateFlag::Any),
            1 => Ok(UpdateFlag::NoExist),
            2 => Ok(UpdateFlag::Exist),
            _ => Err(Error::InvalidArgument),
        }
    }
}

/// Map creation attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapAttr {
    pub map_type: MapType,
    /// Key size in bytes; non-zero, at most [`MAX_KEY_SIZE`]
    pub key_size: u32,
    /// Value size in bytes; non-zero, at most [`MAX_VALUE_SIZE`]
    pub value_size: u32,
    /// Capacity; the element count never exceeds it
    pub max_entries: u32,
    /// Behavior bitset; no flags are currently defined for either backend
    pub flags: u32,
}

impl MapAttr {
    fn validate(&self) -> Result<()> {
        if self.key_size == 0 || self.key_size > MAX_KEY_SIZE {
            return Err(Error::InvalidArgument);
        }
        if self.value_size == 0 || self.value_size > MAX_VALUE_SIZE {
            return Err(Error::InvalidArgument);
        }
        if self.max_entries == 0 {
            return Err(Error::InvalidArgument);
        }
        if self.flags != 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

enum MapStore {
    Array(ArrayMap),
    Hash(HashTable),
}

/// A typed, bounded key→value container shared between host and programs.
pub struct Map {
    attr: MapAttr,
    store: MapStore,
}

impl Map {
    /// Validate `attr` and construct the backend.
    pub fn new(attr: MapAttr) -> Result<Map> {
        attr.validate()?;
        let store = match attr.map_type {
            MapType::Array => MapStore::Array(ArrayMap::new(&attr)?),
            MapType::HashTable => MapStore::Hash(HashTable::new(&attr)?),
        };
        tracing::debug!(
            map_type = ?attr.map_type,
            key_size = attr.key_size,
            value_size = attr.value_size,
            max_entries = attr.max_entries,
            "map created"
        );
        Ok(Map { attr, store })
    }

    /// Creation attributes, as validated.
    #[inline]
    pub fn attr(&self) -> &MapAttr {
        &self.attr
    }

    #[inline]
    pub fn key_size(&self) -> usize {
        self.attr.key_size as usize
    }

    #[inline]
    pub fn value_size(&self) -> usize {
        self.attr.value_size as usize
    }

    /// Copy the value stored under `key` into `value_out`.
    ///
    /// `key` must be exactly `key_size` bytes and `value_out` exactly
    /// `value_size`; returns not-found when the key is absent.
    pub fn lookup(&self, key: &[u8], value_out: &mut [u8]) -> Result<()> {
        self.check_key(key)?;
        if value_out.len() != self.value_size() {
            return Err(Error::InvalidArgument);
        }
        match &self.store {
            MapStore::Array(map) => map.lookup(key, value_out),
            MapStore::Hash(map) => map.lookup(key, value_out),
        }
    }

    /// Resolve `key` to a pointer into the stored value.
    ///
    /// The pointer stays valid while `guard`'s epoch is pinned; a removal
    /// of the entry defers reclamation past every such guard. Writes
    /// through the pointer belong to the program's memory model, not the
    /// map's.
    pub fn lookup_kern(&self, key: &[u8], guard: &Guard) -> Option<NonNull<u8>> {
        if key.len() != self.key_size() {
            return None;
        }
        match &self.store {
            MapStore::Array(map) => map.lookup_kern(key),
            MapStore::Hash(map) => map.lookup_kern(key, guard),
        }
    }

    /// Insert or overwrite the value under `key` per `flag`.
    ///
    /// A new key at capacity fails with busy-error.
    pub fn update(&self, key: &[u8], value: &[u8], flag: UpdateFlag) -> Result<()> {
        self.check_key(key)?;
        if value.len() != self.value_size() {
            return Err(Error::InvalidArgument);
        }
        match &self.store {
            MapStore::Array(map) => map.update(key, value, flag),
            MapStore::Hash(map) => map.update(key, value, flag),
        }
    }

    /// Remove the entry under `key`; not-found when absent.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_key(key)?;
        match &self.store {
            MapStore::Array(map) => map.delete(key),
            MapStore::Hash(map) => map.delete(key),
        }
    }

    /// Write the key following `prev` into `key_out`.
    ///
    /// `prev = None` yields the first key; a `prev` that is no longer
    /// present restarts from the first key; not-found past the last key.
    /// Absent concurrent mutation, a full iteration visits every live key
    /// exactly once, in backend-defined order.
    pub fn next_key(&self, prev: Option<&[u8]>, key_out: &mut [u8]) -> Result<()> {
        if let Some(prev) = prev {
            self.check_key(prev)?;
        }
        if key_out.len() != self.key_size() {
            return Err(Error::InvalidArgument);
        }
        match &self.store {
            MapStore::Array(map) => map.next_key(prev, key_out),
            MapStore::Hash(map) => map.next_key(prev, key_out),
        }
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_size() {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        // Backend storage reclaimed by entry removals stays alive through
        // the deferred closures' own references; this only nudges the
        // collector along.
        crate::epoch::synchronize();
    }
}
