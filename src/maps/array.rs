//! Array map backend
//!
//! Keys are 32-bit little-endian indices in `0..max_entries`. Storage is
//! one contiguous value buffer plus an atomic occupancy bitmap; slot
//! publication is a release store of the occupancy bit after the value
//! bytes land. Concurrent writers to the same index race bytewise; the
//! last writer wins.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{ByteOrder, LittleEndian};

use crate::alloc::{alloc_zeroed_bytes, dealloc_bytes};
use crate::error::{Error, Result};
use crate::maps::{MapAttr, UpdateFlag};

pub(crate) struct ArrayMap {
    value_size: usize,
    max_entries: usize,
    data: NonNull<u8>,
    data_len: usize,
    occupied: Box<[AtomicU64]>,
}

// The raw buffer is owned by the map; cross-thread access goes through
// the atomic bitmap plus raw byte copies.
unsafe impl Send for ArrayMap {}
unsafe impl Sync for ArrayMap {}

impl ArrayMap {
    pub(crate) fn new(attr: &MapAttr) -> Result<ArrayMap> {
        // Array keys are indices; nothing else decodes.
        if attr.key_size != 4 {
            return Err(Error::InvalidArgument);
        }
        let value_size = attr.value_size as usize;
        let max_entries = attr.max_entries as usize;
        let data_len = value_size
            .checked_mul(max_entries)
            .ok_or(Error::InvalidArgument)?;
        let words = max_entries.div_ceil(64);
        let occupied = (0..words).map(|_| AtomicU64::new(0)).collect();
        Ok(ArrayMap {
            value_size,
            max_entries,
            data: alloc_zeroed_bytes(data_len),
            data_len,
            occupied,
        })
    }

    fn index(&self, key: &[u8]) -> Result<usize> {
        let index = LittleEndian::read_u32(key) as usize;
        if index >= self.max_entries {
            return Err(Error::InvalidArgument);
        }
        Ok(index)
    }

    fn is_occupied(&self, index: usize) -> bool {
        let word = self.occupied[index / 64].load(Ordering::Acquire);
        word & (1 << (index % 64)) != 0
    }

    fn slot_ptr(&self, index: usize) -> NonNull<u8> {
        debug_assert!(index < self.max_entries);
        // In bounds: index < max_entries and the buffer spans
        // max_entries * value_size bytes.
        unsafe { NonNull::new_unchecked(self.data.as_ptr().add(index * self.value_size)) }
    }

    pub(crate) fn lookup(&self, key: &[u8], value_out: &mut [u8]) -> Result<()> {
        let index = self.index(key)?;
        if !self.is_occupied(index) {
            return Err(Error::NotFound);
        }
        unsafe {
            ptr::copy_nonoverlapping(
                self.slot_ptr(index).as_ptr(),
                value_out.as_mut_ptr(),
                self.value_size,
            );
        }
        Ok(())
    }

    pub(crate) fn lookup_kern(&self, key: &[u8]) -> Option<NonNull<u8>> {
        let index = self.index(key).ok()?;
        if !self.is_occupied(index) {
            return None;
        }
        // Array storage is never reclaimed before the map itself, so the
        // pointer needs no deferred-free protocol.
        Some(self.slot_ptr(index))
    }

    pub(crate) fn update(&self, key: &[u8], value: &[u8], flag: UpdateFlag) -> Result<()> {
        let index = self.index(key)?;
        let occupied = self.is_occupied(index);
        match flag {
            UpdateFlag::NoExist if occupied => return Err(Error::AlreadyExists),
            UpdateFlag::Exist if !occupied => return Err(Error::NotFound),
            _ => {}
        }
        unsafe {
            ptr::copy_nonoverlapping(
                value.as_ptr(),
                self.slot_ptr(index).as_ptr(),
                self.value_size,
            );
        }
        self.occupied[index / 64].fetch_or(1 << (index % 64), Ordering::Release);
        Ok(())
    }

    pub(crate) fn delete(&self, key: &[u8]) -> Result<()> {
        let index = self.index(key)?;
        let mask = 1u64 << (index % 64);
        let prev = self.occupied[index / 64].fetch_and(!mask, Ordering::Release);
        if prev & mask == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    pub(crate) fn next_key(&self, prev: Option<&[u8]>, key_out: &mut [u8]) -> Result<()> {
        let start = match prev {
            Some(prev) => {
                let index = LittleEndian::read_u32(prev) as usize;
                if index >= self.max_entries {
                    0
                } else {
                    index + 1
                }
            }
            None => 0,
        };
        for index in start..self.max_entries {
            if self.is_occupied(index) {
                LittleEndian::write_u32(key_out, index as u32);
                return Ok(());
            }
        }
        Err(Error::NotFound)
    }
}

impl Drop for ArrayMap {
    fn drop(&mut self) {
        unsafe { dealloc_bytes(self.data, self.data_len) };
    }
}
