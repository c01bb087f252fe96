//! Hash table map backend
//!
//! A fixed-capacity bucket array of intrusive singly-linked chains.
//! Entries are blocks from a preallocated [`BlockAlloc`] holding a header
//! (chain link plus cached hash) followed by the key and value bytes.
//!
//! Writers take a per-bucket mutex and publish with release stores;
//! kernel-side lookups walk chains lock-free under an epoch guard.
//! Removal unlinks under the bucket lock and defers the block's return to
//! the free list until the grace period, so a lookup that raced the
//! removal still reads intact storage. Updates of an existing key rewrite
//! the value bytes in place; a concurrent reader of that entry may see a
//! mix of old and new bytes, but the key set is unchanged.

use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::alloc::BlockAlloc;
use crate::epoch::{self, Guard};
use crate::error::{Error, Result};
use crate::maps::{MapAttr, UpdateFlag};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over the key bytes. Stable within a process, which is all the
/// bucket index requires.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Chain header at the front of every entry block; the key and value
/// bytes follow it.
#[repr(C)]
struct EntryHeader {
    next: AtomicPtr<EntryHeader>,
    hash: u64,
}

struct Bucket {
    head: AtomicPtr<EntryHeader>,
    lock: Mutex<()>,
}

struct SendPtr(*mut u8);

// The pointer travels into a deferred reclamation closure; by the epoch
// contract nothing else references the block when the closure runs.
unsafe impl Send for SendPtr {}

pub(crate) struct HashTable {
    key_size: usize,
    value_size: usize,
    max_entries: usize,
    mask: u64,
    buckets: Box<[Bucket]>,
    count: AtomicUsize,
    arena: Arc<BlockAlloc>,
}

// Chains hold raw pointers into arena blocks; publication and unlinking
// follow the bucket-lock + release-store protocol above.
unsafe impl Send for HashTable {}
unsafe impl Sync for HashTable {}

impl HashTable {
    pub(crate) fn new(attr: &MapAttr) -> Result<HashTable> {
        let key_size = attr.key_size as usize;
        let value_size = attr.value_size as usize;
        let max_entries = attr.max_entries as usize;

        let align = mem::align_of::<*mut u8>();
        let payload = mem::size_of::<EntryHeader>() + key_size + value_size;
        let block_size = payload.div_ceil(align) * align;
        let arena = Arc::new(BlockAlloc::new(block_size)?);
        arena.prealloc(max_entries)?;

        let nbuckets = max_entries.next_power_of_two().max(8);
        let buckets = (0..nbuckets)
            .map(|_| Bucket {
                head: AtomicPtr::new(ptr::null_mut()),
                lock: Mutex::new(()),
            })
            .collect();

        Ok(HashTable {
            key_size,
            value_size,
            max_entries,
            mask: (nbuckets - 1) as u64,
            buckets,
            count: AtomicUsize::new(0),
            arena,
        })
    }

    fn bucket(&self, hash: u64) -> &Bucket {
        &self.buckets[(hash & self.mask) as usize]
    }

    unsafe fn key_of<'a>(&self, entry: *mut EntryHeader) -> &'a [u8] {
        let base = entry.add(1) as *const u8;
        std::slice::from_raw_parts(base, self.key_size)
    }

    unsafe fn value_ptr(&self, entry: *mut EntryHeader) -> NonNull<u8> {
        let base = (entry.add(1) as *mut u8).add(self.key_size);
        NonNull::new_unchecked(base)
    }

    /// Walk a chain looking for `key`. Callers either hold the bucket
    /// lock or an epoch guard; both keep every traversed block alive.
    fn find(&self, bucket: &Bucket, hash: u64, key: &[u8]) -> Option<NonNull<EntryHeader>> {
        let mut cur = bucket.head.load(Ordering::Acquire);
        while !cur.is_null() {
            unsafe {
                if (*cur).hash == hash && self.key_of(cur) == key {
                    return Some(NonNull::new_unchecked(cur));
                }
                cur = (*cur).next.load(Ordering::Acquire);
            }
        }
        None
    }

    pub(crate) fn lookup(&self, key: &[u8], value_out: &mut [u8]) -> Result<()> {
        let hash = fnv1a(key);
        let bucket = self.bucket(hash);
        let _guard = bucket.lock.lock();
        let entry = self.find(bucket, hash, key).ok_or(Error::NotFound)?;
        unsafe {
            ptr::copy_nonoverlapping(
                self.value_ptr(entry.as_ptr()).as_ptr(),
                value_out.as_mut_ptr(),
                self.value_size,
            );
        }
        Ok(())
    }

    pub(crate) fn lookup_kern(&self, key: &[u8], _guard: &Guard) -> Option<NonNull<u8>> {
        let hash = fnv1a(key);
        let entry = self.find(self.bucket(hash), hash, key)?;
        // Valid until the caller's guard unpins: removal defers the
        // block's reuse past the grace period.
        Some(unsafe { self.value_ptr(entry.as_ptr()) })
    }

    pub(crate) fn update(&self, key: &[u8], value: &[u8], flag: UpdateFlag) -> Result<()> {
        let hash = fnv1a(key);
        let bucket = self.bucket(hash);
        let _guard = bucket.lock.lock();

        if let Some(entry) = self.find(bucket, hash, key) {
            if flag == UpdateFlag::NoExist {
                return Err(Error::AlreadyExists);
            }
            unsafe {
                ptr::copy_nonoverlapping(
                    value.as_ptr(),
                    self.value_ptr(entry.as_ptr()).as_ptr(),
                    self.value_size,
                );
            }
            return Ok(());
        }

        if flag == UpdateFlag::Exist {
            return Err(Error::NotFound);
        }
        if self.count.load(Ordering::Relaxed) >= self.max_entries {
            return Err(Error::Busy);
        }

        let block = self.arena.alloc().ok_or(Error::OutOfMemory)?;
        let entry = block.as_ptr() as *mut EntryHeader;
        unsafe {
            ptr::write(
                &mut (*entry).next,
                AtomicPtr::new(bucket.head.load(Ordering::Relaxed)),
            );
            ptr::write(&mut (*entry).hash, hash);
            let key_dst = entry.add(1) as *mut u8;
            ptr::copy_nonoverlapping(key.as_ptr(), key_dst, self.key_size);
            ptr::copy_nonoverlapping(value.as_ptr(), key_dst.add(self.key_size), self.value_size);
        }
        bucket.head.store(entry, Ordering::Release);
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn delete(&self, key: &[u8]) -> Result<()> {
        let hash = fnv1a(key);
        let bucket = self.bucket(hash);
        let _guard = bucket.lock.lock();

        let mut link: &AtomicPtr<EntryHeader> = &bucket.head;
        let removed = loop {
            let cur = link.load(Ordering::Acquire);
            if cur.is_null() {
                return Err(Error::NotFound);
            }
            unsafe {
                if (*cur).hash == hash && self.key_of(cur) == key {
                    link.store((*cur).next.load(Ordering::Relaxed), Ordering::Release);
                    break cur;
                }
                link = &(*cur).next;
            }
        };

        self.count.fetch_sub(1, Ordering::Relaxed);
        let arena = self.arena.clone();
        let block = SendPtr(removed as *mut u8);
        epoch::defer_free(move || unsafe {
            // Move the wrapper, not its field, so the Send impl applies.
            let block = block;
            arena.free(NonNull::new_unchecked(block.0));
        });
        Ok(())
    }

    pub(crate) fn next_key(&self, prev: Option<&[u8]>, key_out: &mut [u8]) -> Result<()> {
        let mut scan_from = 0;
        if let Some(prev) = prev {
            let hash = fnv1a(prev);
            let index = (hash & self.mask) as usize;
            let bucket = &self.buckets[index];
            let _guard = bucket.lock.lock();
            if let Some(entry) = self.find(bucket, hash, prev) {
                let next = unsafe { entry.as_ref().next.load(Ordering::Acquire) };
                if !next.is_null() {
                    unsafe { self.copy_key_out(next, key_out) };
                    return Ok(());
                }
                scan_from = index + 1;
            }
            // An absent prev restarts the iteration from the first key.
        }

        for bucket in &self.buckets[scan_from..] {
            let _guard = bucket.lock.lock();
            let head = bucket.head.load(Ordering::Acquire);
            if !head.is_null() {
                unsafe { self.copy_key_out(head, key_out) };
                return Ok(());
            }
        }
        Err(Error::NotFound)
    }

    unsafe fn copy_key_out(&self, entry: *mut EntryHeader, key_out: &mut [u8]) {
        ptr::copy_nonoverlapping(
            entry.add(1) as *const u8,
            key_out.as_mut_ptr(),
            self.key_size,
        );
    }
}
