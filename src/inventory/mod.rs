//! Inventory — the persistent set of every [`Rid`] ever written.
//!
//! A record is "contained" iff its RID is in the Inventory *or* it has
//! writes pending in a Limbo. The Inventory answers the first half of that
//! question in O(1).
//!
//! # On-disk format
//!
//! Packed little-endian `u64` RIDs, one per 8-byte slot. Two consecutive
//! zero `u64`s mark the end of used data; new writes reuse that tail
//! region. The file grows by memory-mapping in power-of-two steps, an
//! append-log-plus-in-memory-mirror pattern narrowed to a single growable
//! file.
//!
//! # Concurrency
//!
//! Reads consult an in-memory `HashSet<Rid>` guarded by an `RwLock`. A
//! `version` counter is bumped on every insert; optimistic-read locks with
//! no `std` equivalent are approximated this way, so callers that want to
//! detect concurrent growth poll `version()` around their own read instead.


use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapMut;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::common::Rid;

/// Errors raised by [`Inventory`] operations.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Internal consistency error (poisoned lock, corrupt file length).
    #[error("internal error: {0}")]
    Internal(String),
}

const SLOT_SIZE: usize = 8;
const INITIAL_SLOTS: usize = 1024;

/// Persistent, growable set of every [`Rid`] ever accepted by the Engine.
pub struct Inventory {
    path: PathBuf,
    file: RwLock<File>,
    mmap: RwLock<MmapMut>,
    /// Number of 8-byte slots the backing file currently has room for.
    capacity_slots: RwLock<usize>,
    /// Index of the next free slot.
    next_slot: RwLock<usize>,
    set: RwLock<HashSet<Rid>>,
    version: AtomicU64,
}

impl Inventory {
    /// Open (or create) the inventory file at `path`, rebuilding the
    /// in-memory mirror by scanning until the end-of-data sentinel (two
    /// consecutive zero slots).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, InventoryError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let file_len = file.metadata()?.len() as usize;
        let capacity_slots = if file_len == 0 {
            file.set_len((INITIAL_SLOTS * SLOT_SIZE) as u64)?;
            INITIAL_SLOTS
        } else {
            file_len / SLOT_SIZE
        };

        // SAFETY: the file is exclusively owned by this `Inventory` instance
        // for its lifetime; no other process is expected to write to it
        // concurrently, and every access goes through `mmap`'s `RwLock`.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        // Writes are appended sequentially, so the first zero slot marks the
        // start of the unused tail region (a second consecutive zero simply
        // confirms it wasn't a torn write in progress).
        let mut set = HashSet::new();
        let mut next_slot = 0usize;
        for slot in 0..capacity_slots {
            let start = slot * SLOT_SIZE;
            let raw = u64::from_le_bytes(
                mmap[start..start + SLOT_SIZE]
                    .try_into()
                    .map_err(|_| InventoryError::Internal("slot read out of bounds".into()))?,
            );
            if raw == 0 {
                next_slot = slot;
                break;
            }
            set.insert(Rid::new(raw));
            next_slot = slot + 1;
        }

        info!(path = %path.display(), count = set.len(), capacity_slots, "inventory opened");

        Ok(Self {
            path,
            file: RwLock::new(file),
            mmap: RwLock::new(mmap),
            capacity_slots: RwLock::new(capacity_slots),
            next_slot: RwLock::new(next_slot),
            set: RwLock::new(set),
            version: AtomicU64::new(0),
        })
    }

    /// The path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `rid` has ever been recorded.
    pub fn contains(&self, rid: Rid) -> bool {
        let set = self.set.read().unwrap_or_else(|e| e.into_inner());
        set.contains(&rid)
    }

    /// Monotonic counter bumped by every successful [`Inventory::insert`],
    /// usable by callers that want to detect concurrent growth around an
    /// otherwise-unsynchronized read.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Number of distinct RIDs recorded.
    pub fn len(&self) -> usize {
        self.set.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the inventory has ever recorded a RID.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record `rid`. A no-op (and `Ok(false)`) if already present.
    pub fn insert(&self, rid: Rid) -> Result<bool, InventoryError> {
        {
            let set = self.set.read().unwrap_or_else(|e| e.into_inner());
            if set.contains(&rid) {
                return Ok(false);
            }
        }

        let mut next_slot = self.next_slot.write().unwrap_or_else(|e| e.into_inner());
        let mut capacity_slots = self
            .capacity_slots
            .write()
            .unwrap_or_else(|e| e.into_inner());

        if *next_slot + 2 > *capacity_slots {
            self.grow(&mut capacity_slots)?;
        }

        let slot = *next_slot;
        {
            let mut mmap = self.mmap.write().unwrap_or_else(|e| e.into_inner());
            let start = slot * SLOT_SIZE;
            mmap[start..start + SLOT_SIZE].copy_from_slice(&rid.get().to_le_bytes());
            mmap.flush_range(start, SLOT_SIZE)
                .map_err(InventoryError::Io)?;
        }
        *next_slot = slot + 1;

        self.set
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(rid);
        self.version.fetch_add(1, Ordering::AcqRel);

        trace!(rid = rid.get(), slot, "inventory insert");
        Ok(true)
    }

    /// Double the file's slot capacity, leaving new slots zero-filled.
    fn grow(&self, capacity_slots: &mut usize) -> Result<(), InventoryError> {
        let new_capacity = (*capacity_slots).max(1) * 2;
        let new_len = (new_capacity * SLOT_SIZE) as u64;

        {
            let file = self.file.write().unwrap_or_else(|e| e.into_inner());
            file.set_len(new_len)?;
        }

        let new_mmap = {
            let file = self.file.read().unwrap_or_else(|e| e.into_inner());
            // SAFETY: see `open` — sole owner of the file, guarded by locks.
            unsafe { MmapMut::map_mut(&*file)? }
        };

        *self.mmap.write().unwrap_or_else(|e| e.into_inner()) = new_mmap;
        *capacity_slots = new_capacity;

        debug!(path = %self.path.display(), new_capacity, "inventory grown");
        Ok(())
    }
}
