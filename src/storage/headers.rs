//! # View and Arena Header Definitions
//!
//! This module provides the zerocopy header structs that live inside mapped
//! views. Both headers are read and written in place: a `&mut ViewHeader` or
//! `&mut ArenaHeader` obtained from `from_bytes_mut` points directly into the
//! mapping, so every setter is a write-through to the backing file.
//!
//! ## View Header (12 bytes, view offset 0)
//!
//! ```text
//! Offset  Size  Field           Description
//! ------  ----  --------------  ------------------------------------------
//! 0       4     signature       VIEW_SIGNATURE when the view is formatted
//! 4       4     free_space      Sum of payload capacity of all free arenas
//! 8       4     max_free_space  Capacity of the largest free arena
//! ```
//!
//! ## Arena Header (13 bytes)
//!
//! ```text
//! Offset  Size  Field     Description
//! ------  ----  --------  ------------------------------------------------
//! 0       1     status    0 = free, 1 = used
//! 1       4     capacity  Payload bytes following the header
//! 5       4     next      View-relative offset of the next arena (0 = none)
//! 9       4     prev      View-relative offset of the previous arena (0 = none)
//! ```
//!
//! ## Endianness and Alignment
//!
//! All multi-byte fields are little-endian `U32` wrappers, which are
//! `Unaligned`. Arenas start at arbitrary byte offsets, so the headers must
//! never require alignment.

use eyre::{ensure, Result};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{ARENA_HEADER_SIZE, VIEW_HEADER_SIZE, VIEW_SIGNATURE};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaStatus {
    Free = 0x00,
    Used = 0x01,
}

impl ArenaStatus {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => ArenaStatus::Used,
            _ => ArenaStatus::Free,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ViewHeader {
    signature: U32,
    free_space: U32,
    max_free_space: U32,
}

const _: () = assert!(std::mem::size_of::<ViewHeader>() == VIEW_HEADER_SIZE);

impl ViewHeader {
    pub fn new(free_space: u32) -> Self {
        Self {
            signature: U32::new(VIEW_SIGNATURE),
            free_space: U32::new(free_space),
            max_free_space: U32::new(free_space),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= VIEW_HEADER_SIZE,
            "buffer too small for ViewHeader: {} < {}",
            bytes.len(),
            VIEW_HEADER_SIZE
        );

        Self::ref_from_bytes(&bytes[..VIEW_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read ViewHeader: {:?}", e))
    }

    pub fn from_bytes_mut(bytes: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            bytes.len() >= VIEW_HEADER_SIZE,
            "buffer too small for ViewHeader: {} < {}",
            bytes.len(),
            VIEW_HEADER_SIZE
        );

        Self::mut_from_bytes(&mut bytes[..VIEW_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read ViewHeader: {:?}", e))
    }

    pub fn write_to(&self, bytes: &mut [u8]) -> Result<()> {
        ensure!(
            bytes.len() >= VIEW_HEADER_SIZE,
            "buffer too small for ViewHeader: {} < {}",
            bytes.len(),
            VIEW_HEADER_SIZE
        );

        bytes[..VIEW_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.signature.get() == VIEW_SIGNATURE
    }

    pub fn invalidate(&mut self) {
        self.signature = U32::new(0);
    }

    crate::zerocopy_accessors! {
        free_space: u32,
        max_free_space: u32,
    }

    pub fn add_free_space(&mut self, bytes: u32) {
        self.set_free_space(self.free_space().saturating_add(bytes));
    }

    pub fn sub_free_space(&mut self, bytes: u32) {
        self.set_free_space(self.free_space().saturating_sub(bytes));
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ArenaHeader {
    status: u8,
    capacity: U32,
    next: U32,
    prev: U32,
}

const _: () = assert!(std::mem::size_of::<ArenaHeader>() == ARENA_HEADER_SIZE);

impl ArenaHeader {
    pub fn new(status: ArenaStatus, capacity: u32, next: u32, prev: u32) -> Self {
        Self {
            status: status as u8,
            capacity: U32::new(capacity),
            next: U32::new(next),
            prev: U32::new(prev),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= ARENA_HEADER_SIZE,
            "buffer too small for ArenaHeader: {} < {}",
            bytes.len(),
            ARENA_HEADER_SIZE
        );

        Self::ref_from_bytes(&bytes[..ARENA_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read ArenaHeader: {:?}", e))
    }

    pub fn from_bytes_mut(bytes: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            bytes.len() >= ARENA_HEADER_SIZE,
            "buffer too small for ArenaHeader: {} < {}",
            bytes.len(),
            ARENA_HEADER_SIZE
        );

        Self::mut_from_bytes(&mut bytes[..ARENA_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read ArenaHeader: {:?}", e))
    }

    pub fn write_to(&self, bytes: &mut [u8]) -> Result<()> {
        ensure!(
            bytes.len() >= ARENA_HEADER_SIZE,
            "buffer too small for ArenaHeader: {} < {}",
            bytes.len(),
            ARENA_HEADER_SIZE
        );

        bytes[..ARENA_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn status(&self) -> ArenaStatus {
        ArenaStatus::from_byte(self.status)
    }

    pub fn set_status(&mut self, status: ArenaStatus) {
        self.status = status as u8;
    }

    pub fn is_free(&self) -> bool {
        self.status() == ArenaStatus::Free
    }

    crate::zerocopy_accessors! {
        capacity: u32,
        next: u32,
        prev: u32,
    }

    pub fn has_next(&self) -> bool {
        self.next.get() != 0
    }

    pub fn has_prev(&self) -> bool {
        self.prev.get() != 0
    }
}
