// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Byte-range access to memory shared across coherence domains.
//!
//! A transport endpoint and its peer may share an L2, sit in different
//! power domains, or be separated by a PCIe link. The discipline needed
//! to touch a given range (plain loads/stores, volatile MMIO accesses,
//! or atomics with publication ordering) is therefore a property of the
//! channel, not of the ring code. Channels pick an [`AccessClass`] at
//! setup time and every control-block and payload access goes through it.

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicU64, Ordering};

/// How a shared address range must be accessed.
///
/// The ring logic is identical for all classes; only the load/store
/// sequences differ. Illegal combinations are unrepresentable: a channel
/// carries exactly one class and passes it everywhere.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccessClass {
    /// Both ends share a cache hierarchy; ordinary loads and stores.
    Cached,
    /// Uncached window (MMIO-like); every access is volatile.
    Uncached,
    /// Cursors shared between harts in one domain; acquire/release atomics.
    LocalAtomic,
    /// Cursors shared across the fabric (e.g. host over PCIe);
    /// sequentially-consistent atomics.
    GlobalAtomic,
}

impl AccessClass {
    /// Copies `len` bytes from `src` to `dst` with this class's load
    /// discipline on the source side.
    ///
    /// # Safety
    /// `src` must be valid for `len` reads and `dst` for `len` writes,
    /// and the ranges must not overlap.
    pub unsafe fn read_bytes(self, src: *const u8, dst: *mut u8, len: usize) {
        match self {
            AccessClass::Cached => core::ptr::copy_nonoverlapping(src, dst, len),
            _ => {
                for i in 0..len {
                    dst.add(i).write(src.add(i).read_volatile());
                }
            }
        }
    }

    /// Copies `len` bytes from `src` to `dst` with this class's store
    /// discipline on the destination side.
    ///
    /// # Safety
    /// `src` must be valid for `len` reads and `dst` for `len` writes,
    /// and the ranges must not overlap.
    pub unsafe fn write_bytes(self, src: *const u8, dst: *mut u8, len: usize) {
        match self {
            AccessClass::Cached => core::ptr::copy_nonoverlapping(src, dst, len),
            _ => {
                for i in 0..len {
                    dst.add(i).write_volatile(src.add(i).read());
                }
            }
        }
    }

    /// Loads a naturally-aligned u64 (a ring cursor). For the atomic
    /// classes this is the acquire side of cursor publication: payload
    /// bytes written before the matching [`write_u64`] are visible after
    /// this load returns the published value.
    ///
    /// [`write_u64`]: AccessClass::write_u64
    ///
    /// # Safety
    /// `src` must be valid for reads and 8-byte aligned.
    pub unsafe fn read_u64(self, src: *const u64) -> u64 {
        match self {
            AccessClass::Cached => src.read(),
            AccessClass::Uncached => src.read_volatile(),
            AccessClass::LocalAtomic => (*(src as *const AtomicU64)).load(Ordering::Acquire),
            AccessClass::GlobalAtomic => (*(src as *const AtomicU64)).load(Ordering::SeqCst),
        }
    }

    /// Stores a naturally-aligned u64 (a ring cursor). For the atomic
    /// classes this is a release store: it publishes every payload byte
    /// written before it.
    ///
    /// # Safety
    /// `dst` must be valid for writes and 8-byte aligned.
    pub unsafe fn write_u64(self, dst: *mut u64, val: u64) {
        match self {
            AccessClass::Cached => dst.write(val),
            AccessClass::Uncached => dst.write_volatile(val),
            AccessClass::LocalAtomic => (*(dst as *const AtomicU64)).store(val, Ordering::Release),
            AccessClass::GlobalAtomic => (*(dst as *const AtomicU64)).store(val, Ordering::SeqCst),
        }
    }
}
