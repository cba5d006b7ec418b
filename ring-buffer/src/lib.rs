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

//! Fixed-capacity byte ring for the raw mailbox channel.
//!
//! The lowest mailbox layer runs between two processors sharing one
//! SRAM window. The [`RingBuffer`] struct itself is the wire format,
//! placed directly in that window; each endpoint drives it through its
//! own [`RingHandle`], never through a reference to the struct, because
//! the peer advances its cursor outside this compilation's view. Every
//! cursor and payload access is volatile for the same reason.
//!
//! Same head/tail protocol as the shared-memory circular buffer
//! otherwise: one writer, one reader, at most `N - 1` live bytes so
//! `head == tail` always means empty.
//!
//! Capacity is a per-instance compile-time parameter and must match on
//! both ends of a channel; the two deployed sizes are
//! [`MAILBOX_RING_LENGTH`] and [`CORE_RING_LENGTH`].

#![cfg_attr(not(test), no_std)]

use core::ptr::addr_of_mut;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use static_assertions::const_assert_eq;

/// Ring length of the host↔service-processor mailbox window.
pub const MAILBOX_RING_LENGTH: usize = 2032;

/// Ring length of the per-core message ring.
pub const CORE_RING_LENGTH: usize = 496;

/// Status codes.
#[repr(i8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum RingBufferError {
    /// More bytes requested than are available (read/skip) or free (write).
    BadLength = -1,
}

/// One direction of a mailbox channel. Lives at a fixed address in the
/// shared window; the layout below is a binary contract with the peer.
///
/// Operations go through a [`RingHandle`], not through methods on this
/// struct: two endpoints each hold a handle to the same window, which a
/// `&mut self` API could not express.
#[repr(C, align(8))]
pub struct RingBuffer<const N: usize> {
    head_index: u32,
    tail_index: u32,
    queue: [u8; N],
}

const_assert_eq!(
    core::mem::size_of::<RingBuffer<MAILBOX_RING_LENGTH>>(),
    2040
);
const_assert_eq!(core::mem::size_of::<RingBuffer<CORE_RING_LENGTH>>(), 504);

impl<const N: usize> RingBuffer<N> {
    /// An empty ring, for placing the window in this image's own memory.
    pub const fn new() -> Self {
        Self {
            head_index: 0,
            tail_index: 0,
            queue: [0u8; N],
        }
    }
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self { Self::new() }
}

/// One endpoint's handle to a ring. The writer holds one, the reader
/// holds another; each side advances only its own cursor.
pub struct RingHandle<const N: usize> {
    ring: *mut RingBuffer<N>,
}

// Just a pointer; moving it to the endpoint's execution context is the
// intended use.
unsafe impl<const N: usize> Send for RingHandle<N> {}

impl<const N: usize> RingHandle<N> {
    /// Resets both cursors and returns a handle. Does not scrub the
    /// data bytes.
    ///
    /// # Safety
    /// `ring` must be properly aligned and valid for the life of both
    /// endpoints, and only one endpoint may initialize.
    pub unsafe fn init(ring: *mut RingBuffer<N>) -> Self {
        let handle = Self { ring };
        handle.set_tail(0);
        handle.set_head(0);
        handle
    }

    /// Binds to a window the peer already initialized.
    ///
    /// # Safety
    /// Same as [`RingHandle::init`], against an initialized window.
    pub unsafe fn attach(ring: *mut RingBuffer<N>) -> Self { Self { ring } }

    /// Bytes available to read.
    pub fn used(&self) -> usize {
        let head = self.head();
        let tail = self.tail();
        if head >= tail {
            head - tail
        } else {
            N + head - tail
        }
    }

    /// Bytes that may still be written.
    pub fn free(&self) -> usize { N - 1 - self.used() }

    pub fn is_empty(&self) -> bool { self.used() == 0 }

    pub fn is_full(&self) -> bool { self.free() == 0 }

    /// Appends `src` to the ring, returning the byte count written.
    /// All or nothing: `BadLength` if `src` exceeds the free space.
    ///
    /// The head is published after the payload bytes, so a reader that
    /// observes the new head never sees half-written data.
    pub fn write(&self, src: &[u8]) -> Result<usize, RingBufferError> {
        if src.len() > self.free() {
            return Err(RingBufferError::BadLength);
        }
        let mut head = self.head();
        for &byte in src {
            unsafe { self.queue_ptr().add(head).write_volatile(byte) };
            head = (head + 1) % N;
        }
        self.set_head(head);
        Ok(src.len())
    }

    /// Removes `dst.len()` bytes from the front of the ring into `dst`,
    /// returning the byte count read. `BadLength` if the ring holds
    /// fewer bytes than requested.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize, RingBufferError> {
        if dst.len() > self.used() {
            return Err(RingBufferError::BadLength);
        }
        let mut tail = self.tail();
        for byte in dst.iter_mut() {
            *byte = unsafe { self.queue_ptr().add(tail).read_volatile() };
            tail = (tail + 1) % N;
        }
        self.set_tail(tail);
        Ok(dst.len())
    }

    /// Discards `len` bytes from the front of the ring, returning the
    /// count dropped. Used to drop an oversized or malformed message
    /// without a scratch buffer. `BadLength` if fewer bytes are held.
    pub fn skip(&self, len: usize) -> Result<usize, RingBufferError> {
        if len > self.used() {
            return Err(RingBufferError::BadLength);
        }
        self.set_tail((self.tail() + len) % N);
        Ok(len)
    }

    fn head(&self) -> usize {
        unsafe { addr_of_mut!((*self.ring).head_index).read_volatile() as usize }
    }
    fn tail(&self) -> usize {
        unsafe { addr_of_mut!((*self.ring).tail_index).read_volatile() as usize }
    }
    fn set_head(&self, head: usize) {
        unsafe { addr_of_mut!((*self.ring).head_index).write_volatile(head as u32) }
    }
    fn set_tail(&self, tail: usize) {
        unsafe { addr_of_mut!((*self.ring).tail_index).write_volatile(tail as u32) }
    }
    fn queue_ptr(&self) -> *mut u8 {
        unsafe { addr_of_mut!((*self.ring).queue) as *mut u8 }
    }
}
