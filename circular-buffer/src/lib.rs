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

//! A byte FIFO over shared memory for one producer and one consumer.
//!
//! The ring lives entirely inside one shared allocation: a 32-byte
//! control block holding the two cursors and the capacity, immediately
//! followed by the payload bytes. Exactly one endpoint advances the head
//! (the producer) and exactly one advances the tail (the consumer);
//! that discipline, plus publishing a cursor only after the payload
//! bytes it covers are written, is the entire concurrency mechanism.
//! There is no lock and nothing blocks: `Full` and `Empty` are immediate
//! results the caller retries on its own schedule.
//!
//! Because the two endpoints may sit in different coherence domains,
//! every touch of the control block and payload goes through the
//! channel's [`AccessClass`].

#![cfg_attr(not(test), no_std)]

use log::error;
use mem_access::AccessClass;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use static_assertions::const_assert_eq;

/// Status codes. Negative discriminants match the on-wire status space
/// shared with the host driver.
#[repr(i8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum CircBufferError {
    /// More bytes requested than the ring can ever hold, or than the
    /// snapshot makes available.
    BadLength = -1,
    /// Head cursor observed at or beyond capacity; control block corrupt.
    BadHeadIndex = -2,
    /// Tail cursor observed at or beyond capacity; control block corrupt.
    BadTailIndex = -3,
    /// Not enough free space for the whole push. Transient; retry later.
    Full = -4,
    /// No data to pop or peek. Transient; retry later.
    Empty = -5,
}

/// Shared-memory control block. Layout is a binary contract with the
/// peer endpoint, which may be built from a different source tree.
#[repr(C, align(8))]
pub struct ControlBlock {
    /// Producer cursor: offset of the next byte to write.
    head_offset: u64,
    /// Consumer cursor: offset of the next byte to read.
    tail_offset: u64,
    /// Payload capacity in bytes. Written at init, read-only after.
    length: u64,
    pad: u64,
}
const_assert_eq!(core::mem::size_of::<ControlBlock>(), 32);
const_assert_eq!(core::mem::align_of::<ControlBlock>(), 8);

/// Size of the control block preceding the payload bytes.
pub const CONTROL_BLOCK_SIZE: usize = core::mem::size_of::<ControlBlock>();

/// A locally-held copy of the two cursors.
///
/// Batched consumers fetch one snapshot, run several reads against it
/// without touching the remote control block, and publish the final
/// tail once at the end.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CursorPair {
    pub head: u64,
    pub tail: u64,
}

impl CursorPair {
    /// Bytes available to read, computed from this snapshot.
    pub fn used_space(&self, capacity: u64) -> u64 {
        if self.head >= self.tail {
            self.head - self.tail
        } else {
            capacity + self.head - self.tail
        }
    }

    /// Bytes that may still be written. The ring never fills completely;
    /// one byte is sacrificed so `head == tail` always means empty.
    pub fn avail_space(&self, capacity: u64) -> u64 { capacity - 1 - self.used_space(capacity) }
}

/// Handle to one circular buffer. The producer and the consumer each
/// hold their own handle to the same region.
pub struct CircularBuffer {
    base: *mut ControlBlock,
    capacity: u64,
    access: AccessClass,
}

// The handle itself is just a pointer + metadata; moving it to the
// endpoint's execution context is the intended use.
unsafe impl Send for CircularBuffer {}

impl CircularBuffer {
    /// Initializes the region at `base` and returns the producer-side
    /// handle. Cursors and the `data_length` payload bytes are zeroed.
    ///
    /// # Safety
    /// `base` must be 8-byte aligned and valid for
    /// `CONTROL_BLOCK_SIZE + data_length` bytes for the life of both
    /// endpoints, and no other initializer may race this one.
    pub unsafe fn init(
        base: *mut u8,
        data_length: u64,
        access: AccessClass,
    ) -> Result<Self, CircBufferError> {
        if data_length == 0 {
            return Err(CircBufferError::BadLength);
        }
        let buffer = Self {
            base: base as *mut ControlBlock,
            capacity: data_length,
            access,
        };
        zero_region(access, buffer.data_ptr(), data_length as usize);
        access.write_u64(buffer.length_ptr(), data_length);
        access.write_u64(buffer.tail_ptr(), 0);
        access.write_u64(buffer.head_ptr(), 0);
        Ok(buffer)
    }

    /// Binds to a region the peer already initialized and returns the
    /// consumer-side handle. The capacity is read once out of the
    /// control block and cached locally.
    ///
    /// # Safety
    /// Same as [`CircularBuffer::init`], and the control block at `base`
    /// must already be initialized.
    pub unsafe fn attach(base: *mut u8, access: AccessClass) -> Result<Self, CircBufferError> {
        let cb = base as *mut ControlBlock;
        let capacity = access.read_u64(core::ptr::addr_of!((*cb).length));
        if capacity == 0 {
            return Err(CircBufferError::BadLength);
        }
        Ok(Self {
            base: cb,
            capacity,
            access,
        })
    }

    /// Payload capacity in bytes. Usable space is one byte less.
    pub fn capacity(&self) -> u64 { self.capacity }

    /// Copies `src` into the ring and publishes the new head. All or
    /// nothing: on any error the cursors are untouched.
    ///
    /// Payload bytes are written before the head, so a consumer that
    /// observes the new head never reads half-written data.
    pub fn push(&self, src: &[u8]) -> Result<(), CircBufferError> {
        let len = src.len() as u64;
        if len > self.capacity {
            return Err(CircBufferError::BadLength);
        }
        if len == 0 {
            return Ok(());
        }
        let cursors = self.fetch_cursors();
        if cursors.avail_space(self.capacity) < len {
            return Err(CircBufferError::Full);
        }
        if cursors.head >= self.capacity {
            error!("circbuffer: head {} outside capacity {}", cursors.head, self.capacity);
            return Err(CircBufferError::BadHeadIndex);
        }

        let until_wrap = self.capacity - cursors.head;
        unsafe {
            if until_wrap >= len {
                self.access
                    .write_bytes(src.as_ptr(), self.data_ptr().add(cursors.head as usize), src.len());
            } else {
                self.access.write_bytes(
                    src.as_ptr(),
                    self.data_ptr().add(cursors.head as usize),
                    until_wrap as usize,
                );
                self.access.write_bytes(
                    src.as_ptr().add(until_wrap as usize),
                    self.data_ptr(),
                    (len - until_wrap) as usize,
                );
            }
        }
        self.publish_head((cursors.head + len) % self.capacity);
        Ok(())
    }

    /// Copies exactly `dst.len()` bytes out of the ring and publishes
    /// the new tail. The bytes are consumed.
    pub fn pop(&self, dst: &mut [u8]) -> Result<(), CircBufferError> {
        let len = dst.len() as u64;
        let cursors = self.fetch_cursors();
        let used = cursors.used_space(self.capacity);
        if used == 0 {
            return Err(CircBufferError::Empty);
        }
        if len > used {
            return Err(CircBufferError::BadLength);
        }
        if cursors.tail >= self.capacity {
            error!("circbuffer: tail {} outside capacity {}", cursors.tail, self.capacity);
            return Err(CircBufferError::BadTailIndex);
        }

        unsafe { self.copy_out(cursors.tail, dst) };
        self.publish_tail((cursors.tail + len) % self.capacity);
        Ok(())
    }

    /// Reads `dst.len()` bytes starting `peek_offset` bytes past the
    /// tail, without consuming anything. Used to inspect a message
    /// header before committing to a full pop.
    pub fn peek(&self, dst: &mut [u8], peek_offset: u64) -> Result<(), CircBufferError> {
        let len = dst.len() as u64;
        let cursors = self.fetch_cursors();
        let used = cursors.used_space(self.capacity);
        if used == 0 {
            return Err(CircBufferError::Empty);
        }
        if peek_offset > used || len > used - peek_offset {
            return Err(CircBufferError::BadLength);
        }
        if cursors.tail >= self.capacity {
            error!("circbuffer: tail {} outside capacity {}", cursors.tail, self.capacity);
            return Err(CircBufferError::BadTailIndex);
        }

        unsafe { self.copy_out((cursors.tail + peek_offset) % self.capacity, dst) };
        Ok(())
    }

    /// Reads `dst.len()` bytes through a locally-held cursor snapshot,
    /// advancing only the snapshot's tail. Nothing is published; the
    /// caller batches its work and calls [`publish_tail`] once at the
    /// end so the producer sees all the space reclaimed at once.
    ///
    /// [`publish_tail`]: CircularBuffer::publish_tail
    pub fn read_at(&self, cursors: &mut CursorPair, dst: &mut [u8]) -> Result<(), CircBufferError> {
        let len = dst.len() as u64;
        let used = cursors.used_space(self.capacity);
        if used == 0 {
            return Err(CircBufferError::Empty);
        }
        if len > used {
            return Err(CircBufferError::BadLength);
        }
        if cursors.tail >= self.capacity {
            error!("circbuffer: snapshot tail {} outside capacity {}", cursors.tail, self.capacity);
            return Err(CircBufferError::BadTailIndex);
        }

        unsafe { self.copy_out(cursors.tail, dst) };
        cursors.tail = (cursors.tail + len) % self.capacity;
        Ok(())
    }

    /// Bytes available to read right now.
    pub fn used_space(&self) -> u64 { self.fetch_cursors().used_space(self.capacity) }

    /// Bytes that may be written right now.
    pub fn avail_space(&self) -> u64 { self.fetch_cursors().avail_space(self.capacity) }

    /// Reads both cursors from the shared control block.
    pub fn fetch_cursors(&self) -> CursorPair {
        unsafe {
            CursorPair {
                head: self.access.read_u64(self.head_ptr()),
                tail: self.access.read_u64(self.tail_ptr()),
            }
        }
    }

    /// Stores the head cursor. Producer side only.
    pub fn publish_head(&self, head: u64) {
        unsafe { self.access.write_u64(self.head_ptr(), head) }
    }

    /// Stores the tail cursor. Consumer side only.
    pub fn publish_tail(&self, tail: u64) {
        unsafe { self.access.write_u64(self.tail_ptr(), tail) }
    }

    /// Copies out of the payload region starting at `from`, wrapping at
    /// capacity. Bounds were checked by the caller.
    unsafe fn copy_out(&self, from: u64, dst: &mut [u8]) {
        let len = dst.len() as u64;
        let until_wrap = self.capacity - from;
        if until_wrap >= len {
            self.access
                .read_bytes(self.data_ptr().add(from as usize), dst.as_mut_ptr(), dst.len());
        } else {
            self.access.read_bytes(
                self.data_ptr().add(from as usize),
                dst.as_mut_ptr(),
                until_wrap as usize,
            );
            self.access.read_bytes(
                self.data_ptr(),
                dst.as_mut_ptr().add(until_wrap as usize),
                (len - until_wrap) as usize,
            );
        }
    }

    fn data_ptr(&self) -> *mut u8 {
        unsafe { (self.base as *mut u8).add(CONTROL_BLOCK_SIZE) }
    }
    fn head_ptr(&self) -> *mut u64 { unsafe { core::ptr::addr_of_mut!((*self.base).head_offset) } }
    fn tail_ptr(&self) -> *mut u64 { unsafe { core::ptr::addr_of_mut!((*self.base).tail_offset) } }
    fn length_ptr(&self) -> *mut u64 { unsafe { core::ptr::addr_of_mut!((*self.base).length) } }
}

unsafe fn zero_region(access: AccessClass, ptr: *mut u8, len: usize) {
    const ZEROS: [u8; 64] = [0u8; 64];
    let mut offset = 0;
    while offset < len {
        let chunk = core::cmp::min(ZEROS.len(), len - offset);
        access.write_bytes(ZEROS.as_ptr(), ptr.add(offset), chunk);
        offset += chunk;
    }
}
