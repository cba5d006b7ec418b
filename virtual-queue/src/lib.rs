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

//! Message framing over a shared-memory circular buffer.
//!
//! A virtual queue turns the byte FIFO into a stream of discrete,
//! variable-length messages without a side channel: every message's
//! header encodes its total length at a fixed offset (the peek window),
//! so the consumer peeks that field first and then pops exactly one
//! message. Submission queues, completion queues and the inter-minion
//! unicast buffers are all instances of this one type.
//!
//! Two consumer paths exist. The simple path ([`VirtualQueue::pop`])
//! re-reads the remote control block on every call. The batched path
//! fetches one cursor snapshot, drains messages against it with
//! [`VirtualQueue::pop_cached`] or [`VirtualQueue::prefetch`] +
//! [`process_command`], and publishes the tail once — one remote
//! round-trip per batch instead of several per message.

#![cfg_attr(not(test), no_std)]

use circular_buffer::{CircBufferError, CircularBuffer, CursorPair, CONTROL_BLOCK_SIZE};
use log::trace;
use mem_access::AccessClass;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use transport_interface::{CommandHeader, COMMAND_HEADER_SIZE};

/// Status codes, extending the circular-buffer code space.
#[repr(i8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum VqError {
    /// See [`CircBufferError::BadLength`].
    BadLength = -1,
    /// See [`CircBufferError::BadHeadIndex`].
    BadHeadIndex = -2,
    /// See [`CircBufferError::BadTailIndex`].
    BadTailIndex = -3,
    /// Not enough free space for the whole message. Transient.
    Full = -4,
    /// A framed message declared a size that cannot be a real message
    /// (zero, or smaller than its own header).
    InvalidCommandSize = -7,
    /// A framed message declared more payload than the queue holds.
    BadPayloadLength = -8,
}

impl From<CircBufferError> for VqError {
    fn from(err: CircBufferError) -> VqError {
        match err {
            CircBufferError::BadLength => VqError::BadLength,
            CircBufferError::BadHeadIndex => VqError::BadHeadIndex,
            CircBufferError::BadTailIndex => VqError::BadTailIndex,
            CircBufferError::Full => VqError::Full,
            // Pop paths turn Empty into "no data" before conversion;
            // anywhere else it means the caller's length math is off.
            CircBufferError::Empty => VqError::BadLength,
        }
    }
}

/// Widest peek window: the length field is decoded into a u64.
pub const MAX_PEEK_LENGTH: u16 = 8;

/// One endpoint of a framed message channel.
pub struct VirtualQueue {
    circ: CircularBuffer,
    peek_offset: u16,
    peek_length: u16,
}

impl VirtualQueue {
    /// Lays a queue over the `size`-byte region at `base` and returns
    /// the producer-side endpoint. The circular buffer's control block
    /// occupies the front of the region; the rest is ring payload.
    ///
    /// `peek_offset`/`peek_length` locate the total-length field inside
    /// every message that will travel this queue.
    ///
    /// # Safety
    /// `base` must be 8-byte aligned and valid for `size` bytes for the
    /// life of both endpoints, and only one endpoint may initialize.
    pub unsafe fn init(
        base: *mut u8,
        size: usize,
        peek_offset: u16,
        peek_length: u16,
        access: AccessClass,
    ) -> Result<Self, VqError> {
        if size <= CONTROL_BLOCK_SIZE {
            return Err(VqError::BadLength);
        }
        if peek_length == 0 || peek_length > MAX_PEEK_LENGTH {
            return Err(VqError::BadLength);
        }
        let circ = CircularBuffer::init(base, (size - CONTROL_BLOCK_SIZE) as u64, access)?;
        Ok(Self {
            circ,
            peek_offset,
            peek_length,
        })
    }

    /// Binds the consumer-side endpoint to a queue the peer initialized.
    /// The peek window is configuration, not shared state: both ends
    /// must agree on it just like they agree on the region itself.
    ///
    /// # Safety
    /// Same as [`VirtualQueue::init`], against an initialized region.
    pub unsafe fn attach(
        base: *mut u8,
        peek_offset: u16,
        peek_length: u16,
        access: AccessClass,
    ) -> Result<Self, VqError> {
        if peek_length == 0 || peek_length > MAX_PEEK_LENGTH {
            return Err(VqError::BadLength);
        }
        let circ = CircularBuffer::attach(base, access)?;
        Ok(Self {
            circ,
            peek_offset,
            peek_length,
        })
    }

    /// Pushes one message. The caller must already have encoded the
    /// message's total size at the queue's peek window.
    pub fn push(&self, data: &[u8]) -> Result<(), VqError> {
        trace!("vq push {} bytes", data.len());
        self.circ.push(data).map_err(VqError::from)
    }

    /// Pops one whole message into `dst`, returning its size, or `Ok(0)`
    /// when the queue is empty. Empty is the normal idle condition, not
    /// an error; the caller polls on its own schedule.
    pub fn pop(&self, dst: &mut [u8]) -> Result<usize, VqError> {
        let mut window = [0u8; MAX_PEEK_LENGTH as usize];
        let window = &mut window[..self.peek_length as usize];
        match self.circ.peek(window, self.peek_offset as u64) {
            Err(CircBufferError::Empty) => return Ok(0),
            Err(e) => return Err(e.into()),
            Ok(()) => {}
        }

        let size = decode_le(window);
        if size == 0 {
            return Err(VqError::InvalidCommandSize);
        }
        if size > dst.len() as u64 {
            return Err(VqError::BadPayloadLength);
        }
        trace!("vq pop {} bytes", size);
        self.circ.pop(&mut dst[..size as usize])?;
        Ok(size as usize)
    }

    /// Batched pop against a locally-held cursor snapshot: reads the
    /// fixed command header, takes the total size from it, then reads
    /// the payload. Only the snapshot's tail advances; the caller
    /// publishes once after draining the batch.
    ///
    /// `used_space` is the byte count the caller computed from the same
    /// snapshot; a message declaring more payload than that is refused.
    pub fn pop_cached(
        &self,
        used_space: u64,
        cursors: &mut CursorPair,
        dst: &mut [u8],
    ) -> Result<usize, VqError> {
        if dst.len() < COMMAND_HEADER_SIZE {
            return Err(VqError::BadLength);
        }
        self.circ.read_at(cursors, &mut dst[..COMMAND_HEADER_SIZE])?;
        // Header is always present and decodable at this point.
        let header = CommandHeader::from_bytes(&dst[..COMMAND_HEADER_SIZE])
            .ok_or(VqError::InvalidCommandSize)?;
        let total = header.total_size();

        if total > COMMAND_HEADER_SIZE {
            let payload = total - COMMAND_HEADER_SIZE;
            if payload as u64 > used_space || total > dst.len() {
                return Err(VqError::BadPayloadLength);
            }
            self.circ.read_at(cursors, &mut dst[COMMAND_HEADER_SIZE..total])?;
            Ok(total)
        } else if total == COMMAND_HEADER_SIZE {
            Ok(total)
        } else {
            Err(VqError::InvalidCommandSize)
        }
    }

    /// Bulk-reads `used_space` bytes into `dst` through the snapshot,
    /// with no framing interpretation. The caller walks the local copy
    /// with [`process_command`] afterwards. An empty batch is a no-op.
    pub fn prefetch(
        &self,
        used_space: u64,
        cursors: &mut CursorPair,
        dst: &mut [u8],
    ) -> Result<(), VqError> {
        if used_space == 0 {
            return Ok(());
        }
        if used_space > dst.len() as u64 {
            return Err(VqError::BadLength);
        }
        self.circ
            .read_at(cursors, &mut dst[..used_space as usize])
            .map_err(VqError::from)
    }

    /// Reads `dst.len()` bytes at `peek_offset` past the tail without
    /// consuming anything.
    pub fn peek(&self, dst: &mut [u8], peek_offset: u16) -> Result<(), VqError> {
        self.circ.peek(dst, peek_offset as u64).map_err(VqError::from)
    }

    /// Whether at least one byte is waiting.
    pub fn data_avail(&self) -> bool { self.circ.used_space() > 0 }

    /// Bytes waiting to be popped.
    pub fn used_space(&self) -> u64 { self.circ.used_space() }

    /// Ring payload capacity in bytes.
    pub fn capacity(&self) -> u64 { self.circ.capacity() }

    /// Reads both cursors from the shared control block.
    pub fn fetch_cursors(&self) -> CursorPair { self.circ.fetch_cursors() }

    pub fn head_offset(&self) -> u64 { self.circ.fetch_cursors().head }
    pub fn tail_offset(&self) -> u64 { self.circ.fetch_cursors().tail }

    /// Publishes a head value. Producer side only.
    pub fn set_head_offset(&self, head: u64) { self.circ.publish_head(head) }

    /// Publishes a tail value, typically the snapshot tail after a
    /// batched drain. Consumer side only.
    pub fn set_tail_offset(&self, tail: u64) { self.circ.publish_tail(tail) }
}

/// Walks one message of a prefetched batch: validates the header at
/// `offset` into `buf` and returns the message's total size so the
/// caller can advance to the next one.
pub fn process_command(buf: &[u8], offset: usize) -> Result<usize, VqError> {
    let header = CommandHeader::from_bytes(buf.get(offset..).unwrap_or(&[]))
        .ok_or(VqError::InvalidCommandSize)?;
    let total = header.total_size();

    if total > COMMAND_HEADER_SIZE {
        if total > buf.len() - offset {
            return Err(VqError::BadPayloadLength);
        }
        Ok(total)
    } else if total == COMMAND_HEADER_SIZE {
        Ok(total)
    } else {
        Err(VqError::InvalidCommandSize)
    }
}

/// Little-endian decode of a 1..=8 byte length field.
fn decode_le(bytes: &[u8]) -> u64 {
    let mut value = [0u8; 8];
    value[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport_interface::{CommandFlags, CMD_SIZE_PEEK_LENGTH, CMD_SIZE_PEEK_OFFSET};

    struct Region {
        mem: Vec<u64>,
    }
    impl Region {
        fn new(size: usize) -> Self {
            Region {
                mem: vec![0u64; (size + 7) / 8],
            }
        }
        fn base(&mut self) -> *mut u8 { self.mem.as_mut_ptr() as *mut u8 }
    }

    fn make(size: usize) -> (Region, VirtualQueue) {
        let mut region = Region::new(size);
        let vq = unsafe {
            VirtualQueue::init(
                region.base(),
                size,
                CMD_SIZE_PEEK_OFFSET,
                CMD_SIZE_PEEK_LENGTH,
                AccessClass::Cached,
            )
        }
        .unwrap();
        (region, vq)
    }

    fn message(tag_id: u16, payload: &[u8]) -> Vec<u8> {
        let total = (COMMAND_HEADER_SIZE + payload.len()) as u16;
        let header = CommandHeader::new(total, tag_id, 1, CommandFlags::empty());
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn init_carves_control_block_out_of_region() {
        let (_region, vq) = make(256);
        assert_eq!(vq.capacity(), (256 - CONTROL_BLOCK_SIZE) as u64);
        assert!(!vq.data_avail());
    }

    #[test]
    fn init_rejects_tiny_region() {
        let mut region = Region::new(CONTROL_BLOCK_SIZE);
        let result = unsafe {
            VirtualQueue::init(
                region.base(),
                CONTROL_BLOCK_SIZE,
                0,
                2,
                AccessClass::Cached,
            )
        };
        assert!(matches!(result, Err(VqError::BadLength)));
    }

    #[test]
    fn init_rejects_bad_peek_window() {
        let mut region = Region::new(256);
        assert!(matches!(
            unsafe { VirtualQueue::init(region.base(), 256, 0, 0, AccessClass::Cached) },
            Err(VqError::BadLength)
        ));
        assert!(matches!(
            unsafe { VirtualQueue::init(region.base(), 256, 0, 9, AccessClass::Cached) },
            Err(VqError::BadLength)
        ));
    }

    #[test]
    fn framing_round_trip() {
        let (_region, vq) = make(256);
        let msg = message(7, &[0xAA; 24]);
        vq.push(&msg).unwrap();
        assert!(vq.data_avail());

        let mut dst = [0u8; 64];
        let size = vq.pop(&mut dst).unwrap();
        assert_eq!(size, msg.len());
        assert_eq!(&dst[..size], &msg[..]);
        assert!(!vq.data_avail());
    }

    #[test]
    fn pop_on_empty_is_no_data_not_error() {
        let (_region, vq) = make(256);
        let mut dst = [0u8; 64];
        assert_eq!(vq.pop(&mut dst), Ok(0));
    }

    #[test]
    fn zero_framed_size_is_invalid_command() {
        let (_region, vq) = make(256);
        // A header whose size field says 0: never a real message.
        let header = CommandHeader::new(0, 1, 1, CommandFlags::empty());
        vq.push(&header.to_bytes()).unwrap();

        let mut dst = [0u8; 64];
        assert_eq!(vq.pop(&mut dst), Err(VqError::InvalidCommandSize));
    }

    #[test]
    fn pop_guards_destination_size() {
        let (_region, vq) = make(256);
        vq.push(&message(1, &[0u8; 32])).unwrap();
        let mut small = [0u8; 16];
        assert_eq!(vq.pop(&mut small), Err(VqError::BadPayloadLength));
    }

    #[test]
    fn push_full_queue_reports_full() {
        let (_region, vq) = make(CONTROL_BLOCK_SIZE + 32);
        vq.push(&message(1, &[0u8; 16])).unwrap(); // 24 of 31 usable bytes
        assert_eq!(vq.push(&message(2, &[0u8; 16])), Err(VqError::Full));
    }

    #[test]
    fn messages_pop_in_fifo_order() {
        let (_region, vq) = make(512);
        for tag in 0..5u16 {
            vq.push(&message(tag, &[tag as u8; 8])).unwrap();
        }
        let mut dst = [0u8; 64];
        for tag in 0..5u16 {
            let size = vq.pop(&mut dst).unwrap();
            let header = CommandHeader::from_bytes(&dst[..size]).unwrap();
            assert_eq!(header.tag_id, tag);
            assert_eq!(&dst[COMMAND_HEADER_SIZE..size], &[tag as u8; 8]);
        }
        assert_eq!(vq.pop(&mut dst), Ok(0));
    }

    #[test]
    fn pop_cached_drains_batch_with_one_publish() {
        let (_region, vq) = make(512);
        let messages: Vec<Vec<u8>> =
            (0..3u16).map(|tag| message(tag, &[tag as u8; 12])).collect();
        for msg in &messages {
            vq.push(msg).unwrap();
        }

        let mut cursors = vq.fetch_cursors();
        let used = cursors.used_space(vq.capacity());
        let mut remaining = used;

        for msg in &messages {
            let mut dst = [0u8; 64];
            let size = vq.pop_cached(remaining, &mut cursors, &mut dst).unwrap();
            assert_eq!(size, msg.len());
            assert_eq!(&dst[..size], &msg[..]);
            remaining -= size as u64;
        }
        assert_eq!(remaining, 0);

        // Producer-visible space is only reclaimed by the publish.
        assert_eq!(vq.used_space(), used);
        vq.set_tail_offset(cursors.tail);
        assert_eq!(vq.used_space(), 0);
    }

    #[test]
    fn pop_cached_rejects_overdeclared_payload() {
        let (_region, vq) = make(256);
        // Header claims 64 total bytes but only the header was pushed.
        let header = CommandHeader::new(64, 1, 1, CommandFlags::empty());
        vq.push(&header.to_bytes()).unwrap();

        let mut cursors = vq.fetch_cursors();
        let used = cursors.used_space(vq.capacity());
        let mut dst = [0u8; 64];
        assert_eq!(
            vq.pop_cached(used - COMMAND_HEADER_SIZE as u64, &mut cursors, &mut dst),
            Err(VqError::BadPayloadLength)
        );
    }

    #[test]
    fn pop_cached_bare_header_message() {
        let (_region, vq) = make(256);
        let header = CommandHeader::new(COMMAND_HEADER_SIZE as u16, 3, 2, CommandFlags::empty());
        vq.push(&header.to_bytes()).unwrap();

        let mut cursors = vq.fetch_cursors();
        let mut dst = [0u8; 64];
        let size = vq
            .pop_cached(cursors.used_space(vq.capacity()), &mut cursors, &mut dst)
            .unwrap();
        assert_eq!(size, COMMAND_HEADER_SIZE);
    }

    #[test]
    fn pop_cached_undersized_total_is_invalid() {
        let (_region, vq) = make(256);
        let header = CommandHeader::new(4, 1, 1, CommandFlags::empty());
        vq.push(&header.to_bytes()).unwrap();

        let mut cursors = vq.fetch_cursors();
        let mut dst = [0u8; 64];
        assert_eq!(
            vq.pop_cached(cursors.used_space(vq.capacity()), &mut cursors, &mut dst),
            Err(VqError::InvalidCommandSize)
        );
    }

    #[test]
    fn prefetch_and_process_match_individual_pops() {
        let (_region, vq) = make(512);
        let messages: Vec<Vec<u8>> =
            (0..4u16).map(|tag| message(tag, &[0x40 + tag as u8; 10])).collect();
        for msg in &messages {
            vq.push(msg).unwrap();
        }

        let mut cursors = vq.fetch_cursors();
        let used = cursors.used_space(vq.capacity()) as usize;
        let mut batch = vec![0u8; used];
        vq.prefetch(used as u64, &mut cursors, &mut batch).unwrap();
        vq.set_tail_offset(cursors.tail);
        assert_eq!(
            vq.fetch_cursors().avail_space(vq.capacity()),
            vq.capacity() - 1
        );

        let mut offset = 0;
        let mut index = 0;
        while offset < used {
            let size = process_command(&batch, offset).unwrap();
            assert_eq!(&batch[offset..offset + size], &messages[index][..]);
            offset += size;
            index += 1;
        }
        assert_eq!(index, messages.len());
    }

    #[test]
    fn prefetch_empty_batch_is_ok() {
        let (_region, vq) = make(256);
        let mut cursors = vq.fetch_cursors();
        let before = cursors;
        vq.prefetch(0, &mut cursors, &mut [0u8; 16]).unwrap();
        assert_eq!(cursors, before);
    }

    #[test]
    fn process_command_flags_bad_framing() {
        // Truncated header.
        assert_eq!(
            process_command(&[0u8; 4], 0),
            Err(VqError::InvalidCommandSize)
        );

        // Declared payload runs past the batch.
        let header = CommandHeader::new(32, 1, 1, CommandFlags::empty());
        let batch = header.to_bytes();
        assert_eq!(process_command(&batch, 0), Err(VqError::BadPayloadLength));

        // Declared total smaller than the header itself.
        let runt = CommandHeader::new(2, 1, 1, CommandFlags::empty());
        assert_eq!(
            process_command(&runt.to_bytes(), 0),
            Err(VqError::InvalidCommandSize)
        );
    }

    #[test]
    fn peek_exposes_arbitrary_header_fields() {
        let (_region, vq) = make(256);
        let msg = message(0x0B0A, &[1, 2, 3]);
        vq.push(&msg).unwrap();

        // tag_id lives at bytes 2..4 of the header.
        let mut tag = [0u8; 2];
        vq.peek(&mut tag, 2).unwrap();
        assert_eq!(u16::from_le_bytes(tag), 0x0B0A);
        assert_eq!(vq.used_space(), msg.len() as u64);
    }

    #[test]
    fn producer_and_consumer_endpoints() {
        let size = 256;
        let mut region = Region::new(size);
        let producer = unsafe {
            VirtualQueue::init(
                region.base(),
                size,
                CMD_SIZE_PEEK_OFFSET,
                CMD_SIZE_PEEK_LENGTH,
                AccessClass::Cached,
            )
        }
        .unwrap();
        let consumer = unsafe {
            VirtualQueue::attach(
                region.base(),
                CMD_SIZE_PEEK_OFFSET,
                CMD_SIZE_PEEK_LENGTH,
                AccessClass::Cached,
            )
        }
        .unwrap();

        let msg = message(11, &[5, 6, 7, 8]);
        producer.push(&msg).unwrap();

        let mut dst = [0u8; 64];
        let size = consumer.pop(&mut dst).unwrap();
        assert_eq!(&dst[..size], &msg[..]);

        // Head/tail pass-throughs agree between the two endpoints.
        assert_eq!(producer.head_offset(), consumer.head_offset());
        assert_eq!(producer.tail_offset(), consumer.tail_offset());
    }

    #[test]
    fn error_codes_match_wire_values() {
        assert_eq!(i8::from(VqError::Full), -4);
        assert_eq!(i8::from(VqError::InvalidCommandSize), -7);
        assert_eq!(i8::from(VqError::BadPayloadLength), -8);
    }
}
