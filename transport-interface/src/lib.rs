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

//! Wire-layout contracts shared by both ends of a transport channel.
//!
//! Every message pushed into a virtual queue starts with a header whose
//! first field is the TOTAL message length in bytes (header + payload).
//! The queue's peek window reads exactly that field to learn how much to
//! pop, so the framing needs no out-of-band length channel. These layouts
//! are binary contracts: host driver, service processor and minion
//! firmware are built separately and must agree bit-for-bit.

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;
use static_assertions::const_assert_eq;

/// Size in bytes of [`CommandHeader`] and [`ResponseHeader`].
pub const COMMAND_HEADER_SIZE: usize = 8;

/// Peek window every command/response queue is configured with: the
/// `size` field sits at offset 0 and is 2 bytes wide.
pub const CMD_SIZE_PEEK_OFFSET: u16 = 0;
pub const CMD_SIZE_PEEK_LENGTH: u16 = 2;

bitflags! {
    /// Command header flags bitmask.
    pub struct CommandFlags: u16 {
        /// Hold this command until all earlier commands in the queue retire.
        const BARRIER = 1 << 0;
        /// Collect device timestamps while the command executes.
        const TIMESTAMP = 1 << 1;
    }
}

/// Header carried by every host→device command.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CommandHeader {
    /// Total message length in bytes, header included.
    pub size: u16,
    /// Correlates a command with its response.
    pub tag_id: u16,
    /// Identifies the operation requested.
    pub msg_id: u16,
    /// [`CommandFlags`] bits.
    pub flags: u16,
}
const_assert_eq!(core::mem::size_of::<CommandHeader>(), COMMAND_HEADER_SIZE);
const_assert_eq!(core::mem::align_of::<CommandHeader>(), 2);

impl CommandHeader {
    pub fn new(size: u16, tag_id: u16, msg_id: u16, flags: CommandFlags) -> Self {
        Self {
            size,
            tag_id,
            msg_id,
            flags: flags.bits(),
        }
    }

    /// Total message length in bytes (header + payload).
    pub fn total_size(&self) -> usize { self.size as usize }

    /// Payload bytes following the header; zero for a bare command.
    pub fn payload_size(&self) -> usize {
        (self.size as usize).saturating_sub(COMMAND_HEADER_SIZE)
    }

    pub fn flags(&self) -> CommandFlags { CommandFlags::from_bits_truncate(self.flags) }

    pub fn to_bytes(&self) -> [u8; COMMAND_HEADER_SIZE] {
        let mut bytes = [0u8; COMMAND_HEADER_SIZE];
        bytes[0..2].copy_from_slice(&self.size.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.tag_id.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.msg_id.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.flags.to_le_bytes());
        bytes
    }

    /// Decodes a header from the front of `bytes`; `None` if too short.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < COMMAND_HEADER_SIZE {
            return None;
        }
        Some(Self {
            size: u16::from_le_bytes([bytes[0], bytes[1]]),
            tag_id: u16::from_le_bytes([bytes[2], bytes[3]]),
            msg_id: u16::from_le_bytes([bytes[4], bytes[5]]),
            flags: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }
}

/// Header carried by every device→host response or event.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResponseHeader {
    /// Total message length in bytes, header included.
    pub size: u16,
    /// Tag of the command this responds to.
    pub tag_id: u16,
    /// Matches the originating command's `msg_id`.
    pub msg_id: u16,
    /// Completion status reported by the device.
    pub status: i16,
}
const_assert_eq!(core::mem::size_of::<ResponseHeader>(), COMMAND_HEADER_SIZE);

impl ResponseHeader {
    pub fn new(size: u16, tag_id: u16, msg_id: u16, status: i16) -> Self {
        Self {
            size,
            tag_id,
            msg_id,
            status,
        }
    }

    pub fn total_size(&self) -> usize { self.size as usize }

    pub fn to_bytes(&self) -> [u8; COMMAND_HEADER_SIZE] {
        let mut bytes = [0u8; COMMAND_HEADER_SIZE];
        bytes[0..2].copy_from_slice(&self.size.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.tag_id.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.msg_id.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.status.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < COMMAND_HEADER_SIZE {
            return None;
        }
        Some(Self {
            size: u16::from_le_bytes([bytes[0], bytes[1]]),
            tag_id: u16::from_le_bytes([bytes[2], bytes[3]]),
            msg_id: u16::from_le_bytes([bytes[4], bytes[5]]),
            status: i16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }
}

/// Size in bytes of [`MailboxHeader`].
pub const MAILBOX_HEADER_SIZE: usize = 4;

/// Marks a well-formed mailbox message.
pub const MAILBOX_MAGIC: u16 = 0xBEEF;

/// Framing header on the raw byte mailbox beneath the virtual queues.
///
/// Here `length` counts only the body; the header itself is consumed
/// separately by the reader before it decides what to do with the body.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MailboxHeader {
    /// Body length in bytes (header not included).
    pub length: u16,
    pub magic: u16,
}
const_assert_eq!(core::mem::size_of::<MailboxHeader>(), MAILBOX_HEADER_SIZE);

impl MailboxHeader {
    pub fn new(length: u16) -> Self {
        Self {
            length,
            magic: MAILBOX_MAGIC,
        }
    }

    pub fn is_valid(&self) -> bool { self.magic == MAILBOX_MAGIC && self.length > 0 }

    pub fn to_bytes(&self) -> [u8; MAILBOX_HEADER_SIZE] {
        let mut bytes = [0u8; MAILBOX_HEADER_SIZE];
        bytes[0..2].copy_from_slice(&self.length.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < MAILBOX_HEADER_SIZE {
            return None;
        }
        Some(Self {
            length: u16::from_le_bytes([bytes[0], bytes[1]]),
            magic: u16::from_le_bytes([bytes[2], bytes[3]]),
        })
    }
}
