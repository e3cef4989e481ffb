//! The three ordered queues: events, commands and PRI page requests.
//!
//! 3.5 Command and Event queues: each queue is a bounded circular buffer
//! drained in FIFO order. The model replaces the in-memory ring and its
//! PROD/CONS index registers with a bounded deque; capacity and ordering
//! semantics are unchanged.

use std::collections::VecDeque;

use crate::types::{current_time_us, AccessType, Iova, Pasid, SecurityState, StreamId};

/// 4.1.1 Command opcodes.
///
/// The discriminants are the architectural opcode values carried in
/// CMD[0] bits [7:0].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandType {
    /// CMD_PREFETCH_CONFIG(StreamID, SubstreamID): hint to preload
    /// configuration for a stream.
    PrefetchConfig = 0x01,
    /// CMD_PREFETCH_ADDR(address): hint to preload a translation.
    PrefetchAddr = 0x02,
    /// CMD_CFGI_STE(StreamID, Leaf): invalidate the STE for one stream.
    CfgiSte = 0x03,
    /// CMD_CFGI_ALL: invalidate all configuration caches.
    CfgiAll = 0x04,
    /// CMD_TLBI_NH_ALL(VMID): invalidate all non-secure non-hyp entries.
    TlbiNhAll = 0x10,
    /// CMD_TLBI_EL2_ALL: invalidate all EL2 entries.
    TlbiEl2All = 0x20,
    /// CMD_TLBI_S12_VMALL(VMID): invalidate all stage 1 and stage 2
    /// entries for one VM.
    TlbiS12Vmall = 0x28,
    /// CMD_ATC_INV(StreamID, SubstreamID, address range): invalidate the
    /// device-side address translation cache.
    AtcInv = 0x40,
    /// CMD_PRI_RESP(StreamID, SubstreamID, response): answer a page
    /// request.
    PriResp = 0x41,
    /// CMD_RESUME(StreamID, STAG, action): resume a stalled transaction.
    Resume = 0x44,
    /// CMD_SYNC: completion barrier for preceding commands.
    Sync = 0x46,
}

/// Events delivered through the event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    TranslationFault,
    PermissionFault,
    CommandSyncCompletion,
    PriPageRequest,
    AtcInvalidateCompletion,
    ConfigurationError,
    InternalError,
}

impl EventType {
    /// Error code recorded alongside the event.
    pub fn error_code(self) -> u32 {
        match self {
            EventType::TranslationFault => 0x01,
            EventType::PermissionFault => 0x02,
            EventType::ConfigurationError => 0x10,
            EventType::InternalError => 0xFF,
            _ => 0x00,
        }
    }
}

/// One event queue record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventEntry {
    pub event: EventType,
    pub stream_id: StreamId,
    pub pasid: Pasid,
    pub address: Iova,
    pub security_state: SecurityState,
    pub error_code: u32,
    pub timestamp: u64,
}

impl EventEntry {
    pub fn new(
        event: EventType,
        stream_id: StreamId,
        pasid: Pasid,
        address: Iova,
        security_state: SecurityState,
    ) -> Self {
        Self {
            event,
            stream_id,
            pasid,
            address,
            security_state,
            error_code: event.error_code(),
            timestamp: current_time_us(),
        }
    }
}

/// One command queue record. `start_address`/`end_address` carry the
/// ATC_INV range and are ignored by commands without an address payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandEntry {
    pub op: CommandType,
    pub stream_id: StreamId,
    pub pasid: Pasid,
    pub start_address: Iova,
    pub end_address: Iova,
    pub timestamp: u64,
}

impl CommandEntry {
    pub fn new(op: CommandType, stream_id: StreamId, pasid: Pasid, start: Iova, end: Iova) -> Self {
        Self {
            op,
            stream_id,
            pasid,
            start_address: start,
            end_address: end,
            timestamp: current_time_us(),
        }
    }

    /// Invalidate the STE indicated by StreamID.
    pub fn cfgi_ste(stream_id: StreamId) -> Self {
        Self::new(CommandType::CfgiSte, stream_id, 0, 0, 0)
    }

    /// Invalidate all configuration caches.
    pub fn cfgi_all() -> Self {
        Self::new(CommandType::CfgiAll, 0, 0, 0, 0)
    }

    pub fn tlbi_nh_all() -> Self {
        Self::new(CommandType::TlbiNhAll, 0, 0, 0, 0)
    }

    pub fn tlbi_el2_all() -> Self {
        Self::new(CommandType::TlbiEl2All, 0, 0, 0, 0)
    }

    pub fn tlbi_s12_vmall(stream_id: StreamId) -> Self {
        Self::new(CommandType::TlbiS12Vmall, stream_id, 0, 0, 0)
    }

    /// Invalidate a device-side translation range. A zero range addresses
    /// the whole PASID (or stream when `pasid` is zero).
    pub fn atc_inv(stream_id: StreamId, pasid: Pasid, start: Iova, end: Iova) -> Self {
        Self::new(CommandType::AtcInv, stream_id, pasid, start, end)
    }

    pub fn pri_resp(stream_id: StreamId, pasid: Pasid, address: Iova) -> Self {
        Self::new(CommandType::PriResp, stream_id, pasid, address, address)
    }

    pub fn resume(stream_id: StreamId) -> Self {
        Self::new(CommandType::Resume, stream_id, 0, 0, 0)
    }

    /// Completion barrier for every preceding command.
    pub fn sync() -> Self {
        Self::new(CommandType::Sync, 0, 0, 0, 0)
    }
}

/// One PRI queue record, a device page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriEntry {
    pub stream_id: StreamId,
    pub pasid: Pasid,
    pub requested_address: Iova,
    pub access_type: AccessType,
    /// PRG last-request marker.
    pub last_request: bool,
    pub timestamp: u64,
}

impl PriEntry {
    pub fn new(stream_id: StreamId, pasid: Pasid, requested_address: Iova, access_type: AccessType) -> Self {
        Self {
            stream_id,
            pasid,
            requested_address,
            access_type,
            last_request: true,
            timestamp: current_time_us(),
        }
    }
}

/// FIFO queue with a capacity bound.
///
/// Overflow policy is decided by the owner: the controller drops from the
/// front for event and PRI queues and rejects submissions for the command
/// queue.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append to the tail. Fails when the queue is at capacity.
    pub fn push_back(&mut self, entry: T) -> core::result::Result<(), T> {
        if self.is_full() {
            return Err(entry);
        }
        self.entries.push_back(entry);
        Ok(())
    }

    /// Append to the tail, dropping the oldest entry to make room.
    /// Returns the dropped entry, if any.
    pub fn push_back_overwrite(&mut self, entry: T) -> Option<T> {
        let dropped = if self.is_full() {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        dropped
    }

    pub fn front(&self) -> Option<&T> {
        self.entries.front()
    }

    pub fn pop_front(&mut self) -> Option<T> {
        self.entries.pop_front()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Change the capacity, trimming the oldest entries to fit.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.entries.len() > capacity {
            self.entries.pop_front();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// Snapshot copy of the contents, front first.
    pub fn snapshot(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}
