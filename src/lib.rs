//! Software model of an ARM System Memory Management Unit (SMMU) v3:
//! stream-isolated two-stage address translation, a bounded translation
//! cache, ordered event/command/PRI queues and fault reporting.

#[macro_use]
extern crate log;

use std::sync::{Mutex, MutexGuard};

mod address_space;
mod config;
mod error;
mod fault;
mod queue;
mod smmu;
mod stream_table;
mod syndrome;
mod tlb;
mod types;

pub use address_space::{AddressSpace, PageEntry};
pub use config::{
    constants, AddressConfiguration, CacheConfiguration, ConfigValidation, QueueConfiguration,
    ResourceLimits, SmmuConfig,
};
pub use error::{Result, SmmuError};
pub use fault::{
    AccessClassification, FaultHandler, FaultMode, FaultRecord, FaultStage, FaultType,
    PrivilegeLevel, DEFAULT_MAX_FAULT_RECORDS,
};
pub use queue::{BoundedQueue, CommandEntry, CommandType, EventEntry, EventType, PriEntry};
pub use smmu::Smmu;
pub use stream_table::{
    AddressSpaceSize, ContextDescriptor, SteConfig, StreamConfig, StreamContext,
    StreamStatistics, StreamTableEntry, TranslationGranule,
};
pub use syndrome::{FaultSyndrome, IMPDEF_SIGNATURE, SYNDROME};
pub use tlb::{CacheStatistics, TlbCache, TlbEntry, TlbKey, DEFAULT_MAX_AGE_US};
pub use types::{
    current_time_us, AccessType, Iova, Ipa, Pa, PagePermissions, Pasid, SecurityState, StreamId,
    TranslationData, MAX_ADDRESS_BITS, MAX_PASID, MAX_STREAM_ID, PAGE_MASK, PAGE_SIZE,
    PAGE_SIZE_BITS, PASID_BITS, STREAM_ID_BITS,
};

/// Lock a mutex, absorbing poisoning: a panicking holder must not wedge
/// the whole device model.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
