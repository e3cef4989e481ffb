//! Fault classification and the ordered fault record store.
//!
//! Chapter 7: faults that terminate or stall a transaction are reported
//! through event records. The model keeps them in a bounded FIFO log with
//! filtering and rate queries on top.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::lock;
use crate::syndrome::FaultSyndrome;
use crate::types::{current_time_us, AccessType, Iova, Pasid, SecurityState, StreamId};

/// Cause of a recorded fault, after classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultType {
    /// F_TRANSLATION: no valid mapping for the input address.
    TranslationFault,
    Level0TranslationFault,
    Level1TranslationFault,
    Level2TranslationFault,
    Level3TranslationFault,
    /// F_PERMISSION: mapping exists but denies the access.
    PermissionFault,
    /// F_ADDR_SIZE: input address exceeds the configured address size.
    AddressSizeFault,
    /// F_ACCESS: access rejected before translation (for example a null
    /// pointer dereference).
    AccessFault,
    SecurityFault,
    AccessFlagFault,
    DirtyBitFault,
    ExternalAbort,
    SynchronousExternalAbort,
    AsynchronousExternalAbort,
    /// F_TLB_CONFLICT: multiple TLB entries match one address.
    TlbConflictFault,
    /// C_BAD_CD: malformed context descriptor.
    ContextDescriptorFormatFault,
    TranslationTableFormatFault,
    /// C_BAD_STE: malformed stream table entry.
    StreamTableFormatFault,
}

/// Which translation stage a fault is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultStage {
    Stage1,
    Stage2,
    BothStages,
    Unknown,
}

/// Fault response policy, STE.S/R fault configuration in 5.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FaultMode {
    /// Abort the faulting transaction immediately.
    #[default]
    Terminate,
    /// Record the fault and leave retry to the integrator.
    Stall,
}

/// Exception level an access is attributed to in the syndrome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrivilegeLevel {
    El0,
    El1,
    El2,
    El3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessClassification {
    DataAccess,
    InstructionFetch,
    Unknown,
}

/// One recorded fault.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaultRecord {
    pub stream_id: StreamId,
    pub pasid: Pasid,
    pub address: Iova,
    pub fault_type: FaultType,
    pub access_type: AccessType,
    pub security_state: SecurityState,
    pub syndrome: FaultSyndrome,
    /// Microsecond timestamp from [`current_time_us`].
    pub timestamp: u64,
}

impl FaultRecord {
    pub fn new(
        stream_id: StreamId,
        pasid: Pasid,
        address: Iova,
        fault_type: FaultType,
        access_type: AccessType,
        security_state: SecurityState,
        syndrome: FaultSyndrome,
    ) -> Self {
        Self {
            stream_id,
            pasid,
            address,
            fault_type,
            access_type,
            security_state,
            syndrome,
            timestamp: current_time_us(),
        }
    }
}

/// Default bound on retained fault records.
pub const DEFAULT_MAX_FAULT_RECORDS: usize = 1000;

struct FaultLog {
    records: VecDeque<FaultRecord>,
    max_records: usize,
    total_faults: u64,
    translation_faults: u64,
    permission_faults: u64,
}

impl FaultLog {
    fn enforce_limit(&mut self) {
        while self.records.len() > self.max_records {
            self.records.pop_front();
        }
    }
}

/// Mutex-serialized fault store. Readers get snapshot copies; insertion
/// order is preserved and the limit trims the oldest records first.
pub struct FaultHandler {
    log: Mutex<FaultLog>,
}

impl FaultHandler {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_FAULT_RECORDS)
    }

    pub fn with_capacity(max_records: usize) -> Self {
        Self {
            log: Mutex::new(FaultLog {
                records: VecDeque::new(),
                max_records,
                total_faults: 0,
                translation_faults: 0,
                permission_faults: 0,
            }),
        }
    }

    /// Append a fault record, then enforce the retention limit.
    pub fn record(&self, fault: FaultRecord) {
        let mut log = lock(&self.log);
        log.total_faults += 1;
        match fault.fault_type {
            FaultType::TranslationFault
            | FaultType::Level0TranslationFault
            | FaultType::Level1TranslationFault
            | FaultType::Level2TranslationFault
            | FaultType::Level3TranslationFault => log.translation_faults += 1,
            FaultType::PermissionFault => log.permission_faults += 1,
            _ => {}
        }
        log.records.push_back(fault);
        log.enforce_limit();
    }

    /// Snapshot of every retained record, oldest first.
    pub fn events(&self) -> Vec<FaultRecord> {
        lock(&self.log).records.iter().copied().collect()
    }

    pub fn clear_events(&self) {
        lock(&self.log).records.clear();
    }

    pub fn has_events(&self) -> bool {
        !lock(&self.log).records.is_empty()
    }

    pub fn event_count(&self) -> usize {
        lock(&self.log).records.len()
    }

    /// Records attributed to one stream.
    pub fn faults_by_stream(&self, stream_id: StreamId) -> Vec<FaultRecord> {
        lock(&self.log)
            .records
            .iter()
            .filter(|f| f.stream_id == stream_id)
            .copied()
            .collect()
    }

    /// Records attributed to one PASID, across streams.
    pub fn faults_by_pasid(&self, pasid: Pasid) -> Vec<FaultRecord> {
        lock(&self.log)
            .records
            .iter()
            .filter(|f| f.pasid == pasid)
            .copied()
            .collect()
    }

    /// Records with `earliest < timestamp <= now` where
    /// `earliest = now - window` (saturating at zero).
    pub fn recent_faults(&self, now: u64, window: u64) -> Vec<FaultRecord> {
        let earliest = now.saturating_sub(window);
        lock(&self.log)
            .records
            .iter()
            .filter(|f| f.timestamp > earliest && f.timestamp <= now)
            .copied()
            .collect()
    }

    /// Number of faults inside the window ending at `now`.
    pub fn fault_rate(&self, now: u64, window: u64) -> u64 {
        let earliest = now.saturating_sub(window);
        lock(&self.log)
            .records
            .iter()
            .filter(|f| f.timestamp > earliest && f.timestamp <= now)
            .count() as u64
    }

    /// Drop records attributed to one stream.
    pub fn clear_stream(&self, stream_id: StreamId) {
        lock(&self.log).records.retain(|f| f.stream_id != stream_id);
    }

    /// Change the retention limit, trimming oldest records to fit.
    pub fn set_max_records(&self, max_records: usize) {
        let mut log = lock(&self.log);
        log.max_records = max_records;
        log.enforce_limit();
    }

    pub fn max_records(&self) -> usize {
        lock(&self.log).max_records
    }

    pub fn total_fault_count(&self) -> u64 {
        lock(&self.log).total_faults
    }

    pub fn translation_fault_count(&self) -> u64 {
        lock(&self.log).translation_faults
    }

    pub fn permission_fault_count(&self) -> u64 {
        lock(&self.log).permission_faults
    }

    /// Count retained records of one fault type.
    pub fn fault_count_by_type(&self, fault_type: FaultType) -> usize {
        lock(&self.log)
            .records
            .iter()
            .filter(|f| f.fault_type == fault_type)
            .count()
    }

    /// Count retained records with one access type.
    pub fn fault_count_by_access_type(&self, access_type: AccessType) -> usize {
        lock(&self.log)
            .records
            .iter()
            .filter(|f| f.access_type == access_type)
            .count()
    }

    pub fn reset_statistics(&self) {
        let mut log = lock(&self.log);
        log.total_faults = 0;
        log.translation_faults = 0;
        log.permission_faults = 0;
    }

    /// Drop all records and statistics.
    pub fn reset(&self) {
        let mut log = lock(&self.log);
        log.records.clear();
        log.total_faults = 0;
        log.translation_faults = 0;
        log.permission_faults = 0;
    }
}

impl Default for FaultHandler {
    fn default() -> Self {
        Self::new()
    }
}
