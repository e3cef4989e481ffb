//! Top-level SMMU controller: translation dispatch, the stream table, the
//! translation cache coordination and the three queues.
//!
//! Locking follows a fixed order: controller state, then a stream's
//! context, then the TLB or fault handler. The TLB fast path and the
//! statistics counters stay off the controller lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::address_space::AddressSpace;

use crate::config::SmmuConfig;
use crate::config::{AddressConfiguration, CacheConfiguration, QueueConfiguration, ResourceLimits};
use crate::error::{Result, SmmuError};
use crate::fault::{FaultHandler, FaultMode, FaultRecord, FaultStage, FaultType};
use crate::lock;
use crate::queue::{
    BoundedQueue, CommandEntry, CommandType, EventEntry, EventType, PriEntry,
};
use crate::stream_table::{StreamConfig, StreamContext};
use crate::syndrome::FaultSyndrome;
use crate::tlb::{CacheStatistics, TlbCache, TlbEntry};
use crate::types::{
    current_time_us, AccessType, Iova, Pa, PagePermissions, Pasid, SecurityState, StreamId,
    TranslationData, PAGE_MASK, PAGE_SIZE,
};

/// Freshness bound applied by the translation fast path on top of the
/// cache's own configured age limit.
const MAX_TRANSLATION_CACHE_AGE_US: u64 = 1_000_000;

/// Input addresses above this bound classify as address size faults.
const MAX_REASONABLE_IOVA: u64 = 1 << 48;

struct ControllerState {
    stream_map: HashMap<StreamId, StreamContext>,
    event_queue: BoundedQueue<EventEntry>,
    command_queue: BoundedQueue<CommandEntry>,
    pri_queue: BoundedQueue<PriEntry>,
    config: SmmuConfig,
    global_fault_mode: FaultMode,
    /// Shared stage 2 domains keyed by their table base. Weak handles:
    /// a domain lives exactly as long as some stream references it.
    stage2_registry: HashMap<u64, Weak<AddressSpace>>,
}

/// The SMMU instance. All methods take `&self`; one instance may be
/// shared across threads.
pub struct Smmu {
    state: Mutex<ControllerState>,
    tlb: TlbCache,
    fault_handler: Arc<FaultHandler>,

    // Hot-path counters and bounds, off the controller lock.
    translation_count: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    caching_enabled: AtomicBool,
    max_stream_id: AtomicU32,
}

impl Smmu {
    /// An SMMU with the default configuration.
    pub fn new() -> Self {
        Self::with_config(SmmuConfig::default())
    }

    /// An SMMU with a caller-supplied configuration. An invalid
    /// configuration falls back to the defaults.
    pub fn with_config(config: SmmuConfig) -> Self {
        let config = if config.is_valid() {
            config
        } else {
            warn!("invalid configuration supplied, falling back to defaults");
            SmmuConfig::default()
        };

        let tlb = TlbCache::with_max_age(
            config.cache.tlb_cache_size,
            u64::from(config.cache.cache_max_age_ms) * 1000,
        );

        Self {
            state: Mutex::new(ControllerState {
                stream_map: HashMap::new(),
                event_queue: BoundedQueue::new(config.queue.event_queue_size),
                command_queue: BoundedQueue::new(config.queue.command_queue_size),
                pri_queue: BoundedQueue::new(config.queue.pri_queue_size),
                config,
                global_fault_mode: FaultMode::Terminate,
                stage2_registry: HashMap::new(),
            }),
            tlb,
            fault_handler: Arc::new(FaultHandler::new()),
            translation_count: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            caching_enabled: AtomicBool::new(config.cache.enable_caching),
            max_stream_id: AtomicU32::new(config.address.max_stream_count.saturating_sub(1)),
        }
    }

    // ------------------------------------------------------------------
    // Translation.

    /// Translate one transaction.
    ///
    /// Order of operations: count, StreamID range check, TLB fast path,
    /// stream lookup, stage composition, cache fill or fault recording.
    pub fn translate(
        &self,
        stream_id: StreamId,
        pasid: Pasid,
        iova: Iova,
        access: AccessType,
        security_state: SecurityState,
    ) -> Result<TranslationData> {
        self.translation_count.fetch_add(1, Ordering::Relaxed);

        if stream_id > self.max_stream_id.load(Ordering::Relaxed) {
            self.record_fault(
                stream_id,
                pasid,
                iova,
                FaultType::TranslationFault,
                access,
                security_state,
                FaultStage::Unknown,
                0,
            );
            self.push_fault_event(stream_id, pasid, iova, FaultType::TranslationFault, security_state);
            return Err(SmmuError::InvalidStreamId);
        }

        let iova_page = iova & !PAGE_MASK;
        let caching = self.caching_enabled.load(Ordering::Relaxed);

        if caching {
            if let Some(entry) = self.tlb.lookup(stream_id, pasid, iova_page, security_state) {
                let age = current_time_us().saturating_sub(entry.timestamp);
                if age <= MAX_TRANSLATION_CACHE_AGE_US {
                    if entry.permissions.allows(access) {
                        self.cache_hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(TranslationData::new(
                            entry.physical_page | (iova & PAGE_MASK),
                            entry.permissions,
                            entry.security_state,
                        ));
                    }
                    // The cached permissions already reflect the stream's
                    // stage composition; attribute the fault accordingly.
                    let mut state = self.state_guard();
                    let stage = state
                        .stream_map
                        .get(&stream_id)
                        .map(|s| Self::fault_stage(&s.configuration(), FaultType::PermissionFault))
                        .unwrap_or(FaultStage::Unknown);
                    self.record_fault(
                        stream_id,
                        pasid,
                        iova,
                        FaultType::PermissionFault,
                        access,
                        security_state,
                        stage,
                        0,
                    );
                    Self::push_event(
                        &mut state,
                        EventType::PermissionFault,
                        stream_id,
                        pasid,
                        iova,
                        security_state,
                    );
                    return Err(SmmuError::PagePermissionViolation);
                }
                // Fresh per the cache's own limit but past the fast-path
                // bound: drop and walk again.
                self.tlb.invalidate(stream_id, pasid, iova_page, security_state);
            }
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let mut state = lock(&self.state);

        // Input addresses wider than the configured IOVA size never
        // reach a walk.
        let iova_bits = state.config.address.max_iova_size;
        if iova_bits < 64 && iova >> iova_bits != 0 {
            self.record_fault(
                stream_id,
                pasid,
                iova,
                FaultType::AddressSizeFault,
                access,
                security_state,
                FaultStage::Unknown,
                0,
            );
            Self::push_event(
                &mut state,
                EventType::TranslationFault,
                stream_id,
                pasid,
                iova,
                security_state,
            );
            return Err(SmmuError::InvalidAddress);
        }

        let Some(stream) = state.stream_map.get(&stream_id) else {
            self.record_fault(
                stream_id,
                pasid,
                iova,
                FaultType::TranslationFault,
                access,
                security_state,
                FaultStage::Unknown,
                0,
            );
            Self::push_event(
                &mut state,
                EventType::TranslationFault,
                stream_id,
                pasid,
                iova,
                security_state,
            );
            return Err(SmmuError::StreamNotConfigured);
        };

        let stream_config = stream.configuration();
        let result = stream.translate(pasid, iova, access, security_state);

        match result {
            Ok(data) => {
                // Only completed translations with a real output page are
                // cacheable.
                if caching && (data.physical_address != 0 || iova == 0) {
                    self.tlb.insert(TlbEntry {
                        stream_id,
                        pasid,
                        iova_page,
                        physical_page: data.physical_address & !PAGE_MASK,
                        permissions: data.permissions,
                        security_state: data.security_state,
                        valid: true,
                        timestamp: current_time_us(),
                    });
                }
                Ok(data)
            }
            Err(err) => {
                let fault_type = Self::classify_fault(err, iova);
                let stage = Self::fault_stage(&stream_config, fault_type);
                let level = match stage {
                    FaultStage::Stage1 => 1,
                    FaultStage::Stage2 => 2,
                    _ => 0,
                };
                self.record_fault(
                    stream_id, pasid, iova, fault_type, access, security_state, stage, level,
                );
                Self::push_event(
                    &mut state,
                    Self::fault_event_type(fault_type),
                    stream_id,
                    pasid,
                    iova,
                    security_state,
                );

                // Drop whatever the cache still holds for the faulting
                // page so a later retry starts clean.
                match fault_type {
                    FaultType::TranslationFault
                    | FaultType::Level0TranslationFault
                    | FaultType::Level1TranslationFault
                    | FaultType::Level2TranslationFault
                    | FaultType::Level3TranslationFault
                    | FaultType::PermissionFault
                    | FaultType::AccessFault => {
                        self.tlb.invalidate_any_security(stream_id, pasid, iova_page);
                    }
                    _ => {}
                }
                Err(err)
            }
        }
    }

    /// Probe the translation cache without walking the tables.
    ///
    /// Fails with `CacheOperationFailed` when caching is disabled and
    /// `CacheEntryNotFound` on a miss. The probe counts as a lookup in
    /// the cache statistics.
    pub fn lookup_cached_translation(
        &self,
        stream_id: StreamId,
        pasid: Pasid,
        iova: Iova,
        security_state: SecurityState,
    ) -> Result<TranslationData> {
        if !self.caching_enabled.load(Ordering::Relaxed) {
            return Err(SmmuError::CacheOperationFailed);
        }
        let entry = self
            .tlb
            .lookup(stream_id, pasid, iova & !PAGE_MASK, security_state)
            .ok_or(SmmuError::CacheEntryNotFound)?;
        Ok(TranslationData::new(
            entry.physical_page | (iova & PAGE_MASK),
            entry.permissions,
            entry.security_state,
        ))
    }

    /// Map a low-level error onto the architectural fault taxonomy.
    fn classify_fault(err: SmmuError, iova: Iova) -> FaultType {
        match err {
            SmmuError::PageNotMapped => FaultType::TranslationFault,
            SmmuError::PagePermissionViolation => FaultType::PermissionFault,
            SmmuError::InvalidSecurityState => FaultType::SecurityFault,
            SmmuError::InvalidAddress => {
                if iova >= MAX_REASONABLE_IOVA {
                    FaultType::AddressSizeFault
                } else {
                    FaultType::AccessFault
                }
            }
            SmmuError::TranslationTableError => FaultType::TranslationTableFormatFault,
            _ => {
                if iova >= MAX_REASONABLE_IOVA {
                    FaultType::AddressSizeFault
                } else if iova == 0 {
                    FaultType::AccessFault
                } else {
                    FaultType::TranslationFault
                }
            }
        }
    }

    /// Attribute a fault to a translation stage from the stream's stage
    /// selection.
    fn fault_stage(config: &StreamConfig, fault_type: FaultType) -> FaultStage {
        match (config.stage1_enabled, config.stage2_enabled) {
            (true, true) => match fault_type {
                FaultType::ContextDescriptorFormatFault
                | FaultType::Level0TranslationFault
                | FaultType::Level1TranslationFault
                | FaultType::Level2TranslationFault
                | FaultType::Level3TranslationFault => FaultStage::Stage1,
                _ => FaultStage::BothStages,
            },
            (true, false) => FaultStage::Stage1,
            (false, true) => FaultStage::Stage2,
            (false, false) => FaultStage::Unknown,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_fault(
        &self,
        stream_id: StreamId,
        pasid: Pasid,
        address: Iova,
        fault_type: FaultType,
        access: AccessType,
        security_state: SecurityState,
        stage: FaultStage,
        level: u8,
    ) {
        let syndrome =
            FaultSyndrome::generate(fault_type, stage, access, security_state, level, 0);
        self.fault_handler.record(FaultRecord::new(
            stream_id,
            pasid,
            address,
            fault_type,
            access,
            security_state,
            syndrome,
        ));
    }

    // ------------------------------------------------------------------
    // Stream management.

    /// Create a stream, or reconfigure an existing one. Reconfiguration
    /// invalidates the stream's cached translations.
    ///
    /// A configuration with stage 2 enabled and a non-zero `stage2_ttbr`
    /// binds the stream to the shared stage 2 domain identified by that
    /// table base; streams naming the same base share one domain.
    pub fn configure_stream(&self, stream_id: StreamId, config: &StreamConfig) -> Result<()> {
        let mut state = self.state_guard();
        if stream_id > Self::max_sid(&state) {
            return Err(SmmuError::InvalidStreamId);
        }

        let stage2 = if config.stage2_enabled && config.stage2_ttbr != 0 {
            Some(Self::shared_stage2(&mut state.stage2_registry, config.stage2_ttbr))
        } else {
            None
        };

        if let Some(stream) = state.stream_map.get(&stream_id) {
            stream.update_configuration(config)?;
            if let Some(space) = stage2 {
                stream.set_stage2_address_space(space);
            }
            self.tlb.invalidate_stream(stream_id);
            info!("stream {stream_id}: configuration updated");
        } else {
            let pasid_limit = state.config.address.max_pasid_count as usize;
            let stream = StreamContext::with_pasid_limit(pasid_limit);
            stream.update_configuration(config)?;
            stream.set_fault_handler(self.fault_handler.clone())?;
            if let Some(space) = stage2 {
                stream.set_stage2_address_space(space);
            }
            state.stream_map.insert(stream_id, stream);
            info!("stream {stream_id}: configured");
        }
        Ok(())
    }

    /// Resolve the shared stage 2 domain for a table base, creating it on
    /// first use. Dead registry slots are reaped on the way.
    fn shared_stage2(
        registry: &mut HashMap<u64, Weak<AddressSpace>>,
        ttbr: u64,
    ) -> Arc<AddressSpace> {
        if let Some(space) = registry.get(&ttbr).and_then(Weak::upgrade) {
            return space;
        }
        registry.retain(|_, weak| weak.strong_count() > 0);
        let space = Arc::new(AddressSpace::new());
        registry.insert(ttbr, Arc::downgrade(&space));
        space
    }

    /// Install a stage 2 domain for one stream directly, bypassing the
    /// table-base registry.
    pub fn set_stream_stage2_address_space(
        &self,
        stream_id: StreamId,
        space: Arc<AddressSpace>,
    ) -> Result<()> {
        self.with_stream(stream_id, |stream| {
            stream.set_stage2_address_space(space.clone());
            Ok(())
        })
    }

    /// The stage 2 domain currently bound to a stream, if any.
    pub fn stream_stage2_address_space(
        &self,
        stream_id: StreamId,
    ) -> Result<Option<Arc<AddressSpace>>> {
        self.with_stream(stream_id, |stream| Ok(stream.stage2_address_space()))
    }

    /// Remove a stream, dropping its PASIDs and cached translations.
    pub fn remove_stream(&self, stream_id: StreamId) -> Result<()> {
        let mut state = self.state_guard();
        if stream_id > Self::max_sid(&state) {
            return Err(SmmuError::InvalidStreamId);
        }
        let stream = state
            .stream_map
            .get(&stream_id)
            .ok_or(SmmuError::StreamNotFound)?;
        stream.disable_stream()?;
        stream.clear_all_pasids()?;
        state.stream_map.remove(&stream_id);
        self.tlb.invalidate_stream(stream_id);
        info!("stream {stream_id}: removed");
        Ok(())
    }

    pub fn is_stream_configured(&self, stream_id: StreamId) -> Result<bool> {
        let state = self.state_guard();
        if stream_id > Self::max_sid(&state) {
            return Err(SmmuError::InvalidStreamId);
        }
        Ok(state.stream_map.contains_key(&stream_id))
    }

    pub fn enable_stream(&self, stream_id: StreamId) -> Result<()> {
        self.with_stream(stream_id, |stream| stream.enable_stream())
    }

    pub fn disable_stream(&self, stream_id: StreamId) -> Result<()> {
        self.with_stream(stream_id, |stream| stream.disable_stream())
    }

    pub fn is_stream_enabled(&self, stream_id: StreamId) -> Result<bool> {
        let state = self.state_guard();
        if stream_id > Self::max_sid(&state) {
            return Err(SmmuError::InvalidStreamId);
        }
        let stream = state
            .stream_map
            .get(&stream_id)
            .ok_or(SmmuError::StreamNotConfigured)?;
        Ok(stream.is_stream_enabled())
    }

    /// Per-stream usage counters.
    pub fn stream_statistics(&self, stream_id: StreamId) -> Result<crate::stream_table::StreamStatistics> {
        self.with_stream(stream_id, |stream| Ok(stream.statistics()))
    }

    // ------------------------------------------------------------------
    // PASID management.

    /// Create a PASID in a stream. PASID 0 is rejected when the address
    /// configuration reserves it.
    pub fn create_stream_pasid(&self, stream_id: StreamId, pasid: Pasid) -> Result<()> {
        let state = self.state_guard();
        Self::check_pasid(&state, pasid)?;
        if stream_id > Self::max_sid(&state) {
            return Err(SmmuError::InvalidStreamId);
        }
        let stream = state
            .stream_map
            .get(&stream_id)
            .ok_or(SmmuError::StreamNotFound)?;
        stream.create_pasid(pasid)
    }

    /// Remove a PASID and drop its cached translations.
    pub fn remove_stream_pasid(&self, stream_id: StreamId, pasid: Pasid) -> Result<()> {
        let state = self.state_guard();
        if stream_id > Self::max_sid(&state) {
            return Err(SmmuError::InvalidStreamId);
        }
        let stream = state
            .stream_map
            .get(&stream_id)
            .ok_or(SmmuError::StreamNotFound)?;
        stream.remove_pasid(pasid)?;
        self.tlb.invalidate_pasid(stream_id, pasid);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Page mapping.

    pub fn map_page(
        &self,
        stream_id: StreamId,
        pasid: Pasid,
        iova: Iova,
        pa: Pa,
        permissions: PagePermissions,
        security_state: SecurityState,
    ) -> Result<()> {
        let state = self.state_guard();
        if stream_id > Self::max_sid(&state) {
            return Err(SmmuError::InvalidStreamId);
        }
        let stream = state
            .stream_map
            .get(&stream_id)
            .ok_or(SmmuError::StreamNotFound)?;
        stream.map_page(pasid, iova, pa, permissions, security_state)?;
        // A remap may shadow an existing cached translation.
        self.tlb.invalidate_any_security(stream_id, pasid, iova & !PAGE_MASK);
        Ok(())
    }

    /// Unmap a page. The covering TLB entry is invalidated before this
    /// returns, so the next translate misses.
    pub fn unmap_page(&self, stream_id: StreamId, pasid: Pasid, iova: Iova) -> Result<()> {
        let state = self.state_guard();
        if stream_id > Self::max_sid(&state) {
            return Err(SmmuError::InvalidStreamId);
        }
        let stream = state
            .stream_map
            .get(&stream_id)
            .ok_or(SmmuError::StreamNotFound)?;
        stream.unmap_page(pasid, iova)?;
        self.tlb.invalidate_any_security(stream_id, pasid, iova & !PAGE_MASK);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fault events.

    /// Snapshot of all retained fault records.
    pub fn events(&self) -> Result<Vec<FaultRecord>> {
        Ok(self.fault_handler.events())
    }

    pub fn clear_events(&self) -> Result<()> {
        self.fault_handler.clear_events();
        Ok(())
    }

    /// Shared handle to the fault store, for filtered queries and rate
    /// monitoring.
    pub fn fault_handler(&self) -> Arc<FaultHandler> {
        self.fault_handler.clone()
    }

    /// Set the fault response policy globally and on every configured
    /// stream.
    pub fn set_global_fault_mode(&self, mode: FaultMode) -> Result<()> {
        let mut state = self.state_guard();
        state.global_fault_mode = mode;
        for stream in state.stream_map.values() {
            stream.set_fault_mode(mode);
        }
        Ok(())
    }

    pub fn global_fault_mode(&self) -> FaultMode {
        self.state_guard().global_fault_mode
    }

    /// Enable or disable the translation cache. Disabling clears it so a
    /// re-enable starts coherent.
    pub fn enable_caching(&self, enable: bool) -> Result<()> {
        self.caching_enabled.store(enable, Ordering::Relaxed);
        if !enable {
            self.tlb.invalidate_all();
        }
        Ok(())
    }

    pub fn is_caching_enabled(&self) -> bool {
        self.caching_enabled.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Configuration.

    pub fn configuration(&self) -> SmmuConfig {
        self.state_guard().config
    }

    /// Replace the whole configuration and apply it to the queues, the
    /// cache and the identifier bounds.
    pub fn update_configuration(&self, config: &SmmuConfig) -> Result<()> {
        if !config.is_valid() {
            return Err(SmmuError::InvalidConfiguration);
        }
        let mut state = self.state_guard();
        state.config = *config;
        self.apply_configuration(&mut state);
        Ok(())
    }

    pub fn update_queue_configuration(&self, queue: &QueueConfiguration) -> Result<()> {
        let mut state = self.state_guard();
        state.config.set_queue_configuration(*queue)?;
        state.event_queue.set_capacity(queue.event_queue_size);
        state.command_queue.set_capacity(queue.command_queue_size);
        state.pri_queue.set_capacity(queue.pri_queue_size);
        Ok(())
    }

    pub fn update_cache_configuration(&self, cache: &CacheConfiguration) -> Result<()> {
        let mut state = self.state_guard();
        state.config.set_cache_configuration(*cache)?;
        drop(state);

        self.caching_enabled.store(cache.enable_caching, Ordering::Relaxed);
        if self.tlb.capacity() != cache.tlb_cache_size {
            self.tlb.resize(cache.tlb_cache_size);
        }
        self.tlb.set_max_age_us(u64::from(cache.cache_max_age_ms) * 1000);
        Ok(())
    }

    pub fn update_address_configuration(&self, address: &AddressConfiguration) -> Result<()> {
        let mut state = self.state_guard();
        state.config.set_address_configuration(*address)?;
        self.max_stream_id
            .store(address.max_stream_count.saturating_sub(1), Ordering::Relaxed);
        Ok(())
    }

    pub fn update_resource_limits(&self, resources: &ResourceLimits) -> Result<()> {
        let mut state = self.state_guard();
        state.config.set_resource_limits(*resources)
    }

    fn apply_configuration(&self, state: &mut ControllerState) {
        let config = state.config;
        state.event_queue.set_capacity(config.queue.event_queue_size);
        state.command_queue.set_capacity(config.queue.command_queue_size);
        state.pri_queue.set_capacity(config.queue.pri_queue_size);

        self.caching_enabled
            .store(config.cache.enable_caching, Ordering::Relaxed);
        if self.tlb.capacity() != config.cache.tlb_cache_size {
            self.tlb.resize(config.cache.tlb_cache_size);
        }
        self.tlb
            .set_max_age_us(u64::from(config.cache.cache_max_age_ms) * 1000);

        self.max_stream_id.store(
            config.address.max_stream_count.saturating_sub(1),
            Ordering::Relaxed,
        );
    }

    // ------------------------------------------------------------------
    // Cache management.

    /// Invalidate every cached translation.
    pub fn invalidate_translation_cache(&self) {
        self.tlb.invalidate_all();
    }

    /// Invalidate the cached translations of one stream.
    pub fn invalidate_stream_cache(&self, stream_id: StreamId) {
        if stream_id <= self.max_stream_id.load(Ordering::Relaxed) {
            self.tlb.invalidate_stream(stream_id);
        }
    }

    /// Invalidate the cached translations of one PASID within a stream.
    pub fn invalidate_pasid_cache(&self, stream_id: StreamId, pasid: Pasid) {
        if stream_id <= self.max_stream_id.load(Ordering::Relaxed) {
            self.tlb.invalidate_pasid(stream_id, pasid);
        }
    }

    // ------------------------------------------------------------------
    // Event queue.

    /// Drain the event queue in FIFO order. Most events are pure
    /// bookkeeping at this abstraction level.
    pub fn process_event_queue(&self) {
        let mut state = self.state_guard();
        while let Some(event) = state.event_queue.pop_front() {
            match event.event {
                EventType::TranslationFault | EventType::PermissionFault => {
                    trace!("event: fault on stream {} at {:#x}", event.stream_id, event.address);
                }
                EventType::CommandSyncCompletion => {
                    trace!("event: CMD_SYNC completion");
                }
                EventType::PriPageRequest => {
                    trace!("event: page request on stream {}", event.stream_id);
                }
                EventType::AtcInvalidateCompletion => {
                    trace!("event: ATC invalidation completion");
                }
                EventType::ConfigurationError | EventType::InternalError => {
                    debug!(
                        "event: error {:#x} on stream {}",
                        event.error_code, event.stream_id
                    );
                }
            }
        }
    }

    pub fn has_events(&self) -> Result<bool> {
        Ok(!self.state_guard().event_queue.is_empty())
    }

    /// Snapshot of the pending event queue, front first.
    pub fn event_queue(&self) -> Vec<EventEntry> {
        self.state_guard().event_queue.snapshot()
    }

    pub fn clear_event_queue(&self) {
        self.state_guard().event_queue.clear();
    }

    pub fn event_queue_size(&self) -> usize {
        self.state_guard().event_queue.len()
    }

    // ------------------------------------------------------------------
    // Command queue.

    /// Enqueue a command. A full queue rejects the command and raises an
    /// INTERNAL_ERROR event.
    pub fn submit_command(&self, command: CommandEntry) -> Result<()> {
        let mut state = self.state_guard();
        Self::submit_command_locked(&mut state, command)
    }

    fn submit_command_locked(state: &mut ControllerState, mut command: CommandEntry) -> Result<()> {
        if state.command_queue.is_full() {
            warn!("command queue full, rejecting {:?}", command.op);
            Self::push_event(
                state,
                EventType::InternalError,
                command.stream_id,
                command.pasid,
                command.start_address,
                SecurityState::NonSecure,
            );
            return Err(SmmuError::CommandQueueFull);
        }
        command.timestamp = current_time_us();
        state
            .command_queue
            .push_back(command)
            .map_err(|_| SmmuError::CommandQueueFull)
    }

    /// Drain the command queue in FIFO order. A SYNC command completes
    /// the batch: its completion event is raised and processing stops so
    /// later commands stay pending.
    pub fn process_command_queue(&self) {
        let mut state = self.state_guard();
        while let Some(command) = state.command_queue.pop_front() {
            self.process_command_locked(&mut state, &command);
            if command.op == CommandType::Sync {
                Self::push_event(
                    &mut state,
                    EventType::CommandSyncCompletion,
                    command.stream_id,
                    command.pasid,
                    command.start_address,
                    SecurityState::NonSecure,
                );
                break;
            }
        }
    }

    fn process_command_locked(&self, state: &mut ControllerState, command: &CommandEntry) {
        match command.op {
            CommandType::PrefetchConfig | CommandType::PrefetchAddr => {
                trace!("prefetch hint {:?} accepted", command.op);
            }
            CommandType::CfgiSte
            | CommandType::CfgiAll
            | CommandType::TlbiNhAll
            | CommandType::TlbiEl2All
            | CommandType::TlbiS12Vmall
            | CommandType::AtcInv => {
                self.execute_invalidation_locked(state, command);
            }
            CommandType::PriResp => {
                trace!("PRI response for stream {} accepted", command.stream_id);
            }
            CommandType::Resume => {
                trace!("resume for stream {} accepted", command.stream_id);
            }
            // The barrier itself is handled by the queue drain loop.
            CommandType::Sync => {}
        }
    }

    /// Snapshot of the pending command queue, front first.
    pub fn command_queue(&self) -> Vec<CommandEntry> {
        self.state_guard().command_queue.snapshot()
    }

    pub fn is_command_queue_full(&self) -> Result<bool> {
        Ok(self.state_guard().command_queue.is_full())
    }

    pub fn command_queue_size(&self) -> usize {
        self.state_guard().command_queue.len()
    }

    pub fn clear_command_queue(&self) {
        self.state_guard().command_queue.clear();
    }

    // ------------------------------------------------------------------
    // PRI queue.

    /// Enqueue a device page request. A full queue drops its oldest
    /// entry; every submission raises a PRI_PAGE_REQUEST event.
    pub fn submit_page_request(&self, request: PriEntry) {
        let mut state = self.state_guard();
        let mut request = request;
        request.timestamp = current_time_us();
        if state.pri_queue.push_back_overwrite(request).is_some() {
            warn!("PRI queue full, dropped oldest request");
        }
        Self::push_event(
            &mut state,
            EventType::PriPageRequest,
            request.stream_id,
            request.pasid,
            request.requested_address,
            SecurityState::NonSecure,
        );
    }

    /// Answer pending page requests: each entry synthesizes a PRI_RESP
    /// command. When the command queue fills up the current request stays
    /// at the head for a later retry.
    pub fn process_pri_queue(&self) {
        let mut state = self.state_guard();
        while let Some(request) = state.pri_queue.front().copied() {
            let response =
                CommandEntry::pri_resp(request.stream_id, request.pasid, request.requested_address);
            match Self::submit_command_locked(&mut state, response) {
                Ok(()) => {
                    state.pri_queue.pop_front();
                }
                Err(_) => break,
            }
        }
    }

    /// Snapshot of the pending page requests, front first.
    pub fn pri_queue(&self) -> Vec<PriEntry> {
        self.state_guard().pri_queue.snapshot()
    }

    pub fn clear_pri_queue(&self) {
        self.state_guard().pri_queue.clear();
    }

    pub fn pri_queue_size(&self) -> usize {
        self.state_guard().pri_queue.len()
    }

    // ------------------------------------------------------------------
    // Invalidation command execution.

    /// Execute one invalidation command immediately and raise its
    /// completion event.
    pub fn execute_invalidation_command(&self, command: &CommandEntry) {
        let mut state = self.state_guard();
        self.execute_invalidation_locked(&mut state, command);
    }

    fn execute_invalidation_locked(&self, state: &mut ControllerState, command: &CommandEntry) {
        match command.op {
            CommandType::CfgiSte => {
                debug!("CFGI_STE: invalidating stream {}", command.stream_id);
                self.invalidate_stream_cache(command.stream_id);
            }
            CommandType::CfgiAll => {
                debug!("CFGI_ALL: invalidating all cached translations");
                self.invalidate_translation_cache();
            }
            CommandType::TlbiNhAll | CommandType::TlbiEl2All | CommandType::TlbiS12Vmall => {
                self.execute_tlb_invalidation_locked(
                    state,
                    command.op,
                    command.stream_id,
                    command.pasid,
                );
            }
            CommandType::AtcInv => {
                self.execute_atc_invalidation_command(
                    command.stream_id,
                    command.pasid,
                    command.start_address,
                    command.end_address,
                );
            }
            _ => {
                Self::push_event(
                    state,
                    EventType::ConfigurationError,
                    command.stream_id,
                    command.pasid,
                    command.start_address,
                    SecurityState::NonSecure,
                );
            }
        }

        Self::push_event(
            state,
            EventType::AtcInvalidateCompletion,
            command.stream_id,
            command.pasid,
            command.start_address,
            SecurityState::NonSecure,
        );
    }

    /// Execute a TLB-scope invalidation command.
    pub fn execute_tlb_invalidation_command(
        &self,
        op: CommandType,
        stream_id: StreamId,
        pasid: Pasid,
    ) {
        let mut state = self.state_guard();
        self.execute_tlb_invalidation_locked(&mut state, op, stream_id, pasid);
    }

    fn execute_tlb_invalidation_locked(
        &self,
        state: &mut ControllerState,
        op: CommandType,
        stream_id: StreamId,
        pasid: Pasid,
    ) {
        match op {
            CommandType::TlbiNhAll | CommandType::TlbiEl2All => {
                self.invalidate_translation_cache();
            }
            CommandType::TlbiS12Vmall => {
                // StreamID zero addresses every VM in this model.
                if stream_id != 0 {
                    self.invalidate_stream_cache(stream_id);
                } else {
                    self.invalidate_translation_cache();
                }
            }
            _ => {
                Self::push_event(
                    state,
                    EventType::ConfigurationError,
                    stream_id,
                    pasid,
                    0,
                    SecurityState::NonSecure,
                );
            }
        }
    }

    /// Execute a device-side ATC invalidation.
    ///
    /// A zero range addresses the whole PASID (or the stream when the
    /// PASID is zero); otherwise every page overlapping
    /// `[start, end]` is invalidated, stopping on address overflow.
    pub fn execute_atc_invalidation_command(
        &self,
        stream_id: StreamId,
        pasid: Pasid,
        start: Iova,
        end: Iova,
    ) {
        if start == 0 && end == 0 {
            if pasid != 0 {
                self.invalidate_pasid_cache(stream_id, pasid);
            } else {
                self.invalidate_stream_cache(stream_id);
            }
            return;
        }

        let mut page = start & !PAGE_MASK;
        let end_page = end.saturating_add(PAGE_SIZE - 1) & !PAGE_MASK;
        while page <= end_page {
            self.tlb.invalidate_any_security(stream_id, pasid, page);
            match page.checked_add(PAGE_SIZE) {
                Some(next) => page = next,
                None => break,
            }
        }
    }

    // ------------------------------------------------------------------
    // Statistics and reset.

    pub fn stream_count(&self) -> usize {
        self.state_guard().stream_map.len()
    }

    pub fn total_translations(&self) -> u64 {
        self.translation_count.load(Ordering::Relaxed)
    }

    pub fn translation_count(&self) -> u64 {
        self.translation_count.load(Ordering::Relaxed)
    }

    pub fn total_faults(&self) -> u64 {
        self.fault_handler.total_fault_count()
    }

    pub fn cache_hit_count(&self) -> u64 {
        self.tlb.hit_count()
    }

    pub fn cache_miss_count(&self) -> u64 {
        self.tlb.miss_count()
    }

    pub fn cache_statistics(&self) -> CacheStatistics {
        self.tlb.statistics()
    }

    pub fn reset_statistics(&self) {
        self.translation_count.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.fault_handler.reset_statistics();
        self.tlb.reset_statistics();
    }

    /// Full reset: streams, queues, cache, faults and statistics return
    /// to the post-construction state. The configuration is retained.
    pub fn reset(&self) {
        let mut state = self.state_guard();
        state.stream_map.clear();
        state.event_queue.clear();
        state.command_queue.clear();
        state.pri_queue.clear();
        state.global_fault_mode = FaultMode::Terminate;
        state.stage2_registry.clear();
        let caching = state.config.cache.enable_caching;
        drop(state);

        self.caching_enabled.store(caching, Ordering::Relaxed);
        self.tlb.reset();
        self.fault_handler.reset();
        self.reset_statistics();
        info!("SMMU reset");
    }

    // ------------------------------------------------------------------
    // Helpers.

    fn state_guard(&self) -> MutexGuard<'_, ControllerState> {
        lock(&self.state)
    }

    fn max_sid(state: &ControllerState) -> StreamId {
        state.config.address.max_stream_count.saturating_sub(1)
    }

    fn check_pasid(state: &ControllerState, pasid: Pasid) -> Result<()> {
        let address = &state.config.address;
        if pasid == 0 {
            return if address.pasid0_valid {
                Ok(())
            } else {
                Err(SmmuError::InvalidPasid)
            };
        }
        if u64::from(pasid) >= u64::from(address.max_pasid_count) {
            return Err(SmmuError::InvalidPasid);
        }
        Ok(())
    }

    fn with_stream<T>(
        &self,
        stream_id: StreamId,
        f: impl FnOnce(&StreamContext) -> Result<T>,
    ) -> Result<T> {
        let state = self.state_guard();
        if stream_id > Self::max_sid(&state) {
            return Err(SmmuError::InvalidStreamId);
        }
        let stream = state
            .stream_map
            .get(&stream_id)
            .ok_or(SmmuError::StreamNotFound)?;
        f(stream)
    }

    /// Event type mirroring a classified fault on the event queue.
    fn fault_event_type(fault_type: FaultType) -> EventType {
        match fault_type {
            FaultType::PermissionFault => EventType::PermissionFault,
            _ => EventType::TranslationFault,
        }
    }

    /// Enqueue the event mirror of a fault from a path that does not
    /// already hold the controller lock.
    fn push_fault_event(
        &self,
        stream_id: StreamId,
        pasid: Pasid,
        address: Iova,
        fault_type: FaultType,
        security_state: SecurityState,
    ) {
        let mut state = self.state_guard();
        Self::push_event(
            &mut state,
            Self::fault_event_type(fault_type),
            stream_id,
            pasid,
            address,
            security_state,
        );
    }

    fn push_event(
        state: &mut ControllerState,
        event: EventType,
        stream_id: StreamId,
        pasid: Pasid,
        address: Iova,
        security_state: SecurityState,
    ) {
        let entry = EventEntry::new(event, stream_id, pasid, address, security_state);
        if state.event_queue.push_back_overwrite(entry).is_some() {
            warn!("event queue full, dropped oldest event");
        }
    }
}

impl Default for Smmu {
    fn default() -> Self {
        Self::new()
    }
}
