//! Validated tunables for queues, the translation cache, address widths
//! and resource limits, plus the line-oriented `key=value` text format and
//! the profile factories.

use core::fmt;
use core::str::FromStr;
use std::collections::HashMap;

use crate::error::{Result, SmmuError};

/// Capacity bounds for the three queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfiguration {
    pub event_queue_size: usize,
    pub command_queue_size: usize,
    pub pri_queue_size: usize,
}

impl QueueConfiguration {
    pub const MIN_QUEUE_SIZE: usize = 16;
    pub const MAX_QUEUE_SIZE: usize = 65536;

    pub fn new(event: usize, command: usize, pri: usize) -> Self {
        Self {
            event_queue_size: event,
            command_queue_size: command,
            pri_queue_size: pri,
        }
    }

    pub fn is_valid(&self) -> bool {
        let in_range =
            |size: usize| (Self::MIN_QUEUE_SIZE..=Self::MAX_QUEUE_SIZE).contains(&size);
        in_range(self.event_queue_size)
            && in_range(self.command_queue_size)
            && in_range(self.pri_queue_size)
    }
}

impl Default for QueueConfiguration {
    fn default() -> Self {
        Self::new(512, 256, 128)
    }
}

/// TLB cache sizing and aging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfiguration {
    /// Capacity in entries.
    pub tlb_cache_size: usize,
    /// Maximum entry age in milliseconds.
    pub cache_max_age_ms: u32,
    pub enable_caching: bool,
}

impl CacheConfiguration {
    pub const MIN_CACHE_SIZE: usize = 64;
    pub const MAX_CACHE_SIZE: usize = 1_048_576;
    pub const MIN_CACHE_AGE_MS: u32 = 100;
    pub const MAX_CACHE_AGE_MS: u32 = 3_600_000;

    pub fn new(tlb_cache_size: usize, cache_max_age_ms: u32, enable_caching: bool) -> Self {
        Self {
            tlb_cache_size,
            cache_max_age_ms,
            enable_caching,
        }
    }

    pub fn is_valid(&self) -> bool {
        (Self::MIN_CACHE_SIZE..=Self::MAX_CACHE_SIZE).contains(&self.tlb_cache_size)
            && (Self::MIN_CACHE_AGE_MS..=Self::MAX_CACHE_AGE_MS).contains(&self.cache_max_age_ms)
    }
}

impl Default for CacheConfiguration {
    fn default() -> Self {
        Self::new(1024, 5000, true)
    }
}

/// Address widths and identifier ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressConfiguration {
    /// Input address width in bits.
    pub max_iova_size: u64,
    /// Output address width in bits.
    pub max_pa_size: u64,
    /// Number of StreamIDs; the largest valid StreamID is one less.
    pub max_stream_count: u32,
    /// Number of PASIDs per stream; the largest valid PASID is one less.
    pub max_pasid_count: u32,
    /// Whether PASID 0 is a valid (kernel/hypervisor) context. Kept as
    /// configuration because integrations disagree on reserving it.
    pub pasid0_valid: bool,
}

impl AddressConfiguration {
    pub const MIN_ADDRESS_BITS: u64 = 32;
    pub const MAX_ADDRESS_BITS: u64 = 52;
    pub const MIN_STREAM_COUNT: u32 = 1;
    pub const MAX_STREAM_COUNT: u32 = 1_048_576;
    pub const MIN_PASID_COUNT: u32 = 1;
    pub const MAX_PASID_COUNT: u32 = 1_048_576;

    pub fn new(max_iova_size: u64, max_pa_size: u64, max_stream_count: u32, max_pasid_count: u32) -> Self {
        Self {
            max_iova_size,
            max_pa_size,
            max_stream_count,
            max_pasid_count,
            pasid0_valid: true,
        }
    }

    pub fn is_valid(&self) -> bool {
        let bits_ok =
            |bits: u64| (Self::MIN_ADDRESS_BITS..=Self::MAX_ADDRESS_BITS).contains(&bits);
        bits_ok(self.max_iova_size)
            && bits_ok(self.max_pa_size)
            && (Self::MIN_STREAM_COUNT..=Self::MAX_STREAM_COUNT).contains(&self.max_stream_count)
            && (Self::MIN_PASID_COUNT..=Self::MAX_PASID_COUNT).contains(&self.max_pasid_count)
    }
}

impl Default for AddressConfiguration {
    fn default() -> Self {
        // 48-bit input, 52-bit output, 16-bit StreamIDs, 20-bit PASIDs.
        Self::new(48, 52, 65536, 1_048_576)
    }
}

/// Host-side resource ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub max_memory_usage: u64,
    pub max_thread_count: u32,
    pub timeout_ms: u32,
    pub enable_resource_tracking: bool,
}

impl ResourceLimits {
    pub const MIN_MEMORY_USAGE: u64 = 1024 * 1024;
    pub const MAX_MEMORY_USAGE: u64 = 64 * 1024 * 1024 * 1024;
    pub const MIN_THREAD_COUNT: u32 = 1;
    pub const MAX_THREAD_COUNT: u32 = 256;
    pub const MIN_TIMEOUT_MS: u32 = 10;
    pub const MAX_TIMEOUT_MS: u32 = 300_000;

    pub fn new(max_memory_usage: u64, max_thread_count: u32, timeout_ms: u32, tracking: bool) -> Self {
        Self {
            max_memory_usage,
            max_thread_count,
            timeout_ms,
            enable_resource_tracking: tracking,
        }
    }

    pub fn is_valid(&self) -> bool {
        (Self::MIN_MEMORY_USAGE..=Self::MAX_MEMORY_USAGE).contains(&self.max_memory_usage)
            && (Self::MIN_THREAD_COUNT..=Self::MAX_THREAD_COUNT).contains(&self.max_thread_count)
            && (Self::MIN_TIMEOUT_MS..=Self::MAX_TIMEOUT_MS).contains(&self.timeout_ms)
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::new(1024 * 1024 * 1024, 8, 1000, true)
    }
}

/// Outcome of [`SmmuConfig::validate`]: hard errors plus advisory
/// warnings for settings that are legal but likely suboptimal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Aggregate configuration for one SMMU instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SmmuConfig {
    pub queue: QueueConfiguration,
    pub cache: CacheConfiguration,
    pub address: AddressConfiguration,
    pub resources: ResourceLimits,
}

impl SmmuConfig {
    pub fn new(
        queue: QueueConfiguration,
        cache: CacheConfiguration,
        address: AddressConfiguration,
        resources: ResourceLimits,
    ) -> Self {
        Self {
            queue,
            cache,
            address,
            resources,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.queue.is_valid()
            && self.cache.is_valid()
            && self.address.is_valid()
            && self.resources.is_valid()
    }

    /// Detailed validation with per-field error messages and advisory
    /// warnings.
    pub fn validate(&self) -> ConfigValidation {
        let mut result = ConfigValidation {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        };

        if !self.queue.is_valid() {
            result.is_valid = false;
            result.errors.push("queue sizes out of range [16, 65536]".into());
        }
        if !self.cache.is_valid() {
            result.is_valid = false;
            if !(CacheConfiguration::MIN_CACHE_SIZE..=CacheConfiguration::MAX_CACHE_SIZE)
                .contains(&self.cache.tlb_cache_size)
            {
                result.errors.push("TLB cache size out of range [64, 1048576]".into());
            }
            if !(CacheConfiguration::MIN_CACHE_AGE_MS..=CacheConfiguration::MAX_CACHE_AGE_MS)
                .contains(&self.cache.cache_max_age_ms)
            {
                result.errors.push("cache max age out of range [100ms, 1h]".into());
            }
        }
        if !self.address.is_valid() {
            result.is_valid = false;
            result.errors.push("address configuration out of range".into());
        }
        if !self.resources.is_valid() {
            result.is_valid = false;
            result.errors.push("resource limits out of range".into());
        }

        if self.cache.tlb_cache_size > 4096 {
            result.warnings.push("large TLB cache may consume significant memory".into());
        }
        if self.resources.timeout_ms > 10_000 {
            result.warnings.push("long timeout may affect responsiveness".into());
        }
        if self.queue.event_queue_size > 2048 {
            result.warnings.push("large event queue may consume significant memory".into());
        }

        result
    }

    /// Larger queues and cache, maximum addressing.
    pub fn high_performance() -> Self {
        Self::new(
            QueueConfiguration::new(2048, 1024, 512),
            CacheConfiguration::new(8192, 10_000, true),
            AddressConfiguration::new(52, 52, 1_048_576, 1_048_576),
            ResourceLimits::new(4 * 1024 * 1024 * 1024, 16, 5000, true),
        )
    }

    /// Small queues and cache for memory constrained hosts.
    pub fn low_memory() -> Self {
        Self::new(
            QueueConfiguration::new(128, 64, 32),
            CacheConfiguration::new(256, 2000, true),
            AddressConfiguration::new(40, 40, 4096, 256),
            ResourceLimits::new(128 * 1024 * 1024, 2, 500, false),
        )
    }

    /// The smallest legal configuration.
    pub fn minimal() -> Self {
        Self::new(
            QueueConfiguration::new(64, 32, 16),
            CacheConfiguration::new(128, 1000, true),
            AddressConfiguration::new(32, 32, 256, 64),
            ResourceLimits::new(32 * 1024 * 1024, 1, 100, false),
        )
    }

    /// High-throughput server tuning.
    pub fn server() -> Self {
        Self::new(
            QueueConfiguration::new(4096, 2048, 1024),
            CacheConfiguration::new(16384, 30_000, true),
            AddressConfiguration::new(52, 52, 1_048_576, 1_048_576),
            ResourceLimits::new(8 * 1024 * 1024 * 1024, 32, 10_000, true),
        )
    }

    /// Embedded targets: medium queues, small cache, no tracking.
    pub fn embedded() -> Self {
        Self::new(
            QueueConfiguration::new(256, 128, 64),
            CacheConfiguration::new(512, 3000, true),
            AddressConfiguration::new(40, 40, 1024, 256),
            ResourceLimits::new(256 * 1024 * 1024, 4, 1000, false),
        )
    }

    /// Debug-friendly settings with long retention and timeout.
    pub fn development() -> Self {
        Self::new(
            QueueConfiguration::new(1024, 512, 256),
            CacheConfiguration::new(2048, 15_000, true),
            AddressConfiguration::new(48, 48, 65536, 65536),
            ResourceLimits::new(2 * 1024 * 1024 * 1024, 8, 30_000, true),
        )
    }

    pub fn set_queue_configuration(&mut self, queue: QueueConfiguration) -> Result<()> {
        if !queue.is_valid() {
            return Err(SmmuError::InvalidConfiguration);
        }
        self.queue = queue;
        Ok(())
    }

    pub fn set_cache_configuration(&mut self, cache: CacheConfiguration) -> Result<()> {
        if !cache.is_valid() {
            return Err(SmmuError::InvalidConfiguration);
        }
        self.cache = cache;
        Ok(())
    }

    pub fn set_address_configuration(&mut self, address: AddressConfiguration) -> Result<()> {
        if !address.is_valid() {
            return Err(SmmuError::InvalidConfiguration);
        }
        self.address = address;
        Ok(())
    }

    pub fn set_resource_limits(&mut self, resources: ResourceLimits) -> Result<()> {
        if !resources.is_valid() {
            return Err(SmmuError::InvalidConfiguration);
        }
        self.resources = resources;
        Ok(())
    }

    pub fn update_queue_sizes(&mut self, event: usize, command: usize, pri: usize) -> Result<()> {
        self.set_queue_configuration(QueueConfiguration::new(event, command, pri))
    }

    pub fn update_cache_settings(&mut self, size: usize, max_age_ms: u32, enable: bool) -> Result<()> {
        self.set_cache_configuration(CacheConfiguration::new(size, max_age_ms, enable))
    }

    pub fn update_address_limits(
        &mut self,
        iova_bits: u64,
        pa_bits: u64,
        stream_count: u32,
        pasid_count: u32,
    ) -> Result<()> {
        let mut address = AddressConfiguration::new(iova_bits, pa_bits, stream_count, pasid_count);
        address.pasid0_valid = self.address.pasid0_valid;
        self.set_address_configuration(address)
    }

    pub fn update_resource_limits(&mut self, memory: u64, threads: u32, timeout_ms: u32) -> Result<()> {
        let tracking = self.resources.enable_resource_tracking;
        self.set_resource_limits(ResourceLimits::new(memory, threads, timeout_ms, tracking))
    }

    /// Overlay `other` onto this configuration.
    pub fn merge(&mut self, other: &SmmuConfig) -> Result<()> {
        if !other.is_valid() {
            return Err(SmmuError::InvalidConfiguration);
        }
        *self = *other;
        Ok(())
    }

    /// Restore the default configuration.
    pub fn reset(&mut self) {
        *self = SmmuConfig::default();
    }
}

/// Serialize as the line-oriented `key=value` text format. The output
/// round-trips through [`SmmuConfig::from_str`].
impl fmt::Display for SmmuConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "event_queue_size={}", self.queue.event_queue_size)?;
        writeln!(f, "command_queue_size={}", self.queue.command_queue_size)?;
        writeln!(f, "pri_queue_size={}", self.queue.pri_queue_size)?;
        writeln!(f, "tlb_cache_size={}", self.cache.tlb_cache_size)?;
        writeln!(f, "cache_max_age={}", self.cache.cache_max_age_ms)?;
        writeln!(f, "enable_caching={}", self.cache.enable_caching)?;
        writeln!(f, "max_iova_size={}", self.address.max_iova_size)?;
        writeln!(f, "max_pa_size={}", self.address.max_pa_size)?;
        writeln!(f, "max_stream_count={}", self.address.max_stream_count)?;
        writeln!(f, "max_pasid_count={}", self.address.max_pasid_count)?;
        writeln!(f, "pasid0_valid={}", self.address.pasid0_valid)?;
        writeln!(f, "max_memory_usage={}", self.resources.max_memory_usage)?;
        writeln!(f, "max_thread_count={}", self.resources.max_thread_count)?;
        writeln!(f, "timeout_ms={}", self.resources.timeout_ms)?;
        writeln!(f, "enable_resource_tracking={}", self.resources.enable_resource_tracking)
    }
}

/// Parse the `key=value` format: blank lines and `#` comments are skipped,
/// whitespace around keys and values is trimmed, unknown keys are ignored,
/// and missing keys keep their defaults.
impl FromStr for SmmuConfig {
    type Err = SmmuError;

    fn from_str(s: &str) -> Result<Self> {
        let pairs = parse_key_value_pairs(s);
        let mut config = SmmuConfig::default();

        if let Some(value) = pairs.get("event_queue_size") {
            config.queue.event_queue_size = parse_number(value)? as usize;
        }
        if let Some(value) = pairs.get("command_queue_size") {
            config.queue.command_queue_size = parse_number(value)? as usize;
        }
        if let Some(value) = pairs.get("pri_queue_size") {
            config.queue.pri_queue_size = parse_number(value)? as usize;
        }

        if let Some(value) = pairs.get("tlb_cache_size") {
            config.cache.tlb_cache_size = parse_number(value)? as usize;
        }
        if let Some(value) = pairs.get("cache_max_age") {
            config.cache.cache_max_age_ms = parse_number(value)? as u32;
        }
        if let Some(value) = pairs.get("enable_caching") {
            config.cache.enable_caching = parse_boolean(value);
        }

        if let Some(value) = pairs.get("max_iova_size") {
            config.address.max_iova_size = parse_number(value)?;
        }
        if let Some(value) = pairs.get("max_pa_size") {
            config.address.max_pa_size = parse_number(value)?;
        }
        if let Some(value) = pairs.get("max_stream_count") {
            config.address.max_stream_count = parse_number(value)? as u32;
        }
        if let Some(value) = pairs.get("max_pasid_count") {
            config.address.max_pasid_count = parse_number(value)? as u32;
        }
        if let Some(value) = pairs.get("pasid0_valid") {
            config.address.pasid0_valid = parse_boolean(value);
        }

        if let Some(value) = pairs.get("max_memory_usage") {
            config.resources.max_memory_usage = parse_number(value)?;
        }
        if let Some(value) = pairs.get("max_thread_count") {
            config.resources.max_thread_count = parse_number(value)? as u32;
        }
        if let Some(value) = pairs.get("timeout_ms") {
            config.resources.timeout_ms = parse_number(value)? as u32;
        }
        if let Some(value) = pairs.get("enable_resource_tracking") {
            config.resources.enable_resource_tracking = parse_boolean(value);
        }

        if !config.is_valid() {
            return Err(SmmuError::InvalidConfiguration);
        }
        Ok(config)
    }
}

fn parse_key_value_pairs(text: &str) -> HashMap<String, String> {
    let mut pairs = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            pairs.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    pairs
}

fn parse_number(value: &str) -> Result<u64> {
    value.parse::<u64>().map_err(|_| SmmuError::ParseError)
}

/// Booleans accept `true|1|yes|on` case-insensitively; everything else is
/// false.
fn parse_boolean(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

/// Identifiers reserved for integrators; the model itself reads neither
/// files nor environment variables.
pub mod constants {
    pub const DEFAULT_CONFIG_FILE: &str = "smmu_config.txt";
    pub const BACKUP_CONFIG_FILE: &str = "smmu_config.backup.txt";
    pub const CONFIG_VERSION: &str = "1.0";

    pub const ENV_CONFIG_FILE: &str = "SMMU_CONFIG_FILE";
    pub const ENV_QUEUE_SIZE: &str = "SMMU_QUEUE_SIZE";
    pub const ENV_CACHE_SIZE: &str = "SMMU_CACHE_SIZE";
    pub const ENV_MEMORY_LIMIT: &str = "SMMU_MEMORY_LIMIT";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SmmuConfig::default();
        assert!(config.is_valid());
        assert_eq!(config.queue.event_queue_size, 512);
        assert_eq!(config.cache.tlb_cache_size, 1024);
        assert_eq!(config.address.max_iova_size, 48);
        assert!(config.address.pasid0_valid);
        assert_eq!(config.resources.timeout_ms, 1000);
    }

    #[test]
    fn all_profiles_are_valid() {
        for config in [
            SmmuConfig::default(),
            SmmuConfig::high_performance(),
            SmmuConfig::low_memory(),
            SmmuConfig::minimal(),
            SmmuConfig::server(),
            SmmuConfig::embedded(),
            SmmuConfig::development(),
        ] {
            assert!(config.is_valid());
            assert!(config.validate().is_valid);
        }
    }

    #[test]
    fn range_validation() {
        let mut config = SmmuConfig::default();
        config.queue.event_queue_size = 8;
        assert!(!config.is_valid());

        let mut config = SmmuConfig::default();
        config.cache.cache_max_age_ms = 50;
        assert!(!config.is_valid());
        assert!(!config.validate().errors.is_empty());

        let mut config = SmmuConfig::default();
        config.address.max_iova_size = 64;
        assert!(!config.is_valid());

        let mut config = SmmuConfig::default();
        config.resources.timeout_ms = 1;
        assert!(!config.is_valid());
    }

    #[test]
    fn setters_reject_invalid_values() {
        let mut config = SmmuConfig::default();
        assert_eq!(
            config.update_queue_sizes(4, 256, 128),
            Err(SmmuError::InvalidConfiguration)
        );
        // Rejected update leaves the previous value behind.
        assert_eq!(config.queue.event_queue_size, 512);

        assert!(config.update_cache_settings(2048, 200, false).is_ok());
        assert_eq!(config.cache.tlb_cache_size, 2048);
        assert!(!config.cache.enable_caching);
    }

    #[test]
    fn round_trip_through_text() {
        for config in [
            SmmuConfig::default(),
            SmmuConfig::high_performance(),
            SmmuConfig::low_memory(),
            SmmuConfig::minimal(),
            SmmuConfig::server(),
            SmmuConfig::embedded(),
            SmmuConfig::development(),
        ] {
            let text = config.to_string();
            let parsed: SmmuConfig = text.parse().unwrap();
            assert_eq!(parsed, config);
        }
    }

    #[test]
    fn parser_tolerates_comments_whitespace_and_unknown_keys() {
        let text = "\n\
            # queue tuning\n\
            event_queue_size = 64\n\
            \n\
            unknown_key = whatever\n\
            enable_caching = YES\n\
            tlb_cache_size=128\n";
        let config: SmmuConfig = text.parse().unwrap();
        assert_eq!(config.queue.event_queue_size, 64);
        assert_eq!(config.cache.tlb_cache_size, 128);
        assert!(config.cache.enable_caching);
        // Untouched keys keep their defaults.
        assert_eq!(config.queue.command_queue_size, 256);
    }

    #[test]
    fn pasid0_policy_round_trips() {
        let mut config = SmmuConfig::default();
        config.address.pasid0_valid = false;
        let parsed: SmmuConfig = config.to_string().parse().unwrap();
        assert_eq!(parsed, config);
        assert!(!parsed.address.pasid0_valid);

        let flagged: SmmuConfig = "pasid0_valid = off\n".parse().unwrap();
        assert!(!flagged.address.pasid0_valid);
    }

    #[test]
    fn boolean_forms() {
        for truthy in ["true", "TRUE", "1", "yes", "On"] {
            assert!(parse_boolean(truthy), "{truthy}");
        }
        for falsy in ["false", "0", "no", "off", "junk"] {
            assert!(!parse_boolean(falsy), "{falsy}");
        }
    }

    #[test]
    fn parse_rejects_bad_numbers_and_ranges() {
        assert_eq!(
            "event_queue_size=banana".parse::<SmmuConfig>(),
            Err(SmmuError::ParseError)
        );
        assert_eq!(
            "event_queue_size=4".parse::<SmmuConfig>(),
            Err(SmmuError::InvalidConfiguration)
        );
    }

    #[test]
    fn merge_and_reset() {
        let mut config = SmmuConfig::default();
        config.merge(&SmmuConfig::server()).unwrap();
        assert_eq!(config, SmmuConfig::server());

        let mut bad = SmmuConfig::server();
        bad.queue.event_queue_size = 0;
        assert_eq!(config.merge(&bad), Err(SmmuError::InvalidConfiguration));
        assert_eq!(config, SmmuConfig::server());

        config.reset();
        assert_eq!(config, SmmuConfig::default());
    }

    #[test]
    fn validation_warnings() {
        let validation = SmmuConfig::server().validate();
        assert!(validation.is_valid);
        assert!(!validation.warnings.is_empty());
    }
}
