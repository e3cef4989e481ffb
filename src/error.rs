//! Crate-wide error type. Every public operation returns [`Result`];
//! translation failures additionally leave a fault record behind.

use core::fmt;

/// Failure codes surfaced by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmmuError {
    // Identifier validation.
    InvalidStreamId,
    InvalidPasid,
    InvalidAddress,

    // Stream and PASID state.
    StreamNotConfigured,
    StreamNotFound,
    StreamDisabled,
    PasidNotFound,
    PasidAlreadyExists,

    // Mapping.
    PageNotMapped,
    PagePermissionViolation,

    // Security.
    InvalidSecurityState,

    // Configuration.
    InvalidConfiguration,
    ConfigurationError,
    ParseError,

    // Resources.
    CommandQueueFull,
    CacheOperationFailed,
    CacheEntryNotFound,
    AddressSpaceExhausted,
    TranslationTableError,
    PasidLimitExceeded,
    OutOfMemory,

    // Infrastructure.
    FaultHandlingError,
    InternalError,
}

impl fmt::Display for SmmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            SmmuError::InvalidStreamId => "StreamID out of configured range",
            SmmuError::InvalidPasid => "PASID out of configured range",
            SmmuError::InvalidAddress => "address misaligned or out of range",
            SmmuError::StreamNotConfigured => "stream has no configuration",
            SmmuError::StreamNotFound => "stream not present in stream table",
            SmmuError::StreamDisabled => "stream is disabled",
            SmmuError::PasidNotFound => "PASID not present in stream context",
            SmmuError::PasidAlreadyExists => "PASID already exists",
            SmmuError::PageNotMapped => "no mapping for the requested page",
            SmmuError::PagePermissionViolation => "mapping permissions deny the access",
            SmmuError::InvalidSecurityState => "security state mismatch",
            SmmuError::InvalidConfiguration => "configuration failed validation",
            SmmuError::ConfigurationError => "inconsistent configuration state",
            SmmuError::ParseError => "malformed configuration text",
            SmmuError::CommandQueueFull => "command queue is full",
            SmmuError::CacheOperationFailed => "cache operation failed",
            SmmuError::CacheEntryNotFound => "no matching cache entry",
            SmmuError::AddressSpaceExhausted => "stage 2 address space not available",
            SmmuError::TranslationTableError => "translation table produced an invalid output",
            SmmuError::PasidLimitExceeded => "PASID limit exceeded",
            SmmuError::OutOfMemory => "out of memory",
            SmmuError::FaultHandlingError => "fault handler unavailable",
            SmmuError::InternalError => "internal error",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for SmmuError {}

pub type Result<T> = core::result::Result<T, SmmuError>;
