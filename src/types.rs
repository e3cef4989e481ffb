//! Identifiers, addresses and access attributes shared by every layer of the
//! model.

use std::sync::OnceLock;
use std::time::Instant;

use bitflags::bitflags;
use memory_addr::PAGE_SIZE_4K;

/// Identifier of a DMA-capable device (a "stream" in SMMU terms).
///
/// 3.3 Streams: a StreamID is up to 20 bits wide; the configured stream
/// table may cover fewer bits.
pub type StreamId = u32;

/// Process Address Space ID, selecting a translation context within a
/// stream. Matches the PCIe PASID / SMMU SubstreamID, up to 20 bits.
pub type Pasid = u32;

/// I/O virtual address as issued by a device.
pub type Iova = u64;
/// Intermediate physical address, the output of stage 1.
pub type Ipa = u64;
/// Physical address, the output of the final enabled stage.
pub type Pa = u64;

/// Architectural width of a StreamID.
pub const STREAM_ID_BITS: u32 = 20;
/// Largest StreamID representable in [`STREAM_ID_BITS`].
pub const MAX_STREAM_ID: StreamId = (1 << STREAM_ID_BITS) - 1;

/// Architectural width of a PASID (SMMU_IDR1.SSIDSIZE upper bound).
pub const PASID_BITS: u32 = 20;
/// Largest PASID representable in [`PASID_BITS`].
pub const MAX_PASID: Pasid = (1 << PASID_BITS) - 1;

/// Translation granule of the model. Only the 4KB granule is modeled; the
/// low [`PAGE_SIZE_BITS`] bits of an address are the page offset and are
/// preserved across translation.
pub const PAGE_SIZE_BITS: u32 = 12;
pub const PAGE_SIZE: u64 = PAGE_SIZE_4K as u64;
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Widest physical address the architecture permits (52-bit OAS).
pub const MAX_ADDRESS_BITS: u32 = 52;

/// Security state of a transaction or a mapping.
///
/// Chapter 3.9: the SMMU differentiates Non-secure, Secure and Realm
/// programming interfaces and transaction attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SecurityState {
    #[default]
    NonSecure,
    Secure,
    Realm,
}

impl SecurityState {
    /// Whether a transaction in `self` may touch a mapping tagged with
    /// `target`. Secure accesses may reach Non-secure mappings; Non-secure
    /// and Realm are confined to their own worlds.
    pub fn can_access(self, target: SecurityState) -> bool {
        match self {
            SecurityState::NonSecure => target == SecurityState::NonSecure,
            SecurityState::Secure => {
                target == SecurityState::Secure || target == SecurityState::NonSecure
            }
            SecurityState::Realm => target == SecurityState::Realm,
        }
    }
}

/// Kind of access a transaction performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

bitflags! {
    /// Permissions attached to a mapped page.
    ///
    /// READ/WRITE/EXECUTE gate the matching [`AccessType`]; USER and GLOBAL
    /// mirror the AP/nG descriptor attributes and are carried for
    /// completeness.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PagePermissions: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const USER = 1 << 3;
        const GLOBAL = 1 << 4;
    }
}

impl Default for PagePermissions {
    fn default() -> Self {
        Self::empty()
    }
}

impl PagePermissions {
    /// Read plus write, the common DMA buffer permission set.
    pub const fn rw() -> Self {
        Self::READ.union(Self::WRITE)
    }

    /// Full read/write/execute, used for bypass translations.
    pub const fn rwx() -> Self {
        Self::READ.union(Self::WRITE).union(Self::EXECUTE)
    }

    /// Whether these permissions allow `access`.
    pub fn allows(self, access: AccessType) -> bool {
        match access {
            AccessType::Read => self.contains(Self::READ),
            AccessType::Write => self.contains(Self::WRITE),
            AccessType::Execute => self.contains(Self::EXECUTE),
        }
    }
}

/// Outcome of a successful translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationData {
    pub physical_address: Pa,
    pub permissions: PagePermissions,
    pub security_state: SecurityState,
}

impl TranslationData {
    pub fn new(physical_address: Pa, permissions: PagePermissions, security_state: SecurityState) -> Self {
        Self {
            physical_address,
            permissions,
            security_state,
        }
    }
}

/// Monotonic microsecond clock used for every timestamp in the model
/// (queue entries, TLB entry age, fault records).
pub fn current_time_us() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as u64
}
