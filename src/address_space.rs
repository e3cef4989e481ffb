//! A single translation domain: the sparse page-aligned IOVA -> PA mapping
//! backing one stage of translation.
//!
//! One instance exists per PASID for stage 1; a stream's stage 2 instance
//! may be shared across streams through an `Arc` handle, so all mutation
//! goes through an internal lock.

use std::collections::BTreeMap;
use std::sync::Mutex;

use memory_addr::{align_down_4k, is_aligned_4k};

use crate::error::{Result, SmmuError};
use crate::lock;
use crate::types::{
    AccessType, Iova, Pa, PagePermissions, SecurityState, TranslationData, MAX_ADDRESS_BITS,
    PAGE_MASK,
};

/// One mapped page: output page address plus its attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageEntry {
    pub physical_address: Pa,
    pub permissions: PagePermissions,
    pub security_state: SecurityState,
}

/// Sparse page table for one translation domain.
///
/// Keys are page-aligned IOVAs; a mapping is either absent or complete.
pub struct AddressSpace {
    pages: Mutex<BTreeMap<Iova, PageEntry>>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(BTreeMap::new()),
        }
    }

    /// Install a page-aligned mapping.
    ///
    /// Both addresses must be 4KB aligned and fit in the 52-bit
    /// architectural address range. Remapping an existing page replaces it.
    pub fn map(
        &self,
        iova: Iova,
        pa: Pa,
        permissions: PagePermissions,
        security_state: SecurityState,
    ) -> Result<()> {
        Self::check_address(iova)?;
        Self::check_address(pa)?;

        let mut pages = lock(&self.pages);
        pages.insert(iova, PageEntry {
            physical_address: pa,
            permissions,
            security_state,
        });
        Ok(())
    }

    /// Remove the mapping covering `iova`.
    pub fn unmap(&self, iova: Iova) -> Result<()> {
        let page = align_down_4k(iova as usize) as Iova;
        let mut pages = lock(&self.pages);
        match pages.remove(&page) {
            Some(_) => Ok(()),
            None => Err(SmmuError::PageNotMapped),
        }
    }

    /// Walk the domain for `iova`, returning the output address with the
    /// page offset preserved. Read-only; never mutates the table.
    pub fn translate(
        &self,
        iova: Iova,
        access: AccessType,
        security_state: SecurityState,
    ) -> Result<TranslationData> {
        let page = align_down_4k(iova as usize) as Iova;
        let pages = lock(&self.pages);
        let entry = pages.get(&page).ok_or(SmmuError::PageNotMapped)?;

        if !security_state.can_access(entry.security_state) {
            return Err(SmmuError::InvalidSecurityState);
        }
        if !entry.permissions.allows(access) {
            return Err(SmmuError::PagePermissionViolation);
        }

        Ok(TranslationData::new(
            entry.physical_address | (iova & PAGE_MASK),
            entry.permissions,
            entry.security_state,
        ))
    }

    /// Whether `iova`'s page is currently mapped.
    pub fn is_mapped(&self, iova: Iova) -> bool {
        let page = align_down_4k(iova as usize) as Iova;
        lock(&self.pages).contains_key(&page)
    }

    /// Number of mapped pages.
    pub fn len(&self) -> usize {
        lock(&self.pages).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.pages).is_empty()
    }

    /// Drop every mapping in the domain.
    pub fn clear(&self) {
        lock(&self.pages).clear();
    }

    /// Snapshot of all mappings, ordered by IOVA.
    pub fn iter_mappings(&self) -> Vec<(Iova, PageEntry)> {
        lock(&self.pages).iter().map(|(k, v)| (*k, *v)).collect()
    }

    fn check_address(addr: u64) -> Result<()> {
        if !is_aligned_4k(addr as usize) {
            return Err(SmmuError::InvalidAddress);
        }
        if addr >> MAX_ADDRESS_BITS != 0 {
            return Err(SmmuError::InvalidAddress);
        }
        Ok(())
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}
