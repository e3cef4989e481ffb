//! Fault syndrome register encoding.
//!
//! Event records carry a 32-bit syndrome word laid out like the A-profile
//! ISS fault encoding:
//!
//! - bits `[5:0]`   FSC, fault status code
//! - bit  `[6]`     WnR, write not read
//! - bit  `[7]`     S2, fault occurred during stage 2
//! - bit  `[8]`     INST, instruction fetch
//! - bits `[23:16]` implementation defined signature

use tock_registers::fields::FieldValue;
use tock_registers::register_bitfields;

use crate::fault::{AccessClassification, FaultStage, FaultType, PrivilegeLevel};
use crate::types::{AccessType, SecurityState};

register_bitfields! {u32,
    pub SYNDROME [
        /// Fault status code.
        FSC OFFSET(0) NUMBITS(6) [],
        /// Write not Read.
        WNR OFFSET(6) NUMBITS(1) [],
        /// The fault was taken during stage 2 of the translation.
        S2 OFFSET(7) NUMBITS(1) [],
        /// The faulting access was an instruction fetch.
        INST OFFSET(8) NUMBITS(1) [],
        /// Implementation defined signature byte.
        IMPDEF OFFSET(16) NUMBITS(8) [],
    ]
}

/// Signature placed in SYNDROME.IMPDEF by this implementation.
pub const IMPDEF_SIGNATURE: u32 = 0x42;

// FSC values, D8.14 fault status codes. Translation, access flag and
// permission codes carry the faulting lookup level in their low two bits.
const FSC_ADDRESS_SIZE: u32 = 0x00;
const FSC_DEBUG: u32 = 0x02;
const FSC_TRANSLATION: u32 = 0x04;
const FSC_ACCESS_FLAG: u32 = 0x08;
const FSC_FORMAT: u32 = 0x0A;
const FSC_PERMISSION: u32 = 0x0C;
const FSC_SYNC_EXTERNAL: u32 = 0x10;
const FSC_ASYNC_EXTERNAL: u32 = 0x11;
const FSC_SECURITY: u32 = 0x20;
const FSC_TLB_CONFLICT: u32 = 0x30;

/// Structured fault syndrome attached to a fault record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultSyndrome {
    /// The encoded 32-bit syndrome word.
    pub register: u32,
    pub stage: FaultStage,
    pub fault_level: u8,
    pub privilege: PrivilegeLevel,
    pub access_class: AccessClassification,
    pub write_access: bool,
    pub context_descriptor_index: u16,
}

impl Default for FaultSyndrome {
    fn default() -> Self {
        Self {
            register: 0,
            stage: FaultStage::Unknown,
            fault_level: 0,
            privilege: PrivilegeLevel::El1,
            access_class: AccessClassification::Unknown,
            write_access: false,
            context_descriptor_index: 0,
        }
    }
}

impl FaultSyndrome {
    /// Build the full syndrome for a classified fault.
    pub fn generate(
        fault_type: FaultType,
        stage: FaultStage,
        access: AccessType,
        security_state: SecurityState,
        fault_level: u8,
        context_descriptor_index: u16,
    ) -> Self {
        let write_access = access == AccessType::Write;
        let instruction_fetch = access == AccessType::Execute;
        Self {
            register: encode_register(fault_type, stage, fault_level, write_access, instruction_fetch),
            stage,
            fault_level,
            privilege: privilege_level(access, security_state),
            access_class: classify_access(access),
            write_access,
            context_descriptor_index,
        }
    }

    pub fn fsc(&self) -> u32 {
        SYNDROME::FSC.read(self.register)
    }

    pub fn is_stage2(&self) -> bool {
        SYNDROME::S2.read(self.register) != 0
    }

    pub fn is_write(&self) -> bool {
        SYNDROME::WNR.read(self.register) != 0
    }

    pub fn is_instruction_fetch(&self) -> bool {
        SYNDROME::INST.read(self.register) != 0
    }
}

/// Encode the 32-bit syndrome word for a fault.
pub fn encode_register(
    fault_type: FaultType,
    stage: FaultStage,
    level: u8,
    write_access: bool,
    instruction_fetch: bool,
) -> u32 {
    let level = u32::from(level);
    let fsc = match fault_type {
        FaultType::TranslationFault
        | FaultType::Level0TranslationFault
        | FaultType::Level1TranslationFault
        | FaultType::Level2TranslationFault
        | FaultType::Level3TranslationFault => FSC_TRANSLATION | (level & 0x3),
        FaultType::PermissionFault => FSC_PERMISSION | (level & 0x3),
        FaultType::AddressSizeFault => FSC_ADDRESS_SIZE,
        FaultType::AccessFlagFault => FSC_ACCESS_FLAG | (level & 0x3),
        FaultType::DirtyBitFault | FaultType::TlbConflictFault => FSC_TLB_CONFLICT,
        FaultType::ExternalAbort | FaultType::SynchronousExternalAbort => FSC_SYNC_EXTERNAL,
        FaultType::AsynchronousExternalAbort => FSC_ASYNC_EXTERNAL,
        FaultType::ContextDescriptorFormatFault
        | FaultType::TranslationTableFormatFault
        | FaultType::StreamTableFormatFault => FSC_FORMAT,
        FaultType::SecurityFault => FSC_SECURITY,
        FaultType::AccessFault => FSC_DEBUG,
    };

    let stage2 = matches!(stage, FaultStage::Stage2 | FaultStage::BothStages);
    let fields: FieldValue<u32, SYNDROME::Register> = SYNDROME::FSC.val(fsc & 0x3F)
        + SYNDROME::WNR.val(u32::from(write_access))
        + SYNDROME::S2.val(u32::from(stage2))
        + SYNDROME::INST.val(u32::from(instruction_fetch))
        + SYNDROME::IMPDEF.val(IMPDEF_SIGNATURE);
    fields.value
}

/// Exception level the faulting access is attributed to, derived from the
/// transaction's security state and access kind.
pub fn privilege_level(access: AccessType, security_state: SecurityState) -> PrivilegeLevel {
    match security_state {
        SecurityState::Secure => PrivilegeLevel::El3,
        SecurityState::Realm => PrivilegeLevel::El2,
        SecurityState::NonSecure => {
            if access == AccessType::Execute {
                PrivilegeLevel::El0
            } else {
                PrivilegeLevel::El1
            }
        }
    }
}

/// Classify an access for the syndrome's access descriptor.
pub fn classify_access(access: AccessType) -> AccessClassification {
    match access {
        AccessType::Execute => AccessClassification::InstructionFetch,
        AccessType::Read | AccessType::Write => AccessClassification::DataAccess,
    }
}
