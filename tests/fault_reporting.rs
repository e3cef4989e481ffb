//! Fault reporting through the full stack: classification, syndrome
//! contents, filtering and rate queries.

use smmuv3_model::{
    current_time_us, AccessClassification, AccessType, FaultType, PagePermissions,
    PrivilegeLevel, SecurityState, Smmu, SmmuError, StreamConfig,
};

fn stage1_config() -> StreamConfig {
    StreamConfig {
        translation_enabled: true,
        stage1_enabled: true,
        stage2_enabled: false,
        ..Default::default()
    }
}

fn setup_stream(smmu: &Smmu, stream_id: u32, pasid: u32) {
    smmu.configure_stream(stream_id, &stage1_config()).unwrap();
    smmu.enable_stream(stream_id).unwrap();
    smmu.create_stream_pasid(stream_id, pasid).unwrap();
}

#[test]
fn translation_fault_classification_and_syndrome() {
    let smmu = Smmu::new();
    setup_stream(&smmu, 1, 1);

    assert_eq!(
        smmu.translate(1, 1, 0x8000, AccessType::Read, SecurityState::NonSecure),
        Err(SmmuError::PageNotMapped)
    );

    let fault = smmu.events().unwrap()[0];
    assert_eq!(fault.fault_type, FaultType::TranslationFault);
    assert_eq!(fault.stream_id, 1);
    assert_eq!(fault.pasid, 1);
    assert_eq!(fault.address, 0x8000);
    // Stage 1 only: translation fault FSC at level 1, no stage 2 bit.
    assert_eq!(fault.syndrome.fsc(), 0x05);
    assert!(!fault.syndrome.is_stage2());
    assert!(!fault.syndrome.is_write());
    assert_eq!(fault.syndrome.register >> 16 & 0xFF, 0x42);
}

#[test]
fn privilege_and_access_classification() {
    let smmu = Smmu::new();
    setup_stream(&smmu, 1, 1);
    smmu.map_page(1, 1, 0x1000, 0x4000_0000, PagePermissions::READ, SecurityState::NonSecure)
        .unwrap();

    // An execute attempt on a no-exec page is an instruction fetch at
    // EL0 in the syndrome.
    assert_eq!(
        smmu.translate(1, 1, 0x1000, AccessType::Execute, SecurityState::NonSecure),
        Err(SmmuError::PagePermissionViolation)
    );
    let fault = *smmu.events().unwrap().last().unwrap();
    assert_eq!(fault.fault_type, FaultType::PermissionFault);
    assert_eq!(fault.syndrome.access_class, AccessClassification::InstructionFetch);
    assert_eq!(fault.syndrome.privilege, PrivilegeLevel::El0);
    assert!(fault.syndrome.is_instruction_fetch());
}

#[test]
fn every_translation_failure_leaves_a_record() {
    let smmu = Smmu::new();
    // Unconfigured stream, then unconfigured PASID, then unmapped page.
    let _ = smmu.translate(1, 1, 0x1000, AccessType::Read, SecurityState::NonSecure);
    setup_stream(&smmu, 1, 1);
    let _ = smmu.translate(1, 9, 0x1000, AccessType::Read, SecurityState::NonSecure);
    let _ = smmu.translate(1, 1, 0x1000, AccessType::Read, SecurityState::NonSecure);

    assert_eq!(smmu.total_faults(), 3);
    assert_eq!(smmu.events().unwrap().len(), 3);
    // Each failure also mirrored into the event queue.
    assert_eq!(smmu.event_queue_size(), 3);
}

#[test]
fn filtering_by_stream_and_pasid() {
    let smmu = Smmu::new();
    setup_stream(&smmu, 100, 1);
    setup_stream(&smmu, 200, 2);

    let _ = smmu.translate(100, 1, 0x1000, AccessType::Read, SecurityState::NonSecure);
    let _ = smmu.translate(100, 1, 0x2000, AccessType::Read, SecurityState::NonSecure);
    let _ = smmu.translate(200, 2, 0x3000, AccessType::Write, SecurityState::NonSecure);

    let handler = smmu.fault_handler();
    assert_eq!(handler.faults_by_stream(100).len(), 2);
    assert_eq!(handler.faults_by_stream(200).len(), 1);
    assert_eq!(handler.faults_by_pasid(1).len(), 2);
    assert_eq!(handler.faults_by_pasid(2).len(), 1);
    assert_eq!(handler.fault_count_by_access_type(AccessType::Write), 1);
    assert_eq!(handler.fault_count_by_type(FaultType::TranslationFault), 3);
}

#[test]
fn fault_rate_over_a_window() {
    let smmu = Smmu::new();
    setup_stream(&smmu, 1, 1);
    for i in 0..5u64 {
        let _ = smmu.translate(1, 1, 0x1000 * i + 0x1000, AccessType::Read, SecurityState::NonSecure);
    }

    let handler = smmu.fault_handler();
    let now = current_time_us();
    // Everything just happened, so a generous window sees all of it.
    assert_eq!(handler.fault_rate(now, 60_000_000), 5);
    // An empty window sees none.
    assert_eq!(handler.fault_rate(0, 0), 0);
}

#[test]
fn fault_statistics_counters() {
    let smmu = Smmu::new();
    setup_stream(&smmu, 1, 1);
    smmu.map_page(1, 1, 0x1000, 0x4000_0000, PagePermissions::READ, SecurityState::NonSecure)
        .unwrap();

    let _ = smmu.translate(1, 1, 0x9000, AccessType::Read, SecurityState::NonSecure);
    let _ = smmu.translate(1, 1, 0x1000, AccessType::Write, SecurityState::NonSecure);

    let handler = smmu.fault_handler();
    assert_eq!(handler.total_fault_count(), 2);
    assert_eq!(handler.translation_fault_count(), 1);
    assert_eq!(handler.permission_fault_count(), 1);

    // Clearing records keeps the running totals; resetting statistics
    // keeps the records.
    smmu.clear_events().unwrap();
    assert_eq!(handler.total_fault_count(), 2);
    assert_eq!(smmu.events().unwrap().len(), 0);

    let _ = smmu.translate(1, 1, 0x9000, AccessType::Read, SecurityState::NonSecure);
    handler.reset_statistics();
    assert_eq!(handler.total_fault_count(), 0);
    assert_eq!(smmu.events().unwrap().len(), 1);
}

#[test]
fn record_retention_is_bounded() {
    let smmu = Smmu::new();
    setup_stream(&smmu, 1, 1);
    let handler = smmu.fault_handler();
    handler.set_max_records(8);

    for i in 0..20u64 {
        let _ = smmu.translate(1, 1, 0x1000 * (i + 1), AccessType::Read, SecurityState::NonSecure);
    }
    let events = smmu.events().unwrap();
    assert_eq!(events.len(), 8);
    // The oldest records were trimmed; the survivors are the last eight.
    assert_eq!(events[0].address, 0xD000);
    assert_eq!(handler.total_fault_count(), 20);
}

#[test]
fn address_size_fault_above_48_bits() {
    let smmu = Smmu::new();
    setup_stream(&smmu, 1, 1);

    // Default address configuration: 48-bit input addresses.
    let huge = 1u64 << 49;
    assert_eq!(
        smmu.translate(1, 1, huge, AccessType::Read, SecurityState::NonSecure),
        Err(SmmuError::InvalidAddress)
    );
    let fault = *smmu.events().unwrap().last().unwrap();
    assert_eq!(fault.fault_type, FaultType::AddressSizeFault);
    assert_eq!(fault.syndrome.fsc(), 0x00);
}

#[test]
fn null_address_access_fault() {
    let smmu = Smmu::new();
    setup_stream(&smmu, 1, 1);
    smmu.disable_stream(1).unwrap();

    // A rejected access at address zero classifies as an access fault.
    let _ = smmu.translate(1, 1, 0, AccessType::Read, SecurityState::NonSecure);
    let fault = *smmu.events().unwrap().last().unwrap();
    assert_eq!(fault.fault_type, FaultType::AccessFault);
    assert_eq!(fault.syndrome.fsc(), 0x02);
}
