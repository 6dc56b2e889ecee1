mod common;

use std::sync::Arc;

use common::{Harness, HostDrive, DMA_BUFFER};
use piix_ide::{DriveConfig, InquiryConfig};
use piix_storage::ScsiDirection;

fn read10(lba: u32, count: u16) -> [u8; 12] {
    let mut cdb = [0u8; 12];
    cdb[0] = 0x28;
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[7..9].copy_from_slice(&count.to_be_bytes());
    cdb
}

fn host(drive: HostDrive) -> (Harness, Arc<HostDrive>) {
    let drive = Arc::new(drive);
    let h = Harness::cdrom(Some(drive.clone()));
    (h, drive)
}

#[test]
fn commands_reach_the_host_unchanged() {
    let (h, drive) = host(HostDrive::new(64 * 1024));
    assert_eq!(h.packet_none(&[0x00]), 0x40);

    let sent = drive.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].cdb, vec![0u8; 12]);
    assert_eq!(sent[0].direction, ScsiDirection::None);
    assert_eq!(sent[0].len, 0);
}

#[test]
fn host_inquiry_is_passed_through() {
    let (h, _drive) = host(HostDrive::new(64 * 1024));
    let data = h.packet_in(&[0x12, 0, 0, 0, 36, 0], 0xFFFF);
    assert_eq!(&data[8..16], b"HOSTVEND");
    assert_eq!(&data[16..32], b"HOST CDROM DRIVE");
    assert_eq!(&data[32..36], b"1.00");
}

#[test]
fn inquiry_override_rewrites_host_strings() {
    let drive = DriveConfig {
        inquiry: Some(InquiryConfig {
            vendor: Some("GUEST".to_string()),
            product: Some("VIRTUAL DVD".to_string()),
            revision: None,
        }),
        ..DriveConfig::cdrom()
    };
    let h = Harness::with_drives(Some(drive), None);
    h.ctl
        .attach_medium(0, Arc::new(HostDrive::new(64 * 1024)))
        .unwrap();

    let data = h.packet_in(&[0x12, 0, 0, 0, 36, 0], 0xFFFF);
    assert_eq!(&data[8..16], b"GUEST   ");
    assert_eq!(&data[16..32], b"VIRTUAL DVD     ");
    assert_eq!(&data[32..36], b"1.00");
}

#[test]
fn large_reads_are_split_to_the_host_limit() {
    let (h, drive) = host(HostDrive::new(8 * 1024));
    let data = h.packet_in(&read10(100, 20), 0xFFFF);

    let sent = drive.sent();
    let lbas: Vec<u32> = sent
        .iter()
        .map(|c| u32::from_be_bytes([c.cdb[2], c.cdb[3], c.cdb[4], c.cdb[5]]))
        .collect();
    let counts: Vec<u16> = sent
        .iter()
        .map(|c| u16::from_be_bytes([c.cdb[7], c.cdb[8]]))
        .collect();
    assert_eq!(lbas, vec![100, 104, 108, 112, 116]);
    assert_eq!(counts, vec![4; 5]);
    assert!(sent.iter().all(|c| c.len == 8 * 1024 && c.cdb[0] == 0x28));

    assert_eq!(data.len(), 20 * 2048);
    for (i, sector) in data.chunks(2048).enumerate() {
        assert!(sector.iter().all(|&b| b == 100 + i as u8), "sector {i}");
    }
    assert_eq!(h.alt_status(), 0x40);
    assert_eq!(h.ctl.stats(0).unwrap().bytes_read, 20 * 2048);
}

#[test]
fn host_check_condition_is_reported_and_sense_answered_locally() {
    let (h, drive) = host(HostDrive::new(64 * 1024));
    *drive.fail_next.lock().unwrap() = Some((0x03, 0x11, 0x05));

    h.packet(&read10(0, 1), 0xFFFF, false);
    assert_eq!(h.status(), 0x41);
    assert_eq!(h.error(), 0x30);
    assert_eq!(drive.sent().len(), 1);

    assert_eq!(h.sense(), (0x03, 0x11, 0x05));
    assert_eq!(drive.sent().len(), 1, "sense served from the cached copy");

    // Once consumed, REQUEST SENSE goes to the host again.
    h.sense();
    assert_eq!(drive.sent().len(), 2);
    assert_eq!(drive.sent()[1].cdb[0], 0x03);
}

#[test]
fn oversized_non_splittable_transfers_are_rejected() {
    let (h, drive) = host(HostDrive::new(8 * 1024));
    let cdb = [0x5A, 0, 0x3F, 0, 0, 0, 0, 0xFF, 0xFF, 0, 0, 0];
    assert_eq!(h.packet_none(&cdb), 0x41);
    assert!(drive.sent().is_empty());
    assert_eq!(h.sense(), (0x05, 0x24, 0));
    assert!(drive.sent().is_empty());
}

#[test]
fn unknown_opcodes_never_reach_the_host() {
    let (h, drive) = host(HostDrive::new(64 * 1024));
    assert_eq!(h.packet_none(&[0xEE]), 0x41);
    assert_eq!(h.sense(), (0x05, 0x20, 0));
    assert!(drive.sent().is_empty());
}

#[test]
fn sector_size_follows_the_host_region() {
    let (h, drive) = host(HostDrive::new(64 * 1024).with_block_size(2352));
    let data = h.packet_in(&read10(7, 2), 0xFFFF);
    assert_eq!(data.len(), 2 * 2352);
    assert!(data[..2352].iter().all(|&b| b == 7));
    assert!(data[2352..].iter().all(|&b| b == 8));
    assert_eq!(drive.sent()[0].len, 2 * 2352);
}

#[test]
fn parameter_lists_are_sent_to_the_host() {
    let (h, drive) = host(HostDrive::new(64 * 1024));
    let params: Vec<u8> = (0..16).collect();
    let cdb = [0x55, 0x10, 0, 0, 0, 0, 0, 0, 16, 0, 0, 0];
    h.packet(&cdb, 0xFFFF, false);

    assert_eq!(h.alt_status() & 0x08, 0x08);
    assert_eq!(h.byte_count(), 16);
    assert_eq!(h.ireason(), 0x00);
    h.write_data(&params);
    h.wait();

    assert_eq!(h.alt_status(), 0x40);
    assert_eq!(*drive.written.lock().unwrap(), params);
    let sent = drive.sent();
    assert_eq!(sent[0].direction, ScsiDirection::ToDevice);
    assert_eq!(sent[0].len, 16);
}

#[test]
fn passthrough_reads_over_dma() {
    let (h, _drive) = host(HostDrive::new(64 * 1024));
    h.setup_prd(&[(DMA_BUFFER, 3 * 2048)]);
    h.bm_start(true);
    h.packet(&read10(40, 3), 0, true);

    assert_eq!(h.alt_status(), 0x40);
    assert_eq!(h.bm_status() & 0x07, 0x04);
    let data = h.guest_read(DMA_BUFFER, 3 * 2048);
    assert!(data[..2048].iter().all(|&b| b == 40));
    assert!(data[4096..].iter().all(|&b| b == 42));
}
