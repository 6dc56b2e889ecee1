mod common;

use std::sync::Arc;

use common::{patterned_disk, wait_until, FlakyMedium, Harness, DMA_BUFFER};
use piix_ide::regs::ATA_REG_SECTOR_COUNT;
use piix_ide::DriveConfig;
use piix_storage::{ByteRange, RamMedium};

const BM_ACTIVE: u8 = 0x01;
const BM_ERROR: u8 = 0x02;
const BM_IRQ: u8 = 0x04;

#[test]
fn read_dma_fills_guest_memory() {
    let h = Harness::disk(Arc::new(patterned_disk(64)));
    h.setup_prd(&[(DMA_BUFFER, 2048), (DMA_BUFFER + 0x1000, 2048)]);
    h.bm_start(true);
    h.select(0);
    h.lba28(20, 8);
    h.run(0xC8);

    assert_eq!(h.alt_status(), 0x50);
    assert_eq!(h.bm_status() & (BM_ACTIVE | BM_ERROR | BM_IRQ), BM_IRQ);
    assert_eq!(h.irq.raised(), 1);

    let first = h.guest_read(DMA_BUFFER, 2048);
    let second = h.guest_read(DMA_BUFFER + 0x1000, 2048);
    for (i, sector) in first.chunks(512).chain(second.chunks(512)).enumerate() {
        assert!(sector.iter().all(|&b| b == 20 + i as u8), "sector {i}");
    }

    // IRQ is write-1-to-clear.
    h.ctl.write_bus_master(2, 1, u32::from(BM_IRQ));
    assert_eq!(h.bm_status() & BM_IRQ, 0);
}

#[test]
fn read_dma_waits_for_the_bus_master() {
    let h = Harness::disk(Arc::new(patterned_disk(16)));
    h.setup_prd(&[(DMA_BUFFER, 1024)]);
    h.select(0);
    h.lba28(2, 2);
    h.run(0xC8);

    // Data is staged but nothing moves until the guest starts the engine.
    assert_eq!(h.alt_status(), 0x58);
    assert_eq!(h.irq.raised(), 0);
    assert!(h.guest_read(DMA_BUFFER, 1024).iter().all(|&b| b == 0));

    h.bm_start(true);
    h.wait();
    assert_eq!(h.alt_status(), 0x50);
    let data = h.guest_read(DMA_BUFFER, 1024);
    assert!(data[..512].iter().all(|&b| b == 2));
    assert!(data[512..].iter().all(|&b| b == 3));
}

#[test]
fn write_dma_reaches_the_medium() {
    let medium = Arc::new(RamMedium::disk(32));
    let h = Harness::disk(medium.clone());
    h.guest_write(DMA_BUFFER, &[0x5A; 1536]);
    h.setup_prd(&[(DMA_BUFFER, 1536)]);
    h.bm_start(false);
    h.select(0);
    h.lba28(4, 3);
    h.run(0xCA);

    assert_eq!(h.alt_status(), 0x50);
    assert_eq!(h.bm_status() & BM_IRQ, BM_IRQ);
    let contents = medium.contents();
    assert!(contents[4 * 512..7 * 512].iter().all(|&b| b == 0x5A));
    assert!(contents[7 * 512..8 * 512].iter().all(|&b| b == 0));
    assert_eq!(h.ctl.stats(0).unwrap().bytes_written, 1536);
}

#[test]
fn short_descriptor_table_fails_the_command() {
    let h = Harness::disk(Arc::new(patterned_disk(16)));
    h.setup_prd(&[(DMA_BUFFER, 512)]);
    h.bm_start(true);
    h.select(0);
    h.lba28(0, 4);
    h.run(0xC8);

    assert_eq!(h.status(), 0x41);
    assert_eq!(h.error(), 0x04);
    assert_eq!(h.bm_status() & (BM_ACTIVE | BM_ERROR | BM_IRQ), BM_ERROR | BM_IRQ);
}

#[test]
fn transient_read_error_is_replayed_after_resume() {
    let medium = Arc::new(FlakyMedium::new(patterned_disk(16), 1));
    let h = Harness::disk(medium);
    h.setup_prd(&[(DMA_BUFFER, 512)]);
    h.bm_start(true);
    h.select(0);
    h.lba28(9, 1);
    h.command(0xC8);

    assert!(wait_until(|| h.redo.count() == 1));
    // The command stays in flight while the host condition is being fixed.
    assert_eq!(h.alt_status() & 0x80, 0x80);
    assert!(!h.ctl.wait_for_idle(std::time::Duration::from_millis(20)));
    assert_eq!(h.ctl.stats(0).unwrap().redos, 1);

    h.ctl.resume();
    h.wait();
    assert_eq!(h.alt_status(), 0x50);
    assert!(h.guest_read(DMA_BUFFER, 512).iter().all(|&b| b == 9));
    assert_eq!(h.redo.count(), 1);
}

#[test]
fn transient_write_error_continues_from_the_saved_descriptor() {
    let medium = Arc::new(FlakyMedium::new(RamMedium::disk(16), 1));
    let h = Harness::disk(medium.clone());
    h.guest_write(DMA_BUFFER, &[0x77; 1024]);
    h.setup_prd(&[(DMA_BUFFER, 1024)]);
    h.bm_start(false);
    h.select(0);
    h.lba28(1, 2);
    h.command(0xCA);

    assert!(wait_until(|| h.redo.count() == 1));
    assert!(medium.contents().iter().all(|&b| b == 0));

    h.ctl.resume();
    h.wait();
    assert_eq!(h.alt_status(), 0x50);
    assert_eq!(h.bm_status() & BM_IRQ, BM_IRQ);
    let contents = medium.contents();
    assert!(contents[512..1536].iter().all(|&b| b == 0x77));
}

#[test]
fn write_redo_between_buffer_refills_writes_every_byte_once() {
    // Three 1 KiB flushes; the second one fails once.
    let medium = Arc::new(FlakyMedium::failing_after(RamMedium::disk(32), 1, 1));
    let drive = DriveConfig {
        io_buffer_bytes: Some(1024),
        ..DriveConfig::disk()
    };
    let h = Harness::with_drives(Some(drive), None);
    h.ctl.attach_medium(0, medium.clone()).unwrap();

    let payload: Vec<u8> = (0..3072).map(|i| (i % 251) as u8).collect();
    h.guest_write(DMA_BUFFER, &payload);
    h.setup_prd(&[(DMA_BUFFER, 1300), (DMA_BUFFER + 1300, 1772)]);
    h.bm_start(false);
    h.select(0);
    h.lba28(10, 6);
    h.command(0xCA);

    assert!(wait_until(|| h.redo.count() == 1));
    assert_eq!(medium.bytes_written(), 1024);

    h.ctl.resume();
    h.wait();
    assert_eq!(h.alt_status(), 0x50);
    assert_eq!(h.bm_status() & (BM_ACTIVE | BM_ERROR | BM_IRQ), BM_IRQ);
    assert_eq!(medium.bytes_written(), 3072);
    let contents = medium.contents();
    assert_eq!(&contents[10 * 512..16 * 512], &payload[..]);
    assert!(contents[16 * 512..17 * 512].iter().all(|&b| b == 0));
    assert_eq!(h.ctl.stats(0).unwrap().bytes_written, 3072);
}

#[test]
fn dma_under_an_already_started_engine_is_reported_active() {
    let medium = Arc::new(FlakyMedium::failing_after(RamMedium::disk(16), 1, 1));
    let h = Harness::disk(medium.clone());
    h.guest_write(DMA_BUFFER, &[0x11; 1024]);
    h.setup_prd(&[(DMA_BUFFER, 1024)]);
    h.bm_start(false);
    h.select(0);
    h.lba28(0, 2);
    h.run(0xCA);
    assert_eq!(h.status(), 0x50);
    assert_eq!(h.bm_status() & (BM_ACTIVE | BM_IRQ), BM_IRQ);

    // START stays set; only the interrupt is acknowledged.
    h.ctl.write_bus_master(2, 1, u32::from(BM_IRQ));
    h.guest_write(DMA_BUFFER, &[0x22; 1024]);
    h.lba28(4, 2);
    h.command(0xCA);

    assert!(wait_until(|| h.redo.count() == 1));
    assert_eq!(h.bm_status() & BM_ACTIVE, BM_ACTIVE);

    h.ctl.resume();
    h.wait();
    assert_eq!(h.alt_status(), 0x50);
    assert_eq!(h.bm_status() & (BM_ACTIVE | BM_ERROR | BM_IRQ), BM_IRQ);
    let contents = medium.contents();
    assert!(contents[..1024].iter().all(|&b| b == 0x11));
    assert!(contents[2048..3072].iter().all(|&b| b == 0x22));
}

#[test]
fn trim_discards_the_listed_ranges() {
    let medium = Arc::new(patterned_disk(64));
    let drive = DriveConfig {
        trim: true,
        ..DriveConfig::disk()
    };
    let h = Harness::with_drives(Some(drive), None);
    h.ctl.attach_medium(0, medium.clone()).unwrap();

    let mut ranges = vec![0u8; 512];
    ranges[..8].copy_from_slice(&(8u64 | 2 << 48).to_le_bytes());
    ranges[8..16].copy_from_slice(&(40u64 | 1 << 48).to_le_bytes());
    h.guest_write(DMA_BUFFER, &ranges);
    h.setup_prd(&[(DMA_BUFFER, 512)]);
    h.bm_start(false);

    h.select(0);
    h.feature(0x01);
    // One block of range entries, written as a 48-bit count.
    h.ctl.write_command(ATA_REG_SECTOR_COUNT, 1, 0);
    h.ctl.write_command(ATA_REG_SECTOR_COUNT, 1, 1);
    h.run(0x06);

    assert_eq!(h.alt_status(), 0x50);
    assert_eq!(
        medium.discarded_ranges(),
        vec![
            ByteRange {
                offset: 8 * 512,
                len: 2 * 512
            },
            ByteRange {
                offset: 40 * 512,
                len: 512
            },
        ]
    );
    let contents = medium.contents();
    assert!(contents[8 * 512..10 * 512].iter().all(|&b| b == 0));
    assert!(contents[10 * 512..11 * 512].iter().all(|&b| b == 10));
    assert_eq!(h.ctl.stats(0).unwrap().discards, 2);
}

#[test]
fn trim_is_rejected_when_not_advertised() {
    let h = Harness::disk(Arc::new(RamMedium::disk(16)));
    h.select(0);
    h.feature(0x01);
    h.run(0x06);
    assert_eq!(h.status(), 0x41);
    assert_eq!(h.error(), 0x04);
}
