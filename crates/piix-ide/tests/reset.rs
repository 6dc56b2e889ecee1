mod common;

use std::sync::Arc;

use common::{patterned_disk, patterned_iso, Harness};
use piix_ide::regs::{
    ATA_CTRL_ALT_STATUS_DEVICE_CTRL, ATA_REG_DATA, ATA_REG_LBA0, ATA_REG_LBA1, ATA_REG_LBA2,
    ATA_REG_SECTOR_COUNT,
};
use piix_ide::DriveConfig;

const SRST: u8 = 0x04;
const NIEN: u8 = 0x02;

fn software_reset(h: &Harness) {
    h.ctl.write_control(ATA_CTRL_ALT_STATUS_DEVICE_CTRL, SRST);
    assert_eq!(h.alt_status() & 0x80, 0x80);
    h.ctl.write_control(ATA_CTRL_ALT_STATUS_DEVICE_CTRL, 0);
    h.wait();
}

fn signature(h: &Harness) -> [u8; 4] {
    [
        h.reg(ATA_REG_SECTOR_COUNT),
        h.reg(ATA_REG_LBA0),
        h.reg(ATA_REG_LBA1),
        h.reg(ATA_REG_LBA2),
    ]
}

#[test]
fn disk_reports_its_signature_after_reset() {
    let h = Harness::disk(Arc::new(patterned_disk(8)));
    h.select(0);
    h.lba28(0x123456, 7);
    software_reset(&h);

    assert_eq!(h.alt_status(), 0x50);
    assert_eq!(h.error(), 0x01);
    assert_eq!(signature(&h), [1, 1, 0, 0]);
}

#[test]
fn packet_device_reports_its_signature_after_reset() {
    let h = Harness::cdrom(Some(Arc::new(patterned_iso(16))));
    software_reset(&h);

    assert_eq!(h.alt_status(), 0x00);
    assert_eq!(h.error(), 0x01);
    assert_eq!(signature(&h), [1, 1, 0x14, 0xEB]);
}

#[test]
fn disk_without_medium_reports_no_cylinders() {
    let h = Harness::with_drives(Some(DriveConfig::disk()), None);
    software_reset(&h);
    assert_eq!(signature(&h), [1, 1, 0xFF, 0xFF]);
}

#[test]
fn reset_cancels_a_pio_transfer() {
    let h = Harness::disk(Arc::new(patterned_disk(16)));
    h.select(0);
    h.lba28(0, 4);
    h.run(0x20);
    assert_eq!(h.status(), 0x58);
    h.read_data(512);
    h.wait();

    software_reset(&h);
    assert_eq!(h.alt_status(), 0x50);
    assert_eq!(h.ctl.read_command(ATA_REG_DATA, 2), 0);
    assert!(!h.irq.level());

    // The drive accepts new commands afterwards.
    h.lba28(5, 1);
    h.run(0x20);
    assert_eq!(h.status(), 0x58);
    assert!(h.read_data(512).iter().all(|&b| b == 5));
}

#[test]
fn commands_are_ignored_while_reset_is_asserted() {
    let h = Harness::disk(Arc::new(patterned_disk(8)));
    h.select(0);
    h.ctl.write_control(ATA_CTRL_ALT_STATUS_DEVICE_CTRL, SRST);
    h.lba28(0, 1);
    h.command(0x20);
    h.ctl.write_control(ATA_CTRL_ALT_STATUS_DEVICE_CTRL, 0);
    h.wait();
    assert_eq!(h.alt_status(), 0x50);
    assert_eq!(h.ctl.stats(0).unwrap().commands, 0);
}

#[test]
fn device_reset_only_applies_to_packet_devices() {
    let h = Harness::with_drives(Some(DriveConfig::disk()), Some(DriveConfig::cdrom()));
    h.ctl.attach_medium(0, Arc::new(patterned_disk(8))).unwrap();

    h.select(0);
    h.run(0x08);
    assert_eq!(h.status(), 0x41);
    assert_eq!(h.error(), 0x04);

    h.select(1);
    h.ctl.write_command(ATA_REG_LBA1, 1, 0x12);
    h.run(0x08);
    assert_eq!(h.alt_status(), 0x00);
    assert_eq!(h.error(), 0x01);
    assert_eq!(signature(&h), [1, 1, 0x14, 0xEB]);
}

#[test]
fn execute_diagnostic_resets_both_devices() {
    let h = Harness::with_drives(Some(DriveConfig::disk()), Some(DriveConfig::cdrom()));
    h.ctl.attach_medium(0, Arc::new(patterned_disk(8))).unwrap();

    h.select(1);
    h.command(0x90);
    // Diagnostics leave device 0 selected with its interrupt pending.
    assert!(h.irq.level());
    assert_eq!(h.status(), 0x50);
    assert_eq!(h.error(), 0x01);
    assert_eq!(signature(&h), [1, 1, 0, 0]);

    h.select(1);
    assert_eq!(signature(&h), [1, 1, 0x14, 0xEB]);
}

#[test]
fn execute_diagnostic_abandons_an_open_data_window() {
    let h = Harness::disk(Arc::new(patterned_disk(16)));
    h.select(0);
    h.lba28(3, 2);
    h.run(0x20);
    assert_eq!(h.status(), 0x58);
    assert!(h.read_data(100).iter().all(|&b| b == 3));

    h.command(0x90);
    assert_eq!(h.status(), 0x50);
    assert_eq!(h.error(), 0x01);
    assert_eq!(h.ctl.read_command(ATA_REG_DATA, 2), 0);
    h.wait();
    assert_eq!(h.alt_status(), 0x50);

    h.lba28(7, 1);
    h.run(0x20);
    assert_eq!(h.status(), 0x58);
    assert!(h.read_data(512).iter().all(|&b| b == 7));
    h.wait();
    assert_eq!(h.alt_status(), 0x50);
}

#[test]
fn reset_drops_a_command_still_waiting_in_the_queue() {
    let h = Harness::disk(Arc::new(patterned_disk(8)));
    h.ctl.suspend();
    h.select(0);
    h.lba28(2, 1);
    h.command(0x20);
    assert_eq!(h.alt_status() & 0x80, 0x80);

    h.ctl.write_control(ATA_CTRL_ALT_STATUS_DEVICE_CTRL, SRST);
    h.ctl.write_control(ATA_CTRL_ALT_STATUS_DEVICE_CTRL, 0);
    h.ctl.resume();
    h.wait();

    assert_eq!(h.alt_status(), 0x50);
    assert_eq!(signature(&h), [1, 1, 0, 0]);
    assert_eq!(h.ctl.read_command(ATA_REG_DATA, 2), 0);
    assert_eq!(h.ctl.stats(0).unwrap().bytes_read, 0);
}

#[test]
fn nien_masks_the_interrupt_line() {
    let h = Harness::disk(Arc::new(patterned_disk(8)));
    h.select(0);
    h.ctl.write_control(ATA_CTRL_ALT_STATUS_DEVICE_CTRL, NIEN);
    h.run(0xE7);
    assert!(!h.irq.level());

    // The interrupt stays latched and shows up once nIEN is cleared.
    h.ctl.write_control(ATA_CTRL_ALT_STATUS_DEVICE_CTRL, 0);
    assert!(h.irq.level());
    assert_eq!(h.status(), 0x50);
    assert!(!h.irq.level());
}

#[test]
fn only_the_selected_device_drives_the_line() {
    let h = Harness::with_drives(Some(DriveConfig::disk()), Some(DriveConfig::disk()));
    h.ctl.attach_medium(0, Arc::new(patterned_disk(8))).unwrap();
    h.select(0);
    h.run(0xE7);
    assert!(h.irq.level());

    h.select(1);
    assert!(!h.irq.level());
    h.select(0);
    assert!(h.irq.level());
}
