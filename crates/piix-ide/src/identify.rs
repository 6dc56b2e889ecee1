//! IDENTIFY DEVICE and IDENTIFY PACKET DEVICE pages.

use crate::device::{transfer_id, Device, MODE_MDMA, MODE_PIO, MODE_UDMA};

pub const IDENTIFY_LEN: usize = 512;

const LBA28_LIMIT: u64 = (1 << 28) - 1;

/// Writes `src` as a space-padded ATA string (byte-swapped within each word).
pub fn write_ata_string(dst_words: &mut [u16], src: &str) {
    let byte_len = dst_words.len() * 2;
    let mut bytes = vec![b' '; byte_len];
    let src_bytes = src.as_bytes();
    let copy_len = src_bytes.len().min(byte_len);
    bytes[..copy_len].copy_from_slice(&src_bytes[..copy_len]);

    for (word, pair) in dst_words.iter_mut().zip(bytes.chunks_exact(2)) {
        *word = u16::from_be_bytes([pair[0], pair[1]]);
    }
}

fn words_to_bytes(words: &[u16; 256]) -> [u8; IDENTIFY_LEN] {
    let mut out = [0u8; IDENTIFY_LEN];
    for (i, w) in words.iter().enumerate() {
        out[i * 2..i * 2 + 2].copy_from_slice(&w.to_le_bytes());
    }
    out
}

/// Stores the integrity word: signature 0xA5 in byte 510 and a checksum byte that makes all
/// 512 bytes sum to zero.
fn finish_checksum(words: &mut [u16; 256]) {
    words[255] = 0x00A5;
    let sum = words_to_bytes(words)[..511]
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b));
    words[255] |= u16::from(sum.wrapping_neg()) << 8;
}

fn write_strings(words: &mut [u16; 256], dev: &Device) {
    write_ata_string(&mut words[10..20], &dev.identity.serial);
    write_ata_string(&mut words[23..27], &dev.identity.firmware);
    write_ata_string(&mut words[27..47], &dev.identity.model);
}

fn set_u32(words: &mut [u16; 256], at: usize, val: u32) {
    words[at] = val as u16;
    words[at + 1] = (val >> 16) as u16;
}

/// Word 93: device detected via diagnostics, 80-conductor cable.
fn hardware_reset_result(index: usize) -> u16 {
    let detected = if index == 1 { 0x0300 } else { 0x0003 };
    detected | 1 << 13 | 1 << 14
}

/// IDENTIFY DEVICE page for a hard disk.
pub fn identify_device(dev: &Device, max_udma: Option<u8>) -> [u8; IDENTIFY_LEN] {
    let mut w = [0u16; 256];
    let phys = dev.physical;
    let cur = dev.translated;
    let total = dev.total_sectors;

    w[0] = 0x0040;
    w[1] = phys.cylinders;
    w[3] = u16::from(phys.heads);
    w[6] = u16::from(phys.sectors);
    write_strings(&mut w, dev);
    w[20] = 3;
    w[21] = 512;
    w[22] = 4;
    w[47] = 0x8000 | u16::from(dev.max_mult);
    w[48] = 1;
    // DMA, LBA, IORDY supported.
    w[49] = 1 << 11 | 1 << 9 | 1 << 8;
    w[50] = 1 << 14;
    w[51] = 240;
    w[52] = 240;
    w[53] = 1 | 1 << 1 | if max_udma.is_some() { 1 << 2 } else { 0 };
    w[54] = cur.cylinders;
    w[55] = u16::from(cur.heads);
    w[56] = u16::from(cur.sectors);
    set_u32(&mut w, 57, cur.total_sectors().min(u64::from(u32::MAX)) as u32);
    if dev.mult_sectors != 0 {
        w[59] = 0x100 | u16::from(dev.mult_sectors);
    }
    set_u32(&mut w, 60, total.min(LBA28_LIMIT) as u32);
    w[63] = transfer_id(MODE_MDMA, 2, dev.transfer_mode);
    // PIO modes 3 and 4.
    w[64] = 0x0003;
    w[65] = 120;
    w[66] = 120;
    w[67] = 120;
    w[68] = 120;
    if dev.trim_enabled {
        w[69] = 1 << 7;
    }
    w[80] = 0x7E;
    w[81] = 0x22;
    // SMART, write cache, look-ahead.
    w[82] = 1 << 3 | 1 << 5 | 1 << 6;
    w[83] = 1 << 14 | 1 << 12;
    if total > LBA28_LIMIT {
        // LBA48 and FLUSH CACHE EXT.
        w[83] |= 1 << 10 | 1 << 13;
    }
    w[84] = 1 << 14;
    w[85] = w[82];
    w[86] = w[83];
    w[87] = 1 << 14;
    if let Some(max) = max_udma {
        w[88] = transfer_id(MODE_UDMA, max, dev.transfer_mode);
    }
    w[93] = hardware_reset_result(dev.index);
    w[100] = total as u16;
    w[101] = (total >> 16) as u16;
    w[102] = (total >> 32) as u16;
    w[103] = (total >> 48) as u16;
    if dev.trim_enabled {
        w[105] = 1;
        w[169] = 1;
    }
    if dev.non_rotational {
        w[217] = 1;
    }
    finish_checksum(&mut w);
    words_to_bytes(&w)
}

/// IDENTIFY PACKET DEVICE page for an ATAPI CD/DVD drive.
pub fn identify_packet(dev: &Device, max_udma: Option<u8>) -> [u8; IDENTIFY_LEN] {
    let mut w = [0u16; 256];
    // ATAPI, CD/DVD, removable, accelerated DRQ, 12-byte packets.
    w[0] = 2 << 14 | 5 << 8 | 1 << 7 | 2 << 5;
    write_strings(&mut w, dev);
    w[49] = 1 << 11 | 1 << 9 | 1 << 8;
    w[53] = 1 | 1 << 1 | if max_udma.is_some() { 1 << 2 } else { 0 };
    w[63] = transfer_id(MODE_MDMA, 2, dev.transfer_mode);
    w[64] = 0x0003;
    w[65] = 120;
    w[66] = 120;
    w[67] = 120;
    w[68] = 120;
    w[73] = 0x003E;
    w[74] = 9;
    w[75] = 1;
    w[80] = 0x7E;
    // PACKET and DEVICE RESET feature sets.
    w[82] = 1 << 4 | 1 << 9;
    w[83] = 1 << 14;
    w[84] = 1 << 14;
    w[85] = w[82];
    w[86] = 0;
    w[87] = 1 << 14;
    if let Some(max) = max_udma {
        w[88] = transfer_id(MODE_UDMA, max, dev.transfer_mode);
    }
    w[93] = hardware_reset_result(dev.index);
    finish_checksum(&mut w);
    words_to_bytes(&w)
}

/// Transfer mode selected after power-on: the highest DMA mode the chipset offers.
pub fn default_transfer_mode(max_udma: Option<u8>) -> u8 {
    match max_udma {
        Some(max) => MODE_UDMA | max,
        None => MODE_MDMA | 2,
    }
}

/// Validates a SET FEATURES 0x03 mode byte and clamps it to what the chipset supports.
pub fn select_transfer_mode(requested: u8, max_udma: Option<u8>) -> Option<u8> {
    let mode = requested & 0x07;
    match requested & 0xF8 {
        0x00 | 0x08 => Some(MODE_PIO),
        MODE_MDMA => Some(MODE_MDMA | mode.min(2)),
        MODE_UDMA => max_udma.map(|max| MODE_UDMA | mode.min(max)),
        _ => None,
    }
}
