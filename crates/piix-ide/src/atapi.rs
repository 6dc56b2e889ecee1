//! Emulated ATAPI CD-ROM.
//!
//! The packet sink decodes the 12-byte CDB, answers non-data commands inline and chains a
//! data phase for everything else. Replies are built by [`response`] once the worker runs
//! the chained transfer, reads go through [`read`] one buffer-sized chunk at a time.

use piix_storage::{HostMedium, MediumError, RegionProperties, CD_RAW_SECTOR_SIZE, CD_SECTOR_SIZE};
use tracing::{debug, trace, warn};

use crate::channel::{
    ChannelShared, ChannelState, StateGuard, SENSE_HARDWARE_ERROR, SENSE_ILLEGAL_REQUEST,
    SENSE_MEDIUM_ERROR, SENSE_NOT_READY, SENSE_UNIT_ATTENTION,
};
use crate::device::{Device, MediaEvent};
use crate::passthrough;
use crate::request::{BeginStep, Direction, NewTransfer, SinkStep};
use crate::transfer::{fill_response, settle, start_transfer, unlocked_io, window, IoError, StepResult};

pub const GPCMD_TEST_UNIT_READY: u8 = 0x00;
pub const GPCMD_REQUEST_SENSE: u8 = 0x03;
pub const GPCMD_INQUIRY: u8 = 0x12;
pub const GPCMD_MODE_SELECT_6: u8 = 0x15;
pub const GPCMD_MODE_SENSE_6: u8 = 0x1A;
pub const GPCMD_START_STOP_UNIT: u8 = 0x1B;
pub const GPCMD_PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;
pub const GPCMD_READ_CAPACITY: u8 = 0x25;
pub const GPCMD_READ_10: u8 = 0x28;
pub const GPCMD_WRITE_10: u8 = 0x2A;
pub const GPCMD_SEEK_10: u8 = 0x2B;
pub const GPCMD_WRITE_AND_VERIFY_10: u8 = 0x2E;
pub const GPCMD_SYNCHRONIZE_CACHE: u8 = 0x35;
pub const GPCMD_READ_BUFFER_CAPACITY: u8 = 0x5C;
pub const GPCMD_READ_SUBCHANNEL: u8 = 0x42;
pub const GPCMD_READ_TOC_PMA_ATIP: u8 = 0x43;
pub const GPCMD_PLAY_AUDIO_10: u8 = 0x45;
pub const GPCMD_GET_CONFIGURATION: u8 = 0x46;
pub const GPCMD_PLAY_AUDIO_MSF: u8 = 0x47;
pub const GPCMD_GET_EVENT_STATUS_NOTIFICATION: u8 = 0x4A;
pub const GPCMD_PAUSE_RESUME: u8 = 0x4B;
pub const GPCMD_STOP_PLAY_SCAN: u8 = 0x4E;
pub const GPCMD_READ_DISC_INFORMATION: u8 = 0x51;
pub const GPCMD_READ_TRACK_INFORMATION: u8 = 0x52;
pub const GPCMD_SEND_OPC_INFORMATION: u8 = 0x54;
pub const GPCMD_MODE_SELECT_10: u8 = 0x55;
pub const GPCMD_MODE_SENSE_10: u8 = 0x5A;
pub const GPCMD_CLOSE_TRACK_SESSION: u8 = 0x5B;
pub const GPCMD_SEND_CUE_SHEET: u8 = 0x5D;
pub const GPCMD_BLANK: u8 = 0xA1;
pub const GPCMD_SEND_KEY: u8 = 0xA3;
pub const GPCMD_REPORT_KEY: u8 = 0xA4;
pub const GPCMD_PLAY_AUDIO_12: u8 = 0xA5;
pub const GPCMD_READ_12: u8 = 0xA8;
pub const GPCMD_WRITE_12: u8 = 0xAA;
pub const GPCMD_READ_DVD_STRUCTURE: u8 = 0xAD;
pub const GPCMD_SEND_DVD_STRUCTURE: u8 = 0xBF;
pub const GPCMD_READ_CD_MSF: u8 = 0xB9;
pub const GPCMD_SET_CD_SPEED: u8 = 0xBB;
pub const GPCMD_MECHANISM_STATUS: u8 = 0xBD;
pub const GPCMD_READ_CD: u8 = 0xBE;

pub(crate) const ASC_READ_ERROR: u8 = 0x11;
pub(crate) const ASC_ILLEGAL_OPCODE: u8 = 0x20;
pub(crate) const ASC_LOGICAL_BLOCK_OOR: u8 = 0x21;
pub(crate) const ASC_INV_FIELD_IN_CMD_PACKET: u8 = 0x24;
pub(crate) const ASC_MEDIUM_MAY_HAVE_CHANGED: u8 = 0x28;
pub(crate) const ASC_SAVING_PARAMETERS_NOT_SUPPORTED: u8 = 0x39;
pub(crate) const ASC_MEDIUM_NOT_PRESENT: u8 = 0x3A;
pub(crate) const ASC_INTERNAL_TARGET_FAILURE: u8 = 0x44;
pub(crate) const ASC_MEDIA_REMOVAL_PREVENTED: u8 = 0x53;
pub(crate) const ASC_ILLEGAL_MODE_FOR_THIS_TRACK: u8 = 0x64;

pub(crate) const CDB_LEN: usize = 12;

/// Sector MSF addresses start 2 seconds into the disc.
const MSF_OFFSET: u32 = 150;

const READ_CD_NOTHING: u8 = 0x00;
const READ_CD_USER_DATA: u8 = 0x10;
const READ_CD_RAW: u8 = 0xF8;

const PROFILE_CDROM: u16 = 0x0008;

pub(crate) fn be16(b: &[u8], at: usize) -> u32 {
    u32::from(u16::from_be_bytes([b[at], b[at + 1]]))
}

pub(crate) fn be24(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([0, b[at], b[at + 1], b[at + 2]])
}

pub(crate) fn be32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

pub(crate) fn msf_to_lba(m: u8, s: u8, f: u8) -> u32 {
    ((u32::from(m) * 60 + u32::from(s)) * 75 + u32::from(f)).saturating_sub(MSF_OFFSET)
}

pub(crate) fn lba_to_msf(lba: u32) -> [u8; 3] {
    let lba = lba + MSF_OFFSET;
    [
        (lba / (60 * 75)) as u8,
        ((lba / 75) % 60) as u8,
        (lba % 75) as u8,
    ]
}

fn bcd(v: u8) -> u8 {
    (v / 10) << 4 | (v % 10)
}

/// Copies `s` into `dst`, padding with spaces.
pub(crate) fn put_padded(dst: &mut [u8], s: &str) {
    dst.fill(b' ');
    for (d, c) in dst.iter_mut().zip(s.bytes()) {
        *d = c;
    }
}

fn medium_ready(d: &Device) -> bool {
    d.has_medium() && !d.atapi.tray_open
}

fn needs_medium(opcode: u8) -> bool {
    matches!(
        opcode,
        GPCMD_TEST_UNIT_READY
            | GPCMD_READ_CAPACITY
            | GPCMD_READ_10
            | GPCMD_READ_12
            | GPCMD_READ_CD
            | GPCMD_READ_CD_MSF
            | GPCMD_READ_TOC_PMA_ATIP
            | GPCMD_READ_DISC_INFORMATION
            | GPCMD_READ_TRACK_INFORMATION
            | GPCMD_SEEK_10
    )
}

/// Source-sink step of the PACKET command phase.
pub(crate) fn packet<'a>(shared: &'a ChannelShared, mut st: StateGuard<'a>, dev: usize) -> StepResult<'a> {
    let d = &mut st.devices[dev];
    let mut cdb = [0u8; CDB_LEN];
    if let Some(raw) = d.xfer.buffer.get(..CDB_LEN) {
        cdb.copy_from_slice(raw);
    }
    d.xfer.cdb = cdb;
    let dma = d.regs.feature & 0x01 != 0;
    trace!(device = dev, opcode = cdb[0], dma, "atapi packet");
    if d.passthrough {
        return passthrough::start(shared, st, dev, dma);
    }
    emulate(shared, st, dev, dma)
}

/// Chains a fixed-size reply of at most `alloc` bytes.
pub(crate) fn reply(shared: &ChannelShared, st: &mut ChannelState, dev: usize, alloc: u32, dma: bool) {
    if alloc == 0 {
        st.complete_ok(dev);
        return;
    }
    start_transfer(
        &shared.queue,
        st,
        NewTransfer {
            device: dev,
            total: alloc,
            direction: Direction::FromDevice,
            begin: BeginStep::AtapiCmd,
            sink: SinkStep::AtapiResponse,
            dma,
            chained: true,
        },
    );
}

fn emulate<'a>(shared: &'a ChannelShared, mut st: StateGuard<'a>, dev: usize, dma: bool) -> StepResult<'a> {
    let cdb = st.devices[dev].xfer.cdb;
    let opcode = cdb[0];
    let d = &mut st.devices[dev];

    if d.atapi.unit_attention
        && !matches!(
            opcode,
            GPCMD_INQUIRY | GPCMD_REQUEST_SENSE | GPCMD_GET_EVENT_STATUS_NOTIFICATION
        )
    {
        d.atapi.unit_attention = false;
        debug!(device = dev, opcode, "reporting medium change");
        st.atapi_check_condition(dev, SENSE_UNIT_ATTENTION, ASC_MEDIUM_MAY_HAVE_CHANGED, 0);
        return (st, Ok(()));
    }
    if needs_medium(opcode) && !medium_ready(d) {
        st.atapi_check_condition(dev, SENSE_NOT_READY, ASC_MEDIUM_NOT_PRESENT, 0);
        return (st, Ok(()));
    }
    let total_sectors = d.total_sectors;

    match opcode {
        GPCMD_TEST_UNIT_READY | GPCMD_SET_CD_SPEED | GPCMD_SYNCHRONIZE_CACHE => {
            st.complete_ok(dev);
        }
        GPCMD_SEEK_10 => {
            if u64::from(be32(&cdb, 2)) >= total_sectors {
                st.illegal_request(dev, ASC_LOGICAL_BLOCK_OOR);
            } else {
                st.complete_ok(dev);
            }
        }
        GPCMD_REQUEST_SENSE => reply(shared, &mut st, dev, u32::from(cdb[4]), dma),
        GPCMD_INQUIRY => {
            if cdb[1] & 0x01 != 0 {
                st.illegal_request(dev, ASC_INV_FIELD_IN_CMD_PACKET);
            } else {
                reply(shared, &mut st, dev, be16(&cdb, 3), dma);
            }
        }
        GPCMD_MODE_SENSE_10 => {
            let control = cdb[2] >> 6;
            let page = cdb[2] & 0x3F;
            if control == 3 {
                st.illegal_request(dev, ASC_SAVING_PARAMETERS_NOT_SUPPORTED);
            } else if !matches!(page, 0x01 | 0x2A | 0x3F) {
                st.illegal_request(dev, ASC_INV_FIELD_IN_CMD_PACKET);
            } else {
                reply(shared, &mut st, dev, be16(&cdb, 7), dma);
            }
        }
        GPCMD_READ_CAPACITY => reply(shared, &mut st, dev, 8, dma),
        GPCMD_READ_10 | GPCMD_READ_12 => {
            let lba = be32(&cdb, 2);
            let count = if opcode == GPCMD_READ_10 {
                be16(&cdb, 7)
            } else {
                be32(&cdb, 6)
            };
            return read_cooked(shared, st, dev, lba, count, dma);
        }
        GPCMD_READ_CD | GPCMD_READ_CD_MSF => return read_cd(shared, st, dev, dma),
        GPCMD_READ_TOC_PMA_ATIP => {
            let format = toc_format(&cdb);
            let start_track = cdb[6];
            let valid = match format {
                0 => start_track <= 1 || start_track == 0xAA,
                1 | 2 => true,
                _ => false,
            };
            if valid {
                reply(shared, &mut st, dev, be16(&cdb, 7), dma);
            } else {
                st.illegal_request(dev, ASC_INV_FIELD_IN_CMD_PACKET);
            }
        }
        GPCMD_GET_CONFIGURATION => reply(shared, &mut st, dev, be16(&cdb, 7), dma),
        GPCMD_GET_EVENT_STATUS_NOTIFICATION => {
            // Only polled operation is supported.
            if cdb[1] & 0x01 == 0 {
                st.illegal_request(dev, ASC_INV_FIELD_IN_CMD_PACKET);
            } else {
                reply(shared, &mut st, dev, be16(&cdb, 7), dma);
            }
        }
        GPCMD_READ_DISC_INFORMATION => {
            if cdb[1] & 0x07 != 0 {
                st.illegal_request(dev, ASC_INV_FIELD_IN_CMD_PACKET);
            } else {
                reply(shared, &mut st, dev, be16(&cdb, 7), dma);
            }
        }
        GPCMD_READ_TRACK_INFORMATION => {
            let number = be32(&cdb, 2);
            let asc = match cdb[1] & 0x03 {
                0 if u64::from(number) >= total_sectors => Some(ASC_LOGICAL_BLOCK_OOR),
                0 => None,
                1 | 2 if number == 1 => None,
                _ => Some(ASC_INV_FIELD_IN_CMD_PACKET),
            };
            match asc {
                Some(asc) => st.illegal_request(dev, asc),
                None => reply(shared, &mut st, dev, be16(&cdb, 7), dma),
            }
        }
        GPCMD_MECHANISM_STATUS => reply(shared, &mut st, dev, be16(&cdb, 8), dma),
        GPCMD_START_STOP_UNIT => return start_stop(shared, st, dev, cdb[4]),
        GPCMD_PREVENT_ALLOW_MEDIUM_REMOVAL => return prevent_allow(shared, st, dev, cdb[4] & 0x01 != 0),
        _ => {
            debug!(device = dev, opcode, "unsupported atapi command");
            st.illegal_request(dev, ASC_ILLEGAL_OPCODE);
        }
    }
    (st, Ok(()))
}

fn toc_format(cdb: &[u8; CDB_LEN]) -> u8 {
    match cdb[2] & 0x0F {
        0 => cdb[9] >> 6,
        f => f,
    }
}

/// Whether `lba` lies on an audio track.
fn track_is_audio<'a>(
    shared: &'a ChannelShared,
    st: StateGuard<'a>,
    dev: usize,
    lba: u32,
) -> (StateGuard<'a>, Result<bool, IoError>) {
    unlocked_io(shared, st, dev, |m, _| {
        Ok(m
            .query_region_for_lba(u64::from(lba))
            .is_ok_and(|(_, r)| r.data_form.is_audio()))
    })
}

fn read_failed(st: &mut ChannelState, dev: usize, e: MediumError) {
    if st.log_budget(dev) {
        warn!(device = dev, error = %e, "cd read failed");
    }
    st.atapi_check_condition(dev, SENSE_MEDIUM_ERROR, ASC_READ_ERROR, 0);
}

fn read_cooked<'a>(
    shared: &'a ChannelShared,
    mut st: StateGuard<'a>,
    dev: usize,
    lba: u32,
    count: u32,
    dma: bool,
) -> StepResult<'a> {
    if u64::from(lba) + u64::from(count) > st.devices[dev].total_sectors {
        st.illegal_request(dev, ASC_LOGICAL_BLOCK_OOR);
        return (st, Ok(()));
    }
    if count == 0 {
        st.complete_ok(dev);
        return (st, Ok(()));
    }
    let (mut st, res) = track_is_audio(shared, st, dev, lba);
    match res {
        Ok(true) => {
            st.illegal_request(dev, ASC_ILLEGAL_MODE_FOR_THIS_TRACK);
            (st, Ok(()))
        }
        Ok(false) => {
            start_read(shared, &mut st, dev, lba, count, CD_SECTOR_SIZE as u32, dma);
            (st, Ok(()))
        }
        Err(err) => settle(st, err, |st, e| read_failed(st, dev, e)),
    }
}

fn read_cd<'a>(shared: &'a ChannelShared, mut st: StateGuard<'a>, dev: usize, dma: bool) -> StepResult<'a> {
    let cdb = st.devices[dev].xfer.cdb;
    let (lba, count) = if cdb[0] == GPCMD_READ_CD {
        (be32(&cdb, 2), be24(&cdb, 6))
    } else {
        let start = msf_to_lba(cdb[3], cdb[4], cdb[5]);
        let end = msf_to_lba(cdb[6], cdb[7], cdb[8]);
        if end < start {
            st.illegal_request(dev, ASC_INV_FIELD_IN_CMD_PACKET);
            return (st, Ok(()));
        }
        (start, end - start)
    };
    let selector = cdb[9] & 0xF8;
    if !matches!(selector, READ_CD_NOTHING | READ_CD_USER_DATA | READ_CD_RAW) {
        st.illegal_request(dev, ASC_INV_FIELD_IN_CMD_PACKET);
        return (st, Ok(()));
    }
    if u64::from(lba) + u64::from(count) > st.devices[dev].total_sectors {
        st.illegal_request(dev, ASC_LOGICAL_BLOCK_OOR);
        return (st, Ok(()));
    }
    if count == 0 || selector == READ_CD_NOTHING {
        st.complete_ok(dev);
        return (st, Ok(()));
    }

    let (mut st, res) = track_is_audio(shared, st, dev, lba);
    let audio = match res {
        Ok(audio) => audio,
        Err(err) => return settle(st, err, |st, e| read_failed(st, dev, e)),
    };
    // Audio sectors carry no header, user data is the whole frame.
    let sector_size = if selector == READ_CD_USER_DATA && !audio {
        CD_SECTOR_SIZE
    } else {
        CD_RAW_SECTOR_SIZE
    };
    trace!(device = dev, lba, count, selector, audio, "read cd");
    start_read(shared, &mut st, dev, lba, count, sector_size as u32, dma);
    (st, Ok(()))
}

fn start_read(
    shared: &ChannelShared,
    st: &mut ChannelState,
    dev: usize,
    lba: u32,
    count: u32,
    sector_size: u32,
    dma: bool,
) {
    let Some(total) = count.checked_mul(sector_size) else {
        st.illegal_request(dev, ASC_INV_FIELD_IN_CMD_PACKET);
        return;
    };
    let x = &mut st.devices[dev].xfer;
    x.atapi_lba = lba;
    x.atapi_sector_size = sector_size;
    start_transfer(
        &shared.queue,
        st,
        NewTransfer {
            device: dev,
            total,
            direction: Direction::FromDevice,
            begin: BeginStep::AtapiCmd,
            sink: SinkStep::AtapiRead,
            dma,
            chained: true,
        },
    );
}

fn start_stop<'a>(shared: &'a ChannelShared, mut st: StateGuard<'a>, dev: usize, flags: u8) -> StepResult<'a> {
    let load_eject = flags & 0x02 != 0;
    let start = flags & 0x01 != 0;
    if !load_eject {
        st.complete_ok(dev);
        return (st, Ok(()));
    }
    if start {
        let d = &mut st.devices[dev];
        if d.atapi.tray_open {
            d.atapi.tray_open = false;
            d.atapi.media_present = d.has_medium();
            if d.has_medium() {
                d.atapi.media_event = MediaEvent::NewMedia;
            }
            debug!(device = dev, "tray closed");
        }
        st.complete_ok(dev);
        return (st, Ok(()));
    }
    if st.devices[dev].atapi.locked {
        st.atapi_check_condition(dev, SENSE_ILLEGAL_REQUEST, ASC_MEDIA_REMOVAL_PREVENTED, 0x02);
        return (st, Ok(()));
    }
    let (mut st, res) = if st.devices[dev].has_medium() {
        unlocked_io(shared, st, dev, |m, _| m.eject())
    } else {
        (st, Ok(()))
    };
    match res {
        Ok(()) | Err(IoError::Failed(MediumError::NotSupported(_))) => {
            let d = &mut st.devices[dev];
            d.atapi.tray_open = true;
            d.atapi.media_present = false;
            d.atapi.media_event = MediaEvent::EjectRequest;
            debug!(device = dev, "tray opened");
            st.complete_ok(dev);
            (st, Ok(()))
        }
        Err(err) => settle(st, err, |st, e| {
            debug!(device = dev, error = %e, "eject refused by the host");
            st.atapi_check_condition(dev, SENSE_ILLEGAL_REQUEST, ASC_MEDIA_REMOVAL_PREVENTED, 0x02);
        }),
    }
}

fn prevent_allow<'a>(shared: &'a ChannelShared, st: StateGuard<'a>, dev: usize, prevent: bool) -> StepResult<'a> {
    let (mut st, res) = if st.devices[dev].has_medium() {
        unlocked_io(shared, st, dev, |m, _| if prevent { m.lock() } else { m.unlock() })
    } else {
        (st, Ok(()))
    };
    match res {
        Ok(()) => {
            st.devices[dev].atapi.locked = prevent;
            st.complete_ok(dev);
            (st, Ok(()))
        }
        Err(err) => settle(st, err, |st, e| {
            if st.log_budget(dev) {
                warn!(device = dev, prevent, error = %e, "medium lock failed");
            }
            st.atapi_check_condition(dev, SENSE_HARDWARE_ERROR, ASC_INTERNAL_TARGET_FAILURE, 0);
        }),
    }
}

/// Source-sink step producing the reply selected by the stored CDB.
pub(crate) fn response<'a>(_shared: &'a ChannelShared, mut st: StateGuard<'a>, dev: usize) -> StepResult<'a> {
    let d = &mut st.devices[dev];
    let data = build_reply(d);
    fill_response(d, &data);
    (st, Ok(()))
}

pub(crate) fn build_reply(d: &mut Device) -> Vec<u8> {
    let cdb = d.xfer.cdb;
    match cdb[0] {
        GPCMD_REQUEST_SENSE => request_sense(d),
        GPCMD_INQUIRY => inquiry(d),
        GPCMD_MODE_SENSE_10 => mode_sense(d, cdb[2] & 0x3F),
        GPCMD_READ_CAPACITY => {
            let mut out = vec![0u8; 8];
            let last = d.total_sectors.saturating_sub(1).min(u64::from(u32::MAX)) as u32;
            out[..4].copy_from_slice(&last.to_be_bytes());
            out[4..].copy_from_slice(&(CD_SECTOR_SIZE as u32).to_be_bytes());
            out
        }
        GPCMD_READ_TOC_PMA_ATIP => read_toc(d, &cdb),
        GPCMD_GET_CONFIGURATION => get_configuration(d, &cdb),
        GPCMD_GET_EVENT_STATUS_NOTIFICATION => event_status(d, cdb[4]),
        GPCMD_READ_DISC_INFORMATION => {
            let mut out = vec![0u8; 34];
            out[..2].copy_from_slice(&32u16.to_be_bytes());
            // Complete disc, complete last session.
            out[2] = 0x0E;
            out[3] = 1;
            out[4] = 1;
            out[5] = 1;
            out[6] = 1;
            out[7] = 0x20;
            out
        }
        GPCMD_READ_TRACK_INFORMATION => {
            let mut out = vec![0u8; 36];
            out[..2].copy_from_slice(&34u16.to_be_bytes());
            out[2] = 1;
            out[3] = 1;
            out[5] = 0x04;
            out[6] = 0x01;
            let size = d.total_sectors.min(u64::from(u32::MAX)) as u32;
            out[24..28].copy_from_slice(&size.to_be_bytes());
            out
        }
        GPCMD_MECHANISM_STATUS => {
            let mut out = vec![0u8; 8];
            if d.atapi.tray_open {
                out[1] = 0x10;
            }
            out
        }
        _ => Vec::new(),
    }
}

fn request_sense(d: &mut Device) -> Vec<u8> {
    let a = &mut d.atapi;
    if !a.has_sense() && a.unit_attention {
        a.unit_attention = false;
        a.set_sense(SENSE_UNIT_ATTENTION, ASC_MEDIUM_MAY_HAVE_CHANGED, 0);
    }
    let mut out = vec![0u8; 18];
    out[0] = 0x70;
    out[2] = a.sense_key;
    out[7] = 10;
    out[12] = a.asc;
    out[13] = a.ascq;
    out
}

fn inquiry(d: &Device) -> Vec<u8> {
    let mut out = vec![0u8; 36];
    out[0] = 0x05;
    out[1] = 0x80;
    out[3] = 0x21;
    out[4] = 31;
    let over = d.inquiry.as_ref();
    let vendor = over.and_then(|i| i.vendor.as_deref()).unwrap_or("PIIX");
    let product = over
        .and_then(|i| i.product.as_deref())
        .unwrap_or(&d.identity.model);
    let revision = over
        .and_then(|i| i.revision.as_deref())
        .unwrap_or(&d.identity.firmware);
    put_padded(&mut out[8..16], vendor);
    put_padded(&mut out[16..32], product);
    put_padded(&mut out[32..36], revision);
    out
}

fn mode_sense(d: &Device, page: u8) -> Vec<u8> {
    let mut out = vec![0u8; 8];
    out[2] = if medium_ready(d) { 0x01 } else { 0x70 };
    if matches!(page, 0x01 | 0x3F) {
        // Read error recovery.
        out.extend_from_slice(&[0x01, 0x06, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00]);
    }
    if matches!(page, 0x2A | 0x3F) {
        let mut caps = [0u8; 20];
        caps[0] = 0x2A;
        caps[1] = 0x12;
        caps[2] = 0x3B;
        caps[4] = 0x71;
        caps[5] = 0x60;
        // Tray loader, eject and lock supported.
        caps[6] = 0x29 | if d.atapi.locked { 0x02 } else { 0 };
        caps[8..10].copy_from_slice(&704u16.to_be_bytes());
        caps[11] = 0x02;
        caps[12..14].copy_from_slice(&512u16.to_be_bytes());
        caps[14..16].copy_from_slice(&704u16.to_be_bytes());
        out.extend_from_slice(&caps);
    }
    let len = (out.len() - 2) as u16;
    out[..2].copy_from_slice(&len.to_be_bytes());
    out
}

fn push_address(out: &mut Vec<u8>, lba: u32, msf: bool) {
    if msf {
        out.push(0);
        out.extend_from_slice(&lba_to_msf(lba));
    } else {
        out.extend_from_slice(&lba.to_be_bytes());
    }
}

fn read_toc(d: &Device, cdb: &[u8; CDB_LEN]) -> Vec<u8> {
    let msf = cdb[1] & 0x02 != 0;
    let lead_out = d.total_sectors.min(u64::from(u32::MAX - MSF_OFFSET)) as u32;
    let mut out = vec![0u8, 0, 1, 1];
    match toc_format(cdb) {
        0 => {
            if cdb[6] <= 1 {
                out.extend_from_slice(&[0, 0x14, 1, 0]);
                push_address(&mut out, 0, msf);
            }
            out.extend_from_slice(&[0, 0x14, 0xAA, 0]);
            push_address(&mut out, lead_out, msf);
        }
        1 => {
            out.extend_from_slice(&[0, 0x14, 1, 0]);
            push_address(&mut out, 0, msf);
        }
        _ => {
            // Raw TOC: A0 (first track), A1 (last track), A2 (lead-out), then track 1.
            for (point, pmin) in [(0xA0u8, 1u8), (0xA1, 1)] {
                out.extend_from_slice(&[1, 0x14, 0, point, 0, 0, 0, 0, pmin, 0, 0]);
            }
            out.extend_from_slice(&[1, 0x14, 0, 0xA2, 0, 0, 0]);
            push_address(&mut out, lead_out, msf);
            out.extend_from_slice(&[1, 0x14, 0, 1, 0, 0, 0]);
            push_address(&mut out, 0, msf);
        }
    }
    let len = (out.len() - 2) as u16;
    out[..2].copy_from_slice(&len.to_be_bytes());
    out
}

fn feature(code: u16, current: bool, data: &[u8]) -> (u16, bool, Vec<u8>) {
    let mut f = Vec::with_capacity(4 + data.len());
    f.extend_from_slice(&code.to_be_bytes());
    // Persistent features report bit 1.
    f.push(0x02 | u8::from(current));
    f.push(data.len() as u8);
    f.extend_from_slice(data);
    (code, current, f)
}

fn get_configuration(d: &Device, cdb: &[u8; CDB_LEN]) -> Vec<u8> {
    let ready = medium_ready(d);
    let profile = if ready { PROFILE_CDROM } else { 0 };
    let [ph, pl] = PROFILE_CDROM.to_be_bytes();
    let features = [
        feature(0x0000, true, &[ph, pl, u8::from(ready), 0]),
        // Core: ATAPI physical interface.
        feature(0x0001, true, &[0, 0, 0, 2, 0, 0, 0, 0]),
        feature(0x0002, true, &[0, 0, 0, 0]),
        // Removable medium: tray loader with eject and lock.
        feature(0x0003, true, &[0x29, 0, 0, 0]),
        feature(0x0010, ready, &[0, 0, 0x08, 0x00, 0, 1, 0, 0]),
        feature(0x001E, ready, &[0, 0, 0, 0]),
    ];
    let request_type = cdb[1] & 0x03;
    let start = be16(cdb, 2) as u16;

    let mut out = vec![0u8; 8];
    out[6..8].copy_from_slice(&profile.to_be_bytes());
    for (code, current, bytes) in features {
        let wanted = match request_type {
            0 => code >= start,
            1 => current && code >= start,
            _ => code == start,
        };
        if wanted {
            out.extend_from_slice(&bytes);
        }
    }
    let len = (out.len() - 4) as u32;
    out[..4].copy_from_slice(&len.to_be_bytes());
    out
}

fn event_status(d: &mut Device, class_request: u8) -> Vec<u8> {
    const MEDIA_CLASS: u8 = 0x10;
    if class_request & MEDIA_CLASS == 0 {
        // No event available for the requested classes.
        return vec![0, 2, 0x80, MEDIA_CLASS];
    }
    let a = &mut d.atapi;
    let code = match a.media_event {
        MediaEvent::None => 0,
        MediaEvent::EjectRequest => 1,
        MediaEvent::NewMedia => 2,
        MediaEvent::MediaRemoval => 3,
    };
    let present = a.media_present && !a.tray_open;
    let status = u8::from(present) << 1 | u8::from(a.tray_open);
    a.media_event = MediaEvent::None;
    vec![0, 6, 0x04, MEDIA_CLASS, code, status, 0, 0]
}

fn raw_header(sector: &mut [u8], lba: u32) {
    sector[0] = 0x00;
    sector[1..11].fill(0xFF);
    sector[11] = 0x00;
    let [m, s, f] = lba_to_msf(lba);
    sector[12] = bcd(m);
    sector[13] = bcd(s);
    sector[14] = bcd(f);
    // Mode 1.
    sector[15] = 0x01;
}

/// Reads whole sectors starting at `lba` into `out`, synthesizing raw frames where needed.
fn read_cd_sectors(m: &dyn HostMedium, lba: u32, sector_size: u32, out: &mut [u8]) -> piix_storage::Result<()> {
    if sector_size as usize == CD_SECTOR_SIZE {
        return m.read_at(u64::from(lba) * CD_SECTOR_SIZE as u64, out);
    }
    let medium_sector = u64::from(m.sector_size().max(1));
    let mut region: Option<RegionProperties> = None;
    for (i, sector) in out.chunks_exact_mut(CD_RAW_SECTOR_SIZE).enumerate() {
        let lba = lba + i as u32;
        if !region.is_some_and(|r| r.contains(u64::from(lba))) {
            region = m.query_region_for_lba(u64::from(lba)).ok().map(|(_, r)| r);
        }
        if region.is_some_and(|r| r.data_form.is_audio()) {
            let n = (medium_sector as usize).min(CD_RAW_SECTOR_SIZE);
            sector[n..].fill(0);
            m.read_at(u64::from(lba) * medium_sector, &mut sector[..n])?;
        } else {
            sector.fill(0);
            raw_header(sector, lba);
            m.read_at(
                u64::from(lba) * CD_SECTOR_SIZE as u64,
                &mut sector[16..16 + CD_SECTOR_SIZE],
            )?;
        }
    }
    Ok(())
}

/// Source-sink step for READ(10/12) and READ CD data phases.
pub(crate) fn read<'a>(shared: &'a ChannelShared, st: StateGuard<'a>, dev: usize) -> StepResult<'a> {
    let x = &st.devices[dev].xfer;
    let sector_size = x.atapi_sector_size.max(1);
    let lba = x.atapi_lba;
    let sectors = (x.elementary / sector_size).max(1);
    let len = sectors * sector_size;
    let total = x.total;

    let (mut st, res) = unlocked_io(shared, st, dev, |m, buf| {
        read_cd_sectors(m, lba, sector_size, window(buf, len as usize)?)
    });
    match res {
        Ok(()) => {
            let d = &mut st.devices[dev];
            d.xfer.filled = len;
            d.xfer.atapi_lba = lba + sectors;
            d.stats.bytes_read += u64::from(len);
            if len >= total {
                d.xfer.sink = SinkStep::None;
            }
            (st, Ok(()))
        }
        Err(err) => settle(st, err, |st, e| read_failed(st, dev, e)),
    }
}
