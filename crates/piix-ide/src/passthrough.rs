//! ATAPI passthrough to a host optical drive.
//!
//! The guest's CDBs go to [`HostMedium::send_scsi_cmd`] unchanged, except that transfers the
//! host cannot carry in one command are split into same-opcode sub-commands. The whole
//! transfer always fits the I/O buffer, so a split command still completes in one sink call.

use std::ops::Range;

use piix_storage::{MediumError, ScsiDirection, ScsiStatus};
use tracing::{debug, trace, warn};

use crate::atapi::{
    self, be16, be24, be32, lba_to_msf, msf_to_lba, put_padded, ASC_ILLEGAL_OPCODE,
    ASC_INTERNAL_TARGET_FAILURE, ASC_INV_FIELD_IN_CMD_PACKET, ASC_MEDIUM_NOT_PRESENT, CDB_LEN,
    GPCMD_BLANK, GPCMD_CLOSE_TRACK_SESSION, GPCMD_GET_CONFIGURATION,
    GPCMD_GET_EVENT_STATUS_NOTIFICATION, GPCMD_INQUIRY, GPCMD_MECHANISM_STATUS,
    GPCMD_MODE_SELECT_10, GPCMD_MODE_SELECT_6, GPCMD_MODE_SENSE_10, GPCMD_MODE_SENSE_6,
    GPCMD_PAUSE_RESUME, GPCMD_PLAY_AUDIO_10, GPCMD_PLAY_AUDIO_12, GPCMD_PLAY_AUDIO_MSF,
    GPCMD_PREVENT_ALLOW_MEDIUM_REMOVAL, GPCMD_READ_10, GPCMD_READ_12,
    GPCMD_READ_BUFFER_CAPACITY, GPCMD_READ_CAPACITY, GPCMD_READ_CD, GPCMD_READ_CD_MSF,
    GPCMD_READ_DISC_INFORMATION, GPCMD_READ_DVD_STRUCTURE, GPCMD_READ_SUBCHANNEL,
    GPCMD_READ_TOC_PMA_ATIP, GPCMD_READ_TRACK_INFORMATION, GPCMD_REPORT_KEY,
    GPCMD_REQUEST_SENSE, GPCMD_SEEK_10, GPCMD_SEND_CUE_SHEET, GPCMD_SEND_DVD_STRUCTURE,
    GPCMD_SEND_KEY, GPCMD_SEND_OPC_INFORMATION, GPCMD_SET_CD_SPEED, GPCMD_START_STOP_UNIT,
    GPCMD_STOP_PLAY_SCAN, GPCMD_SYNCHRONIZE_CACHE, GPCMD_TEST_UNIT_READY, GPCMD_WRITE_10,
    GPCMD_WRITE_12, GPCMD_WRITE_AND_VERIFY_10,
};
use crate::channel::{
    ChannelShared, ChannelState, StateGuard, SENSE_HARDWARE_ERROR, SENSE_NOT_READY,
};
use crate::device::{Device, MediaEvent};
use crate::request::{BeginStep, Direction, NewTransfer, SinkStep};
use crate::tracklist::TrackList;
use crate::transfer::{settle, start_transfer, unlocked_io, window, StepResult};

const SENSE_LEN: usize = 18;

/// Sector size assumed when neither the track list nor the host knows better.
const DEFAULT_SECTOR_SIZE: u32 = 2048;

/// Opcodes whose sector size depends on the track being addressed.
fn sector_sized(opcode: u8) -> bool {
    matches!(
        opcode,
        GPCMD_READ_10 | GPCMD_READ_12 | GPCMD_WRITE_10 | GPCMD_WRITE_12 | GPCMD_WRITE_AND_VERIFY_10
    )
}

fn splittable(opcode: u8) -> bool {
    matches!(
        opcode,
        GPCMD_READ_10
            | GPCMD_READ_12
            | GPCMD_WRITE_10
            | GPCMD_WRITE_12
            | GPCMD_READ_CD
            | GPCMD_READ_CD_MSF
    )
}

/// Bytes per sector selected by the READ CD main-channel (`cdb[9]`) and sub-channel
/// (`cdb[10]`) fields, assuming mode 1 data.
pub(crate) fn read_cd_sector_size(main: u8, sub: u8) -> u32 {
    let mut size = 0;
    if main & 0x80 != 0 {
        size += 12;
    }
    if main & 0x60 != 0 {
        size += 4;
    }
    if main & 0x10 != 0 {
        size += 2048;
    }
    if main & 0x08 != 0 {
        size += 288;
    }
    size += match (main >> 1) & 0x03 {
        1 => 294,
        2 => 296,
        _ => 0,
    };
    size + match sub & 0x07 {
        1 | 4 => 96,
        2 => 16,
        _ => 0,
    }
}

/// First LBA and sector count of a sector-addressed command.
fn lba_and_count(cdb: &[u8; CDB_LEN]) -> (u32, u32) {
    match cdb[0] {
        GPCMD_READ_12 | GPCMD_WRITE_12 => (be32(cdb, 2), be32(cdb, 6)),
        GPCMD_READ_CD => (be32(cdb, 2), be24(cdb, 6)),
        GPCMD_READ_CD_MSF => {
            let start = msf_to_lba(cdb[3], cdb[4], cdb[5]);
            let end = msf_to_lba(cdb[6], cdb[7], cdb[8]);
            (start, end.saturating_sub(start))
        }
        _ => (be32(cdb, 2), be16(cdb, 7)),
    }
}

/// Transfer length and direction of a passthrough CDB, `None` for unknown opcodes.
pub(crate) fn transfer_len(cdb: &[u8; CDB_LEN], sector_size: u32) -> Option<(u64, Direction)> {
    use Direction::{FromDevice, ToDevice};
    let sectors = |per: u32| u64::from(lba_and_count(cdb).1) * u64::from(per);
    Some(match cdb[0] {
        GPCMD_TEST_UNIT_READY
        | GPCMD_START_STOP_UNIT
        | GPCMD_PREVENT_ALLOW_MEDIUM_REMOVAL
        | GPCMD_SEEK_10
        | GPCMD_SET_CD_SPEED
        | GPCMD_SYNCHRONIZE_CACHE
        | GPCMD_CLOSE_TRACK_SESSION
        | GPCMD_BLANK
        | GPCMD_PLAY_AUDIO_10
        | GPCMD_PLAY_AUDIO_12
        | GPCMD_PLAY_AUDIO_MSF
        | GPCMD_PAUSE_RESUME
        | GPCMD_STOP_PLAY_SCAN => (0, Direction::None),
        GPCMD_REQUEST_SENSE | GPCMD_MODE_SENSE_6 => (u64::from(cdb[4]), FromDevice),
        GPCMD_MODE_SELECT_6 => (u64::from(cdb[4]), ToDevice),
        GPCMD_INQUIRY => (u64::from(be16(cdb, 3)), FromDevice),
        GPCMD_MODE_SENSE_10
        | GPCMD_GET_CONFIGURATION
        | GPCMD_GET_EVENT_STATUS_NOTIFICATION
        | GPCMD_READ_TOC_PMA_ATIP
        | GPCMD_READ_SUBCHANNEL
        | GPCMD_READ_DISC_INFORMATION
        | GPCMD_READ_TRACK_INFORMATION
        | GPCMD_READ_BUFFER_CAPACITY => (u64::from(be16(cdb, 7)), FromDevice),
        GPCMD_MODE_SELECT_10 | GPCMD_SEND_OPC_INFORMATION => (u64::from(be16(cdb, 7)), ToDevice),
        GPCMD_MECHANISM_STATUS | GPCMD_READ_DVD_STRUCTURE | GPCMD_REPORT_KEY => {
            (u64::from(be16(cdb, 8)), FromDevice)
        }
        GPCMD_SEND_DVD_STRUCTURE | GPCMD_SEND_KEY => (u64::from(be16(cdb, 8)), ToDevice),
        GPCMD_SEND_CUE_SHEET => (u64::from(be24(cdb, 6)), ToDevice),
        GPCMD_READ_CAPACITY => (8, FromDevice),
        GPCMD_READ_10 | GPCMD_READ_12 => (sectors(sector_size), FromDevice),
        GPCMD_WRITE_10 | GPCMD_WRITE_12 | GPCMD_WRITE_AND_VERIFY_10 => {
            (sectors(sector_size), ToDevice)
        }
        GPCMD_READ_CD | GPCMD_READ_CD_MSF => (sectors(read_cd_sector_size(cdb[9], cdb[10])), FromDevice),
        _ => return None,
    })
}

/// Splits a transfer of `len` bytes into commands of at most `limit` bytes each, returning
/// every command with the buffer range it covers.
pub(crate) fn split(
    cdb: &[u8; CDB_LEN],
    len: usize,
    limit: usize,
    sector_size: u32,
) -> Vec<([u8; CDB_LEN], Range<usize>)> {
    if len <= limit || !splittable(cdb[0]) {
        return vec![(*cdb, 0..len)];
    }
    let per = match cdb[0] {
        GPCMD_READ_CD | GPCMD_READ_CD_MSF => read_cd_sector_size(cdb[9], cdb[10]),
        _ => sector_size,
    } as usize;
    if per == 0 {
        return vec![(*cdb, 0..len)];
    }
    let max_sectors = (limit / per).max(1) as u32;
    let (mut lba, mut left) = lba_and_count(cdb);
    let mut commands = Vec::new();
    let mut offset = 0;
    while left > 0 {
        let n = left.min(max_sectors);
        let mut sub = *cdb;
        match cdb[0] {
            GPCMD_READ_12 | GPCMD_WRITE_12 => {
                sub[2..6].copy_from_slice(&lba.to_be_bytes());
                sub[6..10].copy_from_slice(&n.to_be_bytes());
            }
            GPCMD_READ_CD => {
                sub[2..6].copy_from_slice(&lba.to_be_bytes());
                sub[6..9].copy_from_slice(&n.to_be_bytes()[1..]);
            }
            GPCMD_READ_CD_MSF => {
                sub[3..6].copy_from_slice(&lba_to_msf(lba));
                sub[6..9].copy_from_slice(&lba_to_msf(lba + n));
            }
            _ => {
                sub[2..6].copy_from_slice(&lba.to_be_bytes());
                sub[7..9].copy_from_slice(&(n as u16).to_be_bytes());
            }
        }
        let bytes = n as usize * per;
        commands.push((sub, offset..offset + bytes));
        offset += bytes;
        lba += n;
        left -= n;
    }
    commands
}

fn host_failed(st: &mut ChannelState, dev: usize, e: MediumError) {
    if st.log_budget(dev) {
        warn!(device = dev, error = %e, "passthrough command failed");
    }
    match e {
        MediumError::NotMounted => st.atapi_check_condition(dev, SENSE_NOT_READY, ASC_MEDIUM_NOT_PRESENT, 0),
        _ => st.atapi_check_condition(dev, SENSE_HARDWARE_ERROR, ASC_INTERNAL_TARGET_FAILURE, 0),
    }
}

/// Decodes a passthrough packet and chains its data phase.
pub(crate) fn start<'a>(shared: &'a ChannelShared, mut st: StateGuard<'a>, dev: usize, dma: bool) -> StepResult<'a> {
    let d = &st.devices[dev];
    let cdb = d.xfer.cdb;
    let opcode = cdb[0];

    // Cached sense and media events are answered without asking the host.
    let local = match opcode {
        GPCMD_REQUEST_SENSE if d.atapi.has_sense() => Some(u32::from(cdb[4])),
        GPCMD_GET_EVENT_STATUS_NOTIFICATION if d.atapi.media_event != MediaEvent::None => {
            Some(be16(&cdb, 7))
        }
        _ => None,
    };
    if let Some(alloc) = local {
        trace!(device = dev, opcode, "answered from cached state");
        atapi::reply(shared, &mut st, dev, alloc, dma);
        return (st, Ok(()));
    }

    let lba = lba_and_count(&cdb).0;
    let track_size = st.devices[dev].tracks.as_ref().and_then(|t| t.sector_size_for_lba(lba));
    let lookup = track_size.is_none() && sector_sized(opcode);
    let (mut st, res) = unlocked_io(shared, st, dev, |m, _| {
        let region = if lookup {
            m.query_region_for_lba(u64::from(lba)).ok().map(|(_, r)| r.block_size)
        } else {
            None
        };
        Ok((m.max_scsi_transfer(), region))
    });
    let (limit, region_size) = match res {
        Ok(v) => v,
        Err(err) => return settle(st, err, |st, e| host_failed(st, dev, e)),
    };
    let sector_size = track_size.or(region_size).unwrap_or(DEFAULT_SECTOR_SIZE);

    let Some((len, direction)) = transfer_len(&cdb, sector_size) else {
        debug!(device = dev, opcode, "passthrough opcode not supported");
        st.illegal_request(dev, ASC_ILLEGAL_OPCODE);
        return (st, Ok(()));
    };
    let capacity = st.devices[dev].xfer.capacity_aligned(piix_storage::SECTOR_SIZE as u32);
    if len > u64::from(capacity) || (len > limit as u64 && !splittable(opcode)) {
        if st.log_budget(dev) {
            warn!(device = dev, opcode, len, capacity, limit, "passthrough transfer too large");
        }
        st.illegal_request(dev, ASC_INV_FIELD_IN_CMD_PACKET);
        return (st, Ok(()));
    }

    trace!(device = dev, opcode, len, ?direction, sector_size, "passthrough");
    st.devices[dev].xfer.atapi_sector_size = sector_size;
    start_transfer(
        &shared.queue,
        &mut st,
        NewTransfer {
            device: dev,
            total: len as u32,
            direction,
            begin: BeginStep::AtapiPassthrough,
            sink: SinkStep::Passthrough,
            dma: dma && len > 0,
            chained: true,
        },
    );
    (st, Ok(()))
}

/// Rewrites the identification strings of a host INQUIRY reply.
fn override_inquiry(d: &mut Device, len: usize) {
    let Some(over) = d.inquiry.clone() else {
        return;
    };
    let Some(data) = d.xfer.buffer.get_mut(..len) else {
        return;
    };
    let fields = [
        (8..16, over.vendor.as_deref()),
        (16..32, over.product.as_deref()),
        (32..36, over.revision.as_deref()),
    ];
    for (range, value) in fields {
        if let (Some(value), Some(dst)) = (value, data.get_mut(range)) {
            put_padded(dst, value);
        }
    }
}

/// Learns from burn traffic that succeeded on the host drive.
fn observe(d: &mut Device, cdb: &[u8; CDB_LEN], len: usize) {
    match cdb[0] {
        GPCMD_INQUIRY => override_inquiry(d, len),
        GPCMD_SEND_CUE_SHEET => {
            if let Some(cue) = d.xfer.buffer.get(..len) {
                d.tracks.get_or_insert_with(TrackList::new).update_from_cue_sheet(cue);
            }
        }
        GPCMD_READ_TOC_PMA_ATIP if cdb[2] & 0x0F == 0 && cdb[9] >> 6 == 0 => {
            if let Some(toc) = d.xfer.buffer.get(..len) {
                let msf = cdb[1] & 0x02 != 0;
                d.tracks.get_or_insert_with(TrackList::new).update_from_toc(toc, msf);
            }
        }
        GPCMD_SYNCHRONIZE_CACHE => {
            if let Some(tracks) = d.tracks.as_mut() {
                tracks.clear();
            }
        }
        _ => {}
    }
}

/// Source-sink step: runs the (possibly split) command against the host drive.
pub(crate) fn execute<'a>(shared: &'a ChannelShared, st: StateGuard<'a>, dev: usize) -> StepResult<'a> {
    let x = &st.devices[dev].xfer;
    let cdb = x.cdb;
    let direction = x.direction;
    let sector_size = x.atapi_sector_size;
    let len = transfer_len(&cdb, sector_size).map_or(0, |(n, _)| n as usize);
    let timeout = st.limits.passthrough_timeout;
    let scsi_direction = match direction {
        Direction::None => ScsiDirection::None,
        Direction::FromDevice => ScsiDirection::FromDevice,
        Direction::ToDevice => ScsiDirection::ToDevice,
    };

    let (mut st, res) = unlocked_io(shared, st, dev, |m, buf| {
        let data = window(buf, len)?;
        let mut sense = [0u8; SENSE_LEN];
        let commands = split(&cdb, len, m.max_scsi_transfer(), sector_size);
        let count = commands.len();
        for (sub, range) in commands {
            let chunk = data.get_mut(range).ok_or(MediumError::OffsetOverflow)?;
            if m.send_scsi_cmd(&sub, scsi_direction, chunk, &mut sense, timeout)? == ScsiStatus::CheckCondition {
                return Ok(Some(sense));
            }
        }
        if count > 1 {
            trace!(opcode = cdb[0], commands = count, "split passthrough transfer");
        }
        Ok(None)
    });

    match res {
        Ok(None) => {
            let d = &mut st.devices[dev];
            observe(d, &cdb, len);
            match direction {
                Direction::FromDevice => {
                    d.stats.bytes_read += len as u64;
                    d.xfer.filled = len as u32;
                    d.xfer.total = d.xfer.total.min(len as u32);
                    d.xfer.sink = SinkStep::None;
                }
                _ => {
                    d.stats.bytes_written += len as u64;
                    st.complete_ok(dev);
                }
            }
            (st, Ok(()))
        }
        Ok(Some(sense)) => {
            let (key, asc, ascq) = (sense[2] & 0x0F, sense[12], sense[13]);
            debug!(device = dev, opcode = cdb[0], key, asc, ascq, "host drive reported check condition");
            st.atapi_check_condition(dev, key, asc, ascq);
            (st, Ok(()))
        }
        Err(err) => settle(st, err, |st, e| host_failed(st, dev, e)),
    }
}
