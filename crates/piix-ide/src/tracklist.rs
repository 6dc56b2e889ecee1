//! Recorded-track layout learned from passthrough burn traffic.
//!
//! Host drives do not tell us the sector size of a track on a disc being written, yet the
//! passthrough layer must size READ/WRITE transfers. The list is populated from the cue sheets
//! and TOCs the guest exchanges with the drive.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackDataForm {
    Audio,
    Mode1,
    Mode1Raw,
    Mode2,
}

impl TrackDataForm {
    pub fn sector_size(self) -> u32 {
        match self {
            TrackDataForm::Audio | TrackDataForm::Mode1Raw => 2352,
            TrackDataForm::Mode1 => 2048,
            TrackDataForm::Mode2 => 2336,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Track {
    pub number: u8,
    pub lba_start: u32,
    /// First LBA past the track.
    pub lba_end: u32,
    pub form: TrackDataForm,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackList {
    tracks: Vec<Track>,
}

const LEAD_OUT: u8 = 0xAA;
const CUE_ENTRY_LEN: usize = 8;
const TOC_DESCRIPTOR_LEN: usize = 8;

fn msf_to_lba(m: u8, s: u8, f: u8) -> i64 {
    (i64::from(m) * 60 + i64::from(s)) * 75 + i64::from(f) - 150
}

impl TrackList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn sector_size_for_lba(&self, lba: u32) -> Option<u32> {
        self.tracks
            .iter()
            .find(|t| lba >= t.lba_start && lba < t.lba_end)
            .map(|t| t.form.sector_size())
    }

    /// Rebuilds the list from a SEND CUE SHEET payload.
    ///
    /// Each 8-byte entry is `ctl/adr, tno, index, data form, scms, min, sec, frame`. An entry
    /// with index 1 starts a track; track number 0xAA is the lead-out.
    pub fn update_from_cue_sheet(&mut self, cue: &[u8]) {
        let mut starts: Vec<(u8, u32, TrackDataForm)> = Vec::new();
        let mut lead_out: Option<u32> = None;
        for entry in cue.chunks_exact(CUE_ENTRY_LEN) {
            let tno = entry[1];
            let index = entry[2];
            let lba = msf_to_lba(entry[5], entry[6], entry[7]).max(0) as u32;
            if tno == LEAD_OUT {
                lead_out = Some(lba);
                continue;
            }
            if index != 1 {
                continue;
            }
            let form = match entry[3] & 0x3F {
                0x00 | 0x01 => TrackDataForm::Audio,
                0x10 => TrackDataForm::Mode1,
                0x11 => TrackDataForm::Mode1Raw,
                0x30 => TrackDataForm::Mode2,
                _ => TrackDataForm::Mode1,
            };
            starts.push((tno, lba, form));
        }
        self.rebuild(starts, lead_out);
    }

    /// Rebuilds the list from a READ TOC format 0 reply.
    pub fn update_from_toc(&mut self, toc: &[u8], msf: bool) {
        if toc.len() < 4 {
            return;
        }
        let data_len = usize::from(u16::from_be_bytes([toc[0], toc[1]])) + 2;
        let end = data_len.min(toc.len());
        let mut starts = Vec::new();
        let mut lead_out = None;
        for desc in toc[4..end].chunks_exact(TOC_DESCRIPTOR_LEN) {
            let ctl = desc[1] & 0x0F;
            let tno = desc[2];
            let lba = if msf {
                msf_to_lba(desc[5], desc[6], desc[7]).max(0) as u32
            } else {
                u32::from_be_bytes([desc[4], desc[5], desc[6], desc[7]])
            };
            if tno == LEAD_OUT {
                lead_out = Some(lba);
                continue;
            }
            let form = if ctl & 0x04 != 0 {
                TrackDataForm::Mode1
            } else {
                TrackDataForm::Audio
            };
            starts.push((tno, lba, form));
        }
        self.rebuild(starts, lead_out);
    }

    fn rebuild(&mut self, mut starts: Vec<(u8, u32, TrackDataForm)>, lead_out: Option<u32>) {
        starts.sort_by_key(|(_, lba, _)| *lba);
        self.tracks = starts
            .iter()
            .enumerate()
            .map(|(i, &(number, lba_start, form))| {
                let lba_end = starts
                    .get(i + 1)
                    .map(|next| next.1)
                    .or(lead_out)
                    .unwrap_or(u32::MAX);
                Track {
                    number,
                    lba_start,
                    lba_end,
                    form,
                }
            })
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cue_entry(tno: u8, index: u8, form: u8, m: u8, s: u8, f: u8) -> [u8; 8] {
        [0x41, tno, index, form, 0, m, s, f]
    }

    #[test]
    fn cue_sheet_defines_tracks_and_sizes() {
        let mut cue = Vec::new();
        cue.extend_from_slice(&cue_entry(1, 0, 0x10, 0, 0, 0));
        cue.extend_from_slice(&cue_entry(1, 1, 0x10, 0, 2, 0));
        cue.extend_from_slice(&cue_entry(2, 1, 0x00, 0, 12, 0));
        cue.extend_from_slice(&cue_entry(LEAD_OUT, 1, 0x01, 0, 22, 0));

        let mut list = TrackList::new();
        list.update_from_cue_sheet(&cue);
        assert_eq!(list.len(), 2);
        assert_eq!(list.sector_size_for_lba(0), Some(2048));
        assert_eq!(list.sector_size_for_lba(749), Some(2048));
        assert_eq!(list.sector_size_for_lba(750), Some(2352));
        assert_eq!(list.sector_size_for_lba(1500), None);
    }

    #[test]
    fn toc_reply_marks_data_and_audio_tracks() {
        let mut toc = vec![0u8; 4 + 3 * 8];
        let toc_len = toc.len();
        toc[0..2].copy_from_slice(&((toc_len - 2) as u16).to_be_bytes());
        toc[2] = 1;
        toc[3] = 2;
        let descs = [(0x14u8, 1u8, 0u32), (0x10, 2, 1000), (0x14, LEAD_OUT, 4000)];
        for (i, (ctl, tno, lba)) in descs.iter().enumerate() {
            let d = &mut toc[4 + i * 8..12 + i * 8];
            d[1] = *ctl;
            d[2] = *tno;
            d[4..8].copy_from_slice(&lba.to_be_bytes());
        }

        let mut list = TrackList::new();
        list.update_from_toc(&toc, false);
        assert_eq!(list.sector_size_for_lba(10), Some(2048));
        assert_eq!(list.sector_size_for_lba(1000), Some(2352));
        assert_eq!(list.sector_size_for_lba(4000), None);

        list.clear();
        assert!(list.is_empty());
    }
}
