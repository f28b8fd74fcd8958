//! Address/data field checks used for CRC scoring, and a track writer
//! that produces well-formed fields for synthesis and tests

use serde::{Deserialize, Serialize};

use crate::bitstream::crc::{crc16, xor_checksum};
use crate::bitstream::encoding::{
    clocked_decode, fm_encode, gcr_decode, gcr_encode, mfm_encode, word_bits, Encoding,
};
use crate::bitstream::sync::{
    SyncMark, SyncMatch, FM_DAM, FM_DELETED_DAM, FM_IDAM, MFM_A1,
};

pub(crate) const ID_MARK: u8 = 0xFE;
pub(crate) const DATA_MARK: u8 = 0xFB;
pub(crate) const DELETED_DATA_MARK: u8 = 0xF8;
const GCR_HEADER: u8 = 0x08;
const GCR_DATA: u8 = 0x07;
const GCR_SECTOR_BYTES: usize = 256;
const GCR_SYNC_CELLS: usize = 40;
const GCR_DISK_ID: [u8; 2] = [0x41, 0x42];
/// Size code assumed for a data field with no header before it
const DEFAULT_SIZE_CODE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldKind {
    Header,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectorId {
    pub track: u8,
    pub head: u8,
    pub sector: u8,
    pub size_code: u8,
}

impl SectorId {
    pub fn new(track: u8, head: u8, sector: u8, size_code: u8) -> Self {
        Self {
            track,
            head,
            sector,
            size_code,
        }
    }

    pub fn data_len(&self) -> usize {
        128usize << self.size_code.min(7)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldCheck {
    pub kind: FieldKind,
    /// Offset of the sync that introduced the field
    pub offset: usize,
    pub id: Option<SectorId>,
    pub crc_ok: bool,
    pub bytes: Vec<u8>,
    pub start_bit: usize,
    pub end_bit: usize,
}

impl FieldCheck {
    /// Same field with every bit position moved by `base`
    pub fn shifted(mut self, base: usize) -> Self {
        self.offset += base;
        self.start_bit += base;
        self.end_bit += base;
        self
    }
}

fn failed(kind: FieldKind, offset: usize, id: Option<SectorId>, start_bit: usize) -> FieldCheck {
    FieldCheck {
        kind,
        offset,
        id,
        crc_ok: false,
        bytes: Vec::new(),
        start_bit,
        end_bit: start_bit,
    }
}

/// Run the field checks the encoding defines after each sync
pub fn check_fields(bits: &[u8], encoding: Encoding, syncs: &[SyncMatch]) -> Vec<FieldCheck> {
    match encoding {
        Encoding::Mfm => check_mfm(bits, syncs),
        Encoding::Fm => check_fm(bits, syncs),
        Encoding::Gcr => check_gcr(bits, syncs),
    }
}

fn check_mfm(bits: &[u8], syncs: &[SyncMatch]) -> Vec<FieldCheck> {
    let mut checks = Vec::new();
    let mut last_id: Option<SectorId> = None;
    for (i, sync) in syncs.iter().enumerate() {
        if sync.mark != SyncMark::MfmA1 {
            continue;
        }
        // Only the last mark of a run introduces the field
        let run_continues = syncs
            .get(i + 1)
            .is_some_and(|next| next.mark == SyncMark::MfmA1 && next.offset == sync.end());
        if run_continues {
            continue;
        }

        let start = sync.end();
        let Some(mark) = clocked_decode(bits, start, 1).map(|b| b[0]) else {
            continue;
        };
        let prefix = [0xA1u8, 0xA1, 0xA1, mark];
        match mark {
            ID_MARK => {
                let Some(body) = clocked_decode(bits, start + 16, 6) else {
                    checks.push(failed(FieldKind::Header, sync.offset, None, start));
                    continue;
                };
                let id = SectorId::new(body[0], body[1], body[2], body[3]);
                let crc_ok = crc16(&[&prefix[..], &body[..]].concat()) == 0;
                if crc_ok {
                    last_id = Some(id);
                }
                checks.push(FieldCheck {
                    kind: FieldKind::Header,
                    offset: sync.offset,
                    id: Some(id),
                    crc_ok,
                    bytes: body[..4].to_vec(),
                    start_bit: start,
                    end_bit: start + 16 * 7,
                });
            }
            DATA_MARK | DELETED_DATA_MARK => {
                let len = last_id.map_or(128 << DEFAULT_SIZE_CODE, |id| id.data_len());
                let Some(body) = clocked_decode(bits, start + 16, len + 2) else {
                    checks.push(failed(FieldKind::Data, sync.offset, last_id, start));
                    continue;
                };
                let crc_ok = crc16(&[&prefix[..], &body[..]].concat()) == 0;
                checks.push(FieldCheck {
                    kind: FieldKind::Data,
                    offset: sync.offset,
                    id: last_id,
                    crc_ok,
                    bytes: body[..len].to_vec(),
                    start_bit: start,
                    end_bit: start + 16 * (len + 3),
                });
            }
            _ => {}
        }
    }
    checks
}

fn check_fm(bits: &[u8], syncs: &[SyncMatch]) -> Vec<FieldCheck> {
    let mut checks = Vec::new();
    let mut last_id: Option<SectorId> = None;
    for sync in syncs {
        let start = sync.end();
        match sync.mark {
            SyncMark::FmIdam => {
                let Some(body) = clocked_decode(bits, start, 6) else {
                    checks.push(failed(FieldKind::Header, sync.offset, None, start));
                    continue;
                };
                let id = SectorId::new(body[0], body[1], body[2], body[3]);
                let crc_ok = crc16(&[&[ID_MARK][..], &body[..]].concat()) == 0;
                if crc_ok {
                    last_id = Some(id);
                }
                checks.push(FieldCheck {
                    kind: FieldKind::Header,
                    offset: sync.offset,
                    id: Some(id),
                    crc_ok,
                    bytes: body[..4].to_vec(),
                    start_bit: start,
                    end_bit: start + 16 * 6,
                });
            }
            SyncMark::FmDam | SyncMark::FmDeletedDam => {
                let mark = if sync.mark == SyncMark::FmDam {
                    DATA_MARK
                } else {
                    DELETED_DATA_MARK
                };
                let len = last_id.map_or(128 << DEFAULT_SIZE_CODE, |id| id.data_len());
                let Some(body) = clocked_decode(bits, start, len + 2) else {
                    checks.push(failed(FieldKind::Data, sync.offset, last_id, start));
                    continue;
                };
                let crc_ok = crc16(&[&[mark][..], &body[..]].concat()) == 0;
                checks.push(FieldCheck {
                    kind: FieldKind::Data,
                    offset: sync.offset,
                    id: last_id,
                    crc_ok,
                    bytes: body[..len].to_vec(),
                    start_bit: start,
                    end_bit: start + 16 * (len + 2),
                });
            }
            _ => {}
        }
    }
    checks
}

fn check_gcr(bits: &[u8], syncs: &[SyncMatch]) -> Vec<FieldCheck> {
    let mut checks = Vec::new();
    let mut last_id: Option<SectorId> = None;
    for sync in syncs.iter().filter(|s| s.mark == SyncMark::GcrSync) {
        let start = sync.end();
        match gcr_decode(bits, start, 1).map(|b| b[0]) {
            Some(GCR_HEADER) => {
                let Some(body) = gcr_decode(bits, start, 8) else {
                    checks.push(failed(FieldKind::Header, sync.offset, None, start));
                    continue;
                };
                let (checksum, sector, track) = (body[1], body[2], body[3]);
                let id = SectorId::new(track, 0, sector, 1);
                let crc_ok = xor_checksum(&body[2..6]) == checksum;
                if crc_ok {
                    last_id = Some(id);
                }
                checks.push(FieldCheck {
                    kind: FieldKind::Header,
                    offset: sync.offset,
                    id: Some(id),
                    crc_ok,
                    bytes: body[2..6].to_vec(),
                    start_bit: start,
                    end_bit: start + 10 * 8,
                });
            }
            Some(GCR_DATA) => {
                let Some(body) = gcr_decode(bits, start, GCR_SECTOR_BYTES + 2) else {
                    checks.push(failed(FieldKind::Data, sync.offset, last_id, start));
                    continue;
                };
                let data = &body[1..=GCR_SECTOR_BYTES];
                checks.push(FieldCheck {
                    kind: FieldKind::Data,
                    offset: sync.offset,
                    id: last_id,
                    crc_ok: xor_checksum(data) == body[GCR_SECTOR_BYTES + 1],
                    bytes: data.to_vec(),
                    start_bit: start,
                    end_bit: start + 10 * (GCR_SECTOR_BYTES + 2),
                });
            }
            _ => {}
        }
    }
    checks
}

/// Builds raw cell streams with correctly clocked marks and checksums
#[derive(Debug, Clone)]
pub struct TrackWriter {
    encoding: Encoding,
    bits: Vec<u8>,
    last_data: u8,
}

impl TrackWriter {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            bits: Vec::new(),
            last_data: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        let cells = match self.encoding {
            Encoding::Mfm => mfm_encode(bytes, self.last_data),
            Encoding::Fm => fm_encode(bytes),
            Encoding::Gcr => gcr_encode(bytes),
        };
        if let Some(&last) = bytes.last() {
            self.last_data = last & 1;
        }
        self.bits.extend(cells);
        self
    }

    pub fn gap(&mut self, byte: u8, count: usize) -> &mut Self {
        self.bytes(&vec![byte; count])
    }

    /// Raw 16-cell mark, written without re-encoding
    pub fn mark(&mut self, word: u16) -> &mut Self {
        self.bits.extend(word_bits(word));
        self.last_data = (word & 1) as u8;
        self
    }

    pub fn sync_run(&mut self, cells: usize) -> &mut Self {
        self.bits.extend(std::iter::repeat(1).take(cells));
        self.last_data = 1;
        self
    }

    /// Header and data field for one sector; `data` must hold the sector
    /// size (256 bytes for GCR)
    pub fn sector(&mut self, id: SectorId, data: &[u8]) -> &mut Self {
        match self.encoding {
            Encoding::Mfm => {
                let header = [ID_MARK, id.track, id.head, id.sector, id.size_code];
                let header_crc = crc16(&[&[0xA1, 0xA1, 0xA1][..], &header[..]].concat());
                let mut data_field = vec![DATA_MARK];
                data_field.extend_from_slice(data);
                let data_crc = crc16(&[&[0xA1, 0xA1, 0xA1][..], &data_field[..]].concat());

                self.gap(0x00, 12).mark(MFM_A1).mark(MFM_A1).mark(MFM_A1);
                self.bytes(&header).bytes(&header_crc.to_be_bytes());
                self.gap(0x4E, 22).gap(0x00, 12);
                self.mark(MFM_A1).mark(MFM_A1).mark(MFM_A1);
                self.bytes(&data_field).bytes(&data_crc.to_be_bytes());
                self.gap(0x4E, 24)
            }
            Encoding::Fm => {
                let header = [id.track, id.head, id.sector, id.size_code];
                let header_crc = crc16(&[&[ID_MARK][..], &header[..]].concat());
                let data_crc = crc16(&[&[DATA_MARK][..], data].concat());

                self.gap(0x00, 6).mark(FM_IDAM);
                self.bytes(&header).bytes(&header_crc.to_be_bytes());
                self.gap(0xFF, 11).gap(0x00, 6).mark(FM_DAM);
                self.bytes(data).bytes(&data_crc.to_be_bytes());
                self.gap(0xFF, 27)
            }
            Encoding::Gcr => {
                let ids = [id.sector, id.track, GCR_DISK_ID[1], GCR_DISK_ID[0]];
                let checksum = xor_checksum(&ids);
                self.sync_run(GCR_SYNC_CELLS);
                self.bytes(&[GCR_HEADER, checksum])
                    .bytes(&ids)
                    .bytes(&[0x0F, 0x0F]);
                self.gap(0x55, 9).sync_run(GCR_SYNC_CELLS);
                self.bytes(&[GCR_DATA]).bytes(data).bytes(&[xor_checksum(data)]);
                self.gap(0x55, 8)
            }
        }
    }

    /// FM deleted-data variant, used to exercise the alternate mark
    pub fn fm_deleted_sector(&mut self, id: SectorId, data: &[u8]) -> &mut Self {
        let header = [id.track, id.head, id.sector, id.size_code];
        let header_crc = crc16(&[&[ID_MARK][..], &header[..]].concat());
        let data_crc = crc16(&[&[DELETED_DATA_MARK][..], data].concat());
        self.gap(0x00, 6).mark(FM_IDAM);
        self.bytes(&header).bytes(&header_crc.to_be_bytes());
        self.gap(0xFF, 11).gap(0x00, 6).mark(FM_DELETED_DAM);
        self.bytes(data).bytes(&data_crc.to_be_bytes());
        self.gap(0xFF, 27)
    }

    pub fn bits(&self) -> &[u8] {
        &self.bits
    }

    pub fn into_bits(self) -> Vec<u8> {
        self.bits
    }
}
