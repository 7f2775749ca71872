//! Sensor glucose history.
//!
//! CBG pages hold one byte per sample and ISIG pages two descriptor bytes per
//! CBG byte. Both are joined into continuous streams and cut into records
//! wherever four `22 00` descriptors are followed by a non-`22` one.

use super::date::decode_date;
use crate::protocol::session::HistoryPage;
use chrono::NaiveDateTime;
use tracing::debug;

const CBG_PAGE_SIZE: usize = 1024;
const ISIG_PAGE_SIZE: usize = 2048;
const DATE_LENGTH: usize = 4;
const SEPARATOR: [u8; 8] = [0x22, 0x00, 0x22, 0x00, 0x22, 0x00, 0x22, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CbgRecordType {
    DataEnd,
    SensorWeakSignal,
    SensorCalibrationEvent,
    SensorPacketEvent,
    SensorErrorEvent,
    SensorGlucoseLessThan40,
    SensorGlucoseMoreThan400,
    SensorTimestamp,
    BatteryChange,
    SensorStatus,
    DateTimeChange,
    SensorSync,
    SensorCalBg,
    SensorCalFactor,
    SensorSpecialDisplayEvent,
    NoOp,
    Glucose40To400Min,
    Glucose40To400Max,
}

impl CbgRecordType {
    pub fn from_code(code: u8) -> Option<Self> {
        use CbgRecordType::*;
        Some(match code {
            0x01 => DataEnd,
            0x02 => SensorWeakSignal,
            0x03 => SensorCalibrationEvent,
            0x04 => SensorPacketEvent,
            0x05 => SensorErrorEvent,
            0x06 => SensorGlucoseLessThan40,
            0x07 => SensorGlucoseMoreThan400,
            0x08 => SensorTimestamp,
            0x0A => BatteryChange,
            0x0B => SensorStatus,
            0x0C => DateTimeChange,
            0x0D => SensorSync,
            0x0E => SensorCalBg,
            0x0F => SensorCalFactor,
            0x10 => SensorSpecialDisplayEvent,
            0x13 => NoOp,
            0x14 => Glucose40To400Min,
            0xC8 => Glucose40To400Max,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        use CbgRecordType::*;
        match self {
            DataEnd => 0x01,
            SensorWeakSignal => 0x02,
            SensorCalibrationEvent => 0x03,
            SensorPacketEvent => 0x04,
            SensorErrorEvent => 0x05,
            SensorGlucoseLessThan40 => 0x06,
            SensorGlucoseMoreThan400 => 0x07,
            SensorTimestamp => 0x08,
            BatteryChange => 0x0A,
            SensorStatus => 0x0B,
            DateTimeChange => 0x0C,
            SensorSync => 0x0D,
            SensorCalBg => 0x0E,
            SensorCalFactor => 0x0F,
            SensorSpecialDisplayEvent => 0x10,
            NoOp => 0x13,
            Glucose40To400Min => 0x14,
            Glucose40To400Max => 0xC8,
        }
    }
}

/// One record of the sensor stream. `body` holds the samples preceding the
/// record, `descriptor` two bytes for every byte of body, date and head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CbgRecord {
    pub record_type: CbgRecordType,
    pub head: u8,
    pub date: Vec<u8>,
    pub body: Vec<u8>,
    pub descriptor: Vec<u8>,
    pub timestamp: Option<NaiveDateTime>,
    /// Position in the CBG byte stream just past the record.
    pub index: u64,
}

impl CbgRecord {
    /// `DATE_TIME_CHANGE` sub code from the second date byte.
    pub fn sub_code(&self) -> u8 {
        (self.date.get(1).copied().unwrap_or(0) >> 5) & 0x07
    }

    /// Little-endian descriptor word at byte `offset`.
    pub fn descriptor_at(&self, offset: usize) -> u16 {
        let lo = self.descriptor.get(offset).copied().unwrap_or(0);
        let hi = self.descriptor.get(offset + 1).copied().unwrap_or(0);
        u16::from_le_bytes([lo, hi])
    }
}

fn join_valid(pages: &[HistoryPage], size: usize) -> Vec<u8> {
    let mut stream = Vec::with_capacity(pages.len() * size);
    for page in pages.iter().filter(|p| p.valid) {
        let mut bytes = page.bytes.clone();
        bytes.resize(size, 0);
        stream.extend_from_slice(&bytes);
    }
    stream
}

/// Split the CBG and ISIG pages into sensor records, oldest first.
pub fn decode_cbg_pages(cbg: &[HistoryPage], isig: &[HistoryPage]) -> Vec<CbgRecord> {
    let cbg_bytes = join_valid(cbg, CBG_PAGE_SIZE);
    let isig_bytes = join_valid(isig, ISIG_PAGE_SIZE);
    let byte = |stream: &[u8], i: usize| stream.get(i).copied().unwrap_or(0);

    let mut records = Vec::new();
    let mut index = 0usize;

    while index < cbg_bytes.len() {
        let mut body = Vec::new();
        let mut descriptor = Vec::new();
        let mut found = false;

        while !found && index < cbg_bytes.len() {
            let value = cbg_bytes[index];
            let desc_a = byte(&isig_bytes, index * 2);
            let desc_b = byte(&isig_bytes, index * 2 + 1);

            if descriptor.ends_with(&SEPARATOR) && desc_a != 0x22 && desc_b == 0x00 {
                found = true;
            }
            body.push(value);
            descriptor.push(desc_a);
            descriptor.push(desc_b);

            if descriptor == [0x01, 0x00] && value == CbgRecordType::DataEnd.code() {
                debug!("reached end of CBG data");
                break;
            }
            index += 1;
        }

        let Some(head) = body.pop() else {
            break;
        };
        let record_type = CbgRecordType::from_code(head);
        if record_type == Some(CbgRecordType::DataEnd) {
            debug!("end of CBG pages");
            break;
        }

        let date = body.split_off(body.len().saturating_sub(DATE_LENGTH));
        let Some(record_type) = record_type else {
            debug!(head = format_args!("{head:02X}"), "unknown type or corrupt CBG record");
            continue;
        };

        records.push(CbgRecord {
            record_type,
            head,
            timestamp: decode_date(&date),
            date,
            body,
            descriptor,
            index: index as u64,
        });
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(number: u32, bytes: Vec<u8>) -> HistoryPage {
        HistoryPage {
            number,
            bytes,
            valid: true,
            nak: false,
        }
    }

    /// Streams for records given as (samples, date, head).
    fn streams(records: &[(&[u8], [u8; 4], u8)]) -> (Vec<u8>, Vec<u8>) {
        let mut cbg = Vec::new();
        let mut isig = Vec::new();
        for (samples, date, head) in records {
            for s in *samples {
                cbg.push(*s);
                isig.extend_from_slice(&[0x90, 0x01]);
            }
            for d in date {
                cbg.push(*d);
                isig.extend_from_slice(&[0x22, 0x00]);
            }
            cbg.push(*head);
            isig.extend_from_slice(&[0x08, 0x00]);
        }
        cbg.resize(CBG_PAGE_SIZE, 0);
        isig.resize(ISIG_PAGE_SIZE, 0);
        (cbg, isig)
    }

    #[test]
    fn splits_records_on_descriptor_pattern() {
        let date = [16, 14, 0xC0 | 30, 0x80 | 10];
        let (cbg, isig) = streams(&[(&[60, 61], date, 0x08), (&[62], date, 0x08)]);
        let records = decode_cbg_pages(&[page(0, cbg)], &[page(0, isig)]);
        assert_eq!(records.len(), 2);
        let first = &records[0];
        assert_eq!(first.record_type, CbgRecordType::SensorTimestamp);
        assert_eq!(first.body, vec![60, 61]);
        assert_eq!(first.date, date.to_vec());
        assert!(first.timestamp.is_some());
        assert_eq!(first.index, 7);
        assert_eq!(records[1].body, vec![62]);
    }

    #[test]
    fn invalid_pages_are_not_joined() {
        let mut bad = page(0, vec![0x08; CBG_PAGE_SIZE]);
        bad.valid = false;
        assert!(decode_cbg_pages(&[bad], &[]).is_empty());
    }

    #[test]
    fn sub_code_and_descriptor_words() {
        let record = CbgRecord {
            record_type: CbgRecordType::DateTimeChange,
            head: 0x0C,
            date: vec![0, 0x20, 0, 0],
            body: vec![],
            descriptor: vec![0x22, 0x01],
            timestamp: None,
            index: 0,
        };
        assert_eq!(record.sub_code(), 1);
        assert_eq!(record.descriptor_at(0), 0x0122);
        assert_eq!(record.descriptor_at(4), 0);
    }
}
