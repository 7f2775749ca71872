use super::{round1, BuildContext};
use crate::decoder::{filter_records, Record, RecordType};
use medlink_sdk::{checksum::to_hex, BgUnits, DraftEvent, DriverError, DriverResult, Smbg, SmbgSubType};
use tracing::debug;

fn scale(value: u32, units: BgUnits) -> f64 {
    match units {
        BgUnits::MmolL => round1(value as f64 / 10.0),
        BgUnits::MgDl => value as f64,
    }
}

/// Fingerstick readings. A `CAL_BG_FOR_PH` followed by `BG_RECEIVED` came
/// from a linked meter; both records must agree on the value.
pub fn build_bg(ctx: &BuildContext, records: &[Record]) -> DriverResult<Vec<DraftEvent>> {
    let entries = filter_records(records, &[RecordType::BgReceived, RecordType::CalBgForPh]);
    let mut events = Vec::new();

    let mut i = 0;
    while i < entries.len() {
        let entry = entries[i];
        let units = if entry.date_byte(2) & 0xC0 == 0x40 {
            BgUnits::MmolL
        } else {
            BgUnits::MgDl
        };
        let raw = entry.head_byte(1) as u32
            + (((entry.date_byte(4) & 0x80) as u32) << 1)
            + (((entry.date_byte(2) & 0x80) as u32) << 2);
        let value = scale(raw, units);

        let mut sub_type = SmbgSubType::Manual;
        let mut index = entry.index;
        let mut meter = None;

        if let Some(received) = entries
            .get(i + 1)
            .filter(|next| next.is(RecordType::BgReceived))
        {
            i += 1;
            let linked_raw =
                ((received.head_byte(1) as u32) << 3) + (received.date_byte(2) >> 5) as u32;
            let linked = scale(linked_raw, units);
            if linked != value {
                debug!(timestamp = %received.timestamp, value, linked, "linked smbg value does not match value on pump");
                return Err(DriverError::DecodeError(
                    "Linked smbg value does not match value on pump".into(),
                ));
            }
            sub_type = SmbgSubType::Linked;
            index = received.index;
            meter = Some(to_hex(received.body.get(..3).unwrap_or(&received.body)));
        }

        let mut meta = ctx.meta_at(entry.timestamp, index);
        if let Some(meter) = meter {
            meta.set_payload("meterSerial", meter);
        }
        events.push(DraftEvent::Smbg(Smbg {
            meta,
            sub_type: Some(sub_type),
            value,
            units,
        }));
        i += 1;
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::fixtures::{at, context, record};
    use serde_json::Value;

    fn cal(value: u16, mmol: bool, index: u64) -> Record {
        let date2 = (if mmol { 0x40 } else { 0 }) | (if value & 0x200 != 0 { 0x80 } else { 0 });
        let date4 = (if value & 0x100 != 0 { 0x80 } else { 0 }) | 16;
        record(
            RecordType::CalBgForPh,
            &[0x0A, value as u8],
            &[0, 0, date2, 14, date4],
            &[],
            at(7, 30, 0),
            index,
        )
    }

    fn received(value: u16, index: u64) -> Record {
        record(
            RecordType::BgReceived,
            &[0x3F, (value >> 3) as u8],
            &[0, 0, ((value & 0x07) as u8) << 5, 14, 16],
            &[0xAB, 0x12, 0x0C],
            at(7, 30, 1),
            index,
        )
    }

    fn smbgs(records: &[Record]) -> DriverResult<Vec<Smbg>> {
        Ok(build_bg(&context(), records)?
            .into_iter()
            .map(|e| match e {
                DraftEvent::Smbg(s) => s,
                other => panic!("unexpected {other:?}"),
            })
            .collect())
    }

    #[test]
    fn manual_reading_uses_high_bits() {
        let out = smbgs(&[cal(310, false, 4)]).unwrap();
        assert_eq!(out[0].value, 310.0);
        assert_eq!(out[0].sub_type, Some(SmbgSubType::Manual));
        assert_eq!(out[0].units, BgUnits::MgDl);
    }

    #[test]
    fn linked_reading_carries_meter_serial() {
        let out = smbgs(&[cal(123, false, 4), received(123, 5)]).unwrap();
        assert_eq!(out.len(), 1);
        let smbg = &out[0];
        assert_eq!(smbg.sub_type, Some(SmbgSubType::Linked));
        assert_eq!(smbg.meta.index, Some(5));
        assert_eq!(smbg.meta.device_time, at(7, 30, 0));
        assert_eq!(
            smbg.meta.payload_value("meterSerial"),
            Some(&Value::from("AB120C"))
        );
    }

    #[test]
    fn mmol_values_are_scaled() {
        let out = smbgs(&[cal(67, true, 4)]).unwrap();
        assert_eq!(out[0].value, 6.7);
        assert_eq!(out[0].units, BgUnits::MmolL);
    }

    #[test]
    fn linked_mismatch_fails() {
        let err = smbgs(&[cal(123, false, 4), received(124, 5)]).unwrap_err();
        assert!(err.to_string().contains("Linked smbg value does not match"));
    }
}
