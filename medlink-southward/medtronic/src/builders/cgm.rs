//! Sensor glucose values.
//!
//! Samples carry no timestamp of their own. Each `SENSOR_TIMESTAMP` anchors
//! the samples logged before it at five minute steps, so the stream is
//! walked newest to oldest and every anchor restarts the count.

use super::BuildContext;
use crate::{
    config::byte_at,
    decoder::{CbgRecord, CbgRecordType},
};
use chrono::{Duration, NaiveDateTime};
use medlink_sdk::{
    Annotation, BgUnits, CalibrationEvent, Cbg, DeviceEvent, DeviceEventKind, DraftEvent,
};
use tracing::{debug, trace};

const SAMPLE_INTERVAL_MIN: i64 = 5;
const CAL_MARKER: u16 = 0x22;

pub fn build_cgm(ctx: &BuildContext, records: &[CbgRecord]) -> Vec<DraftEvent> {
    let mut events = Vec::new();
    if records.last().map_or(true, |r| r.timestamp.is_none()) {
        return events;
    }

    let mut anchor: Option<NaiveDateTime> = None;
    let mut since_anchor = 0i64;

    for record in records.iter().rev() {
        let Some(timestamp) = record.timestamp else {
            continue;
        };

        if record.record_type == CbgRecordType::SensorTimestamp {
            anchor = Some(timestamp);
            since_anchor = 0;
        }

        let first_index = record.index as i64 - record.body.len() as i64;
        for offset in (0..=record.body.len()).rev() {
            let descriptor = record.descriptor_at(offset * 2);
            let value = byte_at(&record.body, offset);

            if descriptor > 255 {
                let Some(start) = anchor else {
                    debug!("dropping CBG values without timestamp");
                    break;
                };
                let device_time = start - Duration::minutes(since_anchor * SAMPLE_INTERVAL_MIN);
                since_anchor += 1;

                let mut glucose = (descriptor & 0x01) as f64 + ((value as u32) << 1) as f64;
                let clamp = match CbgRecordType::from_code(value) {
                    Some(CbgRecordType::SensorGlucoseMoreThan400) => {
                        glucose = 401.0;
                        Some(Annotation::out_of_range("high", 400))
                    }
                    Some(CbgRecordType::SensorGlucoseLessThan40) => {
                        glucose = 39.0;
                        Some(Annotation::out_of_range("low", 40))
                    }
                    _ => None,
                };
                trace!(%device_time, glucose, descriptor, "sensor sample");

                if glucose >= 40.0 || clamp.is_some() {
                    let index = (first_index + offset as i64).max(0) as u64;
                    let mut meta = ctx.cgm_meta(device_time, index);
                    meta.set_payload("interstitialSignal", (descriptor & 0xFFFE) as f64 / 100.0);
                    if let Some(annotation) = clamp {
                        meta.annotations.add(annotation);
                    }
                    events.push(DraftEvent::Cbg(Cbg {
                        meta,
                        value: glucose,
                        units: BgUnits::MgDl,
                    }));
                }
            } else if (descriptor < 20 || descriptor > 200)
                && CbgRecordType::from_code(value).is_some()
            {
                since_anchor += 1;
            }
        }

        if record.record_type == CbgRecordType::SensorCalBg
            && record.descriptor_at(record.descriptor.len().saturating_sub(12)) == CAL_MARKER
        {
            let value = record.body.last().copied().unwrap_or(0);
            events.push(DraftEvent::DeviceEvent(DeviceEvent::new(
                ctx.cgm_meta(timestamp, record.index),
                DeviceEventKind::Calibration(CalibrationEvent {
                    value: value as f64,
                    units: BgUnits::MgDl,
                }),
            )));
        }
    }

    events
}
