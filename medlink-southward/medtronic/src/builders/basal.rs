use super::BuildContext;
use crate::{
    config::profile_name,
    decoder::{filter_records, Record, RecordType},
};
use medlink_sdk::{codes, DraftBasal, DraftEvent};
use tracing::debug;

const HALF_HOUR_MS: i64 = 30 * 60 * 1000;

/// Temp basals, paired with the `TEMP_BASAL_DURATION` record logged at the
/// same instant.
pub fn build_temp_basals(ctx: &BuildContext, records: &[Record]) -> Vec<DraftEvent> {
    let entries = filter_records(records, &[RecordType::TempBasal, RecordType::TempBasalDuration]);
    let mut events = Vec::new();

    let mut i = 0;
    while i < entries.len() {
        let record = entries[i];
        if !record.is(RecordType::TempBasal) {
            i += 1;
            continue;
        }

        let mut basal = DraftBasal::temp(ctx.meta(record));
        if record.body_byte(0) >> 3 != 0 {
            basal.percent = Some(record.head_byte(1) as f64 / 100.0);
        } else {
            basal.rate = Some(ctx.units(record.head_byte(1) as u32));
        }

        match entries.get(i + 1) {
            Some(next)
                if next.is(RecordType::TempBasalDuration) && next.timestamp == record.timestamp =>
            {
                i += 1;
                basal.duration = Some(next.head_byte(1) as i64 * HALF_HOUR_MS);
            }
            _ => {
                debug!(index = record.index, "temp basal not followed by duration");
                basal.duration = Some(0);
                basal.meta.annotate(codes::UNKNOWN_DURATION);
            }
        }

        events.push(DraftEvent::Basal(basal));
        i += 1;
    }

    events
}

/// Scheduled basal segments; their durations are left for the simulator.
pub fn build_scheduled_basals(ctx: &BuildContext, records: &[Record]) -> Vec<DraftEvent> {
    filter_records(records, &[RecordType::BasalProfileStart])
        .into_iter()
        .map(|record| {
            let schedule = profile_name(record.date_byte(2) >> 5).map(str::to_string);
            DraftEvent::Basal(DraftBasal::scheduled(
                ctx.meta(record),
                ctx.units(record.body_byte(1) as u32),
                schedule,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::fixtures::{at, context, record};
    use medlink_sdk::DeliveryType;

    fn basals(events: Vec<DraftEvent>) -> Vec<DraftBasal> {
        events
            .into_iter()
            .map(|e| match e {
                DraftEvent::Basal(b) => b,
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    fn temp(head1: u8, percent: bool, index: u64) -> Record {
        record(
            RecordType::TempBasal,
            &[0x33, head1],
            &[0, 0, 0, 14, 16],
            &[if percent { 0x08 } else { 0 }],
            at(9, 0, 0),
            index,
        )
    }

    fn duration(half_hours: u8, index: u64, ts: chrono::NaiveDateTime) -> Record {
        record(RecordType::TempBasalDuration, &[0x16, half_hours], &[0, 0, 0, 14, 16], &[], ts, index)
    }

    #[test]
    fn absolute_temp_with_duration() {
        let out = basals(build_temp_basals(
            &context(),
            &[temp(60, false, 1), duration(3, 2, at(9, 0, 0))],
        ));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].rate, Some(1.5));
        assert_eq!(out[0].percent, None);
        assert_eq!(out[0].duration, Some(3 * HALF_HOUR_MS));
    }

    #[test]
    fn percent_temp_without_matching_duration() {
        let out = basals(build_temp_basals(
            &context(),
            &[temp(50, true, 1), duration(3, 2, at(9, 0, 1))],
        ));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].percent, Some(0.5));
        assert_eq!(out[0].rate, None);
        assert_eq!(out[0].duration, Some(0));
        assert!(out[0].meta.is_annotated(codes::UNKNOWN_DURATION));
    }

    #[test]
    fn scheduled_basal_names_profile() {
        let rec = record(
            RecordType::BasalProfileStart,
            &[0x7B, 0],
            &[0, 0, 1 << 5, 14, 16],
            &[0, 32, 0],
            at(0, 0, 0),
            7,
        );
        let out = basals(build_scheduled_basals(&context(), &[rec]));
        assert!(out[0].is(DeliveryType::Scheduled));
        assert_eq!(out[0].rate, Some(0.8));
        assert_eq!(out[0].schedule_name.as_deref(), Some("pattern a"));
        assert_eq!(out[0].duration, None);
    }
}
