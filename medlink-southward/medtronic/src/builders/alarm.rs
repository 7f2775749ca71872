use super::BuildContext;
use crate::decoder::{filter_records, Record, RecordType};
use medlink_sdk::{
    AlarmEvent, AlarmType, DeviceEvent, DeviceEventKind, DraftEvent, PrimeEvent, PrimeTarget,
    ReservoirChangeEvent,
};

const ALARM_NO_DELIVERY: u8 = 4;
const ALARM_BATTERY_DEPLETED: u8 = 5;
const ALARM_AUTO_OFF: u8 = 6;

fn alarm_text(id: u8) -> Option<&'static str> {
    Some(match id {
        3 => "Battery out limit exceeded",
        4 => "No delivery",
        5 => "Battery depleted",
        6 => "Auto off",
        59 => "Button error",
        103 => "Low glucose suspend",
        _ => return None,
    })
}

fn alarm(ctx: &BuildContext, record: &Record) -> DeviceEvent {
    let mut meta = ctx.meta(record);
    let alarm_type = match record.record_type {
        RecordType::LowReservoir => {
            meta.set_payload("amount", record.head_byte(1) as f64 / 10.0);
            AlarmType::LowInsulin
        }
        RecordType::LowBattery => AlarmType::LowPower,
        _ => match record.head_byte(1) {
            ALARM_NO_DELIVERY => AlarmType::NoDelivery,
            ALARM_BATTERY_DEPLETED => AlarmType::NoPower,
            ALARM_AUTO_OFF => AlarmType::AutoOff,
            id => {
                meta.set_payload("alarm_id", id);
                if let Some(text) = alarm_text(id) {
                    meta.set_payload("alarm_text", text);
                }
                AlarmType::Other
            }
        },
    };
    DeviceEvent::new(
        meta,
        DeviceEventKind::Alarm(AlarmEvent {
            alarm_type,
            status: None,
        }),
    )
}

pub fn build_alarms(ctx: &BuildContext, records: &[Record]) -> Vec<DraftEvent> {
    filter_records(
        records,
        &[RecordType::AlarmPump, RecordType::LowReservoir, RecordType::LowBattery],
    )
    .into_iter()
    .map(|record| DraftEvent::DeviceEvent(alarm(ctx, record)))
    .collect()
}

/// Tubing primes have no fixed amount. A cannula prime cut short keeps the
/// programmed amount in the payload.
pub fn build_primes(ctx: &BuildContext, records: &[Record]) -> Vec<DraftEvent> {
    filter_records(records, &[RecordType::Prime])
        .into_iter()
        .map(|record| {
            let volume = record.head_byte(4) as f64 / 10.0;
            let fixed = record.head_byte(2) as f64 / 10.0;
            let prime_target = if fixed == 0.0 {
                PrimeTarget::Tubing
            } else {
                PrimeTarget::Cannula
            };

            let mut meta = ctx.meta(record);
            if prime_target == PrimeTarget::Cannula && fixed != volume {
                meta.set_payload("programmedAmount", fixed);
            }
            DraftEvent::DeviceEvent(DeviceEvent::new(
                meta,
                DeviceEventKind::Prime(PrimeEvent {
                    prime_target,
                    volume,
                }),
            ))
        })
        .collect()
}

pub fn build_rewinds(ctx: &BuildContext, records: &[Record]) -> Vec<DraftEvent> {
    filter_records(records, &[RecordType::Rewind])
        .into_iter()
        .map(|record| {
            DraftEvent::DeviceEvent(DeviceEvent::new(
                ctx.meta(record),
                DeviceEventKind::ReservoirChange(ReservoirChangeEvent::default()),
            ))
        })
        .collect()
}
