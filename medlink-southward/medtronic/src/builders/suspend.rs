use super::BuildContext;
use crate::decoder::{filter_records, Record, RecordType};
use medlink_sdk::{
    codes, Agent, DeviceEvent, DeviceEventKind, DraftBasal, DraftEvent, DriverError,
    DriverResult, PumpStatus, StatusEvent, StatusReason,
};
use serde_json::Value;
use tracing::debug;

const SUSPEND_ALARM: u8 = 2;
const RESUME_USER: u8 = 6;
const RESUME_AUTO_USER_SUSPEND: u8 = 7;
const RESUME_AUTO_NO_RESPONSE: u8 = 8;

fn reason(record: &Record) -> u8 {
    record.head_byte(1) & 0x1F
}

fn reason_name(code: u8) -> Option<&'static str> {
    Some(match code {
        1 => "Suspend user",
        2 => "Suspend alarm",
        3 => "Suspend low glucose",
        4 => "Suspend no response",
        5 => "Suspend user selected",
        6 => "Resume user",
        7 => "Automatic resume after user suspend",
        8 => "Automatic resume after no response",
        _ => return None,
    })
}

/// Pair suspend records with the resume that ended them. Each pair yields a
/// status event followed by the suspended basal it started; the simulator
/// relies on that order.
pub fn build_suspend_resumes(
    ctx: &BuildContext,
    records: &[Record],
) -> DriverResult<Vec<DraftEvent>> {
    let entries = filter_records(records, &[RecordType::PumpSuspend, RecordType::PumpResume]);
    let mut events = Vec::new();

    let mut i = 0;
    while i < entries.len() {
        let suspend = entries[i];
        if reason(suspend) == 0 {
            debug!(index = suspend.index, "normal pumping entry, skipping");
            i += 1;
            continue;
        }
        if !suspend.is(RecordType::PumpSuspend) {
            debug!(index = suspend.index, "suspend event out of order");
            return Err(DriverError::DecodeError(
                "Suspend/resume events out of order".into(),
            ));
        }

        let basal = DraftBasal::suspend(ctx.meta(suspend));
        let mut status_reason = StatusReason {
            suspended: Agent::Manual,
            resumed: Agent::Manual,
        };
        let mut reasons = Vec::new();

        // the user may confirm the suspend several times
        while let Some(entry) = entries.get(i).filter(|e| e.is(RecordType::PumpSuspend)) {
            match reason(entry) {
                SUSPEND_ALARM => {
                    debug!(device_time = %entry.timestamp, "low glucose suspend");
                    status_reason.suspended = Agent::Automatic;
                }
                code => reasons.extend(reason_name(code)),
            }
            i += 1;
        }

        let mut meta = ctx.meta(suspend);
        let (duration, resume_index) = match entries.get(i).filter(|e| e.is(RecordType::PumpResume)) {
            Some(resume) => {
                let code = reason(resume);
                match code {
                    RESUME_AUTO_NO_RESPONSE => {
                        status_reason.resumed = Agent::Automatic;
                        reasons.extend(reason_name(code));
                        // up to three resume records follow an unanswered alarm
                        while entries
                            .get(i + 1)
                            .is_some_and(|e| e.is(RecordType::PumpResume))
                        {
                            i += 1;
                        }
                    }
                    RESUME_AUTO_USER_SUSPEND => {
                        status_reason.resumed = Agent::Automatic;
                        reasons.extend(reason_name(code));
                    }
                    RESUME_USER => {
                        reasons.extend(reason_name(code));
                        if entries
                            .get(i + 1)
                            .is_some_and(|e| e.is(RecordType::PumpResume))
                        {
                            i += 1;
                        }
                    }
                    _ => {}
                }
                meta.set_payload(
                    "reasons",
                    Value::from(reasons.iter().map(|r| Value::from(*r)).collect::<Vec<_>>()),
                );
                let duration = (resume.timestamp - suspend.timestamp).num_milliseconds();
                (duration, Some(resume.index))
            }
            None => {
                debug!(device_time = %suspend.timestamp, "incomplete suspend/resume");
                meta.annotate(codes::INCOMPLETE_TUPLE);
                (0, None)
            }
        };

        events.push(DraftEvent::DeviceEvent(DeviceEvent::new(
            meta,
            DeviceEventKind::Status(StatusEvent {
                status: PumpStatus::Suspended,
                reason: status_reason,
                duration,
                resume_index,
            }),
        )));
        events.push(DraftEvent::Basal(basal));
        i += 1;
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::fixtures::{at, context, record};
    use medlink_sdk::DeliveryType;

    fn entry(kind: RecordType, reason: u8, m: u32, index: u64) -> Record {
        record(kind, &[0x1E, reason], &[0, 0, 0, 14, 16], &[], at(3, m, 0), index)
    }

    fn status(event: &DraftEvent) -> (&DeviceEvent, &StatusEvent) {
        match event {
            DraftEvent::DeviceEvent(d) => (d, d.as_status().unwrap()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn low_glucose_suspend_with_auto_resume() {
        let records = [
            entry(RecordType::PumpSuspend, 2, 0, 1),
            entry(RecordType::PumpSuspend, 4, 10, 2),
            entry(RecordType::PumpResume, 8, 30, 3),
            entry(RecordType::PumpResume, 8, 30, 4),
            entry(RecordType::PumpResume, 8, 30, 5),
        ];
        let events = build_suspend_resumes(&context(), &records).unwrap();
        assert_eq!(events.len(), 2);

        let (device, s) = status(&events[0]);
        assert_eq!(s.reason.suspended, Agent::Automatic);
        assert_eq!(s.reason.resumed, Agent::Automatic);
        assert_eq!(s.duration, 30 * 60_000);
        assert_eq!(s.resume_index, Some(3));
        assert_eq!(
            device.meta.payload_value("reasons"),
            Some(&serde_json::json!(["Suspend no response", "Automatic resume after no response"]))
        );

        match &events[1] {
            DraftEvent::Basal(b) => {
                assert!(b.is(DeliveryType::Suspend));
                assert_eq!(b.meta.index, Some(1));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn user_resume_consumes_the_echo_record() {
        let records = [
            entry(RecordType::PumpSuspend, 1, 0, 1),
            entry(RecordType::PumpResume, 6, 5, 2),
            entry(RecordType::PumpResume, 6, 5, 3),
            entry(RecordType::PumpSuspend, 1, 20, 4),
            entry(RecordType::PumpResume, 6, 25, 5),
        ];
        let events = build_suspend_resumes(&context(), &records).unwrap();
        assert_eq!(events.len(), 4);
        let (_, second) = status(&events[2]);
        assert_eq!(second.resume_index, Some(5));
        assert_eq!(second.reason.resumed, Agent::Manual);
    }

    #[test]
    fn trailing_suspend_is_incomplete() {
        let events =
            build_suspend_resumes(&context(), &[entry(RecordType::PumpSuspend, 1, 0, 1)]).unwrap();
        let (device, s) = status(&events[0]);
        assert_eq!(s.duration, 0);
        assert!(device.meta.is_annotated(codes::INCOMPLETE_TUPLE));
    }

    #[test]
    fn normal_pumping_entries_are_skipped() {
        let records = [entry(RecordType::PumpResume, 0, 0, 1)];
        assert!(build_suspend_resumes(&context(), &records).unwrap().is_empty());
    }

    #[test]
    fn resume_first_is_out_of_order() {
        let records = [entry(RecordType::PumpResume, 6, 0, 1)];
        assert!(build_suspend_resumes(&context(), &records).is_err());
    }
}
