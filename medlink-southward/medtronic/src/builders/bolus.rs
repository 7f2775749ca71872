use super::BuildContext;
use crate::{
    config::{be_u16_at, byte_at},
    decoder::{filter_records, Record, RecordType},
};
use medlink_sdk::{Bolus, BolusSubType, DraftEvent};
use tracing::debug;

const HALF_HOUR_MS: i64 = 30 * 60 * 1000;

/// Bolus kind stored in the top three bits of the third date byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Normal,
    Square,
    DualNormal,
    DualSquare,
    Unknown(u8),
}

impl Kind {
    fn of(record: &Record) -> Self {
        match record.date_byte(2) >> 5 {
            1 | 2 => Kind::Normal,
            3 => Kind::Square,
            4 => Kind::DualNormal,
            5 => Kind::DualSquare,
            other => Kind::Unknown(other),
        }
    }
}

struct Delivery {
    amount: f64,
    programmed: f64,
    iob: f64,
    duration: i64,
}

impl Delivery {
    fn read(ctx: &BuildContext, record: &Record) -> Self {
        Self {
            amount: ctx.units(be_u16_at(&record.head, 3) as u32),
            programmed: ctx.units(byte_at(&record.head, 1) as u32),
            iob: ctx.units(byte_at(&record.head, 5) as u32),
            duration: byte_at(&record.head, 7) as i64 * HALF_HOUR_MS,
        }
    }

    /// Apply the square part, scaling the duration down when the bolus was
    /// cancelled before completion.
    fn extend(&self, bolus: &mut Bolus) {
        bolus.extended = Some(self.amount);
        bolus.duration = Some(self.duration);
        if self.programmed != self.amount {
            bolus.expected_extended = Some(self.programmed);
            bolus.expected_duration = Some(self.duration);
            let delivered = if self.programmed > 0.0 {
                (self.amount / self.programmed * self.duration as f64).round() as i64
            } else {
                0
            };
            bolus.duration = Some(delivered);
        }
    }

    fn normal(&self, bolus: &mut Bolus) {
        bolus.normal = Some(self.amount);
        if self.programmed != self.amount {
            bolus.expected_normal = Some(self.programmed);
        }
    }
}

pub fn build_boluses(ctx: &BuildContext, records: &[Record]) -> Vec<DraftEvent> {
    let boluses = filter_records(records, &[RecordType::Bolus]);
    let mut events = Vec::new();

    let mut i = 0;
    while i < boluses.len() {
        let record = boluses[i];
        let delivery = Delivery::read(ctx, record);

        let bolus = match Kind::of(record) {
            Kind::DualSquare => {
                let dual = boluses
                    .get(i + 1)
                    .is_some_and(|next| Kind::of(next) == Kind::DualNormal);
                let sub_type = if dual {
                    BolusSubType::Dual
                } else {
                    BolusSubType::Square
                };
                let mut bolus = Bolus::new(ctx.meta(record), sub_type);
                delivery.extend(&mut bolus);

                if dual {
                    i += 1;
                    let normal_record = boluses[i];
                    let normal = Delivery::read(ctx, normal_record);
                    normal.normal(&mut bolus);
                    bolus.iob = Some(normal.iob);
                    bolus.meta = ctx.meta(normal_record);
                } else {
                    bolus.iob = Some(delivery.iob);
                }

                if bolus.extended == Some(0.0) && bolus.duration == Some(0) {
                    bolus.sub_type = BolusSubType::Normal;
                }
                bolus
            }
            Kind::Normal => {
                let mut bolus = Bolus::new(ctx.meta(record), BolusSubType::Normal);
                delivery.normal(&mut bolus);
                bolus.iob = Some(delivery.iob);
                bolus
            }
            Kind::Square => {
                let mut bolus = Bolus::new(ctx.meta(record), BolusSubType::Square);
                delivery.extend(&mut bolus);
                bolus.iob = Some(delivery.iob);
                bolus
            }
            Kind::DualNormal | Kind::Unknown(_) => {
                debug!(index = record.index, "unknown bolus type");
                i += 1;
                continue;
            }
        };

        events.push(DraftEvent::Bolus(bolus));
        i += 1;
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::fixtures::{at, context, record};

    fn bolus_record(kind: u8, programmed: u8, amount: u16, half_hours: u8, index: u64) -> Record {
        let [hi, lo] = amount.to_be_bytes();
        record(
            RecordType::Bolus,
            &[0x01, programmed, 0, hi, lo, 4, 0, half_hours],
            &[0, 0, kind << 5, 14, 16],
            &[],
            at(10, 0, 0),
            index,
        )
    }

    fn boluses(records: &[Record]) -> Vec<Bolus> {
        build_boluses(&context(), records)
            .into_iter()
            .map(|e| match e {
                DraftEvent::Bolus(b) => b,
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    #[test]
    fn normal_bolus_with_cancel() {
        let out = boluses(&[bolus_record(1, 40, 20, 0, 3)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sub_type, BolusSubType::Normal);
        assert_eq!(out[0].normal, Some(0.5));
        assert_eq!(out[0].expected_normal, Some(1.0));
        assert_eq!(out[0].iob, Some(0.1));
    }

    #[test]
    fn cancelled_dual_bolus_scales_duration() {
        let out = boluses(&[bolus_record(5, 20, 1, 1, 3), bolus_record(4, 20, 20, 0, 4)]);
        assert_eq!(out.len(), 1);
        let b = &out[0];
        assert_eq!(b.sub_type, BolusSubType::Dual);
        assert_eq!(b.normal, Some(0.5));
        assert_eq!(b.expected_normal, None);
        assert_eq!(b.extended, Some(0.025));
        assert_eq!(b.expected_extended, Some(0.5));
        assert_eq!(b.duration, Some(90_000));
        assert_eq!(b.expected_duration, Some(HALF_HOUR_MS));
        assert_eq!(b.meta.index, Some(4));
    }

    #[test]
    fn square_without_partner_stays_square() {
        let out = boluses(&[bolus_record(5, 20, 20, 2, 3)]);
        assert_eq!(out[0].sub_type, BolusSubType::Square);
        assert_eq!(out[0].duration, Some(2 * HALF_HOUR_MS));
        assert_eq!(out[0].expected_duration, None);
    }

    #[test]
    fn empty_dual_square_becomes_normal() {
        let out = boluses(&[bolus_record(5, 0, 0, 0, 3), bolus_record(4, 20, 20, 0, 4)]);
        assert_eq!(out[0].sub_type, BolusSubType::Normal);
        assert_eq!(out[0].normal, Some(0.5));
    }

    #[test]
    fn unknown_kind_is_dropped() {
        assert!(boluses(&[bolus_record(7, 20, 20, 0, 3)]).is_empty());
    }
}
