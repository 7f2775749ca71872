use super::{round1, BuildContext};
use crate::decoder::{filter_records, Record, RecordType};
use medlink_sdk::{
    BgUnits, CarbUnits, DraftEvent, DraftWizard, Recommended, TargetRange, WizardInputs,
};

/// Sign-extend a 13-bit value.
fn twos13(v: u32) -> i32 {
    if v & 0x1000 != 0 {
        v as i32 - 0x2000
    } else {
        v as i32
    }
}

fn inputs(ctx: &BuildContext, record: &Record) -> WizardInputs {
    let head = |i| record.head_byte(i) as u32;
    let date = |i| record.date_byte(i) as u32;
    let body = |i| record.body_byte(i) as u32;

    let mut bg_input = (((body(1) & 0x03) << 8) | head(1)) as f64;
    let carb_input = ((((body(1) >> 2) & 0x01) << 8) | body(0)) as f64;
    let insulin_carb_ratio =
        ((((body(9) >> 1) & 0x03) << 16) | (body(2) << 8) | body(3)) as f64 / 10.0;
    let mut low = body(5) as f64;
    let mut high = body(14) as f64;
    let mut sensitivity = ((((date(2) >> 6) & 0x03) << 8) | body(4)) as f64;

    let recommended = Recommended {
        carb: ctx.units(((body(9) & 0x01) << 16) | (body(7) << 8) | body(8)),
        correction: twos13((((body(9) >> 3) & 0x1F) << 8) | body(6)) as f64
            / ctx.settings.strokes_per_unit,
        net: ctx.units((((body(1) >> 3) & 0x01) << 16) | (body(12) << 8) | body(13)),
    };

    let units = if (body(1) >> 6) & 0x03 == 2 {
        BgUnits::MmolL
    } else {
        BgUnits::MgDl
    };
    let carb_units = if (body(1) >> 4) & 0x03 == 2 {
        CarbUnits::Exchanges
    } else {
        CarbUnits::Grams
    };

    if units == BgUnits::MmolL {
        low = round1(low / 10.0);
        high = round1(high / 10.0);
        sensitivity = round1(sensitivity / 10.0);
        bg_input = round1(bg_input / 10.0);
    }

    WizardInputs {
        recommended,
        carb_input,
        bg_input: (bg_input > 0.0).then_some(bg_input),
        insulin_carb_ratio,
        insulin_sensitivity: sensitivity,
        bg_target: TargetRange { low, high },
        units,
        carb_units,
        insulin_on_board: None,
    }
}

pub fn build_wizards(ctx: &BuildContext, records: &[Record]) -> Vec<DraftEvent> {
    filter_records(records, &[RecordType::BolusWizard])
        .into_iter()
        .map(|record| DraftEvent::Wizard(DraftWizard::new(ctx.meta(record), inputs(ctx, record))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::fixtures::{at, context, record};

    fn wizard(head1: u8, date2: u8, body: [u8; 15]) -> DraftWizard {
        let rec = record(
            RecordType::BolusWizard,
            &[0x5B, head1],
            &[0, 0, date2, 14, 16],
            &body,
            at(8, 0, 0),
            12,
        );
        match build_wizards(&context(), &[rec]).pop() {
            Some(DraftEvent::Wizard(w)) => w,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn mg_dl_wizard() {
        // bg 120, 45 g carbs, ratio 15.0, isf 50, target 100-120,
        // carb 3.0 U, correction 0.4 U, net 3.4 U
        let body = [45, 0x50, 0, 150, 50, 100, 16, 0, 120, 0, 0, 0, 0, 136, 120];
        let w = wizard(120, 0, body);
        let inputs = &w.inputs;
        assert_eq!(inputs.units, BgUnits::MgDl);
        assert_eq!(inputs.carb_units, CarbUnits::Grams);
        assert_eq!(inputs.bg_input, Some(120.0));
        assert_eq!(inputs.carb_input, 45.0);
        assert_eq!(inputs.insulin_carb_ratio, 15.0);
        assert_eq!(inputs.insulin_sensitivity, 50.0);
        assert_eq!(inputs.bg_target, TargetRange { low: 100.0, high: 120.0 });
        assert_eq!(inputs.recommended.carb, 3.0);
        assert_eq!(inputs.recommended.correction, 0.4);
        assert_eq!(inputs.recommended.net, 3.4);
        assert_eq!(w.meta.index, Some(12));
    }

    #[test]
    fn mmol_wizard_scales_and_negative_correction() {
        // units bits 0b10 in the top of body[1]; correction -0.5 U = -20 strokes
        let correction = (0x2000 - 20) as u32;
        let body9 = ((correction >> 8) as u8 & 0x1F) << 3;
        let body = [0, 0x80, 0, 100, 25, 55, correction as u8, 0, 0, body9, 0, 0, 0, 0, 70];
        let w = wizard(0, 0, body);
        let inputs = &w.inputs;
        assert_eq!(inputs.units, BgUnits::MmolL);
        assert_eq!(inputs.bg_input, None);
        assert_eq!(inputs.bg_target, TargetRange { low: 5.5, high: 7.0 });
        assert_eq!(inputs.insulin_sensitivity, 2.5);
        assert_eq!(inputs.recommended.correction, -0.5);
    }

    #[test]
    fn exchanges_flag() {
        let body = [2, 0x20, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(wizard(0, 0, body).inputs.carb_units, CarbUnits::Exchanges);
    }
}
