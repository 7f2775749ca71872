//! Record-to-event builders.
//!
//! Each builder filters the decoded record stream for the record types it
//! understands and turns them into [`DraftEvent`]s. Nothing here knows about
//! event ordering across types; that is the simulator's job.

mod alarm;
mod basal;
mod bg;
mod bolus;
mod cgm;
mod settings;
mod suspend;
mod time_change;
mod wizard;

pub use alarm::{build_alarms, build_primes, build_rewinds};
pub use basal::{build_scheduled_basals, build_temp_basals};
pub use bg::build_bg;
pub use bolus::build_boluses;
pub use cgm::build_cgm;
pub use settings::{build_settings, SettingsHistory};
pub use suspend::build_suspend_resumes;
pub use time_change::{build_cgm_time_changes, build_time_changes};
pub use wizard::build_wizards;

use crate::{config::CurrentSettings, decoder::Record};
use chrono::NaiveDateTime;
use medlink_sdk::{DraftEvent, DriverResult, EventMeta, TzoUtil};

/// Everything the builders need besides the records themselves.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub device_id: String,
    pub settings: CurrentSettings,
    /// Offsets for pump records.
    pub tzo: TzoUtil,
    /// Offsets for sensor records, which follow the CGM clock.
    pub cgm_tzo: TzoUtil,
}

impl BuildContext {
    pub fn new(device_id: impl Into<String>, settings: CurrentSettings, tzo: TzoUtil) -> Self {
        Self {
            device_id: device_id.into(),
            settings,
            cgm_tzo: tzo.clone(),
            tzo,
        }
    }

    pub fn with_cgm_tzo(mut self, cgm_tzo: TzoUtil) -> Self {
        self.cgm_tzo = cgm_tzo;
        self
    }

    /// Meta for a pump record, with UTC filled in from its index.
    pub fn meta(&self, record: &Record) -> EventMeta {
        self.meta_at(record.timestamp, record.index)
    }

    pub fn meta_at(&self, device_time: NaiveDateTime, index: u64) -> EventMeta {
        let mut meta = EventMeta::new(device_time, self.device_id.as_str()).with_index(index);
        self.tzo.fill_in(&mut meta);
        meta
    }

    /// Meta for a sensor record.
    pub fn cgm_meta(&self, device_time: NaiveDateTime, index: u64) -> EventMeta {
        let mut meta = EventMeta::new(device_time, self.device_id.as_str()).with_index(index);
        self.cgm_tzo.fill_in(&mut meta);
        meta
    }

    /// Pump strokes to insulin units.
    #[inline]
    pub fn units(&self, strokes: u32) -> f64 {
        strokes as f64 / self.settings.strokes_per_unit
    }
}

/// Round to one decimal, the precision mmol/L values are logged with.
pub(crate) fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Run every pump and sensor builder and collect their drafts in builder
/// order, together with the settings history.
pub fn build_all(
    ctx: &BuildContext,
    records: &[Record],
    cbg: &[crate::decoder::CbgRecord],
) -> DriverResult<(Vec<DraftEvent>, SettingsHistory)> {
    let mut drafts = Vec::new();
    drafts.extend(build_boluses(ctx, records));
    drafts.extend(build_wizards(ctx, records));
    drafts.extend(build_bg(ctx, records)?);
    drafts.extend(build_temp_basals(ctx, records));
    drafts.extend(build_scheduled_basals(ctx, records));
    let history = build_settings(ctx, records)?;
    drafts.extend(history.events.iter().cloned().map(DraftEvent::PumpSettings));
    drafts.extend(build_suspend_resumes(ctx, records)?);
    drafts.extend(build_alarms(ctx, records));
    drafts.extend(build_primes(ctx, records));
    drafts.extend(build_rewinds(ctx, records));
    drafts.extend(build_cgm(ctx, cbg));
    Ok((drafts, history))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::{config::ConfigReplies, decoder::RecordType};
    use bytes::Bytes;
    use chrono::NaiveDate;

    pub fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2016, 11, 14)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    pub fn record(
        record_type: RecordType,
        head: &[u8],
        date: &[u8],
        body: &[u8],
        timestamp: NaiveDateTime,
        index: u64,
    ) -> Record {
        Record {
            record_type,
            head: Bytes::copy_from_slice(head),
            date: Bytes::copy_from_slice(date),
            body: Bytes::copy_from_slice(body),
            timestamp,
            index,
        }
    }

    pub fn context() -> BuildContext {
        let settings = CurrentSettings::assemble("554", "123456", ConfigReplies::default(), at(23, 0, 0));
        BuildContext::new("MedT-554-123456", settings, TzoUtil::fixed(0))
    }
}
