#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use medlink_driver_medtronic::{
    config::{BatteryStatus, CbgPosition, PumpOptions},
    protocol::{
        error::ProtocolError,
        packet::{Opcode, OutboundPacket, PumpIdentity},
        session::{HistoryPage, MedtronicSession, ReadOptions, ReplyMessage, SessionConfig},
    },
};
use medlink_sdk::{
    checksum::crc16_ccitt, BgUnits, CarbUnits, DeltaMarkers, DriverResult, Event, Progress,
    RetryPolicy, ScheduleSegment, SessionInfo, TargetSegment, AmountSegment, UploadTransport,
};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex, Once,
};
use tracing::Level;

pub const SERIAL: &str = "123456";

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_target(false)
            .without_time()
            .try_init();
    });
}

/// Pump date bytes for 2016-11-14 at `hour:minute`; `high` fills the top
/// three bits of the hour byte.
pub fn date(hour: u8, minute: u8, high: u8) -> [u8; 5] {
    [0x80, 0xC0 | minute, (high << 5) | hour, 14, 16]
}

pub fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2016, 11, 14)
        .unwrap()
        .and_hms_opt(h, m, s)
        .unwrap()
}

/// Scheduled basal of `strokes`/40 U/h from the standard profile.
pub fn basal_start(hour: u8, strokes: u8) -> Vec<u8> {
    [&[0x7B, 0x00][..], &date(hour, 0, 0), &[hour * 2, strokes, 0]].concat()
}

/// Normal bolus of `strokes`/40 U, delivered in full.
pub fn normal_bolus(hour: u8, strokes: u8) -> Vec<u8> {
    [&[0x01, strokes, 0, 0, strokes, 0, 0, 0][..], &date(hour, 0, 1)].concat()
}

pub fn rewind(hour: u8) -> Vec<u8> {
    [&[0x21, 0x00][..], &date(hour, 0, 0)].concat()
}

/// Valid 1024 byte history page holding `records`.
pub fn history_page(number: u32, records: &[Vec<u8>]) -> HistoryPage {
    let mut bytes = records.concat();
    bytes.resize(1024, 0);
    let crc = crc16_ccitt(&bytes[..1022], 0xFFFF, 0);
    bytes[1022..].copy_from_slice(&crc.to_be_bytes());
    HistoryPage {
        number,
        bytes,
        valid: true,
        nak: false,
    }
}

fn blank_page(number: u32) -> HistoryPage {
    HistoryPage {
        number,
        bytes: vec![0; 1024],
        valid: false,
        nak: false,
    }
}

/// Pump double answering every configuration read from fixed values and
/// serving `history` as page 0.
pub struct ScriptedPump {
    config: SessionConfig,
    pub model: String,
    pub current_page: u32,
    pub history: Vec<Vec<u8>>,
    pub closed: AtomicBool,
    pub control_bytes: AtomicUsize,
    pub pages_requested: Mutex<Vec<(Opcode, u32)>>,
    pub fetching: AtomicBool,
    /// Whether a control byte went out while bulk fetch rules were on.
    pub control_while_fetching: AtomicBool,
    /// Page reads of this kind stop answering.
    pub failing_op: Mutex<Option<Opcode>>,
}

impl ScriptedPump {
    pub fn new(model: &str, history: Vec<Vec<u8>>) -> Self {
        let identity = PumpIdentity::new(SERIAL).unwrap();
        let policy = RetryPolicy::no_retry();
        Self {
            config: SessionConfig::new(identity, policy, policy),
            model: model.into(),
            current_page: 3,
            history,
            closed: AtomicBool::new(false),
            control_bytes: AtomicUsize::new(0),
            pages_requested: Mutex::new(Vec::new()),
            fetching: AtomicBool::new(false),
            control_while_fetching: AtomicBool::new(false),
            failing_op: Mutex::new(None),
        }
    }
}

#[async_trait]
impl MedtronicSession for ScriptedPump {
    fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn set_fetching_history(&self, fetching: bool) {
        self.fetching.store(fetching, Ordering::SeqCst);
    }

    async fn send(&self, _: OutboundPacket) -> Result<(), ProtocolError> {
        Ok(())
    }

    async fn get_message(&self, _: &mut ReplyMessage, _: ReadOptions) -> Result<(), ProtocolError> {
        Ok(())
    }

    async fn flush(&self) {}

    async fn close(&self) -> Result<(), ProtocolError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn one_record(
        &self,
        _: OutboundPacket,
        _: bool,
        _: bool,
    ) -> Result<ReplyMessage, ProtocolError> {
        self.control_bytes.fetch_add(1, Ordering::SeqCst);
        if self.fetching.load(Ordering::SeqCst) {
            self.control_while_fetching.store(true, Ordering::SeqCst);
        }
        Ok(ReplyMessage::default())
    }

    async fn handshake(&self) -> Result<(), ProtocolError> {
        Ok(())
    }

    async fn read_model(&self) -> Result<String, ProtocolError> {
        Ok(self.model.clone())
    }

    async fn read_profile(&self, op: Opcode) -> Result<Vec<ScheduleSegment>, ProtocolError> {
        let rate = if op == Opcode::ReadProfileStd { 1.0 } else { 0.5 };
        Ok(vec![ScheduleSegment { start: 0, rate }])
    }

    async fn read_bg_targets(
        &self,
    ) -> Result<(Option<BgUnits>, Vec<TargetSegment>), ProtocolError> {
        Ok((Some(BgUnits::MgDl), Vec::new()))
    }

    async fn read_carb_ratios(
        &self,
    ) -> Result<(Option<CarbUnits>, Vec<AmountSegment>), ProtocolError> {
        Ok((Some(CarbUnits::Grams), Vec::new()))
    }

    async fn read_wizard_enabled(&self) -> Result<bool, ProtocolError> {
        Ok(false)
    }

    async fn read_insulin_sensitivities(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(vec![1])
    }

    async fn read_settings(&self) -> Result<PumpOptions, ProtocolError> {
        Ok(PumpOptions::parse(&[0; 20]))
    }

    async fn write_cbg_timestamp(&self) -> Result<bool, ProtocolError> {
        Ok(true)
    }

    async fn read_current_page(&self) -> Result<u32, ProtocolError> {
        Ok(self.current_page)
    }

    async fn read_current_cbg_page(&self) -> Result<CbgPosition, ProtocolError> {
        Ok(CbgPosition {
            cbg: 10,
            glucose: 1,
            isig: 1,
        })
    }

    async fn read_rtc(&self) -> Result<Option<NaiveDateTime>, ProtocolError> {
        Ok(Some(at(23, 0, 0)))
    }

    async fn read_battery(&self) -> Result<BatteryStatus, ProtocolError> {
        Ok(BatteryStatus {
            low: false,
            voltage: 1.4,
        })
    }

    async fn read_history_pages(
        &self,
        op: Opcode,
        count: u32,
        _: Option<u32>,
        on_page: &(dyn Fn(u32) + Send + Sync),
    ) -> Result<Vec<HistoryPage>, ProtocolError> {
        self.pages_requested.lock().unwrap().push((op, count));
        if *self.failing_op.lock().unwrap() == Some(op) {
            return Err(ProtocolError::communication());
        }
        let pages = (0..count)
            .map(|n| {
                if op == Opcode::ReadHistory && n == 0 {
                    history_page(n, &self.history)
                } else {
                    blank_page(n)
                }
            })
            .inspect(|p| on_page(p.number + 1))
            .collect();
        Ok(pages)
    }

    async fn retry_invalid_pages(
        &self,
        _: Opcode,
        pages: Vec<HistoryPage>,
    ) -> Result<Vec<HistoryPage>, ProtocolError> {
        Ok(pages)
    }
}

/// Upload transport that keeps what it was given.
#[derive(Default)]
pub struct RecordingUpload {
    pub previous: Option<DeltaMarkers>,
    pub submitted: Mutex<Option<(Vec<Event>, SessionInfo, String)>>,
}

#[async_trait]
impl UploadTransport for RecordingUpload {
    async fn most_recent_upload(&self, _: &str, _: &str) -> DriverResult<Option<DeltaMarkers>> {
        Ok(self.previous)
    }

    async fn submit(
        &self,
        records: &[Event],
        session: &SessionInfo,
        _: &Progress,
        _: &str,
        namespace: &str,
    ) -> DriverResult<()> {
        *self.submitted.lock().unwrap() =
            Some((records.to_vec(), session.clone(), namespace.to_string()));
        Ok(())
    }
}

pub fn pump(model: &str, history: Vec<Vec<u8>>) -> Arc<ScriptedPump> {
    Arc::new(ScriptedPump::new(model, history))
}
