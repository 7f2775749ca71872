use crate::{
    builders::{build_all, build_cgm_time_changes, build_time_changes, BuildContext},
    config::{BatteryStatus, ConfigReplies, CurrentSettings, PagePlan, PROFILES},
    decoder::{decode_cbg_pages, decode_pages, CbgRecord},
    protocol::{
        error::ProtocolError,
        packet::{ascii, ControlPacket, Opcode, PumpIdentity, SUPPORTED_MODELS},
        session::{HistoryPage, MedtronicSession, SessionConfig},
    },
    simulator::{MedtronicSimulator, SimulatorConfig},
    supervisor::open_link,
};
use async_trait::async_trait;
use chrono::{Datelike, Duration as ChronoDuration, Utc};
use medlink_sdk::{
    DeviceDriver, DeviceEvent, DraftEvent, DriverError, DriverResult, Event, EventMeta,
    Progress, PumpSettings, RetryPolicy, SessionInfo, Stage, TzoUtil, UploadTransport, UPLOAD_NAMESPACE,
};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub const DRIVER_NAME: &str = "medtronic";

const MANUFACTURER: &str = "Medtronic";
const DEVICE_TAG: &str = "insulin-pump";
const DEVICE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const NO_MODEL: &str =
    "Have you entered the correct serial number and is there enough battery power left?";

/// Static parameters of one upload session.
#[derive(Debug, Clone)]
pub struct MedtronicConfig {
    /// Serial port or hidraw node of the link.
    pub device_path: String,
    pub serial_number: String,
    pub group_id: String,
    /// Minutes east of UTC.
    pub timezone_offset: i32,
    pub tz_name: String,
    /// Uploader version reported with the session.
    pub version: String,
    pub point_policy: RetryPolicy,
    pub history_policy: RetryPolicy,
}

impl MedtronicConfig {
    pub fn new(device_path: impl Into<String>, serial_number: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            serial_number: serial_number.into(),
            group_id: String::new(),
            timezone_offset: 0,
            tz_name: "UTC".into(),
            version: format!("medlink-{}", env!("CARGO_PKG_VERSION")),
            point_policy: RetryPolicy::default(),
            history_policy: RetryPolicy::history(),
        }
    }
}

/// State handed from stage to stage.
pub struct MedtronicContext {
    pub config: MedtronicConfig,
    session_config: Option<SessionConfig>,
    session: Option<Arc<dyn MedtronicSession>>,
    pub device_id: String,
    pub model: String,
    pub settings: Option<CurrentSettings>,
    pub plan: Option<PagePlan>,
    pub battery: Option<BatteryStatus>,
    pub pages: Vec<HistoryPage>,
    pub cbg_pages: Vec<HistoryPage>,
    pub isig_pages: Vec<HistoryPage>,
    /// Pump clock and timezone processing of the decoded history.
    pub tzo: Option<TzoUtil>,
    pub events: Vec<Event>,
}

impl MedtronicContext {
    pub fn new(config: MedtronicConfig) -> Self {
        Self {
            config,
            session_config: None,
            session: None,
            device_id: String::new(),
            model: String::new(),
            settings: None,
            plan: None,
            battery: None,
            pages: Vec::new(),
            cbg_pages: Vec::new(),
            isig_pages: Vec::new(),
            tzo: None,
            events: Vec::new(),
        }
    }

    /// Use an already opened link instead of opening `device_path`.
    pub fn with_session(mut self, session: Arc<dyn MedtronicSession>) -> Self {
        self.session = Some(session);
        self
    }

    fn session(&self) -> DriverResult<Arc<dyn MedtronicSession>> {
        self.session
            .clone()
            .ok_or_else(|| DriverError::SessionError("link is not open".into()))
    }

    fn settings(&self) -> DriverResult<&CurrentSettings> {
        self.settings
            .as_ref()
            .ok_or_else(|| DriverError::ExecutionError("pump settings were not read".into()))
    }
}

/// Medtronic Paradigm pump driver.
pub struct MedtronicDriver {
    upload: Arc<dyn UploadTransport>,
}

impl MedtronicDriver {
    pub fn new(upload: Arc<dyn UploadTransport>) -> Self {
        Self { upload }
    }
}

/// Pages read so far over the whole fetch, as a percentage.
fn fetch_percent(done: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done as u64 * 100) / total as u64).min(100) as u8
}

/// History, CBG and ISIG pages named by `plan`, invalid pages re-read once.
async fn fetch_pages(
    session: &dyn MedtronicSession,
    plan: &PagePlan,
    progress: &Progress,
) -> Result<(Vec<HistoryPage>, Vec<HistoryPage>, Vec<HistoryPage>), ProtocolError> {
    let total = plan.history_pages + plan.glucose_pages + plan.isig_pages;
    let report = |offset: u32| {
        let progress = progress.clone();
        move |done: u32| progress.report(Stage::FetchData, fetch_percent(offset + done, total))
    };

    let pages = session
        .read_history_pages(Opcode::ReadHistory, plan.history_pages, None, &report(0))
        .await?;
    let history = session.retry_invalid_pages(Opcode::ReadHistory, pages).await?;

    let done = plan.history_pages;
    let pages = session
        .read_history_pages(
            Opcode::ReadCbgHistory,
            plan.glucose_pages,
            Some(plan.cbg_current_page),
            &report(done),
        )
        .await?;
    let cbg = session.retry_invalid_pages(Opcode::ReadCbgHistory, pages).await?;

    let done = done + plan.glucose_pages;
    let pages = session
        .read_history_pages(
            Opcode::ReadIsigHistory,
            plan.isig_pages,
            Some(plan.cbg_current_page),
            &report(done),
        )
        .await?;
    let isig = session.retry_invalid_pages(Opcode::ReadIsigHistory, pages).await?;

    Ok((history, cbg, isig))
}

/// Decode, rebuild and simulate the fetched history.
pub fn process_history(
    ctx: &MedtronicContext,
    settings: &CurrentSettings,
) -> DriverResult<(TzoUtil, Vec<Event>)> {
    let records = decode_pages(&ctx.pages, &settings.model_number);
    let cbg = decode_cbg_pages(&ctx.cbg_pages, &ctx.isig_pages);
    debug!(records = records.len(), cbg = cbg.len(), "decoded history");

    let Some(last) = records.last() else {
        return Err(DriverError::NoRecords("No records found on pump".into()));
    };

    let offset = ctx.config.timezone_offset;
    let current_year = settings.current_device_time.year();
    let most_recent = TzoUtil::fixed(offset).apply_timezone(last.timestamp);
    let (tzo, pump_changes) =
        build_time_changes(&records, &ctx.device_id, offset, most_recent, current_year)?;

    let (cgm_tzo, cgm_changes) = cgm_clock(&cbg, ctx, &tzo, current_year)?;

    let build_ctx =
        BuildContext::new(ctx.device_id.as_str(), settings.clone(), tzo.clone()).with_cgm_tzo(cgm_tzo);
    let (mut drafts, history) = build_all(&build_ctx, &records, &cbg)?;
    drafts.extend(pump_changes.into_iter().map(DraftEvent::DeviceEvent));
    drafts.extend(cgm_changes.into_iter().map(DraftEvent::DeviceEvent));

    drafts.sort_by_key(|d| d.index().unwrap_or(u64::MAX));
    if let Some(first) = drafts.first() {
        let mut meta = EventMeta::new(first.meta().device_time, ctx.device_id.as_str());
        meta.index = first.index();
        meta.take_clock_from(first.meta());
        drafts.insert(0, DraftEvent::PumpSettings(PumpSettings::new(meta, history.initial)));
    }
    drafts.sort_by_key(|d| d.time());

    let simulator = MedtronicSimulator::new(SimulatorConfig {
        manufacturers: vec![MANUFACTURER.into()],
        model: settings.model_number.clone(),
        serial_number: settings.serial_number.clone(),
        tzo: tzo.clone(),
    });
    let events = simulator.run(drafts)?;
    Ok((tzo, events))
}

/// Sensor clock offsets. Without dated sensor records the pump clock applies.
fn cgm_clock(
    cbg: &[CbgRecord],
    ctx: &MedtronicContext,
    tzo: &TzoUtil,
    current_year: i32,
) -> DriverResult<(TzoUtil, Vec<DeviceEvent>)> {
    match cbg.iter().rev().find_map(|r| r.timestamp) {
        Some(latest) => build_cgm_time_changes(
            cbg,
            &ctx.device_id,
            ctx.config.timezone_offset,
            tzo.apply_timezone(latest),
            current_year,
        ),
        None => Ok((tzo.clone(), Vec::new())),
    }
}

#[async_trait]
impl DeviceDriver for MedtronicDriver {
    type Context = MedtronicContext;

    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    async fn detect(&mut self, ctx: &mut MedtronicContext, _: &Progress) -> DriverResult<()> {
        debug!(device_path = %ctx.config.device_path, "detect is a no-op for the link");
        Ok(())
    }

    async fn setup(&mut self, ctx: &mut MedtronicContext, _: &Progress) -> DriverResult<()> {
        let identity = PumpIdentity::new(&ctx.config.serial_number)
            .map_err(|e| DriverError::ConfigurationError(e.to_string()))?;
        ctx.session_config = Some(SessionConfig::new(
            identity,
            ctx.config.point_policy,
            ctx.config.history_policy,
        ));
        Ok(())
    }

    #[instrument(level = "info", skip_all, fields(device_path = %ctx.config.device_path))]
    async fn connect(&mut self, ctx: &mut MedtronicContext, _: &Progress) -> DriverResult<()> {
        if ctx.session.is_none() {
            let config = ctx
                .session_config
                .clone()
                .ok_or_else(|| DriverError::ConfigurationError("setup did not run".into()))?;
            ctx.session = Some(open_link(&ctx.config.device_path, config).await?);
        }
        ctx.session()?.handshake().await?;
        info!("connected to pump");
        Ok(())
    }

    #[instrument(level = "info", skip_all)]
    async fn get_config_info(
        &mut self,
        ctx: &mut MedtronicContext,
        progress: &Progress,
    ) -> DriverResult<()> {
        let session = ctx.session()?;

        let model = session.read_model().await?;
        if model.is_empty() {
            return Err(DriverError::ValidationError(NO_MODEL.into()));
        }
        if !SUPPORTED_MODELS.contains(&model.as_str()) {
            return Err(ProtocolError::unsupported_model(&model).into());
        }
        ctx.device_id = format!("MedT-{}-{}", model, ctx.config.serial_number);
        ctx.model = model;
        info!(model = %ctx.model, device_id = %ctx.device_id, "pump identified");
        progress.report(Stage::GetConfigInfo, 10);

        let last_upload = self
            .upload
            .most_recent_upload(&ctx.config.group_id, &ctx.device_id)
            .await?;
        if let Some(markers) = &last_upload {
            debug!(?markers, "continuing from previous upload");
        }

        let mut replies = ConfigReplies::default();
        let profile_ops = [Opcode::ReadProfileStd, Opcode::ReadProfileA, Opcode::ReadProfileB];
        for (name, op) in PROFILES.iter().zip(profile_ops) {
            replies
                .profiles
                .insert((*name).to_string(), session.read_profile(op).await?);
        }
        progress.report(Stage::GetConfigInfo, 40);

        (replies.bg_units, replies.bg_targets) = session.read_bg_targets().await?;
        (replies.carb_units, replies.carb_ratios) = session.read_carb_ratios().await?;
        replies.wizard_enabled = session.read_wizard_enabled().await?;
        replies.insulin_sensitivities = session.read_insulin_sensitivities().await?;
        replies.options = Some(session.read_settings().await?);
        progress.report(Stage::GetConfigInfo, 70);

        if !session.write_cbg_timestamp().await? {
            warn!("pump did not acknowledge the CBG timestamp write");
        }
        let current_page = session.read_current_page().await?;
        let cbg_position = session.read_current_cbg_page().await?;
        let current_device_time = match session.read_rtc().await? {
            Some(dt) => dt,
            None => {
                warn!("pump clock unreadable, using host clock");
                Utc::now().naive_utc()
                    + ChronoDuration::minutes(ctx.config.timezone_offset as i64)
            }
        };
        let battery = session.read_battery().await?;
        debug!(status = battery.status(), voltage = battery.voltage, "battery");
        ctx.battery = Some(battery);

        let plan = PagePlan::new(current_page, cbg_position, last_upload.as_ref());
        info!(
            current_page,
            history_pages = plan.history_pages,
            glucose_pages = plan.glucose_pages,
            isig_pages = plan.isig_pages,
            first_upload = plan.first_upload,
            "page plan"
        );
        ctx.plan = Some(plan);
        ctx.settings = Some(CurrentSettings::assemble(
            &ctx.model,
            &ctx.config.serial_number,
            replies,
            current_device_time,
        ));
        Ok(())
    }

    #[instrument(level = "info", skip_all)]
    async fn fetch_data(&mut self, ctx: &mut MedtronicContext, progress: &Progress) -> DriverResult<()> {
        let session = ctx.session()?;
        let plan = ctx
            .plan
            .ok_or_else(|| DriverError::ExecutionError("page plan missing".into()))?;

        session.set_fetching_history(true);
        let fetched = fetch_pages(session.as_ref(), &plan, progress).await;
        session.set_fetching_history(false);
        let (pages, cbg_pages, isig_pages) = fetched?;

        ctx.pages = pages;
        ctx.cbg_pages = cbg_pages;
        ctx.isig_pages = isig_pages;
        info!(
            history = ctx.pages.len(),
            cbg = ctx.cbg_pages.len(),
            isig = ctx.isig_pages.len(),
            invalid = ctx.pages.iter().filter(|p| !p.valid).count(),
            "pages fetched"
        );
        Ok(())
    }

    #[instrument(level = "info", skip_all)]
    async fn process_data(&mut self, ctx: &mut MedtronicContext, progress: &Progress) -> DriverResult<()> {
        let settings = ctx.settings()?.clone();
        let (tzo, events) = process_history(ctx, &settings)?;
        progress.report(Stage::ProcessData, 80);
        info!(
            events = events.len(),
            processing = tzo.processing().as_str(),
            "history processed"
        );
        ctx.tzo = Some(tzo);
        ctx.events = events;
        Ok(())
    }

    #[instrument(level = "info", skip_all)]
    async fn upload_data(&mut self, ctx: &mut MedtronicContext, progress: &Progress) -> DriverResult<()> {
        let settings = ctx.settings()?;
        let tzo = ctx
            .tzo
            .clone()
            .unwrap_or_else(|| TzoUtil::fixed(ctx.config.timezone_offset));
        let session = SessionInfo {
            delta: ctx.plan.map(|p| p.delta).unwrap_or_default(),
            device_tags: vec![DEVICE_TAG.into()],
            device_manufacturers: vec![MANUFACTURER.into()],
            device_model: settings.model_number.clone(),
            device_serial_number: settings.serial_number.clone(),
            device_id: ctx.device_id.clone(),
            device_time: settings
                .current_device_time
                .format(DEVICE_TIME_FORMAT)
                .to_string(),
            start: Utc::now().to_rfc3339(),
            time_processing: tzo.processing(),
            tz_name: ctx.config.tz_name.clone(),
            version: ctx.config.version.clone(),
            blob_id: None,
        };

        self.upload
            .submit(
                &ctx.events,
                &session,
                progress,
                &ctx.config.group_id,
                UPLOAD_NAMESPACE,
            )
            .await?;
        info!(records = ctx.events.len(), "upload submitted");
        Ok(())
    }

    async fn disconnect(&mut self, _: &mut MedtronicContext, progress: &Progress) -> DriverResult<()> {
        progress.report(Stage::Disconnect, 100);
        Ok(())
    }

    async fn cleanup(&mut self, ctx: &mut MedtronicContext, _: &Progress) -> DriverResult<()> {
        let Some(session) = ctx.session.take() else {
            return Ok(());
        };
        // take the link out of remote command mode
        if let Err(e) = session
            .one_record(ControlPacket::byte(ascii::EOT).into(), true, false)
            .await
        {
            debug!(error = %e, "EOT on cleanup failed");
        }
        session.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::fixtures::at;
    use medlink_sdk::DeltaMarkers;

    fn context() -> MedtronicContext {
        let mut ctx = MedtronicContext::new(MedtronicConfig::new("/dev/null", "123456"));
        ctx.device_id = "MedT-554-123456".into();
        ctx.model = "554".into();
        ctx.settings = Some(CurrentSettings::assemble(
            "554",
            "123456",
            ConfigReplies::default(),
            at(23, 0, 0),
        ));
        ctx
    }

    #[test]
    fn empty_history_has_no_records() {
        let ctx = context();
        let settings = ctx.settings().unwrap().clone();
        let err = process_history(&ctx, &settings).unwrap_err();
        assert_eq!(err.code(), "E_NO_RECORDS");
        assert_eq!(err.to_string(), "No records found on pump");
    }

    #[test]
    fn fetch_percent_is_bounded() {
        assert_eq!(fetch_percent(0, 0), 0);
        assert_eq!(fetch_percent(5, 10), 50);
        assert_eq!(fetch_percent(12, 10), 100);
    }

    #[tokio::test]
    async fn setup_rejects_bad_serial() {
        let mut driver = MedtronicDriver::new(Arc::new(NullUpload));
        let mut ctx = MedtronicContext::new(MedtronicConfig::new("/dev/null", "12"));
        let err = driver.setup(&mut ctx, &Progress::noop()).await.unwrap_err();
        assert_eq!(err.code(), "E_CONFIG");
    }

    #[tokio::test]
    async fn cleanup_without_link_is_a_no_op() {
        let mut driver = MedtronicDriver::new(Arc::new(NullUpload));
        let mut ctx = context();
        driver.cleanup(&mut ctx, &Progress::noop()).await.unwrap();
    }

    struct NullUpload;

    #[async_trait]
    impl UploadTransport for NullUpload {
        async fn most_recent_upload(&self, _: &str, _: &str) -> DriverResult<Option<DeltaMarkers>> {
            Ok(None)
        }

        async fn submit(
            &self,
            _: &[Event],
            _: &SessionInfo,
            _: &Progress,
            _: &str,
            _: &str,
        ) -> DriverResult<()> {
            Ok(())
        }
    }
}
