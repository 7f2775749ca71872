use crate::{
    parser::{build_events, MeterRecord},
    protocol::session::{MeterIdentity, PogoSession},
    supervisor::open_port,
};
use async_trait::async_trait;
use chrono::Utc;
use medlink_sdk::{
    DeltaMarkers, DeviceDriver, DriverError, DriverResult, Event, Progress, SessionInfo, Stage,
    TzoUtil, UploadTransport, UPLOAD_NAMESPACE,
};
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub const DRIVER_NAME: &str = "pogo";

/// Prefix of the device id.
const DRIVER_ID: &str = "POGO";
const MANUFACTURER: &str = "Intuity";
const MODEL: &str = "POGO";
const DEVICE_TAG: &str = "bgm";
const DEVICE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone)]
pub struct PogoConfig {
    pub port: String,
    pub baud_rate: u32,
    pub group_id: String,
    /// Minutes east of UTC.
    pub timezone_offset: i32,
    pub tz_name: String,
    pub version: String,
}

impl PogoConfig {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            group_id: String::new(),
            timezone_offset: 0,
            tz_name: "UTC".into(),
            version: format!("medlink-{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

pub struct PogoContext {
    pub config: PogoConfig,
    session: Option<Arc<dyn PogoSession>>,
    pub identity: Option<MeterIdentity>,
    pub device_id: String,
    pub records: Vec<MeterRecord>,
    pub tzo: Option<TzoUtil>,
    pub events: Vec<Event>,
}

impl PogoContext {
    pub fn new(config: PogoConfig) -> Self {
        Self {
            config,
            session: None,
            identity: None,
            device_id: String::new(),
            records: Vec::new(),
            tzo: None,
            events: Vec::new(),
        }
    }

    /// Use an already opened link instead of opening `port`.
    pub fn with_session(mut self, session: Arc<dyn PogoSession>) -> Self {
        self.session = Some(session);
        self
    }

    fn session(&self) -> DriverResult<Arc<dyn PogoSession>> {
        self.session
            .clone()
            .ok_or_else(|| DriverError::SessionError("serial port is not open".into()))
    }
}

/// Intuity POGO meter driver.
pub struct PogoDriver {
    upload: Arc<dyn UploadTransport>,
}

impl PogoDriver {
    pub fn new(upload: Arc<dyn UploadTransport>) -> Self {
        Self { upload }
    }
}

#[async_trait]
impl DeviceDriver for PogoDriver {
    type Context = PogoContext;

    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    async fn detect(&mut self, ctx: &mut PogoContext, _: &Progress) -> DriverResult<()> {
        debug!(port = %ctx.config.port, "no detect needed");
        Ok(())
    }

    async fn setup(&mut self, _: &mut PogoContext, progress: &Progress) -> DriverResult<()> {
        progress.report(Stage::Setup, 100);
        Ok(())
    }

    async fn connect(&mut self, ctx: &mut PogoContext, _: &Progress) -> DriverResult<()> {
        if ctx.session.is_none() {
            ctx.session = Some(open_port(&ctx.config.port, ctx.config.baud_rate)?);
        }
        Ok(())
    }

    #[instrument(level = "info", skip_all)]
    async fn get_config_info(&mut self, ctx: &mut PogoContext, _: &Progress) -> DriverResult<()> {
        let identity = ctx.session()?.read_identity().await?;
        ctx.device_id = format!("{DRIVER_ID}-{}", identity.serial_number);
        info!(
            device_id = %ctx.device_id,
            software_version = %identity.software_version,
            "meter identified"
        );
        ctx.identity = Some(identity);
        Ok(())
    }

    #[instrument(level = "info", skip_all)]
    async fn fetch_data(&mut self, ctx: &mut PogoContext, progress: &Progress) -> DriverResult<()> {
        let session = ctx.session()?;
        let count = session.read_record_count().await?;

        let mut records = Vec::with_capacity(count as usize);
        for i in 0..count {
            let record = MeterRecord::parse(&session.read_record(i).await?)?;
            debug!(?record, "record");
            records.push(record);
            progress.report(Stage::FetchData, ((i + 1) * 100 / count) as u8);
        }
        info!(records = records.len(), "records fetched");
        ctx.records = records;
        Ok(())
    }

    #[instrument(level = "info", skip_all)]
    async fn process_data(&mut self, ctx: &mut PogoContext, _: &Progress) -> DriverResult<()> {
        let (tzo, events) = build_events(&ctx.records, &ctx.device_id, ctx.config.timezone_offset)?;
        info!(events = events.len(), "records processed");
        ctx.tzo = Some(tzo);
        ctx.events = events;
        Ok(())
    }

    #[instrument(level = "info", skip_all)]
    async fn upload_data(&mut self, ctx: &mut PogoContext, progress: &Progress) -> DriverResult<()> {
        let identity = ctx
            .identity
            .as_ref()
            .ok_or_else(|| DriverError::ExecutionError("meter identity was not read".into()))?;
        let device_time = ctx
            .records
            .iter()
            .map(|r| r.device_time)
            .max()
            .map(|t| t.format(DEVICE_TIME_FORMAT).to_string())
            .unwrap_or_default();
        let session = SessionInfo {
            delta: DeltaMarkers::default(),
            device_tags: vec![DEVICE_TAG.into()],
            device_manufacturers: vec![MANUFACTURER.into()],
            device_model: MODEL.into(),
            device_serial_number: identity.serial_number.clone(),
            device_id: ctx.device_id.clone(),
            device_time,
            start: Utc::now().to_rfc3339(),
            time_processing: ctx
                .tzo
                .as_ref()
                .map(TzoUtil::processing)
                .unwrap_or_else(|| TzoUtil::fixed(ctx.config.timezone_offset).processing()),
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

    async fn disconnect(&mut self, _: &mut PogoContext, progress: &Progress) -> DriverResult<()> {
        progress.report(Stage::Disconnect, 100);
        Ok(())
    }

    async fn cleanup(&mut self, ctx: &mut PogoContext, _: &Progress) -> DriverResult<()> {
        if let Some(session) = ctx.session.take() {
            session.close().await?;
        }
        Ok(())
    }
}
