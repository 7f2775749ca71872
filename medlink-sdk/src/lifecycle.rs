//! Nine-stage device session lifecycle.

use crate::DriverResult;
use async_trait::async_trait;
use std::{fmt, sync::Arc};
use tracing::{debug, error, info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Detect,
    Setup,
    Connect,
    GetConfigInfo,
    FetchData,
    ProcessData,
    UploadData,
    Disconnect,
    Cleanup,
}

impl Stage {
    /// Stages run by [`run_lifecycle`], in order. `Cleanup` always runs last.
    pub const PIPELINE: [Stage; 8] = [
        Stage::Detect,
        Stage::Setup,
        Stage::Connect,
        Stage::GetConfigInfo,
        Stage::FetchData,
        Stage::ProcessData,
        Stage::UploadData,
        Stage::Disconnect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Detect => "detect",
            Stage::Setup => "setup",
            Stage::Connect => "connect",
            Stage::GetConfigInfo => "getConfigInfo",
            Stage::FetchData => "fetchData",
            Stage::ProcessData => "processData",
            Stage::UploadData => "uploadData",
            Stage::Disconnect => "disconnect",
            Stage::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-stage progress sink, reporting a percentage in `0..=100`.
#[derive(Clone)]
pub struct Progress(Arc<dyn Fn(Stage, u8) + Send + Sync>);

impl Progress {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Stage, u8) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn noop() -> Self {
        Self::new(|_, _| {})
    }

    #[inline]
    pub fn report(&self, stage: Stage, percent: u8) {
        (self.0)(stage, percent.min(100))
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Progress")
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::noop()
    }
}

/// A device driver, driven through the fixed stage sequence.
///
/// Each stage receives the session context mutably; after it returns the
/// context is handed to the next stage whether or not the stage failed,
/// so `cleanup` always sees what the failed stage left behind.
#[async_trait]
pub trait DeviceDriver: Send {
    type Context: Send;

    /// Driver identifier, used in device ids and logs.
    fn name(&self) -> &'static str;

    /// Probe for the device without reading any history.
    async fn detect(&mut self, ctx: &mut Self::Context, progress: &Progress) -> DriverResult<()>;

    async fn setup(&mut self, ctx: &mut Self::Context, progress: &Progress) -> DriverResult<()>;

    /// Open the link and complete the handshake.
    async fn connect(&mut self, ctx: &mut Self::Context, progress: &Progress) -> DriverResult<()>;

    /// Read model, serial, settings and page counters.
    async fn get_config_info(
        &mut self,
        ctx: &mut Self::Context,
        progress: &Progress,
    ) -> DriverResult<()>;

    /// Transfer raw history.
    async fn fetch_data(&mut self, ctx: &mut Self::Context, progress: &Progress)
        -> DriverResult<()>;

    /// Decode, build and simulate the final event stream.
    async fn process_data(
        &mut self,
        ctx: &mut Self::Context,
        progress: &Progress,
    ) -> DriverResult<()>;

    /// Hand the final events to the upload transport.
    async fn upload_data(
        &mut self,
        ctx: &mut Self::Context,
        progress: &Progress,
    ) -> DriverResult<()>;

    async fn disconnect(
        &mut self,
        ctx: &mut Self::Context,
        progress: &Progress,
    ) -> DriverResult<()>;

    /// Release the link. Runs after every session, failed or not.
    async fn cleanup(&mut self, ctx: &mut Self::Context, progress: &Progress) -> DriverResult<()>;
}

async fn run_stage<D: DeviceDriver>(
    driver: &mut D,
    stage: Stage,
    ctx: &mut D::Context,
    progress: &Progress,
) -> DriverResult<()> {
    match stage {
        Stage::Detect => driver.detect(ctx, progress).await,
        Stage::Setup => driver.setup(ctx, progress).await,
        Stage::Connect => driver.connect(ctx, progress).await,
        Stage::GetConfigInfo => driver.get_config_info(ctx, progress).await,
        Stage::FetchData => driver.fetch_data(ctx, progress).await,
        Stage::ProcessData => driver.process_data(ctx, progress).await,
        Stage::UploadData => driver.upload_data(ctx, progress).await,
        Stage::Disconnect => driver.disconnect(ctx, progress).await,
        Stage::Cleanup => driver.cleanup(ctx, progress).await,
    }
}

/// Run every stage in order, stopping at the first failure. Cleanup runs
/// regardless; a stage error takes precedence over a cleanup error.
#[instrument(level = "info", skip_all, fields(driver = driver.name()))]
pub async fn run_lifecycle<D: DeviceDriver>(
    driver: &mut D,
    ctx: &mut D::Context,
    progress: &Progress,
) -> DriverResult<()> {
    let mut outcome = Ok(());
    for stage in Stage::PIPELINE {
        debug!(%stage, "stage starting");
        progress.report(stage, 0);
        if let Err(e) = run_stage(driver, stage, ctx, progress).await {
            error!(%stage, code = e.code(), error = %e, "stage failed");
            outcome = Err(e);
            break;
        }
        progress.report(stage, 100);
    }

    progress.report(Stage::Cleanup, 0);
    let cleanup = driver.cleanup(ctx, progress).await;
    progress.report(Stage::Cleanup, 100);

    match (outcome, cleanup) {
        (Err(e), _) => Err(e),
        (Ok(()), Err(e)) => {
            error!(code = e.code(), error = %e, "cleanup failed");
            Err(e)
        }
        (Ok(()), Ok(())) => {
            info!("session complete");
            Ok(())
        }
    }
}
