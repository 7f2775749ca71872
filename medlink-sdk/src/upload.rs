//! Upload transport contract and delta sync bookkeeping.

use crate::{DriverResult, Event, Progress, TimeProcessing};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Namespace every driver submits its records under.
pub const UPLOAD_NAMESPACE: &str = "dataservices";

/// Device page counters recorded by the previous successful upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaMarkers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_position: Option<u32>,
    #[serde(default, rename = "lastCBGPosition", skip_serializing_if = "Option::is_none")]
    pub last_cbg_position: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_glucose_position: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_isig_position: Option<u32>,
}

impl DeltaMarkers {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Session metadata submitted alongside the records.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    #[serde(skip_serializing_if = "DeltaMarkers::is_empty")]
    pub delta: DeltaMarkers,
    pub device_tags: Vec<String>,
    pub device_manufacturers: Vec<String>,
    pub device_model: String,
    pub device_serial_number: String,
    pub device_id: String,
    /// Device clock at session start, `YYYY-MM-DDTHH:mm:ss`
    pub device_time: String,
    /// Upload start, RFC 3339 UTC
    pub start: String,
    pub time_processing: TimeProcessing,
    pub tz_name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_id: Option<String>,
}

/// Destination for finalized events.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Delta markers persisted by the last successful upload from this device.
    async fn most_recent_upload(
        &self,
        group_id: &str,
        device_id: &str,
    ) -> DriverResult<Option<DeltaMarkers>>;

    /// Submit the records. A successful return commits the session's delta
    /// markers as the new baseline.
    async fn submit(
        &self,
        records: &[Event],
        session: &SessionInfo,
        progress: &Progress,
        group_id: &str,
        namespace: &str,
    ) -> DriverResult<()>;
}
