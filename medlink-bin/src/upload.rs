use async_trait::async_trait;
use medlink_sdk::{
    DeltaMarkers, DriverError, DriverResult, Event, Progress, SessionInfo, Stage, UploadTransport,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Writes each upload session as a JSON document and keeps the delta
/// markers of the last successful upload per device.
#[derive(Debug, Clone)]
pub struct JsonFileUpload {
    output_dir: PathBuf,
    state_dir: PathBuf,
}

impl JsonFileUpload {
    pub fn new(output_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            state_dir: state_dir.into(),
        }
    }

    fn state_file(&self, device_id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", file_safe(device_id)))
    }

    fn output_file(&self, session: &SessionInfo) -> PathBuf {
        self.output_dir.join(format!(
            "{}-{}.json",
            file_safe(&session.device_id),
            file_safe(&session.start)
        ))
    }
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            ':' | '/' | '\\' => '-',
            c => c,
        })
        .collect()
}

fn upload_error(path: &Path, e: impl std::fmt::Display) -> DriverError {
    DriverError::UploadError(format!("{}: {e}", path.display()))
}

async fn write_json(path: &Path, value: &serde_json::Value) -> DriverResult<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| upload_error(dir, e))?;
    }
    let body = serde_json::to_vec_pretty(value)?;
    fs::write(path, body).await.map_err(|e| upload_error(path, e))
}

#[async_trait]
impl UploadTransport for JsonFileUpload {
    async fn most_recent_upload(
        &self,
        _group_id: &str,
        device_id: &str,
    ) -> DriverResult<Option<DeltaMarkers>> {
        let path = self.state_file(device_id);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no previous upload");
                return Ok(None);
            }
            Err(e) => return Err(upload_error(&path, e)),
        };
        let markers: DeltaMarkers = serde_json::from_slice(&raw)?;
        debug!(?markers, "previous upload");
        Ok(Some(markers))
    }

    async fn submit(
        &self,
        records: &[Event],
        session: &SessionInfo,
        progress: &Progress,
        group_id: &str,
        namespace: &str,
    ) -> DriverResult<()> {
        let path = self.output_file(session);
        let document = json!({
            "groupId": group_id,
            "namespace": namespace,
            "session": session,
            "records": records,
        });
        write_json(&path, &document).await?;
        progress.report(Stage::UploadData, 90);
        info!(path = %path.display(), records = records.len(), "upload written");

        if !session.delta.is_empty() {
            let state = self.state_file(&session.device_id);
            write_json(&state, &serde_json::to_value(session.delta)?).await?;
            debug!(path = %state.display(), "delta markers saved");
        }
        Ok(())
    }
}
