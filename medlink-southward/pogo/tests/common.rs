#![allow(dead_code)]

use async_trait::async_trait;
use medlink_driver_pogo::protocol::{
    packet::{ascii, checksum},
    session::PogoSessionImpl,
};
use medlink_sdk::{DeltaMarkers, DriverResult, Event, Progress, SessionInfo, UploadTransport};
use std::sync::{Arc, Mutex, Once};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing::Level;

pub const SERIAL: &str = "AB12345678901";

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

/// `D` response body as the meter formats it.
pub fn record(index: u32, time: &str, data: &str) -> String {
    let mut s = format!("D{index:05} {time}");
    while s.len() < 37 {
        s.push(' ');
    }
    s.push('1');
    while s.len() < 49 {
        s.push(' ');
    }
    s.push_str(data);
    s
}

fn frame(body: &str) -> Vec<u8> {
    let mut out = vec![ascii::STX];
    out.extend_from_slice(body.as_bytes());
    out.extend_from_slice(format!("{:04X}", checksum(body.as_bytes())).as_bytes());
    out.push(ascii::ETX);
    out
}

/// Meter double serving `records` over an in-memory pipe.
pub fn fake_meter(records: Vec<String>) -> PogoSessionImpl<DuplexStream> {
    let (near, mut far) = tokio::io::duplex(4096);
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            let n = match far.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            buf.extend_from_slice(&chunk[..n]);
            while let Some(end) = buf.iter().position(|b| *b == ascii::ETX) {
                let request: Vec<u8> = buf.drain(..=end).collect();
                let body = String::from_utf8_lossy(&request[1..request.len() - 5]).to_string();
                let reply = match body.as_str() {
                    "?" => format!("?{SERIAL} 1.02.3"),
                    "n" => format!("n{:03}", records.len()),
                    other => {
                        let index: usize = other[1..].parse().unwrap_or(usize::MAX);
                        match records.get(index) {
                            Some(r) => r.clone(),
                            None => continue,
                        }
                    }
                };
                if far.write_all(&frame(&reply)).await.is_err() {
                    return;
                }
            }
        }
    });
    PogoSessionImpl::new(near)
}

/// Upload transport that keeps what it was given.
#[derive(Default)]
pub struct RecordingUpload {
    pub submitted: Mutex<Option<(Vec<Event>, SessionInfo)>>,
}

#[async_trait]
impl UploadTransport for RecordingUpload {
    async fn most_recent_upload(&self, _: &str, _: &str) -> DriverResult<Option<DeltaMarkers>> {
        Ok(None)
    }

    async fn submit(
        &self,
        records: &[Event],
        session: &SessionInfo,
        _: &Progress,
        _: &str,
        _: &str,
    ) -> DriverResult<()> {
        *self.submitted.lock().unwrap() = Some((records.to_vec(), session.clone()));
        Ok(())
    }
}

pub fn upload() -> Arc<RecordingUpload> {
    Arc::new(RecordingUpload::default())
}
