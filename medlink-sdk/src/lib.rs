pub mod checksum;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod retry;
pub mod timezone;
pub mod upload;
pub mod wire;

pub use error::*;
pub use event::*;
pub use lifecycle::{run_lifecycle, DeviceDriver, Progress, Stage};
pub use retry::{build_constant_backoff, retry_fixed, RetryPolicy};
pub use timezone::{TimeProcessing, TzoUtil};
pub use upload::{DeltaMarkers, SessionInfo, UploadTransport, UPLOAD_NAMESPACE};
pub use wire::{WireDecode, WireEncode};
