//! Process-wide helpers shared by the medlink binary and drivers.
//!
//! - **Logging**: console and daily rolling file output with a level that can
//!   be changed at runtime.

mod logger;

pub use logger::{parse_level, Logger};
pub use medlink_error::{MedlinkError, MedlinkResult};
