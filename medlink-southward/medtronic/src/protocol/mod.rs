//! Contour Next Link / Medtronic protocol primitives.
//!
//! Everything below the decoder lives here: HID report framing, the packet
//! builders for control bytes and pump messages, and the session that runs
//! the handshake, configuration reads and bulk page transfer.

pub mod codec;
pub mod error;
pub mod packet;
pub mod session;
