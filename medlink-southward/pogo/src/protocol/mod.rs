//! POGO wire protocol: packet building, framing and the command session.

pub mod codec;
pub mod error;
pub mod packet;
pub mod session;
