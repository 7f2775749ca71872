// Intuity POGO blood glucose meter driver library entry.
//
// ASCII command/response protocol over a serial port: each exchange returns
// one STX/ETX framed response carrying a CRC-16 as four hex digits.

mod supervisor;

pub mod driver;
pub mod parser;
pub mod protocol;

pub use driver::{PogoConfig, PogoContext, PogoDriver, DRIVER_NAME};
pub use supervisor::open_port;
