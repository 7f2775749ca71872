// Medtronic Paradigm pump driver library entry.
//
// Talks to 523/551/554/723/751/754 pumps through a Contour Next Link, decodes
// the history pages and reconstructs the event stream handed to the uploader.

mod supervisor;

pub mod builders;
pub mod config;
pub mod decoder;
pub mod driver;
pub mod protocol;
pub mod simulator;

pub use driver::{MedtronicContext, MedtronicDriver, DRIVER_NAME};
pub use supervisor::open_link;
