//! The Marlin-family serial printer driver: connection handshake, the
//! acknowledged-send primitive, and print-job streaming on top of it.

mod connection;
mod job;
mod serial_port;

pub use connection::{Driver, DriverConfig, DriverError, PrinterState};
pub use job::{PrintControl, PrintEvent, PrintJobConfig, run_print_job};
pub use serial_port::{SerialPortOpener, SerialReader, SerialWriter, TokioSerialOpener};
