//!
//! This library decodes the readout protocols of low-cost handheld digital
//! multimeters and exposes them behind one model registry.
//!
//! <br>
//!
//! # Details
//!
//! - Serial-cable models need the DMM set to PC/RS232 mode; the VC870 is
//!   addressed by its USB VID/PID instead of a serial device path.
//!
//! - Basic setup and connection
//!
//!   ```no_run
//!   use dmmctl::{Multimeter, DEFAULT_MODEL, DEFAULT_TTY};
//!   #[tokio::main]
//!   async fn main() -> dmmctl::Result<()> {
//!       let mut meter = Multimeter::new(DEFAULT_TTY, DEFAULT_MODEL)?;
//!       let reading = meter.get_reading().await?;
//!       eprintln!("{} {}", reading, reading.mode);
//!       Ok(())
//!   }
//!   ```
//!
//! # Supported chipsets
//!
//!  * EDI9604 (Eidechse EDI9604)
//!  * Fortune FS9721 (Digitek DT4000ZC, UNI-T UT60E, Voltcraft VC820/VC840
//!    and many rebadges)
//!  * Voltcraft VC870 over its USB-HID cable
//!

pub mod drivers;
pub mod error;
pub mod multimeter;
pub mod reading;
pub mod registry;

pub use error::{MeterError, Result};
pub use multimeter::Multimeter;
pub use reading::Reading;
pub use registry::Chipset;

#[cfg(unix)]
pub const DEFAULT_TTY: &str = "/dev/ttyUSB0";
#[cfg(windows)]
pub const DEFAULT_TTY: &str = "COM1";

/// Registry entry used when no model is given; an FS9721 rebadge.
pub const DEFAULT_MODEL: &str = "Default";
