//! Chipset decoders and the state shared between them.

use std::time::Instant;

use chrono::Utc;

use crate::error::Result;
use crate::reading::{Reading, TimeInfo};
use crate::registry::Chipset;

pub mod edi9604;
pub mod fs9721;
pub mod vc870;

pub use edi9604::Edi9604;
pub use fs9721::Fs9721;
pub use vc870::Vc870;

/// Retry ceiling shared by all framing loops.
pub(crate) const PACKET_RETRY_LIMIT: u32 = 3;

/// Elapsed-time bookkeeping for one decoder session.
///
/// `started` is fixed when the driver opens; `previous` advances only on a
/// successful decode, so failed attempts never disturb interval timing.
#[derive(Debug, Clone)]
pub struct SessionClock {
    started: Instant,
    previous: Instant,
}

impl SessionClock {
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            previous: now,
        }
    }

    /// Produce the timing block for a reading and advance `previous`.
    /// Call only after the packet decoded cleanly.
    pub fn stamp(&mut self) -> TimeInfo {
        let now = Instant::now();
        let info = TimeInfo {
            elapsed: now.duration_since(self.started).as_secs_f64(),
            interval: now.duration_since(self.previous).as_secs_f64(),
            timestamp: Utc::now(),
        };
        self.previous = now;
        info
    }
}

/// One open chipset decoder. Owns its transport handle for its lifetime.
pub enum Driver {
    Edi9604(Edi9604),
    Fs9721(Fs9721),
    Vc870(Vc870),
}

impl Driver {
    /// Open the transport for `chipset` and hand back a ready decoder.
    pub async fn open(chipset: Chipset, connect: &str) -> Result<Self> {
        match chipset {
            Chipset::Edi9604 => Ok(Self::Edi9604(Edi9604::open(connect).await?)),
            Chipset::Fs9721 => Ok(Self::Fs9721(Fs9721::open(connect)?)),
            Chipset::Vc870 => Ok(Self::Vc870(Vc870::open(connect).await?)),
        }
    }

    /// Block until one complete packet is decoded into a reading, or a
    /// retry/timeout ceiling is exceeded.
    pub async fn get_reading(&mut self) -> Result<Reading> {
        match self {
            Self::Edi9604(driver) => driver.get_reading().await,
            Self::Fs9721(driver) => driver.get_reading().await,
            Self::Vc870(driver) => driver.get_reading().await,
        }
    }

    /// Release the transport. Serial handles close on drop; the USB driver
    /// additionally resets the device so other processes can claim it.
    pub async fn close(self) -> Result<()> {
        match self {
            Self::Edi9604(driver) => driver.close(),
            Self::Fs9721(driver) => driver.close(),
            Self::Vc870(driver) => driver.close(),
        }
    }
}
