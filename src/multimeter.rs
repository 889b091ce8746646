use tracing::debug;

use crate::drivers::Driver;
use crate::error::{MeterError, Result};
use crate::registry::{self, Chipset, SupportedModels};
use crate::Reading;

/// Handle to one multimeter.
///
/// Construction only validates the model name against the registry; the
/// transport stays closed until the first [`get_reading`] call, so a handle
/// can be created before the instrument is plugged in.
///
/// [`get_reading`]: Multimeter::get_reading
pub struct Multimeter {
    connect: String,
    chipset: Chipset,
    driver: Option<Driver>,
}

impl Multimeter {
    /// Resolve `model` against the registry and remember the connect
    /// string. Fails only for unknown model names.
    pub fn new(connect: impl Into<String>, model: &str) -> Result<Self> {
        let chipset = registry::lookup(model)
            .ok_or_else(|| MeterError::UnsupportedModel(model.to_string()))?;
        debug!("model {} resolved to chipset {}", model, chipset);
        Ok(Self {
            connect: connect.into(),
            chipset,
            driver: None,
        })
    }

    pub fn chipset(&self) -> Chipset {
        self.chipset
    }

    /// The supported model names, in registry order.
    pub fn get_models_supported() -> SupportedModels {
        registry::models_supported()
    }

    /// Read the next measurement, opening the transport on the first call.
    /// A failed read keeps the transport open; decode and framing errors
    /// are worth retrying on the same connection.
    pub async fn get_reading(&mut self) -> Result<Reading> {
        let mut driver = match self.driver.take() {
            Some(driver) => driver,
            None => {
                debug!("opening {} driver on {}", self.chipset, self.connect);
                Driver::open(self.chipset, &self.connect).await?
            }
        };
        let reading = driver.get_reading().await;
        self.driver = Some(driver);
        reading
    }

    /// Release the transport, if one was ever opened. The handle stays
    /// usable; the next `get_reading` reopens it.
    pub async fn close(&mut self) -> Result<()> {
        match self.driver.take() {
            Some(driver) => driver.close().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_is_rejected_without_touching_the_port() {
        match Multimeter::new("/dev/null", "Fluke_189") {
            Err(err) => assert_eq!(
                err.to_string(),
                "Multimeter model not supported: Fluke_189"
            ),
            Ok(_) => panic!("unknown model must not construct"),
        }
    }

    #[test]
    fn known_model_resolves_lazily() {
        // The path does not exist; construction must still succeed.
        let meter = Multimeter::new("/dev/nonexistent0", "Digitek_DT4000ZC").unwrap();
        assert_eq!(meter.chipset(), Chipset::Fs9721);
        assert!(meter.driver.is_none());
    }

    #[tokio::test]
    async fn close_without_open_is_a_no_op() {
        let mut meter = Multimeter::new("/dev/nonexistent0", crate::DEFAULT_MODEL).unwrap();
        assert!(meter.close().await.is_ok());
    }

    #[tokio::test]
    async fn first_reading_surfaces_connect_failure() {
        let mut meter = Multimeter::new("/dev/nonexistent0", crate::DEFAULT_MODEL).unwrap();
        assert!(meter.get_reading().await.is_err());
        // The failed open leaves no half-open driver behind.
        assert!(meter.driver.is_none());
    }

    #[test]
    fn every_supported_model_constructs() {
        for model in Multimeter::get_models_supported().models {
            assert!(Multimeter::new("/dev/nonexistent0", &model).is_ok());
        }
    }

    #[test]
    fn supported_models_come_from_the_registry() {
        let supported = Multimeter::get_models_supported();
        assert!(supported.models.iter().any(|m| m == "Voltcraft_VC870"));
    }
}
