//! Push button on a GPIO line

use gpio_cdev::{Chip, LineHandle, LineRequestFlags};
use tracing::{debug, info};

use super::ResetTrigger;
use crate::config::TriggerConfig;
use crate::error::{AppError, Result};
use crate::error_throttled;
use crate::utils::RepeatThrottle;

/// Turns raw line levels into clicks (press followed by release)
#[derive(Debug, Clone, Default)]
pub struct ClickDetector {
    active_low: bool,
    pressed: bool,
}

impl ClickDetector {
    pub fn new(active_low: bool) -> Self {
        Self {
            active_low,
            pressed: false,
        }
    }

    /// Feed one sample; returns `true` on release after a press
    pub fn update(&mut self, level: u8) -> bool {
        let pressed = (level == 0) == self.active_low;
        let clicked = self.pressed && !pressed;
        self.pressed = pressed;
        clicked
    }
}

/// Reset button read through the GPIO character device
pub struct GpioButton {
    handle: LineHandle,
    detector: ClickDetector,
    throttle: RepeatThrottle,
}

impl GpioButton {
    pub fn open(chip_path: &str, pin: u32, active_low: bool) -> Result<Self> {
        info!("Reset button on {} pin {}", chip_path, pin);

        let mut chip = Chip::new(chip_path)
            .map_err(|e| AppError::Config(format!("Button GPIO chip failed: {}", e)))?;
        let line = chip
            .get_line(pin)
            .map_err(|e| AppError::Config(format!("Button GPIO line {} failed: {}", pin, e)))?;
        let handle = line
            .request(LineRequestFlags::INPUT, 0, "msc-gadget-reset")
            .map_err(|e| AppError::Config(format!("Button GPIO request failed: {}", e)))?;

        Ok(Self {
            handle,
            detector: ClickDetector::new(active_low),
            throttle: RepeatThrottle::default(),
        })
    }

    /// Button from config, if one is configured
    pub fn from_config(config: &TriggerConfig) -> Result<Option<Self>> {
        match config.gpio_chip.as_deref().filter(|c| !c.is_empty()) {
            Some(chip) => Self::open(chip, config.gpio_pin, config.active_low).map(Some),
            None => {
                debug!("No reset button configured");
                Ok(None)
            }
        }
    }
}

impl ResetTrigger for GpioButton {
    fn poll(&mut self) -> bool {
        match self.handle.get_value() {
            Ok(level) => {
                self.throttle.reset();
                self.detector.update(level)
            }
            Err(e) => {
                error_throttled!(self.throttle, "Reset button read failed: {}", e);
                false
            }
        }
    }

    fn name(&self) -> &str {
        "gpio"
    }
}
