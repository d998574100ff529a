//! GPIO collaborator: reflector output and motion-sensor input.
//!
//! [`SysfsGpio`] drives pins through the Linux sysfs interface
//! (`/sys/class/gpio/gpioN/value`). [`NoGpio`] is used when no pins are
//! configured: the reflector is a no-op and triggers never arrive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::GpioConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerEvent {
    pub pin: u32,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait Gpio: Send + Sync {
    fn set_reflector(&self, on: bool) -> Result<()>;

    /// Wait for the next rising edge on the sensor input.
    async fn wait_trigger(&self) -> Result<TriggerEvent>;
}

/// No pins attached.
pub struct NoGpio;

#[async_trait]
impl Gpio for NoGpio {
    fn set_reflector(&self, _on: bool) -> Result<()> {
        Ok(())
    }

    async fn wait_trigger(&self) -> Result<TriggerEvent> {
        std::future::pending().await
    }
}

/// Pins driven through `/sys/class/gpio`.
pub struct SysfsGpio {
    root: PathBuf,
    reflector_pin: Option<u32>,
    sensor_pin: Option<u32>,
    poll: Duration,
}

impl SysfsGpio {
    /// Export and configure the configured pins.
    pub fn open(cfg: &GpioConfig) -> Result<Self> {
        let gpio = Self {
            root: cfg.sysfs_root.clone(),
            reflector_pin: cfg.reflector_pin,
            sensor_pin: cfg.sensor_pin,
            poll: Duration::from_millis(cfg.poll_ms.max(10)),
        };
        if let Some(pin) = gpio.reflector_pin {
            gpio.export(pin, "out")?;
        }
        if let Some(pin) = gpio.sensor_pin {
            gpio.export(pin, "in")?;
        }
        Ok(gpio)
    }

    fn pin_dir(&self, pin: u32) -> PathBuf {
        self.root.join(format!("gpio{}", pin))
    }

    fn export(&self, pin: u32, direction: &str) -> Result<()> {
        let dir = self.pin_dir(pin);
        if !dir.exists() {
            std::fs::write(self.root.join("export"), pin.to_string())?;
        }
        std::fs::write(dir.join("direction"), direction)?;
        tracing::debug!(pin, direction, "GPIO pin exported");
        Ok(())
    }

    async fn read_value(path: &Path) -> Result<bool> {
        let raw = tokio::fs::read_to_string(path).await?;
        Ok(raw.trim() == "1")
    }
}

#[async_trait]
impl Gpio for SysfsGpio {
    fn set_reflector(&self, on: bool) -> Result<()> {
        let Some(pin) = self.reflector_pin else {
            return Ok(());
        };
        std::fs::write(
            self.pin_dir(pin).join("value"),
            if on { "1" } else { "0" },
        )?;
        tracing::debug!(pin, on, "Reflector switched");
        Ok(())
    }

    async fn wait_trigger(&self) -> Result<TriggerEvent> {
        let Some(pin) = self.sensor_pin else {
            return std::future::pending().await;
        };
        let value = self.pin_dir(pin).join("value");
        // Baseline on entry: a level that was already high is not an edge.
        let mut previous = Self::read_value(&value).await?;
        loop {
            tokio::time::sleep(self.poll).await;
            let current = Self::read_value(&value)
                .await
                .map_err(|e| Error::Capture(format!("sensor pin {}: {}", pin, e)))?;
            if current && !previous {
                return Ok(TriggerEvent { pin, at: Utc::now() });
            }
            previous = current;
        }
    }
}
