//! The platform, owner of all devices.

use crate::{
    descriptor::Allocator,
    device::{error::DeviceIndexOutOfRange, Device, DeviceOptions},
};
use anyhow::{bail, Result};
use serde::Deserialize;
use std::{
    fmt::{self, Debug},
    sync::Arc,
};

/// Options for creating a [`Platform`].
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PlatformOptions {
    /// Number of devices, defaults to 1.
    pub devices: usize,
    /// Options shared by every device, the index is assigned per device.
    pub device: DeviceOptions,
}

impl Default for PlatformOptions {
    fn default() -> Self {
        Self {
            devices: 1,
            device: DeviceOptions::default(),
        }
    }
}

/// Builder for creating a [`Platform`].
pub struct PlatformBuilder {
    options: PlatformOptions,
    allocator: Option<Arc<dyn Allocator>>,
}

impl PlatformBuilder {
    pub fn devices(mut self, devices: usize) -> Self {
        self.options.devices = devices;
        self
    }
    pub fn device_options(mut self, options: DeviceOptions) -> Self {
        self.options.device = options;
        self
    }
    pub fn options(mut self, options: PlatformOptions) -> Self {
        self.options = options;
        self
    }
    /// Allocator for packed kernel arguments of every device.
    pub fn allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator.replace(allocator);
        self
    }
    pub fn build(self) -> Result<Arc<Platform>> {
        let PlatformOptions {
            devices: count,
            device: options,
        } = self.options;
        if count == 0 {
            bail!("A platform needs at least one device!");
        }
        let mut devices = Vec::with_capacity(count);
        for index in 0..count {
            let mut builder = Device::builder().options(DeviceOptions {
                index,
                ..options.clone()
            });
            if let Some(allocator) = self.allocator.as_ref() {
                builder = builder.allocator(allocator.clone());
            }
            devices.push(builder.build()?);
        }
        tracing::debug!(devices = count, "platform created");
        Ok(Arc::new(Platform { devices }))
    }
}

/** The root object of the runtime.

Every runtime object is created from a platform, there is no global
instance. */
pub struct Platform {
    devices: Vec<Device>,
}

impl Platform {
    pub fn builder() -> PlatformBuilder {
        PlatformBuilder {
            options: PlatformOptions::default(),
            allocator: None,
        }
    }
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }
    pub fn device(&self, index: usize) -> Result<&Device, DeviceIndexOutOfRange> {
        self.devices.get(index).ok_or(DeviceIndexOutOfRange {
            index,
            devices: self.devices.len(),
        })
    }
    pub fn contains(&self, device: &Device) -> bool {
        self.devices.contains(device)
    }
}

impl Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Platform")
            .field("devices", &self.devices)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devices_are_indexed() -> Result<()> {
        let platform = Platform::builder().devices(3).build()?;
        for (i, device) in platform.devices().iter().enumerate() {
            assert_eq!(device.index(), i);
            assert!(platform.contains(device));
        }
        assert!(platform.device(3).is_err());
        assert!(!platform.contains(&Device::builder().build()?));
        assert!(Platform::builder().devices(0).build().is_err());
        Ok(())
    }

    #[test]
    fn options_from_json() -> Result<()> {
        let options: PlatformOptions =
            serde_json::from_str(r#"{ "devices": 2, "device": { "memory_size": 4096 } }"#)?;
        let platform = Platform::builder().options(options).build()?;
        assert_eq!(platform.devices().len(), 2);
        assert_eq!(platform.device(1)?.info().memory_size(), 4096);
        Ok(())
    }
}
