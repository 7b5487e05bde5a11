//! Allocation contexts and the per-type device constructor registry.

use {
    crate::{
        device::{Device, DeviceInfo},
        error::{Error, Result},
        options::RunOptions,
        resource::{DeviceRequirement, ResourceInfo},
        transport::ProcessTransport,
    },
    std::{collections::HashMap, sync::Arc},
};

#[cfg(feature = "native")]
use crate::transport::{SerialConfig, SerialTransport};

/// Baud rate used when neither the requirement nor the resource names one.
pub const DEFAULT_BAUDRATE: u32 = 115_200;

/// Builds an unopened device for an allocation.
pub type DeviceConstructor =
    Arc<dyn Fn(&AllocationContext, &RunOptions) -> Result<Device> + Send + Sync>;

/// One requirement bound to the resource reserved for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationContext {
    /// 1-based device index.
    pub index: usize,
    /// Resolved requirement.
    pub requirement: DeviceRequirement,
    /// Reserved resource; `None` for resource-free types.
    pub resource: Option<ResourceInfo>,
}

impl AllocationContext {
    /// Identity for the device built from this context.
    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            index: self.index,
            nick: self.requirement.nick.clone(),
            resource_id: self.resource.as_ref().map(|r| r.resource_id.clone()),
            platform: self
                .resource
                .as_ref()
                .and_then(|r| r.platform.clone())
                .or_else(|| self.requirement.platform_name.clone()),
            kind: self.requirement.kind.clone(),
        }
    }

    /// Serial port and baud rate for serial-backed types.
    pub fn serial_settings(&self) -> Result<(String, u32)> {
        let port = self
            .resource
            .as_ref()
            .and_then(|r| r.serial_port.clone())
            .or_else(|| self.requirement.serial_port.clone())
            .ok_or_else(|| {
                Error::ResourceInit(format!("DUT index {} has no serial port", self.index))
            })?;
        let baud = self
            .requirement
            .application
            .baudrate
            .or_else(|| self.resource.as_ref().and_then(|r| r.baudrate))
            .unwrap_or(DEFAULT_BAUDRATE);
        Ok((port, baud))
    }
}

/// Contexts for a run plus the constructors that turn them into devices.
#[derive(Clone)]
pub struct AllocationContextList {
    contexts: Vec<AllocationContext>,
    constructors: HashMap<String, DeviceConstructor>,
}

impl std::fmt::Debug for AllocationContextList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.constructors.keys().collect();
        types.sort();
        f.debug_struct("AllocationContextList")
            .field("contexts", &self.contexts)
            .field("constructors", &types)
            .finish()
    }
}

impl AllocationContextList {
    /// Bundle contexts with a constructor registry.
    pub fn new(
        contexts: Vec<AllocationContext>,
        constructors: HashMap<String, DeviceConstructor>,
    ) -> Self {
        Self {
            contexts,
            constructors,
        }
    }

    /// Contexts in index order.
    pub fn contexts(&self) -> &[AllocationContext] {
        &self.contexts
    }

    /// Number of contexts.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Whether there are no contexts.
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Build the device for `context` with the constructor for its type.
    pub fn build(&self, context: &AllocationContext, options: &RunOptions) -> Result<Device> {
        let kind = &context.requirement.kind;
        let constructor = self.constructors.get(kind).ok_or_else(|| {
            Error::ResourceInit(format!("no constructor registered for device type '{kind}'"))
        })?;
        constructor(context, options)
    }
}

fn process_device(context: &AllocationContext, _: &RunOptions) -> Result<Device> {
    let application = &context.requirement.application;
    let bin = application.bin.clone().ok_or_else(|| {
        Error::ResourceInit(format!("DUT index {} has no application.bin", context.index))
    })?;
    Ok(Device::new(
        context.device_info(),
        context.requirement.clone(),
        ProcessTransport::new(bin, application.bin_args.clone()),
    ))
}

#[cfg(feature = "native")]
fn serial_device(context: &AllocationContext, _: &RunOptions) -> Result<Device> {
    let (port, baud) = context.serial_settings()?;
    Ok(Device::new(
        context.device_info(),
        context.requirement.clone(),
        SerialTransport::new(SerialConfig::new(port, baud)),
    ))
}

#[cfg(not(feature = "native"))]
fn serial_device(context: &AllocationContext, _: &RunOptions) -> Result<Device> {
    Err(Error::Unsupported(format!(
        "DUT index {}: serial devices need the `native` feature",
        context.index
    )))
}

/// Constructors for `hardware`, `serial` and `process` devices.
pub fn default_constructors() -> HashMap<String, DeviceConstructor> {
    let serial: DeviceConstructor = Arc::new(serial_device);
    let process: DeviceConstructor = Arc::new(process_device);
    HashMap::from([
        ("hardware".to_string(), Arc::clone(&serial)),
        ("serial".to_string(), serial),
        ("process".to_string(), process),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(kind: &str) -> AllocationContext {
        AllocationContext {
            index: 2,
            requirement: DeviceRequirement {
                kind: kind.into(),
                nick: Some("node".into()),
                ..DeviceRequirement::default()
            },
            resource: Some(
                ResourceInfo::new("0240")
                    .with_platform("K64F")
                    .with_serial_port("/dev/ttyACM1"),
            ),
        }
    }

    #[test]
    fn test_device_info_from_context() {
        let info = context("hardware").device_info();
        assert_eq!(info.index, 2);
        assert_eq!(info.nick.as_deref(), Some("node"));
        assert_eq!(info.resource_id.as_deref(), Some("0240"));
        assert_eq!(info.platform.as_deref(), Some("K64F"));
    }

    #[test]
    fn test_serial_settings_default_baud() {
        let (port, baud) = context("serial").serial_settings().unwrap();
        assert_eq!(port, "/dev/ttyACM1");
        assert_eq!(baud, DEFAULT_BAUDRATE);
        let mut bare = context("serial");
        bare.resource = None;
        assert!(bare.serial_settings().is_err());
    }

    #[test]
    fn test_unregistered_type_fails() {
        let list = AllocationContextList::new(vec![context("mystery")], default_constructors());
        let err = list
            .build(&list.contexts()[0], &RunOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::ResourceInit(_)));
    }

    #[test]
    fn test_process_constructor_builds_unopened_device() {
        let mut ctx = context("process");
        ctx.requirement.application.bin = Some("/bin/sh".into());
        let list = AllocationContextList::new(vec![ctx.clone()], default_constructors());
        let device = list.build(&ctx, &RunOptions::default()).unwrap();
        assert_eq!(device.lifecycle(), crate::device::Lifecycle::Unopened);
        assert_eq!(device.name(), "node");
    }
}
