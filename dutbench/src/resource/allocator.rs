//! Matching requirements against a resource inventory.

use {
    crate::{
        device::detect_ports,
        error::{Error, Result},
        resource::{AllocationContext, DeviceRequirement},
    },
    log::{debug, info},
    serde::{Deserialize, Serialize},
    std::{
        collections::HashSet,
        env,
        path::{Path, PathBuf},
    },
};

/// A piece of test hardware in the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    /// Stable identifier (board serial number, port path).
    pub resource_id: String,
    /// Platform name.
    #[serde(default)]
    pub platform: Option<String>,
    /// Serial port used for the command line.
    #[serde(default)]
    pub serial_port: Option<String>,
    /// Mass-storage mount point used for flashing.
    #[serde(default)]
    pub mount_point: Option<PathBuf>,
    /// Serial baud rate.
    #[serde(default)]
    pub baudrate: Option<u32>,
    /// Reserved by a run.
    #[serde(skip)]
    pub allocated: bool,
}

impl ResourceInfo {
    /// An unreserved resource with only an identifier.
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            platform: None,
            serial_port: None,
            mount_point: None,
            baudrate: None,
            allocated: false,
        }
    }

    /// Set the platform.
    #[must_use]
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    /// Set the serial port.
    #[must_use]
    pub fn with_serial_port(mut self, port: impl Into<String>) -> Self {
        self.serial_port = Some(port.into());
        self
    }

    /// Set the mount point.
    #[must_use]
    pub fn with_mount_point(mut self, mount_point: impl Into<PathBuf>) -> Self {
        self.mount_point = Some(mount_point.into());
        self
    }
}

/// Source of resources for a run.
pub trait Allocator: Send {
    /// Whether `requirement` could be satisfied right now.
    fn can_allocate(&self, requirement: &DeviceRequirement) -> bool;

    /// Reserve one resource per requirement, in order.
    ///
    /// Either every requirement is satisfied or nothing stays reserved.
    fn allocate(&mut self, requirements: &[DeviceRequirement]) -> Result<Vec<AllocationContext>>;

    /// Return reservations made by [`Allocator::allocate`].
    fn release(&mut self, contexts: &[AllocationContext]);
}

/// Allocator over a fixed local inventory.
#[derive(Debug, Clone, Default)]
pub struct LocalAllocator {
    inventory: Vec<ResourceInfo>,
    /// Serial ports reserved outside the inventory.
    claimed_ports: HashSet<String>,
}

impl LocalAllocator {
    /// Allocator over `inventory`.
    pub fn new(inventory: Vec<ResourceInfo>) -> Self {
        Self {
            inventory,
            claimed_ports: HashSet::new(),
        }
    }

    /// Allocator over the serial ports currently attached.
    pub fn discover() -> Self {
        let inventory = detect_ports()
            .into_iter()
            .map(|port| ResourceInfo {
                resource_id: port.resource_id(),
                platform: Some(port.platform()),
                serial_port: Some(port.name.clone()),
                mount_point: None,
                baudrate: None,
                allocated: false,
            })
            .collect::<Vec<_>>();
        debug!("Discovered {} serial resource(s)", inventory.len());
        Self::new(inventory)
    }

    /// Add resources not already in the inventory.
    #[must_use]
    pub fn with_resources(mut self, resources: impl IntoIterator<Item = ResourceInfo>) -> Self {
        for resource in resources {
            if !self.inventory.iter().any(|r| r.resource_id == resource.resource_id) {
                self.inventory.push(resource);
            }
        }
        self
    }

    /// Current inventory.
    pub fn resources(&self) -> &[ResourceInfo] {
        &self.inventory
    }

    fn find_free(&self, requirement: &DeviceRequirement) -> Option<usize> {
        self.inventory
            .iter()
            .position(|r| !r.allocated && requirement.accepts_platform(r.platform.as_deref()))
    }

    fn reserve(&mut self, index: usize, requirement: &DeviceRequirement) -> Result<Option<ResourceInfo>> {
        match requirement.kind.as_str() {
            "hardware" => {
                let slot = self.find_free(requirement).ok_or_else(|| {
                    Error::Allocation(format!(
                        "no free resource for DUT index {index} (platforms: {})",
                        platform_list(requirement)
                    ))
                })?;
                self.inventory[slot].allocated = true;
                Ok(Some(self.inventory[slot].clone()))
            },
            "serial" => {
                let port = requirement.serial_port.as_deref().ok_or_else(|| {
                    Error::Allocation(format!("DUT index {index} has type serial but no serial_port"))
                })?;
                match self
                    .inventory
                    .iter_mut()
                    .find(|r| r.serial_port.as_deref() == Some(port))
                {
                    Some(resource) if resource.allocated => Err(Error::Allocation(format!(
                        "serial port {port} for DUT index {index} is already allocated"
                    ))),
                    Some(resource) => {
                        resource.allocated = true;
                        Ok(Some(resource.clone()))
                    },
                    None if self.claimed_ports.contains(port) => Err(Error::Allocation(format!(
                        "serial port {port} for DUT index {index} is already allocated"
                    ))),
                    None => {
                        self.claimed_ports.insert(port.to_string());
                        let mut resource = ResourceInfo::new(port).with_serial_port(port);
                        resource.baudrate = requirement.application.baudrate;
                        resource.allocated = true;
                        Ok(Some(resource))
                    },
                }
            },
            "process" => {
                let bin = requirement.application.bin.as_deref().ok_or_else(|| {
                    Error::Allocation(format!("DUT index {index} has type process but no application.bin"))
                })?;
                if resolve_binary(bin).is_none() {
                    return Err(Error::Environment(format!(
                        "binary {} for DUT index {index} not found",
                        bin.display()
                    )));
                }
                Ok(None)
            },
            _ => Ok(None),
        }
    }

    fn unreserve(&mut self, resource_id: &str) {
        self.claimed_ports.remove(resource_id);
        if let Some(resource) = self.inventory.iter_mut().find(|r| r.resource_id == resource_id) {
            resource.allocated = false;
        }
    }
}

impl Allocator for LocalAllocator {
    fn can_allocate(&self, requirement: &DeviceRequirement) -> bool {
        match requirement.kind.as_str() {
            "hardware" => self.find_free(requirement).is_some(),
            "serial" => requirement.serial_port.as_deref().is_some_and(|port| {
                !self.claimed_ports.contains(port)
                    && !self
                        .inventory
                        .iter()
                        .any(|r| r.allocated && r.serial_port.as_deref() == Some(port))
            }),
            "process" => requirement
                .application
                .bin
                .as_deref()
                .and_then(resolve_binary)
                .is_some(),
            _ => true,
        }
    }

    fn allocate(&mut self, requirements: &[DeviceRequirement]) -> Result<Vec<AllocationContext>> {
        let mut contexts = Vec::with_capacity(requirements.len());
        for (offset, requirement) in requirements.iter().enumerate() {
            let index = offset + 1;
            match self.reserve(index, requirement) {
                Ok(resource) => {
                    if let Some(resource) = &resource {
                        info!("DUT index {index} allocated {}", resource.resource_id);
                    }
                    contexts.push(AllocationContext {
                        index,
                        requirement: requirement.clone(),
                        resource,
                    });
                },
                Err(e) => {
                    self.release(&contexts);
                    return Err(e);
                },
            }
        }
        Ok(contexts)
    }

    fn release(&mut self, contexts: &[AllocationContext]) {
        for context in contexts {
            if let Some(resource) = &context.resource {
                self.unreserve(&resource.resource_id);
            }
        }
    }
}

fn platform_list(requirement: &DeviceRequirement) -> String {
    match (&requirement.platform_name, requirement.allowed_platforms.as_slice()) {
        (Some(name), _) => name.clone(),
        (None, []) => "any".to_string(),
        (None, list) => list.join(", "),
    }
}

/// Locate a binary by path, or on `PATH` when given a bare name.
pub fn resolve_binary(bin: &Path) -> Option<PathBuf> {
    if bin.components().count() > 1 || bin.is_absolute() {
        return bin.is_file().then(|| bin.to_path_buf());
    }
    env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths)
            .map(|dir| dir.join(bin))
            .find(|candidate| candidate.is_file())
    })
}
