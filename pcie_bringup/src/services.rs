// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Ambient service seams consumed by the bringup engine.
//!
//! Everything in this module is a contract: the production backends (real
//! ECAM/MMIO/port cycles, a calibrated stall, the platform IOMMU) are
//! supplied by the surrounding firmware, and the tests supply emulated
//! ones. The engine only ever holds `Arc<dyn ...>` handles.

use crate::PciError;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Raw configuration-space access at a linear enhanced-configuration
/// (ECAM) address.
///
/// Address computation from SBDF coordinates is the caller's business (see
/// [`crate::cfg::CfgAccess`]); this trait only issues the cycles.
pub trait ConfigAccess: Send + Sync {
    fn read_u8(&self, address: u64) -> u8;
    fn read_u16(&self, address: u64) -> u16;
    fn read_u32(&self, address: u64) -> u32;
    fn write_u8(&self, address: u64, value: u8);
    fn write_u16(&self, address: u64, value: u16);
    fn write_u32(&self, address: u64, value: u32);
}

/// Raw memory-mapped I/O access.
pub trait MmioAccess: Send + Sync {
    fn read_u8(&self, address: u64) -> u8;
    fn read_u16(&self, address: u64) -> u16;
    fn read_u32(&self, address: u64) -> u32;
    fn write_u8(&self, address: u64, value: u8);
    fn write_u16(&self, address: u64, value: u16);
    fn write_u32(&self, address: u64, value: u32);
}

/// Raw port I/O access. Only the 16-bit port space exists in this phase.
pub trait PortIoAccess: Send + Sync {
    fn read_u8(&self, port: u16) -> u8;
    fn read_u16(&self, port: u16) -> u16;
    fn read_u32(&self, port: u16) -> u32;
    fn write_u8(&self, port: u16, value: u8);
    fn write_u16(&self, port: u16, value: u16);
    fn write_u32(&self, port: u16, value: u32);
}

/// Calibrated busy-wait stall.
pub trait DelayTimer: Send + Sync {
    /// Stalls execution for at least `microseconds`.
    fn delay_us(&self, microseconds: u64);
}

/// The direction of a bus-master transfer being mapped for DMA.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DmaOperation {
    /// The device will read from system memory.
    BusMasterRead,
    /// The device will write to system memory.
    BusMasterWrite,
    /// The device and the host share the buffer in both directions.
    BusMasterCommonBuffer,
}

/// The device may read through the mapping.
pub const IOMMU_ACCESS_READ: u64 = 1 << 0;
/// The device may write through the mapping.
pub const IOMMU_ACCESS_WRITE: u64 = 1 << 1;

/// A live DMA mapping handed out by the [`IommuService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmaMapping {
    /// The address the device uses to reach the mapped range.
    pub device_address: u64,
    /// The mapped length in bytes.
    pub bytes: usize,
    /// Opaque token the service uses to identify the mapping.
    pub token: u64,
}

/// Contract of the upstream DMA-remapping service.
pub trait IommuService: Send + Sync {
    /// Maps `bytes` of system memory at `host_address` for the given
    /// transfer direction.
    fn map(
        &self,
        operation: DmaOperation,
        host_address: u64,
        bytes: usize,
    ) -> Result<DmaMapping, PciError>;

    /// Releases a mapping previously returned by [`IommuService::map`].
    fn unmap(&self, mapping: DmaMapping) -> Result<(), PciError>;

    /// Grants or revokes device access rights on a live mapping.
    fn set_attributes(&self, mapping: &DmaMapping, access: u64) -> Result<(), PciError>;

    /// Allocates zeroed pages suitable for a common-buffer mapping,
    /// returning the host address.
    fn allocate_buffer(&self, pages: usize) -> Result<u64, PciError>;

    /// Frees pages returned by [`IommuService::allocate_buffer`].
    fn free_buffer(&self, pages: usize, host_address: u64) -> Result<(), PciError>;
}

/// Well-known identity of a registered service (a 16-byte GUID).
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ServiceId(pub u128);

impl fmt::Debug for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            (b >> 96) as u32,
            (b >> 80) as u16,
            (b >> 64) as u16,
            (b >> 48) as u16,
            b & 0xFFFF_FFFF_FFFF
        )
    }
}

/// Identity under which per-endpoint access objects are published
/// ([`crate::bringup::PciDeviceRegistration`]).
pub const PCI_DEVICE_ID: ServiceId = ServiceId(0x1597ab4f_d542_4efe_9af7_b244ec544c0b);
/// Identity of the terminator-flagged marker installed once every host
/// bridge has been processed ([`PciDevicesReady`]).
pub const PCI_DEVICES_READY_ID: ServiceId = ServiceId(0x8d48bd70_7f60_4479_b8e7_1a0199cee72b);
/// Identity under which the platform registers its [`IommuService`]
/// (wrapped in an [`IommuRegistration`]).
pub const IOMMU_ID: ServiceId = ServiceId(0x70b0af26_f847_4bb6_aeb9_d5d2d6aa6c23);

/// Registry payload carrying the platform IOMMU service.
pub struct IommuRegistration(pub Arc<dyn IommuService>);

/// Marker payload announcing that PCI bringup has finished.
pub struct PciDevicesReady;

struct RegistryEntry {
    id: ServiceId,
    terminal: bool,
    payload: Arc<dyn Any + Send + Sync>,
}

/// The locate-service facility: an ordered registry of service providers
/// keyed by well-known identity.
///
/// `locate_first` returns the earliest-registered provider, matching the
/// ambient firmware facility this stands in for.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: Mutex<Vec<RegistryEntry>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider for `id`.
    pub fn install(&self, id: ServiceId, payload: Arc<dyn Any + Send + Sync>) {
        self.install_entry(id, false, payload);
    }

    /// Registers a provider for `id` flagged as a list terminator.
    pub fn install_terminal(&self, id: ServiceId, payload: Arc<dyn Any + Send + Sync>) {
        self.install_entry(id, true, payload);
    }

    fn install_entry(&self, id: ServiceId, terminal: bool, payload: Arc<dyn Any + Send + Sync>) {
        tracing::debug!(?id, terminal, "service registered");
        self.entries.lock().push(RegistryEntry {
            id,
            terminal,
            payload,
        });
    }

    /// Returns the first registered provider of `id`.
    pub fn locate_first(&self, id: ServiceId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.payload.clone())
    }

    /// Returns every registered provider of `id`, in registration order.
    pub fn locate_all(&self, id: ServiceId) -> Vec<Arc<dyn Any + Send + Sync>> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.id == id)
            .map(|entry| entry.payload.clone())
            .collect()
    }

    /// Returns whether a terminator-flagged provider of `id` exists.
    pub fn is_terminal_installed(&self, id: ServiceId) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|entry| entry.id == id && entry.terminal)
    }
}

/// One node of a device path.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DevicePathNode {
    /// A host bridge root, identified by its unique id.
    PciRoot { uid: u32 },
    /// A PCI function, identified by device and function number on its bus.
    Pci { device: u8, function: u8 },
}

/// An append-only path from a host bridge down to a function.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DevicePath {
    nodes: Vec<DevicePathNode>,
}

impl DevicePath {
    /// A path consisting of a single host bridge root node.
    pub fn pci_root(uid: u32) -> Self {
        Self {
            nodes: vec![DevicePathNode::PciRoot { uid }],
        }
    }

    /// Returns a new path with `node` appended.
    pub fn appended(&self, node: DevicePathNode) -> Self {
        let mut nodes = self.nodes.clone();
        nodes.push(node);
        Self { nodes }
    }

    /// The nodes of the path, root first.
    pub fn nodes(&self) -> &[DevicePathNode] {
        &self.nodes
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, node) in self.nodes.iter().enumerate() {
            if index != 0 {
                f.write_str("/")?;
            }
            match node {
                DevicePathNode::PciRoot { uid } => write!(f, "PciRoot({:#x})", uid)?,
                DevicePathNode::Pci { device, function } => {
                    write!(f, "Pci({:#x},{:#x})", device, function)?
                }
            }
        }
        Ok(())
    }
}

/// The bundle of ambient backends handed to the bringup engine.
pub struct Platform {
    /// Raw configuration-space cycles.
    pub config: Arc<dyn ConfigAccess>,
    /// Raw memory-mapped I/O cycles.
    pub mmio: Arc<dyn MmioAccess>,
    /// Raw port I/O cycles.
    pub io: Arc<dyn PortIoAccess>,
    /// The calibrated stall used by poll operations.
    pub timer: Arc<dyn DelayTimer>,
    /// The locate-service facility.
    pub registry: Arc<ServiceRegistry>,
}
