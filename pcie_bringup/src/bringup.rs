// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-host-bridge orchestration.
//!
//! Each host bridge is brought up independently: bus-number assignment,
//! resource discovery, planning, programming, device enablement, facade
//! publication, teardown. A failing host bridge is abandoned (its tree is
//! dropped and nothing is published for it) and the next one proceeds.

use crate::cfg::CfgAccess;
use crate::device::PciDeviceIo;
use crate::enumerate;
use crate::plan;
use crate::program;
use crate::services::DevicePath;
use crate::services::DevicePathNode;
use crate::services::PciDevicesReady;
use crate::services::Platform;
use crate::services::PCI_DEVICES_READY_ID;
use crate::services::PCI_DEVICE_ID;
use crate::tree::attributes;
use crate::tree::BridgeId;
use crate::tree::DeviceRecord;
use crate::tree::ResourceTree;
use crate::PciError;
use pci_core::Sbdf;
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Description of one host bridge, supplied by the platform's host bridge
/// provider.
#[derive(Clone, Debug)]
pub struct HostBridge {
    /// PCIe segment number.
    pub segment: u16,
    /// Base address of the segment's enhanced configuration window.
    pub ecam_base: u64,
    /// Bus numbers decoded by this host bridge.
    pub bus: RangeInclusive<u8>,
    /// 32-bit memory window available for assignment.
    pub mem: RangeInclusive<u32>,
    /// Memory window above 4 GiB. Unused in this phase; carried so the
    /// provider contract round-trips.
    pub mem_above_4g: RangeInclusive<u64>,
    /// Port I/O window available for assignment.
    pub io: RangeInclusive<u16>,
    /// Attribute bits the host bridge supports granting.
    pub supports: u64,
    /// Device path prefix for everything under this host bridge.
    pub device_path: DevicePath,
}

/// Source of the host bridge list.
pub trait HostBridgeProvider: Send + Sync {
    fn host_bridges(&self) -> Vec<HostBridge>;
}

/// Registry payload published for each essential endpoint under
/// [`PCI_DEVICE_ID`].
pub struct PciDeviceRegistration {
    /// The endpoint's access object.
    pub device: Arc<dyn PciDeviceIo>,
    /// The endpoint's device path.
    pub device_path: DevicePath,
}

/// Brings up every host bridge the provider reports and installs the
/// terminator-flagged ready marker. Returns `Unsupported` when the system
/// has no host bridges at all.
pub fn enumerate_essential_devices(
    provider: &dyn HostBridgeProvider,
    platform: &Arc<Platform>,
) -> Result<(), PciError> {
    let host_bridges = provider.host_bridges();
    if host_bridges.is_empty() {
        tracing::info!("no PCI host bridges on the system");
        return Err(PciError::Unsupported);
    }

    for (index, host_bridge) in host_bridges.iter().enumerate() {
        if let Err(error) = bring_up_host_bridge(host_bridge, index, platform) {
            tracing::error!(index, %error, "host bridge bringup failed");
        }
    }

    platform
        .registry
        .install_terminal(PCI_DEVICES_READY_ID, Arc::new(PciDevicesReady));
    Ok(())
}

fn bring_up_host_bridge(
    host_bridge: &HostBridge,
    index: usize,
    platform: &Arc<Platform>,
) -> Result<(), PciError> {
    tracing::info!(
        index,
        segment = host_bridge.segment,
        bus_base = *host_bridge.bus.start(),
        bus_limit = *host_bridge.bus.end(),
        mem_base = *host_bridge.mem.start(),
        mem_limit = *host_bridge.mem.end(),
        io_base = *host_bridge.io.start(),
        io_limit = *host_bridge.io.end(),
        "enumerating host bridge"
    );

    let cfg = CfgAccess::new(platform.config.clone(), host_bridge.ecam_base);
    let root_bus = *host_bridge.bus.start();

    // Step 1: assign bus numbers to every bridge behind the root bus.
    enumerate::assign_root_bus_numbers(&cfg, host_bridge.segment, root_bus, *host_bridge.bus.end())?;

    // Step 2: build the resource tree under a synthetic root bridge.
    let root_sbdf = Sbdf::new(host_bridge.segment, root_bus, 0, 0);
    let root_device = DeviceRecord::new(
        root_sbdf,
        cfg.base_address(root_sbdf),
        host_bridge.supports,
        None,
        platform.clone(),
    );
    let mut tree = ResourceTree::new(root_device, root_bus);
    let root = tree.root();
    enumerate::discover_resources(&mut tree, root, &cfg, platform);

    // Step 3: plan offsets and apertures.
    plan::plan(&mut tree);

    // Step 4: widen every bridge, then tighten memory and I/O.
    program::widen_bridge_windows(&tree, root, *host_bridge.mem.end(), *host_bridge.io.end());
    program::apply_mem_resources(&tree, root, *host_bridge.mem.start(), *host_bridge.mem.end())?;
    program::apply_io_resources(&tree, root, *host_bridge.io.start(), *host_bridge.io.end())?;

    // Step 5: enable decodes from the leaves upward.
    enable_devices(&tree, root);

    // Step 6: publish access objects for the essential endpoints.
    publish_devices(&tree, root, &host_bridge.device_path, platform);

    // Step 7: the tree (and with it every unpublished record) drops here.
    Ok(())
}

/// Enables IO/MEM/bus-master on every recorded device, children before
/// parents, endpoints before their bridge.
fn enable_devices(tree: &ResourceTree, bridge: BridgeId) {
    for &child in &tree.bridge(bridge).children {
        enable_devices(tree, child);
    }

    for endpoint in &tree.bridge(bridge).endpoints {
        if let Err(error) = endpoint.enable_attributes(attributes::DEVICE_ENABLE) {
            tracing::debug!(device = %endpoint.sbdf(), %error, "endpoint not enabled");
        }
    }

    if tree.bridge(bridge).parent.is_some() {
        let device = &tree.bridge(bridge).device;
        if let Err(error) = device.enable_attributes(attributes::DEVICE_ENABLE) {
            tracing::debug!(device = %device.sbdf(), %error, "bridge not enabled");
        }
    }
}

/// Builds device paths (one PCI node per ancestor function) and registers
/// one [`PciDeviceRegistration`] per essential endpoint.
fn publish_devices(
    tree: &ResourceTree,
    bridge: BridgeId,
    path: &DevicePath,
    platform: &Arc<Platform>,
) {
    for endpoint in &tree.bridge(bridge).endpoints {
        let sbdf = endpoint.sbdf();
        let endpoint_path = path.appended(DevicePathNode::Pci {
            device: sbdf.device,
            function: sbdf.function,
        });
        endpoint.set_device_path(endpoint_path.clone());
        tracing::info!(path = %endpoint_path, device = %sbdf, "installing PCI device access");
        let device: Arc<dyn PciDeviceIo> = endpoint.clone();
        platform.registry.install(
            PCI_DEVICE_ID,
            Arc::new(PciDeviceRegistration {
                device,
                device_path: endpoint_path,
            }),
        );
    }

    for &child in &tree.bridge(bridge).children {
        let sbdf = tree.bridge(child).device.sbdf();
        let child_path = path.appended(DevicePathNode::Pci {
            device: sbdf.device,
            function: sbdf.function,
        });
        publish_devices(tree, child, &child_path, platform);
    }
}
