// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The two enumeration walks: bus-number assignment and resource discovery.

use crate::bar;
use crate::bar::BarSize;
use crate::cfg::CfgAccess;
use crate::essential;
use crate::services::Platform;
use crate::tree::attributes;
use crate::tree::BridgeId;
use crate::tree::DeviceRecord;
use crate::tree::ResourceKind;
use crate::tree::ResourceNode;
use crate::tree::ResourceTree;
use crate::PciError;
use pci_core::spec::caps::CapabilityId;
use pci_core::spec::cfg_space;
use pci_core::Sbdf;
use std::sync::Arc;

/// Highest device number on a bus.
pub const MAX_DEVICE: u8 = 31;
/// Highest function number on a device.
pub const MAX_FUNCTION: u8 = 7;

/// Walks every bridge on the host bridge's root bus and assigns secondary
/// and subordinate bus numbers across the whole hierarchy, consuming bus
/// numbers monotonically from `root_bus + 1` up to `bus_limit`.
pub fn assign_root_bus_numbers(
    cfg: &CfgAccess,
    segment: u16,
    root_bus: u8,
    bus_limit: u8,
) -> Result<(), PciError> {
    let mut next_free = root_bus as u16 + 1;

    for device in 0..=MAX_DEVICE {
        for function in 0..=MAX_FUNCTION {
            let mut sbdf = Sbdf::new(segment, root_bus, device, function);
            if !cfg.is_present(sbdf) {
                if function == 0 {
                    break;
                }
                continue;
            }
            sbdf.pcie_cap = cfg.find_capability(sbdf, CapabilityId::PCI_EXPRESS);
            if cfg.device_type(sbdf).is_bridge() {
                let highest = assign_bus_numbers(cfg, sbdf, next_free, bus_limit)?;
                next_free = highest as u16 + 1;
            }
            if function == 0 && !cfg.is_multi_function(sbdf) {
                break;
            }
        }
    }
    Ok(())
}

/// Gives `bridge` the secondary bus `secondary`, recursively numbers every
/// bridge behind it, and tightens the subordinate register to the highest
/// bus actually used. Returns that highest bus number.
fn assign_bus_numbers(
    cfg: &CfgAccess,
    bridge: Sbdf,
    secondary: u16,
    bus_limit: u8,
) -> Result<u8, PciError> {
    if secondary > bus_limit as u16 {
        tracing::warn!(%bridge, secondary, bus_limit, "bus numbers exhausted");
        return Err(PciError::OutOfResources);
    }
    let secondary = secondary as u8;

    // Tentatively open the bridge to the whole remaining bus range so that
    // config cycles reach everything behind it while the subtree is walked.
    cfg.write_u32(
        bridge,
        cfg_space::HeaderType01::LATENCY_BUS_NUMBERS.0,
        (bus_limit as u32) << 16 | (secondary as u32) << 8 | bridge.bus as u32,
    );
    tracing::debug!(%bridge, secondary, "bridge secondary bus assigned");

    let mut highest = secondary;
    for device in 0..=MAX_DEVICE {
        for function in 0..=MAX_FUNCTION {
            let mut sbdf = Sbdf::new(bridge.segment, secondary, device, function);
            if !cfg.is_present(sbdf) {
                if function == 0 {
                    break;
                }
                continue;
            }
            sbdf.pcie_cap = cfg.find_capability(sbdf, CapabilityId::PCI_EXPRESS);
            if cfg.device_type(sbdf).is_bridge() {
                highest = assign_bus_numbers(cfg, sbdf, highest as u16 + 1, bus_limit)?;
            }
            if function == 0 && !cfg.is_multi_function(sbdf) {
                break;
            }
        }
    }

    cfg.write_u8(bridge, cfg_space::SUBORDINATE_BUS_OFFSET, highest);
    Ok(highest)
}

/// Discovers functions on `bridge_id`'s secondary bus, records bridges and
/// essential endpoints with their sized BARs, and recurses into child
/// bridges. Functions that are already decoding are left completely alone.
pub fn discover_resources(
    tree: &mut ResourceTree,
    bridge_id: BridgeId,
    cfg: &CfgAccess,
    platform: &Arc<Platform>,
) {
    let secondary = tree.bridge(bridge_id).secondary_bus;
    let segment = tree.bridge(bridge_id).device.sbdf().segment;
    let parent_device = tree.bridge(bridge_id).device.clone();

    for device in 0..=MAX_DEVICE {
        for function in 0..=MAX_FUNCTION {
            let mut sbdf = Sbdf::new(segment, secondary, device, function);
            if !cfg.is_present(sbdf) {
                if function == 0 {
                    break;
                }
                continue;
            }
            sbdf.pcie_cap = cfg.find_capability(sbdf, CapabilityId::PCI_EXPRESS);

            let is_bridge = cfg.device_type(sbdf).is_bridge();
            if (is_bridge || essential::is_essential(cfg, sbdf)) && !cfg.is_decoding(sbdf) {
                let record = DeviceRecord::new(
                    sbdf,
                    cfg.base_address(sbdf),
                    attributes::DEVICE_ENABLE,
                    Some(parent_device.clone()),
                    platform.clone(),
                );
                probe_function_bars(tree, bridge_id, cfg, &record, is_bridge);

                if is_bridge {
                    let child_secondary = cfg.read_u8(sbdf, cfg_space::SECONDARY_BUS_OFFSET);
                    let child = tree.add_bridge(bridge_id, child_secondary, record);
                    discover_resources(tree, child, cfg, platform);
                } else {
                    tracing::debug!(%sbdf, "essential endpoint recorded");
                    tree.bridge_mut(bridge_id).endpoints.push(record);
                }
            }

            if function == 0 && !cfg.is_multi_function(sbdf) {
                break;
            }
        }
    }
}

/// Sizes the function's BARs (0..=1 for bridges, 0..=5 for endpoints) and
/// inserts one resource node per live decode. A BAR the phase cannot place
/// invalidates the whole function: its nodes are removed and its supported
/// attribute mask is zeroed, but the record stays so bridge ancestry still
/// aggregates.
fn probe_function_bars(
    tree: &mut ResourceTree,
    bridge_id: BridgeId,
    cfg: &CfgAccess,
    record: &Arc<DeviceRecord>,
    is_bridge: bool,
) {
    let sbdf = record.sbdf();
    let bar_limit = if is_bridge { 1 } else { 5 };

    let mut bar = 0;
    while bar <= bar_limit {
        let (length, kind, skip_next) = match bar::probe(cfg, sbdf, bar) {
            BarSize::Absent => {
                bar += 1;
                continue;
            }
            BarSize::Io { len } => (len, ResourceKind::IO_RESOURCE, false),
            BarSize::Mem32 { len, .. } => (len, ResourceKind::MEM_RESOURCE, false),
            // The paired high half is not a BAR of its own.
            BarSize::Mem64Low { len, .. } => (len, ResourceKind::MEM_RESOURCE, true),
            BarSize::UnsupportedAbove2G => {
                tracing::warn!(%sbdf, bar, "64-bit BAR above 2 GiB, function invalidated");
                tree.remove_resources_by_sbdf(bridge_id, sbdf);
                record.invalidate_supports();
                return;
            }
        };

        tracing::debug!(%sbdf, bar, length, ?kind, "BAR sized");
        tree.add_resource(
            bridge_id,
            ResourceNode {
                bar,
                length,
                offset: 0,
                alignment: length - 1,
                kind,
                device: record.clone(),
            },
        );
        bar += if skip_next { 2 } else { 1 };
    }
}
