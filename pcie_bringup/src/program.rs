// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Widen-then-tighten programming of BARs and bridge windows.
//!
//! Phase A opens every bridge's base/limit pair so that config-programmed
//! BAR writes reach their targets anywhere in the tree. Phase B then walks
//! the planned resource lists, writes final BAR values, and rewrites each
//! bridge window to its tight range, memory first, then I/O.

use crate::bar::bar_offset;
use crate::tree::BridgeId;
use crate::tree::ResourceKind;
use crate::tree::ResourceTree;
use crate::PciError;
use pci_core::spec::cfg_space::HeaderType01;
use std::sync::Arc;

/// Phase A: post-order over every non-root bridge, writing the widened
/// encodings of the host window limits.
pub fn widen_bridge_windows(tree: &ResourceTree, bridge: BridgeId, mem_limit: u32, io_limit: u16) {
    for &child in &tree.bridge(bridge).children {
        widen_bridge_windows(tree, child, mem_limit, io_limit);
    }

    if tree.bridge(bridge).parent.is_some() {
        let device = &tree.bridge(bridge).device;
        device.config_write_u32(
            HeaderType01::MEMORY_RANGE.0,
            (mem_limit >> 16) | (mem_limit & 0xFFFF_0000),
        );
        device.config_write_u32(
            HeaderType01::SEC_STATUS_IO_RANGE.0,
            ((io_limit >> 8) | (io_limit & 0xFF00)) as u32,
        );
    }
}

/// Phase B, memory kind: programs `bridge`'s planned memory nodes into the
/// window `[mem_base, mem_limit]`.
pub fn apply_mem_resources(
    tree: &ResourceTree,
    bridge: BridgeId,
    mem_base: u32,
    mem_limit: u32,
) -> Result<(), PciError> {
    let mut cursor = tree.first_resource(bridge, ResourceKind::MEM_GROUP);

    while let Some(id) = cursor {
        let node = tree.resource(id);
        let base = mem_base as u64 + node.offset as u64;
        let end = base + node.length as u64 - 1;

        if node.kind == ResourceKind::MEM_RESOURCE {
            node.device.config_write_u32(bar_offset(node.bar), base as u32);
            if end > mem_limit as u64 {
                tracing::error!(
                    device = %node.device.sbdf(),
                    bar = node.bar,
                    end,
                    mem_limit,
                    "memory window exhausted"
                );
                return Err(PciError::OutOfResources);
            }
        } else {
            // A bridge window: program the child bridge's base/limit pair
            // and descend with the tightened window.
            node.device.config_write_u32(
                HeaderType01::MEMORY_RANGE.0,
                ((base as u32) >> 16) | (end as u32 & 0xFFFF_0000),
            );
            if end > mem_limit as u64 {
                tracing::error!(
                    bridge = %node.device.sbdf(),
                    end,
                    mem_limit,
                    "memory window exhausted by bridge aperture"
                );
                return Err(PciError::OutOfResources);
            }
            let child = child_bridge_of(tree, bridge, &node.device);
            apply_mem_resources(tree, child, base as u32, end as u32)?;
        }

        cursor = tree.next_resource(bridge, id, ResourceKind::MEM_GROUP);
    }
    Ok(())
}

/// Phase B, I/O kind: programs `bridge`'s planned I/O nodes into the window
/// `[io_base, io_limit]`. Windows beyond the 16-bit port space are not
/// supported.
pub fn apply_io_resources(
    tree: &ResourceTree,
    bridge: BridgeId,
    io_base: u16,
    io_limit: u16,
) -> Result<(), PciError> {
    let mut cursor = tree.first_resource(bridge, ResourceKind::IO_GROUP);

    while let Some(id) = cursor {
        let node = tree.resource(id);
        let base = io_base as u32 + node.offset;
        let end = base as u64 + node.length as u64 - 1;

        if node.kind == ResourceKind::IO_RESOURCE {
            node.device.config_write_u32(bar_offset(node.bar), base);
            if end > io_limit as u64 {
                tracing::error!(
                    device = %node.device.sbdf(),
                    bar = node.bar,
                    end,
                    io_limit,
                    "I/O window exhausted"
                );
                return Err(PciError::OutOfResources);
            }
        } else {
            if end > u16::MAX as u64 {
                tracing::error!(
                    bridge = %node.device.sbdf(),
                    end,
                    "32-bit I/O window not supported"
                );
                return Err(PciError::Unsupported);
            }
            let end = end as u32;
            node.device.config_write_u32(
                HeaderType01::SEC_STATUS_IO_RANGE.0,
                (base >> 8) | (end & 0xFF00),
            );
            if end > io_limit as u32 {
                tracing::error!(
                    bridge = %node.device.sbdf(),
                    end,
                    io_limit,
                    "I/O window exhausted by bridge aperture"
                );
                return Err(PciError::OutOfResources);
            }
            let child = child_bridge_of(tree, bridge, &node.device);
            apply_io_resources(tree, child, base as u16, end as u16)?;
        }

        cursor = tree.next_resource(bridge, id, ResourceKind::IO_GROUP);
    }
    Ok(())
}

/// The child of `bridge` whose device record is `device`. Aperture nodes
/// are created from their child bridge's record, so the lookup cannot fail
/// on a planned tree.
fn child_bridge_of(
    tree: &ResourceTree,
    bridge: BridgeId,
    device: &Arc<crate::tree::DeviceRecord>,
) -> BridgeId {
    tree.bridge(bridge)
        .children
        .iter()
        .copied()
        .find(|&child| Arc::ptr_eq(&tree.bridge(child).device, device))
        .expect("aperture owner is a child bridge")
}
