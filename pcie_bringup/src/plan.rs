// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Offset planning: packs each bridge's resources and propagates windows
//! upward.
//!
//! Memory and I/O kinds are planned by the same algorithm, independently.
//! Sorting largest-first means the round-up in the offset rule never wastes
//! more than the next node's own length in padding.

use crate::tree::BridgeId;
use crate::tree::ResourceId;
use crate::tree::ResourceKind;
use crate::tree::ResourceNode;
use crate::tree::ResourceTree;
use std::sync::Arc;

/// Memory windows are granted in 1 MiB blocks (the bridge memory base/limit
/// registers cannot express anything finer).
pub const MEM_APERTURE_GRANULARITY: u32 = 0x10_0000;
/// I/O windows are granted in 4 KiB blocks.
pub const IO_APERTURE_GRANULARITY: u32 = 0x1000;

/// Plans the whole tree: assigns an offset to every resource node and
/// materializes one aperture per kind on each bridge's parent.
///
/// Idempotent: re-planning recomputes every offset from scratch and updates
/// existing apertures in place.
pub fn plan(tree: &mut ResourceTree) {
    plan_bridge(tree, tree.root());
}

fn plan_bridge(tree: &mut ResourceTree, bridge: BridgeId) {
    // Children first, so their apertures are on this bridge's list before
    // it is sorted and packed.
    let children = tree.bridge(bridge).children.clone();
    for child in children {
        plan_bridge(tree, child);
    }

    tree.sort_resources_by_descending_length(bridge);
    assign_offsets(tree, bridge, ResourceKind::MEM_GROUP);
    assign_offsets(tree, bridge, ResourceKind::IO_GROUP);

    if tree.bridge(bridge).parent.is_some() {
        publish_aperture(
            tree,
            bridge,
            ResourceKind::MEM_GROUP,
            ResourceKind::MEM_APERTURE,
            MEM_APERTURE_GRANULARITY,
        );
        publish_aperture(
            tree,
            bridge,
            ResourceKind::IO_GROUP,
            ResourceKind::IO_APERTURE,
            IO_APERTURE_GRANULARITY,
        );
    }
}

/// Assigns offsets to the `group` nodes of `bridge` in list order: the
/// first node sits at offset 0, every subsequent node at the end of its
/// predecessor rounded up to a multiple of its own power-of-two length.
fn assign_offsets(tree: &mut ResourceTree, bridge: BridgeId, group: ResourceKind) {
    let Some(first) = tree.first_resource(bridge, group) else {
        return;
    };
    tree.resource_mut(first).offset = 0;

    let mut previous = first;
    while let Some(current) = tree.next_resource(bridge, previous, group) {
        let end = {
            let node = tree.resource(previous);
            node.offset + node.length
        };
        let length = tree.resource(current).length;
        let mut offset = end;
        if offset & (length - 1) != 0 {
            offset = (offset & !(length - 1)) + length;
        }
        tree.resource_mut(current).offset = offset;
        previous = current;
    }
}

/// Publishes the span of `bridge`'s `group` nodes as a single aperture node
/// of kind `kind` on the parent's list, if the group is non-empty.
fn publish_aperture(
    tree: &mut ResourceTree,
    bridge: BridgeId,
    group: ResourceKind,
    kind: ResourceKind,
    granularity: u32,
) {
    let Some(last) = tree.last_resource(bridge, group) else {
        return;
    };
    let first = tree
        .first_resource(bridge, group)
        .expect("group is non-empty");

    let mut length = {
        let node = tree.resource(last);
        node.offset + node.length
    };
    if length & (granularity - 1) != 0 {
        length = (length & !(granularity - 1)) + granularity;
    }
    let alignment = tree.resource(first).alignment.max(length - 1);
    let device = tree.bridge(bridge).device.clone();
    let parent = tree.bridge(bridge).parent.expect("bridge is not the root");

    tracing::debug!(
        secondary_bus = tree.bridge(bridge).secondary_bus,
        ?kind,
        length,
        "aperture propagated"
    );

    if let Some(existing) = find_aperture(tree, parent, kind, &device) {
        let node = tree.resource_mut(existing);
        node.length = length;
        node.alignment = alignment;
        node.offset = 0;
    } else {
        tree.add_resource(
            parent,
            ResourceNode {
                bar: 0,
                length,
                offset: 0,
                alignment,
                kind,
                device,
            },
        );
    }
}

fn find_aperture(
    tree: &ResourceTree,
    parent: BridgeId,
    kind: ResourceKind,
    device: &Arc<crate::tree::DeviceRecord>,
) -> Option<ResourceId> {
    tree.resources_of(parent, kind)
        .into_iter()
        .find(|&id| Arc::ptr_eq(&tree.resource(id).device, device))
}
