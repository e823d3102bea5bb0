// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The bridge/endpoint/resource tree assembled during discovery.
//!
//! Bridges and resource nodes live in arenas owned by the tree and refer to
//! each other by integer id, so the whole structure is dropped in one
//! teardown. Device records are `Arc`-shared: a record published as an
//! access object keeps itself and, through the parent chain, every
//! ancestor record alive after the tree is gone.

use crate::services::DevicePath;
use crate::services::Platform;
use core::fmt;
use parking_lot::Mutex;
use pci_core::spec::cfg_space;
use pci_core::Sbdf;
use std::sync::Arc;

/// Attribute bits carried by device records and host bridge descriptions.
pub mod attributes {
    /// Port-I/O decode.
    pub const IO: u64 = 1 << 0;
    /// Memory decode.
    pub const MEMORY: u64 = 1 << 1;
    /// Bus mastering.
    pub const BUS_MASTER: u64 = 1 << 2;
    /// The canonical enable set.
    pub const DEVICE_ENABLE: u64 = IO | MEMORY | BUS_MASTER;
}

struct DeviceRecordState {
    supports: u64,
    attributes: u64,
    device_path: Option<DevicePath>,
}

/// Per-function record backing both resource bookkeeping and the published
/// access object.
pub struct DeviceRecord {
    sbdf: Sbdf,
    cfg_base: u64,
    parent: Option<Arc<DeviceRecord>>,
    platform: Arc<Platform>,
    state: Mutex<DeviceRecordState>,
}

impl DeviceRecord {
    /// Creates a record. `supports` is the attribute set the function may
    /// ever be granted; the current attribute mask starts empty.
    pub fn new(
        sbdf: Sbdf,
        cfg_base: u64,
        supports: u64,
        parent: Option<Arc<DeviceRecord>>,
        platform: Arc<Platform>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sbdf,
            cfg_base,
            parent,
            platform,
            state: Mutex::new(DeviceRecordState {
                supports,
                attributes: 0,
                device_path: None,
            }),
        })
    }

    pub fn sbdf(&self) -> Sbdf {
        self.sbdf
    }

    /// The precomputed linear address of the function's config space.
    pub fn cfg_base(&self) -> u64 {
        self.cfg_base
    }

    pub fn parent(&self) -> Option<&Arc<DeviceRecord>> {
        self.parent.as_ref()
    }

    pub(crate) fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    /// The attribute set the function may be granted.
    pub fn supports(&self) -> u64 {
        self.state.lock().supports
    }

    /// Marks the function unusable for resource allocation; nothing can be
    /// enabled on it afterwards.
    pub fn invalidate_supports(&self) {
        self.state.lock().supports = 0;
    }

    /// The currently granted attribute set.
    pub fn current_attributes(&self) -> u64 {
        self.state.lock().attributes
    }

    pub(crate) fn grant_attributes(&self, attributes: u64) {
        self.state.lock().attributes |= attributes;
    }

    pub(crate) fn revoke_attributes(&self, attributes: u64) {
        self.state.lock().attributes &= !attributes;
    }

    /// The path recorded when the record was published, if any.
    pub fn device_path(&self) -> Option<DevicePath> {
        self.state.lock().device_path.clone()
    }

    pub(crate) fn set_device_path(&self, path: DevicePath) {
        self.state.lock().device_path = Some(path);
    }

    pub(crate) fn config_read_u16(&self, offset: u16) -> u16 {
        self.platform.config.read_u16(self.cfg_base + offset as u64)
    }

    pub(crate) fn config_read_u32(&self, offset: u16) -> u32 {
        self.platform.config.read_u32(self.cfg_base + offset as u64)
    }

    pub(crate) fn config_write_u16(&self, offset: u16, value: u16) {
        self.platform
            .config
            .write_u16(self.cfg_base + offset as u64, value);
    }

    pub(crate) fn config_write_u32(&self, offset: u16, value: u32) {
        self.platform
            .config
            .write_u32(self.cfg_base + offset as u64, value);
    }

    /// The live value of the BAR register with the given index.
    pub(crate) fn bar_register(&self, bar: u8) -> u32 {
        self.config_read_u32(cfg_space::HeaderType00::BAR0.0 + 4 * bar as u16)
    }
}

impl fmt::Debug for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRecord")
            .field("sbdf", &self.sbdf)
            .field("supports", &self.supports())
            .field("attributes", &self.current_attributes())
            .finish()
    }
}

/// Resource node kind: two orthogonal bits (I/O vs memory, device BAR vs
/// bridge window) packed as flags so a kind-group query is one mask test.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ResourceKind(u8);

impl ResourceKind {
    /// A device I/O BAR.
    pub const IO_RESOURCE: Self = Self(1 << 0);
    /// A device memory BAR.
    pub const MEM_RESOURCE: Self = Self(1 << 1);
    /// A bridge I/O window.
    pub const IO_APERTURE: Self = Self(1 << 2);
    /// A bridge memory window.
    pub const MEM_APERTURE: Self = Self(1 << 3);

    /// Every I/O-kind node, BAR or window.
    pub const IO_GROUP: Self = Self(Self::IO_RESOURCE.0 | Self::IO_APERTURE.0);
    /// Every memory-kind node, BAR or window.
    pub const MEM_GROUP: Self = Self(Self::MEM_RESOURCE.0 | Self::MEM_APERTURE.0);

    /// Whether this kind is a member of `group`.
    pub fn intersects(self, group: ResourceKind) -> bool {
        self.0 & group.0 != 0
    }

    /// Whether this kind is a bridge window.
    pub fn is_aperture(self) -> bool {
        self.intersects(Self(Self::IO_APERTURE.0 | Self::MEM_APERTURE.0))
    }
}

impl fmt::Debug for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IO_RESOURCE => f.pad("IoResource"),
            Self::MEM_RESOURCE => f.pad("MemResource"),
            Self::IO_APERTURE => f.pad("IoAperture"),
            Self::MEM_APERTURE => f.pad("MemAperture"),
            other => write!(f, "ResourceKind({:#b})", other.0),
        }
    }
}

/// One allocatable decode: a device BAR or a propagated bridge window.
#[derive(Debug)]
pub struct ResourceNode {
    /// BAR index 0..=5 for BAR nodes; unused for apertures.
    pub bar: u8,
    /// Length in bytes. A power of two for BAR nodes; apertures are
    /// rounded up to their granularity by the planner.
    pub length: u32,
    /// Offset within the parent bridge window, assigned by the planner.
    pub offset: u32,
    /// Alignment requirement, expressed as `alignment + 1`-multiple bases.
    pub alignment: u32,
    /// Kind tag.
    pub kind: ResourceKind,
    /// For BAR nodes, the owning function; for apertures, the child
    /// bridge's own device record (so the programmer can reach the child
    /// bridge's base/limit registers).
    pub device: Arc<DeviceRecord>,
}

/// Arena id of a bridge node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BridgeId(usize);

/// Arena id of a resource node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ResourceId(usize);

/// One bridge (the synthetic root included) and everything attached to it.
#[derive(Debug)]
pub struct BridgeNode {
    /// The bus number on the downstream side of the bridge.
    pub secondary_bus: u8,
    /// Parent bridge, `None` for the synthetic root.
    pub parent: Option<BridgeId>,
    /// The bridge's own device record.
    pub device: Arc<DeviceRecord>,
    /// Child bridges, in discovery order.
    pub children: Vec<BridgeId>,
    /// Resource nodes on this bridge, in planner order.
    pub resources: Vec<ResourceId>,
    /// Endpoint records under this bridge, in discovery order.
    pub endpoints: Vec<Arc<DeviceRecord>>,
}

/// The tree, rooted at the synthetic root bridge (id 0).
pub struct ResourceTree {
    bridges: Vec<BridgeNode>,
    resources: Vec<ResourceNode>,
}

impl ResourceTree {
    /// Creates a tree containing only the synthetic root bridge.
    pub fn new(root_device: Arc<DeviceRecord>, secondary_bus: u8) -> Self {
        Self {
            bridges: vec![BridgeNode {
                secondary_bus,
                parent: None,
                device: root_device,
                children: Vec::new(),
                resources: Vec::new(),
                endpoints: Vec::new(),
            }],
            resources: Vec::new(),
        }
    }

    pub fn root(&self) -> BridgeId {
        BridgeId(0)
    }

    pub fn bridge(&self, id: BridgeId) -> &BridgeNode {
        &self.bridges[id.0]
    }

    pub fn bridge_mut(&mut self, id: BridgeId) -> &mut BridgeNode {
        &mut self.bridges[id.0]
    }

    pub fn resource(&self, id: ResourceId) -> &ResourceNode {
        &self.resources[id.0]
    }

    pub fn resource_mut(&mut self, id: ResourceId) -> &mut ResourceNode {
        &mut self.resources[id.0]
    }

    /// Appends a child bridge under `parent`.
    pub fn add_bridge(
        &mut self,
        parent: BridgeId,
        secondary_bus: u8,
        device: Arc<DeviceRecord>,
    ) -> BridgeId {
        let id = BridgeId(self.bridges.len());
        self.bridges.push(BridgeNode {
            secondary_bus,
            parent: Some(parent),
            device,
            children: Vec::new(),
            resources: Vec::new(),
            endpoints: Vec::new(),
        });
        self.bridges[parent.0].children.push(id);
        id
    }

    /// Appends a resource node to `bridge`'s list.
    pub fn add_resource(&mut self, bridge: BridgeId, node: ResourceNode) -> ResourceId {
        let id = ResourceId(self.resources.len());
        self.resources.push(node);
        self.bridges[bridge.0].resources.push(id);
        id
    }

    /// First node of `group` on `bridge`'s list, in list order.
    pub fn first_resource(&self, bridge: BridgeId, group: ResourceKind) -> Option<ResourceId> {
        self.bridges[bridge.0]
            .resources
            .iter()
            .copied()
            .find(|&id| self.resources[id.0].kind.intersects(group))
    }

    /// Next node of `group` after `node` on `bridge`'s list.
    pub fn next_resource(
        &self,
        bridge: BridgeId,
        node: ResourceId,
        group: ResourceKind,
    ) -> Option<ResourceId> {
        let list = &self.bridges[bridge.0].resources;
        let position = list.iter().position(|&id| id == node)?;
        list[position + 1..]
            .iter()
            .copied()
            .find(|&id| self.resources[id.0].kind.intersects(group))
    }

    /// Last node of `group` on `bridge`'s list.
    pub fn last_resource(&self, bridge: BridgeId, group: ResourceKind) -> Option<ResourceId> {
        self.bridges[bridge.0]
            .resources
            .iter()
            .copied()
            .rev()
            .find(|&id| self.resources[id.0].kind.intersects(group))
    }

    /// Ids of `group` nodes on `bridge`, in list order.
    pub fn resources_of(&self, bridge: BridgeId, group: ResourceKind) -> Vec<ResourceId> {
        self.bridges[bridge.0]
            .resources
            .iter()
            .copied()
            .filter(|&id| self.resources[id.0].kind.intersects(group))
            .collect()
    }

    /// Drops every resource node owned by the function at `sbdf` from
    /// `bridge`'s list.
    pub fn remove_resources_by_sbdf(&mut self, bridge: BridgeId, sbdf: Sbdf) {
        let resources = &self.resources;
        self.bridges[bridge.0]
            .resources
            .retain(|&id| resources[id.0].device.sbdf() != sbdf);
    }

    /// Stable-sorts `bridge`'s resource list by descending length.
    pub fn sort_resources_by_descending_length(&mut self, bridge: BridgeId) {
        let mut list = std::mem::take(&mut self.bridges[bridge.0].resources);
        let resources = &self.resources;
        list.sort_by(|&a, &b| resources[b.0].length.cmp(&resources[a.0].length));
        self.bridges[bridge.0].resources = list;
    }
}
