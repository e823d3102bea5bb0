// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Typed configuration-space access for one segment's enhanced
//! configuration (ECAM) window.

use crate::services::ConfigAccess;
use pci_core::spec::caps::pci_express;
use pci_core::spec::caps::CapabilityId;
use pci_core::spec::caps::CAP_PTR_OFFSET;
use pci_core::spec::cfg_space;
use pci_core::spec::cfg_space::Status;
use pci_core::Sbdf;
use std::sync::Arc;

/// Classification of a PCI function for enumeration purposes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceType {
    /// An ordinary function that decodes its own resources.
    Endpoint,
    /// The upstream-facing port of a switch.
    PcieUpstreamPort,
    /// A downstream-facing bridge: a root port or a downstream switch port.
    PcieDownstreamPort,
    /// A function with no PCI Express capability.
    Legacy,
}

impl DeviceType {
    /// Whether functions of this type forward a secondary bus.
    pub fn is_bridge(self) -> bool {
        matches!(self, Self::PcieUpstreamPort | Self::PcieDownstreamPort)
    }
}

/// Chain walks stop after this many links; a longer chain in the 192 bytes
/// available past the header is malformed.
const MAX_CAPABILITY_LINKS: usize = 48;

/// Config-space accessor for one host bridge's segment.
///
/// Addresses follow the enhanced 256-MiB window layout:
/// `ecam_base + (bus << 20) + (device << 15) + (function << 12) + offset`.
#[derive(Clone)]
pub struct CfgAccess {
    backend: Arc<dyn ConfigAccess>,
    ecam_base: u64,
}

impl CfgAccess {
    pub fn new(backend: Arc<dyn ConfigAccess>, ecam_base: u64) -> Self {
        Self { backend, ecam_base }
    }

    /// Linear address of the function's configuration space.
    pub fn base_address(&self, sbdf: Sbdf) -> u64 {
        self.ecam_base
            + ((sbdf.bus as u64) << 20)
            + ((sbdf.device as u64) << 15)
            + ((sbdf.function as u64) << 12)
    }

    pub fn read_u8(&self, sbdf: Sbdf, offset: u16) -> u8 {
        self.backend.read_u8(self.base_address(sbdf) + offset as u64)
    }

    pub fn read_u16(&self, sbdf: Sbdf, offset: u16) -> u16 {
        self.backend
            .read_u16(self.base_address(sbdf) + offset as u64)
    }

    pub fn read_u32(&self, sbdf: Sbdf, offset: u16) -> u32 {
        self.backend
            .read_u32(self.base_address(sbdf) + offset as u64)
    }

    pub fn write_u8(&self, sbdf: Sbdf, offset: u16, value: u8) {
        self.backend
            .write_u8(self.base_address(sbdf) + offset as u64, value);
    }

    pub fn write_u16(&self, sbdf: Sbdf, offset: u16, value: u16) {
        self.backend
            .write_u16(self.base_address(sbdf) + offset as u64, value);
    }

    pub fn write_u32(&self, sbdf: Sbdf, offset: u16, value: u32) {
        self.backend
            .write_u32(self.base_address(sbdf) + offset as u64, value);
    }

    /// Whether a function responds at these coordinates.
    pub fn is_present(&self, sbdf: Sbdf) -> bool {
        self.read_u16(sbdf, cfg_space::HeaderType00::DEVICE_VENDOR.0) != cfg_space::ABSENT_VENDOR_ID
    }

    /// Whether the function's device implements functions beyond function 0.
    pub fn is_multi_function(&self, sbdf: Sbdf) -> bool {
        self.read_u8(sbdf, cfg_space::HEADER_TYPE_OFFSET) & cfg_space::HEADER_TYPE_MULTI_FUNCTION
            != 0
    }

    /// Whether the function already claims transactions (command register
    /// I/O or memory decode enabled).
    pub fn is_decoding(&self, sbdf: Sbdf) -> bool {
        let command = cfg_space::Command::from_bits(
            self.read_u16(sbdf, cfg_space::HeaderType00::STATUS_COMMAND.0),
        );
        command.pio_enabled() || command.mmio_enabled()
    }

    /// Walks the capability chain for the capability with `id`, returning
    /// its config-space offset or 0 if absent.
    pub fn find_capability(&self, sbdf: Sbdf, id: CapabilityId) -> u8 {
        let status = Status::from_bits(
            self.read_u16(sbdf, cfg_space::HeaderType00::STATUS_COMMAND.0 + 2),
        );
        if !status.capabilities_list() {
            return 0;
        }

        let mut offset = self.read_u8(sbdf, CAP_PTR_OFFSET) & !0x3;
        for _ in 0..MAX_CAPABILITY_LINKS {
            if offset == 0 {
                break;
            }
            if CapabilityId(self.read_u8(sbdf, offset as u16)) == id {
                return offset;
            }
            offset = self.read_u8(sbdf, offset as u16 + 1) & !0x3;
        }
        0
    }

    /// Classifies the function from the device/port type field of its PCI
    /// Express capability. The cached capability offset in `sbdf` must be
    /// current.
    pub fn device_type(&self, sbdf: Sbdf) -> DeviceType {
        if sbdf.pcie_cap == 0 {
            return DeviceType::Legacy;
        }
        let capabilities = pci_express::PciExpressCapabilities::from_bits(self.read_u16(
            sbdf,
            sbdf.pcie_cap as u16 + pci_express::PCIE_CAPS_REGISTER_OFFSET,
        ));
        match capabilities.device_port_type() {
            pci_express::DevicePortType::UPSTREAM_SWITCH_PORT => DeviceType::PcieUpstreamPort,
            pci_express::DevicePortType::ROOT_PORT
            | pci_express::DevicePortType::DOWNSTREAM_SWITCH_PORT => {
                DeviceType::PcieDownstreamPort
            }
            _ => DeviceType::Endpoint,
        }
    }
}
