// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types and constants specified by the PCI spec.
//!
//! This module MUST NOT contain any vendor-specific constants!

pub mod hwid {
    //! Hardware ID types and constants

    #![allow(missing_docs)] // constants/fields are self-explanatory

    use core::fmt;

    /// A collection of hard-coded hardware IDs specific to a particular PCI
    /// device, as reflected in their corresponding PCI configuration space
    /// registers.
    ///
    /// See PCI 2.3 Spec - 6.2.1 for details on each of these fields.
    #[derive(Debug, Copy, Clone)]
    pub struct HardwareIds {
        pub vendor_id: u16,
        pub device_id: u16,
        pub revision_id: u8,
        pub prog_if: ProgrammingInterface,
        pub sub_class: Subclass,
        pub base_class: ClassCode,
    }

    crate::open_enum! {
        /// ClassCode identifies the PCI device's type.
        ///
        /// Values pulled from <https://wiki.osdev.org/PCI#Class_Codes>.
        pub enum ClassCode: u8 {
            UNCLASSIFIED = 0x00,
            MASS_STORAGE_CONTROLLER = 0x01,
            NETWORK_CONTROLLER = 0x02,
            DISPLAY_CONTROLLER = 0x03,
            MULTIMEDIA_CONTROLLER = 0x04,
            MEMORY_CONTROLLER = 0x05,
            BRIDGE = 0x06,
            SIMPLE_COMMUNICATION_CONTROLLER = 0x07,
            BASE_SYSTEM_PERIPHERAL = 0x08,
            INPUT_DEVICE_CONTROLLER = 0x09,
            DOCKING_STATION = 0x0A,
            PROCESSOR = 0x0B,
            SERIAL_BUS_CONTROLLER = 0x0C,
            WIRELESS_CONTROLLER = 0x0D,
            INTELLIGENT_CONTROLLER = 0x0E,
            SATELLITE_COMMUNICATION_CONTROLLER = 0x0F,
            ENCRYPTION_CONTROLLER = 0x10,
            SIGNAL_PROCESSING_CONTROLLER = 0x11,
            PROCESSING_ACCELERATOR = 0x12,
            NONESSENTIAL_INSTRUMENTATION = 0x13,
            // 0x14 - 0x3F: Reserved
            CO_PROCESSOR = 0x40,
            // 0x41 - 0xFE: Reserved
            /// Vendor specific
            UNASSIGNED = 0xFF,
        }
    }

    impl fmt::Display for ClassCode {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            fmt::Debug::fmt(self, f)
        }
    }

    // Most subclass/programming interface values aren't used, and don't have
    // names that can easily be made into variable identifiers. Therefore,
    // only add values as needed.

    crate::open_enum! {
        /// SubclassCode identifies the PCI device's function.
        ///
        /// Values pulled from <https://wiki.osdev.org/PCI#Class_Codes>.
        pub enum Subclass: u8 {
            NONE = 0x00,

            // Mass Storage Controller (Class code: 0x01)
            MASS_STORAGE_CONTROLLER_IDE = 0x01,
            MASS_STORAGE_CONTROLLER_SATA = 0x06,
            MASS_STORAGE_CONTROLLER_NON_VOLATILE_MEMORY = 0x08,

            // Bridge (Class code: 0x06)
            // Other values: 0x02 - 0x0A
            BRIDGE_HOST = 0x00,
            BRIDGE_ISA = 0x01,
            BRIDGE_PCI_TO_PCI = 0x04,
            BRIDGE_OTHER = 0x80,

            // Base System Peripheral (Class code: 0x08)
            BASE_SYSTEM_PERIPHERAL_SD_HOST_CONTROLLER = 0x05,
            BASE_SYSTEM_PERIPHERAL_OTHER = 0x80,

            // Serial Bus Controller (Class code: 0x0C)
            SERIAL_BUS_CONTROLLER_USB = 0x03,
        }
    }

    crate::open_enum! {
        /// ProgrammingInterface (aka, program interface byte) identifies the
        /// PCI device's register-level programming interface.
        pub enum ProgrammingInterface: u8 {
            NONE = 0x00,

            // Non-Volatile Memory Controller (Class code: 0x01, Subclass: 0x08)
            MASS_STORAGE_CONTROLLER_NON_VOLATILE_MEMORY_NVME = 0x02,

            // USB Controller (Class code: 0x0C, Subclass: 0x03)
            SERIAL_BUS_CONTROLLER_USB_XHCI = 0x30,
        }
    }
}

/// Configuration Space
///
/// Sources: PCI 2.3 Spec - Chapter 6
#[allow(missing_docs)] // primarily enums/structs with self-explanatory variants
pub mod cfg_space {
    use bitfield_struct::bitfield;

    crate::open_enum! {
        /// Offsets into the type 00h configuration space header.
        ///
        /// Table pulled from <https://wiki.osdev.org/PCI>
        ///
        /// | Offset | Bits 31-24                 | Bits 23-16  | Bits 15-8           | Bits 7-0             |
        /// |--------|----------------------------|-------------|---------------------|--------------------- |
        /// | 0x0    | Device ID                  |             | Vendor ID           |                      |
        /// | 0x4    | Status                     |             | Command             |                      |
        /// | 0x8    | Class code                 |             |                     | Revision ID          |
        /// | 0xC    | BIST                       | Header type | Latency Timer       | Cache Line Size      |
        /// | 0x10   | Base address #0 (BAR0)     |             |                     |                      |
        /// | 0x14   | Base address #1 (BAR1)     |             |                     |                      |
        /// | 0x18   | Base address #2 (BAR2)     |             |                     |                      |
        /// | 0x1C   | Base address #3 (BAR3)     |             |                     |                      |
        /// | 0x20   | Base address #4 (BAR4)     |             |                     |                      |
        /// | 0x24   | Base address #5 (BAR5)     |             |                     |                      |
        /// | 0x28   | Cardbus CIS Pointer        |             |                     |                      |
        /// | 0x2C   | Subsystem ID               |             | Subsystem Vendor ID |                      |
        /// | 0x30   | Expansion ROM base address |             |                     |                      |
        /// | 0x34   | Reserved                   |             |                     | Capabilities Pointer |
        /// | 0x38   | Reserved                   |             |                     |                      |
        /// | 0x3C   | Max latency                | Min Grant   | Interrupt PIN       | Interrupt Line       |
        pub enum HeaderType00: u16 {
            DEVICE_VENDOR      = 0x00,
            STATUS_COMMAND     = 0x04,
            CLASS_REVISION     = 0x08,
            BIST_HEADER        = 0x0C,
            BAR0               = 0x10,
            BAR1               = 0x14,
            BAR2               = 0x18,
            BAR3               = 0x1C,
            BAR4               = 0x20,
            BAR5               = 0x24,
            CARDBUS_CIS_PTR    = 0x28,
            SUBSYSTEM_ID       = 0x2C,
            EXPANSION_ROM_BASE = 0x30,
            RESERVED_CAP_PTR   = 0x34,
            RESERVED           = 0x38,
            LATENCY_INTERRUPT  = 0x3C,
        }
    }

    crate::open_enum! {
        /// Offsets into the type 01h configuration space header.
        ///
        /// Table pulled from <https://wiki.osdev.org/PCI>
        ///
        /// | Offset | Bits 31-24                       | Bits 23-16             | Bits 15-8                | Bits 7-0             |
        /// |--------|----------------------------------|------------------------|--------------------------|--------------------- |
        /// | 0x0    | Device ID                        |                        | Vendor ID                |                      |
        /// | 0x4    | Status                           |                        | Command                  |                      |
        /// | 0x8    | Class code                       |                        |                          | Revision ID          |
        /// | 0xC    | BIST                             | Header Type            | Latency Timer            | Cache Line Size      |
        /// | 0x10   | Base address #0 (BAR0)           |                        |                          |                      |
        /// | 0x14   | Base address #1 (BAR1)           |                        |                          |                      |
        /// | 0x18   | Secondary Latency Timer          | Subordinate Bus Number | Secondary Bus Number     | Primary Bus Number   |
        /// | 0x1C   | Secondary Status                 |                        | I/O Limit                | I/O Base             |
        /// | 0x20   | Memory Limit                     |                        | Memory Base              |                      |
        /// | 0x24   | Prefetchable Memory Limit        |                        | Prefetchable Memory Base |                      |
        /// | 0x28   | Prefetchable Base Upper 32 Bits  |                        |                          |                      |
        /// | 0x2C   | Prefetchable Limit Upper 32 Bits |                        |                          |                      |
        /// | 0x30   | I/O Limit Upper 16 Bits          |                        | I/O Base Upper 16 Bits   |                      |
        /// | 0x34   | Reserved                         |                        |                          | Capabilities Pointer |
        /// | 0x38   | Expansion ROM Base Address       |                        |                          |                      |
        /// | 0x3C   | Bridge Control                   |                        | Interrupt PIN            | Interrupt Line       |
        pub enum HeaderType01: u16 {
            DEVICE_VENDOR         = 0x00,
            STATUS_COMMAND        = 0x04,
            CLASS_REVISION        = 0x08,
            BIST_HEADER           = 0x0C,
            BAR0                  = 0x10,
            BAR1                  = 0x14,
            LATENCY_BUS_NUMBERS   = 0x18,
            SEC_STATUS_IO_RANGE   = 0x1C,
            MEMORY_RANGE          = 0x20,
            PREFETCH_RANGE        = 0x24,
            PREFETCH_BASE_UPPER   = 0x28,
            PREFETCH_LIMIT_UPPER  = 0x2C,
            IO_RANGE_UPPER        = 0x30,
            RESERVED_CAP_PTR      = 0x34,
            EXPANSION_ROM_BASE    = 0x38,
            BRIDGE_CTRL_INTERRUPT = 0x3C,
        }
    }

    /// Byte offset of the secondary bus number register within a type 01h
    /// header.
    pub const SECONDARY_BUS_OFFSET: u16 = 0x19;
    /// Byte offset of the subordinate bus number register within a type 01h
    /// header.
    pub const SUBORDINATE_BUS_OFFSET: u16 = 0x1A;

    /// Byte offset of the header type register (shared by both header types).
    pub const HEADER_TYPE_OFFSET: u16 = 0x0E;
    /// Bit 7 of the header type register: the function's device implements
    /// multiple functions.
    pub const HEADER_TYPE_MULTI_FUNCTION: u8 = 0x80;
    /// Mask selecting the header layout bits of the header type register.
    pub const HEADER_TYPE_LAYOUT_MASK: u8 = 0x7F;
    /// Header layout value for a type 00h (general device) header.
    pub const HEADER_TYPE_DEVICE: u8 = 0x00;
    /// Header layout value for a type 01h (PCI-to-PCI bridge) header.
    pub const HEADER_TYPE_BRIDGE: u8 = 0x01;

    /// The vendor id read back from config space when no function is present.
    pub const ABSENT_VENDOR_ID: u16 = 0xFFFF;

    /// BAR in-band encoding bits.
    ///
    /// The low bits of the BAR are not actually part of the address.
    /// Instead, they are used to in-band encode various bits of
    /// metadata about the BAR, and are masked off when determining the
    /// actual address.
    #[bitfield(u32)]
    pub struct BarEncodingBits {
        pub use_pio: bool,

        _reserved: bool,

        /// False indicates 32 bit.
        /// Only used in MMIO
        pub type_64_bit: bool,
        pub prefetchable: bool,

        #[bits(28)]
        _reserved2: u32,
    }

    /// Mask selecting the address bits of a memory BAR.
    pub const BAR_MEM_ADDRESS_MASK: u32 = 0xFFFF_FFF0;
    /// Mask selecting the address bits of an I/O BAR.
    pub const BAR_IO_ADDRESS_MASK: u32 = 0xFFFF_FFFC;

    /// Command Register
    #[bitfield(u16)]
    pub struct Command {
        pub pio_enabled: bool,
        pub mmio_enabled: bool,
        pub bus_master: bool,
        pub special_cycles: bool,
        pub enable_memory_write_invalidate: bool,
        pub vga_palette_snoop: bool,
        pub parity_error_response: bool,
        /// must be 0
        #[bits(1)]
        _reserved: u16,
        pub enable_serr: bool,
        pub enable_fast_b2b: bool,
        pub intx_disable: bool,
        #[bits(5)]
        _reserved2: u16,
    }

    /// Status Register
    #[bitfield(u16)]
    pub struct Status {
        #[bits(3)]
        _reserved: u16,
        pub interrupt_status: bool,
        pub capabilities_list: bool,
        pub capable_mhz_66: bool,
        _reserved2: bool,
        pub capable_fast_b2b: bool,
        pub err_master_parity: bool,

        #[bits(2)]
        pub devsel: u16,

        pub abort_target_signaled: bool,
        pub abort_target_received: bool,
        pub abort_master_received: bool,
        pub err_signaled: bool,
        pub err_detected_parity: bool,
    }
}

/// Capabilities
pub mod caps {
    crate::open_enum! {
        /// Capability IDs
        ///
        /// Sources: PCI 2.3 Spec - Appendix H
        ///
        /// NOTE: this is a non-exhaustive list, so don't be afraid to add new
        /// variants on an as-needed basis!
        #[allow(missing_docs)] // self explanatory variants
        pub enum CapabilityId: u8 {
            POWER_MANAGEMENT = 0x01,
            MSI              = 0x05,
            VENDOR_SPECIFIC  = 0x09,
            PCI_EXPRESS      = 0x10,
            MSIX             = 0x11,
        }
    }

    /// Byte offset of the first-capability pointer register.
    pub const CAP_PTR_OFFSET: u16 = 0x34;

    /// PCI Express
    #[allow(missing_docs)] // primarily enums/structs with self-explanatory variants
    pub mod pci_express {
        use bitfield_struct::bitfield;

        crate::open_enum! {
            /// Offsets into the PCI Express Capability Header
            ///
            /// Table pulled from PCI Express Base Specification Rev. 3.0
            ///
            /// | Offset    | Bits 31-24       | Bits 23-16       | Bits 15-8        | Bits 7-0             |
            /// |-----------|------------------|----------------- |------------------|----------------------|
            /// | Cap + 0x0 | PCI Express Capabilities Register   | Next Pointer     | Capability ID (0x10) |
            /// | Cap + 0x4 | Device Capabilities Register                                                  |
            /// | Cap + 0x8 | Device Status    | Device Control                                             |
            /// | Cap + 0xC | Link Capabilities Register                                                    |
            /// | Cap + 0x10| Link Status      | Link Control                                               |
            /// | Cap + 0x14| Slot Capabilities Register                                                    |
            /// | Cap + 0x18| Slot Status      | Slot Control                                               |
            pub enum PciExpressCapabilityHeader: u16 {
                PCIE_CAPS      = 0x00,
                DEVICE_CAPS    = 0x04,
                DEVICE_CTL_STS = 0x08,
                LINK_CAPS      = 0x0C,
                LINK_CTL_STS   = 0x10,
                SLOT_CAPS      = 0x14,
                SLOT_CTL_STS   = 0x18,
            }
        }

        /// Byte offset of the PCI Express Capabilities Register within the
        /// capability (the upper half of the first dword).
        pub const PCIE_CAPS_REGISTER_OFFSET: u16 = 0x02;

        /// PCI Express Capabilities Register
        #[bitfield(u16)]
        pub struct PciExpressCapabilities {
            #[bits(4)]
            pub capability_version: u16,
            #[bits(4)]
            pub device_port_type: DevicePortType,
            pub slot_implemented: bool,
            #[bits(5)]
            pub interrupt_message_number: u16,
            _undefined: bool,
            pub flit_mode_supported: bool,
        }

        crate::open_enum! {
            /// Device/port type field of the PCI Express Capabilities
            /// Register.
            ///
            /// Open because hardware is free to report types this phase has
            /// no business interpreting (root complex integrated endpoints,
            /// event collectors, PCIe-to-PCI bridges, ...).
            pub enum DevicePortType: u16 {
                ENDPOINT = 0b0000,
                LEGACY_ENDPOINT = 0b0001,
                ROOT_PORT = 0b0100,
                UPSTREAM_SWITCH_PORT = 0b0101,
                DOWNSTREAM_SWITCH_PORT = 0b0110,
                ROOT_COMPLEX_INTEGRATED_ENDPOINT = 0b1001,
                ROOT_COMPLEX_EVENT_COLLECTOR = 0b1010,
            }
        }

        impl DevicePortType {
            pub const fn from_bits(bits: u16) -> Self {
                Self(bits)
            }

            pub const fn into_bits(self) -> u16 {
                self.0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::caps::pci_express::DevicePortType;
    use super::caps::pci_express::PciExpressCapabilities;
    use super::cfg_space::BarEncodingBits;
    use super::cfg_space::Command;
    use super::hwid::ClassCode;

    #[test]
    fn command_register_bit_positions() {
        let command = Command::new()
            .with_pio_enabled(true)
            .with_mmio_enabled(true)
            .with_bus_master(true);
        assert_eq!(command.into_bits(), 0x0007);

        let command = Command::from_bits(0x0400);
        assert!(command.intx_disable());
        assert!(!command.mmio_enabled());
    }

    #[test]
    fn bar_encoding_bits() {
        let enc = BarEncodingBits::from_bits(0xC000_000C);
        assert!(!enc.use_pio());
        assert!(enc.type_64_bit());
        assert!(enc.prefetchable());

        let enc = BarEncodingBits::from_bits(0x0000_1001);
        assert!(enc.use_pio());
    }

    #[test]
    fn pcie_capabilities_port_type_field() {
        let caps = PciExpressCapabilities::new()
            .with_capability_version(2)
            .with_device_port_type(DevicePortType::ROOT_PORT);
        assert_eq!(caps.into_bits(), 0x0042);
        assert_eq!(
            PciExpressCapabilities::from_bits(0x0062).device_port_type(),
            DevicePortType::DOWNSTREAM_SWITCH_PORT
        );
    }

    #[test]
    fn class_codes_round_trip() {
        assert_eq!(u8::from(ClassCode::MASS_STORAGE_CONTROLLER), 0x01);
        assert_eq!(ClassCode::from(0x0C), ClassCode::SERIAL_BUS_CONTROLLER);
        assert_eq!(format!("{:?}", ClassCode(0x42)), "ClassCode(0x42)");
    }
}
