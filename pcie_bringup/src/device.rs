// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-function access object published for essential endpoints.
//!
//! Consumers receive an `Arc<dyn PciDeviceIo>` and depend only on the
//! trait, keeping the implementation pluggable. BAR bases are resolved
//! from the live BAR registers on every call, so the object stays correct
//! even if something reprograms the function between calls.

use crate::services::DmaMapping;
use crate::services::DmaOperation;
use crate::services::IommuRegistration;
use crate::services::IommuService;
use crate::services::IOMMU_ACCESS_READ;
use crate::services::IOMMU_ACCESS_WRITE;
use crate::services::IOMMU_ID;
use crate::tree::attributes;
use crate::tree::DeviceRecord;
use crate::PciError;
use pci_core::spec::cfg_space;
use pci_core::spec::cfg_space::Command;
use pci_core::Sbdf;
use std::sync::Arc;

/// Width of a single element access.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessWidth {
    U8,
    U16,
    U32,
}

impl AccessWidth {
    /// Size of one element in bytes.
    pub const fn bytes(self) -> usize {
        match self {
            AccessWidth::U8 => 1,
            AccessWidth::U16 => 2,
            AccessWidth::U32 => 4,
        }
    }
}

/// The address space a BAR decodes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddressSpaceKind {
    Io,
    Memory,
}

/// Descriptor of a BAR's current decode, as read back from the register.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BarDescriptor {
    /// I/O or memory.
    pub kind: AddressSpaceKind,
    /// Address granularity in bits: 16, 32 or 64.
    pub granularity: u32,
    /// Whether the decode is prefetchable.
    pub prefetchable: bool,
    /// The programmed base address.
    pub base: u64,
    /// The decode length implied by the programmed base.
    pub len: u64,
}

/// Access operations of a published PCI function.
pub trait PciDeviceIo: Send + Sync {
    /// Reads `buffer.len() / width.bytes()` elements from BAR memory
    /// starting at `offset`.
    fn mem_read(
        &self,
        width: AccessWidth,
        bar: u8,
        offset: u64,
        buffer: &mut [u8],
    ) -> Result<(), PciError>;

    /// Writes `buffer.len() / width.bytes()` elements to BAR memory
    /// starting at `offset`.
    fn mem_write(
        &self,
        width: AccessWidth,
        bar: u8,
        offset: u64,
        buffer: &[u8],
    ) -> Result<(), PciError>;

    /// As [`PciDeviceIo::mem_read`], against port I/O.
    fn io_read(
        &self,
        width: AccessWidth,
        bar: u8,
        offset: u64,
        buffer: &mut [u8],
    ) -> Result<(), PciError>;

    /// As [`PciDeviceIo::mem_write`], against port I/O.
    fn io_write(
        &self,
        width: AccessWidth,
        bar: u8,
        offset: u64,
        buffer: &[u8],
    ) -> Result<(), PciError>;

    /// Reads from the function's configuration space.
    fn config_read(
        &self,
        width: AccessWidth,
        offset: u16,
        buffer: &mut [u8],
    ) -> Result<(), PciError>;

    /// Writes to the function's configuration space.
    fn config_write(&self, width: AccessWidth, offset: u16, buffer: &[u8]) -> Result<(), PciError>;

    /// Reads BAR memory until `(value & mask) == value_to_match` or the
    /// delay budget (in 100 ns units) runs out. Returns the last value
    /// read on success.
    fn poll_mem(
        &self,
        width: AccessWidth,
        bar: u8,
        offset: u64,
        mask: u64,
        value_to_match: u64,
        delay: u64,
    ) -> Result<u64, PciError>;

    /// As [`PciDeviceIo::poll_mem`], against port I/O.
    fn poll_io(
        &self,
        width: AccessWidth,
        bar: u8,
        offset: u64,
        mask: u64,
        value_to_match: u64,
        delay: u64,
    ) -> Result<u64, PciError>;

    /// Copies `count` elements between BAR memory regions through an
    /// in-register scalar, reversing direction when the destination
    /// overlaps and trails the source.
    fn copy_mem(
        &self,
        width: AccessWidth,
        dest_bar: u8,
        dest_offset: u64,
        src_bar: u8,
        src_offset: u64,
        count: usize,
    ) -> Result<(), PciError>;

    /// Maps system memory for bus-master DMA through the platform IOMMU.
    fn map(
        &self,
        operation: DmaOperation,
        host_address: u64,
        bytes: usize,
    ) -> Result<DmaMapping, PciError>;

    /// Releases a mapping returned by [`PciDeviceIo::map`].
    fn unmap(&self, mapping: DmaMapping) -> Result<(), PciError>;

    /// Allocates pages suitable for a common-buffer mapping.
    fn allocate_buffer(&self, pages: usize) -> Result<u64, PciError>;

    /// Frees pages returned by [`PciDeviceIo::allocate_buffer`].
    fn free_buffer(&self, pages: usize, host_address: u64) -> Result<(), PciError>;

    /// Flushes posted writes. Nothing is posted on this path.
    fn flush(&self) -> Result<(), PciError>;

    /// The function's coordinates.
    fn get_location(&self) -> Sbdf;

    /// The attribute set the function may be granted.
    fn supported_attributes(&self) -> u64;

    /// The currently granted attribute set.
    fn current_attributes(&self) -> u64;

    /// Grants attributes, translating IO/MEMORY/BUS_MASTER into command
    /// register bits and propagating the remainder up the parent chain.
    fn enable_attributes(&self, attrs: u64) -> Result<(), PciError>;

    /// Revokes attributes.
    fn disable_attributes(&self, attrs: u64) -> Result<(), PciError>;

    /// Makes the granted set exactly `attrs`: grants it, then revokes
    /// everything else the function supports.
    fn set_attributes(&self, attrs: u64) -> Result<(), PciError>;

    /// Describes the named BAR's current decode.
    fn bar_attributes(&self, bar: u8) -> Result<BarDescriptor, PciError>;

    /// Accepted and ignored; BAR attributes are not further constrained in
    /// this phase.
    fn set_bar_attributes(&self, bar: u8, offset: u64, len: u64) -> Result<(), PciError>;
}

const BAR_COUNT: u8 = 6;

impl DeviceRecord {
    fn mem_bar_base(&self, bar: u8) -> Result<u64, PciError> {
        if bar >= BAR_COUNT {
            return Err(PciError::Unsupported);
        }
        Ok((self.bar_register(bar) & cfg_space::BAR_MEM_ADDRESS_MASK) as u64)
    }

    fn io_bar_base(&self, bar: u8) -> Result<u64, PciError> {
        if bar >= BAR_COUNT {
            return Err(PciError::Unsupported);
        }
        Ok((self.bar_register(bar) & cfg_space::BAR_IO_ADDRESS_MASK) as u64)
    }

    fn mem_read_scalar(&self, width: AccessWidth, bar: u8, offset: u64) -> Result<u64, PciError> {
        let mut buffer = [0u8; 4];
        self.mem_read(width, bar, offset, &mut buffer[..width.bytes()])?;
        Ok(scalar_from_le(width, &buffer))
    }

    fn mem_write_scalar(
        &self,
        width: AccessWidth,
        bar: u8,
        offset: u64,
        value: u64,
    ) -> Result<(), PciError> {
        let buffer = (value as u32).to_le_bytes();
        self.mem_write(width, bar, offset, &buffer[..width.bytes()])
    }

    fn io_read_scalar(&self, width: AccessWidth, bar: u8, offset: u64) -> Result<u64, PciError> {
        let mut buffer = [0u8; 4];
        self.io_read(width, bar, offset, &mut buffer[..width.bytes()])?;
        Ok(scalar_from_le(width, &buffer))
    }

    fn locate_iommu(&self) -> Option<Arc<dyn IommuService>> {
        self.platform()
            .registry
            .locate_first(IOMMU_ID)?
            .downcast::<IommuRegistration>()
            .ok()
            .map(|registration| registration.0.clone())
    }

    /// Common body of enable/disable.
    fn attributes_op(&self, enable: bool, mut attrs: u64) -> Result<(), PciError> {
        if attrs & attributes::DEVICE_ENABLE == attributes::DEVICE_ENABLE {
            attrs &= self.supports();
        }
        if self.supports() & attrs != attrs {
            return Err(PciError::Unsupported);
        }

        // The synthetic root record has no config space of its own; it
        // terminates the upstream walk.
        let Some(parent) = self.parent() else {
            return Ok(());
        };

        let command = Command::new()
            .with_pio_enabled(attrs & attributes::IO != 0)
            .with_mmio_enabled(attrs & attributes::MEMORY != 0)
            .with_bus_master(attrs & attributes::BUS_MASTER != 0)
            .into_bits();
        let upstream = attrs & !attributes::DEVICE_ENABLE;

        let current = self.config_read_u16(cfg_space::HeaderType00::STATUS_COMMAND.0);
        if enable {
            self.config_write_u16(
                cfg_space::HeaderType00::STATUS_COMMAND.0,
                current | command,
            );
            self.grant_attributes(attrs);
            parent.attributes_op(true, upstream)?;
        } else {
            self.config_write_u16(
                cfg_space::HeaderType00::STATUS_COMMAND.0,
                current & !command,
            );
            self.revoke_attributes(attrs);
        }
        Ok(())
    }
}

fn scalar_from_le(width: AccessWidth, buffer: &[u8; 4]) -> u64 {
    match width {
        AccessWidth::U8 => buffer[0] as u64,
        AccessWidth::U16 => u16::from_le_bytes([buffer[0], buffer[1]]) as u64,
        AccessWidth::U32 => u32::from_le_bytes(*buffer) as u64,
    }
}

fn check_element_count(width: AccessWidth, len: usize) -> Result<usize, PciError> {
    if len == 0 || len % width.bytes() != 0 {
        return Err(PciError::InvalidParameter);
    }
    Ok(len / width.bytes())
}

impl PciDeviceIo for DeviceRecord {
    fn mem_read(
        &self,
        width: AccessWidth,
        bar: u8,
        offset: u64,
        buffer: &mut [u8],
    ) -> Result<(), PciError> {
        check_element_count(width, buffer.len())?;
        let base = self.mem_bar_base(bar)? + offset;
        let mmio = &self.platform().mmio;
        for (index, chunk) in buffer.chunks_exact_mut(width.bytes()).enumerate() {
            let address = base + (index * width.bytes()) as u64;
            match width {
                AccessWidth::U8 => chunk[0] = mmio.read_u8(address),
                AccessWidth::U16 => chunk.copy_from_slice(&mmio.read_u16(address).to_le_bytes()),
                AccessWidth::U32 => chunk.copy_from_slice(&mmio.read_u32(address).to_le_bytes()),
            }
        }
        Ok(())
    }

    fn mem_write(
        &self,
        width: AccessWidth,
        bar: u8,
        offset: u64,
        buffer: &[u8],
    ) -> Result<(), PciError> {
        check_element_count(width, buffer.len())?;
        let base = self.mem_bar_base(bar)? + offset;
        let mmio = &self.platform().mmio;
        for (index, chunk) in buffer.chunks_exact(width.bytes()).enumerate() {
            let address = base + (index * width.bytes()) as u64;
            match width {
                AccessWidth::U8 => mmio.write_u8(address, chunk[0]),
                AccessWidth::U16 => {
                    mmio.write_u16(address, u16::from_le_bytes([chunk[0], chunk[1]]))
                }
                AccessWidth::U32 => mmio.write_u32(
                    address,
                    u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                ),
            }
        }
        Ok(())
    }

    fn io_read(
        &self,
        width: AccessWidth,
        bar: u8,
        offset: u64,
        buffer: &mut [u8],
    ) -> Result<(), PciError> {
        let count = check_element_count(width, buffer.len())?;
        let base = self.io_bar_base(bar)? + offset;
        if base + (count * width.bytes()) as u64 - 1 > u16::MAX as u64 {
            return Err(PciError::Unsupported);
        }
        let io = &self.platform().io;
        for (index, chunk) in buffer.chunks_exact_mut(width.bytes()).enumerate() {
            let port = (base + (index * width.bytes()) as u64) as u16;
            match width {
                AccessWidth::U8 => chunk[0] = io.read_u8(port),
                AccessWidth::U16 => chunk.copy_from_slice(&io.read_u16(port).to_le_bytes()),
                AccessWidth::U32 => chunk.copy_from_slice(&io.read_u32(port).to_le_bytes()),
            }
        }
        Ok(())
    }

    fn io_write(
        &self,
        width: AccessWidth,
        bar: u8,
        offset: u64,
        buffer: &[u8],
    ) -> Result<(), PciError> {
        let count = check_element_count(width, buffer.len())?;
        let base = self.io_bar_base(bar)? + offset;
        if base + (count * width.bytes()) as u64 - 1 > u16::MAX as u64 {
            return Err(PciError::Unsupported);
        }
        let io = &self.platform().io;
        for (index, chunk) in buffer.chunks_exact(width.bytes()).enumerate() {
            let port = (base + (index * width.bytes()) as u64) as u16;
            match width {
                AccessWidth::U8 => io.write_u8(port, chunk[0]),
                AccessWidth::U16 => io.write_u16(port, u16::from_le_bytes([chunk[0], chunk[1]])),
                AccessWidth::U32 => io.write_u32(
                    port,
                    u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                ),
            }
        }
        Ok(())
    }

    fn config_read(
        &self,
        width: AccessWidth,
        offset: u16,
        buffer: &mut [u8],
    ) -> Result<(), PciError> {
        check_element_count(width, buffer.len())?;
        let config = &self.platform().config;
        let base = self.cfg_base() + offset as u64;
        for (index, chunk) in buffer.chunks_exact_mut(width.bytes()).enumerate() {
            let address = base + (index * width.bytes()) as u64;
            match width {
                AccessWidth::U8 => chunk[0] = config.read_u8(address),
                AccessWidth::U16 => chunk.copy_from_slice(&config.read_u16(address).to_le_bytes()),
                AccessWidth::U32 => chunk.copy_from_slice(&config.read_u32(address).to_le_bytes()),
            }
        }
        Ok(())
    }

    fn config_write(&self, width: AccessWidth, offset: u16, buffer: &[u8]) -> Result<(), PciError> {
        check_element_count(width, buffer.len())?;
        let config = &self.platform().config;
        let base = self.cfg_base() + offset as u64;
        for (index, chunk) in buffer.chunks_exact(width.bytes()).enumerate() {
            let address = base + (index * width.bytes()) as u64;
            match width {
                AccessWidth::U8 => config.write_u8(address, chunk[0]),
                AccessWidth::U16 => {
                    config.write_u16(address, u16::from_le_bytes([chunk[0], chunk[1]]))
                }
                AccessWidth::U32 => config.write_u32(
                    address,
                    u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                ),
            }
        }
        Ok(())
    }

    fn poll_mem(
        &self,
        width: AccessWidth,
        bar: u8,
        offset: u64,
        mask: u64,
        value_to_match: u64,
        mut delay: u64,
    ) -> Result<u64, PciError> {
        let result = self.mem_read_scalar(width, bar, offset)?;
        if result & mask == value_to_match || delay == 0 {
            return Ok(result);
        }
        loop {
            self.platform().timer.delay_us(10);
            let result = self.mem_read_scalar(width, bar, offset)?;
            if result & mask == value_to_match {
                return Ok(result);
            }
            if delay <= 100 {
                return Err(PciError::Timeout);
            }
            delay -= 100;
        }
    }

    fn poll_io(
        &self,
        width: AccessWidth,
        bar: u8,
        offset: u64,
        mask: u64,
        value_to_match: u64,
        mut delay: u64,
    ) -> Result<u64, PciError> {
        let result = self.io_read_scalar(width, bar, offset)?;
        if result & mask == value_to_match || delay == 0 {
            return Ok(result);
        }
        loop {
            self.platform().timer.delay_us(10);
            let result = self.io_read_scalar(width, bar, offset)?;
            if result & mask == value_to_match {
                return Ok(result);
            }
            if delay <= 100 {
                return Err(PciError::Timeout);
            }
            delay -= 100;
        }
    }

    fn copy_mem(
        &self,
        width: AccessWidth,
        dest_bar: u8,
        dest_offset: u64,
        src_bar: u8,
        src_offset: u64,
        count: usize,
    ) -> Result<(), PciError> {
        let stride = width.bytes() as u64;
        let mut src = src_offset;
        let mut dest = dest_offset;
        let mut forward = true;
        if dest > src && dest < src + count as u64 * stride {
            forward = false;
            src += (count as u64 - 1) * stride;
            dest += (count as u64 - 1) * stride;
        }

        for _ in 0..count {
            let value = self.mem_read_scalar(width, src_bar, src)?;
            self.mem_write_scalar(width, dest_bar, dest, value)?;
            if forward {
                src += stride;
                dest += stride;
            } else {
                src = src.wrapping_sub(stride);
                dest = dest.wrapping_sub(stride);
            }
        }
        Ok(())
    }

    fn map(
        &self,
        operation: DmaOperation,
        host_address: u64,
        bytes: usize,
    ) -> Result<DmaMapping, PciError> {
        let iommu = self.locate_iommu().ok_or(PciError::Unsupported)?;
        let mapping = iommu.map(operation, host_address, bytes)?;
        let access = match operation {
            DmaOperation::BusMasterRead => IOMMU_ACCESS_READ,
            DmaOperation::BusMasterWrite => IOMMU_ACCESS_WRITE,
            DmaOperation::BusMasterCommonBuffer => IOMMU_ACCESS_READ | IOMMU_ACCESS_WRITE,
        };
        iommu.set_attributes(&mapping, access)?;
        Ok(mapping)
    }

    fn unmap(&self, mapping: DmaMapping) -> Result<(), PciError> {
        let iommu = self.locate_iommu().ok_or(PciError::Unsupported)?;
        iommu.set_attributes(&mapping, 0)?;
        iommu.unmap(mapping)
    }

    fn allocate_buffer(&self, pages: usize) -> Result<u64, PciError> {
        let iommu = self.locate_iommu().ok_or(PciError::Unsupported)?;
        iommu.allocate_buffer(pages)
    }

    fn free_buffer(&self, pages: usize, host_address: u64) -> Result<(), PciError> {
        let iommu = self.locate_iommu().ok_or(PciError::Unsupported)?;
        iommu.free_buffer(pages, host_address)
    }

    fn flush(&self) -> Result<(), PciError> {
        Ok(())
    }

    fn get_location(&self) -> Sbdf {
        self.sbdf()
    }

    fn supported_attributes(&self) -> u64 {
        self.supports()
    }

    fn current_attributes(&self) -> u64 {
        DeviceRecord::current_attributes(self)
    }

    fn enable_attributes(&self, attrs: u64) -> Result<(), PciError> {
        self.attributes_op(true, attrs)
    }

    fn disable_attributes(&self, attrs: u64) -> Result<(), PciError> {
        self.attributes_op(false, attrs)
    }

    fn set_attributes(&self, attrs: u64) -> Result<(), PciError> {
        self.attributes_op(true, attrs)?;
        self.attributes_op(false, self.supports() & !attrs)
    }

    fn bar_attributes(&self, bar: u8) -> Result<BarDescriptor, PciError> {
        if bar >= BAR_COUNT {
            return Err(PciError::Unsupported);
        }
        let value = self.bar_register(bar);

        if value & 0x1 != 0 {
            let masked = value & cfg_space::BAR_IO_ADDRESS_MASK;
            let (granularity, len) = if masked & 0xFFFF_0000 != 0 {
                (32, (!masked).wrapping_add(1) as u64)
            } else {
                (16, 0xFFFF & (!masked).wrapping_add(1) as u64)
            };
            Ok(BarDescriptor {
                kind: AddressSpaceKind::Io,
                granularity,
                prefetchable: false,
                base: masked as u64,
                len,
            })
        } else {
            let masked = value & cfg_space::BAR_MEM_ADDRESS_MASK;
            Ok(BarDescriptor {
                kind: AddressSpaceKind::Memory,
                granularity: if value & 0x6 != 0 { 64 } else { 32 },
                prefetchable: value & 0x8 != 0,
                base: masked as u64,
                len: (!masked).wrapping_add(1) as u64,
            })
        }
    }

    fn set_bar_attributes(&self, bar: u8, _offset: u64, _len: u64) -> Result<(), PciError> {
        if bar >= BAR_COUNT {
            return Err(PciError::Unsupported);
        }
        Ok(())
    }
}
