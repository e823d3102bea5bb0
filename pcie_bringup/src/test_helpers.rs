// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An emulated PCIe topology backing the engine's tests.
//!
//! Functions model just enough config-space behavior for enumeration:
//! sizing BARs (write-ones reads back the size mask), latching bus-number
//! and window registers on bridges, a PCI Express capability at 0x40, and
//! flat ECAM decode. MMIO and port spaces are sparse byte maps, the timer
//! counts instead of stalling, and a recording IOMMU can be installed in
//! the registry.

use crate::bringup::HostBridge;
use crate::cfg::CfgAccess;
use crate::services::ConfigAccess;
use crate::services::DelayTimer;
use crate::services::DevicePath;
use crate::services::DmaMapping;
use crate::services::DmaOperation;
use crate::services::IommuRegistration;
use crate::services::IommuService;
use crate::services::MmioAccess;
use crate::services::Platform;
use crate::services::PortIoAccess;
use crate::services::ServiceRegistry;
use crate::services::IOMMU_ID;
use crate::tree::attributes;
use crate::PciError;
use parking_lot::Mutex;
use pci_core::spec::caps::pci_express::DevicePortType;
use pci_core::spec::caps::pci_express::PciExpressCapabilities;
use pci_core::spec::caps::CapabilityId;
use pci_core::spec::hwid::ClassCode;
use pci_core::spec::hwid::HardwareIds;
use pci_core::spec::hwid::ProgrammingInterface;
use pci_core::spec::hwid::Subclass;
use std::collections::BTreeMap;
use std::sync::Arc;

/// ECAM base of the emulated segment.
pub const TEST_ECAM_BASE: u64 = 0xE000_0000;

/// Shape of an emulated BAR.
#[derive(Copy, Clone, Debug)]
pub enum TestBarKind {
    Io { size: u32 },
    Mem32 { size: u32, prefetchable: bool },
    Mem64 { size: u64, prefetchable: bool },
}

struct TestBar {
    kind: TestBarKind,
    value: u64,
}

impl TestBar {
    fn new(kind: TestBarKind) -> Self {
        Self { kind, value: 0 }
    }

    fn low_encoding(&self) -> u32 {
        match self.kind {
            TestBarKind::Io { .. } => 0x1,
            TestBarKind::Mem32 { prefetchable, .. } => {
                if prefetchable {
                    0x8
                } else {
                    0x0
                }
            }
            TestBarKind::Mem64 { prefetchable, .. } => {
                0x4 | if prefetchable { 0x8 } else { 0x0 }
            }
        }
    }

    fn low_mask(&self) -> u32 {
        match self.kind {
            // 16-bit I/O decode: the upper half is hardwired zero.
            TestBarKind::Io { size } => !(size - 1) & 0xFFFF,
            TestBarKind::Mem32 { size, .. } => !(size - 1),
            TestBarKind::Mem64 { size, .. } => !(size - 1) as u32,
        }
    }

    fn high_mask(&self) -> u32 {
        match self.kind {
            TestBarKind::Mem64 { size, .. } => ((!(size - 1)) >> 32) as u32,
            _ => 0,
        }
    }

    fn is_64bit(&self) -> bool {
        matches!(self.kind, TestBarKind::Mem64 { .. })
    }

    fn read_low(&self) -> u32 {
        (self.value as u32 & self.low_mask()) | self.low_encoding()
    }

    fn read_high(&self) -> u32 {
        ((self.value >> 32) as u32) & self.high_mask()
    }

    fn write_low(&mut self, value: u32) {
        self.value = (self.value & !0xFFFF_FFFF) | value as u64;
    }

    fn write_high(&mut self, value: u32) {
        self.value = (self.value & 0xFFFF_FFFF) | ((value as u64) << 32);
    }
}

struct TestFunction {
    ids: HardwareIds,
    multi_function: bool,
    bridge: bool,
    port_type: Option<DevicePortType>,
    command: u16,
    bus_numbers: u32,
    io_window: u16,
    mem_window: u32,
    bars: [Option<TestBar>; 6],
}

fn hardware_ids(device_id: u16, class: (u8, u8, u8)) -> HardwareIds {
    HardwareIds {
        vendor_id: 0x1414,
        device_id,
        revision_id: 0,
        prog_if: ProgrammingInterface(class.2),
        sub_class: Subclass(class.1),
        base_class: ClassCode(class.0),
    }
}

impl TestFunction {
    fn bar_read(&self, index: usize) -> u32 {
        if let Some(bar) = &self.bars[index] {
            bar.read_low()
        } else if index > 0 && self.bars[index - 1].as_ref().is_some_and(|b| b.is_64bit()) {
            self.bars[index - 1].as_ref().unwrap().read_high()
        } else {
            0
        }
    }

    fn bar_write(&mut self, index: usize, value: u32) {
        if self.bars[index].is_some() {
            self.bars[index].as_mut().unwrap().write_low(value);
        } else if index > 0 && self.bars[index - 1].as_ref().is_some_and(|b| b.is_64bit()) {
            self.bars[index - 1].as_mut().unwrap().write_high(value);
        }
    }

    fn read_dword(&self, reg: u16) -> u32 {
        match reg {
            0x00 => (self.ids.device_id as u32) << 16 | self.ids.vendor_id as u32,
            0x04 => {
                let status: u32 = if self.port_type.is_some() { 0x0010 } else { 0 };
                status << 16 | self.command as u32
            }
            0x08 => {
                (u8::from(self.ids.base_class) as u32) << 24
                    | (u8::from(self.ids.sub_class) as u32) << 16
                    | (u8::from(self.ids.prog_if) as u32) << 8
                    | self.ids.revision_id as u32
            }
            0x0C => {
                let mut header = if self.bridge { 0x01u32 } else { 0x00 };
                if self.multi_function {
                    header |= 0x80;
                }
                header << 16
            }
            0x18 if self.bridge => self.bus_numbers,
            0x1C if self.bridge => self.io_window as u32,
            0x20 if self.bridge => self.mem_window,
            0x10..=0x24 => {
                let index = ((reg - 0x10) / 4) as usize;
                if self.bridge && index > 1 {
                    0
                } else {
                    self.bar_read(index)
                }
            }
            0x34 => {
                if self.port_type.is_some() {
                    0x40
                } else {
                    0
                }
            }
            0x40 => {
                if let Some(port_type) = self.port_type {
                    let capabilities = PciExpressCapabilities::new()
                        .with_capability_version(2)
                        .with_device_port_type(port_type);
                    (capabilities.into_bits() as u32) << 16 | CapabilityId::PCI_EXPRESS.0 as u32
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    fn write_dword(&mut self, reg: u16, value: u32, mask: u32) {
        let value = (self.read_dword(reg) & !mask) | (value & mask);
        match reg {
            0x04 => self.command = value as u16,
            0x18 if self.bridge => self.bus_numbers = value,
            0x1C if self.bridge => self.io_window = value as u16,
            0x20 if self.bridge => self.mem_window = value,
            0x10..=0x24 => {
                let index = ((reg - 0x10) / 4) as usize;
                if !(self.bridge && index > 1) {
                    self.bar_write(index, value);
                }
            }
            _ => {}
        }
    }
}

#[derive(Default)]
struct TestState {
    functions: BTreeMap<(u8, u8, u8), TestFunction>,
    mmio: BTreeMap<u64, u8>,
    ports: BTreeMap<u16, u8>,
    delay_calls: u64,
    delay_total_us: u64,
}

struct TestBackend {
    state: Mutex<TestState>,
    registry: Arc<ServiceRegistry>,
}

fn decode_ecam(address: u64) -> ((u8, u8, u8), u16) {
    let offset = address - TEST_ECAM_BASE;
    let bus = (offset >> 20) as u8;
    let device = ((offset >> 15) & 0x1F) as u8;
    let function = ((offset >> 12) & 0x7) as u8;
    let reg = (offset & 0xFFF) as u16;
    ((bus, device, function), reg)
}

impl TestBackend {
    fn config_dword(&self, address: u64) -> u32 {
        let (key, reg) = decode_ecam(address);
        self.state
            .lock()
            .functions
            .get(&key)
            .map(|function| function.read_dword(reg & !0x3))
            .unwrap_or(0xFFFF_FFFF)
    }

    fn config_write_masked(&self, address: u64, value: u32, mask: u32) {
        let (key, reg) = decode_ecam(address);
        if let Some(function) = self.state.lock().functions.get_mut(&key) {
            function.write_dword(reg & !0x3, value, mask);
        }
    }
}

impl ConfigAccess for TestBackend {
    fn read_u8(&self, address: u64) -> u8 {
        (self.config_dword(address) >> ((address & 0x3) * 8)) as u8
    }

    fn read_u16(&self, address: u64) -> u16 {
        (self.config_dword(address) >> ((address & 0x2) * 8)) as u16
    }

    fn read_u32(&self, address: u64) -> u32 {
        self.config_dword(address)
    }

    fn write_u8(&self, address: u64, value: u8) {
        let shift = (address & 0x3) * 8;
        self.config_write_masked(address, (value as u32) << shift, 0xFF << shift);
    }

    fn write_u16(&self, address: u64, value: u16) {
        let shift = (address & 0x2) * 8;
        self.config_write_masked(address, (value as u32) << shift, 0xFFFF << shift);
    }

    fn write_u32(&self, address: u64, value: u32) {
        self.config_write_masked(address, value, 0xFFFF_FFFF);
    }
}

impl MmioAccess for TestBackend {
    fn read_u8(&self, address: u64) -> u8 {
        *self.state.lock().mmio.get(&address).unwrap_or(&0)
    }

    fn read_u16(&self, address: u64) -> u16 {
        let state = self.state.lock();
        let byte = |a| *state.mmio.get(&a).unwrap_or(&0);
        u16::from_le_bytes([byte(address), byte(address + 1)])
    }

    fn read_u32(&self, address: u64) -> u32 {
        let state = self.state.lock();
        let byte = |a| *state.mmio.get(&a).unwrap_or(&0);
        u32::from_le_bytes([
            byte(address),
            byte(address + 1),
            byte(address + 2),
            byte(address + 3),
        ])
    }

    fn write_u8(&self, address: u64, value: u8) {
        self.state.lock().mmio.insert(address, value);
    }

    fn write_u16(&self, address: u64, value: u16) {
        let mut state = self.state.lock();
        for (index, byte) in value.to_le_bytes().into_iter().enumerate() {
            state.mmio.insert(address + index as u64, byte);
        }
    }

    fn write_u32(&self, address: u64, value: u32) {
        let mut state = self.state.lock();
        for (index, byte) in value.to_le_bytes().into_iter().enumerate() {
            state.mmio.insert(address + index as u64, byte);
        }
    }
}

impl PortIoAccess for TestBackend {
    fn read_u8(&self, port: u16) -> u8 {
        *self.state.lock().ports.get(&port).unwrap_or(&0)
    }

    fn read_u16(&self, port: u16) -> u16 {
        let state = self.state.lock();
        let byte = |p| *state.ports.get(&p).unwrap_or(&0);
        u16::from_le_bytes([byte(port), byte(port + 1)])
    }

    fn read_u32(&self, port: u16) -> u32 {
        let state = self.state.lock();
        let byte = |p| *state.ports.get(&p).unwrap_or(&0);
        u32::from_le_bytes([byte(port), byte(port + 1), byte(port + 2), byte(port + 3)])
    }

    fn write_u8(&self, port: u16, value: u8) {
        self.state.lock().ports.insert(port, value);
    }

    fn write_u16(&self, port: u16, value: u16) {
        let mut state = self.state.lock();
        for (index, byte) in value.to_le_bytes().into_iter().enumerate() {
            state.ports.insert(port + index as u16, byte);
        }
    }

    fn write_u32(&self, port: u16, value: u32) {
        let mut state = self.state.lock();
        for (index, byte) in value.to_le_bytes().into_iter().enumerate() {
            state.ports.insert(port + index as u16, byte);
        }
    }
}

impl DelayTimer for TestBackend {
    fn delay_us(&self, microseconds: u64) {
        let mut state = self.state.lock();
        state.delay_calls += 1;
        state.delay_total_us += microseconds;
    }
}

/// The emulated topology plus the backends built over it.
pub struct TestTopology {
    backend: Arc<TestBackend>,
}

impl TestTopology {
    pub fn new() -> Self {
        Self {
            backend: Arc::new(TestBackend {
                state: Mutex::new(TestState::default()),
                registry: Arc::new(ServiceRegistry::new()),
            }),
        }
    }

    /// A platform bundle whose backends all point at this topology.
    pub fn platform(&self) -> Arc<Platform> {
        Arc::new(Platform {
            config: self.backend.clone(),
            mmio: self.backend.clone(),
            io: self.backend.clone(),
            timer: self.backend.clone(),
            registry: self.backend.registry.clone(),
        })
    }

    /// Config accessor bound to the emulated ECAM window.
    pub fn cfg(&self) -> CfgAccess {
        CfgAccess::new(self.backend.clone(), TEST_ECAM_BASE)
    }

    pub fn registry(&self) -> Arc<ServiceRegistry> {
        self.backend.registry.clone()
    }

    /// The standard single host bridge used by most scenarios: segment 0,
    /// buses 0..=0xFF, memory [0xC000_0000, 0xDFFF_FFFF], I/O
    /// [0x1000, 0xFFFF].
    pub fn host_bridge(&self) -> HostBridge {
        self.host_bridge_with(0xC000_0000..=0xDFFF_FFFF, 0x1000..=0xFFFF)
    }

    /// As [`TestTopology::host_bridge`] with custom windows.
    pub fn host_bridge_with(
        &self,
        mem: std::ops::RangeInclusive<u32>,
        io: std::ops::RangeInclusive<u16>,
    ) -> HostBridge {
        HostBridge {
            segment: 0,
            ecam_base: TEST_ECAM_BASE,
            bus: 0..=0xFF,
            mem,
            mem_above_4g: 0x1_0000_0000..=0x1_FFFF_FFFF,
            io,
            supports: attributes::DEVICE_ENABLE,
            device_path: DevicePath::pci_root(0),
        }
    }

    fn add_function(&self, bus: u8, device: u8, function: u8, new: TestFunction) {
        self.backend
            .state
            .lock()
            .functions
            .insert((bus, device, function), new);
    }

    pub fn add_endpoint(
        &self,
        bus: u8,
        device: u8,
        function: u8,
        class: (u8, u8, u8),
        bars: &[(u8, TestBarKind)],
        multi_function: bool,
    ) {
        let mut slots: [Option<TestBar>; 6] = Default::default();
        for &(index, kind) in bars {
            slots[index as usize] = Some(TestBar::new(kind));
        }
        self.add_function(
            bus,
            device,
            function,
            TestFunction {
                ids: hardware_ids(0xB0B0, class),
                multi_function,
                bridge: false,
                port_type: Some(DevicePortType::ENDPOINT),
                command: 0,
                bus_numbers: 0,
                io_window: 0,
                mem_window: 0,
                bars: slots,
            },
        );
    }

    /// An endpoint with no PCI Express capability.
    pub fn add_legacy_endpoint(&self, bus: u8, device: u8, function: u8, class: (u8, u8, u8)) {
        self.add_function(
            bus,
            device,
            function,
            TestFunction {
                ids: hardware_ids(0xB0B1, class),
                multi_function: false,
                bridge: false,
                port_type: None,
                command: 0,
                bus_numbers: 0,
                io_window: 0,
                mem_window: 0,
                bars: Default::default(),
            },
        );
    }

    pub fn add_bridge(
        &self,
        bus: u8,
        device: u8,
        function: u8,
        port_type: DevicePortType,
        multi_function: bool,
    ) {
        self.add_function(
            bus,
            device,
            function,
            TestFunction {
                ids: hardware_ids(0xC030, (0x06, 0x04, 0x00)),
                multi_function,
                bridge: true,
                port_type: Some(port_type),
                command: 0,
                bus_numbers: 0,
                io_window: 0,
                mem_window: 0,
                bars: Default::default(),
            },
        );
    }

    fn with_function<R>(
        &self,
        bus: u8,
        device: u8,
        function: u8,
        body: impl FnOnce(&TestFunction) -> R,
    ) -> R {
        let state = self.backend.state.lock();
        body(state
            .functions
            .get(&(bus, device, function))
            .expect("function exists"))
    }

    pub fn set_command(&self, bus: u8, device: u8, function: u8, value: u16) {
        let mut state = self.backend.state.lock();
        state
            .functions
            .get_mut(&(bus, device, function))
            .expect("function exists")
            .command = value;
    }

    pub fn command(&self, bus: u8, device: u8, function: u8) -> u16 {
        self.with_function(bus, device, function, |f| f.command)
    }

    /// Raw BAR register value as software would read it back.
    pub fn bar_value(&self, bus: u8, device: u8, function: u8, bar: u8) -> u32 {
        self.with_function(bus, device, function, |f| {
            f.read_dword(0x10 + 4 * bar as u16)
        })
    }

    /// (primary, secondary, subordinate) bus numbers of a bridge.
    pub fn bus_numbers(&self, bus: u8, device: u8, function: u8) -> (u8, u8, u8) {
        self.with_function(bus, device, function, |f| {
            (
                f.bus_numbers as u8,
                (f.bus_numbers >> 8) as u8,
                (f.bus_numbers >> 16) as u8,
            )
        })
    }

    /// Decoded (base, limit) of a bridge's memory window; the reserved low
    /// nibbles of the registers are masked off.
    pub fn mem_window(&self, bus: u8, device: u8, function: u8) -> (u32, u32) {
        self.with_function(bus, device, function, |f| {
            let base = ((f.mem_window as u16 & !0xF) as u32) << 16;
            let limit = ((((f.mem_window >> 16) as u16 & !0xF) as u32) << 16) | 0xF_FFFF;
            (base, limit)
        })
    }

    /// Decoded (base, limit) of a bridge's I/O window.
    pub fn io_window(&self, bus: u8, device: u8, function: u8) -> (u16, u16) {
        self.with_function(bus, device, function, |f| {
            let base = ((f.io_window & 0x00FF) as u16) << 8;
            let limit = (f.io_window & 0xFF00) | 0xFF;
            (base, limit)
        })
    }

    pub fn set_mmio(&self, address: u64, bytes: &[u8]) {
        let mut state = self.backend.state.lock();
        for (index, &byte) in bytes.iter().enumerate() {
            state.mmio.insert(address + index as u64, byte);
        }
    }

    pub fn mmio_bytes(&self, address: u64, len: usize) -> Vec<u8> {
        let state = self.backend.state.lock();
        (0..len)
            .map(|index| *state.mmio.get(&(address + index as u64)).unwrap_or(&0))
            .collect()
    }

    pub fn set_ports(&self, port: u16, bytes: &[u8]) {
        let mut state = self.backend.state.lock();
        for (index, &byte) in bytes.iter().enumerate() {
            state.ports.insert(port + index as u16, byte);
        }
    }

    pub fn port_bytes(&self, port: u16, len: usize) -> Vec<u8> {
        let state = self.backend.state.lock();
        (0..len)
            .map(|index| *state.ports.get(&(port + index as u16)).unwrap_or(&0))
            .collect()
    }

    pub fn delay_count(&self) -> u64 {
        self.backend.state.lock().delay_calls
    }

    pub fn delay_total_us(&self) -> u64 {
        self.backend.state.lock().delay_total_us
    }

    /// Installs a recording IOMMU in the registry and returns it.
    pub fn install_iommu(&self) -> Arc<TestIommu> {
        let iommu = Arc::new(TestIommu::default());
        self.backend.registry.install(
            IOMMU_ID,
            Arc::new(IommuRegistration(iommu.clone())),
        );
        iommu
    }
}

#[derive(Default)]
struct TestIommuState {
    next_token: u64,
    access: BTreeMap<u64, u64>,
    active: Vec<u64>,
    buffers: Vec<u64>,
}

/// Recording IOMMU: identity-maps and remembers every grant.
#[derive(Default)]
pub struct TestIommu {
    state: Mutex<TestIommuState>,
}

impl TestIommu {
    pub fn access_of(&self, token: u64) -> Option<u64> {
        self.state.lock().access.get(&token).copied()
    }

    pub fn is_active(&self, token: u64) -> bool {
        self.state.lock().active.contains(&token)
    }
}

impl IommuService for TestIommu {
    fn map(
        &self,
        _operation: DmaOperation,
        host_address: u64,
        bytes: usize,
    ) -> Result<DmaMapping, PciError> {
        let mut state = self.state.lock();
        state.next_token += 1;
        let token = state.next_token;
        state.active.push(token);
        Ok(DmaMapping {
            device_address: host_address,
            bytes,
            token,
        })
    }

    fn unmap(&self, mapping: DmaMapping) -> Result<(), PciError> {
        let mut state = self.state.lock();
        let position = state
            .active
            .iter()
            .position(|&token| token == mapping.token)
            .ok_or(PciError::InvalidParameter)?;
        state.active.remove(position);
        Ok(())
    }

    fn set_attributes(&self, mapping: &DmaMapping, access: u64) -> Result<(), PciError> {
        let mut state = self.state.lock();
        if !state.active.contains(&mapping.token) {
            return Err(PciError::InvalidParameter);
        }
        state.access.insert(mapping.token, access);
        Ok(())
    }

    fn allocate_buffer(&self, pages: usize) -> Result<u64, PciError> {
        let mut state = self.state.lock();
        let address = 0x100_0000 + 0x1000 * (state.buffers.len() as u64) * pages.max(1) as u64;
        state.buffers.push(address);
        Ok(address)
    }

    fn free_buffer(&self, _pages: usize, host_address: u64) -> Result<(), PciError> {
        let mut state = self.state.lock();
        let position = state
            .buffers
            .iter()
            .position(|&address| address == host_address)
            .ok_or(PciError::InvalidParameter)?;
        state.buffers.remove(position);
        Ok(())
    }
}
