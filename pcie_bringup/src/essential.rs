// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Policy deciding which endpoints must be usable this early in boot.

use crate::cfg::CfgAccess;
use pci_core::spec::cfg_space::HeaderType00;
use pci_core::spec::hwid::ClassCode;
use pci_core::spec::hwid::Subclass;
use pci_core::Sbdf;

/// Whether the function is an endpoint that needs resources and a published
/// access object: mass storage of any subclass, USB host controllers, and
/// SD host controllers. No other policy inputs exist.
pub fn is_essential(cfg: &CfgAccess, sbdf: Sbdf) -> bool {
    let class_dword = cfg.read_u32(sbdf, HeaderType00::CLASS_REVISION.0);
    let base_class = ClassCode((class_dword >> 24) as u8);
    let sub_class = Subclass((class_dword >> 16) as u8);

    base_class == ClassCode::MASS_STORAGE_CONTROLLER
        || (base_class == ClassCode::SERIAL_BUS_CONTROLLER
            && sub_class == Subclass::SERIAL_BUS_CONTROLLER_USB)
        || (base_class == ClassCode::BASE_SYSTEM_PERIPHERAL
            && sub_class == Subclass::BASE_SYSTEM_PERIPHERAL_SD_HOST_CONTROLLER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::TestTopology;

    #[test]
    fn class_code_policy() {
        let topology = TestTopology::new();
        topology.add_endpoint(0, 0, 0, (0x01, 0x08, 0x02), &[], false); // NVMe
        topology.add_endpoint(0, 1, 0, (0x0C, 0x03, 0x30), &[], false); // xHCI
        topology.add_endpoint(0, 2, 0, (0x08, 0x05, 0x00), &[], false); // SD host
        topology.add_endpoint(0, 3, 0, (0x03, 0x00, 0x00), &[], false); // display
        topology.add_endpoint(0, 4, 0, (0x0C, 0x05, 0x00), &[], false); // SMBus
        topology.add_endpoint(0, 5, 0, (0x08, 0x80, 0x00), &[], false); // other peripheral
        let cfg = topology.cfg();

        assert!(is_essential(&cfg, Sbdf::new(0, 0, 0, 0)));
        assert!(is_essential(&cfg, Sbdf::new(0, 0, 1, 0)));
        assert!(is_essential(&cfg, Sbdf::new(0, 0, 2, 0)));
        assert!(!is_essential(&cfg, Sbdf::new(0, 0, 3, 0)));
        assert!(!is_essential(&cfg, Sbdf::new(0, 0, 4, 0)));
        assert!(!is_essential(&cfg, Sbdf::new(0, 0, 5, 0)));
    }
}
