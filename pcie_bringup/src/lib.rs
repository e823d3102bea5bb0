// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pre-boot PCI Express enumeration and resource assignment.
//!
//! This crate discovers every PCI Express function reachable through one or
//! more host bridges, assigns bus numbers to bridges, packs BAR and bridge
//! windows into the host windows, programs the results, and publishes a
//! per-function access object ([`device::PciDeviceIo`]) for the endpoints
//! that must be usable this early in boot (mass storage, USB, SD host).
//!
//! The flow per host bridge is: bus-number assignment → resource discovery
//! into a [`tree::ResourceTree`] → offset planning ([`plan`]) →
//! widen-then-tighten programming ([`program`]) → facade publication. The
//! raw config-space/MMIO/port backends, the timer, and the IOMMU are
//! injected through [`services`]; this crate never touches hardware
//! directly.

#![forbid(unsafe_code)]

pub mod bar;
pub mod bringup;
pub mod cfg;
pub mod device;
pub mod enumerate;
pub mod essential;
pub mod plan;
pub mod program;
pub mod services;
pub mod tree;

#[cfg(test)]
mod test_helpers;

/// Error kinds surfaced by the bringup engine and the published device
/// access objects.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PciError {
    /// The addressed function is not present.
    #[error("no such device")]
    NoSuchDevice,
    /// The request cannot be implemented by this device or this phase.
    #[error("not supported")]
    Unsupported,
    /// A window or bus-number budget was exhausted.
    #[error("out of resources")]
    OutOfResources,
    /// A poll operation exhausted its delay budget.
    #[error("timeout")]
    Timeout,
    /// A parameter was out of range.
    #[error("invalid parameter")]
    InvalidParameter,
}
