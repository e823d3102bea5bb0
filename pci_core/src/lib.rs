// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types and constants specified by the PCI and PCI Express specifications.
//!
//! This crate performs no I/O of any kind; it only names register offsets,
//! register layouts, and well-known code points so that the crates that do
//! touch hardware agree on them.

#![forbid(unsafe_code)]

pub mod open_enum;
pub mod sbdf;
pub mod spec;

pub use sbdf::Sbdf;
