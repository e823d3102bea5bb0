// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! BAR sizing by write-ones probing.

use crate::cfg::CfgAccess;
use pci_core::spec::cfg_space;
use pci_core::spec::cfg_space::BarEncodingBits;
use pci_core::Sbdf;

/// Outcome of sizing one BAR.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BarSize {
    /// The BAR is not implemented.
    Absent,
    /// An I/O decode of the given length.
    Io {
        len: u32,
    },
    /// A 32-bit memory decode.
    Mem32 {
        len: u32,
        prefetchable: bool,
    },
    /// A 64-bit memory decode whose low half bounds it at 2 GiB, placeable
    /// as 32-bit. The paired high BAR index carries no decode of its own
    /// and must be skipped.
    Mem64Low {
        len: u32,
        prefetchable: bool,
    },
    /// A 64-bit memory decode larger than 2 GiB; not placeable in this
    /// phase.
    UnsupportedAbove2G,
}

/// Config-space offset of the BAR register with the given index.
pub fn bar_offset(bar: u8) -> u16 {
    cfg_space::HeaderType00::BAR0.0 + 4 * bar as u16
}

/// Sizes one BAR by the write-ones protocol, leaving the original register
/// value in place.
pub fn probe(cfg: &CfgAccess, sbdf: Sbdf, bar: u8) -> BarSize {
    let offset = bar_offset(bar);
    let original = cfg.read_u32(sbdf, offset);
    cfg.write_u32(sbdf, offset, u32::MAX);
    let sized = cfg.read_u32(sbdf, offset);
    cfg.write_u32(sbdf, offset, original);

    if sized == 0 {
        return BarSize::Absent;
    }

    let encoding = BarEncodingBits::from_bits(sized);

    // A 64-bit BAR whose low half exposes no writable address bits keeps
    // every address bit in the high dword, i.e. the decode is at least
    // 4 GiB. This must be recognized before the no-writable-bits check
    // below, which it otherwise resembles.
    if !encoding.use_pio()
        && encoding.type_64_bit()
        && sized & cfg_space::BAR_MEM_ADDRESS_MASK == 0
    {
        return BarSize::UnsupportedAbove2G;
    }

    // A register that ignores the all-ones write has no size to report.
    if sized == original {
        return BarSize::Absent;
    }

    if encoding.use_pio() {
        let masked = sized & cfg_space::BAR_IO_ADDRESS_MASK;
        let len = if masked & 0xFFFF_0000 == 0 {
            // 16-bit decode: the upper half reads back as zero.
            (!(masked as u16)).wrapping_add(1) as u32
        } else {
            (!masked).wrapping_add(1)
        };
        if len == 0 {
            return BarSize::Absent;
        }
        BarSize::Io { len }
    } else {
        let masked = sized & cfg_space::BAR_MEM_ADDRESS_MASK;
        if masked == 0 {
            return BarSize::Absent;
        }
        // A non-empty low-half mask bounds the decode at 2 GiB, so every
        // 64-bit BAR that reaches this point is placeable as 32-bit.
        let len = (!masked).wrapping_add(1);
        let prefetchable = encoding.prefetchable();
        if encoding.type_64_bit() {
            BarSize::Mem64Low { len, prefetchable }
        } else {
            BarSize::Mem32 { len, prefetchable }
        }
    }
}
