// ============================================================================
// src/io/iommu/dmar.rs - DMAR blob parsing (spec.md §6.2)
// ============================================================================
//!
//! The ACPI DMAR table scanner itself is out of scope (spec.md §1); this
//! module only walks the byte blob the host hands `install()` — a 24-byte
//! common header followed by `{Type:u16, Length:u16}`-prefixed subtables,
//! exactly as laid out in `original_source/dmar.h`'s `ACPI_DMAR_HEADER`/
//! `ACPI_TABLE_DMAR`.

#![allow(dead_code)]

use alloc::vec::Vec;

/// `ACPI_TABLE_HEADER` is a 36-byte common ACPI header; `ACPI_TABLE_DMAR`
/// appends `Width` (host address width - 1) and `Flags` before 10
/// reserved bytes. Subtables start right after.
const DMAR_HEADER_LEN: usize = 36 + 1 + 1 + 10;

/// Subtable kinds (spec.md §6.2, `original_source` `AcpiDmarType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtableKind {
    HardwareUnit,
    ReservedMemory,
    Atsr,
    Rhsa,
    Unknown(u16),
}

impl From<u16> for SubtableKind {
    fn from(kind: u16) -> Self {
        match kind {
            0 => SubtableKind::HardwareUnit,
            1 => SubtableKind::ReservedMemory,
            2 => SubtableKind::Atsr,
            3 => SubtableKind::Rhsa,
            other => SubtableKind::Unknown(other),
        }
    }
}

/// Kind 0: one physical remap unit (spec.md §6.2).
#[derive(Debug, Clone, Copy)]
pub struct HardwareUnitInfo {
    pub include_all: bool,
    pub segment: u16,
    pub register_base: u64,
}

/// Kind 1: an identity-mapped carve-out (spec.md §6.2, "both 4 KiB
/// aligned").
#[derive(Debug, Clone, Copy)]
pub struct ReservedMemoryInfo {
    pub segment: u16,
    pub base: u64,
    pub end: u64,
}

/// Kind 3: parsed but not acted on by the core (spec.md §6.2).
#[derive(Debug, Clone, Copy)]
pub struct RhsaInfo {
    pub proximity_domain: u32,
}

#[derive(Debug, Default)]
pub struct DmarTable {
    pub hardware_units: Vec<HardwareUnitInfo>,
    pub reserved_memory: Vec<ReservedMemoryInfo>,
    pub rhsa: Vec<RhsaInfo>,
    /// Count of ATSR/unrecognised subtables skipped, for diagnostics.
    pub ignored: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmarParseError {
    TooShortForHeader,
    SubtableShorterThanHeader,
    SubtableOverrunsBlob,
}

fn read_u16(blob: &[u8], offset: usize) -> Option<u16> {
    blob.get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u64(blob: &[u8], offset: usize) -> Option<u64> {
    blob.get(offset..offset + 8)
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
}

/// Parse a DMAR blob into its hardware-unit / reserved-memory /
/// RHSA entries (spec.md §6.2). Subtables of length less than their
/// 4-byte header are rejected.
pub fn parse(blob: &[u8]) -> Result<DmarTable, DmarParseError> {
    if blob.len() < DMAR_HEADER_LEN {
        return Err(DmarParseError::TooShortForHeader);
    }

    let mut table = DmarTable::default();
    let mut offset = DMAR_HEADER_LEN;

    while offset + 4 <= blob.len() {
        let kind = read_u16(blob, offset).ok_or(DmarParseError::SubtableShorterThanHeader)?;
        let length = read_u16(blob, offset + 2).ok_or(DmarParseError::SubtableShorterThanHeader)?;
        if (length as usize) < 4 {
            return Err(DmarParseError::SubtableShorterThanHeader);
        }
        if offset + length as usize > blob.len() {
            return Err(DmarParseError::SubtableOverrunsBlob);
        }
        let body = &blob[offset..offset + length as usize];

        match SubtableKind::from(kind) {
            SubtableKind::HardwareUnit => {
                if let (Some(flags), Some(segment), Some(register_base)) = (
                    body.get(4).copied(),
                    read_u16(body, 6),
                    read_u64(body, 8),
                ) {
                    table.hardware_units.push(HardwareUnitInfo {
                        include_all: flags & 0x1 != 0,
                        segment,
                        register_base,
                    });
                }
            }
            SubtableKind::ReservedMemory => {
                if let (Some(segment), Some(base), Some(end)) =
                    (read_u16(body, 6), read_u64(body, 8), read_u64(body, 16))
                {
                    table.reserved_memory.push(ReservedMemoryInfo { segment, base, end });
                }
            }
            SubtableKind::Rhsa => {
                if let Some(domain) = body.get(8..12) {
                    table.rhsa.push(RhsaInfo {
                        proximity_domain: u32::from_le_bytes(domain.try_into().unwrap()),
                    });
                }
                table.ignored += 1;
            }
            SubtableKind::Atsr | SubtableKind::Unknown(_) => {
                table.ignored += 1;
            }
        }

        offset += length as usize;
    }

    Ok(table)
}
