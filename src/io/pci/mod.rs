// ============================================================================
// src/io/pci/mod.rs - PCI/PCIe Common Module
// ============================================================================
//!
//! # PCI/PCIe 共通モジュール
//!
//! PCI と PCIe の両方で使用される共通トレイトと定義を提供。
//!
//! ## モジュール構成
//! - `traits`: ConfigSpaceAccessor トレイト
//! - `types`: BDF、レジスタオフセットなどの型定義
//! - `bus`: PCIバス列挙
//! - `capability`: 拡張ケイパビリティ (AER, L1PM, LTR, ACS, Express, FPB)
//!
//! Legacy I/O ポートおよび ECAM による実際のレジスタアクセス、MSI/MSI-X
//! ベクタの構成はホスト側の責務であり、このクレートは
//! `traits::ConfigSpaceAccessor` という抽象越しにのみ設定空間に触れる
//! （`SPEC_FULL.md` §6参照）。

#![allow(dead_code)]

pub mod traits;
pub mod types;
pub mod bus;
pub mod capability;

// Re-exports for convenient access
pub use traits::ConfigSpaceAccessor;
pub use types::{BdfAddress, Bar, ClassCode, VendorId, DeviceId};
pub use bus::{PciBusScanner, PciDeviceInfo, CapabilityId, config_regs, command_bits, status_bits};
pub use capability::{
    AerRegs, ExpressRegs, L1pmRegs, LtrRegs, FpbRegs, aer_regs, express_regs, l1pm_regs, ltr_regs,
    fpb_regs, p2p_bridge_regs,
};
