//! Full-disk-encryption key lifecycle for measured-boot devices.
//!
//! Encryption keys for the device's partitions are sealed to a predicted set
//! of acceptable boot paths. When the set legitimately changes (kernel or
//! bootloader updates, model changes, EFI signature database updates) the
//! keys are resealed to the new prediction, with revocation of superseded
//! policies, without ever leaving the on-disk keys unusable.
//!
//! The crate is organized around:
//! - [`bootchain`]: canonical boot-path model with generation counters for
//!   drift detection,
//! - [`profile`]: derivation of per-model sealing parameters,
//! - [`seal`] and [`reseal`]: first-time sealing and subsequent resealing of
//!   the run and fallback key objects,
//! - [`coordinator`]: two-phase synchronization with an external EFI
//!   Secure Boot database updater,
//! - [`secboot`]: the boundary to the low-level sealing primitive.
//!
//! The TPM-backed implementation of the sealing primitive lives in [`tpm`]
//! behind the `tpm` cargo feature since it links the native TSS stack.

pub mod bootchain;
pub mod changes;
pub mod cli;
pub mod coordinator;
pub mod dirs;
pub mod manager;
pub mod model;
pub mod op;
pub mod profile;
pub mod reseal;
pub mod seal;
pub mod secboot;
pub mod state;

#[cfg(feature = "tpm")]
pub mod tpm;

#[cfg(test)]
pub(crate) mod testutil;
