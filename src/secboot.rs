//! Boundary to the low-level sealing primitives.
//!
//! [`SealingBackend`] is the capability bundle the seal and reseal engines
//! are constructed with. The production implementation talks to the TPM
//! and to the vendor key-wrapping hook; tests substitute a recording mock.
//! Policy decisions (which slots, which profiles, when to revoke) stay in
//! the engines, the backend only executes individual primitives.

use crate::bootchain::{BootChain, BootChainError, RoleToBootloader};
use crate::dirs;
use crate::model::SealingModel;
use crate::profile::{self, ProfileError, SealKeyModelParams};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SecbootError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error(transparent)]
    BootChain(#[from] BootChainError),
    /// Drift detection found nothing to do for a role; filtered out by the
    /// reseal engine before reaching callers.
    #[error("no PCR profile calculated, skipping resealing")]
    NoPcrProfileCalculated,
    #[error("at least one set of model-specific parameters is required")]
    MissingModelParams,
    #[error("unexpected length of serialized PCR profile")]
    EmptySerializedProfile,
    #[error("missing primary key for key identity {0}")]
    MissingPrimaryKey(u32),
    #[error("unknown sealing method {0:?}")]
    UnknownSealingMethod(String),
    #[error("system is not sealed")]
    NoSealedKeys,
    #[error("cannot revoke older keys: {0}")]
    Revocation(String),
    #[error("{0}")]
    Backend(String),
}

pub type Result<T, E = SecbootError> = core::result::Result<T, E>;

/// PCR policy revocation counter NV handles. The run and fallback objects
/// never share a handle, and factory resets alternate between the primary
/// and alternative pair so an interrupted reset never strands the only
/// valid fallback key behind a released counter.
pub const RUN_OBJECT_PCR_POLICY_COUNTER_HANDLE: u32 = 0x0188_0001;
pub const FALLBACK_OBJECT_PCR_POLICY_COUNTER_HANDLE: u32 = 0x0188_0002;
pub const ALT_RUN_OBJECT_PCR_POLICY_COUNTER_HANDLE: u32 = 0x0188_0003;
pub const ALT_FALLBACK_OBJECT_PCR_POLICY_COUNTER_HANDLE: u32 = 0x0188_0004;

/// Given the handle currently protecting the fallback object, returns the
/// (run, fallback) pair to use for the next factory reset.
pub fn alternative_pcr_handles(current_fallback: u32) -> (u32, u32) {
    if current_fallback == FALLBACK_OBJECT_PCR_POLICY_COUNTER_HANDLE {
        (
            ALT_RUN_OBJECT_PCR_POLICY_COUNTER_HANDLE,
            ALT_FALLBACK_OBJECT_PCR_POLICY_COUNTER_HANDLE,
        )
    } else {
        (
            RUN_OBJECT_PCR_POLICY_COUNTER_HANDLE,
            FALLBACK_OBJECT_PCR_POLICY_COUNTER_HANDLE,
        )
    }
}

/// How the sealed keys on this device are protected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SealingMethod {
    #[serde(rename = "tpm")]
    Tpm,
    #[serde(rename = "fde-setup-hook")]
    FdeSetupHook,
}

impl SealingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SealingMethod::Tpm => "tpm",
            SealingMethod::FdeSetupHook => "fde-setup-hook",
        }
    }
}

impl fmt::Display for SealingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SealingMethod {
    type Err = SecbootError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tpm" => Ok(SealingMethod::Tpm),
            "fde-setup-hook" => Ok(SealingMethod::FdeSetupHook),
            other => Err(SecbootError::UnknownSealingMethod(other.to_string())),
        }
    }
}

/// Reads the sealing method stamp. `None` means the device has never been
/// sealed.
pub fn sealed_keys_method(rootdir: &Path) -> Result<Option<SealingMethod>> {
    let stamp = dirs::sealed_keys_stamp_under(rootdir);
    match fs::read_to_string(&stamp) {
        Ok(content) => Ok(Some(content.trim().parse()?)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Records which sealing method protects the keys, so later reseals pick
/// the matching code path.
pub fn stamp_sealed_keys(rootdir: &Path, method: SealingMethod) -> Result<()> {
    let stamp = dirs::sealed_keys_stamp_under(rootdir);
    dirs::atomic_write(&stamp, method.as_str().as_bytes(), 0o644)?;
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TpmProvisionMode {
    /// Initial install, lockout authorization is created from scratch.
    Full,
    /// Factory reset with an existing lockout authorization.
    PartialReprovision,
}

/// A named key slot on one encrypted container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyDataLocation {
    pub device_path: String,
    pub slot_name: String,
    /// Legacy location for keys kept outside the container metadata.
    pub key_file: PathBuf,
}

impl fmt::Display for KeyDataLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_path, self.slot_name)
    }
}

/// One key to wrap during initial sealing.
#[derive(Clone, Debug)]
pub struct SealKeyRequest {
    pub key_name: String,
    pub location: KeyDataLocation,
}

/// Parameters of a TPM initial seal pass, shared by all requests.
#[derive(Clone, Debug)]
pub struct SealKeysParams {
    pub pcr_profile: Vec<u8>,
    pub pcr_policy_counter_handle: u32,
    /// Where the generated primary (auxiliary) key is saved.
    pub primary_key_file: PathBuf,
    /// Where the TPM policy authorization key is saved.
    pub tpm_policy_auth_key_file: PathBuf,
}

/// Parameters of a vendor-hook initial seal pass.
#[derive(Clone, Debug)]
pub struct SealKeysWithFdeHookParams {
    pub model: SealingModel,
    pub aux_key_file: PathBuf,
}

/// One reseal of a single key slot.
#[derive(Debug)]
pub struct ResealKeyRequest<'a> {
    pub location: &'a KeyDataLocation,
    /// Absent when the vendor-hook method is in use.
    pub pcr_profile: Option<&'a [u8]>,
    /// Requests a fresh PCR policy version so older generations can be
    /// revoked afterwards.
    pub new_pcr_policy_version: bool,
    /// Tells the primitive a missing TPM profile is expected because the
    /// key was wrapped by the vendor hook.
    pub hint_expect_fde_hook: bool,
}

/// A key slot whose policy was replaced during the current pass, tagged
/// with the identity of the primary key protecting it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdatedKey {
    pub primary_key_id: u32,
    pub device_path: String,
    pub slot_name: String,
}

/// Capability bundle of sealing primitives the engines are built on.
pub trait SealingBackend {
    fn provision_tpm(&self, mode: TpmProvisionMode, lockout_auth_file: &Path) -> Result<()>;

    /// Turns per-model parameters into a serialized PCR protection
    /// profile. Deterministic in its inputs.
    fn build_pcr_protection_profile(
        &self,
        model_params: &[SealKeyModelParams],
        allow_insufficient_dma_protection: bool,
    ) -> Result<Vec<u8>>;

    fn seal_keys(&self, requests: &[SealKeyRequest], params: &SealKeysParams) -> Result<()>;

    fn seal_keys_with_fde_hook(
        &self,
        requests: &[SealKeyRequest],
        params: &SealKeysWithFdeHookParams,
    ) -> Result<()>;

    fn reseal_key(&self, request: &ResealKeyRequest<'_>) -> Result<UpdatedKey>;

    /// Recovers the primary key from any of the given devices, falling
    /// back to the legacy on-disk copy.
    fn get_primary_key(&self, devices: &[String], fallback_key_file: &Path) -> Result<Vec<u8>>;

    /// Invalidates all policy generations older than the ones carried by
    /// `updated`, which all share one primary key.
    fn revoke_old_keys(&self, primary_key: &[u8], updated: &[UpdatedKey]) -> Result<()>;

    /// PCR policy counter handle recorded in a sealed key file.
    fn pcr_handle_of_sealed_key(&self, key_file: &Path) -> Result<u32>;

    fn release_pcr_policy_counter_handles(&self, handles: &[u32]) -> Result<()>;

    /// Deletes bootstrap-only key material from the containers. Must only
    /// run after the permanent keys are confirmed usable.
    fn remove_bootstrap_keys(&self, devices: &[String]) -> Result<()>;
}

/// Derives per-model parameters from the given chains and invokes the
/// profile primitive, validating the inputs and the result.
pub fn build_pcr_profile(
    backend: &dyn SealingBackend,
    chains: &[BootChain],
    roles: &RoleToBootloader,
    cache_dir: &Path,
    db_payload: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let mut params = profile::seal_key_model_params(chains, roles, cache_dir)?;
    if params.is_empty() {
        return Err(SecbootError::MissingModelParams);
    }
    if let Some(payload) = db_payload {
        for p in &mut params {
            p.efi_signature_db_update = Some(payload.to_vec());
        }
    }
    let allow_insufficient_dma = params.iter().any(|p| p.model.classic);
    let blob = backend.build_pcr_protection_profile(&params, allow_insufficient_dma)?;
    if blob.is_empty() {
        return Err(SecbootError::EmptySerializedProfile);
    }
    Ok(blob)
}
