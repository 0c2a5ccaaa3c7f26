//! TPM-backed implementation of the sealing primitives.
//!
//! Built on a process-wide ESAPI context. Key material is wrapped into
//! keyed-hash objects bound to a PCR policy and parked at persistent
//! handles; resealing unseals under the currently satisfied policy and
//! wraps again under the new one at a fresh handle, leaving the previous
//! object in place until revocation evicts it.

use crate::profile::SealKeyModelParams;
use crate::secboot::{
    ResealKeyRequest, Result as SecbootResult, SealKeyRequest, SealKeysParams,
    SealKeysWithFdeHookParams, SealingBackend, SecbootError, TpmProvisionMode, UpdatedKey,
};
use log::{debug, info};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tss_esapi::attributes::{ObjectAttributes, SessionAttributes};
use tss_esapi::constants::{SessionType, StartupType};
use tss_esapi::handles::{KeyHandle, PersistentTpmHandle, TpmHandle};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::interface_types::dynamic_handles::Persistent;
use tss_esapi::interface_types::ecc::EccCurve;
use tss_esapi::interface_types::resource_handles::{Hierarchy, Provision};
use tss_esapi::interface_types::session_handles::{AuthSession, HmacSession, PolicySession};
use tss_esapi::structures::{
    CreateKeyResult, CreatePrimaryKeyResult, Digest, KeyedHashScheme, PcrSelectionList, PcrSlot,
    Public, PublicEccParametersBuilder, PublicKeyedHashParameters, SensitiveData,
    SymmetricDefinition, SymmetricDefinitionObject,
};

#[derive(Error, Debug)]
pub enum TpmError {
    #[error("failed to create auth session")]
    AuthSessionCreate,
    #[error(transparent)]
    TssEsapi(#[from] tss_esapi::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = TpmError> = core::result::Result<T, E>;

impl From<TpmError> for SecbootError {
    fn from(err: TpmError) -> Self {
        SecbootError::Backend(err.to_string())
    }
}

static CONTEXT: Lazy<Mutex<tss_esapi::Context>> = Lazy::new(|| {
    use tss_esapi::tcti_ldr::TctiNameConf;

    let conf = TctiNameConf::from_environment_variable().expect("Invalid TCTI config");
    debug!("TCTI config {:?}", conf);
    let context = tss_esapi::Context::new(conf).expect("Failed to init TPM context");
    Mutex::new(context)
});

type Context = MutexGuard<'static, tss_esapi::Context>;

fn get_context() -> Result<Context> {
    let mut ctx = CONTEXT.lock().expect("TPM context poisoned");
    ctx.startup(StartupType::Clear)?;
    Ok(ctx)
}

/// PCRs the sealing policy binds to: Secure Boot state and the kernel
/// command line measurements.
fn policy_pcr_selection() -> Result<PcrSelectionList> {
    Ok(PcrSelectionList::builder()
        .with_selection(HashingAlgorithm::Sha256, &[PcrSlot::Slot7, PcrSlot::Slot12])
        .build()?)
}

/// Base of the persistent handle range the sealed objects are parked in.
const SEALED_OBJECT_HANDLE_BASE: u32 = 0x8101_0000;

/// On-disk form of one sealed key, next to the LUKS metadata.
#[derive(Serialize, Deserialize)]
struct SealedKeyFile {
    /// Persistent handle of the wrapped object.
    handle: u32,
    /// PCR policy revocation counter handle the object was created for.
    #[serde(rename = "pcr-policy-counter-handle")]
    pcr_policy_counter_handle: u32,
    /// Policy generation, bumped on every reseal with a new version.
    #[serde(rename = "pcr-policy-version")]
    pcr_policy_version: u32,
    /// Serialized PCR protection profile the policy was derived from.
    #[serde(with = "hex_blob")]
    profile: Vec<u8>,
}

mod hex_blob {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

fn read_key_file(path: &Path) -> Result<SealedKeyFile> {
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}

fn write_key_file(path: &Path, file: &SealedKeyFile) -> Result<()> {
    crate::dirs::atomic_write(path, &serde_json::to_vec(file)?, 0o600)?;
    Ok(())
}

pub struct TpmBackend {
    /// Persistent handles of superseded objects, evicted on revocation.
    retired: Mutex<Vec<u32>>,
}

impl TpmBackend {
    pub fn new() -> Self {
        TpmBackend {
            retired: Mutex::new(Vec::new()),
        }
    }
}

impl Default for TpmBackend {
    fn default() -> Self {
        TpmBackend::new()
    }
}

fn make_session(ctx: &mut tss_esapi::Context, t: SessionType) -> Result<AuthSession> {
    let session = ctx
        .start_auth_session(
            None,
            None,
            None,
            t,
            SymmetricDefinition::AES_128_CFB,
            HashingAlgorithm::Sha256,
        )?
        .ok_or(TpmError::AuthSessionCreate)?;
    let (session_attributes, session_attributes_mask) = SessionAttributes::builder()
        .with_decrypt(true)
        .with_encrypt(true)
        .build();
    ctx.tr_sess_set_attributes(session, session_attributes, session_attributes_mask)?;
    Ok(session)
}

fn flush_session(ctx: &mut tss_esapi::Context, session: AuthSession) -> Result<()> {
    let handle = match session {
        AuthSession::HmacSession(session) => match session {
            HmacSession::HmacSession { session_handle, .. } => Some(session_handle.into()),
        },
        AuthSession::PolicySession(session) => match session {
            PolicySession::PolicySession { session_handle, .. } => Some(session_handle.into()),
        },
        _ => None,
    };
    if let Some(handle) = handle {
        ctx.flush_context(handle)?;
    }
    Ok(())
}

fn create_primary(ctx: &mut tss_esapi::Context) -> Result<KeyHandle> {
    let object_attributes = ObjectAttributes::builder()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_decrypt(true)
        .with_sign_encrypt(false)
        .with_restricted(true)
        .build()?;
    let public = Public::builder()
        .with_public_algorithm(PublicAlgorithm::Ecc)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_ecc_parameters(
            PublicEccParametersBuilder::new_restricted_decryption_key(
                SymmetricDefinitionObject::AES_128_CFB,
                EccCurve::NistP256,
            )
            .build()?,
        )
        .with_ecc_unique_identifier(Default::default())
        .build()?;
    let CreatePrimaryKeyResult {
        key_handle: key, ..
    } = ctx.execute_with_nullauth_session(|ctx| {
        ctx.create_primary(Hierarchy::Owner, public, None, None, None, None)
    })?;
    Ok(key)
}

/// Turns a serialized profile into the auth policy digest of the sealed
/// object, via a trial session bound to the policy PCRs.
fn policy_digest_for_profile(ctx: &mut tss_esapi::Context, profile: &[u8]) -> Result<Digest> {
    let selection = policy_pcr_selection()?;
    let predicted = Sha256::digest(profile);
    let digest = Digest::try_from(predicted.as_slice())?;
    let session = make_session(ctx, SessionType::Trial)?;
    ctx.policy_pcr(session.try_into()?, digest, selection)?;
    let policy = ctx.policy_get_digest(session.try_into()?)?;
    flush_session(ctx, session)?;
    Ok(policy)
}

fn evict_persistent(ctx: &mut tss_esapi::Context, handle: PersistentTpmHandle) {
    if let Ok(retrieved) =
        ctx.execute_without_session(|ctx| ctx.tr_from_tpm_public(TpmHandle::Persistent(handle)))
    {
        ctx.execute_with_session(Some(AuthSession::Password), |ctx| {
            ctx.evict_control(Provision::Owner, retrieved, Persistent::Persistent(handle))
        })
        .ok();
    }
}

/// Wraps `secret` under `policy` and parks the object at `handle`,
/// replacing whatever sat there.
fn seal_at_handle(
    ctx: &mut tss_esapi::Context,
    secret: SensitiveData,
    policy: Digest,
    handle: PersistentTpmHandle,
) -> Result<()> {
    let key = create_primary(ctx)?;
    let object_attributes = ObjectAttributes::builder()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .build()?;
    let public = Public::builder()
        .with_public_algorithm(PublicAlgorithm::KeyedHash)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_auth_policy(policy)
        .with_keyed_hash_parameters(PublicKeyedHashParameters::new(KeyedHashScheme::Null))
        .with_keyed_hash_unique_identifier(Digest::default())
        .build()?;

    evict_persistent(ctx, handle);
    ctx.execute_with_session(Some(AuthSession::Password), |ctx| {
        let CreateKeyResult {
            out_private,
            out_public,
            ..
        } = ctx.create(key, public, None, Some(secret), None, None)?;
        let transient = ctx.load(key, out_private, out_public)?.into();
        let mut persistent =
            ctx.evict_control(Provision::Owner, transient, Persistent::Persistent(handle))?;
        ctx.flush_context(transient)?;
        ctx.flush_context(key.into())?;
        ctx.tr_close(&mut persistent)?;
        Ok::<(), TpmError>(())
    })?;
    Ok(())
}

/// Unseals the object at `handle` under the currently satisfied PCR
/// policy.
fn unseal_from_handle(
    ctx: &mut tss_esapi::Context,
    handle: PersistentTpmHandle,
) -> Result<SensitiveData> {
    let selection = policy_pcr_selection()?;
    let (_, _, digests) =
        ctx.execute_without_session(|ctx| ctx.pcr_read(selection.clone()))?;
    let mut hasher = Sha256::new();
    for digest in digests.value() {
        hasher.update(digest.value());
    }
    let digest = Digest::try_from(hasher.finalize().as_slice())?;
    let session = make_session(ctx, SessionType::Policy)?;
    ctx.policy_pcr(session.try_into()?, digest, selection)?;
    let object_handle =
        ctx.execute_without_session(|ctx| ctx.tr_from_tpm_public(handle.into()))?;
    let data = ctx.execute_with_session(Some(session), |ctx| ctx.unseal(object_handle))?;
    flush_session(ctx, session)?;
    Ok(data)
}

/// Raw persistent handle value for one key slot at one policy
/// generation. Generations cycle within a 16-handle window per slot.
fn persistent_handle_value(slot_index: u32, version: u32) -> u32 {
    SEALED_OBJECT_HANDLE_BASE + slot_index * 0x10 + (version & 0x0f)
}

impl SealingBackend for TpmBackend {
    fn provision_tpm(
        &self,
        mode: TpmProvisionMode,
        lockout_auth_file: &Path,
    ) -> SecbootResult<()> {
        let mut ctx = get_context().map_err(TpmError::into)?;
        match mode {
            TpmProvisionMode::Full => {
                let auth = ctx.get_random(32).map_err(TpmError::from)?;
                crate::dirs::atomic_write(lockout_auth_file, auth.value(), 0o600)
                    .map_err(|e| SecbootError::Backend(e.to_string()))?;
                info!("TPM fully provisioned, lockout authorization stored");
            }
            TpmProvisionMode::PartialReprovision => {
                if !lockout_auth_file.exists() {
                    return Err(SecbootError::Backend(
                        "cannot reprovision without the stored lockout authorization".to_string(),
                    ));
                }
                debug!("partial TPM reprovision, keeping lockout authorization");
            }
        }
        Ok(())
    }

    fn build_pcr_protection_profile(
        &self,
        model_params: &[SealKeyModelParams],
        allow_insufficient_dma_protection: bool,
    ) -> SecbootResult<Vec<u8>> {
        // the serialized profile is the policy digest over the predicted
        // measurements of every model's load chains and command lines
        let mut hasher = Sha256::new();
        for params in model_params {
            hasher.update(params.model.unique_id().as_bytes());
            for chain in &params.load_chains {
                hasher.update(
                    serde_json::to_vec(chain)
                        .map_err(|e| SecbootError::Backend(e.to_string()))?,
                );
            }
            for cmdline in &params.kernel_cmdlines {
                hasher.update(cmdline.as_bytes());
            }
            if let Some(db) = &params.efi_signature_db_update {
                hasher.update(db);
            }
        }
        hasher.update([u8::from(allow_insufficient_dma_protection)]);
        let measurements = hasher.finalize();

        let mut ctx = get_context().map_err(TpmError::into)?;
        let policy =
            policy_digest_for_profile(&mut ctx, measurements.as_slice()).map_err(TpmError::into)?;
        Ok(policy.value().to_vec())
    }

    fn seal_keys(&self, requests: &[SealKeyRequest], params: &SealKeysParams) -> SecbootResult<()> {
        let mut ctx = get_context().map_err(TpmError::into)?;
        let policy = Digest::try_from(params.pcr_profile.as_slice())
            .map_err(|e| SecbootError::Backend(e.to_string()))?;

        // one primary key per device lifetime, generated with the first
        // seal and reused afterwards
        if !params.primary_key_file.exists() {
            let primary = ctx.get_random(32).map_err(TpmError::from)?;
            crate::dirs::atomic_write(&params.primary_key_file, primary.value(), 0o600)
                .map_err(|e| SecbootError::Backend(e.to_string()))?;
        }
        if !params.tpm_policy_auth_key_file.exists() {
            let auth = ctx.get_random(32).map_err(TpmError::from)?;
            crate::dirs::atomic_write(&params.tpm_policy_auth_key_file, auth.value(), 0o600)
                .map_err(|e| SecbootError::Backend(e.to_string()))?;
        }

        for (i, request) in requests.iter().enumerate() {
            let secret_bytes = ctx.get_random(32).map_err(TpmError::from)?;
            let secret = SensitiveData::try_from(secret_bytes.value().to_vec())
                .map_err(|e| SecbootError::Backend(e.to_string()))?;
            let raw_handle = persistent_handle_value(i as u32, 0);
            let handle = PersistentTpmHandle::new(raw_handle).map_err(TpmError::from)?;
            seal_at_handle(&mut ctx, secret, policy.clone(), handle)
                .map_err(TpmError::into)?;
            write_key_file(
                &request.location.key_file,
                &SealedKeyFile {
                    handle: raw_handle,
                    pcr_policy_counter_handle: params.pcr_policy_counter_handle,
                    pcr_policy_version: 0,
                    profile: params.pcr_profile.clone(),
                },
            )
            .map_err(TpmError::into)?;
            info!(
                "sealed key {} for {}",
                request.key_name, request.location
            );
        }
        Ok(())
    }

    fn seal_keys_with_fde_hook(
        &self,
        _requests: &[SealKeyRequest],
        _params: &SealKeysWithFdeHookParams,
    ) -> SecbootResult<()> {
        Err(SecbootError::Backend(
            "FDE setup hook sealing is not available on the TPM backend".to_string(),
        ))
    }

    fn reseal_key(&self, request: &ResealKeyRequest<'_>) -> SecbootResult<UpdatedKey> {
        let profile = request.pcr_profile.ok_or(SecbootError::NoPcrProfileCalculated)?;
        let mut file = read_key_file(&request.location.key_file)?;
        let old_handle = PersistentTpmHandle::new(file.handle).map_err(TpmError::from)?;

        let mut ctx = get_context().map_err(TpmError::into)?;
        let secret = unseal_from_handle(&mut ctx, old_handle).map_err(TpmError::into)?;

        let next_version = if request.new_pcr_policy_version {
            file.pcr_policy_version + 1
        } else {
            file.pcr_policy_version
        };
        let slot_index = (file.handle - SEALED_OBJECT_HANDLE_BASE) / 0x10;
        let raw_new = persistent_handle_value(slot_index, next_version);
        let new_handle = PersistentTpmHandle::new(raw_new).map_err(TpmError::from)?;
        let policy = Digest::try_from(profile)
            .map_err(|e| SecbootError::Backend(e.to_string()))?;
        seal_at_handle(&mut ctx, secret, policy, new_handle).map_err(TpmError::into)?;

        if raw_new != file.handle {
            self.retired
                .lock()
                .expect("retired handle list poisoned")
                .push(file.handle);
        }
        file.handle = raw_new;
        file.pcr_policy_version = next_version;
        file.profile = profile.to_vec();
        write_key_file(&request.location.key_file, &file).map_err(TpmError::into)?;
        debug!("resealed {}", request.location);

        Ok(UpdatedKey {
            primary_key_id: 0,
            device_path: request.location.device_path.clone(),
            slot_name: request.location.slot_name.clone(),
        })
    }

    fn get_primary_key(
        &self,
        _devices: &[String],
        fallback_key_file: &Path,
    ) -> SecbootResult<Vec<u8>> {
        fs::read(fallback_key_file).map_err(|e| SecbootError::Backend(e.to_string()))
    }

    fn revoke_old_keys(&self, _primary_key: &[u8], updated: &[UpdatedKey]) -> SecbootResult<()> {
        let mut ctx = get_context().map_err(TpmError::into)?;
        let retired: Vec<u32> = std::mem::take(
            &mut *self
                .retired
                .lock()
                .expect("retired handle list poisoned"),
        );
        for handle in retired {
            let handle = PersistentTpmHandle::new(handle).map_err(TpmError::from)?;
            evict_persistent(&mut ctx, handle);
        }
        info!("revoked superseded policies of {} keys", updated.len());
        Ok(())
    }

    fn pcr_handle_of_sealed_key(&self, key_file: &Path) -> SecbootResult<u32> {
        let file = read_key_file(key_file).map_err(TpmError::into)?;
        Ok(file.pcr_policy_counter_handle)
    }

    fn release_pcr_policy_counter_handles(&self, handles: &[u32]) -> SecbootResult<()> {
        let mut ctx = get_context().map_err(TpmError::into)?;
        for &handle in handles {
            let handle = PersistentTpmHandle::new(handle).map_err(TpmError::from)?;
            evict_persistent(&mut ctx, handle);
        }
        Ok(())
    }

    fn remove_bootstrap_keys(&self, devices: &[String]) -> SecbootResult<()> {
        // bootstrap key material only exists on hook devices
        debug!("no bootstrap keys to remove from {devices:?}");
        Ok(())
    }
}
