//! The reseal engine.
//!
//! Keeps every key slot's sealing policy synchronized with the currently
//! acceptable boot paths. A pass is idempotent: if neither the run nor
//! the recovery boot-chain snapshot drifted and the caller did not force
//! it, the pass ends without touching the sealing primitive. When a pass
//! does run, it recomputes the PCR profiles at most once per keyslot
//! role, reseals every key slot across all encrypted containers, commits
//! the per-role parameter catalog and the advanced snapshot counters only
//! for role groups whose every slot succeeded, and optionally revokes the
//! superseded policy generations.

use crate::bootchain::{self, BootChain, BootChainError, BootChains, RoleToBootloader};
use crate::dirs;
use crate::manager::{EncryptedContainer, FdeStateManager, ManagerError};
use crate::model::SealingModel;
use crate::secboot::{
    self, KeyDataLocation, ResealKeyRequest, SealingBackend, SealingMethod, SecbootError,
    TpmProvisionMode, UpdatedKey,
};
use crate::state::{ParamsKey, Role, SealingParameters, ALL_CONTAINERS};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Key slot holding the run object.
pub const RUN_KEY_SLOT: &str = "default";
/// Key slot holding the fallback object.
pub const FALLBACK_KEY_SLOT: &str = "default-fallback";

#[derive(Error, Debug)]
pub enum ResealError {
    #[error(transparent)]
    Secboot(#[from] SecbootError),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    BootChain(#[from] BootChainError),
    #[error("cannot reseal key slot {slot}: {source}")]
    KeySlot {
        slot: String,
        #[source]
        source: SecbootError,
    },
}

pub type Result<T, E = ResealError> = core::result::Result<T, E>;

#[derive(Clone, Copy, Debug, Default)]
pub struct ResealOptions {
    /// Settles the unrevisioned-kernel ambiguity in drift detection.
    pub expect_reseal: bool,
    /// Runs the pass even when no drift was detected. Snapshot counters
    /// still only advance on real drift.
    pub force: bool,
    /// Requests fresh policy versions and revokes the superseded ones
    /// once every reseal succeeded.
    pub revoke_old_keys: bool,
    /// Skips the pass entirely on vendor-hook devices.
    pub ignore_fde_hooks: bool,
    /// Re-attempts TPM provisioning before resealing.
    pub reprovision: Option<TpmProvisionMode>,
}

pub struct ResealEngine<'a> {
    backend: &'a dyn SealingBackend,
    manager: &'a dyn FdeStateManager,
    rootdir: &'a Path,
}

impl<'a> ResealEngine<'a> {
    pub fn new(
        backend: &'a dyn SealingBackend,
        manager: &'a dyn FdeStateManager,
        rootdir: &'a Path,
    ) -> Self {
        ResealEngine {
            backend,
            manager,
            rootdir,
        }
    }

    /// Triggers a normal reseal pass.
    pub fn reseal_key_for_boot_chains(
        &self,
        method: SealingMethod,
        inputs: &BootChains,
        opts: &ResealOptions,
    ) -> Result<()> {
        self.reseal(method, inputs, opts, None)
    }

    /// Forced reseal carrying a pending EFI signature database payload,
    /// used by the external-operation coordinator during prepare.
    pub fn reseal_keys_for_signatures_db_update(
        &self,
        method: SealingMethod,
        inputs: &BootChains,
        db_payload: &[u8],
    ) -> Result<()> {
        let opts = ResealOptions {
            expect_reseal: true,
            force: true,
            ..ResealOptions::default()
        };
        self.reseal(method, inputs, &opts, Some(db_payload))
    }

    fn reseal(
        &self,
        method: SealingMethod,
        inputs: &BootChains,
        opts: &ResealOptions,
        db_payload: Option<&[u8]>,
    ) -> Result<()> {
        let use_tpm = method == SealingMethod::Tpm;
        if !use_tpm && opts.ignore_fde_hooks {
            debug!("keys are sealed with the FDE hook, ignoring as requested");
            return Ok(());
        }
        if let Some(mode) = opts.reprovision {
            if use_tpm {
                self.backend
                    .provision_tpm(mode, &dirs::tpm_lockout_auth_file_under(self.rootdir))?;
            }
        }

        let containers = self.manager.get_encrypted_containers()?;

        let mut run_union = inputs.run_mode.clone();
        run_union.extend(inputs.recovery_for_run_key.iter().cloned());
        let run_pbc = bootchain::to_predictable_boot_chains(&run_union);
        let recovery_pbc = bootchain::to_predictable_boot_chains(&inputs.recovery);

        let run_path = dirs::boot_chains_file_under(self.rootdir);
        let recovery_path = dirs::recovery_boot_chains_file_under(self.rootdir);
        // vendor-hook devices keep no policy prediction on disk, so there
        // is nothing to drift-check against; hook passes always reseal
        // and never touch the snapshot files
        let mut run_drifted = false;
        let mut next_run_count = 0;
        let mut recovery_drifted = false;
        let mut next_recovery_count = 0;
        if use_tpm {
            (run_drifted, next_run_count) =
                bootchain::is_reseal_needed(&run_pbc, &run_path, opts.expect_reseal)?;
            (recovery_drifted, next_recovery_count) =
                bootchain::is_reseal_needed(&recovery_pbc, &recovery_path, opts.expect_reseal)?;

            if !run_drifted && !recovery_drifted && !opts.force {
                debug!("boot chains unchanged, no resealing needed");
                return Ok(());
            }
        }

        let roles = &inputs.role_to_bootloader;
        let new_policy_version = opts.revoke_old_keys && use_tpm;
        let mut updated: Vec<UpdatedKey> = Vec::new();

        // run object group: "default" slots across all containers
        let run_slots = slots_named(&containers, RUN_KEY_SLOT);
        let mut run_only_profile = None;
        let mut run_profile = None;
        if use_tpm && !run_slots.is_empty() {
            run_only_profile = Some(self.build_profile(&inputs.run_mode, roles, db_payload)?);
            run_profile = Some(self.build_profile(&run_union, roles, db_payload)?);
        }
        for (_, location) in &run_slots {
            let key = self
                .backend
                .reseal_key(&ResealKeyRequest {
                    location,
                    pcr_profile: run_profile.as_deref(),
                    new_pcr_policy_version: new_policy_version,
                    hint_expect_fde_hook: !use_tpm,
                })
                .map_err(|source| ResealError::KeySlot {
                    slot: location.to_string(),
                    source,
                })?;
            updated.push(key);
        }
        self.commit_entry(
            ParamsKey::new(Role::Run, ALL_CONTAINERS),
            &["run"],
            &bootchain::unique_models(&inputs.run_mode),
            run_only_profile.as_deref(),
            use_tpm,
        )?;
        self.commit_entry(
            ParamsKey::new(Role::RunRecover, ALL_CONTAINERS),
            &["run", "recover"],
            &bootchain::unique_models(&run_union),
            run_profile.as_deref(),
            use_tpm,
        )?;
        self.warn_on_identity_drift(Role::RunRecover, &updated);
        if run_drifted {
            bootchain::write_boot_chains(&run_pbc, &run_path, next_run_count)?;
        }
        let run_updated = updated.len();

        // fallback object group: "default-fallback" slot per container;
        // the per-container catalog entries commit only once every
        // fallback slot resealed, a failed slot drops the whole role
        let fallback_slots = slots_named(&containers, FALLBACK_KEY_SLOT);
        let mut recovery_profile = None;
        if use_tpm && !fallback_slots.is_empty() {
            recovery_profile = Some(self.build_profile(&inputs.recovery, roles, db_payload)?);
        }
        for (_, location) in &fallback_slots {
            let key = self
                .backend
                .reseal_key(&ResealKeyRequest {
                    location,
                    pcr_profile: recovery_profile.as_deref(),
                    new_pcr_policy_version: new_policy_version,
                    hint_expect_fde_hook: !use_tpm,
                })
                .map_err(|source| ResealError::KeySlot {
                    slot: location.to_string(),
                    source,
                })?;
            updated.push(key);
        }
        let recovery_models = bootchain::unique_models(&inputs.recovery);
        for (container_role, _) in &fallback_slots {
            let boot_modes: &[&str] = if container_role == "system-save" {
                &["recover", "factory-reset"]
            } else {
                &["recover"]
            };
            self.commit_entry(
                ParamsKey::new(Role::Recover, container_role),
                boot_modes,
                &recovery_models,
                recovery_profile.as_deref(),
                use_tpm,
            )?;
        }
        self.warn_on_identity_drift(Role::Recover, &updated[run_updated..]);
        if recovery_drifted {
            bootchain::write_boot_chains(&recovery_pbc, &recovery_path, next_recovery_count)?;
        }

        if opts.revoke_old_keys && use_tpm && !updated.is_empty() {
            let devices: Vec<String> =
                containers.iter().map(|c| c.device_path.clone()).collect();
            self.revoke_old_keys(&devices, &updated)?;
        }
        info!("resealing done, {} key slots updated", updated.len());
        Ok(())
    }

    /// Updated keys reporting a primary key other than the one recorded
    /// for their role indicate bookkeeping drift; legitimate upgrade
    /// paths can cause it, so it never fails the pass.
    fn warn_on_identity_drift(&self, role: Role, keys: &[UpdatedKey]) {
        match self.manager.role_info(role) {
            Ok((expected, _)) => {
                for key in keys {
                    if key.primary_key_id != expected {
                        warn!(
                            "key slot {}:{} reports primary key {} while role {role} records {expected}",
                            key.device_path, key.slot_name, key.primary_key_id
                        );
                    }
                }
            }
            Err(err) => debug!("no recorded identity for role {role}: {err}"),
        }
    }

    /// Profile construction is expensive and pure, so the state lock is
    /// released around it.
    fn build_profile(
        &self,
        chains: &[BootChain],
        roles: &RoleToBootloader,
        db_payload: Option<&[u8]>,
    ) -> Result<Vec<u8>, SecbootError> {
        let cache_dir = dirs::boot_assets_cache_dir_under(self.rootdir);
        let relock = self.manager.unlock();
        let built = secboot::build_pcr_profile(self.backend, chains, roles, &cache_dir, db_payload);
        relock();
        built
    }

    /// Commits one catalog entry. When the TPM method is in use and no
    /// profile was computed for the role, the entry is skipped instead of
    /// recorded half-done.
    fn commit_entry(
        &self,
        key: ParamsKey,
        boot_modes: &[&str],
        models: &[SealingModel],
        profile: Option<&[u8]>,
        use_tpm: bool,
    ) -> Result<()> {
        if use_tpm && profile.is_none() {
            debug!(
                "{} for {}/{}",
                SecbootError::NoPcrProfileCalculated,
                key.role,
                key.container_role
            );
            return Ok(());
        }
        self.manager.update_parameters(
            &key,
            SealingParameters {
                boot_modes: boot_modes.iter().map(|m| m.to_string()).collect(),
                models: models.to_vec(),
                tpm_pcr_profile: profile.map(|p| p.to_vec()),
            },
        )?;
        Ok(())
    }

    /// Revokes superseded policy generations, once per primary-key
    /// identity over the union of that identity's updated keys.
    fn revoke_old_keys(&self, devices: &[String], updated: &[UpdatedKey]) -> Result<()> {
        let mut by_identity: BTreeMap<u32, Vec<UpdatedKey>> = BTreeMap::new();
        for key in updated {
            by_identity
                .entry(key.primary_key_id)
                .or_default()
                .push(key.clone());
        }
        let fallback_key_file = dirs::aux_key_file_under(self.rootdir);
        for (identity, keys) in by_identity {
            let primary_key = self.backend.get_primary_key(devices, &fallback_key_file)?;
            match self.manager.verify_primary_key(identity, &primary_key) {
                Ok(true) => {}
                Ok(false) => {
                    warn!("primary key {identity} does not match its recorded digest");
                }
                Err(err) => {
                    warn!("cannot verify primary key {identity}: {err}");
                }
            }
            self.backend
                .revoke_old_keys(&primary_key, &keys)
                .map_err(|err| SecbootError::Revocation(err.to_string()))?;
            debug!("revoked older keys for primary key {identity}");
        }
        Ok(())
    }
}

/// (container role, slot location) pairs of every container carrying the
/// named key slot, in provider order.
fn slots_named(
    containers: &[EncryptedContainer],
    slot_name: &str,
) -> Vec<(String, KeyDataLocation)> {
    containers
        .iter()
        .filter_map(|c| {
            c.legacy_keys.get(slot_name).map(|key_file| {
                (
                    c.container_role.clone(),
                    KeyDataLocation {
                        device_path: c.device_path.clone(),
                        slot_name: slot_name.to_string(),
                        key_file: key_file.clone(),
                    },
                )
            })
        })
        .collect()
}
