//! The seal engine: first-time sealing of the run and fallback objects.
//!
//! Runs once per device, at install or factory reset, before any reseal
//! has ever happened. The run object carries the data-partition key and
//! is bound to the union of run-mode chains and the recovery chains
//! allowed to produce a run key; the fallback object carries both the
//! data and save keys and is bound to recovery chains only. After a
//! successful seal the generation-zero boot-chain snapshots and the
//! sealing method stamp are written so later reseals know where they
//! start from.

use crate::bootchain::{self, BootChainError, BootChains};
use crate::dirs;
use crate::manager::{EncryptedContainer, FdeManager, FdeStateManager, ManagerError};
use crate::secboot::{
    self, alternative_pcr_handles, KeyDataLocation, SealKeyRequest, SealKeysParams,
    SealKeysWithFdeHookParams, SealingBackend, SealingMethod, SecbootError, TpmProvisionMode,
    FALLBACK_OBJECT_PCR_POLICY_COUNTER_HANDLE, RUN_OBJECT_PCR_POLICY_COUNTER_HANDLE,
};
use crate::state::{KeyDigest, Role};
use log::{debug, info};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SealError {
    #[error(transparent)]
    Secboot(#[from] SecbootError),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    BootChain(#[from] BootChainError),
    #[error("internal error: cannot seal without a {0} container")]
    MissingContainer(&'static str),
    #[error("internal error: cannot seal without boot chains")]
    NoBootChains,
}

pub type Result<T, E = SealError> = core::result::Result<T, E>;

/// Why the device is being sealed from scratch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SealTrigger {
    Install,
    FactoryReset,
}

pub struct SealEngine<'a> {
    backend: &'a dyn SealingBackend,
    manager: &'a FdeManager,
    rootdir: &'a Path,
}

impl<'a> SealEngine<'a> {
    pub fn new(backend: &'a dyn SealingBackend, manager: &'a FdeManager, rootdir: &'a Path) -> Self {
        SealEngine {
            backend,
            manager,
            rootdir,
        }
    }

    pub fn seal_key_for_boot_chains(
        &self,
        method: SealingMethod,
        inputs: &BootChains,
        trigger: SealTrigger,
    ) -> Result<()> {
        match method {
            SealingMethod::Tpm => self.seal_with_tpm(inputs, trigger),
            SealingMethod::FdeSetupHook => self.seal_with_fde_hook(inputs),
        }
    }

    fn seal_with_tpm(&self, inputs: &BootChains, trigger: SealTrigger) -> Result<()> {
        let containers = self.manager.get_encrypted_containers()?;
        let data = container_with_role(&containers, "system-data")?;
        let save = container_with_role(&containers, "system-save")?;

        let (run_handle, fallback_handle, provision_mode) = match trigger {
            SealTrigger::Install => (
                RUN_OBJECT_PCR_POLICY_COUNTER_HANDLE,
                FALLBACK_OBJECT_PCR_POLICY_COUNTER_HANDLE,
                TpmProvisionMode::Full,
            ),
            SealTrigger::FactoryReset => {
                // alternate handle sets across resets so an interrupted
                // reset never strands the only valid fallback key behind
                // a released counter
                let current = self
                    .backend
                    .pcr_handle_of_sealed_key(&dirs::fallback_data_sealed_key_file_under(
                        self.rootdir,
                    ))?;
                let (run, fallback) = alternative_pcr_handles(current);
                debug!(
                    "factory reset, moving PCR policy counters from {current:#x} to \
                     {run:#x}/{fallback:#x}"
                );
                // the chosen set may be left over from an interrupted
                // previous reset
                self.backend
                    .release_pcr_policy_counter_handles(&[run, fallback])?;
                (run, fallback, TpmProvisionMode::PartialReprovision)
            }
        };
        self.backend
            .provision_tpm(provision_mode, &dirs::tpm_lockout_auth_file_under(self.rootdir))?;

        let mut run_union = inputs.run_mode.clone();
        run_union.extend(inputs.recovery_for_run_key.iter().cloned());
        if run_union.is_empty() || inputs.recovery.is_empty() {
            return Err(SealError::NoBootChains);
        }
        let cache_dir = dirs::boot_assets_cache_dir_under(self.rootdir);
        let run_profile = secboot::build_pcr_profile(
            self.backend,
            &run_union,
            &inputs.role_to_bootloader,
            &cache_dir,
            None,
        )?;
        let recovery_profile = secboot::build_pcr_profile(
            self.backend,
            &inputs.recovery,
            &inputs.role_to_bootloader,
            &cache_dir,
            None,
        )?;

        let aux_key_file = dirs::aux_key_file_under(self.rootdir);
        let auth_key_file = dirs::tpm_policy_auth_key_file_under(self.rootdir);
        self.backend.seal_keys(
            &[run_key_request(data, self.rootdir)],
            &SealKeysParams {
                pcr_profile: run_profile,
                pcr_policy_counter_handle: run_handle,
                primary_key_file: aux_key_file.clone(),
                tpm_policy_auth_key_file: auth_key_file.clone(),
            },
        )?;
        self.backend.seal_keys(
            &fallback_key_requests(data, save, self.rootdir),
            &SealKeysParams {
                pcr_profile: recovery_profile,
                pcr_policy_counter_handle: fallback_handle,
                primary_key_file: aux_key_file.clone(),
                tpm_policy_auth_key_file: auth_key_file,
            },
        )?;

        // record the fresh primary key digest and the per-role identity
        let devices: Vec<String> = containers.iter().map(|c| c.device_path.clone()).collect();
        let primary_key = self.backend.get_primary_key(&devices, &aux_key_file)?;
        self.manager
            .record_primary_key(0, KeyDigest::of(&primary_key, digest_salt()))?;
        for role in [Role::Run, Role::RunRecover, Role::Recover] {
            self.manager.set_role_info(role, 0, 1)?;
        }

        // generation zero of the drift-detection snapshots
        let run_pbc = bootchain::to_predictable_boot_chains(&run_union);
        let recovery_pbc = bootchain::to_predictable_boot_chains(&inputs.recovery);
        bootchain::write_boot_chains(&run_pbc, &dirs::boot_chains_file_under(self.rootdir), 0)?;
        bootchain::write_boot_chains(
            &recovery_pbc,
            &dirs::recovery_boot_chains_file_under(self.rootdir),
            0,
        )?;
        secboot::stamp_sealed_keys(self.rootdir, SealingMethod::Tpm)?;
        info!("sealed keys with the TPM, counters {run_handle:#x}/{fallback_handle:#x}");
        Ok(())
    }

    fn seal_with_fde_hook(&self, inputs: &BootChains) -> Result<()> {
        let containers = self.manager.get_encrypted_containers()?;
        let data = container_with_role(&containers, "system-data")?;
        let save = container_with_role(&containers, "system-save")?;
        let model = inputs
            .run_mode
            .first()
            .map(|c| c.model_for_sealing())
            .ok_or(SealError::NoBootChains)?;

        let mut requests = vec![run_key_request(data, self.rootdir)];
        requests.extend(fallback_key_requests(data, save, self.rootdir));
        self.backend.seal_keys_with_fde_hook(
            &requests,
            &SealKeysWithFdeHookParams {
                model,
                aux_key_file: dirs::aux_key_file_under(self.rootdir),
            },
        )?;

        // irreversible, so only after the hook confirmed success
        let devices: Vec<String> = containers.iter().map(|c| c.device_path.clone()).collect();
        self.backend.remove_bootstrap_keys(&devices)?;
        secboot::stamp_sealed_keys(self.rootdir, SealingMethod::FdeSetupHook)?;
        info!("sealed keys with the FDE setup hook");
        Ok(())
    }
}

fn container_with_role<'c>(
    containers: &'c [EncryptedContainer],
    role: &'static str,
) -> Result<&'c EncryptedContainer> {
    containers
        .iter()
        .find(|c| c.container_role == role)
        .ok_or(SealError::MissingContainer(role))
}

fn run_key_request(data: &EncryptedContainer, rootdir: &Path) -> SealKeyRequest {
    SealKeyRequest {
        key_name: "ubuntu-data".to_string(),
        location: KeyDataLocation {
            device_path: data.device_path.clone(),
            slot_name: "default".to_string(),
            key_file: dirs::data_sealed_key_file_under(rootdir),
        },
    }
}

fn fallback_key_requests(
    data: &EncryptedContainer,
    save: &EncryptedContainer,
    rootdir: &Path,
) -> Vec<SealKeyRequest> {
    vec![
        SealKeyRequest {
            key_name: "ubuntu-data".to_string(),
            location: KeyDataLocation {
                device_path: data.device_path.clone(),
                slot_name: "default-fallback".to_string(),
                key_file: dirs::fallback_data_sealed_key_file_under(rootdir),
            },
        },
        SealKeyRequest {
            key_name: "ubuntu-save".to_string(),
            location: KeyDataLocation {
                device_path: save.device_path.clone(),
                slot_name: "default-fallback".to_string(),
                key_file: dirs::fallback_save_sealed_key_file_under(rootdir),
            },
        },
    ]
}

fn digest_salt() -> Vec<u8> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    nanos.to_be_bytes().to_vec()
}
