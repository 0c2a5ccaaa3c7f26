//! Shared fixtures for unit tests: a recording sealing backend, fixed
//! collaborator providers and boot-chain builders.

use crate::bootchain::{AssetRole, BootAsset, BootChain, BootChains, RoleToBootloader};
use crate::manager::{ContainerProvider, EncryptedContainer, Result as ManagerResult};
use crate::model::Grade;
use crate::profile::SealKeyModelParams;
use crate::secboot::{
    ResealKeyRequest, Result as SecbootResult, SealKeyRequest, SealKeysParams,
    SealKeysWithFdeHookParams, SealingBackend, SecbootError, TpmProvisionMode, UpdatedKey,
    FALLBACK_OBJECT_PCR_POLICY_COUNTER_HANDLE,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub fn boot_chain() -> BootChain {
    boot_chain_with_kernel("kernel", "1")
}

pub fn boot_chain_with_kernel(kernel: &str, revision: &str) -> BootChain {
    BootChain {
        brand_id: "my-brand".to_string(),
        model: "my-model".to_string(),
        grade: Grade::Signed,
        model_sign_key_id: "my-key-id".to_string(),
        classic: false,
        asset_chain: vec![BootAsset {
            role: AssetRole::Run,
            name: "shim".to_string(),
            hashes: vec!["aa".to_string()],
        }],
        kernel: kernel.to_string(),
        kernel_revision: revision.to_string(),
        kernel_cmdlines: vec!["console=ttyS0".to_string()],
        kernel_boot_file: PathBuf::from("/run/mnt/data/kernel.efi"),
    }
}

fn recovery_boot_chain() -> BootChain {
    let mut chain = boot_chain();
    chain.asset_chain = vec![BootAsset {
        role: AssetRole::Recovery,
        name: "shim".to_string(),
        hashes: vec!["aa".to_string()],
    }];
    chain.kernel_cmdlines = vec!["console=ttyS0 recovery_mode=recover".to_string()];
    chain
}

/// One run-mode and one recovery chain, both for the same model.
pub fn boot_inputs() -> BootChains {
    BootChains {
        run_mode: vec![boot_chain()],
        recovery_for_run_key: Vec::new(),
        recovery: vec![recovery_boot_chain()],
        role_to_bootloader: RoleToBootloader {
            run: "grub".to_string(),
            recovery: "grub".to_string(),
        },
    }
}

/// Populates the asset cache under `rootdir` with the files the fixture
/// chains reference.
pub fn seed_asset_cache(rootdir: &Path) -> std::io::Result<()> {
    let dir = crate::dirs::boot_assets_cache_dir_under(rootdir).join("grub");
    fs::create_dir_all(&dir)?;
    fs::write(dir.join("shim-aa"), b"shim")?;
    Ok(())
}

/// The usual two-container device: run and fallback slots on system-data,
/// a fallback slot on system-save.
pub fn two_containers(rootdir: &Path) -> Vec<EncryptedContainer> {
    let save_dir = crate::dirs::save_fde_dir_under(rootdir);
    vec![
        EncryptedContainer::new("system-data", "/dev/vda4")
            .with_legacy_key("default", save_dir.join("system-data.sealed-key"))
            .with_legacy_key(
                "default-fallback",
                save_dir.join("system-data.recovery.sealed-key"),
            ),
        EncryptedContainer::new("system-save", "/dev/vda5").with_legacy_key(
            "default-fallback",
            save_dir.join("system-save.recovery.sealed-key"),
        ),
    ]
}

#[derive(Default)]
pub struct FixedContainers {
    pub containers: Vec<EncryptedContainer>,
}

impl FixedContainers {
    pub fn new(containers: Vec<EncryptedContainer>) -> Self {
        FixedContainers { containers }
    }
}

impl ContainerProvider for FixedContainers {
    fn encrypted_containers(&self) -> ManagerResult<Vec<EncryptedContainer>> {
        Ok(self.containers.clone())
    }
}

/// Boot-chain provider that always reports the same chains.
pub struct FixedBootChains(pub BootChains);

impl crate::coordinator::BootChainsProvider for FixedBootChains {
    fn current_boot_chains(&self) -> Result<BootChains, crate::coordinator::CoordError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Default)]
pub struct RecordedCalls {
    /// Model counts of every profile build.
    pub profile_builds: Vec<usize>,
    /// Payloads attached to built profiles, if any.
    pub profile_db_updates: Vec<Option<Vec<u8>>>,
    /// (device:slot, had_profile, new_policy_version, hint_hook).
    pub reseals: Vec<(String, bool, bool, bool)>,
    /// (primary key, updated keys) of every revocation.
    pub revokes: Vec<(Vec<u8>, Vec<UpdatedKey>)>,
    pub provisions: Vec<TpmProvisionMode>,
    /// (key names, policy counter handle) of every TPM seal.
    pub seals: Vec<(Vec<String>, u32)>,
    pub hook_seals: Vec<Vec<String>>,
    pub released_handles: Vec<Vec<u32>>,
    pub bootstrap_removed: Vec<Vec<String>>,
}

/// Sealing backend that records every call and can be told to fail the
/// reseal of one particular key slot.
pub struct MockBackend {
    pub calls: Mutex<RecordedCalls>,
    pub fail_reseal_slot: Mutex<Option<String>>,
    pub primary_key: Vec<u8>,
    pub primary_key_id: u32,
    /// Handle reported for sealed fallback keys, updated by seal_keys.
    pub fallback_handle: Mutex<u32>,
}

impl Default for MockBackend {
    fn default() -> Self {
        MockBackend {
            calls: Mutex::new(RecordedCalls::default()),
            fail_reseal_slot: Mutex::new(None),
            primary_key: b"the-primary-key".to_vec(),
            primary_key_id: 0,
            fallback_handle: Mutex::new(FALLBACK_OBJECT_PCR_POLICY_COUNTER_HANDLE),
        }
    }
}

impl MockBackend {
    pub fn fail_reseal_of(&self, device_path: &str, slot_name: &str) {
        *self.fail_reseal_slot.lock().unwrap() = Some(format!("{device_path}:{slot_name}"));
    }

    pub fn recorded(&self) -> std::sync::MutexGuard<'_, RecordedCalls> {
        self.calls.lock().unwrap()
    }
}

impl SealingBackend for MockBackend {
    fn provision_tpm(
        &self,
        mode: TpmProvisionMode,
        _lockout_auth_file: &Path,
    ) -> SecbootResult<()> {
        self.recorded().provisions.push(mode);
        Ok(())
    }

    fn build_pcr_protection_profile(
        &self,
        model_params: &[SealKeyModelParams],
        _allow_insufficient_dma_protection: bool,
    ) -> SecbootResult<Vec<u8>> {
        let mut calls = self.recorded();
        calls.profile_builds.push(model_params.len());
        calls
            .profile_db_updates
            .push(model_params.first().and_then(|p| p.efi_signature_db_update.clone()));
        Ok(format!("profile-{}", calls.profile_builds.len()).into_bytes())
    }

    fn seal_keys(
        &self,
        requests: &[SealKeyRequest],
        params: &SealKeysParams,
    ) -> SecbootResult<()> {
        let names: Vec<String> = requests.iter().map(|r| r.key_name.clone()).collect();
        if requests
            .iter()
            .any(|r| r.location.slot_name == "default-fallback")
        {
            *self.fallback_handle.lock().unwrap() = params.pcr_policy_counter_handle;
        }
        self.recorded()
            .seals
            .push((names, params.pcr_policy_counter_handle));
        Ok(())
    }

    fn seal_keys_with_fde_hook(
        &self,
        requests: &[SealKeyRequest],
        _params: &SealKeysWithFdeHookParams,
    ) -> SecbootResult<()> {
        let names: Vec<String> = requests.iter().map(|r| r.key_name.clone()).collect();
        self.recorded().hook_seals.push(names);
        Ok(())
    }

    fn reseal_key(&self, request: &ResealKeyRequest<'_>) -> SecbootResult<UpdatedKey> {
        let slot = request.location.to_string();
        if self.fail_reseal_slot.lock().unwrap().as_deref() == Some(slot.as_str()) {
            return Err(SecbootError::Backend(format!("cannot reseal {slot}")));
        }
        self.recorded().reseals.push((
            slot,
            request.pcr_profile.is_some(),
            request.new_pcr_policy_version,
            request.hint_expect_fde_hook,
        ));
        Ok(UpdatedKey {
            primary_key_id: self.primary_key_id,
            device_path: request.location.device_path.clone(),
            slot_name: request.location.slot_name.clone(),
        })
    }

    fn get_primary_key(
        &self,
        _devices: &[String],
        _fallback_key_file: &Path,
    ) -> SecbootResult<Vec<u8>> {
        Ok(self.primary_key.clone())
    }

    fn revoke_old_keys(&self, primary_key: &[u8], updated: &[UpdatedKey]) -> SecbootResult<()> {
        self.recorded()
            .revokes
            .push((primary_key.to_vec(), updated.to_vec()));
        Ok(())
    }

    fn pcr_handle_of_sealed_key(&self, _key_file: &Path) -> SecbootResult<u32> {
        Ok(*self.fallback_handle.lock().unwrap())
    }

    fn release_pcr_policy_counter_handles(&self, handles: &[u32]) -> SecbootResult<()> {
        self.recorded().released_handles.push(handles.to_vec());
        Ok(())
    }

    fn remove_bootstrap_keys(&self, devices: &[String]) -> SecbootResult<()> {
        self.recorded().bootstrap_removed.push(devices.to_vec());
        Ok(())
    }
}
