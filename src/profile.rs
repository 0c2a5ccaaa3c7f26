//! Model parameters and load chains for PCR policy computation.
//!
//! The sealing backend needs, per model, the set of EFI load chains
//! (ordered image sequences the firmware may measure) and the kernel
//! command lines to predict PCR values for. This module derives those
//! parameters from canonical boot chains and the boot asset cache.

use crate::bootchain::{BootChain, RoleToBootloader};
use crate::model::SealingModel;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("file {0} not found in boot assets cache")]
    MissingAsset(String),
    #[error("cannot compose load chains: asset chain is empty")]
    EmptyAssetChain,
}

pub type Result<T, E = ProfileError> = core::result::Result<T, E>;

/// A branching sequence of images measured during boot. Each node is one
/// image file; its children are the images that may be loaded next.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LoadChain {
    pub image: PathBuf,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<LoadChain>,
}

impl LoadChain {
    pub fn leaf(image: PathBuf) -> Self {
        LoadChain {
            image,
            next: Vec::new(),
        }
    }

    /// Number of distinct root-to-leaf paths through the chain.
    pub fn path_count(&self) -> usize {
        if self.next.is_empty() {
            1
        } else {
            self.next.iter().map(LoadChain::path_count).sum()
        }
    }
}

/// Everything the PCR profile computation needs for one model.
#[derive(Clone, Debug)]
pub struct SealKeyModelParams {
    pub model: SealingModel,
    pub load_chains: Vec<LoadChain>,
    pub kernel_cmdlines: Vec<String>,
    /// Pending EFI signature database content to fold into the predicted
    /// measurements, set only during a coordinated firmware DB update.
    pub efi_signature_db_update: Option<Vec<u8>>,
}

fn cached_asset_paths(
    cache_dir: &Path,
    bootloader: &str,
    name: &str,
    hashes: &[String],
) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::with_capacity(hashes.len());
    for hash in hashes {
        let p = cache_dir.join(bootloader).join(format!("{name}-{hash}"));
        if !p.exists() {
            return Err(ProfileError::MissingAsset(p.display().to_string()));
        }
        paths.push(p);
    }
    Ok(paths)
}

/// Builds the load chains of a single boot chain, branching wherever an
/// asset has more than one acceptable hash. The kernel image forms the
/// leaves.
pub fn load_chains_for_boot_chain(
    chain: &BootChain,
    roles: &RoleToBootloader,
    cache_dir: &Path,
) -> Result<Vec<LoadChain>> {
    if chain.asset_chain.is_empty() {
        return Err(ProfileError::EmptyAssetChain);
    }
    let mut next = vec![LoadChain::leaf(chain.kernel_boot_file.clone())];
    for asset in chain.asset_chain.iter().rev() {
        let paths = cached_asset_paths(
            cache_dir,
            roles.name_for(asset.role),
            &asset.name,
            &asset.hashes,
        )?;
        next = paths
            .into_iter()
            .map(|image| LoadChain {
                image,
                next: next.clone(),
            })
            .collect();
    }
    Ok(next)
}

/// Derives per-model sealing parameters from the given chains, preserving
/// the order in which models first appear. Command lines and load chains
/// of chains sharing a model are concatenated.
pub fn seal_key_model_params(
    chains: &[BootChain],
    roles: &RoleToBootloader,
    cache_dir: &Path,
) -> Result<Vec<SealKeyModelParams>> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut params: Vec<SealKeyModelParams> = Vec::new();
    for chain in chains {
        let model = chain.model_for_sealing();
        let slot = match index.get(&model.unique_id()) {
            Some(&i) => i,
            None => {
                index.insert(model.unique_id(), params.len());
                params.push(SealKeyModelParams {
                    model,
                    load_chains: Vec::new(),
                    kernel_cmdlines: Vec::new(),
                    efi_signature_db_update: None,
                });
                params.len() - 1
            }
        };
        let entry = &mut params[slot];
        entry
            .load_chains
            .extend(load_chains_for_boot_chain(chain, roles, cache_dir)?);
        for cmdline in &chain.kernel_cmdlines {
            if !entry.kernel_cmdlines.contains(cmdline) {
                entry.kernel_cmdlines.push(cmdline.clone());
            }
        }
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootchain::{AssetRole, BootAsset};
    use crate::testutil::{boot_chain, boot_chain_with_kernel};
    use eyre::Result;
    use std::fs;

    fn cache_with_assets(dir: &Path, bootloader: &str, files: &[&str]) -> Result<()> {
        let bl_dir = dir.join(bootloader);
        fs::create_dir_all(&bl_dir)?;
        for f in files {
            fs::write(bl_dir.join(f), b"img")?;
        }
        Ok(())
    }

    fn roles() -> RoleToBootloader {
        RoleToBootloader {
            run: "grub".to_string(),
            recovery: "grub".to_string(),
        }
    }

    #[test]
    fn load_chains_branch_per_hash() -> Result<()> {
        let dir = tempfile::tempdir()?;
        cache_with_assets(dir.path(), "grub", &["shim-aa", "shim-bb", "grub-cc"])?;

        let mut chain = boot_chain();
        chain.asset_chain = vec![
            BootAsset {
                role: AssetRole::Run,
                name: "shim".to_string(),
                hashes: vec!["aa".to_string(), "bb".to_string()],
            },
            BootAsset {
                role: AssetRole::Run,
                name: "grub".to_string(),
                hashes: vec!["cc".to_string()],
            },
        ];
        let chains = load_chains_for_boot_chain(&chain, &roles(), dir.path())?;
        assert_eq!(chains.len(), 2);
        let paths: usize = chains.iter().map(LoadChain::path_count).sum();
        assert_eq!(paths, 2);
        // every branch ends at the kernel image
        assert_eq!(chains[0].next[0].next[0].image, chain.kernel_boot_file);
        Ok(())
    }

    #[test]
    fn missing_cached_asset_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let chain = boot_chain();
        let err = load_chains_for_boot_chain(&chain, &roles(), dir.path()).unwrap_err();
        assert!(matches!(err, ProfileError::MissingAsset(_)));
    }

    #[test]
    fn params_group_by_model() -> Result<()> {
        let dir = tempfile::tempdir()?;
        cache_with_assets(dir.path(), "grub", &["shim-aa"])?;

        let mut a = boot_chain_with_kernel("kernel", "1");
        a.kernel_cmdlines = vec!["console=ttyS0".to_string()];
        let mut b = boot_chain_with_kernel("kernel", "2");
        b.kernel_cmdlines = vec!["console=ttyS0".to_string(), "quiet".to_string()];
        let mut c = boot_chain_with_kernel("kernel", "1");
        c.model = "other-model".to_string();

        let params = seal_key_model_params(&[a, b, c], &roles(), dir.path())?;
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].load_chains.len(), 2);
        // shared command lines are not repeated
        assert_eq!(params[0].kernel_cmdlines, vec!["console=ttyS0", "quiet"]);
        assert_eq!(params[1].model.model, "other-model");
        Ok(())
    }
}
