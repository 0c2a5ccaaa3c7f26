//! Canonical representation of acceptable boot paths.
//!
//! A boot chain is one fully resolved way the device may boot: the ordered
//! bootloader asset chain, the kernel, its command lines and the model it
//! applies to. Chains are canonicalized (sorted, de-duplicated) into
//! [`PredictableBootChains`] before being compared or persisted, so that
//! ordering differences never register as a change of the acceptable set.
//!
//! Each persisted snapshot file carries a generation counter that only
//! advances when the set of chains materially changes; the counter is what
//! the reseal engine consults to decide whether any work is needed.

use crate::dirs;
use crate::model::{Grade, SealingModel};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BootChainError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = BootChainError> = core::result::Result<T, E>;

/// Role of a measured boot asset within the boot process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AssetRole {
    #[serde(rename = "run-mode")]
    Run,
    #[serde(rename = "recovery")]
    Recovery,
}

/// One measured bootloader asset. Multiple acceptable content hashes
/// tolerate an in-place update of the asset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootAsset {
    pub role: AssetRole,
    pub name: String,
    pub hashes: Vec<String>,
}

/// One concrete, fully resolved boot path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootChain {
    #[serde(rename = "brand-id")]
    pub brand_id: String,
    pub model: String,
    pub grade: Grade,
    #[serde(rename = "model-sign-key-id")]
    pub model_sign_key_id: String,
    #[serde(default)]
    pub classic: bool,
    #[serde(rename = "asset-chain")]
    pub asset_chain: Vec<BootAsset>,
    pub kernel: String,
    /// Empty for locally built kernels without a store revision; such
    /// chains cannot be trusted to compare equal by content.
    #[serde(rename = "kernel-revision", default)]
    pub kernel_revision: String,
    #[serde(rename = "kernel-cmdlines")]
    pub kernel_cmdlines: Vec<String>,
    /// Path of the kernel image used when building load chains; not part
    /// of the persisted or compared form.
    #[serde(skip)]
    pub kernel_boot_file: PathBuf,
}

impl BootChain {
    pub fn model_for_sealing(&self) -> SealingModel {
        SealingModel {
            brand_id: self.brand_id.clone(),
            model: self.model.clone(),
            grade: self.grade,
            sign_key_id: self.model_sign_key_id.clone(),
            series: String::new(),
            classic: self.classic,
        }
    }

    pub fn is_unrevisioned(&self) -> bool {
        self.kernel_revision.is_empty()
    }
}

/// Bootloader names keyed by asset role, used to locate cached assets.
#[derive(Clone, Debug, Default)]
pub struct RoleToBootloader {
    pub run: String,
    pub recovery: String,
}

impl RoleToBootloader {
    pub fn name_for(&self, role: AssetRole) -> &str {
        match role {
            AssetRole::Run => &self.run,
            AssetRole::Recovery => &self.recovery,
        }
    }
}

/// The full boot-chain input of one seal or reseal pass.
#[derive(Clone, Debug, Default)]
pub struct BootChains {
    /// Chains for normal run-mode boots.
    pub run_mode: Vec<BootChain>,
    /// Recovery chains that are allowed to produce a run-mode key; a
    /// superset of `recovery` during a model transition.
    pub recovery_for_run_key: Vec<BootChain>,
    /// Recovery chains the fallback object is sealed to.
    pub recovery: Vec<BootChain>,
    pub role_to_bootloader: RoleToBootloader,
}

/// Canonicalized, de-duplicated sequence of boot chains.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PredictableBootChains(Vec<BootChain>);

impl Deref for PredictableBootChains {
    type Target = [BootChain];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

fn chain_key(chain: &BootChain) -> Vec<u8> {
    // serialization of BootChain cannot fail: all fields are plain data
    serde_json::to_vec(chain).expect("boot chain is always serializable")
}

/// Chains compare by their persisted form; `kernel_boot_file` is a local
/// build input absent from stored snapshots and must not affect equality.
impl PartialEq for BootChain {
    fn eq(&self, other: &Self) -> bool {
        chain_key(self) == chain_key(other)
    }
}

impl Eq for BootChain {}

/// Canonicalizes boot chains: command lines sorted within each chain, the
/// chains sorted by their serialized form and de-duplicated.
pub fn to_predictable_boot_chains(chains: &[BootChain]) -> PredictableBootChains {
    let mut canonical: Vec<BootChain> = chains.to_vec();
    for chain in &mut canonical {
        chain.kernel_cmdlines.sort();
    }
    canonical.sort_by_key(chain_key);
    canonical.dedup_by(|a, b| chain_key(a) == chain_key(b));
    PredictableBootChains(canonical)
}

impl PredictableBootChains {
    pub fn has_unrevisioned_kernels(&self) -> bool {
        self.0.iter().any(BootChain::is_unrevisioned)
    }
}

/// Outcome of comparing two canonical chain sets for reseal purposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootChainEquivalence {
    Equivalent,
    /// The sets contain unrevisioned kernels, so equality of the
    /// serialized form does not prove the measured content is unchanged.
    Unrevisioned,
    Different,
}

pub fn predictable_boot_chains_equivalence(
    a: &PredictableBootChains,
    b: &PredictableBootChains,
) -> BootChainEquivalence {
    if a.has_unrevisioned_kernels() || b.has_unrevisioned_kernels() {
        return BootChainEquivalence::Unrevisioned;
    }
    if a.0 == b.0 {
        BootChainEquivalence::Equivalent
    } else {
        BootChainEquivalence::Different
    }
}

#[derive(Serialize, Deserialize)]
struct BootChainsFile {
    #[serde(rename = "reseal-count")]
    reseal_count: u32,
    #[serde(rename = "boot-chains")]
    boot_chains: Vec<BootChain>,
}

/// Reads a boot-chain snapshot file. A missing file yields an empty set
/// with generation zero.
pub fn read_boot_chains(path: &Path) -> Result<(PredictableBootChains, u32)> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok((PredictableBootChains(Vec::new()), 0));
        }
        Err(err) => return Err(err.into()),
    };
    let file: BootChainsFile = serde_json::from_slice(&data)?;
    Ok((to_predictable_boot_chains(&file.boot_chains), file.reseal_count))
}

/// Persists a boot-chain snapshot together with its generation counter.
pub fn write_boot_chains(
    pbc: &PredictableBootChains,
    path: &Path,
    reseal_count: u32,
) -> Result<()> {
    let file = BootChainsFile {
        reseal_count,
        boot_chains: pbc.0.clone(),
    };
    let data = serde_json::to_vec(&file)?;
    dirs::atomic_write(path, &data, 0o600)?;
    Ok(())
}

/// Decides whether the given canonical chains require a reseal compared to
/// the snapshot stored at `path`, and returns the next generation counter
/// value to persist alongside a reseal.
///
/// `expect_reseal` settles the ambiguous case of chains containing
/// unrevisioned kernels, where set equality is not trustworthy.
pub fn is_reseal_needed(
    pbc: &PredictableBootChains,
    path: &Path,
    expect_reseal: bool,
) -> Result<(bool, u32)> {
    let (previous, count) = read_boot_chains(path)?;
    let needed = match predictable_boot_chains_equivalence(pbc, &previous) {
        BootChainEquivalence::Equivalent => false,
        BootChainEquivalence::Unrevisioned => expect_reseal,
        BootChainEquivalence::Different => true,
    };
    if !needed {
        debug!("boot chains unchanged under {}", path.display());
    }
    Ok((needed, count + 1))
}

/// Collects the distinct models covered by the given chains, in a stable
/// order.
pub fn unique_models(chains: &[BootChain]) -> Vec<SealingModel> {
    let mut seen: HashMap<String, ()> = HashMap::new();
    let mut models = Vec::new();
    for chain in chains {
        let model = chain.model_for_sealing();
        if seen.insert(model.unique_id(), ()).is_none() {
            models.push(model);
        }
    }
    models
}

impl fmt::Display for BootChainEquivalence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BootChainEquivalence::Equivalent => "equivalent",
            BootChainEquivalence::Unrevisioned => "unrevisioned",
            BootChainEquivalence::Different => "different",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{boot_chain, boot_chain_with_kernel};
    use eyre::Result;

    #[test]
    fn canonicalization_is_order_independent() {
        let a = boot_chain_with_kernel("kernel", "1");
        let b = boot_chain_with_kernel("kernel", "2");
        let forward = to_predictable_boot_chains(&[a.clone(), b.clone()]);
        let backward = to_predictable_boot_chains(&[b, a]);
        assert_eq!(forward, backward);
    }

    #[test]
    fn canonicalization_deduplicates() {
        let a = boot_chain_with_kernel("kernel", "1");
        let pbc = to_predictable_boot_chains(&[a.clone(), a.clone(), a]);
        assert_eq!(pbc.len(), 1);
    }

    #[test]
    fn canonicalization_sorts_cmdlines() {
        let mut a = boot_chain();
        a.kernel_cmdlines = vec!["zz".to_string(), "aa".to_string()];
        let pbc = to_predictable_boot_chains(&[a]);
        assert_eq!(pbc[0].kernel_cmdlines, vec!["aa", "zz"]);
    }

    #[test]
    fn equivalence_classes() {
        let a = to_predictable_boot_chains(&[boot_chain_with_kernel("kernel", "1")]);
        let same = to_predictable_boot_chains(&[boot_chain_with_kernel("kernel", "1")]);
        let other = to_predictable_boot_chains(&[boot_chain_with_kernel("kernel", "2")]);
        assert_eq!(
            predictable_boot_chains_equivalence(&a, &same),
            BootChainEquivalence::Equivalent
        );
        assert_eq!(
            predictable_boot_chains_equivalence(&a, &other),
            BootChainEquivalence::Different
        );

        // an unrevisioned kernel poisons the comparison even when the
        // serialized forms are identical
        let local = to_predictable_boot_chains(&[boot_chain_with_kernel("kernel", "")]);
        let local_too = to_predictable_boot_chains(&[boot_chain_with_kernel("kernel", "")]);
        assert_eq!(
            predictable_boot_chains_equivalence(&local, &local_too),
            BootChainEquivalence::Unrevisioned
        );
    }

    #[test]
    fn equality_ignores_the_kernel_boot_file_path() {
        let a = boot_chain();
        assert!(!a.kernel_boot_file.as_os_str().is_empty());
        let mut b = a.clone();
        b.kernel_boot_file = PathBuf::new();
        assert_eq!(a, b);
    }

    #[test]
    fn stored_snapshot_stays_equivalent_to_derived_chains() -> Result<()> {
        // derived chains carry a kernel boot file that the snapshot file
        // strips; comparing the two must not register as drift
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("boot-chains");
        let pbc = to_predictable_boot_chains(&[boot_chain()]);
        write_boot_chains(&pbc, &path, 1)?;
        let (needed, next) = is_reseal_needed(&pbc, &path, false)?;
        assert!(!needed);
        assert_eq!(next, 2);
        Ok(())
    }

    #[test]
    fn read_missing_file_is_empty_at_generation_zero() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (pbc, count) = read_boot_chains(&dir.path().join("boot-chains"))?;
        assert!(pbc.is_empty());
        assert_eq!(count, 0);
        Ok(())
    }

    #[test]
    fn write_read_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("boot-chains");
        let pbc = to_predictable_boot_chains(&[boot_chain()]);
        write_boot_chains(&pbc, &path, 3)?;
        let (read, count) = read_boot_chains(&path)?;
        assert_eq!(read, pbc);
        assert_eq!(count, 3);
        Ok(())
    }

    #[test]
    fn reseal_needed_on_drift_only() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("boot-chains");
        let pbc = to_predictable_boot_chains(&[boot_chain_with_kernel("kernel", "1")]);
        write_boot_chains(&pbc, &path, 5)?;

        let (needed, next) = is_reseal_needed(&pbc, &path, false)?;
        assert!(!needed);
        assert_eq!(next, 6);

        let drifted = to_predictable_boot_chains(&[
            boot_chain_with_kernel("kernel", "1"),
            boot_chain_with_kernel("kernel", "2"),
        ]);
        let (needed, next) = is_reseal_needed(&drifted, &path, false)?;
        assert!(needed);
        assert_eq!(next, 6);
        Ok(())
    }

    #[test]
    fn unrevisioned_defers_to_expect_reseal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("boot-chains");
        let pbc = to_predictable_boot_chains(&[boot_chain_with_kernel("kernel", "")]);
        write_boot_chains(&pbc, &path, 0)?;

        let (needed, _) = is_reseal_needed(&pbc, &path, false)?;
        assert!(!needed);
        let (needed, _) = is_reseal_needed(&pbc, &path, true)?;
        assert!(needed);
        Ok(())
    }

    #[test]
    fn unique_models_deduplicates_by_identity() {
        let a = boot_chain_with_kernel("kernel", "1");
        let b = boot_chain_with_kernel("other-kernel", "7");
        let mut c = boot_chain();
        c.model = "other-model".to_string();
        let models = unique_models(&[a, b, c]);
        assert_eq!(models.len(), 2);
    }
}
