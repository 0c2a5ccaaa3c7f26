//! Durable engine state.
//!
//! One JSON file under the FDE directory records, per keyslot role, the
//! last committed sealing parameters, the identity of the primary key in
//! use and its policy revocation counter, plus digests of every known
//! primary key and any pending external operations. The file is rewritten
//! atomically on every mutation.

use crate::dirs;
use crate::model::SealingModel;
use crate::op::ExternalOperation;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("no state for keyslot role {0}")]
    UnknownRole(Role),
    #[error("cannot parse keyslot role {0:?}")]
    InvalidRole(String),
    #[error("no primary key with identity {0}")]
    UnknownPrimaryKey(u32),
}

pub type Result<T, E = StateError> = core::result::Result<T, E>;

/// Keyslot role, the first half of the sealing-parameter catalog key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "run")]
    Run,
    #[serde(rename = "run+recover")]
    RunRecover,
    #[serde(rename = "recover")]
    Recover,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Run => "run",
            Role::RunRecover => "run+recover",
            Role::Recover => "recover",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "run" => Ok(Role::Run),
            "run+recover" => Ok(Role::RunRecover),
            "recover" => Ok(Role::Recover),
            other => Err(StateError::InvalidRole(other.to_string())),
        }
    }
}

/// Container-role label used when parameters apply to every container.
pub const ALL_CONTAINERS: &str = "all";

/// Catalog key for per-pass sealing parameters.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ParamsKey {
    pub role: Role,
    pub container_role: String,
}

impl ParamsKey {
    pub fn new(role: Role, container_role: &str) -> Self {
        ParamsKey {
            role,
            container_role: container_role.to_string(),
        }
    }
}

mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let s: Option<String> = Option::deserialize(d)?;
        s.map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Committed sealing bookkeeping for one (role, container role) pair.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealingParameters {
    #[serde(rename = "boot-modes")]
    pub boot_modes: Vec<String>,
    pub models: Vec<SealingModel>,
    /// Serialized PCR profile, absent for vendor-hook devices and for
    /// roles whose policy was not recomputed.
    #[serde(
        rename = "tpm-pcr-profile",
        default,
        with = "hex_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub tpm_pcr_profile: Option<Vec<u8>>,
}

/// Salted digest of a primary key, enough to verify a recovered key
/// without storing the key itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDigest {
    pub alg: String,
    #[serde(with = "hex_bytes")]
    pub salt: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub digest: Vec<u8>,
}

impl KeyDigest {
    pub fn of(key: &[u8], salt: Vec<u8>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(&salt);
        hasher.update(key);
        KeyDigest {
            alg: "sha256".to_string(),
            salt,
            digest: hasher.finalize().to_vec(),
        }
    }

    pub fn matches(&self, key: &[u8]) -> bool {
        if self.alg != "sha256" {
            return false;
        }
        let mut hasher = Sha256::new();
        hasher.update(&self.salt);
        hasher.update(key);
        hasher.finalize().as_slice() == self.digest
    }
}

/// Per-role durable bookkeeping.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoleState {
    #[serde(rename = "primary-key-id")]
    pub primary_key_id: u32,
    #[serde(rename = "tpm2-pcr-policy-revocation-counter", default)]
    pub pcr_policy_revocation_counter: u64,
    /// Parameters keyed by container role.
    #[serde(default)]
    pub parameters: HashMap<String, SealingParameters>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FdeState {
    #[serde(rename = "primary-keys", default)]
    pub primary_keys: HashMap<u32, KeyDigest>,
    #[serde(rename = "keyslot-roles", default)]
    pub roles: HashMap<Role, RoleState>,
    #[serde(rename = "pending-external-operations", default)]
    pub pending_external_operations: Vec<ExternalOperation>,
}

impl FdeState {
    /// Records committed parameters for one catalog entry, creating the
    /// role record on first use.
    pub fn update_parameters(&mut self, key: &ParamsKey, params: SealingParameters) {
        let role = self.roles.entry(key.role).or_default();
        role.parameters.insert(key.container_role.clone(), params);
    }

    pub fn parameters(&self, key: &ParamsKey) -> Option<&SealingParameters> {
        self.roles
            .get(&key.role)
            .and_then(|r| r.parameters.get(&key.container_role))
    }

    /// Identity and revocation counter recorded for a role.
    pub fn role_info(&self, role: Role) -> Result<(u32, u64)> {
        let state = self.roles.get(&role).ok_or(StateError::UnknownRole(role))?;
        Ok((state.primary_key_id, state.pcr_policy_revocation_counter))
    }

    /// Checks a recovered primary key against the recorded digest for its
    /// identity. An unknown identity is an error, a digest mismatch is
    /// not, mismatches are diagnosed by the caller.
    pub fn verify_primary_key(&self, primary_key_id: u32, key: &[u8]) -> Result<bool> {
        let digest = self
            .primary_keys
            .get(&primary_key_id)
            .ok_or(StateError::UnknownPrimaryKey(primary_key_id))?;
        Ok(digest.matches(key))
    }

    pub fn operation(&self, change_id: &str) -> Option<&ExternalOperation> {
        self.pending_external_operations
            .iter()
            .find(|op| op.change_id == change_id)
    }

    pub fn operation_mut(&mut self, change_id: &str) -> Option<&mut ExternalOperation> {
        self.pending_external_operations
            .iter_mut()
            .find(|op| op.change_id == change_id)
    }

    pub fn remove_operation(&mut self, change_id: &str) {
        self.pending_external_operations
            .retain(|op| op.change_id != change_id);
    }
}

/// Loads state from the file under `rootdir`, or a default state when the
/// file does not exist yet.
pub fn load(rootdir: &Path) -> Result<FdeState> {
    let path = dirs::fde_state_file_under(rootdir);
    match fs::read(&path) {
        Ok(data) => Ok(serde_json::from_slice(&data)?),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(FdeState::default()),
        Err(err) => Err(err.into()),
    }
}

pub fn save(rootdir: &Path, state: &FdeState) -> Result<()> {
    let path = dirs::fde_state_file_under(rootdir);
    let data = serde_json::to_vec(state)?;
    dirs::atomic_write(&path, &data, 0o600)?;
    Ok(())
}
