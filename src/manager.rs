//! State holder and collaborator boundary for the engines.
//!
//! [`FdeStateManager`] is the narrow interface the reseal engine needs:
//! container topology, the per-role parameter catalog, primary key
//! verification, and a lock release around expensive pure computation.
//! [`FdeManager`] is the production implementation backed by the durable
//! state file; its methods are self-locking, so state is consistent after
//! every call without callers holding a guard.

use crate::op::{ExternalOperation, OperationKind};
use crate::state::{self, FdeState, KeyDigest, ParamsKey, Role, SealingParameters, StateError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Op(#[from] crate::op::OpError),
    #[error("cannot enumerate encrypted containers: {0}")]
    Containers(String),
    #[error("operation for change {0} not found")]
    UnknownOperation(String),
}

pub type Result<T, E = ManagerError> = core::result::Result<T, E>;

/// One encrypted disk partition, as enumerated by the device topology
/// collaborator.
#[derive(Clone, Debug)]
pub struct EncryptedContainer {
    pub container_role: String,
    pub device_path: String,
    /// Key files kept outside the container metadata, keyed by slot name.
    pub legacy_keys: HashMap<String, PathBuf>,
}

impl EncryptedContainer {
    pub fn new(container_role: &str, device_path: &str) -> Self {
        EncryptedContainer {
            container_role: container_role.to_string(),
            device_path: device_path.to_string(),
            legacy_keys: HashMap::new(),
        }
    }

    pub fn with_legacy_key(mut self, slot_name: &str, key_file: PathBuf) -> Self {
        self.legacy_keys.insert(slot_name.to_string(), key_file);
        self
    }
}

/// Enumerates the device's current encrypted containers.
pub trait ContainerProvider: Send + Sync {
    fn encrypted_containers(&self) -> Result<Vec<EncryptedContainer>>;
}

/// What the reseal engine requires from the state holder.
pub trait FdeStateManager: Send + Sync {
    fn get_encrypted_containers(&self) -> Result<Vec<EncryptedContainer>>;

    fn update_parameters(&self, key: &ParamsKey, params: SealingParameters) -> Result<()>;

    fn get_parameters(&self, key: &ParamsKey) -> Result<Option<SealingParameters>>;

    /// Recorded (primary key identity, policy revocation counter) pair.
    fn role_info(&self, role: Role) -> Result<(u32, u64)>;

    fn verify_primary_key(&self, primary_key_id: u32, key: &[u8]) -> Result<bool>;

    /// Releases the durable-state lock for the duration of an expensive
    /// pure computation; the returned closure relocks.
    fn unlock(&self) -> Box<dyn FnOnce() + Send + '_>;
}

/// Production state holder over the durable state file.
pub struct FdeManager {
    rootdir: PathBuf,
    state: Mutex<FdeState>,
    provider: Box<dyn ContainerProvider>,
}

impl FdeManager {
    pub fn open(rootdir: &Path, provider: Box<dyn ContainerProvider>) -> Result<Self> {
        let state = state::load(rootdir)?;
        Ok(FdeManager {
            rootdir: rootdir.to_path_buf(),
            state: Mutex::new(state),
            provider,
        })
    }

    pub fn rootdir(&self) -> &Path {
        &self.rootdir
    }

    fn with_state<T>(&self, f: impl FnOnce(&FdeState) -> T) -> T {
        let state = self.state.lock().expect("state lock poisoned");
        f(&state)
    }

    fn mutate_state<T>(&self, f: impl FnOnce(&mut FdeState) -> T) -> Result<T> {
        let mut state = self.state.lock().expect("state lock poisoned");
        let out = f(&mut state);
        state::save(&self.rootdir, &state)?;
        Ok(out)
    }

    /// Records the digest of a freshly generated primary key under the
    /// given identity.
    pub fn record_primary_key(&self, primary_key_id: u32, digest: KeyDigest) -> Result<()> {
        self.mutate_state(|s| {
            s.primary_keys.insert(primary_key_id, digest);
        })
    }

    /// Initializes or replaces the per-role bookkeeping after an initial
    /// seal or a factory reset.
    pub fn set_role_info(
        &self,
        role: Role,
        primary_key_id: u32,
        pcr_policy_revocation_counter: u64,
    ) -> Result<()> {
        self.mutate_state(|s| {
            let entry = s.roles.entry(role).or_default();
            entry.primary_key_id = primary_key_id;
            entry.pcr_policy_revocation_counter = pcr_policy_revocation_counter;
        })
    }

    pub fn add_operation(&self, op: ExternalOperation) -> Result<()> {
        self.mutate_state(|s| s.pending_external_operations.push(op))
    }

    pub fn find_pending_operation(&self, kind: OperationKind) -> Option<ExternalOperation> {
        self.with_state(|s| {
            s.pending_external_operations
                .iter()
                .find(|op| op.kind == kind && !op.status.is_final())
                .cloned()
        })
    }

    pub fn operation(&self, change_id: &str) -> Option<ExternalOperation> {
        self.with_state(|s| s.operation(change_id).cloned())
    }

    /// Applies a mutation to the operation owned by `change_id` and
    /// persists the result.
    pub fn update_operation<T>(
        &self,
        change_id: &str,
        f: impl FnOnce(&mut ExternalOperation) -> T,
    ) -> Result<T> {
        self.mutate_state(|s| {
            s.operation_mut(change_id)
                .map(f)
                .ok_or_else(|| ManagerError::UnknownOperation(change_id.to_string()))
        })?
    }

    pub fn remove_operation(&self, change_id: &str) -> Result<()> {
        self.mutate_state(|s| s.remove_operation(change_id))
    }

    /// Operations left over from before a restart that are not yet final.
    pub fn inflight_operations(&self) -> Vec<ExternalOperation> {
        self.with_state(|s| {
            s.pending_external_operations
                .iter()
                .filter(|op| !op.status.is_final())
                .cloned()
                .collect()
        })
    }
}

impl FdeStateManager for FdeManager {
    fn get_encrypted_containers(&self) -> Result<Vec<EncryptedContainer>> {
        self.provider.encrypted_containers()
    }

    fn update_parameters(&self, key: &ParamsKey, params: SealingParameters) -> Result<()> {
        self.mutate_state(|s| s.update_parameters(key, params))
    }

    fn get_parameters(&self, key: &ParamsKey) -> Result<Option<SealingParameters>> {
        Ok(self.with_state(|s| s.parameters(key).cloned()))
    }

    fn role_info(&self, role: Role) -> Result<(u32, u64)> {
        Ok(self.with_state(|s| s.role_info(role))?)
    }

    fn verify_primary_key(&self, primary_key_id: u32, key: &[u8]) -> Result<bool> {
        Ok(self.with_state(|s| s.verify_primary_key(primary_key_id, key))?)
    }

    fn unlock(&self) -> Box<dyn FnOnce() + Send + '_> {
        // methods are self-locking, there is no long-held guard to drop;
        // the relock closure exists to keep the call sites explicit
        Box::new(|| {})
    }
}
