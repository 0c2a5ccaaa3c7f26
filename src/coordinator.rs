//! External-operation coordinator for EFI Secure Boot database updates.
//!
//! An external updater asks for a prepare reseal carrying the proposed
//! database payload, applies the firmware update while the device runs
//! under the proposed policy, and then confirms with cleanup or backs out
//! with abort. The coordinator tracks each update as a persisted
//! [`ExternalOperation`] plus one change in the in-process engine; the
//! change's do handler performs the prepare reseal, then parks on a
//! per-operation one-shot verdict channel until the caller's decision
//! arrives. Operations found unresolved at startup are aborted and the
//! keys are resealed back to the actual current state.

use crate::bootchain::BootChains;
use crate::changes::{ChangeEngine, ChangeHandlers, ChangeInfo, Handler};
use crate::manager::{FdeManager, ManagerError};
use crate::op::{ExternalOperation, OpError, OperationKind, OperationStatus};
use crate::reseal::{ResealEngine, ResealError, ResealOptions};
use crate::secboot::{self, SealingBackend, SealingMethod, SecbootError};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use thiserror::Error;

const UPDATE_KIND: OperationKind = OperationKind::EfiSecurebootDbUpdate;

#[derive(Error, Debug)]
pub enum CoordError {
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Secboot(#[from] SecbootError),
    #[error(transparent)]
    Reseal(#[from] ResealError),
    #[error(transparent)]
    Op(#[from] OpError),
    #[error("conflicting {0} operation in progress")]
    Conflict(OperationKind),
    #[error("no {0} operation in progress")]
    NotInProgress(OperationKind),
    #[error("'startup' action invoked while an operation is in progress")]
    StartupDuringUpdate,
    #[error("prepare change failed: {0}")]
    PrepareFailed(String),
    #[error("cannot enumerate boot chains: {0}")]
    BootChains(String),
    #[error("{0}")]
    Internal(String),
}

pub type Result<T, E = CoordError> = core::result::Result<T, E>;

/// Enumerates the currently acceptable boot chains, resolved by the
/// bootloader collaborator.
pub trait BootChainsProvider: Send + Sync {
    fn current_boot_chains(&self) -> Result<BootChains>;
}

mod hex_payload {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Operation context persisted alongside the record, enough to redo or
/// abort the update after a restart.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct UpdateContext {
    #[serde(with = "hex_payload")]
    payload: Vec<u8>,
    #[serde(rename = "sealing-method")]
    method: SealingMethod,
}

enum Verdict {
    Complete,
    Abort(String),
}

enum PrepareOutcome {
    Prepared,
    ChangeFailed(Option<String>),
}

struct Inner {
    manager: Arc<FdeManager>,
    backend: Arc<dyn SealingBackend + Send + Sync>,
    chains: Arc<dyn BootChainsProvider>,
    engine: ChangeEngine,
    verdicts: Mutex<HashMap<String, Sender<Verdict>>>,
}

pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        manager: Arc<FdeManager>,
        backend: Arc<dyn SealingBackend + Send + Sync>,
        chains: Arc<dyn BootChainsProvider>,
    ) -> Self {
        Coordinator {
            inner: Arc::new(Inner {
                manager,
                backend,
                chains,
                engine: ChangeEngine::new(),
                verdicts: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Accepts a database update request: runs the prepare reseal under
    /// the proposed payload and blocks until the device operates under
    /// the proposed policy, or until the preparation failed. Returns the
    /// change identifier tracking the update, or `None` when the device
    /// carries no sealed keys and there is nothing to coordinate.
    pub fn prepare(&self, payload: &[u8]) -> Result<Option<String>> {
        let Some(method) = secboot::sealed_keys_method(self.inner.manager.rootdir())? else {
            info!("no sealed keys on this device, nothing to prepare");
            return Ok(None);
        };
        if self
            .inner
            .manager
            .find_pending_operation(UPDATE_KIND)
            .is_some()
        {
            return Err(CoordError::Conflict(UPDATE_KIND));
        }

        let context = UpdateContext {
            payload: payload.to_vec(),
            method,
        };
        let context_json =
            serde_json::to_value(&context).map_err(|e| CoordError::Internal(e.to_string()))?;

        // the change is reserved first so the operation record and the
        // verdict channel exist before the worker can pick it up
        let change_id = self.inner.engine.reserve(&UPDATE_KIND.to_string());
        self.inner.manager.add_operation(ExternalOperation::new(
            UPDATE_KIND,
            &change_id,
            Some(context_json),
        ))?;
        let (verdict_tx, verdict_rx) = mpsc::channel();
        self.inner
            .verdicts
            .lock()
            .expect("verdict map poisoned")
            .insert(change_id.clone(), verdict_tx);

        let (signal_tx, signal_rx) = mpsc::channel();
        let run = prepare_handler(
            Arc::downgrade(&self.inner),
            context,
            verdict_rx,
            signal_tx.clone(),
        );
        let undo = undo_handler(Arc::downgrade(&self.inner));
        let cleanup = cleanup_handler(Arc::downgrade(&self.inner));
        self.inner.engine.queue(
            &change_id,
            ChangeHandlers {
                run,
                undo: Some(undo),
                cleanup: Some(cleanup),
            },
        );

        // second waker covering the case the prepare step itself fails:
        // the change then becomes ready without ever signalling
        let watcher_inner = Arc::downgrade(&self.inner);
        let watcher_id = change_id.clone();
        thread::spawn(move || {
            if let Some(inner) = watcher_inner.upgrade() {
                if let Some(change) = inner.engine.wait_ready(&watcher_id) {
                    let _ = signal_tx.send(PrepareOutcome::ChangeFailed(change.err));
                }
            }
        });

        match signal_rx.recv() {
            Ok(PrepareOutcome::Prepared) => Ok(Some(change_id)),
            Ok(PrepareOutcome::ChangeFailed(err)) => Err(CoordError::PrepareFailed(
                err.unwrap_or_else(|| "prepare task failed early".to_string()),
            )),
            Err(_) => Err(CoordError::PrepareFailed(
                "prepare task failed early: change abandoned".to_string(),
            )),
        }
    }

    /// The external updater confirmed the database write is committed.
    /// The reseal under the new content already happened during prepare,
    /// so the waiting change just finishes.
    pub fn cleanup(&self) -> Result<()> {
        let op = self
            .inner
            .manager
            .find_pending_operation(UPDATE_KIND)
            .ok_or(CoordError::NotInProgress(UPDATE_KIND))?;
        if op.status != OperationStatus::Doing {
            return Err(CoordError::Conflict(UPDATE_KIND));
        }
        self.inner
            .manager
            .update_operation(&op.change_id, |op| {
                op.set_status(OperationStatus::Completing)
            })??;
        self.send_verdict(&op.change_id, Verdict::Complete)
    }

    /// The external updater reported failure; the keys are resealed back
    /// to the pre-update state.
    pub fn abort(&self) -> Result<()> {
        let op = self
            .inner
            .manager
            .find_pending_operation(UPDATE_KIND)
            .ok_or(CoordError::NotInProgress(UPDATE_KIND))?;
        if op.status != OperationStatus::Doing {
            return Err(CoordError::Conflict(UPDATE_KIND));
        }
        self.inner
            .manager
            .update_operation(&op.change_id, |op| op.set_status(OperationStatus::Aborting))??;
        self.send_verdict(&op.change_id, Verdict::Abort("aborted by external request".to_string()))
    }

    /// Resolves operations left over from before a restart. A pending
    /// operation in `Doing` means the proposed database change was never
    /// confirmed, so the keys are resealed back to the actual current
    /// state and the operation fails.
    pub fn startup(&self) -> Result<()> {
        for op in self.inner.manager.inflight_operations() {
            if op.kind != UPDATE_KIND {
                continue;
            }
            let owned_in_process = self
                .inner
                .verdicts
                .lock()
                .expect("verdict map poisoned")
                .contains_key(&op.change_id);
            if owned_in_process {
                return Err(CoordError::StartupDuringUpdate);
            }
            match op.status {
                OperationStatus::Doing | OperationStatus::Aborting => {
                    info!(
                        "aborting unresolved secure boot DB update (change {})",
                        op.change_id
                    );
                    if op.status == OperationStatus::Doing {
                        self.inner.manager.update_operation(&op.change_id, |op| {
                            op.set_status(OperationStatus::Aborting)
                        })??;
                    }
                    let method = context_method(&op)
                        .or(secboot::sealed_keys_method(self.inner.manager.rootdir())?)
                        .ok_or(SecbootError::NoSealedKeys)?;
                    self.inner.reseal_back(method)?;
                    self.inner.manager.update_operation(&op.change_id, |op| {
                        op.set_failed(
                            "aborted explicitly or due to timeout waiting for subsequent \
                             request from the caller",
                        )
                    })??;
                    self.inner.manager.remove_operation(&op.change_id)?;
                }
                _ => return Err(CoordError::StartupDuringUpdate),
            }
        }
        Ok(())
    }

    /// Blocks until the change tracking an update is ready.
    pub fn wait_change(&self, change_id: &str) -> Option<ChangeInfo> {
        self.inner.engine.wait_ready(change_id)
    }

    fn send_verdict(&self, change_id: &str, verdict: Verdict) -> Result<()> {
        let tx = self
            .inner
            .verdicts
            .lock()
            .expect("verdict map poisoned")
            .get(change_id)
            .cloned()
            .ok_or(CoordError::NotInProgress(UPDATE_KIND))?;
        tx.send(verdict)
            .map_err(|_| CoordError::NotInProgress(UPDATE_KIND))
    }
}

impl Inner {
    fn reseal_back(&self, method: SealingMethod) -> Result<()> {
        let inputs = self.chains.current_boot_chains()?;
        let engine = ResealEngine::new(self.backend.as_ref(), self.manager.as_ref(), self.manager.rootdir());
        engine.reseal_key_for_boot_chains(
            method,
            &inputs,
            &ResealOptions {
                expect_reseal: true,
                force: true,
                revoke_old_keys: true,
                ..ResealOptions::default()
            },
        )?;
        Ok(())
    }

    /// Shared by the undo handler and the abort verdict path: if the
    /// operation is still live, reseal back and fail it.
    fn abort_operation(&self, change_id: &str, reason: &str) -> Result<()> {
        let Some(op) = self.manager.operation(change_id) else {
            return Ok(());
        };
        match op.status {
            OperationStatus::Doing | OperationStatus::Aborting => {
                if op.status == OperationStatus::Doing {
                    self.manager.update_operation(change_id, |op| {
                        op.set_status(OperationStatus::Aborting)
                    })??;
                }
                let method = context_method(&op)
                    .or(secboot::sealed_keys_method(self.manager.rootdir())?)
                    .ok_or(SecbootError::NoSealedKeys)?;
                if let Err(err) = self.reseal_back(method) {
                    // surfacing only this error would leave the keys
                    // sealed to a policy that no longer matches reality,
                    // so the reseal back stays best effort
                    warn!("cannot reseal keys back after abort: {err}");
                }
                self.manager
                    .update_operation(change_id, |op| op.set_failed(reason))??;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn context_method(op: &ExternalOperation) -> Option<SealingMethod> {
    let context = op.context.as_ref()?;
    serde_json::from_value::<UpdateContext>(context.clone())
        .ok()
        .map(|c| c.method)
}

fn prepare_handler(
    inner: std::sync::Weak<Inner>,
    context: UpdateContext,
    verdict_rx: Receiver<Verdict>,
    signal_tx: Sender<PrepareOutcome>,
) -> Handler {
    let verdict_rx = Mutex::new(Some(verdict_rx));
    Arc::new(move |change_id| {
        let inner = inner
            .upgrade()
            .ok_or_else(|| "coordinator is gone".to_string())?;
        let inputs = inner
            .chains
            .current_boot_chains()
            .map_err(|e| e.to_string())?;
        let engine = ResealEngine::new(
            inner.backend.as_ref(),
            inner.manager.as_ref(),
            inner.manager.rootdir(),
        );
        if let Err(err) = engine.reseal_keys_for_signatures_db_update(
            context.method,
            &inputs,
            &context.payload,
        ) {
            let reason =
                format!("cannot perform initial reseal of keys for the new DB content: {err}");
            if let Err(err) = inner
                .manager
                .update_operation(change_id, |op| op.set_failed(&reason))
            {
                warn!("cannot mark operation of change {change_id} failed: {err}");
            }
            return Err(reason);
        }
        inner
            .manager
            .update_operation(change_id, |op| op.set_status(OperationStatus::Doing))
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())?;
        let _ = signal_tx.send(PrepareOutcome::Prepared);

        // parked until the external caller's verdict; a dropped channel
        // counts as an abort
        let rx = verdict_rx
            .lock()
            .expect("verdict receiver poisoned")
            .take()
            .ok_or_else(|| "verdict already consumed".to_string())?;
        match rx.recv().unwrap_or_else(|_| {
            Verdict::Abort(
                "aborted explicitly or due to timeout waiting for subsequent request \
                 from the caller"
                    .to_string(),
            )
        }) {
            Verdict::Complete => {
                inner
                    .manager
                    .update_operation(change_id, |op| op.set_status(OperationStatus::Done))
                    .map_err(|e| e.to_string())?
                    .map_err(|e| e.to_string())?;
                Ok(())
            }
            Verdict::Abort(reason) => {
                inner
                    .abort_operation(change_id, &reason)
                    .map_err(|e| e.to_string())?;
                Err(reason)
            }
        }
    })
}

fn undo_handler(inner: std::sync::Weak<Inner>) -> Handler {
    Arc::new(move |change_id| {
        let Some(inner) = inner.upgrade() else {
            return Ok(());
        };
        // already-failed operations were resealed back on the abort path
        inner
            .abort_operation(change_id, "aborted by external request")
            .map_err(|e| e.to_string())
    })
}

fn cleanup_handler(inner: std::sync::Weak<Inner>) -> Handler {
    Arc::new(move |change_id| {
        let Some(inner) = inner.upgrade() else {
            return Ok(());
        };
        inner
            .verdicts
            .lock()
            .expect("verdict map poisoned")
            .remove(change_id);
        inner
            .manager
            .remove_operation(change_id)
            .map_err(|e| e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootchain::read_boot_chains;
    use crate::dirs;
    use crate::testutil::{
        boot_inputs, seed_asset_cache, two_containers, FixedBootChains, FixedContainers,
        MockBackend,
    };
    use eyre::Result;
    use std::path::Path;
    use std::time::{Duration, Instant};

    fn coordinator_for(dir: &Path, backend: Arc<MockBackend>) -> Result<(Coordinator, Arc<FdeManager>)> {
        seed_asset_cache(dir)?;
        secboot::stamp_sealed_keys(dir, SealingMethod::Tpm)?;
        let manager = Arc::new(FdeManager::open(
            dir,
            Box::new(FixedContainers::new(two_containers(dir))),
        )?)
        ;
        manager.record_primary_key(
            0,
            crate::state::KeyDigest::of(b"the-primary-key", vec![7]),
        )?;
        let coordinator = Coordinator::new(
            manager.clone(),
            backend,
            Arc::new(FixedBootChains(boot_inputs())),
        );
        Ok((coordinator, manager))
    }

    fn wait_until(mut ready: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !ready() {
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn prepare_then_cleanup_completes_the_update() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = Arc::new(MockBackend::default());
        let (coordinator, manager) = coordinator_for(dir.path(), backend.clone())?;

        let change_id = coordinator
            .prepare(b"db-payload")
            .map_err(|e| eyre::eyre!("{e}"))?
            .expect("device is sealed");
        let op = manager.operation(&change_id).expect("operation exists");
        assert_eq!(op.status, OperationStatus::Doing);
        {
            let calls = backend.recorded();
            assert_eq!(calls.reseals.len(), 3);
            assert!(calls
                .profile_db_updates
                .iter()
                .all(|p| p.as_deref() == Some(b"db-payload".as_slice())));
        }

        coordinator.cleanup().map_err(|e| eyre::eyre!("{e}"))?;
        let change = coordinator.wait_change(&change_id).expect("change exists");
        assert_eq!(change.status, crate::changes::ChangeStatus::Done);
        wait_until(|| manager.operation(&change_id).is_none());
        Ok(())
    }

    #[test]
    fn prepare_on_an_unsealed_device_does_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        seed_asset_cache(dir.path())?;
        let manager = Arc::new(FdeManager::open(
            dir.path(),
            Box::new(FixedContainers::new(two_containers(dir.path()))),
        )?);
        let backend = Arc::new(MockBackend::default());
        let coordinator = Coordinator::new(
            manager.clone(),
            backend.clone(),
            Arc::new(FixedBootChains(boot_inputs())),
        );

        let change_id = coordinator.prepare(b"payload").map_err(|e| eyre::eyre!("{e}"))?;
        assert_eq!(change_id, None);
        assert!(manager.inflight_operations().is_empty());
        assert!(backend.recorded().reseals.is_empty());
        Ok(())
    }

    #[test]
    fn concurrent_prepare_is_a_conflict() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = Arc::new(MockBackend::default());
        let (coordinator, manager) = coordinator_for(dir.path(), backend)?;

        let mut op = ExternalOperation::new(UPDATE_KIND, "7", None);
        op.set_status(OperationStatus::Doing).unwrap();
        manager.add_operation(op)?;

        let err = coordinator.prepare(b"payload").unwrap_err();
        assert!(matches!(err, CoordError::Conflict(_)));
        // the pending operation was not touched
        assert_eq!(
            manager.operation("7").map(|op| op.status),
            Some(OperationStatus::Doing)
        );
        Ok(())
    }

    #[test]
    fn abort_reseals_back_and_fails_the_change() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = Arc::new(MockBackend::default());
        let (coordinator, manager) = coordinator_for(dir.path(), backend.clone())?;

        let change_id = coordinator
            .prepare(b"db-payload")
            .map_err(|e| eyre::eyre!("{e}"))?
            .expect("device is sealed");
        coordinator.abort().map_err(|e| eyre::eyre!("{e}"))?;

        let change = coordinator.wait_change(&change_id).expect("change exists");
        assert_eq!(change.status, crate::changes::ChangeStatus::Error);
        assert_eq!(change.err.as_deref(), Some("aborted by external request"));

        let calls = backend.recorded();
        // three slots during prepare, three on the way back
        assert_eq!(calls.reseals.len(), 6);
        // the reseal back revokes the tentative policy generation
        assert_eq!(calls.revokes.len(), 1);
        assert!(calls.profile_db_updates[3..].iter().all(|p| p.is_none()));
        drop(calls);
        wait_until(|| manager.operation(&change_id).is_none());
        Ok(())
    }

    #[test]
    fn failing_prepare_reseal_fails_the_request() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = Arc::new(MockBackend::default());
        backend.fail_reseal_of("/dev/vda4", "default");
        let (coordinator, manager) = coordinator_for(dir.path(), backend)?;

        let err = coordinator.prepare(b"payload").unwrap_err();
        match err {
            CoordError::PrepareFailed(reason) => {
                assert!(
                    reason.contains("cannot perform initial reseal of keys for the new DB content"),
                    "unexpected reason: {reason}"
                );
            }
            other => panic!("unexpected error: {other}"),
        }
        wait_until(|| manager.inflight_operations().is_empty());
        Ok(())
    }

    #[test]
    fn startup_aborts_operation_left_over_from_before_restart() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = Arc::new(MockBackend::default());
        let (coordinator, manager) = coordinator_for(dir.path(), backend.clone())?;

        // establish snapshots so the counters have a pre-update value
        ResealEngine::new(backend.as_ref(), manager.as_ref(), dir.path())
            .reseal_key_for_boot_chains(
                SealingMethod::Tpm,
                &boot_inputs(),
                &ResealOptions::default(),
            )?;
        let (_, count_before) = read_boot_chains(&dirs::boot_chains_file_under(dir.path()))?;

        // a persisted operation in Doing with no process memory of it
        let context = serde_json::to_value(UpdateContext {
            payload: b"db".to_vec(),
            method: SealingMethod::Tpm,
        })
        .unwrap();
        let mut op = ExternalOperation::new(UPDATE_KIND, "99", Some(context));
        op.set_status(OperationStatus::Doing).unwrap();
        manager.add_operation(op)?;

        let reseals_before = backend.recorded().reseals.len();
        coordinator.startup().map_err(|e| eyre::eyre!("{e}"))?;

        assert!(manager.operation("99").is_none());
        let calls = backend.recorded();
        assert_eq!(calls.reseals.len(), reseals_before + 3);
        assert_eq!(calls.revokes.len(), 1);
        drop(calls);
        let (_, count_after) = read_boot_chains(&dirs::boot_chains_file_under(dir.path()))?;
        assert_eq!(count_after, count_before);
        Ok(())
    }

    #[test]
    fn startup_refuses_an_operation_still_preparing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = Arc::new(MockBackend::default());
        let (coordinator, manager) = coordinator_for(dir.path(), backend)?;

        manager.add_operation(ExternalOperation::new(UPDATE_KIND, "5", None))?;
        let err = coordinator.startup().unwrap_err();
        assert!(matches!(err, CoordError::StartupDuringUpdate));
        Ok(())
    }

    #[test]
    fn cleanup_without_pending_operation_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = Arc::new(MockBackend::default());
        let (coordinator, _) = coordinator_for(dir.path(), backend)?;
        assert!(matches!(
            coordinator.cleanup().unwrap_err(),
            CoordError::NotInProgress(_)
        ));
        assert!(matches!(
            coordinator.abort().unwrap_err(),
            CoordError::NotInProgress(_)
        ));
        Ok(())
    }
}
