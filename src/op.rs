//! Persisted external-operation records.
//!
//! An external operation tracks a long-running action driven from outside
//! the engine, currently only EFI Secure Boot database updates. The record
//! survives restarts inside the durable state file; its status moves
//! through a closed two-phase machine and every transition is validated.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OpError {
    #[error("cannot transition operation from {from} to {to}")]
    InvalidTransition {
        from: OperationStatus,
        to: OperationStatus,
    },
}

pub type Result<T, E = OpError> = core::result::Result<T, E>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    #[serde(rename = "efi-secureboot-db-update")]
    EfiSecurebootDbUpdate,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::EfiSecurebootDbUpdate => f.write_str("efi-secureboot-db-update"),
        }
    }
}

/// Two-phase status machine:
///
/// ```text
/// Preparing -> Doing -> Completing -> Done
///                    \-> Aborting  -> Failed
/// ```
///
/// Failed is additionally reachable from any non-final status, covering
/// early task failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Preparing,
    Doing,
    Completing,
    Aborting,
    Done,
    Failed,
}

impl OperationStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, OperationStatus::Done | OperationStatus::Failed)
    }

    pub fn can_transition_to(&self, to: OperationStatus) -> bool {
        use OperationStatus::*;
        match (self, to) {
            (Preparing, Doing) => true,
            (Doing, Completing) | (Doing, Aborting) => true,
            (Completing, Done) => true,
            (Aborting, Failed) => true,
            (from, Failed) => !from.is_final(),
            _ => false,
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationStatus::Preparing => "preparing",
            OperationStatus::Doing => "doing",
            OperationStatus::Completing => "completing",
            OperationStatus::Aborting => "aborting",
            OperationStatus::Done => "done",
            OperationStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExternalOperation {
    pub kind: OperationKind,
    #[serde(rename = "change-id")]
    pub change_id: String,
    /// Operation specific payload, opaque to the state layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl ExternalOperation {
    pub fn new(kind: OperationKind, change_id: &str, context: Option<serde_json::Value>) -> Self {
        ExternalOperation {
            kind,
            change_id: change_id.to_string(),
            context,
            status: OperationStatus::Preparing,
            err: None,
        }
    }

    pub fn set_status(&mut self, to: OperationStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(OpError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Marks the operation failed with a reason. Valid from any non-final
    /// status.
    pub fn set_failed(&mut self, reason: &str) -> Result<()> {
        self.set_status(OperationStatus::Failed)?;
        self.err = Some(reason.to_string());
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.status.is_final()
    }
}
