//! Typed errors for the codec, relay pool, reverse connections and the
//! reachability orchestrator.
//!
//! Collaborator traits in [`crate::protocols`] return `anyhow::Result`; the
//! components convert those into the enums below, keeping the rendered
//! message of the underlying error.

use std::fmt;

use thiserror::Error;

use crate::crypto::SignatureError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("size class {class:?} cannot carry a payload of {len} bytes")]
    SizeClassMismatch { class: crate::record::SizeClass, len: usize },

    #[error("payload of {0} bytes exceeds the 4-byte length field")]
    PayloadTooLarge(usize),

    #[error("negative payload length {0} in header")]
    NegativeLength(i32),

    #[error("based-on set holds {0} entries, at most 256 fit the count byte")]
    TooManyBasedOn(usize),

    #[error("you need to sign the data object first")]
    MissingSignature,

    #[error("record is not signed")]
    NotSigned,

    #[error(transparent)]
    Crypto(#[from] SignatureError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("relay quorum not met: {established} established, {failures} failed")]
    QuorumNotMet { established: usize, failures: usize },

    #[error("no relay candidates available")]
    NoCandidates,

    #[error("relay pool is shut down")]
    ShutDown,

    #[error("invalid relay configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RconError {
    #[error("no channel could be established: {0}")]
    NoChannel(String),

    #[error("failed to send rcon setup: {0}")]
    SendFailed(String),

    #[error("no reverse connection could be established within {0}s")]
    Timeout(u64),

    #[error("relay rejected the rcon setup: {0}")]
    Rejected(String),

    #[error("rcon session cancelled")]
    Cancelled,
}

/// Stage of the reachability pipeline, reported with terminal failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Discover,
    PortForwarding,
    Verify,
    Bootstrap,
    RelaySetup,
    Maintenance,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Discover => "discover",
            Stage::PortForwarding => "port-forwarding",
            Stage::Verify => "verify",
            Stage::Bootstrap => "bootstrap",
            Stage::RelaySetup => "relay-setup",
            Stage::Maintenance => "maintenance",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NatError {
    #[error("reachability exhausted at {stage}: {reason}")]
    Exhausted { stage: Stage, reason: String },

    #[error("reachability orchestrator is shut down")]
    ShutDown,
}

impl NatError {
    pub fn exhausted(stage: Stage, reason: impl fmt::Display) -> Self {
        NatError::Exhausted {
            stage,
            reason: reason.to_string(),
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            NatError::Exhausted { stage, .. } => Some(*stage),
            NatError::ShutDown => None,
        }
    }
}
