//! Contract for the PLC that drives the reject actuator.
//!
//! The pipeline never speaks a fieldbus protocol itself; it hands
//! [`ActuationCommand`]s to a [`PlcLink`] and polls the link state.

use std::time::{Duration, Instant};

use line_ingest::RollerId;
use serde::Serialize;
use thiserror::Error;

use crate::pipeline::data::ActuationCommand;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkStatus {
    Up,
    Down,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("PLC unreachable: {0}")]
    Unreachable(String),
    #[error("PLC did not acknowledge within {0:?}")]
    Timeout(Duration),
    #[error("PLC rejected command: {0}")]
    Rejected(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlcAck {
    pub roller_id: RollerId,
    pub acknowledged_at: Instant,
}

/// Shared by the actuation scheduler and the supervisor, so calls take
/// `&self`.
pub trait PlcLink: Send + Sync {
    fn send_actuation(
        &self,
        command: &ActuationCommand,
        timeout: Duration,
    ) -> Result<PlcAck, LinkError>;

    fn read_link_status(&self, timeout: Duration) -> LinkStatus;
}
