//! Exchange protocol wire messages.
//!
//! Messages travel between cluster nodes through an `ExchangeTransport`. They
//! use `MsgPack` with named fields (`rmp_serde::to_vec_named()`), internally
//! tagged on `"type"`.

use serde::{Deserialize, Serialize};

use meridian_core::{ExchangeId, NodeId, PartitionSnapshot, TopologyVersion};

use super::affinity::AffinityAssignment;
use super::types::{MembersView, MembershipEvent};

// ---------------------------------------------------------------------------
// ExchangeMessage enum
// ---------------------------------------------------------------------------

/// Top-level exchange protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeMessage {
    /// Master → every member of the new view.
    ExchangeRequest(ExchangeRequestPayload),
    /// Member → master.
    ExchangeContribution(ExchangeContributionPayload),
    /// Master → every member of the new view.
    ExchangeComplete(ExchangeCompletePayload),
}

impl ExchangeMessage {
    /// Exchange this message belongs to.
    #[must_use]
    pub fn exchange_id(&self) -> ExchangeId {
        match self {
            Self::ExchangeRequest(p) => p.exchange_id,
            Self::ExchangeContribution(p) => p.exchange_id,
            Self::ExchangeComplete(p) => p.exchange_id,
        }
    }

    /// Short name for logs and metrics labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExchangeRequest(_) => "request",
            Self::ExchangeContribution(_) => "contribution",
            Self::ExchangeComplete(_) => "complete",
        }
    }

    /// Encodes to named `MsgPack`.
    ///
    /// # Errors
    ///
    /// Returns the encoder error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Decodes from `MsgPack`, validating every embedded `ExchangeId`.
    ///
    /// # Errors
    ///
    /// Returns the decoder error for malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRequestPayload {
    pub exchange_id: ExchangeId,
    /// Membership events folded into this exchange.
    pub changes: Vec<MembershipEvent>,
    /// Membership after `changes`; its members are the expected contributors.
    pub members: MembersView,
    /// Ready version the master builds on.
    pub previous_version: TopologyVersion,
    pub backup_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeContributionPayload {
    pub exchange_id: ExchangeId,
    pub node_id: NodeId,
    pub snapshot: PartitionSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeCompletePayload {
    pub exchange_id: ExchangeId,
    pub members: MembersView,
    pub assignment: AffinityAssignment,
    /// Contributors the master gave up on; each gets a follow-up exchange.
    pub presumed_failed: Vec<NodeId>,
}

/// An inbound exchange message tagged with the sender's node ID.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundExchangeMessage {
    pub sender: NodeId,
    pub message: ExchangeMessage,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
