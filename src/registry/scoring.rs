//! Peer Scoring System
//!
//! Liveness score per peer: incremented by one for every check the peer
//! passes, halved (rounding down) for every check it fails. A peer that
//! keeps failing decays towards zero quickly while a long-lived peer needs
//! several consecutive failures before it drops out of the top ranks.

use chrono::{DateTime, Utc};

use crate::types::{ClientInfo, PeerRecord};

/// Result of one liveness check against a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Peer answered
    Alive { client_info: Option<ClientInfo> },

    /// Peer answered but refused the connection because it is full
    TooManyPeers,

    /// Peer did not answer in time or refused the connection
    Unreachable,
}

impl CheckOutcome {
    pub fn alive(client_info: Option<ClientInfo>) -> Self {
        CheckOutcome::Alive { client_info }
    }

    /// Whether the peer counts as reachable
    pub fn is_success(&self) -> bool {
        !matches!(self, CheckOutcome::Unreachable)
    }
}

/// Score after a passed check
pub fn score_success(score: u32) -> u32 {
    score.saturating_add(1)
}

/// Score after a failed check
pub fn score_failure(score: u32) -> u32 {
    score / 2
}

/// Update a peer record with the outcome of a check made at `now`
pub fn apply_check(peer: &mut PeerRecord, outcome: CheckOutcome, now: DateTime<Utc>) {
    peer.last_check = Some(now);

    match outcome {
        CheckOutcome::Alive { client_info } => {
            peer.score = score_success(peer.score);
            mark_response(peer, now);
            peer.too_many_peers = false;
            if client_info.is_some() {
                peer.client_info = client_info;
            }
        }
        CheckOutcome::TooManyPeers => {
            peer.score = score_success(peer.score);
            mark_response(peer, now);
            peer.too_many_peers = true;
        }
        CheckOutcome::Unreachable => {
            peer.score = score_failure(peer.score);
        }
    }
}

fn mark_response(peer: &mut PeerRecord, now: DateTime<Utc>) {
    if peer.first_response.is_none() {
        peer.first_response = Some(now);
    }
    peer.last_response = Some(now);
}
