use serde::Serialize;

use crate::bdaddr::BdAddr;
use crate::handset_service::{HandsetMessage, HandsetRequest};
use crate::peer_signalling::{PeerSigMessage, PeerSigRequest};
use crate::rules::{ConnRuleAction, DfuGoal, RuleMessage};
use crate::shadow_profile::ShadowIndication;

use super::TaskId;

/// Everything one component can hand to another through the composition root.
///
/// Requests carry the task that made them so confirmations can find their way
/// back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Message {
    PeerSigRequest(PeerSigRequest),
    PeerSig(PeerSigMessage),
    HandsetRequest(HandsetRequest),
    Handset(HandsetMessage),
    Shadow(ShadowIndication),
    ConnRule(RuleMessage<ConnRuleAction>),
    DfuRule(RuleMessage<DfuGoal>),
}

/// A recorded state machine transition.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct StateChange {
    pub component: TaskId,
    /// Set for per-device machines.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<BdAddr>,
    pub from: String,
    pub to: String,
}

impl StateChange {
    pub fn new(component: TaskId, from: impl ToString, to: impl ToString) -> Self {
        Self {
            component,
            device: None,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    #[must_use]
    pub fn for_device(mut self, device: BdAddr) -> Self {
        self.device = Some(device);
        self
    }
}
