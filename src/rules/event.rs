use std::fmt;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

use crate::utils::bitmask_ops;

/// Pending-event register of a rule set, one bit per event.
#[derive(Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RuleEvents(u64);

bitmask_ops!(RuleEvents, u64);

impl RuleEvents {
    /// Every event bit; completing a rule "for all events".
    pub const ALL: Self = Self(u64::MAX);

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Names of the `E` events set in this register, in bit order.
    #[must_use]
    pub fn names<E: RuleEventId>(self) -> Vec<String> {
        E::iter()
            .filter(|event| self.contains(event.mask()))
            .map(|event| event.to_string())
            .collect()
    }
}

impl fmt::Display for RuleEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl fmt::Debug for RuleEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RuleEvents({self})")
    }
}

/// A typed event that owns exactly one bit of a [`RuleEvents`] register.
pub trait RuleEventId: Copy + IntoEnumIterator + fmt::Display {
    fn bit_index(self) -> u8;

    fn mask(self) -> RuleEvents {
        RuleEvents(1 << self.bit_index())
    }
}

/// Builds a register from a list of typed events.
pub fn events_of<E: RuleEventId>(events: &[E]) -> RuleEvents {
    events
        .iter()
        .fold(RuleEvents::EMPTY, |mask, event| mask | event.mask())
}

/// Events consumed by the Primary and Secondary connection rule sets.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Hash, EnumIter, Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ConnRuleEvent {
    Startup,
    PeerSync,
    UserConnect,
    InCase,
    OutCase,
    InEar,
    OutEar,
    PeerInCase,
    PeerOutCase,
    PeerInEar,
    PeerOutEar,
    PeerConnected,
    PeerDisconnected,
    PeerLinkLoss,
    PeerPairing,
    PeerUpdateLinkkeys,
    HandsetA2dpConnected,
    HandsetA2dpDisconnected,
    HandsetAvrcpConnected,
    HandsetAvrcpDisconnected,
    HandsetHfpConnected,
    HandsetHfpDisconnected,
    HandsetLinkLoss,
    PeerHandsetConnected,
    PeerHandsetDisconnected,
    PeerHandsetLinkLoss,
    PeerA2dpSupported,
    PeerAvrcpSupported,
    PeerHfpSupported,
    RxHandsetLinkkey,
    RoleSwitch,
    ScoActive,
    CheckDfu,
    DfuConnect,
    PageScanUpdate,
    BleConnectableChange,
    HandoverDisconnect,
    HandoverReconnect,
    HandoverReconnectAndPlay,
}

impl RuleEventId for ConnRuleEvent {
    fn bit_index(self) -> u8 {
        self as u8
    }
}

/// Events consumed by the DFU rule set.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Hash, EnumIter, Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum DfuRuleEvent {
    Startup,
    NoPeer,
    PeerPaired,
    InCase,
    OutCase,
    PeerInCase,
    PeerOutCase,
    RoleSwitch,
    RoleSelectedPrimary,
    RoleSelectedSecondary,
    ActingPrimary,
    PeerLinkloss,
    HandsetLinkloss,
    PeerConnectedBredr,
    PeerDisconnectedBredr,
    HandsetConnectedBredr,
    HandsetConnectedA2dp,
    HandsetConnectedAvrcp,
    HandsetConnectedHfp,
    HandsetDisconnectedBredr,
    HandsetDisconnectedA2dp,
    HandsetDisconnectedAvrcp,
    HandsetDisconnectedHfp,
    DfuRole,
    DfuRoleComplete,
    FailedPeerConnect,
    DfuAborted,
}

impl RuleEventId for DfuRuleEvent {
    fn bit_index(self) -> u8 {
        self as u8
    }
}
