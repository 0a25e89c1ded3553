use serde::Serialize;
use strum_macros::{Display, EnumIter};

const SUB_STATE_ACL: u16 = 0x40;
const SUB_STATE_ESCO: u16 = 0x80;
const SUB_STATE_A2DP: u16 = 0x100;

/// States of the shadow link state machine.
///
/// The eSCO and A2DP states sit under the ACL sub-state: their bit patterns
/// carry the ACL bit, so leaving `esco_connected` for `acl_connected` exits
/// the eSCO sub-state but not the ACL one.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Display, EnumIter, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ShadowState {
    #[default]
    Null,
    Initialising,
    Disconnected,
    PeerConnected,
    AclConnecting,
    AclDisconnecting,
    AclConnected,
    EscoConnecting,
    EscoConnected,
    EscoDisconnecting,
    A2dpConnecting,
    A2dpConnected,
    A2dpDisconnecting,
}

impl ShadowState {
    /// Bit pattern of the state, sub-state bits included.
    #[must_use]
    pub const fn bits(self) -> u16 {
        match self {
            Self::Null => 0x00,
            Self::Initialising => 0x01,
            Self::Disconnected => 0x10,
            Self::PeerConnected => 0x20,
            Self::AclConnecting => 0x21,
            Self::AclDisconnecting => 0x22,
            Self::AclConnected => SUB_STATE_ACL,
            Self::EscoConnecting => SUB_STATE_ACL | 0x01,
            Self::EscoDisconnecting => SUB_STATE_ACL | 0x02,
            Self::A2dpConnecting => SUB_STATE_ACL | 0x03,
            Self::A2dpDisconnecting => SUB_STATE_ACL | 0x04,
            Self::EscoConnected => SUB_STATE_ACL | SUB_STATE_ESCO,
            Self::A2dpConnected => SUB_STATE_ACL | SUB_STATE_A2DP,
        }
    }

    #[must_use]
    pub const fn is_acl_sub(self) -> bool {
        self.bits() & SUB_STATE_ACL != 0
    }

    #[must_use]
    pub const fn is_esco_sub(self) -> bool {
        self.bits() & SUB_STATE_ESCO != 0
    }

    #[must_use]
    pub const fn is_a2dp_sub(self) -> bool {
        self.bits() & SUB_STATE_A2DP != 0
    }

    /// Steady states release the transition lock and are the only states a
    /// kick moves out of.
    #[must_use]
    pub const fn is_steady(self) -> bool {
        matches!(
            self,
            Self::Disconnected
                | Self::PeerConnected
                | Self::AclConnected
                | Self::EscoConnected
                | Self::A2dpConnected
        )
    }

    /// One step from `self` toward `target`.
    ///
    /// Only defined for steady states; the result is `self` once the target
    /// is reached.
    ///
    /// # Panics
    ///
    /// Panics if `self` or `target` is not a steady state.
    #[must_use]
    pub fn step_toward(self, target: Self) -> Self {
        use ShadowState as S;

        if self == target {
            return self;
        }
        match (target, self) {
            (S::Disconnected, S::PeerConnected) => S::Disconnected,
            (S::Disconnected | S::PeerConnected, S::AclConnected) => S::AclDisconnecting,
            (S::Disconnected | S::PeerConnected | S::AclConnected, S::EscoConnected) => {
                S::EscoDisconnecting
            }
            (
                S::Disconnected | S::PeerConnected | S::AclConnected | S::EscoConnected,
                S::A2dpConnected,
            ) => S::A2dpDisconnecting,
            (S::PeerConnected, S::Disconnected)
            | (S::AclConnected | S::EscoConnected | S::A2dpConnected, S::Disconnected) => {
                S::PeerConnected
            }
            (S::AclConnected | S::EscoConnected | S::A2dpConnected, S::PeerConnected) => {
                S::AclConnecting
            }
            (S::EscoConnected, S::AclConnected) => S::EscoConnecting,
            (S::A2dpConnected, S::AclConnected) => S::A2dpConnecting,
            (S::A2dpConnected, S::EscoConnected) => S::EscoDisconnecting,
            _ => panic!("no shadow transition from {self} toward {target}"),
        }
    }
}

/// Timers owned by the shadow profile.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ShadowTimer {
    DelayedKick,
}
