use serde::Serialize;
use strum_macros::{Display, EnumIter};

/// States of the peer signalling link.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Display, EnumIter, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PeerSigState {
    #[default]
    Null,
    Initialising,
    Disconnected,
    ConnectingAcl,
    ConnectingSdpSearch,
    ConnectingLocal,
    ConnectingRemote,
    Connected,
    Disconnecting,
}

impl PeerSigState {
    /// Locked states hold back queued startup and shutdown requests.
    #[must_use]
    pub const fn is_locked(self) -> bool {
        matches!(
            self,
            Self::Initialising
                | Self::ConnectingAcl
                | Self::ConnectingSdpSearch
                | Self::ConnectingLocal
                | Self::ConnectingRemote
                | Self::Disconnecting
        )
    }

    #[must_use]
    pub const fn is_connecting(self) -> bool {
        matches!(
            self,
            Self::ConnectingAcl
                | Self::ConnectingSdpSearch
                | Self::ConnectingLocal
                | Self::ConnectingRemote
        )
    }
}

/// Timers owned by the peer link.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum PeerSigTimer {
    Inactivity,
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn stable_states_are_unlocked() {
        let unlocked: Vec<PeerSigState> =
            PeerSigState::iter().filter(|state| !state.is_locked()).collect();

        insta::assert_debug_snapshot!(unlocked, @r"
        [
            Null,
            Disconnected,
            Connected,
        ]
        ");
    }
}
