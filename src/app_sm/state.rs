use std::fmt;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

/// Topology role of this earbud.
#[derive(
    Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Display, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    None,
    Primary,
    Secondary,
    /// Upgrade in progress; the DFU rule set drives topology.
    Dfu,
}

impl Role {
    #[must_use]
    pub const fn is_primary(self) -> bool {
        matches!(self, Self::Primary)
    }
}

/// Physical position reported by the sensors.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PhyState {
    #[default]
    Unknown,
    InCase,
    OutOfEar,
    /// Out of the ear and motionless.
    OutOfEarAtRest,
    InEar,
}

/// Top-level application phase.
///
/// `in_case_*`, `out_of_case_*` and `in_ear_*` phases sit under the matching
/// parent; the parent helpers on [`AppState`] are derived from the phase and
/// never stored.
#[derive(
    Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Display, EnumIter,
    Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Null,
    Initialising,
    DfuCheck,
    FactoryReset,
    Startup,
    PeerPairing,
    HandsetPairing,
    InCaseIdle,
    InCaseDfu,
    OutOfCaseIdle,
    OutOfCaseBusy,
    OutOfCaseSoporific,
    InEarIdle,
    InEarBusy,
    Terminating,
}

impl Phase {
    #[must_use]
    pub const fn is_in_case(self) -> bool {
        matches!(self, Self::InCaseIdle | Self::InCaseDfu)
    }

    #[must_use]
    pub const fn is_out_of_case(self) -> bool {
        matches!(
            self,
            Self::OutOfCaseIdle | Self::OutOfCaseBusy | Self::OutOfCaseSoporific
        )
    }

    #[must_use]
    pub const fn is_in_ear(self) -> bool {
        matches!(self, Self::InEarIdle | Self::InEarBusy)
    }

    #[must_use]
    pub const fn is_idle(self) -> bool {
        matches!(self, Self::InCaseIdle | Self::OutOfCaseIdle | Self::InEarIdle)
    }
}

/// Transient activity layered over a phase.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Display, EnumIter, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Substate {
    #[default]
    None,
    Disconnecting,
    Terminating,
    /// Dropping links before sleep.
    SoporificTerminating,
}

impl Substate {
    #[must_use]
    pub const fn is_terminating(self) -> bool {
        matches!(self, Self::Terminating | Self::SoporificTerminating)
    }
}

/// Application state: a phase plus the substate layered over it.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize)]
pub struct AppState {
    pub phase: Phase,
    pub substate: Substate,
}

impl AppState {
    #[must_use]
    pub const fn new(phase: Phase) -> Self {
        Self {
            phase,
            substate: Substate::None,
        }
    }

    #[must_use]
    pub const fn with_substate(self, substate: Substate) -> Self {
        Self {
            phase: self.phase,
            substate,
        }
    }

    #[must_use]
    pub const fn is_in_case(self) -> bool {
        self.phase.is_in_case()
    }

    #[must_use]
    pub const fn is_out_of_case(self) -> bool {
        self.phase.is_out_of_case()
    }

    #[must_use]
    pub const fn is_in_ear(self) -> bool {
        self.phase.is_in_ear()
    }

    /// One of the states computed from the physical state alone.
    #[must_use]
    pub fn is_core(self) -> bool {
        self.substate == Substate::None
            && matches!(
                self.phase,
                Phase::InCaseIdle
                    | Phase::OutOfCaseIdle
                    | Phase::OutOfCaseBusy
                    | Phase::InEarIdle
                    | Phase::InEarBusy
            )
    }

    /// Whether inbound BR/EDR connections are accepted.
    #[must_use]
    pub fn is_connectable(self) -> bool {
        (self.is_out_of_case() || self.is_in_ear()) && !self.substate.is_terminating()
    }

    /// Whether new BLE connections are accepted. Out of the case that also
    /// depends on the product allowing it.
    #[must_use]
    pub fn is_ble_connectable(self, allowed_out_of_case: bool) -> bool {
        if self.substate.is_terminating() {
            return false;
        }
        if self.is_in_case() {
            return true;
        }
        (self.is_out_of_case() || self.is_in_ear()) && allowed_out_of_case
    }

    #[must_use]
    pub fn is_sleepy(self) -> bool {
        self.phase == Phase::OutOfCaseSoporific
    }
}

impl From<Phase> for AppState {
    fn from(phase: Phase) -> Self {
        Self::new(phase)
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.substate {
            Substate::None => write!(f, "{}", self.phase),
            substate => write!(f, "{}/{}", self.phase, substate),
        }
    }
}

/// Timers owned by the application state machine.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum AppTimer {
    /// Pause A2DP once out of the ear for long enough.
    A2dpPause,
    /// While running, going back in the ear restarts paused media.
    A2dpRestart,
    /// Hand SCO back to the handset once out of the ear for long enough.
    ScoTransfer,
    DfuTimeout,
    DisconnectWatchdog,
    Idle,
}

/// Core phase for a physical state and audio activity.
#[must_use]
pub fn core_phase(phy: PhyState, busy: bool) -> Phase {
    match phy {
        PhyState::Unknown | PhyState::InCase => Phase::InCaseIdle,
        PhyState::OutOfEar | PhyState::OutOfEarAtRest if busy => Phase::OutOfCaseBusy,
        PhyState::OutOfEar | PhyState::OutOfEarAtRest => Phase::OutOfCaseIdle,
        PhyState::InEar if busy => Phase::InEarBusy,
        PhyState::InEar => Phase::InEarIdle,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use strum::IntoEnumIterator;

    use super::*;

    #[rstest]
    #[case(PhyState::Unknown, false, Phase::InCaseIdle)]
    #[case(PhyState::InCase, true, Phase::InCaseIdle)]
    #[case(PhyState::OutOfEar, false, Phase::OutOfCaseIdle)]
    #[case(PhyState::OutOfEarAtRest, true, Phase::OutOfCaseBusy)]
    #[case(PhyState::InEar, false, Phase::InEarIdle)]
    #[case(PhyState::InEar, true, Phase::InEarBusy)]
    fn core_phase_follows_position_and_audio(
        #[case] phy: PhyState,
        #[case] busy: bool,
        #[case] expected: Phase,
    ) {
        assert_eq!(expected, core_phase(phy, busy));
    }

    #[test]
    fn each_phase_has_at_most_one_parent() {
        for phase in Phase::iter() {
            let parents = [phase.is_in_case(), phase.is_out_of_case(), phase.is_in_ear()]
                .into_iter()
                .filter(|parent| *parent)
                .count();
            assert!(parents <= 1, "{phase} has {parents} parents");
        }
    }

    #[test]
    fn terminating_stops_new_connections() {
        let state = AppState::new(Phase::InEarIdle);

        assert!(state.is_connectable());
        assert!(state.is_ble_connectable(true));
        assert!(!state.with_substate(Substate::Terminating).is_connectable());
        assert!(
            !state
                .with_substate(Substate::Terminating)
                .is_ble_connectable(true)
        );
        assert!(state.with_substate(Substate::Disconnecting).is_connectable());
    }

    #[test]
    fn in_case_allows_ble_only() {
        let state = AppState::new(Phase::InCaseIdle);

        assert!(!state.is_connectable());
        assert!(state.is_ble_connectable(false));
        assert!(!AppState::new(Phase::OutOfCaseIdle).is_ble_connectable(false));
    }

    #[test]
    fn state_display_appends_the_substate() {
        assert_eq!("in_ear_busy", AppState::new(Phase::InEarBusy).to_string());
        assert_eq!(
            "out_of_case_soporific/soporific_terminating",
            AppState::new(Phase::OutOfCaseSoporific)
                .with_substate(Substate::SoporificTerminating)
                .to_string()
        );
    }
}
