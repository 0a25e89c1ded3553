use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

use crate::profiles::ProfileMask;

/// Largest payload a rule may attach to an action.
pub const MAX_RUN_PARAMS_SIZE: usize = 16;

/// Actions produced by the Primary and Secondary connection rule sets.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Hash, EnumIter, Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConnRuleAction {
    Nop,
    PeerPair,
    HandsetPair,
    AllowHandsetConnect,
    RejectHandsetConnect,
    PeerSendLinkKeys,
    ConnectHandset,
    ConnectPeerHandset,
    ConnectPeer,
    UpdateMruHandset,
    SendStatusToHandset,
    DisconnectHandset,
    DisconnectPeer,
    A2dpTimeout,
    A2dpTimeoutCancel,
    MediaPlay,
    ScoTimeout,
    ScoTransferToEarbud,
    ScoTransferToHandset,
    ScoForwardingControl,
    SelectMic,
    LedEnable,
    LedDisable,
    AncEnable,
    AncDisable,
    AncTuningStart,
    AncTuningStop,
    EnterDfu,
    DfuAllow,
    PageScanUpdate,
    BleConnectionUpdate,
    DecideRole,
    HandoverDisconnectHandset,
    HandoverReconnectHandset,
    HandoverReconnectHandsetAndPlay,
}

/// Goals produced by the DFU rule set.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Hash, EnumIter, Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DfuGoal {
    Nop,
    NoRoleFindRole,
    NoRoleIdle,
    Secondary,
    Primary,
    LinklossSecondary,
    InCase,
    ConnectableHandset,
    LePrimaryAbortCleanup,
}

/// What to do once a handset connect requested by a rule has completed.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PostConnectAction {
    #[default]
    None,
    PlayMedia,
}

/// Which earbud's microphone carries the uplink when SCO is forwarded.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MicSelection {
    Local,
    Remote,
}

/// Payload a rule attaches to its action with `run_with_param`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunParams {
    Bool(bool),
    Profiles(ProfileMask),
    ConnectHandset {
        profiles: ProfileMask,
        post_action: PostConnectAction,
    },
    Mic(MicSelection),
}

const _: () = assert!(std::mem::size_of::<RunParams>() <= MAX_RUN_PARAMS_SIZE);

impl RunParams {
    #[must_use]
    pub const fn as_bool(self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(value),
            _ => None,
        }
    }

    /// Profiles carried by the payload, if it names any.
    #[must_use]
    pub const fn profiles(self) -> Option<ProfileMask> {
        match self {
            Self::Profiles(profiles) | Self::ConnectHandset { profiles, .. } => Some(profiles),
            _ => None,
        }
    }

    #[must_use]
    pub const fn post_action(self) -> PostConnectAction {
        match self {
            Self::ConnectHandset { post_action, .. } => post_action,
            _ => PostConnectAction::None,
        }
    }

    #[must_use]
    pub const fn mic(self) -> Option<MicSelection> {
        match self {
            Self::Mic(mic) => Some(mic),
            _ => None,
        }
    }
}
