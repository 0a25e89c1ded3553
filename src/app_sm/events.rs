use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::bdaddr::BdAddr;
use crate::collaborators::{A2dpStreamContext, EscoParams};
use crate::profiles::Profile;

/// Changes in the peer earbud's state, as broadcast through the state proxy.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case", tag = "peer")]
pub enum PeerEvent {
    InCase,
    OutOfCase,
    InEar,
    OutOfEar,
    /// A handset profile on the peer came up or went down.
    HandsetProfile {
        profile: Profile,
        connected: bool,
    },
    /// The peer's handset supports `profile`.
    ProfileSupported {
        profile: Profile,
    },
    HandsetLinkLoss,
    Pairing {
        active: bool,
    },
    /// First state exchange after the peer link came up.
    Sync,
    /// The peer's pairing data changed, so keys need forwarding again.
    LinkKeysUpdated,
}

/// Local audio activity.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case", tag = "audio")]
pub enum AudioEvent {
    A2dpStreaming {
        active: bool,
    },
    ScoConnected {
        #[serde(default)]
        params: EscoParams,
    },
    ScoDisconnected,
    Call {
        active: bool,
    },
    ScoForwarding {
        sending: bool,
    },
    A2dpContext {
        context: A2dpStreamContext,
    },
    HfpVolume {
        volume: u8,
    },
    /// HFP audio gateway the SCO belongs to.
    HfpAudioGateway {
        addr: Option<BdAddr>,
    },
}

/// Requests from the user interface, the power manager and the upgrade
/// engine.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case", tag = "app")]
pub enum AppRequest {
    /// User asked to pair a new handset.
    PairHandset,
    DeleteHandsets,
    FactoryReset,
    /// User asked to connect.
    Connect,
    PowerOff,
    BatteryLow,
    ShutdownCancelled,
    /// The power manager wants to sleep.
    SleepPrepare,
    SleepCancelled,
    PeerPairingComplete {
        success: bool,
    },
    HandsetPairingComplete {
        success: bool,
    },
    /// Hand the handset over to the peer.
    Handover,
    DfuRequest,
    DfuEnded {
        error: bool,
    },
    BleAdvertising {
        active: bool,
    },
}
