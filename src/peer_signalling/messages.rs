use std::fmt;

use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};
use strum_macros::Display;

use crate::bdaddr::{AddrType, BdAddr};
use crate::message::TaskId;
use crate::shadow_profile::ShadowMarshalled;
use crate::utils::bitmask_ops;

/// Channel ids multiplexed over the peer signalling link, one bit each.
#[derive(Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelMask(u32);

bitmask_ops!(ChannelMask, u32);

impl ChannelMask {
    pub const SCOFWD: Self = Self(1 << 0);
    pub const PEER_SYNC: Self = Self(1 << 1);
    pub const STATE_PROXY: Self = Self(1 << 2);
    pub const APPLICATION: Self = Self(1 << 3);
    pub const LOGICAL_INPUT_SWITCH: Self = Self(1 << 4);
    pub const KEY_SYNC: Self = Self(1 << 5);
    pub const SHADOW_PROFILE: Self = Self(1 << 6);

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }
}

impl fmt::Display for ChannelMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for ChannelMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelMask({self})")
    }
}

/// Status carried by every peer signalling confirmation and indication.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PeerSigStatus {
    Success,
    Fail,
    LinkKeyTxFail,
    Connected,
    Disconnected,
    LinkLoss,
    PairHandsetTxFail,
    MsgChannelTxFail,
    MarshalledMsgChannelTxFail,
    InProgress,
}

/// Typed payloads carried on marshalled channels.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum MarshalledMessage {
    Shadow(ShadowMarshalled),
    /// A payload owned by some other component, passed through untouched.
    Opaque {
        type_id: u16,
        #[serde_as(as = "Hex")]
        bytes: Vec<u8>,
    },
}

/// Calls other tasks make on the peer link.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "request")]
pub enum PeerSigRequest {
    Startup {
        task: TaskId,
        addr: BdAddr,
    },
    Shutdown {
        task: TaskId,
    },
    LinkKeyTx {
        task: TaskId,
        addr: BdAddr,
        #[serde_as(as = "Hex")]
        key: Vec<u8>,
    },
    PairHandsetAddress {
        task: TaskId,
        addr: BdAddr,
    },
    MsgChannelTx {
        task: TaskId,
        channel: ChannelMask,
        #[serde_as(as = "Hex")]
        data: Vec<u8>,
    },
    ConnectHandset {
        task: TaskId,
        play_media: bool,
    },
    MarshalledTx {
        task: TaskId,
        channel: ChannelMask,
        message: MarshalledMessage,
    },
    RegisterLinkKeyTask {
        task: TaskId,
    },
    RegisterHandsetCommandsTask {
        task: TaskId,
    },
    ClientRegister {
        task: TaskId,
    },
    ClientUnregister {
        task: TaskId,
    },
    MsgChannelRegister {
        task: TaskId,
        mask: ChannelMask,
    },
    MsgChannelUnregister {
        task: TaskId,
        mask: ChannelMask,
    },
    MarshalledRegister {
        task: TaskId,
        channel: ChannelMask,
    },
}

/// Confirmations and indications the peer link sends to its clients.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "ind")]
pub enum PeerSigMessage {
    InitCfm,
    ConnectCfm {
        status: PeerSigStatus,
    },
    DisconnectCfm {
        status: PeerSigStatus,
    },
    ConnectionInd {
        status: PeerSigStatus,
    },
    LinkKeyTxCfm {
        status: PeerSigStatus,
        addr: BdAddr,
    },
    PairHandsetCfm {
        status: PeerSigStatus,
        addr: BdAddr,
    },
    ConnectHandsetCfm {
        status: PeerSigStatus,
    },
    MsgChannelTxCfm {
        status: PeerSigStatus,
        channel: ChannelMask,
    },
    MarshalledMsgChannelTxCfm {
        status: PeerSigStatus,
        channel: ChannelMask,
    },
    AddLinkKeyInd {
        addr: BdAddr,
        addr_type: AddrType,
        key_type: u8,
        #[serde_as(as = "Hex")]
        key: Vec<u8>,
    },
    PairHandsetInd {
        addr: BdAddr,
    },
    ConnectHandsetInd {
        play_media: bool,
    },
    MsgChannelRxInd {
        channel: ChannelMask,
        #[serde_as(as = "Hex")]
        data: Vec<u8>,
    },
    MarshalledMsgChannelRxInd {
        channel: ChannelMask,
        message: MarshalledMessage,
    },
}
