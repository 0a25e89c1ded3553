use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::bdaddr::BdAddr;
use crate::message::TaskId;
use crate::profiles::ProfileMask;

/// Final status carried by every handset service confirmation.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HandsetStatus {
    Success,
    Failed,
    /// Superseded by a request in the opposite direction.
    Cancelled,
    Connected,
    Disconnected,
    NoMru,
    InProgress,
}

/// Calls other tasks make on the handset service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "request")]
pub enum HandsetRequest {
    ConnectAddress {
        task: TaskId,
        addr: BdAddr,
        profiles: ProfileMask,
    },
    /// Connects the most recently used handset.
    ConnectMru {
        task: TaskId,
        profiles: ProfileMask,
    },
    Disconnect {
        task: TaskId,
        addr: BdAddr,
    },
    StopConnect {
        task: TaskId,
        addr: BdAddr,
    },
    Connectable {
        task: TaskId,
    },
    CancelConnectable {
        task: TaskId,
    },
    ClientRegister {
        task: TaskId,
    },
    ClientUnregister {
        task: TaskId,
    },
}

/// Confirmations to requesters and indications to registered clients.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "message")]
pub enum HandsetMessage {
    ConnectCfm {
        addr: BdAddr,
        status: HandsetStatus,
    },
    DisconnectCfm {
        addr: BdAddr,
        status: HandsetStatus,
    },
    ConnectStopCfm {
        addr: BdAddr,
        status: HandsetStatus,
    },
    ConnectedInd {
        addr: BdAddr,
        profiles: ProfileMask,
    },
    DisconnectedInd {
        addr: BdAddr,
        status: HandsetStatus,
    },
}
