use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};
use strum_macros::Display;

use crate::app_sm::{AppRequest, AudioEvent, PeerEvent, PhyState, Role};
use crate::bdaddr::{BdAddr, Transport};
use crate::collaborators::{AclLockToken, DisconnectReason, L2capConnectStatus, SdpSearchResult, Sink};
use crate::handset_service::HandsetRequest;
use crate::message::TaskId;
use crate::peer_signalling::PeerSigRequest;
use crate::profiles::Profile;
use crate::rules::{DfuGoal, DfuRuleEvent};
use crate::shadow_profile::SdmEvent;

/// An event from outside the core: a collaborator completing something, a
/// link coming or going, a sensor, or a client request.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case", tag = "input")]
pub enum Input {
    /// Power on. Starts every component.
    Init,
    TopologyStarted {
        role: Role,
    },
    RoleChanged {
        role: Role,
    },
    DfuGoalComplete {
        goal: DfuGoal,
    },
    /// A topology event for the upgrade rule set, such as the role chosen
    /// for the session or the session being aborted.
    DfuEvent {
        event: DfuRuleEvent,
    },
    PhyState {
        state: PhyState,
    },
    Peer(PeerEvent),
    Audio(AudioEvent),
    App(AppRequest),
    AclConnected {
        addr: BdAddr,
        #[serde(default)]
        transport: Transport,
        /// This device created the link.
        #[serde(default)]
        local: bool,
    },
    AclDisconnected {
        addr: BdAddr,
        #[serde(default)]
        transport: Transport,
        #[serde(default)]
        reason: DisconnectReason,
    },
    AclLockReleased {
        token: AclLockToken,
    },
    ProfileConnected {
        addr: BdAddr,
        profile: Profile,
    },
    ProfileDisconnected {
        addr: BdAddr,
        profile: Profile,
        #[serde(default)]
        reason: DisconnectReason,
    },
    ProfilesConnectCfm {
        addr: BdAddr,
        success: bool,
    },
    ProfilesDisconnectCfm {
        addr: BdAddr,
        success: bool,
    },
    PsmRegistered {
        psm: u16,
    },
    SdpRegistered {
        success: bool,
    },
    SdpSearchCfm {
        addr: BdAddr,
        result: SdpSearchResult,
    },
    L2capConnectInd {
        addr: BdAddr,
        identifier: u16,
        psm: u16,
    },
    L2capConnectCfm {
        addr: BdAddr,
        status: L2capConnectStatus,
        #[serde(default)]
        sink: Option<Sink>,
        #[serde(default)]
        remote_mtu: u16,
    },
    L2capDisconnectInd {
        sink: Sink,
        #[serde(default)]
        reason: DisconnectReason,
    },
    L2capDisconnectCfm {
        sink: Sink,
    },
    /// One complete frame arrived on a signalling channel.
    SinkData {
        sink: Sink,
        #[serde_as(as = "Hex")]
        data: Vec<u8>,
    },
    SinkMoreSpace {
        sink: Sink,
    },
    Sdm(SdmEvent),
    /// A client task asking something of the peer link.
    PeerSigRequest(PeerSigRequest),
    /// A client task asking something of the handset service.
    HandsetRequest(HandsetRequest),
    ShadowClientRegister {
        task: TaskId,
    },
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn nested_events_keep_their_own_tags() {
        let input: Input = serde_json::from_str(r#"{ "input": "app", "app": "power_off" }"#)
            .expect("input should deserialise");

        assert_eq!(Input::App(AppRequest::PowerOff), input);
    }

    #[test]
    fn link_inputs_default_to_bredr() {
        let input: Input = serde_json::from_str(
            r#"{ "input": "acl_disconnected", "addr": "00:02:5b:00:00:01", "reason": "link_loss" }"#,
        )
        .expect("input should deserialise");

        assert_eq!(
            Input::AclDisconnected {
                addr: BdAddr::new([0x00, 0x02, 0x5b, 0x00, 0x00, 0x01]),
                transport: Transport::BrEdr,
                reason: DisconnectReason::LinkLoss,
            },
            input
        );
    }

    #[test]
    fn sink_data_is_hex() {
        let input: Input =
            serde_json::from_str(r#"{ "input": "sink_data", "sink": 7, "data": "0a0b" }"#)
                .expect("input should deserialise");

        assert_eq!(
            Input::SinkData {
                sink: Sink(7),
                data: vec![0x0a, 0x0b],
            },
            input
        );
    }
}
