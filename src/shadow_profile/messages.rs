use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::collaborators::{A2dpStreamContext, CodecMode, DisconnectReason, ShadowLink};

/// Messages the Primary marshals to the Secondary on the shadow profile
/// channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "shadow")]
pub enum ShadowMarshalled {
    /// Current A2DP media channel, so the Secondary can complete a shadow
    /// media channel without negotiating.
    StreamContext {
        codec: u8,
        mtu: u16,
        cid: u16,
        sample_rate: u32,
        content_protection: bool,
    },
    EscoConnect {
        codec_mode: CodecMode,
        wesco: u8,
        volume: u8,
    },
    Volume {
        volume: u8,
    },
}

impl From<A2dpStreamContext> for ShadowMarshalled {
    fn from(context: A2dpStreamContext) -> Self {
        Self::StreamContext {
            codec: context.codec,
            mtu: context.mtu,
            cid: context.cid,
            sample_rate: context.sample_rate,
            content_protection: context.content_protection,
        }
    }
}

/// Indications sent to shadow profile clients.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ShadowIndication {
    InitCfm,
    AclConnectInd,
    AclDisconnectInd,
    EscoConnectInd,
    EscoDisconnectInd,
    A2dpStreamActiveInd,
    A2dpStreamInactiveInd,
}

/// Results of shadow link requests and unsolicited shadow link events.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case", tag = "sdm")]
pub enum SdmEvent {
    RegisterCfm {
        success: bool,
    },
    /// Primary only: result of a shadow ACL create.
    AclCreateCfm {
        success: bool,
    },
    /// Secondary only: the Primary created a shadow ACL.
    AclCreateInd {
        success: bool,
    },
    EscoCreateCfm {
        success: bool,
    },
    EscoCreateInd {
        success: bool,
        wesco: u8,
    },
    DisconnectCfm {
        link: ShadowLink,
        reason: DisconnectReason,
    },
    DisconnectInd {
        link: ShadowLink,
        reason: DisconnectReason,
    },
    L2capCreateInd {
        cid: u16,
    },
    L2capCreateCfm {
        success: bool,
    },
    L2capDisconnectInd,
    L2capDisconnectCfm,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn sdm_events_deserialise_from_tagged_json() {
        let event: SdmEvent =
            serde_json::from_str(r#"{ "sdm": "disconnect_ind", "link": "acl", "reason": "link_loss" }"#)
                .expect("event should deserialise");

        assert_eq!(
            SdmEvent::DisconnectInd {
                link: ShadowLink::Acl,
                reason: DisconnectReason::LinkLoss,
            },
            event
        );
    }
}
