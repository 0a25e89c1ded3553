use crate::app_sm::Role;
use crate::bdaddr::BdAddr;
use crate::collaborators::Platform;
use crate::config::EarbudConfig;
use crate::profiles::ProfileMask;

use super::engine::RuleAction;

/// Application facts the rule conditions read, captured before each pass.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct AppSnapshot {
    pub in_case: bool,
    pub out_of_case: bool,
    pub in_ear: bool,
    pub pairing: bool,
    pub role: Role,
    pub dfu_pending: bool,
    pub in_dfu_mode: bool,
    /// In the upgrade role, this earbud is the one acting as Primary.
    pub dfu_primary: bool,
    /// Whether the current state accepts inbound BR/EDR connections.
    pub connectable: bool,
    /// Whether the current state accepts new BLE connections.
    pub ble_connectable: bool,
    pub ble_advertising: bool,
    pub a2dp_restart_pending: bool,
    pub a2dp_streaming: bool,
    pub sco_active: bool,
    pub call_active: bool,
    pub scofwd_sending: bool,
    pub hfp_ag_addr: Option<BdAddr>,
    pub using_secondary_address: bool,
}

/// Everything a rule condition may look at.
#[derive(Clone, Copy)]
pub struct RuleContext<'a> {
    pub platform: &'a dyn Platform,
    pub app: &'a AppSnapshot,
    pub config: &'a EarbudConfig,
}

/// Signature shared by every rule condition.
pub type Condition = fn(&RuleContext<'_>) -> RuleAction;

/// Profiles that tie the peer link to audio rather than just signalling.
pub(crate) const PEER_AV_PROFILES: ProfileMask = ProfileMask::A2DP
    .union(ProfileMask::AVRCP)
    .union(ProfileMask::SCOFWD)
    .union(ProfileMask::SHADOW);

impl RuleContext<'_> {
    /// Profiles connected on the default handset.
    pub(crate) fn handset_profiles(&self) -> ProfileMask {
        self.platform.handset_profiles()
    }

    pub(crate) fn handset_connected(&self) -> bool {
        !self.handset_profiles().is_empty()
    }

    /// Handset profiles the peer reports, limited to the ones a handset can carry.
    pub(crate) fn peer_handset_profiles(&self) -> ProfileMask {
        self.platform.peer_handset_profiles() & ProfileMask::HANDSET
    }

    pub(crate) fn peer_has_handset(&self) -> bool {
        !self.peer_handset_profiles().is_empty()
    }

    /// Whether the peer has A2DP or HFP up to its handset.
    pub(crate) fn peer_handset_has_audio(&self) -> bool {
        self.peer_handset_profiles()
            .intersects(ProfileMask::A2DP | ProfileMask::HFP)
    }

    pub(crate) fn peer_av_connected(&self) -> bool {
        self.platform.peer_profiles().intersects(PEER_AV_PROFILES)
    }

    pub(crate) fn handset_is_tws_plus(&self, addr: BdAddr) -> bool {
        self.platform.is_tws_plus_handset(addr)
    }
}
