//! Narrow interfaces to everything outside the coordination core.
//!
//! Calls into a collaborator never block. Anything that completes later comes
//! back to the core as an [`Input`](crate::Input) posted to the composition
//! root.

mod fake;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use strum_macros::Display as StrumDisplay;

use crate::bdaddr::{BdAddr, Transport};
use crate::profiles::{Profile, ProfileMask};
use crate::rules::MicSelection;

pub use fake::{FakeDevice, FakePeerState, FakePlatform, FakeUpdate, PlatformCall};

/// Token handed out by [`ConnectionManager::create_acl`]. The matching
/// `AclLockReleased` input arrives once the ACL attempt has finished.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Display, Serialize, Deserialize,
)]
#[display("acl_lock_{_0}")]
pub struct AclLockToken(pub u32);

/// Handle of an open L2CAP channel.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Display, Serialize, Deserialize,
)]
#[display("sink_{_0}")]
pub struct Sink(pub u16);

#[derive(Debug, Clone, Copy, Eq, PartialEq, StrumDisplay, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum SdpSearchResult {
    Found { remote_psm: u16 },
    /// The peer answered but has no matching record.
    NoData,
    Error,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, StrumDisplay, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum L2capConnectStatus {
    Success,
    /// The attempt is still running; a final confirmation follows.
    Pending,
    Failed,
}

/// Why a link went away.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, StrumDisplay, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    #[default]
    LocalHost,
    /// Supervision timeout.
    LinkLoss,
    Other,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, StrumDisplay, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CodecMode {
    #[default]
    Narrowband,
    Wideband,
    SuperWideband,
}

/// eSCO parameters the Primary forwards so the Secondary can build its chain.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct EscoParams {
    pub codec_mode: CodecMode,
    pub wesco: u8,
    pub volume: u8,
}

/// A2DP media channel description forwarded to the Secondary.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct A2dpStreamContext {
    pub codec: u8,
    pub mtu: u16,
    pub cid: u16,
    pub sample_rate: u32,
    pub content_protection: bool,
}

/// An audio chain the audio adapter can start or stop.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "chain")]
pub enum AudioChain {
    Sco(EscoParams),
    A2dp(A2dpStreamContext),
}

/// A radio-level link mirrored onto the Secondary.
#[derive(Debug, Clone, Copy, Eq, PartialEq, StrumDisplay, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ShadowLink {
    Acl,
    Esco,
    L2cap,
}

/// Last broadcast state of the peer earbud.
///
/// Values are eventually consistent: rules re-run on every relevant event, so
/// a stale answer is corrected on the next pass.
pub trait StateProxy {
    fn is_peer_in_case(&self) -> bool;
    fn is_peer_in_ear(&self) -> bool;
    fn is_peer_pairing(&self) -> bool;
    /// Handset profiles the peer reports as connected.
    fn peer_handset_profiles(&self) -> ProfileMask;
    fn is_peer_handset_tws(&self) -> bool;
    fn peer_handset_addr(&self) -> Option<BdAddr>;
    fn has_peer_handset_pairing(&self) -> bool;
    fn is_peer_sco_active(&self) -> bool;
    fn is_peer_a2dp_streaming(&self) -> bool;
    /// Local and remote battery levels, in that order.
    fn battery_levels(&self) -> (u16, u16);
    fn is_peer_dfu_in_progress(&self) -> bool;
    fn is_peer_advertising(&self) -> bool;
    fn is_peer_ble_connected(&self) -> bool;
}

/// Device identity, pairing history and per-device profile state.
pub trait DeviceRegistry {
    fn peer_addr(&self) -> Option<BdAddr>;
    /// The handset to reconnect by default, if any is paired.
    fn handset_addr(&self) -> Option<BdAddr>;
    fn is_handset(&self, addr: BdAddr) -> bool;
    fn is_tws_plus_handset(&self, addr: BdAddr) -> bool;
    /// Whether `addr` was connected when the device last powered down.
    fn was_connected(&self, addr: BdAddr) -> bool;
    fn is_just_paired(&self, addr: BdAddr) -> bool;
    fn last_connected_profiles(&self, addr: BdAddr) -> ProfileMask;
    fn connected_profiles(&self, addr: BdAddr) -> ProfileMask;
    fn set_profile_connected(&mut self, addr: BdAddr, profile: Profile, connected: bool);
    fn link_key(&self, addr: BdAddr) -> Option<Vec<u8>>;
    fn store_link_key(&mut self, addr: BdAddr, key: Vec<u8>);
    fn set_mru_handset(&mut self, addr: BdAddr);
    fn delete_device(&mut self, addr: BdAddr);
    fn paired_devices(&self) -> Vec<BdAddr>;

    fn is_paired_with_peer(&self) -> bool {
        self.peer_addr().is_some()
    }

    fn is_paired_with_handset(&self) -> bool {
        self.handset_addr().is_some()
    }
}

/// Handset profile connect/disconnect. Completion arrives as a
/// `ProfilesConnectCfm` or `ProfilesDisconnectCfm` input.
pub trait ProfileManager {
    fn connect_profiles(&mut self, addr: BdAddr, profiles: &[Profile]);
    fn disconnect_profiles(&mut self, addr: BdAddr, profiles: &[Profile]);
}

pub trait ConnectionManager {
    fn create_acl(&mut self, addr: BdAddr) -> AclLockToken;
    fn release_acl(&mut self, addr: BdAddr);
    fn is_connected(&self, addr: BdAddr) -> bool;
    /// Whether the ACL to `addr` was created by this device.
    fn is_acl_local(&self, addr: BdAddr) -> bool;
    fn allow_handset_connect(&mut self, allowed: bool);
    fn any_transport_link_connected(&self, transport: Transport) -> bool;
    fn is_page_scan_enabled(&self) -> bool;
    fn set_page_scan(&mut self, enabled: bool);
    fn is_ble_connectable(&self) -> bool;
    fn set_ble_connectable(&mut self, connectable: bool);
    /// Drops every ACL without waiting for profiles.
    fn force_disconnect_all(&mut self);
}

pub trait AudioAdapter {
    fn connect_audio(&mut self, chain: AudioChain);
    fn disconnect_audio(&mut self, chain: AudioChain);
}

/// Local product controls the rule actions end up driving.
pub trait DeviceControls {
    fn start_peer_pairing(&mut self);
    fn start_handset_pairing(&mut self);
    fn set_leds_enabled(&mut self, enabled: bool);
    fn set_anc_enabled(&mut self, enabled: bool);
    fn set_anc_tuning(&mut self, active: bool);
    fn select_mic(&mut self, mic: MicSelection);
    fn set_sco_forwarding(&mut self, enabled: bool);
    fn media_play(&mut self);
    fn media_pause(&mut self);
    /// Moves the SCO audio to this earbud or back to the handset.
    fn transfer_sco(&mut self, to_earbud: bool);
    fn allow_dfu(&mut self, allowed: bool);
    fn enter_dfu_mode(&mut self);
    fn send_status_to_handset(&mut self, addr: BdAddr);
    fn request_role(&mut self, primary: bool);
    fn shutdown_complete(&mut self);
}

/// Low-level calls used by the peer link.
pub trait SignallingStack {
    fn register_psm(&mut self);
    fn register_sdp_record(&mut self, psm: u16);
    fn sdp_search(&mut self, addr: BdAddr);
    fn cancel_sdp_search(&mut self);
    fn l2cap_connect(&mut self, addr: BdAddr, local_psm: u16, remote_psm: u16, mtu: u16);
    fn l2cap_connect_response(&mut self, identifier: u16, accept: bool, psm: u16, mtu: u16);
    fn l2cap_disconnect(&mut self, sink: Sink);
    /// Reserves `len` bytes in `sink`, returning `false` if there is not enough space.
    fn sink_claim(&mut self, sink: Sink, len: usize) -> bool;
    fn sink_write(&mut self, sink: Sink, frame: Vec<u8>);
}

/// Shadow-link (SDM) requests. Results arrive as shadow inputs.
pub trait ShadowLinkManager {
    fn sdm_register(&mut self);
    fn shadow_acl_create(&mut self, handset: BdAddr, peer: BdAddr);
    fn shadow_esco_create(&mut self, handset: BdAddr);
    fn shadow_l2cap_create(&mut self, handset: BdAddr, cid: u16);
    fn shadow_disconnect(&mut self, link: ShadowLink);
}

/// Everything the core talks to, as one object.
pub trait Platform:
    StateProxy
    + DeviceRegistry
    + ProfileManager
    + ConnectionManager
    + AudioAdapter
    + DeviceControls
    + SignallingStack
    + ShadowLinkManager
{
    /// Connected handset profiles for the default handset.
    fn handset_profiles(&self) -> ProfileMask {
        self.handset_addr()
            .map_or(ProfileMask::EMPTY, |addr| self.connected_profiles(addr))
    }

    /// Profiles connected to the peer earbud.
    fn peer_profiles(&self) -> ProfileMask {
        self.peer_addr()
            .map_or(ProfileMask::EMPTY, |addr| self.connected_profiles(addr))
    }

    fn is_peer_connected(&self) -> bool {
        self.peer_addr().is_some_and(|addr| self.is_connected(addr))
    }
}

impl<T> Platform for T where
    T: StateProxy
        + DeviceRegistry
        + ProfileManager
        + ConnectionManager
        + AudioAdapter
        + DeviceControls
        + SignallingStack
        + ShadowLinkManager
{
}
