use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};
use strum_macros::Display;

use super::{
    AclLockToken, AudioAdapter, AudioChain, ConnectionManager, DeviceControls, DeviceRegistry,
    ProfileManager, ShadowLink, ShadowLinkManager, SignallingStack, Sink, StateProxy,
};
use crate::bdaddr::{BdAddr, Transport};
use crate::earbud::Input;
use crate::profiles::{Profile, ProfileMask};
use crate::rules::MicSelection;

/// What the fake knows about the peer earbud's last broadcast state.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FakePeerState {
    pub in_case: bool,
    pub in_ear: bool,
    pub pairing: bool,
    pub handset_profiles: ProfileMask,
    pub handset_tws: bool,
    pub handset_addr: Option<BdAddr>,
    pub has_handset_pairing: bool,
    pub sco_active: bool,
    pub a2dp_streaming: bool,
    pub local_battery: u16,
    pub peer_battery: u16,
    pub dfu_in_progress: bool,
    pub advertising: bool,
    pub ble_connected: bool,
}

/// One entry in the fake device list.
#[serde_as]
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FakeDevice {
    pub tws_plus: bool,
    pub was_connected: bool,
    pub just_paired: bool,
    pub last_connected: ProfileMask,
    pub connected: ProfileMask,
    #[serde_as(as = "Option<Hex>")]
    pub link_key: Option<Vec<u8>>,
}

/// Changes a replay scenario can make to the fake's world between inputs.
#[derive(Debug, Clone, Eq, PartialEq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case", tag = "update")]
pub enum FakeUpdate {
    PairPeer {
        addr: BdAddr,
    },
    PairHandset {
        addr: BdAddr,
        #[serde(default)]
        tws_plus: bool,
        #[serde(default)]
        was_connected: bool,
        #[serde(default)]
        last_connected_profiles: ProfileMask,
    },
    Peer {
        state: FakePeerState,
    },
    /// `None` means unlimited.
    SinkSpace {
        space: Option<usize>,
    },
    BleLink {
        connected: bool,
    },
    Acl {
        addr: BdAddr,
        connected: bool,
        #[serde(default)]
        local: bool,
    },
}

/// A call the core made on the platform, in the order it was made.
#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "call")]
pub enum PlatformCall {
    ConnectProfiles {
        addr: BdAddr,
        profiles: Vec<Profile>,
    },
    DisconnectProfiles {
        addr: BdAddr,
        profiles: Vec<Profile>,
    },
    CreateAcl {
        addr: BdAddr,
        token: AclLockToken,
    },
    ReleaseAcl {
        addr: BdAddr,
    },
    AllowHandsetConnect {
        allowed: bool,
    },
    SetPageScan {
        enabled: bool,
    },
    SetBleConnectable {
        connectable: bool,
    },
    ForceDisconnectAll,
    ConnectAudio {
        chain: AudioChain,
    },
    DisconnectAudio {
        chain: AudioChain,
    },
    StartPeerPairing,
    StartHandsetPairing,
    SetLeds {
        enabled: bool,
    },
    SetAnc {
        enabled: bool,
    },
    SetAncTuning {
        active: bool,
    },
    SelectMic {
        mic: MicSelection,
    },
    SetScoForwarding {
        enabled: bool,
    },
    MediaPlay,
    MediaPause,
    TransferSco {
        to_earbud: bool,
    },
    AllowDfu {
        allowed: bool,
    },
    EnterDfuMode,
    SendStatusToHandset {
        addr: BdAddr,
    },
    RequestRole {
        primary: bool,
    },
    ShutdownComplete,
    StoreLinkKey {
        addr: BdAddr,
    },
    SetMruHandset {
        addr: BdAddr,
    },
    DeleteDevice {
        addr: BdAddr,
    },
    RegisterPsm,
    RegisterSdpRecord {
        psm: u16,
    },
    SdpSearch {
        addr: BdAddr,
    },
    CancelSdpSearch,
    L2capConnect {
        addr: BdAddr,
        local_psm: u16,
        remote_psm: u16,
        mtu: u16,
    },
    L2capConnectResponse {
        identifier: u16,
        accept: bool,
        psm: u16,
        mtu: u16,
    },
    L2capDisconnect {
        sink: Sink,
    },
    SinkWrite {
        sink: Sink,
        #[serde_as(as = "Hex")]
        frame: Vec<u8>,
    },
    SdmRegister,
    ShadowAclCreate {
        handset: BdAddr,
        peer: BdAddr,
    },
    ShadowEscoCreate {
        handset: BdAddr,
    },
    ShadowL2capCreate {
        handset: BdAddr,
        cid: u16,
    },
    ShadowDisconnect {
        link: ShadowLink,
    },
}

/// An in-memory platform that records every call and answers queries from
/// plain fields.
///
/// Nothing completes on its own: tests and replay scenarios inject the
/// confirmations they want as inputs.
#[derive(Debug, Clone, Default)]
pub struct FakePlatform {
    pub peer_device: Option<BdAddr>,
    pub peer_state: FakePeerState,
    pub devices: BTreeMap<BdAddr, FakeDevice>,
    pub mru: Option<BdAddr>,
    /// Open BR/EDR ACLs, with whether this device created them.
    pub acls: BTreeMap<BdAddr, bool>,
    pub ble_link: bool,
    pub page_scan: bool,
    pub ble_connectable: bool,
    pub handset_connect_allowed: bool,
    /// Free space in the peer signalling sink. `None` means unlimited.
    pub sink_space: Option<usize>,
    pub next_token: u32,
    pub calls: Vec<PlatformCall>,
}

impl FakePlatform {
    pub fn take_calls(&mut self) -> Vec<PlatformCall> {
        std::mem::take(&mut self.calls)
    }

    pub fn apply(&mut self, update: FakeUpdate) {
        match update {
            FakeUpdate::PairPeer { addr } => {
                self.peer_device = Some(addr);
                self.devices.entry(addr).or_default();
            }
            FakeUpdate::PairHandset {
                addr,
                tws_plus,
                was_connected,
                last_connected_profiles,
            } => {
                let device = self.devices.entry(addr).or_default();
                device.tws_plus = tws_plus;
                device.was_connected = was_connected;
                device.last_connected = last_connected_profiles;
                if self.mru.is_none() {
                    self.mru = Some(addr);
                }
            }
            FakeUpdate::Peer { state } => self.peer_state = state,
            FakeUpdate::SinkSpace { space } => self.sink_space = space,
            FakeUpdate::BleLink { connected } => self.ble_link = connected,
            FakeUpdate::Acl {
                addr,
                connected,
                local,
            } => {
                if connected {
                    self.acls.insert(addr, local);
                } else {
                    self.acls.remove(&addr);
                }
            }
        }
    }

    /// Keeps link bookkeeping in step with inputs that report link changes.
    pub fn observe(&mut self, input: &Input) {
        match input {
            Input::AclConnected {
                addr,
                transport,
                local,
            } => match transport {
                Transport::BrEdr => {
                    self.acls.insert(*addr, *local);
                }
                Transport::Ble => self.ble_link = true,
            },
            Input::AclDisconnected {
                addr, transport, ..
            } => match transport {
                Transport::BrEdr => {
                    self.acls.remove(addr);
                    if let Some(device) = self.devices.get_mut(addr) {
                        device.connected = ProfileMask::EMPTY;
                    }
                }
                Transport::Ble => self.ble_link = false,
            },
            Input::ProfileConnected { addr, profile } => {
                self.set_profile_connected(*addr, *profile, true);
            }
            Input::ProfileDisconnected { addr, profile, .. } => {
                self.set_profile_connected(*addr, *profile, false);
            }
            _ => {}
        }
    }

    fn record(&mut self, call: PlatformCall) {
        self.calls.push(call);
    }

    fn device(&self, addr: BdAddr) -> Option<&FakeDevice> {
        self.devices.get(&addr)
    }
}

impl StateProxy for FakePlatform {
    fn is_peer_in_case(&self) -> bool {
        self.peer_state.in_case
    }

    fn is_peer_in_ear(&self) -> bool {
        self.peer_state.in_ear
    }

    fn is_peer_pairing(&self) -> bool {
        self.peer_state.pairing
    }

    fn peer_handset_profiles(&self) -> ProfileMask {
        self.peer_state.handset_profiles
    }

    fn is_peer_handset_tws(&self) -> bool {
        self.peer_state.handset_tws
    }

    fn peer_handset_addr(&self) -> Option<BdAddr> {
        self.peer_state.handset_addr
    }

    fn has_peer_handset_pairing(&self) -> bool {
        self.peer_state.has_handset_pairing
    }

    fn is_peer_sco_active(&self) -> bool {
        self.peer_state.sco_active
    }

    fn is_peer_a2dp_streaming(&self) -> bool {
        self.peer_state.a2dp_streaming
    }

    fn battery_levels(&self) -> (u16, u16) {
        (self.peer_state.local_battery, self.peer_state.peer_battery)
    }

    fn is_peer_dfu_in_progress(&self) -> bool {
        self.peer_state.dfu_in_progress
    }

    fn is_peer_advertising(&self) -> bool {
        self.peer_state.advertising
    }

    fn is_peer_ble_connected(&self) -> bool {
        self.peer_state.ble_connected
    }
}

impl DeviceRegistry for FakePlatform {
    fn peer_addr(&self) -> Option<BdAddr> {
        self.peer_device
    }

    fn handset_addr(&self) -> Option<BdAddr> {
        self.mru.or_else(|| {
            self.devices
                .keys()
                .copied()
                .find(|addr| Some(*addr) != self.peer_device)
        })
    }

    fn is_handset(&self, addr: BdAddr) -> bool {
        self.devices.contains_key(&addr) && self.peer_device != Some(addr)
    }

    fn is_tws_plus_handset(&self, addr: BdAddr) -> bool {
        self.is_handset(addr) && self.device(addr).is_some_and(|device| device.tws_plus)
    }

    fn was_connected(&self, addr: BdAddr) -> bool {
        self.device(addr).is_some_and(|device| device.was_connected)
    }

    fn is_just_paired(&self, addr: BdAddr) -> bool {
        self.device(addr).is_some_and(|device| device.just_paired)
    }

    fn last_connected_profiles(&self, addr: BdAddr) -> ProfileMask {
        self.device(addr)
            .map_or(ProfileMask::EMPTY, |device| device.last_connected)
    }

    fn connected_profiles(&self, addr: BdAddr) -> ProfileMask {
        self.device(addr)
            .map_or(ProfileMask::EMPTY, |device| device.connected)
    }

    fn set_profile_connected(&mut self, addr: BdAddr, profile: Profile, connected: bool) {
        let device = self.devices.entry(addr).or_default();
        if connected {
            device.connected.insert(ProfileMask::of(profile));
            device.last_connected.insert(ProfileMask::of(profile));
            device.was_connected = true;
        } else {
            device.connected.remove(ProfileMask::of(profile));
        }
    }

    fn link_key(&self, addr: BdAddr) -> Option<Vec<u8>> {
        self.device(addr).and_then(|device| device.link_key.clone())
    }

    fn store_link_key(&mut self, addr: BdAddr, key: Vec<u8>) {
        self.devices.entry(addr).or_default().link_key = Some(key);
        self.record(PlatformCall::StoreLinkKey { addr });
    }

    fn set_mru_handset(&mut self, addr: BdAddr) {
        self.mru = Some(addr);
        self.record(PlatformCall::SetMruHandset { addr });
    }

    fn delete_device(&mut self, addr: BdAddr) {
        self.devices.remove(&addr);
        if self.mru == Some(addr) {
            self.mru = None;
        }
        if self.peer_device == Some(addr) {
            self.peer_device = None;
        }
        self.record(PlatformCall::DeleteDevice { addr });
    }

    fn paired_devices(&self) -> Vec<BdAddr> {
        self.devices.keys().copied().collect()
    }
}

impl ProfileManager for FakePlatform {
    fn connect_profiles(&mut self, addr: BdAddr, profiles: &[Profile]) {
        self.record(PlatformCall::ConnectProfiles {
            addr,
            profiles: profiles.to_vec(),
        });
    }

    fn disconnect_profiles(&mut self, addr: BdAddr, profiles: &[Profile]) {
        self.record(PlatformCall::DisconnectProfiles {
            addr,
            profiles: profiles.to_vec(),
        });
    }
}

impl ConnectionManager for FakePlatform {
    fn create_acl(&mut self, addr: BdAddr) -> AclLockToken {
        let token = AclLockToken(self.next_token);
        self.next_token += 1;
        self.record(PlatformCall::CreateAcl { addr, token });
        token
    }

    fn release_acl(&mut self, addr: BdAddr) {
        self.record(PlatformCall::ReleaseAcl { addr });
    }

    fn is_connected(&self, addr: BdAddr) -> bool {
        self.acls.contains_key(&addr)
    }

    fn is_acl_local(&self, addr: BdAddr) -> bool {
        self.acls.get(&addr).copied().unwrap_or(false)
    }

    fn allow_handset_connect(&mut self, allowed: bool) {
        self.handset_connect_allowed = allowed;
        self.record(PlatformCall::AllowHandsetConnect { allowed });
    }

    fn any_transport_link_connected(&self, transport: Transport) -> bool {
        match transport {
            Transport::BrEdr => !self.acls.is_empty(),
            Transport::Ble => self.ble_link,
        }
    }

    fn is_page_scan_enabled(&self) -> bool {
        self.page_scan
    }

    fn set_page_scan(&mut self, enabled: bool) {
        self.page_scan = enabled;
        self.record(PlatformCall::SetPageScan { enabled });
    }

    fn is_ble_connectable(&self) -> bool {
        self.ble_connectable
    }

    fn set_ble_connectable(&mut self, connectable: bool) {
        self.ble_connectable = connectable;
        self.record(PlatformCall::SetBleConnectable { connectable });
    }

    fn force_disconnect_all(&mut self) {
        self.acls.clear();
        self.record(PlatformCall::ForceDisconnectAll);
    }
}

impl AudioAdapter for FakePlatform {
    fn connect_audio(&mut self, chain: AudioChain) {
        self.record(PlatformCall::ConnectAudio { chain });
    }

    fn disconnect_audio(&mut self, chain: AudioChain) {
        self.record(PlatformCall::DisconnectAudio { chain });
    }
}

impl DeviceControls for FakePlatform {
    fn start_peer_pairing(&mut self) {
        self.record(PlatformCall::StartPeerPairing);
    }

    fn start_handset_pairing(&mut self) {
        self.record(PlatformCall::StartHandsetPairing);
    }

    fn set_leds_enabled(&mut self, enabled: bool) {
        self.record(PlatformCall::SetLeds { enabled });
    }

    fn set_anc_enabled(&mut self, enabled: bool) {
        self.record(PlatformCall::SetAnc { enabled });
    }

    fn set_anc_tuning(&mut self, active: bool) {
        self.record(PlatformCall::SetAncTuning { active });
    }

    fn select_mic(&mut self, mic: MicSelection) {
        self.record(PlatformCall::SelectMic { mic });
    }

    fn set_sco_forwarding(&mut self, enabled: bool) {
        self.record(PlatformCall::SetScoForwarding { enabled });
    }

    fn media_play(&mut self) {
        self.record(PlatformCall::MediaPlay);
    }

    fn media_pause(&mut self) {
        self.record(PlatformCall::MediaPause);
    }

    fn transfer_sco(&mut self, to_earbud: bool) {
        self.record(PlatformCall::TransferSco { to_earbud });
    }

    fn allow_dfu(&mut self, allowed: bool) {
        self.record(PlatformCall::AllowDfu { allowed });
    }

    fn enter_dfu_mode(&mut self) {
        self.record(PlatformCall::EnterDfuMode);
    }

    fn send_status_to_handset(&mut self, addr: BdAddr) {
        self.record(PlatformCall::SendStatusToHandset { addr });
    }

    fn request_role(&mut self, primary: bool) {
        self.record(PlatformCall::RequestRole { primary });
    }

    fn shutdown_complete(&mut self) {
        self.record(PlatformCall::ShutdownComplete);
    }
}

impl SignallingStack for FakePlatform {
    fn register_psm(&mut self) {
        self.record(PlatformCall::RegisterPsm);
    }

    fn register_sdp_record(&mut self, psm: u16) {
        self.record(PlatformCall::RegisterSdpRecord { psm });
    }

    fn sdp_search(&mut self, addr: BdAddr) {
        self.record(PlatformCall::SdpSearch { addr });
    }

    fn cancel_sdp_search(&mut self) {
        self.record(PlatformCall::CancelSdpSearch);
    }

    fn l2cap_connect(&mut self, addr: BdAddr, local_psm: u16, remote_psm: u16, mtu: u16) {
        self.record(PlatformCall::L2capConnect {
            addr,
            local_psm,
            remote_psm,
            mtu,
        });
    }

    fn l2cap_connect_response(&mut self, identifier: u16, accept: bool, psm: u16, mtu: u16) {
        self.record(PlatformCall::L2capConnectResponse {
            identifier,
            accept,
            psm,
            mtu,
        });
    }

    fn l2cap_disconnect(&mut self, sink: Sink) {
        self.record(PlatformCall::L2capDisconnect { sink });
    }

    fn sink_claim(&mut self, _sink: Sink, len: usize) -> bool {
        match self.sink_space.as_mut() {
            None => true,
            Some(space) if *space >= len => {
                *space -= len;
                true
            }
            Some(_) => false,
        }
    }

    fn sink_write(&mut self, sink: Sink, frame: Vec<u8>) {
        self.record(PlatformCall::SinkWrite { sink, frame });
    }
}

impl ShadowLinkManager for FakePlatform {
    fn sdm_register(&mut self) {
        self.record(PlatformCall::SdmRegister);
    }

    fn shadow_acl_create(&mut self, handset: BdAddr, peer: BdAddr) {
        self.record(PlatformCall::ShadowAclCreate { handset, peer });
    }

    fn shadow_esco_create(&mut self, handset: BdAddr) {
        self.record(PlatformCall::ShadowEscoCreate { handset });
    }

    fn shadow_l2cap_create(&mut self, handset: BdAddr, cid: u16) {
        self.record(PlatformCall::ShadowL2capCreate { handset, cid });
    }

    fn shadow_disconnect(&mut self, link: ShadowLink) {
        self.record(PlatformCall::ShadowDisconnect { link });
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::collaborators::Platform;

    const PEER: BdAddr = BdAddr::new([0, 0, 0, 0, 0, 1]);
    const HANDSET: BdAddr = BdAddr::new([0, 0, 0, 0, 0, 2]);

    #[test]
    fn handset_defaults_to_first_non_peer_device() {
        let mut platform = FakePlatform::default();
        platform.apply(FakeUpdate::PairPeer { addr: PEER });
        platform.devices.insert(HANDSET, FakeDevice::default());

        assert_eq!(Some(HANDSET), platform.handset_addr());
        assert!(!platform.is_handset(PEER));
    }

    #[test]
    fn profile_changes_feed_connection_history() {
        let mut platform = FakePlatform::default();
        platform.apply(FakeUpdate::PairHandset {
            addr: HANDSET,
            tws_plus: false,
            was_connected: false,
            last_connected_profiles: ProfileMask::EMPTY,
        });

        platform.set_profile_connected(HANDSET, Profile::A2dp, true);
        platform.set_profile_connected(HANDSET, Profile::A2dp, false);

        assert_eq!(ProfileMask::EMPTY, platform.handset_profiles());
        assert_eq!(ProfileMask::A2DP, platform.last_connected_profiles(HANDSET));
        assert!(platform.was_connected(HANDSET));
    }

    #[test]
    fn sink_claims_consume_space() {
        let mut platform = FakePlatform {
            sink_space: Some(10),
            ..FakePlatform::default()
        };

        assert!(platform.sink_claim(Sink(1), 6));
        assert!(!platform.sink_claim(Sink(1), 6));
        assert_eq!(Some(4), platform.sink_space);
    }

    #[test]
    fn updates_deserialise_from_scenario_json() {
        let update: FakeUpdate = serde_json::from_str(
            r#"{ "update": "pair_handset", "addr": "00:00:00:00:00:02", "was_connected": true }"#,
        )
        .expect("update should deserialise");

        assert_eq!(
            FakeUpdate::PairHandset {
                addr: HANDSET,
                tws_plus: false,
                was_connected: true,
                last_connected_profiles: ProfileMask::EMPTY,
            },
            update
        );
    }
}
