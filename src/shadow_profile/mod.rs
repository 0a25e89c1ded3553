//! Mirrored handset links on the Secondary.
//!
//! The Primary keeps a target state computed from the peer link and the
//! handset's profile and audio state, and a kick walks the current state one
//! step toward it each time the machine settles. The Secondary never kicks:
//! it follows the indications that the Primary's requests cause.

mod messages;
mod state;

use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

use crate::app_sm::Role;
use crate::collaborators::{
    A2dpStreamContext, AudioChain, DisconnectReason, EscoParams, Platform, ShadowLink,
};
use crate::config::ShadowConfig;
use crate::message::{ConditionalQueue, Message, Outbox, StateChange, TaskId, TaskList, TimerQueue};
use crate::peer_signalling::{
    ChannelMask, MarshalledMessage, PeerSigMessage, PeerSigRequest, PeerSigStatus,
};
use crate::profiles::ProfileMask;

pub use messages::{SdmEvent, ShadowIndication, ShadowMarshalled};
pub use state::{ShadowState, ShadowTimer};

const LOCK_TRANSITION: u16 = 1 << 0;

/// Audio changes applied only while the machine is steady.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum AudioSync {
    Sco {
        active: bool,
        params: Option<EscoParams>,
    },
    A2dp {
        active: bool,
    },
}

/// The shadow link state machine.
#[derive(Debug)]
pub struct ShadowProfile {
    config: ShadowConfig,
    state: ShadowState,
    target: ShadowState,
    role: Role,
    delay_kick: bool,
    peer_sig_connected: bool,
    sco_active: bool,
    a2dp_active: bool,
    esco: EscoParams,
    a2dp: A2dpStreamContext,
    init_task: Option<TaskId>,
    clients: TaskList,
    audio_queue: ConditionalQueue<AudioSync>,
    timers: TimerQueue<ShadowTimer>,
    outbox: Outbox<Message>,
    transitions: Vec<StateChange>,
}

impl ShadowProfile {
    #[must_use]
    pub fn new(config: ShadowConfig) -> Self {
        let mut audio_queue = ConditionalQueue::new();
        audio_queue.set_lock(LOCK_TRANSITION);
        Self {
            config,
            state: ShadowState::Null,
            target: ShadowState::Disconnected,
            role: Role::None,
            delay_kick: false,
            peer_sig_connected: false,
            sco_active: false,
            a2dp_active: false,
            esco: EscoParams::default(),
            a2dp: A2dpStreamContext::default(),
            init_task: None,
            clients: TaskList::new(),
            audio_queue,
            timers: TimerQueue::new(),
            outbox: Outbox::new(),
            transitions: Vec::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ShadowState {
        self.state
    }

    #[must_use]
    pub fn target(&self) -> ShadowState {
        self.target
    }

    /// Whether a shadow ACL or eSCO is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.is_acl_sub()
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn take_messages(&mut self) -> Vec<(TaskId, Message)> {
        self.outbox.drain().collect()
    }

    pub fn take_transitions(&mut self) -> Vec<StateChange> {
        std::mem::take(&mut self.transitions)
    }

    /// Registers with the shadow link manager and the peer link. `task`
    /// receives `InitCfm` once registration completes.
    pub fn init(&mut self, platform: &mut dyn Platform, task: TaskId) {
        self.init_task = Some(task);
        self.outbox.send(
            TaskId::PeerSignalling,
            Message::PeerSigRequest(PeerSigRequest::ClientRegister {
                task: TaskId::ShadowProfile,
            }),
        );
        self.outbox.send(
            TaskId::PeerSignalling,
            Message::PeerSigRequest(PeerSigRequest::MarshalledRegister {
                task: TaskId::ShadowProfile,
                channel: ChannelMask::SHADOW_PROFILE,
            }),
        );
        self.set_state(platform, ShadowState::Initialising);
    }

    pub fn client_register(&mut self, task: TaskId) {
        self.clients.add(task);
    }

    pub fn client_unregister(&mut self, task: TaskId) {
        self.clients.remove(task);
    }

    /// Switches between driving the links (Primary) and following them
    /// (Secondary). A new Primary recomputes its target straight away.
    pub fn set_role(&mut self, platform: &mut dyn Platform, role: Role) {
        if self.role == role {
            return;
        }
        info!(from = %self.role, to = %role, "shadow profile role");
        self.role = role;
        if role.is_primary() {
            self.update_target(platform);
        }
    }

    /// Handles messages routed from the other components.
    pub fn handle_message(&mut self, platform: &mut dyn Platform, message: Message) {
        match message {
            Message::PeerSig(PeerSigMessage::ConnectionInd { status }) => {
                self.peer_sig_connected = status == PeerSigStatus::Connected;
                if self.role.is_primary() {
                    self.update_target(platform);
                }
            }
            Message::PeerSig(PeerSigMessage::MarshalledMsgChannelRxInd {
                message: MarshalledMessage::Shadow(marshalled),
                ..
            }) => self.handle_marshalled(marshalled),
            Message::PeerSig(PeerSigMessage::MarshalledMsgChannelTxCfm { status, .. })
                if status != PeerSigStatus::Success =>
            {
                warn!(%status, "shadow message not delivered to peer");
            }
            Message::Handset(_) => self.profile_state_changed(platform),
            other => trace!(?other, "shadow profile ignoring message"),
        }
    }

    /// Recomputes the target after handset profiles changed.
    pub fn profile_state_changed(&mut self, platform: &mut dyn Platform) {
        if self.role.is_primary() {
            self.update_target(platform);
        }
    }

    /// Handset SCO started or stopped on the Primary. Applied once the
    /// machine is steady.
    pub fn sco_changed(
        &mut self,
        platform: &mut dyn Platform,
        active: bool,
        params: Option<EscoParams>,
    ) {
        self.audio_queue.push(AudioSync::Sco { active, params });
        self.pump(platform);
    }

    /// Handset A2DP streaming started or stopped on the Primary. Applied once
    /// the machine is steady.
    pub fn a2dp_streaming_changed(&mut self, platform: &mut dyn Platform, active: bool) {
        self.audio_queue.push(AudioSync::A2dp { active });
        self.pump(platform);
    }

    /// New A2DP media channel on the Primary; forwarded while the shadow ACL is up.
    pub fn a2dp_context(&mut self, context: A2dpStreamContext) {
        self.a2dp = context;
        if self.role.is_primary() && self.state.is_acl_sub() {
            self.send_marshalled(ShadowMarshalled::from(context));
        }
    }

    /// HFP volume changed on the Primary.
    pub fn hfp_volume_ind(&mut self, volume: u8) {
        self.esco.volume = volume;
        if self.role.is_primary() && self.state.is_esco_sub() {
            self.send_marshalled(ShadowMarshalled::Volume { volume });
        }
    }

    #[instrument(skip(self, platform), level = "debug", fields(state = %self.state))]
    pub fn sdm_event(&mut self, platform: &mut dyn Platform, event: SdmEvent) {
        use ShadowState as S;

        match (event, self.state) {
            (SdmEvent::RegisterCfm { success: true }, S::Initialising) => {
                self.set_state(platform, S::Disconnected);
            }
            (SdmEvent::RegisterCfm { success: false }, S::Initialising) => {
                warn!("shadow link manager registration failed");
            }
            (SdmEvent::AclCreateCfm { success }, S::AclConnecting) => {
                if success {
                    self.set_state(platform, S::AclConnected);
                } else {
                    self.delay_kick = true;
                    self.set_state(platform, S::PeerConnected);
                }
            }
            (SdmEvent::AclCreateInd { success }, S::Disconnected | S::PeerConnected) => {
                if success {
                    self.set_state(platform, S::AclConnected);
                }
            }
            (SdmEvent::EscoCreateCfm { success }, S::EscoConnecting) => {
                let next = if success { S::EscoConnected } else { S::AclConnected };
                self.set_state(platform, next);
            }
            (SdmEvent::EscoCreateInd { success, wesco }, S::AclConnected) => {
                if success {
                    self.esco.wesco = wesco;
                    self.set_state(platform, S::EscoConnected);
                }
            }
            (
                SdmEvent::DisconnectCfm { link, reason },
                S::AclDisconnecting | S::EscoDisconnecting,
            ) => self.disconnect_cfm(platform, link, reason),
            (SdmEvent::DisconnectInd { link, reason }, _) => {
                self.disconnect_ind(platform, link, reason);
            }
            (SdmEvent::L2capCreateInd { cid }, S::AclConnected) => {
                self.a2dp.cid = cid;
                self.set_state(platform, S::A2dpConnecting);
            }
            (SdmEvent::L2capCreateCfm { success }, S::A2dpConnecting) => {
                if success {
                    self.set_state(platform, S::A2dpConnected);
                } else {
                    self.delay_kick = true;
                    self.set_state(platform, S::AclConnected);
                }
            }
            (SdmEvent::L2capDisconnectInd, S::A2dpConnected) => {
                self.set_state(platform, S::A2dpDisconnecting);
            }
            (SdmEvent::L2capDisconnectCfm, S::A2dpDisconnecting) => {
                self.set_state(platform, S::AclConnected);
            }
            (event, state) => warn!(%event, %state, "unexpected shadow link event"),
        }
        self.pump(platform);
    }

    pub fn fire_due_timers(&mut self, platform: &mut dyn Platform, now: Instant) {
        for timer in self.timers.pop_expired(now) {
            match timer {
                ShadowTimer::DelayedKick => {
                    debug!("delayed shadow kick");
                    self.kick(platform);
                }
            }
        }
        self.pump(platform);
    }

    fn disconnect_cfm(
        &mut self,
        platform: &mut dyn Platform,
        link: ShadowLink,
        reason: DisconnectReason,
    ) {
        let next = match (self.state, link) {
            (ShadowState::AclDisconnecting, ShadowLink::Acl) => ShadowState::PeerConnected,
            (ShadowState::EscoDisconnecting, ShadowLink::Esco) => ShadowState::AclConnected,
            _ => {
                debug!(%link, "disconnect confirmation for another shadow link");
                return;
            }
        };
        if reason == DisconnectReason::LocalHost {
            self.set_state(platform, next);
        } else {
            // Already gone; the indication follows.
            debug!(%link, %reason, "waiting for shadow disconnect indication");
        }
    }

    fn disconnect_ind(
        &mut self,
        platform: &mut dyn Platform,
        link: ShadowLink,
        reason: DisconnectReason,
    ) {
        use ShadowState as S;

        match (link, self.state) {
            (_, S::PeerConnected) => trace!(%link, "shadow link already down"),
            (ShadowLink::Acl, state) if state.is_acl_sub() || state == S::AclDisconnecting => {
                if self.role.is_primary() && reason == DisconnectReason::LinkLoss {
                    self.delay_kick = true;
                }
                self.set_state(platform, S::PeerConnected);
            }
            (ShadowLink::Esco, S::EscoConnected | S::EscoDisconnecting) => {
                self.set_state(platform, S::AclConnected);
            }
            (link, state) => warn!(%link, %state, "unexpected shadow disconnect indication"),
        }
    }

    fn handle_marshalled(&mut self, marshalled: ShadowMarshalled) {
        if self.role.is_primary() {
            warn!(?marshalled, "primary received a shadow message");
            return;
        }
        match marshalled {
            ShadowMarshalled::StreamContext {
                codec,
                mtu,
                cid,
                sample_rate,
                content_protection,
            } => {
                self.a2dp = A2dpStreamContext {
                    codec,
                    mtu,
                    cid,
                    sample_rate,
                    content_protection,
                };
            }
            ShadowMarshalled::EscoConnect {
                codec_mode,
                wesco,
                volume,
            } => {
                self.esco = EscoParams {
                    codec_mode,
                    wesco,
                    volume,
                };
            }
            ShadowMarshalled::Volume { volume } => {
                debug!(old = self.esco.volume, volume, "shadow sco volume");
                self.esco.volume = volume;
            }
        }
    }

    /// Applies audio changes that were waiting for a steady state.
    fn pump(&mut self, platform: &mut dyn Platform) {
        while let Some(sync) = self.audio_queue.pop_ready() {
            match sync {
                AudioSync::Sco { active, params } => {
                    self.sco_active = active;
                    if let Some(params) = params {
                        self.esco = params;
                    }
                }
                AudioSync::A2dp { active } => self.a2dp_active = active,
            }
            if self.role.is_primary() {
                self.update_target(platform);
            }
        }
    }

    fn update_target(&mut self, platform: &mut dyn Platform) {
        let target = self.target_from_profiles(platform);
        if target != self.target {
            debug!(from = %self.target, to = %target, "shadow target");
        }
        self.target = target;
        self.kick(platform);
    }

    /// SCO takes priority over A2DP.
    fn target_from_profiles(&self, platform: &dyn Platform) -> ShadowState {
        if !self.peer_sig_connected {
            ShadowState::Disconnected
        } else if (platform.handset_profiles() & ProfileMask::HANDSET).is_empty() {
            ShadowState::PeerConnected
        } else if self.sco_active {
            ShadowState::EscoConnected
        } else if self.a2dp_active {
            ShadowState::A2dpConnected
        } else {
            ShadowState::AclConnected
        }
    }

    /// Moves one step toward the target if the machine is steady.
    fn kick(&mut self, platform: &mut dyn Platform) {
        if !self.config.enabled || !self.role.is_primary() {
            return;
        }
        if self.delay_kick {
            self.delay_kick = false;
            self.timers
                .start(ShadowTimer::DelayedKick, self.config.kick_later_delay);
            return;
        }
        if self.state.is_steady() {
            let next = self.state.step_toward(self.target);
            if next != self.state {
                self.set_state(platform, next);
            }
            self.timers.cancel(ShadowTimer::DelayedKick);
        }
    }

    fn set_state(&mut self, platform: &mut dyn Platform, state: ShadowState) {
        use ShadowState as S;

        let old = self.state;
        assert!(old != state, "shadow profile re-entering {state}");
        info!(from = %old, to = %state, "shadow profile state");
        self.transitions
            .push(StateChange::new(TaskId::ShadowProfile, old, state));

        if old == S::Initialising {
            if let Some(task) = self.init_task.take() {
                self.send_indication_to(task, ShadowIndication::InitCfm);
            }
        }

        if old.is_a2dp_sub() && !state.is_a2dp_sub() {
            self.exit_a2dp(platform);
        }
        if old.is_esco_sub() && !state.is_esco_sub() {
            self.exit_esco(platform);
        }
        if old.is_acl_sub() && !state.is_acl_sub() {
            self.send_indication(ShadowIndication::AclDisconnectInd);
        }
        if old.is_steady() {
            self.audio_queue.set_lock(LOCK_TRANSITION);
        }

        self.state = state;

        if !old.is_acl_sub() && state.is_acl_sub() {
            self.enter_acl();
        }
        if !old.is_esco_sub() && state.is_esco_sub() {
            self.enter_esco(platform);
        }
        if !old.is_a2dp_sub() && state.is_a2dp_sub() {
            self.send_indication(ShadowIndication::A2dpStreamActiveInd);
        }
        if state.is_steady() {
            self.audio_queue.clear_lock(LOCK_TRANSITION);
        }

        match state {
            S::Initialising => platform.sdm_register(),
            S::AclConnecting => self.enter_acl_connecting(platform),
            S::EscoConnecting => self.enter_esco_connecting(platform),
            S::AclDisconnecting => platform.shadow_disconnect(ShadowLink::Acl),
            S::EscoDisconnecting => platform.shadow_disconnect(ShadowLink::Esco),
            S::A2dpConnecting => self.enter_a2dp_connecting(platform),
            S::A2dpDisconnecting => {
                if self.role.is_primary() {
                    platform.shadow_disconnect(ShadowLink::L2cap);
                } else {
                    self.set_state(platform, S::AclConnected);
                }
            }
            S::Null
            | S::Disconnected
            | S::PeerConnected
            | S::AclConnected
            | S::EscoConnected
            | S::A2dpConnected => {}
        }

        // An entry action may already have moved on.
        if self.state == state && self.role.is_primary() {
            self.kick(platform);
        }
    }

    fn enter_acl(&mut self) {
        if self.role.is_primary() {
            self.send_marshalled(ShadowMarshalled::from(self.a2dp));
        }
        self.send_indication(ShadowIndication::AclConnectInd);
    }

    fn enter_esco(&mut self, platform: &mut dyn Platform) {
        if !self.role.is_primary() {
            platform.connect_audio(AudioChain::Sco(self.esco));
        }
        self.send_indication(ShadowIndication::EscoConnectInd);
    }

    fn exit_esco(&mut self, platform: &mut dyn Platform) {
        if !self.role.is_primary() {
            platform.disconnect_audio(AudioChain::Sco(self.esco));
        }
        self.send_indication(ShadowIndication::EscoDisconnectInd);
    }

    fn exit_a2dp(&mut self, platform: &mut dyn Platform) {
        if !self.role.is_primary() {
            platform.disconnect_audio(AudioChain::A2dp(self.a2dp));
        }
        self.send_indication(ShadowIndication::A2dpStreamInactiveInd);
    }

    fn enter_acl_connecting(&mut self, platform: &mut dyn Platform) {
        match (platform.handset_addr(), platform.peer_addr()) {
            (Some(handset), Some(peer)) => platform.shadow_acl_create(handset, peer),
            _ => {
                warn!("no handset or peer to shadow");
                self.delay_kick = true;
                self.set_state(platform, ShadowState::PeerConnected);
            }
        }
    }

    fn enter_esco_connecting(&mut self, platform: &mut dyn Platform) {
        self.send_marshalled(ShadowMarshalled::EscoConnect {
            codec_mode: self.esco.codec_mode,
            wesco: self.esco.wesco,
            volume: self.esco.volume,
        });
        match platform.handset_addr() {
            Some(handset) => platform.shadow_esco_create(handset),
            None => {
                warn!("no handset for shadow esco");
                self.set_state(platform, ShadowState::AclConnected);
            }
        }
    }

    fn enter_a2dp_connecting(&mut self, platform: &mut dyn Platform) {
        if !self.role.is_primary() {
            platform.connect_audio(AudioChain::A2dp(self.a2dp));
            return;
        }
        match platform.handset_addr() {
            Some(handset) => platform.shadow_l2cap_create(handset, self.a2dp.cid),
            None => {
                warn!("no handset for shadow media channel");
                self.set_state(platform, ShadowState::AclConnected);
            }
        }
    }

    fn send_marshalled(&mut self, message: ShadowMarshalled) {
        self.outbox.send(
            TaskId::PeerSignalling,
            Message::PeerSigRequest(PeerSigRequest::MarshalledTx {
                task: TaskId::ShadowProfile,
                channel: ChannelMask::SHADOW_PROFILE,
                message: MarshalledMessage::Shadow(message),
            }),
        );
    }

    fn send_indication(&mut self, indication: ShadowIndication) {
        let clients: Vec<TaskId> = self.clients.tasks().collect();
        self.outbox.send_all(clients, Message::Shadow(indication));
    }

    fn send_indication_to(&mut self, task: TaskId, indication: ShadowIndication) {
        self.outbox.send(task, Message::Shadow(indication));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bdaddr::BdAddr;
    use crate::collaborators::{CodecMode, DeviceRegistry, FakePlatform, PlatformCall};
    use crate::profiles::Profile;

    const PEER: BdAddr = BdAddr::new([0x00, 0x02, 0x5b, 0x00, 0xee, 0x01]);
    const HANDSET: BdAddr = BdAddr::new([0x00, 0x1a, 0x7d, 0x00, 0x00, 0x02]);
    const CLIENT: TaskId = TaskId::Client(3);

    fn platform() -> FakePlatform {
        let mut platform = FakePlatform::default();
        platform.peer_device = Some(PEER);
        platform.devices.insert(PEER, Default::default());
        platform.devices.insert(HANDSET, Default::default());
        platform.mru = Some(HANDSET);
        platform
    }

    fn initialised(platform: &mut FakePlatform, role: Role) -> ShadowProfile {
        let mut shadow = ShadowProfile::new(ShadowConfig::default());
        shadow.client_register(CLIENT);
        shadow.init(platform, TaskId::AppSm);
        shadow.sdm_event(platform, SdmEvent::RegisterCfm { success: true });
        shadow.set_role(platform, role);
        shadow.take_messages();
        shadow.take_transitions();
        platform.take_calls();
        shadow
    }

    fn peer_connected(shadow: &mut ShadowProfile, platform: &mut FakePlatform) {
        shadow.handle_message(
            platform,
            Message::PeerSig(PeerSigMessage::ConnectionInd {
                status: PeerSigStatus::Connected,
            }),
        );
    }

    fn states(shadow: &mut ShadowProfile) -> Vec<String> {
        shadow
            .take_transitions()
            .into_iter()
            .map(|change| change.to)
            .collect()
    }

    fn indications(shadow: &mut ShadowProfile) -> Vec<ShadowIndication> {
        shadow
            .take_messages()
            .into_iter()
            .filter_map(|(task, message)| match message {
                Message::Shadow(indication) if task == CLIENT => Some(indication),
                _ => None,
            })
            .collect()
    }

    fn marshalled(shadow: &mut ShadowProfile) -> Vec<ShadowMarshalled> {
        shadow
            .take_messages()
            .into_iter()
            .filter_map(|(_, message)| match message {
                Message::PeerSigRequest(PeerSigRequest::MarshalledTx {
                    message: MarshalledMessage::Shadow(shadow),
                    ..
                }) => Some(shadow),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn init_registers_and_confirms() {
        let mut platform = platform();
        let mut shadow = ShadowProfile::new(ShadowConfig::default());

        shadow.init(&mut platform, TaskId::AppSm);
        shadow.sdm_event(&mut platform, SdmEvent::RegisterCfm { success: true });

        assert_eq!(vec![PlatformCall::SdmRegister], platform.take_calls());
        assert_eq!(ShadowState::Disconnected, shadow.state());
        let messages = shadow.take_messages();
        assert_eq!(
            Some(&(TaskId::AppSm, Message::Shadow(ShadowIndication::InitCfm))),
            messages.last()
        );
    }

    #[test]
    fn primary_walks_to_esco_without_skipping_acl() {
        let mut platform = platform();
        platform.set_profile_connected(HANDSET, Profile::Hfp, true);
        let mut shadow = initialised(&mut platform, Role::Primary);
        shadow.sco_changed(&mut platform, true, None);
        assert_eq!(ShadowState::Disconnected, shadow.target());

        peer_connected(&mut shadow, &mut platform);
        assert_eq!(ShadowState::EscoConnected, shadow.target());
        assert_eq!(ShadowState::AclConnecting, shadow.state());
        shadow.sdm_event(&mut platform, SdmEvent::AclCreateCfm { success: true });
        shadow.sdm_event(&mut platform, SdmEvent::EscoCreateCfm { success: true });

        assert_eq!(
            vec![
                "peer_connected",
                "acl_connecting",
                "acl_connected",
                "esco_connecting",
                "esco_connected"
            ],
            states(&mut shadow)
        );
        assert_eq!(
            vec![
                PlatformCall::ShadowAclCreate {
                    handset: HANDSET,
                    peer: PEER
                },
                PlatformCall::ShadowEscoCreate { handset: HANDSET },
            ],
            platform.take_calls()
        );
    }

    #[test]
    fn peer_link_loss_tears_the_shadow_acl_down() {
        let mut platform = platform();
        platform.set_profile_connected(HANDSET, Profile::Hfp, true);
        let mut shadow = initialised(&mut platform, Role::Primary);
        peer_connected(&mut shadow, &mut platform);
        shadow.sdm_event(&mut platform, SdmEvent::AclCreateCfm { success: true });
        shadow.take_transitions();
        platform.take_calls();

        shadow.handle_message(
            &mut platform,
            Message::PeerSig(PeerSigMessage::ConnectionInd {
                status: PeerSigStatus::LinkLoss,
            }),
        );
        assert_eq!(
            vec![PlatformCall::ShadowDisconnect {
                link: ShadowLink::Acl
            }],
            platform.take_calls()
        );
        shadow.sdm_event(
            &mut platform,
            SdmEvent::DisconnectCfm {
                link: ShadowLink::Acl,
                reason: DisconnectReason::LocalHost,
            },
        );

        assert_eq!(
            vec!["acl_disconnecting", "peer_connected", "disconnected"],
            states(&mut shadow)
        );
        assert_eq!(
            vec![
                ShadowIndication::AclConnectInd,
                ShadowIndication::AclDisconnectInd
            ],
            indications(&mut shadow)
        );
    }

    #[test]
    fn sco_change_waits_for_a_steady_state() {
        let mut platform = platform();
        platform.set_profile_connected(HANDSET, Profile::Hfp, true);
        let mut shadow = initialised(&mut platform, Role::Primary);
        peer_connected(&mut shadow, &mut platform);
        assert_eq!(ShadowState::AclConnecting, shadow.state());

        shadow.sco_changed(&mut platform, true, None);
        assert_eq!(ShadowState::AclConnected, shadow.target());

        shadow.sdm_event(&mut platform, SdmEvent::AclCreateCfm { success: true });

        assert_eq!(ShadowState::EscoConnected, shadow.target());
        assert_eq!(ShadowState::EscoConnecting, shadow.state());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_acl_create_retries_after_delay() {
        let mut platform = platform();
        platform.set_profile_connected(HANDSET, Profile::A2dp, true);
        let mut shadow = initialised(&mut platform, Role::Primary);
        peer_connected(&mut shadow, &mut platform);
        platform.take_calls();

        shadow.sdm_event(&mut platform, SdmEvent::AclCreateCfm { success: false });
        assert_eq!(ShadowState::PeerConnected, shadow.state());
        assert_eq!(Vec::<PlatformCall>::new(), platform.take_calls());

        tokio::time::advance(Duration::from_millis(100)).await;
        shadow.fire_due_timers(&mut platform, Instant::now());

        assert_eq!(ShadowState::AclConnecting, shadow.state());
        assert_eq!(
            vec![PlatformCall::ShadowAclCreate {
                handset: HANDSET,
                peer: PEER
            }],
            platform.take_calls()
        );
    }

    #[test]
    fn primary_forwards_stream_context_and_esco_params() {
        let mut platform = platform();
        platform.set_profile_connected(HANDSET, Profile::Hfp, true);
        let mut shadow = initialised(&mut platform, Role::Primary);
        let context = A2dpStreamContext {
            codec: 2,
            mtu: 895,
            cid: 0x41,
            sample_rate: 48_000,
            content_protection: true,
        };
        shadow.a2dp_context(context);
        peer_connected(&mut shadow, &mut platform);
        shadow.sdm_event(&mut platform, SdmEvent::AclCreateCfm { success: true });
        let params = EscoParams {
            codec_mode: CodecMode::Wideband,
            wesco: 2,
            volume: 10,
        };
        shadow.sco_changed(&mut platform, true, Some(params));
        shadow.sdm_event(&mut platform, SdmEvent::EscoCreateCfm { success: true });
        shadow.hfp_volume_ind(12);

        assert_eq!(
            vec![
                ShadowMarshalled::from(context),
                ShadowMarshalled::EscoConnect {
                    codec_mode: CodecMode::Wideband,
                    wesco: 2,
                    volume: 10
                },
                ShadowMarshalled::Volume { volume: 12 },
            ],
            marshalled(&mut shadow)
        );
    }

    #[test]
    fn secondary_builds_sco_chain_from_forwarded_params() {
        let mut platform = platform();
        let mut shadow = initialised(&mut platform, Role::Secondary);
        shadow.handle_message(
            &mut platform,
            Message::PeerSig(PeerSigMessage::MarshalledMsgChannelRxInd {
                channel: ChannelMask::SHADOW_PROFILE,
                message: MarshalledMessage::Shadow(ShadowMarshalled::EscoConnect {
                    codec_mode: CodecMode::SuperWideband,
                    wesco: 4,
                    volume: 9,
                }),
            }),
        );

        shadow.sdm_event(&mut platform, SdmEvent::AclCreateInd { success: true });
        shadow.sdm_event(&mut platform, SdmEvent::EscoCreateInd { success: true, wesco: 6 });
        shadow.sdm_event(
            &mut platform,
            SdmEvent::DisconnectInd {
                link: ShadowLink::Acl,
                reason: DisconnectReason::LinkLoss,
            },
        );

        let chain = AudioChain::Sco(EscoParams {
            codec_mode: CodecMode::SuperWideband,
            wesco: 6,
            volume: 9,
        });
        assert_eq!(
            vec![
                PlatformCall::ConnectAudio { chain },
                PlatformCall::DisconnectAudio { chain },
            ],
            platform.take_calls()
        );
        assert_eq!(
            vec![
                ShadowIndication::AclConnectInd,
                ShadowIndication::EscoConnectInd,
                ShadowIndication::EscoDisconnectInd,
                ShadowIndication::AclDisconnectInd,
            ],
            indications(&mut shadow)
        );
        assert_eq!(ShadowState::PeerConnected, shadow.state());
        assert_eq!(None, shadow.next_deadline());
    }

    #[test]
    fn secondary_a2dp_disconnect_returns_straight_to_acl() {
        let mut platform = platform();
        let mut shadow = initialised(&mut platform, Role::Secondary);
        shadow.sdm_event(&mut platform, SdmEvent::AclCreateInd { success: true });
        shadow.sdm_event(&mut platform, SdmEvent::L2capCreateInd { cid: 0x42 });
        shadow.sdm_event(&mut platform, SdmEvent::L2capCreateCfm { success: true });
        shadow.take_transitions();

        shadow.sdm_event(&mut platform, SdmEvent::L2capDisconnectInd);

        assert_eq!(vec!["a2dp_disconnecting", "acl_connected"], states(&mut shadow));
        assert_eq!(ShadowState::AclConnected, shadow.state());
    }

    #[test]
    fn unexpected_events_are_ignored() {
        let mut platform = platform();
        let mut shadow = initialised(&mut platform, Role::Primary);

        shadow.sdm_event(&mut platform, SdmEvent::EscoCreateCfm { success: true });

        assert_eq!(ShadowState::Disconnected, shadow.state());
        assert_eq!(Vec::<String>::new(), states(&mut shadow));
    }
}
