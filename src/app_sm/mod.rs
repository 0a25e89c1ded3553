//! The application state machine.
//!
//! Reconciles the physical position, profile status, upgrade lifecycle and
//! topology role into one [`AppState`], and decides which rule set receives
//! each semantic event. Rule actions come back as [`Message::ConnRule`] and
//! are executed in [`actions`].

mod actions;
mod events;
mod state;

use std::fmt;

use strum::IntoEnumIterator;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

pub use events::{AppRequest, AudioEvent, PeerEvent};
pub use state::{AppState, AppTimer, Phase, PhyState, Role, Substate, core_phase};

use crate::bdaddr::{BdAddr, Transport};
use crate::collaborators::{DisconnectReason, Platform};
use crate::config::EarbudConfig;
use crate::error::RuleEngineError;
use crate::handset_service::{HandsetMessage, HandsetRequest, HandsetStatus};
use crate::message::{ConditionalQueue, Message, Outbox, StateChange, TaskId, TimerQueue};
use crate::peer_signalling::{PeerSigMessage, PeerSigRequest, PeerSigStatus};
use crate::profiles::{Profile, ProfileMask};
use crate::rules::{
    AppSnapshot, Condition, ConnRuleAction, ConnRuleEvent, ConnRuleSet, DfuGoal, DfuRuleEvent,
    DfuRuleSet, PostConnectAction, RuleContext, RuleEventId, RuleEvents, RuleSet, dfu_rule_set,
    primary_rule_set, secondary_rule_set,
};

/// Waiting for peer signalling to disconnect.
const LOCK_PEER: u16 = 1 << 0;
/// Waiting for the handset service to disconnect.
const LOCK_HANDSET: u16 = 1 << 1;

/// Work to do once a link disconnection has finished.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum PostDisconnect {
    None,
    HandsetPairing,
    DeleteHandsets,
    Handover { play_media: bool },
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Links {
    All,
    Handset,
}

#[derive(Debug, Clone, Copy, Default)]
struct AudioFlags {
    a2dp_streaming: bool,
    sco_active: bool,
    call_active: bool,
    scofwd_sending: bool,
    hfp_ag_addr: Option<BdAddr>,
}

/// A handset connect waiting for its confirmation.
#[derive(Debug, Clone, Copy)]
struct PendingConnect {
    /// `None` when no handset was known at request time.
    addr: Option<BdAddr>,
    action: ConnRuleAction,
    post: PostConnectAction,
}

#[derive(Debug)]
pub struct AppSm {
    config: EarbudConfig,
    state: AppState,
    role: Role,
    phy: PhyState,
    primary: ConnRuleSet,
    secondary: ConnRuleSet,
    dfu: DfuRuleSet,
    /// Events raised before a role was assigned.
    held_events: RuleEvents,
    audio: AudioFlags,
    ble_advertising: bool,
    dfu_pending: bool,
    dfu_primary: bool,
    using_secondary_address: bool,
    topology_started: bool,
    peer_sig_connected: bool,
    pending_connects: Vec<PendingConnect>,
    disconnect_queue: ConditionalQueue<PostDisconnect>,
    timers: TimerQueue<AppTimer>,
    outbox: Outbox<Message>,
    transitions: Vec<StateChange>,
}

impl AppSm {
    /// Builds the state machine and its three rule sets.
    ///
    /// # Errors
    ///
    /// Returns [`RuleEngineError`] if one of the rule tables is malformed.
    pub fn new(config: EarbudConfig) -> Result<Self, RuleEngineError> {
        let mut primary = primary_rule_set()?;
        primary.register_nop_client(TaskId::Topology);

        Ok(Self {
            config,
            state: AppState::default(),
            role: Role::None,
            phy: PhyState::Unknown,
            primary,
            secondary: secondary_rule_set()?,
            dfu: dfu_rule_set()?,
            held_events: RuleEvents::EMPTY,
            audio: AudioFlags::default(),
            ble_advertising: false,
            dfu_pending: false,
            dfu_primary: false,
            using_secondary_address: false,
            topology_started: false,
            peer_sig_connected: false,
            pending_connects: Vec::new(),
            disconnect_queue: ConditionalQueue::new(),
            timers: TimerQueue::new(),
            outbox: Outbox::new(),
            transitions: Vec::new(),
        })
    }

    #[must_use]
    pub fn state(&self) -> AppState {
        self.state
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn phy_state(&self) -> PhyState {
        self.phy
    }

    /// Events pending on the rule set of the current role.
    #[must_use]
    pub fn pending_events(&self) -> RuleEvents {
        match self.role {
            Role::None => self.held_events,
            Role::Primary => self.primary.events(),
            Role::Secondary => self.secondary.events(),
            Role::Dfu => from_dfu_events(self.dfu.events()),
        }
    }

    /// The facts rule conditions see on the next pass.
    #[must_use]
    pub fn snapshot(&self) -> AppSnapshot {
        AppSnapshot {
            in_case: self.state.is_in_case(),
            out_of_case: self.state.is_out_of_case(),
            in_ear: self.state.is_in_ear(),
            pairing: matches!(self.state.phase, Phase::PeerPairing | Phase::HandsetPairing),
            role: self.role,
            dfu_pending: self.dfu_pending,
            in_dfu_mode: self.state.phase == Phase::InCaseDfu,
            dfu_primary: self.dfu_primary,
            connectable: self.state.is_connectable(),
            ble_connectable: self
                .state
                .is_ble_connectable(self.config.features.ble_allowed_out_of_case),
            ble_advertising: self.ble_advertising,
            a2dp_restart_pending: self.timers.is_running(AppTimer::A2dpRestart),
            a2dp_streaming: self.audio.a2dp_streaming,
            sco_active: self.audio.sco_active,
            call_active: self.audio.call_active,
            scofwd_sending: self.audio.scofwd_sending,
            hfp_ag_addr: self.audio.hfp_ag_addr,
            using_secondary_address: self.using_secondary_address,
        }
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

    /// Registers with the peer link and handset service and starts
    /// initialising.
    pub fn init(&mut self, platform: &mut dyn Platform) {
        let task = TaskId::AppSm;
        for request in [
            PeerSigRequest::ClientRegister { task },
            PeerSigRequest::RegisterLinkKeyTask { task },
            PeerSigRequest::RegisterHandsetCommandsTask { task },
        ] {
            self.outbox
                .send(TaskId::PeerSignalling, Message::PeerSigRequest(request));
        }
        self.outbox.send(
            TaskId::HandsetService,
            Message::HandsetRequest(HandsetRequest::ClientRegister { task }),
        );
        self.set_state(platform, Phase::Initialising.into());
    }

    /// Every component has finished initialising.
    pub fn init_cfm(&mut self, platform: &mut dyn Platform) {
        self.raise(platform, ConnRuleEvent::CheckDfu.mask());
        match self.state.phase {
            Phase::Initialising => {
                self.set_state(platform, Phase::DfuCheck.into());
                self.set_state(platform, Phase::Startup.into());
            }
            Phase::InCaseDfu | Phase::Terminating => {
                debug!(state = %self.state, "initialisation confirmed late");
            }
            _ => warn!(state = %self.state, "unexpected initialisation confirmation"),
        }
        self.pump_disconnects(platform);
    }

    /// Topology has picked its first role.
    pub fn topology_started(&mut self, platform: &mut dyn Platform, role: Role) {
        if self.state.phase != Phase::Startup {
            warn!(state = %self.state, "topology started outside startup");
            return;
        }
        self.topology_started = true;
        self.set_role(platform, role);
        self.raise(platform, ConnRuleEvent::Startup.mask());
        if platform.is_paired_with_peer() {
            self.set_initial_core_state(platform);
        }
        self.pump_disconnects(platform);
    }

    /// Switches the rule set that receives events, carrying the pending
    /// events across.
    #[instrument(skip(self, platform), level = "debug", fields(from = %self.role))]
    pub fn set_role(&mut self, platform: &mut dyn Platform, role: Role) {
        let old = self.role;
        if old == role {
            return;
        }
        if role == Role::None && self.state.phase == Phase::InCaseDfu {
            debug!("keeping the upgrade role while in dfu mode");
            return;
        }

        let pending = match old {
            Role::None => std::mem::take(&mut self.held_events),
            Role::Primary => take_events(&mut self.primary),
            Role::Secondary => take_events(&mut self.secondary),
            Role::Dfu => from_dfu_events(take_events(&mut self.dfu)),
        };
        info!(from = %old, to = %role, pending = ?pending.names::<ConnRuleEvent>(), "role");
        self.role = role;

        match role {
            Role::None => {
                debug!("no role, pending events dropped");
                return;
            }
            Role::Primary => self.using_secondary_address = false,
            Role::Secondary => self.using_secondary_address = true,
            Role::Dfu => self.dfu_primary = old == Role::Primary,
        }

        self.raise(platform, pending);
        let mut events = ConnRuleEvent::RoleSwitch.mask();
        if !matches!(self.phy, PhyState::InCase | PhyState::Unknown) {
            events |= ConnRuleEvent::OutCase.mask();
        }
        self.raise(platform, events);

        // A Secondary never pairs handsets.
        if old == Role::Primary && role == Role::Secondary && self.state.phase == Phase::HandsetPairing
        {
            self.set_core_state(platform);
        }
        self.pump_disconnects(platform);
    }

    pub fn phy_state_changed(&mut self, platform: &mut dyn Platform, phy: PhyState) {
        info!(from = %self.phy, to = %phy, state = %self.state, "physical state");
        self.phy = phy;
        if phy == PhyState::InCase {
            self.raise(platform, ConnRuleEvent::CheckDfu.mask());
        }

        if self.state.phase == Phase::InCaseDfu && phy != PhyState::InCase {
            info!("left the case during dfu mode");
            self.dfu_ended(platform, true);
        } else if self.state.is_core()
            || (self.state.phase == Phase::HandsetPairing && phy == PhyState::InCase)
        {
            self.set_core_state(platform);
        }
        self.pump_disconnects(platform);
    }

    pub fn acl_connected(&mut self, platform: &mut dyn Platform, addr: BdAddr, transport: Transport) {
        if transport != Transport::BrEdr || platform.peer_addr() == Some(addr) {
            return;
        }
        self.raise(platform, ConnRuleEvent::CheckDfu.mask());
        if platform.is_handset(addr) {
            self.raise_dfu(platform, DfuRuleEvent::HandsetConnectedBredr);
        }
    }

    pub fn acl_disconnected(
        &mut self,
        platform: &mut dyn Platform,
        addr: BdAddr,
        transport: Transport,
        reason: DisconnectReason,
    ) {
        if transport != Transport::BrEdr {
            return;
        }
        if platform.peer_addr() == Some(addr) {
            self.disconnect_queue.clear_lock(LOCK_PEER);
            if reason == DisconnectReason::LinkLoss {
                info!(%addr, "peer link loss");
                self.raise(platform, ConnRuleEvent::PeerLinkLoss.mask());
            }
        } else if platform.is_handset(addr) {
            self.disconnect_queue.clear_lock(LOCK_HANDSET);
            if reason == DisconnectReason::LinkLoss {
                info!(%addr, "handset link loss");
                self.raise(platform, ConnRuleEvent::HandsetLinkLoss.mask());
            }
            self.raise_dfu(platform, DfuRuleEvent::HandsetDisconnectedBredr);
        }
        self.pump_disconnects(platform);
    }

    pub fn profile_connected(&mut self, platform: &mut dyn Platform, addr: BdAddr, profile: Profile) {
        if !platform.is_handset(addr) {
            return;
        }
        if let Some((connected, disconnected)) = handset_profile_events(profile) {
            self.replace_event(platform, disconnected, connected);
        }
    }

    pub fn profile_disconnected(
        &mut self,
        platform: &mut dyn Platform,
        addr: BdAddr,
        profile: Profile,
    ) {
        if !platform.is_handset(addr) {
            return;
        }
        if let Some((connected, disconnected)) = handset_profile_events(profile) {
            self.replace_event(platform, connected, disconnected);
        }
        self.pump_disconnects(platform);
    }

    /// Handles a message routed to [`TaskId::AppSm`].
    #[instrument(skip_all, level = "debug", fields(state = %self.state))]
    pub fn handle_message(&mut self, platform: &mut dyn Platform, message: Message) {
        match message {
            Message::ConnRule(rule) => self.run_action(platform, rule),
            Message::PeerSig(message) => self.peer_sig_message(platform, message),
            Message::Handset(message) => self.handset_message(platform, message),
            other => debug!(?other, "message ignored"),
        }
        self.pump_disconnects(platform);
    }

    pub fn peer_event(&mut self, platform: &mut dyn Platform, event: PeerEvent) {
        use ConnRuleEvent as E;

        debug!(%event, "peer event");
        match event {
            PeerEvent::InCase => self.replace_event(platform, E::PeerOutCase, E::PeerInCase),
            PeerEvent::OutOfCase => self.replace_event(platform, E::PeerInCase, E::PeerOutCase),
            PeerEvent::InEar => self.replace_event(platform, E::PeerOutEar, E::PeerInEar),
            PeerEvent::OutOfEar => self.replace_event(platform, E::PeerInEar, E::PeerOutEar),
            PeerEvent::HandsetProfile { profile, connected } => {
                let mut others = platform.peer_handset_profiles() & ProfileMask::HANDSET;
                others.remove(ProfileMask::of(profile));
                if !others.is_empty() {
                    trace!(%others, "peer handset still has profiles");
                } else if connected {
                    self.replace_event(platform, E::PeerHandsetDisconnected, E::PeerHandsetConnected);
                } else {
                    self.replace_event(platform, E::PeerHandsetConnected, E::PeerHandsetDisconnected);
                }
            }
            PeerEvent::ProfileSupported { profile } => {
                let event = match profile {
                    Profile::A2dp => E::PeerA2dpSupported,
                    Profile::Avrcp => E::PeerAvrcpSupported,
                    Profile::Hfp => E::PeerHfpSupported,
                    other => {
                        trace!(profile = %other, "not a handset profile");
                        return;
                    }
                };
                self.raise(platform, event.mask());
            }
            PeerEvent::HandsetLinkLoss => self.raise(platform, E::PeerHandsetLinkLoss.mask()),
            PeerEvent::Pairing { active: true } => self.raise(platform, E::PeerPairing.mask()),
            PeerEvent::Pairing { active: false } => self.reset(E::PeerPairing.mask()),
            PeerEvent::Sync => self.replace_event(platform, E::PeerSync, E::PeerSync),
            PeerEvent::LinkKeysUpdated => {
                self.replace_event(platform, E::PeerUpdateLinkkeys, E::PeerUpdateLinkkeys);
            }
        }
        self.pump_disconnects(platform);
    }

    pub fn audio_event(&mut self, platform: &mut dyn Platform, event: AudioEvent) {
        debug!(%event, "audio event");
        match event {
            AudioEvent::A2dpStreaming { active } => self.audio.a2dp_streaming = active,
            AudioEvent::ScoConnected { .. } => {
                self.audio.sco_active = true;
                self.raise(platform, ConnRuleEvent::ScoActive.mask());
            }
            AudioEvent::ScoDisconnected => {
                self.audio.sco_active = false;
                self.reset(ConnRuleEvent::ScoActive.mask());
            }
            AudioEvent::Call { active } => self.audio.call_active = active,
            AudioEvent::ScoForwarding { sending } => self.audio.scofwd_sending = sending,
            AudioEvent::HfpAudioGateway { addr } => self.audio.hfp_ag_addr = addr,
            AudioEvent::A2dpContext { .. } | AudioEvent::HfpVolume { .. } => {}
        }
        if self.state.is_core() {
            self.set_core_state(platform);
        }
        self.pump_disconnects(platform);
    }

    #[instrument(skip(self, platform), level = "debug", fields(state = %self.state))]
    pub fn app_request(&mut self, platform: &mut dyn Platform, request: AppRequest) {
        info!(%request, "app request");
        match request {
            AppRequest::PairHandset => self.start_handset_pairing(platform),
            AppRequest::DeleteHandsets => {
                if self.state.phase.is_idle() && self.state.substate == Substate::None {
                    self.set_state(platform, self.state.with_substate(Substate::Disconnecting));
                    self.disconnect_links(platform, Links::Handset, PostDisconnect::DeleteHandsets);
                } else {
                    debug!("not idle, handsets kept");
                }
            }
            AppRequest::FactoryReset => {
                if self.state.phase >= Phase::Startup
                    && self.state.phase != Phase::Terminating
                    && !self.state.substate.is_terminating()
                {
                    self.set_state(platform, Phase::FactoryReset.into());
                } else {
                    debug!("factory reset not possible now");
                }
            }
            AppRequest::Connect => {
                use ConnRuleEvent as E;
                self.replace_event(platform, E::UserConnect, E::UserConnect);
            }
            AppRequest::PowerOff | AppRequest::BatteryLow => self.shutdown(platform),
            AppRequest::ShutdownCancelled => {
                if self.state.phase == Phase::Terminating || self.state.substate.is_terminating() {
                    self.set_state(platform, Phase::Startup.into());
                    self.resume_from_startup(platform);
                }
            }
            AppRequest::SleepPrepare => {
                if self.state.is_sleepy() && self.state.substate == Substate::None {
                    self.set_state(
                        platform,
                        self.state.with_substate(Substate::SoporificTerminating),
                    );
                } else {
                    debug!("not soporific, sleep refused");
                }
            }
            AppRequest::SleepCancelled => {
                if self.state.is_sleepy() {
                    self.set_core_state(platform);
                }
            }
            AppRequest::PeerPairingComplete { success } => {
                if self.state.phase != Phase::PeerPairing {
                    debug!("not peer pairing");
                } else if success {
                    self.set_initial_core_state(platform);
                } else {
                    warn!("peer pairing failed, retrying");
                    self.set_state(platform, Phase::Startup.into());
                    self.raise(platform, ConnRuleEvent::Startup.mask());
                }
            }
            AppRequest::HandsetPairingComplete { success } => {
                if self.state.phase == Phase::HandsetPairing {
                    debug!(success, "handset pairing finished");
                    self.set_core_state(platform);
                }
            }
            AppRequest::Handover => {
                use ConnRuleEvent as E;
                self.replace_event(platform, E::HandoverDisconnect, E::HandoverDisconnect);
            }
            AppRequest::DfuRequest => {
                self.dfu_pending = true;
                self.raise(platform, ConnRuleEvent::CheckDfu.mask());
                if self.state.phase == Phase::InCaseIdle {
                    self.enter_dfu(platform);
                }
            }
            AppRequest::DfuEnded { error } => self.dfu_ended(platform, error),
            AppRequest::BleAdvertising { active } => self.ble_advertising = active,
        }
        self.pump_disconnects(platform);
    }

    /// Marks a DFU goal complete once topology has reached it.
    pub fn dfu_goal_complete(&mut self, platform: &mut dyn Platform, goal: DfuGoal) {
        let app = self.snapshot();
        let ctx = RuleContext {
            platform,
            app: &app,
            config: &self.config,
        };
        self.dfu
            .set_rule_complete(goal, |condition: &Condition| condition(&ctx));
        self.collect_deliveries();
    }

    /// Raises a DFU topology event. Only the DFU role listens.
    pub fn raise_dfu(&mut self, platform: &dyn Platform, event: DfuRuleEvent) {
        if self.role != Role::Dfu {
            trace!(%event, "not in the dfu role");
            return;
        }
        match event {
            DfuRuleEvent::RoleSelectedPrimary => self.dfu_primary = true,
            DfuRuleEvent::RoleSelectedSecondary => self.dfu_primary = false,
            _ => {}
        }
        let app = self.snapshot();
        let ctx = RuleContext {
            platform,
            app: &app,
            config: &self.config,
        };
        self.dfu.set_event(TaskId::Topology, event.mask(), |condition: &Condition| {
            condition(&ctx)
        });
        self.collect_deliveries();
    }

    /// Fires every timer due at `now`.
    pub fn fire_due_timers(&mut self, platform: &mut dyn Platform, now: Instant) {
        for timer in self.timers.pop_expired(now) {
            debug!(%timer, state = %self.state, "app timer");
            match timer {
                AppTimer::A2dpPause => {
                    if !self.state.is_in_ear() && !platform.is_peer_in_ear() {
                        platform.media_pause();
                        self.timers
                            .start(AppTimer::A2dpRestart, self.config.app.a2dp_in_ear_restart_window);
                    }
                }
                AppTimer::A2dpRestart => debug!("media restart window closed"),
                AppTimer::ScoTransfer => {
                    if !self.state.is_in_ear()
                        && (!self.audio.scofwd_sending || !platform.is_peer_in_ear())
                    {
                        platform.transfer_sco(false);
                    }
                }
                AppTimer::DfuTimeout => self.dfu_ended(platform, true),
                AppTimer::DisconnectWatchdog => self.disconnect_timed_out(platform),
                AppTimer::Idle => {
                    if self.state == AppState::new(Phase::OutOfCaseIdle) {
                        self.set_state(platform, Phase::OutOfCaseSoporific.into());
                    }
                }
            }
        }
        self.pump_disconnects(platform);
    }

    fn peer_sig_message(&mut self, platform: &mut dyn Platform, message: PeerSigMessage) {
        use ConnRuleEvent as E;

        match message {
            PeerSigMessage::ConnectionInd { status } => {
                let connected = status == PeerSigStatus::Connected;
                debug!(%status, "peer signalling connection");
                self.peer_sig_connected = connected;
                if connected {
                    self.replace_event(platform, E::PeerDisconnected, E::PeerConnected);
                } else {
                    self.disconnect_queue.clear_lock(LOCK_PEER);
                    self.replace_event(platform, E::PeerConnected, E::PeerDisconnected);
                }
            }
            PeerSigMessage::DisconnectCfm { .. } => self.disconnect_queue.clear_lock(LOCK_PEER),
            PeerSigMessage::PairHandsetInd { addr } => {
                if platform.is_handset(addr) && platform.is_connected(addr) {
                    debug!(%addr, "peer asked to pair a handset already connected");
                    return;
                }
                if platform.is_handset(addr) {
                    platform.delete_device(addr);
                }
                self.start_handset_pairing(platform);
            }
            PeerSigMessage::ConnectHandsetInd { play_media } => {
                let event = if play_media {
                    E::HandoverReconnectAndPlay
                } else {
                    E::HandoverReconnect
                };
                self.replace_event(platform, event, event);
            }
            PeerSigMessage::AddLinkKeyInd { addr, key, .. } => {
                info!(%addr, "handset link key from peer");
                platform.store_link_key(addr, key);
                self.raise(platform, E::RxHandsetLinkkey.mask());
            }
            PeerSigMessage::LinkKeyTxCfm { status, addr } if status != PeerSigStatus::Success => {
                warn!(%addr, %status, "link key not delivered to peer");
            }
            other => trace!(?other, "peer signalling message ignored"),
        }
    }

    fn handset_message(&mut self, platform: &mut dyn Platform, message: HandsetMessage) {
        match message {
            HandsetMessage::ConnectCfm { addr, status } => {
                let target = (!addr.is_zero()).then_some(addr);
                let (done, waiting): (Vec<_>, Vec<_>) = self
                    .pending_connects
                    .drain(..)
                    .partition(|pending| pending.addr == target);
                self.pending_connects = waiting;
                debug!(%addr, %status, completed = done.len(), "handset connect finished");

                let play = done
                    .iter()
                    .any(|pending| pending.post == PostConnectAction::PlayMedia);
                for pending in done {
                    self.complete(platform, pending.action);
                }
                if play && status == HandsetStatus::Success {
                    platform.media_play();
                }
            }
            HandsetMessage::DisconnectCfm { .. } => {
                self.disconnect_queue.clear_lock(LOCK_HANDSET);
            }
            other => trace!(?other, "handset message ignored"),
        }
    }

    /// Raises `events` on the rule set of the current role.
    fn raise(&mut self, platform: &dyn Platform, events: RuleEvents) {
        if events.is_empty() {
            return;
        }
        let app = self.snapshot();
        let ctx = RuleContext {
            platform,
            app: &app,
            config: &self.config,
        };
        let eval = |condition: &Condition| condition(&ctx);
        match self.role {
            Role::None => {
                debug!(events = ?events.names::<ConnRuleEvent>(), "no role yet, holding events");
                self.held_events |= events;
            }
            Role::Primary => self.primary.set_event(TaskId::AppSm, events, eval),
            Role::Secondary => self.secondary.set_event(TaskId::AppSm, events, eval),
            Role::Dfu => {
                let mapped = to_dfu_events(events);
                if mapped.is_empty() {
                    trace!(events = ?events.names::<ConnRuleEvent>(), "no dfu counterpart");
                } else {
                    self.dfu.set_event(TaskId::Topology, mapped, eval);
                }
            }
        }
        self.collect_deliveries();
    }

    fn reset(&mut self, events: RuleEvents) {
        self.held_events.remove(events);
        match self.role {
            Role::None => {}
            Role::Primary => self.primary.reset_event(events),
            Role::Secondary => self.secondary.reset_event(events),
            Role::Dfu => {
                let mapped = to_dfu_events(events);
                if !mapped.is_empty() {
                    self.dfu.reset_event(mapped);
                }
            }
        }
    }

    fn replace_event(&mut self, platform: &dyn Platform, clear: ConnRuleEvent, set: ConnRuleEvent) {
        self.reset(clear.mask());
        self.raise(platform, set.mask());
    }

    /// Reports `action` finished to the active connection rule set.
    fn complete(&mut self, platform: &dyn Platform, action: ConnRuleAction) {
        let app = self.snapshot();
        let ctx = RuleContext {
            platform,
            app: &app,
            config: &self.config,
        };
        let eval = |condition: &Condition| condition(&ctx);
        match self.role {
            Role::Primary => self.primary.set_rule_complete(action, eval),
            Role::Secondary => self.secondary.set_rule_complete(action, eval),
            Role::None | Role::Dfu => {
                debug!(%action, role = %self.role, "no connection rule set to complete");
            }
        }
        self.collect_deliveries();
    }

    fn collect_deliveries(&mut self) {
        let conn = self
            .primary
            .take_deliveries()
            .into_iter()
            .chain(self.secondary.take_deliveries());
        for (task, message) in conn {
            self.outbox.send(task, Message::ConnRule(message));
        }
        for (task, message) in self.dfu.take_deliveries() {
            self.outbox.send(task, Message::DfuRule(message));
        }
    }

    #[instrument(skip_all, level = "debug", fields(from = %self.state, to = %new))]
    fn set_state(&mut self, platform: &mut dyn Platform, new: AppState) {
        use ConnRuleEvent as E;

        let old = self.state;
        if old.phase == Phase::FactoryReset {
            warn!(to = %new, "factory reset in progress, state change dropped");
            return;
        }
        assert_ne!(old, new, "re-entering app state {new}");
        info!(from = %old, to = %new, "app state");

        if old.phase != new.phase {
            self.exit_phase(platform, old.phase);
        }
        // Parent exits clear their event now and raise the opposite one once
        // the new state is visible to the rules.
        let mut left = RuleEvents::EMPTY;
        if old.is_in_case() && !new.is_in_case() {
            self.reset(E::InCase.mask());
            left |= E::OutCase.mask();
        }
        if old.is_in_ear() && !new.is_in_ear() {
            self.reset(E::InEar.mask());
            left |= E::OutEar.mask();
        }

        self.state = new;
        self.transitions
            .push(StateChange::new(TaskId::AppSm, old, new));
        self.raise(platform, left);

        if old.is_connectable() != new.is_connectable() {
            self.raise(platform, E::PageScanUpdate.mask());
        }
        let ble_allowed = self.config.features.ble_allowed_out_of_case;
        if old.is_ble_connectable(ble_allowed) != new.is_ble_connectable(ble_allowed) {
            self.raise(platform, E::BleConnectableChange.mask());
        }

        if !old.is_in_case() && new.is_in_case() {
            self.replace_event(platform, E::OutCase, E::InCase);
        }
        if !old.is_in_ear() && new.is_in_ear() {
            self.replace_event(platform, E::OutEar, E::InEar);
        }

        if old.substate != new.substate {
            self.enter_substate(platform, new.substate);
        }
        if old.phase != new.phase {
            self.enter_phase(platform, new.phase);
        }
    }

    fn exit_phase(&mut self, platform: &mut dyn Platform, phase: Phase) {
        match phase {
            Phase::PeerPairing => self.complete(platform, ConnRuleAction::PeerPair),
            Phase::HandsetPairing => self.complete(platform, ConnRuleAction::HandsetPair),
            Phase::InCaseDfu => {
                self.timers.cancel(AppTimer::DfuTimeout);
            }
            Phase::OutOfCaseIdle => {
                self.timers.cancel(AppTimer::Idle);
            }
            _ => {}
        }
    }

    fn enter_substate(&mut self, platform: &mut dyn Platform, substate: Substate) {
        match substate {
            Substate::Terminating | Substate::SoporificTerminating => {
                self.disconnect_links(platform, Links::All, PostDisconnect::None);
            }
            Substate::None | Substate::Disconnecting => {}
        }
    }

    fn enter_phase(&mut self, platform: &mut dyn Platform, phase: Phase) {
        match phase {
            Phase::PeerPairing => platform.start_peer_pairing(),
            Phase::HandsetPairing => {
                self.disconnect_links(platform, Links::Handset, PostDisconnect::HandsetPairing);
            }
            Phase::InCaseDfu => self.dfu_pending = false,
            Phase::OutOfCaseIdle => {
                self.timers
                    .start(AppTimer::Idle, self.config.app.sleep_after_idle);
            }
            Phase::FactoryReset => self.disconnect_links(platform, Links::All, PostDisconnect::None),
            Phase::Terminating => platform.shutdown_complete(),
            _ => {}
        }
    }

    /// Moves to the core state for the current position and audio activity.
    fn set_core_state(&mut self, platform: &mut dyn Platform) {
        let busy = self.audio.a2dp_streaming || self.audio.sco_active;
        let target = AppState::new(core_phase(self.phy, busy));
        if target != self.state {
            self.set_state(platform, target);
        }
    }

    /// Leaves startup or peer pairing, raising the position events first.
    fn set_initial_core_state(&mut self, platform: &mut dyn Platform) {
        use ConnRuleEvent as E;

        let events = match self.phy {
            PhyState::Unknown | PhyState::InCase => E::InCase.mask(),
            PhyState::OutOfEar | PhyState::OutOfEarAtRest => E::OutCase.mask() | E::OutEar.mask(),
            PhyState::InEar => E::OutCase.mask() | E::InEar.mask(),
        };
        self.raise(platform, events);
        self.set_core_state(platform);
    }

    fn resume_from_startup(&mut self, platform: &mut dyn Platform) {
        if self.topology_started && platform.is_paired_with_peer() {
            self.set_initial_core_state(platform);
        } else {
            debug!("waiting in startup");
        }
    }

    fn start_handset_pairing(&mut self, platform: &mut dyn Platform) {
        if self.state.phase.is_idle()
            && self.state.substate == Substate::None
            && self.role.is_primary()
        {
            self.set_state(platform, Phase::HandsetPairing.into());
        } else {
            debug!(state = %self.state, role = %self.role, "handset pairing refused");
        }
    }

    fn shutdown(&mut self, platform: &mut dyn Platform) {
        let state = self.state;
        if state.phase == Phase::FactoryReset
            || state.phase == Phase::Terminating
            || state.substate.is_terminating()
        {
            debug!("already shutting down");
        } else if state.phase < Phase::Startup {
            self.set_state(platform, Phase::Terminating.into());
        } else {
            self.set_state(platform, state.with_substate(Substate::Terminating));
        }
    }

    fn enter_dfu(&mut self, platform: &mut dyn Platform) {
        if !matches!(self.state.phase, Phase::InCaseIdle | Phase::InCaseDfu)
            || self.state.substate != Substate::None
        {
            debug!(state = %self.state, "dfu mode needs the case");
            return;
        }
        self.timers
            .start(AppTimer::DfuTimeout, self.config.app.dfu_timeout_in_case);
        platform.enter_dfu_mode();
        if self.state.phase != Phase::InCaseDfu {
            self.set_state(platform, Phase::InCaseDfu.into());
        }
        self.raise(platform, ConnRuleEvent::DfuConnect.mask());
    }

    fn dfu_ended(&mut self, platform: &mut dyn Platform, error: bool) {
        if self.state.phase != Phase::InCaseDfu {
            debug!(error, "not in dfu mode");
            return;
        }
        if error {
            warn!("dfu mode ended without an upgrade");
        } else {
            info!("dfu mode ended");
        }
        self.set_state(platform, Phase::Startup.into());
        self.resume_from_startup(platform);
    }

    fn handset_connected(platform: &dyn Platform) -> Option<BdAddr> {
        platform.handset_addr().filter(|addr| {
            platform.is_connected(*addr) || !platform.connected_profiles(*addr).is_empty()
        })
    }

    /// Starts disconnecting `links`; `post` runs once both locks clear.
    fn disconnect_links(&mut self, platform: &mut dyn Platform, links: Links, post: PostDisconnect) {
        let mut lock = 0;
        if let Some(addr) = Self::handset_connected(platform) {
            self.outbox.send(
                TaskId::HandsetService,
                Message::HandsetRequest(HandsetRequest::Disconnect {
                    task: TaskId::AppSm,
                    addr,
                }),
            );
            lock |= LOCK_HANDSET;
        }
        if links == Links::All && (self.peer_sig_connected || platform.is_peer_connected()) {
            self.outbox.send(
                TaskId::PeerSignalling,
                Message::PeerSigRequest(PeerSigRequest::Shutdown {
                    task: TaskId::AppSm,
                }),
            );
            lock |= LOCK_PEER;
        }
        debug!(?links, ?post, lock, "disconnecting links");
        self.disconnect_queue.set_lock(lock);
        self.disconnect_queue.push(post);
        self.timers
            .start(AppTimer::DisconnectWatchdog, self.config.app.disconnect_watchdog);
    }

    fn disconnect_timed_out(&mut self, platform: &mut dyn Platform) {
        warn!(lock = self.disconnect_queue.lock(), "links still up, forcing disconnect");
        platform.force_disconnect_all();
        if !platform.is_peer_connected() {
            self.disconnect_queue.clear_lock(LOCK_PEER);
        }
        if Self::handset_connected(platform).is_none() {
            self.disconnect_queue.clear_lock(LOCK_HANDSET);
        }
        if self.disconnect_queue.is_locked() {
            self.timers
                .start(AppTimer::DisconnectWatchdog, self.config.app.disconnect_watchdog);
        }
    }

    fn pump_disconnects(&mut self, platform: &mut dyn Platform) {
        while let Some(post) = self.disconnect_queue.pop_ready() {
            if self.disconnect_queue.pending() == 0 {
                self.timers.cancel(AppTimer::DisconnectWatchdog);
            }
            self.links_disconnected(platform, post);
        }
    }

    fn links_disconnected(&mut self, platform: &mut dyn Platform, post: PostDisconnect) {
        debug!(?post, state = %self.state, "links disconnected");
        match post {
            PostDisconnect::None => {}
            PostDisconnect::HandsetPairing => platform.start_handset_pairing(),
            PostDisconnect::DeleteHandsets => {
                let peer = platform.peer_addr();
                for addr in platform.paired_devices() {
                    if Some(addr) != peer {
                        platform.delete_device(addr);
                    }
                }
            }
            PostDisconnect::Handover { play_media } => {
                self.outbox.send(
                    TaskId::PeerSignalling,
                    Message::PeerSigRequest(PeerSigRequest::ConnectHandset {
                        task: TaskId::AppSm,
                        play_media,
                    }),
                );
                self.complete(platform, ConnRuleAction::HandoverDisconnectHandset);
            }
        }

        if self.disconnect_queue.pending() > 0 {
            return;
        }
        match (self.state.phase, self.state.substate) {
            (Phase::FactoryReset, _) => {
                for addr in platform.paired_devices() {
                    platform.delete_device(addr);
                }
                platform.shutdown_complete();
            }
            (_, Substate::Terminating | Substate::SoporificTerminating) => {
                platform.shutdown_complete();
            }
            (_, Substate::Disconnecting) => self.set_core_state(platform),
            _ => {}
        }
    }
}

fn take_events<A>(set: &mut RuleSet<A, Condition>) -> RuleEvents
where
    A: Copy + Eq + fmt::Debug + fmt::Display,
{
    let events = set.events();
    set.reset_event(events);
    events
}

/// Connected and disconnected events for a handset profile.
fn handset_profile_events(profile: Profile) -> Option<(ConnRuleEvent, ConnRuleEvent)> {
    use ConnRuleEvent as E;

    match profile {
        Profile::A2dp => Some((E::HandsetA2dpConnected, E::HandsetA2dpDisconnected)),
        Profile::Avrcp => Some((E::HandsetAvrcpConnected, E::HandsetAvrcpDisconnected)),
        Profile::Hfp => Some((E::HandsetHfpConnected, E::HandsetHfpDisconnected)),
        _ => None,
    }
}

/// The DFU rule set's name for a connection event, if it has one.
fn dfu_event(event: ConnRuleEvent) -> Option<DfuRuleEvent> {
    use ConnRuleEvent as C;
    use DfuRuleEvent as D;

    let mapped = match event {
        C::Startup => D::Startup,
        C::InCase => D::InCase,
        C::OutCase => D::OutCase,
        C::PeerInCase => D::PeerInCase,
        C::PeerOutCase => D::PeerOutCase,
        C::RoleSwitch => D::RoleSwitch,
        C::PeerLinkLoss => D::PeerLinkloss,
        C::HandsetLinkLoss => D::HandsetLinkloss,
        C::PeerConnected => D::PeerConnectedBredr,
        C::PeerDisconnected => D::PeerDisconnectedBredr,
        C::HandsetA2dpConnected => D::HandsetConnectedA2dp,
        C::HandsetAvrcpConnected => D::HandsetConnectedAvrcp,
        C::HandsetHfpConnected => D::HandsetConnectedHfp,
        C::HandsetA2dpDisconnected => D::HandsetDisconnectedA2dp,
        C::HandsetAvrcpDisconnected => D::HandsetDisconnectedAvrcp,
        C::HandsetHfpDisconnected => D::HandsetDisconnectedHfp,
        _ => return None,
    };
    Some(mapped)
}

fn to_dfu_events(events: RuleEvents) -> RuleEvents {
    ConnRuleEvent::iter()
        .filter(|event| events.contains(event.mask()))
        .filter_map(dfu_event)
        .fold(RuleEvents::EMPTY, |mask, event| mask | event.mask())
}

fn from_dfu_events(events: RuleEvents) -> RuleEvents {
    ConnRuleEvent::iter()
        .filter(|event| dfu_event(*event).is_some_and(|dfu| events.contains(dfu.mask())))
        .fold(RuleEvents::EMPTY, |mask, event| mask | event.mask())
}
