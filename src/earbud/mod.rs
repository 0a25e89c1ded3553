//! Composition root: owns one instance of every component and routes the
//! messages they hand each other.
//!
//! Inputs are queued with [`Earbud::post`] and handled one at a time. After
//! each input every component outbox is drained and its messages delivered,
//! in order, until nothing is left to deliver. Messages for tasks outside the
//! core, and every state change, are published as [`Indication`]s.

mod input;
mod runtime;

use std::collections::VecDeque;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, instrument, trace, warn};

pub use input::Input;

use crate::app_sm::{AppSm, AudioEvent};
use crate::bdaddr::Transport;
use crate::collaborators::Platform;
use crate::config::EarbudConfig;
use crate::error::RuleEngineError;
use crate::handset_service::{HandsetRequest, HandsetService};
use crate::message::{Message, StateChange, TaskId};
use crate::peer_signalling::{PeerSigMessage, PeerSignalling};
use crate::shadow_profile::{ShadowIndication, ShadowProfile};

const INDICATION_CAPACITY: usize = 1024;

/// Something the core told the outside world.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Indication {
    /// A message for a task outside the core.
    Delivered { to: TaskId, message: Message },
    /// A rule set asked a component to act.
    Rule { to: TaskId, message: Message },
    Transition { change: StateChange },
}

/// The earbud coordination core wired to one platform.
#[derive(Debug)]
pub struct Earbud<P> {
    config: EarbudConfig,
    platform: P,
    app: AppSm,
    peer_sig: PeerSignalling,
    shadow: ShadowProfile,
    handsets: HandsetService,
    inputs: VecDeque<Input>,
    messages: VecDeque<(TaskId, Message)>,
    /// Components that have not yet confirmed initialisation.
    pending_inits: u8,
    indications: broadcast::Sender<Indication>,
}

impl<P: Platform> Earbud<P> {
    /// Builds every component. Nothing starts until [`Input::Init`] is
    /// handled.
    ///
    /// # Errors
    ///
    /// Returns [`RuleEngineError`] if a rule table fails to build.
    pub fn new(config: EarbudConfig, platform: P) -> Result<Self, RuleEngineError> {
        let (indications, _) = broadcast::channel(INDICATION_CAPACITY);
        Ok(Self {
            app: AppSm::new(config.clone())?,
            peer_sig: PeerSignalling::new(config.peer_signalling.clone()),
            shadow: ShadowProfile::new(config.shadow.clone()),
            handsets: HandsetService::new(config.handset_service.clone()),
            config,
            platform,
            inputs: VecDeque::new(),
            messages: VecDeque::new(),
            pending_inits: 0,
            indications,
        })
    }

    #[must_use]
    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    #[must_use]
    pub fn app(&self) -> &AppSm {
        &self.app
    }

    #[must_use]
    pub fn peer_signalling(&self) -> &PeerSignalling {
        &self.peer_sig
    }

    #[must_use]
    pub fn shadow(&self) -> &ShadowProfile {
        &self.shadow
    }

    #[must_use]
    pub fn handsets(&self) -> &HandsetService {
        &self.handsets
    }

    pub fn into_platform(self) -> P {
        self.platform
    }

    /// Subscribes to indications published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Indication> {
        self.indications.subscribe()
    }

    /// Indications published from now on, as a stream.
    #[must_use]
    pub fn indications(&self) -> BroadcastStream<Indication> {
        BroadcastStream::new(self.subscribe())
    }

    /// Queues an input. Nothing happens until [`Earbud::process_pending`].
    pub fn post(&mut self, input: Input) {
        self.inputs.push_back(input);
    }

    /// Handles every queued input, each to quiescence. Returns the number of
    /// inputs handled.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(input) = self.inputs.pop_front() {
            self.dispatch(input);
            self.settle();
            handled += 1;
        }
        handled
    }

    /// Earliest deadline across every component's timers.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.app.next_deadline(),
            self.peer_sig.next_deadline(),
            self.shadow.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fires every timer due at `now` and delivers the fallout.
    pub fn fire_due_timers(&mut self, now: Instant) {
        let platform = &mut self.platform;
        self.app.fire_due_timers(platform, now);
        self.peer_sig.fire_due_timers(platform, now);
        self.shadow.fire_due_timers(platform, now);
        self.settle();
    }

    #[instrument(skip_all, level = "debug", fields(input = %input))]
    fn dispatch(&mut self, input: Input) {
        let platform = &mut self.platform;
        match input {
            Input::Init => {
                info!("starting earbud core");
                self.pending_inits = 1;
                self.peer_sig.init(platform, TaskId::AppSm);
                if self.config.shadow.enabled {
                    self.pending_inits += 1;
                    self.shadow.init(platform, TaskId::AppSm);
                    self.messages.push_back((
                        TaskId::HandsetService,
                        Message::HandsetRequest(HandsetRequest::ClientRegister {
                            task: TaskId::ShadowProfile,
                        }),
                    ));
                }
                self.app.init(platform);
            }
            Input::TopologyStarted { role } => {
                self.shadow.set_role(platform, role);
                self.app.topology_started(platform, role);
            }
            Input::RoleChanged { role } => {
                self.shadow.set_role(platform, role);
                self.app.set_role(platform, role);
            }
            Input::DfuGoalComplete { goal } => self.app.dfu_goal_complete(platform, goal),
            Input::DfuEvent { event } => self.app.raise_dfu(&*platform, event),
            Input::PhyState { state } => self.app.phy_state_changed(platform, state),
            Input::Peer(event) => self.app.peer_event(platform, event),
            Input::Audio(event) => {
                match event {
                    AudioEvent::ScoConnected { params } => {
                        self.shadow.sco_changed(platform, true, Some(params));
                    }
                    AudioEvent::ScoDisconnected => self.shadow.sco_changed(platform, false, None),
                    AudioEvent::A2dpStreaming { active } => {
                        self.shadow.a2dp_streaming_changed(platform, active);
                    }
                    AudioEvent::A2dpContext { context } => self.shadow.a2dp_context(context),
                    AudioEvent::HfpVolume { volume } => self.shadow.hfp_volume_ind(volume),
                    AudioEvent::Call { .. }
                    | AudioEvent::ScoForwarding { .. }
                    | AudioEvent::HfpAudioGateway { .. } => {}
                }
                self.app.audio_event(platform, event);
            }
            Input::App(request) => self.app.app_request(platform, request),
            Input::AclConnected {
                addr, transport, ..
            } => {
                self.handsets.acl_connected(platform, addr, transport);
                self.app.acl_connected(platform, addr, transport);
            }
            Input::AclDisconnected {
                addr,
                transport,
                reason,
            } => {
                self.handsets.acl_disconnected(platform, addr, transport);
                self.app.acl_disconnected(platform, addr, transport, reason);
                if transport == Transport::BrEdr {
                    self.shadow.profile_state_changed(platform);
                }
            }
            Input::AclLockReleased { token } => {
                self.peer_sig.acl_lock_released(platform, token);
                self.handsets.acl_lock_released(platform, token);
            }
            Input::ProfileConnected { addr, profile } => {
                self.handsets.profile_connected(platform, addr, profile);
                self.app.profile_connected(platform, addr, profile);
                self.shadow.profile_state_changed(platform);
            }
            Input::ProfileDisconnected { addr, profile, .. } => {
                self.handsets.profile_disconnected(platform, addr, profile);
                self.app.profile_disconnected(platform, addr, profile);
                self.shadow.profile_state_changed(platform);
            }
            Input::ProfilesConnectCfm { addr, success } => {
                self.handsets.profiles_connect_cfm(platform, addr, success);
            }
            Input::ProfilesDisconnectCfm { addr, success } => {
                self.handsets.profiles_disconnect_cfm(platform, addr, success);
            }
            Input::PsmRegistered { psm } => self.peer_sig.psm_registered(platform, psm),
            Input::SdpRegistered { success } => self.peer_sig.sdp_registered(platform, success),
            Input::SdpSearchCfm { addr, result } => {
                self.peer_sig.sdp_search_cfm(platform, addr, result);
            }
            Input::L2capConnectInd {
                addr,
                identifier,
                psm,
            } => self.peer_sig.l2cap_connect_ind(platform, addr, identifier, psm),
            Input::L2capConnectCfm {
                addr,
                status,
                sink,
                remote_mtu,
            } => self
                .peer_sig
                .l2cap_connect_cfm(platform, addr, status, sink, remote_mtu),
            Input::L2capDisconnectInd { sink, reason } => {
                self.peer_sig.l2cap_disconnect_ind(platform, sink, reason);
            }
            Input::L2capDisconnectCfm { sink } => self.peer_sig.l2cap_disconnect_cfm(platform, sink),
            Input::SinkData { sink, data } => self.peer_sig.sink_data(platform, sink, &data),
            Input::SinkMoreSpace { sink } => self.peer_sig.sink_more_space(platform, sink),
            Input::Sdm(event) => self.shadow.sdm_event(platform, event),
            Input::PeerSigRequest(request) => self
                .messages
                .push_back((TaskId::PeerSignalling, Message::PeerSigRequest(request))),
            Input::HandsetRequest(request) => self
                .messages
                .push_back((TaskId::HandsetService, Message::HandsetRequest(request))),
            Input::ShadowClientRegister { task } => self.shadow.client_register(task),
        }
    }

    /// Delivers messages until every outbox is empty.
    fn settle(&mut self) {
        loop {
            self.collect();
            let Some((to, message)) = self.messages.pop_front() else {
                break;
            };
            self.route(to, message);
        }
    }

    fn collect(&mut self) {
        self.messages.extend(self.app.take_messages());
        self.messages.extend(self.peer_sig.take_messages());
        self.messages.extend(self.shadow.take_messages());
        self.messages.extend(self.handsets.take_messages());

        let changes = [
            self.app.take_transitions(),
            self.peer_sig.take_transitions(),
            self.shadow.take_transitions(),
            self.handsets.take_transitions(),
        ];
        for change in changes.into_iter().flatten() {
            self.publish(Indication::Transition { change });
        }
    }

    fn route(&mut self, to: TaskId, message: Message) {
        trace!(%to, ?message, "routing");
        if matches!(message, Message::ConnRule(_) | Message::DfuRule(_)) {
            self.publish(Indication::Rule {
                to,
                message: message.clone(),
            });
        }

        let platform = &mut self.platform;
        match (to, message) {
            (
                TaskId::AppSm,
                Message::PeerSig(PeerSigMessage::InitCfm) | Message::Shadow(ShadowIndication::InitCfm),
            ) => {
                self.pending_inits = self.pending_inits.saturating_sub(1);
                if self.pending_inits == 0 {
                    debug!("all components initialised");
                    self.app.init_cfm(platform);
                }
            }
            (TaskId::AppSm, message) => self.app.handle_message(platform, message),
            (TaskId::PeerSignalling, Message::PeerSigRequest(request)) => {
                self.peer_sig.request(platform, request);
            }
            (TaskId::HandsetService, Message::HandsetRequest(request)) => {
                self.handsets.request(platform, request);
            }
            (TaskId::ShadowProfile, message) => self.shadow.handle_message(platform, message),
            (TaskId::Topology | TaskId::Client(_), message) => {
                if !matches!(message, Message::ConnRule(_) | Message::DfuRule(_)) {
                    self.publish(Indication::Delivered { to, message });
                }
            }
            (to, message) => warn!(%to, ?message, "no handler for message"),
        }
    }

    fn publish(&self, indication: Indication) {
        if self.indications.send(indication).is_err() {
            trace!("no indication subscribers");
        }
    }
}
