//! The signalling channel to the peer earbud.
//!
//! One L2CAP channel to one peer carries three kinds of traffic: request and
//! response commands serialised one at a time, byte messages on numbered
//! channels, and marshalled typed messages with sink backpressure.
//!
//! Requests that cannot be handled in the current state wait in one of three
//! lock-gated queues. Startup requests wait while the state machine is in a
//! transitional state, commands also wait for the in-flight command to be
//! answered, and marshalled sends also wait for a pending retransmission.

mod messages;
mod state;
mod wire;

use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

use crate::bdaddr::{AddrType, BdAddr};
use crate::collaborators::{
    AclLockToken, DisconnectReason, L2capConnectStatus, Platform, SdpSearchResult, Sink,
};
use crate::config::PeerSignallingConfig;
use crate::message::{
    ConditionalQueue, Message, Outbox, StateChange, TaskId, TaskList, TimerQueue,
};

pub use messages::{ChannelMask, MarshalledMessage, PeerSigMessage, PeerSigRequest, PeerSigStatus};
pub use state::{PeerSigState, PeerSigTimer};
pub use wire::{Command, Frame, ResponseStatus, decode_marshalled};

const LOCK_FSM: u16 = 1 << 0;
const LOCK_OP: u16 = 1 << 1;
const LOCK_MARSHAL: u16 = 1 << 2;

const LINK_KEY_TYPE: u8 = 0;

/// A command waiting for the peer to answer.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum OpKind {
    LinkKey { addr: BdAddr },
    PairHandset { addr: BdAddr },
    MsgChannel { channel: ChannelMask },
    ConnectHandset,
}

#[derive(Debug, Clone)]
struct OpRequest {
    task: TaskId,
    kind: OpKind,
    command: Command,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    task: TaskId,
    kind: OpKind,
    opid: u16,
}

#[derive(Debug, Clone)]
struct MarshalRequest {
    task: TaskId,
    channel: ChannelMask,
    message: MarshalledMessage,
}

/// The peer link state machine.
#[derive(Debug)]
pub struct PeerSignalling {
    config: PeerSignallingConfig,
    state: PeerSigState,
    /// Zero when no peer is known for the current attempt.
    peer_addr: BdAddr,
    local_psm: u16,
    remote_psm: u16,
    sink: Option<Sink>,
    sdp_search_attempts: u8,
    pending_connects: u16,
    link_loss: bool,
    acl_wait: Option<(AclLockToken, BdAddr)>,
    acl_held: bool,
    next_opid: u16,
    init_task: Option<TaskId>,
    connect_tasks: TaskList,
    disconnect_tasks: TaskList,
    clients: TaskList,
    link_key_task: Option<TaskId>,
    handset_commands_task: Option<TaskId>,
    msg_channel_tasks: TaskList<ChannelMask>,
    marshal_tasks: TaskList<ChannelMask>,
    in_flight: Option<InFlight>,
    retx: Option<MarshalRequest>,
    startup_queue: ConditionalQueue<BdAddr>,
    op_queue: ConditionalQueue<OpRequest>,
    marshal_queue: ConditionalQueue<MarshalRequest>,
    timers: TimerQueue<PeerSigTimer>,
    outbox: Outbox<Message>,
    transitions: Vec<StateChange>,
}

impl PeerSignalling {
    /// Builds the component in the null state. Requests made before
    /// [`PeerSignalling::init`] completes wait for it.
    #[must_use]
    pub fn new(config: PeerSignallingConfig) -> Self {
        let mut peer_sig = Self {
            config,
            state: PeerSigState::Null,
            peer_addr: BdAddr::ZERO,
            local_psm: 0,
            remote_psm: 0,
            sink: None,
            sdp_search_attempts: 0,
            pending_connects: 0,
            link_loss: false,
            acl_wait: None,
            acl_held: false,
            next_opid: 1,
            init_task: None,
            connect_tasks: TaskList::new(),
            disconnect_tasks: TaskList::new(),
            clients: TaskList::new(),
            link_key_task: None,
            handset_commands_task: None,
            msg_channel_tasks: TaskList::new(),
            marshal_tasks: TaskList::new(),
            in_flight: None,
            retx: None,
            startup_queue: ConditionalQueue::new(),
            op_queue: ConditionalQueue::new(),
            marshal_queue: ConditionalQueue::new(),
            timers: TimerQueue::new(),
            outbox: Outbox::new(),
            transitions: Vec::new(),
        };
        peer_sig.apply_fsm_lock(true);
        peer_sig
    }

    #[must_use]
    pub fn state(&self) -> PeerSigState {
        self.state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == PeerSigState::Connected
    }

    /// Address of the peer currently being connected to or connected.
    #[must_use]
    pub fn peer_addr(&self) -> Option<BdAddr> {
        (!self.peer_addr.is_zero()).then_some(self.peer_addr)
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

    /// Registers the PSM and SDP record. `task` receives `InitCfm`.
    pub fn init(&mut self, platform: &mut dyn Platform, task: TaskId) {
        self.init_task = Some(task);
        self.set_state(platform, PeerSigState::Initialising);
    }

    /// Handles one API request from another task.
    #[instrument(skip(self, platform), level = "debug", fields(state = %self.state))]
    pub fn request(&mut self, platform: &mut dyn Platform, request: PeerSigRequest) {
        match request {
            PeerSigRequest::Startup { task, addr } => {
                self.cancel_shutdown();
                self.startup_queue.push(addr);
                self.connect_tasks.add(task);
            }
            PeerSigRequest::Shutdown { task } => {
                self.cancel_startup();
                self.disconnect_tasks.add(task);
                self.handle_shutdown(platform);
            }
            PeerSigRequest::LinkKeyTx { task, addr, key } => self.queue_op(OpRequest {
                task,
                kind: OpKind::LinkKey { addr },
                command: Command::AddLinkKey {
                    addr_type: AddrType::Public,
                    addr,
                    key_type: LINK_KEY_TYPE,
                    key,
                },
            }),
            PeerSigRequest::PairHandsetAddress { task, addr } => self.queue_op(OpRequest {
                task,
                kind: OpKind::PairHandset { addr },
                command: Command::PairHandsetAddress { addr },
            }),
            PeerSigRequest::MsgChannelTx {
                task,
                channel,
                data,
            } => self.queue_op(OpRequest {
                task,
                kind: OpKind::MsgChannel { channel },
                command: Command::MsgChannel { channel, data },
            }),
            PeerSigRequest::ConnectHandset { task, play_media } => self.queue_op(OpRequest {
                task,
                kind: OpKind::ConnectHandset,
                command: Command::ConnectHandset { play_media },
            }),
            PeerSigRequest::MarshalledTx {
                task,
                channel,
                message,
            } => {
                if self.is_connected() {
                    self.marshal_queue.push(MarshalRequest {
                        task,
                        channel,
                        message,
                    });
                } else {
                    self.send(
                        task,
                        PeerSigMessage::MarshalledMsgChannelTxCfm {
                            status: PeerSigStatus::MarshalledMsgChannelTxFail,
                            channel,
                        },
                    );
                }
            }
            PeerSigRequest::RegisterLinkKeyTask { task } => self.link_key_task = Some(task),
            PeerSigRequest::RegisterHandsetCommandsTask { task } => {
                self.handset_commands_task = Some(task);
            }
            PeerSigRequest::ClientRegister { task } => {
                self.clients.add(task);
            }
            PeerSigRequest::ClientUnregister { task } => {
                self.clients.remove(task);
            }
            PeerSigRequest::MsgChannelRegister { task, mask } => {
                match self.msg_channel_tasks.data_mut(task) {
                    Some(registered) => *registered |= mask,
                    None => {
                        self.msg_channel_tasks.add_with_data(task, mask);
                    }
                }
            }
            PeerSigRequest::MsgChannelUnregister { task, mask } => {
                self.msg_channel_tasks.retain(|registered_task, registered| {
                    if registered_task == task {
                        registered.remove(mask);
                    }
                    !registered.is_empty()
                });
            }
            PeerSigRequest::MarshalledRegister { task, channel } => {
                match self.marshal_tasks.data_mut(task) {
                    Some(registered) => *registered = channel,
                    None => {
                        self.marshal_tasks.add_with_data(task, channel);
                    }
                }
            }
        }
        self.pump(platform);
    }

    pub fn psm_registered(&mut self, platform: &mut dyn Platform, psm: u16) {
        if self.state != PeerSigState::Initialising {
            warn!(state = %self.state, psm, "unexpected psm registration");
            return;
        }
        self.local_psm = psm;
        platform.register_sdp_record(psm);
    }

    pub fn sdp_registered(&mut self, platform: &mut dyn Platform, success: bool) {
        if self.state != PeerSigState::Initialising {
            warn!(state = %self.state, "unexpected sdp registration");
            return;
        }
        if success {
            self.set_state(platform, PeerSigState::Disconnected);
        } else {
            warn!("sdp record registration failed");
        }
        self.pump(platform);
    }

    /// An ACL created for a startup request has finished, one way or the other.
    pub fn acl_lock_released(&mut self, platform: &mut dyn Platform, token: AclLockToken) {
        match self.acl_wait {
            Some((waiting, addr)) if waiting == token => {
                self.acl_wait = None;
                self.handle_startup(platform, addr);
            }
            _ => trace!(%token, "acl lock release not for the peer link"),
        }
        self.pump(platform);
    }

    #[instrument(skip(self, platform), level = "debug", fields(state = %self.state))]
    pub fn sdp_search_cfm(
        &mut self,
        platform: &mut dyn Platform,
        addr: BdAddr,
        result: SdpSearchResult,
    ) {
        if self.state != PeerSigState::ConnectingSdpSearch {
            debug!(%result, "sdp search result no longer needed");
            return;
        }

        match result {
            SdpSearchResult::Found { remote_psm } => {
                self.remote_psm = remote_psm;
                self.pending_connects += 1;
                platform.l2cap_connect(
                    self.peer_addr,
                    self.local_psm,
                    self.remote_psm,
                    self.config.l2cap_mtu,
                );
                self.set_state(platform, PeerSigState::ConnectingLocal);
            }
            SdpSearchResult::NoData => {
                info!(%addr, "peer has no signalling record");
                self.set_state(platform, PeerSigState::Disconnected);
            }
            SdpSearchResult::Error => {
                if self.sdp_search_attempts < self.config.sdp_search_attempts {
                    debug!(attempts = self.sdp_search_attempts, "retrying sdp search");
                    self.set_state(platform, PeerSigState::ConnectingSdpSearch);
                } else {
                    warn!(attempts = self.sdp_search_attempts, "sdp search gave up");
                    self.set_state(platform, PeerSigState::Disconnected);
                }
            }
        }
        self.pump(platform);
    }

    /// A remote device is opening a channel on our PSM. Only the paired peer
    /// is accepted, and only while disconnected.
    #[instrument(skip(self, platform), level = "debug", fields(state = %self.state))]
    pub fn l2cap_connect_ind(
        &mut self,
        platform: &mut dyn Platform,
        addr: BdAddr,
        identifier: u16,
        psm: u16,
    ) {
        let mut accept = false;
        if self.state == PeerSigState::Disconnected {
            if platform.peer_addr() == Some(addr) {
                self.peer_addr = addr;
                self.set_state(platform, PeerSigState::ConnectingRemote);
                accept = true;
            } else {
                info!(%addr, "rejecting signalling channel from unknown device");
                self.peer_addr = addr;
            }
        }

        self.pending_connects += 1;
        platform.l2cap_connect_response(identifier, accept, psm, self.config.l2cap_mtu);
        self.pump(platform);
    }

    #[instrument(skip(self, platform), level = "debug", fields(state = %self.state))]
    pub fn l2cap_connect_cfm(
        &mut self,
        platform: &mut dyn Platform,
        addr: BdAddr,
        status: L2capConnectStatus,
        sink: Option<Sink>,
        remote_mtu: u16,
    ) {
        if status == L2capConnectStatus::Pending {
            return;
        }
        if self.pending_connects == 0 {
            warn!(%addr, %status, "connect confirmation without a pending connect");
            return;
        }
        self.pending_connects -= 1;

        let opened = match (status, sink) {
            (L2capConnectStatus::Success, Some(sink)) => Some(sink),
            _ => None,
        };

        match self.state {
            PeerSigState::ConnectingLocal | PeerSigState::ConnectingRemote => match opened {
                Some(sink) if remote_mtu < self.config.min_remote_mtu => {
                    warn!(remote_mtu, "peer mtu too small, closing channel");
                    self.sink = Some(sink);
                    self.set_state(platform, PeerSigState::Disconnecting);
                }
                Some(sink) => {
                    self.sink = Some(sink);
                    self.set_state(platform, PeerSigState::Connected);
                }
                None if self.pending_connects == 0 => {
                    self.send_connect_cfm(PeerSigStatus::Fail);
                    self.set_state(platform, PeerSigState::Disconnected);
                }
                None => debug!(pending = self.pending_connects, "connect failed, others pending"),
            },
            PeerSigState::Disconnecting => match opened {
                Some(sink) => {
                    self.sink = Some(sink);
                    self.set_state(platform, PeerSigState::Disconnecting);
                }
                None => self.set_state(platform, PeerSigState::Disconnected),
            },
            state => {
                if let Some(sink) = opened {
                    warn!(%state, %sink, "channel opened in unexpected state, closing");
                    platform.l2cap_disconnect(sink);
                }
            }
        }
        self.pump(platform);
    }

    pub fn l2cap_disconnect_ind(
        &mut self,
        platform: &mut dyn Platform,
        sink: Sink,
        reason: DisconnectReason,
    ) {
        if self.sink != Some(sink) {
            trace!(%sink, "disconnect for another channel");
            return;
        }
        self.link_loss = reason == DisconnectReason::LinkLoss && !self.peer_addr.is_zero();
        self.set_state(platform, PeerSigState::Disconnected);
        self.pump(platform);
    }

    pub fn l2cap_disconnect_cfm(&mut self, platform: &mut dyn Platform, sink: Sink) {
        if self.state == PeerSigState::Disconnecting {
            debug!(%sink, "channel closed");
            self.set_state(platform, PeerSigState::Disconnected);
        }
        self.pump(platform);
    }

    /// One complete frame received from the peer.
    pub fn sink_data(&mut self, platform: &mut dyn Platform, sink: Sink, bytes: &[u8]) {
        if self.sink != Some(sink) || !self.is_connected() {
            debug!(%sink, "data for a channel that is not open");
            return;
        }
        self.restart_inactivity();

        match Frame::decode(bytes) {
            Ok(frame) => {
                trace!(frame = %frame.describe(), "frame received");
                match frame {
                    Frame::Request { opid, command } => {
                        let consumed = self.deliver_command(command);
                        let status = if consumed {
                            ResponseStatus::Success
                        } else {
                            ResponseStatus::Fail
                        };
                        if !self.send_frame(platform, &Frame::Response { opid, status }) {
                            warn!(opid, "no space for response");
                        }
                    }
                    Frame::Response { opid, status } => self.handle_response(opid, status),
                    Frame::Marshal { channel, payload } => self.deliver_marshalled(channel, &payload),
                }
            }
            Err(error) => warn!(%error, "dropping malformed frame"),
        }
        self.pump(platform);
    }

    /// The sink drained; retry a marshalled send waiting for space.
    pub fn sink_more_space(&mut self, platform: &mut dyn Platform, sink: Sink) {
        if self.sink != Some(sink) {
            return;
        }
        if let Some(retx) = self.retx.take() {
            debug!(channel = %retx.channel, "retrying marshalled send");
            self.send_marshalled(platform, retx, true);
        }
        self.pump(platform);
    }

    /// Fires every timer due at `now`.
    pub fn fire_due_timers(&mut self, platform: &mut dyn Platform, now: Instant) {
        for timer in self.timers.pop_expired(now) {
            match timer {
                PeerSigTimer::Inactivity => {
                    if self.is_connected() {
                        info!("signalling channel idle, disconnecting");
                        self.set_state(platform, PeerSigState::Disconnecting);
                    }
                }
            }
        }
        self.pump(platform);
    }

    fn queue_op(&mut self, request: OpRequest) {
        if self.is_connected() {
            self.op_queue.push(request);
        } else {
            self.confirm_op(request.task, request.kind, false);
        }
    }

    /// Releases queued requests until every queue is blocked or empty.
    fn pump(&mut self, platform: &mut dyn Platform) {
        loop {
            if let Some(addr) = self.startup_queue.pop_ready() {
                self.handle_startup(platform, addr);
            } else if let Some(request) = self.op_queue.pop_ready() {
                self.start_op(platform, request);
            } else if let Some(request) = self.marshal_queue.pop_ready() {
                self.send_marshalled(platform, request, false);
            } else {
                break;
            }
        }
    }

    #[instrument(skip(self, platform), level = "debug", fields(state = %self.state))]
    fn handle_startup(&mut self, platform: &mut dyn Platform, addr: BdAddr) {
        match self.state {
            PeerSigState::Disconnected | PeerSigState::ConnectingAcl => {
                if platform.is_connected(addr) {
                    if !platform.is_acl_local(addr) || self.peer_addr == addr {
                        self.peer_addr = addr;
                        self.set_state(platform, PeerSigState::ConnectingSdpSearch);
                    } else {
                        debug!(%addr, "acl owned elsewhere, not connecting");
                        self.set_state(platform, PeerSigState::Disconnected);
                    }
                } else if self.state == PeerSigState::Disconnected {
                    self.peer_addr = addr;
                    let token = platform.create_acl(addr);
                    self.acl_held = true;
                    self.acl_wait = Some((token, addr));
                    self.set_state(platform, PeerSigState::ConnectingAcl);
                } else {
                    info!(%addr, "acl to peer failed");
                    self.set_state(platform, PeerSigState::Disconnected);
                }
            }
            PeerSigState::Connected => self.send_connect_cfm(PeerSigStatus::Connected),
            state => panic!("startup request released in locked state {state}"),
        }
    }

    fn handle_shutdown(&mut self, platform: &mut dyn Platform) {
        match self.state {
            PeerSigState::ConnectingSdpSearch => {
                platform.cancel_sdp_search();
                self.set_state(platform, PeerSigState::Disconnecting);
            }
            PeerSigState::ConnectingAcl
            | PeerSigState::ConnectingLocal
            | PeerSigState::ConnectingRemote
            | PeerSigState::Connected => {
                self.set_state(platform, PeerSigState::Disconnecting);
            }
            PeerSigState::Disconnected => self.send_disconnect_cfm(PeerSigStatus::Success),
            state => debug!(%state, "shutdown completes once the current transition ends"),
        }
    }

    fn cancel_startup(&mut self) {
        let cancelled = self.startup_queue.cancel_where(|_| true);
        if !cancelled.is_empty() {
            debug!(count = cancelled.len(), "cancelled queued startups");
        }
        self.send_connect_cfm(PeerSigStatus::Fail);
    }

    fn cancel_shutdown(&mut self) {
        self.send_disconnect_cfm(PeerSigStatus::Fail);
    }

    fn start_op(&mut self, platform: &mut dyn Platform, request: OpRequest) {
        if !self.is_connected() {
            self.confirm_op(request.task, request.kind, false);
            return;
        }

        let opid = self.next_opid;
        self.next_opid = self.next_opid.wrapping_add(1).max(1);
        let frame = Frame::Request {
            opid,
            command: request.command,
        };
        if self.send_frame(platform, &frame) {
            self.in_flight = Some(InFlight {
                task: request.task,
                kind: request.kind,
                opid,
            });
            self.op_queue.set_lock(LOCK_OP);
        } else {
            warn!(opid, "no space for request");
            self.confirm_op(request.task, request.kind, false);
        }
    }

    fn handle_response(&mut self, opid: u16, status: ResponseStatus) {
        match self.in_flight {
            Some(in_flight) if in_flight.opid == opid => {
                self.in_flight = None;
                self.op_queue.clear_lock(LOCK_OP);
                self.confirm_op(
                    in_flight.task,
                    in_flight.kind,
                    status == ResponseStatus::Success,
                );
            }
            _ => warn!(opid, "response does not match the request in flight"),
        }
    }

    fn confirm_op(&mut self, task: TaskId, kind: OpKind, success: bool) {
        let status = |fail| {
            if success {
                PeerSigStatus::Success
            } else {
                fail
            }
        };
        let message = match kind {
            OpKind::LinkKey { addr } => PeerSigMessage::LinkKeyTxCfm {
                status: status(PeerSigStatus::LinkKeyTxFail),
                addr,
            },
            OpKind::PairHandset { addr } => PeerSigMessage::PairHandsetCfm {
                status: status(PeerSigStatus::PairHandsetTxFail),
                addr,
            },
            OpKind::MsgChannel { channel } => PeerSigMessage::MsgChannelTxCfm {
                status: status(PeerSigStatus::MsgChannelTxFail),
                channel,
            },
            OpKind::ConnectHandset => PeerSigMessage::ConnectHandsetCfm {
                status: status(PeerSigStatus::Fail),
            },
        };
        self.send(task, message);
    }

    /// Hands an inbound command to whoever registered for it. Returns whether
    /// anyone took it.
    fn deliver_command(&mut self, command: Command) -> bool {
        match command {
            Command::AddLinkKey {
                addr_type,
                addr,
                key_type,
                key,
            } => match self.link_key_task {
                Some(task) => {
                    self.send(
                        task,
                        PeerSigMessage::AddLinkKeyInd {
                            addr,
                            addr_type,
                            key_type,
                            key,
                        },
                    );
                    true
                }
                None => false,
            },
            Command::PairHandsetAddress { addr } => match self.handset_commands_task {
                Some(task) => {
                    self.send(task, PeerSigMessage::PairHandsetInd { addr });
                    true
                }
                None => false,
            },
            Command::ConnectHandset { play_media } => match self.handset_commands_task {
                Some(task) => {
                    self.send(task, PeerSigMessage::ConnectHandsetInd { play_media });
                    true
                }
                None => false,
            },
            Command::MsgChannel { channel, data } => {
                let receivers: Vec<TaskId> = self
                    .msg_channel_tasks
                    .iter()
                    .filter(|(_, mask)| mask.contains(channel))
                    .map(|(task, _)| task)
                    .collect();
                let consumed = !receivers.is_empty();
                self.outbox.send_all(
                    receivers,
                    Message::PeerSig(PeerSigMessage::MsgChannelRxInd { channel, data }),
                );
                consumed
            }
        }
    }

    fn deliver_marshalled(&mut self, channel: ChannelMask, payload: &[u8]) {
        let Some(task) = self
            .marshal_tasks
            .iter()
            .find(|(_, registered)| **registered == channel)
            .map(|(task, _)| task)
        else {
            warn!(%channel, "no task registered for marshalled channel");
            return;
        };

        match decode_marshalled(payload) {
            Ok(message) => self.send(
                task,
                PeerSigMessage::MarshalledMsgChannelRxInd { channel, message },
            ),
            Err(error) => warn!(%channel, %error, "dropping undecodable marshalled message"),
        }
    }

    fn send_marshalled(&mut self, platform: &mut dyn Platform, request: MarshalRequest, retx: bool) {
        if !self.is_connected() {
            self.fail_marshalled(&request);
            if retx {
                self.marshal_queue.clear_lock(LOCK_MARSHAL);
            }
            return;
        }

        let frame = match Frame::marshal(request.channel, &request.message) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(channel = %request.channel, %error, "cannot marshal message");
                self.fail_marshalled(&request);
                return;
            }
        };

        if self.send_frame(platform, &frame) {
            self.send(
                request.task,
                PeerSigMessage::MarshalledMsgChannelTxCfm {
                    status: PeerSigStatus::Success,
                    channel: request.channel,
                },
            );
            if retx {
                self.marshal_queue.clear_lock(LOCK_MARSHAL);
            }
        } else {
            debug!(channel = %request.channel, "sink full, holding marshalled message");
            self.retx = Some(request);
            self.marshal_queue.set_lock(LOCK_MARSHAL);
        }
    }

    fn fail_marshalled(&mut self, request: &MarshalRequest) {
        self.send(
            request.task,
            PeerSigMessage::MarshalledMsgChannelTxCfm {
                status: PeerSigStatus::MarshalledMsgChannelTxFail,
                channel: request.channel,
            },
        );
    }

    fn send_frame(&mut self, platform: &mut dyn Platform, frame: &Frame) -> bool {
        let Some(sink) = self.sink else {
            return false;
        };
        let bytes = frame.encode();
        if !platform.sink_claim(sink, bytes.len()) {
            return false;
        }
        trace!(%sink, frame = %frame.describe(), "frame sent");
        platform.sink_write(sink, bytes);
        self.restart_inactivity();
        true
    }

    fn restart_inactivity(&mut self) {
        if self.is_connected() {
            self.timers
                .start(PeerSigTimer::Inactivity, self.config.inactivity_timeout);
        }
    }

    fn send(&mut self, task: TaskId, message: PeerSigMessage) {
        self.outbox.send(task, Message::PeerSig(message));
    }

    fn send_connect_cfm(&mut self, status: PeerSigStatus) {
        let tasks: Vec<TaskId> = self.connect_tasks.drain().map(|(task, ())| task).collect();
        self.outbox
            .send_all(tasks, Message::PeerSig(PeerSigMessage::ConnectCfm { status }));
    }

    fn send_disconnect_cfm(&mut self, status: PeerSigStatus) {
        let tasks: Vec<TaskId> = self.disconnect_tasks.drain().map(|(task, ())| task).collect();
        self.outbox.send_all(
            tasks,
            Message::PeerSig(PeerSigMessage::DisconnectCfm { status }),
        );
    }

    fn send_connection_ind(&mut self, status: PeerSigStatus) {
        let clients: Vec<TaskId> = self.clients.tasks().collect();
        self.outbox.send_all(
            clients,
            Message::PeerSig(PeerSigMessage::ConnectionInd { status }),
        );
    }

    fn apply_fsm_lock(&mut self, locked: bool) {
        if locked {
            self.startup_queue.set_lock(LOCK_FSM);
            self.op_queue.set_lock(LOCK_FSM);
            self.marshal_queue.set_lock(LOCK_FSM);
        } else {
            self.startup_queue.clear_lock(LOCK_FSM);
            self.op_queue.clear_lock(LOCK_FSM);
            self.marshal_queue.clear_lock(LOCK_FSM);
        }
    }

    fn set_state(&mut self, platform: &mut dyn Platform, state: PeerSigState) {
        let old = self.state;
        info!(from = %old, to = %state, "peer signalling state");
        self.transitions
            .push(StateChange::new(TaskId::PeerSignalling, old, state));

        match old {
            PeerSigState::Initialising => {
                if let Some(task) = self.init_task.take() {
                    self.send(task, PeerSigMessage::InitCfm);
                }
            }
            PeerSigState::ConnectingLocal => self.release_acl(platform),
            PeerSigState::Connected => {
                self.timers.cancel(PeerSigTimer::Inactivity);
                let status = if self.link_loss {
                    PeerSigStatus::LinkLoss
                } else {
                    PeerSigStatus::Disconnected
                };
                self.send_connection_ind(status);
            }
            _ => {}
        }

        self.state = state;
        self.apply_fsm_lock(state.is_locked());

        match state {
            PeerSigState::Initialising => platform.register_psm(),
            PeerSigState::Disconnected => self.enter_disconnected(platform),
            PeerSigState::ConnectingSdpSearch => {
                platform.sdp_search(self.peer_addr);
                self.sdp_search_attempts += 1;
            }
            PeerSigState::ConnectingLocal => self.sdp_search_attempts = 0,
            PeerSigState::Connected => {
                self.send_connection_ind(PeerSigStatus::Connected);
                self.send_connect_cfm(PeerSigStatus::Success);
                self.restart_inactivity();
            }
            PeerSigState::Disconnecting => match self.sink {
                Some(sink) => platform.l2cap_disconnect(sink),
                None if self.pending_connects == 0 => {
                    self.set_state(platform, PeerSigState::Disconnected);
                }
                None => debug!(pending = self.pending_connects, "waiting for connect to finish"),
            },
            PeerSigState::Null | PeerSigState::ConnectingAcl | PeerSigState::ConnectingRemote => {}
        }
    }

    fn enter_disconnected(&mut self, platform: &mut dyn Platform) {
        if let Some(in_flight) = self.in_flight.take() {
            self.confirm_op(in_flight.task, in_flight.kind, false);
        }
        self.op_queue.clear_lock(LOCK_OP);

        if let Some(retx) = self.retx.take() {
            self.fail_marshalled(&retx);
        }
        self.marshal_queue.clear_lock(LOCK_MARSHAL);

        self.release_acl(platform);
        self.acl_wait = None;
        self.peer_addr = BdAddr::ZERO;
        self.send_disconnect_cfm(PeerSigStatus::Success);
        self.send_connect_cfm(PeerSigStatus::Fail);
        self.sdp_search_attempts = 0;
        self.sink = None;
        self.link_loss = false;
    }

    fn release_acl(&mut self, platform: &mut dyn Platform) {
        if self.acl_held {
            self.acl_held = false;
            platform.release_acl(self.peer_addr);
        }
    }
}
