use serde::Serialize;
use strum_macros::Display;
use tracing::{debug, info};

use super::requests::{HandsetMessage, HandsetStatus};
use crate::bdaddr::BdAddr;
use crate::collaborators::{AclLockToken, Platform};
use crate::message::{Message, Outbox, StateChange, TaskId, TaskList};
use crate::profiles::{Profile, ProfileMask};

/// States of one handset connection.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HandsetState {
    /// Slot free.
    #[default]
    Null,
    Disconnected,
    ConnectingAcl,
    ConnectingProfiles,
    Connected,
    Disconnecting,
}

impl HandsetState {
    #[must_use]
    pub const fn is_connecting(self) -> bool {
        matches!(self, Self::ConnectingAcl | Self::ConnectingProfiles)
    }
}

/// Everything outside the state machine a transition may touch.
pub(super) struct SmContext<'a> {
    pub platform: &'a mut dyn Platform,
    pub outbox: &'a mut Outbox<Message>,
    pub clients: &'a TaskList,
    pub transitions: &'a mut Vec<StateChange>,
    pub profile_order: &'a [Profile],
}

impl SmContext<'_> {
    pub(super) fn reply(&mut self, tasks: &mut TaskList, message: HandsetMessage) {
        for (task, ()) in tasks.drain() {
            self.outbox.send(task, Message::Handset(message));
        }
    }

    fn indicate(&mut self, message: HandsetMessage) {
        let clients: Vec<TaskId> = self.clients.tasks().collect();
        self.outbox.send_all(clients, Message::Handset(message));
    }
}

/// State machine for a single handset address.
#[derive(Debug)]
pub(super) struct HandsetSm {
    pub addr: BdAddr,
    state: HandsetState,
    profiles_requested: ProfileMask,
    acl_create_called: bool,
    /// ACL attempt still running; completes on the matching lock release.
    pub acl_wait: Option<AclLockToken>,
    pub connect_tasks: TaskList,
    pub disconnect_tasks: TaskList,
    pub stop_tasks: TaskList,
}

impl HandsetSm {
    pub fn new(ctx: &mut SmContext<'_>, addr: BdAddr) -> Self {
        let mut sm = Self {
            addr,
            state: HandsetState::Null,
            profiles_requested: ProfileMask::EMPTY,
            acl_create_called: false,
            acl_wait: None,
            connect_tasks: TaskList::new(),
            disconnect_tasks: TaskList::new(),
            stop_tasks: TaskList::new(),
        };
        sm.set_state(ctx, HandsetState::Disconnected);
        sm
    }

    pub fn state(&self) -> HandsetState {
        self.state
    }

    pub fn is_free(&self) -> bool {
        self.state == HandsetState::Null
    }

    /// Starts or continues a connection for `profiles`.
    pub fn connect(&mut self, ctx: &mut SmContext<'_>, profiles: ProfileMask) {
        use HandsetState as S;

        match self.state {
            S::Disconnected | S::Disconnecting => {
                self.profiles_requested = profiles;
                if ctx.platform.is_connected(self.addr) {
                    self.acl_ready(ctx);
                } else {
                    self.set_state(ctx, S::ConnectingAcl);
                }
            }
            S::ConnectingAcl | S::ConnectingProfiles => {
                // Merged into the attempt already running.
                self.profiles_requested |= profiles;
            }
            S::Connected => {
                let addr = self.addr;
                ctx.reply(
                    &mut self.connect_tasks,
                    HandsetMessage::ConnectCfm {
                        addr,
                        status: HandsetStatus::Success,
                    },
                );
            }
            S::Null => debug!(addr = %self.addr, "connect on a released handset"),
        }
    }

    pub fn disconnect(&mut self, ctx: &mut SmContext<'_>) {
        use HandsetState as S;

        match self.state {
            S::Disconnected => {
                let addr = self.addr;
                ctx.reply(
                    &mut self.disconnect_tasks,
                    HandsetMessage::DisconnectCfm {
                        addr,
                        status: HandsetStatus::Success,
                    },
                );
                self.release_if_idle(ctx);
            }
            S::ConnectingAcl => self.set_state(ctx, S::Disconnected),
            S::ConnectingProfiles => self.set_state(ctx, S::Disconnecting),
            S::Connected => {
                if ctx.platform.connected_profiles(self.addr).is_empty() {
                    self.set_state(ctx, S::Disconnected);
                } else {
                    self.set_state(ctx, S::Disconnecting);
                }
            }
            S::Disconnecting | S::Null => {}
        }
    }

    /// Stops an ACL attempt; profile connects already started are left to finish.
    pub fn stop_connect(&mut self, ctx: &mut SmContext<'_>) {
        use HandsetState as S;

        let addr = self.addr;
        match self.state {
            S::ConnectingAcl => self.set_state(ctx, S::Disconnected),
            S::Connected => ctx.reply(
                &mut self.stop_tasks,
                HandsetMessage::ConnectStopCfm {
                    addr,
                    status: HandsetStatus::Connected,
                },
            ),
            S::Disconnected | S::Null => ctx.reply(
                &mut self.stop_tasks,
                HandsetMessage::ConnectStopCfm {
                    addr,
                    status: HandsetStatus::Disconnected,
                },
            ),
            S::ConnectingProfiles | S::Disconnecting => {}
        }
    }

    /// The ACL attempt started on entering `connecting_acl` finished.
    pub fn acl_complete(&mut self, ctx: &mut SmContext<'_>) {
        self.acl_wait = None;
        if self.state != HandsetState::ConnectingAcl {
            return;
        }
        if ctx.platform.is_connected(self.addr) {
            self.acl_ready(ctx);
        } else {
            self.set_state(ctx, HandsetState::Disconnected);
        }
    }

    pub fn profiles_connect_cfm(&mut self, ctx: &mut SmContext<'_>, success: bool) {
        match self.state {
            HandsetState::ConnectingProfiles => {
                let next = if success {
                    HandsetState::Connected
                } else {
                    HandsetState::Disconnected
                };
                self.set_state(ctx, next);
            }
            HandsetState::Disconnecting => self.set_state(ctx, HandsetState::Disconnected),
            state => debug!(addr = %self.addr, %state, "stale profile connect confirmation"),
        }
    }

    pub fn profiles_disconnect_cfm(&mut self, ctx: &mut SmContext<'_>, success: bool) {
        if self.state == HandsetState::Disconnecting && success && !self.any_connection(ctx) {
            self.set_state(ctx, HandsetState::Disconnected);
        }
    }

    pub fn profile_connected(&mut self, ctx: &mut SmContext<'_>) {
        match self.state {
            HandsetState::Disconnected => self.set_state(ctx, HandsetState::Connected),
            HandsetState::Connected => self.announce_connected(ctx),
            _ => {}
        }
    }

    pub fn profile_disconnected(&mut self, ctx: &mut SmContext<'_>) {
        if self.state == HandsetState::Connected && !self.any_connection(ctx) {
            self.set_state(ctx, HandsetState::Disconnected);
        }
    }

    /// The BR/EDR link to the handset went away.
    pub fn acl_disconnected(&mut self, ctx: &mut SmContext<'_>) {
        match self.state {
            HandsetState::Connected | HandsetState::Disconnecting => {
                self.set_state(ctx, HandsetState::Disconnected);
            }
            HandsetState::Disconnected => self.release_if_idle(ctx),
            _ => {}
        }
    }

    fn acl_ready(&mut self, ctx: &mut SmContext<'_>) {
        if self.profiles_requested.is_empty() {
            self.set_state(ctx, HandsetState::Connected);
        } else {
            self.set_state(ctx, HandsetState::ConnectingProfiles);
        }
    }

    fn any_connection(&self, ctx: &SmContext<'_>) -> bool {
        ctx.platform.is_connected(self.addr) || !ctx.platform.connected_profiles(self.addr).is_empty()
    }

    fn announce_connected(&mut self, ctx: &mut SmContext<'_>) {
        let profiles = ctx.platform.connected_profiles(self.addr);
        ctx.indicate(HandsetMessage::ConnectedInd {
            addr: self.addr,
            profiles,
        });
    }

    /// Returns the slot to the pool once nothing is left to track.
    fn release_if_idle(&mut self, ctx: &mut SmContext<'_>) {
        if self.state == HandsetState::Disconnected
            && !self.any_connection(ctx)
            && self.connect_tasks.is_empty()
            && self.disconnect_tasks.is_empty()
        {
            debug!(addr = %self.addr, "handset state machine released");
            self.state = HandsetState::Null;
        }
    }

    fn set_state(&mut self, ctx: &mut SmContext<'_>, state: HandsetState) {
        use HandsetState as S;

        let old = self.state;
        info!(addr = %self.addr, from = %old, to = %state, "handset state");
        ctx.transitions.push(
            StateChange::new(TaskId::HandsetService, old, state).for_device(self.addr),
        );

        if old.is_connecting() && !state.is_connecting() && self.acl_create_called {
            ctx.platform.release_acl(self.addr);
            self.acl_create_called = false;
        }

        self.state = state;

        if !old.is_connecting() && state.is_connecting() {
            self.acl_create_called = false;
        }

        match state {
            S::Disconnected if old != S::Null => self.enter_disconnected(ctx),
            S::ConnectingAcl => {
                self.acl_wait = Some(ctx.platform.create_acl(self.addr));
                self.acl_create_called = true;
            }
            S::ConnectingProfiles => {
                let profiles = self.profiles_requested.ordered(ctx.profile_order);
                ctx.platform.connect_profiles(self.addr, &profiles);
            }
            S::Connected => self.enter_connected(ctx),
            S::Disconnecting => {
                let mut profiles = (self.profiles_requested
                    | ctx.platform.connected_profiles(self.addr))
                .ordered(ctx.profile_order);
                profiles.reverse();
                ctx.platform.disconnect_profiles(self.addr, &profiles);
            }
            S::Disconnected | S::Null => {}
        }
    }

    fn enter_disconnected(&mut self, ctx: &mut SmContext<'_>) {
        let addr = self.addr;
        self.acl_wait = None;
        ctx.reply(
            &mut self.stop_tasks,
            HandsetMessage::ConnectStopCfm {
                addr,
                status: HandsetStatus::Disconnected,
            },
        );
        ctx.reply(
            &mut self.connect_tasks,
            HandsetMessage::ConnectCfm {
                addr,
                status: HandsetStatus::Failed,
            },
        );
        ctx.reply(
            &mut self.disconnect_tasks,
            HandsetMessage::DisconnectCfm {
                addr,
                status: HandsetStatus::Success,
            },
        );
        ctx.indicate(HandsetMessage::DisconnectedInd {
            addr,
            status: HandsetStatus::Disconnected,
        });
        self.release_if_idle(ctx);
    }

    fn enter_connected(&mut self, ctx: &mut SmContext<'_>) {
        let addr = self.addr;
        ctx.reply(
            &mut self.stop_tasks,
            HandsetMessage::ConnectStopCfm {
                addr,
                status: HandsetStatus::Connected,
            },
        );
        ctx.reply(
            &mut self.connect_tasks,
            HandsetMessage::ConnectCfm {
                addr,
                status: HandsetStatus::Success,
            },
        );
        self.announce_connected(ctx);
        ctx.platform.set_mru_handset(addr);
    }
}
