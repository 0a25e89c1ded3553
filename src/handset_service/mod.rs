//! Handset connection management.
//!
//! One state machine per handset address, drawn from a bounded pool. Callers
//! ask for a connection or a disconnection and get exactly one confirmation
//! back; registered clients see every connect and disconnect as it happens.

mod requests;
mod state_machine;

use std::collections::BTreeSet;

use tracing::{debug, info, instrument, trace, warn};

use crate::bdaddr::{BdAddr, Transport};
use crate::collaborators::{AclLockToken, Platform};
use crate::config::HandsetServiceConfig;
use crate::message::{Message, Outbox, StateChange, TaskId, TaskList};
use crate::profiles::{Profile, ProfileMask};

pub use requests::{HandsetMessage, HandsetRequest, HandsetStatus};
pub use state_machine::HandsetState;
use state_machine::{HandsetSm, SmContext};

#[derive(Debug)]
pub struct HandsetService {
    config: HandsetServiceConfig,
    machines: Vec<HandsetSm>,
    clients: TaskList,
    le_connections: BTreeSet<BdAddr>,
    outbox: Outbox<Message>,
    transitions: Vec<StateChange>,
}

impl HandsetService {
    #[must_use]
    pub fn new(config: HandsetServiceConfig) -> Self {
        Self {
            config,
            machines: Vec::new(),
            clients: TaskList::new(),
            le_connections: BTreeSet::new(),
            outbox: Outbox::new(),
            transitions: Vec::new(),
        }
    }

    /// State of the machine for `addr`; `null` when none is allocated.
    #[must_use]
    pub fn state(&self, addr: BdAddr) -> HandsetState {
        self.machines
            .iter()
            .find(|sm| sm.addr == addr)
            .map_or(HandsetState::Null, HandsetSm::state)
    }

    /// Number of pool slots in use.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.machines.len()
    }

    #[must_use]
    pub fn is_le_connected(&self, addr: BdAddr) -> bool {
        self.le_connections.contains(&addr)
    }

    pub fn take_messages(&mut self) -> Vec<(TaskId, Message)> {
        self.outbox.drain().collect()
    }

    pub fn take_transitions(&mut self) -> Vec<StateChange> {
        std::mem::take(&mut self.transitions)
    }

    #[instrument(skip(self, platform), level = "debug")]
    pub fn request(&mut self, platform: &mut dyn Platform, request: HandsetRequest) {
        match request {
            HandsetRequest::ConnectAddress {
                task,
                addr,
                profiles,
            } => self.connect(platform, task, addr, profiles),
            HandsetRequest::ConnectMru { task, profiles } => match platform.handset_addr() {
                Some(addr) => self.connect(platform, task, addr, profiles),
                None => {
                    info!(%task, "no most recently used handset");
                    self.outbox.send(
                        task,
                        Message::Handset(HandsetMessage::ConnectCfm {
                            addr: BdAddr::ZERO,
                            status: HandsetStatus::NoMru,
                        }),
                    );
                }
            },
            HandsetRequest::Disconnect { task, addr } => self.disconnect(platform, task, addr),
            HandsetRequest::StopConnect { task, addr } => {
                let found = self.with_machine(platform, addr, |sm, ctx| {
                    sm.stop_tasks.add(task);
                    sm.stop_connect(ctx);
                });
                if !found {
                    self.reply(
                        task,
                        HandsetMessage::ConnectStopCfm {
                            addr,
                            status: HandsetStatus::Disconnected,
                        },
                    );
                }
            }
            HandsetRequest::Connectable { task } => {
                debug!(%task, "handset connectable");
                platform.set_page_scan(true);
            }
            HandsetRequest::CancelConnectable { task } => {
                debug!(%task, "handset not connectable");
                platform.set_page_scan(false);
            }
            HandsetRequest::ClientRegister { task } => {
                self.clients.add(task);
            }
            HandsetRequest::ClientUnregister { task } => {
                self.clients.remove(task);
            }
        }
    }

    /// The ACL attempt identified by `token` finished, successfully or not.
    pub fn acl_lock_released(&mut self, platform: &mut dyn Platform, token: AclLockToken) {
        let Some(addr) = self
            .machines
            .iter()
            .find(|sm| sm.acl_wait == Some(token))
            .map(|sm| sm.addr)
        else {
            trace!(%token, "acl lock not held by a handset");
            return;
        };
        self.with_machine(platform, addr, HandsetSm::acl_complete);
    }

    pub fn acl_connected(&mut self, platform: &dyn Platform, addr: BdAddr, transport: Transport) {
        if transport == Transport::Ble && platform.peer_addr() != Some(addr) {
            debug!(%addr, "handset le link up");
            self.le_connections.insert(addr);
        }
    }

    pub fn acl_disconnected(&mut self, platform: &mut dyn Platform, addr: BdAddr, transport: Transport) {
        match transport {
            Transport::Ble => {
                if self.le_connections.remove(&addr) {
                    debug!(%addr, "handset le link down");
                }
            }
            Transport::BrEdr => {
                self.with_machine(platform, addr, HandsetSm::acl_disconnected);
            }
        }
    }

    pub fn profiles_connect_cfm(&mut self, platform: &mut dyn Platform, addr: BdAddr, success: bool) {
        self.with_machine(platform, addr, |sm, ctx| sm.profiles_connect_cfm(ctx, success));
    }

    pub fn profiles_disconnect_cfm(
        &mut self,
        platform: &mut dyn Platform,
        addr: BdAddr,
        success: bool,
    ) {
        self.with_machine(platform, addr, |sm, ctx| {
            sm.profiles_disconnect_cfm(ctx, success);
        });
    }

    /// A handset profile came up, possibly without being asked for.
    pub fn profile_connected(&mut self, platform: &mut dyn Platform, addr: BdAddr, profile: Profile) {
        if !platform.is_handset(addr) {
            return;
        }
        debug!(%addr, %profile, "handset profile connected");
        if !self.machines.iter().any(|sm| sm.addr == addr) && !self.allocate(platform, addr) {
            warn!(%addr, "no free handset state machine");
            return;
        }
        self.with_machine(platform, addr, HandsetSm::profile_connected);
    }

    pub fn profile_disconnected(
        &mut self,
        platform: &mut dyn Platform,
        addr: BdAddr,
        profile: Profile,
    ) {
        debug!(%addr, %profile, "handset profile disconnected");
        self.with_machine(platform, addr, HandsetSm::profile_disconnected);
    }

    fn connect(
        &mut self,
        platform: &mut dyn Platform,
        task: TaskId,
        addr: BdAddr,
        profiles: ProfileMask,
    ) {
        if !self.machines.iter().any(|sm| sm.addr == addr) && !self.allocate(platform, addr) {
            warn!(%addr, pool_size = self.config.pool_size, "handset pool full");
            self.reply(
                task,
                HandsetMessage::ConnectCfm {
                    addr,
                    status: HandsetStatus::Failed,
                },
            );
            return;
        }
        self.with_machine(platform, addr, |sm, ctx| {
            let mut disconnects = std::mem::take(&mut sm.disconnect_tasks);
            ctx.reply(
                &mut disconnects,
                HandsetMessage::DisconnectCfm {
                    addr,
                    status: HandsetStatus::Cancelled,
                },
            );
            sm.connect_tasks.add(task);
            sm.connect(ctx, profiles);
        });
    }

    fn disconnect(&mut self, platform: &mut dyn Platform, task: TaskId, addr: BdAddr) {
        let found = self.with_machine(platform, addr, |sm, ctx| {
            let mut connects = std::mem::take(&mut sm.connect_tasks);
            ctx.reply(
                &mut connects,
                HandsetMessage::ConnectCfm {
                    addr,
                    status: HandsetStatus::Cancelled,
                },
            );
            sm.disconnect_tasks.add(task);
            sm.disconnect(ctx);
        });
        if !found {
            self.reply(
                task,
                HandsetMessage::DisconnectCfm {
                    addr,
                    status: HandsetStatus::Success,
                },
            );
        }
    }

    /// Takes a slot for `addr`, returning `false` when the pool is exhausted.
    fn allocate(&mut self, platform: &mut dyn Platform, addr: BdAddr) -> bool {
        if self.machines.len() >= self.config.pool_size {
            return false;
        }
        let mut ctx = SmContext {
            platform,
            outbox: &mut self.outbox,
            clients: &self.clients,
            transitions: &mut self.transitions,
            profile_order: &self.config.profile_order,
        };
        let sm = HandsetSm::new(&mut ctx, addr);
        self.machines.push(sm);
        true
    }

    /// Runs `f` on the machine for `addr`, then frees released slots.
    /// Returns `false` if no machine exists for `addr`.
    fn with_machine(
        &mut self,
        platform: &mut dyn Platform,
        addr: BdAddr,
        f: impl FnOnce(&mut HandsetSm, &mut SmContext<'_>),
    ) -> bool {
        let Some(sm) = self.machines.iter_mut().find(|sm| sm.addr == addr) else {
            return false;
        };
        let mut ctx = SmContext {
            platform,
            outbox: &mut self.outbox,
            clients: &self.clients,
            transitions: &mut self.transitions,
            profile_order: &self.config.profile_order,
        };
        f(sm, &mut ctx);
        self.machines.retain(|sm| !sm.is_free());
        true
    }

    fn reply(&mut self, task: TaskId, message: HandsetMessage) {
        self.outbox.send(task, Message::Handset(message));
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::collaborators::{DeviceRegistry, FakePlatform, PlatformCall};

    const HANDSET: BdAddr = BdAddr::new([0x00, 0x1a, 0x7d, 0x00, 0x00, 0x02]);
    const REQUESTER: TaskId = TaskId::Client(1);
    const OTHER: TaskId = TaskId::Client(2);
    const CLIENT: TaskId = TaskId::Topology;

    fn platform() -> FakePlatform {
        let mut platform = FakePlatform::default();
        platform.devices.insert(HANDSET, Default::default());
        platform.mru = Some(HANDSET);
        platform
    }

    fn service() -> HandsetService {
        let mut service = HandsetService::new(HandsetServiceConfig::default());
        service.request(
            &mut FakePlatform::default(),
            HandsetRequest::ClientRegister { task: CLIENT },
        );
        service
    }

    fn connect(task: TaskId, addr: BdAddr) -> HandsetRequest {
        HandsetRequest::ConnectAddress {
            task,
            addr,
            profiles: ProfileMask::HFP | ProfileMask::A2DP,
        }
    }

    fn handset_messages(service: &mut HandsetService) -> Vec<(TaskId, HandsetMessage)> {
        service
            .take_messages()
            .into_iter()
            .filter_map(|(task, message)| match message {
                Message::Handset(message) => Some((task, message)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn connect_creates_acl_then_profiles() {
        let mut platform = platform();
        let mut service = service();

        service.request(&mut platform, connect(REQUESTER, HANDSET));
        assert_eq!(HandsetState::ConnectingAcl, service.state(HANDSET));

        platform.acls.insert(HANDSET, true);
        service.acl_lock_released(&mut platform, AclLockToken(0));
        assert_eq!(HandsetState::ConnectingProfiles, service.state(HANDSET));

        platform.set_profile_connected(HANDSET, Profile::Hfp, true);
        platform.set_profile_connected(HANDSET, Profile::A2dp, true);
        service.profiles_connect_cfm(&mut platform, HANDSET, true);

        assert_eq!(HandsetState::Connected, service.state(HANDSET));
        assert_eq!(
            vec![
                PlatformCall::CreateAcl {
                    addr: HANDSET,
                    token: AclLockToken(0)
                },
                PlatformCall::ConnectProfiles {
                    addr: HANDSET,
                    profiles: vec![Profile::Hfp, Profile::A2dp]
                },
                PlatformCall::ReleaseAcl { addr: HANDSET },
                PlatformCall::SetMruHandset { addr: HANDSET },
            ],
            platform.take_calls()
        );
        assert_eq!(
            vec![
                (
                    REQUESTER,
                    HandsetMessage::ConnectCfm {
                        addr: HANDSET,
                        status: HandsetStatus::Success
                    }
                ),
                (
                    CLIENT,
                    HandsetMessage::ConnectedInd {
                        addr: HANDSET,
                        profiles: ProfileMask::HFP | ProfileMask::A2DP
                    }
                ),
            ],
            handset_messages(&mut service)
        );
        let states: Vec<String> = service
            .take_transitions()
            .into_iter()
            .map(|change| change.to)
            .collect();
        assert_eq!(
            vec!["disconnected", "connecting_acl", "connecting_profiles", "connected"],
            states
        );
    }

    #[test]
    fn pool_is_bounded() {
        let mut platform = platform();
        let mut service = HandsetService::new(HandsetServiceConfig::builder().pool_size(2).build());

        for last in 1..=3 {
            let addr = BdAddr::new([0, 0, 0, 0, 0, last]);
            service.request(&mut platform, connect(REQUESTER, addr));
        }

        assert_eq!(2, service.active_count());
        assert_eq!(
            vec![(
                REQUESTER,
                HandsetMessage::ConnectCfm {
                    addr: BdAddr::new([0, 0, 0, 0, 0, 3]),
                    status: HandsetStatus::Failed
                }
            )],
            handset_messages(&mut service)
        );
    }

    #[test]
    fn disconnect_cancels_a_pending_connect() {
        let mut platform = platform();
        let mut service = service();
        service.request(&mut platform, connect(REQUESTER, HANDSET));
        platform.take_calls();

        service.request(
            &mut platform,
            HandsetRequest::Disconnect {
                task: OTHER,
                addr: HANDSET,
            },
        );

        assert_eq!(
            vec![
                (
                    REQUESTER,
                    HandsetMessage::ConnectCfm {
                        addr: HANDSET,
                        status: HandsetStatus::Cancelled
                    }
                ),
                (
                    OTHER,
                    HandsetMessage::DisconnectCfm {
                        addr: HANDSET,
                        status: HandsetStatus::Success
                    }
                ),
                (
                    CLIENT,
                    HandsetMessage::DisconnectedInd {
                        addr: HANDSET,
                        status: HandsetStatus::Disconnected
                    }
                ),
            ],
            handset_messages(&mut service)
        );
        assert_eq!(
            vec![PlatformCall::ReleaseAcl { addr: HANDSET }],
            platform.take_calls()
        );
        assert_eq!(0, service.active_count());
    }

    #[test]
    fn late_acl_release_after_disconnect_is_ignored() {
        let mut platform = platform();
        let mut service = service();
        service.request(&mut platform, connect(REQUESTER, HANDSET));
        service.request(
            &mut platform,
            HandsetRequest::Disconnect {
                task: OTHER,
                addr: HANDSET,
            },
        );
        service.take_messages();

        service.acl_lock_released(&mut platform, AclLockToken(0));

        assert_eq!(HandsetState::Null, service.state(HANDSET));
        assert_eq!(Vec::<(TaskId, HandsetMessage)>::new(), handset_messages(&mut service));
    }

    #[test]
    fn failed_acl_fails_the_connect() {
        let mut platform = platform();
        let mut service = service();
        service.request(&mut platform, connect(REQUESTER, HANDSET));

        service.acl_lock_released(&mut platform, AclLockToken(0));

        assert_eq!(HandsetState::Null, service.state(HANDSET));
        assert_eq!(
            Some((
                REQUESTER,
                HandsetMessage::ConnectCfm {
                    addr: HANDSET,
                    status: HandsetStatus::Failed
                }
            )),
            handset_messages(&mut service).into_iter().next()
        );
    }

    #[test]
    fn connect_mru_without_a_paired_handset() {
        let mut platform = FakePlatform::default();
        let mut service = service();

        service.request(
            &mut platform,
            HandsetRequest::ConnectMru {
                task: REQUESTER,
                profiles: ProfileMask::HANDSET,
            },
        );

        assert_eq!(
            vec![(
                REQUESTER,
                HandsetMessage::ConnectCfm {
                    addr: BdAddr::ZERO,
                    status: HandsetStatus::NoMru
                }
            )],
            handset_messages(&mut service)
        );
    }

    #[test]
    fn handset_initiated_profile_creates_a_machine() {
        let mut platform = platform();
        let mut service = service();
        platform.acls.insert(HANDSET, false);
        platform.set_profile_connected(HANDSET, Profile::A2dp, true);

        service.profile_connected(&mut platform, HANDSET, Profile::A2dp);

        assert_eq!(HandsetState::Connected, service.state(HANDSET));
        assert_eq!(
            vec![(
                CLIENT,
                HandsetMessage::ConnectedInd {
                    addr: HANDSET,
                    profiles: ProfileMask::A2DP
                }
            )],
            handset_messages(&mut service)
        );
    }

    #[test]
    fn link_loss_while_connected_reports_disconnected() {
        let mut platform = platform();
        let mut service = service();
        platform.acls.insert(HANDSET, false);
        platform.set_profile_connected(HANDSET, Profile::Hfp, true);
        service.profile_connected(&mut platform, HANDSET, Profile::Hfp);
        service.take_messages();

        platform.acls.remove(&HANDSET);
        platform.set_profile_connected(HANDSET, Profile::Hfp, false);
        service.acl_disconnected(&mut platform, HANDSET, Transport::BrEdr);

        assert_eq!(HandsetState::Null, service.state(HANDSET));
        assert_eq!(
            vec![(
                CLIENT,
                HandsetMessage::DisconnectedInd {
                    addr: HANDSET,
                    status: HandsetStatus::Disconnected
                }
            )],
            handset_messages(&mut service)
        );
    }

    #[test]
    fn stop_connect_abandons_the_acl_attempt() {
        let mut platform = platform();
        let mut service = service();
        service.request(&mut platform, connect(REQUESTER, HANDSET));

        service.request(
            &mut platform,
            HandsetRequest::StopConnect {
                task: OTHER,
                addr: HANDSET,
            },
        );

        let messages = handset_messages(&mut service);
        assert_eq!(
            (
                OTHER,
                HandsetMessage::ConnectStopCfm {
                    addr: HANDSET,
                    status: HandsetStatus::Disconnected
                }
            ),
            messages[0]
        );
        assert_eq!(
            (
                REQUESTER,
                HandsetMessage::ConnectCfm {
                    addr: HANDSET,
                    status: HandsetStatus::Failed
                }
            ),
            messages[1]
        );
    }

    #[test]
    fn disconnect_from_connected_reverses_profile_order() {
        let mut platform = platform();
        let mut service = service();
        platform.acls.insert(HANDSET, false);
        for profile in [Profile::Hfp, Profile::A2dp, Profile::Avrcp] {
            platform.set_profile_connected(HANDSET, profile, true);
            service.profile_connected(&mut platform, HANDSET, profile);
        }
        platform.take_calls();

        service.request(
            &mut platform,
            HandsetRequest::Disconnect {
                task: REQUESTER,
                addr: HANDSET,
            },
        );

        assert_eq!(HandsetState::Disconnecting, service.state(HANDSET));
        assert_eq!(
            vec![PlatformCall::DisconnectProfiles {
                addr: HANDSET,
                profiles: vec![Profile::Avrcp, Profile::A2dp, Profile::Hfp]
            }],
            platform.take_calls()
        );
    }

    #[test]
    fn le_links_are_tracked_apart_from_the_peer() {
        let mut platform = platform();
        let peer = BdAddr::new([0x00, 0x02, 0x5b, 0x00, 0xee, 0x01]);
        platform.peer_device = Some(peer);
        let mut service = service();

        service.acl_connected(&platform, HANDSET, Transport::Ble);
        service.acl_connected(&platform, peer, Transport::Ble);
        assert!(service.is_le_connected(HANDSET));
        assert!(!service.is_le_connected(peer));

        service.acl_disconnected(&mut platform, HANDSET, Transport::Ble);
        assert!(!service.is_le_connected(HANDSET));
    }

    #[test]
    fn connectable_drives_page_scan() {
        let mut platform = platform();
        let mut service = service();

        service.request(&mut platform, HandsetRequest::Connectable { task: REQUESTER });
        service.request(&mut platform, HandsetRequest::CancelConnectable { task: REQUESTER });

        assert_eq!(
            vec![
                PlatformCall::SetPageScan { enabled: true },
                PlatformCall::SetPageScan { enabled: false },
            ],
            platform.take_calls()
        );
    }
}
