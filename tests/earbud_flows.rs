use std::time::Duration;

use anyhow::Result;
use pretty_assertions::assert_eq;
use rstest::rstest;
use tokio::sync::broadcast;
use tokio::time::Instant;

use earbud_core::app_sm::{AudioEvent, Phase, PhyState, Role};
use earbud_core::collaborators::{
    AclLockToken, EscoParams, FakePlatform, FakeUpdate, L2capConnectStatus, PlatformCall,
    SdpSearchResult, Sink,
};
use earbud_core::handset_service::{HandsetMessage, HandsetRequest, HandsetState, HandsetStatus};
use earbud_core::message::{Message, TaskId};
use earbud_core::peer_signalling::{
    ChannelMask, MarshalledMessage, PeerSigMessage, PeerSigRequest, PeerSigState, PeerSigStatus,
};
use earbud_core::rules::{DfuGoal, DfuRuleEvent};
use earbud_core::shadow_profile::{SdmEvent, ShadowIndication, ShadowState};
use earbud_core::{BdAddr, Earbud, EarbudConfig, HandsetServiceConfig, Indication, Input, Profile};

const PEER: BdAddr = BdAddr::new([0x00, 0x02, 0x5b, 0x00, 0x00, 0x01]);
const HANDSET: BdAddr = BdAddr::new([0x00, 0x1a, 0x7d, 0xda, 0x71, 0x13]);
const PEER_SINK: Sink = Sink(5);

/// Drives an earbud the way a replay does and keeps everything it emitted.
struct Harness {
    earbud: Earbud<FakePlatform>,
    indications: broadcast::Receiver<Indication>,
    calls: Vec<PlatformCall>,
    seen: Vec<Indication>,
}

impl Harness {
    fn new(config: EarbudConfig, updates: impl IntoIterator<Item = FakeUpdate>) -> Result<Self> {
        let mut platform = FakePlatform::default();
        for update in updates {
            platform.apply(update);
        }
        let earbud = Earbud::new(config, platform)?;
        let indications = earbud.subscribe();
        Ok(Self {
            earbud,
            indications,
            calls: Vec::new(),
            seen: Vec::new(),
        })
    }

    fn paired(updates: impl IntoIterator<Item = FakeUpdate>) -> Result<Self> {
        Self::new(
            EarbudConfig::default(),
            [FakeUpdate::PairPeer { addr: PEER }].into_iter().chain(updates),
        )
    }

    fn feed(&mut self, input: Input) {
        self.earbud.platform_mut().observe(&input);
        self.earbud.post(input);
        self.earbud.process_pending();
        self.collect();
    }

    fn start(&mut self) {
        for input in [
            Input::Init,
            Input::PsmRegistered { psm: 0x1001 },
            Input::SdpRegistered { success: true },
            Input::Sdm(SdmEvent::RegisterCfm { success: true }),
        ] {
            self.feed(input);
        }
    }

    fn fire_timers(&mut self) {
        self.earbud.fire_due_timers(Instant::now());
        self.collect();
    }

    fn collect(&mut self) {
        self.calls.extend(self.earbud.platform_mut().take_calls());
        while let Ok(indication) = self.indications.try_recv() {
            self.seen.push(indication);
        }
    }

    fn acl_token(&self, addr: BdAddr) -> Option<AclLockToken> {
        self.calls.iter().rev().find_map(|call| match call {
            PlatformCall::CreateAcl { addr: created, token } if *created == addr => Some(*token),
            _ => None,
        })
    }

    /// Completes an ACL this device asked for.
    fn complete_acl(&mut self, addr: BdAddr) -> Result<()> {
        let token = self
            .acl_token(addr)
            .ok_or_else(|| anyhow::anyhow!("no ACL was requested for {addr}"))?;
        self.feed(Input::AclConnected {
            addr,
            transport: earbud_core::Transport::BrEdr,
            local: true,
        });
        self.feed(Input::AclLockReleased { token });
        Ok(())
    }

    /// Brings the peer signalling channel up from `connecting_acl`.
    fn complete_peer_link(&mut self) -> Result<()> {
        self.complete_acl(PEER)?;
        self.feed(Input::SdpSearchCfm {
            addr: PEER,
            result: SdpSearchResult::Found { remote_psm: 0x1003 },
        });
        self.feed(Input::L2capConnectCfm {
            addr: PEER,
            status: L2capConnectStatus::Success,
            sink: Some(PEER_SINK),
            remote_mtu: 672,
        });
        Ok(())
    }

    fn transitions(&self, component: TaskId, device: Option<BdAddr>) -> Vec<String> {
        self.seen
            .iter()
            .filter_map(|indication| match indication {
                Indication::Transition { change }
                    if change.component == component && change.device == device =>
                {
                    Some(change.to.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Goals the upgrade rule set handed to topology, in order.
    fn dfu_goals(&self) -> Vec<DfuGoal> {
        self.seen
            .iter()
            .filter_map(|indication| match indication {
                Indication::Rule {
                    to: TaskId::Topology,
                    message: Message::DfuRule(rule),
                } => Some(rule.action),
                _ => None,
            })
            .collect()
    }

    fn delivered_to(&self, task: TaskId) -> Vec<&Message> {
        self.seen
            .iter()
            .filter_map(|indication| match indication {
                Indication::Delivered { to, message } if *to == task => Some(message),
                _ => None,
            })
            .collect()
    }
}

#[test]
fn leaving_the_case_reconnects_the_last_handset() -> Result<()> {
    let mut harness = Harness::paired([FakeUpdate::PairHandset {
        addr: HANDSET,
        tws_plus: false,
        was_connected: true,
        last_connected_profiles: Default::default(),
    }])?;
    harness.start();
    harness.feed(Input::TopologyStarted {
        role: Role::Primary,
    });
    assert_eq!(Phase::InCaseIdle, harness.earbud.app().state().phase);
    assert_eq!(None, harness.acl_token(HANDSET));

    harness.feed(Input::PhyState {
        state: PhyState::OutOfEar,
    });
    assert_eq!(Phase::OutOfCaseIdle, harness.earbud.app().state().phase);
    assert!(
        harness
            .calls
            .contains(&PlatformCall::AllowHandsetConnect { allowed: true })
    );
    assert_eq!(
        HandsetState::ConnectingAcl,
        harness.earbud.handsets().state(HANDSET)
    );

    harness.complete_acl(HANDSET)?;
    assert!(harness.calls.contains(&PlatformCall::ConnectProfiles {
        addr: HANDSET,
        profiles: vec![Profile::Hfp, Profile::A2dp],
    }));

    for profile in [Profile::Hfp, Profile::A2dp] {
        harness.feed(Input::ProfileConnected {
            addr: HANDSET,
            profile,
        });
    }
    harness.feed(Input::ProfilesConnectCfm {
        addr: HANDSET,
        success: true,
    });

    assert_eq!(
        vec![
            "disconnected",
            "connecting_acl",
            "connecting_profiles",
            "connected"
        ],
        harness.transitions(TaskId::HandsetService, Some(HANDSET))
    );
    assert!(
        harness
            .calls
            .contains(&PlatformCall::SetMruHandset { addr: HANDSET })
    );
    assert_eq!(1, harness.earbud.handsets().active_count());
    Ok(())
}

#[test]
fn handset_requests_beyond_the_pool_fail() -> Result<()> {
    let config = EarbudConfig::builder()
        .handset_service(HandsetServiceConfig::builder().pool_size(1).build())
        .build();
    let mut harness = Harness::new(config, [FakeUpdate::PairPeer { addr: PEER }])?;
    harness.start();

    let other = BdAddr::new([0x00, 0x1a, 0x7d, 0xda, 0x71, 0x14]);
    for addr in [HANDSET, other] {
        harness.feed(Input::HandsetRequest(HandsetRequest::ConnectAddress {
            task: TaskId::Client(4),
            addr,
            profiles: earbud_core::ProfileMask::HANDSET,
        }));
    }

    assert_eq!(1, harness.earbud.handsets().active_count());
    assert_eq!(
        vec![&Message::Handset(HandsetMessage::ConnectCfm {
            addr: other,
            status: HandsetStatus::Failed,
        })],
        harness.delivered_to(TaskId::Client(4))
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn idle_peer_link_fails_unsent_marshalled_messages() -> Result<()> {
    const CLIENT: TaskId = TaskId::Client(7);

    let mut harness = Harness::paired([])?;
    harness.start();

    harness.feed(Input::PeerSigRequest(PeerSigRequest::Startup {
        task: CLIENT,
        addr: PEER,
    }));
    assert_eq!(
        PeerSigState::ConnectingAcl,
        harness.earbud.peer_signalling().state()
    );
    harness.complete_peer_link()?;
    assert_eq!(
        PeerSigState::Connected,
        harness.earbud.peer_signalling().state()
    );

    harness.feed(Input::PeerSigRequest(PeerSigRequest::ClientRegister { task: CLIENT }));
    harness.earbud.platform_mut().apply(FakeUpdate::SinkSpace { space: Some(0) });
    for type_id in [1, 2] {
        harness.feed(Input::PeerSigRequest(PeerSigRequest::MarshalledTx {
            task: CLIENT,
            channel: ChannelMask::APPLICATION,
            message: MarshalledMessage::Opaque {
                type_id,
                bytes: vec![0xca, 0xfe],
            },
        }));
    }
    assert!(
        !harness
            .calls
            .iter()
            .any(|call| matches!(call, PlatformCall::SinkWrite { .. }))
    );

    tokio::time::advance(Duration::from_secs(30)).await;
    harness.fire_timers();
    assert_eq!(
        PeerSigState::Disconnecting,
        harness.earbud.peer_signalling().state()
    );
    assert!(
        harness
            .calls
            .contains(&PlatformCall::L2capDisconnect { sink: PEER_SINK })
    );

    harness.feed(Input::L2capDisconnectCfm { sink: PEER_SINK });

    assert_eq!(
        PeerSigState::Disconnected,
        harness.earbud.peer_signalling().state()
    );
    let delivered = harness.delivered_to(CLIENT);
    let failures = delivered
        .iter()
        .filter(|message| {
            matches!(
                message,
                Message::PeerSig(PeerSigMessage::MarshalledMsgChannelTxCfm {
                    status: PeerSigStatus::MarshalledMsgChannelTxFail,
                    channel: ChannelMask::APPLICATION,
                })
            )
        })
        .count();
    assert_eq!(2, failures);
    assert!(delivered.contains(&&Message::PeerSig(PeerSigMessage::ConnectionInd {
        status: PeerSigStatus::Disconnected,
    })));
    Ok(())
}

#[test]
fn primary_shadows_the_handset_one_step_at_a_time() -> Result<()> {
    const WATCHER: TaskId = TaskId::Client(9);

    let mut harness = Harness::paired([FakeUpdate::PairHandset {
        addr: HANDSET,
        tws_plus: false,
        was_connected: true,
        last_connected_profiles: Default::default(),
    }])?;
    harness.start();
    harness.feed(Input::ShadowClientRegister { task: WATCHER });
    harness.feed(Input::TopologyStarted {
        role: Role::Primary,
    });
    harness.feed(Input::PhyState {
        state: PhyState::OutOfEar,
    });

    harness.complete_acl(HANDSET)?;
    for profile in [Profile::Hfp, Profile::A2dp] {
        harness.feed(Input::ProfileConnected {
            addr: HANDSET,
            profile,
        });
    }
    harness.feed(Input::ProfilesConnectCfm {
        addr: HANDSET,
        success: true,
    });
    assert_eq!(ShadowState::Disconnected, harness.earbud.shadow().state());

    harness.complete_peer_link()?;
    assert!(harness.earbud.peer_signalling().is_connected());
    assert_eq!(ShadowState::AclConnecting, harness.earbud.shadow().state());
    assert!(harness.calls.contains(&PlatformCall::ShadowAclCreate {
        handset: HANDSET,
        peer: PEER,
    }));

    harness.feed(Input::Sdm(SdmEvent::AclCreateCfm { success: true }));
    assert_eq!(ShadowState::AclConnected, harness.earbud.shadow().state());

    harness.feed(Input::Audio(AudioEvent::ScoConnected {
        params: EscoParams::default(),
    }));
    assert_eq!(ShadowState::EscoConnecting, harness.earbud.shadow().state());
    assert!(
        harness
            .calls
            .contains(&PlatformCall::ShadowEscoCreate { handset: HANDSET })
    );

    harness.feed(Input::Sdm(SdmEvent::EscoCreateCfm { success: true }));

    assert_eq!(
        vec![
            "initialising",
            "disconnected",
            "peer_connected",
            "acl_connecting",
            "acl_connected",
            "esco_connecting",
            "esco_connected",
        ],
        harness.transitions(TaskId::ShadowProfile, None)
    );
    let indications: Vec<_> = harness
        .delivered_to(WATCHER)
        .into_iter()
        .filter_map(|message| match message {
            Message::Shadow(indication) => Some(*indication),
            _ => None,
        })
        .collect();
    assert_eq!(
        vec![ShadowIndication::AclConnectInd, ShadowIndication::EscoConnectInd],
        indications
    );
    Ok(())
}

#[rstest]
#[case::primary(Role::Primary, DfuRuleEvent::RoleSelectedPrimary, DfuGoal::Primary, true)]
#[case::secondary(Role::Secondary, DfuRuleEvent::RoleSelectedSecondary, DfuGoal::Secondary, false)]
fn aborted_ble_upgrade_is_cleaned_up_by_the_primary_only(
    #[case] role: Role,
    #[case] selected: DfuRuleEvent,
    #[case] goal: DfuGoal,
    #[case] cleans_up: bool,
) -> Result<()> {
    let mut harness = Harness::paired([FakeUpdate::PairHandset {
        addr: HANDSET,
        tws_plus: false,
        was_connected: true,
        last_connected_profiles: Default::default(),
    }])?;
    harness.start();
    harness.feed(Input::TopologyStarted { role });
    harness.feed(Input::PhyState {
        state: PhyState::OutOfEar,
    });
    harness
        .earbud
        .platform_mut()
        .apply(FakeUpdate::BleLink { connected: true });

    harness.feed(Input::RoleChanged { role: Role::Dfu });
    harness.feed(Input::DfuEvent { event: selected });
    harness.feed(Input::DfuEvent {
        event: DfuRuleEvent::DfuAborted,
    });

    let goals = harness.dfu_goals();
    let selected_at = goals.iter().position(|delivered| *delivered == goal);
    let cleanup_at = goals
        .iter()
        .position(|delivered| *delivered == DfuGoal::LePrimaryAbortCleanup);
    assert!(selected_at.is_some());
    assert_eq!(cleans_up, cleanup_at.is_some());
    if cleans_up {
        assert!(selected_at < cleanup_at);
    }
    Ok(())
}
