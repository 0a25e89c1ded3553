use tracing::{debug, info, instrument, warn};

use super::{AppSm, AppTimer, Links, PendingConnect, Phase, PostDisconnect, Substate};
use crate::collaborators::Platform;
use crate::handset_service::HandsetRequest;
use crate::message::{Message, TaskId};
use crate::peer_signalling::PeerSigRequest;
use crate::profiles::ProfileMask;
use crate::rules::{ConnRuleAction, PostConnectAction, RuleMessage, RunParams};

impl AppSm {
    /// Executes one action from the active connection rule set.
    ///
    /// Most actions are reported complete straight away. Pairing completes
    /// when the pairing state is left, handset connects when the handset
    /// service confirms, and always-evaluate actions never complete.
    #[instrument(skip(self, platform), level = "debug", fields(state = %self.state))]
    pub(super) fn run_action(&mut self, platform: &mut dyn Platform, rule: RuleMessage<ConnRuleAction>) {
        use ConnRuleAction as A;

        let params = rule.params;
        let flag = params.and_then(RunParams::as_bool);
        debug!(action = %rule.action, ?params, "rule action");

        match rule.action {
            A::Nop => return,
            A::PeerPair => {
                if self.state.phase == Phase::Startup {
                    self.set_state(platform, Phase::PeerPairing.into());
                    return;
                }
                debug!("not in startup, peer pairing skipped");
            }
            A::HandsetPair => {
                if matches!(self.state.phase, Phase::OutOfCaseIdle | Phase::InEarIdle)
                    && self.state.substate == Substate::None
                {
                    self.set_state(platform, Phase::HandsetPairing.into());
                    return;
                }
                debug!("busy, handset pairing skipped");
            }
            A::AllowHandsetConnect => platform.allow_handset_connect(true),
            A::RejectHandsetConnect => platform.allow_handset_connect(false),
            A::PeerSendLinkKeys => self.send_link_keys(platform),
            A::ConnectHandset | A::HandoverReconnectHandset | A::HandoverReconnectHandsetAndPlay => {
                let profiles = params
                    .and_then(RunParams::profiles)
                    .unwrap_or(ProfileMask::HANDSET);
                let post = match (rule.action, params) {
                    (A::HandoverReconnectHandsetAndPlay, _) => PostConnectAction::PlayMedia,
                    (_, Some(params)) => params.post_action(),
                    (_, None) => PostConnectAction::None,
                };
                self.connect_handset(platform, rule.action, profiles, post);
                return;
            }
            A::ConnectPeerHandset => {
                let profiles = params
                    .and_then(RunParams::profiles)
                    .unwrap_or(ProfileMask::HANDSET);
                match platform.peer_handset_addr() {
                    Some(addr) => {
                        info!(%addr, %profiles, "connecting the peer's handset");
                        self.outbox.send(
                            TaskId::HandsetService,
                            Message::HandsetRequest(HandsetRequest::ConnectAddress {
                                task: TaskId::AppSm,
                                addr,
                                profiles,
                            }),
                        );
                    }
                    None => debug!("peer has no handset"),
                }
            }
            A::ConnectPeer => {
                let profiles = params
                    .and_then(RunParams::profiles)
                    .unwrap_or(ProfileMask::PEER_SIGNALLING);
                self.connect_peer(platform, profiles);
            }
            A::UpdateMruHandset => {
                if let Some(addr) = platform.peer_handset_addr().filter(|addr| platform.is_handset(*addr)) {
                    platform.set_mru_handset(addr);
                }
            }
            A::SendStatusToHandset => {
                if let Some(addr) = platform.handset_addr() {
                    platform.send_status_to_handset(addr);
                }
            }
            A::DisconnectHandset => {
                if let Some(addr) = platform.handset_addr() {
                    self.outbox.send(
                        TaskId::HandsetService,
                        Message::HandsetRequest(HandsetRequest::Disconnect {
                            task: TaskId::AppSm,
                            addr,
                        }),
                    );
                }
            }
            A::DisconnectPeer => self.outbox.send(
                TaskId::PeerSignalling,
                Message::PeerSigRequest(PeerSigRequest::Shutdown {
                    task: TaskId::AppSm,
                }),
            ),
            A::A2dpTimeout => {
                if self.state.is_out_of_case()
                    || (!platform.is_peer_in_case() && !platform.is_peer_in_ear())
                {
                    self.timers
                        .start(AppTimer::A2dpPause, self.config.app.a2dp_out_of_ear_pause);
                }
            }
            A::A2dpTimeoutCancel => {
                self.timers.cancel(AppTimer::A2dpPause);
                self.timers.cancel(AppTimer::ScoTransfer);
            }
            A::MediaPlay => {
                platform.media_play();
                self.timers.cancel(AppTimer::A2dpRestart);
            }
            A::ScoTimeout => {
                if self.state.is_out_of_case() {
                    self.timers
                        .start(AppTimer::ScoTransfer, self.config.app.sco_out_of_ear_transfer);
                }
            }
            A::ScoTransferToEarbud => platform.transfer_sco(true),
            A::ScoTransferToHandset => platform.transfer_sco(false),
            A::ScoForwardingControl => match flag {
                Some(enabled) => platform.set_sco_forwarding(enabled),
                None => warn!("sco forwarding control without a setting"),
            },
            A::SelectMic => match params.and_then(RunParams::mic) {
                Some(mic) => platform.select_mic(mic),
                None => warn!("mic selection without a microphone"),
            },
            A::LedEnable => platform.set_leds_enabled(true),
            A::LedDisable => platform.set_leds_enabled(false),
            A::AncEnable => platform.set_anc_enabled(true),
            A::AncDisable => platform.set_anc_enabled(false),
            A::AncTuningStart => platform.set_anc_tuning(true),
            A::AncTuningStop => platform.set_anc_tuning(false),
            A::EnterDfu => self.enter_dfu(platform),
            A::DfuAllow => {
                platform.allow_dfu(flag.unwrap_or(false));
                return;
            }
            A::PageScanUpdate => {
                match flag {
                    Some(enabled) => platform.set_page_scan(enabled),
                    None => warn!("page scan update without a setting"),
                }
                return;
            }
            A::BleConnectionUpdate => {
                match flag {
                    Some(connectable) => platform.set_ble_connectable(connectable),
                    None => warn!("ble update without a setting"),
                }
                return;
            }
            A::DecideRole => match flag {
                Some(primary) => platform.request_role(primary),
                None => debug!("no role preference"),
            },
            A::HandoverDisconnectHandset => {
                let play_media = self.audio.a2dp_streaming;
                self.disconnect_links(platform, Links::Handset, PostDisconnect::Handover { play_media });
                return;
            }
        }
        self.complete(platform, rule.action);
    }

    fn connect_handset(
        &mut self,
        platform: &dyn Platform,
        action: ConnRuleAction,
        profiles: ProfileMask,
        post: PostConnectAction,
    ) {
        let addr = platform.handset_addr();
        info!(?addr, %profiles, %post, "connecting handset");
        self.outbox.send(
            TaskId::HandsetService,
            Message::HandsetRequest(HandsetRequest::ConnectMru {
                task: TaskId::AppSm,
                profiles,
            }),
        );
        self.pending_connects
            .push(PendingConnect { addr, action, post });
    }

    /// Starts peer signalling and any peer audio profiles in `profiles`.
    fn connect_peer(&mut self, platform: &mut dyn Platform, profiles: ProfileMask) {
        let Some(peer) = platform.peer_addr() else {
            debug!("no peer paired");
            return;
        };
        info!(%peer, %profiles, "connecting peer");
        self.outbox.send(
            TaskId::PeerSignalling,
            Message::PeerSigRequest(PeerSigRequest::Startup {
                task: TaskId::AppSm,
                addr: peer,
            }),
        );
        let audio: Vec<_> = (profiles & (ProfileMask::A2DP | ProfileMask::SCOFWD))
            .iter()
            .collect();
        if !audio.is_empty() {
            platform.connect_profiles(peer, &audio);
        }
    }

    fn send_link_keys(&mut self, platform: &dyn Platform) {
        let Some(peer) = platform.peer_addr() else {
            return;
        };
        for addr in platform.paired_devices() {
            if addr == peer {
                continue;
            }
            if let Some(key) = platform.link_key(addr) {
                debug!(%addr, "forwarding link key");
                self.outbox.send(
                    TaskId::PeerSignalling,
                    Message::PeerSigRequest(PeerSigRequest::LinkKeyTx {
                        task: TaskId::AppSm,
                        addr,
                        key,
                    }),
                );
            }
        }
    }
}
