//! Connection rules run while this earbud is the Primary.
//!
//! Conditions only read state. Anything they decide is carried out by the
//! application state machine when the action message arrives.

use strum_macros::Display;
use tracing::debug;

use crate::bdaddr::Transport;
use crate::error::RuleEngineError;
use crate::profiles::{Profile, ProfileMask};

use super::action::{ConnRuleAction, MicSelection, PostConnectAction, RunParams};
use super::context::{Condition, RuleContext};
use super::engine::{Rule, RuleAction, RuleFlags, RuleSet};
use super::event::{ConnRuleEvent, RuleEventId};

/// Why a connect decision is being made. Several rules honour connection
/// history only for some reasons.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectReason {
    User,
    Pairing,
    PeerSync,
    PeerEvent,
    OutOfCase,
    LinkLoss,
    PeerOutOfCase,
}

impl ConnectReason {
    /// Reasons that force HFP and A2DP on and connect without history.
    const fn is_forced(self) -> bool {
        matches!(self, Self::User | Self::Pairing | Self::OutOfCase)
    }
}

pub(super) fn rule(
    event: ConnRuleEvent,
    name: &'static str,
    condition: Condition,
    action: ConnRuleAction,
) -> Rule<ConnRuleAction, Condition> {
    Rule::new(event.mask(), name, condition, action)
}

/// Builds the Primary rule set.
///
/// # Errors
///
/// Returns [`RuleEngineError`] if the table is malformed.
pub fn primary_rule_set() -> Result<RuleSet<ConnRuleAction, Condition>, RuleEngineError> {
    RuleSet::new("primary", primary_rules(), ConnRuleAction::Nop)
}

fn primary_rules() -> Vec<Rule<ConnRuleAction, Condition>> {
    use ConnRuleAction as A;
    use ConnRuleEvent as E;

    vec![
        rule(E::CheckDfu, "check_upgradable", check_upgradable, A::DfuAllow)
            .with_flags(RuleFlags::AlwaysEvaluate),
        rule(E::Startup, "peer_pair", peer_pair, A::PeerPair),
        rule(E::RoleSwitch, "auto_handset_pair", auto_handset_pair, A::HandsetPair),
        rule(
            E::OutCase,
            "out_of_case_allow_handset_connect",
            out_of_case_allow_handset_connect,
            A::AllowHandsetConnect,
        ),
        rule(E::OutCase, "auto_handset_pair", auto_handset_pair, A::HandsetPair),
        rule(
            E::PeerUpdateLinkkeys,
            "forward_link_keys",
            forward_link_keys,
            A::PeerSendLinkKeys,
        ),
        rule(E::PeerConnected, "forward_link_keys", forward_link_keys, A::PeerSendLinkKeys),
        rule(E::PeerSync, "sync_connect_peer", sync_connect_peer, A::ConnectPeer),
        rule(E::PeerSync, "sync_disconnect_peer", sync_disconnect_peer, A::DisconnectPeer),
        rule(
            E::PeerSync,
            "sync_disconnect_handset",
            sync_disconnect_handset,
            A::DisconnectHandset,
        ),
        rule(E::PeerSync, "update_mru_handset", update_mru_handset, A::UpdateMruHandset),
        rule(
            E::PeerSync,
            "send_status_to_handset",
            send_status_to_handset,
            A::SendStatusToHandset,
        ),
        rule(E::UserConnect, "user_connect_handset", user_connect_handset, A::ConnectHandset),
        rule(
            E::UserConnect,
            "user_connect_peer_handset",
            user_connect_peer_handset,
            A::ConnectPeerHandset,
        ),
        rule(E::UserConnect, "user_connect_peer", user_connect_peer, A::ConnectPeer),
        rule(
            E::OutCase,
            "out_of_case_connect_handset",
            out_of_case_connect_handset,
            A::ConnectHandset,
        ),
        rule(
            E::OutCase,
            "out_of_case_connect_peer_handset",
            out_of_case_connect_peer_handset,
            A::ConnectPeerHandset,
        ),
        rule(E::OutCase, "out_of_case_connect_peer", out_of_case_connect_peer, A::ConnectPeer),
        rule(
            E::HandsetLinkLoss,
            "link_loss_connect_handset",
            link_loss_connect_handset,
            A::ConnectHandset,
        ),
        rule(
            E::PeerHandsetLinkLoss,
            "link_loss_connect_peer_handset",
            link_loss_connect_peer_handset,
            A::ConnectPeerHandset,
        ),
        rule(
            E::PeerHandsetDisconnected,
            "peer_event_connect_handset",
            peer_event_connect_handset,
            A::ConnectHandset,
        ),
        rule(
            E::PeerPairing,
            "pairing_connect_peer_handset",
            pairing_connect_peer_handset,
            A::ConnectPeerHandset,
        ),
        rule(
            E::PeerPairing,
            "pairing_connect_tws_plus_a2dp",
            pairing_connect_tws_plus_a2dp,
            A::ConnectHandset,
        ),
        rule(
            E::PeerPairing,
            "pairing_connect_tws_plus_hfp",
            pairing_connect_tws_plus_hfp,
            A::ConnectHandset,
        ),
        rule(
            E::PeerHandsetConnected,
            "both_connected_disconnect",
            both_connected_disconnect,
            A::DisconnectHandset,
        ),
        rule(E::HandsetA2dpConnected, "disconnect_peer", disconnect_peer, A::DisconnectPeer),
        rule(E::HandsetHfpConnected, "disconnect_peer", disconnect_peer, A::DisconnectPeer),
        rule(
            E::InCase,
            "in_case_disconnect_handset",
            in_case_disconnect_handset,
            A::DisconnectHandset,
        ),
        rule(E::InCase, "in_case_disconnect_peer", in_case_disconnect_peer, A::DisconnectPeer),
        rule(
            E::PeerInCase,
            "peer_in_case_disconnect_peer",
            peer_in_case_disconnect_peer,
            A::DisconnectPeer,
        ),
        rule(
            E::DfuConnect,
            "dfu_allow_handset_connect",
            dfu_allow_handset_connect,
            A::AllowHandsetConnect,
        ),
        rule(E::OutCase, "out_of_case_anc_tuning", anc_tuning, A::AncTuningStop),
        rule(E::InCase, "in_case_anc_tuning", anc_tuning, A::AncTuningStart),
        rule(E::OutEar, "out_of_ear_anc_disable", always_run, A::AncDisable),
        rule(E::InEar, "in_ear_anc_enable", always_run, A::AncEnable),
        rule(E::InCase, "in_case_enter_dfu", in_case_enter_dfu, A::EnterDfu),
        rule(
            E::InCase,
            "in_case_reject_handset_connect",
            in_case_reject_handset_connect,
            A::RejectHandsetConnect,
        ),
        rule(E::OutEar, "out_of_ear_a2dp_active", out_of_ear_a2dp_active, A::A2dpTimeout),
        rule(E::PeerOutEar, "out_of_ear_a2dp_active", out_of_ear_a2dp_active, A::A2dpTimeout),
        rule(E::InEar, "in_ear_cancel_audio_pause", always_run, A::A2dpTimeoutCancel),
        rule(E::InCase, "in_ear_cancel_audio_pause", always_run, A::A2dpTimeoutCancel),
        rule(E::PeerInEar, "in_ear_cancel_audio_pause", always_run, A::A2dpTimeoutCancel),
        rule(E::PeerInCase, "in_ear_cancel_audio_pause", always_run, A::A2dpTimeoutCancel),
        rule(E::InEar, "in_ear_a2dp_restart", in_ear_a2dp_restart, A::MediaPlay),
        rule(E::PeerInEar, "in_ear_a2dp_restart", in_ear_a2dp_restart, A::MediaPlay),
        rule(E::OutEar, "out_of_ear_sco_active", out_of_ear_sco_active, A::ScoTimeout),
        rule(E::PeerOutEar, "out_of_ear_sco_active", out_of_ear_sco_active, A::ScoTimeout),
        rule(E::OutEar, "out_of_ear_leds_enable", leds_follow_ear, A::LedEnable),
        rule(E::InEar, "in_ear_leds_disable", leds_follow_ear, A::LedDisable),
        rule(
            E::InEar,
            "in_ear_sco_transfer_to_earbud",
            in_ear_sco_transfer_to_earbud,
            A::ScoTransferToEarbud,
        ),
        rule(
            E::PeerInEar,
            "in_ear_sco_transfer_to_earbud",
            in_ear_sco_transfer_to_earbud,
            A::ScoTransferToEarbud,
        ),
        rule(
            E::PeerInCase,
            "in_case_sco_transfer_to_handset",
            in_case_sco_transfer_to_handset,
            A::ScoTransferToHandset,
        ),
        rule(
            E::PeerInEar,
            "sco_forwarding_control",
            sco_forwarding_control,
            A::ScoForwardingControl,
        ),
        rule(
            E::PeerOutEar,
            "sco_forwarding_control",
            sco_forwarding_control,
            A::ScoForwardingControl,
        ),
        rule(
            E::ScoActive,
            "sco_forwarding_control",
            sco_forwarding_control,
            A::ScoForwardingControl,
        ),
        rule(E::OutEar, "select_microphone", select_microphone, A::SelectMic),
        rule(E::InEar, "select_microphone", select_microphone, A::SelectMic),
        rule(E::PeerInEar, "select_microphone", select_microphone, A::SelectMic),
        rule(E::PeerOutEar, "select_microphone", select_microphone, A::SelectMic),
        rule(E::PageScanUpdate, "page_scan_update", page_scan_update, A::PageScanUpdate)
            .with_flags(RuleFlags::AlwaysEvaluate),
        rule(
            E::BleConnectableChange,
            "ble_connection_update",
            ble_connection_update,
            A::BleConnectionUpdate,
        )
        .with_flags(RuleFlags::AlwaysEvaluate),
        rule(
            E::HandoverDisconnect,
            "handover_disconnect_handset",
            handover_disconnect_handset,
            A::HandoverDisconnectHandset,
        )
        .with_flags(RuleFlags::ProgressMatters),
        rule(
            E::HandoverReconnect,
            "handover_connect_handset",
            handover_connect_handset,
            A::HandoverReconnectHandset,
        ),
        rule(
            E::HandoverReconnectAndPlay,
            "handover_connect_handset_and_play",
            handover_connect_handset_and_play,
            A::HandoverReconnectHandsetAndPlay,
        ),
    ]
}

fn always_run(_: &RuleContext<'_>) -> RuleAction {
    RuleAction::Run
}

pub(super) fn check_upgradable(ctx: &RuleContext<'_>) -> RuleAction {
    let features = &ctx.config.features;
    let allow = if ctx.app.out_of_case {
        if features.dfu_only_from_ui_in_case {
            false
        } else if ctx.platform.any_transport_link_connected(Transport::Ble)
            && features.dfu_allow_ble_upgrade_out_of_case
        {
            true
        } else {
            ctx.handset_connected() && features.dfu_allow_bredr_upgrade_out_of_case
        }
    } else if features.dfu_only_from_ui_in_case {
        ctx.app.dfu_pending
    } else {
        true
    };
    debug!(allow, "check_upgradable");
    RuleAction::RunWithParam(RunParams::Bool(allow))
}

pub(super) fn peer_pair(ctx: &RuleContext<'_>) -> RuleAction {
    if ctx.platform.is_paired_with_peer() {
        RuleAction::Complete
    } else {
        RuleAction::Run
    }
}

fn auto_handset_pair(ctx: &RuleContext<'_>) -> RuleAction {
    if ctx.app.in_case {
        return RuleAction::Ignore;
    }
    if ctx.platform.is_paired_with_handset() {
        return RuleAction::Complete;
    }
    if ctx.platform.is_peer_pairing() {
        return RuleAction::Defer;
    }
    if ctx.app.pairing {
        return RuleAction::Ignore;
    }
    if ctx.platform.has_peer_handset_pairing() {
        return RuleAction::Complete;
    }
    if !ctx.app.role.is_primary() {
        return RuleAction::Ignore;
    }
    RuleAction::Run
}

fn forward_link_keys(ctx: &RuleContext<'_>) -> RuleAction {
    if ctx.platform.is_paired_with_peer() {
        RuleAction::Run
    } else {
        RuleAction::Ignore
    }
}

/// Gate applied to standard handsets: only some reasons reconnect, and only
/// out of the case.
fn connect_handset_standard(ctx: &RuleContext<'_>, reason: ConnectReason) -> bool {
    matches!(
        reason,
        ConnectReason::User
            | ConnectReason::LinkLoss
            | ConnectReason::PeerEvent
            | ConnectReason::OutOfCase
    ) && ctx.app.out_of_case
}

fn connect_handset(
    ctx: &RuleContext<'_>,
    reason: ConnectReason,
    post_action: PostConnectAction,
) -> RuleAction {
    if ctx.app.in_case || ctx.app.pairing {
        return RuleAction::Ignore;
    }
    if ctx.platform.is_peer_dfu_in_progress() || ctx.platform.is_peer_pairing() {
        debug!(%reason, "connect_handset, ignore as peer is busy");
        return RuleAction::Ignore;
    }
    let Some(handset) = ctx.platform.handset_addr() else {
        return RuleAction::Ignore;
    };
    if ctx.platform.connected_profiles(handset).contains(ProfileMask::HANDSET) {
        return RuleAction::Ignore;
    }

    let mut profiles = ctx.platform.last_connected_profiles(handset);

    // TWS+ handsets are decided from local history alone, whether or not the
    // peer has synchronised.
    if ctx.handset_is_tws_plus(handset) {
        if reason.is_forced() {
            profiles |= ProfileMask::HFP | ProfileMask::A2DP;
        }
        if profiles.is_empty() {
            debug!(%reason, "connect_handset, ignore as TWS+ handset was not connected before");
            return RuleAction::Ignore;
        }
        if ctx.platform.is_just_paired(handset) {
            return RuleAction::Ignore;
        }
        debug!(%reason, %profiles, "connect_handset, run for TWS+ handset");
        return RuleAction::RunWithParam(RunParams::ConnectHandset {
            profiles,
            post_action,
        });
    }

    let history = ctx.platform.was_connected(handset);
    let forced = reason.is_forced() || reason == ConnectReason::PeerEvent;
    if !(history || forced) {
        return RuleAction::Ignore;
    }
    if forced {
        profiles |= ProfileMask::HFP | ProfileMask::A2DP;
    }
    if !connect_handset_standard(ctx, reason) {
        debug!(%reason, "connect_handset, ignore standard handset");
        return RuleAction::Ignore;
    }
    debug!(%reason, %profiles, "connect_handset, run for standard handset");
    RuleAction::RunWithParam(RunParams::ConnectHandset {
        profiles,
        post_action,
    })
}

fn user_connect_handset(ctx: &RuleContext<'_>) -> RuleAction {
    connect_handset(ctx, ConnectReason::User, PostConnectAction::PlayMedia)
}

fn out_of_case_connect_handset(ctx: &RuleContext<'_>) -> RuleAction {
    connect_handset(ctx, ConnectReason::OutOfCase, PostConnectAction::None)
}

fn link_loss_connect_handset(ctx: &RuleContext<'_>) -> RuleAction {
    connect_handset(ctx, ConnectReason::LinkLoss, PostConnectAction::None)
}

fn peer_event_connect_handset(ctx: &RuleContext<'_>) -> RuleAction {
    connect_handset(ctx, ConnectReason::PeerEvent, PostConnectAction::None)
}

fn handover_connect_handset(ctx: &RuleContext<'_>) -> RuleAction {
    connect_handset(ctx, ConnectReason::User, PostConnectAction::None)
}

fn handover_connect_handset_and_play(ctx: &RuleContext<'_>) -> RuleAction {
    connect_handset(ctx, ConnectReason::User, PostConnectAction::PlayMedia)
}

fn connect_peer_handset(ctx: &RuleContext<'_>, reason: ConnectReason) -> RuleAction {
    if ctx.app.in_case || ctx.app.pairing || ctx.platform.is_peer_pairing() {
        return RuleAction::Ignore;
    }
    if reason != ConnectReason::Pairing && !ctx.peer_handset_has_audio() {
        return RuleAction::Complete;
    }
    if !ctx.platform.is_peer_handset_tws() {
        return RuleAction::Ignore;
    }
    let Some(peer_handset) = ctx.platform.peer_handset_addr() else {
        return RuleAction::Ignore;
    };
    if !ctx.platform.is_handset(peer_handset) || ctx.platform.is_just_paired(peer_handset) {
        return RuleAction::Ignore;
    }
    if !reason.is_forced() {
        return RuleAction::Ignore;
    }

    let mut profiles = ctx.peer_handset_profiles();
    if reason == ConnectReason::Pairing {
        profiles |= ProfileMask::HANDSET;
    }
    debug!(%reason, %profiles, "connect_peer_handset, run");
    RuleAction::RunWithParam(RunParams::Profiles(profiles))
}

fn user_connect_peer_handset(ctx: &RuleContext<'_>) -> RuleAction {
    connect_peer_handset(ctx, ConnectReason::User)
}

fn out_of_case_connect_peer_handset(ctx: &RuleContext<'_>) -> RuleAction {
    connect_peer_handset(ctx, ConnectReason::OutOfCase)
}

fn link_loss_connect_peer_handset(ctx: &RuleContext<'_>) -> RuleAction {
    connect_peer_handset(ctx, ConnectReason::LinkLoss)
}

fn pairing_connect_peer_handset(ctx: &RuleContext<'_>) -> RuleAction {
    connect_peer_handset(ctx, ConnectReason::Pairing)
}

fn connect_peer(ctx: &RuleContext<'_>, reason: ConnectReason) -> RuleAction {
    let peer_profiles = ctx.platform.peer_profiles();
    if peer_profiles.has(Profile::A2dp)
        && peer_profiles.intersects(ProfileMask::SCOFWD | ProfileMask::SHADOW)
    {
        return RuleAction::Ignore;
    }
    if ctx.app.pairing || ctx.platform.is_peer_in_case() || ctx.platform.is_peer_pairing() {
        return RuleAction::Ignore;
    }
    if ctx.peer_handset_has_audio() {
        return RuleAction::Ignore;
    }
    let Some(handset) = ctx.platform.handset_addr() else {
        return RuleAction::Ignore;
    };
    if ctx.handset_is_tws_plus(handset) {
        return RuleAction::Ignore;
    }
    let Some(peer) = ctx.platform.peer_addr() else {
        return RuleAction::Ignore;
    };

    let mut profiles = ctx.platform.last_connected_profiles(peer);
    let wants_av = matches!(
        reason,
        ConnectReason::OutOfCase | ConnectReason::User | ConnectReason::PeerSync
    );
    if wants_av && !ctx.config.shadow.enabled {
        profiles |= ProfileMask::A2DP;
        if ctx.config.features.sco_forwarding {
            profiles |= ProfileMask::SCOFWD;
        }
    }

    let handset_audio = ctx
        .platform
        .connected_profiles(handset)
        .intersects(ProfileMask::A2DP | ProfileMask::HFP);
    if handset_audio || connect_handset_standard(ctx, reason) {
        debug!(%reason, %profiles, "connect_peer, run");
        RuleAction::RunWithParam(RunParams::Profiles(profiles))
    } else {
        RuleAction::Ignore
    }
}

fn sync_connect_peer(ctx: &RuleContext<'_>) -> RuleAction {
    connect_peer(ctx, ConnectReason::PeerSync)
}

fn user_connect_peer(ctx: &RuleContext<'_>) -> RuleAction {
    connect_peer(ctx, ConnectReason::User)
}

fn out_of_case_connect_peer(ctx: &RuleContext<'_>) -> RuleAction {
    connect_peer(ctx, ConnectReason::OutOfCase)
}

fn update_mru_handset(ctx: &RuleContext<'_>) -> RuleAction {
    if !ctx.peer_handset_has_audio() {
        return RuleAction::Ignore;
    }
    match ctx.platform.peer_handset_addr() {
        Some(addr) if ctx.platform.is_handset(addr) => RuleAction::Run,
        _ => RuleAction::Ignore,
    }
}

pub(super) fn send_status_to_handset(ctx: &RuleContext<'_>) -> RuleAction {
    let Some(handset) = ctx.platform.handset_addr() else {
        return RuleAction::Ignore;
    };
    if ctx.handset_is_tws_plus(handset)
        && ctx
            .platform
            .connected_profiles(handset)
            .intersects(ProfileMask::HFP | ProfileMask::AVRCP)
    {
        RuleAction::Run
    } else {
        RuleAction::Ignore
    }
}

fn sync_disconnect_peer(ctx: &RuleContext<'_>) -> RuleAction {
    if ctx.peer_av_connected() && ctx.platform.is_peer_pairing() {
        RuleAction::Run
    } else {
        RuleAction::Ignore
    }
}

fn sync_disconnect_handset(ctx: &RuleContext<'_>) -> RuleAction {
    if ctx.handset_connected() && ctx.platform.is_peer_pairing() {
        RuleAction::Run
    } else {
        RuleAction::Ignore
    }
}

fn pairing_connect_tws_plus(ctx: &RuleContext<'_>, profile: ProfileMask) -> RuleAction {
    if !ctx.app.out_of_case {
        return RuleAction::Ignore;
    }
    let Some(handset) = ctx.platform.handset_addr() else {
        return RuleAction::Ignore;
    };
    if !ctx.handset_is_tws_plus(handset) || ctx.platform.peer_handset_addr() != Some(handset) {
        return RuleAction::Ignore;
    }
    if ctx.platform.connected_profiles(handset).contains(profile) {
        return RuleAction::Ignore;
    }
    RuleAction::RunWithParam(RunParams::ConnectHandset {
        profiles: profile,
        post_action: PostConnectAction::None,
    })
}

fn pairing_connect_tws_plus_a2dp(ctx: &RuleContext<'_>) -> RuleAction {
    pairing_connect_tws_plus(ctx, ProfileMask::A2DP)
}

fn pairing_connect_tws_plus_hfp(ctx: &RuleContext<'_>) -> RuleAction {
    pairing_connect_tws_plus(ctx, ProfileMask::HFP)
}

/// Weight of one earbud's hold on a handset: one point per profile plus three
/// each for active SCO and A2DP streaming.
#[must_use]
pub fn handset_score(profiles: ProfileMask, sco_active: bool, streaming: bool) -> u32 {
    (profiles & ProfileMask::HANDSET).count()
        + if sco_active { 3 } else { 0 }
        + if streaming { 3 } else { 0 }
}

/// Whether the earbud with `local` score gives up a handset both earbuds hold.
///
/// Equal scores are broken by the left earbud yielding.
#[must_use]
pub const fn yields_handset(local: u32, peer: u32, is_left: bool) -> bool {
    if local == peer { is_left } else { local < peer }
}

fn both_connected_disconnect(ctx: &RuleContext<'_>) -> RuleAction {
    let Some(handset) = ctx.platform.handset_addr() else {
        return RuleAction::Ignore;
    };
    if !ctx.handset_connected()
        || !ctx.peer_has_handset()
        || ctx.handset_is_tws_plus(handset)
        || ctx.platform.peer_handset_addr() != Some(handset)
    {
        return RuleAction::Ignore;
    }

    let local = handset_score(ctx.handset_profiles(), ctx.app.sco_active, ctx.app.a2dp_streaming);
    let peer = handset_score(
        ctx.peer_handset_profiles(),
        ctx.platform.is_peer_sco_active(),
        ctx.platform.is_peer_a2dp_streaming(),
    );
    let yields = yields_handset(local, peer, ctx.config.app.is_left);
    debug!(local, peer, yields, "both_connected_disconnect");
    if yields { RuleAction::Run } else { RuleAction::Ignore }
}

fn disconnect_peer(ctx: &RuleContext<'_>) -> RuleAction {
    if !ctx.peer_av_connected() {
        return RuleAction::Ignore;
    }
    let Some(handset) = ctx.platform.handset_addr() else {
        return RuleAction::Run;
    };
    let handset_audio = ctx
        .platform
        .connected_profiles(handset)
        .intersects(ProfileMask::A2DP | ProfileMask::HFP);
    if handset_audio && !ctx.handset_is_tws_plus(handset) {
        RuleAction::Ignore
    } else {
        RuleAction::Run
    }
}

fn in_case_disconnect_handset(ctx: &RuleContext<'_>) -> RuleAction {
    if !ctx.app.in_case || ctx.app.dfu_pending {
        return RuleAction::Ignore;
    }
    if ctx.handset_connected() && !ctx.app.scofwd_sending {
        // Hand the handset over to the other earbud.
        RuleAction::RunWithParam(RunParams::Bool(true))
    } else {
        RuleAction::Ignore
    }
}

fn in_case_disconnect_peer(ctx: &RuleContext<'_>) -> RuleAction {
    if !ctx.app.in_case || ctx.app.dfu_pending {
        return RuleAction::Ignore;
    }
    if ctx.peer_av_connected() && !ctx.app.scofwd_sending {
        RuleAction::Run
    } else {
        RuleAction::Ignore
    }
}

fn peer_in_case_disconnect_peer(ctx: &RuleContext<'_>) -> RuleAction {
    if ctx.app.in_case && ctx.app.dfu_pending {
        return RuleAction::Ignore;
    }
    if ctx.platform.is_peer_in_case() && ctx.peer_av_connected() {
        RuleAction::Run
    } else {
        RuleAction::Ignore
    }
}

pub(super) fn in_case_enter_dfu(ctx: &RuleContext<'_>) -> RuleAction {
    if ctx.config.features.dfu && ctx.app.in_case && ctx.app.dfu_pending {
        RuleAction::Run
    } else {
        RuleAction::Ignore
    }
}

fn dfu_allow_handset_connect(ctx: &RuleContext<'_>) -> RuleAction {
    if !ctx.config.features.dfu || ctx.handset_connected() {
        return RuleAction::Ignore;
    }
    if ctx.config.features.dfu_only_from_ui_in_case || ctx.app.in_dfu_mode {
        RuleAction::Run
    } else {
        RuleAction::Ignore
    }
}

pub(super) fn out_of_case_allow_handset_connect(_: &RuleContext<'_>) -> RuleAction {
    RuleAction::Run
}

pub(super) fn in_case_reject_handset_connect(ctx: &RuleContext<'_>) -> RuleAction {
    if ctx.config.features.dfu && ctx.app.dfu_pending {
        RuleAction::Ignore
    } else {
        RuleAction::Run
    }
}

fn anc_tuning(ctx: &RuleContext<'_>) -> RuleAction {
    if ctx.config.features.anc_tuning {
        RuleAction::Run
    } else {
        RuleAction::Ignore
    }
}

fn out_of_ear_a2dp_active(ctx: &RuleContext<'_>) -> RuleAction {
    if ctx.app.a2dp_streaming {
        RuleAction::Run
    } else {
        RuleAction::Ignore
    }
}

fn in_ear_a2dp_restart(ctx: &RuleContext<'_>) -> RuleAction {
    if ctx.app.a2dp_restart_pending {
        RuleAction::Run
    } else {
        RuleAction::Ignore
    }
}

fn out_of_ear_sco_active(ctx: &RuleContext<'_>) -> RuleAction {
    if ctx.app.scofwd_sending && ctx.platform.is_peer_in_ear() {
        return RuleAction::Ignore;
    }
    if ctx.app.sco_active && !ctx.app.in_ear {
        RuleAction::Run
    } else {
        RuleAction::Ignore
    }
}

/// LEDs are switched with ear position only when they are not meant to stay
/// on in the ear.
fn leds_follow_ear(ctx: &RuleContext<'_>) -> RuleAction {
    if ctx.config.features.in_ear_leds {
        RuleAction::Ignore
    } else {
        RuleAction::Run
    }
}

fn in_ear_sco_transfer_to_earbud(ctx: &RuleContext<'_>) -> RuleAction {
    if !ctx.app.call_active || ctx.app.sco_active {
        return RuleAction::Ignore;
    }
    let ag_is_tws_plus = ctx
        .app
        .hfp_ag_addr
        .is_some_and(|addr| ctx.handset_is_tws_plus(addr));
    if ctx.app.in_ear || (!ag_is_tws_plus && ctx.platform.is_peer_in_ear()) {
        RuleAction::Run
    } else {
        RuleAction::Ignore
    }
}

fn in_case_sco_transfer_to_handset(ctx: &RuleContext<'_>) -> RuleAction {
    if ctx.app.sco_active && ctx.app.in_case && ctx.platform.is_peer_in_case() {
        RuleAction::Run
    } else {
        RuleAction::Ignore
    }
}

fn sco_forwarding_control(ctx: &RuleContext<'_>) -> RuleAction {
    if !ctx.config.features.sco_forwarding || !ctx.app.sco_active {
        return RuleAction::Ignore;
    }
    RuleAction::RunWithParam(RunParams::Bool(ctx.platform.is_peer_in_ear()))
}

fn select_microphone(ctx: &RuleContext<'_>) -> RuleAction {
    if !ctx.app.in_ear && ctx.platform.is_peer_in_ear() {
        return RuleAction::RunWithParam(RunParams::Mic(MicSelection::Remote));
    }
    if ctx.app.in_ear {
        return RuleAction::RunWithParam(RunParams::Mic(MicSelection::Local));
    }
    RuleAction::Ignore
}

/// Whether inbound BR/EDR page scan should be on.
///
/// | connectable | peer | handset | peer handset | peer handset TWS+ | on |
/// |-------------|------|---------|--------------|-------------------|----|
/// | no          | -    | -       | -            | -                 | no |
/// | yes         | no   | -       | -            | -                 | yes|
/// | yes         | yes  | yes     | -            | -                 | no |
/// | yes         | yes  | no      | yes          | yes               | yes|
/// | yes         | yes  | no      | yes          | no                | no |
/// | yes         | yes  | no      | no           | -                 | yes|
#[must_use]
pub const fn page_scan_wanted(
    connectable: bool,
    peer: bool,
    handset: bool,
    peer_handset: bool,
    peer_handset_tws: bool,
) -> bool {
    if !connectable {
        false
    } else if !peer {
        true
    } else if handset {
        false
    } else if peer_handset {
        peer_handset_tws
    } else {
        true
    }
}

fn page_scan_update(ctx: &RuleContext<'_>) -> RuleAction {
    let wanted = page_scan_wanted(
        ctx.app.connectable,
        ctx.platform.is_peer_connected(),
        ctx.handset_connected(),
        ctx.peer_has_handset(),
        ctx.platform.is_peer_handset_tws(),
    );
    if wanted == ctx.platform.is_page_scan_enabled() {
        return RuleAction::Ignore;
    }
    debug!(wanted, "page_scan_update");
    RuleAction::RunWithParam(RunParams::Bool(wanted))
}

fn ble_connection_update(ctx: &RuleContext<'_>) -> RuleAction {
    let platform = ctx.platform;
    let mut connectable = platform.is_paired_with_peer()
        && platform.is_paired_with_handset()
        && ctx.app.ble_connectable
        && !platform.any_transport_link_connected(Transport::Ble);

    if connectable && platform.is_peer_connected() {
        let peer_in_case = platform.is_peer_in_case();
        if ctx.peer_has_handset()
            || platform.is_peer_dfu_in_progress()
            || (platform.is_peer_advertising() && !peer_in_case)
            || platform.is_peer_ble_connected()
        {
            connectable = false;
        } else if platform.has_peer_handset_pairing() && !ctx.app.in_case && !peer_in_case {
            // Both out of the case: the fuller battery advertises, left wins a tie.
            let (ours, theirs) = platform.battery_levels();
            connectable = ours > theirs || (ours == theirs && ctx.config.app.is_left);
        }
    }

    if connectable == platform.is_ble_connectable() {
        return RuleAction::Ignore;
    }
    debug!(connectable, "ble_connection_update");
    RuleAction::RunWithParam(RunParams::Bool(connectable))
}

fn handover_disconnect_handset(ctx: &RuleContext<'_>) -> RuleAction {
    let Some(handset) = ctx.platform.handset_addr() else {
        return RuleAction::Ignore;
    };
    if !ctx.handset_connected() || ctx.handset_is_tws_plus(handset) {
        return RuleAction::Ignore;
    }
    if ctx.app.dfu_pending {
        RuleAction::Defer
    } else {
        RuleAction::RunWithParam(RunParams::Bool(true))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::config::{AppConfig, EarbudConfig};
    use crate::rules::context::AppSnapshot;
    use crate::rules::context::fixtures::{
        HANDSET, PEER, connect, eval, in_case_primary, out_of_case_primary, paired_platform,
    };

    #[rstest]
    #[case(false, false, false, false, false, false)]
    #[case(false, true, true, true, true, false)]
    #[case(true, false, true, true, false, true)]
    #[case(true, true, true, false, false, false)]
    #[case(true, true, false, true, true, true)]
    #[case(true, true, false, true, false, false)]
    #[case(true, true, false, false, false, true)]
    fn page_scan_truth_table(
        #[case] connectable: bool,
        #[case] peer: bool,
        #[case] handset: bool,
        #[case] peer_handset: bool,
        #[case] peer_handset_tws: bool,
        #[case] expected: bool,
    ) {
        assert_eq!(
            expected,
            page_scan_wanted(connectable, peer, handset, peer_handset, peer_handset_tws)
        );
    }

    #[test]
    fn page_scan_only_emits_on_change() {
        let mut platform = paired_platform();
        let app = out_of_case_primary();
        let config = EarbudConfig::default();

        assert_eq!(
            RuleAction::RunWithParam(RunParams::Bool(true)),
            eval(page_scan_update, &platform, &app, &config)
        );

        platform.page_scan = true;
        assert_eq!(RuleAction::Ignore, eval(page_scan_update, &platform, &app, &config));
    }

    #[rstest]
    #[case(0, 0)]
    #[case(2, 6)]
    #[case(5, 4)]
    #[case(3, 3)]
    #[case(9, 1)]
    fn exactly_one_side_yields(#[case] left_score: u32, #[case] right_score: u32) {
        let left_yields = yields_handset(left_score, right_score, true);
        let right_yields = yields_handset(right_score, left_score, false);

        assert!(left_yields != right_yields);
    }

    #[test]
    fn handset_score_weights_active_audio() {
        assert_eq!(2, handset_score(ProfileMask::A2DP | ProfileMask::AVRCP, false, false));
        assert_eq!(6, handset_score(ProfileMask::HANDSET, true, false));
        assert_eq!(9, handset_score(ProfileMask::HANDSET, true, true));
    }

    #[test]
    fn weaker_earbud_disconnects_shared_standard_handset() {
        let mut platform = paired_platform();
        connect(&mut platform, HANDSET, &[Profile::A2dp, Profile::Avrcp]);
        platform.peer_state.handset_addr = Some(HANDSET);
        platform.peer_state.handset_profiles = ProfileMask::HANDSET;
        platform.peer_state.sco_active = true;
        let app = out_of_case_primary();
        let config = EarbudConfig::default();

        assert_eq!(RuleAction::Run, eval(both_connected_disconnect, &platform, &app, &config));
    }

    #[test]
    fn tied_scores_send_the_left_earbud_away() {
        let mut platform = paired_platform();
        connect(&mut platform, HANDSET, &[Profile::A2dp]);
        platform.peer_state.handset_addr = Some(HANDSET);
        platform.peer_state.handset_profiles = ProfileMask::A2DP;
        let app = out_of_case_primary();
        let right = EarbudConfig::default();
        let left = EarbudConfig::builder()
            .app(AppConfig::builder().is_left(true).build())
            .build();

        assert_eq!(RuleAction::Ignore, eval(both_connected_disconnect, &platform, &app, &right));
        assert_eq!(RuleAction::Run, eval(both_connected_disconnect, &platform, &app, &left));
    }

    #[test]
    fn out_of_case_reconnects_previously_connected_standard_handset() {
        let mut platform = paired_platform();
        platform.peer_device = None;
        platform.devices.remove(&PEER);
        let handset = platform.devices.entry(HANDSET).or_default();
        handset.was_connected = true;
        handset.last_connected = ProfileMask::AVRCP;
        let app = out_of_case_primary();

        assert_eq!(
            RuleAction::RunWithParam(RunParams::ConnectHandset {
                profiles: ProfileMask::HANDSET,
                post_action: PostConnectAction::None,
            }),
            eval(out_of_case_connect_handset, &platform, &app, &EarbudConfig::default())
        );
    }

    #[rstest]
    #[case::link_loss(link_loss_connect_handset as Condition)]
    #[case::peer_event(peer_event_connect_handset as Condition)]
    #[case::user(user_connect_handset as Condition)]
    fn handset_connects_never_run_in_case(#[case] condition: Condition) {
        let mut platform = paired_platform();
        platform.devices.entry(HANDSET).or_default().was_connected = true;

        assert_eq!(
            RuleAction::Ignore,
            eval(condition, &platform, &in_case_primary(), &EarbudConfig::default())
        );
    }

    #[test]
    fn link_loss_needs_history_for_standard_handsets() {
        let platform = paired_platform();

        assert_eq!(
            RuleAction::Ignore,
            eval(
                link_loss_connect_handset,
                &platform,
                &out_of_case_primary(),
                &EarbudConfig::default()
            )
        );
    }

    #[test]
    fn just_paired_tws_plus_handset_is_left_to_connect_itself() {
        let mut platform = paired_platform();
        let handset = platform.devices.entry(HANDSET).or_default();
        handset.tws_plus = true;
        handset.just_paired = true;

        assert_eq!(
            RuleAction::Ignore,
            eval(
                user_connect_handset,
                &platform,
                &out_of_case_primary(),
                &EarbudConfig::default()
            )
        );
    }

    #[test]
    fn tws_plus_handset_reconnects_without_hearing_from_the_peer() {
        let mut platform = paired_platform();
        platform.peer_device = None;
        platform.devices.entry(HANDSET).or_default().tws_plus = true;

        assert_eq!(
            RuleAction::RunWithParam(RunParams::ConnectHandset {
                profiles: ProfileMask::HFP | ProfileMask::A2DP,
                post_action: PostConnectAction::None,
            }),
            eval(
                out_of_case_connect_handset,
                &platform,
                &out_of_case_primary(),
                &EarbudConfig::default()
            )
        );
    }

    #[test]
    fn peer_handset_rules_complete_when_peer_has_no_handset() {
        let platform = paired_platform();

        assert_eq!(
            RuleAction::Complete,
            eval(
                out_of_case_connect_peer_handset,
                &platform,
                &out_of_case_primary(),
                &EarbudConfig::default()
            )
        );
    }

    #[test]
    fn tws_plus_peer_handset_is_joined_with_its_profiles() {
        let mut platform = paired_platform();
        platform.peer_state.handset_addr = Some(HANDSET);
        platform.peer_state.handset_tws = true;
        platform.peer_state.handset_profiles = ProfileMask::A2DP | ProfileMask::AVRCP;

        assert_eq!(
            RuleAction::RunWithParam(RunParams::Profiles(ProfileMask::A2DP | ProfileMask::AVRCP)),
            eval(
                user_connect_peer_handset,
                &platform,
                &out_of_case_primary(),
                &EarbudConfig::default()
            )
        );
    }

    #[test]
    fn auto_handset_pair_waits_for_peer_pairing() {
        let mut platform = paired_platform();
        platform.devices.remove(&HANDSET);
        platform.mru = None;
        platform.peer_state.pairing = true;

        assert_eq!(
            RuleAction::Defer,
            eval(auto_handset_pair, &platform, &out_of_case_primary(), &EarbudConfig::default())
        );
    }

    #[rstest]
    #[case::remote(false, true, RuleAction::RunWithParam(RunParams::Mic(MicSelection::Remote)))]
    #[case::local(true, true, RuleAction::RunWithParam(RunParams::Mic(MicSelection::Local)))]
    #[case::nobody(false, false, RuleAction::Ignore)]
    fn microphone_follows_ear_position(
        #[case] in_ear: bool,
        #[case] peer_in_ear: bool,
        #[case] expected: RuleAction,
    ) {
        let mut platform = paired_platform();
        platform.peer_state.in_ear = peer_in_ear;
        let app = AppSnapshot {
            in_ear,
            ..out_of_case_primary()
        };

        assert_eq!(expected, eval(select_microphone, &platform, &app, &EarbudConfig::default()));
    }

    #[test]
    fn upgrade_out_of_case_needs_an_allowed_transport() {
        let mut platform = paired_platform();
        platform.ble_link = true;
        let app = out_of_case_primary();
        let blocked = EarbudConfig::default();
        let mut allowed = EarbudConfig::default();
        allowed.features.dfu_allow_ble_upgrade_out_of_case = true;

        assert_eq!(
            RuleAction::RunWithParam(RunParams::Bool(false)),
            eval(check_upgradable, &platform, &app, &blocked)
        );
        assert_eq!(
            RuleAction::RunWithParam(RunParams::Bool(true)),
            eval(check_upgradable, &platform, &app, &allowed)
        );
    }

    #[test]
    fn in_case_handset_disconnect_hands_over() {
        let mut platform = paired_platform();
        connect(&mut platform, HANDSET, &[Profile::Hfp]);

        assert_eq!(
            RuleAction::RunWithParam(RunParams::Bool(true)),
            eval(
                in_case_disconnect_handset,
                &platform,
                &in_case_primary(),
                &EarbudConfig::default()
            )
        );
    }

    #[test]
    fn handover_waits_for_pending_upgrade() {
        let mut platform = paired_platform();
        connect(&mut platform, HANDSET, &[Profile::A2dp]);
        let app = AppSnapshot {
            dfu_pending: true,
            ..out_of_case_primary()
        };

        assert_eq!(
            RuleAction::Defer,
            eval(handover_disconnect_handset, &platform, &app, &EarbudConfig::default())
        );
    }

    #[test]
    fn ble_advertising_goes_to_the_fuller_battery() {
        let mut platform = paired_platform();
        connect(&mut platform, PEER, &[Profile::PeerSignalling]);
        platform.peer_state.has_handset_pairing = true;
        platform.peer_state.local_battery = 80;
        platform.peer_state.peer_battery = 90;
        let app = AppSnapshot {
            ble_connectable: true,
            ..out_of_case_primary()
        };

        platform.ble_connectable = true;
        assert_eq!(
            RuleAction::RunWithParam(RunParams::Bool(false)),
            eval(ble_connection_update, &platform, &app, &EarbudConfig::default())
        );

        platform.peer_state.local_battery = 95;
        assert_eq!(
            RuleAction::Ignore,
            eval(ble_connection_update, &platform, &app, &EarbudConfig::default())
        );
    }

    #[test]
    fn table_builds() {
        let set = primary_rule_set().expect("primary table should be valid");

        assert_eq!("primary", set.name());
        assert_eq!(Some("check_upgradable"), set.rules().next().map(Rule::name));
    }

}
