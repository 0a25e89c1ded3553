//! Connection rules run while this earbud is the Secondary.

use crate::error::RuleEngineError;
use crate::profiles::ProfileMask;

use super::action::{ConnRuleAction, RunParams};
use super::context::{Condition, RuleContext};
use super::engine::{Rule, RuleAction, RuleFlags, RuleSet};
use super::event::ConnRuleEvent;
use super::primary::{
    in_case_enter_dfu, in_case_reject_handset_connect, out_of_case_allow_handset_connect,
    peer_pair, rule, send_status_to_handset,
};

/// Builds the Secondary rule set.
///
/// # Errors
///
/// Returns [`RuleEngineError`] if the table is malformed.
pub fn secondary_rule_set() -> Result<RuleSet<ConnRuleAction, Condition>, RuleEngineError> {
    RuleSet::new("secondary", secondary_rules(), ConnRuleAction::Nop)
}

fn secondary_rules() -> Vec<Rule<ConnRuleAction, Condition>> {
    use ConnRuleAction as A;
    use ConnRuleEvent as E;

    vec![
        rule(E::CheckDfu, "check_upgradable", check_upgradable, A::DfuAllow)
            .with_flags(RuleFlags::AlwaysEvaluate),
        rule(E::Startup, "peer_pair", peer_pair, A::PeerPair),
        rule(E::InCase, "in_case_enter_dfu", in_case_enter_dfu, A::EnterDfu),
        rule(
            E::OutCase,
            "out_of_case_allow_handset_connect",
            out_of_case_allow_handset_connect,
            A::AllowHandsetConnect,
        ),
        rule(
            E::InCase,
            "in_case_reject_handset_connect",
            in_case_reject_handset_connect,
            A::RejectHandsetConnect,
        ),
        rule(
            E::PeerSync,
            "send_status_to_handset",
            send_status_to_handset,
            A::SendStatusToHandset,
        ),
        rule(E::PeerSync, "decide_role", decide_role, A::DecideRole),
        rule(
            E::RoleSwitch,
            "role_switch_disconnect_handset",
            role_switch_disconnect_handset,
            A::DisconnectHandset,
        ),
        rule(
            E::RoleSwitch,
            "role_switch_connect_peer",
            role_switch_connect_peer,
            A::ConnectPeer,
        ),
    ]
}

/// The Secondary never takes an upgrade out of the case.
fn check_upgradable(ctx: &RuleContext<'_>) -> RuleAction {
    RuleAction::RunWithParam(RunParams::Bool(!ctx.app.out_of_case))
}

/// Out of the case this earbud asks to be Primary; in the case it asks to be
/// Secondary unless an upgrade is waiting.
fn decide_role(ctx: &RuleContext<'_>) -> RuleAction {
    if ctx.app.out_of_case {
        RuleAction::RunWithParam(RunParams::Bool(true))
    } else if ctx.app.in_case && ctx.app.dfu_pending {
        RuleAction::Ignore
    } else {
        RuleAction::RunWithParam(RunParams::Bool(false))
    }
}

fn role_switch_disconnect_handset(_: &RuleContext<'_>) -> RuleAction {
    RuleAction::Run
}

fn role_switch_connect_peer(_: &RuleContext<'_>) -> RuleAction {
    RuleAction::RunWithParam(RunParams::Profiles(ProfileMask::PEER_SIGNALLING))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::config::EarbudConfig;
    use crate::rules::context::AppSnapshot;
    use crate::rules::context::fixtures::{
        eval, in_case_primary, out_of_case_primary, paired_platform,
    };

    #[rstest]
    #[case::out_of_case(out_of_case_primary(), RuleAction::RunWithParam(RunParams::Bool(true)))]
    #[case::in_case(in_case_primary(), RuleAction::RunWithParam(RunParams::Bool(false)))]
    #[case::in_case_with_upgrade(
        AppSnapshot { dfu_pending: true, ..in_case_primary() },
        RuleAction::Ignore
    )]
    fn decide_role_follows_the_case(#[case] app: AppSnapshot, #[case] expected: RuleAction) {
        let platform = paired_platform();

        assert_eq!(expected, eval(decide_role, &platform, &app, &EarbudConfig::default()));
    }

    #[test]
    fn secondary_blocks_upgrade_out_of_case() {
        let platform = paired_platform();

        assert_eq!(
            RuleAction::RunWithParam(RunParams::Bool(false)),
            eval(
                check_upgradable,
                &platform,
                &out_of_case_primary(),
                &EarbudConfig::default()
            )
        );
    }

    #[test]
    fn role_switch_reconnects_only_peer_signalling() {
        let platform = paired_platform();

        assert_eq!(
            RuleAction::RunWithParam(RunParams::Profiles(ProfileMask::PEER_SIGNALLING)),
            eval(
                role_switch_connect_peer,
                &platform,
                &in_case_primary(),
                &EarbudConfig::default()
            )
        );
    }
}
