//! Topology goals while an upgrade is pending or running.
//!
//! Several events have one rule for each side of a condition; only one of
//! them fires.

use crate::bdaddr::Transport;
use crate::error::RuleEngineError;

use super::action::{DfuGoal, RunParams};
use super::context::{Condition, RuleContext};
use super::engine::{Rule, RuleAction, RuleSet};
use super::event::{DfuRuleEvent, RuleEventId};

fn rule(
    event: DfuRuleEvent,
    name: &'static str,
    condition: Condition,
    goal: DfuGoal,
) -> Rule<DfuGoal, Condition> {
    Rule::new(event.mask(), name, condition, goal)
}

/// Builds the DFU rule set.
///
/// # Errors
///
/// Returns [`RuleEngineError`] if the table is malformed.
pub fn dfu_rule_set() -> Result<RuleSet<DfuGoal, Condition>, RuleEngineError> {
    use DfuGoal as G;
    use DfuRuleEvent as E;

    RuleSet::new(
        "dfu",
        vec![
            rule(E::InCase, "dfu_in_case", always, G::InCase),
            rule(E::OutCase, "dfu_out_of_case", always, G::NoRoleFindRole),
            rule(E::DfuRoleComplete, "role_complete_out_of_case", out_of_case, G::NoRoleFindRole),
            rule(E::DfuRoleComplete, "role_complete_in_case", in_case, G::NoRoleIdle),
            rule(E::RoleSelectedPrimary, "dfu_primary", always, G::Primary),
            rule(
                E::PeerLinkloss,
                "dfu_secondary_link_loss",
                secondary_link_loss,
                G::LinklossSecondary,
            ),
            rule(E::RoleSelectedSecondary, "dfu_secondary", always, G::Secondary),
            rule(
                E::HandsetDisconnectedBredr,
                "dfu_enable_connectable_handset",
                enable_connectable_handset,
                G::ConnectableHandset,
            ),
            rule(
                E::DfuAborted,
                "le_primary_abort_cleanup",
                le_primary_abort_cleanup,
                G::LePrimaryAbortCleanup,
            ),
        ],
        G::Nop,
    )
}

fn always(_: &RuleContext<'_>) -> RuleAction {
    RuleAction::Run
}

fn out_of_case(ctx: &RuleContext<'_>) -> RuleAction {
    if ctx.app.out_of_case {
        RuleAction::Run
    } else {
        RuleAction::Ignore
    }
}

fn in_case(ctx: &RuleContext<'_>) -> RuleAction {
    if ctx.app.out_of_case {
        RuleAction::Ignore
    } else {
        RuleAction::Run
    }
}

/// A Secondary left in the case mid-upgrade goes looking for its Primary
/// again when the link drops.
fn secondary_link_loss(ctx: &RuleContext<'_>) -> RuleAction {
    if !ctx.app.using_secondary_address || !ctx.app.in_case {
        return RuleAction::Ignore;
    }
    match ctx.platform.peer_addr() {
        Some(primary) if !ctx.platform.is_connected(primary) => RuleAction::Run,
        _ => RuleAction::Ignore,
    }
}

fn enable_connectable_handset(_: &RuleContext<'_>) -> RuleAction {
    RuleAction::RunWithParam(RunParams::Bool(true))
}

/// Tears down an aborted BLE upgrade on the Primary, handset profiles first.
///
/// The Secondary has nothing to clean up and never runs this.
fn le_primary_abort_cleanup(ctx: &RuleContext<'_>) -> RuleAction {
    if !ctx.app.dfu_primary
        || !ctx.app.out_of_case
        || !ctx.platform.any_transport_link_connected(Transport::Ble)
    {
        return RuleAction::Ignore;
    }
    RuleAction::RunWithParam(RunParams::Profiles(ctx.handset_profiles()))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::app_sm::Role;
    use crate::config::EarbudConfig;
    use crate::message::TaskId;
    use crate::profiles::{Profile, ProfileMask};
    use crate::rules::RuleMessage;
    use crate::rules::context::AppSnapshot;
    use crate::rules::context::fixtures::{
        HANDSET, PEER, connect, eval, in_case_primary, out_of_case_primary, paired_platform,
    };
    use crate::rules::event::events_of;

    #[test]
    fn role_complete_picks_exactly_one_goal() {
        let platform = paired_platform();
        let config = EarbudConfig::default();
        let app = in_case_primary();
        let mut set = dfu_rule_set().expect("dfu table should be valid");

        set.set_event(
            TaskId::Topology,
            events_of(&[DfuRuleEvent::DfuRoleComplete]),
            |condition| eval(*condition, &platform, &app, &config),
        );

        assert_eq!(
            vec![(
                TaskId::Topology,
                RuleMessage {
                    action: DfuGoal::NoRoleIdle,
                    params: None
                }
            )],
            set.take_deliveries()
        );
    }

    #[test]
    fn abort_cleanup_runs_only_on_a_primary_with_ble() {
        let mut platform = paired_platform();
        connect(&mut platform, HANDSET, &[Profile::Hfp, Profile::A2dp]);
        platform.ble_link = true;
        let config = EarbudConfig::default();
        let primary = AppSnapshot {
            role: Role::Dfu,
            dfu_primary: true,
            ..out_of_case_primary()
        };
        let secondary = AppSnapshot {
            dfu_primary: false,
            ..primary
        };

        assert_eq!(
            RuleAction::RunWithParam(RunParams::Profiles(ProfileMask::HFP | ProfileMask::A2DP)),
            eval(le_primary_abort_cleanup, &platform, &primary, &config)
        );
        assert_eq!(
            RuleAction::Ignore,
            eval(le_primary_abort_cleanup, &platform, &secondary, &config)
        );
    }

    #[test]
    fn secondary_link_loss_needs_a_disconnected_primary_in_case() {
        let mut platform = paired_platform();
        let config = EarbudConfig::default();
        let app = AppSnapshot {
            using_secondary_address: true,
            ..in_case_primary()
        };

        assert_eq!(RuleAction::Run, eval(secondary_link_loss, &platform, &app, &config));

        platform.acls.insert(PEER, false);
        assert_eq!(RuleAction::Ignore, eval(secondary_link_loss, &platform, &app, &config));
    }
}
