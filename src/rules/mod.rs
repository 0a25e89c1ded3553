//! Event-driven rule evaluation and the three rule tables built on it.
//!
//! A [`RuleSet`] is generic over its action type and its condition type. The
//! tables in this module bind conditions of type [`Condition`], which read a
//! [`RuleContext`] snapshot and never change anything.

mod action;
mod context;
mod dfu;
mod engine;
mod event;
mod primary;
mod secondary;

use std::fmt;

pub use action::{
    ConnRuleAction, DfuGoal, MAX_RUN_PARAMS_SIZE, MicSelection, PostConnectAction, RunParams,
};
pub use context::{AppSnapshot, Condition, RuleContext};
pub use dfu::dfu_rule_set;
pub use engine::{Rule, RuleAction, RuleFlags, RuleMessage, RuleSet, RuleStatus};
pub use event::{ConnRuleEvent, DfuRuleEvent, RuleEventId, RuleEvents, events_of};
pub use primary::{ConnectReason, handset_score, page_scan_wanted, primary_rule_set, yields_handset};
pub use secondary::secondary_rule_set;

/// Rule set used for the Primary and Secondary roles.
pub type ConnRuleSet = RuleSet<ConnRuleAction, Condition>;

/// Rule set used while an upgrade is pending.
pub type DfuRuleSet = RuleSet<DfuGoal, Condition>;

/// Renders a rule table one rule per line, in declaration order.
///
/// Each line reads `EVENTS -> name -> action`, with the flags appended in
/// brackets when a rule has any.
pub fn describe_rules<A, E>(set: &RuleSet<A, Condition>) -> Vec<String>
where
    A: Copy + Eq + fmt::Debug + fmt::Display,
    E: RuleEventId,
{
    set.rules()
        .map(|rule| {
            let events = rule.events().names::<E>().join("|");
            let line = format!("{events} -> {} -> {}", rule.name(), rule.action());
            match rule.flags() {
                RuleFlags::None => line,
                flags => format!("{line} [{flags}]"),
            }
        })
        .collect()
}
