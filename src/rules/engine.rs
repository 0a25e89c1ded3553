use std::fmt;

use serde::Serialize;
use strum_macros::Display;
use tracing::{debug, instrument, trace};

use crate::error::RuleEngineError;
use crate::message::{Outbox, TaskId, TaskList};

use super::action::RunParams;
use super::event::RuleEvents;

/// Disposition returned by a rule condition.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum RuleAction {
    /// Emit the bound action.
    Run,
    /// Emit the bound action carrying a payload.
    RunWithParam(RunParams),
    /// Nothing to do for this event; the rule counts as finished.
    Ignore,
    /// Keep the event pending and look again on the next pass.
    Defer,
    /// The goal is already met; no action is emitted.
    Complete,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RuleFlags {
    #[default]
    None,
    /// Evaluated on every pass whatever is pending; never tracks status.
    AlwaysEvaluate,
    /// Counts towards [`RuleSet::in_progress`].
    ProgressMatters,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    #[default]
    NotDone,
    InProgress,
    Complete,
    Deferred,
}

/// One row of a rule table.
#[derive(Clone)]
pub struct Rule<A, C> {
    events: RuleEvents,
    flags: RuleFlags,
    name: &'static str,
    condition: C,
    action: A,
}

impl<A: Copy, C> Rule<A, C> {
    #[must_use]
    pub const fn new(events: RuleEvents, name: &'static str, condition: C, action: A) -> Self {
        Self {
            events,
            flags: RuleFlags::None,
            name,
            condition,
            action,
        }
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: RuleFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub const fn events(&self) -> RuleEvents {
        self.events
    }

    #[must_use]
    pub const fn flags(&self) -> RuleFlags {
        self.flags
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn condition(&self) -> &C {
        &self.condition
    }

    #[must_use]
    pub const fn action(&self) -> A {
        self.action
    }

    fn always_evaluate(&self) -> bool {
        self.flags == RuleFlags::AlwaysEvaluate
    }
}

impl<A: fmt::Debug, C> fmt::Debug for Rule<A, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("events", &self.events)
            .field("flags", &self.flags)
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

/// Action message delivered to a client task when a rule runs.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct RuleMessage<A> {
    pub action: A,
    pub params: Option<RunParams>,
}

/// An ordered rule table plus the event register and bookkeeping that drive it.
///
/// Conditions are opaque to the set: every method that can trigger an
/// evaluation pass takes an `eval` closure that turns a rule's condition into
/// a [`RuleAction`]. Action messages are queued and collected with
/// [`RuleSet::take_deliveries`].
pub struct RuleSet<A, C> {
    name: &'static str,
    rules: Vec<Rule<A, C>>,
    status: Vec<RuleStatus>,
    events: RuleEvents,
    event_tasks: TaskList<RuleEvents>,
    nop_tasks: TaskList,
    nop_action: A,
    run_params: Option<RunParams>,
    deliveries: Outbox<RuleMessage<A>>,
}

impl<A, C> RuleSet<A, C>
where
    A: Copy + Eq + fmt::Debug + fmt::Display,
{
    /// Builds a rule set over `rules`, evaluated in the given order.
    ///
    /// # Errors
    ///
    /// Returns [`RuleEngineError::EmptyTable`] when `rules` is empty and
    /// [`RuleEngineError::EmptyEventMask`] when a rule that is not
    /// always-evaluate has no events, since it could never fire.
    pub fn new(
        name: &'static str,
        rules: Vec<Rule<A, C>>,
        nop_action: A,
    ) -> Result<Self, RuleEngineError> {
        if rules.is_empty() {
            return Err(RuleEngineError::EmptyTable { set: name });
        }
        if let Some(rule) = rules
            .iter()
            .find(|rule| rule.events.is_empty() && !rule.always_evaluate())
        {
            return Err(RuleEngineError::EmptyEventMask {
                set: name,
                rule: rule.name,
            });
        }

        let status = vec![RuleStatus::NotDone; rules.len()];
        Ok(Self {
            name,
            rules,
            status,
            events: RuleEvents::EMPTY,
            event_tasks: TaskList::new(),
            nop_tasks: TaskList::new(),
            nop_action,
            run_params: None,
            deliveries: Outbox::new(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Pending events.
    #[must_use]
    pub fn events(&self) -> RuleEvents {
        self.events
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule<A, C>> {
        self.rules.iter()
    }

    #[must_use]
    pub fn status_of(&self, name: &str) -> Option<RuleStatus> {
        self.rules
            .iter()
            .position(|rule| rule.name == name)
            .map(|index| self.status[index])
    }

    /// Returns `true` while any progress-matters rule is still in progress.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.rules
            .iter()
            .zip(&self.status)
            .any(|(rule, status)| {
                rule.flags == RuleFlags::ProgressMatters && *status == RuleStatus::InProgress
            })
    }

    /// Registers `task` for the nop action sent when progress finishes.
    pub fn register_nop_client(&mut self, task: TaskId) {
        self.nop_tasks.add(task);
    }

    /// Stages `params` for the next action emitted by this set.
    ///
    /// # Errors
    ///
    /// Returns [`RuleEngineError::RunParamsPending`] if a payload is already
    /// staged and has not been attached to an action yet.
    pub fn copy_run_params(&mut self, params: RunParams) -> Result<(), RuleEngineError> {
        if self.run_params.is_some() {
            return Err(RuleEngineError::RunParamsPending { set: self.name });
        }
        self.run_params = Some(params);
        Ok(())
    }

    /// Sets `mask` on behalf of `client` and runs an evaluation pass.
    #[instrument(skip(self, eval), level = "debug", fields(set = self.name, %mask))]
    pub fn set_event(
        &mut self,
        client: TaskId,
        mask: RuleEvents,
        mut eval: impl FnMut(&C) -> RuleAction,
    ) {
        self.events |= mask;
        match self.event_tasks.data_mut(client) {
            Some(interest) => *interest |= mask,
            None => {
                self.event_tasks.add_with_data(client, mask);
            }
        }
        self.check(&mut eval);
    }

    /// Clears `mask` without running anything.
    #[instrument(skip(self), level = "debug", fields(set = self.name, %mask))]
    pub fn reset_event(&mut self, mask: RuleEvents) {
        self.events.remove(mask);
        for (rule, status) in self.rules.iter().zip(self.status.iter_mut()) {
            if rule.events.intersects(mask) && !rule.always_evaluate() {
                *status = RuleStatus::NotDone;
            }
        }
        self.event_tasks.retain(|task, interest| {
            if !interest.contains(mask) {
                return true;
            }
            interest.remove(mask);
            if interest.is_empty() {
                trace!(%task, "client has no events left");
                return false;
            }
            true
        });
    }

    /// Marks `action` complete for every event it is in progress on.
    pub fn set_rule_complete(&mut self, action: A, eval: impl FnMut(&C) -> RuleAction) {
        self.set_rule_with_event_complete(action, RuleEvents::ALL, eval);
    }

    /// Marks `action` complete for the rules on `event` that are in progress.
    #[instrument(skip(self, eval), level = "debug", fields(set = self.name, %action, %event))]
    pub fn set_rule_with_event_complete(
        &mut self,
        action: A,
        event: RuleEvents,
        mut eval: impl FnMut(&C) -> RuleAction,
    ) {
        let was_in_progress = self.in_progress();
        let updated =
            self.update_rule_status(action, RuleStatus::InProgress, RuleStatus::Complete, event);
        if updated && was_in_progress && !self.in_progress() {
            debug!(set = self.name, "no rules left in progress");
            let message = RuleMessage {
                action: self.nop_action,
                params: None,
            };
            self.deliveries.send_all(self.nop_tasks.tasks(), message);
        }
        self.check(&mut eval);
    }

    /// Runs an evaluation pass over the pending events.
    pub fn check(&mut self, eval: &mut impl FnMut(&C) -> RuleAction) {
        let mut pending = self.events;

        for index in 0..self.rules.len() {
            let rule_events = self.rules[index].events;
            let always = self.rules[index].always_evaluate();
            if !pending.contains(rule_events) && !always {
                continue;
            }

            match self.status[index] {
                RuleStatus::Complete => continue,
                RuleStatus::InProgress => {
                    pending.remove(rule_events);
                    continue;
                }
                RuleStatus::NotDone | RuleStatus::Deferred => {}
            }

            let disposition = eval(&self.rules[index].condition);
            let action = self.rules[index].action;
            debug!(
                set = self.name,
                rule = self.rules[index].name,
                %action,
                %disposition,
                "rule evaluated"
            );

            match disposition {
                RuleAction::Run | RuleAction::RunWithParam(_) => {
                    if let RuleAction::RunWithParam(params) = disposition {
                        // A payload staged outside a pass is replaced by the rule's own.
                        self.run_params = Some(params);
                    }
                    if !always {
                        self.set_status(index, RuleStatus::InProgress);
                    }
                    let message = RuleMessage {
                        action,
                        params: self.run_params.take(),
                    };
                    let recipients: Vec<TaskId> = self
                        .event_tasks
                        .iter()
                        .filter(|(_, interest)| interest.contains(rule_events))
                        .map(|(task, _)| task)
                        .collect();
                    self.deliveries.send_all(recipients, message);
                    if !always {
                        pending.remove(rule_events);
                    }
                }
                RuleAction::Complete | RuleAction::Ignore => {
                    if !always {
                        let current = self.status[index];
                        self.update_rule_status(action, current, RuleStatus::Complete, rule_events);
                    }
                }
                RuleAction::Defer => self.set_status(index, RuleStatus::Deferred),
            }
        }
    }

    /// Removes and returns every queued action message.
    pub fn take_deliveries(&mut self) -> Vec<(TaskId, RuleMessage<A>)> {
        self.deliveries.drain().collect()
    }

    fn set_status(&mut self, index: usize, status: RuleStatus) {
        let rule = &self.rules[index];
        assert!(
            !rule.always_evaluate(),
            "status of always-evaluate rule {} cannot change",
            rule.name
        );
        self.status[index] = status;
    }

    fn update_rule_status(
        &mut self,
        action: A,
        from: RuleStatus,
        to: RuleStatus,
        event: RuleEvents,
    ) -> bool {
        let mut updated = false;
        let mut finished = RuleEvents::EMPTY;

        for index in 0..self.rules.len() {
            let rule = &self.rules[index];
            if rule.action == action && self.status[index] == from && rule.events.intersects(event)
            {
                finished |= rule.events;
                self.set_status(index, to);
                updated = true;
            }
        }

        // An event is only finished once every rule on it is complete.
        for (rule, status) in self.rules.iter().zip(&self.status) {
            if rule.events.intersects(event) && *status != RuleStatus::Complete {
                finished.remove(rule.events);
            }
        }

        if !finished.is_empty() {
            self.reset_event(finished);
        }
        updated
    }
}

impl<A: fmt::Debug, C> fmt::Debug for RuleSet<A, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleSet")
            .field("name", &self.name)
            .field("events", &self.events)
            .field("rules", &self.rules.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::profiles::ProfileMask;

    const A: RuleEvents = RuleEvents::from_bits(0b001);
    const B: RuleEvents = RuleEvents::from_bits(0b010);
    const C: RuleEvents = RuleEvents::from_bits(0b100);

    #[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
    enum Act {
        Nop,
        First,
        Second,
        Always,
    }

    /// Conditions are looked up by name so tests can change answers between passes.
    type Answers = HashMap<&'static str, RuleAction>;

    fn eval(answers: &Answers) -> impl FnMut(&&'static str) -> RuleAction + '_ {
        |name| answers.get(name).copied().unwrap_or(RuleAction::Ignore)
    }

    fn set() -> RuleSet<Act, &'static str> {
        RuleSet::new(
            "test",
            vec![
                Rule::new(A, "first_on_a", "first_on_a", Act::First),
                Rule::new(A, "second_on_a", "second_on_a", Act::Second),
                Rule::new(B, "first_on_b", "first_on_b", Act::First)
                    .with_flags(RuleFlags::ProgressMatters),
                Rule::new(C, "always", "always", Act::Always)
                    .with_flags(RuleFlags::AlwaysEvaluate),
            ],
            Act::Nop,
        )
        .expect("test table should be valid")
    }

    fn actions(set: &mut RuleSet<Act, &'static str>) -> Vec<Act> {
        set.take_deliveries()
            .into_iter()
            .map(|(_, message)| message.action)
            .collect()
    }

    #[test]
    fn empty_table_is_rejected() {
        let result = RuleSet::<Act, ()>::new("empty", Vec::new(), Act::Nop);

        assert_matches!(result, Err(RuleEngineError::EmptyTable { set: "empty" }));
    }

    #[test]
    fn rule_without_events_is_rejected() {
        let result = RuleSet::new(
            "broken",
            vec![Rule::new(RuleEvents::EMPTY, "never", (), Act::First)],
            Act::Nop,
        );

        assert_matches!(
            result,
            Err(RuleEngineError::EmptyEventMask { rule: "never", .. })
        );
    }

    #[test]
    fn run_delivers_once_until_completed() {
        let mut set = set();
        let answers = Answers::from([("first_on_a", RuleAction::Run)]);

        set.set_event(TaskId::AppSm, A, eval(&answers));
        assert_eq!(vec![Act::First], actions(&mut set));

        set.set_event(TaskId::AppSm, A, eval(&answers));
        assert_eq!(Vec::<Act>::new(), actions(&mut set));
        assert_eq!(Some(RuleStatus::InProgress), set.status_of("first_on_a"));
    }

    #[test]
    fn in_progress_rule_holds_back_later_rules_on_the_same_event() {
        let mut set = set();
        let mut answers = Answers::from([
            ("first_on_a", RuleAction::Run),
            ("second_on_a", RuleAction::Run),
        ]);

        set.set_event(TaskId::AppSm, A, eval(&answers));
        assert_eq!(vec![Act::First], actions(&mut set));

        answers.insert("first_on_a", RuleAction::Complete);
        set.set_rule_complete(Act::First, eval(&answers));
        assert_eq!(vec![Act::Second], actions(&mut set));
    }

    #[test]
    fn event_resets_once_every_rule_on_it_is_finished() {
        let mut set = set();
        let answers = Answers::new();

        set.set_event(TaskId::AppSm, A, eval(&answers));

        assert_eq!(RuleEvents::EMPTY, set.events() & A);
        assert_eq!(Some(RuleStatus::NotDone), set.status_of("first_on_a"));
        assert_eq!(Some(RuleStatus::NotDone), set.status_of("second_on_a"));
    }

    #[test]
    fn defer_keeps_event_pending_for_the_next_pass() {
        let mut set = set();
        let mut answers = Answers::from([("first_on_a", RuleAction::Defer)]);

        set.set_event(TaskId::AppSm, A, eval(&answers));
        assert!(set.events().contains(A));
        assert_eq!(Some(RuleStatus::Deferred), set.status_of("first_on_a"));

        answers.insert("first_on_a", RuleAction::Run);
        set.check(&mut eval(&answers));
        assert_eq!(vec![Act::First], actions(&mut set));
    }

    #[test]
    fn deliveries_go_to_clients_interested_in_the_event() {
        let mut set = set();
        let answers = Answers::from([("first_on_b", RuleAction::Run)]);

        set.set_event(TaskId::Client(1), A, eval(&answers));
        set.set_event(TaskId::Client(2), B, eval(&answers));

        let delivered: Vec<TaskId> = set
            .take_deliveries()
            .into_iter()
            .map(|(task, _)| task)
            .collect();
        assert_eq!(vec![TaskId::Client(2)], delivered);
    }

    #[test]
    fn run_with_param_attaches_payload() {
        let mut set = set();
        let params = RunParams::Profiles(ProfileMask::HFP);
        let answers = Answers::from([("first_on_a", RuleAction::RunWithParam(params))]);

        set.set_event(TaskId::AppSm, A, eval(&answers));

        let delivered = set.take_deliveries();
        assert_eq!(
            vec![(
                TaskId::AppSm,
                RuleMessage {
                    action: Act::First,
                    params: Some(params)
                }
            )],
            delivered
        );
    }

    #[test]
    fn copy_run_params_refuses_a_second_payload() {
        let mut set = set();
        set.copy_run_params(RunParams::Bool(true))
            .expect("first payload should stage");

        assert_matches!(
            set.copy_run_params(RunParams::Bool(false)),
            Err(RuleEngineError::RunParamsPending { set: "test" })
        );
    }

    #[test]
    fn nop_clients_hear_when_progress_finishes() {
        let mut set = set();
        set.register_nop_client(TaskId::Topology);
        let answers = Answers::from([("first_on_b", RuleAction::Run)]);

        set.set_event(TaskId::AppSm, B, eval(&answers));
        assert!(set.in_progress());
        assert_eq!(vec![Act::First], actions(&mut set));

        set.set_rule_with_event_complete(Act::First, B, eval(&Answers::new()));

        assert!(!set.in_progress());
        assert_eq!(
            vec![(
                TaskId::Topology,
                RuleMessage {
                    action: Act::Nop,
                    params: None
                }
            )],
            set.take_deliveries()
        );
        assert_eq!(RuleEvents::EMPTY, set.events() & B);
    }

    #[test]
    fn always_evaluate_rule_fires_on_every_pass() {
        let mut set = set();
        let answers = Answers::from([("always", RuleAction::Run)]);

        set.set_event(TaskId::AppSm, C, eval(&answers));
        set.set_event(TaskId::AppSm, A, eval(&answers));

        assert_eq!(vec![Act::Always, Act::Always], actions(&mut set));
        assert_eq!(Some(RuleStatus::NotDone), set.status_of("always"));
    }

    #[test]
    fn reset_event_drops_client_interest() {
        let mut set = set();
        let answers = Answers::from([("first_on_a", RuleAction::Run)]);
        set.set_event(TaskId::Client(3), A, eval(&answers));
        actions(&mut set);

        set.reset_event(A);
        assert_eq!(Some(RuleStatus::NotDone), set.status_of("first_on_a"));

        set.set_event(TaskId::AppSm, A, eval(&answers));
        let delivered: Vec<TaskId> = set
            .take_deliveries()
            .into_iter()
            .map(|(task, _)| task)
            .collect();
        assert_eq!(vec![TaskId::AppSm], delivered);
    }

    #[test]
    fn evaluation_is_deterministic_for_a_fixed_snapshot() {
        let answers = Answers::from([
            ("first_on_a", RuleAction::Ignore),
            ("second_on_a", RuleAction::Run),
        ]);
        let mut left = set();
        let mut right = set();

        left.set_event(TaskId::AppSm, A, eval(&answers));
        right.set_event(TaskId::AppSm, A, eval(&answers));

        assert_eq!(actions(&mut left), actions(&mut right));
    }

    #[test]
    #[should_panic(expected = "always-evaluate")]
    fn deferring_an_always_evaluate_rule_panics() {
        let mut set = set();
        let answers = Answers::from([("always", RuleAction::Defer)]);

        set.set_event(TaskId::AppSm, C, eval(&answers));
    }
}
