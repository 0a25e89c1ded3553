use std::fmt::{self, Display, Formatter};

use serde::Serialize;
use serde_json::Value;

use crate::earbud::Indication;
use crate::message::Message;
use crate::scenario::{ReplayReport, StepRecord};

use super::painter::Painter;
use super::table::Table;

/// Renders a replay report step by step, then the final component states.
pub(crate) struct ReplayReportView<'a> {
    report: &'a ReplayReport,
    painter: &'a Painter,
}

impl<'a> ReplayReportView<'a> {
    pub(crate) fn new(report: &'a ReplayReport, painter: &'a Painter) -> Self {
        Self { report, painter }
    }
}

impl Display for ReplayReportView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = self.report.name.as_deref().unwrap_or("unnamed");
        write!(
            f,
            "{} {}",
            self.painter.heading("Scenario:"),
            self.painter.name(name)
        )?;
        for step in &self.report.steps {
            write!(f, "\n{}", StepView::new(step, self.painter))?;
        }

        let state = &self.report.final_state;
        let table = Table::fields(
            self.painter,
            [
                ("app", self.painter.name(&state.app)),
                ("peer_link", state.peer_link.clone()),
                ("shadow", state.shadow.clone()),
                ("active_handsets", state.active_handsets.to_string()),
            ],
        );
        writeln!(f)?;
        write!(f, "\n{}", self.painter.heading("Final state:"))?;
        write!(f, "\n{table}")
    }
}

struct StepView<'a> {
    step: &'a StepRecord,
    painter: &'a Painter,
}

impl<'a> StepView<'a> {
    fn new(step: &'a StepRecord, painter: &'a Painter) -> Self {
        Self { step, painter }
    }
}

impl Display for StepView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.painter.label(format!("[{:04}]", self.step.index)),
            self.painter.name(&self.step.step)
        )?;
        for call in &self.step.calls {
            write!(f, "\n    {} {}", self.painter.label("call"), tagged(call, "call"))?;
        }
        for indication in &self.step.indications {
            write!(f, "\n    {}", self.indication(indication))?;
        }
        Ok(())
    }
}

impl StepView<'_> {
    fn indication(&self, indication: &Indication) -> String {
        match indication {
            Indication::Transition { change } => {
                let component = match change.device {
                    Some(device) => format!("{}[{device}]", change.component),
                    None => change.component.to_string(),
                };
                format!(
                    "{} {component} {} -> {}",
                    self.painter.label("state"),
                    change.from,
                    self.painter.state(&change.to)
                )
            }
            Indication::Rule { to, message } => {
                let action = match message {
                    Message::ConnRule(rule) => rule.action.to_string(),
                    Message::DfuRule(rule) => rule.action.to_string(),
                    other => compact(other),
                };
                format!("{} {to} <- {action}", self.painter.label("rule"))
            }
            Indication::Delivered { to, message } => format!(
                "{} {to} <- {}",
                self.painter.delivery("sent"),
                compact(message)
            ),
        }
    }
}

/// Renders an internally tagged value as `tag key=value ...`.
fn tagged<T: Serialize>(value: &T, tag: &str) -> String {
    let Ok(Value::Object(mut fields)) = serde_json::to_value(value) else {
        return compact(value);
    };
    let name = match fields.remove(tag) {
        Some(Value::String(name)) => name,
        _ => return compact(value),
    };
    fields
        .into_iter()
        .fold(name, |line, (key, field)| format!("{line} {key}={field}"))
}

fn compact<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|error| format!("<{error}>"))
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;

    use super::*;
    use crate::bdaddr::BdAddr;
    use crate::collaborators::PlatformCall;
    use crate::message::{StateChange, TaskId};
    use crate::rules::{ConnRuleAction, RuleMessage};
    use crate::scenario::FinalState;

    fn report() -> ReplayReport {
        ReplayReport {
            name: Some("out of case".into()),
            steps: vec![StepRecord {
                index: 0,
                step: "input phy_state".into(),
                calls: vec![
                    PlatformCall::AllowHandsetConnect { allowed: true },
                    PlatformCall::SdpSearch {
                        addr: BdAddr::new([0x00, 0x02, 0x5b, 0x00, 0x00, 0x01]),
                    },
                ],
                indications: vec![
                    Indication::Transition {
                        change: StateChange::new(TaskId::AppSm, "in_case_idle", "out_of_case_idle"),
                    },
                    Indication::Rule {
                        to: TaskId::AppSm,
                        message: Message::ConnRule(RuleMessage {
                            action: ConnRuleAction::AllowHandsetConnect,
                            params: None,
                        }),
                    },
                ],
            }],
            final_state: FinalState {
                app: "out_of_case_idle".into(),
                peer_link: "sdp_search".into(),
                shadow: "disconnected".into(),
                active_handsets: 0,
            },
        }
    }

    #[test]
    fn plain_report_lists_steps_then_final_state() {
        let painter = Painter::new(false);
        let report = report();

        let text = ReplayReportView::new(&report, &painter).to_string();
        let steps: Vec<_> = text.lines().take(6).collect();

        assert_snapshot!(steps.join("\n"), @r#"
        Scenario: out of case
        [0000] input phy_state
            call allow_handset_connect allowed=true
            call sdp_search addr="00:02:5b:00:00:01"
            state app_sm in_case_idle -> out_of_case_idle
            rule app_sm <- allow_handset_connect
        "#);
        assert!(text.contains("Final state:"));
        assert!(text.contains("out_of_case_idle"));
    }
}
