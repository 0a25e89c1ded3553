use std::fmt;
use std::io;

use anyhow::Result;
use serde::Serialize;
use tracing::instrument;

use crate::rules::{
    ConnRuleEvent, DfuRuleEvent, RuleEventId, RuleFlags, RuleSet, dfu_rule_set,
    primary_rule_set, secondary_rule_set,
};
use crate::terminal::TerminalClient;

use super::command::{OutputFormat, RuleTable, RulesArgs};
use super::ui::{Painter, Table};

/// One table row as printed.
#[derive(Debug, Serialize)]
struct RuleRow {
    index: usize,
    events: Vec<String>,
    rule: &'static str,
    action: String,
    flags: RuleFlags,
}

#[derive(Debug, Serialize)]
struct TableDump {
    table: String,
    rules: Vec<RuleRow>,
}

fn rows<A, C, E>(set: &RuleSet<A, C>) -> Vec<RuleRow>
where
    A: Copy + Eq + fmt::Debug + fmt::Display,
    E: RuleEventId,
{
    set.rules()
        .enumerate()
        .map(|(index, rule)| RuleRow {
            index,
            events: rule.events().names::<E>(),
            rule: rule.name(),
            action: rule.action().to_string(),
            flags: rule.flags(),
        })
        .collect()
}

fn dump(table: RuleTable) -> Result<TableDump> {
    let rules = match table {
        RuleTable::Primary => rows::<_, _, ConnRuleEvent>(&primary_rule_set()?),
        RuleTable::Secondary => rows::<_, _, ConnRuleEvent>(&secondary_rule_set()?),
        RuleTable::Dfu => rows::<_, _, DfuRuleEvent>(&dfu_rule_set()?),
    };
    Ok(TableDump {
        table: table.to_string(),
        rules,
    })
}

/// Executes the `rules` command.
#[instrument(skip(out, terminal_client), level = "info", fields(table = ?args.table()))]
pub(crate) fn run<W>(
    args: &RulesArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let tables = match args.table() {
        Some(table) => vec![table],
        None => vec![RuleTable::Primary, RuleTable::Secondary, RuleTable::Dfu],
    };
    let dumps = tables.into_iter().map(dump).collect::<Result<Vec<_>>>()?;

    match output_format {
        OutputFormat::Pretty => {
            let painter = Painter::new(terminal_client.stdout_is_terminal());
            for (position, dump) in dumps.iter().enumerate() {
                if position > 0 {
                    writeln!(out)?;
                }
                writeln!(out, "{}", painter.heading(format!("{} rules:", dump.table)))?;
                writeln!(out, "{}", render(dump, &painter))?;
            }
        }
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, &dumps)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

fn render(dump: &TableDump, painter: &Painter) -> Table {
    let mut table = Table::with_header(["#", "events", "rule", "action", "flags"]).numbered();
    for row in &dump.rules {
        let flags = match row.flags {
            RuleFlags::None => String::new(),
            flags => painter.label(flags.to_string()),
        };
        table.push(vec![
            row.index.to_string(),
            row.events.join("|"),
            painter.name(row.rule),
            row.action.clone(),
            flags,
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    struct Plain;

    impl TerminalClient for Plain {
        fn stdout_is_terminal(&self) -> bool {
            false
        }

        fn stderr_is_terminal(&self) -> bool {
            false
        }
    }

    #[test]
    fn secondary_rows_follow_declaration_order() {
        let dump = dump(RuleTable::Secondary).expect("secondary table should dump");

        let names: Vec<_> = dump.rules.iter().map(|row| row.rule).collect();
        assert_eq!(
            vec![
                "check_upgradable",
                "peer_pair",
                "in_case_enter_dfu",
                "out_of_case_allow_handset_connect",
                "in_case_reject_handset_connect",
                "send_status_to_handset",
                "decide_role",
                "role_switch_disconnect_handset",
                "role_switch_connect_peer",
            ],
            names
        );
    }

    #[test]
    fn json_output_names_each_table() {
        let mut out = Vec::new();

        run(&RulesArgs::default(), &mut out, &Plain, OutputFormat::Json)
            .expect("rules command should succeed");

        let value: serde_json::Value =
            serde_json::from_slice(&out).expect("output should be JSON");
        let tables: Vec<_> = value
            .as_array()
            .expect("output should be an array")
            .iter()
            .filter_map(|dump| dump["table"].as_str())
            .collect();
        assert_eq!(vec!["primary", "secondary", "dfu"], tables);
    }

    #[test]
    fn pretty_output_has_a_heading_per_table() {
        let mut out = Vec::new();

        run(
            &RulesArgs::new(Some(RuleTable::Dfu)),
            &mut out,
            &Plain,
            OutputFormat::Pretty,
        )
        .expect("rules command should succeed");

        let text = String::from_utf8(out).expect("output should be UTF-8");
        assert!(text.starts_with("dfu rules:"));
        assert!(!text.contains("primary rules:"));
    }
}
