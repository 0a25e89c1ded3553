pub(crate) mod command;
pub(crate) mod replay;
pub(crate) mod rules;
pub(crate) mod ui;

pub use self::command::{
    Args, Command, LogLevel, OutputFormat, ReplayArgs, RuleTable, RulesArgs,
};
