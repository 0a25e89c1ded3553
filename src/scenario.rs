//! JSON replay scenarios.
//!
//! A scenario seeds a [`FakePlatform`], then walks a list of steps: inputs
//! for the core, updates to the fake's world, and clock advances. Each step
//! is recorded with the platform calls and indications it caused.
//!
//! ```json
//! {
//!   "name": "out of case",
//!   "setup": [{ "update": "pair_peer", "addr": "00:02:5b:00:00:01" }],
//!   "steps": [
//!     { "input": "init" },
//!     { "advance": "30s" }
//!   ]
//! }
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, instrument, warn};

use crate::collaborators::{FakePlatform, FakeUpdate, PlatformCall};
use crate::config::{EarbudConfig, HumanDuration};
use crate::earbud::{Earbud, Indication, Input};
use crate::error::{EarbudError, ScenarioError};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: Option<String>,
    /// Applied to the fake before the core is built.
    #[serde(default)]
    pub setup: Vec<FakeUpdate>,
    pub steps: Vec<Step>,
}

/// One replay step. The shape of the JSON object decides the kind.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Step {
    Input(Input),
    Update(FakeUpdate),
    Advance {
        #[serde_as(as = "HumanDuration")]
        advance: Duration,
    },
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input(input) => write!(f, "input {input}"),
            Self::Update(update) => write!(f, "update {update}"),
            Self::Advance { advance } => {
                write!(f, "advance {}", humantime::format_duration(*advance))
            }
        }
    }
}

impl Scenario {
    /// Reads a scenario from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ScenarioError`] when the file cannot be read, does not
    /// parse, or has no steps.
    pub fn from_json_file(path: &Path) -> Result<Self, ScenarioError> {
        let text = std::fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// # Errors
    ///
    /// Returns [`ScenarioError`] when the text does not parse or has no steps.
    pub fn from_json_str(text: &str) -> Result<Self, ScenarioError> {
        let scenario: Self = serde_json::from_str(text)?;
        if scenario.steps.is_empty() {
            return Err(ScenarioError::Empty);
        }
        Ok(scenario)
    }
}

/// What one step caused.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub index: usize,
    pub step: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub calls: Vec<PlatformCall>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub indications: Vec<Indication>,
}

/// Where every component ended up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalState {
    pub app: String,
    pub peer_link: String,
    pub shadow: String,
    pub active_handsets: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub steps: Vec<StepRecord>,
    pub final_state: FinalState,
}

/// Replays `scenario` against a fresh core.
///
/// Advances sleep on the tokio clock, so callers normally run this on a
/// paused runtime where they complete instantly.
///
/// # Errors
///
/// Returns [`EarbudError`] if the core cannot be built.
#[instrument(skip_all, fields(scenario = scenario.name.as_deref().unwrap_or("unnamed")))]
pub async fn replay(scenario: Scenario, config: EarbudConfig) -> Result<ReplayReport, EarbudError> {
    let mut platform = FakePlatform::default();
    for update in scenario.setup {
        platform.apply(update);
    }
    let mut earbud = Earbud::new(config, platform)?;
    let mut indications = earbud.subscribe();

    let mut steps = Vec::with_capacity(scenario.steps.len());
    for (index, step) in scenario.steps.into_iter().enumerate() {
        let label = step.to_string();
        debug!(index, step = %label, "replaying step");
        match step {
            Step::Input(input) => {
                earbud.platform_mut().observe(&input);
                earbud.post(input);
                earbud.process_pending();
            }
            Step::Update(update) => earbud.platform_mut().apply(update),
            Step::Advance { advance } => advance_clock(&mut earbud, advance).await,
        }
        steps.push(StepRecord {
            index,
            step: label,
            calls: earbud.platform_mut().take_calls(),
            indications: drain(&mut indications),
        });
    }

    let final_state = FinalState {
        app: earbud.app().state().to_string(),
        peer_link: earbud.peer_signalling().state().to_string(),
        shadow: earbud.shadow().state().to_string(),
        active_handsets: earbud.handsets().active_count(),
    };
    info!(app = %final_state.app, steps = steps.len(), "replay finished");
    Ok(ReplayReport {
        name: scenario.name,
        steps,
        final_state,
    })
}

/// Moves the clock forward, firing timers in deadline order on the way.
async fn advance_clock(earbud: &mut Earbud<FakePlatform>, by: Duration) {
    let target = Instant::now() + by;
    while let Some(deadline) = earbud.next_deadline().filter(|deadline| *deadline <= target) {
        sleep_until(deadline).await;
        earbud.fire_due_timers(Instant::now());
    }
    sleep_until(target).await;
}

fn drain(indications: &mut broadcast::Receiver<Indication>) -> Vec<Indication> {
    let mut drained = Vec::new();
    loop {
        match indications.try_recv() {
            Ok(indication) => drained.push(indication),
            Err(TryRecvError::Lagged(skipped)) => warn!(skipped, "indications dropped"),
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    drained
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::app_sm::AppRequest;

    const STARTUP: &str = r#"{
        "name": "startup",
        "setup": [
            { "update": "pair_peer", "addr": "00:02:5b:00:00:01" },
            { "update": "pair_handset", "addr": "00:1a:7d:da:71:13" }
        ],
        "steps": [
            { "input": "init" },
            { "input": "psm_registered", "psm": 4097 },
            { "input": "sdp_registered", "success": true },
            { "input": "sdm", "sdm": "register_cfm", "success": true },
            { "input": "topology_started", "role": "primary" }
        ]
    }"#;

    #[test]
    fn step_kinds_are_told_apart_by_shape() {
        let steps: Vec<Step> = serde_json::from_str(
            r#"[
                { "input": "app", "app": "power_off" },
                { "update": "ble_link", "connected": true },
                { "advance": "1m 30s" }
            ]"#,
        )
        .expect("steps should deserialise");

        assert_eq!(
            vec![
                Step::Input(Input::App(AppRequest::PowerOff)),
                Step::Update(FakeUpdate::BleLink { connected: true }),
                Step::Advance {
                    advance: Duration::from_secs(90),
                },
            ],
            steps
        );
    }

    #[test]
    fn steps_describe_themselves() {
        let step = Step::Advance {
            advance: Duration::from_millis(1500),
        };

        insta::assert_snapshot!(step.to_string(), @"advance 1s 500ms");
    }

    #[test]
    fn scenario_without_steps_is_rejected() {
        let result = Scenario::from_json_str(r#"{ "name": "nothing", "steps": [] }"#);

        assert_matches!(result, Err(ScenarioError::Empty));
    }

    #[test]
    fn unknown_step_is_a_json_error() {
        let result = Scenario::from_json_str(r#"{ "steps": [{ "wait": 3 }] }"#);

        assert_matches!(result, Err(ScenarioError::Json(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn startup_replay_reaches_the_core_state() {
        let scenario = Scenario::from_json_str(STARTUP).expect("scenario should parse");

        let report = replay(scenario, EarbudConfig::default())
            .await
            .expect("replay should run");

        assert_eq!(5, report.steps.len());
        assert_eq!("in_case_idle", report.final_state.app);
        assert!(
            report.steps[0]
                .calls
                .contains(&PlatformCall::RegisterPsm)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn advance_fires_timers_in_between() {
        let mut scenario = Scenario::from_json_str(STARTUP).expect("scenario should parse");
        scenario.steps.push(Step::Input(Input::PhyState {
            state: crate::app_sm::PhyState::OutOfEarAtRest,
        }));
        scenario.steps.push(Step::Advance {
            advance: Duration::from_secs(3600),
        });

        let report = replay(scenario, EarbudConfig::default())
            .await
            .expect("replay should run");

        assert_eq!("out_of_case_soporific", report.final_state.app);
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_the_case_without_a_handset_starts_pairing() {
        let mut scenario = Scenario::from_json_str(STARTUP).expect("scenario should parse");
        scenario.setup.retain(|update| matches!(update, FakeUpdate::PairPeer { .. }));
        scenario.steps.push(Step::Input(Input::PhyState {
            state: crate::app_sm::PhyState::OutOfEarAtRest,
        }));

        let report = replay(scenario, EarbudConfig::default())
            .await
            .expect("replay should run");

        assert_eq!("handset_pairing", report.final_state.app);
    }
}
