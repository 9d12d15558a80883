use std::{collections::HashMap, path::Path, sync::Arc};

use anyhow::{bail, Context};
use serde::Serialize;
use symtrace::{
    host::{
        DebuggerNotification, MemoryConfigurationStore, RecordingNotificationSource,
        ScriptedOperator, SnapshotDecision,
    },
    stats::ExecutionStats,
    trace::TraceEvent,
    CoordinatorBuilder, CoordinatorConfig, ExecutionCoordinator, NotificationOutcome,
    SnapshotHandle, TaintTrigger,
};

use crate::{
    app::GlobalOptions,
    commands::{
        common::preset,
        scenario::{Input, Scenario},
    },
    output::{emit, hex, Listing},
};

pub struct ReplayOptions<'a> {
    pub trace: bool,
    pub preset: Option<&'a str>,
    pub max_instructions: Option<u64>,
    pub global: &'a GlobalOptions,
}

#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub scenario: String,
    pub architecture: String,
    pub steps: Vec<StepReport>,
    pub triggers: Vec<TaintTrigger>,
    pub constraints: Vec<ConstraintInfo>,
    pub symbolic: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub stats: ExecutionStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<Vec<TraceEvent>>,
}

#[derive(Debug, Serialize)]
pub struct StepReport {
    pub pc: u64,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConstraintInfo {
    pub index: u64,
    pub pc: u64,
    pub taken: bool,
    pub tainted: bool,
    pub assertion: String,
}

/// Resolve the session configuration from the scenario and command-line overrides.
fn configuration(scenario: &Scenario, opts: &ReplayOptions) -> anyhow::Result<CoordinatorConfig> {
    let mut config = match opts.preset {
        Some(name) => preset(name)?,
        None => scenario.config.clone().unwrap_or_default(),
    };
    if let Some(max) = opts.max_instructions {
        config = config.with_max_instructions(max);
    }
    if opts.trace {
        config.tracing.trace_instructions = true;
        config.tracing.output_path = None;
    }
    config.validate()?;
    Ok(config)
}

fn step_report(pc: u64, outcome: NotificationOutcome) -> StepReport {
    let (outcome, detail) = match outcome {
        NotificationOutcome::Ignored => ("ignored", None),
        NotificationOutcome::Processed { changes, trigger } => (
            if trigger.is_some() { "trigger" } else { "processed" },
            Some(format!("{changes} change(s)")),
        ),
        NotificationOutcome::Skipped => ("skipped", None),
        NotificationOutcome::Isolated(error) => ("isolated", Some(error.to_string())),
        NotificationOutcome::ProcessStarted { pid } => ("process started", Some(pid.to_string())),
        NotificationOutcome::Deactivated => ("deactivated", None),
    };
    StepReport {
        pc,
        outcome: outcome.to_string(),
        detail,
    }
}

fn symbolize_inputs(coordinator: &mut ExecutionCoordinator, inputs: &[Input]) -> anyhow::Result<()> {
    for input in inputs {
        match input {
            Input::Register { register, tainted } => {
                coordinator
                    .symbolize_register(*register, *tainted)
                    .with_context(|| format!("failed to symbolize {register}"))?;
            }
            Input::Memory {
                address,
                len,
                tainted,
            } => {
                coordinator
                    .symbolize_memory_range(*address, *len, *tainted)
                    .with_context(|| format!("failed to symbolize memory at {address:#x}"))?;
            }
        }
    }
    Ok(())
}

/// Run `scenario` to completion and collect what the session observed.
fn replay(name: String, scenario: &Scenario, opts: &ReplayOptions) -> anyhow::Result<ReplayReport> {
    let config = configuration(scenario, opts)?;
    let debuggee = scenario.debuggee()?;

    let decision = if scenario.initial_snapshot {
        SnapshotDecision::Take
    } else {
        SnapshotDecision::Skip
    };
    let operator = Arc::new(ScriptedOperator::new(decision));
    let mut coordinator = CoordinatorBuilder::new()
        .debuggee(debuggee.clone())
        .notifications(Arc::new(RecordingNotificationSource::new()))
        .decoder(scenario.decoder())
        .operator(operator.clone())
        .configuration_store(Arc::new(MemoryConfigurationStore::new(Some(config))))
        .build()?;

    if !coordinator.activate() {
        bail!("activation failed: {}", operator.warnings().join("; "));
    }
    symbolize_inputs(&mut coordinator, &scenario.inputs)?;

    let mut labels: HashMap<&str, SnapshotHandle> = HashMap::new();
    let mut steps = Vec::with_capacity(scenario.steps.len());
    for step in &scenario.steps {
        if let Some(label) = step.restore.as_deref() {
            let handle = labels
                .get(label)
                .copied()
                .with_context(|| format!("step at {:#x}: unknown snapshot '{label}'", step.pc))?;
            coordinator.restore_snapshot(handle)?;
        }
        if let Some(label) = step.capture.as_deref() {
            labels.insert(label, coordinator.capture_snapshot()?);
        }

        let outcome = coordinator.handle_notification(DebuggerNotification::Step {
            pc: step.pc,
            next_pc: step.next_pc,
        });
        let deactivated = matches!(outcome, NotificationOutcome::Deactivated);
        steps.push(step_report(step.pc, outcome));
        if deactivated || !coordinator.is_active() {
            break;
        }
        step.apply(&debuggee)?;
    }

    let (constraints, symbolic) = match coordinator.symbolic_state() {
        Some(state) => (
            state
                .constraints()
                .iter()
                .map(|c| ConstraintInfo {
                    index: c.index,
                    pc: c.pc,
                    taken: c.taken,
                    tainted: c.tainted,
                    assertion: c.assertion().to_string(),
                })
                .collect(),
            state
                .symbolic_locations()
                .iter()
                .map(ToString::to_string)
                .collect(),
        ),
        None => (Vec::new(), Vec::new()),
    };

    coordinator.deactivate();
    Ok(ReplayReport {
        scenario: name,
        architecture: scenario.architecture.clone(),
        steps,
        triggers: coordinator.drain_triggers(),
        constraints,
        symbolic,
        warnings: operator.warnings(),
        stats: coordinator.stats(),
        trace: if opts.trace {
            coordinator.take_trace()
        } else {
            None
        },
    })
}

pub fn run(path: &Path, opts: &ReplayOptions) -> anyhow::Result<()> {
    let scenario = Scenario::load(path)?;
    let report = replay(path.display().to_string(), &scenario, opts)?;

    emit(&report, opts.global, |report| {
        println!("Scenario:     {}", report.scenario);
        println!("Architecture: {}", report.architecture);
        println!("Stats:        {}", report.stats);

        println!("\nSteps:");
        let mut steps = Listing::new(&["PC", "Outcome", "Detail"], 1);
        for step in &report.steps {
            steps.push(vec![
                hex(step.pc),
                step.outcome.clone(),
                step.detail.clone().unwrap_or_default(),
            ]);
        }
        steps.print("  ");

        if report.triggers.is_empty() {
            println!("\nNo tainted branches.");
        } else {
            println!("\nTriggers:");
            let mut triggers = Listing::new(
                &["#", "PC", "Alternative", "Cond", "Taken", "Predicate"],
                3,
            );
            for trigger in &report.triggers {
                triggers.push(vec![
                    trigger.index.to_string(),
                    hex(trigger.pc),
                    hex(trigger.alternative()),
                    trigger.condition.to_string(),
                    if trigger.taken { "yes" } else { "no" }.to_string(),
                    trigger
                        .predicate
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                ]);
            }
            triggers.print("  ");
        }

        if !report.constraints.is_empty() {
            println!("\nPath constraints:");
            for c in &report.constraints {
                let taint = if c.tainted { " [tainted]" } else { "" };
                println!("  #{} {}: {}{taint}", c.index, hex(c.pc), c.assertion);
            }
        }

        if !report.symbolic.is_empty() {
            println!("\nSymbolic locations: {}", report.symbolic.join(", "));
        }

        for warning in &report.warnings {
            println!("\nwarning: {warning}");
        }

        if let Some(trace) = &report.trace {
            println!("\nTrace:");
            for event in trace {
                if let Ok(line) = event.to_json() {
                    println!("  {line}");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global() -> GlobalOptions {
        GlobalOptions {
            json: true,
            verbose: false,
        }
    }

    #[test]
    fn test_configuration_overrides() {
        let scenario: Scenario = serde_json::from_str(r#"{ "steps": [ { "pc": 0 } ] }"#).unwrap();
        let global = global();
        let opts = ReplayOptions {
            trace: true,
            preset: Some("fast"),
            max_instructions: Some(5),
            global: &global,
        };
        let config = configuration(&scenario, &opts).unwrap();
        assert_eq!(config.max_instructions, 5);
        assert!(config.tracing.trace_instructions);
        assert!(config.tracing.output_path.is_none());
    }

    #[test]
    fn test_replay_tainted_branch() {
        let scenario: Scenario =
            serde_json::from_str(include_str!("../../scenarios/tainted_branch.json")).unwrap();
        let global = global();
        let opts = ReplayOptions {
            trace: true,
            preset: None,
            max_instructions: None,
            global: &global,
        };
        let report = replay("tainted_branch".to_string(), &scenario, &opts).unwrap();

        assert_eq!(report.steps.len(), 5);
        assert!(report.steps[..3].iter().all(|s| s.outcome == "processed"));
        assert_eq!(report.steps[3].outcome, "trigger");
        assert_eq!(report.steps[4].outcome, "trigger");

        // Both sides of the branch were explored from the same snapshot.
        assert_eq!(report.triggers.len(), 2);
        assert!(report.triggers[0].taken);
        assert_eq!(report.triggers[0].successor(), 0x101a);
        assert!(!report.triggers[1].taken);
        assert_eq!(report.triggers[1].successor(), 0x100a);

        assert_eq!(report.stats.snapshots_restored, 1);
        assert!(report.warnings.is_empty());
        let trace = report.trace.unwrap();
        assert!(matches!(trace.first(), Some(TraceEvent::Activated { .. })));
        assert!(matches!(trace.last(), Some(TraceEvent::Deactivated { .. })));
    }

    #[test]
    fn test_replay_instruction_limit() {
        let scenario: Scenario =
            serde_json::from_str(include_str!("../../scenarios/tainted_branch.json")).unwrap();
        let global = global();
        let opts = ReplayOptions {
            trace: false,
            preset: None,
            max_instructions: Some(2),
            global: &global,
        };
        let report = replay("limited".to_string(), &scenario, &opts).unwrap();
        assert_eq!(report.steps.len(), 2);
        assert!(report.triggers.is_empty());
        assert_eq!(report.warnings.len(), 1);
        assert!(report.trace.is_none());
    }

    #[test]
    fn test_step_report() {
        let report = step_report(0x1000, NotificationOutcome::Skipped);
        assert_eq!(report.outcome, "skipped");
        assert!(report.detail.is_none());

        let report = step_report(
            0x1000,
            NotificationOutcome::Processed {
                changes: 2,
                trigger: None,
            },
        );
        assert_eq!(report.outcome, "processed");
        assert_eq!(report.detail.as_deref(), Some("2 change(s)"));
    }
}
