//! The plan: typed decisions plus the ordered commands that carry them out
//!
//! Decisions and commands are appended concurrently by the decision maker and
//! read once it has finished. Execution drains commands in priority bands:
//! - a band is the run of commands sharing one priority, bands run in order
//! - inside a band, commands for the same release form a chain run in submission order
//! - up to `parallel` chains run at once
//! - the first failing command that is not best-effort stops the run

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use helmsman_core::ReleaseKey;
use tracing::{error, info, warn};

use crate::command::{Command, CommandRunner};
use crate::error::KubeError;

/// Kind of outcome a decision describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecisionType {
    Create,
    Change,
    Delete,
    Noop,
    Ignored,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Change => "change",
            Self::Delete => "delete",
            Self::Noop => "noop",
            Self::Ignored => "ignored",
        }
    }

    /// Whether the decision alters the cluster
    pub fn is_change(&self) -> bool {
        matches!(self, Self::Create | Self::Change | Self::Delete)
    }
}

impl fmt::Display for DecisionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub description: String,
    pub priority: i32,
    pub kind: DecisionType,
}

/// A command scheduled in the plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCommand {
    pub command: Command,
    pub priority: i32,
    /// Commands sharing a target never overlap and keep their submission order
    pub target: Option<ReleaseKey>,
    /// Failure is logged but does not stop the run
    pub best_effort: bool,
    /// Print stdout after success (diffs)
    pub show_output: bool,
    /// Run best-effort after this command succeeds (ownership labels)
    pub follow_up: Option<Command>,
}

impl PlannedCommand {
    pub fn new(command: Command, priority: i32) -> Self {
        Self {
            command,
            priority,
            target: None,
            best_effort: false,
            show_output: false,
            follow_up: None,
        }
    }

    pub fn target(mut self, key: ReleaseKey) -> Self {
        self.target = Some(key);
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn show_output(mut self) -> Self {
        self.show_output = true;
        self
    }

    pub fn follow_up(mut self, command: Command) -> Self {
        self.follow_up = Some(command);
        self
    }
}

/// Outcome of one executed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub description: String,
    pub success: bool,
    pub output: String,
}

/// What happened during [`Plan::exec`]
#[derive(Debug, Default)]
pub struct ExecReport {
    pub results: Vec<CommandResult>,
    /// The failure that stopped the run
    pub failure: Option<KubeError>,
}

impl ExecReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    /// Slack-ready summary of every command
    pub fn summary(&self) -> String {
        let mut text = String::from("*Execution summary:*\n");
        for result in &self.results {
            let mark = if result.success { "✅" } else { "❌" };
            text.push_str(&format!("{} {}\n", mark, result.description));
        }
        if let Some(failure) = &self.failure {
            text.push_str(&format!("\n*Run stopped:* {}\n", failure));
        }
        text
    }
}

#[derive(Debug, Default)]
struct PlanInner {
    decisions: Vec<Decision>,
    commands: Vec<PlannedCommand>,
}

/// Decisions and commands for one run
#[derive(Debug)]
pub struct Plan {
    inner: Mutex<PlanInner>,
    created: DateTime<Utc>,
}

impl Default for Plan {
    fn default() -> Self {
        Self::new()
    }
}

impl Plan {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PlanInner::default()),
            created: Utc::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlanInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn add_decision(&self, description: impl Into<String>, priority: i32, kind: DecisionType) {
        let decision = Decision {
            description: description.into(),
            priority,
            kind,
        };
        match kind {
            DecisionType::Ignored | DecisionType::Noop => info!("{}", decision.description),
            _ => info!("{} [{}]", decision.description, kind),
        }
        self.lock().decisions.push(decision);
    }

    pub fn add_command(&self, command: PlannedCommand) {
        self.lock().commands.push(command);
    }

    /// Append a release's decisions and commands as one unit
    pub fn extend(&self, decisions: Vec<Decision>, commands: Vec<PlannedCommand>) {
        let mut inner = self.lock();
        inner.decisions.extend(decisions);
        inner.commands.extend(commands);
    }

    /// Stable sort of decisions and commands by ascending priority
    pub fn sort(&self) {
        let mut inner = self.lock();
        inner.decisions.sort_by_key(|d| d.priority);
        inner.commands.sort_by_key(|c| c.priority);
    }

    pub fn decisions(&self) -> Vec<Decision> {
        self.lock().decisions.clone()
    }

    pub fn commands(&self) -> Vec<PlannedCommand> {
        self.lock().commands.clone()
    }

    /// True when any decision creates, changes or deletes something
    pub fn has_changes(&self) -> bool {
        self.lock().decisions.iter().any(|d| d.kind.is_change())
    }

    /// Plain-text rendering of the decisions
    pub fn render(&self) -> String {
        let inner = self.lock();
        let mut out = format!(
            "-------- PLAN starts here --------------\nPlan generated at: {}\n",
            self.created.format("%a %b %e %H:%M:%S %Y")
        );
        for d in &inner.decisions {
            out.push_str(&format!(
                "DECISION: {} -- priority: {} -- type: {}\n",
                d.description, d.priority, d.kind
            ));
        }
        out.push_str("-------- PLAN ends here -----------------\n");
        out
    }

    /// Plain-text rendering of the commands in execution order
    pub fn render_commands(&self) -> String {
        let inner = self.lock();
        let mut out = String::new();
        for c in &inner.commands {
            out.push_str(&format!("{}: {} -- priority: {}\n", c.command.label(), c.command, c.priority));
        }
        out
    }

    /// Slack-ready rendering of the decisions
    pub fn slack_text(&self) -> String {
        let inner = self.lock();
        let mut text = format!("*Helmsman plan for {}*\n", self.created.format("%Y-%m-%d %H:%M:%S UTC"));
        for d in &inner.decisions {
            text.push_str(&format!("• `{}` {} (priority {})\n", d.kind, d.description, d.priority));
        }
        text
    }

    /// Run every command in priority bands with at most `parallel` chains at once
    pub async fn exec(&self, runner: &dyn CommandRunner, parallel: usize) -> ExecReport {
        self.sort();
        let commands = self.commands();
        if commands.is_empty() {
            info!("Nothing to execute");
            return ExecReport::default();
        }

        let aborted = AtomicBool::new(false);
        let results: Mutex<Vec<CommandResult>> = Mutex::new(Vec::new());
        let mut failure = None;

        for band in bands(commands) {
            let outcomes: Vec<Result<(), KubeError>> = stream::iter(chains(band))
                .map(|chain| run_chain(runner, chain, &aborted, &results))
                .buffer_unordered(parallel.max(1))
                .collect()
                .await;
            if let Some(err) = outcomes.into_iter().find_map(|o| o.err()) {
                failure = Some(err);
                break;
            }
        }

        ExecReport {
            results: results.into_inner().unwrap_or_else(|e| e.into_inner()),
            failure,
        }
    }
}

/// Split sorted commands into runs of equal priority
fn bands(commands: Vec<PlannedCommand>) -> Vec<Vec<PlannedCommand>> {
    let mut bands: Vec<Vec<PlannedCommand>> = Vec::new();
    for cmd in commands {
        match bands.last_mut() {
            Some(band) if band[0].priority == cmd.priority => band.push(cmd),
            _ => bands.push(vec![cmd]),
        }
    }
    bands
}

/// Group a band by target, keeping first-appearance order; untargeted commands stand alone
fn chains(band: Vec<PlannedCommand>) -> Vec<Vec<PlannedCommand>> {
    let mut chains: Vec<Vec<PlannedCommand>> = Vec::new();
    let mut index: BTreeMap<ReleaseKey, usize> = BTreeMap::new();
    for cmd in band {
        match cmd.target.clone() {
            Some(key) => match index.get(&key) {
                Some(&i) => chains[i].push(cmd),
                None => {
                    index.insert(key, chains.len());
                    chains.push(vec![cmd]);
                }
            },
            None => chains.push(vec![cmd]),
        }
    }
    chains
}

async fn run_chain(
    runner: &dyn CommandRunner,
    chain: Vec<PlannedCommand>,
    aborted: &AtomicBool,
    results: &Mutex<Vec<CommandResult>>,
) -> Result<(), KubeError> {
    let record = |description: String, success: bool, output: String| {
        results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(CommandResult {
                description,
                success,
                output,
            });
    };

    for planned in chain {
        if aborted.load(Ordering::SeqCst) {
            return Ok(());
        }
        let label = planned.command.label();
        info!("{}", label);
        let out = runner.run(&planned.command).await;

        if !out.success() {
            record(label.clone(), false, out.stderr.clone());
            if planned.best_effort {
                warn!("{} failed (ignored): {}", label, out.stderr.trim());
                continue;
            }
            error!("Command returned with exit code {}: {}", out.code, out.stderr.trim());
            aborted.store(true, Ordering::SeqCst);
            return Err(KubeError::CommandFailed {
                description: label,
                code: out.code,
                stderr: out.stderr,
            });
        }

        if planned.show_output && !out.stdout.trim().is_empty() {
            println!("{}", out.stdout);
        }
        record(label, true, String::new());

        if let Some(follow_up) = &planned.follow_up {
            let follow = runner.run(follow_up).await;
            if !follow.success() {
                warn!("{} failed (ignored): {}", follow_up.label(), follow.stderr.trim());
            }
        }
    }
    Ok(())
}
