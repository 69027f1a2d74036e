//! Terminal rendering of plans and execution reports

use std::io::{self, Write};

use console::{Style, style};
use helmsman_kube::{Decision, DecisionType, ExecReport, Plan};

/// Icon and colour for a decision type
fn kind_style(kind: DecisionType) -> (&'static str, Style) {
    match kind {
        DecisionType::Create => ("+", Style::new().green()),
        DecisionType::Change => ("~", Style::new().yellow()),
        DecisionType::Delete => ("-", Style::new().red()),
        DecisionType::Noop => ("=", Style::new().dim()),
        DecisionType::Ignored => ("·", Style::new().dim()),
    }
}

pub fn format_decision(decision: &Decision) -> String {
    let (icon, color) = kind_style(decision.kind);
    format!(
        "  {} {} {}",
        color.apply_to(icon),
        color.apply_to(&decision.description),
        style(format!("(priority {}, {})", decision.priority, decision.kind)).dim()
    )
}

/// Renders plans to any writer; stdout by default
pub struct PlanPrinter {
    writer: Box<dyn Write>,
}

impl Default for PlanPrinter {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanPrinter {
    pub fn new() -> Self {
        Self {
            writer: Box::new(io::stdout()),
        }
    }

    pub fn with_writer<W: Write + 'static>(writer: W) -> Self {
        Self {
            writer: Box::new(writer),
        }
    }

    pub fn plan(&mut self, plan: &Plan) -> io::Result<()> {
        let decisions = plan.decisions();
        writeln!(self.writer)?;
        writeln!(
            self.writer,
            "{} {}",
            style("Plan").bold(),
            style(format!("generated at {}", plan.created().format("%Y-%m-%d %H:%M:%S UTC"))).dim()
        )?;
        writeln!(self.writer, "{}", "─".repeat(66))?;
        if decisions.is_empty() {
            writeln!(self.writer, "  {}", style("Nothing to do").dim())?;
        }
        for decision in &decisions {
            writeln!(self.writer, "{}", format_decision(decision))?;
        }
        writeln!(self.writer, "{}", "─".repeat(66))?;
        self.summary(&decisions)
    }

    fn summary(&mut self, decisions: &[Decision]) -> io::Result<()> {
        let count = |kind: DecisionType| decisions.iter().filter(|d| d.kind == kind).count();
        writeln!(
            self.writer,
            "{}: {} to create, {} to change, {} to delete, {} unchanged, {} ignored",
            style("Summary").bold(),
            style(count(DecisionType::Create)).green(),
            style(count(DecisionType::Change)).yellow(),
            style(count(DecisionType::Delete)).red(),
            count(DecisionType::Noop),
            count(DecisionType::Ignored)
        )
    }

    /// Commands in execution order
    pub fn commands(&mut self, plan: &Plan) -> io::Result<()> {
        let commands = plan.commands();
        if commands.is_empty() {
            return Ok(());
        }
        writeln!(self.writer)?;
        writeln!(self.writer, "{}:", style("Commands").bold())?;
        for planned in &commands {
            writeln!(
                self.writer,
                "  {} {}",
                style(format!("[{:>4}]", planned.priority)).dim(),
                planned.command
            )?;
        }
        Ok(())
    }

    pub fn report(&mut self, report: &ExecReport) -> io::Result<()> {
        writeln!(self.writer)?;
        for result in &report.results {
            let icon = if result.success {
                style("✓").green()
            } else {
                style("✗").red()
            };
            writeln!(self.writer, "  {} {}", icon, result.description)?;
        }
        if report.succeeded() {
            writeln!(
                self.writer,
                "{} {} command(s) executed",
                style("✓").green().bold(),
                report.results.len()
            )
        } else {
            writeln!(self.writer, "{} Run stopped after a failure", style("✗").red().bold())
        }
    }
}
