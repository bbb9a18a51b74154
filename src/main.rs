use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand, ValueEnum};
use planline::core::{ParseResult, Schedule, TaskPatch, TaskStatus};
use planline::{calculate, outline, parse_with_today, patch_line};

#[derive(Debug, Parser)]
#[command(
    name = "planline",
    about = "Plan-outline tooling built on the planline crate",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse plan files and print their structure.
    Parse(ParseArgs),
    /// Compute a dated schedule from plan files.
    Schedule(ScheduleArgs),
    /// Rewrite one task line in a plan file.
    Set(SetArgs),
    /// Re-render plan files in canonical form.
    Fmt(FmtArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Plan files or directories to scan for `.plan` files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit the parse result as JSON instead of a summary.
    #[arg(long)]
    json: bool,
    /// Override the current date used when no `@start:` is present.
    #[arg(long)]
    today: Option<NaiveDate>,
}

#[derive(Debug, Args)]
struct ScheduleArgs {
    /// Plan files or directories to scan for `.plan` files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit the computed schedule as JSON instead of a table.
    #[arg(long)]
    json: bool,
    /// Override the current date used when no `@start:` is present.
    #[arg(long)]
    today: Option<NaiveDate>,
}

#[derive(Debug, Args)]
struct SetArgs {
    /// Plan file containing the task line.
    file: PathBuf,
    /// 1-based line number of the task to rewrite.
    #[arg(long)]
    line: usize,
    #[arg(long)]
    title: Option<String>,
    /// New duration in days.
    #[arg(long)]
    duration: Option<i64>,
    /// Pin the task to an explicit start date (YYYY-MM-DD).
    #[arg(long)]
    start: Option<NaiveDate>,
    #[arg(long, value_enum)]
    status: Option<StatusArg>,
    /// Set or clear the milestone flag.
    #[arg(long)]
    milestone: Option<bool>,
    /// Hex color, with or without the leading `#`.
    #[arg(long)]
    color: Option<String>,
    #[arg(long)]
    note: Option<String>,
    /// Write the result back to the file instead of stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct FmtArgs {
    /// Plan files or directories to scan for `.plan` files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Rewrite each file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
    /// Override the current date used when no `@start:` is present.
    #[arg(long)]
    today: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Pending,
    Progress,
    Done,
    Cancelled,
}

impl From<StatusArg> for TaskStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Pending => TaskStatus::Pending,
            StatusArg::Progress => TaskStatus::InProgress,
            StatusArg::Done => TaskStatus::Done,
            StatusArg::Cancelled => TaskStatus::Cancelled,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Parse(args) => run_parse(args, cli.verbose),
        Commands::Schedule(args) => run_schedule(args, cli.verbose),
        Commands::Set(args) => run_set(args, cli.verbose),
        Commands::Fmt(args) => run_fmt(args, cli.verbose),
    }
}

fn run_parse(args: ParseArgs, verbose: bool) -> Result<()> {
    let today = effective_today(args.today);
    for path in expand_inputs(&args.inputs)? {
        let result = load_plan(&path, today, verbose)?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            print_parse_summary(&path, &result);
        }
    }
    Ok(())
}

fn run_schedule(args: ScheduleArgs, verbose: bool) -> Result<()> {
    let today = effective_today(args.today);
    for path in expand_inputs(&args.inputs)? {
        let result = load_plan(&path, today, verbose)?;
        let schedule = calculate(&result);
        if args.json {
            println!("{}", serde_json::to_string_pretty(&schedule)?);
        } else {
            print_schedule(&path, &schedule);
        }
    }
    Ok(())
}

fn run_set(args: SetArgs, verbose: bool) -> Result<()> {
    let text = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let patch = build_patch(&args);
    let updated = patch_line(&text, args.line, &patch)
        .with_context(|| format!("failed to patch {}:{}", args.file.display(), args.line))?;
    if args.in_place {
        fs::write(&args.file, updated)
            .with_context(|| format!("failed to write {}", args.file.display()))?;
        if verbose {
            eprintln!("rewrote line {} of {}", args.line, args.file.display());
        }
    } else {
        print!("{}", updated);
    }
    Ok(())
}

fn run_fmt(args: FmtArgs, verbose: bool) -> Result<()> {
    let today = effective_today(args.today);
    for path in expand_inputs(&args.inputs)? {
        let result = load_plan(&path, today, verbose)?;
        let rendered = outline(&result);
        if args.in_place {
            fs::write(&path, &rendered)
                .with_context(|| format!("failed to write {}", path.display()))?;
            if verbose {
                eprintln!("formatted {}", path.display());
            }
        } else {
            print!("{}", rendered);
        }
    }
    Ok(())
}

fn build_patch(args: &SetArgs) -> TaskPatch {
    TaskPatch {
        title: args.title.clone(),
        duration: args.duration,
        start: args.start,
        status: args.status.map(TaskStatus::from),
        milestone: args.milestone,
        color: args.color.clone(),
        note: args.note.clone(),
    }
}

fn effective_today(override_date: Option<NaiveDate>) -> NaiveDate {
    override_date.unwrap_or_else(|| Local::now().date_naive())
}

fn load_plan(path: &Path, today: NaiveDate, verbose: bool) -> Result<ParseResult> {
    if verbose {
        eprintln!("parsing {}", path.display());
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(parse_with_today(&text, today))
}

fn print_parse_summary(path: &Path, result: &ParseResult) {
    println!("{}", path.display());
    if let Some(title) = &result.title {
        println!("  title: {}", title);
    }
    println!("  start: {}", result.start_date);
    for (key, value) in &result.meta {
        println!("  @{}: {}", key, value);
    }
    for project in &result.projects {
        println!(
            "  {} {} ({} tasks)",
            project.icon,
            project.name,
            project.tasks.len()
        );
        for task in &project.tasks {
            let indent = "  ".repeat(task.level as usize + 1);
            println!("{}- {} ({}d)", indent, task.title, task.duration);
        }
    }
}

fn print_schedule(path: &Path, schedule: &Schedule) {
    println!("{}", path.display());
    for project in &schedule.projects {
        println!(
            "  {} {}  {} → {}",
            project.icon, project.name, project.start, project.end
        );
        for task in &project.tasks {
            let indent = "  ".repeat(task.level as usize + 1);
            let marker = if task.milestone { "◆" } else { "▪" };
            let status = match task.status {
                TaskStatus::Pending => "",
                TaskStatus::InProgress => " [progress]",
                TaskStatus::Done => " [done]",
                TaskStatus::Cancelled => " [cancelled]",
            };
            println!(
                "{}{} {}  {} → {} ({}d){}",
                indent, marker, task.title, task.start, task.end, task.duration, status
            );
        }
    }
    for conflict in &schedule.conflicts {
        println!("  conflict: {}", conflict.message);
    }
    println!("  ends {}", schedule.end_date);
}

/// Expand CLI inputs into a sorted, deduplicated list of `.plan` files.
/// Directories are walked recursively; symlinks are skipped.
fn expand_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut found = BTreeSet::new();
    for input in inputs {
        let meta = fs::symlink_metadata(input)
            .with_context(|| format!("failed to stat {}", input.display()))?;
        if meta.is_dir() {
            visit_dir(input, &mut found)?;
        } else if meta.is_file() {
            if !is_plan_file(input) {
                bail!("{} is not a .plan file", input.display());
            }
            found.insert(input.clone());
        }
    }
    Ok(found.into_iter().collect())
}

fn visit_dir(dir: &Path, found: &mut BTreeSet<PathBuf>) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let path = entry.path();
        let meta = fs::symlink_metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        if meta.file_type().is_symlink() {
            continue;
        }
        if meta.is_dir() {
            visit_dir(&path, found)?;
        } else if meta.is_file() && is_plan_file(&path) {
            found.insert(path);
        }
    }
    Ok(())
}

fn is_plan_file(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("plan")
}
