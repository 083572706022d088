use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use stackctl::{Controller, StackError};
use stackctl_collab::git::ShellGit;
use stackctl_collab::observer::Reporter;
use stackctl_collab::traits::GitChangeSource;
use stackctl_config::{resolve, resolve_profile, BuiltinDefaults, CliOverrides, StackfileSettings};
use stackctl_engine::{RunOutcome, RunSummary};
use stackctl_plan::SelectorOptions;
use stackctl_types::{Event, Plan, RunOptions};

mod shell_adapters;

use shell_adapters::{ShellHelm, ShellKubectl};

/// Writes progress lines to stderr; no separate progress-bar widget, since
/// the scheduler has no single linear count of work the way a crate
/// publish run does (nodes become ready and finish independently).
struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

#[derive(Parser, Debug)]
#[command(name = "stackctl", version)]
#[command(about = "Dependency-ordered, resumable Helm release orchestration across clusters")]
struct Cli {
    /// Root directory to discover stack/release descriptors under.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Path to the run store's SQLite database.
    #[arg(long, global = true, default_value = ".stackctl/state.db")]
    store: PathBuf,

    /// Optional TOML file of run-option defaults (concurrency, etc.), layered
    /// under CLI flags and over the built-ins.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply the selected releases.
    Apply(RunArgs),
    /// Delete the selected releases, in reverse dependency order.
    Delete(RunArgs),
    /// Resume a prior run, re-attempting only what's left.
    Resume(ResumeArgs),
    /// Print the latest per-node status of a run.
    Status(RunIdArgs),
    /// Stream a run's events as they're appended.
    Follow(FollowArgs),
    /// List recent runs.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the compiled, selected plan with selection reasons.
    Explain(SelectorArgs),
    /// Print the plan's dependency edges and layering.
    Graph(SelectorArgs),
}

#[derive(Args, Debug, Clone)]
struct SelectorArgs {
    /// Profile to compile against (default: the stack file's, else "default").
    #[arg(long)]
    profile: Option<String>,
    #[arg(long = "cluster")]
    clusters: Vec<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long = "release")]
    releases: Vec<String>,
    #[arg(long = "from-path")]
    from_paths: Vec<PathBuf>,
    #[arg(long)]
    git_range: Option<String>,
    #[arg(long)]
    include_deps: bool,
    #[arg(long)]
    include_dependents: bool,
    #[arg(long)]
    git_include_deps: bool,
    #[arg(long)]
    git_include_dependents: bool,
    #[arg(long)]
    allow_missing_deps: bool,
}

#[derive(Args, Debug, Clone)]
struct RunOptionArgs {
    #[arg(long)]
    concurrency: Option<usize>,
    /// Repeatable `cluster=limit` override of per-cluster concurrency.
    #[arg(long = "cluster-concurrency", value_parser = parse_cluster_limit)]
    per_cluster_concurrency: Vec<(String, usize)>,
    #[arg(long)]
    progressive_concurrency: bool,
    #[arg(long)]
    allow_drift: bool,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    rerun_failed: bool,
    #[arg(long)]
    takeover: bool,
}

fn parse_cluster_limit(s: &str) -> Result<(String, usize), String> {
    let (cluster, limit) = s.split_once('=').ok_or_else(|| format!("expected cluster=limit, got {s:?}"))?;
    let limit: usize = limit.parse().map_err(|_| format!("invalid concurrency limit {limit:?}"))?;
    Ok((cluster.to_string(), limit))
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    selector: SelectorArgs,
    #[command(flatten)]
    run_options: RunOptionArgs,
}

#[derive(Args, Debug, Clone)]
struct ResumeArgs {
    prior_run_id: String,
    #[command(flatten)]
    selector: SelectorArgs,
    #[command(flatten)]
    run_options: RunOptionArgs,
}

#[derive(Args, Debug, Clone)]
struct RunIdArgs {
    run_id: String,
    #[command(flatten)]
    selector: SelectorArgs,
}

#[derive(Args, Debug, Clone)]
struct FollowArgs {
    run_id: String,
    #[arg(long, default_value_t = 0)]
    from_seq: u64,
}

fn selector_options(root: &std::path::Path, args: &SelectorArgs) -> Result<SelectorOptions> {
    let changed_files = match &args.git_range {
        Some(range) => ShellGit.changed_files(root, range)?.into_iter().collect(),
        None => BTreeSet::new(),
    };

    Ok(SelectorOptions {
        clusters: args.clusters.iter().cloned().collect(),
        tags: args.tags.iter().cloned().collect(),
        from_paths: args.from_paths.iter().cloned().collect(),
        releases: args.releases.iter().cloned().collect(),
        changed_files,
        git_range: args.git_range.clone(),
        include_deps: args.include_deps,
        include_dependents: args.include_dependents,
        git_include_deps: args.git_include_deps,
        git_include_dependents: args.git_include_dependents,
        allow_missing_deps: args.allow_missing_deps,
    })
}

fn load_run_config(path: Option<&std::path::Path>) -> Result<Option<StackfileSettings>> {
    let Some(path) = path else { return Ok(None) };
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let settings: StackfileSettings = toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(settings))
}

fn run_options(stackfile: Option<&StackfileSettings>, selector: &SelectorArgs, args: &RunOptionArgs) -> RunOptions {
    let builtin = BuiltinDefaults::default();
    let cli = CliOverrides {
        concurrency: args.concurrency,
        per_cluster_concurrency: args.per_cluster_concurrency.iter().cloned().collect(),
        progressive_concurrency: args.progressive_concurrency.then_some(true),
        allow_missing_deps: selector.allow_missing_deps.then_some(true),
        allow_drift: args.allow_drift.then_some(true),
        rerun_failed: args.rerun_failed,
        dry_run: args.dry_run,
        takeover: args.takeover,
        profile: None,
    };
    resolve(&builtin, stackfile, &cli)
}

fn profile_name(stackfile: Option<&StackfileSettings>, selector: &SelectorArgs) -> String {
    let cli = CliOverrides {
        profile: selector.profile.clone(),
        ..Default::default()
    };
    resolve_profile(stackfile, &cli)
}

fn build_plan_readonly(root: &std::path::Path, profile: &str, selector: &SelectorOptions) -> Result<Plan, StackError> {
    let universe = stackctl_plan::discover(root)?;
    let compiled = stackctl_plan::compile(&universe, profile)?;
    let selected = stackctl_plan::select(&universe, &compiled, selector)?;
    Ok(stackctl_plan::build_graph(&selected)?)
}

fn build_controller(cli: &Cli) -> Result<Controller> {
    if let Some(parent) = cli.store.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    Ok(Controller::new(
        cli.root.clone(),
        &cli.store,
        Arc::new(ShellHelm),
        Arc::new(ShellKubectl),
        None,
    )?)
}

fn exit_code_for_summary(outcome: RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Succeeded => 0,
        RunOutcome::Failed => 1,
    }
}

fn print_summary(summary: &RunSummary) {
    println!("outcome: {:?}", summary.outcome);
    for (id, status) in &summary.nodes {
        println!("{id}: {status:?}");
    }
}

fn print_event(event: &Event) {
    let node = event.node_id.as_ref().map(|n| n.to_string()).unwrap_or_else(|| "-".to_string());
    println!("{:>6} {node} {} attempt={} {}", event.seq, event.kind, event.attempt, event.message);
}

fn main() -> std::process::ExitCode {
    match run() {
        Ok(code) => std::process::ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("[error] {err}");
            let code = err.downcast_ref::<StackError>().map(|e| e.exit_code()).unwrap_or(1);
            std::process::ExitCode::from(code as u8)
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let stackfile_settings = load_run_config(cli.config.as_deref())?;

    match &cli.cmd {
        Commands::Apply(args) => {
            let controller = build_controller(&cli)?;
            let profile = profile_name(stackfile_settings.as_ref(), &args.selector);
            let selector = selector_options(&cli.root, &args.selector)?;
            let options = run_options(stackfile_settings.as_ref(), &args.selector, &args.run_options);
            let mut reporter = CliReporter;
            let cancel = Arc::new(AtomicBool::new(false));
            let summary = controller.apply(&profile, selector, options, &mut reporter, &cancel)?;
            print_summary(&summary);
            Ok(exit_code_for_summary(summary.outcome))
        }
        Commands::Delete(args) => {
            let controller = build_controller(&cli)?;
            let profile = profile_name(stackfile_settings.as_ref(), &args.selector);
            let selector = selector_options(&cli.root, &args.selector)?;
            let options = run_options(stackfile_settings.as_ref(), &args.selector, &args.run_options);
            let mut reporter = CliReporter;
            let cancel = Arc::new(AtomicBool::new(false));
            let summary = controller.delete(&profile, selector, options, &mut reporter, &cancel)?;
            print_summary(&summary);
            Ok(exit_code_for_summary(summary.outcome))
        }
        Commands::Resume(args) => {
            let controller = build_controller(&cli)?;
            let profile = profile_name(stackfile_settings.as_ref(), &args.selector);
            let selector = selector_options(&cli.root, &args.selector)?;
            let options = run_options(stackfile_settings.as_ref(), &args.selector, &args.run_options);
            let mut reporter = CliReporter;
            let cancel = Arc::new(AtomicBool::new(false));
            let summary = controller.resume(&args.prior_run_id, &profile, selector, options, &mut reporter, &cancel)?;
            print_summary(&summary);
            Ok(exit_code_for_summary(summary.outcome))
        }
        Commands::Status(args) => {
            let controller = build_controller(&cli)?;
            let profile = profile_name(stackfile_settings.as_ref(), &args.selector);
            let selector = selector_options(&cli.root, &args.selector)?;
            let plan = build_plan_readonly(&cli.root, &profile, &selector)?;
            let status = controller.status(&args.run_id, &plan)?;
            for (id, state) in status {
                println!("{id}: {:?} (attempt {})", state.status, state.attempt);
            }
            Ok(0)
        }
        Commands::Follow(args) => {
            let controller = build_controller(&cli)?;
            let cancel = AtomicBool::new(false);
            controller.follow(&args.run_id, args.from_seq, &cancel, print_event)?;
            Ok(0)
        }
        Commands::Runs { limit } => {
            let controller = build_controller(&cli)?;
            for run in controller.list_runs(*limit)? {
                println!("{} {} {:?} started={}", run.run_id, run.command, run.status, run.started_at);
            }
            Ok(0)
        }
        Commands::Explain(selector_args) => {
            let profile = profile_name(stackfile_settings.as_ref(), selector_args);
            let selector = selector_options(&cli.root, selector_args)?;
            let plan = build_plan_readonly(&cli.root, &profile, &selector)?;
            for node in &plan.nodes {
                let reasons: Vec<String> = node.selected_by.iter().map(|r| r.to_string()).collect();
                let layer = plan.layers.as_ref().and_then(|l| l.get(&node.id)).copied().unwrap_or(0);
                println!(
                    "{} chart={}@{} layer={layer} needs={:?} selected_by={:?}",
                    node.id,
                    node.chart,
                    node.chart_version.as_deref().unwrap_or("-"),
                    node.needs,
                    reasons
                );
            }
            Ok(0)
        }
        Commands::Graph(selector_args) => {
            let profile = profile_name(stackfile_settings.as_ref(), selector_args);
            let selector = selector_options(&cli.root, selector_args)?;
            let plan = build_plan_readonly(&cli.root, &profile, &selector)?;
            for id in plan.ids() {
                for need in plan.edges.needs(id) {
                    println!("{id} -> {need}");
                }
            }
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cluster_limit_rejects_missing_equals() {
        assert!(parse_cluster_limit("prod").is_err());
    }

    #[test]
    fn parse_cluster_limit_parses_valid_input() {
        assert_eq!(parse_cluster_limit("prod=3").unwrap(), ("prod".to_string(), 3));
    }

    #[test]
    fn profile_name_falls_back_through_stackfile_then_default() {
        let selector = empty_selector_args();
        assert_eq!(profile_name(None, &selector), "default");

        let stackfile = StackfileSettings {
            default_profile: Some("staging".to_string()),
            ..Default::default()
        };
        assert_eq!(profile_name(Some(&stackfile), &selector), "staging");
    }

    fn empty_selector_args() -> SelectorArgs {
        SelectorArgs {
            profile: None,
            clusters: vec![],
            tags: vec![],
            releases: vec![],
            from_paths: vec![],
            git_range: None,
            include_deps: false,
            include_dependents: false,
            git_include_deps: false,
            git_include_dependents: false,
            allow_missing_deps: false,
        }
    }

    #[test]
    fn run_options_applies_cli_flags_over_builtins() {
        let args = RunOptionArgs {
            concurrency: Some(9),
            per_cluster_concurrency: vec![("prod".to_string(), 2)],
            progressive_concurrency: true,
            allow_drift: false,
            dry_run: true,
            rerun_failed: false,
            takeover: false,
        };
        let resolved = run_options(None, &empty_selector_args(), &args);
        assert_eq!(resolved.concurrency, 9);
        assert_eq!(resolved.per_cluster_concurrency.get("prod"), Some(&2));
        assert!(resolved.progressive_concurrency);
        assert!(resolved.dry_run);
    }
}
