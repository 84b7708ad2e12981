//! `selfheal` CLI: run a generated project, repair it until it works, and
//! hand the result to version control after review.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use selfheal::attempt::LocalLauncher;
use selfheal::exit_codes;
use selfheal::io::config::{EngineConfig, STATE_DIR, config_path, load_config, write_config};
use selfheal::io::console::{EchoObserver, TerminalOperator};
use selfheal::io::git::Git;
use selfheal::io::oracle::CommandOracle;
use selfheal::io::prompt::PromptPack;
use selfheal::io::signal::install_interrupt_handler;
use selfheal::io::store::DirStore;
use selfheal::io::transcript::Transcript;
use selfheal::logging;
use selfheal::review::{ReviewGate, ReviewOutcome, ReviewSettings};
use selfheal::supervise::{ExecutionSupervisor, SessionOutcome, SessionSettings, SessionStop};

#[derive(Parser)]
#[command(
    name = "selfheal",
    version,
    about = "Run a generated project and repair failures with an oracle"
)]
struct Cli {
    /// More engine diagnostics on stderr (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `.selfheal/config.toml` with default settings.
    Init {
        #[command(flatten)]
        project: ProjectArgs,
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Execute the run script, repairing failures until it succeeds.
    Run(RunArgs),
    /// Show working tree changes, then commit and push on approval.
    Review(ProjectArgs),
}

#[derive(Args)]
struct ProjectArgs {
    /// Project root containing the run script.
    #[arg(long, default_value = ".")]
    project: PathBuf,
    /// Skip confirmation prompts.
    #[arg(long)]
    unattended: bool,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    project: ProjectArgs,
    /// Maximum number of launches for this session.
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Health endpoint to poll after launch.
    #[arg(long)]
    url: Option<String>,
    /// Do not wait for a server; judge the run by exit status only.
    #[arg(long)]
    no_probe: bool,
    /// Do not read the browser console after the server answers.
    #[arg(long)]
    no_browser: bool,
    /// Run the review gate after a successful session.
    #[arg(long)]
    review: bool,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { project, force } => cmd_init(&project, force),
        Command::Run(args) => cmd_run(&args),
        Command::Review(project) => cmd_review(&project),
    }
}

fn project_root(args: &ProjectArgs) -> Result<PathBuf> {
    args.project
        .canonicalize()
        .with_context(|| format!("project directory {}", args.project.display()))
}

fn load_project_config(root: &Path, args: &ProjectArgs) -> Result<EngineConfig> {
    let mut config = load_config(&config_path(root))?;
    config.unattended |= args.unattended;
    Ok(config)
}

fn cmd_init(args: &ProjectArgs, force: bool) -> Result<i32> {
    let root = project_root(args)?;
    let path = config_path(&root);
    if path.exists() && !force {
        println!("{} already exists (use --force to overwrite)", path.display());
        return Ok(exit_codes::OK);
    }
    let config = EngineConfig {
        unattended: args.unattended,
        ..EngineConfig::default()
    };
    write_config(&path, &config)?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(args: &RunArgs) -> Result<i32> {
    let root = project_root(&args.project)?;
    let mut config = load_project_config(&root, &args.project)?;
    if let Some(max_attempts) = args.max_attempts {
        config.max_attempts = max_attempts;
    }
    if let Some(url) = &args.url {
        config.health.url = url.clone();
    }
    if args.no_probe {
        config.health.enabled = false;
    }
    if args.no_browser {
        config.browser.enabled = false;
    }
    config.validate()?;

    let cancel = install_interrupt_handler()?;
    let launcher = LocalLauncher::from_config(&config, Arc::new(EchoObserver))?;
    let oracle = CommandOracle::new(&config.oracle, &root);
    let store = DirStore::new(&root, config.store.ignore.clone());
    let operator = TerminalOperator;
    let prompts = PromptPack::new()?;
    let mut transcript = new_transcript(&root, &config);

    let settings = SessionSettings {
        workdir: root.clone(),
        run_script: config.run_script.clone(),
        shell: config.shell.clone(),
        max_attempts: config.max_attempts,
        unattended: config.unattended,
        log_root: Some(root.clone()),
    };
    let outcome =
        ExecutionSupervisor::new(&launcher, &oracle, &store, &operator, &prompts, settings)
            .run(&cancel, &mut transcript)?;
    print_session(&outcome);

    if args.review && outcome.stop == SessionStop::Success {
        let git = Git::new(&root).with_remote(config.review.remote.clone());
        let gate = ReviewGate::new(
            &git,
            &oracle,
            &operator,
            &prompts,
            review_settings(&config),
        );
        print_review(&gate.review(&mut transcript)?);
    }

    Ok(match outcome.stop {
        SessionStop::Success | SessionStop::Declined => exit_codes::OK,
        SessionStop::Cancelled => exit_codes::CANCELLED,
        SessionStop::Exhausted { .. } => exit_codes::EXHAUSTED,
        SessionStop::Unverified => exit_codes::UNVERIFIED,
    })
}

fn cmd_review(args: &ProjectArgs) -> Result<i32> {
    let root = project_root(args)?;
    let config = load_project_config(&root, args)?;
    let git = Git::new(&root).with_remote(config.review.remote.clone());
    let oracle = CommandOracle::new(&config.oracle, &root);
    let operator = TerminalOperator;
    let prompts = PromptPack::new()?;
    let mut transcript = new_transcript(&root, &config);

    let gate = ReviewGate::new(&git, &oracle, &operator, &prompts, review_settings(&config));
    print_review(&gate.review(&mut transcript)?);
    Ok(exit_codes::OK)
}

fn new_transcript(root: &Path, config: &EngineConfig) -> Transcript {
    Transcript::new(config.transcript.window)
        .with_journal(root.join(STATE_DIR).join("transcript.jsonl"))
}

fn review_settings(config: &EngineConfig) -> ReviewSettings {
    ReviewSettings {
        unattended: config.unattended,
        branch: config.review.branch.clone(),
        generate_branch_name: config.review.generate_branch_name,
    }
}

fn print_session(outcome: &SessionOutcome) {
    let attempts = outcome.attempts;
    match &outcome.stop {
        SessionStop::Success => println!("program ran successfully after {attempts} attempt(s)"),
        SessionStop::Declined => println!("not executed"),
        SessionStop::Cancelled => println!("stopped by keyboard interrupt"),
        SessionStop::Unverified => {
            println!("server did not start; could not verify the program");
        }
        SessionStop::Exhausted { last_failure } => {
            println!("still failing after {attempts} attempt(s); human intervention required");
            if let Some(report) = last_failure {
                println!("{}", report.render());
            }
        }
    }
    if attempts > 0 {
        println!("logs: {STATE_DIR}/attempts/{}", outcome.session_id);
    }
}

fn print_review(outcome: &ReviewOutcome) {
    match outcome {
        ReviewOutcome::NoChanges => println!("no changes to commit"),
        ReviewOutcome::Rejected => println!("changes were not committed"),
        ReviewOutcome::Unavailable { warning } => println!("review skipped: {warning}"),
        ReviewOutcome::Applied {
            branch,
            message,
            committed,
            pushed,
            warnings,
        } => {
            if *committed {
                let on = branch.as_deref().map(|b| format!(" on {b}")).unwrap_or_default();
                println!("committed{on}: {}", message.lines().next().unwrap_or_default());
            }
            if *pushed {
                println!("pushed to remote");
            }
            for warning in warnings {
                println!("warning: {warning}");
            }
        }
    }
}
