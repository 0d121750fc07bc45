use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use log::{LevelFilter, info};
use serde::Serialize;
use wikihistory_core::audit::{AuditReport, audit_store};
use wikihistory_core::config::{HistoryConfig, load_config};
use wikihistory_core::converter::PandocConverter;
use wikihistory_core::identity::IdentityTable;
use wikihistory_core::ingest::ExportSource;
use wikihistory_core::layout::OutputLayout;
use wikihistory_core::publish::{PublishReport, collect_inputs, publish};
use wikihistory_core::replay::{ReplayEngine, ReplayOptions, ReplayReport};
use wikihistory_core::route::RoutePolicy;
use wikihistory_core::runtime::{PathOverrides, ResolutionContext, ResolvedPaths, resolve_paths};
use wikihistory_core::scm::GitBackend;
use wikihistory_core::store::{StoreReport, open_or_build};

const DEFAULT_USERNAMES: &str = "usernames.txt";
const DEFAULT_BLOCKLIST: &str = "user_blocklist.txt";

#[derive(Debug, Parser)]
#[command(
    name = "wikihistory",
    version,
    about = "Replay a MediaWiki XML export as git history and publish it as Markdown"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "Target git repository")]
    repo: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(long, global = true, help = "Print the final report as JSON")]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    repo: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
    json: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            repo: cli.repo.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
            json: cli.json,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Parse the export into the revision store and audit titles")]
    Ingest(IngestArgs),
    #[command(about = "Commit every revision and upload in chronological order")]
    Replay(ReplayArgs),
    #[command(about = "Render Markdown from markup snapshots left by a markup-only replay")]
    Publish(PublishArgs),
}

#[derive(Debug, Args)]
struct IngestArgs {
    #[arg(
        short = 'i',
        long,
        value_name = "XML",
        help = "MediaWiki XML export, may be gzip or bzip2 compressed; '-' for stdin"
    )]
    input: String,
    #[arg(short = 't', long, value_name = "TITLE", num_args = 1.., help = "Only audit these titles")]
    titles: Vec<String>,
    #[arg(long, value_name = "N", help = "Records between store checkpoints")]
    checkpoint_interval: Option<usize>,
}

#[derive(Debug, Args)]
struct ReplayArgs {
    #[arg(
        short = 'i',
        long,
        value_name = "XML",
        help = "MediaWiki XML export, may be gzip or bzip2 compressed; '-' for stdin"
    )]
    input: String,
    #[arg(
        short = 't',
        long,
        value_name = "TITLE",
        num_args = 1..,
        help = "Optional white-list of page titles to import (rest ignored)"
    )]
    titles: Vec<String>,
    #[arg(
        short = 'u',
        long,
        value_name = "FILENAME",
        help = "TSV mapping usernames to 'Name <email>' authors [default: usernames.txt]"
    )]
    usernames: Option<PathBuf>,
    #[arg(
        short = 'b',
        long,
        value_name = "FILENAME",
        help = "Usernames whose edits are committed as UNWANTED [default: user_blocklist.txt]"
    )]
    blocklist: Option<PathBuf>,
    #[arg(short = 'e', long, value_name = "EMAIL", help = "Email for users not in the mapping")]
    default_email: Option<String>,
    #[arg(short = 'p', long, value_name = "PREFIX", help = "URL prefix and subfolder")]
    prefix: Option<String>,
    #[arg(long, value_name = "EXT")]
    mediawiki_ext: Option<String>,
    #[arg(long, value_name = "EXT")]
    markdown_ext: Option<String>,
    #[arg(long, help = "Only commit markup snapshots; run `publish` afterwards")]
    markup_only: bool,
    #[arg(long, help = "Drop commits that changed nothing once replay is done")]
    prune_empty: bool,
    #[arg(long, value_name = "N", help = "Records between store checkpoints")]
    checkpoint_interval: Option<usize>,
}

#[derive(Debug, Args)]
struct PublishArgs {
    #[arg(
        short = 'i',
        long,
        value_name = "NAMES",
        num_args = 1..,
        required = true,
        help = "MediaWiki files and/or folders within the repository"
    )]
    input: Vec<PathBuf>,
    #[arg(short = 'p', long, value_name = "PREFIX", help = "URL prefix and subfolder")]
    prefix: Option<String>,
    #[arg(long, value_name = "EXT")]
    mediawiki_ext: Option<String>,
    #[arg(long, value_name = "EXT")]
    markdown_ext: Option<String>,
}

#[derive(Debug, Serialize)]
struct IngestSummary<'a> {
    store: &'a StoreReport,
    audit: &'a AuditReport,
}

#[derive(Debug, Serialize)]
struct ReplaySummary<'a> {
    store: &'a StoreReport,
    audit: &'a AuditReport,
    replay: &'a ReplayReport,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);
    init_logger();

    match cli.command {
        Some(Commands::Ingest(args)) => run_ingest(&runtime, args),
        Some(Commands::Replay(args)) => run_replay(&runtime, args),
        Some(Commands::Publish(args)) => run_publish(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

/// `RUST_LOG` picks the level; info otherwise. Logs go to stderr so reports stay clean.
fn init_logger() {
    let default_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|value| value.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{:5}] {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter_level(default_level)
        .target(env_logger::Target::Stderr)
        .try_init()
        .ok();
}

fn run_ingest(runtime: &RuntimeOptions, args: IngestArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let source = ExportSource::parse(&args.input);
    let interval = args
        .checkpoint_interval
        .unwrap_or_else(|| config.checkpoint_interval());

    let (store, store_report) = open_or_build(&source, interval)?;
    let policy = RoutePolicy::new(whitelist(args.titles), config.ignore_prefixes());
    let audit = audit_store(&store, &policy)?;

    if runtime.json {
        let summary = IngestSummary {
            store: &store_report,
            audit: &audit,
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    println!("ingest");
    println!("input: {}", source.display());
    print_store_report("store", &store_report);
    print_audit_report("audit", &audit);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_replay(runtime: &RuntimeOptions, args: ReplayArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let root = &paths.repo_root;

    let prefix = args.prefix.unwrap_or_else(|| config.prefix());
    let layout = OutputLayout::new(
        root,
        &prefix,
        args.mediawiki_ext.as_deref().unwrap_or(config.mediawiki_ext()),
        args.markdown_ext.as_deref().unwrap_or(config.markdown_ext()),
    )?;
    let history = GitBackend::open(&config.git(), root)?;

    let default_email = args.default_email.unwrap_or_else(|| config.default_email());
    let usernames = args
        .usernames
        .or_else(|| config.usernames_path(root))
        .unwrap_or_else(|| root.join(DEFAULT_USERNAMES));
    let blocklist = args
        .blocklist
        .or_else(|| config.blocklist_path(root))
        .unwrap_or_else(|| root.join(DEFAULT_BLOCKLIST));
    let identities = IdentityTable::load(Some(&usernames), Some(&blocklist), &default_email)?;
    info!(
        "loaded {} username mappings and {} denylisted users",
        identities.mapped_users(),
        identities.denylisted_users()
    );

    let options = ReplayOptions {
        convert: config.convert() && !args.markup_only,
        default_layout: config.default_layout(),
        prune_empty: args.prune_empty,
    };
    let converter = PandocConverter::new(&config.pandoc(), config.pandoc_target());
    if options.convert {
        info!("will be using {}", converter.version()?);
    }

    let source = ExportSource::parse(&args.input);
    let interval = args
        .checkpoint_interval
        .unwrap_or_else(|| config.checkpoint_interval());
    let (store, store_report) = open_or_build(&source, interval)?;
    let policy = RoutePolicy::new(whitelist(args.titles), config.ignore_prefixes());
    let audit = audit_store(&store, &policy)?;

    info!("replaying revisions by date");
    let mut engine = ReplayEngine::new(layout, policy, identities, history, converter, options);
    let report = engine.run(&store)?;

    if runtime.json {
        let summary = ReplaySummary {
            store: &store_report,
            audit: &audit,
            replay: &report,
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    println!("replay");
    println!("repo_root: {}", normalize_path(root));
    println!("input: {}", source.display());
    print_store_report("store", &store_report);
    print_audit_report("audit", &audit);
    print_replay_report("replay", &report);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_publish(runtime: &RuntimeOptions, args: PublishArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let prefix = args.prefix.unwrap_or_else(|| config.prefix());
    let layout = OutputLayout::new(
        &paths.repo_root,
        &prefix,
        args.mediawiki_ext.as_deref().unwrap_or(config.mediawiki_ext()),
        args.markdown_ext.as_deref().unwrap_or(config.markdown_ext()),
    )?;

    let mut converter = PandocConverter::new(&config.pandoc(), config.pandoc_target());
    info!("will be using {}", converter.version()?);
    let files = collect_inputs(&layout, &args.input)?;
    let report = publish(
        &layout,
        &files,
        &mut converter,
        config.default_layout().as_deref(),
    )?;

    if runtime.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("publish");
    println!("repo_root: {}", normalize_path(&paths.repo_root));
    print_publish_report("publish", &report);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn print_store_report(prefix: &str, report: &StoreReport) {
    println!("{prefix}.path: {}", report.store_path);
    println!("{prefix}.action: {}", report.action.as_str());
    println!("{prefix}.records: {}", report.records);
    if report.skipped_on_resume > 0 {
        println!("{prefix}.skipped_on_resume: {}", report.skipped_on_resume);
    }
}

fn print_audit_report(prefix: &str, report: &AuditReport) {
    if report.case_sensitive {
        println!("{prefix}.case_collisions: <skipped> (case-sensitive file system)");
        return;
    }
    println!("{prefix}.titles_scanned: {}", report.titles_scanned);
    println!("{prefix}.case_collisions: {}", report.collisions.len());
    for collision in &report.collisions {
        println!(
            "{prefix}.case_collision: {} | {}",
            collision.first, collision.second
        );
    }
}

fn print_replay_report(prefix: &str, report: &ReplayReport) {
    println!("{prefix}.records: {}", report.records);
    println!("{prefix}.commits: {}", report.commits());
    println!("{prefix}.page_commits: {}", report.page_commits);
    println!("{prefix}.redirect_commits: {}", report.redirect_commits);
    println!("{prefix}.file_commits: {}", report.file_commits);
    println!("{prefix}.skipped: {}", report.skipped_total());
    for (reason, count) in &report.skipped {
        println!("{prefix}.skipped.{reason}: {count}");
    }
    println!("{prefix}.redirects: {}", report.redirects);
    println!("{prefix}.empty_changesets: {}", report.empty_changesets);
    println!("{prefix}.pruned: {}", format_flag(report.pruned));
    println!(
        "{prefix}.converter_failures: {}",
        report.converter_failures.len()
    );
    for title in &report.converter_failures {
        println!("{prefix}.converter_failure: {title}");
    }
    if report.missing_users.is_empty() {
        println!("{prefix}.missing_users: <none>");
    } else {
        println!("{prefix}.missing_users: {}", report.missing_users.len());
        for (username, count) in &report.missing_users {
            println!("{prefix}.missing_user: {count} - {username}");
        }
    }
    println!(
        "{prefix}.unwanted_commits: {} (from blocked users)",
        report.unwanted_commits
    );
}

fn print_publish_report(prefix: &str, report: &PublishReport) {
    println!("{prefix}.files_scanned: {}", report.files_scanned);
    println!("{prefix}.redirects: {}", report.redirects);
    println!("{prefix}.external_redirects: {}", report.external_redirects);
    println!("{prefix}.converted: {}", report.converted);
    println!("{prefix}.overwritten: {}", report.overwritten);
}

fn whitelist(titles: Vec<String>) -> Option<BTreeSet<String>> {
    if titles.is_empty() {
        None
    } else {
        Some(titles.into_iter().collect())
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        repo_root: runtime.repo.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let repo_env = initial.repo_root.join(".env");
    if repo_env.exists() {
        let _ = dotenvy::from_path_override(&repo_env);
    }

    resolve_paths(&context, &overrides).context("failed to resolve repository paths")
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
