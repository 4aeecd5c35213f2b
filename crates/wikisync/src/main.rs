use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::debug;
use wikisync_core::config::{ConfigFile, ConfigOverrides, PipelineConfig, load_config_file};
use wikisync_core::ledger::StateLedger;
use wikisync_core::pipeline::{PipelineMode, PipelineRun, RunOptions, run_pipeline, write_report};
use wikisync_core::runtime::{PathOverrides, ResolvedPaths, normalize_for_display, resolve_paths};
use wikisync_core::upload::list_exported_documents;
use wikisync_core::wiki::ListScope;

#[derive(Debug, Parser)]
#[command(
    name = "wikisync",
    version,
    about = "Scrape a MediaWiki into Markdown and upload it to an AnythingLLM workspace"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    export_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    state_dir: Option<PathBuf>,
    #[arg(long, short, global = true, help = "Log at debug level")]
    verbose: bool,
    #[arg(long, global = true, help = "Print the report as JSON")]
    json: bool,
    #[arg(long, global = true, value_name = "PATH", help = "Write the JSON report to PATH")]
    report: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape the wiki, then upload the export directory.
    Run(RunArgs),
    /// Scrape and export only.
    Scrape(WikiArgs),
    /// Upload an existing export directory.
    Upload(TargetArgs),
    /// Show resolved paths, configuration and ledger state.
    Status,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    wiki: WikiArgs,
    #[command(flatten)]
    target: TargetArgs,
}

#[derive(Debug, Clone, Default, Args)]
struct WikiArgs {
    #[arg(long, value_name = "URL", help = "Wiki host, scheme optional")]
    url: Option<String>,
    #[arg(long, value_name = "PATH", help = "Script path, e.g. / or /w/")]
    path: Option<String>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    namespace: Option<i32>,
    #[arg(long, help = "Only titles starting with this prefix")]
    prefix: Option<String>,
    #[arg(long, value_name = "N", help = "Process at most N pages")]
    limit: Option<usize>,
    #[arg(long)]
    include_redirects: bool,
    #[arg(long, help = "Ignore the saved listing cursor")]
    restart: bool,
}

#[derive(Debug, Clone, Default, Args)]
struct TargetArgs {
    #[arg(long, value_name = "URL")]
    target_url: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    workspace: Option<String>,
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match dispatch(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(2)
        }
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = if verbose {
        "wikisync=debug,wikisync_core=debug"
    } else {
        "wikisync=info,wikisync_core=info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn dispatch(cli: &Cli) -> Result<u8> {
    let paths = resolve_runtime_paths(cli)?;
    debug!(
        project_root = %normalize_for_display(&paths.project_root),
        config = %normalize_for_display(&paths.config_path),
        "resolved runtime paths"
    );
    let file = load_config_file(&paths.config_path)?;

    match &cli.command {
        Commands::Run(args) => run_mode(
            cli,
            &paths,
            &file,
            PipelineMode::Run,
            &args.wiki,
            &args.target,
        ),
        Commands::Scrape(args) => run_mode(
            cli,
            &paths,
            &file,
            PipelineMode::ScrapeOnly,
            args,
            &TargetArgs::default(),
        ),
        Commands::Upload(args) => run_mode(
            cli,
            &paths,
            &file,
            PipelineMode::UploadOnly,
            &WikiArgs::default(),
            args,
        ),
        Commands::Status => run_status(cli, &paths, &file),
    }
}

fn resolve_runtime_paths(cli: &Cli) -> Result<ResolvedPaths> {
    let cwd = env::current_dir().context("failed to resolve current directory")?;
    let overrides = PathOverrides {
        project_root: cli.project_root.clone(),
        export_dir: cli.export_dir.clone(),
        state_dir: cli.state_dir.clone(),
        config: cli.config.clone(),
    };

    let initial = resolve_paths(&cwd, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() && project_env != cwd.join(".env") {
        dotenvy::from_path(&project_env)
            .with_context(|| format!("failed to load {}", project_env.display()))?;
        return resolve_paths(&cwd, &overrides);
    }
    Ok(initial)
}

fn overrides_from(wiki: &WikiArgs, target: &TargetArgs) -> ConfigOverrides {
    ConfigOverrides {
        wiki_url: wiki.url.clone(),
        wiki_path: wiki.path.clone(),
        username: wiki.username.clone(),
        password: wiki.password.clone(),
        namespace: wiki.namespace,
        prefix: wiki.prefix.clone(),
        include_redirects: wiki.include_redirects,
        limit: wiki.limit,
        target_url: target.target_url.clone(),
        api_key: target.api_key.clone(),
        workspace: target.workspace.clone(),
    }
}

fn run_mode(
    cli: &Cli,
    paths: &ResolvedPaths,
    file: &ConfigFile,
    mode: PipelineMode,
    wiki: &WikiArgs,
    target: &TargetArgs,
) -> Result<u8> {
    let config = PipelineConfig::resolve(file, &overrides_from(wiki, target))?;
    if mode.scrapes() {
        config.wiki_api_url()?;
    }
    if mode.uploads() {
        config.require_api_key()?;
    }

    let report = run_pipeline(
        &config,
        paths,
        &RunOptions {
            mode,
            restart: wiki.restart,
        },
    )?;
    if let Some(report_path) = &cli.report {
        write_report(&report, report_path)?;
    }
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, paths);
    }
    if cli.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(report.exit_code())
}

fn print_report(report: &PipelineRun, paths: &ResolvedPaths) {
    let counts = &report.counts;
    println!("wikisync {}", report.mode.as_str());
    println!("status: {}", report.status.as_str());
    println!("stage: {}", report.stage.as_str());
    if let Some(wiki_url) = &report.config.wiki_url {
        println!("wiki_url: {wiki_url}");
    }
    println!("export_dir: {}", normalize_for_display(&paths.export_dir));
    if let Some(cursor) = &report.resumed_from {
        println!("resumed_from: {cursor}");
    }
    if report.mode.scrapes() {
        println!("listed: {}", counts.listed);
        println!("scraped: {}", counts.scraped);
        println!("exported: {}", counts.exported);
        println!("updated: {}", counts.updated);
        println!("skipped_unchanged: {}", counts.skipped_unchanged);
        println!("fetch_failed: {}", counts.fetch_failed);
        println!("export_failed: {}", counts.export_failed);
        println!("wiki_requests: {}", report.wiki_requests);
    }
    if report.mode.uploads() {
        println!("workspace: {}", report.config.workspace);
        if let Some(slug) = &report.workspace_slug {
            println!("workspace_slug: {slug}");
        }
        println!("upload_succeeded: {}", counts.upload_succeeded);
        println!("upload_skipped_unchanged: {}", counts.upload_skipped_unchanged);
        println!("upload_failed: {}", counts.upload_failed);
        println!("upload_unattached: {}", counts.upload_unattached);
        println!("upload_requests: {}", report.upload_requests);
    }
    if !report.failures.is_empty() {
        println!("failures:");
        for failure in &report.failures {
            println!(
                "  - [{}] {} ({}): {}",
                failure.stage.as_str(),
                failure.identifier,
                failure.kind,
                failure.message
            );
        }
    }
    if let Some(fatal) = &report.fatal_error {
        println!("fatal_error: {fatal}");
    }
}

fn run_status(cli: &Cli, paths: &ResolvedPaths, file: &ConfigFile) -> Result<u8> {
    let config = PipelineConfig::resolve(file, &ConfigOverrides::default())?;
    let exported = if paths.export_dir.is_dir() {
        Some(list_exported_documents(&paths.export_dir)?.len())
    } else {
        None
    };
    let ledger_state = if paths.db_path.exists() {
        let ledger = StateLedger::open(&paths.db_path)?;
        let counts = ledger.upload_counts(None)?;
        let cursor = ledger.crawl_cursor(&ListScope::from_config(&config).key())?;
        Some((counts, cursor))
    } else {
        None
    };

    if cli.json {
        let value = serde_json::json!({
            "project_root": normalize_for_display(&paths.project_root),
            "export_dir": normalize_for_display(&paths.export_dir),
            "exported_documents": exported,
            "db_path": normalize_for_display(&paths.db_path),
            "config_path": normalize_for_display(&paths.config_path),
            "config": config.snapshot(),
            "wiki_api_url": config.wiki_api_url().ok(),
            "api_key_set": config.api_key.is_some(),
            "uploads": ledger_state.as_ref().map(|(counts, _)| counts),
            "crawl_cursor": ledger_state.as_ref().and_then(|(_, cursor)| cursor.clone()),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(0);
    }

    println!("wikisync status");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("export_dir: {}", normalize_for_display(&paths.export_dir));
    match exported {
        Some(count) => println!("exported_documents: {count}"),
        None => println!("exported_documents: <missing dir>"),
    }
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("config_path: {}", format_existing(&paths.config_path));
    println!(
        "wiki_api_url: {}",
        config
            .wiki_api_url()
            .unwrap_or_else(|_| "<not configured>".to_string())
    );
    println!("wiki_login: {}", format_flag(config.credentials.is_login()));
    println!("namespace: {}", config.namespace);
    println!("prefix: {}", config.prefix.as_deref().unwrap_or("<none>"));
    println!("target_url: {}", config.target_url);
    println!("workspace: {}", config.workspace);
    println!("api_key_set: {}", format_flag(config.api_key.is_some()));
    match &ledger_state {
        Some((counts, cursor)) => {
            println!("uploads_succeeded: {}", counts.succeeded);
            println!("uploads_failed: {}", counts.failed);
            println!("uploads_pending: {}", counts.pending);
            println!("uploads_unattached: {}", counts.uploaded_unattached);
            println!("crawl_cursor: {}", cursor.as_deref().unwrap_or("<none>"));
        }
        None => println!("ledger: <not created>"),
    }
    if cli.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(0)
}

fn format_existing(path: &Path) -> String {
    let display = normalize_for_display(path);
    if path.exists() {
        display
    } else {
        format!("{display} (missing)")
    }
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
