use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use scenariolink::app::{App, FetchResult, ProgressSinkKind};
use scenariolink::catalog::{CatalogEntry, CatalogHttpClient};
use scenariolink::config::{ConfigLoader, Settings};
use scenariolink::domain::{OutputMode, PackageSource, RecordId};
use scenariolink::error::ScenarioLinkError;
use scenariolink::generate::{DependencyMapping, GenerationRequest, ProcessUnfolder};
use scenariolink::output::{JsonOutput, Presentation};
use scenariolink::selection::SelectionModel;
use scenariolink::tui::Tui;
use scenariolink::zenodo::ZenodoHttpClient;

type HttpApp = App<ZenodoHttpClient, CatalogHttpClient, ProcessUnfolder>;

#[derive(Parser)]
#[command(name = "scenariolink")]
#[command(about = "Fetch, verify and cache scenario datapackages and generate databases from them")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Config file (default: ./scenariolink.json when present).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "List datapackages published in the catalog")]
    Catalog,
    #[command(about = "Download a record into the cache and show its scenarios")]
    Fetch(FetchArgs),
    #[command(about = "Open a local datapackage archive")]
    Open(OpenArgs),
    #[command(about = "Generate databases from selected scenarios")]
    Generate(GenerateArgs),
    #[command(about = "Inspect or clear the archive cache")]
    Cache(CacheArgs),
}

#[derive(Args)]
struct FetchArgs {
    record: String,
}

#[derive(Args)]
struct OpenArgs {
    path: Utf8PathBuf,
}

#[derive(Args)]
struct GenerateArgs {
    /// Record id; fetched first when not cached yet.
    #[arg(required_unless_present = "path", conflicts_with = "path")]
    record: Option<String>,

    /// Local datapackage archive instead of a record.
    #[arg(long)]
    path: Option<Utf8PathBuf>,

    /// Scenario indices to include (default: all, or the interactive checklist).
    #[arg(long, value_delimiter = ',')]
    scenarios: Option<Vec<usize>>,

    /// NAME=DATABASE, once per datapackage dependency.
    #[arg(long = "dependency", value_parser = parse_dependency)]
    dependencies: Vec<(String, String)>,

    #[arg(long)]
    superstructure: bool,

    /// Output database name.
    #[arg(long)]
    name: Option<String>,

    /// Folder for the scenario difference file.
    #[arg(long)]
    sdf_dir: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheCommand,
}

#[derive(Subcommand)]
enum CacheCommand {
    #[command(about = "List cached archives")]
    List,
    #[command(about = "Remove one cached record, or every cached archive")]
    Clear { record: Option<String> },
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<ScenarioLinkError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &ScenarioLinkError) -> u8 {
    match error {
        ScenarioLinkError::NotFound(_) => 2,
        ScenarioLinkError::Network(_)
        | ScenarioLinkError::NetworkStatus { .. }
        | ScenarioLinkError::Integrity { .. }
        | ScenarioLinkError::Catalog(_) => 3,
        ScenarioLinkError::Execution { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let presentation = if cli.non_interactive {
        Presentation::NonInteractive
    } else {
        Presentation::Interactive
    };
    let settings = ConfigLoader::resolve(cli.config.as_deref())?;
    let app = Arc::new(build_app(&settings)?);

    match cli.command {
        Commands::Catalog => run_catalog(app, presentation),
        Commands::Fetch(args) => {
            let id: RecordId = args.record.parse()?;
            run_fetch(app, id, presentation)
        }
        Commands::Open(args) => run_open(app, args.path, presentation).map(|_| ()),
        Commands::Generate(args) => run_generate(app, args, presentation),
        Commands::Cache(args) => run_cache(app, args.command, presentation),
    }
}

fn build_app(settings: &Settings) -> miette::Result<HttpApp> {
    let client = ZenodoHttpClient::new(
        &settings.api_base,
        settings.request_timeout,
        settings.download_timeout(),
    )?;
    let catalog = CatalogHttpClient::new(&settings.catalog_url, settings.request_timeout)?;
    let unfolder = ProcessUnfolder::new(&settings.unfold_command)?;
    Ok(App::new(
        settings.cache()?,
        client,
        catalog,
        unfolder,
        settings.max_attempts,
    ))
}

fn run_catalog(app: Arc<HttpApp>, presentation: Presentation) -> miette::Result<()> {
    match presentation {
        Presentation::NonInteractive => {
            let result = app.catalog(&JsonOutput)?;
            JsonOutput::print_catalog(&result).into_diagnostic()
        }
        Presentation::Interactive => {
            let mut tui = Tui::new(ProgressSinkKind::Catalog);
            let result = tui.run(move |sink, _prompt| app.catalog(sink))?;
            for entry in &result.entries {
                println!("{}", catalog_line(entry));
            }
            Ok(())
        }
    }
}

fn run_fetch(app: Arc<HttpApp>, id: RecordId, presentation: Presentation) -> miette::Result<()> {
    let result = acquire(app, id, presentation)?;
    match presentation {
        Presentation::NonInteractive => JsonOutput::print_fetch(&result).into_diagnostic(),
        Presentation::Interactive => {
            print_fetch_summary(&result);
            Ok(())
        }
    }
}

fn acquire(
    app: Arc<HttpApp>,
    id: RecordId,
    presentation: Presentation,
) -> miette::Result<FetchResult> {
    match presentation {
        Presentation::NonInteractive => Ok(app.fetch(&id, &JsonOutput, &JsonOutput)?),
        Presentation::Interactive => {
            let mut tui = Tui::new(ProgressSinkKind::Fetch);
            tui.run(move |sink, prompt| app.fetch(&id, sink, prompt))
        }
    }
}

fn run_open(
    app: Arc<HttpApp>,
    path: Utf8PathBuf,
    presentation: Presentation,
) -> miette::Result<FetchResult> {
    let result = app.open(&path, &JsonOutput)?;
    match presentation {
        Presentation::NonInteractive => JsonOutput::print_fetch(&result).into_diagnostic()?,
        Presentation::Interactive => print_fetch_summary(&result),
    }
    Ok(result)
}

fn run_generate(
    app: Arc<HttpApp>,
    args: GenerateArgs,
    presentation: Presentation,
) -> miette::Result<()> {
    let GenerateArgs {
        record,
        path,
        scenarios,
        dependencies,
        superstructure,
        name,
        sdf_dir,
    } = args;

    // resolve through acquisition so a record archive is guaranteed on disk
    let (source, opened) = match (record, path) {
        (Some(record), _) => {
            let id: RecordId = record.parse()?;
            let opened = acquire(app.clone(), id.clone(), presentation)?;
            (PackageSource::Record(id), opened)
        }
        (None, Some(path)) => {
            let opened = app.open(&path, &JsonOutput)?;
            (PackageSource::Path(path), opened)
        }
        (None, None) => {
            return Err(miette::Report::msg("either RECORD or --path is required"));
        }
    };

    let dependencies: DependencyMapping = dependencies.into_iter().collect::<BTreeMap<_, _>>();
    let missing: Vec<&str> = opened
        .package
        .dependencies
        .iter()
        .filter(|dep| !dependencies.contains_key(*dep))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(miette::Report::msg(format!(
            "no --dependency mapping for: {}",
            missing.join(", ")
        )));
    }

    let mut selection = SelectionModel::for_package(&opened.handle);
    if let Some(indices) = &scenarios {
        selection.select_only(indices)?;
    }
    let mut mode = if superstructure {
        OutputMode::Superstructure
    } else {
        OutputMode::Databases
    };
    if scenarios.is_none()
        && !selection.is_empty_selection()
        && matches!(presentation, Presentation::Interactive)
    {
        let mut tui = Tui::new(ProgressSinkKind::Generate);
        match tui.select_scenarios(&opened.package, &mut selection)? {
            Some(chosen) => mode = chosen,
            None => return Err(miette::Report::msg("generation cancelled")),
        }
    }

    let request = GenerationRequest {
        output_name: name,
        sdf_dir,
        ..GenerationRequest::from_selection(source, &selection, dependencies, mode)?
    };
    match presentation {
        Presentation::NonInteractive => {
            let report = app.generate(request, &JsonOutput)?;
            JsonOutput::print_generate(&report).into_diagnostic()
        }
        Presentation::Interactive => {
            let mut tui = Tui::new(ProgressSinkKind::Generate);
            let report = tui.run(move |sink, _prompt| app.generate(request, sink))?;
            println!(
                "generated {} scenario(s) from {} as {}{}",
                report.scenarios.len(),
                report.archive,
                report.mode,
                report
                    .output_name
                    .map(|name| format!(" ({name})"))
                    .unwrap_or_default()
            );
            Ok(())
        }
    }
}

fn run_cache(
    app: Arc<HttpApp>,
    command: CacheCommand,
    presentation: Presentation,
) -> miette::Result<()> {
    match command {
        CacheCommand::List => {
            let result = app.list_cache(&JsonOutput)?;
            match presentation {
                Presentation::NonInteractive => JsonOutput::print_cache_list(&result).into_diagnostic(),
                Presentation::Interactive => {
                    println!("cache: {}", result.cache_root);
                    for entry in &result.entries {
                        println!(
                            "  {:<12} {:>12} bytes  {}",
                            entry.record_id,
                            entry.size_bytes,
                            entry.modified_at.as_deref().unwrap_or("-")
                        );
                    }
                    Ok(())
                }
            }
        }
        CacheCommand::Clear { record } => {
            let id = record.map(|value| value.parse::<RecordId>()).transpose()?;
            if matches!(presentation, Presentation::Interactive) {
                let question = match &id {
                    Some(id) => format!("Remove cached record {id}? (y/n)"),
                    None => format!("Remove every cached archive in {}? (y/n)", app.cache().cache_root()),
                };
                let mut tui = Tui::new(ProgressSinkKind::Cache);
                if !tui.confirm(&question)? {
                    return Ok(());
                }
            }
            let result = app.clear_cache(id.as_ref(), &JsonOutput)?;
            match presentation {
                Presentation::NonInteractive => JsonOutput::print_clear(&result).into_diagnostic(),
                Presentation::Interactive => {
                    println!("removed {} archive(s)", result.removed);
                    Ok(())
                }
            }
        }
    }
}

fn parse_dependency(raw: &str) -> Result<(String, String), String> {
    let (name, database) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=DATABASE, got {raw:?}"))?;
    let (name, database) = (name.trim(), database.trim());
    if name.is_empty() || database.is_empty() {
        return Err(format!("expected NAME=DATABASE, got {raw:?}"));
    }
    Ok((name.to_string(), database.to_string()))
}

fn catalog_line(entry: &CatalogEntry) -> String {
    let label = entry
        .columns
        .iter()
        .take(entry.columns.len().saturating_sub(1))
        .map(|(_, value)| value.as_str())
        .filter(|value| !value.is_empty())
        .collect::<Vec<_>>()
        .join(" | ");
    format!("{:<10} {label}", entry.record_id)
}

fn print_fetch_summary(result: &FetchResult) {
    let green = "\x1b[32m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    let color = if result.action == "download" { cyan } else { green };
    let title = result.package.name.as_deref().unwrap_or("datapackage");
    println!("{color}{title} ({}){reset}", result.action);
    println!("  archive: {}", result.package.path);
    if !result.package.dependencies.is_empty() {
        println!("  dependencies: {}", result.package.dependencies.join(", "));
    }
    for row in &result.package.scenarios {
        match &row.description {
            Some(description) => println!("  [{}] {} - {description}", row.index, row.name),
            None => println!("  [{}] {}", row.index, row.name),
        }
    }
}
