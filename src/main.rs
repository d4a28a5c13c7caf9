use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use exechub::report::ImageReporter;
use exechub::{Catalog, ExecutionHub, ExecutionRequest, HubConfig, ProgramKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let matches = Command::new("exechub")
        .version(env!("CARGO_PKG_VERSION"))
        .about("ExecHub execution engine")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Program catalog path")
                .default_value("config.yaml"),
        )
        .arg(
            Arg::new("actions")
                .long("actions")
                .value_name("DIR")
                .help("Hooks directory mounted at /actions inside containers"),
        )
        .subcommand(
            Command::new("run")
                .about("Submit a program and wait for it to finish")
                .arg(
                    Arg::new("program")
                        .value_name("PROGRAM_ID")
                        .required(true)
                        .help("Catalog id of the program to run"),
                )
                .arg(
                    Arg::new("param")
                        .short('p')
                        .long("param")
                        .value_name("KEY=VALUE")
                        .action(ArgAction::Append)
                        .help("Request parameter, surfaced as PARAM_<KEY>"),
                )
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("FILE")
                        .help("Write the final execution record as JSON"),
                ),
        )
        .subcommand(Command::new("programs").about("List catalog programs"))
        .subcommand(Command::new("images").about("List images declared in the catalog"))
        .subcommand_required(true)
        .get_matches();

    let config = HubConfig {
        catalog_path: PathBuf::from(matches.get_one::<String>("config").unwrap()),
        actions_dir: matches.get_one::<String>("actions").map(PathBuf::from),
    };

    match matches.subcommand() {
        Some(("run", sub)) => run(config, sub).await,
        Some(("programs", _)) => list_programs(&config),
        Some(("images", _)) => list_images(&config),
        _ => unreachable!("subcommand required"),
    }
}

async fn run(config: HubConfig, matches: &ArgMatches) -> Result<()> {
    let hub = ExecutionHub::new(config).await?;

    let mut request = ExecutionRequest::new(matches.get_one::<String>("program").unwrap().as_str());
    if let Some(params) = matches.get_many::<String>("param") {
        for param in params {
            let (key, value) = param
                .split_once('=')
                .with_context(|| format!("invalid --param {param}, expected KEY=VALUE"))?;
            request.parameters.insert(key.to_string(), value.to_string());
        }
    }

    let execution_id = hub
        .submit(request)
        .await
        .map_err(|e| anyhow::anyhow!("submission rejected ({}): {e}", e.kind()))?;
    info!(execution_id = %execution_id, "Execution submitted");

    let record = loop {
        match hub.execution(&execution_id).await {
            Some(record) if record.is_terminal() => break record,
            Some(_) => tokio::time::sleep(Duration::from_millis(250)).await,
            None => anyhow::bail!("execution record disappeared"),
        }
    };

    if let Some(path) = matches.get_one::<String>("output") {
        std::fs::write(path, serde_json::to_string_pretty(&record)?)?;
        info!(output_file = %path, "Execution record saved");
    }

    println!("⚡ Execution {:?}", record.status);
    if let Some(exit_code) = record.exit_code {
        println!("   exit code: {exit_code}");
    }
    if let (Some(end), start) = (record.end_time, record.start_time) {
        let elapsed = end.signed_duration_since(start);
        println!("   duration: {:.2}s", elapsed.num_milliseconds() as f64 / 1000.0);
    }
    if !record.output.is_empty() {
        println!("--- stdout ---");
        print!("{}", record.output);
    }
    if !record.error.is_empty() {
        println!("--- stderr ---");
        print!("{}", record.error);
    }

    Ok(())
}

fn list_programs(config: &HubConfig) -> Result<()> {
    let catalog = load_catalog(config)?;
    for program in catalog.programs() {
        let kind = match program.kind {
            ProgramKind::Script => "script",
            ProgramKind::Bot => "bot",
        };
        let state = if program.enabled { "enabled" } else { "disabled" };
        println!("{:<24} {:<7} {:<9} {}", program.id, kind, state, program.name);
    }
    Ok(())
}

fn list_images(config: &HubConfig) -> Result<()> {
    let catalog = Arc::new(load_catalog(config)?);
    for usage in ImageReporter::new(catalog).images() {
        let marker = if usage.is_default { " (default)" } else { "" };
        println!("{}{} -> [{}]", usage.image, marker, usage.programs.join(", "));
    }
    Ok(())
}

fn load_catalog(config: &HubConfig) -> Result<Catalog> {
    Catalog::load(&config.catalog_path)
        .with_context(|| format!("failed to load catalog {}", config.catalog_path.display()))
}
