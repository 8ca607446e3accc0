use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};

use bulkapi::auth::NoAuth;
use bulkapi::backend::{build_backend, EchoBackend};
use bulkapi::config::DispatchConfig;
use bulkapi::dispatch::Dispatcher;
use bulkapi::request::RawRequest;
use bulkapi::{plan, response, schema, trace};

/// bulkapi: run bulk API requests as few, ordered backend invocations.
#[derive(Parser, Debug)]
#[command(name = "bulkapi")]
#[command(about = "Dispatch bulk API requests", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a configuration file and exit
    Validate {
        /// Path to the YAML configuration
        config: PathBuf,
    },

    /// Print the JSON schema the configuration is validated against
    Schema,

    /// Show how a request would be grouped and split, without running it
    Plan {
        config: PathBuf,

        #[command(flatten)]
        source: RequestSource,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Dispatch a request and print the response body
    Run {
        config: PathBuf,

        #[command(flatten)]
        source: RequestSource,

        /// Print the dispatch trace after the response
        #[arg(long)]
        trace: bool,
    },
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct RequestSource {
    /// Request as a query string, e.g. `bulk=true&method[]=A.m`
    #[arg(long)]
    request: Option<String>,

    /// Request file: `.json`/`.yaml`/`.yml` mapping, or a query string
    #[arg(long)]
    request_file: Option<PathBuf>,
}

fn print_error_chain(err: &anyhow::Error) {
    eprintln!("Error: {err}");

    let mut n = 0;
    let mut cur = err.source();
    while let Some(cause) = cur {
        eprintln!("  {n}: {cause}");
        n += 1;
        cur = cause.source();
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = real_main(cli.command) {
        print_error_chain(&err);
        std::process::exit(1);
    }
}

fn real_main(command: Command) -> Result<()> {
    match command {
        Command::Validate { config } => {
            let cfg = load_config(&config)?;
            println!(
                "OK: {} ({} module(s), backend={})",
                config.display(),
                cfg.modules.len(),
                cfg.backend.kind
            );
            Ok(())
        }
        Command::Schema => {
            let text = serde_json::to_string_pretty(schema::config_schema_json())
                .context("serialize config schema")?;
            println!("{text}");
            Ok(())
        }
        Command::Plan {
            config,
            source,
            json,
        } => {
            let cfg = load_config(&config)?;
            let raw = read_request(&source)?;
            let rules = cfg.rule_book();
            let registry = cfg.registry();
            let backend = EchoBackend::new();
            let dispatcher = Dispatcher::new(&rules, &registry, &backend, &NoAuth);

            let planned = dispatcher.plan(&raw)?;
            if json {
                let body = serde_json::json!({
                    "calls": planned.calls,
                    "plan": planned.plan,
                });
                println!(
                    "{}",
                    serde_json::to_string_pretty(&body).context("serialize plan")?
                );
            } else {
                plan::print_plan(&planned.calls, &planned.plan);
            }
            Ok(())
        }
        Command::Run {
            config,
            source,
            trace: do_trace,
        } => {
            let cfg = load_config(&config)?;
            let raw = read_request(&source)?;
            let rules = cfg.rule_book();
            let registry = cfg.registry();
            let backend = build_backend(&cfg.backend)?;
            let dispatcher = Dispatcher::new(&rules, &registry, &backend, &backend);

            let mut tr = trace::DispatchTrace::new(format!("dispatch-{}", std::process::id()));
            let outcome = dispatcher.process(&raw, &mut tr);

            let body = response::render_outcome(&outcome);
            println!(
                "{}",
                serde_json::to_string_pretty(&body).context("serialize response")?
            );
            if do_trace {
                trace::print_trace(&tr, cli_verbose_trace());
            }

            outcome
                .map(|_| ())
                .map_err(|err| anyhow!("dispatch failed: {err}"))
        }
    }
}

fn load_config(path: &Path) -> Result<DispatchConfig> {
    DispatchConfig::load_from_file(path)
        .with_context(|| format!("failed to load config: {}", path.display()))
}

fn read_request(source: &RequestSource) -> Result<RawRequest> {
    if let Some(query) = source.request.as_deref() {
        return RawRequest::from_query(query);
    }
    let path = source
        .request_file
        .as_deref()
        .ok_or_else(|| anyhow!("one of --request or --request-file is required"))?;
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read request file: {}", path.display()))?;

    let structured = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("json" | "yaml" | "yml")
    );
    let parsed = if structured {
        RawRequest::from_yaml_str(&text)
    } else {
        RawRequest::from_query(&text)
    };
    parsed.with_context(|| format!("invalid request file: {}", path.display()))
}

/// Elapsed times make traces differ run to run; only show them on request.
fn cli_verbose_trace() -> bool {
    std::env::var("BULKAPI_TRACE_TIMING").is_ok_and(|v| v == "1")
}
