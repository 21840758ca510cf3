//! `hiergraph` command-line entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config
//!   3. Init logger at the configured level (RUST_LOG wins when set)
//!   4. Open the engine and run one command
//!
//! ```text
//! hiergraph [--config <path>] <command>
//!
//! Commands:
//!   ingest <group> <file>...          split files into chunks and index them
//!   reindex <group>                   rebuild entities, tree and communities
//!   purge <group>                     delete every record of the group
//!   query <group> <text...>           answer a question
//!   stats <group>                     record counts for the group
//!
//! Query flags:
//!   --strategy <auto|flat|community|iterative>
//!   --max-iterations <n>
//!   --threshold <f>
//! ```

use std::path::Path;
use std::process;
use std::time::Duration;

use text_splitter::MarkdownSplitter;
use tracing::info;

use hiergraph::config;
use hiergraph::engine::{Answer, Engine, GroupId, IngestBatch, QueryOptions, Strategy};
use hiergraph::error::AppError;
use hiergraph::logger;

/// Target chunk length in characters for files split by `ingest`.
const CHUNK_CHARS: usize = 1200;

struct Args {
    config: Option<String>,
    command: Option<String>,
    rest: Vec<String>,
    options: QueryOptions,
}

fn parse_args() -> Result<Args, AppError> {
    let mut config = None;
    let mut command = None;
    let mut rest = Vec::new();
    let mut options = QueryOptions::default();
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => config = iter.next(),
            "--strategy" => {
                let value = iter.next().unwrap_or_default();
                options.strategy = Strategy::parse(&value)
                    .ok_or_else(|| AppError::Usage(format!("unknown strategy '{value}'")))?;
            }
            "--max-iterations" => {
                let value = iter.next().unwrap_or_default();
                options.max_iterations = Some(
                    value.parse().map_err(|_| AppError::Usage(format!("bad --max-iterations '{value}'")))?,
                );
            }
            "--threshold" => {
                let value = iter.next().unwrap_or_default();
                options.convergence_threshold =
                    Some(value.parse().map_err(|_| AppError::Usage(format!("bad --threshold '{value}'")))?);
            }
            "--deadline" => {
                let value = iter.next().unwrap_or_default();
                let secs: u64 =
                    value.parse().map_err(|_| AppError::Usage(format!("bad --deadline '{value}'")))?;
                options.deadline = Some(Duration::from_secs(secs));
            }
            "--help" | "-h" => {
                print_help();
                process::exit(0);
            }
            _ if command.is_none() => command = Some(arg),
            _ => rest.push(arg),
        }
    }
    Ok(Args { config, command, rest, options })
}

fn print_help() {
    eprintln!("usage: hiergraph [--config <path>] <command>");
    eprintln!();
    eprintln!("commands:");
    eprintln!("  ingest <group> <file>...   split files into chunks and index them");
    eprintln!("  reindex <group>            rebuild entities, tree and communities");
    eprintln!("  purge <group>              delete every record of the group");
    eprintln!("  query <group> <text...>    answer a question");
    eprintln!("  stats <group>              record counts for the group");
    eprintln!();
    eprintln!("query flags:");
    eprintln!("  --strategy <auto|flat|community|iterative>");
    eprintln!("  --max-iterations <n>");
    eprintln!("  --threshold <f>");
    eprintln!("  --deadline <seconds>");
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let _ = dotenvy::dotenv();
    let args = parse_args()?;
    let config = config::load(args.config.as_deref())?;
    logger::init(&config.log_level, false, config.log_file.as_deref())?;
    info!(
        data_dir = %config.data_dir.display(),
        log_level = %config.log_level,
        "config loaded"
    );

    let Some(command) = args.command else {
        print_help();
        return Err(AppError::Usage("missing command".into()));
    };
    let group = args
        .rest
        .first()
        .map(|g| GroupId::new(g.as_str()))
        .ok_or_else(|| AppError::Usage(format!("usage: hiergraph {command} <group> ...")))?;

    let engine = Engine::from_config(&config)?;
    match command.as_str() {
        "ingest" => {
            let files = &args.rest[1..];
            if files.is_empty() {
                return Err(AppError::Usage("usage: hiergraph ingest <group> <file>...".into()));
            }
            let splitter = MarkdownSplitter::new(CHUNK_CHARS);
            for file in files {
                let content = std::fs::read_to_string(file)?;
                let chunks: Vec<String> = splitter
                    .chunks(&content)
                    .filter(|t| !t.trim().is_empty())
                    .map(str::to_string)
                    .collect();
                let document_id = Path::new(file)
                    .file_name()
                    .map_or_else(|| file.clone(), |n| n.to_string_lossy().into_owned());
                let report = engine
                    .ingest(IngestBatch { group_id: group.clone(), document_id, chunks })
                    .await?;
                print_json(&report)?;
            }
        }
        "reindex" => print_json(&engine.reindex(&group).await?)?,
        "purge" => {
            engine.purge(&group).await?;
            println!("ok  purged {group}");
        }
        "query" => {
            let text = args.rest[1..].join(" ");
            let response = engine.query(&group, &text, &args.options).await?;
            match &response.answer {
                Answer::Text(t) => println!("{t}"),
                Answer::NoAnswerAvailable => println!("(no answer available)"),
            }
            eprintln!(
                "strategy={} iterations={} sources={}",
                response.strategy,
                response.iterations_used,
                response.provenance.len()
            );
        }
        "stats" => print_json(&engine.stats(&group).await?)?,
        other => {
            return Err(AppError::Usage(format!(
                "unknown command: {other}\n  run 'hiergraph --help' for usage"
            )));
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), AppError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| AppError::Usage(format!("render output: {e}")))?;
    println!("{json}");
    Ok(())
}
