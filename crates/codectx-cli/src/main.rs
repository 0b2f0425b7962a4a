//! codectx CLI.
//!
//! Command-line interface for ingesting spans, querying context
//! bundles, running the learner, and inspecting engine state.
//!
//! Exit codes: 0 success, 2 configuration, 3 I/O or store, 4 network
//! or provider, 6 internal. Timeouts are reported as an in-band
//! TIMEOUT stop reason on the bundle, not a process exit code.

use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use codectx_core::engine::AssembleRequest;
use codectx_core::ingest::IngestRecord;
use codectx_core::{Config, ContextEngine, CtxError, CtxResult};

/// codectx - repository-scoped code context engine
#[derive(Parser, Debug)]
#[command(name = "codectx", version, about = "Budget-bounded code context bundles for AI coding agents")]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,

    /// Log level.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ingest a JSONL stream of span and reference records.
    Ingest {
        /// Path to the repository root.
        #[arg(long, default_value = ".")]
        repo: PathBuf,

        /// JSONL file of ingest records (`-` for stdin).
        spans: PathBuf,
    },

    /// Assemble a context bundle for a query.
    Query {
        /// Natural-language query.
        query: String,

        /// Path to the repository root.
        #[arg(long, default_value = ".")]
        repo: PathBuf,

        /// Token budget (0 uses the configured default).
        #[arg(short, long, default_value_t = 0)]
        budget: u32,

        /// Graph expansion depth (max 2).
        #[arg(short, long, default_value_t = 1)]
        depth: u8,

        /// Seed candidate count (0 uses the configured default).
        #[arg(short, long, default_value_t = 0)]
        k: usize,

        /// Skip attaching nearest tests.
        #[arg(long)]
        no_tests: bool,

        /// Keep plain comments in rendered bodies.
        #[arg(long)]
        verbose_comments: bool,

        /// Filter by path glob.
        #[arg(long)]
        path_glob: Option<String>,

        /// Filter by language tag.
        #[arg(long)]
        lang: Option<String>,

        /// Emit the bundle as JSON instead of rendered text.
        #[arg(long)]
        json: bool,
    },

    /// Run one learner batch over recent interactions.
    Learn {
        /// Path to the repository root.
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },

    /// Show engine status and store statistics.
    Status {
        /// Path to the repository root.
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },

    /// Show the active retrieval policy.
    Policy {
        /// Path to the repository root.
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.clone())),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn run(cli: Cli) -> CtxResult<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    match cli.command {
        Commands::Ingest { repo, spans } => {
            let engine = open_engine(&repo)?;
            let (files, references) = ingest_stream(&engine, &spans)?;
            println!("ingested {files} files, {references} references");
            Ok(())
        }
        Commands::Query {
            query,
            repo,
            budget,
            depth,
            k,
            no_tests,
            verbose_comments,
            path_glob,
            lang,
            json,
        } => {
            let engine = open_engine(&repo)?;
            let request = AssembleRequest {
                query,
                budget,
                depth,
                include_tests: !no_tests,
                verbose_comments,
                k,
                repo: None,
                path_glob,
                lang,
            };
            let assembled = runtime.block_on(engine.assemble(&request))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&assembled.bundle)?);
            } else {
                print!("{}", assembled.bundle.render());
                eprintln!(
                    "-- {} items, {}/{} tokens, satisfied: {} ({})",
                    assembled.bundle.items.len(),
                    assembled.bundle.token_report.actual,
                    assembled.bundle.token_report.budget,
                    assembled.bundle.satisfied,
                    assembled.bundle.reason,
                );
            }
            Ok(())
        }
        Commands::Learn { repo } => {
            let engine = open_engine(&repo)?;
            let outcome = engine.learn()?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Commands::Status { repo } => {
            let engine = open_engine(&repo)?;
            let status = engine.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::Policy { repo } => {
            let engine = open_engine(&repo)?;
            let snapshot = engine.policy().snapshot();
            println!("{}", serde_json::to_string_pretty(snapshot.as_ref())?);
            Ok(())
        }
    }
}

fn open_engine(repo: &std::path::Path) -> CtxResult<ContextEngine> {
    let config = Config::load(repo)?;
    ContextEngine::with_config(config)
}

/// Read a JSONL ingest stream, applying records in order. Returns
/// `(files, references)` counts.
fn ingest_stream(engine: &ContextEngine, path: &std::path::Path) -> CtxResult<(usize, usize)> {
    let reader: Box<dyn BufRead> = if path.as_os_str() == "-" {
        Box::new(std::io::stdin().lock())
    } else {
        Box::new(std::io::BufReader::new(std::fs::File::open(path)?))
    };

    let mut files = 0usize;
    let mut references = 0usize;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: IngestRecord =
            serde_json::from_str(&line).map_err(|e| CtxError::Ingest {
                details: format!("line {}: {e}", line_no + 1),
            })?;
        match &record {
            IngestRecord::File(_) => files += 1,
            IngestRecord::Reference(_) => references += 1,
        }
        engine.ingest_record(&record)?;
    }
    Ok((files, references))
}

/// Map the error taxonomy onto process exit codes.
fn exit_code(error: &CtxError) -> u8 {
    match error {
        CtxError::Config { .. } | CtxError::Ingest { .. } => 2,
        CtxError::Io(_) | CtxError::Store { .. } | CtxError::Database(_) | CtxError::NotFound { .. } => 3,
        CtxError::Provider { .. } => 4,
        CtxError::Serialization(_) | CtxError::Internal(_) => 6,
    }
}
