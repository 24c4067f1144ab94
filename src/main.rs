//! # Groundwork CLI (`gw`)
//!
//! ```bash
//! gw --config ./config/gw.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `gw init` | Create the SQLite database and run schema migrations |
//! | `gw index <path>` | Index a file or directory |
//! | `gw ask "<question>"` | Answer a question from the indexed documents |
//! | `gw feedback <query-id>` | Rate an answer or submit a correction |
//! | `gw remove <document-id>` | Drop a document from the index |
//! | `gw stats` | Show what is indexed and recorded |

use clap::{ArgGroup, Parser, Subcommand};
use std::path::PathBuf;

use groundwork::ask::{self, AskArgs};
use groundwork::{config, ingest, logging, migrate, stats};
use groundwork_core::generate::AnswerFormat;
use groundwork_core::pipeline::Feedback;

/// Groundwork: grounded answers from your own documents.
#[derive(Parser)]
#[command(name = "gw", version, about = "Grounded question answering over local documents")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/gw.toml")]
    config: PathBuf,

    /// More log output (-v info, -vv debug, -vvv trace). `GW_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Index a file or every matching file under a directory.
    ///
    /// Unchanged files are skipped by content hash.
    Index {
        path: PathBuf,

        /// Re-chunk and re-embed even when content is unchanged.
        #[arg(long)]
        full: bool,

        /// Count files and estimate chunks without writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Ask a question.
    Ask {
        question: String,

        /// Restrict retrieval to one document id.
        #[arg(long)]
        document: Option<String>,

        /// User id; enables conversation history.
        #[arg(long)]
        user: Option<String>,

        #[arg(long)]
        session: Option<String>,

        /// Number of passages to answer from.
        #[arg(long)]
        top_k: Option<usize>,

        /// Generate several candidates and keep the best.
        #[arg(long)]
        best_of_n: bool,

        /// Never fall back to web search.
        #[arg(long)]
        no_web: bool,

        /// Bypass the response cache.
        #[arg(long)]
        no_cache: bool,

        /// Answer shape: auto, paragraph, bullets or numbered.
        #[arg(long, default_value = "auto", value_parser = parse_format)]
        format: AnswerFormat,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Record feedback on an answer.
    #[command(group(ArgGroup::new("kind").required(true).args(["rating", "helpful", "correction"])))]
    Feedback {
        query_id: String,

        /// Rating from 1 to 5.
        #[arg(long)]
        rating: Option<u8>,

        #[arg(long)]
        helpful: Option<bool>,

        /// Corrected answer text.
        #[arg(long)]
        correction: Option<String>,
    },

    /// Remove a document from the index and the database.
    Remove { document_id: String },

    /// Show database statistics.
    Stats,
}

fn parse_format(s: &str) -> Result<AnswerFormat, String> {
    match s {
        "auto" => Ok(AnswerFormat::Auto),
        "paragraph" => Ok(AnswerFormat::Paragraph),
        "bullets" => Ok(AnswerFormat::Bullets),
        "numbered" => Ok(AnswerFormat::Numbered),
        other => Err(format!(
            "unknown format '{}': expected auto, paragraph, bullets or numbered",
            other
        )),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_json);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Index { path, full, dry_run } => {
            ingest::run_index(&cfg, &path, full, dry_run).await?;
        }
        Commands::Ask {
            question,
            document,
            user,
            session,
            top_k,
            best_of_n,
            no_web,
            no_cache,
            format,
            json,
        } => {
            let args = AskArgs {
                document_id: document,
                user_id: user,
                session_id: session,
                top_k,
                best_of_n,
                no_web,
                no_cache,
                format,
                json,
            };
            ask::run_ask(&cfg, &question, args).await?;
        }
        Commands::Feedback {
            query_id,
            rating,
            helpful,
            correction,
        } => {
            let feedback = match (rating, helpful, correction) {
                (Some(rating), _, _) => Feedback::Rating { query_id, rating },
                (_, Some(helpful), _) => Feedback::Helpful { query_id, helpful },
                (_, _, Some(correction)) => Feedback::Correction { query_id, correction },
                (None, None, None) => anyhow::bail!("one of --rating, --helpful or --correction is required"),
            };
            ask::run_feedback(&cfg, feedback).await?;
        }
        Commands::Remove { document_id } => {
            ask::run_remove(&cfg, &document_id).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
