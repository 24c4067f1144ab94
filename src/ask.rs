//! `gw ask`, `gw feedback` and `gw remove`.

use anyhow::Result;

use groundwork_core::generate::AnswerFormat;
use groundwork_core::models::SourceType;
use groundwork_core::pipeline::{Feedback, QueryOptions};
use groundwork_core::{QueryRequest, QueryResponse};

use crate::config::Config;
use crate::services::Services;

/// Per-invocation overrides from the command line.
#[derive(Debug, Clone, Default)]
pub struct AskArgs {
    pub document_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub top_k: Option<usize>,
    pub best_of_n: bool,
    pub no_web: bool,
    pub no_cache: bool,
    pub format: AnswerFormat,
    pub json: bool,
}

pub async fn run_ask(config: &Config, question: &str, args: AskArgs) -> Result<()> {
    let services = Services::open(config, true).await?;

    let request = QueryRequest {
        query: question.to_string(),
        document_id: args.document_id,
        user_id: args.user_id,
        session_id: args.session_id,
        options: QueryOptions {
            top_k: args.top_k,
            best_of_n: args.best_of_n,
            web_search: !args.no_web,
            format: args.format,
            use_cache: !args.no_cache,
            ..Default::default()
        },
    };
    let response = services.pipeline.process_query(request).await;
    services.shutdown().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print_response(&response);
    }
    Ok(())
}

fn print_response(response: &QueryResponse) {
    println!("{}", response.answer);
    println!();
    println!(
        "confidence: {:.2} ({})",
        response.confidence,
        response.confidence_level.as_str()
    );

    if !response.sources.is_empty() {
        println!("sources:");
        for (i, source) in response.sources.iter().enumerate() {
            let label = match source.source_type {
                SourceType::Web => source
                    .url
                    .clone()
                    .or_else(|| source.title.clone())
                    .unwrap_or_else(|| "web".to_string()),
                _ => {
                    let doc = source.document_id.as_deref().unwrap_or("?");
                    match (&source.section_title, source.chunk_index) {
                        (Some(section), _) => format!("{} § {}", doc, section),
                        (None, Some(index)) => format!("{} #{}", doc, index),
                        (None, None) => doc.to_string(),
                    }
                }
            };
            println!("  {}. [{:.2}] {}", i + 1, source.score, label);
        }
    }

    let qa = &response.quality_assurance;
    if !qa.degradations.is_empty() {
        println!("degraded:");
        for d in &qa.degradations {
            println!("  - {}", d);
        }
    }
    println!("query id: {}", response.query_id);
}

pub async fn run_feedback(config: &Config, feedback: Feedback) -> Result<()> {
    let services = Services::open(config, false).await?;
    let result = services.pipeline.submit_feedback(feedback);
    services.shutdown().await;
    result?;
    println!("Feedback recorded.");
    Ok(())
}

pub async fn run_remove(config: &Config, document_id: &str) -> Result<()> {
    let services = Services::open(config, true).await?;
    let result = services.pipeline.remove_document(document_id).await;
    services.shutdown().await;
    let removed = result?;
    println!("remove {}", document_id);
    println!("  chunks removed: {}", removed);
    println!("ok");
    Ok(())
}
