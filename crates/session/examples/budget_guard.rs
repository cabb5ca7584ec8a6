//! Budget-guarded session walkthrough.
//!
//! Runs in dry-run mode so it costs nothing. Set `OPENAI_API_KEY` and flip
//! `with_dry_run(false)` to talk to the real API.
//!
//! ```sh
//! cargo run -p costrail-session --example budget_guard
//! ```

use costrail_addons::{CacheAddon, RetryAddon, WhitespaceMinimizerAddon};
use costrail_providers::OpenAiProvider;
use costrail_session::{BatchOptions, Session};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_else(|_| "sk-dry-run".into());
    let provider = Arc::new(OpenAiProvider::new(api_key)?);

    let mut session = Session::new(provider, "gpt-4o-mini")
        .with_budget(0.10)
        .with_dry_run(true);

    session.set_alert(0.5, |cost, budget| {
        println!("! spent ${cost:.4} of ${budget:.2} (50% threshold)");
    })?;

    // Order matters: the minimizer runs before the cache so equivalent
    // prompts share a cache entry.
    session.add_addon(Arc::new(WhitespaceMinimizerAddon::new()));
    session.add_addon(Arc::new(CacheAddon::new(100, Some(3600))));
    session.add_addon(Arc::new(RetryAddon::new(3)));

    let response = session.chat("Write a haiku about borrow checking").await?;
    println!(
        "[{}] {} (${:.6}, {} tokens)",
        response.request_id,
        response.content,
        response.cost_usd,
        response.input_tokens + response.output_tokens,
    );

    let prompts: Vec<String> = ["lifetimes", "traits", "ownership"]
        .iter()
        .map(|topic| format!("One sentence on {topic}"))
        .collect();
    let results = session
        .batch_generate(&prompts, BatchOptions::default())
        .await;
    for item in &results {
        match (&item.response, &item.error) {
            (Some(response), _) => println!("  #{}: {}", item.prompt_index, response.content),
            (_, Some(error)) => println!("  #{} failed: {error}", item.prompt_index),
            _ => {}
        }
    }

    println!(
        "total: ${:.6}, remaining budget: {:?}",
        session.cost_usd(),
        session.budget_remaining()
    );
    session.export_to_json("costrail-session.json").await?;

    Ok(())
}
