//! Main entry point for the orchestrator CLI.

use agent_orchestrator::{
    batch, cli,
    memory::FactQuery,
    orchestrator::Orchestrator,
    settings::Settings,
    task::{SubmitContext, TaskStatus},
    telemetry,
};
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::warn;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let settings = Settings::load(args.settings.as_deref())?;

    telemetry::init(&settings.logging)?;

    match args.command {
        cli::Commands::Submit { text, meta } => submit(settings, text, meta).await,
        cli::Commands::Run { config } => batch::run(config, settings).await,
        cli::Commands::Facts(facts) => {
            let query = match (facts.selector.subject, facts.selector.tag) {
                (Some(subject), _) => FactQuery::Subject(subject),
                (None, Some(tag)) => FactQuery::Tag(tag),
                (None, None) => return Err(anyhow!("--subject or --tag is required")),
            };
            let orchestrator = Orchestrator::from_settings(settings)?;
            let found = orchestrator.query_facts(&query, facts.include_superseded).await;
            orchestrator.shutdown().await?;
            for fact in found? {
                println!("{}", serde_json::to_string(&fact)?);
            }
            Ok(())
        }
        cli::Commands::Config => {
            println!("{}", toml::to_string_pretty(&settings).context("Failed to render settings")?);
            Ok(())
        }
    }
}

async fn submit(settings: Settings, text: String, meta: Vec<(String, String)>) -> Result<()> {
    let orchestrator = Orchestrator::from_settings(settings)?;
    let context = meta
        .into_iter()
        .fold(SubmitContext::default(), |ctx, (k, v)| ctx.with_meta(k, v));
    let task_id = orchestrator.submit(text, context)?;

    let status = tokio::select! {
        status = orchestrator.wait(task_id) => status?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; cancelling task {}", task_id);
            orchestrator.cancel(task_id);
            orchestrator.wait(task_id).await?
        }
    };

    orchestrator.shutdown().await?;

    let decision = orchestrator.routing_decision(task_id);
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "task_id": task_id,
            "status": status,
            "routing": decision,
            "budget": orchestrator.budget(),
        }))?
    );

    match status {
        TaskStatus::Completed { .. } => Ok(()),
        _ => Err(anyhow!("Task {} did not complete", task_id)),
    }
}
