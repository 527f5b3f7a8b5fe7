//! Main entry point for the pipeline binary
//!
//! Wires the store, the credential pool, the router and the pipeline together
//! from environment configuration, then runs one command.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use completions::{
    KeyPool, KeyPoolConfig, OpenAiCompatibleClient, PrimaryProvider, ProviderRouter, ProviderSettings, RouterConfig,
};
use pipeline::{ContentConfig, JobConfig, Pipeline, PipelineConfig};
use shared::{
    component_debug, component_info, logging, ChatMessage, Clock, Component, CompletionRequest, InMemoryStore,
    KeyValueStore, Priority, ResponseFormat, SystemClock,
};

/// Routed AI completions and five-stage content jobs
#[derive(Parser)]
#[command(name = "pipeline")]
#[command(about = "Routes completions between providers and runs five-stage content jobs")]
pub struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Redis URL for the shared store (in-memory store when omitted)
    #[cfg(feature = "redis")]
    #[arg(long)]
    pub redis_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Route a single completion and print the result
    Complete {
        #[arg(long)]
        prompt: String,

        #[arg(long)]
        system: Option<String>,

        #[arg(long, default_value_t = 5)]
        priority: u8,

        /// Ask the provider for a JSON object
        #[arg(long)]
        json: bool,
    },

    /// Submit a content job, wait for it and print the outcome
    RunJob {
        #[arg(long)]
        pillar: String,

        #[arg(long)]
        audience: String,

        #[arg(long, default_value_t = 5)]
        priority: u8,

        #[arg(long, default_value_t = 120_000)]
        timeout_ms: u64,

        #[arg(long, default_value = "")]
        brand_context: String,

        /// Content hash to steer away from; repeatable
        #[arg(long = "exclude")]
        excluded_hashes: Vec<String>,
    },
}

fn in_memory_store() -> Arc<dyn KeyValueStore> {
    component_debug!(Component::Cli, "Using in-memory store");
    Arc::new(InMemoryStore::new())
}

#[cfg(feature = "redis")]
async fn build_store(args: &Args) -> anyhow::Result<Arc<dyn KeyValueStore>> {
    match &args.redis_url {
        Some(url) => {
            let store = shared::RedisStore::connect(url)
                .await
                .context("connecting to redis")?;
            component_info!(Component::Cli, "Using redis store");
            Ok(Arc::new(store))
        }
        None => Ok(in_memory_store()),
    }
}

#[cfg(not(feature = "redis"))]
async fn build_store(_args: &Args) -> anyhow::Result<Arc<dyn KeyValueStore>> {
    Ok(in_memory_store())
}

fn build_router(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> anyhow::Result<ProviderRouter> {
    let secondary = ProviderSettings::secondary_from_env()?;
    let secondary_client = OpenAiCompatibleClient::from_settings(&secondary)?;
    let pool = KeyPool::new(
        secondary.api_keys.clone(),
        Arc::new(secondary_client),
        secondary.model.clone(),
        KeyPoolConfig::default(),
        clock.clone(),
    )?;

    let primary = match ProviderSettings::primary_from_env() {
        Some(settings) => {
            let client = OpenAiCompatibleClient::from_settings(&settings)?;
            let api_key = settings.api_keys.first().cloned().unwrap_or_default();
            Some(PrimaryProvider::new(Arc::new(client), api_key, settings.model))
        }
        None => None,
    };

    Ok(ProviderRouter::new(
        primary,
        Arc::new(pool),
        store,
        RouterConfig::default(),
        clock,
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();
    let args = Args::parse();

    logging::init_tracing(Some(&args.log_level));
    logging::log_startup(Component::Cli, "pipeline");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = build_store(&args).await?;
    let router = Arc::new(build_router(store.clone(), clock.clone()).context("configuring providers")?);
    router.start().await;

    let outcome = match args.command {
        Command::Complete {
            prompt,
            system,
            priority,
            json,
        } => {
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(ChatMessage::system(system));
            }
            messages.push(ChatMessage::user(prompt));

            let mut request = CompletionRequest::new(messages).with_priority(Priority::new(priority));
            if json {
                request = request.with_response_format(ResponseFormat::JsonObject);
            }

            let result = router.complete(request).await;
            serde_json::to_string_pretty(&result)?
        }
        Command::RunJob {
            pillar,
            audience,
            priority,
            timeout_ms,
            brand_context,
            excluded_hashes,
        } => {
            let pipeline = Pipeline::new(router.clone(), store, PipelineConfig::default(), clock);
            pipeline.start().await;

            let config = JobConfig {
                brand_context,
                ..JobConfig::new(ContentConfig::new(pillar, audience))
            };
            let job_id = pipeline
                .submit_job(config, excluded_hashes, Priority::new(priority))
                .await?;
            component_info!(Component::Cli, "Waiting on job {}", job_id);

            let outcome = pipeline
                .wait_for_completion(&job_id, Duration::from_millis(timeout_ms))
                .await?;
            pipeline.stop().await;
            serde_json::to_string_pretty(&outcome)?
        }
    };

    println!("{}", outcome);

    router.stop().await;
    logging::log_shutdown(Component::Cli, "command finished");
    Ok(())
}
