//! Embermail - warmup engine entry point

use anyhow::Result;
use embermail_common::config::Config;
use embermail_core::{
    Clock, ContentGenerator, DayAdvancer, Dispatcher, EngagementSimulator, MailClientRegistry,
    ReplyMatcher, ScoreEngine, SpamRecovery, SystemClock, TemplateGenerator,
};
use embermail_core::mail::GmailClient;
use embermail_storage::db::DatabasePool;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Embermail warmup engine...");

    // Load configuration
    let config = Config::load()?;

    // Initialize database
    let db_pool = DatabasePool::new(&config.database).await?;

    // Run migrations
    db_pool.migrate().await?;

    // Shared collaborators, built once and passed to every worker
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = MailClientRegistry::new(Arc::new(GmailClient::new()));
    let content: Arc<dyn ContentGenerator> =
        Arc::new(TemplateGenerator::new(config.rng_seed));

    let rng_for = |stream: u64| match config.rng_seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
        None => StdRng::from_entropy(),
    };

    // Workers stop between entries once the shutdown flag flips.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher = Dispatcher::new(
        db_pool.clone(),
        registry.clone(),
        content.clone(),
        clock.clone(),
        rng_for(1),
        config.business_hours,
        config.bands,
        config.plan,
        config.intervals.dispatch_secs,
    );

    let engagement = EngagementSimulator::new(
        db_pool.clone(),
        registry.clone(),
        content.clone(),
        clock.clone(),
        rng_for(2),
        config.engagement,
        config.intervals.engagement_secs,
    );

    let replies = ReplyMatcher::new(
        db_pool.clone(),
        registry.clone(),
        clock.clone(),
        config.intervals.reply_poll_secs,
    );

    let spam_recovery = SpamRecovery::new(
        db_pool.clone(),
        registry.clone(),
        clock.clone(),
        config.intervals.spam_recovery_secs,
    );

    let day_advancer = DayAdvancer::new(
        db_pool.clone(),
        clock.clone(),
        config.plan,
        config.intervals.day_advance_secs,
    );

    let score_engine = ScoreEngine::new(
        db_pool.clone(),
        clock.clone(),
        config.score,
        config.intervals.score_secs,
    );

    let handles = vec![
        tokio::spawn(dispatcher.run(shutdown_rx.clone())),
        tokio::spawn(engagement.run(shutdown_rx.clone())),
        tokio::spawn(replies.run(shutdown_rx.clone())),
        tokio::spawn(spam_recovery.run(shutdown_rx.clone())),
        tokio::spawn(day_advancer.run(shutdown_rx.clone())),
        tokio::spawn(score_engine.run(shutdown_rx)),
    ];

    info!("Embermail started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Let each worker finish its current entry and exit.
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }

    info!("Embermail shutdown complete");

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,embermail=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(filter)
        .init();
}
