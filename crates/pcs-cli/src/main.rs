mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pcs_core::{Platform, QualityTier, ServiceFilter, ServiceType, SyncResult};
use pcs_storage::JsonFileStore;
use pcs_sync::{Marketplace, SyncConfig};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "pcs-cli")]
#[command(about = "Provider catalog sync and resale pricing")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync one provider, or every active provider.
    Sync {
        #[arg(long)]
        provider: Option<String>,
    },
    /// Run the recurring sync until Ctrl-C.
    Schedule,
    Providers,
    Services {
        #[arg(long)]
        provider: Option<String>,
        #[arg(long, value_parser = parse_platform)]
        platform: Option<Platform>,
        #[arg(long, value_parser = parse_service_type)]
        service_type: Option<ServiceType>,
        #[arg(long, value_parser = parse_quality)]
        quality: Option<QualityTier>,
        #[arg(long)]
        active: Option<bool>,
    },
    History {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Apply the stored pricing rules to the whole catalog.
    ApplyRules,
    SetServiceMargin {
        id: Uuid,
        percent: f64,
    },
    SetProviderMargin {
        id: String,
        percent: f64,
    },
    Balance {
        provider: String,
    },
    Stats,
}

fn parse_platform(value: &str) -> Result<Platform, String> {
    Platform::parse(value).ok_or_else(|| format!("unknown platform `{value}`"))
}

fn parse_service_type(value: &str) -> Result<ServiceType, String> {
    ServiceType::parse(value).ok_or_else(|| format!("unknown service type `{value}`"))
}

fn parse_quality(value: &str) -> Result<QualityTier, String> {
    QualityTier::parse(value).ok_or_else(|| format!("unknown quality tier `{value}`"))
}

fn print_result(result: &SyncResult) {
    println!(
        "{}: seen={} new={} updated={} errors={} persisted={} duration={:.2}s",
        result.provider_id,
        result.total_services_seen,
        result.new_services,
        result.updated_services,
        result.error_count,
        result.persisted,
        result.duration_seconds
    );
    for detail in &result.error_details {
        println!("  - {detail}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Sync { provider: None });

    let mut config = SyncConfig::from_env();
    if matches!(command, Commands::Schedule) {
        config.scheduler_enabled = true;
    }
    logging::init_subscriber(&config)?;

    let store = Arc::new(JsonFileStore::new(config.data_dir.clone()));
    let marketplace = Marketplace::open(config, store).await?;

    match command {
        Commands::Sync { provider: Some(id) } => {
            let result = marketplace.trigger_sync(&id).await?;
            print_result(&result);
        }
        Commands::Sync { provider: None } => {
            let results = marketplace.trigger_sync_all().await;
            if results.is_empty() {
                println!("no active providers synced");
            }
            results.iter().for_each(print_result);
        }
        Commands::Schedule => {
            let Some(mut scheduler) = marketplace.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler is disabled");
            };
            scheduler.start().await.context("starting scheduler")?;
            info!(
                interval_minutes = marketplace.config().sync_interval_minutes,
                cron = ?marketplace.config().sync_cron,
                "scheduler running; press Ctrl-C to stop"
            );
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Providers => {
            for p in marketplace.list_providers().await {
                println!(
                    "{} ({}) protocol={} active={} margin={}% last_sync={}",
                    p.id,
                    p.name,
                    p.api_protocol,
                    p.is_active,
                    p.default_margin_percent,
                    p.last_sync_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string())
                );
            }
        }
        Commands::Services {
            provider,
            platform,
            service_type,
            quality,
            active,
        } => {
            let filter = ServiceFilter {
                provider_id: provider,
                platform,
                service_type,
                quality_tier: quality,
                is_active: active,
                ..Default::default()
            };
            for s in marketplace.list_services(Some(&filter)).await {
                println!(
                    "{} {}/{} [{} {} {}] base={} margin={}% resale={} qty={}..{}{}",
                    s.id,
                    s.provider_id,
                    s.provider_native_service_id,
                    s.platform.as_str(),
                    s.service_type.as_str(),
                    s.quality_tier.as_str(),
                    s.base_rate,
                    s.margin_percent,
                    s.resale_rate,
                    s.min_quantity,
                    s.max_quantity,
                    if s.is_active { "" } else { " (inactive)" }
                );
                println!("    {}", s.display_name);
            }
        }
        Commands::History { limit } => {
            for result in marketplace.get_sync_history(limit).await? {
                print!("{} ", result.started_at.to_rfc3339());
                print_result(&result);
            }
        }
        Commands::ApplyRules => {
            let report = marketplace.apply_pricing_rules(None).await?;
            println!(
                "rules applied: evaluated={} repriced={} unmatched={}",
                report.evaluated, report.repriced, report.unmatched
            );
        }
        Commands::SetServiceMargin { id, percent } => {
            let service = marketplace.set_service_margin(id, percent).await?;
            println!("{} resale={}", service.id, service.resale_rate);
        }
        Commands::SetProviderMargin { id, percent } => {
            let repriced = marketplace.set_provider_margin(&id, percent).await?;
            println!("{id}: margin={percent}% repriced={repriced}");
        }
        Commands::Balance { provider } => {
            let balance = marketplace.provider_balance(&provider).await?;
            println!("{provider}: {} {}", balance.balance, balance.currency);
        }
        Commands::Stats => {
            let stats = marketplace.catalog_stats().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
