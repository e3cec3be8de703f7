//! strata-admin - schema and partition management for the event log.
//!
//! Every subcommand is safe to re-run.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use strata_core::{ModuleName, PartitionKey, TenantName};
use strata_infra::config::StoreConfig;
use strata_infra::db;
use strata_infra::partitions::{
    EnsuredPartition, PartitionManager, PostgresPartitionManager, spawn_maintenance,
};

#[derive(Parser)]
#[command(name = "strata-admin", version, about = "Event log schema and partition management")]
struct Cli {
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the event log schema (idempotent)
    Migrate,
    /// Create a module's shared partition
    AddModule { module: ModuleName },
    /// Create the partition for one module/tenant pair
    AddTenant {
        module: ModuleName,
        tenant: TenantName,
    },
    /// Create a module's partition for every known tenant
    AddModuleForAllTenants { module: ModuleName },
    /// Create a tenant's partition in every known module
    AddTenantForAllModules { tenant: TenantName },
    /// Re-ensure age buckets and archive old events once
    RefreshTimePartitions,
    /// List registered partitions
    ListPartitions,
    /// Run time-partition maintenance until interrupted
    Maintain,
}

#[tokio::main]
async fn main() -> Result<()> {
    strata_observability::init();
    let cli = Cli::parse();

    let config = StoreConfig::from_env().context("invalid configuration")?;
    let pool = db::postgres::connect(&config)
        .await
        .context("failed to connect to the database")?;
    let manager =
        PostgresPartitionManager::new(pool.clone()).with_archive_after(config.archive_after());

    match cli.command {
        Commands::Migrate => {
            db::postgres::migrate(&pool).await?;
            if cli.json {
                println!("{}", serde_json::json!({ "schema": "ready" }));
            } else {
                println!("schema ready");
            }
        }

        Commands::AddModule { module } => {
            let outcome = manager.ensure_module(&module).await?;
            let ensured = EnsuredPartition {
                key: PartitionKey::new(module, TenantName::global()),
                outcome,
            };
            println!("{}", render_ensured(std::slice::from_ref(&ensured), cli.json)?);
        }

        Commands::AddTenant { module, tenant } => {
            let outcome = manager.ensure_tenant(&module, &tenant).await?;
            let ensured = EnsuredPartition {
                key: PartitionKey::new(module, tenant),
                outcome,
            };
            println!("{}", render_ensured(std::slice::from_ref(&ensured), cli.json)?);
        }

        Commands::AddModuleForAllTenants { module } => {
            let ensured = manager.ensure_module_for_all_tenants(&module).await?;
            println!("{}", render_ensured(&ensured, cli.json)?);
        }

        Commands::AddTenantForAllModules { tenant } => {
            let ensured = manager.ensure_tenant_for_all_modules(&tenant).await?;
            println!("{}", render_ensured(&ensured, cli.json)?);
        }

        Commands::RefreshTimePartitions => {
            let report = manager.ensure_time_partitions().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "checked {} partitions, archived {} events older than {}",
                    report.partitions_checked, report.events_archived, report.cutoff
                );
            }
        }

        Commands::ListPartitions => {
            let partitions = manager.list_partitions().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&partitions)?);
            } else {
                for partition in partitions {
                    println!("{}\t{}", partition.key, partition.created_at);
                }
            }
        }

        Commands::Maintain => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handle = spawn_maintenance(
                Arc::new(manager),
                config.maintenance_interval(),
                shutdown_rx,
            );

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
            handle.await.context("maintenance task panicked")?;
        }
    }

    Ok(())
}

fn render_ensured(ensured: &[EnsuredPartition], json: bool) -> Result<String> {
    if json {
        return Ok(serde_json::to_string_pretty(ensured)?);
    }
    Ok(ensured
        .iter()
        .map(|partition| format!("{}: {:?}", partition.key, partition.outcome))
        .collect::<Vec<_>>()
        .join("\n"))
}
