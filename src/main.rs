//! toolfleet - main entry point.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use toolfleet::{
    api,
    catalog::IntegrationCatalog,
    cli::{Cli, Command},
    config::Config,
    orchestrator::{CustomerSwitchCoordinator, DockerRuntime, SwitchReport, build_coordinator},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load .env if present
    let _ = dotenvy::dotenv();

    init_tracing(cli.json);

    let mut config = Config::from_env()?;
    if let Some(path) = &cli.catalog {
        config.catalog_path = path.clone();
    }
    let catalog = Arc::new(IntegrationCatalog::load(&config.catalog_path)?);
    tracing::debug!(
        catalog = %config.catalog_path.display(),
        customers = catalog.len(),
        "Loaded customer catalog"
    );

    let command = cli.command_or_default();
    if command == Command::Customers {
        print_customers(&catalog, cli.json)?;
        return Ok(());
    }

    let mut runtime = DockerRuntime::connect().await?;
    if !config.orchestrator.auto_pull {
        runtime = runtime.without_auto_pull();
    }
    let runtime = Arc::new(runtime);
    let coordinator = Arc::new(build_coordinator(
        catalog,
        Arc::new(config.orchestrator.clone()),
        runtime,
    ));

    match command {
        Command::Serve => serve(coordinator, &config).await,
        Command::Switch { customer, keep } => {
            let report = coordinator.switch_to(&customer).await?;
            print_report(&report, cli.json)?;
            if !keep {
                coordinator.shutdown().await?;
            }
            Ok(())
        }
        Command::CleanupOrphans => {
            let removed = coordinator.cleanup_orphans().await?;
            println!("Removed {} orphaned container(s)", removed);
            Ok(())
        }
        Command::Customers => Ok(()),
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("toolfleet=info,tower_http=info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

async fn serve(coordinator: Arc<CustomerSwitchCoordinator>, config: &Config) -> anyhow::Result<()> {
    match coordinator.cleanup_orphans().await {
        Ok(0) => {}
        Ok(n) => tracing::info!(removed = n, "Removed containers left over from a previous run"),
        Err(e) => tracing::warn!("Orphan cleanup failed: {}", e),
    }

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", config.bind_addr, e))?;

    api::serve(listener, Arc::clone(&coordinator), async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
    })
    .await?;

    coordinator.shutdown().await?;
    tracing::info!("All integrations stopped");
    Ok(())
}

fn print_customers(catalog: &IntegrationCatalog, json: bool) -> anyhow::Result<()> {
    let customers: Vec<_> = catalog
        .customer_names()
        .iter()
        .filter_map(|name| catalog.customer(name))
        .collect();

    if json {
        let entries: Vec<_> = customers
            .iter()
            .map(|c| {
                serde_json::json!({
                    "name": c.name,
                    "description": c.description,
                    "host": c.host,
                    "integrations": c.required_integrations(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for customer in customers {
        let integrations: Vec<_> = customer
            .required_integrations()
            .iter()
            .map(|ty| ty.as_str())
            .collect();
        println!("{:<24} {}", customer.name, integrations.join(", "));
    }
    Ok(())
}

fn print_report(report: &SwitchReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("{}: {}", report.customer, report.summary());
    if let Some(evicted) = &report.evicted {
        println!("  evicted {}", evicted);
    }
    for (ty, outcome) in &report.integrations {
        match (&outcome.endpoint_url, &outcome.error) {
            (Some(url), _) => println!("  {:<10} {:<9} {}", ty.as_str(), outcome.state, url),
            (None, Some(error)) => println!("  {:<10} {:<9} {}", ty.as_str(), outcome.state, error),
            (None, None) => println!("  {:<10} {}", ty.as_str(), outcome.state),
        }
    }
    Ok(())
}
