use anyhow::Context;
use clap::Parser;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::{path::Path, process::ExitCode, sync::Arc};

use relayctl::config::{Args, Command, RouteCommand};
use relayctl::gateway::{compile_route, GatewayClient, HttpGatewayClient, ProvisioningReport, RouteReconciler};
use relayctl::models::{Provider, ProviderType};
use relayctl::types::{ProviderId, QueueId};
use relayctl::{telemetry, Config};

/// Providers file passed to the `route` commands.
///
/// ```yaml
/// providers:
///   - provider_name: primary
///     provider_type: openai
///     api_key: sk-...
///     limit: 60
///     time_window: 60
///     config:
///       model: gpt-4o
/// ```
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProvidersFile {
    #[serde(default)]
    providers: Vec<ProviderEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProviderEntry {
    #[serde(default = "ProviderId::new")]
    provider_id: ProviderId,
    #[serde(default)]
    provider_name: String,
    #[serde(default)]
    provider_type: ProviderType,
    api_key: String,
    limit: u32,
    time_window: u32,
    #[serde(default)]
    config: Map<String, Value>,
}

impl ProviderEntry {
    fn into_provider(self, queue_id: QueueId) -> Provider {
        Provider {
            provider_id: self.provider_id,
            queue_id,
            provider_name: self.provider_name,
            provider_type: self.provider_type,
            api_key: self.api_key,
            limit: self.limit,
            time_window: self.time_window,
            config: self.config,
        }
    }
}

fn load_providers(path: &Path, queue_id: QueueId) -> anyhow::Result<Vec<Provider>> {
    let file: ProvidersFile = Figment::new()
        .merge(Yaml::file_exact(path))
        .extract()
        .with_context(|| format!("Failed to read providers from {}", path.display()))?;

    let providers: Vec<Provider> = file
        .providers
        .into_iter()
        .map(|entry| entry.into_provider(queue_id))
        .collect();
    for provider in &providers {
        provider.validate()?;
    }
    Ok(providers)
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(config: Config, command: Command) -> anyhow::Result<ExitCode> {
    let client: Arc<dyn GatewayClient> = Arc::new(HttpGatewayClient::new(&config.gateway));

    let (queue_id, result) = match command {
        Command::Health => {
            if client.probe().await {
                println!("Gateway control API at {} is ready.", config.gateway.admin_url);
                return Ok(ExitCode::SUCCESS);
            }
            println!("Gateway control API at {} is not ready.", config.gateway.admin_url);
            return Ok(ExitCode::FAILURE);
        }
        Command::Route {
            action: RouteCommand::Compile { queue_id, providers },
        } => {
            let providers = load_providers(&providers, queue_id)?;
            print_json(&compile_route(&queue_id, &providers)?)?;
            return Ok(ExitCode::SUCCESS);
        }
        Command::Route {
            action: RouteCommand::Create { queue_id, providers },
        } => {
            let providers = load_providers(&providers, queue_id)?;
            let reconciler = RouteReconciler::new(client, &config.reconcile);
            (queue_id, reconciler.create(&queue_id, &providers).await)
        }
        Command::Route {
            action: RouteCommand::Update { queue_id, providers },
        } => {
            let providers = load_providers(&providers, queue_id)?;
            let reconciler = RouteReconciler::new(client, &config.reconcile);
            (queue_id, reconciler.update(&queue_id, &providers).await)
        }
        Command::Route {
            action: RouteCommand::Delete { queue_id },
        } => {
            let reconciler = RouteReconciler::new(client, &config.reconcile);
            (queue_id, reconciler.delete(&queue_id).await)
        }
    };

    let report = ProvisioningReport::from_result(&queue_id, &result);
    print_json(&report)?;
    Ok(if report.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let config = Config::load(&args)?;

    if args.validate {
        println!("Configuration is valid.");
        return Ok(ExitCode::SUCCESS);
    }

    telemetry::init_telemetry(config.enable_otel_export)?;

    tracing::debug!("{:?}", args);

    let Some(command) = args.command else {
        println!("Configuration is valid. Pass a command to act on the gateway; see --help.");
        return Ok(ExitCode::SUCCESS);
    };

    let exit = run(config, command).await;
    telemetry::shutdown_telemetry();
    exit
}
