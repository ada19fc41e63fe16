//! Keycloak operator entry point

use anyhow::Result;
use clap::{Parser, Subcommand};
use keycloak_operator::{ConfigArgs, KeycloakOperator, LogFormat, OperatorConfig, OperatorManager};
use kube::CustomResourceExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "keycloak-operator", version, about = "Deploys and manages Keycloak on OpenShift")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the operator (default)
    Run,
    /// Print the CustomResourceDefinition as YAML
    Crd,
    /// Validate the configuration and print the resolved values
    CheckConfig,
}

fn init_tracing(config: &OperatorConfig) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let config = OperatorConfig::load(&cli.config)?;
            init_tracing(&config);
            OperatorManager::new(config).await?.run().await
        }
        Command::Crd => {
            print!("{}", serde_yaml::to_string(&KeycloakOperator::crd())?);
            Ok(())
        }
        Command::CheckConfig => {
            let config = OperatorConfig::load(&cli.config)?;
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}
