use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{fmt, EnvFilter};

use warden::authz::loader;
use warden::settings::Settings;

#[derive(Parser, Debug)]
#[command(
    name = "warden",
    version,
    about = "Role hierarchy and attribute based authorization service"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API (default)
    Serve,
    /// Parse and validate a policy directory, then exit
    Validate {
        /// Directory to check; defaults to `policies.dir` from the config
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => warden::web::serve(settings).await?,
        Command::Validate { dir } => {
            let dir = dir.unwrap_or_else(|| settings.policies.dir.clone());
            let bundle = loader::load_policies_with_timeout(
                dir.clone(),
                settings.tenancy.default_tenant.clone(),
                settings.policies.load_timeout(),
            )
            .await?;
            println!(
                "{}: {} rules, {} tenant hierarchies{}",
                dir.display(),
                bundle.rules.len(),
                bundle.hierarchies.len(),
                if bundle.default_hierarchy.is_some() {
                    ", default hierarchy replaced"
                } else {
                    ""
                }
            );
        }
    }
    Ok(())
}
