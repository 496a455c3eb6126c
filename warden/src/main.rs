use authz::{AuthorizerType, load_and_validate};
use clap::Parser;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

mod config;
mod errors;
mod pipeline;
mod server;
mod telemetry;

use config::Config;
use errors::WardenError;

#[derive(Parser)]
#[command(name = "warden", about = "Authorizing, peer-routing API front end")]
enum CliCommand {
    /// Serve requests using the given process configuration.
    Run {
        #[arg(long)]
        config: PathBuf,
    },
    /// Parse and validate an authorization configuration file.
    ValidateAuthz {
        file: PathBuf,
        /// Authorizer type the file must contain. Repeatable.
        #[arg(long = "require")]
        require: Vec<String>,
    },
}

fn run(config_path: &Path) -> Result<(), WardenError> {
    let config = Config::from_file(config_path)?;
    let _telemetry = telemetry::init(config.metrics.as_ref(), config.logging.as_ref())?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(server::run(config))
}

fn validate_authz(file: &Path, require: &[String]) -> Result<String, WardenError> {
    let data = std::fs::read(file)?;
    let required: HashSet<AuthorizerType> =
        require.iter().cloned().map(AuthorizerType::from).collect();
    let config = load_and_validate(&data, &required)?;

    let chain: Vec<String> = config
        .authorizers
        .iter()
        .map(|a| format!("{}/{}", a.r#type, a.name))
        .collect();
    Ok(format!(
        "{}: valid, {} authorizer(s): {}",
        file.display(),
        chain.len(),
        chain.join(", ")
    ))
}

fn main() -> ExitCode {
    let cli = CliCommand::parse();

    let result = match &cli {
        CliCommand::Run { config } => run(config),
        CliCommand::ValidateAuthz { file, require } => {
            validate_authz(file, require).map(|summary| println!("{summary}"))
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}
