//! Water meter and valve controller service

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use errors::AquaError;
use tracing::info;

use aquasrv::bootstrap::{self, Args};
use aquasrv::config::ServiceConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = ServiceConfig::load(args.config.as_deref())?;
    args.apply(&mut config)?;

    bootstrap::initialize_logging(&args, &config)?;
    info!(
        "Starting {} v{}",
        config.service.name,
        env!("CARGO_PKG_VERSION")
    );

    // Validation mode: validate and exit
    if args.validate {
        bootstrap::validate_configuration(&config)?;
        return Ok(());
    }

    let token = CancellationToken::new();
    common::shutdown::cancel_on_shutdown(token.clone());
    if let Err(e) = aquasrv::runtime::run(config, token).await {
        errors::report("Service stopped", &e);
        std::process::exit(AquaError::from(e).exit_code());
    }
    Ok(())
}
