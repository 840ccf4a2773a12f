use anyhow::Error;
use clap::Parser;
use std::env;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, instrument, Instrument};

use ripq::config::ConfigContext;
use ripq::{server, telemetry};

/// Run the server until it stops. A server error cancels `cancel_token` and
/// is returned so the process exits with a failure status.
#[instrument(skip_all)]
async fn setup(cancel_token: CancellationToken, config: ConfigContext) -> Result<(), Error> {
    let server_spawn = {
        let cancel_token = cancel_token.clone();
        tokio::spawn(
            async move {
                let result = server::serve(cancel_token.clone(), config).await;
                if let Err(err) = &result {
                    error!("Error running server: {:#}", err);
                    cancel_token.cancel();
                }
                result
            }
            .instrument(info_span!("server")),
        )
    };

    server_spawn.await??;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigContext::parse();

    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "ripq=debug");
    }

    telemetry::init(config.jaeger_endpoint.as_deref())?;
    info!(base_dir = ?config.base_dir, "Starting ripq");

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(cloned_token, config));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => { info!("Received SIGTERM"); token.cancel() },
            _ = sigint.recv() => { info!("Received SIGINT"); token.cancel() },
            _ = token.cancelled() => {},
        }
    });

    let result = app.await?;
    info!("Shutting down.");
    telemetry::shutdown();

    result?;
    Ok(())
}
