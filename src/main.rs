use std::{env, future::Future, net::SocketAddr, sync::Arc};

use attribute_pdp::{
    config::AppConfig,
    error::error_chain,
    init_tracing,
    lifecycle::Lifecycle,
    pdp::{
        engine::{EngineError, PolicyEngine},
        opa::OpaEngine,
        EntitlementPdp,
    },
    routes,
    state::{identity_resolver, AppState},
};
use axum::Router;
use lambda_http::Error;
use tokio::{net::TcpListener, task::JoinHandle};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = AppConfig::from_env()?;
    init_tracing(config.log_json, config.verbose);

    tracing::info!(
        decision_path = %config.engine.decision_path,
        "starting attribute PDP"
    );

    let engine = Arc::new(OpaEngine::new(config.engine.clone())?);
    let resolver = identity_resolver(&config.identity).await?;

    let pdp = EntitlementPdp::new(engine.clone(), config.engine.decision_timeout);
    let state = AppState::new(pdp, resolver);
    let startup = tokio::spawn(start_engine(engine.clone(), state.lifecycle.clone()));

    let app = routes::router(state);
    let result = if env::var("AWS_LAMBDA_RUNTIME_API").is_ok() {
        env::set_var("AWS_LAMBDA_HTTP_IGNORE_STAGE_IN_PATH", "true");
        serve_until_startup_fails(lambda_http::run(app), startup).await
    } else {
        serve_until_startup_fails(serve_http(app, config.bind_addr), startup).await
    };

    engine.shutdown().await;
    tracing::info!("attribute PDP stopped");
    result
}

async fn start_engine(engine: Arc<OpaEngine>, lifecycle: Arc<Lifecycle>) -> Result<(), EngineError> {
    match engine.start().await {
        Ok(()) => {
            lifecycle.mark_ready();
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %error_chain(&e), "policy engine failed to start");
            Err(e)
        }
    }
}

/// Drive `server` to completion, bailing out if the engine cannot start.
async fn serve_until_startup_fails<F>(
    server: F,
    startup: JoinHandle<Result<(), EngineError>>,
) -> Result<(), Error>
where
    F: Future<Output = Result<(), Error>>,
{
    tokio::pin!(server);

    tokio::select! {
        served = &mut server => return served,
        started = startup => started??,
    }

    server.await
}

async fn serve_http(app: Router, addr: SocketAddr) -> Result<(), Error> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
