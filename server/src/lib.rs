pub mod config;
pub mod error;
pub mod handler;
pub mod storage;
pub mod store;
pub mod util;
pub mod workflow;

pub use crate::config::Config;

use {
    crate::{
        handler::{Context, handle_request},
        store::ImageStore,
        workflow::ImageService,
    },
    anyhow::{Context as _, Result},
    hyper::{header::HeaderValue, server::conn::http1, service::service_fn},
    hyper_util::{rt::TokioIo, server::graceful::GracefulShutdown},
    std::{future::Future, pin::pin, sync::Arc},
    tokio::{net::TcpListener, signal::ctrl_c, time::sleep},
    tracing::{error, info, warn},
};

/// Resolves with the name of the first termination signal received.
async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate =
            signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
        tokio::select! {
            result = ctrl_c() => result.context("failed to listen for SIGINT").map(|()| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c().await.context("failed to listen for Ctrl-C")?;
        Ok("SIGINT")
    }
}

/// Binds `config.bind_addr` and serves until SIGINT or SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    let shutdown = async {
        match shutdown_signal().await {
            Ok(signal) => info!(%signal, "received shutdown signal"),
            Err(err) => {
                error!(?err, "failed to wait for shutdown signal");
                std::future::pending::<()>().await;
            }
        }
    };
    serve(listener, config, shutdown).await
}

/// Serves requests on `listener` until `shutdown` resolves, then waits up to
/// `config.shutdown_timeout` for open connections and flushes the store.
pub async fn serve(
    listener: TcpListener,
    config: Config,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let store = Arc::new(ImageStore::open(&config.storage_path)?);
    let ctx = Context {
        service: ImageService::new(Arc::<ImageStore>::clone(&store), config.storage_timeout),
        max_upload_size: config.max_upload_size.as_u64(),
        allowed_origin: config
            .allowed_origin
            .as_deref()
            .map(HeaderValue::from_str)
            .transpose()
            .context("invalid allowed_origin")?,
    };

    info!(addr = %listener.local_addr()?, "listening");
    let graceful = GracefulShutdown::new();
    let mut shutdown = pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(?err, "failed to accept");
                        continue;
                    }
                };
                let ctx = ctx.clone();
                let connection = http1::Builder::new()
                    .keep_alive(true)
                    .serve_connection(
                        TokioIo::new(stream),
                        service_fn(move |req| handle_request(ctx.clone(), req)),
                    );
                let connection = graceful.watch(connection);
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        warn!(?err, %peer, "error while serving HTTP connection");
                    }
                });
            }
            () = &mut shutdown => break,
        }
    }

    drop(listener);
    tokio::select! {
        () = graceful.shutdown() => info!("all connections closed"),
        () = sleep(config.shutdown_timeout) => {
            warn!("timed out waiting for connections to close");
        }
    }
    store.flush()?;
    info!("server stopped");
    Ok(())
}
