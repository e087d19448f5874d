//! Minimal HTTP/1 admin listener. Deliberately does not reach for the
//! teacher's HTTP/1-vs-2 auto-detection machinery: the admin surface is an
//! internal, fixed-protocol control plane, not a public-facing gateway.

use std::sync::Arc;

use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, warn};

use super::handlers::route;
use super::state::AdminState;

pub async fn serve(state: Arc<AdminState>, addr: std::net::SocketAddr, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "admin http listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "admin accept failed");
                        continue;
                    }
                };
                let state = state.clone();
                let io = TokioIo::new(stream);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, std::convert::Infallible>(route(state, req).await) }
                    });
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        error!(%peer, error = %e, "admin connection error");
                    }
                });
            }
        }
    }

    Ok(())
}
