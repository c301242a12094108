//! HTTP/1 server exposing the admission service.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::routes::handle_request;
use crate::error::Result;
use crate::service::AdmissionService;

/// HTTP server for the admission service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    service: Arc<AdmissionService>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, service: Arc<AdmissionService>) -> Self {
        Self { addr, service }
    }

    /// Bind and serve until the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting HTTP server for admission control");
        serve_listener(listener, self.service, signal).await
    }
}

/// Accept connections on an already bound listener until `signal` resolves.
///
/// Connections already accepted keep running on their own tasks.
pub async fn serve_listener<F>(
    listener: TcpListener,
    service: Arc<AdmissionService>,
    signal: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    tokio::pin!(signal);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = result?;
                debug!(peer = %peer, "Accepted connection");
                let io = TokioIo::new(stream);
                let service = Arc::clone(&service);

                tokio::spawn(async move {
                    let handler = service_fn(move |req| {
                        let service = Arc::clone(&service);
                        async move { Ok::<_, Infallible>(handle_request(req, &service).await) }
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, handler).await {
                        error!(error = %e, "HTTP connection error");
                    }
                });
            }
            _ = &mut signal => {
                info!("HTTP server shutting down");
                break;
            }
        }
    }

    Ok(())
}
