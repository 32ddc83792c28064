use crate::error::ProxyError;
use crate::handler::ProxyHandler;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, error, info};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

pub struct ProxyServer {
    handler: Arc<ProxyHandler>,
    addr: SocketAddr,
}

impl ProxyServer {
    pub fn new(handler: ProxyHandler, addr: SocketAddr) -> Self {
        Self {
            handler: Arc::new(handler),
            addr,
        }
    }

    pub async fn run(self) -> Result<(), ProxyError> {
        info!("Binding HTTP listener to: {}", self.addr);
        let listener = TcpListener::bind(self.addr).await?;
        info!("http server: {}", self.addr);
        serve(listener, self.handler).await
    }
}

/// Accept loop: one task per connection, no admission control.
pub async fn serve(listener: TcpListener, handler: Arc<ProxyHandler>) -> Result<(), ProxyError> {
    loop {
        let (stream, remote_addr) = listener.accept().await?;
        debug!("Connection from {}", remote_addr);

        let handler = handler.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(handler.handle(req).await) }
            });

            if let Err(err) = ServerBuilder::new().keep_alive(true).serve_connection(io, service).await {
                error!("Error serving HTTP connection from {}: {}", remote_addr, err);
            }
        });
    }
}
