use crate::error::Result;
use crate::session::{Engines, Session, SessionConfig};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;

/// Accepts media-stream WebSockets and runs one session per connection
pub struct MediaStreamServer {
    listener: TcpListener,
    path: String,
    engines: Engines,
    session_config: SessionConfig,
    shutdown: CancellationToken,
}

impl MediaStreamServer {
    pub async fn bind(
        addr: &str,
        path: impl Into<String>,
        engines: Engines,
        session_config: SessionConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            path: path.into(),
            engines,
            session_config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Cancelling this token stops accepting and ends every live call
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self) -> Result<()> {
        log::info!(
            "Server: listening on {}{}",
            self.listener.local_addr()?,
            self.path
        );
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::info!("Server: connection from {}", addr);
                        let session = Session::new(
                            self.engines.clone(),
                            self.session_config.clone(),
                            self.shutdown.child_token(),
                        );
                        sessions.spawn(serve_connection(stream, addr, self.path.clone(), session));
                    }
                    Err(e) => log::error!("Server: accept failed: {}", e),
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        log::info!("Server: shutting down, {} live call(s)", sessions.len());
        while sessions.join_next().await.is_some() {}
        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, addr: SocketAddr, path: String, session: Session) {
    let ws = accept_hdr_async(stream, move |req: &Request, resp: Response| {
        if req.uri().path() == path {
            Ok(resp)
        } else {
            log::warn!("Server: rejecting upgrade for {}", req.uri().path());
            let mut error = ErrorResponse::new(Some("Not found".to_string()));
            *error.status_mut() = StatusCode::NOT_FOUND;
            Err(error)
        }
    })
    .await;

    let ws = match ws {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("Server: handshake with {} failed: {}", addr, e);
            return;
        }
    };

    match session.run(ws).await {
        Ok(()) => log::info!("Server: call from {} ended", addr),
        Err(e) => log::error!("Server: call from {} failed: {}", addr, e),
    }
}
