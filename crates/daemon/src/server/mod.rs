//! The request/reply server.
//!
//! A single-threaded request loop over TCP: connections are served one at a
//! time, and requests within a connection strictly in order, matching the
//! request/reply socket the clients speak. CHANGE does the minimum
//! (validate, enqueue, ack) while LIST_CONFLICTS and RESOLVE run
//! synchronously against the store.
//!
//! Every error is caught at the request boundary and converted to a wire
//! error code; nothing a client sends can take the server down.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use common::protocol::codec::{read_frame, write_frame};
use common::protocol::{
    decode_request, encode_error, encode_response, ErrorCode, ProtocolError, Request, Response,
};

use crate::database::{StoreError, WorkItem};
use crate::state::State;

/// Bound on how long one request may hold the loop.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Server {
    listener: TcpListener,
    state: State,
}

impl Server {
    /// Bind the listening socket.
    pub async fn bind(state: State, addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("server listening on {}", listener.local_addr()?);
        Ok(Self { listener, state })
    }

    /// The bound address. Useful when binding to port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve connections until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            // A connection handler may have observed the flag already.
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!("connection from {peer}");
                            if let Err(e) = serve_connection(&self.state, stream, &mut shutdown).await {
                                tracing::debug!("connection from {peer} ended: {e}");
                            }
                        }
                        Err(e) => {
                            tracing::warn!("accept failed: {e}");
                        }
                    }
                }
            }
        }
        tracing::info!("server stopped");
    }
}

/// Serve one connection: a strict read-request/write-reply loop.
async fn serve_connection(
    state: &State,
    mut stream: TcpStream,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), ProtocolError> {
    loop {
        let tag_frame = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
                continue;
            }
            frame = read_frame(&mut stream) => frame?,
        };
        let Some(tag_frame) = tag_frame else {
            return Ok(()); // clean EOF between requests
        };
        let body = read_frame(&mut stream)
            .await?
            .ok_or(ProtocolError::ConnectionClosed)?;

        let (status, reply) = match handle_request(state, &tag_frame, &body).await {
            Ok(response) => encode_response(&response).unwrap_or_else(|e| {
                tracing::error!("encoding reply failed: {e}");
                encode_error(ErrorCode::Unknown)
            }),
            Err(code) => encode_error(code),
        };
        write_frame(&mut stream, &status).await?;
        write_frame(&mut stream, &reply).await?;
    }
}

async fn handle_request(
    state: &State,
    tag_frame: &[u8],
    body: &[u8],
) -> Result<Response, ErrorCode> {
    let request = decode_request(tag_frame, body).map_err(|e| {
        tracing::debug!("rejecting request: {e}");
        e.code()
    })?;

    match tokio::time::timeout(REQUEST_TIMEOUT, dispatch(state, request)).await {
        Ok(result) => result,
        Err(_) => Err(ErrorCode::Timeout),
    }
}

async fn dispatch(state: &State, request: Request) -> Result<Response, ErrorCode> {
    match request {
        Request::ListConflicts => {
            let records = state.database().list_conflicts().await.map_err(|e| {
                tracing::error!("listing conflicts failed: {e}");
                ErrorCode::Unknown
            })?;
            Ok(Response::Conflicts(
                records.into_iter().map(Into::into).collect(),
            ))
        }

        Request::Change(notification) => {
            if !state
                .registry()
                .contains(&notification.entity, &notification.source)
            {
                tracing::debug!("change for unconfigured pair {notification}");
                return Err(ErrorCode::Unknown);
            }
            state
                .database()
                .enqueue(&WorkItem::Process(notification))
                .await
                .map_err(|e| {
                    tracing::error!("enqueueing change failed: {e}");
                    ErrorCode::Unknown
                })?;
            state.wake_workers();
            Ok(Response::Ack)
        }

        Request::Resolve { diff_id, op_ids } => {
            // One transaction: the conflict is never closed without the
            // apply work being queued.
            state
                .database()
                .resolve_and_enqueue_apply(diff_id, &op_ids)
                .await
                .map_err(|e| {
                    match e {
                        StoreError::AlreadyResolved(_)
                        | StoreError::UnknownDiff(_)
                        | StoreError::ForeignOp { .. } => {
                            tracing::debug!("resolve refused: {e}");
                        }
                        _ => tracing::error!("resolve failed: {e}"),
                    }
                    ErrorCode::Unknown
                })?;
            state.wake_workers();
            Ok(Response::Ack)
        }
    }
}
