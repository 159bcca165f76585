//! The RPC server.
//!
//! Serves the façade over TCP or a Unix socket, per the `network`
//! configuration. Framing is one JSON document per line in each
//! direction; every request line gets exactly one response line.
//! One task is spawned per connection.

use crate::{config, service::Service};
use manifold_api::{proto, types::Error, Result};
use std::{path::PathBuf, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, UnixListener},
    task::JoinHandle,
};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn};
use tracing_futures::Instrument;

/// Where the listener ended up; tests bind to an ephemeral TCP port
/// and need to learn which.
pub enum BoundAddr {
    Tcp(std::net::SocketAddr),
    Unix(PathBuf),
}

/// Resolves the configured Unix address to a socket path. A bare
/// name lands in the well-known run directory; anything with a
/// slash is taken as given.
pub fn socket_path(address: &str) -> PathBuf {
    if address.contains('/') {
        PathBuf::from(address)
    } else {
        PathBuf::from(proto::RUN_DIR).join(format!("{}.sock", address))
    }
}

/// Binds the configured listener and starts the accept loop. The
/// returned task runs until the token fires.
pub async fn start(
    service: Arc<Service>,
    network: &config::Network,
    token: CancellationToken,
) -> Result<(JoinHandle<()>, BoundAddr)> {
    match network.kind {
        config::NetworkKind::Tcp => {
            let listener = TcpListener::bind(&network.address)
                .await
                .map_err(|e| {
                    Error::Config(format!(
                        "couldn't bind '{}': {}",
                        &network.address, e
                    ))
                })?;
            let addr = listener.local_addr().map_err(|e| {
                Error::Config(format!("couldn't resolve address: {}", e))
            })?;

            info!("serving on tcp {}", addr);

            let task = tokio::spawn(
                accept_tcp(listener, service, token)
                    .instrument(info_span!("server")),
            );

            Ok((task, BoundAddr::Tcp(addr)))
        }

        config::NetworkKind::Unix => {
            let path = socket_path(&network.address);

            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await.map_err(|e| {
                    Error::Config(format!(
                        "couldn't create '{}': {}",
                        dir.display(),
                        e
                    ))
                })?;
            }

            // A socket file left over from a previous run would
            // make the bind fail.

            let _ = tokio::fs::remove_file(&path).await;

            let listener = UnixListener::bind(&path).map_err(|e| {
                Error::Config(format!(
                    "couldn't bind '{}': {}",
                    path.display(),
                    e
                ))
            })?;

            info!("serving on unix socket {}", path.display());

            let task = tokio::spawn(
                accept_unix(listener, service, token, path.clone())
                    .instrument(info_span!("server")),
            );

            Ok((task, BoundAddr::Unix(path)))
        }
    }
}

async fn accept_tcp(
    listener: TcpListener,
    service: Arc<Service>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("server stopping");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let service = service.clone();
                    let token = token.child_token();

                    tokio::spawn(
                        handle_conn(stream, service, token)
                            .instrument(info_span!(
                                "conn",
                                peer = peer.to_string()
                            )),
                    );
                }
                Err(e) => warn!("accept failed -- {}", e),
            }
        }
    }
}

async fn accept_unix(
    listener: UnixListener,
    service: Arc<Service>,
    token: CancellationToken,
    path: PathBuf,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("server stopping");

                // Leave no stale socket file behind.

                let _ = tokio::fs::remove_file(&path).await;
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let service = service.clone();
                    let token = token.child_token();

                    tokio::spawn(
                        handle_conn(stream, service, token)
                            .instrument(info_span!("conn")),
                    );
                }
                Err(e) => warn!("accept failed -- {}", e),
            }
        }
    }
}

async fn handle_conn<S>(
    stream: S,
    service: Arc<Service>,
    token: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            _ = token.cancelled() => return,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                // The peer hung up, or the stream broke; either
                // way this connection is done.
                Ok(None) | Err(_) => return,
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<proto::Request>(
            &line,
        ) {
            Ok(request) => respond(request, &service).await,
            Err(e) => proto::Response::error(Error::InvArgument(
                format!("unparseable request: {}", e),
            )),
        };

        let Ok(mut encoded) = serde_json::to_vec(&response) else {
            warn!("couldn't encode response");
            continue;
        };

        encoded.push(b'\n');

        if writer.write_all(&encoded).await.is_err() {
            return;
        }
    }
}

// Maps one request onto the façade. Streamed results are collected
// into the response's array.

async fn respond(
    request: proto::Request,
    service: &Arc<Service>,
) -> proto::Response {
    match request {
        proto::Request::Metainfo { filter } => {
            let filters: Result<Vec<(String, String)>> = filter
                .iter()
                .map(|f| {
                    f.split_once('=')
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .ok_or_else(|| {
                            Error::InvArgument(format!(
                                "filter '{}' is not key=value",
                                f
                            ))
                        })
                })
                .collect();

            match filters {
                Ok(filters) => {
                    let devices: Vec<_> =
                        service.metainfo(&filters).collect().await;

                    proto::Response::Devices { devices }
                }
                Err(e) => proto::Response::error(e),
            }
        }

        proto::Request::Read { device } => {
            match service.read(&device) {
                Ok(stream) => {
                    let readings: Vec<_> = stream.collect().await;

                    proto::Response::Readings { readings }
                }
                Err(e) => proto::Response::error(e),
            }
        }

        proto::Request::ReadWindow { device } => {
            match service.read_window(&device) {
                Ok(entries) => proto::Response::Window { entries },
                Err(e) => proto::Response::error(e),
            }
        }

        proto::Request::WriteAsync { device, payload } => {
            let payload =
                payload.into_iter().map(Into::into).collect();

            match service.write_async(&device, payload) {
                Ok(transactions) => {
                    proto::Response::Writes { transactions }
                }
                Err(e) => proto::Response::error(e),
            }
        }

        proto::Request::WriteSync { device, payload } => {
            let payload =
                payload.into_iter().map(Into::into).collect();

            match service.write_sync(&device, payload).await {
                Ok(transactions) => {
                    proto::Response::Transactions { transactions }
                }
                Err(e) => proto::Response::error(e),
            }
        }

        proto::Request::Transaction { id } => {
            match service.transaction(&id) {
                Ok(transaction) => proto::Response::Transactions {
                    transactions: vec![transaction],
                },
                Err(e) => proto::Response::error(e),
            }
        }

        proto::Request::Health => proto::Response::Health {
            status: service.health(),
        },
    }
}
