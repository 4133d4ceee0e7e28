//! Per-package HTTP proxy server.
//!
//! Each blocked package gets its own [`AppProxyServer`]:
//! - Binds `127.0.0.1:0` once and keeps that listener until [`stop`]
//! - Runs every connection on a bounded pool of handler tasks
//! - Refuses blocked requests with `403 Forbidden`
//! - Forwards allowed requests and streams the response back
//!
//! # Worker pool
//!
//! The accept loop takes a semaphore permit *before* accepting. When every
//! permit is in use, further clients wait in the kernel's listen backlog
//! until a handler finishes, so the number of live handlers never exceeds
//! the configured capacity.
//!
//! [`stop`]: AppProxyServer::stop

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::error::{ProxyError, ProxyResult};
use super::filters::{PassThroughResponse, ResponseFilter};
use super::policy::{Decision, PolicyEngine};
use super::request::HttpRequest;
use crate::config::ProxySettings;
use crate::telemetry::{self, AuditEvent};

const FORBIDDEN: &[u8] = b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const INTERNAL_ERROR: &[u8] =
    b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

const READ_CHUNK: usize = 8 * 1024;

/// Everything a connection handler needs.
struct HandlerContext {
    package: String,
    policy: Arc<PolicyEngine>,
    response_filter: Arc<dyn ResponseFilter>,
    max_request_bytes: usize,
    client_timeout: Duration,
    connect_timeout: Duration,
    own_port: u16,
}

/// A running per-package proxy.
pub struct AppProxyServer {
    package: String,
    port: u16,
    policy: Arc<PolicyEngine>,
    permits: Arc<Semaphore>,
    capacity: usize,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl AppProxyServer {
    /// Bind a loopback listener and start serving `package`.
    pub async fn start(
        package: &str,
        policy: Arc<PolicyEngine>,
        settings: &ProxySettings,
    ) -> ProxyResult<Self> {
        Self::start_with_filter(package, policy, settings, Arc::new(PassThroughResponse)).await
    }

    /// Like [`start`](Self::start) with a custom response filter.
    pub async fn start_with_filter(
        package: &str,
        policy: Arc<PolicyEngine>,
        settings: &ProxySettings,
        response_filter: Arc<dyn ResponseFilter>,
    ) -> ProxyResult<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let listener = TcpListener::bind(addr).await.map_err(|e| ProxyError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        let port = listener
            .local_addr()
            .map_err(|e| ProxyError::Bind {
                addr: addr.to_string(),
                source: e,
            })?
            .port();

        let capacity = settings.worker_capacity();
        let permits = Arc::new(Semaphore::new(capacity));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = Arc::new(HandlerContext {
            package: package.to_string(),
            policy: policy.clone(),
            response_filter,
            max_request_bytes: settings.max_request_bytes(),
            client_timeout: settings.client_timeout(),
            connect_timeout: settings.connect_timeout(),
            own_port: port,
        });

        let task = tokio::spawn(accept_loop(listener, ctx, permits.clone(), shutdown_rx));
        info!("Proxy for {} listening on 127.0.0.1:{}", package, port);

        Ok(Self {
            package: package.to_string(),
            port,
            policy,
            permits,
            capacity,
            shutdown_tx,
            task: Some(task),
        })
    }

    /// Bound loopback port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Package this proxy serves.
    pub fn package(&self) -> &str {
        &self.package
    }

    /// The package's policy engine.
    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    /// Maximum concurrent handlers.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Handlers currently running.
    pub fn active_connections(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Whether the accept loop is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Close the listener and shut the handler pool down.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
            && !e.is_cancelled()
        {
            warn!("Proxy task for {} ended abnormally: {}", self.package, e);
        }
        info!("Proxy for {} on port {} stopped", self.package, self.port);
    }
}

impl Drop for AppProxyServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<HandlerContext>,
    permits: Arc<Semaphore>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut handlers = JoinSet::new();

    loop {
        let permit = tokio::select! {
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown_rx.changed() => break,
        };

        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Proxy {} accepted {}", ctx.package, peer);
                    let ctx = ctx.clone();
                    handlers.spawn(async move {
                        let _permit = permit;
                        if let Err(e) = handle_connection(stream, &ctx).await {
                            debug!("Proxy {} connection ended: {}", ctx.package, e);
                        }
                    });
                }
                Err(e) => warn!("Proxy {} failed to accept: {}", ctx.package, e),
            },
            _ = shutdown_rx.changed() => break,
        }

        while handlers.try_join_next().is_some() {}
    }

    handlers.shutdown().await;
    debug!("Proxy {} accept loop exited", ctx.package);
}

async fn handle_connection(mut client: TcpStream, ctx: &HandlerContext) -> ProxyResult<()> {
    let request = timeout(
        ctx.client_timeout,
        read_request(&mut client, ctx.max_request_bytes),
    )
    .await
    .map_err(|_| ProxyError::Timeout)??;

    match ctx.policy.evaluate(&request) {
        Decision::Block(reason) => {
            debug!(
                "Proxy {} blocked {} ({:?})",
                ctx.package,
                request.host(),
                reason
            );
            telemetry::record(AuditEvent::RequestBlocked {
                package: ctx.package.clone(),
                host: request.host().to_string(),
                reason,
            });
            client.write_all(FORBIDDEN).await?;
            let _ = client.shutdown().await;
            Ok(())
        }
        Decision::Allow => forward(client, request, ctx).await,
    }
}

/// Read until a complete request is buffered.
async fn read_request(client: &mut TcpStream, limit: usize) -> ProxyResult<HttpRequest> {
    let mut buf = Vec::with_capacity(READ_CHUNK.min(limit));
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        if buf.len() >= limit {
            return Err(ProxyError::RequestTooLarge { limit });
        }
        let want = (limit - buf.len()).min(READ_CHUNK);
        let n = client.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(ProxyError::MalformedRequest(
                "client closed before sending a complete request".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(request) = HttpRequest::parse(&buf)? {
            return Ok(request);
        }
    }
}

fn is_loopback_host(host: &str) -> bool {
    host == "localhost"
        || host
            .parse::<std::net::IpAddr>()
            .is_ok_and(|ip| ip.is_loopback())
}

async fn forward(
    mut client: TcpStream,
    request: HttpRequest,
    ctx: &HandlerContext,
) -> ProxyResult<()> {
    let target = format!("{}:{}", request.host(), request.port());

    if request.port() == ctx.own_port && is_loopback_host(request.host()) {
        warn!("Proxy {} refused request to itself", ctx.package);
        let _ = client.write_all(INTERNAL_ERROR).await;
        return Err(ProxyError::UpstreamConnect {
            addr: target,
            message: "request targets the proxy itself".to_string(),
        });
    }

    let mut upstream = match timeout(
        ctx.connect_timeout,
        TcpStream::connect((request.host(), request.port())),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let _ = client.write_all(INTERNAL_ERROR).await;
            return Err(ProxyError::UpstreamConnect {
                addr: target,
                message: e.to_string(),
            });
        }
        Err(_) => {
            let _ = client.write_all(INTERNAL_ERROR).await;
            return Err(ProxyError::UpstreamConnect {
                addr: target,
                message: "connect timed out".to_string(),
            });
        }
    };

    telemetry::record(AuditEvent::RequestForwarded {
        package: ctx.package.clone(),
        host: request.host().to_string(),
    });

    if request.is_connect() {
        client.write_all(TUNNEL_ESTABLISHED).await?;
        let (up, down) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
        debug!(
            "Tunnel {} -> {} closed ({} bytes up, {} bytes down)",
            ctx.package, target, up, down
        );
        return Ok(());
    }

    if let Err(e) = upstream.write_all(&request.to_upstream_bytes()).await {
        let _ = client.write_all(INTERNAL_ERROR).await;
        return Err(ProxyError::UpstreamConnect {
            addr: target,
            message: e.to_string(),
        });
    }

    let relayed = relay_response(&mut upstream, &mut client, ctx).await;
    let _ = client.shutdown().await;
    let _ = upstream.shutdown().await;

    match relayed {
        Ok(bytes) => {
            debug!("Proxy {} relayed {} bytes from {}", ctx.package, bytes, target);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Stream the upstream response to the client through the response filter.
///
/// A read failure before any byte reached the client becomes a `500`.
async fn relay_response(
    upstream: &mut TcpStream,
    client: &mut TcpStream,
    ctx: &HandlerContext,
) -> ProxyResult<usize> {
    let mut total = 0usize;
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = match upstream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if total == 0 => {
                let _ = client.write_all(INTERNAL_ERROR).await;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        let filtered = ctx
            .response_filter
            .filter_chunk(Bytes::copy_from_slice(&chunk[..n]));
        client.write_all(&filtered).await?;
        total += n;
    }

    Ok(total)
}
