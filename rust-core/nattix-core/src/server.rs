//! # HTTP Server
//!
//! HTTP/1.1 server built on Hyper and Tokio that feeds every request to a
//! [`Kernel`].
//!
//! ## Key Features
//!
//! - One spawned task per connection
//! - Graceful shutdown on Ctrl-C, draining open connections up to a timeout
//! - Request bodies capped at `max_body_size` (413 beyond it)

use crate::config::Config;
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::request::Request;
use crate::response::Response;
use crate::router::Method;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// HTTP Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub address: SocketAddr,
    /// Enable keep-alive connections
    pub keep_alive: bool,
    /// Shutdown timeout for graceful shutdown (default: 30 seconds)
    pub shutdown_timeout: Duration,
    /// Max request body size in bytes
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: ([127, 0, 0, 1], 8000).into(),
            keep_alive: true,
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: crate::config::DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl ServerConfig {
    /// Settings from `APP_ADDR` and `MAX_BODY_SIZE`
    ///
    /// # Errors
    ///
    /// `Error::Config` when `APP_ADDR` is not a socket address.
    pub fn from_config(config: &Config) -> Result<Self> {
        let addr = config.addr();
        let address = addr.parse().map_err(|_| Error::Config {
            message: format!("APP_ADDR is not a socket address: {addr}"),
        })?;
        Ok(Self {
            address,
            max_body_size: config.max_body_size(),
            ..Self::default()
        })
    }
}

/// HTTP server bound to one kernel
pub struct Server {
    config: ServerConfig,
    kernel: Arc<Kernel>,
}

impl Server {
    /// Create a server for `kernel`
    pub fn new(kernel: Arc<Kernel>, config: ServerConfig) -> Self {
        Self { config, kernel }
    }

    /// Bind the server to an address
    #[must_use]
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.config.address = addr;
        self
    }

    /// Set max request body size
    pub fn set_max_body_size(&mut self, bytes: usize) {
        self.config.max_body_size = bytes;
    }

    /// Start the server with graceful shutdown
    ///
    /// # Errors
    ///
    /// `BindError` when the address cannot be bound, or an accept failure.
    pub async fn serve(&self) -> Result<()> {
        let addr = self.config.address;
        let listener = bind_listener(addr).map_err(|source| Error::BindError {
            address: addr.to_string(),
            source,
        })?;

        info!("Server listening on http://{}", addr);

        let active = Arc::new(AtomicUsize::new(0));
        let max_body_size = self.config.max_body_size;
        let keep_alive = self.config.keep_alive;

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    let (stream, remote_addr) = accept_result?;
                    let io = TokioIo::new(stream);

                    let kernel = Arc::clone(&self.kernel);
                    let active = Arc::clone(&active);

                    tokio::task::spawn(async move {
                        active.fetch_add(1, Ordering::Relaxed);

                        if let Err(err) = http1::Builder::new()
                            .keep_alive(keep_alive)
                            .serve_connection(io, service_fn(move |req| {
                                let kernel = Arc::clone(&kernel);
                                async move {
                                    let method = req.method().clone();
                                    let path = req.uri().path().to_string();
                                    let version = format!("{:?}", req.version());

                                    let response =
                                        handle_request(req, &kernel, remote_addr, max_body_size).await;
                                    info!("    {} - \"{} {} {}\" {}",
                                        remote_addr,
                                        method,
                                        path,
                                        version,
                                        response.status()
                                    );
                                    Ok::<_, hyper::Error>(response)
                                }
                            }))
                            .await
                        {
                            error!("Error serving connection: {:?}", err);
                        }
                        active.fetch_sub(1, Ordering::Relaxed);
                    });
                }
                () = shutdown_signal() => {
                    info!("Shutdown signal received, stopping server...");
                    break;
                }
            }
        }

        let drain = async {
            while active.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout, drain)
            .await
            .is_err()
        {
            error!(
                open = active.load(Ordering::Relaxed),
                "Shutdown timeout reached with connections still open"
            );
        }
        Ok(())
    }

    /// Execute a test request directly without network stack
    pub async fn test_request(
        &self,
        method: Method,
        path: &str,
        headers: HashMap<String, String>,
        body: Option<Bytes>,
    ) -> Response {
        if let Some(b) = body.as_ref() {
            if b.len() > self.config.max_body_size {
                return crate::kernel::render_error(
                    &Error::PayloadTooLarge {
                        limit: self.config.max_body_size,
                        actual: b.len(),
                    },
                    true,
                );
            }
        }
        let mut req = Request::new(method, path, headers, body);
        req.set_header("x-client-ip", "test");
        self.kernel.handle(req).await
    }
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<tokio::net::TcpListener> {
    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()?
    } else {
        tokio::net::TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(not(windows))]
    {
        socket.set_reuseport(true)?;
    }
    socket.bind(addr)?;
    socket.listen(1024)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install CTRL+C signal handler: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn handle_request(
    req: hyper::Request<hyper::body::Incoming>,
    kernel: &Kernel,
    remote_addr: SocketAddr,
    max_body_size: usize,
) -> hyper::Response<Full<Bytes>> {
    let wants_json = req
        .headers()
        .get(hyper::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"));

    let mut request = match Request::from_hyper_with_limit(req, max_body_size).await {
        Ok(r) => r,
        Err(e) => return crate::kernel::render_error(&e, wants_json).into_hyper(),
    };

    request.set_header("x-client-ip", &remote_addr.ip().to_string());
    kernel.handle(request).await.into_hyper()
}
