//! Connection acceptor for the cache server.
//!
//! Creates channel endpoints in a loop, hands each connected client to its
//! own task, and immediately prepares the next endpoint. Endpoint errors are
//! logged and retried; they never stop the loop unless the configured
//! failure limit is reached.

use crate::cache::Cache;
use crate::config::Config;
use crate::connection::{Connection, ConnectionOptions};
use crate::transport::{self, Listener, Recovery, ServerStream};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::signal;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Fatal server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("giving up after {attempts} consecutive endpoint failures: {source}")]
    EndpointExhausted {
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

/// Consecutive-failure bookkeeping for endpoint creation and accept.
#[derive(Debug)]
struct RetryPolicy {
    backoff: Duration,
    max_failures: Option<u32>,
    failures: u32,
}

impl RetryPolicy {
    fn new(backoff: Duration, max_failures: Option<u32>) -> Self {
        Self {
            backoff,
            max_failures,
            failures: 0,
        }
    }

    /// Count a failure, or give up once the limit is reached.
    fn record_failure(&mut self, err: io::Error) -> Result<(), ServerError> {
        self.failures = self.failures.saturating_add(1);

        match self.max_failures {
            Some(max) if self.failures >= max => Err(ServerError::EndpointExhausted {
                attempts: self.failures,
                source: err,
            }),
            _ => Ok(()),
        }
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Server instance
pub struct Server {
    config: Config,
    cache: Arc<Cache>,
    options: ConnectionOptions,
    connection_limit: Option<Arc<Semaphore>>,
    next_id: AtomicU64,
}

impl Server {
    /// Create a new server with an empty cache
    pub fn new(config: Config) -> Self {
        Self::with_cache(config, Cache::new())
    }

    /// Create a server around an existing cache
    pub fn with_cache(config: Config, cache: Arc<Cache>) -> Self {
        let options = ConnectionOptions::from(&config);
        let connection_limit = config
            .max_connections
            .map(|max| Arc::new(Semaphore::new(max)));

        Server {
            config,
            cache,
            options,
            connection_limit,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Serve until Ctrl-C.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until `shutdown` completes.
    ///
    /// Handlers already running are not waited for.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut retry = RetryPolicy::new(
            self.config.create_backoff,
            self.config.max_consecutive_failures,
        );

        let mut listener = loop {
            match Listener::bind(&self.config.name) {
                Ok(listener) => break listener,
                Err(e) => {
                    error!(name = %self.config.name, error = %e, "Error creating endpoint");
                    retry.record_failure(e)?;
                    warn!(backoff = ?retry.backoff, "Failed to create endpoint, retrying");

                    tokio::select! {
                        _ = &mut shutdown => return Ok(()),
                        _ = time::sleep(retry.backoff) => {}
                    }
                }
            }
        };
        retry.reset();
        info!(path = %listener.path().display(), "Server listening");

        loop {
            let permit = match &self.connection_limit {
                Some(limit) => tokio::select! {
                    biased;
                    _ = &mut shutdown => break,
                    permit = Arc::clone(limit).acquire_owned() => permit.ok(),
                },
                None => None,
            };

            let accepted = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(stream) => {
                    retry.reset();
                    self.spawn_handler(stream, permit);
                }
                Err(e) => {
                    let recovery = transport::classify(&e);
                    warn!(error = %e, ?recovery, "Error accepting connection");
                    retry.record_failure(e)?;

                    if recovery == Recovery::Backoff {
                        tokio::select! {
                            _ = &mut shutdown => break,
                            _ = time::sleep(retry.backoff) => {}
                        }
                    }
                }
            }
        }

        drop(listener);
        let stats = self.cache.stats();
        info!(
            items = stats.items,
            sets = stats.sets,
            gets = stats.gets,
            hits = stats.hits,
            misses = stats.misses,
            "Server shut down"
        );
        Ok(())
    }

    /// Run a connection on its own task. The permit is held until it closes.
    fn spawn_handler(&self, stream: ServerStream, permit: Option<OwnedSemaphorePermit>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(id, "Client connected, starting handler");

        let connection = Connection::new(id, stream, Arc::clone(&self.cache), self.options.clone());
        tokio::spawn(
            async move {
                let _permit = permit;
                connection.serve().await;
            }
            .instrument(info_span!("connection", id)),
        );
    }
}

/// Resolves on Ctrl-C. If the handler cannot be installed, never resolves.
async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Server shutting down due to interrupt"),
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_creation() {
        let config = Config {
            max_connections: Some(4),
            ..Config::default()
        };

        let server = Server::new(config);
        assert!(server.cache().is_empty());
        assert_eq!(
            server
                .connection_limit
                .as_ref()
                .map(|limit| limit.available_permits()),
            Some(4)
        );
    }

    #[test]
    fn test_retry_policy_unbounded() {
        let mut retry = RetryPolicy::new(Duration::from_millis(1), None);
        for _ in 0..1000 {
            assert!(retry
                .record_failure(io::Error::from(io::ErrorKind::Other))
                .is_ok());
        }
    }

    #[test]
    fn test_retry_policy_limit_and_reset() {
        let mut retry = RetryPolicy::new(Duration::from_millis(1), Some(3));

        assert!(retry.record_failure(io::ErrorKind::Other.into()).is_ok());
        assert!(retry.record_failure(io::ErrorKind::Other.into()).is_ok());
        retry.reset();
        assert!(retry.record_failure(io::ErrorKind::Other.into()).is_ok());
        assert!(retry.record_failure(io::ErrorKind::Other.into()).is_ok());

        match retry.record_failure(io::ErrorKind::Other.into()) {
            Err(ServerError::EndpointExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_gives_up_when_endpoint_cannot_be_created() {
        let config = Config {
            name: "/nonexistent-pipe-cache-dir/kv.sock".to_string(),
            create_backoff: Duration::from_millis(1),
            max_consecutive_failures: Some(2),
            ..Config::default()
        };

        let result = Server::new(config)
            .run_until(std::future::pending::<()>())
            .await;
        match result {
            Err(ServerError::EndpointExhausted { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_releases_endpoint() {
        let name = std::env::temp_dir()
            .join(format!("pipe-cache-shutdown-{}.sock", std::process::id()))
            .display()
            .to_string();
        let config = Config {
            name: name.clone(),
            ..Config::default()
        };

        let server = Server::new(config);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .run_until(async {
                    let _ = rx.await;
                })
                .await
        });

        let path = transport::endpoint_path(&name);
        for _ in 0..200 {
            if path.exists() {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        assert!(path.exists());

        tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
        assert!(!path.exists());
    }
}
