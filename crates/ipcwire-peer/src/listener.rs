use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use ipcwire_frame::Identifier;
use ipcwire_transport::UnixDomainSocket;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::{PeerError, Result};
use crate::responder::{ErrorHandler, ErrorSource, HandlerError, MessageHandler, Responder};

/// Called once for every accepted connection, before it reads any frame.
pub type ConnectHandler = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// State shared between the listener and its accept loop.
#[derive(Clone)]
struct Acceptor {
    id: Identifier,
    socket: Arc<UnixDomainSocket>,
    config: ConnectionConfig,
    connections: Arc<Mutex<HashMap<Identifier, Connection>>>,
    connect_handler: Option<ConnectHandler>,
    message_handler: Option<MessageHandler>,
    error_handler: Option<ErrorHandler>,
}

impl Acceptor {
    async fn accept(&self) -> Result<Connection> {
        let stream = self.socket.accept().await?;
        self.prune();

        let credentials = stream.peer_credentials();
        let connection = Connection::accepted(
            stream,
            self.config.clone(),
            self.message_handler.clone(),
            self.error_handler.clone(),
            |connection| {
                self.lock().insert(connection.id(), connection.clone());
                if let Some(handler) = &self.connect_handler {
                    handler(connection);
                }
            },
        );
        info!(
            connection = %connection.id(),
            ?credentials,
            "accepted connection"
        );
        Ok(connection)
    }

    fn prune(&self) {
        let mut connections = self.lock();
        let before = connections.len();
        connections.retain(|_, connection| connection.state() != ConnectionState::Destroyed);
        let pruned = before - connections.len();
        if pruned > 0 {
            debug!(pruned, "dropped destroyed connections");
        }
    }

    fn report(&self, error: &PeerError) {
        match &self.error_handler {
            Some(handler) => handler(ErrorSource::Listener(self.id), error),
            None => warn!(error = %error, "unhandled listener error"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Identifier, Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Accepts connections on a Unix domain socket and tracks them.
///
/// Configure with the `with_*` builders, then either call
/// [`accept`](Self::accept) in a loop or [`start`](Self::start) a background
/// accept loop.
pub struct Listener {
    acceptor: Acceptor,
    shutdown: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl Listener {
    /// Bind to a Unix domain socket path.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let socket = UnixDomainSocket::bind(path)?;
        let id = Identifier::new();
        info!(listener = %id, path = ?socket.path(), "listening");
        Ok(Self {
            acceptor: Acceptor {
                id,
                socket: Arc::new(socket),
                config: ConnectionConfig::default(),
                connections: Arc::new(Mutex::new(HashMap::new())),
                connect_handler: None,
                message_handler: None,
                error_handler: None,
            },
            shutdown: CancellationToken::new(),
            accept_task: None,
        })
    }

    /// Configuration for every accepted connection.
    pub fn with_connection_config(mut self, config: ConnectionConfig) -> Self {
        self.acceptor.config = config;
        self
    }

    pub fn with_connect_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.acceptor.connect_handler = Some(Arc::new(handler));
        self
    }

    /// Default message handler for accepted connections. A connect handler
    /// may still replace it per connection.
    pub fn with_message_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Bytes, Responder) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.acceptor.message_handler = Some(Arc::new(handler));
        self
    }

    /// Error handler for the listener and, by default, its connections.
    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(ErrorSource, &PeerError) + Send + Sync + 'static,
    {
        self.acceptor.error_handler = Some(Arc::new(handler));
        self
    }

    /// Accept the next connection.
    pub async fn accept(&self) -> Result<Connection> {
        self.acceptor.accept().await
    }

    /// Run the accept loop in the background until [`close`](Self::close).
    /// Calling it again while the loop runs does nothing.
    pub fn start(&mut self) {
        if self.accept_task.is_some() {
            return;
        }
        let acceptor = self.acceptor.clone();
        let shutdown = self.shutdown.clone();
        let span = info_span!("listener", id = %acceptor.id);
        self.accept_task = Some(tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        accepted = acceptor.accept() => {
                            if let Err(err) = accepted {
                                warn!(error = %err, "accept failed");
                                acceptor.report(&err);
                                tokio::select! {
                                    _ = shutdown.cancelled() => break,
                                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                                }
                            }
                        }
                    }
                }
                debug!("accept loop stopped");
            }
            .instrument(span),
        ));
    }

    /// Snapshot of the tracked connections.
    pub fn connections(&self) -> Vec<Connection> {
        self.acceptor.lock().values().cloned().collect()
    }

    pub fn connection(&self, id: Identifier) -> Option<Connection> {
        self.acceptor.lock().get(&id).cloned()
    }

    pub fn id(&self) -> Identifier {
        self.acceptor.id
    }

    /// Bound socket path.
    pub fn path(&self) -> &Path {
        self.acceptor.socket.path()
    }

    /// Stop accepting, close every tracked connection, then remove the
    /// socket.
    ///
    /// Fails with [`PeerError::ShutdownFailed`] if the connections do not
    /// all close cleanly within `timeout`.
    pub async fn close(mut self, timeout: Duration) -> Result<()> {
        self.shutdown.cancel();
        if let Some(task) = self.accept_task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "accept loop ended abnormally");
            }
        }

        let connections: Vec<Connection> = self.acceptor.lock().drain().map(|(_, c)| c).collect();
        info!(count = connections.len(), "closing listener");

        let mut closing = JoinSet::new();
        for connection in connections {
            closing.spawn(async move {
                let id = connection.id();
                connection.close().await.map_err(|err| format!("{id}: {err}"))
            });
        }

        let failures = tokio::time::timeout(timeout, async {
            let mut failures = Vec::new();
            while let Some(joined) = closing.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(message)) => failures.push(message),
                    Err(err) => failures.push(err.to_string()),
                }
            }
            failures
        })
        .await;

        match failures {
            Err(_) => Err(PeerError::ShutdownFailed(format!(
                "connections did not close within {timeout:?}"
            ))),
            Ok(failures) if failures.is_empty() => Ok(()),
            Ok(failures) => Err(PeerError::ShutdownFailed(failures.join("; "))),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.acceptor.id)
            .field("path", &self.path())
            .finish()
    }
}
