//! Public client surface: [`EslClient`] and [`EslEventStream`]

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::FutureExt;
use indexmap::IndexMap;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::{
    command::{EslCommand, EslResponse},
    config::ClientConfig,
    connection::{ConnectionManager, ConnectionStatus, DisconnectReason, StartupHook},
    correlator::Correlator,
    dispatcher::EventDispatcher,
    error::{EslError, EslResult},
    event::EslEvent,
};

struct Shared {
    config: ClientConfig,
    correlator: Correlator,
    status_tx: watch::Sender<ConnectionStatus>,
    shutdown_tx: watch::Sender<bool>,
    dropped_events: Arc<AtomicU64>,
}

/// Handle for issuing commands. Cheap to clone; all clones share one
/// background connection.
///
/// Commands are serialized: one is on the wire at a time and replies come
/// back in submission order. A command caught by a disconnect fails with a
/// connection error (see [`EslError::is_connection_error`]) and can simply be
/// retried once the client has reconnected.
#[derive(Clone)]
pub struct EslClient {
    shared: Arc<Shared>,
}

impl fmt::Debug for EslClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EslClient")
            .field("address", &self.shared.config.address)
            .field("status", &self.status())
            .finish()
    }
}

/// Configures and starts an [`EslClient`].
pub struct EslClientBuilder {
    config: ClientConfig,
    hook: Option<StartupHook>,
}

impl fmt::Debug for EslClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EslClientBuilder")
            .field("config", &self.config)
            .field("on_connect", &self.hook.is_some())
            .finish()
    }
}

impl EslClientBuilder {
    /// Run `hook` after every successful (re)connect.
    ///
    /// The hook gets its own task and may issue commands through the client
    /// it is handed.
    pub fn on_connect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(EslClient) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped: StartupHook = Arc::new(move |client: EslClient| hook(client).boxed());
        self.hook = Some(wrapped);
        self
    }

    /// Spawn the connection manager on the current tokio runtime.
    ///
    /// Returns immediately; the first connection is made in the background.
    pub fn start(self) -> EslResult<(EslClient, EslEventStream)> {
        self.config
            .validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            EslError::invalid_config("EslClient must be started from within a tokio runtime")
        })?;

        let (event_tx, event_rx) = mpsc::channel(
            self.config
                .queue_size(),
        );
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dropped_events = Arc::new(AtomicU64::new(0));

        let dispatcher = EventDispatcher::new(
            event_tx,
            self.config
                .dispatch_timeout(),
            dropped_events.clone(),
        );
        let client = EslClient {
            shared: Arc::new(Shared {
                correlator: Correlator::new(
                    self.config
                        .connect_timeout(),
                ),
                config: self.config,
                status_tx,
                shutdown_tx,
                dropped_events,
            }),
        };

        let manager = ConnectionManager::new(client.clone(), dispatcher, self.hook);
        runtime.spawn(manager.run(shutdown_rx));

        Ok((
            client,
            EslEventStream {
                rx: event_rx,
                status_rx,
            },
        ))
    }
}

impl EslClient {
    pub fn builder(config: ClientConfig) -> EslClientBuilder {
        EslClientBuilder { config, hook: None }
    }

    /// Start a client with no startup hook.
    ///
    /// ```rust,no_run
    /// use fsclient::{ClientConfig, EslClient};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), fsclient::EslError> {
    ///     let config = ClientConfig::new("127.0.0.1:8021", "ClueCon").with_event("HEARTBEAT");
    ///     let (client, mut events) = EslClient::connect(config)?;
    ///
    ///     client.wait_connected(std::time::Duration::from_secs(5)).await?;
    ///     println!("{}", client.api("status").await?);
    ///
    ///     while let Some(event) = events.recv().await {
    ///         println!("{:?}", event.event_name());
    ///     }
    ///     Ok(())
    /// }
    /// ```
    pub fn connect(config: ClientConfig) -> EslResult<(Self, EslEventStream)> {
        Self::builder(config).start()
    }

    pub fn config(&self) -> &ClientConfig {
        &self
            .shared
            .config
    }

    pub(crate) fn correlator(&self) -> &Correlator {
        &self
            .shared
            .correlator
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        debug!(status = ?status, "Connection status");
        self.shared
            .status_tx
            .send_replace(status);
    }

    /// Send a command and wait for its reply.
    ///
    /// The reply is returned as-is; `-ERR` replies are not turned into
    /// errors here.
    pub async fn send_command(&self, command: EslCommand) -> EslResult<EslResponse> {
        match &command {
            EslCommand::Auth { .. } => debug!("Sending command: auth [REDACTED]"),
            EslCommand::Api { command: line } | EslCommand::BgApi { command: line } => {
                debug!("Sending command: {} {}", command.name(), line)
            }
            other => debug!("Sending command: {}", other.name()),
        }

        let response = self
            .shared
            .correlator
            .submit(
                &command,
                self.shared
                    .config
                    .command_timeout(),
            )
            .await?;

        debug!(
            command = command.name(),
            success = response.is_success(),
            "Received response"
        );
        Ok(response)
    }

    /// Run an API command and return its output.
    ///
    /// Output starting with `-ERR` becomes [`EslError::CommandFailed`].
    pub async fn api(&self, command: &str) -> EslResult<String> {
        let response = self
            .send_command(EslCommand::Api {
                command: command.to_string(),
            })
            .await?;
        Ok(response
            .into_result()?
            .into_text())
    }

    /// Queue an API command in the background; returns its Job-UUID.
    ///
    /// The output arrives later as a `BACKGROUND_JOB` event carrying the
    /// same Job-UUID.
    pub async fn bgapi(&self, command: &str) -> EslResult<String> {
        let response = self
            .send_command(EslCommand::BgApi {
                command: command.to_string(),
            })
            .await?
            .into_result()?;
        response
            .job_uuid()
            .map(str::to_string)
            .ok_or_else(|| {
                EslError::protocol_error(format!(
                    "bgapi reply carried no Job-UUID: {}",
                    response.text()
                ))
            })
    }

    /// Execute a dialplan application on the leg `uuid`.
    ///
    /// With `lock` set the switch runs queued applications one at a time.
    pub async fn execute(
        &self,
        app: &str,
        arg: Option<&str>,
        uuid: &str,
        lock: bool,
    ) -> EslResult<String> {
        let response = self
            .send_command(EslCommand::Execute {
                app: app.to_string(),
                arg: arg.map(str::to_string),
                uuid: uuid.to_string(),
                lock,
            })
            .await?;
        Ok(response
            .into_result()?
            .into_text())
    }

    /// Inject a custom event. Headers are written in iteration order.
    pub async fn send_event<I, K, V>(
        &self,
        name: &str,
        headers: I,
        body: Option<&str>,
    ) -> EslResult<String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let headers: IndexMap<String, String> = headers
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let response = self
            .send_command(EslCommand::SendEvent {
                name: name.to_string(),
                headers,
                body: body.map(str::to_string),
            })
            .await?;
        Ok(response
            .into_result()?
            .into_text())
    }

    /// Add a server-side event filter, e.g. `Event-Name HEARTBEAT`.
    pub async fn filter(&self, expression: &str) -> EslResult<()> {
        self.send_command(EslCommand::Filter {
            expression: expression.to_string(),
        })
        .await?
        .into_ok()?;
        Ok(())
    }

    /// Subscribe to an event class in plain format.
    pub async fn subscribe(&self, class: &str) -> EslResult<()> {
        self.send_command(EslCommand::Event {
            class: class.to_string(),
        })
        .await?
        .into_ok()?;
        Ok(())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared
            .status_tx
            .borrow()
            .clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status()
            .is_connected()
    }

    /// Wait until a session is authenticated.
    ///
    /// Fails early if the client has stopped for good.
    pub async fn wait_connected(&self, limit: Duration) -> EslResult<()> {
        let mut status_rx = self
            .shared
            .status_tx
            .subscribe();
        let waited = timeout(
            limit,
            status_rx.wait_for(|s| s.is_connected() || s.is_stopped()),
        )
        .await;

        match waited {
            Ok(Ok(status)) => match &*status {
                ConnectionStatus::Connected => Ok(()),
                ConnectionStatus::Stopped(DisconnectReason::AuthRejected(reason)) => {
                    Err(EslError::auth_failed(reason.clone()))
                }
                _ => Err(EslError::NotConnected),
            },
            Ok(Err(_)) => Err(EslError::NotConnected),
            Err(_) => Err(EslError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            }),
        }
    }

    /// Events dropped because the consumer did not keep up
    pub fn dropped_event_count(&self) -> u64 {
        self.shared
            .dropped_events
            .load(Ordering::Relaxed)
    }

    /// Replies that arrived with no command waiting for them
    pub fn orphaned_reply_count(&self) -> u64 {
        self.shared
            .correlator
            .orphaned_count()
    }

    /// Stop the background loop and close the connection.
    ///
    /// Outstanding commands fail with a connection error and the event
    /// stream ends once drained.
    pub async fn shutdown(&self) {
        info!("Client requested shutdown");
        let mut status_rx = self
            .shared
            .status_tx
            .subscribe();
        self.shared
            .shutdown_tx
            .send_replace(true);
        let _ = status_rx
            .wait_for(ConnectionStatus::is_stopped)
            .await;
    }
}

/// Consumer side of the event channel
#[derive(Debug)]
pub struct EslEventStream {
    rx: mpsc::Receiver<EslEvent>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl EslEventStream {
    /// Wait for the next event. `None` once the client has shut down and
    /// every queued event has been read.
    pub async fn recv(&mut self) -> Option<EslEvent> {
        self.rx
            .recv()
            .await
    }

    pub fn try_recv(&mut self) -> Option<EslEvent> {
        self.rx
            .try_recv()
            .ok()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status_rx
            .borrow()
            .clone()
    }
}

impl futures_util::Stream for EslEventStream {
    type Item = EslEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx
            .poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_requires_runtime() {
        let result = EslClient::connect(ClientConfig::default());
        assert!(matches!(result, Err(EslError::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let result = EslClient::connect(ClientConfig::new("", "ClueCon"));
        assert!(matches!(result, Err(EslError::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_commands_fail_fast_while_disconnected() {
        // Nothing listens on port 1; the manager stays in its retry cycle.
        let config = ClientConfig::new("127.0.0.1:1", "ClueCon")
            .with_reconnect_delay(Duration::from_millis(50));
        let (client, _events) = EslClient::connect(config).unwrap();

        let err = client
            .api("status")
            .await
            .unwrap_err();
        assert!(err.is_connection_error());
        assert!(!client.is_connected());

        client
            .shutdown()
            .await;
        assert_eq!(
            client.status(),
            ConnectionStatus::Stopped(DisconnectReason::ClientRequested)
        );
    }

    #[tokio::test]
    async fn test_wait_connected_times_out() {
        let config = ClientConfig::new("127.0.0.1:1", "ClueCon")
            .with_reconnect_delay(Duration::from_millis(50));
        let (client, _events) = EslClient::connect(config).unwrap();

        let err = client
            .wait_connected(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, EslError::Timeout { timeout_ms: 100 }));
        client
            .shutdown()
            .await;
    }

    #[tokio::test]
    async fn test_event_stream_ends_after_shutdown() {
        let config = ClientConfig::new("127.0.0.1:1", "ClueCon")
            .with_reconnect_delay(Duration::from_millis(50));
        let (client, mut events) = EslClient::connect(config).unwrap();
        client
            .shutdown()
            .await;
        assert!(events
            .recv()
            .await
            .is_none());
        assert!(events
            .status()
            .is_stopped());
    }
}
