//! Connection management: dial, authenticate, read, reconnect

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::{
    client::EslClient,
    command::EslCommand,
    constants::*,
    dispatcher::EventDispatcher,
    error::{EslError, EslResult},
    protocol::{EslMessage, EslParser, MessageType},
    subscription,
};

/// Callback run after every successful handshake
pub(crate) type StartupHook = Arc<dyn Fn(EslClient) -> BoxFuture<'static, ()> + Send + Sync>;

/// Where the connection manager currently is in its reconnect cycle
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionStatus {
    /// Dialing the event socket.
    Connecting,
    /// TCP is up, waiting on the greeting or the `auth` reply.
    Authenticating,
    /// Authenticated; commands are accepted.
    Connected,
    /// Session lost; a reconnect follows after the backoff.
    Disconnected(DisconnectReason),
    /// The manager has exited and will not reconnect.
    Stopped(DisconnectReason),
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, ConnectionStatus::Stopped(_))
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Dial failed or timed out
    ConnectFailed(String),
    /// The switch did not answer `auth` with the accepted text
    AuthRejected(String),
    /// Clean EOF on the TCP connection
    ConnectionClosed,
    /// TCP I/O error (io::Error is not Clone, so we store the message)
    IoError(String),
    /// The byte stream could not be framed
    ProtocolError(String),
    /// Liveness timeout exceeded without any inbound traffic
    HeartbeatExpired,
    /// A command got no reply in time and the connection was recycled
    ReplyTimeout,
    /// A command could not be written in time and the connection was recycled
    WriteTimeout,
    /// Client called shutdown()
    ClientRequested,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ConnectFailed(msg) => write!(f, "connect failed: {}", msg),
            DisconnectReason::AuthRejected(msg) => write!(f, "authentication rejected: {}", msg),
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
            DisconnectReason::HeartbeatExpired => write!(f, "liveness timeout expired"),
            DisconnectReason::ReplyTimeout => write!(f, "command reply timed out"),
            DisconnectReason::WriteTimeout => write!(f, "command write timed out"),
            DisconnectReason::ClientRequested => write!(f, "client requested shutdown"),
        }
    }
}

impl DisconnectReason {
    fn from_error(error: &EslError) -> Self {
        match error {
            EslError::ConnectionClosed => DisconnectReason::ConnectionClosed,
            EslError::AuthenticationFailed { reason } => {
                DisconnectReason::AuthRejected(reason.clone())
            }
            e if e.is_framing_error() => DisconnectReason::ProtocolError(e.to_string()),
            e => DisconnectReason::IoError(e.to_string()),
        }
    }
}

/// Read a single ESL message, pulling from the socket as needed.
///
/// `limit` bounds each socket read; expiry yields [`EslError::Timeout`].
pub(crate) async fn recv_message<R>(
    reader: &mut R,
    parser: &mut EslParser,
    read_buffer: &mut [u8],
    limit: Option<Duration>,
) -> EslResult<EslMessage>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(message) = parser.parse_message()? {
            trace!(
                "[RECV] Parsed message from buffer: {:?}",
                message.message_type
            );
            return Ok(message);
        }

        let bytes_read = match limit {
            Some(limit) => timeout(limit, reader.read(read_buffer))
                .await
                .map_err(|_| EslError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                })??,
            None => {
                reader
                    .read(read_buffer)
                    .await?
            }
        };

        trace!("[RECV] Read {} bytes from socket", bytes_read);
        if bytes_read == 0 {
            return Err(EslError::ConnectionClosed);
        }
        parser.add_data(&read_buffer[..bytes_read])?;
    }
}

/// Consume the greeting, send `auth` and check for the accepted reply.
///
/// Each read and the write are bounded by `step`.
pub(crate) async fn authenticate<S>(
    stream: &mut S,
    parser: &mut EslParser,
    password: &str,
    step: Duration,
) -> EslResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut read_buffer = vec![0u8; SOCKET_BUF_SIZE];

    debug!("[AUTH] Waiting for greeting");
    let greeting = recv_message(stream, parser, &mut read_buffer, Some(step)).await?;
    if greeting.message_type != MessageType::AuthRequest {
        debug!(
            "[AUTH] Greeting was {:?}, sending auth anyway",
            greeting.message_type
        );
    }

    let auth = EslCommand::Auth {
        password: password.to_string(),
    }
    .to_wire_format()?;
    debug!("Sending command: auth [REDACTED]");
    timeout(step, stream.write_all(auth.as_bytes()))
        .await
        .map_err(|_| EslError::Timeout {
            timeout_ms: step.as_millis() as u64,
        })??;

    let reply = recv_message(stream, parser, &mut read_buffer, Some(step)).await?;
    if !reply
        .message_type
        .is_reply()
    {
        return Err(EslError::protocol_error(format!(
            "expected auth reply, got {:?}",
            reply.message_type
        )));
    }

    let response = reply.into_response()?;
    if response.text() != AUTH_ACCEPTED {
        let text = response.into_text();
        return Err(EslError::auth_failed(if text.is_empty() {
            "empty reply".to_string()
        } else {
            text
        }));
    }

    debug!("Authentication successful");
    Ok(())
}

/// Owns the reconnect cycle. Runs as one background task per client.
pub(crate) struct ConnectionManager {
    client: EslClient,
    dispatcher: EventDispatcher,
    hook: Option<StartupHook>,
    auth_failures: u32,
}

impl ConnectionManager {
    pub(crate) fn new(
        client: EslClient,
        dispatcher: EventDispatcher,
        hook: Option<StartupHook>,
    ) -> Self {
        Self {
            client,
            dispatcher,
            hook,
            auth_failures: 0,
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.client
            .set_status(status);
    }

    /// Run until shutdown is requested or the auth retry policy gives up.
    pub(crate) async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let delay = self
            .client
            .config()
            .reconnect_delay();
        let policy = self
            .client
            .config()
            .auth_retry;
        let mut attempt: u64 = 0;

        let final_reason = loop {
            attempt += 1;
            let reason = tokio::select! {
                reason = self.cycle(attempt) => reason,
                _ = shutdown_requested(&mut shutdown) => break DisconnectReason::ClientRequested,
            };

            if let DisconnectReason::AuthRejected(_) = &reason {
                self.auth_failures += 1;
                if policy.is_exhausted(self.auth_failures) {
                    error!(
                        attempts = self.auth_failures,
                        reason = %reason,
                        "Authentication keeps failing, giving up"
                    );
                    break reason;
                }
            }

            self.set_status(ConnectionStatus::Disconnected(reason.clone()));
            info!(
                reason = %reason,
                delay_ms = delay.as_millis() as u64,
                "Disconnected, reconnecting after backoff"
            );

            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown_requested(&mut shutdown) => break DisconnectReason::ClientRequested,
            }
        };

        self.client
            .correlator()
            .retire_current()
            .await;
        info!(reason = %final_reason, "Connection manager stopped");
        self.set_status(ConnectionStatus::Stopped(final_reason));
    }

    /// One pass of dial, handshake and read loop.
    async fn cycle(&mut self, attempt: u64) -> DisconnectReason {
        let config = self
            .client
            .config()
            .clone();

        self.set_status(ConnectionStatus::Connecting);
        info!(addr = %config.address, attempt, "Connecting to FreeSWITCH");
        let mut stream = match timeout(
            config.connect_timeout(),
            TcpStream::connect(config.address.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(addr = %config.address, attempt, error = %e, "TCP connect failed");
                return DisconnectReason::ConnectFailed(e.to_string());
            }
            Err(_) => {
                warn!(
                    addr = %config.address,
                    attempt,
                    timeout_ms = config.connect_timeout_ms,
                    "TCP connect timed out"
                );
                return DisconnectReason::ConnectFailed("timed out".to_string());
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Could not set TCP_NODELAY");
        }

        self.set_status(ConnectionStatus::Authenticating);
        let mut parser = EslParser::new();
        if let Err(e) = authenticate(
            &mut stream,
            &mut parser,
            &config.password,
            config.connect_timeout(),
        )
        .await
        {
            warn!(addr = %config.address, attempt, error = %e, "Handshake failed");
            return DisconnectReason::from_error(&e);
        }
        self.auth_failures = 0;

        let (reader, writer) = stream.into_split();
        let correlator = self
            .client
            .correlator();
        let generation = correlator
            .publish(Box::new(writer))
            .await;
        self.set_status(ConnectionStatus::Connected);
        info!(addr = %config.address, generation, "Connected and authenticated");

        self.spawn_startup_tasks(generation);

        let reason = self
            .read_loop(reader, parser, generation)
            .await;
        correlator
            .retire(generation)
            .await;
        reason
    }

    /// Subscription replay and the startup hook run on their own tasks so
    /// their commands can be answered by the read loop.
    fn spawn_startup_tasks(&self, generation: u64) {
        let subscriptions = self
            .client
            .config()
            .subscriptions
            .clone();
        if !subscriptions.is_empty() {
            let client = self
                .client
                .clone();
            tokio::spawn(async move {
                let failures = subscription::apply(&client, &subscriptions).await;
                debug!(generation, failures, "Subscription replay finished");
            });
        }

        if let Some(hook) = &self.hook {
            tokio::spawn(hook(
                self.client
                    .clone(),
            ));
        }
    }

    async fn read_loop(
        &self,
        mut reader: OwnedReadHalf,
        mut parser: EslParser,
        generation: u64,
    ) -> DisconnectReason {
        let mut read_buffer = vec![0u8; SOCKET_BUF_SIZE];
        let liveness = self
            .client
            .config()
            .liveness_timeout();
        let correlator = self
            .client
            .correlator();

        loop {
            let received = tokio::select! {
                received = recv_message(&mut reader, &mut parser, &mut read_buffer, liveness) => received,
                reason = correlator.recycled(generation) => return reason,
            };

            let message = match received {
                Ok(message) => message,
                Err(EslError::Timeout { timeout_ms }) => {
                    warn!(generation, timeout_ms, "Liveness timeout: no inbound traffic");
                    return DisconnectReason::HeartbeatExpired;
                }
                Err(e) => {
                    warn!(generation, error = %e, "Read loop ended");
                    return DisconnectReason::from_error(&e);
                }
            };

            match message.message_type {
                MessageType::EventPlain => match message.into_event() {
                    Ok(event) => {
                        if !self
                            .dispatcher
                            .deliver(event)
                            .await
                        {
                            trace!("Event stream closed, discarding event");
                        }
                    }
                    Err(e) => {
                        warn!(generation, error = %e, "Undecodable event");
                        return DisconnectReason::from_error(&e);
                    }
                },
                MessageType::CommandReply | MessageType::ApiResponse => match message.into_response() {
                    Ok(response) => correlator.complete(generation, response),
                    Err(e) => {
                        warn!(generation, error = %e, "Unreadable command reply");
                        return DisconnectReason::from_error(&e);
                    }
                },
                MessageType::DisconnectNotice => {
                    info!(generation, "Received disconnect notice, draining");
                }
                MessageType::AuthRequest | MessageType::Unknown(_) => {
                    debug!("Ignoring unexpected message: {:?}", message.message_type);
                }
            }
        }
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown
        .wait_for(|stop| *stop)
        .await;
}
