//! MQTT Broker Connection
//!
//! A publish-only MQTT client. `MqttConnector::connect` performs the
//! CONNECT/CONNACK handshake in the caller's task and then hands the socket
//! to a spawned session task, which serves publish commands, keeps the
//! session alive and fires the lifecycle hooks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::codec::{Connect, Decoder, Disconnect, Encoder, Packet, ProtocolVersion, Publish, QoS};
use super::{BrokerConnection, ClientError, ConnectOptions, Connector, LifecycleHooks};

/// Default MQTT port for `mqtt://` and `tcp://` URLs
pub const DEFAULT_PORT: u16 = 1883;

/// Pending commands per connection
const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// How long `close()` waits for the session task to wind down
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest packet accepted from the broker
const MAX_INBOUND_PACKET_SIZE: usize = 1024 * 1024;

/// Client behavior settings
#[derive(Debug, Clone)]
pub struct MqttClientConfig {
    pub protocol: ProtocolVersion,
    /// Keep alive in seconds (0 disables PINGREQ)
    pub keep_alive: u16,
    /// Bound on TCP connect and on waiting for CONNACK
    pub connect_timeout: Duration,
    pub qos: QoS,
    /// QoS 1 publishes allowed to await PUBACK at once
    pub max_inflight: u16,
    /// Handshake retries after the session drops, before giving up
    pub reconnect_attempts: u32,
    pub reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
}

impl Default for MqttClientConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolVersion::V5,
            keep_alive: 60,
            connect_timeout: Duration::from_secs(10),
            qos: QoS::AtMostOnce,
            max_inflight: 32,
            reconnect_attempts: 3,
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(30),
        }
    }
}

/// Connection state as seen by publishers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    /// Session dropped, handshake being retried
    Reconnecting,
    Closed,
}

/// Split a broker URL into host and port
pub(crate) fn parse_url(url: &str) -> Result<(String, u16), ClientError> {
    let rest = match url.split_once("://") {
        Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => rest,
            other => {
                return Err(ClientError::InvalidUrl(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        },
        None => url,
    };
    let rest = rest.trim_end_matches('/');

    if rest.is_empty() {
        return Err(ClientError::InvalidUrl("missing host".to_string()));
    }

    let parse_port = |port: &str| {
        port.parse::<u16>()
            .map_err(|_| ClientError::InvalidUrl(format!("invalid port '{}'", port)))
    };

    // Bracketed IPv6 literal
    if let Some(stripped) = rest.strip_prefix('[') {
        let (host, after) = stripped
            .split_once(']')
            .ok_or_else(|| ClientError::InvalidUrl("unterminated IPv6 address".to_string()))?;
        let port = match after.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None if after.is_empty() => DEFAULT_PORT,
            None => return Err(ClientError::InvalidUrl(format!("unexpected '{}'", after))),
        };
        return Ok((host.to_string(), port));
    }

    match rest.rsplit_once(':') {
        Some((host, _)) if host.is_empty() => {
            Err(ClientError::InvalidUrl("missing host".to_string()))
        }
        Some((host, port)) => Ok((host.to_string(), parse_port(port)?)),
        None => Ok((rest.to_string(), DEFAULT_PORT)),
    }
}

/// Map a CONNACK code to an error, `None` on success
pub(crate) fn connack_error(version: ProtocolVersion, code: u8) -> Option<ClientError> {
    match (version, code) {
        (_, 0x00) => None,
        (ProtocolVersion::V5, 0x86) | (ProtocolVersion::V311, 4) => Some(
            ClientError::Authorization("bad user name or password".to_string()),
        ),
        (ProtocolVersion::V5, 0x87) | (ProtocolVersion::V311, 5) => {
            Some(ClientError::Authorization("not authorized".to_string()))
        }
        (ProtocolVersion::V5, code) => Some(ClientError::Rejected(format!(
            "CONNACK reason code 0x{:02X}",
            code
        ))),
        (ProtocolVersion::V311, code) => Some(ClientError::Rejected(format!(
            "CONNACK return code {}",
            code
        ))),
    }
}

/// An established socket with whatever was read past the CONNACK
struct Transport {
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
    read_buf: BytesMut,
}

/// Open a TCP connection and run the CONNECT/CONNACK exchange
async fn handshake(
    addr: &(String, u16),
    connect: &Connect,
    config: &MqttClientConfig,
) -> Result<Transport, ClientError> {
    let stream = timeout(
        config.connect_timeout,
        TcpStream::connect((addr.0.as_str(), addr.1)),
    )
    .await
    .map_err(|_| ClientError::Timeout)?
    .map_err(|e| ClientError::ConnectionLost(e.to_string()))?;
    let _ = stream.set_nodelay(true);

    let (mut read_half, mut write_half) = stream.into_split();
    let encoder = Encoder::new(config.protocol);
    let decoder = Decoder::new(config.protocol).with_max_packet_size(MAX_INBOUND_PACKET_SIZE);

    let mut buf = BytesMut::new();
    encoder.encode(&Packet::Connect(connect.clone()), &mut buf)?;
    write_half
        .write_all(&buf)
        .await
        .map_err(|e| ClientError::ConnectionLost(e.to_string()))?;

    let mut read_buf = BytesMut::with_capacity(4096);
    let packet = timeout(config.connect_timeout, async {
        loop {
            if let Some((packet, consumed)) = decoder.decode(&read_buf)? {
                read_buf.advance(consumed);
                return Ok::<_, ClientError>(packet);
            }
            let n = read_half
                .read_buf(&mut read_buf)
                .await
                .map_err(|e| ClientError::ConnectionLost(e.to_string()))?;
            if n == 0 {
                return Err(ClientError::ConnectionLost(
                    "connection closed by broker".to_string(),
                ));
            }
        }
    })
    .await
    .map_err(|_| ClientError::Timeout)??;

    match packet {
        Packet::ConnAck(connack) => {
            if let Some(err) = connack_error(config.protocol, connack.code) {
                return Err(err);
            }
        }
        other => {
            return Err(ClientError::Protocol(format!(
                "expected CONNACK, got {:?}",
                other
            )))
        }
    }

    Ok(Transport {
        read_half,
        write_half,
        read_buf,
    })
}

/// Commands sent to the session task
enum Command {
    Publish {
        topic: String,
        payload: Bytes,
        done: oneshot::Sender<Result<(), ClientError>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Why `serve` stopped without an error
enum Stop {
    /// `close()` was called
    CloseRequested(oneshot::Sender<()>),
    /// Every `MqttConnection` handle was dropped
    Abandoned,
}

enum Reconnect {
    Reconnected(Transport),
    GaveUp,
    Stopped(Stop),
}

/// Owns the socket of one connection
struct SessionTask {
    addr: (String, u16),
    connect: Connect,
    config: MqttClientConfig,
    hooks: LifecycleHooks,
    status: Arc<RwLock<ConnectionStatus>>,
    closed: Arc<AtomicBool>,
    command_rx: mpsc::Receiver<Command>,
    /// QoS 1 publishes awaiting PUBACK
    inflight: HashMap<u16, oneshot::Sender<Result<(), ClientError>>>,
    next_packet_id: u16,
}

impl SessionTask {
    async fn run(mut self, transport: Transport) {
        let mut transport = transport;
        self.hooks.connected();

        let stop = loop {
            match self.serve(&mut transport).await {
                Ok(stop) => break Some(stop),
                Err(err) => {
                    debug!("MQTT '{}': session lost: {}", self.connect.client_id, err);
                    self.fail_inflight(&err);
                    *self.status.write() = ConnectionStatus::Reconnecting;

                    match self.reconnect().await {
                        Reconnect::Reconnected(fresh) => {
                            info!("MQTT '{}': reconnected", self.connect.client_id);
                            transport = fresh;
                            *self.status.write() = ConnectionStatus::Connected;
                            self.hooks.connected();
                        }
                        Reconnect::Stopped(stop) => break Some(stop),
                        Reconnect::GaveUp => {
                            self.hooks.disconnected(&err);
                            break None;
                        }
                    }
                }
            }
        };

        // Refuse everything still queued
        self.closed.store(true, Ordering::SeqCst);
        *self.status.write() = ConnectionStatus::Closed;
        self.command_rx.close();
        let mut close_waiters = Vec::new();
        if let Some(Stop::CloseRequested(done)) = stop {
            close_waiters.push(done);
        }
        while let Ok(cmd) = self.command_rx.try_recv() {
            match cmd {
                Command::Publish { done, .. } => {
                    let _ = done.send(Err(ClientError::Closed));
                }
                Command::Close { done } => close_waiters.push(done),
            }
        }
        self.fail_inflight(&ClientError::Closed);

        debug!("MQTT '{}': closed", self.connect.client_id);
        self.hooks.closed();

        for done in close_waiters {
            let _ = done.send(());
        }
    }

    /// Run the message loop until the session ends
    async fn serve(&mut self, transport: &mut Transport) -> Result<Stop, ClientError> {
        let encoder = Encoder::new(self.config.protocol);
        let decoder =
            Decoder::new(self.config.protocol).with_max_packet_size(MAX_INBOUND_PACKET_SIZE);
        let mut buf = BytesMut::new();

        let keepalive_enabled = self.config.keep_alive > 0;
        let keepalive_interval = Duration::from_secs(self.config.keep_alive.max(1) as u64);
        let mut keepalive_timer = tokio::time::interval(keepalive_interval);
        keepalive_timer.reset();
        let mut awaiting_pingresp = false;

        // Frames that arrived together with the CONNACK
        self.drain_frames(&decoder, &mut transport.read_buf, &mut awaiting_pingresp)?;

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(Command::Publish { topic, payload, done }) => {
                            let qos = self.config.qos;
                            let packet_id = match qos {
                                QoS::AtMostOnce => None,
                                QoS::AtLeastOnce => match self.allocate_packet_id() {
                                    Some(id) => Some(id),
                                    None => {
                                        let _ = done.send(Err(ClientError::Rejected(format!(
                                            "{} publishes already awaiting PUBACK",
                                            self.inflight.len()
                                        ))));
                                        continue;
                                    }
                                },
                            };
                            let publish = Packet::Publish(Publish {
                                topic,
                                qos,
                                packet_id,
                                payload,
                            });

                            buf.clear();
                            if let Err(e) = encoder.encode(&publish, &mut buf) {
                                let _ = done.send(Err(e.into()));
                                continue;
                            }
                            if let Err(e) = transport.write_half.write_all(&buf).await {
                                let err = ClientError::ConnectionLost(e.to_string());
                                let _ = done.send(Err(err.clone()));
                                return Err(err);
                            }

                            match packet_id {
                                Some(id) => {
                                    self.inflight.insert(id, done);
                                }
                                None => {
                                    let _ = done.send(Ok(()));
                                }
                            }
                        }
                        Some(Command::Close { done }) => {
                            self.send_disconnect(&encoder, transport).await;
                            return Ok(Stop::CloseRequested(done));
                        }
                        None => {
                            self.send_disconnect(&encoder, transport).await;
                            return Ok(Stop::Abandoned);
                        }
                    }
                }

                result = transport.read_half.read_buf(&mut transport.read_buf) => {
                    let n = result.map_err(|e| ClientError::ConnectionLost(e.to_string()))?;
                    if n == 0 {
                        return Err(ClientError::ConnectionLost(
                            "connection closed by broker".to_string(),
                        ));
                    }
                    self.drain_frames(&decoder, &mut transport.read_buf, &mut awaiting_pingresp)?;
                }

                _ = keepalive_timer.tick(), if keepalive_enabled => {
                    if awaiting_pingresp {
                        return Err(ClientError::ConnectionLost(
                            "keep alive timeout".to_string(),
                        ));
                    }
                    buf.clear();
                    encoder.encode(&Packet::PingReq, &mut buf)?;
                    transport
                        .write_half
                        .write_all(&buf)
                        .await
                        .map_err(|e| ClientError::ConnectionLost(e.to_string()))?;
                    awaiting_pingresp = true;
                }
            }
        }
    }

    /// Decode and handle every complete frame in the buffer
    fn drain_frames(
        &mut self,
        decoder: &Decoder,
        read_buf: &mut BytesMut,
        awaiting_pingresp: &mut bool,
    ) -> Result<(), ClientError> {
        while let Some((packet, consumed)) = decoder.decode(read_buf)? {
            read_buf.advance(consumed);
            match packet {
                Packet::PubAck(ack) => match self.inflight.remove(&ack.packet_id) {
                    Some(done) => {
                        let result = if ack.reason_code >= 0x80 {
                            Err(ClientError::Rejected(format!(
                                "PUBACK reason code 0x{:02X}",
                                ack.reason_code
                            )))
                        } else {
                            Ok(())
                        };
                        let _ = done.send(result);
                    }
                    None => debug!(
                        "MQTT '{}': PUBACK for unknown packet id {}",
                        self.connect.client_id, ack.packet_id
                    ),
                },
                Packet::PingResp => *awaiting_pingresp = false,
                Packet::Disconnect(disconnect) => {
                    warn!(
                        "MQTT '{}': broker sent DISCONNECT (reason 0x{:02X})",
                        self.connect.client_id, disconnect.reason_code
                    );
                    return Err(ClientError::ConnectionLost(format!(
                        "broker disconnected (reason 0x{:02X})",
                        disconnect.reason_code
                    )));
                }
                other => debug!(
                    "MQTT '{}': ignoring {:?}",
                    self.connect.client_id, other
                ),
            }
        }
        Ok(())
    }

    async fn send_disconnect(&self, encoder: &Encoder, transport: &mut Transport) {
        let mut buf = BytesMut::new();
        if encoder
            .encode(&Packet::Disconnect(Disconnect::default()), &mut buf)
            .is_ok()
        {
            let _ = transport.write_half.write_all(&buf).await;
        }
        let _ = transport.write_half.shutdown().await;
    }

    /// Retry the handshake with exponential backoff, answering commands meanwhile
    async fn reconnect(&mut self) -> Reconnect {
        let mut retry_interval = self.config.reconnect_interval;

        for attempt in 1..=self.config.reconnect_attempts {
            let sleep = tokio::time::sleep(retry_interval);
            tokio::pin!(sleep);

            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    cmd = self.command_rx.recv() => match cmd {
                        Some(Command::Publish { done, .. }) => {
                            let _ = done.send(Err(ClientError::ConnectionLost(
                                "reconnecting to broker".to_string(),
                            )));
                        }
                        Some(Command::Close { done }) => {
                            return Reconnect::Stopped(Stop::CloseRequested(done));
                        }
                        None => return Reconnect::Stopped(Stop::Abandoned),
                    },
                }
            }

            debug!(
                "MQTT '{}': reconnect attempt {}/{}",
                self.connect.client_id, attempt, self.config.reconnect_attempts
            );
            match handshake(&self.addr, &self.connect, &self.config).await {
                Ok(transport) => return Reconnect::Reconnected(transport),
                Err(e) if e.is_authorization() => {
                    warn!(
                        "MQTT '{}': reconnect rejected: {}",
                        self.connect.client_id, e
                    );
                    return Reconnect::GaveUp;
                }
                Err(e) => {
                    debug!(
                        "MQTT '{}': reconnect attempt {} failed: {}",
                        self.connect.client_id, attempt, e
                    );
                    retry_interval =
                        std::cmp::min(retry_interval * 2, self.config.max_reconnect_interval);
                }
            }
        }

        Reconnect::GaveUp
    }

    fn fail_inflight(&mut self, err: &ClientError) {
        for (_, done) in self.inflight.drain() {
            let _ = done.send(Err(err.clone()));
        }
    }

    /// Next free non-zero packet id, or `None` once `max_inflight` are taken
    fn allocate_packet_id(&mut self) -> Option<u16> {
        if self.inflight.len() >= self.config.max_inflight.max(1) as usize {
            return None;
        }
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }
            if !self.inflight.contains_key(&id) {
                return Some(id);
            }
        }
    }
}

/// Handle to one MQTT session
pub struct MqttConnection {
    client_id: String,
    command_tx: mpsc::Sender<Command>,
    status: Arc<RwLock<ConnectionStatus>>,
    closed: Arc<AtomicBool>,
}

impl MqttConnection {
    /// Client identifier presented to the broker
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }
}

#[async_trait]
impl BrokerConnection for MqttConnection {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        if self.status() == ConnectionStatus::Reconnecting {
            return Err(ClientError::ConnectionLost(
                "reconnecting to broker".to_string(),
            ));
        }

        let (done, result) = oneshot::channel();
        self.command_tx
            .send(Command::Publish {
                topic: subject.to_string(),
                payload,
                done,
            })
            .await
            .map_err(|_| ClientError::Closed)?;

        result.await.map_err(|_| ClientError::Closed)?
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let (done, finished) = oneshot::channel();
        let _ = timeout(CLOSE_TIMEOUT, async {
            if self.command_tx.send(Command::Close { done }).await.is_ok() {
                let _ = finished.await;
            }
        })
        .await;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Connects to an MQTT broker over TCP
pub struct MqttConnector {
    config: MqttClientConfig,
}

impl MqttConnector {
    pub fn new(config: MqttClientConfig) -> Self {
        Self { config }
    }

    /// Open a session and return the concrete handle
    pub async fn connect_mqtt(
        &self,
        url: &str,
        options: ConnectOptions,
    ) -> Result<MqttConnection, ClientError> {
        let addr = parse_url(url)?;
        let client_id = format!("{}-{}", options.name, Uuid::new_v4().simple());

        let (username, password) = match options.credentials {
            Some(creds) => (
                Some(creds.username),
                Some(Bytes::from(creds.password.into_bytes())),
            ),
            None => (None, None),
        };
        let connect = Connect {
            client_id: client_id.clone(),
            clean_start: true,
            keep_alive: self.config.keep_alive,
            username,
            password,
        };

        debug!("MQTT '{}': connecting to {}:{}", client_id, addr.0, addr.1);
        let transport = handshake(&addr, &connect, &self.config).await?;
        debug!("MQTT '{}': connected", client_id);

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let status = Arc::new(RwLock::new(ConnectionStatus::Connected));
        let closed = Arc::new(AtomicBool::new(false));

        let task = SessionTask {
            addr,
            connect,
            config: self.config.clone(),
            hooks: options.hooks,
            status: status.clone(),
            closed: closed.clone(),
            command_rx,
            inflight: HashMap::new(),
            next_packet_id: 1,
        };
        tokio::spawn(task.run(transport));

        Ok(MqttConnection {
            client_id,
            command_tx,
            status,
            closed,
        })
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(
        &self,
        url: &str,
        options: ConnectOptions,
    ) -> Result<Arc<dyn BrokerConnection>, ClientError> {
        let connection = self.connect_mqtt(url, options).await?;
        Ok(Arc::new(connection))
    }
}
