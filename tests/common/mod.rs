//! Shared harness for gateway integration tests
//!
//! `FakeBroker` is a scripted MQTT v5 broker that accepts CONNECT,
//! records PUBLISH, answers PINGREQ and can kick every session.
//! `Gateway` runs the real HTTP server and pool against it.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use pubgate::client::{MqttClientConfig, MqttConnector};
use pubgate::http::{AppState, HttpServer};
use pubgate::lifecycle;
use pubgate::pool::{ConnectionPool, PoolConfig};

/// A message the fake broker received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub username: Option<String>,
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct BrokerState {
    /// username -> password; empty map with `allow_anonymous` lets anyone in
    users: HashMap<String, String>,
    allow_anonymous: bool,
    sessions: usize,
    clean_disconnects: usize,
    received: Vec<Received>,
}

pub struct FakeBroker {
    addr: SocketAddr,
    state: Arc<Mutex<BrokerState>>,
    kick: broadcast::Sender<()>,
}

impl FakeBroker {
    pub async fn start(users: &[(&str, &str)]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(BrokerState {
            users: users
                .iter()
                .map(|(u, p)| (u.to_string(), p.to_string()))
                .collect(),
            allow_anonymous: true,
            ..Default::default()
        }));
        let (kick, _) = broadcast::channel(4);

        let accept_state = state.clone();
        let accept_kick = kick.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                let kick = accept_kick.subscribe();
                tokio::spawn(serve_session(stream, state, kick));
            }
        });

        Self { addr, state, kick }
    }

    pub fn url(&self) -> String {
        format!("mqtt://{}", self.addr)
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.lock().received.clone()
    }

    /// Sessions accepted so far
    pub fn sessions(&self) -> usize {
        self.state.lock().sessions
    }

    /// DISCONNECT packets received from clients
    pub fn clean_disconnects(&self) -> usize {
        self.state.lock().clean_disconnects
    }

    /// Send DISCONNECT to every live session and drop it
    pub fn kick_all(&self) {
        let _ = self.kick.send(());
    }
}

async fn read_frame(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let first = stream.read_u8().await.ok()?;
    let mut len = 0usize;
    let mut multiplier = 1usize;
    loop {
        let byte = stream.read_u8().await.ok()?;
        len += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            break;
        }
        multiplier *= 128;
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.ok()?;
    Some((first, body))
}

fn read_string(body: &[u8], pos: &mut usize) -> Vec<u8> {
    let len = u16::from_be_bytes([body[*pos], body[*pos + 1]]) as usize;
    let value = body[*pos + 2..*pos + 2 + len].to_vec();
    *pos += 2 + len;
    value
}

/// (username, password) from a v5 CONNECT body
fn parse_connect(body: &[u8]) -> (Option<String>, Option<String>) {
    let flags = body[7];
    // protocol name, level, flags, keep alive, empty properties
    let mut pos = 11;
    read_string(body, &mut pos); // client id
    let username = (flags & 0x80 != 0)
        .then(|| String::from_utf8_lossy(&read_string(body, &mut pos)).to_string());
    let password = (flags & 0x40 != 0)
        .then(|| String::from_utf8_lossy(&read_string(body, &mut pos)).to_string());
    (username, password)
}

async fn serve_session(
    mut stream: TcpStream,
    state: Arc<Mutex<BrokerState>>,
    mut kick: broadcast::Receiver<()>,
) {
    let Some((0x10, body)) = read_frame(&mut stream).await else {
        return;
    };
    let (username, password) = parse_connect(&body);

    let accepted = {
        let state = state.lock();
        match (&username, &password) {
            (None, _) => state.allow_anonymous,
            (Some(user), pass) => state.users.get(user) == pass.as_ref(),
        }
    };
    // 0x87 Not authorized
    let code = if accepted { 0x00 } else { 0x87 };
    if stream.write_all(&[0x20, 0x03, 0x00, code, 0x00]).await.is_err() || !accepted {
        return;
    }
    state.lock().sessions += 1;

    loop {
        tokio::select! {
            frame = read_frame(&mut stream) => {
                let Some((first, body)) = frame else { return };
                match first >> 4 {
                    3 => {
                        let qos = (first >> 1) & 0x03;
                        let mut pos = 0;
                        let topic = String::from_utf8_lossy(&read_string(&body, &mut pos)).to_string();
                        if qos > 0 {
                            let id = [body[pos], body[pos + 1]];
                            pos += 2;
                            let _ = stream.write_all(&[0x40, 0x02, id[0], id[1]]).await;
                        }
                        pos += 1; // empty properties
                        state.lock().received.push(Received {
                            username: username.clone(),
                            topic,
                            payload: body[pos..].to_vec(),
                        });
                    }
                    12 => {
                        let _ = stream.write_all(&[0xD0, 0x00]).await;
                    }
                    14 => {
                        state.lock().clean_disconnects += 1;
                        return;
                    }
                    _ => {}
                }
            }
            _ = kick.recv() => {
                // DISCONNECT, 0x8B Server shutting down
                let _ = stream.write_all(&[0xE0, 0x01, 0x8B]).await;
                return;
            }
        }
    }
}

/// The gateway under test, serving on an ephemeral port
pub struct Gateway {
    pub addr: SocketAddr,
    pub pool: Arc<ConnectionPool>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<std::io::Result<()>>>,
}

impl Gateway {
    pub async fn start(broker_url: &str, request_timeout: Duration) -> Self {
        let connector = Arc::new(MqttConnector::new(MqttClientConfig {
            connect_timeout: Duration::from_secs(2),
            reconnect_attempts: 0,
            ..Default::default()
        }));
        let pool = Arc::new(ConnectionPool::new(
            PoolConfig {
                url: broker_url.to_string(),
                client_name: "publisher".to_string(),
            },
            connector,
        ));

        let state = AppState::new(pool.clone(), request_timeout);
        let server = HttpServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            state,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(lifecycle::run_until_shutdown(
            server,
            pool.clone(),
            async move {
                let _ = stopped.await;
            },
        ));

        Self {
            addr,
            pool,
            stop: Some(stop),
            task: Some(task),
        }
    }

    /// Trigger shutdown and wait for both drains
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("shutdown timed out")
                .unwrap()
                .unwrap();
        }
    }
}

/// A minimal HTTP/1.1 response
#[derive(Debug)]
pub struct Reply {
    pub status: u16,
    pub headers: String,
    pub body: String,
}

impl Reply {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

/// Send one request over a fresh connection
pub async fn request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    basic: Option<(&str, &str)>,
    body: &str,
) -> Reply {
    let mut head = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n",
        method,
        path,
        addr,
        body.len()
    );
    if let Some((user, pass)) = basic {
        head.push_str(&format!(
            "Authorization: Basic {}\r\n",
            STANDARD.encode(format!("{}:{}", user, pass))
        ));
    }
    head.push_str("\r\n");

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(head.as_bytes()).await.unwrap();
    stream.write_all(body.as_bytes()).await.unwrap();

    let mut raw = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut raw))
        .await
        .expect("response timed out")
        .unwrap();

    let (headers, body) = raw.split_once("\r\n\r\n").unwrap();
    let status = headers
        .split(' ')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap();
    Reply {
        status,
        headers: headers.to_string(),
        body: body.to_string(),
    }
}

/// Poll `check` until it holds or a second passes
pub async fn eventually<F: Fn() -> bool>(check: F) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}
