//! In-memory broker client for unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{BrokerConnection, ClientError, ConnectOptions, Connector, Credentials, LifecycleHooks};

/// A connection that records what it was asked to do
pub(crate) struct MockConnection {
    pub credentials: Option<Credentials>,
    pub name: String,
    hooks: LifecycleHooks,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    publish_error: Mutex<Option<ClientError>>,
    publish_delay: Mutex<Option<Duration>>,
    published: Mutex<Vec<(String, Bytes)>>,
}

impl MockConnection {
    /// Make every following publish fail
    pub fn fail_publishes(&self, err: ClientError) {
        *self.publish_error.lock() = Some(err);
    }

    pub fn set_publish_delay(&self, delay: Duration) {
        *self.publish_delay.lock() = Some(delay);
    }

    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.published.lock().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Behave like a session that gave up reconnecting
    pub fn drop_session(&self, err: ClientError) {
        self.hooks.disconnected(&err);
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.hooks.closed();
        }
    }

    /// Fire only the disconnect hook
    pub fn fire_disconnect(&self, err: ClientError) {
        self.hooks.disconnected(&err);
    }
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), ClientError> {
        let delay = *self.publish_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        let publish_error = self.publish_error.lock().clone();
        if let Some(err) = publish_error {
            return Err(err);
        }
        self.published.lock().push((subject.to_string(), payload));
        Ok(())
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.hooks.closed();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Hands out `MockConnection`s and remembers each one
#[derive(Default)]
pub(crate) struct MockConnector {
    connects: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    reject: Mutex<Option<ClientError>>,
    /// Passwords the mock broker refuses
    refused_passwords: Mutex<Vec<String>>,
    /// Hand out connections that are already closed
    born_closed: AtomicBool,
    created: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Fail every following connect with `err`
    pub fn reject_with(&self, err: Option<ClientError>) {
        *self.reject.lock() = err;
    }

    pub fn refuse_password(&self, password: &str) {
        self.refused_passwords.lock().push(password.to_string());
    }

    pub fn set_born_closed(&self, closed: bool) {
        self.born_closed.store(closed, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<MockConnection>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Arc<MockConnection> {
        self.created
            .lock()
            .last()
            .cloned()
            .expect("no connection created")
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _url: &str,
        options: ConnectOptions,
    ) -> Result<Arc<dyn BrokerConnection>, ClientError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let reject = self.reject.lock().clone();
        if let Some(err) = reject {
            return Err(err);
        }
        if let Some(ref creds) = options.credentials {
            if self.refused_passwords.lock().contains(&creds.password) {
                return Err(ClientError::Authorization("not authorized".to_string()));
            }
        }

        let connection = Arc::new(MockConnection {
            credentials: options.credentials,
            name: options.name,
            hooks: options.hooks,
            closed: AtomicBool::new(self.born_closed.load(Ordering::SeqCst)),
            close_calls: AtomicUsize::new(0),
            publish_error: Mutex::new(None),
            publish_delay: Mutex::new(None),
            published: Mutex::new(Vec::new()),
        });
        connection.hooks.connected();
        self.created.lock().push(connection.clone());
        Ok(connection)
    }
}
