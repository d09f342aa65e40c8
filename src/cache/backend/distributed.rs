//! Memcached-compatible distributed store.
//!
//! Node I/O goes through the `memcache` client on the blocking pool, bounded
//! by the node timeout. Keys are spread across enabled nodes by weight. A node
//! that cannot be reached or times out is reported through the failure
//! callback and skipped until its retry interval has passed; the operation
//! moves on to the next node.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use memcache::{Client, MemcacheError};
use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::{self, JoinError};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{BackendKind, InvalidationScope, NodeFailureCallback, PageBackend, StoredPage};
use crate::cache::config::MemcachedServer;
use crate::cache::error::CacheError;
use crate::cache::keys::Fingerprint;
use crate::cache::lock::mutex_guard;

const NAME: &str = "memcached";
const SOURCE: &str = "cache::backend::distributed";
const KEY_PREFIX: &str = "pagecache_";
const METRIC_NODE_FAILURE_TOTAL: &str = "pagecache_node_failure_total";
/// Expiry values above this are read by the server as absolute unix times.
const RELATIVE_EXPIRY_LIMIT_SECS: i64 = 60 * 60 * 24 * 30;

#[derive(Debug, Error)]
enum NodeError {
    #[error("connect failed: {0}")]
    Connect(MemcacheError),
    #[error(transparent)]
    Client(#[from] MemcacheError),
    #[error("timed out")]
    Timeout,
    #[error("client task failed: {0}")]
    Task(#[from] JoinError),
}

impl NodeError {
    /// Whether the node itself should be treated as down.
    fn is_unreachable(&self) -> bool {
        match self {
            Self::Connect(_) | Self::Timeout => true,
            Self::Client(err) => matches!(err, MemcacheError::IOError(_) | MemcacheError::PoolError(_)),
            Self::Task(_) => false,
        }
    }
}

enum Command {
    Get { key: String },
    Set { key: String, exptime: u32, data: Vec<u8> },
    FlushAll,
}

enum Reply {
    Value(Option<Vec<u8>>),
    Stored,
    Flushed,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } => "get",
            Self::Set { .. } => "set",
            Self::FlushAll => "flush_all",
        }
    }

    fn run(&self, client: &Client) -> Result<Reply, MemcacheError> {
        match self {
            Self::Get { key } => client.get::<Vec<u8>>(key).map(Reply::Value),
            Self::Set { key, exptime, data } => client
                .set(key, data.as_slice(), *exptime)
                .map(|()| Reply::Stored),
            Self::FlushAll => client.flush().map(|()| Reply::Flushed),
        }
    }
}

struct Node {
    server: MemcachedServer,
    client: Mutex<Option<Arc<Client>>>,
    down_until: std::sync::Mutex<Option<Instant>>,
}

impl Node {
    fn new(server: MemcachedServer) -> Self {
        Self {
            server,
            client: Mutex::new(None),
            down_until: std::sync::Mutex::new(None),
        }
    }

    fn is_available(&self, now: Instant) -> bool {
        self.server.enabled
            && mutex_guard(&self.down_until, SOURCE, "is_available").is_none_or(|until| now >= until)
    }

    fn mark_down(&self) {
        *mutex_guard(&self.down_until, SOURCE, "mark_down") =
            Some(Instant::now() + self.server.retry_interval);
    }

    fn mark_up(&self) {
        *mutex_guard(&self.down_until, SOURCE, "mark_up") = None;
    }

    /// Text protocol, with the node timeout on connect, reads and writes.
    fn url(&self) -> String {
        let secs = self.server.timeout.as_secs_f64();
        format!(
            "memcache://{}?protocol=ascii&tcp_nodelay=true&timeout={secs}&connect_timeout={secs}",
            self.server.address()
        )
    }

    async fn client(&self) -> Result<Arc<Client>, NodeError> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        let url = self.url();
        let connection_timeout = self.server.timeout;
        let connect = task::spawn_blocking(move || {
            Client::builder()
                .add_server(url)?
                .with_connection_timeout(connection_timeout)
                .build()
        });
        let client = timeout(self.server.timeout, connect)
            .await
            .map_err(|_| NodeError::Timeout)??
            .map_err(NodeError::Connect)?;

        let client = Arc::new(client);
        if self.server.persistent {
            *slot = Some(client.clone());
        }
        Ok(client)
    }

    async fn execute(&self, command: &Arc<Command>) -> Result<Reply, NodeError> {
        let client = self.client().await?;
        let command = command.clone();
        let exchange = task::spawn_blocking(move || command.run(&client));
        let result = match timeout(self.server.timeout, exchange).await {
            Ok(joined) => joined?.map_err(NodeError::from),
            Err(_) => Err(NodeError::Timeout),
        };

        // A failed exchange may leave pooled connections in an unknown state.
        if result.as_ref().is_err_and(NodeError::is_unreachable) {
            self.client.lock().await.take();
        }
        result
    }
}

pub struct DistributedBackend {
    nodes: Vec<Node>,
    on_failure: Option<NodeFailureCallback>,
}

impl DistributedBackend {
    pub fn new(servers: Vec<MemcachedServer>, on_failure: Option<NodeFailureCallback>) -> Self {
        Self {
            nodes: servers.into_iter().map(Node::new).collect(),
            on_failure,
        }
    }

    /// Available nodes, starting with the one `key` is weighted onto.
    fn candidates(&self, key: &Fingerprint) -> Vec<&Node> {
        let now = Instant::now();
        let available: Vec<&Node> = self
            .nodes
            .iter()
            .filter(|node| node.is_available(now))
            .collect();
        let total: u64 = available.iter().map(|node| u64::from(node.server.weight)).sum();
        if total == 0 {
            return available;
        }

        let mut point = key.bucket() % total;
        let mut start = 0;
        for (index, node) in available.iter().enumerate() {
            let weight = u64::from(node.server.weight);
            if point < weight {
                start = index;
                break;
            }
            point -= weight;
        }

        let mut ordered = available;
        ordered.rotate_left(start);
        ordered
    }

    fn report_failure(&self, node: &Node, op: &'static str, err: &NodeError) {
        node.mark_down();
        warn!(
            host = %node.server.host,
            port = node.server.port,
            op,
            error = %err,
            retry_in_secs = node.server.retry_interval.as_secs(),
            "Cache node unreachable"
        );
        counter!(METRIC_NODE_FAILURE_TOTAL, "host" => node.server.address()).increment(1);
        if let Some(callback) = self.on_failure.as_ref() {
            callback(&node.server.host, node.server.port);
        }
    }

    /// Runs `command` on the first candidate that answers.
    async fn dispatch(&self, key: &Fingerprint, command: Command) -> Result<Reply, CacheError> {
        let command = Arc::new(command);
        let mut last_failure = None;
        for node in self.candidates(key) {
            match node.execute(&command).await {
                Ok(reply) => {
                    node.mark_up();
                    return Ok(reply);
                }
                Err(err) if err.is_unreachable() => {
                    self.report_failure(node, command.name(), &err);
                    last_failure = Some(node);
                }
                Err(err) => return Err(CacheError::backend(NAME, command.name(), err.to_string())),
            }
        }

        Err(match last_failure {
            Some(node) => CacheError::NodeFailure {
                host: node.server.host.clone(),
                port: node.server.port,
            },
            None => CacheError::backend(NAME, command.name(), "no cache node is available"),
        })
    }
}

fn storage_key(key: &Fingerprint) -> String {
    format!("{KEY_PREFIX}{}", key.as_str())
}

/// Relative seconds for short lifetimes, the absolute timestamp beyond 30 days.
fn exptime(page: &StoredPage, now: i64) -> i64 {
    match page.expires_at {
        None => 0,
        Some(expires_at) => {
            let relative = (expires_at - now).max(1);
            if relative > RELATIVE_EXPIRY_LIMIT_SECS {
                expires_at
            } else {
                relative
            }
        }
    }
}

#[async_trait]
impl PageBackend for DistributedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::DistributedKv
    }

    async fn load(&self, key: &Fingerprint) -> Result<Option<StoredPage>, CacheError> {
        let storage_key = storage_key(key);
        let reply = self
            .dispatch(key, Command::Get { key: storage_key.clone() })
            .await?;
        let Reply::Value(Some(data)) = reply else {
            return Ok(None);
        };

        match StoredPage::decode(&data) {
            Ok(page) => Ok(Some(page)),
            Err(err) => {
                debug!(key = %storage_key, error = %err, "Ignoring undecodable cache value");
                Ok(None)
            }
        }
    }

    async fn save(&self, key: &Fingerprint, page: &StoredPage) -> Result<(), CacheError> {
        let data = page
            .encode()
            .map_err(|err| CacheError::backend(NAME, "save", err.to_string()))?;
        let exptime = exptime(page, OffsetDateTime::now_utc().unix_timestamp());

        self.dispatch(
            key,
            Command::Set {
                key: storage_key(key),
                exptime: u32::try_from(exptime).unwrap_or(u32::MAX),
                data,
            },
        )
        .await
        .map(|_| ())
    }

    async fn clean(&self, scope: InvalidationScope) -> Result<usize, CacheError> {
        // The server expires entries itself.
        if scope == InvalidationScope::ExpiredOnly {
            return Ok(0);
        }

        let now = Instant::now();
        let mut flushed = 0;
        let mut last_error = None;
        let command = Arc::new(Command::FlushAll);
        for node in self.nodes.iter().filter(|node| node.is_available(now)) {
            match node.execute(&command).await {
                Ok(_) => {
                    node.mark_up();
                    flushed += 1;
                }
                Err(err) => {
                    if err.is_unreachable() {
                        self.report_failure(node, "flush_all", &err);
                        last_error = Some(CacheError::NodeFailure {
                            host: node.server.host.clone(),
                            port: node.server.port,
                        });
                    } else {
                        last_error = Some(CacheError::backend(NAME, "flush_all", err.to_string()));
                    }
                }
            }
        }

        match (flushed, last_error) {
            (0, Some(err)) => Err(err),
            _ => Ok(0),
        }
    }
}
