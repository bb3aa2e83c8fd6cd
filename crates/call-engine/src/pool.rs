//! Slave pool fanout over multiple server nodes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use switchgen_esl_core::Event;
use switchgen_session_core::listener::get_listener;
use switchgen_session_core::{EventListener, EventLoop, ListenerConfig, NodeConfig};

use crate::client::Client;
use crate::error::Result;

/// One node's control surface: a client and its listener sharing a link.
pub struct SlaveNode {
    pub client: Client,
    pub listener: EventListener,
    pub event_loop: EventLoop,
}

struct PoolInner {
    nodes: Vec<Arc<SlaveNode>>,
    cursor: AtomicUsize,
}

/// A pool of slave nodes for controlling multiple servers with ease.
#[derive(Clone)]
pub struct SlavePool {
    inner: Arc<PoolInner>,
}

impl SlavePool {
    pub fn new(nodes: Vec<Arc<SlaveNode>>) -> SlavePool {
        SlavePool {
            inner: Arc::new(PoolInner {
                nodes,
                cursor: AtomicUsize::new(0),
            }),
        }
    }

    /// Build a pool from connection triples, one node per contact.
    pub fn from_configs(
        contacts: &[NodeConfig],
        listener_config: ListenerConfig,
    ) -> Result<SlavePool> {
        let mut nodes = Vec::with_capacity(contacts.len());
        for contact in contacts {
            let (event_loop, listener) =
                get_listener(contact.connection(), listener_config.clone())?;
            let client = Client::new(listener.clone());
            nodes.push(Arc::new(SlaveNode {
                client,
                listener,
                event_loop,
            }));
        }
        Ok(SlavePool::new(nodes))
    }

    pub fn len(&self) -> usize {
        self.inner.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.nodes.is_empty()
    }

    pub fn nodes(&self) -> Vec<Arc<SlaveNode>> {
        self.inner.nodes.clone()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.inner
            .nodes
            .iter()
            .map(|node| node.client.host().to_string())
            .collect()
    }

    /// Next node by interleaved cycle, skipping nodes whose active call
    /// count exceeds their admission limit. `None` when every node is at
    /// capacity.
    pub fn next_node(&self) -> Option<Arc<SlaveNode>> {
        let nodes = &self.inner.nodes;
        if nodes.is_empty() {
            return None;
        }
        for _ in 0..nodes.len() {
            let i = self.inner.cursor.fetch_add(1, Ordering::Relaxed) % nodes.len();
            let node = &nodes[i];
            if (node.listener.count_calls() as u64) <= node.listener.max_limit() {
                return Some(node.clone());
            }
            debug!("node '{}' is at capacity, skipping", node.client.host());
        }
        None
    }

    /// Connect every node's link.
    pub async fn connect_all(&self) -> Result<()> {
        for node in &self.inner.nodes {
            node.listener.connect().await?;
        }
        Ok(())
    }

    /// Start every node's dispatch loop.
    pub fn start_all(&self) -> Result<()> {
        for node in &self.inner.nodes {
            if !node.listener.is_running() {
                node.listener.start()?;
            }
        }
        Ok(())
    }

    pub async fn disconnect_all(&self) -> Result<()> {
        for node in &self.inner.nodes {
            node.listener.disconnect().await?;
        }
        Ok(())
    }

    /// Run the same api command on every node.
    pub async fn api_all(&self, cmd: &str) -> Vec<Result<Event>> {
        let mut results = Vec::with_capacity(self.len());
        for node in &self.inner.nodes {
            results.push(node.client.api(cmd).await);
        }
        results
    }

    // aggregate counters

    pub fn count_calls(&self) -> usize {
        self.inner
            .nodes
            .iter()
            .map(|node| node.listener.count_calls())
            .sum()
    }

    /// Fast aggregate active call count, the admission metric.
    pub fn fast_count(&self) -> usize {
        self.count_calls()
    }

    pub fn count_sessions(&self) -> usize {
        self.inner
            .nodes
            .iter()
            .map(|node| node.listener.count_sessions())
            .sum()
    }

    pub fn count_jobs(&self) -> usize {
        self.inner
            .nodes
            .iter()
            .map(|node| node.listener.count_jobs())
            .sum()
    }

    pub fn count_failed(&self) -> u64 {
        self.inner
            .nodes
            .iter()
            .map(|node| node.listener.count_failed())
            .sum()
    }

    /// Hangup causes reduced across every node.
    pub fn hangup_causes(&self) -> HashMap<String, u64> {
        let mut causes: HashMap<String, u64> = HashMap::new();
        for node in &self.inner.nodes {
            for (cause, count) in node.listener.hangup_causes() {
                *causes.entry(cause).or_default() += count;
            }
        }
        causes
    }
}

impl std::fmt::Debug for SlavePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlavePool")
            .field("hosts", &self.hosts())
            .field("active_calls", &self.count_calls())
            .finish()
    }
}
