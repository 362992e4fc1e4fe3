//! Slot-aware command routing with bounded redirect following.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use procstore_core::error::StoreError;

use crate::slot::hash_slot;
use crate::topology::{SlotRange, Topology};

/// The two redirect families a cluster node can answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RedirectKind {
    /// Slot ownership changed permanently; the slot map is stale.
    Moved,
    /// Slot is mid-migration; retry once against the target with `ASKING`.
    Ask,
}

/// A parsed `MOVED`/`ASK` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Redirect {
    pub kind: RedirectKind,
    pub slot: u16,
    pub addr: String,
}

/// What a node request can come back with, beyond success.
#[derive(Debug)]
pub(crate) enum NodeError {
    Redirect(Redirect),
    Store(StoreError),
}

/// Transport seam between the router and actual node connections.
///
/// The production implementation dials real nodes; tests substitute a
/// scripted mock to exercise redirect handling.
#[async_trait]
pub(crate) trait NodeLink: Send + Sync {
    /// Run one command against the node at `addr`. When `asking` is set
    /// the command must be preceded by `ASKING` on the same connection.
    async fn request(
        &self,
        addr: &str,
        cmd: &redis::Cmd,
        asking: bool,
    ) -> Result<redis::Value, NodeError>;

    /// Fetch the node's view of slot ownership.
    async fn fetch_slots(&self, addr: &str) -> Result<Vec<SlotRange>, StoreError>;
}

/// Extract a redirect from a server error reply, if it is one.
///
/// The detail of a `MOVED`/`ASK` error reads `<slot> <host>:<port>`.
pub(crate) fn parse_redirect(err: &redis::RedisError) -> Option<Redirect> {
    let kind = match err.kind() {
        redis::ErrorKind::Moved => RedirectKind::Moved,
        redis::ErrorKind::Ask => RedirectKind::Ask,
        _ => return None,
    };
    let mut parts = err.detail()?.split_whitespace();
    let slot = parts.next()?.parse().ok()?;
    let addr = parts.next()?.to_owned();
    Some(Redirect { kind, slot, addr })
}

/// Routes commands to the node owning each key's slot, following at most
/// one `MOVED` hop and one `ASK` hop per invocation.
pub(crate) struct Router<L> {
    link: L,
    topology: RwLock<Topology>,
    seeds: Vec<String>,
    next_seed: AtomicUsize,
}

impl<L: NodeLink> Router<L> {
    pub fn new(link: L, seeds: Vec<String>) -> Self {
        Self {
            link,
            topology: RwLock::new(Topology::default()),
            seeds,
            next_seed: AtomicUsize::new(0),
        }
    }

    /// Replace the cached slot map with a fresh one, trying each seed in
    /// turn until one answers.
    pub async fn refresh(&self) -> Result<(), StoreError> {
        let mut last_err = None;
        for seed in &self.seeds {
            match self.link.fetch_slots(seed).await {
                Ok(ranges) => {
                    self.topology.write().await.replace(ranges);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(seed, error = %e, "slot map fetch failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| StoreError::Connection("no cluster seed nodes configured".into())))
    }

    /// Best-known node for a slot; falls back to rotating through the
    /// seeds while the slot map has no owner.
    async fn target_for(&self, slot: u16) -> String {
        if let Some(addr) = self.topology.read().await.node_for(slot) {
            return addr.to_owned();
        }
        let i = self.next_seed.fetch_add(1, Ordering::Relaxed);
        self.seeds[i % self.seeds.len()].clone()
    }

    /// Run a single-key command, routing by `routing_key`'s hash slot.
    pub async fn run(
        &self,
        routing_key: &[u8],
        cmd: &redis::Cmd,
    ) -> Result<redis::Value, StoreError> {
        let slot = hash_slot(routing_key);
        let mut addr = self.target_for(slot).await;
        let mut asking = false;
        let mut followed_moved = false;
        let mut followed_ask = false;

        loop {
            match self.link.request(&addr, cmd, asking).await {
                Ok(value) => return Ok(value),
                Err(NodeError::Store(e)) => return Err(e),
                Err(NodeError::Redirect(r)) => match r.kind {
                    RedirectKind::Moved => {
                        if followed_moved {
                            return Err(StoreError::Connection(format!(
                                "slot {slot} redirected again to {} after one MOVED hop",
                                r.addr
                            )));
                        }
                        followed_moved = true;
                        tracing::debug!(slot = r.slot, to = %r.addr, "following MOVED");
                        self.topology
                            .write()
                            .await
                            .apply_moved(r.slot, r.addr.clone());
                        // The whole map is suspect; refetch it from the new
                        // owner but keep serving from the correction if the
                        // fetch fails.
                        match self.link.fetch_slots(&r.addr).await {
                            Ok(ranges) => self.topology.write().await.replace(ranges),
                            Err(e) => {
                                tracing::warn!(node = %r.addr, error = %e, "slot map refresh failed");
                            }
                        }
                        addr = r.addr;
                        asking = false;
                    }
                    RedirectKind::Ask => {
                        if followed_ask {
                            return Err(StoreError::Connection(format!(
                                "slot {slot} redirected again to {} after one ASK hop",
                                r.addr
                            )));
                        }
                        followed_ask = true;
                        tracing::debug!(slot = r.slot, to = %r.addr, "following ASK");
                        addr = r.addr;
                        asking = true;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use redis::Value;

    /// Scripted link: per-address queues of canned responses, plus a log
    /// of every request made.
    #[derive(Default)]
    struct MockLink {
        responses: Mutex<HashMap<String, Vec<Result<Value, NodeError>>>>,
        calls: Mutex<Vec<(String, bool)>>,
        slot_maps: Mutex<HashMap<String, Vec<SlotRange>>>,
    }

    impl MockLink {
        fn respond(&self, addr: &str, r: Result<Value, NodeError>) {
            self.responses
                .lock()
                .unwrap()
                .entry(addr.to_owned())
                .or_default()
                .push(r);
        }

        fn redirect(kind: RedirectKind, slot: u16, addr: &str) -> Result<Value, NodeError> {
            Err(NodeError::Redirect(Redirect {
                kind,
                slot,
                addr: addr.to_owned(),
            }))
        }

        fn calls(&self) -> Vec<(String, bool)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NodeLink for MockLink {
        async fn request(
            &self,
            addr: &str,
            _cmd: &redis::Cmd,
            asking: bool,
        ) -> Result<Value, NodeError> {
            self.calls.lock().unwrap().push((addr.to_owned(), asking));
            let mut responses = self.responses.lock().unwrap();
            let queue = responses.get_mut(addr);
            match queue.and_then(|q| if q.is_empty() { None } else { Some(q.remove(0)) }) {
                Some(r) => r,
                None => Err(NodeError::Store(StoreError::Connection(format!(
                    "unexpected request to {addr}"
                )))),
            }
        }

        async fn fetch_slots(&self, addr: &str) -> Result<Vec<SlotRange>, StoreError> {
            self.slot_maps
                .lock()
                .unwrap()
                .get(addr)
                .cloned()
                .ok_or_else(|| StoreError::Connection(format!("no slot map at {addr}")))
        }
    }

    fn full_range(addr: &str) -> Vec<SlotRange> {
        vec![SlotRange {
            start: 0,
            end: 16383,
            addr: addr.to_owned(),
        }]
    }

    fn router_with_map(link: MockLink, addr: &str) -> Router<MockLink> {
        link.slot_maps
            .lock()
            .unwrap()
            .insert(addr.to_owned(), full_range(addr));
        Router::new(link, vec![addr.to_owned()])
    }

    #[tokio::test]
    async fn routes_straight_to_slot_owner() {
        let link = MockLink::default();
        link.respond("a:7000", Ok(Value::Okay));
        let router = router_with_map(link, "a:7000");
        router.refresh().await.unwrap();

        let v = router.run(b"foo", &redis::cmd("GET")).await.unwrap();
        assert_eq!(v, Value::Okay);
        assert_eq!(router.link.calls(), vec![("a:7000".into(), false)]);
    }

    #[tokio::test]
    async fn follows_one_moved_and_learns_new_owner() {
        let link = MockLink::default();
        let slot = hash_slot(b"foo");
        link.respond(
            "a:7000",
            MockLink::redirect(RedirectKind::Moved, slot, "b:7001"),
        );
        link.respond("b:7001", Ok(Value::Okay));
        link.respond("b:7001", Ok(Value::Okay));
        link.slot_maps
            .lock()
            .unwrap()
            .insert("b:7001".to_owned(), full_range("b:7001"));
        let router = router_with_map(link, "a:7000");
        router.refresh().await.unwrap();

        router.run(b"foo", &redis::cmd("GET")).await.unwrap();
        // Second invocation goes straight to the learned owner.
        router.run(b"foo", &redis::cmd("GET")).await.unwrap();
        assert_eq!(
            router.link.calls(),
            vec![
                ("a:7000".into(), false),
                ("b:7001".into(), false),
                ("b:7001".into(), false),
            ]
        );
    }

    #[tokio::test]
    async fn second_moved_gives_up_naming_target() {
        let link = MockLink::default();
        let slot = hash_slot(b"foo");
        link.respond(
            "a:7000",
            MockLink::redirect(RedirectKind::Moved, slot, "b:7001"),
        );
        link.respond(
            "b:7001",
            MockLink::redirect(RedirectKind::Moved, slot, "c:7002"),
        );
        let router = router_with_map(link, "a:7000");
        router.refresh().await.unwrap();

        let err = router.run(b"foo", &redis::cmd("GET")).await.unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)));
        assert!(err.to_string().contains("c:7002"));
    }

    #[tokio::test]
    async fn ask_sets_asking_and_leaves_topology_alone() {
        let link = MockLink::default();
        let slot = hash_slot(b"foo");
        link.respond(
            "a:7000",
            MockLink::redirect(RedirectKind::Ask, slot, "b:7001"),
        );
        link.respond("b:7001", Ok(Value::Okay));
        link.respond("a:7000", Ok(Value::Okay));
        let router = router_with_map(link, "a:7000");
        router.refresh().await.unwrap();

        router.run(b"foo", &redis::cmd("GET")).await.unwrap();
        // ASK is transient: the next invocation still targets the
        // original owner, without the asking flag.
        router.run(b"foo", &redis::cmd("GET")).await.unwrap();
        assert_eq!(
            router.link.calls(),
            vec![
                ("a:7000".into(), false),
                ("b:7001".into(), true),
                ("a:7000".into(), false),
            ]
        );
    }

    #[tokio::test]
    async fn moved_then_ask_is_within_budget() {
        let link = MockLink::default();
        let slot = hash_slot(b"foo");
        link.respond(
            "a:7000",
            MockLink::redirect(RedirectKind::Moved, slot, "b:7001"),
        );
        link.respond(
            "b:7001",
            MockLink::redirect(RedirectKind::Ask, slot, "c:7002"),
        );
        link.respond("c:7002", Ok(Value::Okay));
        let router = router_with_map(link, "a:7000");
        router.refresh().await.unwrap();

        router.run(b"foo", &redis::cmd("GET")).await.unwrap();
        assert_eq!(
            router.link.calls(),
            vec![
                ("a:7000".into(), false),
                ("b:7001".into(), false),
                ("c:7002".into(), true),
            ]
        );
    }

    #[tokio::test]
    async fn second_ask_gives_up() {
        let link = MockLink::default();
        let slot = hash_slot(b"foo");
        link.respond(
            "a:7000",
            MockLink::redirect(RedirectKind::Ask, slot, "b:7001"),
        );
        link.respond(
            "b:7001",
            MockLink::redirect(RedirectKind::Ask, slot, "c:7002"),
        );
        let router = router_with_map(link, "a:7000");
        router.refresh().await.unwrap();

        let err = router.run(b"foo", &redis::cmd("GET")).await.unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)));
        assert!(err.to_string().contains("c:7002"));
    }

    #[tokio::test]
    async fn empty_map_falls_back_to_seeds() {
        let link = MockLink::default();
        link.respond("seed:7000", Ok(Value::Okay));
        let router = Router::new(link, vec!["seed:7000".to_owned()]);

        let v = router.run(b"foo", &redis::cmd("GET")).await.unwrap();
        assert_eq!(v, Value::Okay);
    }

    #[tokio::test]
    async fn backend_errors_pass_through() {
        let link = MockLink::default();
        link.respond(
            "a:7000",
            Err(NodeError::Store(StoreError::Auth("denied".into()))),
        );
        let router = router_with_map(link, "a:7000");
        router.refresh().await.unwrap();

        let err = router.run(b"foo", &redis::cmd("GET")).await.unwrap_err();
        assert!(matches!(err, StoreError::Auth(_)));
    }
}
