use std::{
    collections::HashMap,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use rand::Rng;

use crate::config::models::Server;

/// Balancer-side mirror of a configured [`Server`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub healthy: bool,
}

impl Node {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: 1,
            healthy: true,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_healthy(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn same_address(&self, other: &Node) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl From<&Server> for Node {
    fn from(server: &Server) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
            weight: server.weight,
            healthy: server.healthy,
        }
    }
}

/// Load balancer errors
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum BalancerError {
    #[error("no host available")]
    NoHost,
    #[error("algorithm not supported: {0}")]
    AlgorithmNotSupported(String),
}

/// A node pool plus a selection algorithm
pub trait Balancer: Send + Sync + 'static {
    /// Canonical algorithm name
    fn name(&self) -> &'static str;
    /// Merge nodes into the pool; nodes whose address is already present are ignored
    fn add(&self, nodes: &[Node]);
    /// Remove the node with the given `host:port`, returning whether it was present
    fn remove(&self, address: &str) -> bool;
    /// Snapshot of the pool in insertion order
    fn nodes(&self) -> Vec<Node>;
    /// Pick one node; `key` identifies the caller for key-affine algorithms
    fn balance(&self, key: &str) -> Result<Node, BalancerError>;
}

fn merge_nodes(pool: &mut Vec<Node>, incoming: &[Node]) -> bool {
    let mut changed = false;
    for node in incoming {
        if !pool.iter().any(|existing| existing.same_address(node)) {
            pool.push(node.clone());
            changed = true;
        }
    }
    changed
}

fn remove_node(pool: &mut Vec<Node>, address: &str) -> bool {
    let before = pool.len();
    pool.retain(|node| node.address() != address);
    pool.len() != before
}

/// Cycles through the pool in insertion order, ignoring weight and health
pub struct RoundRobin {
    nodes: RwLock<Vec<Node>>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new(nodes: Vec<Node>) -> Self {
        let mut pool = Vec::with_capacity(nodes.len());
        merge_nodes(&mut pool, &nodes);
        Self {
            nodes: RwLock::new(pool),
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Balancer for RoundRobin {
    fn name(&self) -> &'static str {
        "roundRobin"
    }

    fn add(&self, nodes: &[Node]) {
        let mut pool = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        merge_nodes(&mut pool, nodes);
    }

    fn remove(&self, address: &str) -> bool {
        let mut pool = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        remove_node(&mut pool, address)
    }

    fn nodes(&self) -> Vec<Node> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn balance(&self, _key: &str) -> Result<Node, BalancerError> {
        let pool = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        if pool.is_empty() {
            return Err(BalancerError::NoHost);
        }
        let count = self.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(pool[count % pool.len()].clone())
    }
}

#[derive(Default)]
struct WeightedPool {
    nodes: Vec<Node>,
    /// Running weight totals over eligible nodes, ascending
    cumulative: Vec<u64>,
    /// Index into `nodes` for each entry of `cumulative`
    eligible: Vec<usize>,
}

impl WeightedPool {
    fn rebuild(&mut self) {
        let mut order: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].healthy && self.nodes[i].weight > 0)
            .collect();
        order.sort_by_key(|&i| self.nodes[i].weight);

        let mut total = 0u64;
        self.cumulative = order
            .iter()
            .map(|&i| {
                total += u64::from(self.nodes[i].weight);
                total
            })
            .collect();
        self.eligible = order;
    }

    fn total(&self) -> u64 {
        self.cumulative.last().copied().unwrap_or(0)
    }
}

/// Picks healthy, positive-weight nodes with probability proportional to weight
pub struct WeightedRandom {
    pool: RwLock<WeightedPool>,
}

impl WeightedRandom {
    pub fn new(nodes: Vec<Node>) -> Self {
        let mut pool = WeightedPool::default();
        merge_nodes(&mut pool.nodes, &nodes);
        pool.rebuild();
        Self {
            pool: RwLock::new(pool),
        }
    }
}

impl Balancer for WeightedRandom {
    fn name(&self) -> &'static str {
        "wwr"
    }

    fn add(&self, nodes: &[Node]) {
        let mut pool = self.pool.write().unwrap_or_else(PoisonError::into_inner);
        if merge_nodes(&mut pool.nodes, nodes) {
            pool.rebuild();
        }
    }

    fn remove(&self, address: &str) -> bool {
        let mut pool = self.pool.write().unwrap_or_else(PoisonError::into_inner);
        let removed = remove_node(&mut pool.nodes, address);
        if removed {
            pool.rebuild();
        }
        removed
    }

    fn nodes(&self) -> Vec<Node> {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes
            .clone()
    }

    fn balance(&self, _key: &str) -> Result<Node, BalancerError> {
        let pool = self.pool.read().unwrap_or_else(PoisonError::into_inner);
        let total = pool.total();
        if total == 0 {
            return Err(BalancerError::NoHost);
        }
        let cut = rand::rng().random_range(1..=total);
        let bucket = pool.cumulative.partition_point(|&sum| sum < cut);
        Ok(pool.nodes[pool.eligible[bucket]].clone())
    }
}

/// Maps the caller key onto a healthy node with a deterministic hash
pub struct IpHash {
    nodes: RwLock<Vec<Node>>,
}

impl IpHash {
    pub fn new(nodes: Vec<Node>) -> Self {
        let mut pool = Vec::with_capacity(nodes.len());
        merge_nodes(&mut pool, &nodes);
        Self {
            nodes: RwLock::new(pool),
        }
    }

    /// 64-bit FNV-1a, fixed across builds and toolchains
    fn hash_key(key: &str) -> u64 {
        key.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x0000_0100_0000_01b3)
        })
    }
}

impl Balancer for IpHash {
    fn name(&self) -> &'static str {
        "ipHash"
    }

    fn add(&self, nodes: &[Node]) {
        let mut pool = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        merge_nodes(&mut pool, nodes);
    }

    fn remove(&self, address: &str) -> bool {
        let mut pool = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        remove_node(&mut pool, address)
    }

    fn nodes(&self) -> Vec<Node> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn balance(&self, key: &str) -> Result<Node, BalancerError> {
        let pool = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        let healthy: Vec<&Node> = pool.iter().filter(|node| node.healthy).collect();
        if healthy.is_empty() {
            return Err(BalancerError::NoHost);
        }
        let index = (Self::hash_key(key) % healthy.len() as u64) as usize;
        Ok(healthy[index].clone())
    }
}

/// Uniform choice over the whole pool
pub struct Random {
    nodes: RwLock<Vec<Node>>,
}

impl Random {
    pub fn new(nodes: Vec<Node>) -> Self {
        let mut pool = Vec::with_capacity(nodes.len());
        merge_nodes(&mut pool, &nodes);
        Self {
            nodes: RwLock::new(pool),
        }
    }
}

impl Balancer for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn add(&self, nodes: &[Node]) {
        let mut pool = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        merge_nodes(&mut pool, nodes);
    }

    fn remove(&self, address: &str) -> bool {
        let mut pool = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        remove_node(&mut pool, address)
    }

    fn nodes(&self) -> Vec<Node> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn balance(&self, _key: &str) -> Result<Node, BalancerError> {
        let pool = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        if pool.is_empty() {
            return Err(BalancerError::NoHost);
        }
        let index = rand::rng().random_range(0..pool.len());
        Ok(pool[index].clone())
    }
}

/// Constructor registered under an algorithm name
pub type BalancerConstructor = fn(Vec<Node>) -> Arc<dyn Balancer>;

fn round_robin(nodes: Vec<Node>) -> Arc<dyn Balancer> {
    Arc::new(RoundRobin::new(nodes))
}

fn weighted_random(nodes: Vec<Node>) -> Arc<dyn Balancer> {
    Arc::new(WeightedRandom::new(nodes))
}

fn ip_hash(nodes: Vec<Node>) -> Arc<dyn Balancer> {
    Arc::new(IpHash::new(nodes))
}

fn random(nodes: Vec<Node>) -> Arc<dyn Balancer> {
    Arc::new(Random::new(nodes))
}

/// Name-keyed registry of balancing algorithms.
///
/// Names are matched case-insensitively with `_` and `-` ignored, so `roundRobin`,
/// `round_robin` and `round-robin` all resolve to the same algorithm.
pub struct BalancerFactory {
    constructors: HashMap<String, BalancerConstructor>,
}

impl Default for BalancerFactory {
    fn default() -> Self {
        let mut factory = Self {
            constructors: HashMap::new(),
        };
        factory.register("roundRobin", round_robin);
        factory.register("wwr", weighted_random);
        factory.register("weightedRandom", weighted_random);
        factory.register("ipHash", ip_hash);
        factory.register("random", random);
        factory
    }
}

impl BalancerFactory {
    fn normalize(name: &str) -> String {
        name.chars()
            .filter(|c| *c != '_' && *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect()
    }

    /// Register or replace an algorithm
    pub fn register(&mut self, name: &str, constructor: BalancerConstructor) {
        self.constructors.insert(Self::normalize(name), constructor);
    }

    pub fn supports(&self, name: &str) -> bool {
        self.constructors.contains_key(&Self::normalize(name))
    }

    /// Build a balancer for `name` seeded with `nodes`
    pub fn create(&self, name: &str, nodes: Vec<Node>) -> Result<Arc<dyn Balancer>, BalancerError> {
        self.constructors
            .get(&Self::normalize(name))
            .map(|constructor| constructor(nodes))
            .ok_or_else(|| BalancerError::AlgorithmNotSupported(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ports: &[u16]) -> Vec<Node> {
        ports.iter().map(|p| Node::new("10.0.0.1", *p)).collect()
    }

    #[test]
    fn test_round_robin_cycles_in_insertion_order() {
        let balancer = RoundRobin::new(nodes(&[1, 2, 3]));
        let picked: Vec<u16> = (0..6).map(|_| balancer.balance("").unwrap().port).collect();
        assert_eq!(picked, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn test_round_robin_ignores_weight_and_health() {
        let balancer = RoundRobin::new(vec![
            Node::new("a", 1).with_weight(0),
            Node::new("b", 1).with_healthy(false),
        ]);
        assert_eq!(balancer.balance("").unwrap().host, "a");
        assert_eq!(balancer.balance("").unwrap().host, "b");
    }

    #[test]
    fn test_empty_pool_has_no_host() {
        assert_eq!(RoundRobin::new(vec![]).balance(""), Err(BalancerError::NoHost));
        assert_eq!(Random::new(vec![]).balance(""), Err(BalancerError::NoHost));
        assert_eq!(IpHash::new(vec![]).balance("k"), Err(BalancerError::NoHost));
        assert_eq!(
            WeightedRandom::new(vec![]).balance(""),
            Err(BalancerError::NoHost)
        );
    }

    #[test]
    fn test_add_merges_by_address() {
        let balancer = RoundRobin::new(nodes(&[1, 2]));
        balancer.add(&nodes(&[2, 3]));
        let ports: Vec<u16> = balancer.nodes().iter().map(|n| n.port).collect();
        assert_eq!(ports, vec![1, 2, 3]);

        assert!(balancer.remove("10.0.0.1:2"));
        assert!(!balancer.remove("10.0.0.1:2"));
        assert_eq!(balancer.nodes().len(), 2);
    }

    #[test]
    fn test_weighted_random_converges_to_weights() {
        let balancer = WeightedRandom::new(vec![
            Node::new("light", 1).with_weight(1),
            Node::new("heavy", 1).with_weight(3),
        ]);
        let draws = 40_000;
        let heavy = (0..draws)
            .filter(|_| balancer.balance("").unwrap().host == "heavy")
            .count();
        let ratio = heavy as f64 / draws as f64;
        assert!((ratio - 0.75).abs() < 0.02, "heavy ratio was {ratio}");
    }

    #[test]
    fn test_weighted_random_skips_unhealthy_and_zero_weight() {
        let balancer = WeightedRandom::new(vec![
            Node::new("down", 1).with_weight(10).with_healthy(false),
            Node::new("zero", 1).with_weight(0),
            Node::new("up", 1).with_weight(1),
        ]);
        for _ in 0..200 {
            assert_eq!(balancer.balance("").unwrap().host, "up");
        }

        balancer.remove("up:1");
        assert_eq!(balancer.balance(""), Err(BalancerError::NoHost));
    }

    #[test]
    fn test_ip_hash_is_deterministic_per_key() {
        let balancer = IpHash::new(nodes(&[1, 2, 3, 4]));
        let first = balancer.balance("192.168.1.10").unwrap();
        for _ in 0..20 {
            assert_eq!(balancer.balance("192.168.1.10").unwrap(), first);
        }

        let spread: std::collections::HashSet<u16> = (0..64)
            .map(|i| balancer.balance(&format!("10.1.0.{i}")).unwrap().port)
            .collect();
        assert!(spread.len() > 1);
    }

    #[test]
    fn test_ip_hash_mapping_is_pinned() {
        assert_eq!(IpHash::hash_key(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(IpHash::hash_key("a"), 0xaf63_dc4c_8601_ec8c);

        let balancer = IpHash::new(nodes(&[1, 2, 3]));
        assert_eq!(balancer.balance("10.0.0.1").unwrap().port, 1);
        assert_eq!(balancer.balance("a").unwrap().port, 2);
        assert_eq!(balancer.balance("").unwrap().port, 3);
    }

    #[test]
    fn test_ip_hash_avoids_unhealthy_nodes() {
        let balancer = IpHash::new(vec![
            Node::new("down", 1).with_healthy(false),
            Node::new("up", 1),
        ]);
        for i in 0..32 {
            assert_eq!(balancer.balance(&format!("client-{i}")).unwrap().host, "up");
        }
    }

    #[test]
    fn test_factory_resolves_aliases() {
        let factory = BalancerFactory::default();
        for (name, canonical) in [
            ("roundRobin", "roundRobin"),
            ("round_robin", "roundRobin"),
            ("wwr", "wwr"),
            ("weighted-random", "wwr"),
            ("IPHASH", "ipHash"),
            ("random", "random"),
        ] {
            let balancer = factory.create(name, nodes(&[1])).unwrap();
            assert_eq!(balancer.name(), canonical);
        }
    }

    #[test]
    fn test_factory_rejects_unknown_algorithm() {
        let factory = BalancerFactory::default();
        assert!(!factory.supports("leastConn"));
        let err = factory.create("leastConn", vec![]).err().unwrap();
        assert_eq!(err, BalancerError::AlgorithmNotSupported("leastConn".to_string()));
        assert!(err.to_string().contains("algorithm not supported"));
    }
}
