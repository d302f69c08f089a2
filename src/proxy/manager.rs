use std::collections::HashMap;

use anyhow::{Context, Result};
use rand::{thread_rng, Rng};
use reqwest::Client;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::cli::config::{ProxyConfig, ProxySettings};
use crate::proxy::node::{HealthPolicy, ProxyNode, ProxyStatus};
use crate::proxy::RotationPolicy;

/// Request context used to pick a proxy
#[derive(Debug, Clone, Default)]
pub struct ProxySelection {
    /// Job issuing the request, for sticky rotation
    pub job_id: Option<String>,

    /// Target host, for per-domain rotation
    pub host: Option<String>,

    /// Preferred egress country
    pub country: Option<String>,

    /// Overrides the pool default for this request
    pub policy: Option<RotationPolicy>,
}

/// Proxy handed out for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyLease {
    /// Node name, used when reporting the outcome
    pub id: String,

    /// Proxy URL understood by reqwest
    pub url: String,
}

struct PoolState {
    nodes: Vec<ProxyNode>,

    /// Next index for round-robin
    cursor: usize,

    /// host -> node index
    by_domain: HashMap<String, usize>,

    /// job id -> node index
    by_job: HashMap<String, usize>,
}

/// Health-tracked pool of egress endpoints
pub struct ProxyPool {
    state: Mutex<PoolState>,

    default_policy: RotationPolicy,

    health: HealthPolicy,
}

impl ProxyPool {
    /// Create a pool from the proxy configuration section
    pub fn new(settings: &ProxySettings) -> Self {
        Self::from_configs(
            settings.proxy_list.clone(),
            settings.rotation,
            settings.health.clone(),
        )
    }

    pub fn from_configs(configs: Vec<ProxyConfig>, default_policy: RotationPolicy, health: HealthPolicy) -> Self {
        let nodes = configs.into_iter().map(ProxyNode::new).collect();

        Self {
            state: Mutex::new(PoolState {
                nodes,
                cursor: 0,
                by_domain: HashMap::new(),
                by_job: HashMap::new(),
            }),
            default_policy,
            health,
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.nodes.is_empty()
    }

    /// Pick a proxy for a request; `None` when no node is currently selectable
    pub async fn select(&self, selection: &ProxySelection) -> Option<ProxyLease> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        // Refresh cool-downs first so expired nodes come back as trials
        let selectable: Vec<usize> = state.nodes.iter_mut()
            .enumerate()
            .filter_map(|(i, node)| node.refresh(now).then_some(i))
            .collect();

        let mut candidates: Vec<usize> = match &selection.country {
            Some(country) => selectable.iter()
                .copied()
                .filter(|i| {
                    state.nodes[*i].config.country.as_deref()
                        .map_or(false, |c| c.eq_ignore_ascii_case(country))
                })
                .collect(),
            None => Vec::new(),
        };
        if candidates.is_empty() {
            if selection.country.is_some() && !selectable.is_empty() {
                debug!("No healthy proxy for requested country, using any healthy proxy");
            }
            candidates = selectable;
        }

        if candidates.is_empty() {
            warn!("No healthy proxies available");
            return None;
        }

        let policy = selection.policy.unwrap_or(self.default_policy);
        let index = match policy {
            RotationPolicy::RoundRobin => Self::next_round_robin(&mut state, &candidates),
            RotationPolicy::PerRequest => candidates[thread_rng().gen_range(0..candidates.len())],
            RotationPolicy::PerDomain => match &selection.host {
                Some(host) => Self::sticky(&mut state, &candidates, StickyKey::Domain(host)),
                None => Self::next_round_robin(&mut state, &candidates),
            },
            RotationPolicy::Sticky => match &selection.job_id {
                Some(job_id) => Self::sticky(&mut state, &candidates, StickyKey::Job(job_id)),
                None => Self::next_round_robin(&mut state, &candidates),
            },
            RotationPolicy::SpeedBased => {
                // Untried nodes report zero latency so they get explored first
                let latency = |i: &usize| state.nodes[*i].latency_ms.unwrap_or(0.0);
                *candidates.iter()
                    .min_by(|a, b| latency(a).total_cmp(&latency(b)))
                    .unwrap_or(&candidates[0])
            }
            RotationPolicy::SuccessBased => {
                let nodes = &state.nodes;
                *candidates.iter()
                    .max_by(|a, b| {
                        nodes[**a].success_rate().total_cmp(&nodes[**b].success_rate())
                            // Among equals prefer the least recently used
                            .then_with(|| nodes[**b].last_used.cmp(&nodes[**a].last_used))
                    })
                    .unwrap_or(&candidates[0])
            }
        };

        let node = &mut state.nodes[index];
        node.mark_used(now);

        match node.proxy_url() {
            Ok(url) => {
                debug!("Selected proxy {} ({:?})", node.id(), policy);
                Some(ProxyLease { id: node.id().to_string(), url })
            }
            Err(e) => {
                error!("Proxy {} is misconfigured: {}", node.id(), e);
                node.record_failure(&self.health, now);
                None
            }
        }
    }

    fn next_round_robin(state: &mut PoolState, candidates: &[usize]) -> usize {
        let cursor = state.cursor;
        let index = candidates.iter()
            .copied()
            .find(|i| *i >= cursor)
            .unwrap_or(candidates[0]);
        state.cursor = index + 1;
        index
    }

    fn sticky(state: &mut PoolState, candidates: &[usize], key: StickyKey<'_>) -> usize {
        let current = match key {
            StickyKey::Domain(host) => state.by_domain.get(host),
            StickyKey::Job(job) => state.by_job.get(job),
        };
        if let Some(index) = current.copied().filter(|i| candidates.contains(i)) {
            return index;
        }

        let index = Self::next_round_robin(state, candidates);
        match key {
            StickyKey::Domain(host) => state.by_domain.insert(host.to_string(), index),
            StickyKey::Job(job) => state.by_job.insert(job.to_string(), index),
        };
        index
    }

    pub async fn report_success(&self, id: &str, latency: Duration) {
        let mut state = self.state.lock().await;
        if let Some(node) = state.nodes.iter_mut().find(|n| n.id() == id) {
            node.record_success(latency);
        }
    }

    pub async fn report_failure(&self, id: &str) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if let Some(node) = state.nodes.iter_mut().find(|n| n.id() == id) {
            node.record_failure(&self.health, now);
        }
    }

    /// Manually bring nodes back (all nodes when `id` is `None`)
    pub async fn reset(&self, id: Option<&str>) -> usize {
        let mut state = self.state.lock().await;
        let mut count = 0;
        for node in state.nodes.iter_mut().filter(|n| id.map_or(true, |id| n.id() == id)) {
            node.reset();
            count += 1;
        }
        info!("Reset {} proxies", count);
        count
    }

    /// Drop sticky assignments of a finished job
    pub async fn release_job(&self, job_id: &str) {
        self.state.lock().await.by_job.remove(job_id);
    }

    pub async fn status(&self) -> Vec<ProxyStatus> {
        self.state.lock().await.nodes.iter().map(ProxyNode::status).collect()
    }

    /// Probe every proxy against a check URL and feed the outcome into health tracking
    pub async fn probe_all(&self, check_url: &str) -> Result<()> {
        let nodes: Vec<ProxyNode> = self.state.lock().await.nodes.clone();

        for node in nodes {
            let started = Instant::now();
            let working = Self::probe(&node, check_url).await?;

            if working {
                debug!("Proxy tested OK: {}", node.id());
                self.report_success(node.id(), started.elapsed()).await;
            } else {
                warn!("Proxy test failed: {}", node.id());
                self.report_failure(node.id()).await;
            }
        }

        Ok(())
    }

    async fn probe(node: &ProxyNode, check_url: &str) -> Result<bool> {
        let proxy_url = match node.proxy_url() {
            Ok(url) => url,
            Err(e) => {
                error!("{}", e);
                return Ok(false);
            }
        };

        let proxy = match reqwest::Proxy::all(&proxy_url) {
            Ok(proxy) => proxy,
            Err(e) => {
                error!("Invalid proxy URL for {}: {}", node.id(), e);
                return Ok(false);
            }
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .proxy(proxy)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(match client.get(check_url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        })
    }
}

#[derive(Clone, Copy)]
enum StickyKey<'a> {
    Domain(&'a str),
    Job(&'a str),
}
