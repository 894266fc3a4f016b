//! Per-chain endpoint pool: health-tracked endpoints, round-robin
//! selection over the healthy subset, and failover execution.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{
    exponential_buckets, register_histogram_vec, register_int_counter_vec, register_int_gauge_vec,
    HistogramVec, IntCounterVec, IntGaugeVec,
};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::chain_id::ChainId;
use crate::config::{RpcPoolConfig, SecretUrl};
use crate::shutdown::Shutdown;

use super::health::HealthChecker;
use super::{ClientFactory, RpcError};

/// Endpoints tried per `execute` call, endpoint count permitting.
const MAX_ATTEMPTS: usize = 3;

/// Chain-id verification gets longer than a regular request since it only
/// runs once, at startup.
const CHAIN_VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

static RPC_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "rpc_pool_requests_total",
        "RPC requests through the endpoint pool by outcome.",
        &["chain", "operation", "outcome"]
    )
    .unwrap()
});
static RPC_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "rpc_pool_latency_seconds",
        "RPC request latency through the endpoint pool.",
        &["chain", "operation"],
        exponential_buckets(0.005, 2.0, 12).unwrap()
    )
    .unwrap()
});
static HEALTHY_ENDPOINTS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "rpc_pool_healthy_endpoints",
        "Healthy endpoints per chain.",
        &["chain"]
    )
    .unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
    Healthy,
    Unhealthy,
    Recovering,
}

struct Endpoint<C> {
    url: Url,
    client: Arc<C>,
    status: EndpointStatus,
    successes: u64,
    failures: u64,
    consecutive_failures: u32,
    last_latency: Option<Duration>,
    last_error: Option<String>,
    last_probe: Option<Instant>,
}

/// Read-only endpoint counters, exposed for operational logging.
#[derive(Debug, Clone)]
pub struct EndpointStats {
    pub url: Url,
    pub status: EndpointStatus,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub last_latency: Option<Duration>,
    pub last_error: Option<String>,
}

pub struct EndpointPool<C> {
    chain: ChainId,
    policy: RpcPoolConfig,
    endpoints: RwLock<Vec<Endpoint<C>>>,
    next: AtomicUsize,
    checker: Arc<dyn HealthChecker<C>>,
    shutdown: Shutdown,
    monitor: StdMutex<Option<JoinHandle<()>>>,
}

impl<C: Send + Sync + 'static> EndpointPool<C> {
    /// Create clients for every URL, verify each endpoint's chain
    /// identity, and keep the survivors. Fails when no endpoint survives.
    #[instrument(name = "EndpointPool::connect", level = "debug", skip_all, fields(chain = %chain))]
    pub async fn connect<F>(
        chain: ChainId,
        urls: &[SecretUrl],
        factory: &F,
        checker: Arc<dyn HealthChecker<C>>,
        policy: RpcPoolConfig,
        shutdown: Shutdown,
    ) -> anyhow::Result<Arc<Self>>
    where
        F: ClientFactory<C>,
    {
        let mut endpoints = Vec::new();

        for url in urls {
            let client = match factory.create(url.expose()).await {
                Ok(client) => client,
                Err(error) => {
                    warn!(chain = %chain, endpoint = %url, ?error, "Failed to construct RPC client, excluding endpoint");
                    continue;
                }
            };

            match timeout(CHAIN_VERIFY_TIMEOUT, checker.verify_chain(&client)).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(chain = %chain, endpoint = %url, %error, "Endpoint failed chain verification, excluding");
                    drop(client);
                    continue;
                }
                Err(_) => {
                    warn!(chain = %chain, endpoint = %url, "Chain verification timed out, excluding endpoint");
                    drop(client);
                    continue;
                }
            }

            endpoints.push(Endpoint {
                url: url.expose().clone(),
                client: Arc::new(client),
                status: EndpointStatus::Healthy,
                successes: 0,
                failures: 0,
                consecutive_failures: 0,
                last_latency: None,
                last_error: None,
                last_probe: None,
            });
        }

        if endpoints.len() < policy.min_healthy_endpoints.max(1) {
            anyhow::bail!(
                "chain {chain}: only {} of {} RPC endpoints usable, need at least {}",
                endpoints.len(),
                urls.len(),
                policy.min_healthy_endpoints.max(1)
            );
        }

        info!(chain = %chain, endpoints = endpoints.len(), "Endpoint pool ready");
        HEALTHY_ENDPOINTS
            .with_label_values(&[&chain.to_string()])
            .set(endpoints.len() as i64);

        Ok(Arc::new(Self {
            chain,
            policy,
            endpoints: RwLock::new(endpoints),
            next: AtomicUsize::new(0),
            checker,
            shutdown,
            monitor: StdMutex::new(None),
        }))
    }

    /// Round-robin over the healthy subset. Fails iff nothing is healthy.
    pub async fn select_endpoint(&self) -> Result<(usize, Url, Arc<C>), RpcError> {
        let endpoints = self.endpoints.read().await;
        let healthy = endpoints
            .iter()
            .enumerate()
            .filter(|(_, e)| e.status == EndpointStatus::Healthy)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        if healthy.is_empty() {
            return Err(RpcError::NoHealthyEndpoints);
        }
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let idx = healthy[n % healthy.len()];
        Ok((idx, endpoints[idx].url.clone(), endpoints[idx].client.clone()))
    }

    /// Run `f` against a healthy endpoint, failing over to a different
    /// one on error, up to `min(3, |endpoints|)` attempts. `NotFound` is
    /// recorded as a failure for load distribution but propagated
    /// unchanged so callers can tell "not yet mined" from "endpoint
    /// down".
    pub async fn execute<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, RpcError>
    where
        F: Fn(Arc<C>) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let max_attempts = self.endpoints.read().await.len().min(MAX_ATTEMPTS).max(1);
        let mut last_error = RpcError::NoHealthyEndpoints;

        for attempt in 0..max_attempts {
            if self.shutdown.is_shutting_down() {
                return Err(RpcError::Cancelled);
            }

            let (idx, url, client) = self.select_endpoint().await?;
            let started = Instant::now();
            let outcome = timeout(self.policy.request_timeout, f(client)).await;
            let latency = started.elapsed();

            let error = match outcome {
                Ok(Ok(value)) => {
                    self.record_success(idx, operation, latency).await;
                    return Ok(value);
                }
                Ok(Err(error)) => error,
                Err(_) => RpcError::Timeout(self.policy.request_timeout),
            };

            self.record_failure(idx, operation, latency, &error).await;
            if matches!(error, RpcError::NotFound) {
                return Err(error);
            }
            warn!(
                chain = %self.chain,
                endpoint = %url,
                operation,
                attempt,
                %error,
                "RPC attempt failed"
            );
            last_error = error;
        }

        Err(RpcError::AllAttemptsFailed {
            operation,
            attempts: max_attempts,
            source: Box::new(last_error),
        })
    }

    async fn record_success(&self, idx: usize, operation: &str, latency: Duration) {
        let mut endpoints = self.endpoints.write().await;
        if let Some(endpoint) = endpoints.get_mut(idx) {
            endpoint.successes += 1;
            endpoint.last_latency = Some(latency);
            endpoint.last_error = None;
        }
        let chain = self.chain.to_string();
        RPC_REQUESTS
            .with_label_values(&[&chain, operation, "ok"])
            .inc();
        RPC_LATENCY
            .with_label_values(&[&chain, operation])
            .observe(latency.as_secs_f64());
    }

    async fn record_failure(&self, idx: usize, operation: &str, latency: Duration, error: &RpcError) {
        let mut endpoints = self.endpoints.write().await;
        if let Some(endpoint) = endpoints.get_mut(idx) {
            endpoint.failures += 1;
            endpoint.last_latency = Some(latency);
            endpoint.last_error = Some(error.to_string());
        }
        RPC_REQUESTS
            .with_label_values(&[&self.chain.to_string(), operation, "error"])
            .inc();
    }

    /// Spawn the health monitor for this pool. One task per pool; calling
    /// twice replaces (and aborts) the previous monitor.
    pub fn start_monitoring(self: &Arc<Self>) {
        let pool = self.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.policy.health_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.check_all().await;
                    }
                    () = shutdown.await_shutdown_begin() => break,
                }
            }
        });

        let mut slot = self.monitor.lock().unwrap();
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    async fn check_all(&self) {
        let now = Instant::now();

        // Snapshot outside the lock so slow probes don't block selection.
        let candidates = {
            let mut endpoints = self.endpoints.write().await;
            let mut due = Vec::new();
            for (idx, endpoint) in endpoints.iter_mut().enumerate() {
                let probe_due = match endpoint.status {
                    EndpointStatus::Healthy | EndpointStatus::Recovering => true,
                    EndpointStatus::Unhealthy => endpoint
                        .last_probe
                        .is_none_or(|at| now.duration_since(at) >= self.policy.recovery_interval),
                };
                if probe_due {
                    if endpoint.status == EndpointStatus::Unhealthy {
                        endpoint.status = EndpointStatus::Recovering;
                    }
                    due.push((idx, endpoint.client.clone()));
                }
            }
            due
        };

        for (idx, client) in candidates {
            let result = timeout(self.policy.request_timeout, self.checker.check(&client)).await;
            let result = match result {
                Ok(inner) => inner,
                Err(_) => Err(RpcError::Timeout(self.policy.request_timeout)),
            };
            self.apply_probe(idx, result).await;
        }

        let endpoints = self.endpoints.read().await;
        let healthy = endpoints
            .iter()
            .filter(|e| e.status == EndpointStatus::Healthy)
            .count();
        HEALTHY_ENDPOINTS
            .with_label_values(&[&self.chain.to_string()])
            .set(healthy as i64);
        if healthy < self.policy.min_healthy_endpoints {
            warn!(
                chain = %self.chain,
                healthy,
                min = self.policy.min_healthy_endpoints,
                "Healthy endpoints below minimum"
            );
        }
    }

    async fn apply_probe(&self, idx: usize, result: Result<(), RpcError>) {
        let mut endpoints = self.endpoints.write().await;
        let Some(endpoint) = endpoints.get_mut(idx) else {
            return;
        };
        endpoint.last_probe = Some(Instant::now());

        match result {
            Ok(()) => {
                if endpoint.status != EndpointStatus::Healthy {
                    info!(
                        chain = %self.chain,
                        endpoint = %endpoint.url,
                        failures = endpoint.failures,
                        "Endpoint recovered"
                    );
                }
                endpoint.status = EndpointStatus::Healthy;
                endpoint.consecutive_failures = 0;
            }
            Err(error) => {
                endpoint.consecutive_failures += 1;
                endpoint.failures += 1;
                endpoint.last_error = Some(error.to_string());

                match endpoint.status {
                    EndpointStatus::Healthy
                        if endpoint.consecutive_failures >= self.policy.unhealthy_threshold =>
                    {
                        warn!(
                            chain = %self.chain,
                            endpoint = %endpoint.url,
                            consecutive_failures = endpoint.consecutive_failures,
                            %error,
                            "Endpoint marked unhealthy"
                        );
                        endpoint.status = EndpointStatus::Unhealthy;
                    }
                    EndpointStatus::Recovering => {
                        debug!(
                            chain = %self.chain,
                            endpoint = %endpoint.url,
                            %error,
                            "Recovery probe failed"
                        );
                        endpoint.status = EndpointStatus::Unhealthy;
                    }
                    _ => {}
                }
            }
        }
    }

    pub async fn endpoint_stats(&self) -> Vec<EndpointStats> {
        self.endpoints
            .read()
            .await
            .iter()
            .map(|e| EndpointStats {
                url: e.url.clone(),
                status: e.status,
                successes: e.successes,
                failures: e.failures,
                consecutive_failures: e.consecutive_failures,
                last_latency: e.last_latency,
                last_error: e.last_error.clone(),
            })
            .collect()
    }

    /// Stop the health monitor and release the endpoint clients.
    pub async fn stop(&self) {
        let handle = self.monitor.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.endpoints.write().await.clear();
    }

    #[cfg(test)]
    pub(crate) async fn set_status(&self, idx: usize, status: EndpointStatus) {
        self.endpoints.write().await[idx].status = status;
    }
}
