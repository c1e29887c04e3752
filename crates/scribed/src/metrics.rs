//! Prometheus metrics for the daemon
//!
//! Worker pool and background job counters live in their own crates as plain
//! atomics; they are copied into gauges on every scrape and exposed in
//! Prometheus text format over a minimal HTTP endpoint.

use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use scribe_service::{DocumentService, JobStats};
use scribe_worker::{PoolStats, WorkerPool};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Scribe metrics collector
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Worker pool
    pub worker_tasks: IntGaugeVec,
    pub worker_queued: IntGauge,
    pub worker_in_flight: IntGauge,

    // Background jobs
    pub jobs: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let worker_tasks = IntGaugeVec::new(
            Opts::new("scribe_worker_tasks", "Worker pool tasks by outcome since start"),
            &["outcome"],
        )?;
        let worker_queued = IntGauge::new("scribe_worker_queued", "Tasks waiting in the queue")?;
        let worker_in_flight =
            IntGauge::new("scribe_worker_in_flight", "Tasks currently running")?;
        let jobs = IntGaugeVec::new(
            Opts::new("scribe_jobs", "Background job events since start"),
            &["event"],
        )?;

        registry.register(Box::new(worker_tasks.clone()))?;
        registry.register(Box::new(worker_queued.clone()))?;
        registry.register(Box::new(worker_in_flight.clone()))?;
        registry.register(Box::new(jobs.clone()))?;

        Ok(Self {
            registry,
            worker_tasks,
            worker_queued,
            worker_in_flight,
            jobs,
        })
    }

    pub fn observe_pool(&self, stats: &PoolStats) {
        for (outcome, value) in [
            ("submitted", stats.submitted),
            ("dropped", stats.dropped),
            ("completed", stats.completed),
            ("failed", stats.failed),
            ("timed_out", stats.timed_out),
            ("finished", stats.finished()),
        ] {
            self.worker_tasks
                .with_label_values(&[outcome])
                .set(clamp(value));
        }
        self.worker_queued.set(clamp(stats.queued));
        self.worker_in_flight.set(clamp(stats.in_flight));
    }

    pub fn observe_jobs(&self, stats: &JobStats) {
        for (event, value) in [
            ("snapshots_created", stats.snapshots_created),
            ("snapshots_existing", stats.snapshots_existing),
            ("updates_pruned", stats.updates_pruned),
            ("compactions_locked", stats.compactions_locked),
            ("compactions_not_due", stats.compactions_not_due),
            ("invalidations", stats.invalidations),
            ("invalidations_throttled", stats.invalidations_throttled),
            ("versions_bumped", stats.versions_bumped),
            ("notifications_sent", stats.notifications_sent),
            ("job_failures", stats.job_failures),
        ] {
            self.jobs.with_label_values(&[event]).set(clamp(value));
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

fn clamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// HTTP endpoint serving `/metrics` and `/health`
pub struct MetricsServer {
    listener: TcpListener,
    metrics: Metrics,
    pool: Arc<WorkerPool>,
    service: Arc<DocumentService>,
}

impl MetricsServer {
    pub async fn bind(
        addr: SocketAddr,
        metrics: Metrics,
        pool: Arc<WorkerPool>,
        service: Arc<DocumentService>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            metrics,
            pool,
            service,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the task is aborted
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "Metrics server listening");
        }

        loop {
            match self.listener.accept().await {
                Ok((mut stream, peer)) => {
                    debug!(peer = %peer, "Metrics connection");
                    let metrics = self.metrics.clone();
                    let pool = self.pool.clone();
                    let service = self.service.clone();

                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        let n = match stream.read(&mut buf).await {
                            Ok(n) if n > 0 => n,
                            _ => return,
                        };
                        let request = String::from_utf8_lossy(&buf[..n]);

                        let response = if request.starts_with("GET /metrics")
                            || request.starts_with("GET / ")
                        {
                            metrics.observe_pool(&pool.stats());
                            metrics.observe_jobs(&service.job_stats());
                            let body = metrics.export();
                            format!(
                                "HTTP/1.1 200 OK\r\n\
                                 Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
                                 Content-Length: {}\r\n\
                                 \r\n\
                                 {}",
                                body.len(),
                                body
                            )
                        } else if request.starts_with("GET /health") {
                            if pool.is_closing() {
                                "HTTP/1.1 503 Service Unavailable\r\n\
                                 Content-Type: text/plain\r\n\
                                 Content-Length: 8\r\n\
                                 \r\n\
                                 DRAINING"
                                    .to_string()
                            } else {
                                "HTTP/1.1 200 OK\r\n\
                                 Content-Type: text/plain\r\n\
                                 Content-Length: 2\r\n\
                                 \r\n\
                                 OK"
                                .to_string()
                            }
                        } else {
                            "HTTP/1.1 404 Not Found\r\n\
                             Content-Length: 0\r\n\
                             \r\n"
                                .to_string()
                        };
                        let _ = stream.write_all(response.as_bytes()).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept metrics connection");
                }
            }
        }
    }
}
