use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::warn;

use crate::error::PipelineError;
use crate::queue::QueueClient;
use crate::sink::RecordSink;

const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// A dependency whose reachability decides the health of the process.
#[derive(Clone)]
pub enum Dependency {
    Broker(Arc<dyn QueueClient>),
    Sink(Arc<dyn RecordSink>),
}

impl Dependency {
    fn name(&self) -> &'static str {
        match self {
            Dependency::Broker(_) => "broker",
            Dependency::Sink(_) => "sink",
        }
    }

    async fn ping(&self) -> Result<(), PipelineError> {
        let ping = async {
            match self {
                Dependency::Broker(queue) => queue.ping().await,
                Dependency::Sink(sink) => sink.ping().await,
            }
        };
        match tokio::time::timeout(PING_TIMEOUT, ping).await {
            Ok(result) => result,
            Err(_) => match self {
                Dependency::Broker(_) => Err(PipelineError::BrokerUnavailable("ping timed out".into())),
                Dependency::Sink(_) => Err(PipelineError::SinkUnavailable("ping timed out".into())),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthReport {
    /// Names of the dependencies that failed their last ping.
    pub unavailable: Vec<&'static str>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.unavailable.is_empty()
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_healthy() {
            write!(f, "OK")
        } else {
            write!(f, "Unavailable: {}", self.unavailable.join(", "))
        }
    }
}

/// Reachability probe over the process's dependencies.
///
/// Results are cached for `ttl` so frequent probes do not hammer the broker
/// or the database. Concurrent callers wait on the same refresh.
pub struct HealthProbe {
    dependencies: Vec<Dependency>,
    ttl: Duration,
    cached: Mutex<Option<(Instant, HealthReport)>>,
}

impl HealthProbe {
    pub fn new(dependencies: Vec<Dependency>, ttl: Duration) -> Self {
        Self {
            dependencies,
            ttl,
            cached: Mutex::new(None),
        }
    }

    pub async fn check(&self) -> HealthReport {
        let mut cached = self.cached.lock().await;
        if let Some((at, report)) = cached.as_ref() {
            if at.elapsed() < self.ttl {
                return report.clone();
            }
        }

        let mut unavailable = Vec::new();
        for dependency in &self.dependencies {
            if let Err(e) = dependency.ping().await {
                warn!(dependency = dependency.name(), error = %e, "Health check failed");
                unavailable.push(dependency.name());
            }
        }

        let report = HealthReport { unavailable };
        *cached = Some((Instant::now(), report.clone()));
        report
    }
}
