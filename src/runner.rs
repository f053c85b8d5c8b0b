//! Local runner
//!
//! Executes parsed tests in-process instead of queueing them. Probes that ask
//! for it get their target resolved first and run once per address.

use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Settings;
use crate::core::{self, Options, Test};
use crate::error::{ProbeError, ProbeResult};

/// Tests in flight at once
pub const DEFAULT_CONCURRENCY: usize = 16;

/// Result of one probe invocation
#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub input: String,
    pub protocol: String,
    /// Address or host name the probe was pointed at
    pub address: String,
    pub duration: Duration,
    pub error: Option<String>,
}

impl TestOutcome {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }

    fn failed_before_run(test: &Test, error: ProbeError) -> Self {
        Self {
            input: test.input.clone(),
            protocol: test.protocol.clone(),
            address: test.target.clone(),
            duration: Duration::ZERO,
            error: Some(error.to_string()),
        }
    }
}

/// Every outcome of a run, in completion order
#[derive(Debug, Default)]
pub struct RunSummary {
    pub outcomes: Vec<TestOutcome>,
}

impl RunSummary {
    pub fn passed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.passed()
    }

    pub fn succeeded(&self) -> bool {
        self.failed() == 0
    }
}

/// One probe invocation against one address
struct Job {
    test: Arc<Test>,
    address: String,
}

/// Runs tests through the registry with bounded concurrency
pub struct LocalRunner {
    settings: Settings,
    concurrency: usize,
}

impl LocalRunner {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Addresses for `host`, restricted to the enabled address families
    pub async fn resolve(&self, host: &str) -> ProbeResult<Vec<IpAddr>> {
        let mut addresses: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| ProbeError::NetworkError(format!("failed to resolve {}: {}", host, e)))?
            .map(|addr| addr.ip())
            .filter(|ip| match ip {
                IpAddr::V4(_) => self.settings.ipv4,
                IpAddr::V6(_) => self.settings.ipv6,
            })
            .collect();
        addresses.dedup();

        if addresses.is_empty() {
            return Err(ProbeError::NetworkError(format!(
                "no usable addresses for {} (ipv4: {}, ipv6: {})",
                host, self.settings.ipv4, self.settings.ipv6
            )));
        }
        debug!("Resolved {} to {:?}", host, addresses);
        Ok(addresses)
    }

    /// Expand a test into the invocations it needs
    async fn plan(&self, test: Test) -> Result<Vec<Job>, TestOutcome> {
        let probe = match core::lookup(&test.protocol) {
            Some(probe) => probe,
            None => {
                let error = ProbeError::InvalidArgument(format!("unknown protocol '{}'", test.protocol));
                return Err(TestOutcome::failed_before_run(&test, error));
            }
        };

        if !probe.should_resolve_hostname() {
            let address = test.target.clone();
            return Ok(vec![Job {
                test: Arc::new(test),
                address,
            }]);
        }

        match self.resolve(&test.target).await {
            Ok(addresses) => {
                let test = Arc::new(test);
                Ok(addresses
                    .into_iter()
                    .map(|ip| Job {
                        test: Arc::clone(&test),
                        address: ip.to_string(),
                    })
                    .collect())
            }
            Err(e) => Err(TestOutcome::failed_before_run(&test, e)),
        }
    }

    async fn execute(job: Job, opts: Options) -> TestOutcome {
        let start = Instant::now();
        let result = match core::lookup(&job.test.protocol) {
            Some(probe) => probe.run_test(&job.test, &job.address, opts).await,
            None => Err(ProbeError::Internal(format!("protocol '{}' vanished", job.test.protocol))),
        };
        let duration = start.elapsed();

        match &result {
            Ok(()) => info!("{} passed against {} in {:?}", job.test.input, job.address, duration),
            Err(e) => warn!("{} failed against {}: {}", job.test.input, job.address, e),
        }

        TestOutcome {
            input: job.test.input.clone(),
            protocol: job.test.protocol.clone(),
            address: job.address,
            duration,
            error: result.err().map(|e| e.to_string()),
        }
    }

    /// Run every test, at most `concurrency` invocations at a time
    pub async fn run(&self, tests: Vec<Test>) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut jobs = Vec::new();

        for test in tests {
            match self.plan(test).await {
                Ok(planned) => jobs.extend(planned),
                Err(outcome) => {
                    warn!("{}: {}", outcome.input, outcome.error.as_deref().unwrap_or_default());
                    summary.outcomes.push(outcome);
                }
            }
        }

        let opts = Options::with_timeout(self.settings.timeout);
        let mut pending = jobs.into_iter();
        let mut running = FuturesUnordered::new();

        for job in pending.by_ref().take(self.concurrency) {
            running.push(Self::execute(job, opts));
        }

        while let Some(outcome) = running.next().await {
            summary.outcomes.push(outcome);
            if let Some(job) = pending.next() {
                running.push(Self::execute(job, opts));
            }
        }

        info!("{} passed, {} failed", summary.passed(), summary.failed());
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_only(ipv4: bool, ipv6: bool) -> LocalRunner {
        LocalRunner::new(Settings {
            ipv4,
            ipv6,
            ..Settings::default()
        })
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        let runner = loopback_only(true, true);
        let addresses = runner.resolve("127.0.0.1").await.unwrap();
        assert_eq!(addresses, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_resolve_respects_family_toggles() {
        let runner = loopback_only(false, true);
        assert!(runner.resolve("127.0.0.1").await.is_err());

        let runner = loopback_only(true, false);
        assert!(runner.resolve("::1").await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_protocol_is_reported() {
        let runner = loopback_only(true, true);
        let test = Test::new("host", "gopher", "host must run gopher");
        let summary = runner.run(vec![test]).await;

        assert_eq!(summary.failed(), 1);
        assert!(summary.outcomes[0].error.as_deref().unwrap_or_default().contains("gopher"));
    }

    #[tokio::test]
    async fn test_argument_error_fails_without_network() {
        let runner = loopback_only(true, false);
        let test = Test::new("127.0.0.1", "dns", "127.0.0.1 must run dns with lookup example.com with type SRV")
            .with_argument("lookup", "example.com")
            .with_argument("type", "SRV");
        let summary = runner.run(vec![test]).await;

        assert!(!summary.succeeded());
        assert_eq!(summary.outcomes[0].address, "127.0.0.1");
        assert!(summary.outcomes[0].error.as_deref().unwrap_or_default().contains("SRV"));
    }

    #[test]
    fn test_concurrency_floor() {
        let runner = loopback_only(true, true).with_concurrency(0);
        assert_eq!(runner.concurrency, 1);
    }
}
