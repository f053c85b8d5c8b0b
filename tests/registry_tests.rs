//! Probe registry tests

use async_trait::async_trait;
use probewatch::core::{self, Options, Probe, Test};
use probewatch::error::{ProbeError, ProbeResult};
use probewatch::parser::TestParser;
use probewatch::runner::LocalRunner;
use probewatch::Settings;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Reports how many times this particular instance has run
#[derive(Default)]
struct CountingProbe {
    calls: AtomicUsize,
}

fn counting_factory() -> Box<dyn Probe> {
    Box::new(CountingProbe::default())
}

#[async_trait]
impl Probe for CountingProbe {
    fn arguments(&self) -> HashMap<&'static str, &'static str> {
        HashMap::from([("expect", "^[0-9]+$")])
    }

    fn should_resolve_hostname(&self) -> bool {
        false
    }

    fn example(&self) -> &'static str {
        "host must run counting [with expect N]"
    }

    async fn run_test(&self, test: &Test, _target: &str, _opts: Options) -> ProbeResult<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match test.argument("expect") {
            "" => Ok(()),
            expected if expected == call.to_string() => Ok(()),
            _ => Err(ProbeError::Mismatch(format!("call {}", call))),
        }
    }
}

fn refusing_factory() -> Box<dyn Probe> {
    Box::new(RefusingProbe)
}

struct RefusingProbe;

#[async_trait]
impl Probe for RefusingProbe {
    fn arguments(&self) -> HashMap<&'static str, &'static str> {
        HashMap::new()
    }

    fn should_resolve_hostname(&self) -> bool {
        false
    }

    fn example(&self) -> &'static str {
        "host must run replaced"
    }

    async fn run_test(&self, _test: &Test, _target: &str, _opts: Options) -> ProbeResult<()> {
        Err(ProbeError::ProtocolError("refused".to_string()))
    }
}

#[test]
fn test_builtins_present() {
    let names = core::list_probes();
    assert!(names.contains(&"dns".to_string()));
    assert!(names.contains(&"imaps".to_string()));

    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
}

#[test]
fn test_unknown_protocol() {
    assert!(core::lookup("gopher").is_none());
}

#[tokio::test]
async fn test_lookups_yield_independent_instances() {
    core::register("counting", counting_factory);
    let test = Test::new("host", "counting", "host must run counting").with_argument("expect", "1");

    let first = core::lookup("counting").unwrap();
    let second = core::lookup("counting").unwrap();

    // Each instance starts counting from one
    assert!(first.run_test(&test, "host", Options::default()).await.is_ok());
    assert!(second.run_test(&test, "host", Options::default()).await.is_ok());

    let err = first.run_test(&test, "host", Options::default()).await.unwrap_err();
    assert_eq!(err.to_string(), "call 2");
}

#[tokio::test]
async fn test_register_overwrites() {
    core::register("replaced", counting_factory);
    core::register("replaced", refusing_factory);

    let probe = core::lookup("replaced").unwrap();
    let test = Test::new("host", "replaced", "host must run replaced");
    assert!(matches!(
        probe.run_test(&test, "host", Options::default()).await,
        Err(ProbeError::ProtocolError(_))
    ));
}

#[test]
fn test_registered_probe_is_parseable() {
    core::register("parsed-counting", counting_factory);
    let parser = TestParser::new();

    let test = parser
        .parse_line("host.example.com must run parsed-counting with expect 3", 1)
        .unwrap()
        .unwrap();
    assert_eq!(test.argument("expect"), "3");
    assert!(parser
        .parse_line("host.example.com must run parsed-counting with expect three", 1)
        .is_err());
}

#[tokio::test]
async fn test_runner_uses_bare_target_when_not_resolving() {
    core::register("runner-counting", counting_factory);
    let tests = vec![
        Test::new("unresolvable.invalid", "runner-counting", "unresolvable.invalid must run runner-counting"),
        Test::new("other.invalid", "runner-counting", "other.invalid must run runner-counting")
            .with_argument("expect", "2"),
    ];

    let summary = LocalRunner::new(Settings::default()).with_concurrency(1).run(tests).await;

    assert_eq!(summary.outcomes.len(), 2);
    // Fresh instance per run, so the second test sees its first call
    assert_eq!(summary.passed(), 1);
    assert_eq!(summary.failed(), 1);
    let addresses: Vec<_> = summary.outcomes.iter().map(|o| o.address.as_str()).collect();
    assert!(addresses.contains(&"unresolvable.invalid"));
    assert!(addresses.contains(&"other.invalid"));
}
