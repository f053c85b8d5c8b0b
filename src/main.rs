use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use colored::*;
use std::process;

use probewatch::{
    config::{parse_duration, Settings, SettingsOverrides},
    core,
    enqueue::Enqueuer,
    parser::{open_source, TestParser, STDIN_PATH},
    queue::RedisQueue,
    runner::{LocalRunner, DEFAULT_CONCURRENCY},
};

fn files_arg() -> Arg {
    Arg::new("files")
        .value_name("FILE")
        .help("Test definition files, '-' for standard input")
        .num_args(1..)
        .default_value(STDIN_PATH)
        .action(ArgAction::Append)
}

fn build_cli() -> Command {
    Command::new("probewatch")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Declarative service probes: queue tests for workers or run them locally")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("enqueue")
                .about("Parse test files and push each test onto the job queue")
                .arg(
                    Arg::new("redis-host")
                        .long("redis-host")
                        .value_name("HOST:PORT")
                        .help("Queue server address"),
                )
                .arg(
                    Arg::new("redis-socket")
                        .long("redis-socket")
                        .value_name("PATH")
                        .help("Queue unix socket; used instead of --redis-host when set"),
                )
                .arg(
                    Arg::new("redis-pass")
                        .long("redis-pass")
                        .value_name("PASSWORD")
                        .help("Queue password"),
                )
                .arg(
                    Arg::new("redis-db")
                        .long("redis-db")
                        .value_name("N")
                        .help("Queue database index")
                        .value_parser(value_parser!(i64)),
                )
                .arg(
                    Arg::new("redis-timeout")
                        .long("redis-timeout")
                        .value_name("DURATION")
                        .help("Queue connection timeout, e.g. 500ms or 5s")
                        .value_parser(parse_duration),
                )
                .arg(files_arg()),
        )
        .subcommand(
            Command::new("local")
                .about("Parse test files and run every test from this host")
                .arg(
                    Arg::new("timeout")
                        .short('t')
                        .long("timeout")
                        .value_name("DURATION")
                        .help("Deadline for each probe's network operations")
                        .value_parser(parse_duration),
                )
                .arg(
                    Arg::new("no-ipv4")
                        .long("no-ipv4")
                        .help("Skip IPv4 addresses when resolving targets")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("no-ipv6")
                        .long("no-ipv6")
                        .help("Skip IPv6 addresses when resolving targets")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("concurrency")
                        .short('c')
                        .long("concurrency")
                        .value_name("N")
                        .help("Probes in flight at once [default: 16]")
                        .value_parser(value_parser!(usize)),
                )
                .arg(files_arg()),
        )
        .subcommand(Command::new("examples").about("Show usage for every registered protocol"))
}

fn files(matches: &ArgMatches) -> Vec<String> {
    matches
        .get_many::<String>("files")
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}

/// Layered settings; a broken config file is reported on stderr, not just the log
fn load_settings(overrides: SettingsOverrides) -> Settings {
    let (settings, problem) = Settings::load_from_env();
    if let Some(e) = problem {
        eprintln!("{} {}; using built-in defaults", "[!]".bright_yellow(), e);
    }
    settings.apply(overrides)
}

fn enqueue_overrides(matches: &ArgMatches) -> SettingsOverrides {
    SettingsOverrides {
        redis_host: matches.get_one::<String>("redis-host").cloned(),
        redis_socket: matches.get_one::<String>("redis-socket").cloned(),
        redis_password: matches.get_one::<String>("redis-pass").cloned(),
        redis_db: matches.get_one::<i64>("redis-db").copied(),
        redis_timeout: matches.get_one::<std::time::Duration>("redis-timeout").copied(),
        ..SettingsOverrides::default()
    }
}

fn local_overrides(matches: &ArgMatches) -> SettingsOverrides {
    SettingsOverrides {
        timeout: matches.get_one::<std::time::Duration>("timeout").copied(),
        ipv4: matches.get_flag("no-ipv4").then_some(false),
        ipv6: matches.get_flag("no-ipv6").then_some(false),
        ..SettingsOverrides::default()
    }
}

async fn run_enqueue(matches: &ArgMatches) -> anyhow::Result<bool> {
    let settings = load_settings(enqueue_overrides(matches));

    let queue = RedisQueue::connect(&settings)
        .await
        .context("cannot reach the job queue")?;

    let mut enqueuer = Enqueuer::new(queue);
    let report = enqueuer
        .run(&files(matches))
        .await
        .context("job queue did not answer ping")?;

    for file in &report.files {
        match &file.error {
            None => println!(
                "{} {}: {} job(s) queued",
                "[✓]".bright_green(),
                file.path.bright_cyan(),
                file.pushed
            ),
            Some(error) => eprintln!(
                "{} {}: {} ({} job(s) queued before the failure)",
                "[!]".bright_red(),
                file.path.bright_yellow(),
                error,
                file.pushed
            ),
        }
    }

    Ok(report.succeeded())
}

async fn run_local(matches: &ArgMatches) -> bool {
    let settings = load_settings(local_overrides(matches));
    let concurrency = matches
        .get_one::<usize>("concurrency")
        .copied()
        .unwrap_or(DEFAULT_CONCURRENCY);

    let parser = TestParser::new();
    let mut tests = Vec::new();
    let mut parsed_cleanly = true;

    for path in files(matches) {
        let reader = match open_source(&path) {
            Ok(reader) => reader,
            Err(e) => {
                parsed_cleanly = false;
                eprintln!("{} {}", "[!]".bright_red(), e);
                continue;
            }
        };
        for result in parser.tests(reader, &path) {
            match result {
                Ok(test) => tests.push(test),
                Err(e) => {
                    parsed_cleanly = false;
                    eprintln!("{} {}: {}", "[!]".bright_red(), path.bright_yellow(), e);
                }
            }
        }
        if path == STDIN_PATH {
            break;
        }
    }

    if tests.is_empty() {
        println!("{} No tests to run", "[~]".bright_yellow());
        return parsed_cleanly;
    }

    let summary = LocalRunner::new(settings)
        .with_concurrency(concurrency)
        .run(tests)
        .await;

    for outcome in &summary.outcomes {
        match &outcome.error {
            None => println!(
                "{} {} [{}] in {:?}",
                "[✓]".bright_green(),
                outcome.input,
                outcome.address.bright_cyan(),
                outcome.duration
            ),
            Some(error) => println!(
                "{} {} [{}]: {}",
                "[!]".bright_red(),
                outcome.input,
                outcome.address.bright_yellow(),
                error
            ),
        }
    }
    println!(
        "{} {} passed, {} failed",
        "[~]".bright_blue(),
        summary.passed().to_string().bright_green(),
        summary.failed().to_string().bright_red()
    );

    parsed_cleanly && summary.succeeded()
}

fn show_examples() {
    for name in core::list_probes() {
        if let Some(probe) = core::lookup(&name) {
            println!("{}", name.bright_cyan().bold());
            println!("{}", probe.example());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = build_cli().get_matches();

    let ok = match matches.subcommand() {
        Some(("enqueue", sub)) => run_enqueue(sub).await?,
        Some(("local", sub)) => run_local(sub).await,
        Some(("examples", _)) => {
            show_examples();
            true
        }
        _ => unreachable!("a subcommand is required"),
    };

    if !ok {
        process::exit(1);
    }
    Ok(())
}
