//! Enqueue pipeline
//!
//! Parses test-definition files and appends each test's original line to the
//! job queue, one synchronous push per test, in file order.

use log::{error, info, warn};
use std::io::BufRead;

use crate::error::{ParseError, QueueError};
use crate::parser::{open_source, TestParser, STDIN_PATH};
use crate::queue::JobQueue;

/// Outcome of enqueueing one source
#[derive(Debug)]
pub struct FileReport {
    pub path: String,
    /// Jobs pushed before the source finished or failed
    pub pushed: usize,
    pub error: Option<String>,
}

impl FileReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of a whole enqueue run
#[derive(Debug, Default)]
pub struct EnqueueReport {
    pub files: Vec<FileReport>,
}

impl EnqueueReport {
    pub fn succeeded(&self) -> bool {
        self.files.iter().all(FileReport::succeeded)
    }

    pub fn total_pushed(&self) -> usize {
        self.files.iter().map(|f| f.pushed).sum()
    }
}

/// Why a single source stopped early
#[derive(Debug, thiserror::Error)]
enum SourceError {
    #[error("Error parsing file: {0}")]
    Parse(#[from] ParseError),

    #[error("Error queueing job: {0}")]
    Queue(#[from] QueueError),
}

/// Feeds parsed tests into a job queue
pub struct Enqueuer<Q: JobQueue> {
    queue: Q,
    parser: TestParser,
}

impl<Q: JobQueue> Enqueuer<Q> {
    pub fn new(queue: Q) -> Self {
        Self {
            queue,
            parser: TestParser::new(),
        }
    }

    /// Give back the queue, e.g. to inspect it in tests
    pub fn into_queue(self) -> Q {
        self.queue
    }

    /// Ping the queue, then enqueue every path in order
    ///
    /// A failed ping is returned before any file is opened. After that each
    /// file stands alone: a failure stops that file only, and jobs already
    /// pushed stay queued. Standard input (`-`) ends the argument list.
    pub async fn run(&mut self, paths: &[String]) -> Result<EnqueueReport, QueueError> {
        self.queue.ping().await?;

        let mut report = EnqueueReport::default();
        for path in paths {
            let file_report = self.enqueue_path(path).await;
            report.files.push(file_report);

            if path == STDIN_PATH {
                break;
            }
        }

        info!(
            "Enqueued {} job(s) from {} source(s)",
            report.total_pushed(),
            report.files.len()
        );
        Ok(report)
    }

    /// Enqueue every test from one file, or from standard input for `-`
    pub async fn enqueue_path(&mut self, path: &str) -> FileReport {
        match open_source(path) {
            Ok(reader) => self.enqueue_reader(reader, path).await,
            Err(e) => {
                error!("{}", e);
                FileReport {
                    path: path.to_string(),
                    pushed: 0,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Enqueue every test from a reader until the first failure
    pub async fn enqueue_reader<R: BufRead + Send>(&mut self, reader: R, name: &str) -> FileReport {
        let mut pushed = 0;
        let result = self.push_all(reader, name, &mut pushed).await;

        if let Err(e) = &result {
            error!("{}: {}", name, e);
            if pushed > 0 {
                warn!("{} job(s) from {} were queued before the failure", pushed, name);
            }
        } else {
            info!("Enqueued {} job(s) from {}", pushed, name);
        }

        FileReport {
            path: name.to_string(),
            pushed,
            error: result.err().map(|e| e.to_string()),
        }
    }

    async fn push_all<R: BufRead + Send>(&mut self, reader: R, name: &str, pushed: &mut usize) -> Result<(), SourceError> {
        for test in self.parser.tests(reader, name) {
            let test = test?;
            self.queue.push(&test.input).await?;
            *pushed += 1;
        }
        Ok(())
    }
}
