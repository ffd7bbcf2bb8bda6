//! Timing counters for transfers and authorization calls.
//!
//! All statistics are owned by a single task. Callers hold a cloneable
//! [`PerformanceHandle`] and talk to it over channels, so nothing here is
//! ever locked.

use std::{
    collections::BTreeMap,
    fmt::Write as _,
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::debug;

/// Which counter a job is reported against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReporterId {
    Upload,
    Download,
    DrainTo,
    DrainFrom,
    AacCheckAccess,
    AacGetSnippets,
    AacFlatten,
}

impl ReporterId {
    pub const ALL: [ReporterId; 7] = [
        ReporterId::Upload,
        ReporterId::Download,
        ReporterId::DrainTo,
        ReporterId::DrainFrom,
        ReporterId::AacCheckAccess,
        ReporterId::AacGetSnippets,
        ReporterId::AacFlatten,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ReporterId::Upload => "upload",
            ReporterId::Download => "download",
            ReporterId::DrainTo => "drain_to_blobstore",
            ReporterId::DrainFrom => "drain_from_blobstore",
            ReporterId::AacCheckAccess => "aac_check_access",
            ReporterId::AacGetSnippets => "aac_get_snippets",
            ReporterId::AacFlatten => "aac_flatten",
        }
    }
}

/// Accumulated statistics for one reporter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReporterStats {
    pub completed: u64,
    pub failed: u64,
    pub in_flight: u64,
    pub bytes: u64,
    pub busy: Duration,
    pub longest: Duration,
}

impl ReporterStats {
    /// Bytes per second over time spent in completed jobs.
    pub fn throughput(&self) -> f64 {
        let secs = self.busy.as_secs_f64();
        if secs > 0.0 { self.bytes as f64 / secs } else { 0.0 }
    }

    pub fn mean(&self) -> Duration {
        let jobs = self.completed + self.failed;
        if jobs == 0 {
            Duration::ZERO
        } else {
            self.busy / jobs as u32
        }
    }
}

/// Snapshot of every reporter.
#[derive(Debug, Clone, Default)]
pub struct PerformanceReport {
    pub reporters: BTreeMap<ReporterId, ReporterStats>,
}

impl PerformanceReport {
    pub fn get(&self, id: ReporterId) -> ReporterStats {
        self.reporters.get(&id).cloned().unwrap_or_default()
    }

    pub fn render(&self) -> String {
        let mut out = String::from("reporter\tcompleted\tfailed\tin_flight\tbytes\tmean_ms\tmax_ms\tbytes_per_sec\n");
        for id in ReporterId::ALL {
            let s = self.get(id);
            let _ = writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{:.0}",
                id.name(),
                s.completed,
                s.failed,
                s.in_flight,
                s.bytes,
                s.mean().as_millis(),
                s.longest.as_millis(),
                s.throughput()
            );
        }
        out
    }
}

#[derive(Debug)]
enum PerfCommand {
    Begin {
        id: ReporterId,
    },
    End {
        id: ReporterId,
        elapsed: Duration,
        bytes: u64,
        ok: bool,
    },
    Report {
        respond_to: oneshot::Sender<PerformanceReport>,
    },
}

/// Cloneable sender side of the counters task.
#[derive(Debug, Clone)]
pub struct PerformanceHandle {
    tx: mpsc::UnboundedSender<PerfCommand>,
}

impl PerformanceHandle {
    /// Start the counters task.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx));
        (Self { tx }, task)
    }

    /// Mark a job as started. The returned [`Job`] reports on drop if it
    /// is not finished explicitly.
    pub fn begin(&self, id: ReporterId) -> Job {
        let _ = self.tx.send(PerfCommand::Begin { id });
        Job {
            tx: self.tx.clone(),
            id,
            started: Instant::now(),
            done: false,
        }
    }

    /// Current statistics. Empty if the counters task has stopped.
    pub async fn report(&self) -> PerformanceReport {
        let (respond_to, rx) = oneshot::channel();
        if self.tx.send(PerfCommand::Report { respond_to }).is_err() {
            return PerformanceReport::default();
        }
        rx.await.unwrap_or_default()
    }
}

/// An in-flight timed job.
#[derive(Debug)]
pub struct Job {
    tx: mpsc::UnboundedSender<PerfCommand>,
    id: ReporterId,
    started: Instant,
    done: bool,
}

impl Job {
    pub fn finish(mut self, bytes: u64) {
        self.end(bytes, true);
    }

    pub fn fail(mut self) {
        self.end(0, false);
    }

    fn end(&mut self, bytes: u64, ok: bool) {
        if self.done {
            return;
        }
        self.done = true;
        let _ = self.tx.send(PerfCommand::End {
            id: self.id,
            elapsed: self.started.elapsed(),
            bytes,
            ok,
        });
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        self.end(0, false);
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<PerfCommand>) {
    let mut stats: BTreeMap<ReporterId, ReporterStats> = BTreeMap::new();
    while let Some(cmd) = rx.recv().await {
        match cmd {
            PerfCommand::Begin { id } => {
                stats.entry(id).or_default().in_flight += 1;
            }
            PerfCommand::End {
                id,
                elapsed,
                bytes,
                ok,
            } => {
                let s = stats.entry(id).or_default();
                s.in_flight = s.in_flight.saturating_sub(1);
                if ok {
                    s.completed += 1;
                } else {
                    s.failed += 1;
                }
                s.bytes += bytes;
                s.busy += elapsed;
                s.longest = s.longest.max(elapsed);
            }
            PerfCommand::Report { respond_to } => {
                let _ = respond_to.send(PerformanceReport {
                    reporters: stats.clone(),
                });
            }
        }
    }
    debug!("performance counters stopped");
}
