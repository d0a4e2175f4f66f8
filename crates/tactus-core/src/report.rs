//! Fault reporting from the realtime threads.
//!
//! Worker threads never return errors across the tic boundary. They post a
//! [`Fault`] to a bounded channel with `try_send` and carry on. The root drains
//! that channel once per tic in [`FaultAggregator::end_tic`], merging repeats of
//! the same fault into one [`FaultReport`]. A report is published when a tic
//! completes without the fault recurring, or on [`FaultAggregator::flush`].

use crate::compat::{Arc, HashMap};
use crate::lockfree::AtomicCounter;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// A tic finished after the next hardware pulse.
    Overrun,
    /// A recall gave up waiting on a dependency.
    DependencyStall,
    /// A blocking child was dispatched before finishing its previous tic.
    GateNotReady,
    /// A dependency instance could not be resolved for an invocation.
    ResolutionFailed,
    /// A node's work failed or panicked; the node is locked.
    FatalNode,
    /// A recall processor failed or panicked; the instance is quarantined.
    Processor,
}

impl FaultKind {
    pub fn is_fatal(self) -> bool {
        matches!(self, FaultKind::FatalNode | FaultKind::Processor)
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::Overrun => "overrun",
            FaultKind::DependencyStall => "dependency stall",
            FaultKind::GateNotReady => "gate not ready",
            FaultKind::ResolutionFailed => "dependency resolution",
            FaultKind::FatalNode => "fatal node error",
            FaultKind::Processor => "processor error",
        };
        f.write_str(name)
    }
}

/// One fault raised during a tic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub tic: u64,
    pub kind: FaultKind,
    /// Node or recall that raised it.
    pub source: String,
    pub message: String,
}

/// Aggregated view of one or more identical faults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultReport {
    pub kind: FaultKind,
    pub source: String,
    /// Message of the first occurrence.
    pub message: String,
    pub count: u64,
    pub first_tic: u64,
    pub last_tic: u64,
}

impl fmt::Display for FaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in '{}': {}", self.kind, self.source, self.message)?;
        if self.count > 1 {
            write!(
                f,
                " ({} times, tics {}..={})",
                self.count, self.first_tic, self.last_tic
            )?;
        }
        Ok(())
    }
}

/// Realtime side of the fault channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FaultSink {
    tx: Sender<Fault>,
    dropped: Arc<AtomicCounter>,
}

impl FaultSink {
    /// Posts a fault without blocking. Drops it if the channel is full.
    pub fn post(&self, fault: Fault) {
        match self.tx.try_send(fault) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.incr();
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn report(
        &self,
        tic: u64,
        kind: FaultKind,
        source: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.post(Fault {
            tic,
            kind,
            source: source.into(),
            message: message.into(),
        });
    }

    /// Faults lost because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.get()
    }
}

/// Creates a fault channel holding at most `capacity` undrained faults.
pub fn fault_channel(capacity: usize) -> (FaultSink, FaultAggregator) {
    let (tx, rx) = bounded(capacity);
    let (reports_tx, reports_rx) = unbounded();
    let dropped = Arc::new(AtomicCounter::default());

    let sink = FaultSink {
        tx,
        dropped: Arc::clone(&dropped),
    };
    let aggregator = FaultAggregator {
        rx,
        open: HashMap::new(),
        reports_tx,
        reports_rx,
        dropped,
        dropped_reported: 0,
    };
    (sink, aggregator)
}

/// Non-realtime side: merges faults and publishes reports.
#[derive(Debug)]
pub struct FaultAggregator {
    rx: Receiver<Fault>,
    open: HashMap<(FaultKind, String), FaultReport>,
    reports_tx: Sender<FaultReport>,
    reports_rx: Receiver<FaultReport>,
    dropped: Arc<AtomicCounter>,
    dropped_reported: u64,
}

impl FaultAggregator {
    /// Receiver of published reports. Every clone sees each report once.
    pub fn reports(&self) -> Receiver<FaultReport> {
        self.reports_rx.clone()
    }

    /// Drains faults posted so far and publishes reports whose fault did not
    /// recur during `tic`. Returns the number of reports published.
    pub fn end_tic(&mut self, tic: u64) -> usize {
        let mut seen = Vec::new();
        while let Ok(fault) = self.rx.try_recv() {
            let key = (fault.kind, fault.source.clone());
            seen.push(key.clone());
            self.open
                .entry(key)
                .and_modify(|report| {
                    report.count += 1;
                    report.first_tic = report.first_tic.min(fault.tic);
                    report.last_tic = report.last_tic.max(fault.tic);
                })
                .or_insert_with(|| FaultReport {
                    kind: fault.kind,
                    source: fault.source,
                    message: fault.message,
                    count: 1,
                    first_tic: fault.tic,
                    last_tic: fault.tic,
                });
        }

        let dropped = self.dropped.get();
        if dropped > self.dropped_reported {
            tracing::warn!(
                tic,
                dropped = dropped - self.dropped_reported,
                "Fault queue full, faults dropped"
            );
            self.dropped_reported = dropped;
        }

        let stale: Vec<_> = self
            .open
            .keys()
            .filter(|key| !seen.contains(key))
            .cloned()
            .collect();

        for key in &stale {
            if let Some(report) = self.open.remove(key) {
                self.publish(report);
            }
        }
        stale.len()
    }

    /// Drains the channel and publishes every open report.
    pub fn flush(&mut self) -> usize {
        self.end_tic(0);
        let open: Vec<_> = self.open.drain().map(|(_, report)| report).collect();
        let count = open.len();
        for report in open {
            self.publish(report);
        }
        count
    }

    fn publish(&self, report: FaultReport) {
        if report.kind.is_fatal() {
            tracing::error!(
                kind = %report.kind,
                source = %report.source,
                count = report.count,
                first_tic = report.first_tic,
                last_tic = report.last_tic,
                "{}",
                report.message
            );
        } else {
            tracing::warn!(
                kind = %report.kind,
                source = %report.source,
                count = report.count,
                first_tic = report.first_tic,
                last_tic = report.last_tic,
                "{}",
                report.message
            );
        }
        let _ = self.reports_tx.send(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_fault_published_after_quiet_tic() {
        let (sink, mut agg) = fault_channel(16);
        let reports = agg.reports();

        sink.report(1, FaultKind::FatalNode, "ch0", "boom");
        assert_eq!(agg.end_tic(1), 0);
        assert!(reports.try_recv().is_err());

        assert_eq!(agg.end_tic(2), 1);
        let report = reports.try_recv().unwrap();
        assert_eq!(report.count, 1);
        assert_eq!(report.first_tic, 1);
        assert_eq!(report.message, "boom");
    }

    #[test]
    fn test_repeats_are_merged() {
        let (sink, mut agg) = fault_channel(16);
        let reports = agg.reports();

        sink.report(4, FaultKind::Overrun, "root", "late");
        agg.end_tic(4);
        sink.report(5, FaultKind::Overrun, "root", "late");
        agg.end_tic(5);
        agg.end_tic(6);

        let report = reports.try_recv().unwrap();
        assert_eq!(report.count, 2);
        assert_eq!((report.first_tic, report.last_tic), (4, 5));
        assert!(reports.try_recv().is_err());
    }

    #[test]
    fn test_different_sources_stay_apart() {
        let (sink, mut agg) = fault_channel(16);
        let reports = agg.reports();

        sink.report(1, FaultKind::DependencyStall, "a", "stall");
        sink.report(1, FaultKind::DependencyStall, "b", "stall");
        assert_eq!(agg.flush(), 2);
        assert_eq!(reports.try_iter().count(), 2);
    }

    #[test]
    fn test_full_channel_drops() {
        let (sink, _agg) = fault_channel(1);
        sink.report(1, FaultKind::Processor, "x", "1");
        sink.report(1, FaultKind::Processor, "x", "2");
        assert_eq!(sink.dropped(), 1);
    }

    #[test]
    fn test_report_display() {
        let report = FaultReport {
            kind: FaultKind::Overrun,
            source: "root".into(),
            message: "late".into(),
            count: 2,
            first_tic: 3,
            last_tic: 4,
        };
        assert_eq!(
            report.to_string(),
            "overrun in 'root': late (2 times, tics 3..=4)"
        );
    }
}
