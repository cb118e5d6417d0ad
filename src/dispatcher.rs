//! Inference dispatcher
//!
//! Scores a stream of independent units on a bounded `rayon` pool. Units are
//! pulled from the source iterator on the calling thread, so decoding stays
//! sequential, while scoring runs on the pool. Results are collected as they
//! complete; their order is unspecified and callers re-key by position.
//!
//! Every submitted unit produces exactly one [`UnitOutcome`]. A scorer that
//! returns an error or panics yields `Failed` for that unit only.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use tracing::{debug, instrument, trace, warn};

use crate::common::{Result, ScanError};

/// Shared flag used to abort a run
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Score attached to the unit it was computed from
#[derive(Debug, Clone)]
pub struct ScoredUnit<P> {
    pub position: u64,
    pub score: f32,
    pub payload: P,
}

/// Result of scoring one unit
#[derive(Debug, Clone)]
pub enum UnitOutcome<P> {
    Scored(ScoredUnit<P>),
    /// The unit was scored but produced nothing to rank (e.g. no face)
    NoScore { position: u64 },
    Failed { position: u64, reason: String },
}

impl<P> UnitOutcome<P> {
    pub fn position(&self) -> u64 {
        match self {
            UnitOutcome::Scored(unit) => unit.position,
            UnitOutcome::NoScore { position } | UnitOutcome::Failed { position, .. } => *position,
        }
    }
}

/// Everything a dispatch produced
#[derive(Debug)]
pub struct DispatchReport<P> {
    /// One outcome per unit that ran, in completion order
    pub outcomes: Vec<UnitOutcome<P>>,
    /// False if the run was cancelled before all units were scored
    pub complete: bool,
    /// Error raised by the unit source, if it stopped early
    pub source_error: Option<ScanError>,
    pub submitted: usize,
}

impl<P> DispatchReport<P> {
    pub fn scored(&self) -> impl Iterator<Item = &ScoredUnit<P>> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            UnitOutcome::Scored(unit) => Some(unit),
            _ => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = (u64, &str)> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            UnitOutcome::Failed { position, reason } => Some((*position, reason.as_str())),
            _ => None,
        })
    }

    /// Split off the scored units, dropping the other outcomes
    pub fn into_scored(self) -> Vec<ScoredUnit<P>> {
        self.outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                UnitOutcome::Scored(unit) => Some(unit),
                _ => None,
            })
            .collect()
    }
}

/// Bounded worker pool for scoring
pub struct Dispatcher {
    pool: rayon::ThreadPool,
    workers: usize,
    max_in_flight: usize,
}

impl Dispatcher {
    /// Build a dispatcher with `workers` threads
    ///
    /// At most `max_in_flight` units are submitted but unfinished at any
    /// time, which bounds the frames held in memory while decoding outpaces
    /// scoring.
    #[instrument]
    pub fn new(workers: usize, max_in_flight: usize) -> Result<Self> {
        if workers == 0 {
            return Err(ScanError::config_error("dispatcher needs at least one worker"));
        }
        if max_in_flight == 0 {
            return Err(ScanError::config_error("max_in_flight must be at least 1"));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("videoscan-worker-{}", i))
            .build()
            .map_err(|e| ScanError::config_error(format!("failed to build worker pool: {}", e)))?;

        debug!("Created dispatcher with {} workers, {} in flight", workers, max_in_flight);

        Ok(Self {
            pool,
            workers,
            max_in_flight,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Score every unit of `units`
    ///
    /// * `position_of` - position recorded on failures of a unit
    /// * `score` - scoring function; `Ok(None)` means nothing to rank
    /// * `serial` - run one unit at a time (backend not safe for concurrency)
    ///
    /// An `Err` from the unit iterator stops submission; units already
    /// submitted still complete and the error is returned in the report.
    #[instrument(skip_all, fields(workers = self.workers))]
    pub fn dispatch<U, P, I, K, F>(
        &self,
        units: I,
        position_of: K,
        score: F,
        serial: bool,
        cancel: &CancelToken,
    ) -> DispatchReport<P>
    where
        U: Send,
        P: Send,
        I: IntoIterator<Item = Result<U>>,
        K: Fn(&U) -> u64,
        F: Fn(&U) -> Result<Option<ScoredUnit<P>>> + Sync,
    {
        let limit = if serial { 1 } else { self.max_in_flight };
        // `None` marks a unit abandoned after cancellation
        let (tx, rx) = mpsc::channel::<Option<UnitOutcome<P>>>();

        let mut outcomes = Vec::new();
        let mut source_error = None;
        let mut submitted = 0usize;
        let mut abandoned = 0usize;
        let mut in_flight = 0usize;
        let score = &score;

        self.pool.in_place_scope(|scope| {
            for unit in units {
                if cancel.is_cancelled() {
                    warn!("Cancellation requested, stopping submission after {} units", submitted);
                    break;
                }

                let unit = match unit {
                    Ok(unit) => unit,
                    Err(e) => {
                        warn!("Unit source failed after {} units: {}", submitted, e);
                        source_error = Some(e);
                        break;
                    }
                };

                // Collect as completed until a slot frees up
                while in_flight >= limit {
                    let Ok(message) = rx.recv() else { break };
                    in_flight -= 1;
                    match message {
                        Some(outcome) => outcomes.push(outcome),
                        None => abandoned += 1,
                    }
                }

                let position = position_of(&unit);
                let tx = tx.clone();
                let cancel = cancel.clone();
                submitted += 1;
                in_flight += 1;

                scope.spawn(move |_| {
                    let message = if cancel.is_cancelled() {
                        None
                    } else {
                        Some(run_scorer(score, &unit, position))
                    };
                    let _ = tx.send(message);
                });
            }
        });
        drop(tx);

        for message in rx.try_iter() {
            match message {
                Some(outcome) => outcomes.push(outcome),
                None => abandoned += 1,
            }
        }

        let cancelled = cancel.is_cancelled();
        if abandoned > 0 {
            warn!("{} submitted units were abandoned", abandoned);
        }

        debug!(
            "Dispatch finished: {} submitted, {} outcomes, cancelled={}",
            submitted,
            outcomes.len(),
            cancelled
        );

        DispatchReport {
            outcomes,
            complete: !cancelled && abandoned == 0,
            source_error,
            submitted,
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.workers)
            .field("max_in_flight", &self.max_in_flight)
            .finish()
    }
}

fn run_scorer<U, P, F>(score: &F, unit: &U, position: u64) -> UnitOutcome<P>
where
    F: Fn(&U) -> Result<Option<ScoredUnit<P>>>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| score(unit))) {
        Ok(Ok(Some(scored))) => {
            trace!("Unit {} scored {:.4}", scored.position, scored.score);
            UnitOutcome::Scored(scored)
        }
        Ok(Ok(None)) => UnitOutcome::NoScore { position },
        Ok(Err(e)) => {
            warn!("Scoring failed for unit {}: {}", position, e);
            UnitOutcome::Failed {
                position,
                reason: e.to_string(),
            }
        }
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "scorer panicked".to_string());
            warn!("Scorer panicked on unit {}: {}", position, reason);
            UnitOutcome::Failed { position, reason }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn units(n: u64) -> impl Iterator<Item = Result<u64>> {
        (0..n).map(Ok)
    }

    fn score_as_fraction(unit: &u64) -> Result<Option<ScoredUnit<()>>> {
        Ok(Some(ScoredUnit {
            position: *unit,
            score: *unit as f32 / 100.0,
            payload: (),
        }))
    }

    #[test]
    fn test_every_unit_scored_once() {
        let dispatcher = Dispatcher::new(4, 8).unwrap();
        let report = dispatcher.dispatch(units(50), |u| *u, score_as_fraction, false, &CancelToken::new());

        assert!(report.complete);
        assert_eq!(report.submitted, 50);
        assert_eq!(report.outcomes.len(), 50);

        let positions: BTreeSet<u64> = report.scored().map(|u| u.position).collect();
        assert_eq!(positions, (0..50).collect());
    }

    #[test]
    fn test_failure_does_not_abort_siblings() {
        let dispatcher = Dispatcher::new(3, 3).unwrap();
        let report = dispatcher.dispatch(
            units(10),
            |u| *u,
            |u: &u64| {
                if *u == 4 {
                    return Err(ScanError::scoring_error(*u, "malformed tensor"));
                }
                score_as_fraction(u)
            },
            false,
            &CancelToken::new(),
        );

        assert!(report.complete);
        assert_eq!(report.scored().count(), 9);
        let failures: Vec<(u64, &str)> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, 4);
        assert!(failures[0].1.contains("malformed tensor"));
    }

    #[test]
    fn test_panicking_scorer_is_contained() {
        let dispatcher = Dispatcher::new(2, 4).unwrap();
        let report = dispatcher.dispatch(
            units(6),
            |u| *u,
            |u: &u64| {
                if *u == 2 {
                    panic!("bad unit");
                }
                score_as_fraction(u)
            },
            false,
            &CancelToken::new(),
        );

        assert_eq!(report.outcomes.len(), 6);
        let failures: Vec<(u64, &str)> = report.failures().collect();
        assert_eq!(failures, vec![(2, "bad unit")]);
    }

    #[test]
    fn test_no_score_outcome() {
        let dispatcher = Dispatcher::new(2, 2).unwrap();
        let report = dispatcher.dispatch(
            units(4),
            |u| *u,
            |u: &u64| if u % 2 == 0 { Ok(None) } else { score_as_fraction(u) },
            false,
            &CancelToken::new(),
        );

        assert_eq!(report.scored().count(), 2);
        let no_score = report
            .outcomes
            .iter()
            .filter(|o| matches!(o, UnitOutcome::NoScore { .. }))
            .count();
        assert_eq!(no_score, 2);
    }

    #[test]
    fn test_source_error_stops_submission() {
        let dispatcher = Dispatcher::new(2, 2).unwrap();
        let source = (0..10u64).map(|i| {
            if i == 5 {
                Err(ScanError::decode_error("v.mp4", i, "truncated"))
            } else {
                Ok(i)
            }
        });

        let report = dispatcher.dispatch(source, |u| *u, score_as_fraction, false, &CancelToken::new());

        assert_eq!(report.submitted, 5);
        assert_eq!(report.scored().count(), 5);
        assert!(matches!(report.source_error, Some(ScanError::DecodeFailed { frame: 5, .. })));
    }

    #[test]
    fn test_in_flight_bound_respected() {
        let dispatcher = Dispatcher::new(4, 2).unwrap();
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let report = dispatcher.dispatch(
            units(20),
            |u| *u,
            |u: &u64| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(2));
                active.fetch_sub(1, Ordering::SeqCst);
                score_as_fraction(u)
            },
            false,
            &CancelToken::new(),
        );

        assert_eq!(report.outcomes.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_serial_dispatch_runs_one_at_a_time() {
        let dispatcher = Dispatcher::new(4, 8).unwrap();
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        dispatcher.dispatch(
            units(10),
            |u| *u,
            |u: &u64| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(1));
                active.fetch_sub(1, Ordering::SeqCst);
                score_as_fraction(u)
            },
            true,
            &CancelToken::new(),
        );

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancellation_marks_incomplete() {
        let dispatcher = Dispatcher::new(2, 2).unwrap();
        let cancel = CancelToken::new();
        let trigger = cancel.clone();

        let source = (0..100u64).map(move |i| {
            if i == 10 {
                trigger.cancel();
            }
            Ok(i)
        });

        let report = dispatcher.dispatch(source, |u| *u, score_as_fraction, false, &cancel);

        assert!(!report.complete);
        assert!(report.submitted <= 10);
        assert!(report.outcomes.len() <= report.submitted);
    }

    #[test]
    fn test_invalid_dispatcher() {
        assert!(Dispatcher::new(0, 1).is_err());
        assert!(Dispatcher::new(1, 0).is_err());
    }
}
