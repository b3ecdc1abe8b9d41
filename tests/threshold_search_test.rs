use kinreduce::threshold_search::{
    ReductionBackend, SearchSettings, ThresholdSearch, TrialOutcome,
};
use kinreduce::{ReduceError, ReduceResult, RetainedSpecies};

const N_SPECIES: usize = 20;

/// Scripted backend: the retained count for a threshold comes from `count`.
struct Scripted<F: Fn(f64) -> usize> {
    count: F,
    calls: Vec<f64>,
}

impl<F: Fn(f64) -> usize> Scripted<F> {
    fn new(count: F) -> Self {
        Self { count, calls: Vec::new() }
    }
}

impl<F: Fn(f64) -> usize> ReductionBackend for Scripted<F> {
    fn n_species(&self) -> usize {
        N_SPECIES
    }

    fn reduce(&mut self, threshold: f64) -> ReduceResult<RetainedSpecies> {
        self.calls.push(threshold);
        RetainedSpecies::from_indices(N_SPECIES, 0..(self.count)(threshold))
    }
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-12 * a.abs().max(b.abs())
}

/// Error is the fraction of species dropped.
fn dropped_fraction(retained: &RetainedSpecies) -> ReduceResult<f64> {
    Ok((N_SPECIES - retained.len()) as f64 / N_SPECIES as f64)
}

#[test]
fn test_auto_discovery_backs_off_geometrically() {
    // 0.01 and 0.001 drop too much, 0.0001 keeps everything but one.
    let mut backend = Scripted::new(|t| if t > 5e-4 { 10 } else { 19 });
    let mut evaluator = dropped_fraction;
    let settings = SearchSettings {
        initial_threshold: 0.01,
        multiplier: 0.1,
        attempts: 3,
        max_error: 0.1,
        increment: Some(1.0),
        ..SearchSettings::default()
    };

    let outcome = ThresholdSearch::new(&mut backend, &mut evaluator, settings).run().unwrap();
    assert!(close(outcome.threshold, 0.0001));
    assert_eq!(outcome.retained.len(), 19);
    assert!(close(backend.calls[0], 0.01));
    assert!(close(backend.calls[1], 0.001));
    assert!(close(backend.calls[2], 0.0001));
    assert_eq!(outcome.trials[0].outcome, TrialOutcome::Rejected);
    assert_eq!(outcome.trials[2].outcome, TrialOutcome::Accepted);
}

#[test]
fn test_degenerate_trials_are_not_evaluated() {
    let mut backend = Scripted::new(|t| if t > 0.5 { 0 } else if t > 0.05 { N_SPECIES } else { 15 });
    let mut evaluations = 0;
    let mut evaluator = |retained: &RetainedSpecies| -> ReduceResult<f64> {
        evaluations += 1;
        assert!(!retained.is_empty() && !retained.is_all());
        Ok(0.0)
    };
    let settings = SearchSettings {
        initial_threshold: 1.0,
        multiplier: 0.1,
        attempts: 3,
        max_error: 0.5,
        max_ascent_steps: 0,
        ..SearchSettings::default()
    };

    let outcome = ThresholdSearch::new(&mut backend, &mut evaluator, settings).run().unwrap();
    assert!(close(outcome.threshold, 0.01));
    let outcomes: Vec<_> = outcome.trials.iter().map(|t| t.outcome).collect();
    assert_eq!(
        outcomes,
        vec![TrialOutcome::Degenerate, TrialOutcome::Degenerate, TrialOutcome::Accepted]
    );
    assert_eq!(evaluations, 1);
}

#[test]
fn test_auto_discovery_exhausted() {
    let mut backend = Scripted::new(|_| 5);
    let mut evaluator = dropped_fraction;
    let settings = SearchSettings { attempts: 4, max_error: 0.1, ..SearchSettings::default() };

    let err = ThresholdSearch::new(&mut backend, &mut evaluator, settings).run().unwrap_err();
    assert!(matches!(err, ReduceError::AutoThresholdExhausted { attempts: 4 }));
    assert_eq!(backend.calls.len(), 4);
}

#[test]
fn test_pinned_threshold_is_never_adjusted() {
    let mut backend = Scripted::new(|_| 10);
    let mut evaluator = dropped_fraction;
    let settings = SearchSettings {
        initial_threshold: 0.3,
        pinned: true,
        max_error: 0.2,
        ..SearchSettings::default()
    };

    let err = ThresholdSearch::new(&mut backend, &mut evaluator, settings).run().unwrap_err();
    match err {
        ReduceError::InvalidPinnedThreshold { threshold, error, max_error } => {
            assert_eq!(threshold, 0.3);
            assert_eq!(error, 0.5);
            assert_eq!(max_error, 0.2);
        }
        other => panic!("unexpected error {}", other),
    }
    assert_eq!(backend.calls, vec![0.3]);
}

#[test]
fn test_ascent_skips_unchanged_trials_and_reports_last_passing() {
    // 0.1 -> 18, 0.2 -> 18 (skipped), 0.3 -> 17, 0.4 -> 14 (too much error).
    let mut backend = Scripted::new(|t| match (t * 10.0).round() as i64 {
        1 | 2 => 18,
        3 => 17,
        _ => 14,
    });
    let mut evaluations = Vec::new();
    let mut evaluator = |retained: &RetainedSpecies| -> ReduceResult<f64> {
        evaluations.push(retained.len());
        dropped_fraction(retained)
    };
    let settings = SearchSettings {
        initial_threshold: 0.1,
        pinned: true,
        max_error: 0.2,
        ..SearchSettings::default()
    };

    let outcome = ThresholdSearch::new(&mut backend, &mut evaluator, settings).run().unwrap();
    assert!(close(outcome.threshold, 0.3));
    assert_eq!(outcome.retained.len(), 17);
    assert!(close(outcome.error, 0.15));

    let outcomes: Vec<_> = outcome.trials.iter().map(|t| t.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            TrialOutcome::Accepted,
            TrialOutcome::Unchanged,
            TrialOutcome::Accepted,
            TrialOutcome::Rejected,
        ]
    );
    assert_eq!(evaluations, vec![18, 17, 14]);
}

#[test]
fn test_explicit_increment() {
    let mut backend = Scripted::new(|t| if t < 0.25 { 19 } else { 10 });
    let mut evaluator = dropped_fraction;
    let settings = SearchSettings {
        initial_threshold: 0.1,
        pinned: true,
        increment: Some(0.05),
        max_error: 0.1,
        ..SearchSettings::default()
    };

    let outcome = ThresholdSearch::new(&mut backend, &mut evaluator, settings).run().unwrap();
    assert!(close(backend.calls[1], 0.15));
    assert!(close(backend.calls[2], 0.2));
    assert!(close(outcome.threshold, 0.1));
}

#[test]
fn test_ascent_step_limit() {
    let mut backend = Scripted::new(|_| 19);
    let mut evaluator = dropped_fraction;
    let settings = SearchSettings {
        initial_threshold: 0.1,
        pinned: true,
        max_error: 0.1,
        max_ascent_steps: 5,
        ..SearchSettings::default()
    };

    let outcome = ThresholdSearch::new(&mut backend, &mut evaluator, settings).run().unwrap();
    assert_eq!(backend.calls.len(), 6);
    assert!(close(outcome.threshold, 0.1));
    assert!(outcome.trials[1..].iter().all(|t| t.outcome == TrialOutcome::Unchanged));
}
