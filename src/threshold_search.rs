//! Search for the largest threshold whose reduced model stays within the
//! error bound.

use crate::retained::RetainedSpecies;
use crate::{ReduceError, ReduceResult};
use tracing::{debug, info, warn};

/// Anything that can reduce the model at a threshold, usually the
/// [`ReducersManager`](crate::reducers::ReducersManager).
pub trait ReductionBackend {
    fn n_species(&self) -> usize;

    fn reduce(&mut self, threshold: f64) -> ReduceResult<RetainedSpecies>;
}

/// Scores a retained-species set; lower is better.
pub trait ErrorEvaluator {
    fn evaluate(&mut self, retained: &RetainedSpecies) -> ReduceResult<f64>;
}

impl<F> ErrorEvaluator for F
where
    F: FnMut(&RetainedSpecies) -> ReduceResult<f64>,
{
    fn evaluate(&mut self, retained: &RetainedSpecies) -> ReduceResult<f64> {
        self(retained)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchSettings {
    pub initial_threshold: f64,
    /// The initial threshold came from the user and must not be adjusted.
    pub pinned: bool,
    /// Ascent step; the accepted initial threshold when absent.
    pub increment: Option<f64>,
    pub multiplier: f64,
    pub attempts: usize,
    /// Error bound as a fraction.
    pub max_error: f64,
    pub max_ascent_steps: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            initial_threshold: 0.01,
            pinned: false,
            increment: None,
            multiplier: 0.01,
            attempts: 3,
            max_error: 0.05,
            max_ascent_steps: 1000,
        }
    }
}

impl SearchSettings {
    pub fn validate(&self) -> ReduceResult<()> {
        let positive = |name: &str, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(ReduceError::Config(format!("{} must be positive, got {}", name, value)))
            }
        };
        positive("initial threshold", self.initial_threshold)?;
        positive("auto retrieving multiplier", self.multiplier)?;
        if let Some(increment) = self.increment {
            positive("threshold increment", increment)?;
        }
        if !(self.max_error.is_finite() && self.max_error >= 0.0) {
            return Err(ReduceError::Config(format!("Invalid max error {}", self.max_error)));
        }
        if self.attempts == 0 {
            return Err(ReduceError::Config("At least one auto retrieving attempt is required".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialOutcome {
    Accepted,
    /// Retained nothing or everything; not evaluated.
    Degenerate,
    Rejected,
    /// Same species count as the last accepted trial; not evaluated.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    pub threshold: f64,
    pub retained_count: usize,
    pub error: Option<f64>,
    pub outcome: TrialOutcome,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub threshold: f64,
    pub retained: RetainedSpecies,
    pub error: f64,
    pub trials: Vec<Trial>,
}

struct Accepted {
    threshold: f64,
    retained: RetainedSpecies,
    error: f64,
}

pub struct ThresholdSearch<'a, B: ?Sized, E: ?Sized> {
    backend: &'a mut B,
    evaluator: &'a mut E,
    settings: SearchSettings,
    trials: Vec<Trial>,
}

impl<'a, B, E> ThresholdSearch<'a, B, E>
where
    B: ReductionBackend + ?Sized,
    E: ErrorEvaluator + ?Sized,
{
    pub fn new(backend: &'a mut B, evaluator: &'a mut E, settings: SearchSettings) -> Self {
        Self { backend, evaluator, settings, trials: Vec::new() }
    }

    pub fn run(mut self) -> ReduceResult<SearchOutcome> {
        self.settings.validate()?;
        let start = if self.settings.pinned {
            self.validate_pinned()?
        } else {
            info!("Start auto retrieving initial threshold");
            let accepted = self.discover()?;
            info!("Use {} as initial threshold", accepted.threshold);
            accepted
        };
        let last = self.ascend(start)?;
        info!(
            "Use model with {} species at threshold {} as result",
            last.retained.len(),
            last.threshold
        );
        Ok(SearchOutcome {
            threshold: last.threshold,
            retained: last.retained,
            error: last.error,
            trials: self.trials,
        })
    }

    fn reduce(&mut self, threshold: f64) -> ReduceResult<RetainedSpecies> {
        info!("Reduce model with threshold: {}", threshold);
        let retained = self.backend.reduce(threshold)?;
        info!("Model reduced with {} species and threshold {}", retained.len(), threshold);
        Ok(retained)
    }

    fn record(&mut self, threshold: f64, retained: &RetainedSpecies, error: Option<f64>, outcome: TrialOutcome) {
        self.trials.push(Trial { threshold, retained_count: retained.len(), error, outcome });
    }

    fn discover(&mut self) -> ReduceResult<Accepted> {
        let base = self.settings.initial_threshold;
        for k in 0..self.settings.attempts {
            let threshold = base * self.settings.multiplier.powi(k as i32);
            debug!("Attempt {} as initial threshold", threshold);
            let retained = self.reduce(threshold)?;
            if retained.is_empty() || retained.is_all() {
                debug!("Threshold {} retains {} species, skipping", threshold, retained.len());
                self.record(threshold, &retained, None, TrialOutcome::Degenerate);
                continue;
            }
            let error = self.evaluator.evaluate(&retained)?;
            if error < self.settings.max_error {
                self.record(threshold, &retained, Some(error), TrialOutcome::Accepted);
                return Ok(Accepted { threshold, retained, error });
            }
            debug!("Threshold {} gives error {}", threshold, error);
            self.record(threshold, &retained, Some(error), TrialOutcome::Rejected);
        }
        Err(ReduceError::AutoThresholdExhausted { attempts: self.settings.attempts })
    }

    fn validate_pinned(&mut self) -> ReduceResult<Accepted> {
        let threshold = self.settings.initial_threshold;
        let retained = self.reduce(threshold)?;
        let error = self.evaluator.evaluate(&retained)?;
        if error > self.settings.max_error {
            self.record(threshold, &retained, Some(error), TrialOutcome::Rejected);
            return Err(ReduceError::InvalidPinnedThreshold {
                threshold,
                error,
                max_error: self.settings.max_error,
            });
        }
        self.record(threshold, &retained, Some(error), TrialOutcome::Accepted);
        Ok(Accepted { threshold, retained, error })
    }

    fn ascend(&mut self, start: Accepted) -> ReduceResult<Accepted> {
        let step = self.settings.increment.unwrap_or(start.threshold);
        let mut accepted = start;
        let mut threshold = accepted.threshold;
        for _ in 0..self.settings.max_ascent_steps {
            threshold += step;
            let retained = self.reduce(threshold)?;
            if retained.len() == accepted.retained.len() {
                self.record(threshold, &retained, None, TrialOutcome::Unchanged);
                continue;
            }
            let error = self.evaluator.evaluate(&retained)?;
            if error > self.settings.max_error {
                info!(
                    "Reduced model with {} species gives too large error {}",
                    retained.len(),
                    error
                );
                self.record(threshold, &retained, Some(error), TrialOutcome::Rejected);
                return Ok(accepted);
            }
            self.record(threshold, &retained, Some(error), TrialOutcome::Accepted);
            accepted = Accepted { threshold, retained, error };
        }
        warn!(
            "Error bound never exceeded in {} ascent steps, stopping at threshold {}",
            self.settings.max_ascent_steps, accepted.threshold
        );
        Ok(accepted)
    }
}
