//! Sampling of simulation steps into the states the reducers work on, and the
//! ignition-delay error metric.

use crate::array_store::{ArrayReader, ArrayWriter, StoredArray, read_all};
use crate::chemistry::ThermoState;
use crate::{ReduceError, ReduceResult};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Temperature rise over the initial temperature that counts as ignition.
pub const IGNITION_TEMPERATURE_RISE: f64 = 400.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ignition {
    pub delay: f64,
    pub temperature: f64,
}

/// Append-only log of the steps of one autoignition simulation. Each step is
/// stored as two arrays: `[time, T, P]` followed by the composition.
pub struct StepLog {
    writer: ArrayWriter,
    condition: usize,
    initial_temperature: f64,
    max_temperature: Option<f64>,
    steps: usize,
    ignition: Option<Ignition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggedSteps {
    pub path: PathBuf,
    pub condition: usize,
    pub initial_temperature: f64,
    pub steps: usize,
    pub max_temperature: Option<f64>,
    pub ignition: Option<Ignition>,
}

impl StepLog {
    pub fn create(dir: &Path, condition: usize, initial_temperature: f64) -> ReduceResult<Self> {
        let writer = ArrayWriter::create_unique(dir, &format!("steps_cache_of_{}_ai_case_", condition))?;
        Ok(Self {
            writer,
            condition,
            initial_temperature,
            max_temperature: None,
            steps: 0,
            ignition: None,
        })
    }

    /// Log one step. Returns true on the step where ignition is first seen.
    pub fn record(&mut self, time: f64, temperature: f64, pressure: f64, composition: &[f64]) -> ReduceResult<bool> {
        self.writer.write(&StoredArray::from_f64(vec![time, temperature, pressure]))?;
        self.writer.write(&StoredArray::from_f64(composition.to_vec()))?;
        self.steps += 1;
        if self.max_temperature.is_none_or(|max| max < temperature) {
            self.max_temperature = Some(temperature);
        }
        if self.ignition.is_none() && temperature >= self.initial_temperature + IGNITION_TEMPERATURE_RISE {
            debug!("Ignition for {} case at t = {}", self.condition, time);
            self.ignition = Some(Ignition { delay: time, temperature });
            return Ok(true);
        }
        Ok(false)
    }

    pub fn ignition(&self) -> Option<Ignition> {
        self.ignition
    }

    pub fn finish(self) -> ReduceResult<LoggedSteps> {
        let (path, _) = self.writer.finish()?;
        Ok(LoggedSteps {
            path,
            condition: self.condition,
            initial_temperature: self.initial_temperature,
            steps: self.steps,
            max_temperature: self.max_temperature,
            ignition: self.ignition,
        })
    }
}

/// Pick states at evenly spaced temperature milestones between the initial
/// and the ignition temperature and write them as `[T, P, composition...]`
/// arrays to a new file in `dir`.
pub fn create_sample(log: &LoggedSteps, dir: &Path, sample_size: usize) -> ReduceResult<PathBuf> {
    if sample_size == 0 {
        return Err(ReduceError::Config("Steps sample size must be positive".to_string()));
    }
    let Some(ignition) = log.ignition else {
        let msg = format!("No auto ignition happened for {} case", log.condition);
        info!("{}", msg);
        return Err(ReduceError::Simulation(msg));
    };
    let delta = (ignition.temperature - log.initial_temperature) / sample_size as f64;

    let mut writer = ArrayWriter::create_unique(dir, &format!("steps_sample_of_{}_ai_case_", log.condition))?;
    let mut reader = ArrayReader::open(&log.path)?;
    let mut milestone = 0usize;
    for _ in 0..log.steps {
        let (Some(header), Some(composition)) = (reader.read_next()?, reader.read_next()?) else {
            return Err(ReduceError::Simulation(format!(
                "Steps log of {} case is truncated",
                log.condition
            )));
        };
        let &[_, temperature, pressure] = header.as_f64()? else {
            return Err(ReduceError::Simulation("Malformed step header".to_string()));
        };
        if temperature >= log.initial_temperature + milestone as f64 * delta {
            let state = ThermoState { temperature, pressure, composition: composition.into_f64()? };
            writer.write(&StoredArray::from_f64(state.to_array()))?;
            milestone += 1;
        }
    }
    let (path, written) = writer.finish()?;

    if written < sample_size {
        // The partial sample is of no use to anyone.
        let _ = fs::remove_file(&path);
        let msg = format!(
            "Too small steps sample is got for {} case. Change steps sample size or case conditions",
            log.condition
        );
        info!("{}", msg);
        return Err(ReduceError::Simulation(msg));
    }
    debug!("Sample of {} states for {} case", written, log.condition);
    Ok(path)
}

pub fn read_states(path: &Path, n_species: usize) -> ReduceResult<Vec<ThermoState>> {
    read_all(path)?
        .iter()
        .map(|array| ThermoState::from_array(array.as_f64()?, n_species))
        .collect()
}

/// Largest relative ignition-delay deviation over all conditions, each capped
/// at 1. A reduced model whose simulation failed scores 1.
pub fn ignition_delay_error(original: &[f64], reduced: Option<&[f64]>) -> ReduceResult<f64> {
    let Some(reduced) = reduced else {
        return Ok(1.0);
    };
    if reduced.len() != original.len() {
        return Err(ReduceError::Simulation(format!(
            "Got {} ignition delays for {} conditions",
            reduced.len(),
            original.len()
        )));
    }
    Ok(original
        .iter()
        .zip(reduced)
        .map(|(o, r)| {
            let error = (1.0 - r / o).abs();
            if error.is_finite() { error.min(1.0) } else { 1.0 }
        })
        .fold(0.0, f64::max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_ignition_delay_error() {
        let original = [1.0, 2.0];
        assert_eq!(ignition_delay_error(&original, None).unwrap(), 1.0);
        assert!((ignition_delay_error(&original, Some(&[1.1, 2.0])).unwrap() - 0.1).abs() < 1e-12);
        assert_eq!(ignition_delay_error(&original, Some(&[5.0, 2.0])).unwrap(), 1.0);
        assert_eq!(ignition_delay_error(&[0.0], Some(&[0.0])).unwrap(), 1.0);
        assert!(ignition_delay_error(&original, Some(&[1.0])).is_err());
    }

    #[test]
    fn test_ignition_detected_once() {
        let dir = tempdir().unwrap();
        let mut log = StepLog::create(dir.path(), 0, 1000.0).unwrap();
        assert!(!log.record(0.0, 1000.0, 1.0, &[1.0]).unwrap());
        assert!(log.record(0.1, 1450.0, 1.0, &[1.0]).unwrap());
        assert!(!log.record(0.2, 1500.0, 1.0, &[1.0]).unwrap());
        let steps = log.finish().unwrap();
        assert_eq!(steps.steps, 3);
        assert_eq!(steps.max_temperature, Some(1500.0));
        assert_eq!(steps.ignition, Some(Ignition { delay: 0.1, temperature: 1450.0 }));
    }

    #[test]
    fn test_sample_follows_temperature_milestones() {
        let dir = tempdir().unwrap();
        let mut log = StepLog::create(dir.path(), 1, 1000.0).unwrap();
        for (i, temperature) in [1000.0, 1050.0, 1100.0, 1210.0, 1220.0, 1300.0, 1400.0].iter().enumerate() {
            log.record(i as f64, *temperature, 2.0, &[0.5, 0.5]).unwrap();
        }
        let steps = log.finish().unwrap();

        // Milestones every 100 K: 1000, 1100, 1200, 1300, 1400.
        let sample = create_sample(&steps, dir.path(), 4).unwrap();
        let states = read_states(&sample, 2).unwrap();
        let temperatures: Vec<f64> = states.iter().map(|s| s.temperature).collect();
        assert_eq!(temperatures, vec![1000.0, 1100.0, 1210.0, 1300.0, 1400.0]);
        assert_eq!(states[0].composition, vec![0.5, 0.5]);
        assert_eq!(states[0].pressure, 2.0);
    }

    #[test]
    fn test_sample_errors() {
        let dir = tempdir().unwrap();
        let mut log = StepLog::create(dir.path(), 0, 1000.0).unwrap();
        log.record(0.0, 1000.0, 1.0, &[1.0]).unwrap();
        let cold = log.finish().unwrap();
        let err = create_sample(&cold, dir.path(), 2).unwrap_err();
        assert!(err.to_string().contains("No auto ignition"));

        let mut log = StepLog::create(dir.path(), 0, 1000.0).unwrap();
        log.record(0.0, 1000.0, 1.0, &[1.0]).unwrap();
        log.record(1.0, 1500.0, 1.0, &[1.0]).unwrap();
        let sparse = log.finish().unwrap();
        let err = create_sample(&sparse, dir.path(), 10).unwrap_err();
        assert!(err.to_string().contains("Too small steps sample"));
    }
}
