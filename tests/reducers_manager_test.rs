use kinreduce::array_store::{ArrayWriter, StoredArray};
use kinreduce::chemistry::{ChemistryEngine, MassActionModel, RateSnapshot, ThermoState};
use kinreduce::graph_builder::Method;
use kinreduce::pool::PoolTimeouts;
use kinreduce::reducers::{ReducerSettings, ReducersManager};
use kinreduce::threshold_search::{SearchSettings, ThresholdSearch};
use kinreduce::{ReduceError, ReduceResult, RetainedSpecies};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

// A -> B -> C, D -> E.
const MECHANISM: &str = r#"{
    "species": ["A", "B", "C", "D", "E"],
    "reactions": [
        {"reactants": {"A": 1.0}, "products": {"B": 1.0}, "forward_rate": 1.0},
        {"reactants": {"B": 1.0}, "products": {"C": 1.0}, "forward_rate": 1.0},
        {"reactants": {"D": 1.0}, "products": {"E": 1.0}, "forward_rate": 1.0}
    ]
}"#;

fn engine() -> Arc<dyn ChemistryEngine> {
    Arc::new(MassActionModel::from_json_str(MECHANISM).unwrap())
}

fn settings() -> ReducerSettings {
    ReducerSettings {
        build_threads: 1,
        reduce_threads: 2,
        timeouts: PoolTimeouts {
            start: Some(Duration::from_secs(10)),
            finishing: Duration::from_secs(5),
            after_termination: Duration::from_secs(5),
        },
        build_timeout: Some(Duration::from_secs(10)),
        reduce_timeout: Some(Duration::from_secs(10)),
    }
}

fn write_sample(dir: &Path, name: &str, compositions: &[[f64; 5]]) -> PathBuf {
    let mut writer = ArrayWriter::create(&dir.join(name)).unwrap();
    for composition in compositions {
        let state = ThermoState {
            temperature: 1000.0,
            pressure: 101325.0,
            composition: composition.to_vec(),
        };
        writer.write(&StoredArray::from_f64(state.to_array())).unwrap();
    }
    writer.finish().unwrap().0
}

/// Two conditions with two states each. In the last state B is consumed three
/// times faster than it is produced, which makes B -> C strong.
fn samples(dir: &Path) -> Vec<PathBuf> {
    vec![
        write_sample(dir, "sample_0.bin", &[[1.0; 5], [1.0, 1.0, 0.5, 1.0, 1.0]]),
        write_sample(dir, "sample_1.bin", &[[1.0; 5], [1.0, 3.0, 1.0, 1.0, 1.0]]),
    ]
}

#[test]
fn test_reduce_merges_states_and_baseline() {
    let inputs = tempdir().unwrap();
    let work = tempdir().unwrap();
    let mut manager = ReducersManager::new(
        engine(),
        Method::Drg,
        samples(inputs.path()),
        vec![0],
        vec![4],
        work.path(),
        settings(),
    )
    .unwrap();

    manager.open().unwrap();
    assert_eq!(manager.n_workers(), 4);

    let low = manager.reduce(0.4).unwrap();
    assert_eq!(low.to_vec(), vec![0, 1, 2, 4]);

    // Only the last state keeps C at 0.6.
    let mid = manager.reduce(0.6).unwrap();
    assert_eq!(mid.to_vec(), vec![0, 1, 2, 4]);

    let high = manager.reduce(0.8).unwrap();
    assert_eq!(high.to_vec(), vec![0, 1, 4]);

    let top = manager.reduce(2.0).unwrap();
    assert_eq!(top.to_vec(), vec![0, 4]);

    assert!(high.is_subset(&mid));
    assert!(top.is_subset(&high));

    manager.close().unwrap();
    assert_eq!(fs::read_dir(work.path()).unwrap().count(), 0);
}

#[test]
fn test_single_state_scenario() {
    let inputs = tempdir().unwrap();
    let work = tempdir().unwrap();
    let sample = write_sample(inputs.path(), "sample.bin", &[[1.0; 5]]);
    let mut manager =
        ReducersManager::new(engine(), Method::Drg, vec![sample], vec![0], vec![], work.path(), settings())
            .unwrap();

    let (low, high) = manager
        .scoped(|m| Ok((m.reduce(0.4)?, m.reduce(0.6)?)))
        .unwrap();
    assert_eq!(low.to_vec(), vec![0, 1, 2]);
    assert_eq!(high.to_vec(), vec![0, 1]);
    assert!(!manager.is_open());
}

struct BrokenEngine {
    species: Vec<String>,
}

impl ChemistryEngine for BrokenEngine {
    fn species_names(&self) -> &[String] {
        &self.species
    }

    fn n_reactions(&self) -> usize {
        0
    }

    fn evaluate(&self, _state: &ThermoState) -> ReduceResult<RateSnapshot> {
        Err(ReduceError::Simulation("rates unavailable".to_string()))
    }
}

#[test]
fn test_graph_build_failure_fails_open() {
    let inputs = tempdir().unwrap();
    let work = tempdir().unwrap();
    let engine = Arc::new(BrokenEngine {
        species: ["A", "B", "C", "D", "E"].iter().map(|s| s.to_string()).collect(),
    });
    let mut manager = ReducersManager::new(
        engine,
        Method::Pfa,
        samples(inputs.path()),
        vec![0],
        vec![],
        work.path(),
        settings(),
    )
    .unwrap();

    let err = manager.open().unwrap_err();
    assert!(matches!(err, ReduceError::GraphBuild(_)), "got {}", err);
    assert!(err.to_string().contains("rates unavailable"));
    assert!(!manager.is_open());
    assert!(matches!(manager.reduce(0.1), Err(ReduceError::State(_))));
}

/// Fails only for states without any A, so one reducer of a pool breaks.
struct PartlyBrokenEngine {
    inner: MassActionModel,
}

impl ChemistryEngine for PartlyBrokenEngine {
    fn species_names(&self) -> &[String] {
        self.inner.species_names()
    }

    fn n_reactions(&self) -> usize {
        self.inner.n_reactions()
    }

    fn evaluate(&self, state: &ThermoState) -> ReduceResult<RateSnapshot> {
        if state.composition[0] == 0.0 {
            return Err(ReduceError::Simulation("no A left".to_string()));
        }
        self.inner.evaluate(state)
    }
}

#[test]
fn test_failed_open_stops_healthy_reducers_promptly() {
    let inputs = tempdir().unwrap();
    let work = tempdir().unwrap();
    let sample = write_sample(
        inputs.path(),
        "sample.bin",
        &[[1.0; 5], [1.0; 5], [1.0; 5], [1.0; 5], [0.0, 1.0, 1.0, 1.0, 1.0]],
    );
    let engine = Arc::new(PartlyBrokenEngine { inner: MassActionModel::from_json_str(MECHANISM).unwrap() });
    let mut slow_finish = settings();
    slow_finish.timeouts.finishing = Duration::from_secs(3);
    let mut manager =
        ReducersManager::new(engine, Method::Drg, vec![sample], vec![0], vec![], work.path(), slow_finish)
            .unwrap();

    let started = Instant::now();
    let err = manager.open().unwrap_err();
    assert!(matches!(err, ReduceError::GraphBuild(_)), "got {}", err);
    assert!(err.to_string().contains("no A left"));
    // Waiting out the finishing timeout of even one healthy reducer would take 3s.
    assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    assert!(!manager.is_open());
    assert_eq!(fs::read_dir(work.path()).unwrap().count(), 0);
}

#[test]
fn test_timed_out_reduce_never_leaks_into_next_threshold() {
    let inputs = tempdir().unwrap();
    let work = tempdir().unwrap();
    let sample = write_sample(inputs.path(), "sample.bin", &[[1.0; 5]]);
    let mut impatient = settings();
    impatient.reduce_timeout = Some(Duration::from_nanos(1));
    let mut manager =
        ReducersManager::new(engine(), Method::Drg, vec![sample], vec![0], vec![], work.path(), impatient)
            .unwrap();
    manager.open().unwrap();

    assert!(manager.reduce(0.4).unwrap_err().is_timeout());
    // Let the answer for 0.4 arrive after its reduce gave up.
    thread::sleep(Duration::from_millis(300));
    assert!(matches!(manager.reduce(2.0), Err(ReduceError::State(_))));
    assert!(matches!(manager.reduce(2.0), Err(ReduceError::State(_))));

    manager.close().unwrap();
    assert_eq!(fs::read_dir(work.path()).unwrap().count(), 0);

    manager.open().unwrap();
    assert!(manager.reduce(2.0).unwrap_err().is_timeout());
    manager.close().unwrap();
}

#[test]
fn test_scoped_closes_after_error() {
    let inputs = tempdir().unwrap();
    let work = tempdir().unwrap();
    let mut manager = ReducersManager::new(
        engine(),
        Method::Drgep,
        samples(inputs.path()),
        vec![0],
        vec![],
        work.path(),
        settings(),
    )
    .unwrap();

    let result: ReduceResult<()> = manager.scoped(|m| {
        m.reduce(0.1)?;
        Err(ReduceError::Other("evaluation failed".to_string()))
    });
    assert!(matches!(result, Err(ReduceError::Other(_))));
    assert!(!manager.is_open());
    assert_eq!(fs::read_dir(work.path()).unwrap().count(), 0);
}

#[test]
fn test_invalid_inputs() {
    let inputs = tempdir().unwrap();
    let work = tempdir().unwrap();
    let result = ReducersManager::new(engine(), Method::Drg, vec![], vec![5], vec![], work.path(), settings());
    assert!(matches!(result, Err(ReduceError::InvalidSource { source: 5, species: 5 })));

    let result = ReducersManager::new(engine(), Method::Drg, vec![], vec![], vec![], work.path(), settings());
    assert!(matches!(result, Err(ReduceError::Config(_))));

    let empty = write_sample(inputs.path(), "empty.bin", &[]);
    let mut manager =
        ReducersManager::new(engine(), Method::Drg, vec![empty], vec![0], vec![], work.path(), settings())
            .unwrap();
    assert!(matches!(manager.open(), Err(ReduceError::Config(_))));
}

#[test]
fn test_threshold_search_over_reducers() {
    let inputs = tempdir().unwrap();
    let work = tempdir().unwrap();
    let sample = write_sample(inputs.path(), "sample.bin", &[[1.0; 5]]);
    let mut manager =
        ReducersManager::new(engine(), Method::Drg, vec![sample], vec![0], vec![], work.path(), settings())
            .unwrap();

    // Losing C is acceptable, losing B is not.
    let mut evaluator = |retained: &RetainedSpecies| -> ReduceResult<f64> {
        Ok(if retained.contains(1) { 0.0 } else { 1.0 })
    };
    let search = SearchSettings {
        initial_threshold: 0.2,
        pinned: true,
        max_error: 0.5,
        ..SearchSettings::default()
    };
    let outcome = manager
        .scoped(|m| ThresholdSearch::new(m, &mut evaluator, search).run())
        .unwrap();
    assert_eq!(outcome.retained.to_vec(), vec![0, 1]);
    assert!(outcome.threshold > 0.5 && outcome.threshold <= 1.0);
}
