//! Per-state reducer workers and the manager that broadcasts thresholds to
//! them and merges their answers.

use crate::array_store::{ArrayReader, ArrayWriter, StoredArray, create_unique_file, read_all, write_all};
use crate::chemistry::{ChemistryEngine, ThermoState};
use crate::config::default_threads;
use crate::csr::CsrAdjacencyMatrix;
use crate::graph_builder::{Method, build_graph_for_state};
use crate::graph_reducer::reduce_with;
use crate::pool::{PoolTimeouts, WorkerPool};
use crate::retained::RetainedSpecies;
use crate::semaphore::Semaphore;
use crate::threshold_search::ReductionBackend;
use crate::worker::{Worker, WorkerBody, WorkerContext};
use crate::{ReduceError, ReduceResult};
use bincode::{Decode, Encode};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum Command {
    Reduce { threshold: f64 },
    Stop,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum Answer {
    MatrixCreated,
    /// Retained indices were written to the array file at `path`.
    Reduced { path: String },
    Error { reason: String },
}

/// File-name prefix for the result of one reduction; dots in the threshold
/// are replaced so the name stays readable.
pub fn retained_species_prefix(condition: usize, threshold: f64) -> String {
    format!(
        "retained_species_for_{}_case_with_threshold_{}",
        condition,
        threshold.to_string().replace('.', "__")
    )
}

pub fn state_prefix(condition: usize, state: usize) -> String {
    format!("state_for_{}_ai_condition_and_{}_state", condition, state)
}

/// Worker body owning the graph of one sampled state.
pub struct Reducer {
    engine: Arc<dyn ChemistryEngine>,
    method: Method,
    state_path: PathBuf,
    sources_path: PathBuf,
    tmp_dir: PathBuf,
    condition: usize,
    build_semaphore: Semaphore,
    reduce_semaphore: Semaphore,
    state: Option<ThermoState>,
    sources: Vec<usize>,
}

impl Reducer {
    fn load_inputs(&mut self) -> ReduceResult<()> {
        let state = read_all(&self.state_path)?
            .into_iter()
            .next()
            .ok_or_else(|| ReduceError::Other(format!("{} holds no state", self.state_path.display())))?;
        self.state = Some(ThermoState::from_array(state.as_f64()?, self.engine.n_species())?);

        let sources = read_all(&self.sources_path)?
            .into_iter()
            .next()
            .ok_or_else(|| ReduceError::Other(format!("{} holds no sources", self.sources_path.display())))?;
        self.sources = sources.to_indices()?;
        Ok(())
    }

    fn build(&self) -> ReduceResult<CsrAdjacencyMatrix> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| ReduceError::State("Reducer state not loaded".to_string()))?;
        let _permit = self.build_semaphore.acquire()?;
        build_graph_for_state(self.method, self.engine.as_ref(), state)
    }

    fn reduce(&self, matrix: &CsrAdjacencyMatrix, threshold: f64) -> ReduceResult<PathBuf> {
        let _permit = self.reduce_semaphore.acquire()?;
        let retained = reduce_with(self.method, matrix, threshold, &self.sources)?;
        let mut writer = ArrayWriter::create_unique(
            &self.tmp_dir,
            &retained_species_prefix(self.condition, threshold),
        )?;
        writer.write(&StoredArray::from_indices(retained.iter()))?;
        let (path, _) = writer.finish()?;
        Ok(path)
    }
}

impl WorkerBody for Reducer {
    fn bootstrap(&mut self) -> ReduceResult<()> {
        self.load_inputs()
    }

    fn run(self: Box<Self>, ctx: &mut WorkerContext) -> ReduceResult<()> {
        let matrix = match self.build() {
            Ok(matrix) => matrix,
            Err(e) => {
                error!(worker = %ctx.name(), "Error while creating csr matrix: {}", e);
                ctx.send_to_manager(&Answer::Error { reason: e.to_string() })?;
                return Err(e);
            }
        };
        debug!(worker = %ctx.name(), "Matrix with {} edges created", matrix.nnz());
        ctx.send_to_manager(&Answer::MatrixCreated)?;

        loop {
            let command = match ctx.get_msg_from_manager::<Command>(None) {
                Ok(command) => command,
                Err(ReduceError::Closed(_)) => {
                    debug!(worker = %ctx.name(), "Manager closed the channel");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            match command {
                Command::Stop => return Ok(()),
                Command::Reduce { threshold } => match self.reduce(&matrix, threshold) {
                    Ok(path) => ctx.send_to_manager(&Answer::Reduced {
                        path: path.to_string_lossy().into_owned(),
                    })?,
                    Err(e) => {
                        error!(worker = %ctx.name(), "Error while reducing: {}", e);
                        ctx.send_to_manager(&Answer::Error { reason: e.to_string() })?;
                        return Err(e);
                    }
                },
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReducerSettings {
    pub build_threads: usize,
    pub reduce_threads: usize,
    pub timeouts: PoolTimeouts,
    /// Per-worker wait for the graph to be built. `None` waits forever.
    pub build_timeout: Option<Duration>,
    pub reduce_timeout: Option<Duration>,
}

impl Default for ReducerSettings {
    fn default() -> Self {
        Self {
            build_threads: default_threads(),
            reduce_threads: default_threads(),
            timeouts: PoolTimeouts::default(),
            build_timeout: None,
            reduce_timeout: None,
        }
    }
}

pub struct ReducersManager {
    engine: Arc<dyn ChemistryEngine>,
    method: Method,
    samples: Vec<PathBuf>,
    sources: Vec<usize>,
    baseline: RetainedSpecies,
    tmp_dir: PathBuf,
    settings: ReducerSettings,
    pool: Option<WorkerPool>,
    files: Vec<PathBuf>,
    /// Set once a reducer may still hold an answer nobody collected. Later
    /// answers can no longer be matched to their threshold until reopened.
    out_of_sync: bool,
}

impl ReducersManager {
    /// `samples` are array files, one per condition, each holding the sampled
    /// `[T, P, composition...]` states of that condition. `baseline` species
    /// are added to every result.
    pub fn new(
        engine: Arc<dyn ChemistryEngine>,
        method: Method,
        samples: Vec<PathBuf>,
        sources: Vec<usize>,
        baseline: Vec<usize>,
        tmp_dir: &Path,
        settings: ReducerSettings,
    ) -> ReduceResult<Self> {
        let n_species = engine.n_species();
        if sources.is_empty() {
            return Err(ReduceError::Config("At least one target species is required".to_string()));
        }
        // Validates the indices.
        RetainedSpecies::from_indices(n_species, sources.iter().copied())?;
        let baseline = RetainedSpecies::from_indices(n_species, baseline)?;
        if settings.build_threads == 0 || settings.reduce_threads == 0 {
            return Err(ReduceError::Config("Thread counts must be positive".to_string()));
        }
        Ok(Self {
            engine,
            method,
            samples,
            sources,
            baseline,
            tmp_dir: tmp_dir.to_path_buf(),
            settings,
            pool: None,
            files: Vec::new(),
            out_of_sync: false,
        })
    }

    pub fn is_open(&self) -> bool {
        self.pool.is_some()
    }

    pub fn n_workers(&self) -> usize {
        self.pool.as_ref().map_or(0, WorkerPool::len)
    }

    /// Start one reducer per sampled state and wait until every graph is built.
    pub fn open(&mut self) -> ReduceResult<()> {
        if self.pool.is_some() {
            return Err(ReduceError::State("Reducers are already opened".to_string()));
        }
        self.out_of_sync = false;
        let result = self.start_reducers();
        if result.is_err() {
            if let Some(mut pool) = self.pool.take() {
                // Healthy reducers wait for commands; stop them instead of
                // letting each one run into the finishing timeout.
                stop_reducers(&pool);
                if let Err(e) = pool.close() {
                    debug!("Closing pool after failed open: {}", e);
                }
            }
            self.remove_files();
        }
        result
    }

    fn start_reducers(&mut self) -> ReduceResult<()> {
        let sources_path = create_unique_file(&self.tmp_dir, "sources", ".bin")?;
        self.files.push(sources_path.clone());
        write_all(&sources_path, &[StoredArray::from_indices(self.sources.iter().copied())])?;

        let build_semaphore = Semaphore::new(self.settings.build_threads)?;
        let reduce_semaphore = Semaphore::new(self.settings.reduce_threads)?;

        let mut workers = Vec::new();
        for (condition, sample) in self.samples.iter().enumerate() {
            for (state_idx, state) in ArrayReader::open(sample)?.enumerate() {
                let mut writer = ArrayWriter::create_unique(&self.tmp_dir, &state_prefix(condition, state_idx))?;
                self.files.push(writer.path().to_path_buf());
                writer.write(&state?)?;
                let (state_path, _) = writer.finish()?;

                let reducer = Reducer {
                    engine: Arc::clone(&self.engine),
                    method: self.method,
                    state_path,
                    sources_path: sources_path.clone(),
                    tmp_dir: self.tmp_dir.clone(),
                    condition,
                    build_semaphore: build_semaphore.clone(),
                    reduce_semaphore: reduce_semaphore.clone(),
                    state: None,
                    sources: Vec::new(),
                };
                let name = format!("reduces_for_{}_ai_condition_and_{}_state", condition, state_idx);
                workers.push(Worker::new(name, reducer));
            }
        }
        if workers.is_empty() {
            return Err(ReduceError::Config("No sampled states to reduce".to_string()));
        }

        info!("Starting {} reducers", workers.len());
        let pool = self.pool.insert(WorkerPool::new(workers, self.settings.timeouts));
        pool.open()?;

        for worker in pool.workers_mut() {
            match worker.get_msg_from_worker::<Answer>(self.settings.build_timeout) {
                Ok(Answer::MatrixCreated) => {}
                Ok(Answer::Error { reason }) => {
                    return Err(ReduceError::GraphBuild(format!("{}: {}", worker.name(), reason)));
                }
                Ok(other) => {
                    return Err(ReduceError::Protocol(format!(
                        "{} answered {:?} instead of MatrixCreated",
                        worker.name(),
                        other
                    )));
                }
                Err(e) if e.is_worker_finished() => {
                    return Err(ReduceError::WorkerDied(worker.name().to_string()));
                }
                Err(e) => return Err(e),
            }
        }
        info!("All {} matrices created", pool.len());
        Ok(())
    }

    /// Broadcast `threshold` to every reducer, then merge all answers with the
    /// baseline species.
    ///
    /// If an answer could not be collected (timeout, dead reducer, failed
    /// broadcast) every later call fails with `State` until the manager is
    /// closed and reopened.
    pub fn reduce(&mut self, threshold: f64) -> ReduceResult<RetainedSpecies> {
        let pool = self
            .pool
            .as_mut()
            .ok_or_else(|| ReduceError::State("Reducers are not opened".to_string()))?;
        if self.out_of_sync {
            return Err(ReduceError::State(
                "Reducers hold uncollected answers from an earlier reduce; reopen them".to_string(),
            ));
        }
        pool.ensure_alive()?;

        for worker in pool.workers() {
            if let Err(e) = worker.send_to_worker(&Command::Reduce { threshold }) {
                self.out_of_sync = true;
                return Err(e);
            }
        }

        let n_species = self.engine.n_species();
        let mut retained = self.baseline.clone();
        let mut first_error = None;
        for worker in pool.workers_mut() {
            let answer = match worker.get_msg_from_worker::<Answer>(self.settings.reduce_timeout) {
                Ok(answer) => answer,
                Err(e) if e.is_worker_finished() => {
                    self.out_of_sync = true;
                    first_error.get_or_insert(ReduceError::WorkerDied(worker.name().to_string()));
                    continue;
                }
                Err(e) => {
                    self.out_of_sync = true;
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            match answer {
                Answer::Reduced { path } => match read_retained(Path::new(&path), n_species) {
                    Ok(partial) => retained.union_with(&partial)?,
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                },
                Answer::Error { reason } => {
                    first_error.get_or_insert(ReduceError::WorkerFailed(format!(
                        "{}: {}",
                        worker.name(),
                        reason
                    )));
                }
                Answer::MatrixCreated => {
                    first_error.get_or_insert(ReduceError::Protocol(format!(
                        "{} answered MatrixCreated to a reduce request",
                        worker.name()
                    )));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(retained),
        }
    }

    /// Stop every reducer and remove the handoff files.
    pub fn close(&mut self) -> ReduceResult<()> {
        let mut pool = self
            .pool
            .take()
            .ok_or_else(|| ReduceError::State("Reducers are not opened".to_string()))?;
        stop_reducers(&pool);
        let result = pool.close();
        if self.out_of_sync {
            discard_late_answers(&mut pool);
            self.out_of_sync = false;
        }
        self.remove_files();
        result
    }

    /// Open, run `f`, and close even when `f` fails.
    pub fn scoped<T, F>(&mut self, f: F) -> ReduceResult<T>
    where
        F: FnOnce(&mut Self) -> ReduceResult<T>,
    {
        self.open()?;
        let result = f(self);
        let closed = self.close();
        let value = result?;
        closed?;
        Ok(value)
    }

    fn remove_files(&mut self) {
        for path in self.files.drain(..) {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }
}

fn stop_reducers(pool: &WorkerPool) {
    for worker in pool.workers() {
        if let Err(e) = worker.send_to_worker(&Command::Stop) {
            debug!("Could not stop {}: {}", worker.name(), e);
        }
    }
}

/// Remove result files of answers that arrived after their `reduce` gave up.
fn discard_late_answers(pool: &mut WorkerPool) {
    for worker in pool.workers_mut() {
        while let Ok(answer) = worker.get_msg_from_worker::<Answer>(Some(Duration::ZERO)) {
            if let Answer::Reduced { path } = answer {
                debug!(worker = %worker.name(), "Discarding late answer {}", path);
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Failed to remove {}: {}", path, e);
                }
            }
        }
    }
}

fn read_retained(path: &Path, n_species: usize) -> ReduceResult<RetainedSpecies> {
    let mut indices = Vec::new();
    for array in read_all(path)? {
        indices.extend(array.to_indices()?);
    }
    if let Err(e) = fs::remove_file(path) {
        warn!("Failed to remove {}: {}", path.display(), e);
    }
    RetainedSpecies::from_indices(n_species, indices)
}

impl ReductionBackend for ReducersManager {
    fn n_species(&self) -> usize {
        self.engine.n_species()
    }

    fn reduce(&mut self, threshold: f64) -> ReduceResult<RetainedSpecies> {
        ReducersManager::reduce(self, threshold)
    }
}

impl Drop for ReducersManager {
    fn drop(&mut self) {
        if self.pool.is_some() {
            if let Err(e) = self.close() {
                warn!("Failed to close reducers: {}", e);
            }
        }
    }
}
