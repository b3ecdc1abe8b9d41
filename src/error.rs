use std::fmt;

#[derive(Debug)]
pub enum ReduceError {
    /// Malformed or out-of-sequence envelope on one channel.
    Protocol(String),
    /// The worker body returned an error and sent a FAILED envelope.
    WorkerFailed(String),
    /// The worker stopped without a terminal envelope.
    WorkerDied(String),
    /// The worker has finished and has no more messages to hand out.
    WorkerFinished(String),
    Timeout(String),
    Closed(String),
    State(String),
    GraphBuild(String),
    Matrix(String),
    InvalidSource { source: usize, species: usize },
    AutoThresholdExhausted { attempts: usize },
    InvalidPinnedThreshold { threshold: f64, error: f64, max_error: f64 },
    Simulation(String),
    Config(String),
    Serialization(Box<bincode::error::EncodeError>),
    Deserialization(Box<bincode::error::DecodeError>),
    Io(std::io::Error),
    Other(String),
}

pub type ReduceResult<T> = Result<T, ReduceError>;

impl ReduceError {
    /// True for the "worker is done, nothing left to read" signal, which callers
    /// must not treat as a protocol failure.
    pub fn is_worker_finished(&self) -> bool {
        matches!(self, ReduceError::WorkerFinished(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ReduceError::Timeout(_))
    }
}

impl fmt::Display for ReduceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReduceError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ReduceError::WorkerFailed(e) => write!(f, "Worker failed: {}", e),
            ReduceError::WorkerDied(e) => write!(f, "Worker died unexpectedly: {}", e),
            ReduceError::WorkerFinished(e) => write!(f, "Worker has finished: {}", e),
            ReduceError::Timeout(e) => write!(f, "Timed out: {}", e),
            ReduceError::Closed(e) => write!(f, "Channel closed: {}", e),
            ReduceError::State(e) => write!(f, "Invalid state: {}", e),
            ReduceError::GraphBuild(e) => write!(f, "Graph build error: {}", e),
            ReduceError::Matrix(e) => write!(f, "Matrix error: {}", e),
            ReduceError::InvalidSource { source, species } => write!(
                f,
                "Source species index {} is out of range for {} species",
                source, species
            ),
            ReduceError::AutoThresholdExhausted { attempts } => write!(
                f,
                "Auto retrieving initial threshold failed: no admissible threshold in {} attempts",
                attempts
            ),
            ReduceError::InvalidPinnedThreshold { threshold, error, max_error } => write!(
                f,
                "Invalid user initial threshold {}: error {} exceeds max error {}",
                threshold, error, max_error
            ),
            ReduceError::Simulation(e) => write!(f, "Simulation error: {}", e),
            ReduceError::Config(e) => write!(f, "Config error: {}", e),
            ReduceError::Serialization(e) => write!(f, "Serialization error: {}", e),
            ReduceError::Deserialization(e) => write!(f, "Deserialization error: {}", e),
            ReduceError::Io(e) => write!(f, "IO error: {}", e),
            ReduceError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for ReduceError {}

impl From<bincode::error::EncodeError> for ReduceError {
    fn from(err: bincode::error::EncodeError) -> Self {
        ReduceError::Serialization(Box::new(err))
    }
}

impl From<bincode::error::DecodeError> for ReduceError {
    fn from(err: bincode::error::DecodeError) -> Self {
        ReduceError::Deserialization(Box::new(err))
    }
}

impl From<std::io::Error> for ReduceError {
    fn from(err: std::io::Error) -> Self {
        ReduceError::Io(err)
    }
}

impl From<serde_json::Error> for ReduceError {
    fn from(err: serde_json::Error) -> Self {
        ReduceError::Config(err.to_string())
    }
}

impl From<String> for ReduceError {
    fn from(err: String) -> Self {
        ReduceError::Other(err)
    }
}

impl From<&str> for ReduceError {
    fn from(err: &str) -> Self {
        ReduceError::Other(err.to_string())
    }
}
