pub mod array_store;
pub mod channel;
pub mod chemistry;
pub mod config;
pub mod csr;
pub mod error;
pub mod graph_builder;
pub mod graph_reducer;
pub mod logging;
pub mod pool;
pub mod reducers;
pub mod relay;
pub mod retained;
pub mod sampling;
pub mod semaphore;
pub mod threshold_search;
pub mod worker;

pub use error::*;
pub use retained::RetainedSpecies;
