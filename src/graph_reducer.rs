//! Species selection on a finalized interaction graph.

use crate::csr::CsrAdjacencyMatrix;
use crate::graph_builder::Method;
use crate::retained::RetainedSpecies;
use crate::{ReduceError, ReduceResult};
use fixedbitset::FixedBitSet;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

fn validate(matrix: &CsrAdjacencyMatrix, threshold: f64, sources: &[usize]) -> ReduceResult<()> {
    if !matrix.is_finalized() {
        return Err(ReduceError::Matrix("Matrix must be finalized before reducing".to_string()));
    }
    if !(threshold.is_finite() && threshold > 0.0) {
        return Err(ReduceError::Config(format!("Threshold must be positive, got {}", threshold)));
    }
    if let Some(&source) = sources.iter().find(|&&s| s >= matrix.size()) {
        return Err(ReduceError::InvalidSource { source, species: matrix.size() });
    }
    Ok(())
}

/// Species reachable from `sources` over edges with weight >= `threshold`.
/// Sources are always retained.
pub fn reduce(matrix: &CsrAdjacencyMatrix, threshold: f64, sources: &[usize]) -> ReduceResult<RetainedSpecies> {
    validate(matrix, threshold, sources)?;

    let mut visited = FixedBitSet::with_capacity(matrix.size());
    let mut stack: Vec<usize> = Vec::with_capacity(sources.len());
    for &source in sources {
        if !visited.put(source) {
            stack.push(source);
        }
    }
    while let Some(node) = stack.pop() {
        for (next, weight) in matrix.neighbours(node) {
            if weight >= threshold && !visited.put(next) {
                stack.push(next);
            }
        }
    }
    Ok(RetainedSpecies::from_bits(visited))
}

#[derive(PartialEq)]
struct PathValue(f64, usize);

impl Eq for PathValue {}

impl PartialOrd for PathValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PathValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0).then_with(|| other.1.cmp(&self.1))
    }
}

/// Species whose best path product from any source is >= `threshold`.
/// Edge weights are capped at 1 so path values never grow along a path.
pub fn reduce_by_path_product(
    matrix: &CsrAdjacencyMatrix,
    threshold: f64,
    sources: &[usize],
) -> ReduceResult<RetainedSpecies> {
    validate(matrix, threshold, sources)?;

    let n = matrix.size();
    let mut best = vec![0.0f64; n];
    let mut done = FixedBitSet::with_capacity(n);
    let mut heap = BinaryHeap::new();
    let mut retained = FixedBitSet::with_capacity(n);
    for &source in sources {
        best[source] = 1.0;
        retained.insert(source);
        heap.push(PathValue(1.0, source));
    }

    while let Some(PathValue(value, node)) = heap.pop() {
        if done.put(node) {
            continue;
        }
        if value < threshold {
            break;
        }
        retained.insert(node);
        for (next, weight) in matrix.neighbours(node) {
            let candidate = value * weight.min(1.0);
            if !done.contains(next) && candidate > best[next] {
                best[next] = candidate;
                heap.push(PathValue(candidate, next));
            }
        }
    }
    Ok(RetainedSpecies::from_bits(retained))
}

/// DRGEP selects by path product; DRG and PFA by plain reachability.
pub fn reduce_with(
    method: Method,
    matrix: &CsrAdjacencyMatrix,
    threshold: f64,
    sources: &[usize],
) -> ReduceResult<RetainedSpecies> {
    match method {
        Method::Drg | Method::Pfa => reduce(matrix, threshold, sources),
        Method::Drgep => reduce_by_path_product(matrix, threshold, sources),
    }
}
