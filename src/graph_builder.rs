//! Builds the directed species-interaction graph for one thermodynamic state.
//!
//! Every method looks only at reactions with a nonzero net rate. For each
//! species `A` the per-reaction contribution is `(products - reactants) * rate`;
//! the weight of `A -> B` sums those contributions over reactions in which `B`
//! takes part and normalizes by a per-method denominator of `A`.

use crate::chemistry::{ChemistryEngine, RateSnapshot, ThermoState};
use crate::csr::CsrAdjacencyMatrix;
use crate::{ReduceError, ReduceResult};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::str::FromStr;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "UPPERCASE")]
#[value(rename_all = "UPPERCASE")]
pub enum Method {
    Drg,
    Drgep,
    Pfa,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Drg => "DRG",
            Method::Drgep => "DRGEP",
            Method::Pfa => "PFA",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Method {
    type Err = ReduceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DRG" => Ok(Method::Drg),
            "DRGEP" => Ok(Method::Drgep),
            "PFA" => Ok(Method::Pfa),
            _ => Err(ReduceError::Config(format!("Unknown reducing method {}", s))),
        }
    }
}

/// Signed contributions of the participants of one reaction.
struct ReactionTerms {
    participants: SmallVec<[usize; 8]>,
    base: SmallVec<[f64; 8]>,
}

fn reaction_terms(snapshot: &RateSnapshot) -> Vec<ReactionTerms> {
    let n_species = snapshot.n_species();
    snapshot
        .net_rates()
        .iter()
        .enumerate()
        .filter(|&(_, &rate)| rate != 0.0)
        .map(|(r, &rate)| {
            let mut terms = ReactionTerms { participants: SmallVec::new(), base: SmallVec::new() };
            for s in 0..n_species {
                if snapshot.reactant(s, r) != 0.0 || snapshot.product(s, r) != 0.0 {
                    terms.participants.push(s);
                    terms.base.push(snapshot.net_coefficient(s, r) * rate);
                }
            }
            terms
        })
        .collect()
}

/// Dense row-major `n x n` weights for the given method, zero diagonal.
pub fn interaction_weights(method: Method, snapshot: &RateSnapshot) -> Vec<f64> {
    let n = snapshot.n_species();
    let terms = reaction_terms(snapshot);
    let mut weights = match method {
        Method::Drg => drg_weights(n, &terms),
        Method::Drgep => drgep_weights(n, &terms),
        Method::Pfa => pfa_weights(n, &terms),
    };
    for a in 0..n {
        weights[a * n + a] = 0.0;
    }
    weights
}

fn normalize(n: usize, numerator: &mut [f64], denominator: &[f64]) {
    for a in 0..n {
        let row = &mut numerator[a * n..(a + 1) * n];
        if denominator[a] == 0.0 {
            row.fill(0.0);
        } else {
            row.iter_mut().for_each(|w| *w /= denominator[a]);
        }
    }
}

fn drg_weights(n: usize, terms: &[ReactionTerms]) -> Vec<f64> {
    let mut numerator = vec![0.0; n * n];
    let mut denominator = vec![0.0; n];
    for reaction in terms {
        for (&a, &base) in reaction.participants.iter().zip(&reaction.base) {
            denominator[a] += base.abs();
            for &b in &reaction.participants {
                numerator[a * n + b] += base.abs();
            }
        }
    }
    normalize(n, &mut numerator, &denominator);
    numerator
}

fn drgep_weights(n: usize, terms: &[ReactionTerms]) -> Vec<f64> {
    let mut numerator = vec![0.0; n * n];
    let mut production = vec![0.0; n];
    let mut consumption = vec![0.0; n];
    for reaction in terms {
        for (&a, &base) in reaction.participants.iter().zip(&reaction.base) {
            production[a] += base.max(0.0);
            consumption[a] -= base.min(0.0);
            for &b in &reaction.participants {
                numerator[a * n + b] += base;
            }
        }
    }
    numerator.iter_mut().for_each(|w| *w = w.abs());
    let denominator: Vec<f64> = production.iter().zip(&consumption).map(|(p, c)| p.max(*c)).collect();
    normalize(n, &mut numerator, &denominator);
    numerator
}

fn pfa_weights(n: usize, terms: &[ReactionTerms]) -> Vec<f64> {
    let mut production_ab = vec![0.0; n * n];
    let mut consumption_ab = vec![0.0; n * n];
    let mut production = vec![0.0; n];
    let mut consumption = vec![0.0; n];
    for reaction in terms {
        for (&a, &base) in reaction.participants.iter().zip(&reaction.base) {
            production[a] += base.max(0.0);
            consumption[a] -= base.min(0.0);
            for &b in &reaction.participants {
                production_ab[a * n + b] += base.max(0.0);
                consumption_ab[a * n + b] -= base.min(0.0);
            }
        }
    }
    let denominator: Vec<f64> = production.iter().zip(&consumption).map(|(p, c)| p.max(*c)).collect();
    normalize(n, &mut production_ab, &denominator);
    normalize(n, &mut consumption_ab, &denominator);
    for a in 0..n {
        production_ab[a * n + a] = 0.0;
        consumption_ab[a * n + a] = 0.0;
    }

    // Second generation through an intermediate M; zero diagonals keep M
    // distinct from both ends.
    let mut weights = vec![0.0; n * n];
    for a in 0..n {
        for m in 0..n {
            let pro_am = production_ab[a * n + m];
            let con_am = consumption_ab[a * n + m];
            if pro_am == 0.0 && con_am == 0.0 {
                continue;
            }
            for b in 0..n {
                weights[a * n + b] +=
                    pro_am * production_ab[m * n + b] + con_am * consumption_ab[m * n + b];
            }
        }
    }
    for ((w, pro), con) in weights.iter_mut().zip(&production_ab).zip(&consumption_ab) {
        *w += pro + con;
    }
    weights
}

pub fn build_graph(method: Method, snapshot: &RateSnapshot) -> ReduceResult<CsrAdjacencyMatrix> {
    let n = snapshot.n_species();
    let weights = interaction_weights(method, snapshot);
    let mut matrix = CsrAdjacencyMatrix::new(n);
    for a in 0..n {
        matrix
            .add_row(a, &weights[a * n..(a + 1) * n])
            .map_err(|e| ReduceError::GraphBuild(e.to_string()))?;
    }
    matrix.finalize();
    trace!("Built {} graph with {} species and {} edges", method, n, matrix.nnz());
    Ok(matrix)
}

/// Evaluate the engine at `state` and build its graph. Nothing partial is
/// returned when the engine fails.
pub fn build_graph_for_state(
    method: Method,
    engine: &dyn ChemistryEngine,
    state: &ThermoState,
) -> ReduceResult<CsrAdjacencyMatrix> {
    let snapshot = engine.evaluate(state).map_err(|e| match e {
        ReduceError::GraphBuild(_) => e,
        other => ReduceError::GraphBuild(other.to_string()),
    })?;
    build_graph(method, &snapshot)
}
