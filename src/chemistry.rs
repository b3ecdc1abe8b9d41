//! Chemistry collaborators: the engine interface the graph builder evaluates,
//! a small mass-action engine loaded from JSON, and a model cache.

use crate::{ReduceError, ReduceResult};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};

pub const GAS_CONSTANT: f64 = 8.314_462_618;

/// Thermodynamic state handed to a reducer worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ThermoState {
    pub temperature: f64,
    pub pressure: f64,
    pub composition: Vec<f64>,
}

impl ThermoState {
    /// Flat layout `[temperature, pressure, composition...]`.
    pub fn to_array(&self) -> Vec<f64> {
        let mut array = Vec::with_capacity(self.composition.len() + 2);
        array.push(self.temperature);
        array.push(self.pressure);
        array.extend_from_slice(&self.composition);
        array
    }

    pub fn from_array(array: &[f64], n_species: usize) -> ReduceResult<Self> {
        if array.len() != n_species + 2 {
            return Err(ReduceError::Simulation(format!(
                "State array has {} values, expected {} for {} species",
                array.len(),
                n_species + 2,
                n_species
            )));
        }
        Ok(Self {
            temperature: array[0],
            pressure: array[1],
            composition: array[2..].to_vec(),
        })
    }
}

/// Net rates and stoichiometry evaluated at one state. Coefficient matrices
/// are species-major: entry `(s, r)` lives at `s * n_reactions + r`.
#[derive(Debug, Clone, PartialEq)]
pub struct RateSnapshot {
    n_species: usize,
    n_reactions: usize,
    net_rates: Vec<f64>,
    reactant_coeffs: Vec<f64>,
    product_coeffs: Vec<f64>,
}

impl RateSnapshot {
    pub fn new(
        n_species: usize,
        net_rates: Vec<f64>,
        reactant_coeffs: Vec<f64>,
        product_coeffs: Vec<f64>,
    ) -> ReduceResult<Self> {
        let n_reactions = net_rates.len();
        let expected = n_species * n_reactions;
        if reactant_coeffs.len() != expected || product_coeffs.len() != expected {
            return Err(ReduceError::GraphBuild(format!(
                "Coefficient matrices must be {}x{} ({} entries), got {} and {}",
                n_species,
                n_reactions,
                expected,
                reactant_coeffs.len(),
                product_coeffs.len()
            )));
        }
        if let Some(bad) = net_rates.iter().find(|r| !r.is_finite()) {
            return Err(ReduceError::GraphBuild(format!("Non-finite net rate {}", bad)));
        }
        Ok(Self { n_species, n_reactions, net_rates, reactant_coeffs, product_coeffs })
    }

    pub fn n_species(&self) -> usize {
        self.n_species
    }

    pub fn n_reactions(&self) -> usize {
        self.n_reactions
    }

    pub fn net_rates(&self) -> &[f64] {
        &self.net_rates
    }

    pub fn reactant(&self, species: usize, reaction: usize) -> f64 {
        self.reactant_coeffs[species * self.n_reactions + reaction]
    }

    pub fn product(&self, species: usize, reaction: usize) -> f64 {
        self.product_coeffs[species * self.n_reactions + reaction]
    }

    /// Products minus reactants.
    pub fn net_coefficient(&self, species: usize, reaction: usize) -> f64 {
        self.product(species, reaction) - self.reactant(species, reaction)
    }
}

pub trait ChemistryEngine: Send + Sync {
    fn species_names(&self) -> &[String];

    fn n_reactions(&self) -> usize;

    fn evaluate(&self, state: &ThermoState) -> ReduceResult<RateSnapshot>;

    fn n_species(&self) -> usize {
        self.species_names().len()
    }

    fn species_index(&self, name: &str) -> Option<usize> {
        self.species_names().iter().position(|s| s == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RateConstant {
    Constant(f64),
    /// `a * T^b * exp(-ea / (R T))`, `ea` in J/mol.
    Arrhenius {
        a: f64,
        #[serde(default)]
        b: f64,
        #[serde(default)]
        ea: f64,
    },
}

impl RateConstant {
    pub fn at(&self, temperature: f64) -> f64 {
        match *self {
            RateConstant::Constant(k) => k,
            RateConstant::Arrhenius { a, b, ea } => {
                a * temperature.powf(b) * (-ea / (GAS_CONSTANT * temperature)).exp()
            }
        }
    }
}

impl Default for RateConstant {
    fn default() -> Self {
        RateConstant::Constant(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionSpec {
    #[serde(default)]
    pub equation: Option<String>,
    pub reactants: BTreeMap<String, f64>,
    pub products: BTreeMap<String, f64>,
    pub forward_rate: RateConstant,
    #[serde(default)]
    pub reverse_rate: RateConstant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MechanismSpec {
    pub species: Vec<String>,
    pub reactions: Vec<ReactionSpec>,
}

type Participants = SmallVec<[(usize, f64); 4]>;

#[derive(Debug, Clone)]
struct Reaction {
    reactants: Participants,
    products: Participants,
    forward: RateConstant,
    reverse: RateConstant,
}

/// Mass-action kinetics over a JSON mechanism. The composition is used
/// directly as concentrations; negative values are clamped to zero.
#[derive(Debug, Clone)]
pub struct MassActionModel {
    species: Vec<String>,
    reactions: Vec<Reaction>,
}

impl MassActionModel {
    pub fn from_spec(spec: MechanismSpec) -> ReduceResult<Self> {
        let mut index: FxHashMap<&str, usize> = FxHashMap::default();
        for (i, name) in spec.species.iter().enumerate() {
            if index.insert(name.as_str(), i).is_some() {
                return Err(ReduceError::Config(format!("Duplicate species {}", name)));
            }
        }

        let resolve = |side: &BTreeMap<String, f64>, reaction: usize| -> ReduceResult<Participants> {
            side.iter()
                .map(|(name, &coeff)| {
                    let i = index.get(name.as_str()).copied().ok_or_else(|| {
                        ReduceError::Config(format!(
                            "Reaction {} references unknown species {}",
                            reaction, name
                        ))
                    })?;
                    if !(coeff.is_finite() && coeff > 0.0) {
                        return Err(ReduceError::Config(format!(
                            "Reaction {} has invalid coefficient {} for {}",
                            reaction, coeff, name
                        )));
                    }
                    Ok((i, coeff))
                })
                .collect()
        };

        let reactions = spec
            .reactions
            .iter()
            .enumerate()
            .map(|(i, r)| {
                Ok(Reaction {
                    reactants: resolve(&r.reactants, i)?,
                    products: resolve(&r.products, i)?,
                    forward: r.forward_rate,
                    reverse: r.reverse_rate,
                })
            })
            .collect::<ReduceResult<Vec<_>>>()?;

        Ok(Self { species: spec.species, reactions })
    }

    pub fn from_json_str(json: &str) -> ReduceResult<Self> {
        Self::from_spec(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> ReduceResult<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

fn concentration_product(participants: &Participants, composition: &[f64]) -> f64 {
    participants
        .iter()
        .map(|&(i, nu)| composition[i].max(0.0).powf(nu))
        .product()
}

impl ChemistryEngine for MassActionModel {
    fn species_names(&self) -> &[String] {
        &self.species
    }

    fn n_reactions(&self) -> usize {
        self.reactions.len()
    }

    fn evaluate(&self, state: &ThermoState) -> ReduceResult<RateSnapshot> {
        let n_species = self.species.len();
        let n_reactions = self.reactions.len();
        if state.composition.len() != n_species {
            return Err(ReduceError::Simulation(format!(
                "Composition has {} entries, model has {} species",
                state.composition.len(),
                n_species
            )));
        }
        if !(state.temperature.is_finite() && state.temperature > 0.0) {
            return Err(ReduceError::Simulation(format!(
                "Invalid temperature {}",
                state.temperature
            )));
        }

        let mut reactant_coeffs = vec![0.0; n_species * n_reactions];
        let mut product_coeffs = vec![0.0; n_species * n_reactions];
        let mut net_rates = Vec::with_capacity(n_reactions);
        for (r, reaction) in self.reactions.iter().enumerate() {
            for &(s, nu) in &reaction.reactants {
                reactant_coeffs[s * n_reactions + r] = nu;
            }
            for &(s, nu) in &reaction.products {
                product_coeffs[s * n_reactions + r] = nu;
            }
            let forward = reaction.forward.at(state.temperature)
                * concentration_product(&reaction.reactants, &state.composition);
            let reverse = reaction.reverse.at(state.temperature)
                * concentration_product(&reaction.products, &state.composition);
            net_rates.push(forward - reverse);
        }
        RateSnapshot::new(n_species, net_rates, reactant_coeffs, product_coeffs)
    }
}

/// Loaded models keyed by path. Entries only hold weak handles, so a model
/// is dropped once its last user lets go, and reloaded on the next request.
pub struct ModelCache<M> {
    entries: Mutex<FxHashMap<PathBuf, Weak<M>>>,
}

impl<M> Default for ModelCache<M> {
    fn default() -> Self {
        Self { entries: Mutex::new(FxHashMap::default()) }
    }
}

impl<M> ModelCache<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert_with<F>(&self, path: &Path, loader: F) -> ReduceResult<Arc<M>>
    where
        F: FnOnce(&Path) -> ReduceResult<M>,
    {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, model| model.strong_count() > 0);
        if let Some(model) = entries.get(path).and_then(Weak::upgrade) {
            return Ok(model);
        }
        let model = Arc::new(loader(path)?);
        entries.insert(path.to_path_buf(), Arc::downgrade(&model));
        Ok(model)
    }

    /// Number of models still alive.
    pub fn cached(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|model| model.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MECHANISM: &str = r#"{
        "species": ["H2", "O2", "H2O"],
        "reactions": [
            {
                "equation": "2 H2 + O2 <=> 2 H2O",
                "reactants": {"H2": 2.0, "O2": 1.0},
                "products": {"H2O": 2.0},
                "forward_rate": 2.0,
                "reverse_rate": {"a": 1.0, "b": 0.0, "ea": 0.0}
            }
        ]
    }"#;

    fn state(composition: Vec<f64>) -> ThermoState {
        ThermoState { temperature: 1000.0, pressure: 101325.0, composition }
    }

    #[test]
    fn test_mass_action_rates() {
        let model = MassActionModel::from_json_str(MECHANISM).unwrap();
        assert_eq!(model.n_species(), 3);
        assert_eq!(model.species_index("O2"), Some(1));

        let snapshot = model.evaluate(&state(vec![1.0, 2.0, 0.5])).unwrap();
        // 2 * 1^2 * 2 - 1 * 0.5^2
        assert!((snapshot.net_rates()[0] - 3.75).abs() < 1e-12);
        assert_eq!(snapshot.reactant(0, 0), 2.0);
        assert_eq!(snapshot.product(2, 0), 2.0);
        assert_eq!(snapshot.net_coefficient(1, 0), -1.0);
    }

    #[test]
    fn test_negative_concentrations_clamped() {
        let model = MassActionModel::from_json_str(MECHANISM).unwrap();
        let snapshot = model.evaluate(&state(vec![-1.0, 1.0, 0.0])).unwrap();
        assert_eq!(snapshot.net_rates()[0], 0.0);
    }

    #[test]
    fn test_rejects_bad_input() {
        let model = MassActionModel::from_json_str(MECHANISM).unwrap();
        assert!(model.evaluate(&state(vec![1.0])).is_err());

        let unknown = MECHANISM.replace("\"O2\": 1.0", "\"N2\": 1.0");
        assert!(matches!(MassActionModel::from_json_str(&unknown), Err(ReduceError::Config(_))));
    }

    #[test]
    fn test_arrhenius_rate() {
        let k = RateConstant::Arrhenius { a: 2.0, b: 1.0, ea: 0.0 };
        assert_eq!(k.at(300.0), 600.0);
    }

    #[test]
    fn test_state_array_layout() {
        let original = state(vec![0.1, 0.2, 0.7]);
        let array = original.to_array();
        assert_eq!(array[..2], [1000.0, 101325.0]);
        assert_eq!(ThermoState::from_array(&array, 3).unwrap(), original);
        assert!(ThermoState::from_array(&array, 4).is_err());
    }

    #[test]
    fn test_model_cache_drops_unused_models() {
        let cache: ModelCache<MassActionModel> = ModelCache::new();
        let path = Path::new("mechanism.json");
        let mut loads = 0;

        let first = cache
            .get_or_insert_with(path, |_| {
                loads += 1;
                MassActionModel::from_json_str(MECHANISM)
            })
            .unwrap();
        let second = cache
            .get_or_insert_with(path, |_| {
                loads += 1;
                MassActionModel::from_json_str(MECHANISM)
            })
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loads, 1);
        assert_eq!(cache.cached(), 1);

        drop(first);
        drop(second);
        assert_eq!(cache.cached(), 0);
        cache
            .get_or_insert_with(path, |_| {
                loads += 1;
                MassActionModel::from_json_str(MECHANISM)
            })
            .unwrap();
        assert_eq!(loads, 2);
    }
}
