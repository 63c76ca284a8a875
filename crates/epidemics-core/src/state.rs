//! Compartment name expansion and the per-step state vector.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{EpiError, EpiResult};
use crate::params::Dimensions;

/// Ordered compartment layout shared by a model and every state vector it
/// produces.
///
/// Compartment identity is the expanded name: `"{base}"` without dimensions,
/// `"{base}_{cat1}_{cat2}…"` with them. The expansion is base-major over the
/// cross product of dimension categories, and this order is exactly the order
/// of the numeric vector handed to the ODE integrator.
#[derive(Debug, Clone)]
pub struct StateLayout {
    bases: Vec<String>,
    compartments: Vec<String>,
    index: HashMap<String, usize>,
    groups: HashMap<String, Vec<usize>>,
}

impl StateLayout {
    pub fn new(bases: &[String], dims: &Dimensions) -> Self {
        let mut compartments = Vec::new();
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();

        if dims.is_empty() {
            for base in bases {
                groups
                    .entry(base.clone())
                    .or_default()
                    .push(compartments.len());
                compartments.push(base.clone());
            }
        } else {
            let product = dims.product();
            for base in bases {
                for tuple in &product {
                    groups
                        .entry(base.clone())
                        .or_default()
                        .push(compartments.len());
                    compartments.push(expand_name(base, tuple));
                }
            }
        }

        let index = compartments
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        Self {
            bases: bases.to_vec(),
            compartments,
            index,
            groups,
        }
    }

    /// Declared base state names, in declaration order.
    pub fn bases(&self) -> &[String] {
        &self.bases
    }

    /// Expanded compartment names, in ODE vector order.
    pub fn compartments(&self) -> &[String] {
        &self.compartments
    }

    pub fn len(&self) -> usize {
        self.compartments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compartments.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Indices of all compartments expanded from `base`, in dimension-product
    /// order. A non-granular compartment is its own singleton group.
    pub fn group_indices(&self, base: &str) -> Option<&[usize]> {
        self.groups.get(base).map(|v| v.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }
}

/// Expanded compartment name for a base state and a dimension tuple.
pub fn expand_name(base: &str, tuple: &[String]) -> String {
    if tuple.is_empty() {
        base.to_string()
    } else {
        format!("{}_{}", base, tuple.join("_"))
    }
}

/// A snapshot of every compartment at one instant.
///
/// Constructed by the integrator at each evaluation from the raw numeric
/// vector; ephemeral, never retained across steps.
#[derive(Debug, Clone)]
pub struct State {
    layout: Arc<StateLayout>,
    values: Vec<f64>,
}

impl State {
    pub(crate) fn new(layout: Arc<StateLayout>, values: Vec<f64>) -> EpiResult<Self> {
        if values.len() != layout.len() {
            return Err(EpiError::StateLength {
                expected: layout.len(),
                got: values.len(),
            });
        }
        Ok(Self { layout, values })
    }

    /// Value of one compartment by its expanded name.
    ///
    /// Panics on an unknown name: rate functions are written against the
    /// declared compartments, so a miss is a modeling bug, not a data issue.
    pub fn get(&self, name: &str) -> f64 {
        match self.layout.position(name) {
            Some(i) => self.values[i],
            None => panic!("unknown compartment `{name}` in state lookup"),
        }
    }

    /// All values expanded from `base`, in dimension-product order (the same
    /// order as a contact-matrix row).
    pub fn group(&self, base: &str) -> Vec<f64> {
        match self.layout.group_indices(base) {
            Some(indices) => indices.iter().map(|&i| self.values[i]).collect(),
            None => panic!("unknown compartment group `{base}` in state lookup"),
        }
    }

    pub fn group_sum(&self, base: &str) -> f64 {
        self.group(base).iter().sum()
    }

    /// Total population of this snapshot.
    pub fn sum(&self) -> f64 {
        self.values.iter().sum()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    /// `(expanded name, value)` pairs in vector order.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        self.layout
            .compartments()
            .iter()
            .cloned()
            .zip(self.values.iter().copied())
            .collect()
    }
}

/// Accepted inputs for building a full state vector.
#[derive(Debug, Clone)]
pub enum StateInput {
    /// One value per compartment, in layout order.
    Values(Vec<f64>),
    /// Partial mapping; compartments not named are zero-filled.
    Map(BTreeMap<String, f64>),
    /// Seed count: `N − seed` in the first compartment, `seed` in the model's
    /// start state (or the second compartment when none is declared).
    Seed(f64),
}

impl From<Vec<f64>> for StateInput {
    fn from(values: Vec<f64>) -> Self {
        StateInput::Values(values)
    }
}

impl From<&[f64]> for StateInput {
    fn from(values: &[f64]) -> Self {
        StateInput::Values(values.to_vec())
    }
}

impl From<BTreeMap<String, f64>> for StateInput {
    fn from(map: BTreeMap<String, f64>) -> Self {
        StateInput::Map(map)
    }
}

impl From<f64> for StateInput {
    fn from(seed: f64) -> Self {
        StateInput::Seed(seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Dimensions;

    fn bases(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_layout_without_dimensions() {
        let layout = StateLayout::new(&bases(&["S", "I", "R"]), &Dimensions::new());
        assert_eq!(layout.compartments(), &["S", "I", "R"]);
        assert_eq!(layout.position("I"), Some(1));
        assert_eq!(layout.group_indices("R"), Some(&[2][..]));
    }

    #[test]
    fn test_layout_cross_product_order() {
        let dims = Dimensions::new().with_level("category", &["young", "adult", "senior"]);
        let layout = StateLayout::new(&bases(&["S", "I"]), &dims);
        assert_eq!(
            layout.compartments(),
            &[
                "S_young", "S_adult", "S_senior", "I_young", "I_adult", "I_senior"
            ]
        );
        // Group lookup returns the dimension-product order.
        assert_eq!(layout.group_indices("I"), Some(&[3, 4, 5][..]));
    }

    #[test]
    fn test_state_group_lookup() {
        let dims = Dimensions::new().with_level("category", &["young", "old"]);
        let layout = Arc::new(StateLayout::new(&bases(&["S", "I"]), &dims));
        let y = State::new(layout, vec![10.0, 20.0, 1.0, 2.0]).unwrap();
        assert_eq!(y.get("S_old"), 20.0);
        assert_eq!(y.group("I"), vec![1.0, 2.0]);
        assert_eq!(y.group_sum("S"), 30.0);
        assert_eq!(y.sum(), 33.0);
    }

    #[test]
    fn test_state_length_mismatch() {
        let layout = Arc::new(StateLayout::new(&bases(&["S", "I"]), &Dimensions::new()));
        let err = State::new(layout, vec![1.0]).unwrap_err();
        assert!(matches!(
            err,
            EpiError::StateLength {
                expected: 2,
                got: 1
            }
        ));
    }
}
