//! Multi-dimensional parameter storage.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{EpiError, EpiResult};
use crate::schedule::Rate;

/// Ordered categorical axes along which compartments and parameters are
/// replicated (e.g. `category -> [young, adult, senior]`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    levels: Vec<(String, Vec<String>)>,
}

impl Dimensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, name: impl Into<String>, categories: &[&str]) -> Self {
        self.levels.push((
            name.into(),
            categories.iter().map(|c| c.to_string()).collect(),
        ));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn levels(&self) -> &[(String, Vec<String>)] {
        &self.levels
    }

    pub fn level_index(&self, name: &str) -> Option<usize> {
        self.levels.iter().position(|(n, _)| n == name)
    }

    pub fn categories(&self, name: &str) -> Option<&[String]> {
        self.levels
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, cats)| cats.as_slice())
    }

    /// Cross product of all level categories, in declaration order.
    pub fn product(&self) -> Vec<Vec<String>> {
        let mut tuples: Vec<Vec<String>> = vec![Vec::new()];
        for (_, categories) in &self.levels {
            let mut next = Vec::with_capacity(tuples.len() * categories.len());
            for tuple in &tuples {
                for cat in categories {
                    let mut extended = tuple.clone();
                    extended.push(cat.clone());
                    next.push(extended);
                }
            }
            tuples = next;
        }
        tuples
    }
}

/// One parameter value: a scalar, a per-dimension table, or a time-dependent
/// schedule. The variant is fixed when the parameter is inserted, never
/// re-inspected per evaluation.
#[derive(Debug, Clone)]
pub enum ParamValue {
    Scalar(f64),
    /// One value per category of a single dimension level.
    PerCategory {
        level: String,
        values: HashMap<String, f64>,
    },
    /// One value per full dimension tuple, keyed by the joined tuple
    /// (`"young"`, `"young_urban"`, …).
    PerTuple(HashMap<String, f64>),
    TimeVarying(Rate),
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Scalar(value)
    }
}

impl From<Rate> for ParamValue {
    fn from(rate: Rate) -> Self {
        ParamValue::TimeVarying(rate)
    }
}

/// Named-parameter storage keyed by zero or more categorical axes.
///
/// Lookups resolve `(parameter name, dimension tuple)` to a scalar; every
/// parameter referenced by a granular rate factory must resolve for every
/// tuple in use.
#[derive(Debug, Clone, Default)]
pub struct ParamTable {
    dims: Dimensions,
    values: HashMap<String, ParamValue>,
}

impl ParamTable {
    pub fn new(dims: Dimensions) -> Self {
        Self {
            dims,
            values: HashMap::new(),
        }
    }

    pub fn dimensions(&self) -> &Dimensions {
        &self.dims
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.values.insert(name.into(), value.into());
    }

    /// Insert one value per category of `level`.
    pub fn insert_per_category(
        &mut self,
        name: impl Into<String>,
        level: &str,
        values: &[(&str, f64)],
    ) -> EpiResult<()> {
        let categories = self
            .dims
            .categories(level)
            .ok_or_else(|| EpiError::UnknownDimension(level.to_string()))?;
        for (cat, _) in values {
            if !categories.iter().any(|c| c == cat) {
                return Err(EpiError::InvalidInput(format!(
                    "category `{cat}` is not declared on dimension `{level}`"
                )));
            }
        }
        self.values.insert(
            name.into(),
            ParamValue::PerCategory {
                level: level.to_string(),
                values: values
                    .iter()
                    .map(|(c, v)| (c.to_string(), *v))
                    .collect(),
            },
        );
        Ok(())
    }

    /// Resolve a parameter to a scalar for one dimension tuple.
    pub fn get(&self, name: &str, tuple: &[String]) -> EpiResult<f64> {
        let missing = |n: &str| EpiError::MissingParameterValue {
            name: n.to_string(),
            dims: tuple.join(", "),
        };
        match self
            .values
            .get(name)
            .ok_or_else(|| EpiError::UnknownParameter(name.to_string()))?
        {
            ParamValue::Scalar(v) => Ok(*v),
            ParamValue::PerCategory { level, values } => {
                let idx = self
                    .dims
                    .level_index(level)
                    .ok_or_else(|| EpiError::UnknownDimension(level.clone()))?;
                let cat = tuple.get(idx).ok_or_else(|| missing(name))?;
                values.get(cat).copied().ok_or_else(|| missing(name))
            }
            ParamValue::PerTuple(values) => values
                .get(&tuple.join("_"))
                .copied()
                .ok_or_else(|| missing(name)),
            ParamValue::TimeVarying(_) => Err(EpiError::NonScalarParameter(name.to_string())),
        }
    }

    /// Resolve a dimension-free scalar parameter.
    pub fn get_scalar(&self, name: &str) -> EpiResult<f64> {
        self.get(name, &[])
    }

    /// Fetch a parameter as a rate; scalars become constant rates.
    pub fn get_rate(&self, name: &str) -> EpiResult<Rate> {
        match self
            .values
            .get(name)
            .ok_or_else(|| EpiError::UnknownParameter(name.to_string()))?
        {
            ParamValue::Scalar(v) => Ok(Rate::Constant(*v)),
            ParamValue::TimeVarying(rate) => Ok(rate.clone()),
            other => Err(EpiError::InvalidInput(format!(
                "parameter `{name}` is dimension-valued ({other:?}) and has no single rate"
            ))),
        }
    }

    pub fn is_scalar(&self, name: &str) -> bool {
        matches!(self.values.get(name), Some(ParamValue::Scalar(_)))
    }

    /// Total population `N`: the scalar value, or the sum of per-dimension
    /// values over the full cross product.
    pub fn total_population(&self) -> EpiResult<f64> {
        match self.values.get("N") {
            Some(ParamValue::Scalar(v)) => Ok(*v),
            Some(_) => {
                let mut total = 0.0;
                for tuple in self.dims.product() {
                    total += self.get("N", &tuple)?;
                }
                Ok(total)
            }
            None => Err(EpiError::UnknownParameter("N".to_string())),
        }
    }

    /// All parameters that resolve to plain scalars, for persistence.
    pub fn scalar_values(&self) -> BTreeMap<String, f64> {
        self.values
            .iter()
            .filter_map(|(name, value)| match value {
                ParamValue::Scalar(v) => Some((name.clone(), *v)),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn age_dims() -> Dimensions {
        Dimensions::new().with_level("category", &["young", "adult", "senior"])
    }

    #[test]
    fn test_dimension_product() {
        let dims = Dimensions::new()
            .with_level("category", &["young", "old"])
            .with_level("region", &["north", "south"]);
        let product = dims.product();
        assert_eq!(product.len(), 4);
        assert_eq!(product[0], vec!["young", "north"]);
        assert_eq!(product[3], vec!["old", "south"]);
    }

    #[test]
    fn test_scalar_lookup_ignores_dimensions() {
        let mut params = ParamTable::new(age_dims());
        params.insert("beta", 0.5);
        assert_eq!(params.get("beta", &["young".into()]).unwrap(), 0.5);
        assert_eq!(params.get_scalar("beta").unwrap(), 0.5);
    }

    #[test]
    fn test_per_category_lookup() {
        let mut params = ParamTable::new(age_dims());
        params
            .insert_per_category("N", "category", &[("young", 100.0), ("adult", 200.0), ("senior", 50.0)])
            .unwrap();
        assert_eq!(params.get("N", &["adult".into()]).unwrap(), 200.0);
        assert_eq!(params.total_population().unwrap(), 350.0);
    }

    #[test]
    fn test_missing_and_unknown_errors() {
        let mut params = ParamTable::new(age_dims());
        params
            .insert_per_category("N", "category", &[("young", 100.0)])
            .unwrap();
        assert!(matches!(
            params.get("gamma", &[]),
            Err(EpiError::UnknownParameter(_))
        ));
        assert!(matches!(
            params.get("N", &["adult".into()]),
            Err(EpiError::MissingParameterValue { .. })
        ));
        assert!(params
            .insert_per_category("x", "nope", &[("young", 1.0)])
            .is_err());
    }

    #[test]
    fn test_time_varying_is_not_scalar() {
        let mut params = ParamTable::new(Dimensions::new());
        params.insert("beta", Rate::constant(1.0));
        assert!(matches!(
            params.get_scalar("beta"),
            Err(EpiError::NonScalarParameter(_))
        ));
        assert!(params.get_rate("beta").is_ok());
    }
}
