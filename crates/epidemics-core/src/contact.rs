//! Contact-mixing structure for granular models.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{EpiError, EpiResult};
use crate::params::Dimensions;

/// Labeled square mixing matrix, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactMatrix {
    labels: Vec<String>,
    data: Vec<f64>,
}

impl ContactMatrix {
    pub fn new(labels: Vec<String>, rows: Vec<Vec<f64>>) -> EpiResult<Self> {
        let n = labels.len();
        if rows.len() != n || rows.iter().any(|r| r.len() != n) {
            return Err(EpiError::InvalidInput(format!(
                "contact matrix must be {n}x{n} to match its {n} labels"
            )));
        }
        Ok(Self {
            labels,
            data: rows.into_iter().flatten().collect(),
        })
    }

    /// Identity matrix: no mixing across categories.
    pub fn identity(labels: Vec<String>) -> Self {
        let n = labels.len();
        let mut data = vec![0.0; n * n];
        for i in 0..n {
            data[i * n + i] = 1.0;
        }
        Self { labels, data }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn row(&self, label: &str) -> Option<&[f64]> {
        let n = self.len();
        let i = self.labels.iter().position(|l| l == label)?;
        Some(&self.data[i * n..(i + 1) * n])
    }

    /// Kronecker product; combined labels are `"{a}_{b}"` in product order,
    /// matching the joined dimension tuples of a two-level layout.
    pub fn kronecker(&self, other: &ContactMatrix) -> ContactMatrix {
        let (na, nb) = (self.len(), other.len());
        let n = na * nb;
        let mut labels = Vec::with_capacity(n);
        for la in &self.labels {
            for lb in &other.labels {
                labels.push(format!("{la}_{lb}"));
            }
        }
        let mut data = vec![0.0; n * n];
        for ia in 0..na {
            for ja in 0..na {
                let a = self.data[ia * na + ja];
                for ib in 0..nb {
                    for jb in 0..nb {
                        let row = ia * nb + ib;
                        let col = ja * nb + jb;
                        data[row * n + col] = a * other.data[ib * nb + jb];
                    }
                }
            }
        }
        ContactMatrix { labels, data }
    }
}

/// Per-level contact matrices combined into one master matrix indexed by
/// joined dimension tuples.
///
/// Levels with no supplied matrix default to identity (no cross-category
/// mixing). Built once at model construction; read-only afterwards.
#[derive(Debug, Clone)]
pub struct ContactStructure {
    per_level: HashMap<String, ContactMatrix>,
    combined: ContactMatrix,
}

impl ContactStructure {
    pub fn build(dims: &Dimensions, given: HashMap<String, ContactMatrix>) -> EpiResult<Self> {
        for level in given.keys() {
            if dims.level_index(level).is_none() {
                return Err(EpiError::UnknownDimension(level.clone()));
            }
        }

        let mut per_level = HashMap::new();
        let mut combined: Option<ContactMatrix> = None;
        for (level, categories) in dims.levels() {
            let matrix = match given.get(level) {
                Some(m) => {
                    if m.len() != categories.len() {
                        return Err(EpiError::ContactShape {
                            level: level.clone(),
                            expected: categories.len(),
                            rows: m.len(),
                            cols: m.len(),
                        });
                    }
                    if m.labels() != categories.as_slice() {
                        return Err(EpiError::InvalidInput(format!(
                            "contact matrix labels for level `{level}` must match its declared categories in order"
                        )));
                    }
                    m.clone()
                }
                None => ContactMatrix::identity(categories.clone()),
            };
            combined = Some(match combined {
                Some(acc) => acc.kronecker(&matrix),
                None => matrix.clone(),
            });
            per_level.insert(level.clone(), matrix);
        }

        let combined = combined.ok_or(EpiError::NoDimensions)?;
        Ok(Self {
            per_level,
            combined,
        })
    }

    pub fn level(&self, name: &str) -> Option<&ContactMatrix> {
        self.per_level.get(name)
    }

    pub fn combined(&self) -> &ContactMatrix {
        &self.combined
    }

    /// Mixing vector for one dimension tuple, in dimension-product order.
    pub fn row(&self, tuple: &[String]) -> EpiResult<Vec<f64>> {
        let key = tuple.join("_");
        self.combined
            .row(&key)
            .map(|r| r.to_vec())
            .ok_or_else(|| EpiError::InvalidInput(format!("no contact row for tuple `{key}`")))
    }
}
