//! Directed compartment flow graph.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::error::{EpiError, EpiResult};
use crate::schedule::Rate;
use crate::state::State;

/// Directed graph of compartments whose edges carry rate functions.
///
/// The edge list is materialized once, before any integration; during a solve
/// the graph is read-only, so repeated derivative evaluations are safe.
#[derive(Debug, Default)]
pub struct CompartmentNetwork {
    graph: DiGraph<String, Rate>,
    nodes: HashMap<String, NodeIndex>,
    statics: HashMap<NodeIndex, Rate>,
}

impl CompartmentNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodes<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut network = Self::new();
        for node in nodes {
            network.add_node(node.as_ref());
        }
        network
    }

    /// Add a node; a second add of the same name is a no-op.
    pub fn add_node(&mut self, name: &str) -> NodeIndex {
        match self.nodes.get(name) {
            Some(&idx) => idx,
            None => {
                let idx = self.graph.add_node(name.to_string());
                self.nodes.insert(name.to_string(), idx);
                idx
            }
        }
    }

    /// Add (or replace) the rated edge `source -> target`.
    pub fn add_transition(&mut self, source: &str, target: &str, rate: impl Into<Rate>) {
        let a = self.add_node(source);
        let b = self.add_node(target);
        self.graph.update_edge(a, b, rate.into());
    }

    /// Register an exogenous term added directly to one node's derivative,
    /// for sources and sinks not modeled as inter-compartment flow.
    pub fn add_static_derivative(&mut self, node: &str, rate: impl Into<Rate>) {
        let idx = self.add_node(node);
        self.statics.insert(idx, rate.into());
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains_node(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub(crate) fn node_index(&self, name: &str) -> Option<NodeIndex> {
        self.nodes.get(name).copied()
    }

    /// Derivative of one node by index: Σ incoming − Σ outgoing + static.
    /// Infallible by construction; rates are scalar-valued.
    pub(crate) fn node_derivative(&self, idx: NodeIndex, y: &State, t: f64) -> f64 {
        let mut derivative = 0.0;
        for edge in self.graph.edges_directed(idx, Direction::Incoming) {
            derivative += edge.weight().eval(y, t);
        }
        for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
            derivative -= edge.weight().eval(y, t);
        }
        if let Some(rate) = self.statics.get(&idx) {
            derivative += rate.eval(y, t);
        }
        derivative
    }

    /// Derivative of one node by name, with a finiteness check.
    pub fn compute_derivative(&self, node: &str, y: &State, t: f64) -> EpiResult<f64> {
        let idx = self
            .node_index(node)
            .ok_or_else(|| EpiError::UnknownCompartment(node.to_string()))?;
        let derivative = self.node_derivative(idx, y, t);
        if !derivative.is_finite() {
            return Err(EpiError::NonFiniteDerivative {
                compartment: node.to_string(),
                t,
            });
        }
        Ok(derivative)
    }

    /// Derivative vector in exactly the supplied node order — the order must
    /// match the compartment ordering used to build the state vector.
    pub fn compute_derivatives(&self, order: &[String], y: &State, t: f64) -> EpiResult<Vec<f64>> {
        order
            .iter()
            .map(|node| self.compute_derivative(node, y, t))
            .collect()
    }
}
