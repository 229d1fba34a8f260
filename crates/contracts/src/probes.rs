//! Persona-probe contracts for cognitive validation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::OrdinalScale;

/// One replicate answer from a designed persona about one construct.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeResponse {
    pub persona_id: String,
    pub replicate: u32,
    pub construct: String,
    /// Raw label as returned; normalized against the construct's scale.
    pub level: String,
}

impl ProbeResponse {
    pub fn new(
        persona_id: impl Into<String>,
        replicate: u32,
        construct: impl Into<String>,
        level: impl Into<String>,
    ) -> Self {
        Self {
            persona_id: persona_id.into(),
            replicate,
            construct: construct.into(),
            level: level.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedDirection {
    Increase,
    Decrease,
}

/// Two personas identical except along `varied_dimension`; moving from
/// `baseline` to `varied` should shift `construct` in `expected` direction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectionalPair {
    pub baseline: String,
    pub varied: String,
    pub varied_dimension: String,
    pub construct: String,
    pub expected: ExpectedDirection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProbeConfig {
    pub scales: BTreeMap<String, OrdinalScale>,
    pub directional_pairs: Vec<DirectionalPair>,
    pub icc_threshold: f64,
    pub eta_squared_threshold: f64,
    pub directional_threshold: f64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            scales: BTreeMap::new(),
            directional_pairs: Vec::new(),
            icc_threshold: 0.6,
            eta_squared_threshold: 0.14,
            directional_threshold: 0.75,
        }
    }
}
