//! Region-restricted merging
//!
//! A region policy decides which parameters keep the merged value. Every
//! other parameter takes its value from the plain average of the fine-tuned
//! models. Two policies exist and at most one may be configured:
//! - a range of encoder layers (`...layers.<i>....` in the parameter name)
//! - a module-name substring

use crate::state_dict::StateDict;
use crate::{MergeError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::debug;

/// Selects a single encoder layer
pub const LAYER_ID_VAR: &str = "LAYER_ID";
/// Selects a preset (`early`, `middle`, `late`, `middle+late`) or `start:end`
pub const LAYER_RANGE_VAR: &str = "MERGE_LAYER_RANGE";
/// Selects parameters whose name contains the given substring
pub const MODULE_VAR: &str = "MODULE_TO_MERGE";

/// Index of the first `layers.<i>.` segment in a dotted parameter name
pub fn layer_index(key: &str) -> Option<usize> {
    const MARKER: &str = "layers.";
    key.match_indices(MARKER).find_map(|(pos, _)| {
        let rest = &key[pos + MARKER.len()..];
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 || !rest[digits..].starts_with('.') {
            return None;
        }
        rest[..digits].parse().ok()
    })
}

/// Named thirds of the encoder stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerPreset {
    #[serde(rename = "early")]
    Early,
    #[serde(rename = "middle")]
    Middle,
    #[serde(rename = "late")]
    Late,
    #[serde(rename = "middle+late")]
    MiddleLate,
}

impl LayerPreset {
    /// Inclusive bounds for a stack of `num_layers` layers.
    ///
    /// Thirds are computed in floating point and truncated toward zero, so
    /// `early` on a one-layer stack is `[0, 0]` and an empty stack selects
    /// nothing.
    pub fn range(self, num_layers: usize) -> LayerRange {
        let n = num_layers as f64;
        let third = n / 3.0;
        let (start, end) = match self {
            Self::Early => (0.0, third - 1.0),
            Self::Middle => (third, 2.0 * third - 1.0),
            Self::Late => (2.0 * third, n - 1.0),
            Self::MiddleLate => (third, n - 1.0),
        };
        LayerRange::new(start as i64, end as i64)
    }
}

impl FromStr for LayerPreset {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "early" => Ok(Self::Early),
            "middle" => Ok(Self::Middle),
            "late" => Ok(Self::Late),
            "middle+late" => Ok(Self::MiddleLate),
            other => Err(MergeError::ConfigError(format!(
                "Unknown layer preset '{other}'"
            ))),
        }
    }
}

/// Inclusive layer range; `start > end` selects nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRange {
    pub start: i64,
    pub end: i64,
}

impl LayerRange {
    /// Create a range
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Whether `layer` falls inside the range
    pub fn contains(&self, layer: usize) -> bool {
        let layer = layer as i64;
        self.start <= layer && layer <= self.end
    }
}

/// How the layer range is specified
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerSelection {
    /// One layer
    Single(usize),
    /// Explicit inclusive bounds
    Range { start: usize, end: usize },
    /// Proportional third of the encoder stack
    Preset(LayerPreset),
}

impl LayerSelection {
    /// Concrete range for a stack of `num_layers` layers
    pub fn resolve(&self, num_layers: usize) -> LayerRange {
        match *self {
            Self::Single(i) => LayerRange::new(i as i64, i as i64),
            Self::Range { start, end } => LayerRange::new(start as i64, end as i64),
            Self::Preset(preset) => preset.range(num_layers),
        }
    }

    fn needs_layer_count(&self) -> bool {
        matches!(self, Self::Preset(_))
    }
}

impl FromStr for LayerSelection {
    type Err = MergeError;

    /// Accepts a preset name, `start:end`, or a single index
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some((start, end)) = s.split_once(':') {
            return Ok(Self::Range {
                start: parse_layer(start)?,
                end: parse_layer(end)?,
            });
        }
        if s.chars().all(|c| c.is_ascii_digit()) && !s.is_empty() {
            return Ok(Self::Single(parse_layer(s)?));
        }
        s.parse().map(Self::Preset)
    }
}

fn parse_layer(raw: &str) -> Result<usize> {
    raw.trim()
        .parse()
        .map_err(|_| MergeError::ConfigError(format!("Invalid layer index '{raw}'")))
}

/// Region restriction settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    /// Layers that keep the merged value
    pub layers: Option<LayerSelection>,
    /// Substring of parameter names that keep the merged value
    pub module_filter: Option<String>,
}

impl RegionConfig {
    /// Restrict merging to a layer selection
    pub fn layers(selection: LayerSelection) -> Self {
        Self {
            layers: Some(selection),
            module_filter: None,
        }
    }

    /// Restrict merging to parameters containing `filter`
    pub fn module(filter: impl Into<String>) -> Self {
        Self {
            layers: None,
            module_filter: Some(filter.into()),
        }
    }

    /// Read `LAYER_ID`, `MERGE_LAYER_RANGE` and `MODULE_TO_MERGE` from the
    /// process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. `MERGE_LAYER_RANGE` takes
    /// precedence over `LAYER_ID`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut layers = None;
        if let Some(raw) = lookup(LAYER_ID_VAR) {
            layers = Some(LayerSelection::Single(parse_layer(&raw)?));
        }
        if let Some(raw) = lookup(LAYER_RANGE_VAR) {
            layers = Some(raw.parse()?);
        }

        let config = Self {
            layers,
            module_filter: lookup(MODULE_VAR),
        };
        config.validate()?;
        Ok(config)
    }

    /// Whether any restriction is configured
    pub fn is_active(&self) -> bool {
        self.layers.is_some() || self.module_filter.is_some()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.layers.is_some() && self.module_filter.is_some() {
            return Err(MergeError::ConfigError(
                "Layer range and module filter are mutually exclusive".into(),
            ));
        }
        if matches!(self.module_filter.as_deref(), Some("")) {
            return Err(MergeError::ConfigError("Module filter is empty".into()));
        }
        Ok(())
    }
}

/// Resolved selection policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionPolicy {
    /// Keys whose layer index falls inside the range
    Layers(LayerRange),
    /// Keys containing the substring
    Module(String),
}

/// Chooses, per parameter, between the merged value and the plain average
#[derive(Debug, Clone)]
pub struct RegionRestrictor {
    policy: RegionPolicy,
}

impl RegionRestrictor {
    /// Create a restrictor from a resolved policy
    pub fn new(policy: RegionPolicy) -> Self {
        Self { policy }
    }

    /// Resolve a config into a restrictor. `num_layers` is only consulted
    /// for presets. Returns `None` when no restriction is configured.
    pub fn from_config<F>(config: &RegionConfig, num_layers: F) -> Result<Option<Self>>
    where
        F: FnOnce() -> Result<usize>,
    {
        config.validate()?;
        let policy = match (&config.layers, &config.module_filter) {
            (Some(selection), _) => {
                let n = if selection.needs_layer_count() {
                    num_layers()?
                } else {
                    0
                };
                RegionPolicy::Layers(selection.resolve(n))
            }
            (None, Some(filter)) => RegionPolicy::Module(filter.clone()),
            (None, None) => return Ok(None),
        };
        Ok(Some(Self::new(policy)))
    }

    /// Active policy
    pub fn policy(&self) -> &RegionPolicy {
        &self.policy
    }

    /// Whether `key` keeps the merged value
    pub fn selects(&self, key: &str) -> bool {
        match &self.policy {
            RegionPolicy::Layers(range) => layer_index(key).is_some_and(|i| range.contains(i)),
            RegionPolicy::Module(filter) => key.contains(filter.as_str()),
        }
    }

    /// Keep merged values on selected keys and averaged values elsewhere
    pub fn apply(&self, merged: StateDict, average: &StateDict) -> Result<StateDict> {
        merged.check_same_keys(average)?;

        let mut out = StateDict::new();
        let mut kept = 0usize;
        for (key, tensor) in merged.iter() {
            if self.selects(key) {
                kept += 1;
                out.insert(tensor.clone());
            } else {
                out.insert(average.require(key)?.clone());
            }
        }
        debug!(policy = ?self.policy, kept, total = merged.len(), "region restriction applied");
        Ok(out)
    }
}
