use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;

/// X/Y travel areas in millimeters, keyed by machine model number. Each model
/// variant has a distinct usable plotting area.
const TRAVEL_TABLE: &[(u32, f64, f64)] = &[
    (1, 300.0, 218.0),
    (2, 430.0, 297.0),
    (3, 595.0, 218.0),
    (4, 160.0, 101.6),
    (5, 864.0, 594.0),
    (6, 594.0, 432.0),
];

/// Motion parameters for one machine model variant.
///
/// Every field is optional: an absent config source yields an empty profile
/// and the driver falls back to its firmware defaults. Unrecognized keys in a
/// profile source are carried through untouched so operator options the
/// server does not model still show up in `/status.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelProfile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_pendown: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_penup: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accel: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pen_pos_up: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pen_pos_down: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pen_rate_raise: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pen_rate_lower: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub const_speed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_rotate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reordering: Option<u32>,
    /// Usable X travel in mm.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub travel_x: Option<f64>,
    /// Usable Y travel in mm.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub travel_y: Option<f64>,
    #[serde(flatten)]
    pub extra: IndexMap<String, serde_yaml::Value>,
}

/// Maps a model number to its motion profile.
///
/// Sources are plain YAML files handed over at startup (one per model
/// number); the map is read-only for the process lifetime.
pub struct ConfigResolver {
    sources: HashMap<u32, PathBuf>,
}

impl ConfigResolver {
    pub fn new(sources: HashMap<u32, PathBuf>) -> Self {
        Self { sources }
    }

    /// Look up the profile for `model`. Total: a missing, unreadable, or
    /// malformed source yields an empty profile rather than an error, since
    /// running without a config is a valid degraded state.
    pub async fn resolve(&self, model: u32) -> ModelProfile {
        let Some(path) = self.sources.get(&model) else {
            tracing::debug!("No config source for model {}", model);
            return ModelProfile::default();
        };

        let contents = match fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) => {
                tracing::warn!(
                    "Ignoring unreadable config {} for model {}: {}",
                    path.display(),
                    model,
                    e
                );
                return ModelProfile::default();
            }
        };

        let mut profile = match serde_yaml::from_str::<ModelProfile>(&contents) {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!(
                    "Ignoring malformed config {} for model {}: {}",
                    path.display(),
                    model,
                    e
                );
                return ModelProfile::default();
            }
        };

        // Travel bounds come from the built-in table for the resolved model;
        // values pinned in the source win.
        if let Some((_, x, y)) = TRAVEL_TABLE.iter().find(|(m, _, _)| *m == model) {
            profile.travel_x.get_or_insert(*x);
            profile.travel_y.get_or_insert(*y);
        }

        profile
    }
}
