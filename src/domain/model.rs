//! Per-user persistent model rows.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    #[serde(rename = "keyboard_hst")]
    Hst,
    #[serde(rename = "keyboard_identity")]
    Identity,
}

impl ModelType {
    pub fn column_value(&self) -> &'static str {
        match self {
            ModelType::Hst => "keyboard_hst",
            ModelType::Identity => "keyboard_identity",
        }
    }
}

/// A row as stored in `user_behavior_models`: opaque blob plus versioning and
/// integrity metadata. The blob is the whole scorer (scaler + HST + quantile
/// + Welford stats, or identity equivalent) serialized as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredModel {
    pub user_id: String,
    pub model_type: ModelType,
    pub blob: String,
    pub feature_window_count: u64,
    pub model_version: i64,
    pub checksum: String,
    pub created_at: i64,
    pub updated_at: i64,
}
