use crate::prelude::*;

use serde::Deserialize;
use std::collections::HashMap;

const BUILTIN_FLAGS: &str = include_str!("../../config/event_flags.yaml");

#[derive(Clone, Debug, Default, Deserialize)]
struct ModelFlags {
    #[serde(default)]
    bits: HashMap<u8, String>,
    #[serde(default)]
    fields: HashMap<String, HashMap<u8, String>>,
    /// enum16 field -> code -> name
    #[serde(default)]
    enums: HashMap<String, HashMap<u16, String>>,
}

#[derive(Debug, Default, Deserialize)]
struct FlagsFile {
    #[serde(default)]
    models: HashMap<u16, ModelFlags>,
}

/// Read-only bit-name and enum-name tables, keyed by model id.
///
/// A bit with no entry is described as `bit N`, an enum code with no entry
/// as `value N`.
#[derive(Clone, Debug, Default)]
pub struct FlagLookup {
    models: HashMap<u16, ModelFlags>,
}

impl FlagLookup {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN_FLAGS)
    }

    pub fn from_file(file: &str) -> Result<Self> {
        info!("Reading flag names from {}", file);
        let content = std::fs::read_to_string(file)
            .map_err(|err| file_error!("error reading {}: {}", file, err))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let file: FlagsFile = serde_yaml::from_str(content)?;
        Ok(Self {
            models: file.models,
        })
    }

    pub fn describe(&self, model_id: u16, field: &str, bit: u8) -> String {
        self.models
            .get(&model_id)
            .and_then(|m| {
                m.fields
                    .get(field)
                    .and_then(|bits| bits.get(&bit))
                    .or_else(|| m.bits.get(&bit))
            })
            .cloned()
            .unwrap_or_else(|| format!("bit {}", bit))
    }

    /// Name of an enum code, or None when the field has no table at all.
    pub fn enum_name(&self, model_id: u16, field: &str, code: u16) -> Option<String> {
        let table = self.models.get(&model_id)?.enums.get(field)?;
        Some(
            table
                .get(&code)
                .cloned()
                .unwrap_or_else(|| format!("value {}", code)),
        )
    }

    pub fn has_enum(&self, model_id: u16, field: &str) -> bool {
        self.models
            .get(&model_id)
            .is_some_and(|m| m.enums.contains_key(field))
    }

    /// Names of the set bits in `raw`, lowest bit first.
    pub fn active(&self, model_id: u16, field: &str, raw: u32, width: u8) -> Vec<String> {
        (0..width)
            .filter(|bit| raw & (1u32 << bit) != 0)
            .map(|bit| self.describe(model_id, field, bit))
            .collect()
    }
}
