use crate::prelude::*;

use serde::Deserialize;
use std::collections::HashMap;

const BUILTIN_SCHEMA: &str = include_str!("../../config/sunspec_models.yaml");

/// Widest scale factor we accept; anything outside is treated as not implemented.
pub const MAX_SCALE_FACTOR: i32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Int16,
    Uint16,
    Enum16,
    Bitfield16,
    Sunssf,
    Int32,
    Uint32,
    Acc32,
    Bitfield32,
    String,
    Pad,
}

impl FieldType {
    /// Register count occupied by a field of this type. Strings carry their own size.
    pub fn words(&self, size: Option<u16>) -> u16 {
        match self {
            FieldType::Int32 | FieldType::Uint32 | FieldType::Acc32 | FieldType::Bitfield32 => 2,
            FieldType::String => size.unwrap_or(1),
            _ => 1,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FieldType::Int16
                | FieldType::Uint16
                | FieldType::Enum16
                | FieldType::Int32
                | FieldType::Uint32
                | FieldType::Acc32
        )
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub offset: u16,
    #[serde(rename = "type")]
    pub kind: FieldType,
    /// Name of the sunssf field scaling this one.
    #[serde(default)]
    pub sf: Option<String>,
    #[serde(default)]
    pub units: Option<String>,
    #[serde(default)]
    pub size: Option<u16>,
}

impl FieldDef {
    pub fn words(&self) -> u16 {
        self.kind.words(self.size)
    }

    pub fn end(&self) -> usize {
        self.offset as usize + self.words() as usize
    }
}

/// A block repeated after the fixed part of a model, e.g. one per MPPT tracker.
#[derive(Clone, Debug, Deserialize)]
pub struct RepeatDef {
    /// Fixed-part field holding the number of repeats.
    pub count: String,
    pub length: u16,
    pub prefix: String,
    pub fields: Vec<FieldDef>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ModelDef {
    pub id: u16,
    pub name: String,
    /// Data length (after the 2-word header) of the fixed part.
    pub length: u16,
    #[serde(default)]
    pub alt_lengths: Vec<u16>,
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub repeat: Option<RepeatDef>,
}

impl ModelDef {
    /// Number of repeating blocks a body of `len` words implies, or None if
    /// the length does not fit this model.
    pub fn repeats_for(&self, len: usize) -> Option<usize> {
        match &self.repeat {
            None => {
                if len == self.length as usize
                    || self.alt_lengths.iter().any(|l| *l as usize == len)
                {
                    Some(0)
                } else {
                    None
                }
            }
            Some(repeat) => {
                let fixed = self.length as usize;
                let block = repeat.length as usize;
                if len < fixed || block == 0 || (len - fixed) % block != 0 {
                    None
                } else {
                    Some((len - fixed) / block)
                }
            }
        }
    }

    pub fn expected_length(&self) -> String {
        match &self.repeat {
            Some(repeat) => format!("{} + N*{}", self.length, repeat.length),
            None if self.alt_lengths.is_empty() => self.length.to_string(),
            None => {
                let alts: Vec<String> = self.alt_lengths.iter().map(|l| l.to_string()).collect();
                format!("{} (or {})", self.length, alts.join(", "))
            }
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn validate(&self) -> Result<()> {
        check_fields(self.id, &self.fields, self.length, &self.fields)?;
        if let Some(repeat) = &self.repeat {
            match self.field(&repeat.count) {
                Some(f) if f.kind.is_numeric() => {}
                _ => bail!(
                    "model {}: repeat count {} is not a numeric field",
                    self.id,
                    repeat.count
                ),
            }
            let mut scope: Vec<FieldDef> = self.fields.clone();
            scope.extend(repeat.fields.iter().cloned());
            check_fields(self.id, &repeat.fields, repeat.length, &scope)?;
        }
        Ok(())
    }
}

fn check_fields(model_id: u16, fields: &[FieldDef], length: u16, scope: &[FieldDef]) -> Result<()> {
    for field in fields {
        if field.end() > length as usize {
            bail!(
                "model {}: field {} ends at word {} beyond length {}",
                model_id,
                field.name,
                field.end(),
                length
            );
        }
        if let Some(sf) = &field.sf {
            match scope.iter().find(|f| &f.name == sf) {
                Some(f) if f.kind == FieldType::Sunssf => {}
                Some(_) => bail!("model {}: {} is not a sunssf field", model_id, sf),
                None => bail!(
                    "model {}: field {} references unknown scale factor {}",
                    model_id,
                    field.name,
                    sf
                ),
            }
        }
    }
    Ok(())
}

#[derive(Deserialize)]
struct SchemaFile {
    models: Vec<ModelDef>,
}

/// Field layouts for every model id we know how to decode.
#[derive(Clone, Debug, Default)]
pub struct ModelSchema {
    models: HashMap<u16, ModelDef>,
}

impl ModelSchema {
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN_SCHEMA)
    }

    pub fn from_file(file: &str) -> Result<Self> {
        info!("Reading model schema from {}", file);
        let content = std::fs::read_to_string(file)
            .map_err(|err| file_error!("error reading {}: {}", file, err))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let file: SchemaFile = serde_yaml::from_str(content)?;

        let mut models = HashMap::new();
        for model in file.models {
            model.validate()?;
            let id = model.id;
            if models.insert(id, model).is_some() {
                bail!("model {} defined twice", id);
            }
        }

        Ok(Self { models })
    }

    pub fn model(&self, id: u16) -> Option<&ModelDef> {
        self.models.get(&id)
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelDef> {
        self.models.values()
    }

    pub fn contains(&self, id: u16) -> bool {
        self.models.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
