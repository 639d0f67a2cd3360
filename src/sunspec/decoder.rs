use crate::error::DecodeError;
use crate::sunspec::flags::FlagLookup;
use crate::sunspec::schema::{FieldDef, FieldType, ModelDef, ModelSchema, MAX_SCALE_FACTOR};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const INT16_NOT_IMPLEMENTED: u16 = 0x8000;
pub const UINT16_NOT_IMPLEMENTED: u16 = 0xFFFF;
pub const INT32_NOT_IMPLEMENTED: u32 = 0x8000_0000;
pub const UINT32_NOT_IMPLEMENTED: u32 = 0xFFFF_FFFF;
pub const SUNSSF_NOT_IMPLEMENTED: u16 = 0x8000;

/// One decoded field. `Absent` means the device reported the
/// not-implemented sentinel; it is never a zero.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FieldValue {
    Number {
        value: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
        scaled: bool,
    },
    Flags {
        raw: u32,
        active: Vec<String>,
    },
    Text {
        value: String,
    },
    Absent,
}

impl FieldValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, FieldValue::Absent)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text { value } => Some(value),
            _ => None,
        }
    }

    pub fn unit(&self) -> Option<&str> {
        match self {
            FieldValue::Number { unit, .. } => unit.as_deref(),
            _ => None,
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text {
            value: value.into(),
        }
    }
}

/// All fields of one model from one read.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedReading {
    pub model_id: u16,
    pub fields: BTreeMap<String, FieldValue>,
}

impl DecodedReading {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn number(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(FieldValue::as_number)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(FieldValue::as_text)
    }

    pub fn present(&self) -> usize {
        self.fields.values().filter(|v| !v.is_absent()).count()
    }
}

// primitives {{{
pub fn decode_int16(word: u16) -> Option<i64> {
    if word == INT16_NOT_IMPLEMENTED {
        None
    } else {
        Some(word as i16 as i64)
    }
}

pub fn decode_uint16(word: u16) -> Option<i64> {
    if word == UINT16_NOT_IMPLEMENTED {
        None
    } else {
        Some(word as i64)
    }
}

pub fn decode_int32(high: u16, low: u16) -> Option<i64> {
    let raw = join(high, low);
    if raw == INT32_NOT_IMPLEMENTED {
        None
    } else {
        Some(raw as i32 as i64)
    }
}

pub fn decode_uint32(high: u16, low: u16) -> Option<i64> {
    let raw = join(high, low);
    if raw == UINT32_NOT_IMPLEMENTED {
        None
    } else {
        Some(raw as i64)
    }
}

/// Scale factor exponent, or None when not implemented or out of range.
pub fn decode_sunssf(word: u16) -> Option<i32> {
    if word == SUNSSF_NOT_IMPLEMENTED {
        return None;
    }
    let sf = word as i16 as i32;
    if (-MAX_SCALE_FACTOR..=MAX_SCALE_FACTOR).contains(&sf) {
        Some(sf)
    } else {
        None
    }
}

/// raw × 10^sf. Negative exponents divide so that e.g. 1500 × 10^-1 is exactly 150.0.
pub fn scale(raw: i64, sf: i32) -> f64 {
    if sf >= 0 {
        raw as f64 * 10f64.powi(sf)
    } else {
        raw as f64 / 10f64.powi(-sf)
    }
}

/// Two ASCII characters per word, high byte first; trailing NUL and spaces dropped.
pub fn decode_string(words: &[u16]) -> Option<String> {
    let s: String = words
        .iter()
        .flat_map(|w| w.to_be_bytes())
        .map(|b| b as char)
        .collect();
    let s = s.trim_end_matches(['\0', ' ']);
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn join(high: u16, low: u16) -> u32 {
    ((high as u32) << 16) | low as u32
}
// }}}

/// Decode a model body (the words after the ID/L header).
///
/// Any body whose length fits the model decodes, even if every field comes
/// back absent. A body of the wrong length is a structural mismatch.
pub fn decode(
    schema: &ModelSchema,
    flags: &FlagLookup,
    model_id: u16,
    words: &[u16],
) -> Result<DecodedReading, DecodeError> {
    let model = schema
        .model(model_id)
        .ok_or(DecodeError::UnknownModel(model_id))?;
    decode_model(model, flags, words)
}

pub fn decode_model(
    model: &ModelDef,
    flags: &FlagLookup,
    words: &[u16],
) -> Result<DecodedReading, DecodeError> {
    let mismatch = |expected: String| DecodeError::Structural {
        model_id: model.id,
        expected,
        actual: words.len(),
    };

    let repeats = model
        .repeats_for(words.len())
        .ok_or_else(|| mismatch(model.expected_length()))?;

    let fixed = &words[..(model.length as usize).min(words.len())];
    let sfs = scale_factors(&model.fields, fixed);

    let mut fields = BTreeMap::new();
    decode_fields(model.id, &model.fields, fixed, &sfs, flags, "", &mut fields);

    if let Some(repeat) = &model.repeat {
        if let Some(count) = fields.get(&repeat.count).and_then(FieldValue::as_number) {
            if count as usize != repeats {
                return Err(mismatch(format!(
                    "{} + {}*{}",
                    model.length, count, repeat.length
                )));
            }
        }

        let block_len = repeat.length as usize;
        for index in 0..repeats {
            let start = model.length as usize + index * block_len;
            let block = &words[start..start + block_len];

            let mut block_sfs = sfs.clone();
            block_sfs.extend(scale_factors(&repeat.fields, block));

            let prefix = format!("{}_{}_", repeat.prefix, index + 1);
            decode_fields(
                model.id,
                &repeat.fields,
                block,
                &block_sfs,
                flags,
                &prefix,
                &mut fields,
            );
        }
    }

    Ok(DecodedReading {
        model_id: model.id,
        fields,
    })
}

fn scale_factors(defs: &[FieldDef], words: &[u16]) -> HashMap<String, Option<i32>> {
    defs.iter()
        .filter(|d| d.kind == FieldType::Sunssf)
        .map(|d| {
            let sf = words.get(d.offset as usize).and_then(|w| decode_sunssf(*w));
            (d.name.clone(), sf)
        })
        .collect()
}

fn decode_fields(
    model_id: u16,
    defs: &[FieldDef],
    words: &[u16],
    scale_factors: &HashMap<String, Option<i32>>,
    flags: &FlagLookup,
    prefix: &str,
    out: &mut BTreeMap<String, FieldValue>,
) {
    for def in defs {
        if matches!(def.kind, FieldType::Sunssf | FieldType::Pad) {
            continue;
        }

        let name = format!("{}{}", prefix, def.name);
        let value = match words.get(def.offset as usize..def.end()) {
            Some(w) => decode_field(model_id, def, w, scale_factors, flags),
            // only reachable for the short variant of a model with alt_lengths
            None => FieldValue::Absent,
        };
        if def.kind == FieldType::Enum16 {
            if let Some(label) = enum_label(flags, model_id, &def.name, &value) {
                out.insert(format!("{}_name", name), label);
            }
        }
        out.insert(name, value);
    }
}

fn decode_field(
    model_id: u16,
    def: &FieldDef,
    w: &[u16],
    scale_factors: &HashMap<String, Option<i32>>,
    flags: &FlagLookup,
) -> FieldValue {
    let raw = match def.kind {
        FieldType::Int16 => decode_int16(w[0]),
        FieldType::Uint16 | FieldType::Enum16 => decode_uint16(w[0]),
        FieldType::Int32 => decode_int32(w[0], w[1]),
        FieldType::Uint32 | FieldType::Acc32 => decode_uint32(w[0], w[1]),
        FieldType::Bitfield16 => {
            return match decode_uint16(w[0]) {
                Some(raw) => bitfield(flags, model_id, &def.name, raw as u32, 16),
                None => FieldValue::Absent,
            };
        }
        FieldType::Bitfield32 => {
            return match decode_uint32(w[0], w[1]) {
                Some(raw) => bitfield(flags, model_id, &def.name, raw as u32, 32),
                None => FieldValue::Absent,
            };
        }
        FieldType::String => {
            return decode_string(w)
                .map(|value| FieldValue::Text { value })
                .unwrap_or(FieldValue::Absent);
        }
        FieldType::Sunssf | FieldType::Pad => return FieldValue::Absent,
    };

    let Some(raw) = raw else {
        return FieldValue::Absent;
    };

    match &def.sf {
        None => FieldValue::Number {
            value: raw as f64,
            unit: def.units.clone(),
            scaled: false,
        },
        Some(sf_name) => match scale_factors.get(sf_name).copied().flatten() {
            Some(sf) => FieldValue::Number {
                value: scale(raw, sf),
                unit: def.units.clone(),
                scaled: true,
            },
            None => FieldValue::Absent,
        },
    }
}

/// `<field>_name` companion of an enum16 field that has a name table.
fn enum_label(
    flags: &FlagLookup,
    model_id: u16,
    field: &str,
    value: &FieldValue,
) -> Option<FieldValue> {
    if !flags.has_enum(model_id, field) {
        return None;
    }
    Some(match value.as_number() {
        Some(code) => flags
            .enum_name(model_id, field, code as u16)
            .map(FieldValue::text)
            .unwrap_or(FieldValue::Absent),
        None => FieldValue::Absent,
    })
}

// flag tables are keyed by the unprefixed field name
fn bitfield(flags: &FlagLookup, model_id: u16, field: &str, raw: u32, width: u8) -> FieldValue {
    FieldValue::Flags {
        raw,
        active: flags.active(model_id, field, raw, width),
    }
}
