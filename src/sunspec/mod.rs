pub mod decoder;
pub mod flags;
pub mod reader;
pub mod schema;

pub use decoder::{decode, decode_model, DecodedReading, FieldValue};
pub use flags::FlagLookup;
pub use reader::{ModelRead, ModelReader, ReaderSettings};
pub use schema::{FieldDef, FieldType, ModelDef, ModelSchema};
