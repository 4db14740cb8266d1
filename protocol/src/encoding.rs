//! Binary encoding of values kept at rest (record metadata and blob files).

use {
    serde::{Serialize, de::DeserializeOwned},
    std::io::Write,
};

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(value, bincode::config::legacy())
}

pub fn serialize_into<T: Serialize>(
    mut writer: impl Write,
    value: &T,
) -> Result<usize, bincode::error::EncodeError> {
    bincode::serde::encode_into_std_write(value, &mut writer, bincode::config::legacy())
}

/// Decodes a value and rejects trailing bytes, which would mean the stored
/// value was written by something else.
pub fn deserialize<T: DeserializeOwned>(data: &[u8]) -> Result<T, bincode::error::DecodeError> {
    let (value, len) = bincode::serde::decode_from_slice(data, bincode::config::legacy())?;
    if len != data.len() {
        return Err(bincode::error::DecodeError::OtherString(format!(
            "{} trailing bytes",
            data.len().saturating_sub(len)
        )));
    }
    Ok(value)
}
