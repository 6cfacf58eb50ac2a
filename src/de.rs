//! Steam encodes 64 bit integers as strings in json, but not consistently

use serde::{Deserialize, Deserializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Number(u64),
}

pub(crate) fn u64_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::Number(number) => Ok(number),
        StringOrNumber::String(raw) if raw.is_empty() => Ok(0),
        StringOrNumber::String(raw) => raw.parse().map_err(serde::de::Error::custom),
    }
}

pub(crate) fn string_from_any<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<String, D::Error> {
    Ok(match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::Number(number) => number.to_string(),
        StringOrNumber::String(raw) => raw,
    })
}

pub(crate) fn bool_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrNumber {
        Bool(bool),
        Number(u64),
    }

    Ok(match BoolOrNumber::deserialize(deserializer)? {
        BoolOrNumber::Bool(value) => value,
        BoolOrNumber::Number(value) => value != 0,
    })
}
