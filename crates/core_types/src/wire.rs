//! Tolerant deserializers for upstream payloads, which mix number,
//! string, and null encodings for the same fields across event versions.

use serde::{Deserialize, Deserializer};

pub fn de_opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(f64),
        Str(String),
        Null,
    }
    let parsed = Option::<NumOrStr>::deserialize(deserializer)?;
    Ok(match parsed {
        Some(NumOrStr::Num(v)) => Some(v),
        Some(NumOrStr::Str(s)) => s.parse::<f64>().ok(),
        Some(NumOrStr::Null) | None => None,
    })
}

pub fn de_opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(i64),
        Float(f64),
        Str(String),
        Null,
    }
    let parsed = Option::<NumOrStr>::deserialize(deserializer)?;
    Ok(match parsed {
        Some(NumOrStr::Num(v)) => Some(v),
        Some(NumOrStr::Float(v)) => Some(v as i64),
        Some(NumOrStr::Str(s)) => s.parse::<i64>().ok(),
        Some(NumOrStr::Null) | None => None,
    })
}

pub fn de_opt_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrStr {
        Bool(bool),
        Str(String),
        Null,
    }
    let parsed = Option::<BoolOrStr>::deserialize(deserializer)?;
    Ok(match parsed {
        Some(BoolOrStr::Bool(v)) => Some(v),
        Some(BoolOrStr::Str(s)) => match s.as_str() {
            "true" | "TRUE" | "1" => Some(true),
            "false" | "FALSE" | "0" => Some(false),
            _ => None,
        },
        Some(BoolOrStr::Null) | None => None,
    })
}
