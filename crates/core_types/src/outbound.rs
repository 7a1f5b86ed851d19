//! Outbound frames published on the downstream stream. Every data frame
//! carries the `v1` envelope and the validation summary of the inbound
//! record it was derived from.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::{GamePhase, ValidationSummary};

pub const SCHEMA_VERSION: &str = "v1";

#[derive(Debug, Clone, Serialize)]
pub struct HelloFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub ts: DateTime<Utc>,
}

impl HelloFrame {
    pub fn now() -> Self {
        Self {
            kind: "hello",
            ts: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub ts: DateTime<Utc>,
}

impl HeartbeatFrame {
    pub fn now() -> Self {
        Self {
            kind: "heartbeat",
            ts: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStateFrame {
    pub schema: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<GamePhase>,
    pub validation: ValidationSummary,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeFrame {
    pub schema: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick_index: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", with = "rust_decimal::serde::float_option")]
    pub amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none", with = "rust_decimal::serde::float_option")]
    pub qty: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none", with = "rust_decimal::serde::float_option")]
    pub price: Option<Decimal>,
    pub validation: ValidationSummary,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SideBetFrame {
    pub schema: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Inbound event name, verbatim, so placement and resolution stay
    /// distinguishable downstream.
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    pub validation: ValidationSummary,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GodCandleFrame {
    pub schema: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub game_id: String,
    pub tick: i64,
    pub from_price: f64,
    pub to_price: f64,
    pub ratio: f64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RugFrame {
    pub schema: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub game_id: String,
    pub tick: i64,
    pub end_price: f64,
    pub ts: DateTime<Utc>,
}

/// Encodes any frame to the wire string; serialization of these closed
/// types cannot fail, so the fallback is an empty object.
pub fn encode<T: Serialize>(frame: &T) -> String {
    serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string())
}
