//! Canonical JSON Schema registry. The six schemas are loaded and
//! compiled once at startup; a missing or malformed schema is a fatal
//! configuration error. Validation is warn-only: the outcome tags the
//! record and moves a counter, it never drops data.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use core_types::ValidationSummary;
use jsonschema::JSONSchema;
use serde::Serialize;

/// The fixed schema set, one per mapped inbound event family.
pub const CANONICAL_KEYS: [&str; 6] = [
    "gameStateUpdate",
    "newTrade",
    "currentSideBet",
    "newSideBet",
    "gameStatePlayerUpdate",
    "playerUpdate",
];

/// Outbound frame type a schema key normalizes into, when it has one.
pub fn outbound_type_for(key: &str) -> Option<&'static str> {
    match key {
        "gameStateUpdate" => Some("game_state_update"),
        "newTrade" => Some("trade"),
        "currentSideBet" | "newSideBet" => Some("side_bet"),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDescriptor {
    pub key: String,
    pub id: String,
    pub title: String,
    pub required: Vec<String>,
    pub properties: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbound_type: Option<&'static str>,
}

#[derive(Debug, Default, Serialize)]
pub struct EventCounterSnapshot {
    pub ok: u64,
    pub fail: u64,
}

/// Point-in-time view of the validation counters. `total` always equals
/// the sum of the per-event ok and fail columns.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationCounters {
    pub total: u64,
    pub per_event: BTreeMap<String, EventCounterSnapshot>,
}

#[derive(Default)]
struct EventCounters {
    ok: AtomicU64,
    fail: AtomicU64,
}

struct CompiledEntry {
    compiled: JSONSchema,
    descriptor: SchemaDescriptor,
    counters: EventCounters,
}

pub struct SchemaRegistry {
    entries: HashMap<String, CompiledEntry>,
    total: AtomicU64,
}

impl SchemaRegistry {
    /// Loads `<key>.schema.json` for every canonical key from `dir` and
    /// compiles them. Any missing or invalid schema aborts startup.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut entries = HashMap::new();
        for key in CANONICAL_KEYS {
            let path = dir.join(format!("{key}.schema.json"));
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("read schema {}", path.display()))?;
            let value: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("parse schema {}", path.display()))?;
            let compiled = JSONSchema::compile(&value)
                .map_err(|err| anyhow::anyhow!("compile schema {key}: {err}"))?;

            let descriptor = SchemaDescriptor {
                key: key.to_string(),
                id: value
                    .get("$id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                title: value
                    .get("title")
                    .and_then(|v| v.as_str())
                    .unwrap_or(key)
                    .to_string(),
                required: string_array(value.get("required")),
                properties: value
                    .get("properties")
                    .and_then(|v| v.as_object())
                    .map(|m| m.keys().cloned().collect())
                    .unwrap_or_default(),
                outbound_type: outbound_type_for(key),
            };

            entries.insert(
                key.to_string(),
                CompiledEntry {
                    compiled,
                    descriptor,
                    counters: EventCounters::default(),
                },
            );
        }
        tracing::info!(count = entries.len(), dir = %dir.display(), "schemas compiled");
        Ok(Self {
            entries,
            total: AtomicU64::new(0),
        })
    }

    /// Validates `payload` against `schema_key`, counting the outcome.
    /// Unknown keys yield an unmapped summary without moving counters.
    pub fn validate(&self, schema_key: &str, payload: &serde_json::Value) -> ValidationSummary {
        let Some(entry) = self.entries.get(schema_key) else {
            return ValidationSummary::unmapped();
        };

        self.total.fetch_add(1, Ordering::Relaxed);
        let first_error = match entry.compiled.validate(payload) {
            Ok(()) => None,
            Err(mut errors) => errors.next().map(|e| format!("{}: {e}", e.instance_path)),
        };

        match first_error {
            None => {
                entry.counters.ok.fetch_add(1, Ordering::Relaxed);
                ValidationSummary::ok(schema_key)
            }
            Some(error) => {
                entry.counters.fail.fetch_add(1, Ordering::Relaxed);
                ValidationSummary::failed(schema_key, error)
            }
        }
    }

    /// Descriptor list for `GET /api/schemas`, stable key order.
    pub fn list(&self) -> Vec<SchemaDescriptor> {
        let mut out: Vec<SchemaDescriptor> = self
            .entries
            .values()
            .map(|e| e.descriptor.clone())
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn counters(&self) -> ValidationCounters {
        let mut per_event = BTreeMap::new();
        for (key, entry) in &self.entries {
            per_event.insert(
                key.clone(),
                EventCounterSnapshot {
                    ok: entry.counters.ok.load(Ordering::Relaxed),
                    fail: entry.counters.fail.load(Ordering::Relaxed),
                },
            );
        }
        ValidationCounters {
            total: self.total.load(Ordering::Relaxed),
            per_event,
        }
    }
}

fn string_array(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
