//! Document → JSON conversion for REST responses. BSON dates become
//! ISO-8601 strings and object ids become hex strings, keeping every
//! primary key an opaque string on the wire.

use bson::{Bson, Document};
use serde_json::{Map, Value};

pub fn doc_to_json(doc: Document) -> Value {
    let mut out = Map::new();
    for (key, value) in doc {
        out.insert(key, bson_to_json(value));
    }
    Value::Object(out)
}

fn bson_to_json(value: Bson) -> Value {
    match value {
        Bson::Double(v) => serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Bson::String(v) => Value::String(v),
        Bson::Array(items) => Value::Array(items.into_iter().map(bson_to_json).collect()),
        Bson::Document(d) => doc_to_json(d),
        Bson::Boolean(v) => Value::Bool(v),
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Int32(v) => Value::Number(v.into()),
        Bson::Int64(v) => Value::Number(v.into()),
        Bson::DateTime(dt) => dt
            .try_to_rfc3339_string()
            .map(Value::String)
            .unwrap_or(Value::Null),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::Decimal128(d) => Value::String(d.to_string()),
        Bson::Timestamp(ts) => Value::String(format!("{}:{}", ts.time, ts.increment)),
        other => Value::String(format!("{other:?}")),
    }
}
