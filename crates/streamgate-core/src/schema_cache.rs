//! Lazily populated cache of event schemas
//!
//! Streaming events name their schema by id. The first event carrying an
//! unseen id triggers exactly one fetch; concurrent decoders waiting on the
//! same id share that fetch. Schema ids are content-addressed upstream, so
//! entries are never evicted.

use apache_avro::types::Value as AvroValue;
use apache_avro::Schema;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{GatewayError, Result};

/// A parsed schema ready for decoding
#[derive(Debug)]
pub struct CachedSchema {
    pub schema_id: String,
    pub schema: Schema,
    /// The schema as fetched, for `getSchema` replies
    pub schema_json: String,
    pub fetched_at: DateTime<Utc>,
}

impl CachedSchema {
    pub fn parse(schema_id: impl Into<String>, schema_json: impl Into<String>) -> Result<Self> {
        let schema_id = schema_id.into();
        let schema_json = schema_json.into();
        let schema = Schema::parse_str(&schema_json).map_err(|e| {
            GatewayError::upstream(format!("schema {schema_id} is not valid Avro: {e}"))
        })?;
        Ok(Self {
            schema_id,
            schema,
            schema_json,
            fetched_at: Utc::now(),
        })
    }

    /// Decode one binary-encoded payload into JSON
    pub fn decode(&self, payload: &[u8]) -> Result<Value> {
        let mut reader = payload;
        let datum = apache_avro::from_avro_datum(&self.schema, &mut reader, None).map_err(|e| {
            GatewayError::upstream(format!(
                "payload does not match schema {}: {e}",
                self.schema_id
            ))
        })?;
        Ok(avro_to_json(datum))
    }
}

type Slot = Arc<OnceCell<Arc<CachedSchema>>>;

/// Schema id → parsed schema, fetched at most once per id
#[derive(Debug, Default)]
pub struct SchemaCache {
    entries: Mutex<HashMap<String, Slot>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the cached schema, running `fetch` only if the id is unseen
    ///
    /// A failed fetch leaves the id uncached so a later event can retry it.
    pub async fn get_or_fetch<F, Fut>(&self, schema_id: &str, fetch: F) -> Result<Arc<CachedSchema>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let slot = self.entries().entry(schema_id.to_string()).or_default().clone();

        let schema = slot
            .get_or_try_init(|| async {
                debug!(schema_id, "Fetching schema");
                let json = fetch().await?;
                let parsed = CachedSchema::parse(schema_id, json)?;
                info!(schema_id, "Cached schema");
                Ok::<_, GatewayError>(Arc::new(parsed))
            })
            .await?;
        Ok(Arc::clone(schema))
    }

    pub fn get(&self, schema_id: &str) -> Option<Arc<CachedSchema>> {
        self.entries()
            .get(schema_id)
            .and_then(|slot| slot.get().cloned())
    }

    /// Number of schemas fetched and cached
    pub fn len(&self) -> usize {
        self.entries()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Render an Avro value as JSON
///
/// Unions collapse to their branch, records become objects in field order,
/// and raw bytes are base64 encoded.
pub fn avro_to_json(value: AvroValue) -> Value {
    match value {
        AvroValue::Null => Value::Null,
        AvroValue::Boolean(b) => Value::Bool(b),
        AvroValue::Int(n) => Value::from(n),
        AvroValue::Long(n) => Value::from(n),
        AvroValue::Float(n) => float(f64::from(n)),
        AvroValue::Double(n) => float(n),
        AvroValue::String(s) => Value::String(s),
        AvroValue::Enum(_, symbol) => Value::String(symbol),
        AvroValue::Bytes(bytes) | AvroValue::Fixed(_, bytes) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        AvroValue::Union(_, inner) => avro_to_json(*inner),
        AvroValue::Array(items) => Value::Array(items.into_iter().map(avro_to_json).collect()),
        AvroValue::Map(entries) => Value::Object(
            entries
                .into_iter()
                .map(|(key, value)| (key, avro_to_json(value)))
                .collect(),
        ),
        AvroValue::Record(fields) => {
            let mut object = Map::with_capacity(fields.len());
            for (name, value) in fields {
                object.insert(name, avro_to_json(value));
            }
            Value::Object(object)
        }
        other => {
            // Logical types (dates, timestamps, decimals, uuids)
            let rendered = format!("{other:?}");
            Value::try_from(other).unwrap_or(Value::String(rendered))
        }
    }
}

fn float(n: f64) -> Value {
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}
