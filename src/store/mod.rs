//! Remote document store contract
//!
//! The sync components talk to the backend only through `DocumentStore`:
//! point reads, point and partial writes, one-shot queries and live queries.
//! Documents are JSON objects addressed by `collection` + `id`, where a
//! collection path may itself be nested (`messages/{chatId}/items`).

pub mod blob;
pub mod memory;
pub mod retry;

use std::cmp::Ordering;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SyncError};
use crate::feed::Subscription;

pub use blob::{BlobStore, MemoryBlobStore, UploadedBlob};
pub use memory::MemoryStore;
pub use retry::{RetryPolicy, RetryingStore};

/// Field value replaced by the store with a monotonic server time (epoch ms) on write.
pub const SERVER_TIMESTAMP: &str = "__server_timestamp__";

pub const USERS: &str = "users";
pub const CHATS: &str = "chats";

/// Collection holding the messages of one chat.
pub fn messages_collection(chat_id: &str) -> String {
    format!("messages/{}/items", chat_id)
}

/// Collection holding the typing cells of one chat.
pub fn typing_collection(chat_id: &str) -> String {
    format!("typing/{}/users", chat_id)
}

/// A stored document: its id plus the JSON object body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub data: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Decode into a model type. The document id is exposed as field `id`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let mut body = self.data.clone();
        body.insert("id".to_string(), Value::String(self.id.clone()));
        serde_json::from_value(Value::Object(body)).map_err(|e| SyncError::Malformed {
            id: self.id.clone(),
            reason: e.to_string(),
        })
    }

    pub fn field(&self, path: &str) -> Option<&Value> {
        lookup(&self.data, path)
    }
}

/// Serialize a model into a document body, dropping its `id` field.
pub fn to_body<T: Serialize>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value) {
        Ok(Value::Object(mut map)) => {
            map.remove("id");
            Ok(map)
        }
        Ok(other) => Err(SyncError::validation(format!(
            "expected an object body, got {}",
            other
        ))),
        Err(e) => Err(SyncError::validation(e.to_string())),
    }
}

/// Resolve a dotted path (`readBy.u1`) inside a document body.
pub fn lookup<'a>(data: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = data.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// How `set` treats an existing document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    Overwrite,
    /// Shallow-merge top-level fields into the existing body.
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq { field: String, value: Value },
    ArrayContains { field: String, value: Value },
}

impl Filter {
    pub fn matches(&self, data: &Map<String, Value>) -> bool {
        match self {
            Filter::Eq { field, value } => lookup(data, field) == Some(value),
            Filter::ArrayContains { field, value } => lookup(data, field)
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Position in an ordered query: the order-by value plus the document id tiebreak.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    pub value: Value,
    pub id: String,
}

/// Query over one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub start_after: Option<Cursor>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
            start_after: None,
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn where_array_contains(
        mut self,
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.filters.push(Filter::ArrayContains {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start_after(mut self, cursor: Cursor) -> Self {
        self.start_after = Some(cursor);
        self
    }

    pub fn matches(&self, data: &Map<String, Value>) -> bool {
        self.filters.iter().all(|f| f.matches(data))
    }

    /// Order two documents by the query's order-by field, then by id.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        let Some(ref order) = self.order_by else {
            return a.id.cmp(&b.id);
        };
        let ordering = compare_values(
            a.field(&order.field).unwrap_or(&Value::Null),
            b.field(&order.field).unwrap_or(&Value::Null),
        )
        .then_with(|| a.id.cmp(&b.id));
        match order.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }

    /// Whether `doc` sorts strictly after `cursor` in this query's order.
    pub fn is_after(&self, doc: &Document, cursor: &Cursor) -> bool {
        let Some(ref order) = self.order_by else {
            return doc.id > cursor.id;
        };
        let value = doc.field(&order.field).unwrap_or(&Value::Null);
        let ordering = compare_values(value, &cursor.value)
            .then_with(|| doc.id.as_str().cmp(cursor.id.as_str()));
        match order.direction {
            Direction::Ascending => ordering == Ordering::Greater,
            Direction::Descending => ordering == Ordering::Less,
        }
    }

    /// Apply filters, ordering, cursor and limit to a set of documents.
    pub fn evaluate<'a>(&self, docs: impl Iterator<Item = &'a Document>) -> Vec<Document> {
        let mut matched: Vec<Document> = docs
            .filter(|d| self.matches(&d.data))
            .filter(|d| self.start_after.as_ref().map_or(true, |c| self.is_after(d, c)))
            .cloned()
            .collect();
        matched.sort_by(|a, b| self.compare(a, b));
        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

/// Total order over JSON values: null < bool < number < string < other.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .unwrap_or(0.0)
                .partial_cmp(&y.as_f64().unwrap_or(0.0))
                .unwrap_or(Ordering::Equal),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Remote document store with live queries.
///
/// Every operation may fail with `SyncError::TransientNetwork`; none retries
/// internally unless wrapped in a `RetryingStore`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Point read.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Insert a new document under a server-assigned id.
    async fn add(&self, collection: &str, data: Map<String, Value>) -> Result<Document>;

    /// Insert under `id` unless a document already exists there.
    ///
    /// Returns the stored document and whether this call created it.
    async fn create_if_absent(
        &self,
        collection: &str,
        id: &str,
        data: Map<String, Value>,
    ) -> Result<(Document, bool)>;

    async fn set(
        &self,
        collection: &str,
        id: &str,
        data: Map<String, Value>,
        mode: SetMode,
    ) -> Result<Document>;

    /// Partial write to an existing document. Keys may be dotted paths.
    async fn update(&self, collection: &str, id: &str, patch: Map<String, Value>)
        -> Result<Document>;

    async fn query(&self, query: &Query) -> Result<Vec<Document>>;

    /// Open a live query. The first batch is the initial result set.
    async fn subscribe(&self, query: Query) -> Result<Subscription>;
}
