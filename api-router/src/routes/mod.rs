use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

pub mod admin;
pub mod agents;
pub mod audit;
pub mod copilot;
pub mod knowledge;
pub mod liveness;
pub mod readiness;

/// `{data}` response envelope.
pub(crate) fn data<T: Serialize>(value: T) -> Json<Value> {
    Json(json!({ "data": value }))
}

/// `{data, meta}` response envelope.
pub(crate) fn data_with_meta<T: Serialize>(value: T, meta: Value) -> Json<Value> {
    Json(json!({ "data": value, "meta": meta }))
}
