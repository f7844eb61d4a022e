//! Pinger facade (v1): connection heartbeat.
use std::sync::Arc;

use super::{method, Registry, Session};
use crate::error::Result;

pub fn register(registry: &mut Registry) {
    registry.add_method("Pinger", 1, "Ping", method(ping));
}

async fn ping(session: Arc<Session>, _params: serde_json::Value) -> Result<serde_json::Value> {
    session.heart().heartbeat();
    Ok(serde_json::Value::Null)
}
