use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantMessage {
    pub from: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

impl InstantMessage {
    pub fn new(from: String, body: String) -> Self {
        Self {
            from,
            body,
            received_at: Utc::now(),
        }
    }
}
