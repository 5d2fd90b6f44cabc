//! Events delivered to the consumer

use crate::{
    constants::{
        EVENT_BODY_FIELD, HEADER_CALLER_UUID, HEADER_EVENT_NAME, HEADER_JOB_UUID,
        HEADER_UNIQUE_ID,
    },
    error::EslResult,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Index;

/// Decoded event fields.
///
/// Values are already percent-decoded. A length-delimited payload, when the
/// event carried one, sits under the `body` field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EslEvent {
    headers: HashMap<String, String>,
}

impl EslEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .map(String::as_str)
    }

    pub fn set_header(&mut self, name: String, value: String) {
        self.headers
            .insert(name, value);
    }

    pub fn event_name(&self) -> Option<&str> {
        self.header(HEADER_EVENT_NAME)
    }

    /// Channel UUID, falling back to `Caller-Unique-ID`
    pub fn unique_id(&self) -> Option<&str> {
        self.header(HEADER_UNIQUE_ID)
            .or_else(|| self.header(HEADER_CALLER_UUID))
    }

    /// Job UUID of a `BACKGROUND_JOB` event
    pub fn job_uuid(&self) -> Option<&str> {
        self.header(HEADER_JOB_UUID)
    }

    pub fn body(&self) -> Option<&str> {
        self.header(EVENT_BODY_FIELD)
    }

    pub fn is_event(&self, name: &str) -> bool {
        self.event_name()
            .map_or(false, |n| n.eq_ignore_ascii_case(name))
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn into_headers(self) -> HashMap<String, String> {
        self.headers
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers
            .is_empty()
    }

    /// Serialize the field map as a JSON object
    pub fn to_json(&self) -> EslResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<HashMap<String, String>> for EslEvent {
    fn from(headers: HashMap<String, String>) -> Self {
        Self { headers }
    }
}

/// Missing fields read as the empty string.
impl Index<&str> for EslEvent {
    type Output = str;

    fn index(&self, name: &str) -> &str {
        self.header(name)
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat() -> EslEvent {
        let mut event = EslEvent::new();
        event.set_header("Event-Name".to_string(), "HEARTBEAT".to_string());
        event.set_header("Caller-Unique-ID".to_string(), "leg-1".to_string());
        event
    }

    #[test]
    fn test_accessors() {
        let event = heartbeat();
        assert_eq!(event.event_name(), Some("HEARTBEAT"));
        assert_eq!(event.unique_id(), Some("leg-1"));
        assert!(event.is_event("heartbeat"));
        assert!(event
            .job_uuid()
            .is_none());
        assert_eq!(event.len(), 2);
    }

    #[test]
    fn test_unique_id_preferred_over_caller() {
        let mut event = heartbeat();
        event.set_header("Unique-ID".to_string(), "leg-2".to_string());
        assert_eq!(event.unique_id(), Some("leg-2"));
    }

    #[test]
    fn test_index_missing_is_empty() {
        let event = heartbeat();
        assert_eq!(&event["Event-Name"], "HEARTBEAT");
        assert_eq!(&event["Nope"], "");
    }

    #[test]
    fn test_json_is_flat_object() {
        let mut event = heartbeat();
        event.set_header("body".to_string(), "+OK\n".to_string());

        let json = event
            .to_json()
            .unwrap();
        let back: EslEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["body"], "+OK\n");
    }
}
