//! Outbound message envelope for the push channel
//!
//! The device accepts queries and commands over the same socket that it
//! pushes status updates on. Field names are fixed by the device protocol;
//! `Reference` and `Pass` are omitted entirely when unset rather than sent
//! as null.

use serde::Serialize;

/// A query or command envelope sent over the push channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct OutboundMessage {
    #[serde(rename = "Type")]
    kind: &'static str,

    #[serde(rename = "Query", skip_serializing_if = "Option::is_none")]
    query: Option<String>,

    #[serde(rename = "Command", skip_serializing_if = "Option::is_none")]
    command: Option<String>,

    #[serde(rename = "Parameters")]
    parameters: String,

    #[serde(rename = "Reference", skip_serializing_if = "Option::is_none")]
    reference: Option<String>,

    #[serde(rename = "Pass", skip_serializing_if = "Option::is_none")]
    pass: Option<String>,
}

impl OutboundMessage {
    pub(crate) fn query(name: &str, parameters: &str) -> Self {
        Self {
            kind: "Query",
            query: Some(name.to_string()),
            command: None,
            parameters: parameters.to_string(),
            reference: None,
            pass: None,
        }
    }

    pub(crate) fn command(name: &str, parameters: &str) -> Self {
        Self {
            kind: "Command",
            query: None,
            command: Some(name.to_string()),
            parameters: parameters.to_string(),
            reference: None,
            pass: None,
        }
    }

    /// Attach the hashed credential, if one is configured
    pub(crate) fn with_pass(mut self, pass: Option<String>) -> Self {
        self.pass = pass;
        self
    }

    /// Attach a correlation reference echoed back by the device
    #[allow(dead_code)]
    pub(crate) fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub(crate) fn kind(&self) -> &'static str {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_envelope_shape() {
        let message = OutboundMessage::query("GetPlayingStatus", "");
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "Type": "Query",
                "Query": "GetPlayingStatus",
                "Parameters": ""
            })
        );
    }

    #[test]
    fn test_command_envelope_with_pass_and_reference() {
        let message = OutboundMessage::command("Play specified playlist", "Halloween")
            .with_pass(Some("abc123".to_string()))
            .with_reference("req-1");
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "Type": "Command",
                "Command": "Play specified playlist",
                "Parameters": "Halloween",
                "Reference": "req-1",
                "Pass": "abc123"
            })
        );
    }

    #[test]
    fn test_unset_optionals_are_omitted_not_null() {
        let message = OutboundMessage::query("GetQueuedSteps", "");
        let json = serde_json::to_string(&message).unwrap();
        assert!(!json.contains("Pass"));
        assert!(!json.contains("Reference"));
        assert!(!json.contains("Command"));
    }
}
