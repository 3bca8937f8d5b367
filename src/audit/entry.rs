//! Audit entry types.
//!
//! The on-disk field names (camelCase, `type` discriminator) are part of the
//! log format contract; hash chains recompute over exactly these names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of event an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// An agent tool invocation.
    ToolCall,
    /// The result of a tool invocation.
    ToolResult,
    /// A credential was read, used, or rotated.
    CredentialAccess,
    /// A request was rejected by policy.
    PolicyViolation,
    /// An approval flow was triggered.
    ApprovalRequest,
}

/// Operation recorded in a `credential_access` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialOperation {
    /// The secret was read for injection.
    Read,
    /// The secret was used without being surfaced.
    Use,
    /// The secret was replaced.
    Rotate,
}

/// One immutable, hash-chained record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Opaque unique identifier.
    pub id: String,
    /// Wall-clock time; non-decreasing within a segment.
    pub timestamp: DateTime<Utc>,
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: AuditKind,
    /// Opaque caller session identifier.
    pub session_id: String,
    /// Opaque caller agent identifier.
    pub agent_id: String,
    /// Type-discriminated payload; always redacted before hashing.
    pub data: serde_json::Value,
    /// Hex digest of the previous record's hash (64 zeros at genesis).
    pub previous_hash: String,
    /// `sha256(previous_hash || canonical_json(entry without hash))`.
    pub hash: String,
}

/// Build the standard `credential_access` payload.
#[must_use]
pub fn credential_access_data(
    service: &str,
    operation: CredentialOperation,
    success: bool,
    error: Option<&str>,
) -> serde_json::Value {
    let mut data = serde_json::json!({
        "service": service,
        "operation": operation,
        "success": success,
    });
    if let (Some(err), Some(obj)) = (error, data.as_object_mut()) {
        obj.insert("error".to_owned(), serde_json::Value::String(err.to_owned()));
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&AuditKind::CredentialAccess).unwrap();
        assert_eq!(json, r#""credential_access""#);
        let parsed: AuditKind = serde_json::from_str(r#""policy_violation""#).unwrap();
        assert_eq!(parsed, AuditKind::PolicyViolation);
    }

    #[test]
    fn test_entry_uses_contract_field_names() {
        let entry = AuditEntry {
            id: "abc".to_owned(),
            timestamp: Utc::now(),
            kind: AuditKind::CredentialAccess,
            session_id: "s1".to_owned(),
            agent_id: "a1".to_owned(),
            data: serde_json::json!({}),
            previous_hash: "0".repeat(64),
            hash: "f".repeat(64),
        };

        let value = serde_json::to_value(&entry).unwrap();
        let obj = value.as_object().unwrap();
        for field in [
            "id",
            "timestamp",
            "type",
            "sessionId",
            "agentId",
            "data",
            "previousHash",
            "hash",
        ] {
            assert!(obj.contains_key(field), "missing field {field}");
        }
        assert_eq!(obj.len(), 8, "unexpected extra fields");
    }

    #[test]
    fn test_credential_access_payload() {
        let ok = credential_access_data("anthropic", CredentialOperation::Read, true, None);
        assert_eq!(ok["service"], "anthropic");
        assert_eq!(ok["operation"], "read");
        assert_eq!(ok["success"], true);
        assert!(ok.get("error").is_none());

        let failed = credential_access_data(
            "anthropic",
            CredentialOperation::Read,
            false,
            Some("credential_not_found"),
        );
        assert_eq!(failed["error"], "credential_not_found");
    }
}
