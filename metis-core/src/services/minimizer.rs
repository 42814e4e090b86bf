//! services/minimizer.rs
//! Data minimization: shape a payload before it is persisted or logged.
//!
//! Pure and deterministic for identical `(action, payload, decision)` inputs.

use serde_json::{Map, Value};

use crate::services::gate::{GateDecision, GatedAction};

/// Stands in for user content whenever consent is missing.
pub const CONSENT_REQUIRED: &str = "[CONSENT_REQUIRED]";

/// Keep only the action's declared fields. On a denial, every sensitive field
/// present is replaced by [`CONSENT_REQUIRED`]. Non-object payloads carry no
/// declared fields and minimize to `{}`.
pub fn sanitize(action: GatedAction, payload: &Value, decision: &GateDecision) -> Value {
    let mut out = Map::new();
    let Some(obj) = payload.as_object() else {
        return Value::Object(out);
    };
    let sensitive = action.sensitive_fields();
    for field in action.declared_fields() {
        let Some(value) = obj.get(*field) else { continue };
        let kept = match decision {
            GateDecision::Deny(_) if sensitive.contains(field) => {
                Value::String(CONSENT_REQUIRED.to_string())
            }
            _ => value.clone(),
        };
        out.insert((*field).to_string(), kept);
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::consent::Permission;
    use crate::services::gate::DenyReason;
    use serde_json::json;

    #[test]
    fn allow_drops_undeclared_fields() {
        let payload = json!({
            "text": "slept badly, hot flashes",
            "isShared": true,
            "location": "51.5,-0.1",
            "userId": "someone-else"
        });
        let out = sanitize(GatedAction::SaveJournalEntry, &payload, &GateDecision::Allow);
        assert_eq!(out, json!({ "text": "slept badly, hot flashes", "isShared": true }));
    }

    #[test]
    fn deny_replaces_content_with_sentinel() {
        let payload = json!({ "text": "private", "isShared": false, "extra": 1 });
        let deny = GateDecision::Deny(DenyReason::PermissionNotGranted(Permission::DataProcessing));
        let out = sanitize(GatedAction::SaveJournalEntry, &payload, &deny);
        assert_eq!(out, json!({ "text": CONSENT_REQUIRED, "isShared": false }));
        assert!(!out.to_string().contains("private"));
    }

    #[test]
    fn same_input_same_output() {
        let payload = json!({ "isShared": true, "text": "a", "z": null });
        let a = sanitize(GatedAction::SaveJournalEntry, &payload, &GateDecision::Allow);
        let b = sanitize(GatedAction::SaveJournalEntry, &payload, &GateDecision::Allow);
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn scalar_payload_minimizes_to_empty_object() {
        let out = sanitize(GatedAction::SaveJournalEntry, &json!("just text"), &GateDecision::Allow);
        assert_eq!(out, json!({}));
    }
}
