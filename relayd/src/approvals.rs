//! Auto-decision policy for agent-initiated requests.
//!
//! A small enumerated set of approval methods is answered immediately from
//! configuration; two deprecated methods are always rejected; everything
//! else is forwarded to the controller, whose answers are shape-checked per
//! method before they are relayed back to the agent.

use clap::ValueEnum;
use serde::Deserialize;
use serde_json::{json, Value};

pub const EXEC_APPROVAL_METHOD: &str = "item/commandExecution/requestApproval";
pub const FILE_APPROVAL_METHOD: &str = "item/fileChange/requestApproval";

/// Deprecated v1 approval methods. The relay is v2-only and must not
/// silently no-op these.
const LEGACY_APPROVAL_METHODS: &[&str] = &["execCommandApproval", "applyPatchApproval"];

/// Configured answer for one approval category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalDecision {
    /// Category-specific default behavior; see [`ApprovalPolicy::dispose`].
    Auto,
    Accept,
    AcceptForSession,
    Decline,
    Cancel,
}

impl ApprovalDecision {
    fn wire_value(self) -> Value {
        match self {
            ApprovalDecision::Auto => Value::String("acceptForSession".into()),
            ApprovalDecision::Accept => Value::String("accept".into()),
            ApprovalDecision::AcceptForSession => Value::String("acceptForSession".into()),
            ApprovalDecision::Decline => Value::String("decline".into()),
            ApprovalDecision::Cancel => Value::String("cancel".into()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ApprovalPolicy {
    pub exec: ApprovalDecision,
    pub file: ApprovalDecision,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            exec: ApprovalDecision::Auto,
            file: ApprovalDecision::Auto,
        }
    }
}

/// How the relay handles one agent-initiated request.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Answer immediately with this result, no controller round trip.
    AutoRespond { result: Value },
    /// Always rejected with an invalid-params error.
    RejectLegacy { message: String, data: Value },
    /// Open an inbound-pending entry and wait for the controller.
    Forward,
}

impl ApprovalPolicy {
    pub fn dispose(&self, method: &str, params: &Value) -> Disposition {
        if method == EXEC_APPROVAL_METHOD {
            let decision = match self.exec {
                ApprovalDecision::Auto => exec_auto_decision(params),
                other => other.wire_value(),
            };
            return Disposition::AutoRespond {
                result: json!({ "decision": decision }),
            };
        }

        if method == FILE_APPROVAL_METHOD {
            return Disposition::AutoRespond {
                result: json!({ "decision": self.file.wire_value() }),
            };
        }

        if LEGACY_APPROVAL_METHODS.contains(&method) {
            return Disposition::RejectLegacy {
                message: format!("Unsupported deprecated agent request: {}", method),
                data: json!({ "supportedMode": "v2-only" }),
            };
        }

        Disposition::Forward
    }
}

/// `auto` for the exec category accepts a proposed execpolicy amendment when
/// one is present, else accepts for the rest of the session.
fn exec_auto_decision(params: &Value) -> Value {
    let proposed = params
        .get("proposedExecpolicyAmendment")
        .or_else(|| params.get("proposed_execpolicy_amendment"));

    match proposed {
        Some(Value::Array(items)) if !items.is_empty() => json!({
            "acceptWithExecpolicyAmendment": {
                "execpolicy_amendment": items,
            }
        }),
        _ => Value::String("acceptForSession".into()),
    }
}

/// Shape-check a controller-supplied `result` for a forwarded agent request.
/// Methods without a known contract are accepted as-is.
pub fn validate_forwarded_result(method: &str, result: &Value) -> Result<(), String> {
    match method {
        "item/tool/call" => validate_tool_call_result(result),
        "item/tool/requestUserInput" => validate_user_input_result(result),
        "account/chatgptAuthTokens/refresh" => validate_auth_refresh_result(result),
        _ => Ok(()),
    }
}

fn validate_tool_call_result(result: &Value) -> Result<(), String> {
    let Some(obj) = result.as_object() else {
        return Err("item/tool/call result must be an object".into());
    };
    let Some(items) = obj.get("contentItems").and_then(Value::as_array) else {
        return Err("item/tool/call result.contentItems must be an array".into());
    };
    if !obj.get("success").map(Value::is_boolean).unwrap_or(false) {
        return Err("item/tool/call result.success must be a boolean".into());
    }

    for item in items {
        let Some(ty) = item.get("type").and_then(Value::as_str) else {
            return Err("item/tool/call contentItems entries must be objects with type".into());
        };
        match ty {
            "inputText" => {
                if !item.get("text").map(Value::is_string).unwrap_or(false) {
                    return Err("item/tool/call inputText entries require string text".into());
                }
            }
            "inputImage" => {
                if !item.get("imageUrl").map(Value::is_string).unwrap_or(false) {
                    return Err("item/tool/call inputImage entries require string imageUrl".into());
                }
            }
            other => {
                return Err(format!(
                    "item/tool/call contentItems has unsupported type: {}",
                    other
                ));
            }
        }
    }

    Ok(())
}

fn validate_user_input_result(result: &Value) -> Result<(), String> {
    let Some(obj) = result.as_object() else {
        return Err("item/tool/requestUserInput result must be an object".into());
    };
    let Some(answers) = obj.get("answers").and_then(Value::as_object) else {
        return Err("item/tool/requestUserInput result.answers must be an object".into());
    };

    for (question_id, value) in answers {
        let strings = value
            .get("answers")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().all(Value::is_string))
            .unwrap_or(false);
        if !strings {
            return Err(format!(
                "item/tool/requestUserInput result.answers.{} must be {{ answers: string[] }}",
                question_id
            ));
        }
    }

    Ok(())
}

fn validate_auth_refresh_result(result: &Value) -> Result<(), String> {
    let Some(obj) = result.as_object() else {
        return Err("account/chatgptAuthTokens/refresh result must be an object".into());
    };
    let ok = obj.get("idToken").map(Value::is_string).unwrap_or(false)
        && obj.get("accessToken").map(Value::is_string).unwrap_or(false);
    if !ok {
        return Err(
            "account/chatgptAuthTokens/refresh result requires string idToken and accessToken"
                .into(),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_auto_accepts_proposed_amendment() {
        let policy = ApprovalPolicy::default();
        let params = json!({ "proposedExecpolicyAmendment": ["allow git"] });

        match policy.dispose(EXEC_APPROVAL_METHOD, &params) {
            Disposition::AutoRespond { result } => {
                let amendment =
                    &result["decision"]["acceptWithExecpolicyAmendment"]["execpolicy_amendment"];
                assert_eq!(amendment, &json!(["allow git"]));
            }
            other => panic!("expected auto response, got {other:?}"),
        }
    }

    #[test]
    fn exec_auto_without_amendment_accepts_for_session() {
        let policy = ApprovalPolicy::default();

        for params in [json!({}), json!({ "proposedExecpolicyAmendment": [] })] {
            match policy.dispose(EXEC_APPROVAL_METHOD, &params) {
                Disposition::AutoRespond { result } => {
                    assert_eq!(result["decision"], json!("acceptForSession"));
                }
                other => panic!("expected auto response, got {other:?}"),
            }
        }
    }

    #[test]
    fn snake_case_amendment_field_is_honored() {
        let policy = ApprovalPolicy::default();
        let params = json!({ "proposed_execpolicy_amendment": ["x"] });
        match policy.dispose(EXEC_APPROVAL_METHOD, &params) {
            Disposition::AutoRespond { result } => {
                assert!(result["decision"]["acceptWithExecpolicyAmendment"].is_object());
            }
            other => panic!("expected auto response, got {other:?}"),
        }
    }

    #[test]
    fn configured_decline_overrides_auto_branching() {
        let policy = ApprovalPolicy {
            exec: ApprovalDecision::Decline,
            file: ApprovalDecision::Cancel,
        };

        let params = json!({ "proposedExecpolicyAmendment": ["x"] });
        match policy.dispose(EXEC_APPROVAL_METHOD, &params) {
            Disposition::AutoRespond { result } => {
                assert_eq!(result["decision"], json!("decline"));
            }
            other => panic!("expected auto response, got {other:?}"),
        }

        match policy.dispose(FILE_APPROVAL_METHOD, &json!({})) {
            Disposition::AutoRespond { result } => {
                assert_eq!(result["decision"], json!("cancel"));
            }
            other => panic!("expected auto response, got {other:?}"),
        }
    }

    #[test]
    fn file_auto_is_accept_for_session() {
        let policy = ApprovalPolicy::default();
        match policy.dispose(FILE_APPROVAL_METHOD, &json!({})) {
            Disposition::AutoRespond { result } => {
                assert_eq!(result["decision"], json!("acceptForSession"));
            }
            other => panic!("expected auto response, got {other:?}"),
        }
    }

    #[test]
    fn legacy_methods_are_always_rejected() {
        let policy = ApprovalPolicy {
            exec: ApprovalDecision::Accept,
            file: ApprovalDecision::Accept,
        };
        for method in ["execCommandApproval", "applyPatchApproval"] {
            match policy.dispose(method, &json!({})) {
                Disposition::RejectLegacy { message, data } => {
                    assert!(message.contains(method));
                    assert_eq!(data["supportedMode"], json!("v2-only"));
                }
                other => panic!("expected legacy rejection, got {other:?}"),
            }
        }
    }

    #[test]
    fn unlisted_methods_are_forwarded() {
        let policy = ApprovalPolicy::default();
        assert_eq!(
            policy.dispose("item/tool/call", &json!({})),
            Disposition::Forward
        );
    }

    #[test]
    fn tool_call_result_validation() {
        let ok = json!({
            "success": true,
            "contentItems": [
                {"type": "inputText", "text": "hi"},
                {"type": "inputImage", "imageUrl": "data:..."}
            ]
        });
        assert!(validate_forwarded_result("item/tool/call", &ok).is_ok());

        assert!(validate_forwarded_result("item/tool/call", &json!("nope")).is_err());
        assert!(validate_forwarded_result(
            "item/tool/call",
            &json!({"success": "yes", "contentItems": []})
        )
        .is_err());
        assert!(validate_forwarded_result(
            "item/tool/call",
            &json!({"success": true, "contentItems": [{"type": "audio"}]})
        )
        .is_err());
        assert!(validate_forwarded_result(
            "item/tool/call",
            &json!({"success": true, "contentItems": [{"type": "inputText", "text": 3}]})
        )
        .is_err());
    }

    #[test]
    fn user_input_result_validation() {
        let ok = json!({ "answers": { "q1": { "answers": ["a", "b"] } } });
        assert!(validate_forwarded_result("item/tool/requestUserInput", &ok).is_ok());

        let bad = json!({ "answers": { "q1": { "answers": [1] } } });
        let err = validate_forwarded_result("item/tool/requestUserInput", &bad).unwrap_err();
        assert!(err.contains("q1"));
    }

    #[test]
    fn auth_refresh_result_validation() {
        let ok = json!({ "idToken": "a", "accessToken": "b" });
        assert!(validate_forwarded_result("account/chatgptAuthTokens/refresh", &ok).is_ok());

        let bad = json!({ "idToken": "a" });
        assert!(validate_forwarded_result("account/chatgptAuthTokens/refresh", &bad).is_err());
    }

    #[test]
    fn unknown_methods_skip_validation() {
        assert!(validate_forwarded_result("some/other/method", &json!(null)).is_ok());
    }
}
