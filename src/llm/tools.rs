//! Tool declarations, argument validation, and deadline-bounded execution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::chat::prompt::{ToolDispatch, ToolDispatchError};
use crate::metrics;

/// Hard deadline for one tool invocation.
pub const TOOL_DEADLINE: Duration = Duration::from_millis(100);

/// Latency above this fraction of the deadline logs an early warning.
const WARN_THRESHOLD: Duration = Duration::from_millis(80);

/// Tool declaration, OpenAI function-calling shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Always "function".
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema for parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// Expected shape of one declared property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PropertyKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Any,
}

impl PropertyKind {
    fn from_schema(prop_schema: &serde_json::Value) -> Self {
        // Enumerated strings are accepted as any string at this layer;
        // membership is the handler's concern. That keeps validator
        // derivation total over the declared schema subset.
        if prop_schema.get("enum").is_some() {
            return PropertyKind::String;
        }
        match prop_schema.get("type").and_then(|t| t.as_str()) {
            Some("string") => PropertyKind::String,
            Some("number") => PropertyKind::Number,
            Some("integer") => PropertyKind::Integer,
            Some("boolean") => PropertyKind::Boolean,
            Some("array") => PropertyKind::Array,
            Some("object") => PropertyKind::Object,
            _ => PropertyKind::Any,
        }
    }

    fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            PropertyKind::String => value.is_string(),
            PropertyKind::Number => value.is_number(),
            PropertyKind::Integer => value.is_i64() || value.is_u64(),
            PropertyKind::Boolean => value.is_boolean(),
            PropertyKind::Array => value.is_array(),
            PropertyKind::Object => value.is_object(),
            PropertyKind::Any => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            PropertyKind::String => "string",
            PropertyKind::Number => "number",
            PropertyKind::Integer => "integer",
            PropertyKind::Boolean => "boolean",
            PropertyKind::Array => "array",
            PropertyKind::Object => "object",
            PropertyKind::Any => "any",
        }
    }
}

/// First validation failure, by field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

/// Structural validator derived once per character load from a tool's
/// declared parameter schema.
#[derive(Debug, Clone)]
pub struct ToolValidator {
    /// Declaration order preserved so the first offending field is stable.
    properties: Vec<(String, PropertyKind)>,
    required: Vec<String>,
    /// True for tools with no object schema: everything passes.
    permissive: bool,
}

impl ToolValidator {
    pub fn from_schema(parameters: Option<&serde_json::Value>) -> Self {
        let Some(schema) = parameters else {
            return Self::permissive();
        };
        if schema.get("type").and_then(|t| t.as_str()) != Some("object") {
            return Self::permissive();
        }

        let mut properties = Vec::new();
        if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
            for (name, prop_schema) in props {
                properties.push((name.clone(), PropertyKind::from_schema(prop_schema)));
            }
        }
        let required = schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        ToolValidator {
            properties,
            required,
            permissive: false,
        }
    }

    fn permissive() -> Self {
        ToolValidator {
            properties: Vec::new(),
            required: Vec::new(),
            permissive: true,
        }
    }

    pub fn validate(&self, arguments: &serde_json::Value) -> Result<(), ValidationIssue> {
        if self.permissive {
            return Ok(());
        }

        let Some(object) = arguments.as_object() else {
            return Err(ValidationIssue {
                field: "arguments".to_string(),
                message: "expected a JSON object".to_string(),
            });
        };

        for field in &self.required {
            if !object.contains_key(field) {
                return Err(ValidationIssue {
                    field: field.clone(),
                    message: "field required".to_string(),
                });
            }
        }

        for (field, kind) in &self.properties {
            if let Some(value) = object.get(field) {
                // Optional fields are absent-permitted; null counts as absent.
                if value.is_null() {
                    continue;
                }
                if !kind.matches(value) {
                    return Err(ValidationIssue {
                        field: field.clone(),
                        message: format!("expected {}", kind.name()),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Build the name → validator map for a character's declared tools.
pub fn build_validators(tools: &[ToolDefinition]) -> HashMap<String, ToolValidator> {
    tools
        .iter()
        .map(|tool| {
            (
                tool.function.name.clone(),
                ToolValidator::from_schema(tool.function.parameters.as_ref()),
            )
        })
        .collect()
}

/// Execute one tool call against a character's dispatcher.
///
/// Parse, validation, timeout and execution failures all come back as the
/// result string so the conversation can continue; only an unknown tool
/// name propagates, since a mismatch between declared and dispatched tools
/// is a programming error in the character.
pub async fn execute_tool(
    dispatch: &Arc<dyn ToolDispatch>,
    tool_name: &str,
    raw_arguments: &str,
    validators: &HashMap<String, ToolValidator>,
    character_name: &str,
) -> Result<String, ToolDispatchError> {
    let arguments: serde_json::Value = match serde_json::from_str(raw_arguments) {
        Ok(value) => value,
        Err(e) => {
            metrics::TOOL_ERRORS_JSON_PARSE.inc();
            error!(tool = tool_name, error = %e, "Tool arguments are not valid JSON");
            return Ok(format!("Error: Invalid JSON arguments - {e}"));
        }
    };

    if let Some(validator) = validators.get(tool_name) {
        if let Err(issue) = validator.validate(&arguments) {
            metrics::TOOL_ERRORS_VALIDATION.inc();
            error!(
                tool = tool_name,
                field = issue.field,
                "Tool argument validation failed"
            );
            return Ok(format!(
                "Error: Invalid parameter '{}' - {}",
                issue.field, issue.message
            ));
        }
    }

    // The handler runs off the event-processing path so a slow one cannot
    // stall unrelated sessions. On deadline the invocation is abandoned,
    // not cancelled: the side effect may still happen.
    let started = Instant::now();
    let dispatch = dispatch.clone();
    let name = tool_name.to_string();
    let handle =
        tokio::task::spawn_blocking(move || dispatch.handle_tool_call(&name, &arguments));

    let outcome = match tokio::time::timeout(TOOL_DEADLINE, handle).await {
        Err(_elapsed) => {
            metrics::TOOL_ERRORS_TIMEOUT.inc();
            error!(tool = tool_name, "Tool execution timed out");
            return Ok(format!(
                "Error: Tool execution timed out (exceeded {}ms)",
                TOOL_DEADLINE.as_millis()
            ));
        }
        Ok(Err(join_error)) => {
            metrics::TOOL_ERRORS_EXECUTION.inc();
            error!(tool = tool_name, error = %join_error, "Tool handler panicked");
            return Ok(format!("Error: handler panicked - {join_error}"));
        }
        Ok(Ok(outcome)) => outcome,
    };

    match outcome {
        Ok(result) => {
            let elapsed = started.elapsed();
            metrics::TOOL_CALLS.inc();
            metrics::TOOL_LATENCY.observe(elapsed.as_secs_f64());
            info!(
                character = character_name,
                tool = tool_name,
                elapsed_ms = elapsed.as_millis() as u64,
                "Tool executed"
            );
            if elapsed > WARN_THRESHOLD {
                warn!(
                    tool = tool_name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Tool latency approaching its deadline"
                );
            }
            Ok(result)
        }
        Err(err @ ToolDispatchError::UnknownTool(_)) => Err(err),
        Err(err) => {
            metrics::TOOL_ERRORS_EXECUTION.inc();
            error!(tool = tool_name, error = %err, "Tool execution failed");
            Ok(format!("Error: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct TestDispatch;

    impl ToolDispatch for TestDispatch {
        fn handle_tool_call(
            &self,
            name: &str,
            arguments: &serde_json::Value,
        ) -> Result<String, ToolDispatchError> {
            match name {
                "echo" => Ok(format!("echo: {}", arguments["text"].as_str().unwrap_or(""))),
                "slow" => {
                    std::thread::sleep(Duration::from_millis(150));
                    Ok("too late".to_string())
                }
                "broken" => Err(ToolDispatchError::Failed {
                    kind: "IoError".to_string(),
                    message: "disk on fire".to_string(),
                }),
                other => Err(ToolDispatchError::UnknownTool(other.to_string())),
            }
        }
    }

    fn dispatch() -> Arc<dyn ToolDispatch> {
        Arc::new(TestDispatch)
    }

    fn echo_validators() -> HashMap<String, ToolValidator> {
        build_validators(&[ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: "echo".to_string(),
                description: None,
                parameters: Some(json!({
                    "type": "object",
                    "properties": {
                        "text": {"type": "string"},
                        "importance": {"type": "string", "enum": ["low", "high"]},
                        "count": {"type": "integer"}
                    },
                    "required": ["text"]
                })),
            },
        }])
    }

    #[test]
    fn test_validator_requires_declared_fields() {
        let validators = echo_validators();
        let validator = &validators["echo"];

        assert!(validator.validate(&json!({"text": "hi"})).is_ok());

        let issue = validator.validate(&json!({})).unwrap_err();
        assert_eq!(issue.field, "text");
        assert_eq!(issue.message, "field required");
    }

    #[test]
    fn test_validator_checks_types() {
        let validators = echo_validators();
        let validator = &validators["echo"];

        let issue = validator
            .validate(&json!({"text": "hi", "count": "three"}))
            .unwrap_err();
        assert_eq!(issue.field, "count");

        assert!(
            validator
                .validate(&json!({"text": "hi", "count": 3}))
                .is_ok()
        );
    }

    #[test]
    fn test_enum_accepted_as_any_string() {
        let validators = echo_validators();
        let validator = &validators["echo"];
        // Enum membership is the handler's concern, not the validator's.
        assert!(
            validator
                .validate(&json!({"text": "hi", "importance": "whatever"}))
                .is_ok()
        );
        assert!(
            validator
                .validate(&json!({"text": "hi", "importance": 3}))
                .unwrap_err()
                .field
                == "importance"
        );
    }

    #[test]
    fn test_non_object_schema_is_permissive() {
        let validator = ToolValidator::from_schema(Some(&json!({"type": "string"})));
        assert!(validator.validate(&json!("anything")).is_ok());

        let validator = ToolValidator::from_schema(None);
        assert!(validator.validate(&json!(42)).is_ok());
    }

    #[tokio::test]
    async fn test_execute_tool_success() {
        let result = execute_tool(
            &dispatch(),
            "echo",
            r#"{"text": "hello"}"#,
            &echo_validators(),
            "tester",
        )
        .await
        .expect("no hard error");
        assert_eq!(result, "echo: hello");
    }

    #[tokio::test]
    async fn test_execute_tool_bad_json() {
        let result = execute_tool(&dispatch(), "echo", "{not json", &echo_validators(), "tester")
            .await
            .expect("recovered");
        assert!(result.starts_with("Error: Invalid JSON arguments"));
    }

    #[tokio::test]
    async fn test_execute_tool_validation_failure_names_field() {
        let result = execute_tool(&dispatch(), "echo", "{}", &echo_validators(), "tester")
            .await
            .expect("recovered");
        assert!(result.contains("Invalid parameter 'text'"));
    }

    #[tokio::test]
    async fn test_execute_tool_timeout() {
        let before = metrics::TOOL_ERRORS_TIMEOUT.get();
        let result = execute_tool(&dispatch(), "slow", "{}", &HashMap::new(), "tester")
            .await
            .expect("recovered");
        assert!(result.contains("timed out"));
        assert_eq!(metrics::TOOL_ERRORS_TIMEOUT.get(), before + 1);
    }

    #[tokio::test]
    async fn test_execute_tool_handler_failure_includes_kind() {
        let result = execute_tool(&dispatch(), "broken", "{}", &HashMap::new(), "tester")
            .await
            .expect("recovered");
        assert!(result.contains("IoError"));
        assert!(result.contains("disk on fire"));
    }

    #[tokio::test]
    async fn test_execute_tool_unknown_tool_raises() {
        let err = execute_tool(&dispatch(), "nope", "{}", &HashMap::new(), "tester")
            .await
            .expect_err("unknown tool must propagate");
        assert!(matches!(err, ToolDispatchError::UnknownTool(_)));
    }
}
