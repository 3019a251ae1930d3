//! `calculator` tool: basic arithmetic on two operands.

use async_trait::async_trait;
use serde_json::json;

use super::{Tool, ToolResult};

pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "A simple calculator that can perform basic arithmetic operations"
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "operation": {
                    "type": "string",
                    "enum": ["add", "subtract", "multiply", "divide"],
                    "description": "The operation to perform"
                },
                "a": { "type": "number", "description": "First operand" },
                "b": { "type": "number", "description": "Second operand" }
            },
            "required": ["operation", "a", "b"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(operation) = input.get("operation").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: operation");
        };
        let (Some(a), Some(b)) = (
            input.get("a").and_then(|v| v.as_f64()),
            input.get("b").and_then(|v| v.as_f64()),
        ) else {
            return ToolResult::error("operands 'a' and 'b' must be numbers");
        };

        let result = match operation {
            "add" => a + b,
            "subtract" => a - b,
            "multiply" => a * b,
            "divide" => {
                if b == 0.0 {
                    return ToolResult::error("Division by zero");
                }
                a / b
            }
            other => return ToolResult::error(format!("Unknown operation: {other}")),
        };

        ToolResult::json(json!({ "result": result }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(input: serde_json::Value) -> ToolResult {
        CalculatorTool.execute(input).await
    }

    #[tokio::test]
    async fn arithmetic() {
        let r = run(json!({"operation": "multiply", "a": 6, "b": 7})).await;
        assert!(!r.is_error);
        let v: serde_json::Value = serde_json::from_str(&r.content).unwrap();
        assert_eq!(v["result"], 42.0);

        let r = run(json!({"operation": "divide", "a": 1, "b": 4})).await;
        assert_eq!(serde_json::from_str::<serde_json::Value>(&r.content).unwrap()["result"], 0.25);
    }

    #[tokio::test]
    async fn division_by_zero_fails() {
        let r = run(json!({"operation": "divide", "a": 1, "b": 0})).await;
        assert!(r.is_error);
        assert_eq!(r.content, "Division by zero");
    }

    #[tokio::test]
    async fn unknown_operation_fails() {
        let r = run(json!({"operation": "pow", "a": 2, "b": 3})).await;
        assert!(r.is_error);
        assert!(r.content.contains("pow"));
    }
}
