//! Tool System
//!
//! Tools are registered at startup and looked up by name from an agent's
//! enabled list. A tool's resolver is its [`Tool`] implementation: an
//! in-process function ([`FnTool`], the built-ins below) or a remote HTTP
//! endpoint (provided by the runtime crate).

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolError;
use crate::provider::ToolDeclaration;

/// JSON Schema primitive types understood by the validator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    fn matches(self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            // models often emit whole numbers as `2.0`
            ParamType::Integer => {
                value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }
}

/// Schema for one property
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub param_type: ParamType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Allowed values
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,

    /// Element schema for arrays
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertySchema>>,

    /// Nested properties for objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, PropertySchema>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl PropertySchema {
    pub fn new(param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            param_type,
            description: Some(description.into()),
            enum_values: None,
            items: None,
            properties: None,
            required: Vec::new(),
        }
    }

    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    pub fn with_items(mut self, items: PropertySchema) -> Self {
        self.items = Some(Box::new(items));
        self
    }

    fn validate(&self, path: &str, value: &Value) -> Result<(), String> {
        // integers are valid numbers; everything else must match exactly
        if !self.param_type.matches(value) {
            return Err(format!("'{path}' should be of type {:?}", self.param_type).to_lowercase());
        }
        if let Some(allowed) = &self.enum_values {
            if !allowed.contains(value) {
                return Err(format!("'{path}' must be one of {}", Value::Array(allowed.clone())));
            }
        }
        if let (Some(items), Some(array)) = (&self.items, value.as_array()) {
            for (i, item) in array.iter().enumerate() {
                items.validate(&format!("{path}[{i}]"), item)?;
            }
        }
        if let Some(object) = value.as_object() {
            for name in &self.required {
                if !object.contains_key(name) {
                    return Err(format!("missing required parameter '{path}.{name}'"));
                }
            }
            if let Some(props) = &self.properties {
                for (name, v) in object {
                    if let Some(schema) = props.get(name) {
                        schema.validate(&format!("{path}.{name}"), v)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Top-level parameter schema: always a JSON object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    #[serde(rename = "type", default = "object_type")]
    pub schema_type: ParamType,

    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,

    #[serde(default)]
    pub required: Vec<String>,

    /// Reject keys not listed in `properties` when `Some(false)`
    #[serde(
        default,
        rename = "additionalProperties",
        skip_serializing_if = "Option::is_none"
    )]
    pub additional_properties: Option<bool>,
}

fn object_type() -> ParamType {
    ParamType::Object
}

impl Default for ParameterSchema {
    fn default() -> Self {
        Self {
            schema_type: ParamType::Object,
            properties: BTreeMap::new(),
            required: Vec::new(),
            additional_properties: None,
        }
    }
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a property
    pub fn property(mut self, name: impl Into<String>, schema: PropertySchema, required: bool) -> Self {
        let name = name.into();
        if required {
            self.required.push(name.clone());
        }
        self.properties.insert(name, schema);
        self
    }

    pub fn strict(mut self) -> Self {
        self.additional_properties = Some(false);
        self
    }

    /// Validate call arguments. `null` is accepted as an empty object.
    pub fn validate(&self, arguments: &Value) -> Result<(), String> {
        let empty = serde_json::Map::new();
        let object = match arguments {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(format!(
                    "arguments must be a JSON object, got {}",
                    value_type_name(other)
                ));
            }
        };

        for name in &self.required {
            if !object.contains_key(name) {
                return Err(format!("missing required parameter '{name}'"));
            }
        }

        for (name, value) in object {
            match self.properties.get(name) {
                Some(schema) => schema.validate(name, value)?,
                None if self.additional_properties == Some(false) => {
                    return Err(format!("unexpected parameter '{name}'"));
                }
                None => {}
            }
        }
        Ok(())
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Tool definition: name, schema and execution limits
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Unique tool identifier
    pub name: String,

    /// Human-readable description (shown to LLM)
    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub parameters: ParameterSchema,

    /// Overrides the engine-wide tool timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: ParameterSchema) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            timeout_secs: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// Tool trait - implement to add new capabilities
///
/// Arguments have already been validated against [`Tool::spec`] by the
/// invoker when `call` runs.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    async fn call(&self, arguments: Value) -> Result<Value, ToolError>;
}

type ToolFn = dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// In-process tool backed by an async closure.
pub struct FnTool {
    spec: ToolSpec,
    func: Box<ToolFn>,
}

impl FnTool {
    pub fn new<F, Fut>(spec: ToolSpec, func: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            spec,
            func: Box::new(move |args| Box::pin(func(args))),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        (self.func)(arguments)
            .await
            .map_err(|e| ToolError::execution(&self.spec.name, e.to_string()))
    }
}

/// Registry for available tools
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the in-process built-ins
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(CalculatorTool);
        registry.register(DateTimeTool);
        registry
    }

    /// Register a new tool, replacing any tool of the same name
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.spec().name;
        self.tools.insert(name, tool);
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Declarations for the enabled tools that are actually registered, in
    /// the agent's order.
    pub fn declarations_for(&self, enabled: &[String]) -> Vec<ToolDeclaration> {
        enabled
            .iter()
            .filter_map(|name| {
                let tool = self.tools.get(name);
                if tool.is_none() {
                    tracing::warn!(tool = %name, "Enabled tool is not registered");
                }
                tool.map(|t| t.spec().declaration())
            })
            .collect()
    }

    /// Get tool names
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ============================================================================
// Built-in Tools
// ============================================================================

/// DateTime tool - returns current time
pub struct DateTimeTool;

#[async_trait]
impl Tool for DateTimeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "datetime",
            "Get the current date and time (UTC)",
            ParameterSchema::new().property(
                "format",
                PropertySchema::new(ParamType::String, "Output format: 'iso', 'human', or 'unix'")
                    .with_enum(vec!["iso".into(), "human".into(), "unix".into()]),
                false,
            ),
        )
    }

    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        let format = arguments
            .get("format")
            .and_then(Value::as_str)
            .unwrap_or("human");

        let now = chrono::Utc::now();
        let output = match format {
            "iso" => Value::String(now.to_rfc3339()),
            "unix" => Value::from(now.timestamp()),
            _ => Value::String(now.format("%A, %B %d, %Y at %H:%M:%S UTC").to_string()),
        };
        Ok(serde_json::json!({ "format": format, "result": output }))
    }
}

/// Calculator tool - evaluates arithmetic expressions
pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "calculator",
            "Evaluate an arithmetic expression with + - * / % ^ and parentheses",
            ParameterSchema::new().property(
                "expression",
                PropertySchema::new(ParamType::String, "Expression to evaluate, e.g. '(2 + 3) * 4'"),
                true,
            ),
        )
    }

    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        let expr = arguments
            .get("expression")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let value = evaluate_expression(expr).map_err(|e| ToolError::execution("calculator", e))?;
        Ok(serde_json::json!({ "expression": expr, "result": number_value(value) }))
    }
}

/// Render whole numbers as JSON integers so `21*2` yields `42`, not `42.0`.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn number_value(v: f64) -> Value {
    if v.fract() == 0.0 && v.abs() < 9.0e15 {
        Value::from(v as i64)
    } else {
        Value::from(v)
    }
}

/// Longest expression the calculator accepts
const MAX_EXPRESSION_LEN: usize = 4096;

/// Nesting limit for parentheses, unary minus and `^` chains. Every
/// recursive cycle passes through `unary`, so it is counted there.
const MAX_EXPRESSION_DEPTH: usize = 64;

/// Recursive-descent evaluator.
///
/// ```text
/// expr   := term (('+' | '-') term)*
/// term   := unary (('*' | '/' | '%') unary)*
/// unary  := '-' unary | power
/// power  := atom ('^' unary)?
/// atom   := number | '(' expr ')'
/// ```
fn evaluate_expression(expr: &str) -> Result<f64, String> {
    if expr.len() > MAX_EXPRESSION_LEN {
        return Err(format!("expression longer than {MAX_EXPRESSION_LEN} characters"));
    }
    let tokens: Vec<char> = expr.chars().filter(|c| !c.is_whitespace()).collect();
    if tokens.is_empty() {
        return Err("empty expression".into());
    }
    let mut parser = ExprParser { tokens, pos: 0, depth: 0 };
    let value = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!("unexpected '{}' at position {}", parser.tokens[parser.pos], parser.pos));
    }
    if value.is_finite() {
        Ok(value)
    } else {
        Err("result is not a finite number".into())
    }
}

struct ExprParser {
    tokens: Vec<char>,
    pos: usize,
    depth: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<char> {
        self.tokens.get(self.pos).copied()
    }

    fn expr(&mut self) -> Result<f64, String> {
        let mut value = self.term()?;
        while let Some(op @ ('+' | '-')) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, String> {
        let mut value = self.unary()?;
        while let Some(op @ ('*' | '/' | '%')) = self.peek() {
            self.pos += 1;
            let rhs = self.unary()?;
            value = match op {
                '*' => value * rhs,
                _ if rhs == 0.0 => return Err("division by zero".into()),
                '/' => value / rhs,
                _ => value % rhs,
            };
        }
        Ok(value)
    }

    fn unary(&mut self) -> Result<f64, String> {
        if self.depth >= MAX_EXPRESSION_DEPTH {
            return Err("expression nested too deeply".into());
        }
        self.depth += 1;
        let value = if self.peek() == Some('-') {
            self.pos += 1;
            self.unary().map(|v| -v)
        } else {
            self.power()
        };
        self.depth -= 1;
        value
    }

    fn power(&mut self) -> Result<f64, String> {
        let base = self.atom()?;
        if self.peek() == Some('^') {
            self.pos += 1;
            let exp = self.unary()?;
            return Ok(base.powf(exp));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                let value = self.expr()?;
                if self.peek() != Some(')') {
                    return Err("missing closing parenthesis".into());
                }
                self.pos += 1;
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => {
                let start = self.pos;
                while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.') {
                    self.pos += 1;
                }
                let literal: String = self.tokens[start..self.pos].iter().collect();
                literal
                    .parse::<f64>()
                    .map_err(|e| format!("invalid number '{literal}': {e}"))
            }
            Some(c) => Err(format!("unexpected '{c}' at position {}", self.pos)),
            None => Err("unexpected end of expression".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculator() {
        assert!((evaluate_expression("2 + 2").unwrap() - 4.0).abs() < f64::EPSILON);
        assert!((evaluate_expression("10 * 5").unwrap() - 50.0).abs() < f64::EPSILON);
        assert!((evaluate_expression("(2 + 3) * 4").unwrap() - 20.0).abs() < f64::EPSILON);
        assert!((evaluate_expression("2 ^ 8").unwrap() - 256.0).abs() < f64::EPSILON);
        assert!((evaluate_expression("-3 + 10 % 4").unwrap() + 1.0).abs() < f64::EPSILON);
        assert!((evaluate_expression("2 - -2").unwrap() - 4.0).abs() < f64::EPSILON);
        assert!(evaluate_expression("1 / 0").is_err());
        assert!(evaluate_expression("2 +").is_err());
        assert!(evaluate_expression("(1 + 2").is_err());
    }

    #[test]
    fn test_calculator_rejects_deep_nesting() {
        let nested = format!("{}1{}", "(".repeat(2000), ")".repeat(2000));
        assert_eq!(evaluate_expression(&nested).unwrap_err(), "expression nested too deeply");
        assert!(evaluate_expression(&format!("{}1", "-".repeat(2000))).is_err());
        assert!(evaluate_expression(&vec!["2"; 1000].join("^")).is_err());

        let huge = format!("{}1{}", "(".repeat(200_000), ")".repeat(200_000));
        assert!(evaluate_expression(&huge).unwrap_err().contains("longer than"));

        // ordinary nesting still works
        let shallow = format!("{}7{}", "(".repeat(20), ")".repeat(20));
        assert!((evaluate_expression(&shallow).unwrap() - 7.0).abs() < f64::EPSILON);
        assert!((evaluate_expression("---2").unwrap() + 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_calculator_tool_reports_deep_nesting() {
        let expression = format!("{}1{}", "(".repeat(500), ")".repeat(500));
        let err = CalculatorTool
            .call(serde_json::json!({ "expression": expression }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nested too deeply"));
    }

    #[tokio::test]
    async fn test_calculator_tool_returns_integer() {
        let out = CalculatorTool
            .call(serde_json::json!({"expression": "21*2"}))
            .await
            .unwrap();
        assert_eq!(out["result"], serde_json::json!(42));
    }

    #[test]
    fn test_tool_registry() {
        let registry = ToolRegistry::with_builtins();

        assert_eq!(registry.len(), 2);
        assert!(registry.get("datetime").is_some());
        assert!(registry.get("calculator").is_some());
        assert!(registry.get("unknown").is_none());

        let decls = registry.declarations_for(&["calculator".into(), "missing".into()]);
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].name, "calculator");
    }

    #[test]
    fn test_schema_validation() {
        let schema = ParameterSchema::new()
            .property("query", PropertySchema::new(ParamType::String, "q"), true)
            .property("limit", PropertySchema::new(ParamType::Integer, "n"), false)
            .property(
                "tags",
                PropertySchema::new(ParamType::Array, "t")
                    .with_items(PropertySchema::new(ParamType::String, "tag")),
                false,
            );

        assert!(schema.validate(&serde_json::json!({"query": "rust"})).is_ok());
        assert!(schema.validate(&serde_json::json!({"limit": 3})).is_err());
        assert!(schema.validate(&serde_json::json!({"query": "x", "limit": 1.5})).is_err());
        assert!(schema.validate(&serde_json::json!({"query": "x", "limit": 2.0})).is_ok());
        assert!(schema.validate(&serde_json::json!({"query": "x", "limit": -4.0})).is_ok());
        assert!(schema.validate(&serde_json::json!({"query": "x", "tags": ["a", 1]})).is_err());
        assert!(schema.validate(&serde_json::json!("not an object")).is_err());
        assert!(schema.clone().strict().validate(&serde_json::json!({"query": "x", "extra": 1})).is_err());
    }

    #[test]
    fn test_schema_serializes_as_json_schema() {
        let schema = CalculatorTool.spec().parameters;
        let json = serde_json::to_value(&schema).unwrap();
        assert_eq!(json["type"], "object");
        assert_eq!(json["properties"]["expression"]["type"], "string");
        assert_eq!(json["required"], serde_json::json!(["expression"]));
    }
}
