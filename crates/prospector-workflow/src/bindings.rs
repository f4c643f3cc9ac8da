//! Typed step-input bindings.
//!
//! Step inputs may reference pipeline parameters and earlier step outputs
//! with `{{params.name}}`, `{{steps.var.path}}`, and — inside a `for_each`
//! fan-out — `{{item}}` / `{{item.field}}`. Bindings are compiled and
//! validated when the template is loaded, not when a step runs, so a typo
//! in a reference fails before any capability is invoked.

use prospector_core::{ProspectorError, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Where a binding path starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingRoot {
    /// Pipeline input parameter.
    Params,
    /// An earlier step's output, by its declared variable name.
    Steps,
    /// The current fan-out item (only valid inside a `for_each` step).
    Item,
}

/// A compiled reference like `steps.targets.regions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingPath {
    pub root: BindingRoot,
    /// For `Steps`, the first segment is the step's output variable.
    pub path: Vec<String>,
}

impl BindingPath {
    /// Parse the inside of a `{{…}}` marker.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut segments = raw.trim().split('.').map(str::trim);
        let root = match segments.next() {
            Some("params") => BindingRoot::Params,
            Some("steps") => BindingRoot::Steps,
            Some("item") => BindingRoot::Item,
            other => {
                return Err(ProspectorError::Validation(format!(
                    "binding must start with params, steps, or item, got '{}'",
                    other.unwrap_or("")
                )));
            }
        };
        let path: Vec<String> = segments.map(str::to_string).collect();
        if path.iter().any(|s| s.is_empty()) {
            return Err(ProspectorError::Validation(format!(
                "binding '{raw}' has an empty path segment"
            )));
        }
        match root {
            BindingRoot::Params if path.is_empty() => Err(ProspectorError::Validation(
                "params binding needs a parameter name".into(),
            )),
            BindingRoot::Steps if path.is_empty() => Err(ProspectorError::Validation(
                "steps binding needs a step variable name".into(),
            )),
            _ => Ok(Self { root, path }),
        }
    }
}

/// One piece of an interpolated string.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    Binding(BindingPath),
}

/// A step input (or cache key) compiled for fast resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledValue {
    /// No bindings anywhere below.
    Literal(Value),
    /// A string that is exactly one binding — substitutes the whole value.
    Binding(BindingPath),
    /// A string with embedded bindings — substitutes string renderings.
    Interpolated(Vec<Part>),
    Object(Vec<(String, CompiledValue)>),
    Array(Vec<CompiledValue>),
}

/// Values a binding resolves against at run time.
#[derive(Debug, Clone, Default)]
pub struct ExecutionScope {
    pub params: Map<String, Value>,
    /// Step outputs keyed by declared variable name.
    pub outputs: HashMap<String, Value>,
    /// Current fan-out item, when inside a `for_each` dispatch.
    pub item: Option<Value>,
}

impl CompiledValue {
    /// Compile a raw JSON tree, turning `{{…}}` string markers into bindings.
    pub fn compile(raw: &Value) -> Result<Self> {
        match raw {
            Value::String(s) => compile_string(s),
            Value::Object(map) => {
                let mut fields = Vec::with_capacity(map.len());
                for (k, v) in map {
                    fields.push((k.clone(), Self::compile(v)?));
                }
                Ok(CompiledValue::Object(fields))
            }
            Value::Array(items) => {
                let compiled: Result<Vec<_>> = items.iter().map(Self::compile).collect();
                Ok(CompiledValue::Array(compiled?))
            }
            other => Ok(CompiledValue::Literal(other.clone())),
        }
    }

    /// Visit every binding below this value.
    pub fn for_each_binding(&self, f: &mut impl FnMut(&BindingPath)) {
        match self {
            CompiledValue::Literal(_) => {}
            CompiledValue::Binding(b) => f(b),
            CompiledValue::Interpolated(parts) => {
                for part in parts {
                    if let Part::Binding(b) = part {
                        f(b);
                    }
                }
            }
            CompiledValue::Object(fields) => {
                for (_, v) in fields {
                    v.for_each_binding(f);
                }
            }
            CompiledValue::Array(items) => {
                for v in items {
                    v.for_each_binding(f);
                }
            }
        }
    }

    /// Resolve against a scope, producing a plain JSON value.
    pub fn resolve(&self, scope: &ExecutionScope) -> Result<Value> {
        match self {
            CompiledValue::Literal(v) => Ok(v.clone()),
            CompiledValue::Binding(b) => lookup(b, scope),
            CompiledValue::Interpolated(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        Part::Text(t) => out.push_str(t),
                        Part::Binding(b) => out.push_str(&render(&lookup(b, scope)?)),
                    }
                }
                Ok(Value::String(out))
            }
            CompiledValue::Object(fields) => {
                let mut map = Map::with_capacity(fields.len());
                for (k, v) in fields {
                    map.insert(k.clone(), v.resolve(scope)?);
                }
                Ok(Value::Object(map))
            }
            CompiledValue::Array(items) => {
                let resolved: Result<Vec<_>> = items.iter().map(|v| v.resolve(scope)).collect();
                Ok(Value::Array(resolved?))
            }
        }
    }
}

fn compile_string(s: &str) -> Result<CompiledValue> {
    if !s.contains("{{") {
        return Ok(CompiledValue::Literal(Value::String(s.to_string())));
    }

    let mut parts = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        let Some(end_rel) = rest[start..].find("}}") else {
            return Err(ProspectorError::Validation(format!(
                "unterminated binding in '{s}'"
            )));
        };
        let end = start + end_rel;
        if start > 0 {
            parts.push(Part::Text(rest[..start].to_string()));
        }
        parts.push(Part::Binding(BindingPath::parse(&rest[start + 2..end])?));
        rest = &rest[end + 2..];
    }
    if !rest.is_empty() {
        parts.push(Part::Text(rest.to_string()));
    }

    // A string that is exactly one binding substitutes the full value.
    if let [Part::Binding(b)] = parts.as_slice() {
        return Ok(CompiledValue::Binding(b.clone()));
    }
    Ok(CompiledValue::Interpolated(parts))
}

fn lookup(binding: &BindingPath, scope: &ExecutionScope) -> Result<Value> {
    let (base, path): (&Value, &[String]) = match binding.root {
        BindingRoot::Params => {
            let name = &binding.path[0];
            let value = scope.params.get(name).ok_or_else(|| {
                ProspectorError::Validation(format!("missing parameter '{name}'"))
            })?;
            (value, &binding.path[1..])
        }
        BindingRoot::Steps => {
            let var = &binding.path[0];
            let value = scope.outputs.get(var).ok_or_else(|| {
                ProspectorError::Workflow(format!("step output '{var}' not yet produced"))
            })?;
            (value, &binding.path[1..])
        }
        BindingRoot::Item => {
            let value = scope.item.as_ref().ok_or_else(|| {
                ProspectorError::Workflow("item binding outside a for_each step".into())
            })?;
            (value, &binding.path[..])
        }
    };

    let mut current = base;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(segment).ok_or_else(|| {
                ProspectorError::Workflow(format!("no field '{segment}' in bound value"))
            })?,
            Value::Array(items) => {
                let idx: usize = segment.parse().map_err(|_| {
                    ProspectorError::Workflow(format!(
                        "array binding segment '{segment}' is not an index"
                    ))
                })?;
                items.get(idx).ok_or_else(|| {
                    ProspectorError::Workflow(format!("array index {idx} out of bounds"))
                })?
            }
            _ => {
                return Err(ProspectorError::Workflow(format!(
                    "cannot descend into non-container at '{segment}'"
                )));
            }
        };
    }
    Ok(current.clone())
}

/// String rendering for embedded bindings.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> ExecutionScope {
        let mut scope = ExecutionScope::default();
        scope.params.insert("region".into(), json!("austin"));
        scope
            .outputs
            .insert("targets".into(), json!({"regions": ["north", "south"]}));
        scope
    }

    #[test]
    fn test_whole_string_binding_keeps_type() {
        let compiled = CompiledValue::compile(&json!("{{steps.targets.regions}}")).unwrap();
        let resolved = compiled.resolve(&scope()).unwrap();
        assert_eq!(resolved, json!(["north", "south"]));
    }

    #[test]
    fn test_interpolated_string() {
        let compiled =
            CompiledValue::compile(&json!("coffee shops in {{params.region}}")).unwrap();
        let resolved = compiled.resolve(&scope()).unwrap();
        assert_eq!(resolved, json!("coffee shops in austin"));
    }

    #[test]
    fn test_nested_object_and_array_index() {
        let compiled = CompiledValue::compile(&json!({
            "query": "{{params.region}}",
            "first": "{{steps.targets.regions.0}}",
        }))
        .unwrap();
        let resolved = compiled.resolve(&scope()).unwrap();
        assert_eq!(resolved["query"], "austin");
        assert_eq!(resolved["first"], "north");
    }

    #[test]
    fn test_item_binding() {
        let mut scope = scope();
        scope.item = Some(json!({"name": "south"}));
        let compiled = CompiledValue::compile(&json!("{{item.name}}")).unwrap();
        assert_eq!(compiled.resolve(&scope).unwrap(), json!("south"));
    }

    #[test]
    fn test_bad_root_rejected_at_compile() {
        let err = CompiledValue::compile(&json!("{{event.text}}")).unwrap_err();
        assert!(matches!(err, ProspectorError::Validation(_)));
    }

    #[test]
    fn test_unterminated_binding_rejected() {
        assert!(CompiledValue::compile(&json!("{{params.region")).is_err());
    }

    #[test]
    fn test_missing_parameter_at_resolve() {
        let compiled = CompiledValue::compile(&json!("{{params.missing}}")).unwrap();
        let err = compiled.resolve(&scope()).unwrap_err();
        assert!(matches!(err, ProspectorError::Validation(_)));
    }
}
