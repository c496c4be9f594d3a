//! `${path}` interpolation evaluator
//!
//! Two phases, both pure lookup: scan a string for `${…}` placeholders, then
//! compile each path into a sequence of field/index steps resolved against a
//! layered [`Scope`]. There is no expression language beyond selection — no
//! arithmetic, no function calls, no eval.
//!
//! A string that is exactly one placeholder evaluates to the referenced value
//! with its type preserved. A string mixing text and placeholders evaluates
//! to the concatenation of the parts, each substitution coerced to its
//! canonical textual form.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorKind, NodeError};

/// One step of a compiled selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Field(String),
    Index(usize),
}

/// A compiled dotted path with array indexing: `a.b[2].c`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    raw: String,
    steps: Vec<Step>,
}

impl Selector {
    /// Compile a selector. Paths are case-sensitive; empty segments and
    /// malformed indices are rejected.
    pub fn parse(raw: &str) -> Result<Self, NodeError> {
        let mut steps = Vec::new();
        let mut chars = raw.chars().peekable();
        let mut field = String::new();

        let flush = |field: &mut String, steps: &mut Vec<Step>| -> Result<(), NodeError> {
            if field.is_empty() {
                return Err(NodeError::validation(format!(
                    "invalid selector {raw:?}: empty path segment"
                )));
            }
            steps.push(Step::Field(std::mem::take(field)));
            Ok(())
        };

        while let Some(c) = chars.next() {
            match c {
                '.' => flush(&mut field, &mut steps)?,
                '[' => {
                    // `a[0]` and `a.b[1][2]` are both valid; an index may
                    // only follow a field or another index.
                    if !field.is_empty() {
                        steps.push(Step::Field(std::mem::take(&mut field)));
                    } else if steps.is_empty() {
                        return Err(NodeError::validation(format!(
                            "invalid selector {raw:?}: index without a field"
                        )));
                    }
                    let mut digits = String::new();
                    for d in chars.by_ref() {
                        if d == ']' {
                            break;
                        }
                        digits.push(d);
                    }
                    let index: usize = digits.parse().map_err(|_| {
                        NodeError::validation(format!(
                            "invalid selector {raw:?}: bad index {digits:?}"
                        ))
                    })?;
                    steps.push(Step::Index(index));
                    // A field after an index must be dot-separated.
                    if let Some('.') = chars.peek() {
                        chars.next();
                    } else if chars.peek().is_some_and(|c| *c != '[') {
                        return Err(NodeError::validation(format!(
                            "invalid selector {raw:?}: expected '.' or '[' after index"
                        )));
                    }
                }
                _ => field.push(c),
            }
        }
        if !field.is_empty() {
            steps.push(Step::Field(field));
        }
        if steps.is_empty() {
            return Err(NodeError::validation("invalid selector: empty path"));
        }

        Ok(Self {
            raw: raw.to_string(),
            steps,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// First field of the path; used by [`Scope`] to pick a frame.
    fn head(&self) -> Option<&str> {
        match self.steps.first() {
            Some(Step::Field(f)) => Some(f),
            _ => None,
        }
    }

    /// Walk the remaining steps inside `root`.
    fn resolve_within<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for step in &self.steps[1..] {
            current = match step {
                Step::Field(f) => current.get(f.as_str())?,
                Step::Index(i) => current.get(*i)?,
            };
        }
        Some(current)
    }
}

/// A layered variable scope.
///
/// Frames stack from base to top; resolution walks top-down and the first
/// frame containing the path's head field wins. Loop iterations push an
/// `item`/`index` frame and pop it afterwards, which gives the copy-on-write
/// layering the engine needs without cloning the whole scope.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    frames: Vec<Map<String, Value>>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a frame built from an object value. Non-objects are ignored.
    pub fn push_object(&mut self, value: Value) {
        if let Value::Object(map) = value {
            self.frames.push(map);
        }
    }

    pub fn push_frame(&mut self, frame: Map<String, Value>) {
        self.frames.push(frame);
    }

    pub fn pop_frame(&mut self) {
        self.frames.pop();
    }

    /// Bind a single top-level name in the top frame.
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        if self.frames.is_empty() {
            self.frames.push(Map::new());
        }
        if let Some(top) = self.frames.last_mut() {
            top.insert(name.into(), value);
        }
    }

    pub fn resolve(&self, selector: &Selector) -> Option<&Value> {
        let head = selector.head()?;
        for frame in self.frames.iter().rev() {
            if let Some(root) = frame.get(head) {
                return selector.resolve_within(root);
            }
        }
        None
    }
}

/// What to do when a placeholder path does not resolve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMode {
    /// Substitute an empty string and record a warning (the default).
    #[default]
    Lenient,

    /// Fail the node with a `validation` error.
    Strict,
}

/// Result of rendering a template or config tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub value: Value,

    /// One entry per unresolved path in lenient mode.
    pub warnings: Vec<String>,
}

/// One parsed part of a template string.
#[derive(Debug, Clone, PartialEq)]
enum Part {
    Text(String),
    Placeholder(Selector),
}

fn parse_template(input: &str) -> Result<Vec<Part>, NodeError> {
    let mut parts = Vec::new();
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        let (text, tail) = rest.split_at(start);
        if !text.is_empty() {
            parts.push(Part::Text(text.to_string()));
        }
        let Some(end) = tail.find('}') else {
            return Err(NodeError::validation(format!(
                "unterminated placeholder in {input:?}"
            )));
        };
        let path = &tail[2..end];
        parts.push(Part::Placeholder(Selector::parse(path)?));
        rest = &tail[end + 1..];
    }
    if !rest.is_empty() {
        parts.push(Part::Text(rest.to_string()));
    }

    Ok(parts)
}

/// Canonical textual form used when a substitution lands inside a larger
/// string: strings stay unquoted, scalars print plainly, null becomes the
/// empty string, and composites use compact JSON.
fn canonical_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// The interpolation evaluator. Stateless apart from its resolution mode;
/// never reads external state.
#[derive(Debug, Clone, Copy, Default)]
pub struct Interpolator {
    pub mode: ResolutionMode,
}

impl Interpolator {
    pub fn new(mode: ResolutionMode) -> Self {
        Self { mode }
    }

    /// Render one string against the scope.
    pub fn render_str(&self, input: &str, scope: &Scope) -> Result<Rendered, NodeError> {
        let parts = parse_template(input)?;
        let mut warnings = Vec::new();

        // Single-placeholder strings keep the resolved value's type.
        if let [Part::Placeholder(selector)] = parts.as_slice() {
            let value = match scope.resolve(selector) {
                Some(v) => v.clone(),
                None => self.unresolved(selector, &mut warnings)?,
            };
            return Ok(Rendered { value, warnings });
        }

        let mut out = String::new();
        for part in &parts {
            match part {
                Part::Text(t) => out.push_str(t),
                Part::Placeholder(selector) => match scope.resolve(selector) {
                    Some(v) => out.push_str(&canonical_text(v)),
                    None => {
                        let v = self.unresolved(selector, &mut warnings)?;
                        out.push_str(&canonical_text(&v));
                    }
                },
            }
        }

        Ok(Rendered {
            value: Value::String(out),
            warnings,
        })
    }

    /// Render every string inside a JSON tree; object keys are left alone.
    pub fn render_value(&self, input: &Value, scope: &Scope) -> Result<Rendered, NodeError> {
        let mut warnings = Vec::new();
        let value = self.render_value_inner(input, scope, &mut warnings)?;
        Ok(Rendered { value, warnings })
    }

    fn render_value_inner(
        &self,
        input: &Value,
        scope: &Scope,
        warnings: &mut Vec<String>,
    ) -> Result<Value, NodeError> {
        match input {
            Value::String(s) => {
                let mut rendered = self.render_str(s, scope)?;
                warnings.append(&mut rendered.warnings);
                Ok(rendered.value)
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.render_value_inner(item, scope, warnings)?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.render_value_inner(v, scope, warnings)?);
                }
                Ok(Value::Object(out))
            }
            scalar => Ok(scalar.clone()),
        }
    }

    fn unresolved(
        &self,
        selector: &Selector,
        warnings: &mut Vec<String>,
    ) -> Result<Value, NodeError> {
        match self.mode {
            ResolutionMode::Lenient => {
                warnings.push(format!("unresolved path: {}", selector.raw()));
                Ok(Value::String(String::new()))
            }
            ResolutionMode::Strict => Err(NodeError::permanent(
                ErrorKind::Validation,
                format!("unresolved path: {}", selector.raw()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Scope {
        let mut scope = Scope::new();
        scope.push_object(json!({
            "inputs": { "source": "api", "count": 3 },
            "outputs": {},
            "variables": { "region": "eu-west-1" },
            "n1": {
                "data": { "name": "Leanne Graham", "tags": ["admin", "beta"] },
                "status": 200
            }
        }));
        scope
    }

    #[test]
    fn test_selector_parse() {
        let s = Selector::parse("a.b[2].c").unwrap();
        assert_eq!(
            s.steps,
            vec![
                Step::Field("a".into()),
                Step::Field("b".into()),
                Step::Index(2),
                Step::Field("c".into()),
            ]
        );
    }

    #[test]
    fn test_selector_rejects_malformed() {
        assert!(Selector::parse("").is_err());
        assert!(Selector::parse("a..b").is_err());
        assert!(Selector::parse("a[x]").is_err());
        assert!(Selector::parse("[0]").is_err());
    }

    #[test]
    fn test_single_placeholder_preserves_type() {
        let interp = Interpolator::default();
        let rendered = interp.render_str("${inputs.count}", &scope()).unwrap();
        assert_eq!(rendered.value, json!(3));

        let rendered = interp.render_str("${n1.data}", &scope()).unwrap();
        assert_eq!(rendered.value["name"], "Leanne Graham");
    }

    #[test]
    fn test_mixed_template_concatenates() {
        let interp = Interpolator::default();
        let rendered = interp
            .render_str("hello ${n1.data.name}, you have ${inputs.count} items", &scope())
            .unwrap();
        assert_eq!(
            rendered.value,
            json!("hello Leanne Graham, you have 3 items")
        );
    }

    #[test]
    fn test_array_indexing() {
        let interp = Interpolator::default();
        let rendered = interp.render_str("${n1.data.tags[1]}", &scope()).unwrap();
        assert_eq!(rendered.value, json!("beta"));
    }

    #[test]
    fn test_lenient_unresolved_yields_empty_string_and_warning() {
        let interp = Interpolator::new(ResolutionMode::Lenient);
        let rendered = interp.render_str("${missing.path}", &scope()).unwrap();
        assert_eq!(rendered.value, json!(""));
        assert_eq!(rendered.warnings.len(), 1);
        assert!(rendered.warnings[0].contains("missing.path"));
    }

    #[test]
    fn test_strict_unresolved_fails() {
        let interp = Interpolator::new(ResolutionMode::Strict);
        let err = interp.render_str("${missing.path}", &scope()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn test_case_sensitive_resolution() {
        let interp = Interpolator::new(ResolutionMode::Strict);
        assert!(interp.render_str("${Inputs.source}", &scope()).is_err());
    }

    #[test]
    fn test_render_value_walks_tree() {
        let interp = Interpolator::default();
        let config = json!({
            "url": "https://api.example.com/users/${inputs.count}",
            "headers": { "x-region": "${variables.region}" },
            "body": { "raw": "${n1.data}" },
            "retries": 2
        });
        let rendered = interp.render_value(&config, &scope()).unwrap();
        assert_eq!(rendered.value["url"], "https://api.example.com/users/3");
        assert_eq!(rendered.value["headers"]["x-region"], "eu-west-1");
        assert_eq!(rendered.value["body"]["raw"]["name"], "Leanne Graham");
        assert_eq!(rendered.value["retries"], 2);
    }

    #[test]
    fn test_frame_shadowing() {
        let interp = Interpolator::default();
        let mut sc = scope();
        let mut frame = Map::new();
        frame.insert("item".to_string(), json!({"id": 7}));
        frame.insert("index".to_string(), json!(0));
        sc.push_frame(frame);

        let rendered = interp.render_str("${item.id}", &sc).unwrap();
        assert_eq!(rendered.value, json!(7));

        sc.pop_frame();
        let rendered = interp
            .render_str("${item.id}", &sc)
            .unwrap();
        assert_eq!(rendered.value, json!(""));
    }

    #[test]
    fn test_null_coerces_to_empty_text() {
        let interp = Interpolator::default();
        let mut sc = Scope::new();
        sc.push_object(json!({ "x": null }));
        let rendered = interp.render_str("value=${x}", &sc).unwrap();
        assert_eq!(rendered.value, json!("value="));
    }

    #[test]
    fn test_unterminated_placeholder() {
        let interp = Interpolator::default();
        assert!(interp.render_str("${inputs.source", &scope()).is_err());
    }
}
