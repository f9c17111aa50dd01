// Template evaluation for `{{ }}` expressions and conditionals
//
// The engine only depends on the `Templar` trait; `JinjaTemplar` is the
// default implementation backed by minijinja.

use std::fmt;
use std::sync::Arc;

use minijinja::value::{Enumerator, Object};
use minijinja::{Environment, ErrorKind, UndefinedBehavior, Value as JinjaValue};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::value::{boolean, is_truthy};
use crate::vars::InjectContext;

/// A string that is exactly one expression, e.g. `{{ packages }}`
static SINGLE_EXPR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\{\{\s*(?P<expr>.*?)\s*\}\}\s*$").expect("valid regex"));

#[derive(Debug, Clone, Error)]
pub enum TemplateError {
    /// An expression referenced a variable that does not exist
    #[error("{0}")]
    Undefined(String),
    #[error("{0}")]
    Render(String),
}

impl From<minijinja::Error> for TemplateError {
    fn from(err: minijinja::Error) -> Self {
        match err.kind() {
            ErrorKind::UndefinedError => TemplateError::Undefined(err.to_string()),
            _ => TemplateError::Render(err.to_string()),
        }
    }
}

/// Template provider consumed by the engine
pub trait Templar: Send + Sync {
    /// Render one string. A string consisting of a single `{{ expr }}` yields
    /// the expression's native value instead of its string form.
    ///
    /// With `fail_on_undefined == false` a string referencing an undefined
    /// variable is returned unrendered.
    fn render(
        &self,
        src: &str,
        vars: &InjectContext,
        fail_on_undefined: bool,
    ) -> Result<Value, TemplateError>;

    /// Evaluate a bare expression (no braces) with strict undefined handling
    fn evaluate(&self, expr: &str, vars: &InjectContext) -> Result<Value, TemplateError>;

    /// Template every string inside a value
    fn template(
        &self,
        value: &Value,
        vars: &InjectContext,
        fail_on_undefined: bool,
    ) -> Result<Value, TemplateError> {
        match value {
            Value::String(s) => self.render(s, vars, fail_on_undefined),
            Value::Array(items) => items
                .iter()
                .map(|v| self.template(v, vars, fail_on_undefined))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.template(v, vars, fail_on_undefined)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Evaluate a `when`-style conditional
    fn check_conditional(
        &self,
        conditional: &str,
        vars: &InjectContext,
        fail_on_undefined: bool,
    ) -> Result<bool, TemplateError> {
        let trimmed = conditional.trim();
        if trimmed.is_empty() {
            return Ok(true);
        }

        let expr = match SINGLE_EXPR.captures(trimmed) {
            Some(caps) => caps["expr"].to_string(),
            None => trimmed.to_string(),
        };

        // A bare variable holding a flag string ("yes", "false") is read as a boolean
        if let Some(Value::String(s)) = vars.get(&expr) {
            if !s.contains("{{") {
                return Ok(boolean(&Value::String(s.clone())));
            }
        }

        match self.evaluate(&expr, vars) {
            Ok(value) => Ok(is_truthy(&value)),
            Err(TemplateError::Undefined(_)) if !fail_on_undefined => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// All conditionals must hold
    fn check_conditionals(
        &self,
        conditionals: &[String],
        vars: &InjectContext,
        fail_on_undefined: bool,
    ) -> Result<bool, TemplateError> {
        for cond in conditionals {
            if !self.check_conditional(cond, vars, fail_on_undefined)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// minijinja-backed templar
pub struct JinjaTemplar {
    env: Environment<'static>,
}

impl JinjaTemplar {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_filter("bool", |v: JinjaValue| -> bool {
            match serde_json::to_value(&v) {
                Ok(json) => boolean(&json),
                Err(_) => false,
            }
        });
        env.add_filter("to_json", |v: JinjaValue| -> Result<String, minijinja::Error> {
            serde_json::to_string(&v).map_err(|e| {
                minijinja::Error::new(ErrorKind::InvalidOperation, e.to_string())
            })
        });

        JinjaTemplar { env }
    }

    fn context(&self, vars: &InjectContext) -> JinjaValue {
        JinjaValue::from_object(RenderContext {
            vars: vars.clone(),
        })
    }
}

impl Default for JinjaTemplar {
    fn default() -> Self {
        Self::new()
    }
}

impl Templar for JinjaTemplar {
    fn render(
        &self,
        src: &str,
        vars: &InjectContext,
        fail_on_undefined: bool,
    ) -> Result<Value, TemplateError> {
        if !src.contains("{{") && !src.contains("{%") {
            return Ok(Value::String(src.to_string()));
        }

        let result = match SINGLE_EXPR.captures(src) {
            Some(caps) if !caps["expr"].contains("{{") && !caps["expr"].contains("}}") => {
                self.evaluate(&caps["expr"], vars)
            }
            _ => self
                .env
                .render_str(src, self.context(vars))
                .map(Value::String)
                .map_err(TemplateError::from),
        };

        match result {
            Err(TemplateError::Undefined(_)) if !fail_on_undefined => {
                Ok(Value::String(src.to_string()))
            }
            other => other,
        }
    }

    fn evaluate(&self, expr: &str, vars: &InjectContext) -> Result<Value, TemplateError> {
        let compiled = self.env.compile_expression(expr)?;
        let value = compiled.eval(self.context(vars))?;
        if value.is_undefined() {
            return Err(TemplateError::Undefined(format!("'{}' is undefined", expr)));
        }
        serde_json::to_value(&value).map_err(|e| TemplateError::Render(e.to_string()))
    }
}

/// Lazily converted view of an inject context handed to minijinja
struct RenderContext {
    vars: InjectContext,
}

impl fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderContext")
            .field("keys", &self.vars.len())
            .finish()
    }
}

impl Object for RenderContext {
    fn get_value(self: &Arc<Self>, key: &JinjaValue) -> Option<JinjaValue> {
        let name = key.as_str()?;
        if name == "hostvars" {
            if let Some(hostvars) = self.vars.hostvars() {
                return Some(JinjaValue::from_object(HostVarsObject(hostvars.clone())));
            }
        }
        self.vars.get(name).map(JinjaValue::from_serialize)
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        let mut keys: Vec<JinjaValue> = self.vars.keys().map(JinjaValue::from).collect();
        if self.vars.hostvars().is_some() {
            keys.push(JinjaValue::from("hostvars"));
        }
        Enumerator::Values(keys)
    }
}

/// `hostvars[name]` lookups resolve lazily through the shared cache
#[derive(Debug)]
struct HostVarsObject(Arc<crate::vars::HostVars>);

impl Object for HostVarsObject {
    fn get_value(self: &Arc<Self>, key: &JinjaValue) -> Option<JinjaValue> {
        let host = key.as_str()?;
        self.0
            .get(host)
            .map(|vars| JinjaValue::from_serialize(&vars))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> InjectContext {
        let mut ctx = InjectContext::new();
        ctx.insert("name", json!("web1"));
        ctx.insert("port", json!(8080));
        ctx.insert("pkgs", json!(["nginx", "curl"]));
        ctx.insert("enabled", json!("yes"));
        ctx
    }

    #[test]
    fn test_render_string() {
        let t = JinjaTemplar::new();
        let out = t.render("host={{ name }}:{{ port }}", &vars(), true).unwrap();
        assert_eq!(out, json!("host=web1:8080"));
    }

    #[test]
    fn test_single_expression_keeps_native_type() {
        let t = JinjaTemplar::new();
        assert_eq!(t.render("{{ pkgs }}", &vars(), true).unwrap(), json!(["nginx", "curl"]));
        assert_eq!(t.render("{{ port }}", &vars(), true).unwrap(), json!(8080));
    }

    #[test]
    fn test_undefined_strict_and_lenient() {
        let t = JinjaTemplar::new();
        let err = t.render("{{ missing }}", &vars(), true).unwrap_err();
        assert!(matches!(err, TemplateError::Undefined(_)));

        let out = t.render("x={{ missing }}", &vars(), false).unwrap();
        assert_eq!(out, json!("x={{ missing }}"));
    }

    #[test]
    fn test_conditionals() {
        let t = JinjaTemplar::new();
        let v = vars();
        assert!(t.check_conditional("port == 8080", &v, true).unwrap());
        assert!(!t.check_conditional("{{ port > 9000 }}", &v, true).unwrap());
        assert!(t.check_conditional("enabled", &v, true).unwrap());
        assert!(t.check_conditional("missing is not defined", &v, true).unwrap());
        assert!(t.check_conditional("", &v, true).unwrap());
        assert!(t.check_conditional("missing", &v, true).is_err());
        assert!(!t.check_conditional("missing", &v, false).unwrap());
    }

    #[test]
    fn test_template_nested_value() {
        let t = JinjaTemplar::new();
        let value = json!({"dest": "/srv/{{ name }}", "list": ["{{ port }}", 3]});
        let out = t.template(&value, &vars(), true).unwrap();
        assert_eq!(out, json!({"dest": "/srv/web1", "list": [8080, 3]}));
    }

    #[test]
    fn test_bool_filter() {
        let t = JinjaTemplar::new();
        assert_eq!(t.evaluate("enabled | bool", &vars()).unwrap(), json!(true));
    }
}
