//! GBNF grammars for constrained sampling
//!
//! Converts JSON schemas into GBNF and sanity-checks caller grammars before a
//! completion is accepted.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::Value;

use crate::error::EngineError;

const PRIMITIVES: &[(&str, &str)] = &[
    ("space", r#"" "?"#),
    ("value", "object | array | string | number | boolean | null"),
    (
        "object",
        r#""{" space ( string ":" space value ( "," space string ":" space value )* )? "}" space"#,
    ),
    ("array", r#""[" space ( value ( "," space value )* )? "]" space"#),
    ("string", r#""\"" char* "\"" space"#),
    (
        "char",
        r#"[^"\\\x7F\x00-\x1F] | [\\] (["\\/bfnrt] | "u" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F])"#,
    ),
    (
        "number",
        r#""-"? integral-part ( "." [0-9]+ )? ( [eE] [-+]? [0-9]+ )? space"#,
    ),
    ("integer", r#""-"? integral-part space"#),
    ("integral-part", "[0] | [1-9] [0-9]*"),
    ("boolean", r#"( "true" | "false" ) space"#),
    ("null", r#""null" space"#),
];

/// Rejects grammars without a `root` rule
pub fn validate_grammar(grammar: &str) -> Result<(), EngineError> {
    let root_rule = Regex::new(r"(?m)^\s*root\s*::=").map_err(regex_error)?;
    if root_rule.is_match(grammar) {
        Ok(())
    } else {
        Err(EngineError::InvalidParams(
            "grammar has no root rule".to_string(),
        ))
    }
}

/// Converts a JSON schema into a GBNF grammar whose `root` matches
/// documents valid under the schema.
///
/// Supports `type` (single or list), `properties`/`required`, `items`,
/// `enum`, `const`, `anyOf` and `oneOf`. Object properties are emitted in key
/// order. `$ref` is rejected.
pub fn json_schema_to_grammar(schema: &Value) -> Result<String, EngineError> {
    let mut converter = Converter::new()?;
    let root = converter.visit(schema, "root")?;
    if root != "root" {
        converter.rules.insert("root".to_string(), root);
    }

    let mut out = String::new();
    if let Some(body) = converter.rules.get("root") {
        out.push_str(&format!("root ::= {body}\n"));
    }
    for (name, body) in &converter.rules {
        if name != "root" {
            out.push_str(&format!("{name} ::= {body}\n"));
        }
    }
    for (name, body) in PRIMITIVES {
        if !converter.rules.contains_key(*name) {
            out.push_str(&format!("{name} ::= {body}\n"));
        }
    }
    Ok(out)
}

/// Quotes JSON text as a GBNF string literal
fn literal(value: &Value) -> String {
    let json = value.to_string();
    let mut out = String::with_capacity(json.len() + 2);
    out.push('"');
    for c in json.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn regex_error(e: regex::Error) -> EngineError {
    EngineError::InvalidParams(format!("grammar pattern: {e}"))
}

struct Converter {
    rules: BTreeMap<String, String>,
    invalid_name_chars: Regex,
}

impl Converter {
    fn new() -> Result<Self, EngineError> {
        Ok(Self {
            rules: BTreeMap::new(),
            invalid_name_chars: Regex::new(r"[^a-zA-Z0-9-]+").map_err(regex_error)?,
        })
    }

    /// Registers a rule under a sanitized, unique name and returns the name
    fn add_rule(&mut self, name: &str, body: String) -> String {
        let base = self.invalid_name_chars.replace_all(name, "-").to_string();
        let mut key = base.clone();
        let mut i = 1;
        while let Some(existing) = self.rules.get(&key) {
            if *existing == body {
                return key;
            }
            key = format!("{base}{i}");
            i += 1;
        }
        self.rules.insert(key.clone(), body);
        key
    }

    /// Returns the name of a rule matching `schema`
    fn visit(&mut self, schema: &Value, name: &str) -> Result<String, EngineError> {
        let obj = match schema {
            Value::Bool(true) => return Ok("value".to_string()),
            Value::Object(obj) => obj,
            other => {
                return Err(EngineError::InvalidParams(format!(
                    "unsupported schema: {other}"
                )))
            }
        };

        if obj.contains_key("$ref") {
            return Err(EngineError::InvalidParams(
                "schema references ($ref) are not supported".to_string(),
            ));
        }

        if let Some(alternatives) = obj.get("anyOf").or_else(|| obj.get("oneOf")) {
            let list = alternatives.as_array().ok_or_else(|| {
                EngineError::InvalidParams("anyOf/oneOf must be an array".to_string())
            })?;
            let mut alts = Vec::with_capacity(list.len());
            for (i, alt) in list.iter().enumerate() {
                alts.push(self.visit(alt, &format!("{name}-{i}"))?);
            }
            return Ok(self.add_rule(name, alts.join(" | ")));
        }

        if let Some(value) = obj.get("const") {
            return Ok(self.add_rule(name, format!("{} space", literal(value))));
        }

        if let Some(values) = obj.get("enum") {
            let list = values.as_array().ok_or_else(|| {
                EngineError::InvalidParams("enum must be an array".to_string())
            })?;
            let alts: Vec<String> = list.iter().map(literal).collect();
            return Ok(self.add_rule(name, format!("( {} ) space", alts.join(" | "))));
        }

        match obj.get("type") {
            None => {
                if obj.contains_key("properties") {
                    self.object(obj, name)
                } else if obj.contains_key("items") {
                    self.array(obj, name)
                } else {
                    Ok("value".to_string())
                }
            }
            Some(Value::String(t)) => self.typed(t, obj, name),
            Some(Value::Array(types)) => {
                let mut alts = Vec::with_capacity(types.len());
                for t in types {
                    let t = t.as_str().ok_or_else(|| {
                        EngineError::InvalidParams("type list must hold strings".to_string())
                    })?;
                    alts.push(self.typed(t, obj, &format!("{name}-{t}"))?);
                }
                Ok(self.add_rule(name, alts.join(" | ")))
            }
            Some(other) => Err(EngineError::InvalidParams(format!(
                "unsupported type: {other}"
            ))),
        }
    }

    fn typed(
        &mut self,
        t: &str,
        obj: &serde_json::Map<String, Value>,
        name: &str,
    ) -> Result<String, EngineError> {
        match t {
            "object" => self.object(obj, name),
            "array" => self.array(obj, name),
            "string" | "number" | "integer" | "boolean" | "null" => Ok(t.to_string()),
            other => Err(EngineError::InvalidParams(format!(
                "unsupported type: {other}"
            ))),
        }
    }

    fn object(
        &mut self,
        obj: &serde_json::Map<String, Value>,
        name: &str,
    ) -> Result<String, EngineError> {
        let properties = match obj.get("properties").and_then(Value::as_object) {
            Some(p) if !p.is_empty() => p,
            _ => return Ok("object".to_string()),
        };
        let required: Vec<&str> = obj
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut req = Vec::new();
        let mut opt = Vec::new();
        for (prop, prop_schema) in properties {
            let value_rule = self.visit(prop_schema, &format!("{name}-{prop}"))?;
            let kv = self.add_rule(
                &format!("{name}-{prop}-kv"),
                format!(
                    r#"{} space ":" space {value_rule}"#,
                    literal(&Value::String(prop.clone()))
                ),
            );
            if required.contains(&prop.as_str()) {
                req.push(kv);
            } else {
                opt.push(kv);
            }
        }

        let optional_tail = |rest: &[String]| -> String {
            rest.iter()
                .map(|o| format!(r#" ( "," space {o} )?"#))
                .collect()
        };

        let mut body = String::from(r#""{" space "#);
        if !req.is_empty() {
            body.push_str(&req.join(r#" "," space "#));
            body.push_str(&optional_tail(&opt));
        } else {
            // Any ordered subset of the optional properties
            let alts: Vec<String> = (0..opt.len())
                .map(|i| format!("{}{}", opt[i], optional_tail(&opt[i + 1..])))
                .collect();
            body.push_str(&format!("( {} )?", alts.join(" | ")));
        }
        body.push_str(r#" "}" space"#);

        Ok(self.add_rule(name, body))
    }

    fn array(
        &mut self,
        obj: &serde_json::Map<String, Value>,
        name: &str,
    ) -> Result<String, EngineError> {
        let item = match obj.get("items") {
            Some(items) => self.visit(items, &format!("{name}-item"))?,
            None => return Ok("array".to_string()),
        };
        Ok(self.add_rule(
            name,
            format!(r#""[" space ( {item} ( "," space {item} )* )? "]" space"#),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_schema() {
        let schema = json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "age": {"type": "integer"},
                "tags": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["name", "age"]
        });
        let grammar = json_schema_to_grammar(&schema).unwrap();

        assert!(grammar.starts_with("root ::= "));
        assert!(grammar.contains(r#"root-name-kv ::= "\"name\"" space ":" space string"#));
        assert!(grammar.contains(r#"root-age-kv ::= "\"age\"" space ":" space integer"#));
        assert!(grammar.contains(r#"( "," space root-tags-kv )?"#));
        assert!(grammar.contains(r#"root-tags ::= "[" space ( string ( "," space string )* )? "]" space"#));
        assert!(grammar.contains("string ::= "));
        assert!(grammar.contains("integral-part ::= "));
        assert!(validate_grammar(&grammar).is_ok());
    }

    #[test]
    fn test_enum_and_const() {
        let grammar = json_schema_to_grammar(&json!({"enum": ["red", 1, null]})).unwrap();
        assert!(grammar.contains(r#"root ::= ( "\"red\"" | "1" | "null" ) space"#));

        let grammar = json_schema_to_grammar(&json!({"const": true})).unwrap();
        assert!(grammar.contains(r#"root ::= "true" space"#));
    }

    #[test]
    fn test_primitive_root() {
        let grammar = json_schema_to_grammar(&json!({"type": "number"})).unwrap();
        assert!(grammar.starts_with("root ::= number\n"));

        let grammar = json_schema_to_grammar(&json!({})).unwrap();
        assert!(grammar.starts_with("root ::= value\n"));
    }

    #[test]
    fn test_any_of() {
        let grammar =
            json_schema_to_grammar(&json!({"anyOf": [{"type": "string"}, {"type": "null"}]}))
                .unwrap();
        assert!(grammar.starts_with("root ::= string | null\n"));
    }

    #[test]
    fn test_all_optional_properties() {
        let grammar = json_schema_to_grammar(&json!({
            "type": "object",
            "properties": {"a": {"type": "boolean"}, "b": {"type": "null"}}
        }))
        .unwrap();
        assert!(grammar.contains(
            r#"root ::= "{" space ( root-a-kv ( "," space root-b-kv )? | root-b-kv )? "}" space"#
        ));
    }

    #[test]
    fn test_unsupported_schemas() {
        assert!(json_schema_to_grammar(&json!({"$ref": "#/defs/x"})).is_err());
        assert!(json_schema_to_grammar(&json!({"type": "date"})).is_err());
        assert!(json_schema_to_grammar(&json!(42)).is_err());
    }

    #[test]
    fn test_validate_grammar() {
        assert!(validate_grammar("root ::= \"yes\" | \"no\"").is_ok());
        assert!(validate_grammar("answer ::= \"yes\"").is_err());
    }

    #[test]
    fn test_rule_names_sanitized() {
        let grammar = json_schema_to_grammar(&json!({
            "type": "object",
            "properties": {"first name": {"enum": ["x"]}},
            "required": ["first name"]
        }))
        .unwrap();
        assert!(grammar.contains("root-first-name ::= "));
        assert!(grammar.contains("root-first-name-kv ::= "));
    }
}
