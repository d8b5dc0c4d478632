//! Deterministic JSON schema → GBNF conversion.
//!
//! The converter runs once during sampler construction; the scheduler only
//! ever sees the resulting grammar text. Schemas with constructs outside the
//! supported subset (`type`, `properties`/`required`, `items`, `enum`,
//! `const`) degrade to the generic JSON value grammar rather than failing.

use serde_json::Value;

use crate::engine::errors::EngineError;

/// Convert a JSON schema document into GBNF grammar text.
///
/// Fails only when `schema` is not valid JSON; the error is surfaced to the
/// submitter before any slot or KV state is touched.
pub fn json_schema_to_grammar(schema: &str) -> Result<String, EngineError> {
    let value: Value =
        serde_json::from_str(schema).map_err(|e| EngineError::InvalidGrammar {
            message: format!("invalid JSON schema: {e}"),
        })?;
    let mut builder = Builder::default();
    let root = builder.visit(&value, "root");
    Ok(builder.finish("root", &root))
}

#[derive(Default)]
struct Builder {
    rules: Vec<(String, String)>,
}

impl Builder {
    /// Returns a GBNF expression for `schema`, registering any helper rules
    /// it needs.
    fn visit(&mut self, schema: &Value, name: &str) -> String {
        let Some(obj) = schema.as_object() else {
            return self.generic_value();
        };

        if let Some(options) = obj.get("enum").and_then(Value::as_array) {
            self.space();
            let alts: Vec<String> = options.iter().map(|v| json_literal(v)).collect();
            return self.add_rule(name, &format!("({}) space", alts.join(" | ")));
        }
        if let Some(constant) = obj.get("const") {
            self.space();
            return self.add_rule(name, &format!("{} space", json_literal(constant)));
        }

        match obj.get("type") {
            // Schemas routinely omit "type": "object" when "properties" is present.
            None if obj.contains_key("properties") => self.visit_object(obj, name),
            Some(Value::String(ty)) => self.visit_typed(obj, ty, name),
            // e.g. "type": ["string", "null"]
            Some(Value::Array(types)) => {
                let alts: Vec<String> = types
                    .iter()
                    .enumerate()
                    .filter_map(|(i, t)| t.as_str().map(|t| (i, t.to_owned())))
                    .map(|(i, t)| self.visit_typed(obj, &t, &format!("{name}-{i}")))
                    .collect();
                if alts.is_empty() {
                    self.generic_value()
                } else {
                    self.add_rule(name, &alts.join(" | "))
                }
            }
            _ => self.generic_value(),
        }
    }

    fn visit_typed(
        &mut self,
        obj: &serde_json::Map<String, Value>,
        ty: &str,
        name: &str,
    ) -> String {
        match ty {
            "string" => self.primitive_string(),
            "integer" => self.primitive_integer(),
            "number" => self.primitive_number(),
            "boolean" => self.primitive_boolean(),
            "null" => self.primitive_null(),
            "array" => {
                let item = match obj.get("items") {
                    Some(items) => self.visit(items, &format!("{name}-item")),
                    None => self.generic_value(),
                };
                self.space();
                self.add_rule(
                    name,
                    &format!("\"[\" space ({item} (\",\" space {item})*)? \"]\" space"),
                )
            }
            "object" => self.visit_object(obj, name),
            _ => self.generic_value(),
        }
    }

    fn visit_object(&mut self, obj: &serde_json::Map<String, Value>, name: &str) -> String {
        let Some(props) = obj.get("properties").and_then(Value::as_object) else {
            return self.generic_object();
        };
        if props.is_empty() {
            return self.generic_object();
        }
        let required: Vec<&str> = obj
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        self.space();
        let mut kvs: Vec<(String, bool)> = Vec::new();
        for (key, sub) in props {
            let value = self.visit(sub, &format!("{name}-{key}"));
            let kv = format!("{} space \":\" space {}", gbnf_literal(&format!("\"{key}\"")), value);
            // Without a `required` list every property is emitted.
            let is_required = required.is_empty() || required.contains(&key.as_str());
            kvs.push((kv, is_required));
        }

        let mut body = String::from("\"{\" space ");
        let mut emitted = 0usize;
        for (kv, is_required) in &kvs {
            if *is_required {
                if emitted > 0 {
                    body.push_str("\",\" space ");
                }
                body.push_str(kv);
                body.push(' ');
                emitted += 1;
            }
        }
        // Optional properties trail the required ones in declaration order.
        for (kv, is_required) in &kvs {
            if !*is_required {
                if emitted > 0 {
                    body.push_str(&format!("(\",\" space {kv})? "));
                } else {
                    body.push_str(&format!("({kv})? "));
                    emitted += 1;
                }
            }
        }
        body.push_str("\"}\" space");
        self.add_rule(name, &body)
    }

    // ── primitive rules ───────────────────────────────────────────────────────

    fn space(&mut self) -> String {
        self.ensure("space", "\" \"?")
    }

    fn primitive_string(&mut self) -> String {
        self.space();
        self.ensure(
            "string",
            "\"\\\"\" ([^\"\\\\] | \"\\\\\" ([\"\\\\/bfnrt] | \"u\" [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F] [0-9a-fA-F]))* \"\\\"\" space",
        )
    }

    fn primitive_integer(&mut self) -> String {
        self.space();
        self.ensure("integer", "\"-\"? (\"0\" | [1-9] [0-9]*) space")
    }

    fn primitive_number(&mut self) -> String {
        self.space();
        self.ensure(
            "number",
            "\"-\"? (\"0\" | [1-9] [0-9]*) (\".\" [0-9]+)? ([eE] [-+]? [0-9]+)? space",
        )
    }

    fn primitive_boolean(&mut self) -> String {
        self.space();
        self.ensure("boolean", "(\"true\" | \"false\") space")
    }

    fn primitive_null(&mut self) -> String {
        self.space();
        self.ensure("null", "\"null\" space")
    }

    fn generic_object(&mut self) -> String {
        self.generic_value();
        "object".to_owned()
    }

    /// The mutually recursive rules for an arbitrary JSON value.
    fn generic_value(&mut self) -> String {
        if self.has_rule("value") {
            return "value".to_owned();
        }
        self.primitive_string();
        self.primitive_number();
        self.primitive_boolean();
        self.primitive_null();
        self.ensure(
            "value",
            "object | array | string | number | boolean | null",
        );
        self.ensure(
            "object",
            "\"{\" space (string \":\" space value (\",\" space string \":\" space value)*)? \"}\" space",
        );
        self.ensure(
            "array",
            "\"[\" space (value (\",\" space value)*)? \"]\" space",
        );
        "value".to_owned()
    }

    // ── bookkeeping ───────────────────────────────────────────────────────────

    fn has_rule(&self, name: &str) -> bool {
        self.rules.iter().any(|(n, _)| n == name)
    }

    fn ensure(&mut self, name: &str, body: &str) -> String {
        if !self.has_rule(name) {
            self.rules.push((name.to_owned(), body.to_owned()));
        }
        name.to_owned()
    }

    fn add_rule(&mut self, name: &str, body: &str) -> String {
        // Sanitize nested rule names: GBNF identifiers are [a-zA-Z0-9_-].
        let name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect();
        self.rules.push((name.clone(), body.to_owned()));
        name
    }

    fn finish(mut self, root_name: &str, root_expr: &str) -> String {
        if root_expr != root_name && !self.has_rule(root_name) {
            self.rules.push((root_name.to_owned(), root_expr.to_owned()));
        }
        // `root` first, helpers after, in creation order.
        self.rules
            .sort_by_key(|(n, _)| if n == root_name { 0 } else { 1 });
        self.rules
            .iter()
            .map(|(n, b)| format!("{n} ::= {b}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Encode a JSON value as a GBNF literal expression matching its exact text.
fn json_literal(value: &Value) -> String {
    gbnf_literal(&value.to_string())
}

/// Quote arbitrary text as a GBNF string literal.
fn gbnf_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
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

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::grammar::{Grammar, GrammarMatcher};

    fn matcher_for(schema: &str) -> GrammarMatcher {
        let gbnf = json_schema_to_grammar(schema).unwrap();
        let grammar = Grammar::parse(&gbnf).unwrap_or_else(|e| {
            panic!("generated grammar failed to parse: {e}\n{gbnf}");
        });
        GrammarMatcher::new(Arc::new(grammar))
    }

    #[test]
    fn invalid_json_is_rejected() {
        let err = json_schema_to_grammar("{not json").unwrap_err();
        assert!(matches!(err, EngineError::InvalidGrammar { .. }));
    }

    #[test]
    fn conversion_is_deterministic() {
        let schema = r#"{"type":"object","properties":{"a":{"type":"string"}}}"#;
        assert_eq!(
            json_schema_to_grammar(schema).unwrap(),
            json_schema_to_grammar(schema).unwrap()
        );
    }

    #[test]
    fn object_schema_accepts_matching_document() {
        let schema = r#"{
            "type": "object",
            "properties": {"name": {"type": "string"}, "age": {"type": "integer"}},
            "required": ["name", "age"]
        }"#;
        let mut m = matcher_for(schema);
        // serde_json maps iterate alphabetically: "age" precedes "name".
        assert!(m.accept_text(r#"{"age": 36, "name": "ada"}"#));
        assert!(m.can_finish());
    }

    #[test]
    fn object_schema_rejects_wrong_value_type() {
        let schema = r#"{
            "type": "object",
            "properties": {"age": {"type": "integer"}},
            "required": ["age"]
        }"#;
        let m = matcher_for(schema);
        assert!(!m.allows_text(r#"{"age": "old"}"#));
    }

    #[test]
    fn integer_schema() {
        let mut m = matcher_for(r#"{"type":"integer"}"#);
        assert!(m.accept_text("-120"));
        assert!(m.can_finish());
        assert!(!matcher_for(r#"{"type":"integer"}"#).allows_text("x"));
    }

    #[test]
    fn string_schema_handles_escapes() {
        let m = matcher_for(r#"{"type":"string"}"#);
        assert!(m.allows_text(r#""he said \"hi\"""#));
        assert!(!m.allows_text("bare"));
    }

    #[test]
    fn array_of_numbers() {
        let mut m = matcher_for(r#"{"type":"array","items":{"type":"number"}}"#);
        assert!(m.accept_text("[1, 2.5, -3e2]"));
        assert!(m.can_finish());
    }

    #[test]
    fn enum_matches_exact_literals() {
        let schema = r#"{"enum": ["red", "green", 3]}"#;
        let m = matcher_for(schema);
        assert!(m.allows_text(r#""red""#));
        assert!(m.allows_text("3"));
        assert!(!m.allows_text(r#""blue""#));
    }

    #[test]
    fn untyped_schema_degrades_to_generic_value() {
        let mut m = matcher_for("{}");
        assert!(m.accept_text(r#"{"anything": [1, "two", null]}"#));
        assert!(m.can_finish());
    }

    #[test]
    fn optional_properties_may_be_omitted() {
        let schema = r#"{
            "type": "object",
            "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
            "required": ["a"]
        }"#;
        let mut with_b = matcher_for(schema);
        assert!(with_b.accept_text(r#"{"a": 1, "b": 2}"#));
        assert!(with_b.can_finish());
        let mut without_b = matcher_for(schema);
        assert!(without_b.accept_text(r#"{"a": 1}"#));
        assert!(without_b.can_finish());
    }
}
