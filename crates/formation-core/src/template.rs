//! `{{var}}` substitution over JSON trees.
//!
//! Balancer declarations may carry an attribute template; once a balancer
//! is active, the template is rendered per member node (with `lb_ip`,
//! `node_ip`, `node_name` bound) and merged into the node's attributes.

use std::collections::BTreeMap;

use serde_json::Value;

/// Variable bindings for one render.
pub type Bindings = BTreeMap<String, String>;

/// Render a JSON tree, substituting `{{key}}` occurrences in every string
/// leaf. Unknown keys are left untouched.
pub fn render(value: &Value, bindings: &Bindings) -> Value {
    match value {
        Value::String(s) => Value::String(render_str(s, bindings)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, bindings)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render(v, bindings)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_str(input: &str, bindings: &Bindings) -> String {
    let mut out = input.to_string();
    for (key, value) in bindings {
        let placeholder = format!("{{{{{key}}}}}");
        if out.contains(&placeholder) {
            out = out.replace(&placeholder, value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings() -> Bindings {
        BTreeMap::from([
            ("lb_ip".to_string(), "192.0.2.10".to_string()),
            ("node_name".to_string(), "web1".to_string()),
        ])
    }

    #[test]
    fn substitutes_in_nested_structures() {
        let template = json!({
            "haproxy": {"vip": "{{lb_ip}}", "backends": ["{{node_name}}:8080"]},
            "port": 8080,
        });

        let rendered = render(&template, &bindings());
        assert_eq!(rendered["haproxy"]["vip"], json!("192.0.2.10"));
        assert_eq!(rendered["haproxy"]["backends"], json!(["web1:8080"]));
        assert_eq!(rendered["port"], json!(8080));
    }

    #[test]
    fn unknown_placeholders_are_left_alone() {
        let template = json!("{{mystery}} at {{lb_ip}}");
        let rendered = render(&template, &bindings());
        assert_eq!(rendered, json!("{{mystery}} at 192.0.2.10"));
    }

    #[test]
    fn non_strings_pass_through() {
        let template = json!({"n": 3, "b": true, "nil": null});
        assert_eq!(render(&template, &bindings()), template);
    }
}
