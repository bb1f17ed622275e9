//! Node-init template rendering.
//!
//! Templates are opaque strings (cloud-init, a provider's own user-data
//! format, whatever the backend expects) with `${VAR}` placeholders
//! substituted from a fixed set of variables the operator knows how to fill
//! in. After substitution the result must parse as YAML and carry a handful
//! of required top-level keys — the operator checks shape, not semantics.

use std::collections::BTreeMap;

use crate::error::TemplateError;

/// Variables available to every rendered template. Unknown `${...}`
/// placeholders in the template are left
/// untouched rather than rejected — a provider's own user-data syntax may
/// use `${...}` for something else entirely, and this renderer only owns
/// the variables it knows about.
#[derive(Debug, Clone)]
pub struct TemplateVariables {
    pub cluster_name: String,
    pub cluster_endpoint: String,
    pub node_name: String,
    pub bootstrap_token: String,
    pub extra: BTreeMap<String, String>,
}

impl TemplateVariables {
    fn as_map(&self) -> BTreeMap<&str, &str> {
        let mut map = BTreeMap::new();
        map.insert("CLUSTER_NAME", self.cluster_name.as_str());
        map.insert("CLUSTER_ENDPOINT", self.cluster_endpoint.as_str());
        map.insert("NODE_NAME", self.node_name.as_str());
        map.insert("BOOTSTRAP_TOKEN", self.bootstrap_token.as_str());
        for (k, v) in &self.extra {
            map.insert(k.as_str(), v.as_str());
        }
        map
    }
}

/// Top-level keys a rendered node-init document must carry: version/
/// machine/cluster sections present, the immutable-OS machine-config shape
/// this operator targets. The renderer only validates their presence, not
/// their values — a provider adapter or the node's own bootstrap process is
/// responsible for acting on them.
const REQUIRED_TOP_LEVEL_KEYS: &[&str] = &["version", "machine", "cluster"];

const REQUIRED_VARIABLES: &[&str] = &[
    "CLUSTER_NAME",
    "CLUSTER_ENDPOINT",
    "NODE_NAME",
    "BOOTSTRAP_TOKEN",
];

/// Checks `template` carries every placeholder in [`REQUIRED_VARIABLES`],
/// substitutes from `variables`, then validates the result parses as YAML
/// and carries every key in [`REQUIRED_TOP_LEVEL_KEYS`].
///
/// The required-variable check runs against the template text itself,
/// before substitution — checking the rendered output instead would miss a
/// typo'd placeholder, since a key that never matched never got replaced
/// and so never appears in the output either.
pub fn render(template: &str, variables: &TemplateVariables) -> Result<String, TemplateError> {
    for required in REQUIRED_VARIABLES {
        let placeholder = format!("${{{required}}}");
        if !template.contains(&placeholder) {
            return Err(TemplateError::MissingRequiredVariable(required));
        }
    }

    let map = variables.as_map();
    let mut rendered = template.to_string();
    for (key, value) in &map {
        rendered = rendered.replace(&format!("${{{key}}}"), value);
    }

    let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered)
        .map_err(|e| TemplateError::InvalidYaml(e.to_string()))?;

    let mapping = parsed.as_mapping();
    for key in REQUIRED_TOP_LEVEL_KEYS {
        let present = mapping
            .map(|m| m.contains_key(serde_yaml::Value::String(key.to_string())))
            .unwrap_or(false);
        if !present {
            return Err(TemplateError::MissingTopLevelKey(key));
        }
    }

    Ok(rendered)
}
