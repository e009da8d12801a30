//! Versioned, namespaced skill manifests.
//!
//! The `schema` field is versioned so future revisions can be added
//! without ambiguous parsing. Manifests are validated on registration:
//! `prompt` skills need a template, `entrypoint` skills a
//! `module:function` reference, and the input/output schema fragments
//! must stay within the supported JSON-schema subset
//! (type/required/properties/additionalProperties/items).

use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use lmx_domain::{Error, Result};

pub const MANIFEST_SCHEMA_V1: &str = "opta.skills.manifest/v1";

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").unwrap())
}

fn entrypoint_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_]\w*(?:\.[A-Za-z_]\w*)*:[A-Za-z_]\w*$").unwrap())
}

fn semver_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(?:-[0-9A-Za-z.-]+)?(?:\+[0-9A-Za-z.-]+)?$",
        )
        .unwrap()
    })
}

const JSON_TYPES: &[&str] = &["string", "number", "integer", "boolean", "object", "array"];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Enums
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillKind {
    Prompt,
    Entrypoint,
}

impl SkillKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SkillKind::Prompt => "prompt",
            SkillKind::Entrypoint => "entrypoint",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionTag {
    ReadFiles,
    WriteFiles,
    NetworkAccess,
    ShellExec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RiskTag {
    Low,
    Medium,
    High,
    ApprovalRequired,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manifest
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_schema() -> String {
    MANIFEST_SCHEMA_V1.to_string()
}
fn d_namespace() -> String {
    "default".to_string()
}
fn d_version() -> String {
    "1.0.0".to_string()
}
fn d_timeout() -> f64 {
    10.0
}
fn d_skill_id() -> String {
    Uuid::new_v4().simple().to_string()
}
fn d_open_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {},
        "required": [],
        "additionalProperties": true,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillManifest {
    #[serde(rename = "schema", default = "d_schema")]
    pub schema_version: String,
    #[serde(default = "d_namespace")]
    pub namespace: String,
    pub name: String,
    #[serde(default = "d_version")]
    pub version: String,
    pub description: String,
    pub kind: SkillKind,
    #[serde(default)]
    pub permission_tags: Vec<PermissionTag>,
    #[serde(default)]
    pub risk_tags: Vec<RiskTag>,
    #[serde(default)]
    pub prompt_template: Option<String>,
    /// `module:function` reference resolved against the entrypoint
    /// registry.
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default = "d_open_schema")]
    pub input_schema: serde_json::Value,
    #[serde(default = "d_open_schema")]
    pub output_schema: serde_json::Value,
    #[serde(default = "d_timeout")]
    pub timeout_sec: f64,
    #[serde(default)]
    pub filesystem_roots: Vec<String>,
    #[serde(default)]
    pub model_preferences: Vec<String>,
    #[serde(default = "d_skill_id")]
    pub skill_id: String,
}

impl SkillManifest {
    /// Validate on registration.
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != MANIFEST_SCHEMA_V1 {
            return Err(Error::Validation(format!(
                "unsupported manifest schema '{}'",
                self.schema_version
            )));
        }
        if !identifier_re().is_match(&self.namespace) {
            return Err(Error::Validation(format!(
                "invalid namespace '{}'",
                self.namespace
            )));
        }
        if !identifier_re().is_match(&self.name) {
            return Err(Error::Validation(format!("invalid name '{}'", self.name)));
        }
        if !semver_re().is_match(&self.version) {
            return Err(Error::Validation(format!(
                "version '{}' is not semver",
                self.version
            )));
        }
        if self.description.trim().is_empty() {
            return Err(Error::Validation("description must be non-empty".into()));
        }
        if !(self.timeout_sec > 0.0 && self.timeout_sec <= 600.0) {
            return Err(Error::Validation(
                "timeout_sec must be in (0, 600]".into(),
            ));
        }
        match self.kind {
            SkillKind::Prompt => {
                if self.prompt_template.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::Validation(
                        "prompt skills require a prompt_template".into(),
                    ));
                }
            }
            SkillKind::Entrypoint => {
                let reference = self.entrypoint.as_deref().unwrap_or("");
                if !entrypoint_re().is_match(reference) {
                    return Err(Error::Validation(format!(
                        "entrypoint '{reference}' is not module:function form"
                    )));
                }
            }
        }
        validate_schema_node(&self.input_schema, "input_schema")?;
        validate_schema_node(&self.output_schema, "output_schema")?;
        Ok(())
    }

    /// Fully-qualified name, e.g. `default:summarize@1.0.0`.
    pub fn qualified_name(&self) -> String {
        format!("{}:{}@{}", self.namespace, self.name, self.version)
    }

    /// Registration aliases: the unversioned and the fully-qualified form.
    pub fn aliases(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            format!("{}:{}", self.namespace, self.name),
            self.qualified_name(),
        ]
    }

    pub fn entrypoint_module(&self) -> Option<&str> {
        self.entrypoint.as_deref()?.split(':').next()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schema subset validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn validate_schema_node(schema: &serde_json::Value, path: &str) -> Result<()> {
    let Some(object) = schema.as_object() else {
        return Err(Error::Validation(format!("{path} must be an object schema")));
    };

    if let Some(schema_type) = object.get("type") {
        let Some(name) = schema_type.as_str() else {
            return Err(Error::Validation(format!("{path}.type must be a string")));
        };
        if !JSON_TYPES.contains(&name) {
            return Err(Error::Validation(format!(
                "{path}.type must be one of {JSON_TYPES:?}"
            )));
        }
    }

    if let Some(required) = object.get("required") {
        let ok = required
            .as_array()
            .map(|items| items.iter().all(|i| i.is_string()))
            .unwrap_or(false);
        if !ok {
            return Err(Error::Validation(format!(
                "{path}.required must be a list of strings"
            )));
        }
    }

    if let Some(properties) = object.get("properties") {
        let Some(map) = properties.as_object() else {
            return Err(Error::Validation(format!(
                "{path}.properties must be an object"
            )));
        };
        for (key, child) in map {
            if key.is_empty() {
                return Err(Error::Validation(format!(
                    "{path}.properties keys must be non-empty"
                )));
            }
            validate_schema_node(child, &format!("{path}.properties.{key}"))?;
        }
    }

    if let Some(additional) = object.get("additionalProperties") {
        if !additional.is_boolean() {
            return Err(Error::Validation(format!(
                "{path}.additionalProperties must be boolean"
            )));
        }
    }

    if let Some(items) = object.get("items") {
        validate_schema_node(items, &format!("{path}.items"))?;
    }

    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Argument validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn matches_json_type(value: &serde_json::Value, schema_type: &str) -> bool {
    match schema_type {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => true,
    }
}

fn validate_payload(
    payload: &serde_json::Value,
    schema: &serde_json::Value,
    path: &str,
) -> Option<String> {
    if let Some(schema_type) = schema.get("type").and_then(|t| t.as_str()) {
        if !matches_json_type(payload, schema_type) {
            return Some(format!("{path} must be {schema_type}"));
        }
    }

    let has_properties = schema.get("properties").is_some();
    if schema.get("type").and_then(|t| t.as_str()) == Some("object") || has_properties {
        let Some(object) = payload.as_object() else {
            return Some(format!("{path} must be object"));
        };
        let empty = serde_json::Map::new();
        let properties = schema
            .get("properties")
            .and_then(|p| p.as_object())
            .unwrap_or(&empty);

        if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
            for key in required.iter().filter_map(|k| k.as_str()) {
                if !object.contains_key(key) {
                    return Some(format!("{path}.{key} is required"));
                }
            }
        }

        if schema.get("additionalProperties") == Some(&serde_json::Value::Bool(false)) {
            let mut unknown: Vec<&String> = object
                .keys()
                .filter(|k| !properties.contains_key(*k))
                .collect();
            unknown.sort();
            if let Some(first) = unknown.first() {
                return Some(format!("{path}.{first} is not allowed"));
            }
        }

        for (key, child_schema) in properties {
            if let Some(child) = object.get(key) {
                if let Some(error) = validate_payload(child, child_schema, &format!("{path}.{key}"))
                {
                    return Some(error);
                }
            }
        }
    }

    if schema.get("type").and_then(|t| t.as_str()) == Some("array") {
        let Some(items) = payload.as_array() else {
            return Some(format!("{path} must be array"));
        };
        if let Some(items_schema) = schema.get("items") {
            for (index, item) in items.iter().enumerate() {
                if let Some(error) =
                    validate_payload(item, items_schema, &format!("{path}[{index}]"))
                {
                    return Some(error);
                }
            }
        }
    }

    None
}

/// Validate skill arguments against a manifest input schema. Returns a
/// human-readable error or `None` when valid.
pub fn validate_skill_arguments(
    arguments: &serde_json::Map<String, serde_json::Value>,
    schema: &serde_json::Value,
) -> Option<String> {
    validate_payload(
        &serde_json::Value::Object(arguments.clone()),
        schema,
        "arguments",
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-process manifest registry, addressable by any alias.
#[derive(Default)]
pub struct SkillRegistry {
    by_alias: RwLock<HashMap<String, SkillManifest>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a manifest under all of its aliases. Later
    /// registrations of the same alias win (version upgrades).
    pub fn register(&self, manifest: SkillManifest) -> Result<()> {
        manifest.validate()?;
        let mut by_alias = self.by_alias.write();
        for alias in manifest.aliases() {
            by_alias.insert(alias, manifest.clone());
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<SkillManifest> {
        self.by_alias.read().get(name).cloned()
    }

    /// Distinct manifests, sorted by qualified name.
    pub fn list(&self) -> Vec<SkillManifest> {
        let by_alias = self.by_alias.read();
        let mut seen = HashMap::new();
        for manifest in by_alias.values() {
            seen.insert(manifest.qualified_name(), manifest.clone());
        }
        let mut manifests: Vec<SkillManifest> = seen.into_values().collect();
        manifests.sort_by(|a, b| a.qualified_name().cmp(&b.qualified_name()));
        manifests
    }

    pub fn remove(&self, name: &str) -> bool {
        let manifest = { self.by_alias.read().get(name).cloned() };
        match manifest {
            Some(manifest) => {
                let mut by_alias = self.by_alias.write();
                for alias in manifest.aliases() {
                    by_alias.remove(&alias);
                }
                true
            }
            None => false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn prompt_manifest(name: &str) -> SkillManifest {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "description": "summarize text",
            "kind": "prompt",
            "prompt_template": "Summarize: {text}",
            "input_schema": {
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"],
                "additionalProperties": false
            }
        }))
        .unwrap()
    }

    #[test]
    fn defaults_fill_in() {
        let manifest = prompt_manifest("summarize");
        assert_eq!(manifest.schema_version, MANIFEST_SCHEMA_V1);
        assert_eq!(manifest.namespace, "default");
        assert_eq!(manifest.version, "1.0.0");
        assert_eq!(manifest.timeout_sec, 10.0);
        assert!(!manifest.skill_id.is_empty());
        manifest.validate().unwrap();
    }

    #[test]
    fn prompt_requires_template() {
        let mut manifest = prompt_manifest("s");
        manifest.prompt_template = None;
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn entrypoint_requires_reference() {
        let manifest: SkillManifest = serde_json::from_value(serde_json::json!({
            "name": "runner",
            "description": "run things",
            "kind": "entrypoint",
        }))
        .unwrap();
        assert!(manifest.validate().is_err());

        let manifest: SkillManifest = serde_json::from_value(serde_json::json!({
            "name": "runner",
            "description": "run things",
            "kind": "entrypoint",
            "entrypoint": "tools.shell:run",
        }))
        .unwrap();
        manifest.validate().unwrap();
        assert_eq!(manifest.entrypoint_module(), Some("tools.shell"));

        let mut bad = manifest.clone();
        bad.entrypoint = Some("no-colon".into());
        assert!(bad.validate().is_err());
    }

    #[test]
    fn semver_enforced() {
        let mut manifest = prompt_manifest("s");
        manifest.version = "1.0".into();
        assert!(manifest.validate().is_err());
        manifest.version = "2.1.3-rc.1".into();
        manifest.validate().unwrap();
    }

    #[test]
    fn schema_subset_rejects_unknown_type() {
        let mut manifest = prompt_manifest("s");
        manifest.input_schema = serde_json::json!({"type": "tuple"});
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn aliases_cover_all_forms() {
        let manifest = prompt_manifest("summarize");
        let aliases = manifest.aliases();
        assert!(aliases.contains(&"summarize".to_string()));
        assert!(aliases.contains(&"default:summarize".to_string()));
        assert!(aliases.contains(&"default:summarize@1.0.0".to_string()));
    }

    #[test]
    fn argument_validation() {
        let manifest = prompt_manifest("s");
        let schema = &manifest.input_schema;

        let mut args = serde_json::Map::new();
        args.insert("text".into(), serde_json::json!("hello"));
        assert_eq!(validate_skill_arguments(&args, schema), None);

        let empty = serde_json::Map::new();
        assert_eq!(
            validate_skill_arguments(&empty, schema),
            Some("arguments.text is required".to_string())
        );

        let mut wrong = serde_json::Map::new();
        wrong.insert("text".into(), serde_json::json!(42));
        assert_eq!(
            validate_skill_arguments(&wrong, schema),
            Some("arguments.text must be string".to_string())
        );

        let mut extra = serde_json::Map::new();
        extra.insert("text".into(), serde_json::json!("x"));
        extra.insert("zzz".into(), serde_json::json!(1));
        assert_eq!(
            validate_skill_arguments(&extra, schema),
            Some("arguments.zzz is not allowed".to_string())
        );
    }

    #[test]
    fn array_items_validated() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "tags": {"type": "array", "items": {"type": "string"}}
            }
        });
        let mut args = serde_json::Map::new();
        args.insert("tags".into(), serde_json::json!(["a", 2]));
        assert_eq!(
            validate_skill_arguments(&args, &schema),
            Some("arguments.tags[1] must be string".to_string())
        );
    }

    #[test]
    fn registry_register_and_lookup() {
        let registry = SkillRegistry::new();
        registry.register(prompt_manifest("summarize")).unwrap();

        assert!(registry.get("summarize").is_some());
        assert!(registry.get("default:summarize").is_some());
        assert!(registry.get("default:summarize@1.0.0").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.list().len(), 1);

        assert!(registry.remove("summarize"));
        assert!(registry.get("default:summarize").is_none());
    }

    #[test]
    fn registry_rejects_invalid() {
        let registry = SkillRegistry::new();
        let mut manifest = prompt_manifest("bad name!");
        manifest.name = "bad name!".into();
        assert!(registry.register(manifest).is_err());
    }
}
