use anyhow::{anyhow, Context, Result};
use jsonschema::{Draft, JSONSchema};
use once_cell::sync::Lazy;
use schemars::schema_for;
use serde_json::Value as JsonValue;

/// Schema generated from the configuration structs, so validation never
/// drifts from what `crate::config` actually deserializes.
static CONFIG_SCHEMA_GENERATED: Lazy<JsonValue> = Lazy::new(|| {
    let schema = schema_for!(crate::config::DispatchConfig);
    serde_json::to_value(&schema).unwrap_or(JsonValue::Bool(true))
});

/// Generated schema tightened at the top level:
/// - `version` and `modules` are required
/// - unknown top-level keys are rejected
///
/// Nested objects stay as generated.
static CONFIG_SCHEMA_STRICT_TOPLEVEL: Lazy<Result<JSONSchema, String>> = Lazy::new(|| {
    let mut schema_json = CONFIG_SCHEMA_GENERATED.clone();

    if let Some(obj) = schema_json.as_object_mut() {
        obj.insert("additionalProperties".to_string(), JsonValue::Bool(false));
        obj.insert(
            "required".to_string(),
            JsonValue::Array(vec![
                JsonValue::String("version".to_string()),
                JsonValue::String("modules".to_string()),
            ]),
        );
    }

    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema_json)
        .map_err(|err| format!("failed to compile configuration schema: {err}"))
});

/// Validate a configuration document before it is deserialized.
pub fn validate_config_yaml(yaml_text: &str) -> Result<()> {
    let yaml_value: serde_yaml::Value =
        serde_yaml::from_str(yaml_text).context("parse yaml into Value")?;

    // jsonschema validates JSON values
    let json_value: JsonValue =
        serde_json::to_value(&yaml_value).context("convert yaml value to json value")?;

    let compiled = CONFIG_SCHEMA_STRICT_TOPLEVEL
        .as_ref()
        .map_err(|msg| anyhow!("{msg}"))?;

    // `validate()` borrows `json_value`; consume the iterator before it drops.
    let result: Result<()> = match compiled.validate(&json_value) {
        Ok(()) => Ok(()),
        Err(err_iter) => {
            let mut msgs: Vec<String> = Vec::new();
            for (i, e) in err_iter.enumerate() {
                if i >= 10 {
                    msgs.push("... (more schema errors omitted)".to_string());
                    break;
                }
                let instance_path = e.instance_path.to_string();
                let path = if instance_path.is_empty() {
                    "/".to_string()
                } else {
                    instance_path
                };
                msgs.push(format!("at {path}: {e}"));
            }

            Err(anyhow!(
                "config schema validation failed:\n{}",
                msgs.join("\n")
            ))
        }
    };

    result
}

/// The generated schema, for `bulkapi schema`.
pub fn config_schema_json() -> &'static JsonValue {
    &CONFIG_SCHEMA_GENERATED
}
