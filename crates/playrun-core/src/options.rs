//! Option translation
//!
//! Callers describe a launch as a JSON object of tool options. The
//! translator turns that into the argument list for the tool, a copy safe
//! to show in listings, and the vault passphrase if one was supplied.

use crate::catalog::JobDefinition;
use crate::error::{Result, RunnerError};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const EXTRA_VARS: &str = "extra-vars";
const INVENTORY: &str = "inventory";
const ENCRYPTION_KEY: &str = "encryption-key";
const VERBOSE: &str = "verbose";
const REDACTED: &str = "****";

/// Keys whose values are hidden in display arguments
const SECRET_KEYS: [&str; 2] = ["encrypt", "rekey"];

/// Output of an [`OptionsTranslator`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslatedOptions {
    /// Arguments passed to the tool
    pub args: Vec<String>,

    /// Same arguments with secret values replaced
    pub display_args: Vec<String>,

    /// Passphrase to hand over through a secret file
    pub passphrase: Option<String>,
}

/// Turns a request body into tool arguments
pub trait OptionsTranslator: Send + Sync {
    fn translate(&self, job: &JobDefinition, body: &Value) -> Result<TranslatedOptions>;
}

/// Translator for `ansible-playbook` style options
#[derive(Debug, Clone, Default)]
pub struct AnsibleOptions;

impl AnsibleOptions {
    pub fn new() -> Self {
        Self
    }

    fn normalize(body: &Value) -> Result<BTreeMap<String, Value>> {
        let entries = match body {
            Value::Null => return Ok(BTreeMap::new()),
            Value::Object(map) => map,
            other => {
                return Err(RunnerError::InvalidOptions(format!(
                    "expected an object, got {}",
                    other
                )))
            }
        };

        let mut options = BTreeMap::new();
        for (key, value) in entries {
            options.insert(key.trim_start_matches('-').to_string(), value.clone());
        }

        for (legacy, current) in [
            ("extraVars", EXTRA_VARS),
            ("inventoryFile", INVENTORY),
            ("encryptionKey", ENCRYPTION_KEY),
        ] {
            if let Some(value) = options.remove(legacy) {
                options.insert(current.to_string(), value);
            }
        }
        Ok(options)
    }
}

impl OptionsTranslator for AnsibleOptions {
    fn translate(&self, job: &JobDefinition, body: &Value) -> Result<TranslatedOptions> {
        let mut options = Self::normalize(body)?;
        let mut passphrase = None;

        if let Some(value) = options.remove(ENCRYPTION_KEY) {
            match value {
                Value::String(key) => passphrase = Some(key),
                Value::Null => {}
                other => {
                    return Err(RunnerError::InvalidOptions(format!(
                        "{} must be a string, got {}",
                        ENCRYPTION_KEY, other
                    )))
                }
            }
        }

        let extra_vars = options.remove(EXTRA_VARS).map(extra_vars_object).transpose()?;
        if passphrase.is_none() {
            passphrase = extra_vars
                .as_ref()
                .and_then(|vars| vars.get("encrypt"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
        }

        match options.remove(INVENTORY) {
            Some(Value::Null) => {}
            Some(value) => {
                options.insert(INVENTORY.to_string(), value);
            }
            None => {
                let hosts = if job.static_job {
                    "hosts/localhost"
                } else {
                    "hosts/verb_hosts"
                };
                options.insert(INVENTORY.to_string(), Value::String(hosts.to_string()));
            }
        }

        let mut translated = TranslatedOptions {
            passphrase,
            ..Default::default()
        };

        if let Some(vars) = extra_vars {
            let flag = format!("--{}", EXTRA_VARS);
            translated.args.push(flag.clone());
            translated.args.push(Value::Object(vars.clone()).to_string());
            translated.display_args.push(flag);
            translated.display_args.push(Value::Object(redact(vars)).to_string());
        }

        for (key, value) in options {
            let flag = format!("--{}", key);
            if key == VERBOSE {
                let count = verbosity(&value)?;
                for _ in 0..count {
                    translated.args.push(flag.clone());
                    translated.display_args.push(flag.clone());
                }
                continue;
            }

            let Some(rendered) = render(&value) else {
                if value == Value::Bool(true) {
                    translated.args.push(flag.clone());
                    translated.display_args.push(flag);
                }
                continue;
            };

            let shown = if SECRET_KEYS.contains(&key.as_str()) {
                REDACTED.to_string()
            } else {
                rendered.clone()
            };
            translated.args.push(flag.clone());
            translated.args.push(rendered);
            translated.display_args.push(flag);
            translated.display_args.push(shown);
        }

        Ok(translated)
    }
}

/// Accept extra vars as an object or as a list of `key=value` strings
fn extra_vars_object(value: Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Array(items) => Ok(items
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|item| item.split_once('='))
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()),
        Value::Null => Ok(Map::new()),
        other => Err(RunnerError::InvalidOptions(format!(
            "{} must be an object or a list, got {}",
            EXTRA_VARS, other
        ))),
    }
}

fn redact(mut vars: Map<String, Value>) -> Map<String, Value> {
    for key in SECRET_KEYS {
        if let Some(value) = vars.get_mut(key) {
            *value = Value::String(REDACTED.to_string());
        }
    }
    vars
}

fn verbosity(value: &Value) -> Result<u64> {
    let count = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        Value::Bool(b) => Some(u64::from(*b)),
        Value::Null => Some(0),
        _ => None,
    };
    count.ok_or_else(|| RunnerError::InvalidOptions(format!("invalid {}: {}", VERBOSE, value)))
}

/// Value of a `--key value` pair; `None` for flags and omitted options
fn render(value: &Value) -> Option<String> {
    match value {
        Value::Bool(_) | Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job() -> JobDefinition {
        JobDefinition::new("site", "ansible-playbook").arg("site.yml")
    }

    fn static_job() -> JobDefinition {
        JobDefinition::new("config-processor-run", "ansible-playbook").static_job(true)
    }

    fn translate(job: &JobDefinition, body: Value) -> TranslatedOptions {
        AnsibleOptions::new().translate(job, &body).unwrap()
    }

    #[test]
    fn test_empty_body_gets_default_inventory() {
        assert_eq!(translate(&job(), Value::Null).args, vec!["--inventory", "hosts/verb_hosts"]);
        assert_eq!(
            translate(&static_job(), json!({})).args,
            vec!["--inventory", "hosts/localhost"]
        );
    }

    #[test]
    fn test_null_inventory_suppresses_flag() {
        let out = translate(&job(), json!({ "inventory": null, "limit": "compute-0001" }));
        assert_eq!(out.args, vec!["--limit", "compute-0001"]);
    }

    #[test]
    fn test_leading_dashes_and_legacy_keys() {
        let out = translate(
            &job(),
            json!({ "--limit": 100, "inventoryFile": "hosts/custom", "-check": true, "diff": false }),
        );
        assert_eq!(
            out.args,
            vec!["--check", "--inventory", "hosts/custom", "--limit", "100"]
        );
    }

    #[test]
    fn test_extra_vars_list_becomes_json_object() {
        let out = translate(
            &job(),
            json!({ "extraVars": ["a=1", "b=x=y", "junk"], "inventory": null }),
        );
        assert_eq!(out.args[0], "--extra-vars");
        let vars: Value = serde_json::from_str(&out.args[1]).unwrap();
        assert_eq!(vars, json!({ "a": "1", "b": "x=y" }));
    }

    #[test]
    fn test_verbose_repeats_flag() {
        let out = translate(&job(), json!({ "verbose": 3, "inventory": null }));
        assert_eq!(out.args, vec!["--verbose"; 3]);
        let out = translate(&job(), json!({ "verbose": "0", "inventory": null }));
        assert!(out.args.is_empty());
    }

    #[test]
    fn test_encryption_key_becomes_passphrase() {
        let out = translate(&job(), json!({ "encryptionKey": "s3cret", "inventory": null }));
        assert_eq!(out.passphrase.as_deref(), Some("s3cret"));
        assert!(out.args.is_empty());
    }

    #[test]
    fn test_extra_vars_encrypt_is_extracted_and_redacted() {
        let out = translate(
            &static_job(),
            json!({ "extra-vars": { "encrypt": "k1", "rekey": "" } }),
        );
        assert_eq!(out.passphrase.as_deref(), Some("k1"));

        let passed: Value = serde_json::from_str(&out.args[1]).unwrap();
        assert_eq!(passed["encrypt"], "k1");

        let shown = out.display_args.join(" ");
        assert!(!shown.contains("k1"));
        assert!(shown.contains(REDACTED));
    }

    #[test]
    fn test_top_level_secrets_redacted_in_display() {
        let out = translate(&job(), json!({ "rekey": "new", "inventory": null }));
        assert_eq!(out.args, vec!["--rekey", "new"]);
        assert_eq!(out.display_args, vec!["--rekey", REDACTED]);
    }

    #[test]
    fn test_invalid_bodies_rejected() {
        let translator = AnsibleOptions::new();
        assert!(matches!(
            translator.translate(&job(), &json!(["limit"])),
            Err(RunnerError::InvalidOptions(_))
        ));
        assert!(matches!(
            translator.translate(&job(), &json!({ "verbose": "lots" })),
            Err(RunnerError::InvalidOptions(_))
        ));
        assert!(matches!(
            translator.translate(&job(), &json!({ "extra-vars": 5 })),
            Err(RunnerError::InvalidOptions(_))
        ));
    }
}
