//! Deployment modules and bundles.
//!
//! A bundle is read from a project's blueprint (`project.deployment.bundle`)
//! or from a release override, validated, and handed to the Bundle Engine.

use crate::constants::BLUEPRINT_FILENAME;
use crate::cue::{self, Value};
use crate::error::{Error, Result};
use crate::git::Repo;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Generator tag used when a module does not name one.
pub const DEFAULT_MODULE_TYPE: &str = "kcl";

const BUNDLE_PATH: &str = "project.deployment.bundle";
const MODULE_REGISTRY_PATH: &str = "global.deployment.registries.modules";

/// A single deployable unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Module {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub registry: String,

    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub module_type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// Opaque generator input.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub values: serde_json::Value,

    /// Local override for registry, name and version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Module {
    /// Either `path` is set, or all of `name`, `registry` and `version` are.
    pub fn validate(&self) -> Result<()> {
        if self.path.as_deref().is_some_and(|p| !p.is_empty()) {
            return Ok(());
        }

        let missing: Vec<&str> = [
            ("name", &self.name),
            ("registry", &self.registry),
            ("version", &self.version),
        ]
        .into_iter()
        .filter(|(_, v)| v.is_empty())
        .map(|(field, _)| field)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::ValidationFailed(format!(
                "module must set path or {}",
                missing.join(", ")
            )))
        }
    }

    /// Generator tag, defaulting to `kcl`.
    pub fn generator(&self) -> &str {
        if self.module_type.is_empty() {
            DEFAULT_MODULE_TYPE
        } else {
            &self.module_type
        }
    }

    /// Instance name, defaulting to the module name.
    pub fn instance_name(&self) -> &str {
        if self.instance.is_empty() { &self.name } else { &self.instance }
    }
}

/// An environment's modules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleBundle {
    #[serde(default)]
    pub env: String,

    #[serde(default)]
    pub modules: BTreeMap<String, Module>,
}

impl ModuleBundle {
    /// Decodes a bundle from a CUE value.
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.to_json())
            .map_err(|e| Error::ValidationFailed(format!("invalid bundle: {}", e)))
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(Value::from_json(&serde_json::to_value(self)?))
    }

    /// Parses bundle CUE source.
    pub fn parse(src: &str) -> Result<Self> {
        Self::from_value(&cue::parse(src)?)
    }

    /// Canonical CUE source. Byte-identical for equal bundles.
    pub fn encode(&self) -> Result<String> {
        Ok(cue::format(&self.to_value()?))
    }

    /// Decodes a base64 CUE bundle carried on a release.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::ValidationFailed(format!("bundle override is not base64: {}", e)))?;
        let src = String::from_utf8(raw)
            .map_err(|e| Error::ValidationFailed(format!("bundle override is not UTF-8: {}", e)))?;
        let mut bundle = Self::parse(&src)?;
        bundle.apply_defaults(None);
        Ok(bundle)
    }

    /// Fills `type` and, for remote modules, `registry`.
    pub fn apply_defaults(&mut self, module_registry: Option<&str>) {
        for module in self.modules.values_mut() {
            if module.module_type.is_empty() {
                module.module_type = DEFAULT_MODULE_TYPE.to_string();
            }
            if module.registry.is_empty()
                && module.path.is_none()
                && let Some(registry) = module_registry
            {
                module.registry = registry.to_string();
            }
        }
    }

    /// Validates every module. Env and keys become path segments, so they
    /// must be plain names.
    pub fn validate(&self) -> Result<()> {
        check_segment("env", &self.env)?;
        for (key, module) in &self.modules {
            check_segment("module key", key)?;
            module
                .validate()
                .map_err(|e| Error::ValidationFailed(format!("module {}: {}", key, e)))?;
        }
        Ok(())
    }
}

pub(crate) fn check_segment(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value == "." || value == ".." || value.contains('/') || value.contains('\\') {
        return Err(Error::ValidationFailed(format!("invalid {}: {:?}", what, value)));
    }
    Ok(())
}

/// A parsed project blueprint.
#[derive(Debug, Clone)]
pub struct Blueprint {
    value: Value,
}

impl Blueprint {
    pub fn parse(src: &str) -> Result<Self> {
        Ok(Self {
            value: cue::parse(src)?,
        })
    }

    /// Reads `<project_path>/blueprint.cue` from a worktree.
    pub fn load(repo: &Repo, project_path: &str) -> Result<Self> {
        let rel = if project_path.is_empty() || project_path == "." {
            BLUEPRINT_FILENAME.to_string()
        } else {
            format!("{}/{}", project_path.trim_end_matches('/'), BLUEPRINT_FILENAME)
        };

        let raw = repo.read_file(&rel).map_err(|e| match e {
            Error::NotFound(_) => Error::NoBundle(format!("{} not found", rel)),
            other => other,
        })?;
        let src = String::from_utf8(raw).map_err(|e| Error::ValidationFailed(format!("{}: {}", rel, e)))?;

        debug!(path = %rel, "Loaded blueprint");
        Self::parse(&src)
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn project_name(&self) -> Option<&str> {
        self.value.lookup("project.name").and_then(Value::as_str)
    }

    /// The deployment bundle with defaults applied.
    pub fn bundle(&self) -> Result<ModuleBundle> {
        let raw = self
            .value
            .lookup(BUNDLE_PATH)
            .ok_or_else(|| Error::NoBundle(self.project_name().unwrap_or("<unnamed>").to_string()))?;

        let mut bundle = ModuleBundle::from_value(raw)?;
        bundle.apply_defaults(self.value.lookup(MODULE_REGISTRY_PATH).and_then(Value::as_str));
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLUEPRINT: &str = r#"
version: "1.0"
project: {
	name: "p"
	deployment: {
		on: {}
		bundle: {
			env: "test"
			modules: main: {
				name:    "module"
				version: "v1.0.0"
				values: foo: "bar"
			}
		}
	}
}
global: deployment: {
	registries: {
		containers: "registry.com"
		modules:    "registry.com/modules"
	}
	root: "root"
}
"#;

    fn module(name: &str, registry: &str, version: &str) -> Module {
        Module {
            name: name.into(),
            registry: registry.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_module_invariant() {
        assert!(module("m", "r", "v1").validate().is_ok());
        assert!(matches!(module("m", "", "v1").validate(), Err(Error::ValidationFailed(_))));

        let local = Module {
            path: Some("./mod".into()),
            ..Default::default()
        };
        assert!(local.validate().is_ok());
    }

    #[test]
    fn test_blueprint_bundle_defaults() {
        let bundle = Blueprint::parse(BLUEPRINT).unwrap().bundle().unwrap();
        let main = &bundle.modules["main"];

        assert_eq!(bundle.env, "test");
        assert_eq!(main.module_type, "kcl");
        assert_eq!(main.registry, "registry.com/modules");
        assert_eq!(main.values, serde_json::json!({"foo": "bar"}));
        assert!(bundle.validate().is_ok());
    }

    #[test]
    fn test_missing_bundle() {
        let bp = Blueprint::parse("project: name: \"p\"\n").unwrap();
        assert!(matches!(bp.bundle(), Err(Error::NoBundle(_))));
    }

    #[test]
    fn test_encode_is_deterministic() {
        let bundle = Blueprint::parse(BLUEPRINT).unwrap().bundle().unwrap();
        let encoded = bundle.encode().unwrap();

        assert_eq!(encoded, bundle.clone().encode().unwrap());
        assert_eq!(ModuleBundle::parse(&encoded).unwrap(), bundle);
        assert!(encoded.contains("type:     \"kcl\""));
    }

    #[test]
    fn test_base64_override() {
        let src = "env: \"prod\"\nmodules: web: {path: \"./web\"}\n";
        let bundle = ModuleBundle::from_base64(&STANDARD.encode(src)).unwrap();

        assert_eq!(bundle.env, "prod");
        assert_eq!(bundle.modules["web"].generator(), "kcl");
        assert!(bundle.modules["web"].registry.is_empty());
    }

    #[test]
    fn test_rejects_path_like_keys() {
        let mut bundle = ModuleBundle {
            env: "test".into(),
            ..Default::default()
        };
        bundle.modules.insert("../x".into(), module("m", "r", "v"));
        assert!(bundle.validate().is_err());

        bundle.modules.clear();
        bundle.env = "..".into();
        assert!(bundle.validate().is_err());
    }
}
