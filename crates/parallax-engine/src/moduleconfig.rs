//! Module manifest loading.
//!
//! Every module directory carries a `parallax.toml`. Loading yields an
//! [`UnvalidatedModuleConfig`]; merging plugin-supplied defaults turns it
//! into the resolved [`ModuleConfig`] shared with plugins and the controller.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use parallax_proto::language::{CustomDefaults, ModuleConfig};
use parallax_proto::schema::BUILTIN_MODULE;

use crate::error::{EngineError, EngineResult};

/// File name of the module manifest.
pub const MODULE_MANIFEST: &str = "parallax.toml";

#[derive(Debug, Deserialize)]
struct Manifest {
    module: String,
    language: String,
    #[serde(default)]
    build: Option<String>,
    #[serde(default)]
    deploy_dir: Option<PathBuf>,
    #[serde(default)]
    watch: Vec<String>,
    #[serde(default)]
    generated_schema_dir: Option<PathBuf>,
    #[serde(default)]
    language_config: BTreeMap<String, toml::Value>,
}

/// A parsed manifest that has not had plugin defaults applied yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnvalidatedModuleConfig {
    pub module: String,
    pub language: String,
    /// Absolute path of the module directory.
    pub dir: PathBuf,
    pub build: Option<String>,
    pub deploy_dir: Option<PathBuf>,
    pub watch: Vec<String>,
    pub generated_schema_dir: Option<PathBuf>,
    pub language_config: BTreeMap<String, serde_json::Value>,
}

impl UnvalidatedModuleConfig {
    /// Load and parse `dir/parallax.toml`.
    pub fn load(dir: &Path) -> EngineResult<Self> {
        let path = dir.join(MODULE_MANIFEST);
        let raw = std::fs::read_to_string(&path)?;
        let manifest: Manifest = toml::from_str(&raw)?;
        if manifest.module.is_empty() {
            return Err(EngineError::Config(format!(
                "{} has an empty module name",
                path.display()
            )));
        }
        if manifest.module == BUILTIN_MODULE {
            return Err(EngineError::Config(format!(
                "{BUILTIN_MODULE} is a reserved module name"
            )));
        }
        if manifest.language.is_empty() {
            return Err(EngineError::Config(format!(
                "{} does not declare a language",
                path.display()
            )));
        }
        let mut language_config = BTreeMap::new();
        for (key, value) in manifest.language_config {
            language_config.insert(key, serde_json::to_value(value)?);
        }
        Ok(Self {
            module: manifest.module,
            language: manifest.language,
            dir: dir.to_path_buf(),
            build: manifest.build,
            deploy_dir: manifest.deploy_dir,
            watch: manifest.watch,
            generated_schema_dir: manifest.generated_schema_dir,
            language_config,
        })
    }

    /// Merge plugin defaults into the manifest, manifest values winning, and
    /// validate the result.
    pub fn fill_defaults(self, defaults: &CustomDefaults) -> EngineResult<ModuleConfig> {
        let deploy_dir = self
            .deploy_dir
            .or_else(|| defaults.deploy_dir.clone())
            .ok_or_else(|| {
                EngineError::Config(format!(
                    "module {} has no deploy directory and its language supplies no default",
                    self.module
                ))
            })?;
        if deploy_dir.is_absolute() {
            return Err(EngineError::Config(format!(
                "module {}: deploy_dir must be relative to the module directory",
                self.module
            )));
        }
        let watch = if self.watch.is_empty() {
            defaults.watch.clone()
        } else {
            self.watch
        };
        let mut language_config = defaults.language_config.clone();
        language_config.extend(self.language_config);
        Ok(ModuleConfig {
            module: self.module,
            language: self.language,
            dir: self.dir,
            deploy_dir,
            watch,
            build: self.build.or_else(|| defaults.build.clone()),
            generated_schema_dir: self
                .generated_schema_dir
                .or_else(|| defaults.generated_schema_dir.clone()),
            language_config,
        })
    }

    /// Watch patterns to use before defaults are known. An empty manifest
    /// watch list falls back to watching everything.
    #[must_use]
    pub fn watch_patterns(&self) -> Vec<String> {
        if self.watch.is_empty() {
            vec!["**/*".into()]
        } else {
            self.watch.clone()
        }
    }
}
