//! Module schema AST.
//!
//! Deliberately small: a module declares verbs, each verb names its request
//! and response data types, and a verb may carry ingress metadata. That is
//! enough to derive imports for the dependency graph, ingress routes at
//! deployment time, and a stable hash for change detection. Full type-system
//! validation is the plugins' concern.

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Name of the implicit module every other module may reference.
pub const BUILTIN_MODULE: &str = "builtin";

/// A reference to a data type or verb, optionally qualified by module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub name: String,
}

impl TypeRef {
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            module: None,
            name: name.into(),
        }
    }

    pub fn qualified(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: Some(module.into()),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for TypeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.module {
            Some(module) => write!(f, "{module}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// HTTP ingress metadata attached to a verb.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ingress {
    pub method: String,
    pub path: String,
}

/// A callable verb exported by a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verb {
    pub name: String,
    pub request: TypeRef,
    pub response: TypeRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<Ingress>,
}

/// A module schema as produced by a language plugin build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    #[serde(default)]
    pub verbs: Vec<Verb>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            comments: Vec::new(),
            verbs: Vec::new(),
        }
    }

    /// Modules this module references through verb signatures, sorted and
    /// deduplicated. Self-references and the builtin module are excluded.
    #[must_use]
    pub fn imports(&self) -> Vec<String> {
        let mut imports: Vec<String> = self
            .verbs
            .iter()
            .flat_map(|verb| [&verb.request, &verb.response])
            .filter_map(|r| r.module.clone())
            .filter(|m| m != &self.name && m != BUILTIN_MODULE)
            .collect();
        imports.sort();
        imports.dedup();
        imports
    }

    /// A stable content hash of the schema, used to decide whether dependents
    /// need rebuilding. Serialisation is canonical for a given AST.
    #[must_use]
    pub fn digest(&self) -> Digest {
        // Struct serialisation order is fixed, so the JSON form is stable.
        let json = serde_json::to_vec(self).unwrap_or_default();
        Digest::of(&json)
    }

    #[must_use]
    pub fn verb(&self, name: &str) -> Option<&Verb> {
        self.verbs.iter().find(|v| v.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_module() -> Module {
        Module {
            name: "echo".into(),
            comments: vec![],
            verbs: vec![Verb {
                name: "echo".into(),
                request: TypeRef::local("EchoRequest"),
                response: TypeRef::qualified("time", "TimeResponse"),
                ingress: Some(Ingress {
                    method: "GET".into(),
                    path: "/echo".into(),
                }),
            }],
        }
    }

    #[test]
    fn imports_exclude_self_and_builtin() {
        let mut module = echo_module();
        module.verbs.push(Verb {
            name: "again".into(),
            request: TypeRef::qualified("echo", "EchoRequest"),
            response: TypeRef::qualified(BUILTIN_MODULE, "Empty"),
            ingress: None,
        });
        assert_eq!(module.imports(), vec!["time".to_owned()]);
    }

    #[test]
    fn digest_is_stable_and_change_sensitive() {
        let module = echo_module();
        assert_eq!(module.digest(), echo_module().digest());

        let mut changed = echo_module();
        changed.verbs[0].name = "shout".into();
        assert_ne!(module.digest(), changed.digest());
    }
}
