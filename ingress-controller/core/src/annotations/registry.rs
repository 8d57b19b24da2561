use super::{decode, standard, AnnotationError, AnnotationSpec, Scope, Timeout, Value};
use crate::{Audit, AuditRecord, ResourceId, TracingAudit};
use ahash::AHashMap as HashMap;
use ingress_controller_k8s_api::ObjectMeta;
use std::{collections::BTreeMap, fmt, sync::Arc};

/// The ordered, immutable set of annotations the controller understands.
///
/// A registry is built once at startup and shared by reference; it is never mutated afterwards.
pub struct Registry {
    prefix: String,
    entries: Vec<Entry>,
    by_name: HashMap<&'static str, usize>,
    allow_critical: bool,
    audit: Arc<dyn Audit>,
}

struct Entry {
    spec: AnnotationSpec,
    default: Option<Value>,
}

/// Where a resolved value came from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Source {
    /// Set on the resource itself.
    Resource,

    /// Set by the operator-wide settings object.
    GlobalDefault,

    /// The annotation's built-in default.
    Default,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Resolved {
    pub value: Value,
    pub source: Source,
}

/// Every registered annotation resolved against a single resource.
///
/// Annotations that are unset and have no default are absent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedConfig {
    values: BTreeMap<&'static str, (Scope, Resolved)>,
}

/// Operator-wide annotation defaults, already decoded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GlobalDefaults {
    values: BTreeMap<&'static str, Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("annotation prefix must not be empty")]
    EmptyPrefix,

    #[error("annotation spec has an empty name")]
    EmptyName,

    #[error("annotation {0:?} is registered more than once")]
    Duplicate(&'static str),

    #[error("default for annotation {name:?} is invalid: {error}")]
    InvalidDefault {
        name: &'static str,
        error: AnnotationError,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// The resolution API was misused.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("annotation {key}: {error}")]
    Annotation { key: String, error: AnnotationError },

    #[error("annotation {key} is critical and critical annotations are disabled")]
    Forbidden { key: String },
}

// === impl Registry ===

impl Registry {
    pub fn new(
        prefix: impl ToString,
        specs: impl IntoIterator<Item = AnnotationSpec>,
    ) -> Result<Self, RegistryError> {
        let prefix = prefix.to_string();
        if prefix.is_empty() {
            return Err(RegistryError::EmptyPrefix);
        }

        let mut entries = Vec::new();
        let mut by_name = HashMap::new();
        for spec in specs {
            if spec.name.is_empty() {
                return Err(RegistryError::EmptyName);
            }
            if by_name.insert(spec.name, entries.len()).is_some() {
                return Err(RegistryError::Duplicate(spec.name));
            }
            let default = spec
                .default
                .map(|raw| decode(Some(raw), spec.kind, spec.validator))
                .transpose()
                .map_err(|error| RegistryError::InvalidDefault {
                    name: spec.name,
                    error,
                })?;
            entries.push(Entry { spec, default });
        }

        Ok(Self {
            prefix,
            entries,
            by_name,
            allow_critical: true,
            audit: Arc::new(TracingAudit),
        })
    }

    /// Builds a registry over the standard annotation table.
    pub fn standard(prefix: impl ToString) -> Result<Self, RegistryError> {
        Self::new(prefix, standard::SPECS.iter().copied())
    }

    pub fn with_audit(mut self, audit: Arc<dyn Audit>) -> Self {
        self.audit = audit;
        self
    }

    /// Controls whether critical annotations may be set on resources.
    pub fn allow_critical(mut self, allow: bool) -> Self {
        self.allow_critical = allow;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The fully-qualified annotation key for `name`.
    pub fn key(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }

    /// Iterates over all specs in registration order.
    pub fn specs(&self) -> impl Iterator<Item = &AnnotationSpec> + '_ {
        self.entries.iter().map(|e| &e.spec)
    }

    pub fn get(&self, name: &str) -> Option<&AnnotationSpec> {
        self.entry(name).map(|e| &e.spec)
    }

    fn entry(&self, name: &str) -> Option<&Entry> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    /// Decodes operator-wide defaults from a settings map keyed by annotation name.
    ///
    /// Keys that don't name a registered annotation are ignored. Invalid values are dropped and
    /// returned as errors so they can be reported without affecting every resource.
    pub fn global_defaults(
        &self,
        settings: &BTreeMap<String, String>,
    ) -> (GlobalDefaults, Vec<ResolveError>) {
        let mut values = BTreeMap::new();
        let mut errors = Vec::new();
        for entry in &self.entries {
            let spec = &entry.spec;
            if let Some(raw) = settings.get(spec.name) {
                match decode(Some(raw.as_str()), spec.kind, spec.validator) {
                    Ok(value) => {
                        values.insert(spec.name, value);
                    }
                    Err(error) => errors.push(ResolveError::Annotation {
                        key: spec.name.to_string(),
                        error,
                    }),
                }
            }
        }
        (GlobalDefaults { values }, errors)
    }

    /// Resolves a single annotation on a resource.
    ///
    /// An annotation set on the resource always wins; a malformed value is an error and never
    /// falls back to a default. Otherwise the operator-wide default applies, and then the
    /// spec's own default. Returns `None` when none of these provides a value.
    pub fn resolve(
        &self,
        spec: &AnnotationSpec,
        meta: &ObjectMeta,
        defaults: &GlobalDefaults,
    ) -> Result<Option<Resolved>, ResolveError> {
        if spec.name.is_empty() {
            return Err(ResolveError::InvalidArgument("annotation name is empty"));
        }
        let resource = ResourceId::from_meta(meta)
            .ok_or(ResolveError::InvalidArgument("resource has no name"))?;
        let entry = self
            .entry(spec.name)
            .ok_or(ResolveError::InvalidArgument("annotation is not registered"))?;
        self.resolve_entry(entry, &resource, meta, defaults)
    }

    /// Resolves every registered annotation on a resource, collecting all failures.
    pub fn resolve_all(
        &self,
        meta: &ObjectMeta,
        defaults: &GlobalDefaults,
    ) -> Result<ResolvedConfig, Vec<ResolveError>> {
        let resource = ResourceId::from_meta(meta)
            .ok_or_else(|| vec![ResolveError::InvalidArgument("resource has no name")])?;

        let mut values = BTreeMap::new();
        let mut errors = Vec::new();
        for entry in &self.entries {
            match self.resolve_entry(entry, &resource, meta, defaults) {
                Ok(Some(resolved)) => {
                    values.insert(entry.spec.name, (entry.spec.scope, resolved));
                }
                Ok(None) => {}
                Err(error) => errors.push(error),
            }
        }

        if errors.is_empty() {
            Ok(ResolvedConfig { values })
        } else {
            Err(errors)
        }
    }

    fn resolve_entry(
        &self,
        entry: &Entry,
        resource: &ResourceId,
        meta: &ObjectMeta,
        defaults: &GlobalDefaults,
    ) -> Result<Option<Resolved>, ResolveError> {
        let spec = &entry.spec;
        let key = self.key(spec.name);

        let raw = meta.annotations.as_ref().and_then(|a| a.get(&key));
        let resolved = match raw {
            Some(raw) => {
                if spec.is_critical() && !self.allow_critical {
                    return Err(ResolveError::Forbidden { key });
                }
                let value = decode(Some(raw.as_str()), spec.kind, spec.validator)
                    .map_err(|error| ResolveError::Annotation { key, error })?;
                Some(Resolved {
                    value,
                    source: Source::Resource,
                })
            }
            None => match defaults.values.get(spec.name) {
                Some(value) => Some(Resolved {
                    value: value.clone(),
                    source: Source::GlobalDefault,
                }),
                None => entry.default.clone().map(|value| Resolved {
                    value,
                    source: Source::Default,
                }),
            },
        };

        if let Some(resolved) = resolved.as_ref() {
            if spec.is_critical() && resolved.source != Source::Default {
                self.audit.record(AuditRecord {
                    resource: resource.clone(),
                    annotation: spec.name,
                    value: resolved.value.to_string(),
                    source: resolved.source,
                });
            }
        }

        Ok(resolved)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("prefix", &self.prefix)
            .field("annotations", &self.entries.len())
            .field("allow_critical", &self.allow_critical)
            .finish()
    }
}

// === impl ResolveError ===

impl ResolveError {
    pub fn annotation_error(&self) -> Option<&AnnotationError> {
        match self {
            Self::Annotation { error, .. } => Some(error),
            _ => None,
        }
    }
}

// === impl ResolvedConfig ===

impl ResolvedConfig {
    pub fn get(&self, name: &str) -> Option<&Resolved> {
        self.values.get(name).map(|(_, r)| r)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.get(name).map(|r| &r.value)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.value(name).and_then(Value::as_bool)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.value(name).and_then(Value::as_int)
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        self.value(name).and_then(Value::as_str)
    }

    pub fn duration(&self, name: &str) -> Option<&Timeout> {
        self.value(name).and_then(Value::as_duration)
    }

    pub fn list(&self, name: &str) -> Option<&[String]> {
        self.value(name).and_then(Value::as_list)
    }

    /// Iterates over the values that apply at `scope`, ordered by annotation name.
    pub fn in_scope(&self, scope: Scope) -> impl Iterator<Item = (&'static str, &Value)> + '_ {
        self.values
            .iter()
            .filter(move |(_, (s, _))| *s == scope)
            .map(|(name, (_, r))| (*name, &r.value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// === impl GlobalDefaults ===

impl GlobalDefaults {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
