//! Typed configuration carried in Ingress annotations.
//!
//! Every annotation the controller understands is described by an [`AnnotationSpec`]: its name
//! (without the controller prefix), the primitive [`Kind`] its value must parse as, an optional
//! default, a [`Risk`] classification, and the [`Scope`] the resolved value applies to. The
//! [`codec`] turns a raw string into a [`Value`]; the [`Registry`] looks annotations up on a
//! resource and applies the default chain (resource, then operator-wide default, then the
//! spec's own default).

mod codec;
mod registry;
pub mod standard;
mod timeout;

#[cfg(test)]
mod tests;

pub use self::{
    codec::{decode, parse_url, AnnotationError, UrlError},
    registry::{
        GlobalDefaults, Registry, RegistryError, ResolveError, Resolved, ResolvedConfig, Source,
    },
    timeout::{Timeout, TimeoutError},
};
pub use url::Url;

use serde::Serialize;
use std::fmt;

/// The prefix ingress annotations are namespaced under unless configured otherwise.
pub const DEFAULT_PREFIX: &str = "nginx.ingress.kubernetes.io";

/// A predicate applied to a successfully parsed value.
///
/// The error message is surfaced to users as-is.
pub type Validator = fn(&Value) -> Result<(), String>;

/// The primitive type an annotation value must parse as.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Bool,
    Int,
    Float,
    Duration,
    String,
    Url,
    StringList,
}

/// Indicates whether resolving an annotation can alter a trust boundary.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Risk {
    #[default]
    Normal,

    /// Critical annotations (auth bypasses, raw proxy snippets, source allowlists) are audited
    /// whenever they resolve to anything but their built-in default, and may be disabled
    /// entirely by the operator.
    Critical,
}

/// Where a resolved annotation value takes effect.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Applies to every server (virtual host) the Ingress contributes to.
    Ingress,

    /// Applies to each location (path rule) of the Ingress.
    Location,

    /// Applies to the upstream backends the Ingress references.
    Backend,
}

/// A static description of one annotation.
#[derive(Copy, Clone)]
pub struct AnnotationSpec {
    pub name: &'static str,
    pub kind: Kind,
    pub default: Option<&'static str>,
    pub risk: Risk,
    pub scope: Scope,
    pub validator: Option<Validator>,
}

/// A decoded annotation value.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    /// Always finite.
    Float(f64),
    Duration(Timeout),
    String(String),
    Url(Url),
    StringList(Vec<String>),
}

// === impl AnnotationSpec ===

impl AnnotationSpec {
    pub const fn new(name: &'static str, kind: Kind, scope: Scope) -> Self {
        Self {
            name,
            kind,
            default: None,
            risk: Risk::Normal,
            scope,
            validator: None,
        }
    }

    pub const fn default_value(mut self, default: &'static str) -> Self {
        self.default = Some(default);
        self
    }

    pub const fn critical(mut self) -> Self {
        self.risk = Risk::Critical;
        self
    }

    pub const fn validate(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn is_critical(&self) -> bool {
        self.risk == Risk::Critical
    }
}

impl fmt::Debug for AnnotationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnnotationSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("default", &self.default)
            .field("risk", &self.risk)
            .field("scope", &self.scope)
            .field("validated", &self.validator.is_some())
            .finish()
    }
}

// === impl Value ===

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Self::Bool(_) => Kind::Bool,
            Self::Int(_) => Kind::Int,
            Self::Float(_) => Kind::Float,
            Self::Duration(_) => Kind::Duration,
            Self::String(_) => Kind::String,
            Self::Url(_) => Kind::Url,
            Self::StringList(_) => Kind::StringList,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_duration(&self) -> Option<&Timeout> {
        match self {
            Self::Duration(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_url(&self) -> Option<&Url> {
        match self {
            Self::Url(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::StringList(l) => Some(l),
            _ => None,
        }
    }
}

/// Re-encodes the value in the annotation grammar it was decoded from.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => b.fmt(f),
            Self::Int(i) => i.fmt(f),
            Self::Float(v) => v.fmt(f),
            Self::Duration(t) => t.fmt(f),
            Self::String(s) => s.fmt(f),
            Self::Url(u) => u.as_str().fmt(f),
            Self::StringList(l) => l.join(",").fmt(f),
        }
    }
}
