use super::{Kind, Timeout, Validator, Value};
use url::Url;

/// Describes why a raw annotation value could not be decoded.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AnnotationError {
    /// The annotation is not set. Callers decide whether a default applies.
    #[error("annotation is not set")]
    Missing,

    /// The annotation is set to whitespace only. This is never treated as "use the default".
    #[error("annotation value is empty")]
    Empty,

    #[error("{0}")]
    Parse(String),

    #[error("{0}")]
    Validation(String),
}

/// Describes why a URL annotation is unusable.
///
/// These messages are shown to users verbatim and must stay stable.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum UrlError {
    #[error("url scheme is empty")]
    EmptyScheme,

    #[error("url host is empty")]
    EmptyHost,

    #[error("invalid url host")]
    InvalidHost,

    #[error("{url} is not a valid URL: {reason}")]
    Invalid { url: String, reason: String },
}

/// Decodes a raw annotation value as `kind`, then applies `validator`.
///
/// `None` means the annotation is absent.
pub fn decode(
    raw: Option<&str>,
    kind: Kind,
    validator: Option<Validator>,
) -> Result<Value, AnnotationError> {
    let raw = raw.ok_or(AnnotationError::Missing)?;
    if raw.trim().is_empty() {
        return Err(AnnotationError::Empty);
    }

    let value = parse(raw, kind)?;
    if let Some(validate) = validator {
        validate(&value).map_err(AnnotationError::Validation)?;
    }
    Ok(value)
}

fn parse(raw: &str, kind: Kind) -> Result<Value, AnnotationError> {
    match kind {
        // Deliberately strict: "True", "1", and " true" are all rejected.
        Kind::Bool => match raw {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(AnnotationError::Parse(format!(
                "{raw:?} is not a boolean (expected \"true\" or \"false\")"
            ))),
        },

        Kind::Int => {
            let raw = raw.trim();
            raw.parse::<i64>().map(Value::Int).map_err(|error| {
                AnnotationError::Parse(format!("{raw:?} is not an integer: {error}"))
            })
        }

        Kind::Float => {
            let raw = raw.trim();
            match raw.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(Value::Float(v)),
                Ok(_) => Err(AnnotationError::Parse(format!(
                    "{raw:?} is not a finite number"
                ))),
                Err(error) => Err(AnnotationError::Parse(format!(
                    "{raw:?} is not a number: {error}"
                ))),
            }
        }

        Kind::Duration => raw
            .parse::<Timeout>()
            .map(Value::Duration)
            .map_err(|error| AnnotationError::Parse(error.to_string())),

        // Interior whitespace, including newlines in proxy snippets, is significant.
        Kind::String => Ok(Value::String(raw.trim().to_string())),

        Kind::Url => parse_url(raw.trim())
            .map(Value::Url)
            .map_err(|error| AnnotationError::Parse(error.to_string())),

        Kind::StringList => {
            let items = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>();
            if items.is_empty() {
                return Err(AnnotationError::Empty);
            }
            Ok(Value::StringList(items))
        }
    }
}

/// Parses an absolute URL with a scheme and a well-formed host.
pub fn parse_url(raw: &str) -> Result<Url, UrlError> {
    if raw.starts_with(':') {
        return Err(UrlError::Invalid {
            url: raw.to_string(),
            reason: "missing protocol scheme".to_string(),
        });
    }

    match Url::parse(raw) {
        Ok(url) => match url.host_str() {
            None | Some("") => Err(UrlError::EmptyHost),
            Some(host) if host.contains("..") => Err(UrlError::InvalidHost),
            Some(_) => Ok(url),
        },
        Err(url::ParseError::RelativeUrlWithoutBase) => Err(UrlError::EmptyScheme),
        Err(url::ParseError::EmptyHost) => Err(UrlError::EmptyHost),
        Err(url::ParseError::IdnaError | url::ParseError::InvalidDomainCharacter) => {
            Err(UrlError::InvalidHost)
        }
        Err(error) => Err(UrlError::Invalid {
            url: raw.to_string(),
            reason: error.to_string(),
        }),
    }
}
