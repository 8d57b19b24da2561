use super::*;
use crate::{Audit, AuditRecord, ResourceId};
use ingress_controller_k8s_api::ObjectMeta;
use maplit::{btreemap, convert_args};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::{collections::BTreeMap, sync::Arc, time::Duration};

#[derive(Default)]
struct Recorder(Mutex<Vec<AuditRecord>>);

impl Audit for Recorder {
    fn record(&self, record: AuditRecord) {
        self.0.lock().push(record);
    }
}

const PREFIX: &str = "ingress.test";

const SPECS: &[AnnotationSpec] = &[
    AnnotationSpec::new("enabled", Kind::Bool, Scope::Location).default_value("false"),
    AnnotationSpec::new("weight", Kind::Float, Scope::Backend).default_value("1.0"),
    AnnotationSpec::new("retries", Kind::Int, Scope::Location)
        .default_value("3")
        .validate(positive),
    AnnotationSpec::new("timeout", Kind::Duration, Scope::Location).default_value("10"),
    AnnotationSpec::new("snippet", Kind::String, Scope::Location).critical(),
    AnnotationSpec::new("auth", Kind::Url, Scope::Location).critical(),
    AnnotationSpec::new("aliases", Kind::StringList, Scope::Ingress),
];

fn positive(v: &Value) -> Result<(), String> {
    match v.as_int() {
        Some(i) if i > 0 => Ok(()),
        _ => Err("must be positive".to_string()),
    }
}

fn registry() -> (Registry, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let registry = Registry::new(PREFIX, SPECS.iter().copied())
        .expect("registry must be valid")
        .with_audit(recorder.clone());
    (registry, recorder)
}

fn meta(annotations: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        namespace: Some("ns-0".to_string()),
        name: Some("ing-0".to_string()),
        annotations: Some(
            annotations
                .into_iter()
                .map(|(k, v)| (format!("{PREFIX}/{k}"), v))
                .collect(),
        ),
        ..Default::default()
    }
}

fn resolve(
    registry: &Registry,
    name: &str,
    meta: &ObjectMeta,
) -> Result<Option<Resolved>, ResolveError> {
    let spec = *registry.get(name).expect("spec must be registered");
    registry.resolve(&spec, meta, &GlobalDefaults::default())
}

#[test]
fn booleans_are_case_sensitive() {
    assert_eq!(decode(Some("true"), Kind::Bool, None), Ok(Value::Bool(true)));
    assert_eq!(decode(Some("false"), Kind::Bool, None), Ok(Value::Bool(false)));
    assert!(matches!(
        decode(Some("True"), Kind::Bool, None),
        Err(AnnotationError::Parse(_))
    ));
    assert!(matches!(
        decode(Some("1"), Kind::Bool, None),
        Err(AnnotationError::Parse(_))
    ));
}

#[test]
fn numbers_are_trimmed() {
    assert_eq!(decode(Some(" 42 "), Kind::Int, None), Ok(Value::Int(42)));
    assert_eq!(decode(Some("\t0.5\n"), Kind::Float, None), Ok(Value::Float(0.5)));
    assert!(matches!(
        decode(Some("4.2"), Kind::Int, None),
        Err(AnnotationError::Parse(_))
    ));
    assert!(matches!(
        decode(Some("NaN"), Kind::Float, None),
        Err(AnnotationError::Parse(_))
    ));
}

#[test]
fn strings_keep_interior_whitespace() {
    let snippet = "  more_set_headers \"a: b\";\n  more_set_headers \"c: d\";\n";
    assert_eq!(
        decode(Some(snippet), Kind::String, None),
        Ok(Value::String(
            "more_set_headers \"a: b\";\n  more_set_headers \"c: d\";".to_string()
        ))
    );
    assert_eq!(decode(Some(" "), Kind::String, None), Err(AnnotationError::Empty));
    assert_eq!(decode(Some(" \n\t"), Kind::String, None), Err(AnnotationError::Empty));
    assert_eq!(decode(None, Kind::String, None), Err(AnnotationError::Missing));
}

#[test]
fn string_lists() {
    assert_eq!(
        decode(Some("a.example.com, b.example.com,,"), Kind::StringList, None),
        Ok(Value::StringList(vec![
            "a.example.com".to_string(),
            "b.example.com".to_string()
        ]))
    );
    assert_eq!(decode(Some(" , "), Kind::StringList, None), Err(AnnotationError::Empty));
}

#[test]
fn urls() {
    assert_eq!(parse_url("").unwrap_err().to_string(), "url scheme is empty");
    assert_eq!(parse_url("bar").unwrap_err().to_string(), "url scheme is empty");
    assert_eq!(parse_url("http://").unwrap_err().to_string(), "url host is empty");
    assert_eq!(
        parse_url("http://foo..bar.com").unwrap_err().to_string(),
        "invalid url host"
    );

    let url = parse_url("http://bar.foo.com/external-auth").expect("url must parse");
    assert_eq!(url.as_str(), "http://bar.foo.com/external-auth");

    assert_eq!(
        decode(Some(" http://bar.foo.com/external-auth "), Kind::Url, None),
        Ok(Value::Url(url))
    );
    assert_eq!(
        decode(Some("bar"), Kind::Url, None),
        Err(AnnotationError::Parse("url scheme is empty".to_string()))
    );
}

#[test]
fn reencoding_is_stable() {
    let cases: &[(Kind, &str)] = &[
        (Kind::Bool, "true"),
        (Kind::Int, " -7"),
        (Kind::Float, "2.5"),
        (Kind::Duration, "1m30s"),
        (Kind::String, " a\nb "),
        (Kind::Url, "https://auth.example.com/check?x=1"),
        (Kind::StringList, "a, b ,c"),
    ];
    for (kind, raw) in cases {
        let value = decode(Some(*raw), *kind, None).unwrap_or_else(|e| panic!("{raw:?}: {e}"));
        let text = value.to_string();
        assert_eq!(decode(Some(text.as_str()), *kind, None), Ok(value), "{raw:?}");
    }

    // Bare seconds are the one normalization.
    let value = decode(Some("10"), Kind::Duration, None).expect("duration must parse");
    assert_eq!(value.to_string(), "10s");
    assert_eq!(
        value.as_duration().map(Timeout::duration),
        Some(Duration::from_secs(10))
    );
}

#[test]
fn resolve_prefers_the_resource() {
    let (registry, _) = registry();
    let meta = meta(convert_args!(btreemap!("retries" => "5")));
    let resolved = resolve(&registry, "retries", &meta).unwrap();
    assert_eq!(
        resolved,
        Some(Resolved {
            value: Value::Int(5),
            source: Source::Resource,
        })
    );
}

#[test]
fn resolve_never_masks_an_invalid_value() {
    let (registry, _) = registry();

    let meta = meta(convert_args!(btreemap!(
        "retries" => "0",
        "enabled" => "yes",
        "snippet" => "   ",
    )));

    let err = resolve(&registry, "retries", &meta).unwrap_err();
    assert_eq!(
        err.annotation_error(),
        Some(&AnnotationError::Validation("must be positive".to_string()))
    );
    assert!(matches!(
        resolve(&registry, "enabled", &meta).unwrap_err().annotation_error(),
        Some(AnnotationError::Parse(_))
    ));
    assert_eq!(
        resolve(&registry, "snippet", &meta).unwrap_err(),
        ResolveError::Annotation {
            key: format!("{PREFIX}/snippet"),
            error: AnnotationError::Empty,
        }
    );
}

#[test]
fn default_chain() {
    let (registry, _) = registry();
    let (defaults, errors) = registry.global_defaults(&convert_args!(btreemap!(
        "timeout" => "30s",
        "retries" => "-1",
        "unrelated-setting" => "x",
    )));
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert_eq!(defaults.len(), 1);

    let meta = meta(BTreeMap::new());
    let spec = *registry.get("timeout").unwrap();
    let timeout = registry.resolve(&spec, &meta, &defaults).unwrap().unwrap();
    assert_eq!(timeout.source, Source::GlobalDefault);
    assert_eq!(timeout.value.to_string(), "30s");

    let spec = *registry.get("retries").unwrap();
    let retries = registry.resolve(&spec, &meta, &defaults).unwrap().unwrap();
    assert_eq!(retries.source, Source::Default);
    assert_eq!(retries.value, Value::Int(3));

    // No default anywhere: unset.
    let spec = *registry.get("aliases").unwrap();
    assert_eq!(registry.resolve(&spec, &meta, &defaults), Ok(None));
}

#[test]
fn invalid_arguments() {
    let (registry, _) = registry();
    let defaults = GlobalDefaults::default();
    let meta = meta(BTreeMap::new());

    let unnamed = AnnotationSpec::new("", Kind::Bool, Scope::Location);
    assert_eq!(
        registry.resolve(&unnamed, &meta, &defaults),
        Err(ResolveError::InvalidArgument("annotation name is empty"))
    );

    let spec = *registry.get("enabled").unwrap();
    assert_eq!(
        registry.resolve(&spec, &ObjectMeta::default(), &defaults),
        Err(ResolveError::InvalidArgument("resource has no name"))
    );

    let unknown = AnnotationSpec::new("unknown", Kind::Bool, Scope::Location);
    assert_eq!(
        registry.resolve(&unknown, &meta, &defaults),
        Err(ResolveError::InvalidArgument("annotation is not registered"))
    );
}

#[test]
fn critical_annotations_are_audited() {
    let (registry, recorder) = registry();
    let meta = meta(convert_args!(btreemap!(
        "snippet" => "deny all;",
        "enabled" => "true",
    )));

    let config = registry
        .resolve_all(&meta, &GlobalDefaults::default())
        .unwrap();
    assert_eq!(config.bool("enabled"), Some(true));
    assert_eq!(config.string("snippet"), Some("deny all;"));
    assert_eq!(config.get("auth"), None);

    assert_eq!(
        *recorder.0.lock(),
        vec![AuditRecord {
            resource: ResourceId::new("ns-0", "ing-0"),
            annotation: "snippet",
            value: "deny all;".to_string(),
            source: Source::Resource,
        }]
    );
}

#[test]
fn critical_annotations_can_be_forbidden() {
    let (registry, recorder) = registry();
    let registry = registry.allow_critical(false);
    let meta = meta(convert_args!(btreemap!(
        "snippet" => "deny all;",
        "retries" => "zero",
    )));

    let errors = registry
        .resolve_all(&meta, &GlobalDefaults::default())
        .unwrap_err();
    assert_eq!(errors.len(), 2, "{errors:?}");
    assert!(errors.contains(&ResolveError::Forbidden {
        key: format!("{PREFIX}/snippet"),
    }));
    assert!(recorder.0.lock().is_empty());
}

#[test]
fn resolve_all_scopes() {
    let (registry, _) = registry();
    let meta = meta(convert_args!(btreemap!("aliases" => "a.example.com")));
    let config = registry
        .resolve_all(&meta, &GlobalDefaults::default())
        .unwrap();

    let backend = config.in_scope(Scope::Backend).collect::<Vec<_>>();
    assert_eq!(backend, vec![("weight", &Value::Float(1.0))]);
    let ingress = config.in_scope(Scope::Ingress).map(|(n, _)| n).collect::<Vec<_>>();
    assert_eq!(ingress, vec!["aliases"]);
    assert_eq!(config.len(), 5);
}

#[test]
fn registry_construction() {
    let dup = [
        AnnotationSpec::new("a", Kind::Bool, Scope::Location),
        AnnotationSpec::new("a", Kind::Int, Scope::Location),
    ];
    assert!(matches!(
        Registry::new(PREFIX, dup),
        Err(RegistryError::Duplicate("a"))
    ));

    let bad_default =
        [AnnotationSpec::new("a", Kind::Bool, Scope::Location).default_value("TRUE")];
    assert!(matches!(
        Registry::new(PREFIX, bad_default),
        Err(RegistryError::InvalidDefault { name: "a", .. })
    ));

    assert!(matches!(
        Registry::new("", SPECS.iter().copied()),
        Err(RegistryError::EmptyPrefix)
    ));
}
