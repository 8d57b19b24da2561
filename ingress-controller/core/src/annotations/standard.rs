//! The annotations understood by the controller.

use super::{AnnotationSpec, Kind, Scope, Value};
use ipnet::IpNet;
use std::net::IpAddr;

pub const LOAD_BALANCE: &str = "load-balance";
pub const UPSTREAM_HASH_BY: &str = "upstream-hash-by";
pub const UPSTREAM_MAX_FAILS: &str = "upstream-max-fails";
pub const UPSTREAM_FAIL_TIMEOUT: &str = "upstream-fail-timeout";
pub const SERVICE_UPSTREAM: &str = "service-upstream";
pub const BACKEND_PROTOCOL: &str = "backend-protocol";

pub const SERVER_ALIAS: &str = "server-alias";

pub const PROXY_CONNECT_TIMEOUT: &str = "proxy-connect-timeout";
pub const PROXY_READ_TIMEOUT: &str = "proxy-read-timeout";
pub const PROXY_SEND_TIMEOUT: &str = "proxy-send-timeout";
pub const PROXY_BODY_SIZE: &str = "proxy-body-size";
pub const SSL_REDIRECT: &str = "ssl-redirect";
pub const FORCE_SSL_REDIRECT: &str = "force-ssl-redirect";
pub const REWRITE_TARGET: &str = "rewrite-target";
pub const ENABLE_CORS: &str = "enable-cors";
pub const CORS_ALLOW_ORIGIN: &str = "cors-allow-origin";
pub const LIMIT_RPS: &str = "limit-rps";
pub const LIMIT_CONNECTIONS: &str = "limit-connections";
pub const AUTH_URL: &str = "auth-url";
pub const CONFIGURATION_SNIPPET: &str = "configuration-snippet";
pub const ALLOWLIST_SOURCE_RANGE: &str = "allowlist-source-range";

pub const LOAD_BALANCE_ALGORITHMS: [&str; 2] = ["round_robin", "ewma"];
pub const BACKEND_PROTOCOLS: [&str; 6] = ["HTTP", "HTTPS", "GRPC", "GRPCS", "AUTO_HTTP", "FCGI"];

pub static SPECS: &[AnnotationSpec] = &[
    // Backend
    AnnotationSpec::new(LOAD_BALANCE, Kind::String, Scope::Backend)
        .default_value("round_robin")
        .validate(load_balance_algorithm),
    AnnotationSpec::new(UPSTREAM_HASH_BY, Kind::String, Scope::Backend),
    AnnotationSpec::new(UPSTREAM_MAX_FAILS, Kind::Int, Scope::Backend)
        .default_value("0")
        .validate(non_negative),
    AnnotationSpec::new(UPSTREAM_FAIL_TIMEOUT, Kind::Duration, Scope::Backend).default_value("10s"),
    AnnotationSpec::new(SERVICE_UPSTREAM, Kind::Bool, Scope::Backend).default_value("false"),
    AnnotationSpec::new(BACKEND_PROTOCOL, Kind::String, Scope::Backend)
        .default_value("HTTP")
        .validate(backend_protocol),
    // Ingress
    AnnotationSpec::new(SERVER_ALIAS, Kind::StringList, Scope::Ingress),
    // Location
    AnnotationSpec::new(PROXY_CONNECT_TIMEOUT, Kind::Duration, Scope::Location).default_value("5s"),
    AnnotationSpec::new(PROXY_READ_TIMEOUT, Kind::Duration, Scope::Location).default_value("60s"),
    AnnotationSpec::new(PROXY_SEND_TIMEOUT, Kind::Duration, Scope::Location).default_value("60s"),
    AnnotationSpec::new(PROXY_BODY_SIZE, Kind::String, Scope::Location)
        .default_value("1m")
        .validate(size),
    AnnotationSpec::new(SSL_REDIRECT, Kind::Bool, Scope::Location).default_value("true"),
    AnnotationSpec::new(FORCE_SSL_REDIRECT, Kind::Bool, Scope::Location).default_value("false"),
    AnnotationSpec::new(REWRITE_TARGET, Kind::String, Scope::Location),
    AnnotationSpec::new(ENABLE_CORS, Kind::Bool, Scope::Location).default_value("false"),
    AnnotationSpec::new(CORS_ALLOW_ORIGIN, Kind::StringList, Scope::Location).default_value("*"),
    AnnotationSpec::new(LIMIT_RPS, Kind::Int, Scope::Location)
        .default_value("0")
        .validate(non_negative),
    AnnotationSpec::new(LIMIT_CONNECTIONS, Kind::Int, Scope::Location)
        .default_value("0")
        .validate(non_negative),
    AnnotationSpec::new(AUTH_URL, Kind::Url, Scope::Location).critical(),
    AnnotationSpec::new(CONFIGURATION_SNIPPET, Kind::String, Scope::Location).critical(),
    AnnotationSpec::new(ALLOWLIST_SOURCE_RANGE, Kind::StringList, Scope::Location)
        .critical()
        .validate(source_ranges),
];

fn load_balance_algorithm(v: &Value) -> Result<(), String> {
    one_of(v, &LOAD_BALANCE_ALGORITHMS)
}

fn backend_protocol(v: &Value) -> Result<(), String> {
    one_of(v, &BACKEND_PROTOCOLS)
}

fn one_of(v: &Value, allowed: &[&str]) -> Result<(), String> {
    match v.as_str() {
        Some(s) if allowed.contains(&s) => Ok(()),
        _ => Err(format!("{v} is not one of: {}", allowed.join(", "))),
    }
}

fn non_negative(v: &Value) -> Result<(), String> {
    match v.as_int() {
        Some(i) if i >= 0 => Ok(()),
        _ => Err(format!("{v} must not be negative")),
    }
}

/// Accepts an nginx size: a number with an optional `k`, `m`, or `g` suffix.
fn size(v: &Value) -> Result<(), String> {
    let s = v.as_str().unwrap_or_default();
    let digits = s.trim_end_matches(['k', 'K', 'm', 'M', 'g', 'G']);
    let suffix_len = s.len() - digits.len();
    if !digits.is_empty() && suffix_len <= 1 && digits.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(format!("{s:?} is not a valid size"))
    }
}

/// Every entry must be a CIDR or a single IP address.
fn source_ranges(v: &Value) -> Result<(), String> {
    for range in v.as_list().unwrap_or_default() {
        if range.parse::<IpNet>().is_err() && range.parse::<IpAddr>().is_err() {
            return Err(format!("{range:?} is not a valid CIDR"));
        }
    }
    Ok(())
}
