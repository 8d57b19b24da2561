use ahash::AHashMap as HashMap;
use ingress_controller_core::ResourceId;
use ingress_controller_k8s_api::{Ingress, ResourceExt, Secret, TLS_SECRET_TYPE};
use sha2::{Digest, Sha256};

/// A reference to a TLS secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateRef {
    pub secret: ResourceId,
    /// Hex SHA-256 of `tls.crt` followed by `tls.key`.
    pub checksum: String,
}

/// Host-keyed certificates built from Ingress `tls` sections and the TLS secrets they name.
///
/// Only Ingresses that contribute to a configuration may be given; an excluded Ingress must not
/// claim hosts.
#[derive(Clone, Debug, Default)]
pub struct TlsSecrets {
    by_host: HashMap<String, CertificateRef>,
}

// === impl TlsSecrets ===

impl TlsSecrets {
    /// Links each host listed in an Ingress `tls` section to its secret.
    ///
    /// Ingresses must be given in traversal order; a later Ingress claiming the same host
    /// replaces an earlier one. Secrets that are missing, of the wrong type, or lack key material
    /// are skipped.
    pub fn new<'a>(
        ingresses: impl IntoIterator<Item = &'a Ingress>,
        secrets: impl IntoIterator<Item = &'a Secret>,
    ) -> Self {
        let secrets = secrets
            .into_iter()
            .filter_map(|s| {
                let id = ResourceId::from_meta(&s.metadata)?;
                Some((id, s))
            })
            .collect::<HashMap<_, _>>();

        let mut by_host = HashMap::new();
        for ingress in ingresses {
            let namespace = ingress.namespace().unwrap_or_default();
            let tls = ingress
                .spec
                .as_ref()
                .and_then(|spec| spec.tls.as_deref())
                .unwrap_or_default();
            for entry in tls {
                let Some(secret_name) = entry.secret_name.as_deref() else {
                    continue;
                };
                let id = ResourceId::new(&namespace, secret_name);
                let Some(secret) = secrets.get(&id) else {
                    tracing::debug!(secret = %id, "TLS secret not found");
                    continue;
                };
                let Some(checksum) = checksum(secret) else {
                    tracing::warn!(secret = %id, "Secret is not a usable TLS secret");
                    continue;
                };
                for host in entry.hosts.iter().flatten() {
                    by_host.insert(
                        host.clone(),
                        CertificateRef {
                            secret: id.clone(),
                            checksum: checksum.clone(),
                        },
                    );
                }
            }
        }

        Self { by_host }
    }

    pub fn len(&self) -> usize {
        self.by_host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_host.is_empty()
    }

    /// Finds the key material that serves a host.
    ///
    /// Prefers an exact host match, then a wildcard covering exactly one leading label.
    pub fn lookup(&self, host: &str) -> Option<CertificateRef> {
        if let Some(cert) = self.by_host.get(host) {
            return Some(cert.clone());
        }
        let (_, parent) = host.split_once('.')?;
        self.by_host.get(&format!("*.{parent}")).cloned()
    }
}

fn checksum(secret: &Secret) -> Option<String> {
    if secret.type_.as_deref() != Some(TLS_SECRET_TYPE) {
        return None;
    }
    let data = secret.data.as_ref()?;
    let crt = data.get("tls.crt")?;
    let key = data.get("tls.key")?;
    let mut digest = Sha256::new();
    digest.update(&crt.0);
    digest.update(&key.0);
    Some(hex::encode(digest.finalize()))
}
