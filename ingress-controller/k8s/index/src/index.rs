use crate::builder::Resources;
use ahash::AHashMap as HashMap;
use ingress_controller_core::{
    annotations::{GlobalDefaults, Registry},
    ResourceId,
};
use ingress_controller_k8s_api::{
    ConfigMap, EndpointSlice, Ingress, IngressClass, Secret, Service, TLS_SECRET_TYPE,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

pub type SharedIndex = Arc<RwLock<Index>>;

/// Holds the cluster resources that feed the configuration.
///
/// Updated by the watch tasks; every change that can affect the built configuration bumps the
/// generation published on the index's watch.
#[derive(Debug)]
pub struct Index {
    class: IngressClass,
    registry: Arc<Registry>,
    settings: Option<ResourceId>,

    pub(crate) ingresses: HashMap<ResourceId, Ingress>,
    pub(crate) services: HashMap<ResourceId, Service>,
    pub(crate) endpoint_slices: HashMap<ResourceId, EndpointSlice>,
    pub(crate) secrets: HashMap<ResourceId, Secret>,
    defaults: Arc<GlobalDefaults>,

    changes: watch::Sender<u64>,
}

/// A consistent view of the index.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub resources: Resources,
    pub defaults: Arc<GlobalDefaults>,
}

// === impl Index ===

impl Index {
    /// Creates an index along with a receiver that observes its generation.
    ///
    /// `settings` names the ConfigMap holding operator-wide annotation defaults.
    pub fn shared(
        class: IngressClass,
        registry: Arc<Registry>,
        settings: Option<ResourceId>,
    ) -> (SharedIndex, watch::Receiver<u64>) {
        let (changes, rx) = watch::channel(0);
        let index = Self {
            class,
            registry,
            settings,
            ingresses: HashMap::default(),
            services: HashMap::default(),
            endpoint_slices: HashMap::default(),
            secrets: HashMap::default(),
            defaults: Arc::default(),
            changes,
        };
        (Arc::new(RwLock::new(index)), rx)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Clones the indexed resources in a deterministic order.
    pub fn snapshot(&self) -> Snapshot {
        let mut ingresses = self.ingresses.iter().collect::<Vec<_>>();
        ingresses.sort_by(|(a, _), (b, _)| a.cmp(b));
        let ingresses = ingresses
            .into_iter()
            .map(|(_, i)| i.clone())
            .collect::<Vec<_>>();

        let mut secrets = self.secrets.iter().collect::<Vec<_>>();
        secrets.sort_by(|(a, _), (b, _)| a.cmp(b));
        let secrets = secrets
            .into_iter()
            .map(|(_, s)| s.clone())
            .collect::<Vec<_>>();

        Snapshot {
            resources: Resources {
                ingresses,
                services: self.services.values().cloned().collect(),
                endpoint_slices: self.endpoint_slices.values().cloned().collect(),
                secrets,
            },
            defaults: self.defaults.clone(),
        }
    }

    fn notify(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }

    fn apply_settings(&mut self, cm: ConfigMap) {
        let data = cm.data.unwrap_or_default();
        let (defaults, errors) = self.registry.global_defaults(&data);
        for error in errors {
            tracing::warn!(%error, "Ignoring invalid global default");
        }
        tracing::info!(defaults = defaults.len(), "Updated global defaults");
        self.defaults = Arc::new(defaults);
        self.notify();
    }
}

/// Ingresses of another class are treated as deleted.
impl kubert::index::IndexNamespacedResource<Ingress> for Index {
    fn apply(&mut self, ingress: Ingress) {
        let Some(id) = ResourceId::from_meta(&ingress.metadata) else {
            return;
        };
        if self.class.matches(&ingress) {
            tracing::debug!(namespace = %id.namespace, name = %id.name, "Indexing Ingress");
            self.ingresses.insert(id, ingress);
            self.notify();
        } else if self.ingresses.remove(&id).is_some() {
            tracing::debug!(namespace = %id.namespace, name = %id.name, "Ingress changed class");
            self.notify();
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self
            .ingresses
            .remove(&ResourceId::new(namespace, name))
            .is_some()
        {
            self.notify();
        }
    }
}

impl kubert::index::IndexNamespacedResource<Service> for Index {
    fn apply(&mut self, service: Service) {
        if let Some(id) = ResourceId::from_meta(&service.metadata) {
            self.services.insert(id, service);
            self.notify();
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self
            .services
            .remove(&ResourceId::new(namespace, name))
            .is_some()
        {
            self.notify();
        }
    }
}

impl kubert::index::IndexNamespacedResource<EndpointSlice> for Index {
    fn apply(&mut self, slice: EndpointSlice) {
        if let Some(id) = ResourceId::from_meta(&slice.metadata) {
            self.endpoint_slices.insert(id, slice);
            self.notify();
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self
            .endpoint_slices
            .remove(&ResourceId::new(namespace, name))
            .is_some()
        {
            self.notify();
        }
    }
}

/// Only TLS secrets are retained.
impl kubert::index::IndexNamespacedResource<Secret> for Index {
    fn apply(&mut self, secret: Secret) {
        let Some(id) = ResourceId::from_meta(&secret.metadata) else {
            return;
        };
        if secret.type_.as_deref() == Some(TLS_SECRET_TYPE) {
            self.secrets.insert(id, secret);
            self.notify();
        } else if self.secrets.remove(&id).is_some() {
            self.notify();
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self
            .secrets
            .remove(&ResourceId::new(namespace, name))
            .is_some()
        {
            self.notify();
        }
    }
}

/// Only the configured settings ConfigMap is observed.
impl kubert::index::IndexNamespacedResource<ConfigMap> for Index {
    fn apply(&mut self, cm: ConfigMap) {
        if self.settings.is_some() && ResourceId::from_meta(&cm.metadata) == self.settings {
            self.apply_settings(cm);
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self.settings.as_ref() == Some(&ResourceId::new(namespace, name)) {
            tracing::info!("Settings ConfigMap deleted; clearing global defaults");
            self.defaults = Arc::default();
            self.notify();
        }
    }
}
