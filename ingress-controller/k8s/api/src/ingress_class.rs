use crate::Ingress;
use kube::ResourceExt;

/// Selects the Ingress resources this controller is responsible for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngressClass {
    name: String,
    watch_without_class: bool,
}

// === impl IngressClass ===

impl IngressClass {
    /// The legacy annotation that predates `spec.ingressClassName`.
    pub const ANNOTATION: &'static str = "kubernetes.io/ingress.class";

    pub fn new(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            watch_without_class: false,
        }
    }

    /// Also claims Ingresses that name no class at all.
    pub fn watch_without_class(mut self, enabled: bool) -> Self {
        self.watch_without_class = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if the Ingress selects this class.
    ///
    /// `spec.ingressClassName` takes precedence over the legacy annotation.
    pub fn matches(&self, ingress: &Ingress) -> bool {
        let spec_class = ingress
            .spec
            .as_ref()
            .and_then(|spec| spec.ingress_class_name.as_deref());
        if let Some(class) = spec_class {
            return class == self.name;
        }

        match ingress.annotations().get(Self::ANNOTATION) {
            Some(class) => class == &self.name,
            None => {
                tracing::trace!(
                    name = %ingress.name_any(),
                    watch_without_class = self.watch_without_class,
                    "Ingress has no class"
                );
                self.watch_without_class
            }
        }
    }
}
