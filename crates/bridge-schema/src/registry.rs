use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::descriptor::{MethodDescriptor, ServiceDef};
use crate::error::SchemaError;
use crate::{idl, json};

/// Which parser a schema document is read with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaKind {
    InterfaceDefinition,
    StructuredDescription,
}

impl SchemaKind {
    /// `.json` (any case) selects the structured description parser,
    /// everything else is interface definition text.
    pub fn from_filename(filename: &str) -> Self {
        let is_json = filename
            .rsplit_once('.')
            .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::StructuredDescription
        } else {
            Self::InterfaceDefinition
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InterfaceDefinition => "idl",
            Self::StructuredDescription => "json",
        }
    }
}

/// Immutable method table built from one client-supplied schema.
#[derive(Clone, Debug)]
pub struct Registry {
    kind: SchemaKind,
    services: BTreeMap<String, BTreeMap<String, Arc<MethodDescriptor>>>,
    method_count: usize,
}

impl Registry {
    pub fn load(text: &str, kind: SchemaKind) -> Result<Self, SchemaError> {
        let services = match kind {
            SchemaKind::InterfaceDefinition => idl::parse(text)?,
            SchemaKind::StructuredDescription => json::parse(text)?,
        };
        let registry = Self::build(kind, services)?;
        debug!(
            kind = kind.as_str(),
            services = registry.services.len(),
            methods = registry.method_count,
            "schema loaded"
        );
        Ok(registry)
    }

    fn build(kind: SchemaKind, defs: Vec<ServiceDef>) -> Result<Self, SchemaError> {
        if defs.is_empty() {
            return Err(SchemaError::NoServices);
        }

        let mut services: BTreeMap<String, BTreeMap<String, Arc<MethodDescriptor>>> =
            BTreeMap::new();
        let mut method_count = 0;
        for def in defs {
            let table = services.entry(def.name).or_default();
            for descriptor in def.methods {
                if table.contains_key(&descriptor.method) {
                    return Err(SchemaError::DuplicateMethod {
                        service: descriptor.service,
                        method: descriptor.method,
                    });
                }
                table.insert(descriptor.method.clone(), Arc::new(descriptor));
                method_count += 1;
            }
        }

        Ok(Self {
            kind,
            services,
            method_count,
        })
    }

    pub fn lookup(&self, service: &str, method: &str) -> Option<Arc<MethodDescriptor>> {
        self.services.get(service)?.get(method).cloned()
    }

    pub fn kind(&self) -> SchemaKind {
        self.kind
    }

    /// Service names in sorted order.
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Descriptors of one service, sorted by method name.
    pub fn methods(&self, service: &str) -> Option<impl Iterator<Item = &Arc<MethodDescriptor>>> {
        self.services.get(service).map(|m| m.values())
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn method_count(&self) -> usize {
        self.method_count
    }
}
