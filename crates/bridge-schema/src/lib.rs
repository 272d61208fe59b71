mod descriptor;
mod error;
mod idl;
mod json;
mod registry;

pub use descriptor::{Cardinality, MethodDescriptor};
pub use error::SchemaError;
pub use registry::{Registry, SchemaKind};
