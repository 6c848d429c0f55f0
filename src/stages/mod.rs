/// Built-in stage types
///
/// These make up the `core` backend. Other backends register their own types through
/// `ModuleRegistry::register`; precedence between them is decided by the engine config.
use crate::pipeline::registry::ModuleRegistry;

// GeoJSON feature stores and inline parameter features
pub mod readers;

// Graph helpers, feature and geometry filters
pub mod filters;

// Geographic, Web Mercator and UTM coordinate transforms
pub mod projection;

// GeoJSON / GeoJSONL outputs
pub mod writers;

/// Backend name of the built-in stage types
pub const BUILTIN_BACKEND: &str = "core";

/// Register every built-in stage type
pub fn register_builtin(registry: &ModuleRegistry) {
    readers::register(registry, BUILTIN_BACKEND);
    filters::register(registry, BUILTIN_BACKEND);
    writers::register(registry, BUILTIN_BACKEND);
    tracing::info!("➕ Registered built-in '{}' stage types ({} in registry)", BUILTIN_BACKEND, registry.len());
}

pub use filters::{ConnectionJoin, FeatureCache, FeatureLimit, FeatureResetID, GeometryTransform, SpatialRelation};
pub use readers::{FeatureReader, InputParam};
pub use writers::FeatureWriter;
