pub mod metadata;
pub mod target;
pub mod workspace;

pub use metadata::WorkspaceMetadata;
pub use target::{TargetManifest, TargetOptions, TargetProperty, TargetPropertyType, target_manifest};
pub use workspace::*;
