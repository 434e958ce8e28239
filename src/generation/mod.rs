//! Generation engine facade
//!
//! - `engine`: the collaborator contract (graphs, parameters, generated data)
//! - `facade`: async request/response wrapper that serialises engine work
//!   on the compute lane
//! - `procedural`: a deterministic reference engine

pub mod engine;
pub mod facade;
pub mod procedural;

pub use engine::{
    CompiledGraph, GeneratedImage, GeneratedMesh, GeneratedResource, GenerationEngine, GenerationError,
    InstanceHandle, MeshSection, ParameterValue, Parameters,
};
pub use facade::{EngineInstance, GenerationFacade, ResourceTask};
pub use procedural::ProceduralEngine;
