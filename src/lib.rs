//! procgen-stream - asynchronous streaming of procedurally generated meshes and textures

pub mod core;
pub mod scheduler;
pub mod generation;
pub mod streaming;
