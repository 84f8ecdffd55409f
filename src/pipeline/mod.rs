//! Forward rendering pipeline stages
//!
//! One frame flows through these stages in order:
//! 1. [`SceneDataCollector`] - gathers instances, lights, cameras and colliders
//! 2. [`ShadowMaps`] - renders the maps of shadow-casting lights
//! 3. [`LightPassController`] - prepares per-light uniforms and macros
//! 4. [`VisibilityStage`] - culls and orders instances per camera
//!
//! The [`Renderer`](crate::Renderer) drives the stages and issues the draws.

pub mod bounds;
pub mod collector;
pub mod inputs;
pub mod instance;
pub mod lighting;
pub mod picking;
pub mod shadows;
pub mod visibility;

pub use bounds::{Aabb, BoundingSphere, Ray};
pub use collector::{CollectOutcome, SceneDataCollector};
pub use inputs::{names, ShaderInputs};
pub use instance::{InstanceId, Lod, RenderFlags, RenderInstance};
pub use lighting::{reference_fragment, LightPassController, PreparedLight};
pub use shadows::{ShadowMap, ShadowMaps, ShadowState};
pub use visibility::{Containment, Frustum, VisibilityStage, VisibilityStats};
