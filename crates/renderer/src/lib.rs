//! Two-phase construction and teardown of renderer resources for streamed
//! tiles.
//!
//! - `bridge`: worker-phase staging futures and the owner-thread
//!   [`ResourcePreparationBridge`].
//! - `staging`: geometry work done off the owner thread.
//! - `overlay`: raster overlay staging and shared owner textures.
//! - `scene`: [`RetainedScene`], an in-memory [`render_protocol::SceneGraph`].

mod bridge;
mod overlay;
mod scene;
mod staging;

pub use bridge::{
    BridgeStats, PrepareError, PrepareOptions, ReleaseOutcome, ResourcePreparationBridge,
    StagedResource, TileLifecycleObserver, TileNode, WorkerStagedResult, prepare_off_owner_thread,
    prepare_overlay_off_owner_thread, release_staged, release_staged_overlay,
};
pub use overlay::{OverlayImage, OverlayOptions, OverlayTexture, StagedOverlayTexture};
pub use scene::RetainedScene;
pub use staging::{Aabb, StagedPointCloud, StagedPrimitive, multiply_transforms};
