//! Per-tileset context tying staging, finalization, occlusion feedback and
//! visibility reconciliation into one owner-thread tick.

mod config;
mod context;
mod error;
pub mod logging;
mod staging;

pub use config::{ConfigError, FinalizeConfig, InteractionConfig, OcclusionConfig, TilesetConfig};
pub use context::{PlacementObserver, TickReport, TilesetContext};
pub use error::TilesetError;
pub use staging::{StagedTile, StagingQueue, StagingSender};
