use occlusion::ProxyPoolError;
use renderer::PrepareError;
use thiserror::Error;
use tiles::{TileId, TileStateError};

use crate::ConfigError;

#[derive(Debug, Error)]
pub enum TilesetError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to prepare tile {tile:?}: {source}")]
    Prepare {
        tile: TileId,
        #[source]
        source: PrepareError,
    },
    #[error("{pending} retired resources still pending after {pumps} destruction pumps")]
    DestructionStalled { pending: usize, pumps: u32 },
    #[error(transparent)]
    Tile(#[from] TileStateError),
    #[error(transparent)]
    ProxyPool(#[from] ProxyPoolError),
    #[error("failed to install tracing subscriber: {0}")]
    Logging(String),
}
