use crate::bake::BakeStage;
use crate::tile::{TileBinding, TileId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Degenerate lightmap tile {binding:?}: {reason}")]
    InvalidGeometry {
        binding: TileBinding,
        reason: &'static str,
    },

    #[error("Lightmap atlas is full ({layers} layers of {size}x{size})")]
    AtlasFull { size: u32, layers: u32 },

    #[error("Bake stage {requested:?} cannot follow {current:?}")]
    StageOrder {
        current: BakeStage,
        requested: BakeStage,
    },

    #[error("Lightmap data holds {actual} values, expected {expected}")]
    InvalidLightmapData { expected: usize, actual: usize },

    #[error("Unknown lightmap tile {0:?}")]
    UnknownTile(TileId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
