//! Cluster and tile data model, and the datablock engine that carves a
//! raw tile into the sub-tiles the model analyses independently.

use crate::blockspec::{BlockType, DataBlock, total_cycles};
use crate::matrix;
use crate::nuc::NBASE;
use ndarray::Array2;
use thiserror::Error;

/// One flowcell spot: its coordinates and the `NBASE x ncycle` raw
/// intensity matrix.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub x: u32,
    pub y: u32,
    pub signals: Array2<f64>,
}

impl Cluster {
    pub fn new(x: u32, y: u32, signals: Array2<f64>) -> Self {
        assert_eq!(signals.nrows(), NBASE, "cluster signals must have one row per channel");
        Cluster { x, y, signals }
    }

    pub fn ncycle(&self) -> usize {
        self.signals.ncols()
    }
}

/// An ordered collection of clusters sharing a lane/tile identity. All
/// clusters hold the same number of cycles.
#[derive(Debug, Clone)]
pub struct Tile {
    pub lane: u32,
    pub tile: u32,
    pub clusters: Vec<Cluster>,
}

#[derive(Debug, Error)]
pub enum TileError {
    #[error("block specification covers {spec} cycles but the tile has {found}")]
    CycleMismatch { spec: usize, found: usize },
    #[error("bad block specification: {0}")]
    BadBlockSpec(String),
    #[error("cluster {index} has {found} cycles, expected {expected}")]
    RaggedCluster {
        index: usize,
        expected: usize,
        found: usize,
    },
}

impl Tile {
    pub fn new(lane: u32, tile: u32, clusters: Vec<Cluster>) -> Result<Self, TileError> {
        if let Some(first) = clusters.first() {
            let expected = first.ncycle();
            for (index, cl) in clusters.iter().enumerate() {
                if cl.ncycle() != expected {
                    return Err(TileError::RaggedCluster {
                        index,
                        expected,
                        found: cl.ncycle(),
                    });
                }
            }
        }
        Ok(Tile {
            lane,
            tile,
            clusters,
        })
    }

    pub fn ncluster(&self) -> usize {
        self.clusters.len()
    }

    /// Cycles per cluster; zero for an empty tile.
    pub fn ncycle(&self) -> usize {
        self.clusters.first().map_or(0, Cluster::ncycle)
    }

    /// Split the tile into sub-tiles according to a block specification.
    ///
    /// Walks the blocks with a column cursor: ignore blocks drop their
    /// columns, read blocks open a new sub-tile, concat blocks extend
    /// the current one. The specification must cover the tile's cycle
    /// count exactly.
    pub fn split_blocks(&self, blocks: &[DataBlock]) -> Result<Vec<Tile>, TileError> {
        let spec_cycles = total_cycles(blocks) as usize;
        if spec_cycles != self.ncycle() {
            return Err(TileError::CycleMismatch {
                spec: spec_cycles,
                found: self.ncycle(),
            });
        }

        // Per-subtile signal accumulators, one slot per cluster.
        let mut subtiles: Vec<Vec<Option<Array2<f64>>>> = Vec::new();
        let mut col_cursor = 0usize;
        for block in blocks {
            let col_end = col_cursor + block.num as usize - 1;
            match block.block_type {
                BlockType::Ignore => {}
                BlockType::Read => {
                    subtiles.push(vec![None; self.ncluster()]);
                    self.append_block(subtiles.last_mut().expect("just pushed"), col_cursor, col_end)?;
                }
                BlockType::Concat => {
                    let current = subtiles.last_mut().ok_or_else(|| {
                        TileError::BadBlockSpec(
                            "concat block with no read block in progress".into(),
                        )
                    })?;
                    self.append_block(current, col_cursor, col_end)?;
                }
            }
            col_cursor = col_end + 1;
        }

        let mut out = Vec::with_capacity(subtiles.len());
        for slots in subtiles {
            let clusters = slots
                .into_iter()
                .zip(&self.clusters)
                .map(|(signals, src)| Cluster {
                    x: src.x,
                    y: src.y,
                    signals: signals.expect("read block always appends columns"),
                })
                .collect();
            out.push(Tile {
                lane: self.lane,
                tile: self.tile,
                clusters,
            });
        }
        Ok(out)
    }

    fn append_block(
        &self,
        slots: &mut [Option<Array2<f64>>],
        col_start: usize,
        col_end: usize,
    ) -> Result<(), TileError> {
        for (slot, cluster) in slots.iter_mut().zip(&self.clusters) {
            let appended = matrix::append_columns(slot.take(), &cluster.signals, col_start, col_end)
                .map_err(|e| TileError::BadBlockSpec(e.to_string()))?;
            *slot = Some(appended);
        }
        Ok(())
    }
}
