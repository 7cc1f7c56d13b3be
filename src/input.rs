//! Reader for the `_int.txt` intensity flavour: one cluster per line,
//! `lane tile x y` followed by four channel values per cycle, all
//! whitespace separated. Files ending in `.gz` are decompressed on the
//! fly.

use crate::nuc::NBASE;
use crate::tile::{Cluster, Tile, TileError};
use flate2::read::MultiGzDecoder;
use ndarray::Array2;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("file holds {found} cycles but {required} were requested")]
    InsufficientCycles { required: usize, found: usize },
    #[error("no clusters found in input")]
    Empty,
    #[error(transparent)]
    Tile(#[from] TileError),
}

fn open_reader(path: &Path) -> Result<Box<dyn BufRead>, InputError> {
    let file = File::open(path).map_err(|source| InputError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let gz = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("gz"));
    let reader: Box<dyn Read> = if gz {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(reader)))
}

/// Read a tile, keeping the first `want_cycles` cycles of every cluster.
///
/// The first line fixes the cycle count for the whole file; a file with
/// fewer cycles than requested is rejected before any model work starts.
pub fn read_int_txt(path: &Path, want_cycles: usize) -> Result<Tile, InputError> {
    let reader = open_reader(path)?;
    let mut clusters = Vec::new();
    let mut lane = 0u32;
    let mut tile_id = 0u32;
    let mut file_cycles: Option<usize> = None;

    for (idx, line) in reader.lines().enumerate() {
        let lineno = idx + 1;
        let line = line.map_err(|source| InputError::Io {
            path: path.display().to_string(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 + NBASE {
            return Err(InputError::Parse {
                line: lineno,
                reason: format!("expected at least {} fields, found {}", 4 + NBASE, fields.len()),
            });
        }
        let ints: Vec<u32> = fields[..4]
            .iter()
            .map(|f| {
                // Coordinates are sometimes written with a decimal point.
                f.parse::<f64>().map(|v| v.round() as u32)
            })
            .collect::<Result<_, _>>()
            .map_err(|e| InputError::Parse {
                line: lineno,
                reason: format!("bad cluster header: {e}"),
            })?;

        let values = &fields[4..];
        if values.len() % NBASE != 0 {
            return Err(InputError::Parse {
                line: lineno,
                reason: format!("{} intensity fields is not a multiple of {NBASE}", values.len()),
            });
        }
        let ncycle = values.len() / NBASE;
        match file_cycles {
            None => {
                if ncycle < want_cycles {
                    return Err(InputError::InsufficientCycles {
                        required: want_cycles,
                        found: ncycle,
                    });
                }
                file_cycles = Some(ncycle);
                lane = ints[0];
                tile_id = ints[1];
            }
            Some(expected) if expected != ncycle => {
                return Err(InputError::Parse {
                    line: lineno,
                    reason: format!("cluster has {ncycle} cycles, file started with {expected}"),
                });
            }
            Some(_) => {}
        }

        let mut signals = Array2::zeros((NBASE, want_cycles));
        for cy in 0..want_cycles {
            for ch in 0..NBASE {
                let raw = values[cy * NBASE + ch];
                signals[[ch, cy]] = raw.parse().map_err(|_| InputError::Parse {
                    line: lineno,
                    reason: format!("bad intensity value '{raw}'"),
                })?;
            }
        }
        clusters.push(Cluster::new(ints[2], ints[3], signals));
    }

    if clusters.is_empty() {
        return Err(InputError::Empty);
    }
    log::info!(
        "read {} clusters of {} cycles from {}",
        clusters.len(),
        want_cycles,
        path.display()
    );
    Ok(Tile::new(lane, tile_id, clusters)?)
}
