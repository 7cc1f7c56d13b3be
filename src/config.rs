//! Run configuration.
//!
//! Every tuning knob is gathered into one immutable value constructed at
//! start-up and passed by reference into the driver; nothing in the
//! library reads process-global state.

use crate::blockspec::DataBlock;
use crate::matrix::{self, MatrixError};
use ndarray::Array2;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Output flavour for the final calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Fasta,
    Fastq,
}

impl FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fasta" => Ok(OutputFormat::Fasta),
            "fastq" => Ok(OutputFormat::Fastq),
            other => Err(ConfigError::UnknownFormat(other.to_string())),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Fasta => write!(f, "fasta"),
            OutputFormat::Fastq => write!(f, "fastq"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown output format '{0}', expected fasta or fastq")]
    UnknownFormat(String),
    #[error("mu must be strictly positive, got {0}")]
    BadMu(f64),
    #[error("at least one base-calling iteration is required")]
    BadIterations,
    #[error("failed to read matrix file '{path}': {source}")]
    MatrixIo {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse matrix file '{path}': {source}")]
    MatrixParse { path: String, source: MatrixError },
}

/// Immutable tuning for one run.
#[derive(Debug, Clone)]
pub struct AybConfig {
    /// Quality-score tolerance in the posterior formula.
    pub mu: f64,
    /// Outer base-calling iterations per data block.
    pub n_iter: u32,
    pub output_format: OutputFormat,
    /// Parsed block specification.
    pub blocks: Vec<DataBlock>,
    /// Optional externally supplied crosstalk seed (4x4).
    pub crosstalk: Option<Array2<f64>>,
    /// Optional noise seed (4 x ncycle).
    pub noise: Option<Array2<f64>>,
    /// Optional phasing seed (ncycle x ncycle).
    pub phasing: Option<Array2<f64>>,
}

impl AybConfig {
    pub fn new(blocks: Vec<DataBlock>) -> Self {
        AybConfig {
            mu: 1e-5,
            n_iter: 5,
            output_format: OutputFormat::default(),
            blocks,
            crosstalk: None,
            noise: None,
            phasing: None,
        }
    }

    /// Reject out-of-range tuning before any data is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.mu > 0.0) || !self.mu.is_finite() {
            return Err(ConfigError::BadMu(self.mu));
        }
        if self.n_iter == 0 {
            return Err(ConfigError::BadIterations);
        }
        Ok(())
    }
}

/// Load a seed matrix from the column-major whitespace text format.
pub fn load_seed_matrix(path: &Path) -> Result<Array2<f64>, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::MatrixIo {
        path: path.display().to_string(),
        source,
    })?;
    matrix::parse_column_major(&text).map_err(|source| ConfigError::MatrixParse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockspec::parse_blockspec;

    #[test]
    fn defaults_are_valid() {
        let config = AybConfig::new(parse_blockspec("4R").unwrap());
        assert!(config.validate().is_ok());
        assert_eq!(config.mu, 1e-5);
        assert_eq!(config.n_iter, 5);
        assert_eq!(config.output_format, OutputFormat::Fasta);
    }

    #[test]
    fn tuning_is_range_checked() {
        let mut config = AybConfig::new(parse_blockspec("4R").unwrap());
        config.mu = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::BadMu(_))));
        config.mu = 1e-5;
        config.n_iter = 0;
        assert!(matches!(config.validate(), Err(ConfigError::BadIterations)));
    }

    #[test]
    fn format_parses_case_insensitively() {
        assert_eq!("FASTA".parse::<OutputFormat>().unwrap(), OutputFormat::Fasta);
        assert_eq!("FastQ".parse::<OutputFormat>().unwrap(), OutputFormat::Fastq);
        assert!("sam".parse::<OutputFormat>().is_err());
    }
}
