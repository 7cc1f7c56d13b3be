//! Parser for the textual block specification.
//!
//! A specification such as `3R,2C,2I,3R` partitions the machine cycles
//! into blocks that open a new read (`R`), continue the current one
//! (`C`), or are discarded (`I`). Parsing is case-insensitive.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    /// Start a new read with these cycles.
    Read,
    /// Append these cycles to the current read.
    Concat,
    /// Discard these cycles.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlock {
    pub block_type: BlockType,
    pub num: u32,
}

impl fmt::Display for DataBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self.block_type {
            BlockType::Read => 'R',
            BlockType::Concat => 'C',
            BlockType::Ignore => 'I',
        };
        write!(f, "{}{}", self.num, letter)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockSpecError {
    #[error("bad block specification: {0}")]
    BadBlockSpec(String),
    #[error("block specification contains no read blocks")]
    NoBlocks,
}

/// Parse a block specification string into its typed blocks.
///
/// Grammar: `SPEC := ITEM (',' ITEM)*`, `ITEM := COUNT ('R'|'C'|'I')`
/// with `COUNT` a positive integer. The specification must contain at
/// least one read block, and a concat block must be preceded by a read.
pub fn parse_blockspec(spec: &str) -> Result<Vec<DataBlock>, BlockSpecError> {
    let trimmed = spec.trim();
    if trimmed.is_empty() {
        return Err(BlockSpecError::NoBlocks);
    }
    let mut blocks = Vec::new();
    let mut seen_read = false;
    for item in trimmed.split(',') {
        let item = item.trim();
        let Some(letter) = item.chars().last() else {
            return Err(BlockSpecError::BadBlockSpec("empty item".into()));
        };
        let block_type = match letter.to_ascii_uppercase() {
            'R' => BlockType::Read,
            'C' => BlockType::Concat,
            'I' => BlockType::Ignore,
            other => {
                return Err(BlockSpecError::BadBlockSpec(format!(
                    "unknown block letter '{other}' in '{item}'"
                )));
            }
        };
        let count_str = &item[..item.len() - letter.len_utf8()];
        let num: u32 = count_str.parse().map_err(|_| {
            BlockSpecError::BadBlockSpec(format!("bad cycle count '{count_str}' in '{item}'"))
        })?;
        if num == 0 {
            return Err(BlockSpecError::BadBlockSpec(format!(
                "zero cycle count in '{item}'"
            )));
        }
        if block_type == BlockType::Concat && !seen_read {
            return Err(BlockSpecError::BadBlockSpec(format!(
                "concat block '{item}' has no preceding read"
            )));
        }
        if block_type == BlockType::Read {
            seen_read = true;
        }
        blocks.push(DataBlock { block_type, num });
    }
    if !seen_read {
        return Err(BlockSpecError::NoBlocks);
    }
    Ok(blocks)
}

/// Total machine cycles the specification covers.
pub fn total_cycles(blocks: &[DataBlock]) -> u32 {
    blocks.iter().map(|b| b.num).sum()
}

/// Number of reads (sub-tiles) the specification produces.
pub fn read_count(blocks: &[DataBlock]) -> usize {
    blocks
        .iter()
        .filter(|b| b.block_type == BlockType::Read)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_spec() {
        let blocks = parse_blockspec("3R,2C,2I,3r").unwrap();
        assert_eq!(blocks.len(), 4);
        assert_eq!(
            blocks[0],
            DataBlock {
                block_type: BlockType::Read,
                num: 3
            }
        );
        assert_eq!(blocks[1].block_type, BlockType::Concat);
        assert_eq!(blocks[2].block_type, BlockType::Ignore);
        assert_eq!(total_cycles(&blocks), 10);
        assert_eq!(read_count(&blocks), 2);
    }

    #[test]
    fn case_insensitive_and_whitespace_tolerant() {
        let blocks = parse_blockspec(" 36r ").unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(total_cycles(&blocks), 36);
    }

    #[test]
    fn rejects_unknown_letter() {
        assert!(matches!(
            parse_blockspec("3R,4X"),
            Err(BlockSpecError::BadBlockSpec(_))
        ));
    }

    #[test]
    fn rejects_zero_and_malformed_counts() {
        assert!(matches!(
            parse_blockspec("0R"),
            Err(BlockSpecError::BadBlockSpec(_))
        ));
        assert!(matches!(
            parse_blockspec("R"),
            Err(BlockSpecError::BadBlockSpec(_))
        ));
        assert!(matches!(
            parse_blockspec("3R,,2I"),
            Err(BlockSpecError::BadBlockSpec(_))
        ));
        assert!(matches!(
            parse_blockspec("-3R"),
            Err(BlockSpecError::BadBlockSpec(_))
        ));
    }

    #[test]
    fn rejects_concat_without_read() {
        assert!(matches!(
            parse_blockspec("2C,3R"),
            Err(BlockSpecError::BadBlockSpec(_))
        ));
        assert!(matches!(
            parse_blockspec("2I,2C"),
            Err(BlockSpecError::BadBlockSpec(_))
        ));
    }

    #[test]
    fn rejects_specs_without_reads() {
        assert_eq!(parse_blockspec(""), Err(BlockSpecError::NoBlocks));
        assert_eq!(parse_blockspec("   "), Err(BlockSpecError::NoBlocks));
        assert_eq!(parse_blockspec("3I,2I"), Err(BlockSpecError::NoBlocks));
    }

    #[test]
    fn display_round_trip() {
        let blocks = parse_blockspec("5R,1C,2I").unwrap();
        let text: Vec<String> = blocks.iter().map(|b| b.to_string()).collect();
        assert_eq!(text.join(","), "5R,1C,2I");
    }
}
