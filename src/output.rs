//! Call sink: FASTA/FASTQ emission of the finished calls, plus the
//! seed-format dump of the fitted instrument matrices.

use crate::config::OutputFormat;
use crate::matrix;
use crate::model::BlockFit;
use crate::nuc::phred_char;
use std::io::{self, Write};

/// Write one record per cluster: `cluster_NNN`, the called sequence,
/// and for FASTQ the Phred+33 quality string.
pub fn write_calls<W: Write>(out: &mut W, fit: &BlockFit, format: OutputFormat) -> io::Result<()> {
    let symbol = match format {
        OutputFormat::Fasta => '>',
        OutputFormat::Fastq => '@',
    };
    for cl in 0..fit.ncluster {
        writeln!(out, "{symbol}cluster_{:03}", cl + 1)?;
        let offset = cl * fit.ncycle;
        let seq: String = fit.bases[offset..offset + fit.ncycle]
            .iter()
            .map(|b| b.to_char())
            .collect();
        writeln!(out, "{seq}")?;
        if format == OutputFormat::Fastq {
            writeln!(out, "+")?;
            let quals: String = fit.quals[offset..offset + fit.ncycle]
                .iter()
                .map(|&q| phred_char(q))
                .collect();
            writeln!(out, "{quals}")?;
        }
    }
    Ok(())
}

/// Dump the fitted crosstalk, noise and phasing matrices in the seed
/// text format, so a later run can start from them.
pub fn write_matrices<W: Write>(out: &mut W, fit: &BlockFit) -> io::Result<()> {
    writeln!(out, "# crosstalk")?;
    out.write_all(matrix::write_column_major(&fit.crosstalk).as_bytes())?;
    writeln!(out, "# noise")?;
    out.write_all(matrix::write_column_major(&fit.noise).as_bytes())?;
    writeln!(out, "# phasing")?;
    out.write_all(matrix::write_column_major(&fit.phasing).as_bytes())?;
    Ok(())
}
