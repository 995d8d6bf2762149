//! Arity search result files.
//!
//! * results table: comma-separated `Arity,I/O's` rows, or
//!   `Arity,Average_IO,IO_Sequence1,...` rows when several reference inputs were measured
//! * best arity: a single integer consumed by later sorts
//! * cost table: MessagePack snapshot of evaluated costs used to resume a search

use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;

use log;

use crate::arity::{CostTable, SearchReport};
use crate::sort::SortError;

/// Default results table file name.
pub const RESULTS_FILE: &str = "arity_results.txt";

/// Default best arity file name.
pub const BEST_ARITY_FILE: &str = "best_arity.txt";

/// Writes one row per evaluation in evaluation order.
pub fn write_results(path: &Path, report: &SearchReport) -> Result<(), SortError> {
    let sequences = report
        .evaluations
        .iter()
        .map(|evaluation| evaluation.cost.per_input.len())
        .max()
        .unwrap_or(0);

    let mut writer = io::BufWriter::new(fs::File::create(path).map_err(SortError::IO)?);
    write_table(&mut writer, report, sequences).map_err(SortError::IO)?;

    log::info!("results saved to {}", path.display());
    return Ok(());
}

fn write_table(writer: &mut impl Write, report: &SearchReport, sequences: usize) -> io::Result<()> {
    if sequences <= 1 {
        writeln!(writer, "Arity,I/O's")?;
        for evaluation in &report.evaluations {
            writeln!(writer, "{},{}", evaluation.arity, evaluation.cost.io)?;
        }
    } else {
        let mut header = String::from("Arity,Average_IO");
        for idx in 1..=sequences {
            header.push_str(&format!(",IO_Sequence{}", idx));
        }
        writeln!(writer, "{}", header)?;

        for evaluation in &report.evaluations {
            write!(writer, "{},{}", evaluation.arity, evaluation.cost.io)?;
            for io in &evaluation.cost.per_input {
                write!(writer, ",{}", io)?;
            }
            writeln!(writer)?;
        }
    }
    writer.flush()
}

pub fn write_best_arity(path: &Path, arity: usize) -> Result<(), SortError> {
    fs::write(path, format!("{}\n", arity)).map_err(SortError::IO)
}

/// Reads an arity persisted by [`write_best_arity`].
pub fn read_best_arity(path: &Path) -> Result<usize, SortError> {
    let content = fs::read_to_string(path).map_err(SortError::IO)?;
    let arity = content
        .trim()
        .parse::<usize>()
        .map_err(|err| SortError::InvalidConfig(format!("malformed best arity file {}: {}", path.display(), err)))?;

    if arity < 2 {
        return Err(SortError::InvalidArity(arity));
    }
    return Ok(arity);
}

pub fn save_cost_table(path: &Path, table: &CostTable) -> Result<(), SortError> {
    let mut writer = io::BufWriter::new(fs::File::create(path).map_err(SortError::IO)?);
    rmp_serde::encode::write(&mut writer, table).map_err(SortError::SerializationError)?;
    writer.flush().map_err(SortError::IO)?;

    log::debug!("{} arity costs saved to {}", table.costs.len(), path.display());
    return Ok(());
}

pub fn load_cost_table(path: &Path) -> Result<CostTable, SortError> {
    let reader = io::BufReader::new(fs::File::open(path).map_err(SortError::IO)?);
    rmp_serde::decode::from_read(reader).map_err(SortError::DeserializationError)
}
