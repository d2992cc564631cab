//! CSV encoding of hourly series

use anyhow::{bail, Context, Result};
use std::io;
use std::path::Path;

use super::{HourlySeries, Measure};
use crate::atomic::write_atomic;

/// Shortest representation that parses back to the same value, always with a fraction
fn format_value(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:?}", v),
        None => String::new(),
    }
}

/// Quote a field when it contains a separator, quote or newline
pub fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

pub fn to_csv(series: &HourlySeries) -> String {
    let mut out = String::from("time");
    for measure in &series.measures {
        out.push(',');
        out.push_str(&escape_field(&measure.name));
    }
    out.push('\n');

    for (i, time) in series.time.iter().enumerate() {
        out.push_str(&escape_field(time));
        for measure in &series.measures {
            out.push(',');
            out.push_str(&format_value(measure.values.get(i).copied().flatten()));
        }
        out.push('\n');
    }

    out
}

/// Split `text` into records of unquoted fields.
///
/// Quoted fields may contain separators, doubled quotes and line breaks.
/// Blank lines are dropped.
fn records(text: &str) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if quoted {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => quoted = false,
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if field.is_empty() => quoted = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                if !(record.len() == 1 && record[0].is_empty()) {
                    records.push(std::mem::take(&mut record));
                }
            }
            _ => field.push(c),
        }
    }

    if quoted {
        bail!("csv ends inside a quoted field");
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }

    Ok(records)
}

/// Inverse of [`to_csv`]
pub fn parse_csv(text: &str) -> Result<HourlySeries> {
    let mut rows = records(text)?.into_iter();
    let header = rows.next().context("csv is empty")?;
    let mut columns = header.into_iter();

    if columns.next().as_deref() != Some("time") {
        bail!("csv header must start with 'time'");
    }

    let mut measures: Vec<Measure> = columns
        .map(|name| Measure {
            name,
            values: Vec::new(),
        })
        .collect();
    let mut time = Vec::new();

    for (row, cells) in rows.enumerate() {
        let mut cells = cells.into_iter();
        time.push(cells.next().unwrap_or_default());

        for measure in measures.iter_mut() {
            let cell = cells
                .next()
                .with_context(|| format!("row {} is missing column {}", row + 1, measure.name))?;
            let value = if cell.is_empty() {
                None
            } else {
                Some(cell.parse::<f64>().with_context(|| {
                    format!("row {} has a non-number in {}: {}", row + 1, measure.name, cell)
                })?)
            };
            measure.values.push(value);
        }

        if cells.next().is_some() {
            bail!("row {} has more cells than the header", row + 1);
        }
    }

    Ok(HourlySeries { time, measures })
}

pub fn write_csv(path: &Path, series: &HourlySeries) -> io::Result<()> {
    write_atomic(path, to_csv(series))
}
