//! Workbook loading through calamine.

use calamine::{open_workbook_auto, Data, Reader};
use std::path::Path;

use super::{RawTables, Sheet};
use crate::errors::Result;

/// Cell as text; date cells become Excel serial numbers so every adapter
/// goes through the same date parser.
fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt.as_f64().to_string(),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Error(e) => {
            log::debug!("Cell error {:?}", e);
            String::new()
        }
    }
}

/// Read every sheet of an xlsx/xls/ods file.
pub fn load_workbook(path: &Path) -> Result<RawTables> {
    let mut workbook = open_workbook_auto(path)?;
    let source = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());

    let mut sheets = Vec::new();
    for name in workbook.sheet_names() {
        let range = workbook.worksheet_range(&name)?;
        let rows = range
            .rows()
            .map(|row| row.iter().map(cell_to_string).collect())
            .collect();
        sheets.push(Sheet::new(&name, rows));
    }

    log::debug!("Loaded {} sheet(s) from {}", sheets.len(), source);
    Ok(RawTables::new(&source, sheets))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::parse_date;
    use chrono::NaiveDate;

    #[test]
    fn test_cell_conversion() {
        assert_eq!(cell_to_string(&Data::String("  Projet A ".into())), "Projet A");
        assert_eq!(cell_to_string(&Data::Float(1234.5)), "1234.5");
        assert_eq!(cell_to_string(&Data::Int(42)), "42");
        assert_eq!(cell_to_string(&Data::Empty), "");
        // serial numbers written by the conversion parse back as dates
        assert_eq!(parse_date(&cell_to_string(&Data::Float(45000.0))).unwrap(), NaiveDate::from_ymd_opt(2023, 3, 15).unwrap());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_workbook(&dir.path().join("absent.xlsx")).is_err());
    }
}
