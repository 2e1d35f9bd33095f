use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader as _};
use csv::ReaderBuilder;

use super::clean::parse_line;
use super::UserListError;

const NAME_COLUMN: &str = "Name";
const EMAIL_COLUMN: &str = "Email";

const SPREADSHEET_EXTENSIONS: &[&str] = &["exel", "xls", "xlsx", "xlsm", "xlsb", "odf", "ods", "odt"];

/// Kind of user list file, decided by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Text,
    Csv,
    Spreadsheet,
}

impl SourceKind {
    pub fn detect(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_default();
        if SPREADSHEET_EXTENSIONS.contains(&ext.as_str()) {
            SourceKind::Spreadsheet
        } else if ext == "csv" {
            SourceKind::Csv
        } else {
            SourceKind::Text
        }
    }
}

/// Raw `(name, email)` pairs as found in the source, before cleaning.
pub type RawRows = Vec<(String, String)>;

/// Read a line-oriented text list, one "name email" pair per line.
pub fn read_text(path: &Path) -> io::Result<RawRows> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_line)
        .collect())
}

/// Read the `Name` and `Email` columns of a CSV file.
pub fn read_csv(path: &Path) -> Result<RawRows, UserListError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|err| csv_error(path, err))?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|err| csv_error(path, err))?
        .iter()
        .map(str::to_string)
        .collect();
    let (name_idx, email_idx) = resolve_columns(path, &headers)?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| csv_error(path, err))?;
        let name = record.get(name_idx).unwrap_or_default().to_string();
        let email = record.get(email_idx).unwrap_or_default().to_string();
        rows.push((name, email));
    }
    Ok(prepare_tabular(rows))
}

/// Read the `Name` and `Email` columns of the first sheet of a workbook.
pub fn read_spreadsheet(path: &Path) -> Result<RawRows, UserListError> {
    let mut workbook =
        open_workbook_auto(path).map_err(|err| UserListError::unsupported(path, err.to_string()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| UserListError::unsupported(path, "workbook has no sheets"))?
        .map_err(|err| UserListError::unsupported(path, err.to_string()))?;

    let mut rows_iter = range.rows();
    let headers: Vec<String> = rows_iter
        .next()
        .map(|row| row.iter().map(format_cell).collect())
        .unwrap_or_default();
    let (name_idx, email_idx) = resolve_columns(path, &headers)?;

    let rows = rows_iter
        .map(|row| {
            let name = row.get(name_idx).map(format_cell).unwrap_or_default();
            let email = row.get(email_idx).map(format_cell).unwrap_or_default();
            (name, email)
        })
        .collect();
    Ok(prepare_tabular(rows))
}

/// Drop rows that repeat an earlier row verbatim and sort by raw name.
/// The sort is stable so equal names keep file order.
fn prepare_tabular(rows: RawRows) -> RawRows {
    let mut seen = HashSet::new();
    let mut unique: RawRows = rows
        .into_iter()
        .filter(|row| seen.insert(row.clone()))
        .collect();
    unique.sort_by(|a, b| a.0.cmp(&b.0));
    unique
}

fn resolve_columns(path: &Path, headers: &[String]) -> Result<(usize, usize), UserListError> {
    let find = |column: &str| headers.iter().position(|h| h.trim() == column);
    match (find(NAME_COLUMN), find(EMAIL_COLUMN)) {
        (Some(name), Some(email)) => Ok((name, email)),
        _ => Err(UserListError::unsupported(
            path,
            format!(
                "expected `{NAME_COLUMN}` and `{EMAIL_COLUMN}` columns (found: {})",
                headers.join(", ")
            ),
        )),
    }
}

fn format_cell(cell: &Data) -> String {
    match cell {
        Data::Empty | Data::Error(_) => String::new(),
        Data::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn csv_error(path: &Path, err: csv::Error) -> UserListError {
    if let csv::ErrorKind::Io(io_err) = err.kind() {
        if io_err.kind() == io::ErrorKind::NotFound {
            return UserListError::Unreadable {
                path: path.to_path_buf(),
                reason: io_err.to_string(),
            };
        }
    }
    UserListError::unsupported(path, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use tempfile::TempDir;

    #[test]
    fn detect_kind_by_extension() {
        assert_eq!(SourceKind::detect(Path::new("a.xlsx")), SourceKind::Spreadsheet);
        assert_eq!(SourceKind::detect(Path::new("a.ODS")), SourceKind::Spreadsheet);
        assert_eq!(SourceKind::detect(Path::new("a.csv")), SourceKind::Csv);
        assert_eq!(SourceKind::detect(Path::new("a.txt")), SourceKind::Text);
        assert_eq!(SourceKind::detect(Path::new("names")), SourceKind::Text);
    }

    #[test]
    fn read_text_skips_blank_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("list.txt");
        fs::write(&path, "Alice Smith alice@x.com\n\n   \nbob@y.com Bob\tJones\n").unwrap();

        let rows = read_text(&path).unwrap();
        assert_eq!(
            rows,
            vec![
                ("Alice Smith".to_string(), "alice@x.com".to_string()),
                ("Bob Jones".to_string(), "bob@y.com".to_string()),
            ]
        );
    }

    #[test]
    fn read_csv_selects_named_columns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("list.csv");
        fs::write(
            &path,
            "Timestamp,Email,Name\n\
             1,zed@x.com,Zed\n\
             2,amy@x.com,Amy\n\
             3,zed@x.com,Zed\n",
        )
        .unwrap();

        let rows = read_csv(&path).unwrap();
        assert_eq!(
            rows,
            vec![
                ("Amy".to_string(), "amy@x.com".to_string()),
                ("Zed".to_string(), "zed@x.com".to_string()),
            ]
        );
    }

    #[test]
    fn read_csv_requires_exact_column_names() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("list.csv");
        fs::write(&path, "name,email\nAmy,amy@x.com\n").unwrap();

        let err = read_csv(&path).unwrap_err();
        assert!(matches!(err, UserListError::UnsupportedFormat { .. }));
    }

    #[test]
    fn read_csv_missing_file_is_unreadable() {
        let path = PathBuf::from("/nonexistent/list.csv");
        let err = read_csv(&path).unwrap_err();
        assert!(matches!(err, UserListError::Unreadable { .. }));
    }

    #[test]
    fn read_spreadsheet_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("list.xlsx");
        fs::write(&path, "not a workbook").unwrap();

        let err = read_spreadsheet(&path).unwrap_err();
        assert!(matches!(err, UserListError::UnsupportedFormat { .. }));
    }
}
