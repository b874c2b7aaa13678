//! XLSX artifact store: `rust_xlsxwriter` for writing, `calamine` for reading.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use calamine::{Data, DataType, Reader, Xlsx, open_workbook};
use chrono::NaiveDate;
use rust_xlsxwriter::{Color, Format, Workbook, XlsxError};
use tracing::{debug, warn};

use super::{ArtifactStore, COLUMNS, OutputRow};
use crate::error::ArtifactError;
use crate::model::ApplicationStatus;

const SHEET_NAME: &str = "Applications";
const MAX_COLUMN_WIDTH: usize = 50;

/// Spreadsheet files under a base directory. Absolute targets are used as is.
#[derive(Debug, Clone)]
pub struct XlsxArtifactStore {
    base_dir: PathBuf,
}

impl XlsxArtifactStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Resolve a target name to a file path.
    pub fn path_for(&self, target: &str) -> PathBuf {
        self.base_dir.join(target)
    }
}

#[async_trait]
impl ArtifactStore for XlsxArtifactStore {
    async fn read(&self, target: &str) -> Result<Option<Vec<OutputRow>>, ArtifactError> {
        let path = self.path_for(target);
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|source| ArtifactError::Io {
                path: path.display().to_string(),
                source,
            })?;
        if !exists {
            debug!(path = %path.display(), "No existing artifact");
            return Ok(None);
        }

        let display = path.display().to_string();
        let rows = tokio::task::spawn_blocking(move || read_rows(&path))
            .await
            .map_err(|e| ArtifactError::Io {
                path: display,
                source: std::io::Error::other(e),
            })??;
        Ok(Some(rows))
    }

    async fn write(&self, target: &str, rows: &[OutputRow]) -> Result<(), ArtifactError> {
        let path = self.path_for(target);
        let display = path.display().to_string();
        let rows = rows.to_vec();
        tokio::task::spawn_blocking(move || write_rows(&path, &rows))
            .await
            .map_err(|e| ArtifactError::Io {
                path: display,
                source: std::io::Error::other(e),
            })?
    }
}

// ── Writing ─────────────────────────────────────────────────────────

fn write_failed(path: &Path, e: XlsxError) -> ArtifactError {
    ArtifactError::WriteFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact.xlsx".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}

fn column_widths(rows: &[OutputRow]) -> [usize; COLUMNS.len()] {
    let mut widths = COLUMNS.map(|c| c.chars().count());
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row.cells()) {
            *width = (*width).max(cell.chars().count());
        }
    }
    widths.map(|w| (w + 2).min(MAX_COLUMN_WIDTH))
}

fn build_workbook(rows: &[OutputRow]) -> Result<Workbook, XlsxError> {
    let mut workbook = Workbook::new();
    let header = Format::new()
        .set_bold()
        .set_background_color(Color::RGB(0xCCCCCC));

    let sheet = workbook.add_worksheet();
    sheet.set_name(SHEET_NAME)?;
    for (col, name) in (0u16..).zip(COLUMNS) {
        sheet.write_string_with_format(0, col, name, &header)?;
    }
    for (row_idx, row) in (1u32..).zip(rows) {
        for (col, cell) in (0u16..).zip(row.cells()) {
            if !cell.is_empty() {
                sheet.write_string(row_idx, col, cell)?;
            }
        }
    }
    for (col, width) in (0u16..).zip(column_widths(rows)) {
        sheet.set_column_width(col, width as f64)?;
    }
    sheet.set_freeze_panes(1, 0)?;
    Ok(workbook)
}

/// Write to a sibling temp file and rename over the target, so a failed
/// write never leaves a half-written artifact.
fn write_rows(path: &Path, rows: &[OutputRow]) -> Result<(), ArtifactError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|source| ArtifactError::Io {
            path: parent.display().to_string(),
            source,
        })?;
    }

    let tmp = temp_path(path);
    let mut workbook = build_workbook(rows).map_err(|e| write_failed(path, e))?;
    if let Err(e) = workbook.save(&tmp) {
        let _ = std::fs::remove_file(&tmp);
        return Err(write_failed(path, e));
    }
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        ArtifactError::WriteFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
    })?;

    debug!(path = %path.display(), rows = rows.len(), "Wrote artifact");
    Ok(())
}

// ── Reading ─────────────────────────────────────────────────────────

fn corrupt(path: &Path, reason: impl Into<String>) -> ArtifactError {
    ArtifactError::Corrupt {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

fn cell_text(cell: Option<&Data>) -> String {
    match cell {
        None | Some(Data::Empty) => String::new(),
        Some(Data::String(s)) => s.trim().to_string(),
        Some(other) => other.to_string().trim().to_string(),
    }
}

fn cell_date(cell: Option<&Data>) -> Option<NaiveDate> {
    match cell? {
        Data::String(s) | Data::DateTimeIso(s) => {
            let s = s.trim();
            let day = s.get(..10).unwrap_or(s);
            NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
        }
        other => other.as_date(),
    }
}

fn read_rows(path: &Path) -> Result<Vec<OutputRow>, ArtifactError> {
    let mut workbook: Xlsx<_> =
        open_workbook(path).map_err(|e: calamine::XlsxError| corrupt(path, e.to_string()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| corrupt(path, "workbook has no sheets"))?
        .map_err(|e| corrupt(path, e.to_string()))?;

    let mut lines = range.rows();
    let Some(header) = lines.next() else {
        return Ok(Vec::new());
    };

    // Columns are located by header name so reordered sheets still load.
    let index: HashMap<String, usize> = header
        .iter()
        .enumerate()
        .map(|(i, cell)| (cell_text(Some(cell)).to_lowercase(), i))
        .collect();
    let col = |name: &str| index.get(&name.to_lowercase()).copied();
    let (Some(company_col), Some(position_col), Some(date_col)) =
        (col("Company"), col("Position"), col("Applied Date"))
    else {
        return Err(corrupt(path, "missing Company, Position or Applied Date column"));
    };

    let text = |row: &[Data], name: &str| col(name).map(|i| cell_text(row.get(i))).unwrap_or_default();

    let mut rows = Vec::new();
    for (line_no, row) in (2usize..).zip(lines) {
        if row.iter().all(|c| matches!(c, Data::Empty)) {
            continue;
        }
        let company = cell_text(row.get(company_col));
        let position = cell_text(row.get(position_col));
        let Some(applied_date) = cell_date(row.get(date_col)) else {
            warn!(path = %path.display(), line = line_no, "Row without a valid applied date, skipping");
            continue;
        };
        if company.is_empty() || position.is_empty() {
            warn!(path = %path.display(), line = line_no, "Row without company or position, skipping");
            continue;
        }

        rows.push(OutputRow {
            company,
            position,
            applied_date,
            status: ApplicationStatus::resolve(&text(row, "Status")).0,
            source: text(row, "Source"),
            location: text(row, "Location"),
            job_id: text(row, "Job ID"),
            status_link: text(row, "Status Link"),
            notes: text(row, "Notes"),
            message_id: text(row, "Message ID"),
        });
    }
    Ok(rows)
}
