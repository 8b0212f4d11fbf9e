use std::path::Path;

use at_types::{validation_error, AtResult, StoreError};
use csv::ReaderBuilder;

/// Question/answer pair pulled out of one dataset row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QaRow {
    pub question: String,
    pub answer: String,
}

fn read_error(path: &Path, message: String) -> StoreError {
    StoreError::DatasetRead {
        path: path.display().to_string(),
        message,
    }
}

/// Read data row `row_idx` (0-based, header excluded) of a CSV dataset and
/// extract the named question and answer columns.
///
/// An index past the end or a missing/blank field is a validation error;
/// an unreadable file is a store error.
pub fn read_qa_row<P: AsRef<Path>>(
    path: P,
    row_idx: usize,
    question_field: &str,
    answer_field: &str,
) -> AtResult<QaRow> {
    let path = path.as_ref();
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|e| read_error(path, format!("failed to open CSV file: {e}")))?;

    let headers = rdr
        .headers()
        .map_err(|e| read_error(path, format!("failed to read CSV headers: {e}")))?
        .clone();
    let q_col = headers.iter().position(|h| h.trim() == question_field);
    let a_col = headers.iter().position(|h| h.trim() == answer_field);

    let mut rows = 0usize;
    for (idx, result) in rdr.records().enumerate() {
        let record = result
            .map_err(|e| read_error(path, format!("failed to read CSV record {}: {e}", idx + 2)))?;
        if idx < row_idx {
            rows += 1;
            continue;
        }

        let field = |col: Option<usize>| {
            col.and_then(|c| record.get(c))
                .map(|v| v.trim().to_string())
                .unwrap_or_default()
        };
        let question = field(q_col);
        let answer = field(a_col);
        if question.is_empty() || answer.is_empty() {
            return Err(validation_error!("Could not extract question/answer from row"));
        }
        return Ok(QaRow { question, answer });
    }

    tracing::debug!(path = %path.display(), rows, row_idx, "Benchmark row out of range");
    Err(validation_error!("Row index {} out of range", row_idx))
}
