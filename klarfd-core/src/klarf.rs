//! Reader for the subset of KLARF the pipeline needs.
//!
//! Records are `Keyword values...;`. The defect list is the one record that
//! spans several lines: each row is a line of numbers and the last row ends
//! with the `;`.

use std::path::{Path, PathBuf};

use crate::report::{Defect, ParseError, ReportParser, StructuredReport, WaferMap};

/// Reference [`ReportParser`] for KLARF files.
#[derive(Clone, Copy, Debug, Default)]
pub struct KlarfParser;

impl KlarfParser {
    pub fn new() -> Self {
        Self
    }
}

impl ReportParser for KlarfParser {
    fn parse(&self, path: &Path) -> Result<StructuredReport, ParseError> {
        let text = std::fs::read_to_string(path)?;
        parse_str(path.to_path_buf(), &text)
    }
}

#[derive(Debug)]
struct Columns {
    count: usize,
    id: usize,
    x: usize,
    y: usize,
}

/// Parse KLARF text that was read from `source`.
pub fn parse_str(source: PathBuf, text: &str) -> Result<StructuredReport, ParseError> {
    if text.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let mut report = StructuredReport {
        source,
        raw: text.to_string(),
        ..StructuredReport::default()
    };
    let mut columns: Option<Columns> = None;
    let mut in_defect_list = false;

    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if in_defect_list {
            let (row, terminated) = strip_terminator(trimmed);
            if !row.is_empty() {
                let cols = columns.as_ref().ok_or_else(|| {
                    ParseError::malformed(line_no, "DefectList before DefectRecordSpec")
                })?;
                let wafer = report
                    .wafers
                    .last_mut()
                    .ok_or_else(|| ParseError::malformed(line_no, "DefectList before WaferID"))?;
                wafer.defects.push(parse_row(row, cols, index)?);
            }
            in_defect_list = !terminated;
            continue;
        }

        let (record, terminated) = strip_terminator(trimmed);
        let (keyword, rest) = record
            .split_once(char::is_whitespace)
            .map(|(keyword, rest)| (keyword, rest.trim()))
            .unwrap_or((record, ""));

        match keyword {
            "InspectionStationID" => {
                let values = quoted_values(rest);
                if values.len() != 3 {
                    return Err(ParseError::malformed(
                        line_no,
                        "InspectionStationID needs vendor, model and id",
                    ));
                }
                report.fields.insert("station_vendor".into(), values[0].clone());
                report.fields.insert("station_model".into(), values[1].clone());
                report.fields.insert("loader_name".into(), values[2].clone());
            }
            "LotID" => insert_single(&mut report, "lot_id", rest, line_no)?,
            "DeviceID" => insert_single(&mut report, "device_id", rest, line_no)?,
            "StepID" => insert_single(&mut report, "step_id", rest, line_no)?,
            "WaferID" => {
                let wafer_id = single_value(rest, line_no, "WaferID")?;
                report
                    .fields
                    .entry("wafer_id".into())
                    .or_insert_with(|| wafer_id.clone());
                report.wafers.push(WaferMap {
                    wafer_id,
                    defects: Vec::new(),
                });
            }
            "DefectRecordSpec" => {
                if !terminated {
                    return Err(ParseError::malformed(
                        line_no,
                        "DefectRecordSpec must fit on one line",
                    ));
                }
                columns = Some(parse_record_spec(rest, line_no)?);
                report.record_spec_lines.push(index);
            }
            "DefectList" => {
                if columns.is_none() {
                    return Err(ParseError::malformed(
                        line_no,
                        "DefectList before DefectRecordSpec",
                    ));
                }
                if report.wafers.is_empty() {
                    return Err(ParseError::malformed(line_no, "DefectList before WaferID"));
                }
                in_defect_list = !terminated;
            }
            "EndOfFile" => break,
            _ => {}
        }
    }

    if in_defect_list {
        return Err(ParseError::malformed(
            text.lines().count(),
            "unterminated DefectList",
        ));
    }
    if report.wafers.is_empty() {
        return Err(ParseError::MissingRecord("WaferID"));
    }
    Ok(report)
}

fn strip_terminator(line: &str) -> (&str, bool) {
    match line.strip_suffix(';') {
        Some(stripped) => (stripped.trim_end(), true),
        None => (line, false),
    }
}

/// Values of a record, quoted or bare.
fn quoted_values(rest: &str) -> Vec<String> {
    if rest.contains('"') {
        rest.split('"')
            .skip(1)
            .step_by(2)
            .map(str::to_string)
            .collect()
    } else {
        rest.split_whitespace().map(str::to_string).collect()
    }
}

fn single_value(rest: &str, line_no: usize, keyword: &str) -> Result<String, ParseError> {
    quoted_values(rest)
        .into_iter()
        .next()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ParseError::malformed(line_no, format!("{keyword} has no value")))
}

fn insert_single(
    report: &mut StructuredReport,
    field: &str,
    rest: &str,
    line_no: usize,
) -> Result<(), ParseError> {
    let value = single_value(rest, line_no, field)?;
    report.fields.insert(field.to_string(), value);
    Ok(())
}

fn parse_record_spec(rest: &str, line_no: usize) -> Result<Columns, ParseError> {
    let mut tokens = rest.split_whitespace();
    let count: usize = tokens
        .next()
        .and_then(|token| token.parse().ok())
        .ok_or_else(|| ParseError::malformed(line_no, "DefectRecordSpec needs a column count"))?;
    let names: Vec<&str> = tokens.collect();
    if names.len() != count {
        return Err(ParseError::malformed(
            line_no,
            format!("DefectRecordSpec declares {count} columns but names {}", names.len()),
        ));
    }

    let position = |name: &str| {
        names
            .iter()
            .position(|column| column.eq_ignore_ascii_case(name))
            .ok_or_else(|| ParseError::malformed(line_no, format!("DefectRecordSpec lacks {name}")))
    };
    Ok(Columns {
        count,
        id: position("DEFECTID")?,
        x: position("XREL")?,
        y: position("YREL")?,
    })
}

fn parse_row(row: &str, columns: &Columns, index: usize) -> Result<Defect, ParseError> {
    let line_no = index + 1;
    let values: Vec<&str> = row.split_whitespace().collect();
    if values.len() < columns.count {
        return Err(ParseError::malformed(
            line_no,
            format!("defect row has {} of {} columns", values.len(), columns.count),
        ));
    }

    let number = |column: usize, name: &str| {
        values[column]
            .parse::<f64>()
            .map_err(|_| ParseError::malformed(line_no, format!("{name} is not a number")))
    };
    let id = values[columns.id]
        .parse::<u64>()
        .map_err(|_| ParseError::malformed(line_no, "DEFECTID is not an integer"))?;

    Ok(Defect {
        id,
        x: number(columns.x, "XREL")?,
        y: number(columns.y, "YREL")?,
        line: index,
    })
}

#[cfg(test)]
pub(crate) const SAMPLE: &str = r#"FileVersion 1 1;
InspectionStationID "KLA" "2132" "LOADER01";
LotID "LOT42";
DeviceID "DEV7";
WaferID "W01";
DefectRecordSpec 4 DEFECTID XREL YREL DSIZE;
DefectList
 1 10.0 10.0 0.5
 2 11.0 10.5 0.5
 3 10.5 11.0 0.5
 4 80.0 80.0 0.5;
EndOfFile;
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_header_fields_and_defects() {
        let report = parse_str(PathBuf::from("/in/lot.klarf"), SAMPLE).unwrap();

        assert_eq!(report.field("loader_name"), Some("LOADER01"));
        assert_eq!(report.field("lot_id"), Some("LOT42"));
        assert_eq!(report.field("wafer_id"), Some("W01"));
        assert_eq!(report.wafers.len(), 1);
        assert_eq!(report.defect_count(), 4);
        assert_eq!(report.record_spec_lines, vec![5]);

        let last = report.wafers[0].defects[3];
        assert_eq!((last.id, last.x, last.y, last.line), (4, 80.0, 80.0, 10));
    }

    #[test]
    fn empty_text_is_rejected() {
        assert!(matches!(
            parse_str(PathBuf::from("x"), "  \n"),
            Err(ParseError::Empty)
        ));
    }

    #[test]
    fn missing_coordinate_column_is_malformed() {
        let text = SAMPLE.replace(
            "DefectRecordSpec 4 DEFECTID XREL YREL DSIZE;",
            "DefectRecordSpec 3 DEFECTID XREL DSIZE;",
        );
        let err = parse_str(PathBuf::from("x"), &text).unwrap_err();
        assert!(matches!(err, ParseError::Malformed { line: 6, .. }), "{err}");
    }

    #[test]
    fn unterminated_defect_list_is_malformed() {
        let text = " WaferID \"W1\";\nDefectRecordSpec 3 DEFECTID XREL YREL;\nDefectList\n1 2 3\n";
        assert!(matches!(
            parse_str(PathBuf::from("x"), text),
            Err(ParseError::Malformed { .. })
        ));
    }

    #[test]
    fn report_without_wafer_is_rejected() {
        let text = "FileVersion 1 1;\nLotID \"L\";\nEndOfFile;\n";
        assert!(matches!(
            parse_str(PathBuf::from("x"), text),
            Err(ParseError::MissingRecord("WaferID"))
        ));
    }

    #[test]
    fn parser_reads_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lot.klarf");
        std::fs::write(&path, SAMPLE).unwrap();

        let report = KlarfParser::new().parse(&path).unwrap();
        assert_eq!(report.source, path);
        assert_eq!(report.raw, SAMPLE);
    }
}
