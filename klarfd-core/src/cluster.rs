//! Reference [`AnalysisEngine`]: spatial clustering of defect coordinates.
//!
//! Cluster ids start at 1; 0 marks noise. One output file is written per
//! report, named `<stem>_clustered<ext>`.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::report::{
    Algorithm, AnalysisEngine, AnalysisError, Defect, OutputFormat, ResultRecord,
    StructuredReport,
};

/// Column name used when none is configured.
pub const DEFAULT_ATTRIBUTE: &str = "CLUSTER_ID";

#[derive(Clone, Debug)]
pub struct ClusteringEngine {
    attribute: String,
}

impl Default for ClusteringEngine {
    fn default() -> Self {
        Self::new(DEFAULT_ATTRIBUTE)
    }
}

impl ClusteringEngine {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
        }
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }
}

impl AnalysisEngine for ClusteringEngine {
    fn analyze(
        &self,
        report: &StructuredReport,
        output_dir: &Path,
        format: OutputFormat,
        algorithm: &Algorithm,
    ) -> Result<Vec<ResultRecord>, AnalysisError> {
        validate(algorithm)?;

        let mut labels: HashMap<usize, usize> = HashMap::new();
        let mut per_wafer = Vec::with_capacity(report.wafers.len());
        for wafer in &report.wafers {
            let started = Instant::now();
            let wafer_labels = cluster(&wafer.defects, algorithm);
            let clusters = wafer_labels.iter().copied().max().unwrap_or(0);
            for (defect, label) in wafer.defects.iter().zip(&wafer_labels) {
                labels.insert(defect.line, *label);
            }
            per_wafer.push((clusters, started.elapsed()));
        }

        let started = Instant::now();
        let output_path = output_dir.join(output_name(&report.source));
        let content = match format {
            OutputFormat::Full => render_full(report, &labels, &self.attribute),
            OutputFormat::Baby => render_baby(report, &labels, &self.attribute),
        };
        std::fs::write(&output_path, content)?;
        let output_time = started.elapsed();

        Ok(report
            .wafers
            .iter()
            .zip(per_wafer)
            .map(|(wafer, (clusters, clustering_time))| ResultRecord {
                wafer_id: wafer.wafer_id.clone(),
                lot_id: report.field("lot_id").map(str::to_string),
                clusters,
                defects: wafer.defects.len(),
                clustering_time,
                output_time,
                output_path: Some(output_path.clone()),
            })
            .collect())
    }
}

fn validate(algorithm: &Algorithm) -> Result<(), AnalysisError> {
    let (distance, min_samples) = match algorithm {
        Algorithm::Dbscan { eps, min_samples } => (*eps, *min_samples),
        Algorithm::Grid { cell, min_samples } => (*cell, *min_samples),
    };
    if !(distance.is_finite() && distance > 0.0) {
        return Err(AnalysisError::InvalidParameters(format!(
            "{} distance must be positive, got {distance}",
            algorithm.name()
        )));
    }
    if min_samples == 0 {
        return Err(AnalysisError::InvalidParameters(
            "min_samples must be at least 1".into(),
        ));
    }
    Ok(())
}

/// `lot.klarf` -> `lot_clustered.klarf`
pub fn output_name(source: &Path) -> String {
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "report".to_string());
    match source.extension() {
        Some(ext) => format!("{stem}_clustered.{}", ext.to_string_lossy()),
        None => format!("{stem}_clustered"),
    }
}

/// Label every defect; `labels[i]` belongs to `defects[i]`.
pub fn cluster(defects: &[Defect], algorithm: &Algorithm) -> Vec<usize> {
    match algorithm {
        Algorithm::Dbscan { eps, min_samples } => dbscan(defects, *eps, *min_samples),
        Algorithm::Grid { cell, min_samples } => grid(defects, *cell, *min_samples),
    }
}

fn dbscan(defects: &[Defect], eps: f64, min_samples: usize) -> Vec<usize> {
    let eps_sq = eps * eps;
    let neighbours = |index: usize| -> Vec<usize> {
        let origin = &defects[index];
        defects
            .iter()
            .enumerate()
            .filter(|(_, other)| {
                let (dx, dy) = (other.x - origin.x, other.y - origin.y);
                dx * dx + dy * dy <= eps_sq
            })
            .map(|(candidate, _)| candidate)
            .collect()
    };

    let mut labels = vec![0usize; defects.len()];
    let mut visited = vec![false; defects.len()];
    let mut next_label = 0;

    for start in 0..defects.len() {
        if visited[start] {
            continue;
        }
        visited[start] = true;
        let seeds = neighbours(start);
        // Neighbourhoods include the point itself.
        if seeds.len() < min_samples {
            continue;
        }

        next_label += 1;
        labels[start] = next_label;
        let mut frontier: VecDeque<usize> = seeds.into();
        while let Some(point) = frontier.pop_front() {
            if labels[point] == 0 {
                labels[point] = next_label;
            }
            if visited[point] {
                continue;
            }
            visited[point] = true;
            let reach = neighbours(point);
            if reach.len() >= min_samples {
                frontier.extend(reach);
            }
        }
    }
    labels
}

fn grid(defects: &[Defect], cell: f64, min_samples: usize) -> Vec<usize> {
    let key = |defect: &Defect| ((defect.x / cell).floor() as i64, (defect.y / cell).floor() as i64);

    let mut buckets: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
    for (index, defect) in defects.iter().enumerate() {
        buckets.entry(key(defect)).or_default().push(index);
    }

    let mut dense: Vec<(i64, i64)> = buckets
        .iter()
        .filter(|(_, members)| members.len() >= min_samples)
        .map(|(cell, _)| *cell)
        .collect();
    // Stable numbering regardless of hash order.
    dense.sort_unstable();

    let mut cell_label: HashMap<(i64, i64), usize> = HashMap::new();
    let mut next_label = 0;
    for &seed in &dense {
        if cell_label.contains_key(&seed) {
            continue;
        }
        next_label += 1;
        let mut frontier = VecDeque::from([seed]);
        while let Some((cx, cy)) = frontier.pop_front() {
            if cell_label.contains_key(&(cx, cy)) {
                continue;
            }
            cell_label.insert((cx, cy), next_label);
            for dx in -1..=1 {
                for dy in -1..=1 {
                    let neighbour = (cx + dx, cy + dy);
                    let is_dense = buckets
                        .get(&neighbour)
                        .is_some_and(|members| members.len() >= min_samples);
                    if is_dense && !cell_label.contains_key(&neighbour) {
                        frontier.push_back(neighbour);
                    }
                }
            }
        }
    }

    defects
        .iter()
        .map(|defect| cell_label.get(&key(defect)).copied().unwrap_or(0))
        .collect()
}

fn render_full(report: &StructuredReport, labels: &HashMap<usize, usize>, attribute: &str) -> String {
    let mut out = String::with_capacity(report.raw.len() + labels.len() * 4);
    for (index, line) in report.raw.lines().enumerate() {
        if report.record_spec_lines.contains(&index) {
            out.push_str(&extend_record_spec(line, attribute));
        } else if let Some(label) = labels.get(&index) {
            out.push_str(&append_value(line, *label));
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

fn render_baby(report: &StructuredReport, labels: &HashMap<usize, usize>, attribute: &str) -> String {
    let mut out = String::new();
    for line in report.raw.lines() {
        if line.trim_start().starts_with("WaferID") {
            break;
        }
        out.push_str(line);
        out.push('\n');
    }

    for wafer in &report.wafers {
        out.push_str(&format!("WaferID \"{}\";\n", wafer.wafer_id));
        out.push_str(&format!("DefectRecordSpec 2 DEFECTID {attribute};\n"));
        out.push_str("DefectList");
        for defect in &wafer.defects {
            let label = labels.get(&defect.line).copied().unwrap_or(0);
            out.push_str(&format!("\n {} {}", defect.id, label));
        }
        out.push_str(";\n");
    }
    out.push_str("EndOfFile;\n");
    out
}

fn extend_record_spec(line: &str, attribute: &str) -> String {
    let body = line.trim_end().trim_end_matches(';');
    let mut tokens = body.split_whitespace();
    let keyword = tokens.next().unwrap_or("DefectRecordSpec");
    let count = tokens
        .next()
        .and_then(|count| count.parse::<usize>().ok())
        .unwrap_or(0);
    let names: Vec<&str> = tokens.collect();
    format!("{keyword} {} {} {attribute};", count + 1, names.join(" "))
}

fn append_value(line: &str, value: usize) -> String {
    let trimmed = line.trim_end();
    match trimmed.strip_suffix(';') {
        Some(row) => format!("{} {value};", row.trim_end()),
        None => format!("{trimmed} {value}"),
    }
}

/// Where an engine writes for `source`, given a resolved output directory.
pub fn output_path(output_dir: &Path, source: &Path) -> PathBuf {
    output_dir.join(output_name(source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klarf::{SAMPLE, parse_str};

    fn defect(id: u64, x: f64, y: f64) -> Defect {
        Defect { id, x, y, line: id as usize }
    }

    #[test]
    fn dbscan_separates_dense_group_from_noise() {
        let defects = vec![
            defect(0, 0.0, 0.0),
            defect(1, 1.0, 0.0),
            defect(2, 0.0, 1.0),
            defect(3, 50.0, 50.0),
            defect(4, 100.0, 0.0),
            defect(5, 101.0, 0.0),
            defect(6, 100.0, 1.0),
        ];
        let labels = cluster(
            &defects,
            &Algorithm::Dbscan {
                eps: 2.0,
                min_samples: 3,
            },
        );
        assert_eq!(labels, vec![1, 1, 1, 0, 2, 2, 2]);
    }

    #[test]
    fn grid_merges_touching_dense_cells() {
        let defects = vec![
            defect(0, 1.0, 1.0),
            defect(1, 2.0, 2.0),
            defect(2, 11.0, 1.0),
            defect(3, 12.0, 2.0),
            defect(4, 95.0, 95.0),
        ];
        let labels = cluster(
            &defects,
            &Algorithm::Grid {
                cell: 10.0,
                min_samples: 2,
            },
        );
        assert_eq!(labels, vec![1, 1, 1, 1, 0]);
    }

    #[test]
    fn full_output_appends_attribute_column() {
        let tmp = tempfile::tempdir().unwrap();
        let report = parse_str(PathBuf::from("/in/lot.klarf"), SAMPLE).unwrap();

        let records = ClusteringEngine::default()
            .analyze(&report, tmp.path(), OutputFormat::Full, &Algorithm::default())
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].clusters, 1);
        assert_eq!(records[0].defects, 4);
        assert_eq!(records[0].lot_id.as_deref(), Some("LOT42"));

        let written = std::fs::read_to_string(tmp.path().join("lot_clustered.klarf")).unwrap();
        assert!(written.contains("DefectRecordSpec 5 DEFECTID XREL YREL DSIZE CLUSTER_ID;"));
        assert!(written.contains(" 1 10.0 10.0 0.5 1\n"));
        assert!(written.contains(" 4 80.0 80.0 0.5 0;\n"));
    }

    #[test]
    fn baby_output_keeps_header_and_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let report = parse_str(PathBuf::from("/in/lot.klarf"), SAMPLE).unwrap();

        ClusteringEngine::new("CLASS")
            .analyze(&report, tmp.path(), OutputFormat::Baby, &Algorithm::default())
            .unwrap();

        let written = std::fs::read_to_string(tmp.path().join("lot_clustered.klarf")).unwrap();
        assert!(written.starts_with("FileVersion 1 1;\n"));
        assert!(written.contains("DefectRecordSpec 2 DEFECTID CLASS;"));
        assert!(written.contains("\n 3 1\n 4 0;\n"));
    }

    #[test]
    fn rejects_non_positive_distance() {
        let tmp = tempfile::tempdir().unwrap();
        let report = parse_str(PathBuf::from("/in/lot.klarf"), SAMPLE).unwrap();
        let err = ClusteringEngine::default()
            .analyze(
                &report,
                tmp.path(),
                OutputFormat::Full,
                &Algorithm::Dbscan {
                    eps: 0.0,
                    min_samples: 3,
                },
            )
            .unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidParameters(_)));
    }

    #[test]
    fn output_names_keep_extension() {
        assert_eq!(output_name(Path::new("/in/lot.klarf")), "lot_clustered.klarf");
        assert_eq!(output_name(Path::new("/in/lot")), "lot_clustered");
        assert_eq!(
            output_path(Path::new("/out"), Path::new("/in/a.000")),
            PathBuf::from("/out/a_clustered.000")
        );
    }
}
