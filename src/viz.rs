//! Deterministic SVG line charts for run artifacts.

use std::path::Path;

use crate::error::{FinError, FinResult};

const WIDTH: u32 = 960;
const HEIGHT: u32 = 420;
const MARGIN: u32 = 40;
const CHART_TOP: f64 = 70.0;

fn scale(values: &[f64], low: f64, high: f64) -> Vec<f64> {
    let min_v = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max_v = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if (max_v - min_v).abs() < f64::EPSILON {
        return vec![(low + high) / 2.0; values.len()];
    }
    values
        .iter()
        .map(|value| high - ((value - min_v) / (max_v - min_v)) * (high - low))
        .collect()
}

/// Write a fixed-canvas line chart: evenly spaced x anchors, y scaled into
/// the chart band, last value highlighted with a marker and footer label.
pub fn write_line_chart_svg(
    path: &Path,
    title: &str,
    x_labels: &[String],
    y_values: &[f64],
) -> FinResult<()> {
    if x_labels.is_empty() || y_values.is_empty() || x_labels.len() != y_values.len() {
        return Err(FinError::invalid("invalid chart data"));
    }

    let chart_left = MARGIN as f64;
    let chart_right = (WIDTH - MARGIN) as f64;
    let chart_bottom = (HEIGHT - MARGIN) as f64;

    let count = y_values.len();
    let points_x: Vec<f64> = (0..count)
        .map(|idx| {
            if count == 1 {
                (chart_left + chart_right) / 2.0
            } else {
                chart_left + idx as f64 * ((chart_right - chart_left) / (count - 1) as f64)
            }
        })
        .collect();
    let points_y = scale(y_values, CHART_TOP, chart_bottom);

    let polyline = points_x
        .iter()
        .zip(points_y.iter())
        .map(|(x, y)| format!("{:.2},{:.2}", x, y))
        .collect::<Vec<_>>()
        .join(" ");
    let last_value = y_values[count - 1];
    let last_label = &x_labels[count - 1];

    let svg = format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">
  <rect x="0" y="0" width="{w}" height="{h}" fill="#0f172a"/>
  <text x="{m}" y="36" fill="#e2e8f0" font-size="22" font-family="monospace">{title}</text>
  <line x1="{left}" y1="{bottom}" x2="{right}" y2="{bottom}" stroke="#334155" stroke-width="1"/>
  <line x1="{left}" y1="{top}" x2="{left}" y2="{bottom}" stroke="#334155" stroke-width="1"/>
  <polyline points="{polyline}" fill="none" stroke="#22d3ee" stroke-width="2"/>
  <circle cx="{last_x:.2}" cy="{last_y:.2}" r="4" fill="#f59e0b"/>
  <text x="{m}" y="{footer}" fill="#94a3b8" font-size="12" font-family="monospace">last={last_label} value={last_value:.4}</text>
</svg>
"##,
        w = WIDTH,
        h = HEIGHT,
        m = MARGIN,
        left = chart_left,
        right = chart_right,
        top = CHART_TOP,
        bottom = chart_bottom,
        polyline = polyline,
        last_x = points_x[count - 1],
        last_y = points_y[count - 1],
        footer = HEIGHT - 12,
        title = title,
        last_label = last_label,
        last_value = last_value,
    );
    std::fs::write(path, svg)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chart_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("equity.svg");
        let labels = vec!["2025-01-01".to_string(), "2025-01-02".to_string()];
        write_line_chart_svg(&path, "Equity", &labels, &[100.0, 110.0]).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("width=\"960\" height=\"420\""));
        assert!(content.contains("last=2025-01-02 value=110.0000"));
        assert!(content.contains("<polyline"));
    }

    #[test]
    fn test_flat_series_centers_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.svg");
        let labels = vec!["a".to_string(), "b".to_string()];
        write_line_chart_svg(&path, "Flat", &labels, &[5.0, 5.0]).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        // Midline between chart_top (70) and chart_bottom (380) is 225.
        assert!(content.contains("225.00"));
    }

    #[test]
    fn test_rejects_mismatched_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.svg");
        let labels = vec!["a".to_string()];
        assert!(write_line_chart_svg(&path, "Bad", &labels, &[1.0, 2.0]).is_err());
        assert!(write_line_chart_svg(&path, "Bad", &[], &[]).is_err());
    }
}
