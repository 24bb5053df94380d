use super::round1;
use crate::models::{DimensionScore, RadarProjection, TrendProjection};
use crate::schema::SchemaRegistry;

/// Radar scale applied to the management score so it reads on the same axis
/// range as raw dimension scores.
pub const MANAGEMENT_RADAR_SCALE: f64 = 10.0;

/// One slot per declared dimension (raw score, 0 when missing), then the
/// scaled management score.
pub fn build_radar_projection(
    scores: &[DimensionScore],
    management_score: f64,
    registry: &SchemaRegistry,
) -> RadarProjection {
    let mut labels = Vec::with_capacity(registry.dimensions.len() + 1);
    let mut data = Vec::with_capacity(registry.dimensions.len() + 1);

    for dimension in &registry.dimensions {
        labels.push(dimension.label.clone());
        data.push(
            scores
                .iter()
                .find(|score| score.dimension == dimension.key)
                .map(|score| score.raw_score)
                .unwrap_or(0.0),
        );
    }

    labels.push(registry.management_axis_label.clone());
    data.push(round1(management_score * MANAGEMENT_RADAR_SCALE));

    RadarProjection { labels, data }
}

/// `history` is `(period, totalScore)` in ascending period order.
pub fn build_trend_projection(history: &[(String, f64)], window: usize) -> TrendProjection {
    let start = history.len().saturating_sub(window);
    let recent = &history[start..];
    TrendProjection {
        labels: recent.iter().map(|(period, _)| period.clone()).collect(),
        data: recent.iter().map(|(_, total)| *total).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::{build_radar_projection, build_trend_projection};
    use crate::models::{DimensionScore, Grade};
    use crate::schema::SchemaRegistry;

    fn score(dimension: &str, raw_score: f64) -> DimensionScore {
        DimensionScore {
            id: format!("id-{}", dimension),
            branch_code: "B-1".to_string(),
            dimension: dimension.to_string(),
            raw_score,
            weight: 0.0,
            weighted_score: 0.0,
            grade: Grade::C,
            trend: None,
        }
    }

    #[test]
    fn radar_has_one_slot_per_dimension_plus_management() {
        let registry = SchemaRegistry::builtin().expect("registry");
        let radar = build_radar_projection(&[score("conduct", 88.0), score("organization", 91.5)], 2.34, &registry);

        assert_eq!(radar.labels.len(), 8);
        assert_eq!(radar.data.len(), 8);
        assert_eq!(radar.labels[0], "组织建设");
        assert_eq!(radar.data[0], 91.5);
        assert_eq!(radar.data[3], 88.0);
        assert_eq!(radar.data[1], 0.0);
        assert_eq!(radar.labels[7], "管理评价");
        assert_eq!(radar.data[7], 23.4);
    }

    #[test]
    fn trend_keeps_most_recent_periods() {
        let history = vec![
            ("2021".to_string(), 70.0),
            ("2022".to_string(), 72.5),
            ("2023".to_string(), 75.0),
        ];
        let trend = build_trend_projection(&history, 2);
        assert_eq!(trend.labels, vec!["2022", "2023"]);
        assert_eq!(trend.data, vec![72.5, 75.0]);

        assert_eq!(build_trend_projection(&history, 10).labels.len(), 3);
    }
}
