use serde::{Deserialize, Serialize};

pub const IRRIGATION_ADVISORY: &str =
    "Consider irrigation improvements: low vegetation vigor detected";
pub const URGENT_ADVISORY: &str = "Urgent: check for nutrient deficiency or pest damage";
pub const BARE_SOIL_ADVISORY: &str = "Very low NDVI: possible bare soil or crop failure";
pub const MAINTENANCE_NOTE: &str = "Healthy vegetation: maintain current practices";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Healthy,
    Moderate,
    Poor,
    Critical,
}

impl Classification {
    pub fn from_score(score: u8) -> Self {
        match score {
            75.. => Classification::Healthy,
            50..=74 => Classification::Moderate,
            25..=49 => Classification::Poor,
            _ => Classification::Critical,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthAssessment {
    pub predicted_ndvi: f64,
    pub health_score: u8,
    pub classification: Classification,
    pub recommendations: Vec<String>,
}

/// Maps a clamped NDVI onto 0..=100 through five linear segments, truncating each.
pub fn health_score(ndvi: f64) -> u8 {
    let ndvi = ndvi.clamp(-1.0, 1.0);
    let raw = if ndvi < 0.0 {
        0.0
    } else if ndvi < 0.1 {
        ndvi * 100.0
    } else if ndvi < 0.2 {
        10.0 + (ndvi - 0.1) * 200.0
    } else if ndvi < 0.4 {
        30.0 + (ndvi - 0.2) * 150.0
    } else if ndvi < 0.6 {
        60.0 + (ndvi - 0.4) * 150.0
    } else {
        90.0 + (ndvi - 0.6) * 25.0
    };
    raw.trunc().clamp(0.0, 100.0) as u8
}

/// Turns a raw model prediction into a score, class and advice.
pub fn assess(predicted_ndvi: f64) -> HealthAssessment {
    // NaN would otherwise survive the clamp.
    let ndvi = if predicted_ndvi.is_nan() {
        0.0
    } else {
        predicted_ndvi.clamp(-1.0, 1.0)
    };
    let score = health_score(ndvi);

    let mut recommendations = Vec::new();
    if score < 50 {
        recommendations.push(IRRIGATION_ADVISORY.to_string());
    }
    if score < 30 {
        recommendations.push(URGENT_ADVISORY.to_string());
    }
    if ndvi < 0.15 {
        recommendations.push(BARE_SOIL_ADVISORY.to_string());
    }
    if ndvi > 0.5 {
        recommendations.push(MAINTENANCE_NOTE.to_string());
    }

    HealthAssessment {
        predicted_ndvi: (ndvi * 1e6).round() / 1e6,
        health_score: score,
        classification: Classification::from_score(score),
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moderate_parcel() {
        let ndvi = (3200.0 - 1500.0) / (3200.0 + 1500.0);
        let assessment = assess(ndvi);
        assert_eq!(assessment.health_score, 54);
        assert_eq!(assessment.classification, Classification::Moderate);
        assert!(assessment.recommendations.is_empty());
    }

    #[test]
    fn bare_parcel() {
        let assessment = assess(0.0);
        assert_eq!(assessment.health_score, 0);
        assert_eq!(assessment.classification, Classification::Critical);
        assert_eq!(
            assessment.recommendations,
            vec![IRRIGATION_ADVISORY, URGENT_ADVISORY, BARE_SOIL_ADVISORY]
        );
    }

    #[test]
    fn lush_parcel() {
        let assessment = assess(0.75);
        assert_eq!(assessment.health_score, 93);
        assert_eq!(assessment.classification, Classification::Healthy);
        assert_eq!(assessment.recommendations, vec![MAINTENANCE_NOTE]);
    }

    #[test]
    fn out_of_range_prediction_is_clamped() {
        let assessment = assess(-1.5);
        assert_eq!(assessment.predicted_ndvi, -1.0);
        assert_eq!(assessment.health_score, 0);
        assert_eq!(assessment.classification, Classification::Critical);

        let assessment = assess(3.0);
        assert_eq!(assessment.predicted_ndvi, 1.0);
        assert_eq!(assessment.health_score, 100);
    }

    #[test]
    fn segment_boundaries() {
        assert_eq!(health_score(0.05), 5);
        assert_eq!(health_score(0.1), 10);
        assert_eq!(health_score(0.2), 30);
        assert_eq!(health_score(0.4), 60);
        assert_eq!(health_score(0.6), 90);
        assert_eq!(health_score(1.0), 100);
    }

    #[test]
    fn score_is_monotonic() {
        let mut previous = 0;
        for step in 0..=20_000 {
            let ndvi = -1.0 + f64::from(step) * 1e-4;
            let score = health_score(ndvi);
            assert!(score >= previous, "score dropped at ndvi={ndvi}");
            previous = score;
        }
    }

    #[test]
    fn classification_thresholds() {
        assert_eq!(Classification::from_score(100), Classification::Healthy);
        assert_eq!(Classification::from_score(75), Classification::Healthy);
        assert_eq!(Classification::from_score(74), Classification::Moderate);
        assert_eq!(Classification::from_score(50), Classification::Moderate);
        assert_eq!(Classification::from_score(49), Classification::Poor);
        assert_eq!(Classification::from_score(25), Classification::Poor);
        assert_eq!(Classification::from_score(24), Classification::Critical);
    }
}
