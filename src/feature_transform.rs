//! Shared feature engineering for training and inference.
//!
//! Both call sites go through [`FeatureRow::compute`], so a corpus observation and a
//! live sample with the same inputs produce the same numbers. The two places where the
//! inputs legitimately differ between training and serving are explicit parameters:
//! [`TemporalInput`] and [`InteractionNdvi`].

use chrono::{Datelike, NaiveDate};

use crate::bands::{Band, BandSample, SoilSample};
use crate::feature_schema::FeatureSchema;

pub const INDEX_COLUMNS: [&str; 3] = ["EVI", "NDWI", "SAVI"];
pub const SOIL_COLUMNS: [&str; 5] = ["clay", "nitrogen", "ph", "sand", "soc"];
pub const TEMPORAL_COLUMNS: [&str; 3] = ["month", "day_of_year", "season"];
pub const RATIO_COLUMNS: [&str; 4] = [
    "B8_B4_ratio",
    "B8_B3_ratio",
    "B11_B8_ratio",
    "red_edge_ratio",
];
pub const INTERACTION_COLUMN: &str = "nitrogen_ndvi";

pub const NUM_FEATURES: usize = Band::ALL.len()
    + INDEX_COLUMNS.len()
    + SOIL_COLUMNS.len()
    + TEMPORAL_COLUMNS.len()
    + RATIO_COLUMNS.len()
    + 1;

/// When the observation happened.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TemporalInput {
    /// Only the month is known; day of year is approximated as `month * 30`.
    Month(u32),
    /// A real acquisition date; day of year is exact.
    Date(NaiveDate),
}

/// Which NDVI feeds the `nitrogen_ndvi` interaction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum InteractionNdvi {
    /// `(NIR - Red) / (NIR + Red)` from the sample itself. Used when serving.
    BandEstimate,
    /// The measured NDVI column of a training corpus.
    GroundTruth(f64),
}

pub struct FeatureInputs<'a> {
    pub bands: &'a BandSample,
    pub soil: Option<&'a SoilSample>,
    pub temporal: TemporalInput,
    pub interaction_ndvi: InteractionNdvi,
}

/// Division that yields 0 instead of inf/NaN on a zero denominator.
#[inline]
pub fn safe_div(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

pub fn band_ndvi(bands: &BandSample) -> f64 {
    let nir = bands.get(Band::Nir);
    let red = bands.get(Band::Red);
    safe_div(nir - red, nir + red)
}

/// 1 = Dec-Feb, 2 = Mar-May, 3 = Jun-Aug, 4 = everything else.
pub fn season(month: u32) -> u32 {
    match month {
        12 | 1 | 2 => 1,
        3..=5 => 2,
        6..=8 => 3,
        _ => 4,
    }
}

/// Feature names in the order [`FeatureRow::compute`] emits them.
pub fn natural_columns() -> Vec<&'static str> {
    let mut columns: Vec<&'static str> = Band::ALL.iter().map(|b| b.column()).collect();
    columns.extend(INDEX_COLUMNS);
    columns.extend(SOIL_COLUMNS);
    columns.extend(TEMPORAL_COLUMNS);
    columns.extend(RATIO_COLUMNS);
    columns.push(INTERACTION_COLUMN);
    columns
}

/// Named feature values before alignment to a schema.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureRow {
    entries: Vec<(&'static str, f64)>,
}

impl FeatureRow {
    pub fn compute(inputs: &FeatureInputs<'_>) -> Self {
        let bands = inputs.bands;
        let soil = inputs.soil.copied().unwrap_or_default();
        let mut entries = Vec::with_capacity(NUM_FEATURES);

        for band in Band::ALL {
            entries.push((band.column(), bands.get(band)));
        }

        let blue = bands.get(Band::Blue);
        let green = bands.get(Band::Green);
        let red = bands.get(Band::Red);
        let nir = bands.get(Band::Nir);
        let supplied = bands.indices();
        let evi = supplied
            .evi
            .unwrap_or_else(|| 2.5 * safe_div(nir - red, nir + 6.0 * red - 7.5 * blue + 1.0));
        let ndwi = supplied
            .ndwi
            .unwrap_or_else(|| safe_div(green - nir, green + nir));
        let savi = supplied
            .savi
            .unwrap_or_else(|| 1.5 * safe_div(nir - red, nir + red + 0.5));
        entries.extend([("EVI", evi), ("NDWI", ndwi), ("SAVI", savi)]);

        entries.extend([
            ("clay", soil.clay),
            ("nitrogen", soil.nitrogen),
            ("ph", soil.ph),
            ("sand", soil.sand),
            ("soc", soil.soc),
        ]);

        let (month, day_of_year) = match inputs.temporal {
            TemporalInput::Month(month) => (month, month.saturating_mul(30)),
            TemporalInput::Date(date) => (date.month(), date.ordinal()),
        };
        entries.extend([
            ("month", f64::from(month)),
            ("day_of_year", f64::from(day_of_year)),
            ("season", f64::from(season(month))),
        ]);

        entries.extend([
            ("B8_B4_ratio", safe_div(nir, red)),
            ("B8_B3_ratio", safe_div(nir, green)),
            ("B11_B8_ratio", safe_div(bands.get(Band::Swir1), nir)),
            ("red_edge_ratio", safe_div(bands.get(Band::RedEdge1), red)),
        ]);

        let ndvi = match inputs.interaction_ndvi {
            InteractionNdvi::BandEstimate => band_ndvi(bands),
            InteractionNdvi::GroundTruth(ndvi) => ndvi,
        };
        entries.push((INTERACTION_COLUMN, soil.nitrogen * ndvi));

        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(column, _)| *column == name)
            .map(|(_, value)| *value)
    }

    pub fn columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(column, _)| *column)
    }

    /// Drops the named columns, keeping the order of the rest.
    pub fn without(mut self, excluded: &[&str]) -> Self {
        self.entries.retain(|(column, _)| !excluded.contains(column));
        self
    }

    /// Orders the row by `schema`, zero-filling columns the row lacks.
    ///
    /// Without a schema the natural order is kept as is.
    pub fn align(&self, schema: Option<&FeatureSchema>) -> FeatureVector {
        let values = match schema {
            Some(schema) => schema
                .columns()
                .iter()
                .map(|column| self.get(column).unwrap_or(0.0))
                .collect(),
            None => self.entries.iter().map(|(_, value)| *value).collect(),
        };
        FeatureVector::from_values(values)
    }
}

/// Model-ready feature values. Never contains NaN or infinity.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureVector {
    values: Vec<f64>,
}

impl FeatureVector {
    fn from_values(mut values: Vec<f64>) -> Self {
        for value in values.iter_mut() {
            if !value.is_finite() {
                *value = 0.0;
            }
        }
        Self { values }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<f64> {
        self.values
    }
}

/// Builds the feature vector for one live sample.
pub fn prepare_prediction_input(
    bands: &BandSample,
    soil: Option<&SoilSample>,
    month: u32,
    schema: Option<&FeatureSchema>,
) -> FeatureVector {
    FeatureRow::compute(&FeatureInputs {
        bands,
        soil,
        temporal: TemporalInput::Month(month),
        interaction_ndvi: InteractionNdvi::BandEstimate,
    })
    .align(schema)
}
