use std::fmt;

use serde::{Deserialize, Serialize};

pub const N_BANDS: usize = 10;

/// Sentinel-2 L2A channels used by the model, in feature order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Band {
    Blue,
    Green,
    Red,
    RedEdge1,
    RedEdge2,
    RedEdge3,
    Nir,
    NarrowNir,
    Swir1,
    Swir2,
}

impl Band {
    pub const ALL: [Band; N_BANDS] = [
        Band::Blue,
        Band::Green,
        Band::Red,
        Band::RedEdge1,
        Band::RedEdge2,
        Band::RedEdge3,
        Band::Nir,
        Band::NarrowNir,
        Band::Swir1,
        Band::Swir2,
    ];

    /// Column identifier used in corpora, artifacts and the imagery gateway.
    pub fn column(self) -> &'static str {
        match self {
            Band::Blue => "B2",
            Band::Green => "B3",
            Band::Red => "B4",
            Band::RedEdge1 => "B5",
            Band::RedEdge2 => "B6",
            Band::RedEdge3 => "B7",
            Band::Nir => "B8",
            Band::NarrowNir => "B8A",
            Band::Swir1 => "B11",
            Band::Swir2 => "B12",
        }
    }

    pub fn from_column(column: &str) -> Option<Band> {
        Band::ALL.into_iter().find(|band| band.column() == column)
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// Precomputed spectral indices a caller may supply alongside the bands.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SuppliedIndices {
    pub evi: Option<f64>,
    pub ndwi: Option<f64>,
    pub savi: Option<f64>,
}

/// Mean reflectance (x10000) for every band over a region.
///
/// Always holds a value for each of the [`N_BANDS`] channels, so a sample can be fed
/// to the feature transform without further checks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "BandRecord", into = "BandRecord")]
pub struct BandSample {
    values: [f64; N_BANDS],
    indices: SuppliedIndices,
}

impl BandSample {
    pub fn new(values: [f64; N_BANDS]) -> Self {
        Self {
            values,
            indices: SuppliedIndices::default(),
        }
    }

    pub fn with_indices(mut self, indices: SuppliedIndices) -> Self {
        self.indices = indices;
        self
    }

    /// Builds a sample from a per-band lookup, using 0 for bands the lookup lacks.
    pub fn from_lookup(lookup: impl Fn(Band) -> Option<f64>) -> Self {
        let mut values = [0.0; N_BANDS];
        for band in Band::ALL {
            values[band.index()] = lookup(band).unwrap_or(0.0);
        }
        Self::new(values)
    }

    pub fn get(&self, band: Band) -> f64 {
        self.values[band.index()]
    }

    pub fn values(&self) -> &[f64; N_BANDS] {
        &self.values
    }

    pub fn indices(&self) -> &SuppliedIndices {
        &self.indices
    }
}

// Wire shape: bands keyed by column id. Blue, green, red and NIR are mandatory.
#[derive(Serialize, Deserialize)]
struct BandRecord {
    #[serde(rename = "B2")]
    b2: f64,
    #[serde(rename = "B3")]
    b3: f64,
    #[serde(rename = "B4")]
    b4: f64,
    #[serde(rename = "B5", default)]
    b5: f64,
    #[serde(rename = "B6", default)]
    b6: f64,
    #[serde(rename = "B7", default)]
    b7: f64,
    #[serde(rename = "B8")]
    b8: f64,
    #[serde(rename = "B8A", default)]
    b8a: f64,
    #[serde(rename = "B11", default)]
    b11: f64,
    #[serde(rename = "B12", default)]
    b12: f64,
    #[serde(rename = "EVI", default, skip_serializing_if = "Option::is_none")]
    evi: Option<f64>,
    #[serde(rename = "NDWI", default, skip_serializing_if = "Option::is_none")]
    ndwi: Option<f64>,
    #[serde(rename = "SAVI", default, skip_serializing_if = "Option::is_none")]
    savi: Option<f64>,
}

impl From<BandRecord> for BandSample {
    fn from(r: BandRecord) -> Self {
        BandSample::new([
            r.b2, r.b3, r.b4, r.b5, r.b6, r.b7, r.b8, r.b8a, r.b11, r.b12,
        ])
        .with_indices(SuppliedIndices {
            evi: r.evi,
            ndwi: r.ndwi,
            savi: r.savi,
        })
    }
}

impl From<BandSample> for BandRecord {
    fn from(s: BandSample) -> Self {
        let [b2, b3, b4, b5, b6, b7, b8, b8a, b11, b12] = s.values;
        BandRecord {
            b2,
            b3,
            b4,
            b5,
            b6,
            b7,
            b8,
            b8a,
            b11,
            b12,
            evi: s.indices.evi,
            ndwi: s.indices.ndwi,
            savi: s.indices.savi,
        }
    }
}

/// Surface (0-5cm) soil attributes of a parcel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoilSample {
    /// g/kg
    pub clay: f64,
    /// cg/kg
    pub nitrogen: f64,
    /// pH in H2O x10
    pub ph: f64,
    /// g/kg
    pub sand: f64,
    /// dg/kg
    pub soc: f64,
}
