//! Reading of the historical Sentinel-2 band export and the per-farm soil export.
//!
//! Empty or unparseable numeric cells become NaN and are neutralized later by the
//! feature transform, the same way missing values are treated anywhere else.

use std::{collections::BTreeMap, collections::HashMap, fs::File, path::Path};

use chrono::NaiveDate;
use csv::StringRecord;
use tracing::{debug, warn};

use crate::bands::{Band, BandSample, SoilSample, SuppliedIndices, N_BANDS};
use crate::error::DatasetError;

pub const FARM_ID_COLUMN: &str = "farm_id";
pub const DATE_COLUMN: &str = "date";
pub const TARGET_COLUMN: &str = "NDVI";

/// Soil export columns (0-5cm depth) and the short names they are renamed to.
pub const SOIL_SOURCE_COLUMNS: [(&str, &str); 5] = [
    ("clay_0-5cm_mean", "clay"),
    ("nitrogen_0-5cm_mean", "nitrogen"),
    ("phh2o_0-5cm_mean", "ph"),
    ("sand_0-5cm_mean", "sand"),
    ("soc_0-5cm_mean", "soc"),
];

const INDEX_SOURCE_COLUMNS: [&str; 3] = ["EVI", "NDWI", "SAVI"];

/// One row of the band export.
#[derive(Clone, Debug, PartialEq)]
pub struct BandObservation {
    pub farm_id: String,
    pub date: NaiveDate,
    pub bands: [f64; N_BANDS],
    /// NaN when the corpus has no NDVI column or the cell is empty.
    pub ndvi: f64,
    /// EVI, NDWI, SAVI; NaN where missing.
    pub indices: [f64; 3],
}

#[derive(Clone, Debug)]
pub struct BandCorpus {
    pub observations: Vec<BandObservation>,
    pub has_ndvi: bool,
    pub indices_present: [bool; 3],
}

impl BandCorpus {
    /// The `n` latest observations across all farms, newest first.
    pub fn most_recent(&self, n: usize) -> Vec<&BandObservation> {
        let mut sorted: Vec<&BandObservation> = self.observations.iter().collect();
        sorted.sort_by(|a, b| b.date.cmp(&a.date));
        sorted.truncate(n);
        sorted
    }
}

#[derive(Clone, Debug, Default)]
pub struct SoilCorpus {
    pub by_farm: HashMap<String, [f64; 5]>,
    pub present: [bool; 5],
}

/// A farm/date observation with duplicates averaged and soil attached.
#[derive(Clone, Debug, PartialEq)]
pub struct MergedObservation {
    pub farm_id: String,
    pub date: NaiveDate,
    pub bands: BandSample,
    pub ndvi: f64,
    pub soil: SoilSample,
}

/// Which optional columns the source files actually carried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CorpusColumns {
    pub has_ndvi: bool,
    pub indices_present: [bool; 3],
    pub soil_present: [bool; 5],
}

#[derive(Clone, Debug)]
pub struct MergedDataset {
    pub observations: Vec<MergedObservation>,
    pub columns: CorpusColumns,
}

/// Mean of the finite values, NaN when there are none.
pub fn mean_of_finite(values: impl IntoIterator<Item = f64>) -> f64 {
    let (sum, count) = values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

fn open_csv(path: &Path) -> Result<csv::Reader<File>, DatasetError> {
    let file = File::open(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(file))
}

fn column_index(headers: &StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h == name)
}

fn required_column(headers: &StringRecord, name: &str) -> Result<usize, DatasetError> {
    column_index(headers, name).ok_or_else(|| DatasetError::MissingColumn(name.to_string()))
}

fn cell(record: &StringRecord, index: Option<usize>) -> f64 {
    index
        .and_then(|i| record.get(i))
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(f64::NAN)
}

/// Accepts `YYYY-MM-DD`, with or without a trailing time component.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let day = value.get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

pub fn read_band_corpus(path: &Path) -> Result<BandCorpus, DatasetError> {
    let mut reader = open_csv(path)?;
    let headers = reader.headers()?.clone();

    let farm_idx = required_column(&headers, FARM_ID_COLUMN)?;
    let date_idx = required_column(&headers, DATE_COLUMN)?;
    let band_idx = Band::ALL
        .iter()
        .map(|band| required_column(&headers, band.column()))
        .collect::<Result<Vec<_>, _>>()?;
    let ndvi_idx = column_index(&headers, TARGET_COLUMN);
    let index_idx = INDEX_SOURCE_COLUMNS.map(|name| column_index(&headers, name));

    let mut observations = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let raw_date = record.get(date_idx).unwrap_or_default();
        let date = parse_date(raw_date).ok_or_else(|| DatasetError::InvalidDate {
            value: raw_date.to_string(),
            row: row + 1,
        })?;

        let mut bands = [f64::NAN; N_BANDS];
        for (slot, idx) in bands.iter_mut().zip(&band_idx) {
            *slot = cell(&record, Some(*idx));
        }

        observations.push(BandObservation {
            farm_id: record.get(farm_idx).unwrap_or_default().to_string(),
            date,
            bands,
            ndvi: cell(&record, ndvi_idx),
            indices: index_idx.map(|idx| cell(&record, idx)),
        });
    }

    debug!(
        path = %path.display(),
        rows = observations.len(),
        "Read band corpus"
    );
    Ok(BandCorpus {
        observations,
        has_ndvi: ndvi_idx.is_some(),
        indices_present: index_idx.map(|idx| idx.is_some()),
    })
}

pub fn read_soil_corpus(path: &Path) -> Result<SoilCorpus, DatasetError> {
    let mut reader = open_csv(path)?;
    let headers = reader.headers()?.clone();

    let farm_idx = required_column(&headers, FARM_ID_COLUMN)?;
    let soil_idx = SOIL_SOURCE_COLUMNS.map(|(source, _)| column_index(&headers, source));

    let mut by_farm = HashMap::new();
    for record in reader.records() {
        let record = record?;
        let farm_id = record.get(farm_idx).unwrap_or_default().to_string();
        if by_farm.contains_key(&farm_id) {
            warn!(%farm_id, "Duplicate soil row ignored");
            continue;
        }
        by_farm.insert(farm_id, soil_idx.map(|idx| cell(&record, idx)));
    }

    Ok(SoilCorpus {
        by_farm,
        present: soil_idx.map(|idx| idx.is_some()),
    })
}

/// Averages same-day duplicates per farm and left-joins the soil rows by farm id.
///
/// Output is ordered by farm id, then date.
pub fn merge(bands: &BandCorpus, soil: &SoilCorpus) -> MergedDataset {
    let mut groups: BTreeMap<(&str, NaiveDate), Vec<&BandObservation>> = BTreeMap::new();
    for observation in &bands.observations {
        groups
            .entry((observation.farm_id.as_str(), observation.date))
            .or_default()
            .push(observation);
    }

    let observations = groups
        .into_iter()
        .map(|((farm_id, date), rows)| {
            let mut values = [f64::NAN; N_BANDS];
            for (i, slot) in values.iter_mut().enumerate() {
                *slot = mean_of_finite(rows.iter().map(|r| r.bands[i]));
            }
            let index = |i: usize, present: bool| {
                present.then(|| mean_of_finite(rows.iter().map(|r| r.indices[i])))
            };
            let indices = SuppliedIndices {
                evi: index(0, bands.indices_present[0]),
                ndwi: index(1, bands.indices_present[1]),
                savi: index(2, bands.indices_present[2]),
            };
            let [clay, nitrogen, ph, sand, soc] = soil
                .by_farm
                .get(farm_id)
                .copied()
                .unwrap_or([f64::NAN; 5]);

            MergedObservation {
                farm_id: farm_id.to_string(),
                date,
                bands: BandSample::new(values).with_indices(indices),
                ndvi: mean_of_finite(rows.iter().map(|r| r.ndvi)),
                soil: SoilSample {
                    clay,
                    nitrogen,
                    ph,
                    sand,
                    soc,
                },
            }
        })
        .collect();

    MergedDataset {
        observations,
        columns: CorpusColumns {
            has_ndvi: bands.has_ndvi,
            indices_present: bands.indices_present,
            soil_present: soil.present,
        },
    }
}

pub fn load_and_merge(bands_csv: &Path, soil_csv: &Path) -> Result<MergedDataset, DatasetError> {
    let bands = read_band_corpus(bands_csv)?;
    if bands.observations.is_empty() {
        return Err(DatasetError::Empty);
    }
    let soil = read_soil_corpus(soil_csv)?;
    Ok(merge(&bands, &soil))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::{fs, path::PathBuf};

    pub const BAND_HEADER: &str =
        "system:index,farm_id,date,B2,B3,B4,B5,B6,B7,B8,B8A,B11,B12,NDVI,EVI,NDWI,SAVI,.geo";

    pub fn band_row(farm: &str, date: &str, nir: f64, red: f64, ndvi: f64) -> String {
        format!(
            "x,{farm},{date},1200,1400,{red},1900,2600,2900,{nir},3000,2300,1700,{ndvi},0.5,-0.3,0.4,{{}}"
        )
    }

    pub fn write(dir: &std::path::Path, name: &str, header: &str, rows: &[String]) -> PathBuf {
        let path = dir.join(name);
        let mut text = String::from(header);
        for row in rows {
            text.push('\n');
            text.push_str(row);
        }
        text.push('\n');
        fs::write(&path, text).unwrap();
        path
    }

    pub const SOIL_HEADER: &str =
        "farm_id,clay_0-5cm_mean,nitrogen_0-5cm_mean,phh2o_0-5cm_mean,sand_0-5cm_mean,soc_0-5cm_mean,clay_5-15cm_mean";
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn duplicates_are_averaged_and_soil_joined() {
        let dir = tempfile::tempdir().unwrap();
        let bands = write(
            dir.path(),
            "bands.csv",
            BAND_HEADER,
            &[
                band_row("1", "2020-06-01", 3000.0, 1000.0, 0.5),
                band_row("1", "2020-06-01", 3200.0, 1200.0, 0.3),
                band_row("2", "2020-05-01T00:00:00", 2800.0, 1500.0, 0.2),
            ],
        );
        let soil = write(
            dir.path(),
            "soil.csv",
            SOIL_HEADER,
            &["1,250,180,65,400,120,999".to_string()],
        );

        let dataset = load_and_merge(&bands, &soil).unwrap();
        assert_eq!(dataset.observations.len(), 2);

        let first = &dataset.observations[0];
        assert_eq!(first.farm_id, "1");
        assert_eq!(first.bands.get(Band::Nir), 3100.0);
        assert_eq!(first.bands.get(Band::Red), 1100.0);
        assert!((first.ndvi - 0.4).abs() < 1e-12);
        assert_eq!(first.soil.nitrogen, 180.0);
        assert_eq!(first.bands.indices().evi, Some(0.5));

        let second = &dataset.observations[1];
        assert_eq!(second.date, NaiveDate::from_ymd_opt(2020, 5, 1).unwrap());
        assert!(second.soil.nitrogen.is_nan());
        assert_eq!(dataset.columns.soil_present, [true; 5]);
    }

    #[test]
    fn missing_band_column_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let bands = write(
            dir.path(),
            "bands.csv",
            "farm_id,date,B2,B3,B4",
            &["1,2020-01-01,1,2,3".to_string()],
        );
        match read_band_corpus(&bands) {
            Err(DatasetError::MissingColumn(column)) => assert_eq!(column, "B5"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bad_dates_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bands = write(
            dir.path(),
            "bands.csv",
            BAND_HEADER,
            &[band_row("1", "06/01/2020", 3000.0, 1000.0, 0.5)],
        );
        assert!(matches!(
            read_band_corpus(&bands),
            Err(DatasetError::InvalidDate { row: 1, .. })
        ));
    }

    #[test]
    fn most_recent_spans_farms() {
        let dir = tempfile::tempdir().unwrap();
        let bands = write(
            dir.path(),
            "bands.csv",
            BAND_HEADER,
            &[
                band_row("1", "2020-01-01", 1.0, 1.0, 0.0),
                band_row("2", "2021-03-01", 2.0, 1.0, 0.0),
                band_row("3", "2021-02-01", 3.0, 1.0, 0.0),
                band_row("1", "2019-12-01", 4.0, 1.0, 0.0),
            ],
        );
        let corpus = read_band_corpus(&bands).unwrap();
        let latest: Vec<_> = corpus
            .most_recent(2)
            .iter()
            .map(|o| o.farm_id.as_str())
            .collect();
        assert_eq!(latest, vec!["2", "3"]);
    }

    #[test]
    fn mean_skips_non_finite() {
        assert_eq!(mean_of_finite([1.0, f64::NAN, 3.0]), 2.0);
        assert!(mean_of_finite([f64::NAN]).is_nan());
    }

    #[test]
    fn first_soil_row_per_farm_wins() {
        let dir = tempfile::tempdir().unwrap();
        let soil = write(
            dir.path(),
            "soil.csv",
            SOIL_HEADER,
            &[
                "1,250,180,65,400,120,999".to_string(),
                "2,300,150,70,350,100,999".to_string(),
                "1,10,20,30,40,50,999".to_string(),
            ],
        );

        let corpus = read_soil_corpus(&soil).unwrap();
        assert_eq!(corpus.by_farm.len(), 2);
        assert_eq!(corpus.by_farm["1"], [250.0, 180.0, 65.0, 400.0, 120.0]);
        assert_eq!(corpus.by_farm["2"], [300.0, 150.0, 70.0, 350.0, 100.0]);
    }
}
