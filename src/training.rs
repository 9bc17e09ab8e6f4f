//! Turns the merged historical corpus into a training matrix and fits the model.
//!
//! Rows go through the same [`FeatureRow::compute`] as live samples. Training knows the
//! exact acquisition date and the measured NDVI, so it passes [`TemporalInput::Date`]
//! and [`InteractionNdvi::GroundTruth`]; the resulting skew is recorded in the model
//! metadata.

use std::{
    path::Path,
    sync::{mpsc, Arc},
    time::Instant,
};

use chrono::Utc;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use threadpool::ThreadPool;
use tracing::{debug, info};

use crate::artifacts::{self, ArtifactStore, ModelMetadata, TrainingMetrics, TOP_FEATURE_COUNT};
use crate::error::{DatasetError, TrainingError};
use crate::feature_transform::{
    natural_columns, FeatureInputs, FeatureRow, InteractionNdvi, TemporalInput, INDEX_COLUMNS,
    INTERACTION_COLUMN, SOIL_COLUMNS,
};
use crate::historical::{self, CorpusColumns, MergedDataset, MergedObservation, TARGET_COLUMN};
use crate::model::{LinearNdviModel, NdviRegressor, StandardScaler, TrainerParams};

pub const SPLIT_SEED: u64 = 42;
/// One row in five is held out for testing, rounded up.
pub const TEST_SPLIT_DENOMINATOR: usize = 5;
pub const CV_FOLDS: usize = 5;

pub const INTERACTION_NDVI_SOURCE: &str = "ground_truth";
pub const DAY_OF_YEAR_SOURCE: &str = "date";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RunMode {
    SingleThreaded,
    #[default]
    Parallel,
}

/// Feature matrix, targets and the column names that become the schema.
#[derive(Clone, Debug)]
pub struct TrainingSet {
    pub records: Array2<f64>,
    pub targets: Array1<f64>,
    pub columns: Vec<String>,
}

/// Columns the corpus cannot populate and which are therefore left out of the schema.
pub fn excluded_columns(columns: &CorpusColumns) -> Vec<&'static str> {
    let mut excluded = Vec::new();
    for (name, present) in INDEX_COLUMNS.iter().zip(columns.indices_present) {
        if !present {
            excluded.push(*name);
        }
    }
    for (name, present) in SOIL_COLUMNS.iter().zip(columns.soil_present) {
        if !present {
            excluded.push(*name);
        }
    }
    // nitrogen is the second soil column
    if !columns.soil_present[1] {
        excluded.push(INTERACTION_COLUMN);
    }
    excluded
}

/// Features of one corpus observation, before any column exclusion.
pub fn training_row(observation: &MergedObservation) -> FeatureRow {
    FeatureRow::compute(&FeatureInputs {
        bands: &observation.bands,
        soil: Some(&observation.soil),
        temporal: TemporalInput::Date(observation.date),
        interaction_ndvi: InteractionNdvi::GroundTruth(observation.ndvi),
    })
}

fn row_values(observation: &MergedObservation, excluded: &[&str]) -> Vec<f64> {
    training_row(observation)
        .without(excluded)
        .align(None)
        .into_values()
}

/// Builds the training matrix. Row order always follows `dataset.observations`.
pub fn extract(run_mode: RunMode, dataset: &MergedDataset) -> Result<TrainingSet, TrainingError> {
    if !dataset.columns.has_ndvi {
        return Err(DatasetError::MissingColumn(TARGET_COLUMN.to_string()).into());
    }
    let excluded = excluded_columns(&dataset.columns);
    let columns: Vec<String> = natural_columns()
        .into_iter()
        .filter(|column| !excluded.contains(column))
        .map(str::to_string)
        .collect();

    let rows: Vec<Vec<f64>> = match run_mode {
        RunMode::SingleThreaded => dataset
            .observations
            .iter()
            .map(|observation| row_values(observation, &excluded))
            .collect(),
        RunMode::Parallel => extract_parallel(&dataset.observations, excluded),
    };

    let n_rows = rows.len();
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    let records = Array2::from_shape_vec((n_rows, columns.len()), flat)?;
    let targets = dataset
        .observations
        .iter()
        .map(|o| if o.ndvi.is_finite() { o.ndvi } else { 0.0 })
        .collect();

    Ok(TrainingSet {
        records,
        targets,
        columns,
    })
}

fn extract_parallel(observations: &[MergedObservation], excluded: Vec<&'static str>) -> Vec<Vec<f64>> {
    let num_threads = num_cpus::get().max(1);
    debug!(num_threads, "Extracting training features in parallel");
    let thread_pool = ThreadPool::new(num_threads);
    let chunk_size = observations.len().div_ceil(num_threads).max(1);
    let excluded = Arc::new(excluded);

    let (sender, receiver) = mpsc::channel::<(usize, Vec<Vec<f64>>)>();
    for (chunk_index, chunk) in observations.chunks(chunk_size).enumerate() {
        let chunk = chunk.to_vec();
        let excluded = excluded.clone();
        let sender = sender.clone();
        thread_pool.execute(move || {
            let rows = chunk.iter().map(|o| row_values(o, &excluded)).collect();
            // The receiver outlives every job.
            let _ = sender.send((chunk_index, rows));
        });
    }
    drop(sender);

    let mut chunks: Vec<(usize, Vec<Vec<f64>>)> = receiver.iter().collect();
    chunks.sort_by_key(|(chunk_index, _)| *chunk_index);
    chunks.into_iter().flat_map(|(_, rows)| rows).collect()
}

pub fn r2_score(truth: ArrayView1<f64>, predicted: ArrayView1<f64>) -> f64 {
    let mean = truth.mean().unwrap_or(0.0);
    let ss_res: f64 = truth
        .iter()
        .zip(predicted)
        .map(|(t, p)| (t - p).powi(2))
        .sum();
    let ss_tot: f64 = truth.iter().map(|t| (t - mean).powi(2)).sum();
    if ss_tot == 0.0 {
        if ss_res == 0.0 {
            1.0
        } else {
            0.0
        }
    } else {
        1.0 - ss_res / ss_tot
    }
}

pub fn rmse(truth: ArrayView1<f64>, predicted: ArrayView1<f64>) -> f64 {
    (&truth - &predicted).mapv(|e| e * e).mean().unwrap_or(0.0).sqrt()
}

pub fn mae(truth: ArrayView1<f64>, predicted: ArrayView1<f64>) -> f64 {
    (&truth - &predicted).mapv(f64::abs).mean().unwrap_or(0.0)
}

/// Contiguous, unshuffled folds; the first `n % folds` folds get one extra row.
fn fold_ranges(n: usize, folds: usize) -> Vec<std::ops::Range<usize>> {
    let mut ranges = Vec::with_capacity(folds);
    let mut start = 0;
    for fold in 0..folds {
        let size = n / folds + usize::from(fold < n % folds);
        ranges.push(start..start + size);
        start += size;
    }
    ranges
}

/// R² of every fold when the model is fitted on the remaining folds.
pub fn cross_validate(
    records: ArrayView2<f64>,
    targets: ArrayView1<f64>,
    folds: usize,
    params: TrainerParams,
) -> Result<Vec<f64>, TrainingError> {
    let n = records.nrows();
    let mut scores = Vec::with_capacity(folds);
    for range in fold_ranges(n, folds) {
        let held_out: Vec<usize> = range.clone().collect();
        let kept: Vec<usize> = (0..n).filter(|i| !range.contains(i)).collect();
        let model = LinearNdviModel::fit(
            records.select(Axis(0), &kept).view(),
            targets.select(Axis(0), &kept).view(),
            params,
        )?;
        let predicted = model.predict_matrix(records.select(Axis(0), &held_out).view())?;
        scores.push(r2_score(
            targets.select(Axis(0), &held_out).view(),
            predicted.view(),
        ));
    }
    Ok(scores)
}

fn mean_and_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

#[derive(Clone, Copy, Debug)]
pub struct TrainingOptions {
    pub run_mode: RunMode,
    pub params: TrainerParams,
    pub seed: u64,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            run_mode: RunMode::default(),
            params: TrainerParams::default(),
            seed: SPLIT_SEED,
        }
    }
}

/// A fitted scaler/model pair with its evaluation.
pub struct FittedModel {
    pub scaler: StandardScaler,
    pub model: LinearNdviModel,
    pub metrics: TrainingMetrics,
    pub n_train: usize,
    pub n_test: usize,
}

pub fn fit(set: &TrainingSet, options: &TrainingOptions) -> Result<FittedModel, TrainingError> {
    let n = set.records.nrows();
    if n < CV_FOLDS {
        return Err(TrainingError::NotEnoughObservations {
            required: CV_FOLDS,
            found: n,
        });
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut StdRng::seed_from_u64(options.seed));
    let n_test = n.div_ceil(TEST_SPLIT_DENOMINATOR);
    let (test_idx, train_idx) = order.split_at(n_test);

    let x_train = set.records.select(Axis(0), train_idx);
    let y_train = set.targets.select(Axis(0), train_idx);
    let x_test = set.records.select(Axis(0), test_idx);
    let y_test = set.targets.select(Axis(0), test_idx);

    let scaler = StandardScaler::fit(x_train.view())?;
    let x_train = scaler.transform_matrix(x_train.view())?;
    let x_test = scaler.transform_matrix(x_test.view())?;

    let start = Instant::now();
    let model = LinearNdviModel::fit(x_train.view(), y_train.view(), options.params)?;
    debug!(elapsed = ?start.elapsed(), features = model.n_features(), "Regressor fitted");

    let train_pred = model.predict_matrix(x_train.view())?;
    let test_pred = model.predict_matrix(x_test.view())?;

    let scaled_all = scaler.transform_matrix(set.records.view())?;
    let cv = cross_validate(scaled_all.view(), set.targets.view(), CV_FOLDS, options.params)?;
    let (cv_r2_mean, cv_r2_std) = mean_and_std(&cv);

    let metrics = TrainingMetrics {
        train_r2: r2_score(y_train.view(), train_pred.view()),
        test_r2: r2_score(y_test.view(), test_pred.view()),
        test_rmse: rmse(y_test.view(), test_pred.view()),
        test_mae: mae(y_test.view(), test_pred.view()),
        cv_r2_mean,
        cv_r2_std,
    };

    Ok(FittedModel {
        scaler,
        model,
        metrics,
        n_train: train_idx.len(),
        n_test,
    })
}

/// Loads the corpus, fits the model and writes every artifact into `model_dir`.
pub fn train(
    bands_csv: &Path,
    soil_csv: &Path,
    model_dir: &Path,
    options: &TrainingOptions,
) -> Result<ModelMetadata, TrainingError> {
    let start = Instant::now();
    let dataset = historical::load_and_merge(bands_csv, soil_csv)?;
    info!(
        observations = dataset.observations.len(),
        "Loaded historical corpus"
    );

    let set = extract(options.run_mode, &dataset)?;
    debug!(elapsed = ?start.elapsed(), features = set.columns.len(), "Features extracted");

    let fitted = fit(&set, options)?;
    let metrics = fitted.metrics.rounded();

    let store = ArtifactStore::new(model_dir);
    store.save_model(&fitted.model)?;
    store.save_scaler(&fitted.scaler)?;
    let schema = store.schema_registry().create(set.columns.clone())?;

    let metadata = ModelMetadata {
        target: TARGET_COLUMN.to_string(),
        n_features: schema.len(),
        feature_columns: schema.columns().to_vec(),
        n_train_samples: fitted.n_train,
        n_test_samples: fitted.n_test,
        top_features: artifacts::top_features(
            schema.columns(),
            &fitted.model.importances(),
            TOP_FEATURE_COUNT,
        ),
        metrics,
        trainer_params: options.params,
        interaction_ndvi_source: INTERACTION_NDVI_SOURCE.to_string(),
        day_of_year_source: DAY_OF_YEAR_SOURCE.to_string(),
        trained_at: Utc::now(),
    };
    store.save_metadata(&metadata)?;

    info!(
        train_r2 = metadata.metrics.train_r2,
        test_r2 = metadata.metrics.test_r2,
        test_rmse = metadata.metrics.test_rmse,
        cv_r2_mean = metadata.metrics.cv_r2_mean,
        elapsed = ?start.elapsed(),
        dir = %model_dir.display(),
        "Model trained"
    );
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bands::{Band, BandSample, SoilSample};
    use crate::feature_schema::FeatureSchema;
    use crate::feature_transform::{band_ndvi, prepare_prediction_input, NUM_FEATURES};
    use crate::historical::fixtures::{band_row, write, BAND_HEADER, SOIL_HEADER};
    use chrono::NaiveDate;
    use ndarray::array;

    fn observation(farm: &str, date: NaiveDate, nir: f64, red: f64, ndvi: f64) -> MergedObservation {
        MergedObservation {
            farm_id: farm.to_string(),
            date,
            bands: BandSample::from_lookup(|band| match band {
                Band::Red => Some(red),
                Band::Nir => Some(nir),
                _ => Some(1000.0),
            }),
            ndvi,
            soil: SoilSample {
                clay: 250.0,
                nitrogen: 180.0,
                ph: 65.0,
                sand: 400.0,
                soc: 120.0,
            },
        }
    }

    fn dataset(observations: Vec<MergedObservation>, columns: CorpusColumns) -> MergedDataset {
        MergedDataset {
            observations,
            columns,
        }
    }

    const FULL: CorpusColumns = CorpusColumns {
        has_ndvi: true,
        indices_present: [true; 3],
        soil_present: [true; 5],
    };

    fn synthetic_observations(n: usize) -> Vec<MergedObservation> {
        let start = NaiveDate::from_ymd_opt(2022, 1, 1).unwrap();
        (0..n)
            .map(|i| {
                let red = 800.0 + 37.0 * (i % 11) as f64;
                let nir = 2400.0 + 53.0 * (i % 7) as f64;
                let ndvi = (nir - red) / (nir + red);
                let date = start + chrono::Days::new(9 * i as u64);
                observation(&format!("{}", i % 3), date, nir, red, ndvi)
            })
            .collect()
    }

    #[test]
    fn complete_corpus_keeps_natural_order() {
        let set = extract(
            RunMode::SingleThreaded,
            &dataset(synthetic_observations(3), FULL),
        )
        .unwrap();
        assert_eq!(set.columns, natural_columns());
        assert_eq!(set.records.dim(), (3, NUM_FEATURES));
    }

    #[test]
    fn absent_columns_leave_the_schema() {
        let columns = CorpusColumns {
            has_ndvi: true,
            indices_present: [true, false, true],
            soil_present: [true, false, true, true, true],
        };
        let set = extract(
            RunMode::SingleThreaded,
            &dataset(synthetic_observations(2), columns),
        )
        .unwrap();
        assert!(!set.columns.iter().any(|c| c == "NDWI"));
        assert!(!set.columns.iter().any(|c| c == "nitrogen"));
        assert!(!set.columns.iter().any(|c| c == INTERACTION_COLUMN));
        assert_eq!(set.columns.len(), NUM_FEATURES - 3);
        assert_eq!(set.records.ncols(), set.columns.len());
    }

    #[test]
    fn target_column_is_required() {
        let columns = CorpusColumns {
            has_ndvi: false,
            ..FULL
        };
        assert!(matches!(
            extract(RunMode::SingleThreaded, &dataset(synthetic_observations(2), columns)),
            Err(TrainingError::Dataset(DatasetError::MissingColumn(_)))
        ));
    }

    #[test]
    fn parallel_extraction_preserves_order() {
        let data = dataset(synthetic_observations(97), FULL);
        let single = extract(RunMode::SingleThreaded, &data).unwrap();
        let parallel = extract(RunMode::Parallel, &data).unwrap();
        assert_eq!(single.records, parallel.records);
        assert_eq!(single.targets, parallel.targets);
    }

    #[test]
    fn nan_target_becomes_zero() {
        let mut observations = synthetic_observations(2);
        observations[1].ndvi = f64::NAN;
        let set = extract(RunMode::SingleThreaded, &dataset(observations, FULL)).unwrap();
        assert_eq!(set.targets[1], 0.0);
        assert!(set.records.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn training_and_inference_rows_agree_when_inputs_coincide() {
        // 2023-05-30 is day 150 == 5 * 30, and the measured NDVI equals the band estimate.
        let date = NaiveDate::from_ymd_opt(2023, 5, 30).unwrap();
        let mut obs = observation("7", date, 3200.0, 1500.0, 0.0);
        obs.ndvi = band_ndvi(&obs.bands);

        let schema = FeatureSchema::for_tests(&natural_columns());
        let trained = training_row(&obs).align(Some(&schema));
        let served = prepare_prediction_input(&obs.bands, Some(&obs.soil), 5, Some(&schema));
        assert_eq!(trained, served);
    }

    #[test]
    fn metrics_match_hand_computation() {
        let truth = array![1.0, 2.0, 3.0];
        let predicted = array![1.0, 2.0, 4.0];
        assert!((r2_score(truth.view(), predicted.view()) - 0.5).abs() < 1e-12);
        assert!((rmse(truth.view(), predicted.view()) - (1.0f64 / 3.0).sqrt()).abs() < 1e-12);
        assert!((mae(truth.view(), predicted.view()) - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(r2_score(array![2.0, 2.0].view(), array![2.0, 2.0].view()), 1.0);
    }

    #[test]
    fn folds_cover_every_row_once() {
        let ranges = fold_ranges(12, CV_FOLDS);
        let sizes: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
        assert_eq!(sizes, vec![3, 3, 2, 2, 2]);
        assert_eq!(ranges.last().unwrap().end, 12);
    }

    #[test]
    fn fit_splits_and_evaluates() {
        let set = extract(
            RunMode::SingleThreaded,
            &dataset(synthetic_observations(40), FULL),
        )
        .unwrap();
        let fitted = fit(&set, &TrainingOptions::default()).unwrap();
        assert_eq!(fitted.n_test, 8);
        assert_eq!(fitted.n_train, 32);
        assert!(fitted.metrics.train_r2 > 0.8, "{:?}", fitted.metrics);
        assert!(fitted.metrics.test_rmse.is_finite());
    }

    #[test]
    fn too_few_observations_are_rejected() {
        let set = extract(
            RunMode::SingleThreaded,
            &dataset(synthetic_observations(3), FULL),
        )
        .unwrap();
        assert!(matches!(
            fit(&set, &TrainingOptions::default()),
            Err(TrainingError::NotEnoughObservations { found: 3, .. })
        ));
    }

    #[test]
    fn train_writes_all_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let rows: Vec<String> = (0..30)
            .map(|i| {
                let red = 900.0 + 31.0 * (i % 9) as f64;
                let nir = 2500.0 + 47.0 * (i % 5) as f64;
                let ndvi = (nir - red) / (nir + red);
                let date = format!("2021-{:02}-{:02}", 1 + i % 12, 1 + i % 28);
                band_row(&format!("{}", i % 4), &date, nir, red, ndvi)
            })
            .collect();
        let bands = write(dir.path(), "bands.csv", BAND_HEADER, &rows);
        let soil = write(
            dir.path(),
            "soil.csv",
            SOIL_HEADER,
            &[
                "0,250,180,65,400,120,1".to_string(),
                "1,260,170,66,390,110,1".to_string(),
                "2,240,190,64,410,130,1".to_string(),
            ],
        );
        let model_dir = dir.path().join("model");

        let options = TrainingOptions {
            run_mode: RunMode::SingleThreaded,
            ..TrainingOptions::default()
        };
        let metadata = train(&bands, &soil, &model_dir, &options).unwrap();
        assert_eq!(metadata.n_features, NUM_FEATURES);
        assert_eq!(metadata.n_train_samples + metadata.n_test_samples, 30);
        assert_eq!(metadata.interaction_ndvi_source, INTERACTION_NDVI_SOURCE);
        assert!(metadata.top_features.len() <= TOP_FEATURE_COUNT);

        let store = ArtifactStore::new(&model_dir);
        assert!(store.load_model().unwrap().is_some());
        assert!(store.load_scaler().unwrap().is_some());
        let loaded = store.load_metadata().unwrap().unwrap();
        assert_eq!(loaded.feature_columns, metadata.feature_columns);
        assert_eq!(loaded.day_of_year_source, DAY_OF_YEAR_SOURCE);
        let schema = store.schema_registry().load().unwrap().unwrap();
        assert_eq!(schema.columns(), metadata.feature_columns.as_slice());
    }
}
