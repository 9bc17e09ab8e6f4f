//! The standardization and regression contract consumed by the service, and the
//! reference implementations the training run fits.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

pub trait FeatureScaler: Send + Sync {
    fn transform(&self, row: &[f64]) -> Result<Vec<f64>, ModelError>;
}

pub trait NdviRegressor: Send + Sync {
    fn predict(&self, row: &[f64]) -> Result<f64, ModelError>;

    /// Number of features the model was fitted on.
    fn n_features(&self) -> usize;
}

fn check_width(expected: usize, actual: usize) -> Result<(), ModelError> {
    if expected == actual {
        Ok(())
    } else {
        Err(ModelError::DimensionMismatch { expected, actual })
    }
}

/// Zero-mean, unit-variance scaling per column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    means: Vec<f64>,
    scales: Vec<f64>,
}

impl StandardScaler {
    /// Columns without variance get a scale of 1 so they map to 0.
    pub fn fit(records: ArrayView2<f64>) -> Result<Self, ModelError> {
        if records.nrows() == 0 {
            return Err(ModelError::EmptyTrainingSet);
        }
        let means = records
            .mean_axis(Axis(0))
            .ok_or(ModelError::EmptyTrainingSet)?;
        let scales = records
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > 0.0 && s.is_finite() { s } else { 1.0 });
        Ok(Self {
            means: means.to_vec(),
            scales: scales.to_vec(),
        })
    }

    pub fn transform_matrix(&self, records: ArrayView2<f64>) -> Result<Array2<f64>, ModelError> {
        check_width(self.means.len(), records.ncols())?;
        let means = ArrayView1::from(&self.means[..]);
        let scales = ArrayView1::from(&self.scales[..]);
        Ok((&records - &means) / &scales)
    }
}

impl FeatureScaler for StandardScaler {
    fn transform(&self, row: &[f64]) -> Result<Vec<f64>, ModelError> {
        check_width(self.means.len(), row.len())?;
        Ok(row
            .iter()
            .zip(self.means.iter().zip(&self.scales))
            .map(|(value, (mean, scale))| (value - mean) / scale)
            .collect())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainerParams {
    pub iterations: usize,
    pub l2_penalty: f64,
}

impl Default for TrainerParams {
    fn default() -> Self {
        Self {
            iterations: 3000,
            l2_penalty: 1e-3,
        }
    }
}

/// Ridge-penalized linear regression on standardized features.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearNdviModel {
    intercept: f64,
    coefficients: Vec<f64>,
}

impl LinearNdviModel {
    pub fn new(intercept: f64, coefficients: Vec<f64>) -> Self {
        Self {
            intercept,
            coefficients,
        }
    }

    /// Full-batch gradient descent. With standardized inputs the largest curvature is
    /// bounded by the column count, so a step of `1 / n_features` always converges,
    /// including on collinear or constant columns where the normal equations are singular.
    pub fn fit(
        records: ArrayView2<f64>,
        targets: ArrayView1<f64>,
        params: TrainerParams,
    ) -> Result<Self, ModelError> {
        let (rows, cols) = records.dim();
        if rows == 0 || cols == 0 {
            return Err(ModelError::EmptyTrainingSet);
        }
        if targets.len() != rows {
            return Err(ModelError::TargetMismatch {
                rows,
                targets: targets.len(),
            });
        }

        let n = rows as f64;
        let step = 1.0 / cols.max(1) as f64;
        let mut weights = Array1::<f64>::zeros(cols);
        let mut intercept = targets.mean().unwrap_or(0.0);

        for _ in 0..params.iterations {
            let residuals = records.dot(&weights) + intercept - &targets;
            let gradient = records.t().dot(&residuals) / n + &weights * params.l2_penalty;
            weights.scaled_add(-step, &gradient);
            intercept -= step * residuals.sum() / n;
        }

        Ok(Self {
            intercept,
            coefficients: weights.to_vec(),
        })
    }

    pub fn predict_matrix(&self, records: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        check_width(self.coefficients.len(), records.ncols())?;
        Ok(records.dot(&ArrayView1::from(&self.coefficients[..])) + self.intercept)
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    /// Absolute coefficients normalized to sum to 1.
    pub fn importances(&self) -> Vec<f64> {
        let total: f64 = self.coefficients.iter().map(|c| c.abs()).sum();
        self.coefficients
            .iter()
            .map(|c| if total > 0.0 { c.abs() / total } else { 0.0 })
            .collect()
    }
}

impl NdviRegressor for LinearNdviModel {
    fn predict(&self, row: &[f64]) -> Result<f64, ModelError> {
        check_width(self.coefficients.len(), row.len())?;
        Ok(self.intercept
            + row
                .iter()
                .zip(&self.coefficients)
                .map(|(x, w)| x * w)
                .sum::<f64>())
    }

    fn n_features(&self) -> usize {
        self.coefficients.len()
    }
}
