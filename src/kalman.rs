//! The manifold unscented Kalman filter engine.
//!
//! A classical additive-noise UKF generalised to states living on a manifold:
//! sigma points are spread with [`Manifold::boxplus`] along the columns of a
//! scaled covariance square root, and means are recombined with an iterated
//! re-mean over [`Manifold::boxminus`] lifts instead of a weighted vector
//! sum. Measurement spaces are manifolds as well, so sphere-valued bearing
//! observations go through the same machinery as plain vector measurements.
//!
//! The engine is generic in its state dimension, which lets the augmentation
//! protocol for visual updates instantiate it on a temporary product manifold
//! instead of maintaining a parallel filter type.

use std::fmt;

use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::linalg::{
    enforce_positive_semidefinite, matrix_square_root, robust_spd_solve, symmetrize,
};
use crate::{FilterError, Manifold};

/// Spread of the sigma points around the mean.
pub const DEFAULT_ALPHA: f64 = 1e-3;
/// Prior-distribution parameter; 2 is optimal for Gaussian priors.
pub const DEFAULT_BETA: f64 = 2.0;
/// Secondary scaling parameter.
pub const DEFAULT_KAPPA: f64 = 0.0;

/// Iteration cap of the manifold re-mean; vector blocks converge in one step.
const MAX_MEAN_ITERATIONS: usize = 20;
const MEAN_TOLERANCE: f64 = 1e-12;

/// Result of a measurement update.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UpdateOutcome {
    /// Mean and covariance were corrected with the measurement.
    Applied,
    /// The innovation failed its Mahalanobis gate; the state is unchanged.
    Rejected { mahalanobis_squared: f64 },
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied)
    }
}

/// Unscented Kalman Filter over a manifold-valued state.
///
/// The engine exclusively owns the mutable mean and covariance. Process and
/// measurement models are passed in as pure functions over the state; any
/// collaborators they need are bound by the caller.
#[derive(Clone)]
pub struct UnscentedKalmanFilter<S: Manifold> {
    mean: S,
    covariance: DMatrix<f64>,
    dof: usize,
    lambda: f64,
    weights_mean: DVector<f64>,
    weights_cov: DVector<f64>,
}

impl<S: Manifold + fmt::Debug> fmt::Debug for UnscentedKalmanFilter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnscentedKalmanFilter")
            .field("mean", &self.mean)
            .field("covariance", &self.covariance)
            .field("lambda", &self.lambda)
            .field("dof", &self.dof)
            .finish()
    }
}

impl<S: Manifold> UnscentedKalmanFilter<S> {
    pub fn new(
        mean: S,
        covariance: DMatrix<f64>,
        alpha: f64,
        beta: f64,
        kappa: f64,
    ) -> Result<Self, FilterError> {
        let dof = mean.dof();
        if covariance.nrows() != dof || covariance.ncols() != dof {
            return Err(FilterError::UnsupportedConfiguration(format!(
                "covariance is {}x{} for a state of dimension {dof}",
                covariance.nrows(),
                covariance.ncols()
            )));
        }
        if covariance.iter().any(|value| !value.is_finite()) {
            return Err(FilterError::UnsupportedConfiguration(
                "covariance contains non-finite values".into(),
            ));
        }
        let lambda = alpha * alpha * (dof as f64 + kappa) - dof as f64;
        let mut weights_mean = DVector::zeros(2 * dof + 1);
        let mut weights_cov = DVector::zeros(2 * dof + 1);
        weights_mean[0] = lambda / (dof as f64 + lambda);
        weights_cov[0] = weights_mean[0] + (1.0 - alpha * alpha + beta);
        for i in 1..(2 * dof + 1) {
            let weight = 1.0 / (2.0 * (dof as f64 + lambda));
            weights_mean[i] = weight;
            weights_cov[i] = weight;
        }
        Ok(UnscentedKalmanFilter {
            mean,
            covariance,
            dof,
            lambda,
            weights_mean,
            weights_cov,
        })
    }

    pub fn with_default_weights(mean: S, covariance: DMatrix<f64>) -> Result<Self, FilterError> {
        Self::new(mean, covariance, DEFAULT_ALPHA, DEFAULT_BETA, DEFAULT_KAPPA)
    }

    pub fn mean(&self) -> &S {
        &self.mean
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    /// Deterministic sigma points: the mean plus the mean retracted along
    /// ±columns of the scaled covariance square root.
    fn sigma_points(&self) -> Result<Vec<S>, FilterError> {
        let scaled = symmetrize(&((self.dof as f64 + self.lambda) * &self.covariance));
        let sqrt = matrix_square_root(&scaled)
            .ok_or(FilterError::NumericalFailure("sigma-point square root"))?;
        let mut points = Vec::with_capacity(2 * self.dof + 1);
        points.push(self.mean.clone());
        for i in 0..self.dof {
            points.push(self.mean.boxplus(&sqrt.column(i).clone_owned()));
        }
        for i in 0..self.dof {
            points.push(self.mean.boxplus(&(-sqrt.column(i).clone_owned())));
        }
        Ok(points)
    }

    /// Weighted mean of manifold points by iterated re-mean: lift all points
    /// into the tangent space at the current estimate, take the weighted
    /// tangent average, retract, repeat until the correction vanishes.
    fn weighted_mean<M: Manifold>(points: &[M], weights: &DVector<f64>) -> M {
        let mut mean = points[0].clone();
        for _ in 0..MAX_MEAN_ITERATIONS {
            let mut correction = DVector::zeros(mean.dof());
            for (point, weight) in points.iter().zip(weights.iter()) {
                correction += *weight * point.boxminus(&mean);
            }
            mean = mean.boxplus(&correction);
            if correction.norm() < MEAN_TOLERANCE {
                break;
            }
        }
        mean
    }

    /// Propagates the state through the process model and adds the (already
    /// discretised) process noise.
    ///
    /// On a numerical failure the state is left untouched, but the caller
    /// must treat the failure as fatal for the filter instance: the
    /// covariance no longer reflects the propagated state.
    pub fn predict<F>(&mut self, process: F, process_noise: &DMatrix<f64>) -> Result<(), FilterError>
    where
        F: Fn(&S) -> S,
    {
        if process_noise.nrows() != self.dof || process_noise.ncols() != self.dof {
            return Err(FilterError::UnsupportedConfiguration(format!(
                "process noise is {}x{} for a state of dimension {}",
                process_noise.nrows(),
                process_noise.ncols(),
                self.dof
            )));
        }
        let points: Vec<S> = self.sigma_points()?.iter().map(|point| process(point)).collect();
        let mean = Self::weighted_mean(&points, &self.weights_mean);
        let mut covariance = process_noise.clone();
        for (point, weight) in points.iter().zip(self.weights_cov.iter()) {
            let residual = point.boxminus(&mean);
            covariance += *weight * &residual * residual.transpose();
        }
        let covariance = enforce_positive_semidefinite(&symmetrize(&covariance));
        if covariance.iter().any(|value| !value.is_finite()) {
            return Err(FilterError::NumericalFailure("predicted covariance"));
        }
        self.mean = mean;
        self.covariance = covariance;
        Ok(())
    }

    /// Applies one measurement through the observation model `observe`.
    ///
    /// When `gate` is set, the squared Mahalanobis distance of the innovation
    /// is tested against it before the state is touched; a failed test
    /// reports [`UpdateOutcome::Rejected`] and leaves mean and covariance
    /// unchanged. Numerical failures likewise leave the state untouched.
    pub fn update<Z, H>(
        &mut self,
        measurement: &Z,
        noise: &DMatrix<f64>,
        observe: H,
        gate: Option<f64>,
    ) -> Result<UpdateOutcome, FilterError>
    where
        Z: Manifold,
        H: Fn(&S) -> Z,
    {
        let dimension = measurement.dof();
        if noise.nrows() != dimension || noise.ncols() != dimension {
            return Err(FilterError::InvalidMeasurement(format!(
                "noise is {}x{} for a measurement of dimension {dimension}",
                noise.nrows(),
                noise.ncols()
            )));
        }
        let points = self.sigma_points()?;
        let predicted: Vec<Z> = points.iter().map(|point| observe(point)).collect();
        let predicted_mean = Self::weighted_mean(&predicted, &self.weights_mean);

        let mut innovation_covariance = noise.clone();
        let mut cross_covariance = DMatrix::zeros(self.dof, dimension);
        for ((point, observation), weight) in
            points.iter().zip(&predicted).zip(self.weights_cov.iter())
        {
            let observation_residual = observation.boxminus(&predicted_mean);
            let state_residual = point.boxminus(&self.mean);
            innovation_covariance += *weight * &observation_residual * observation_residual.transpose();
            cross_covariance += *weight * &state_residual * observation_residual.transpose();
        }
        let innovation_covariance = symmetrize(&innovation_covariance);

        let innovation = measurement.boxminus(&predicted_mean);
        let innovation_column =
            DMatrix::from_column_slice(dimension, 1, innovation.as_slice());
        let weighted_innovation = robust_spd_solve(&innovation_covariance, &innovation_column)
            .ok_or(FilterError::NumericalFailure("innovation covariance solve"))?;
        let mahalanobis_squared = (innovation.transpose() * &weighted_innovation)[(0, 0)];
        if !mahalanobis_squared.is_finite() {
            return Err(FilterError::NumericalFailure("mahalanobis distance"));
        }
        if let Some(threshold) = gate {
            if mahalanobis_squared > threshold {
                debug!(
                    "innovation gate rejected measurement: d2 = {mahalanobis_squared:.3} > {threshold:.3}"
                );
                return Ok(UpdateOutcome::Rejected { mahalanobis_squared });
            }
        }

        let gain = robust_spd_solve(&innovation_covariance, &cross_covariance.transpose())
            .ok_or(FilterError::NumericalFailure("kalman gain solve"))?
            .transpose();
        let correction = &gain * &innovation;
        let mean = self.mean.boxplus(&correction);
        let covariance = enforce_positive_semidefinite(&symmetrize(
            &(&self.covariance - &gain * &innovation_covariance * gain.transpose()),
        ));
        if covariance.iter().any(|value| !value.is_finite())
            || correction.iter().any(|value| !value.is_finite())
        {
            return Err(FilterError::NumericalFailure("updated covariance"));
        }
        self.mean = mean;
        self.covariance = covariance;
        Ok(UpdateOutcome::Applied)
    }
}
