//! Hydrodynamic motion model of the vehicle.
//!
//! Two effort predictors live here. [`UwvModelParameters::efforts`] is the
//! standard rigid-body AUV model `M·a + (Dl + Dq·diag|v|)·v − g(q)` with the
//! planar+yaw blocks of the inertia and damping matrices replaceable by the
//! on-line estimated parameter sub-states. [`SvrThreeDofModel`] is a trained
//! support-vector regressor predicting the surge, sway and yaw efforts from
//! the planar motion; when configured it overrides those components of the
//! physics model. The regressor is a black box to the filter: it is built
//! once from a fixed bundle of named parameter blocks and construction fails
//! if any block is missing or mis-sized.

use nalgebra::{Matrix3, Matrix6, UnitQuaternion, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use crate::FilterError;

/// Degrees of freedom covered by the on-line parameter blocks: surge, sway
/// and yaw.
const PLANAR_AXES: [usize; 3] = [0, 1, 5];

/// Static parameters of the rigid-body AUV model.
///
/// Matrices are 6×6 over `[u, v, w, p, q, r]` body-frame velocities. Weight
/// and buoyancy are forces in newtons; the centres of gravity and buoyancy
/// are expressed in the body frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UwvModelParameters {
    pub inertia_matrix: Matrix6<f64>,
    pub lin_damping_matrix: Matrix6<f64>,
    pub quad_damping_matrix: Matrix6<f64>,
    pub weight: f64,
    pub buoyancy: f64,
    pub centre_of_gravity: Vector3<f64>,
    pub centre_of_buoyancy: Vector3<f64>,
}

impl Default for UwvModelParameters {
    fn default() -> Self {
        UwvModelParameters {
            inertia_matrix: Matrix6::identity(),
            lin_damping_matrix: Matrix6::zeros(),
            quad_damping_matrix: Matrix6::zeros(),
            weight: 0.0,
            buoyancy: 0.0,
            centre_of_gravity: Vector3::zeros(),
            centre_of_buoyancy: Vector3::zeros(),
        }
    }
}

impl UwvModelParameters {
    pub fn validate(&self) -> Result<(), FilterError> {
        let finite = self.inertia_matrix.iter().all(|v| v.is_finite())
            && self.lin_damping_matrix.iter().all(|v| v.is_finite())
            && self.quad_damping_matrix.iter().all(|v| v.is_finite())
            && self.weight.is_finite()
            && self.buoyancy.is_finite()
            && self.centre_of_gravity.iter().all(|v| v.is_finite())
            && self.centre_of_buoyancy.iter().all(|v| v.is_finite());
        if !finite {
            return Err(FilterError::UnsupportedConfiguration(
                "dynamic model parameters contain non-finite values".into(),
            ));
        }
        Ok(())
    }

    /// Returns a copy with the planar+yaw blocks (rows and columns 0, 1 and
    /// 5) of the inertia and damping matrices replaced by the given 3×3
    /// blocks, as estimated on-line by the filter.
    pub fn with_planar_blocks(
        &self,
        inertia: &Matrix3<f64>,
        lin_damping: &Matrix3<f64>,
        quad_damping: &Matrix3<f64>,
    ) -> UwvModelParameters {
        let mut parameters = self.clone();
        overwrite_planar_block(&mut parameters.inertia_matrix, inertia);
        overwrite_planar_block(&mut parameters.lin_damping_matrix, lin_damping);
        overwrite_planar_block(&mut parameters.quad_damping_matrix, quad_damping);
        parameters
    }

    /// Forces and torques required to produce the given body-frame
    /// acceleration at the given body-frame velocity:
    /// `M·a + (Dl + Dq·diag|v|)·v − g(orientation)`.
    pub fn efforts(
        &self,
        acceleration: &Vector6<f64>,
        velocity: &Vector6<f64>,
        orientation: &UnitQuaternion<f64>,
    ) -> Vector6<f64> {
        let damping =
            self.lin_damping_matrix + self.quad_damping_matrix * Matrix6::from_diagonal(&velocity.abs());
        self.inertia_matrix * acceleration + damping * velocity - self.restoring_efforts(orientation)
    }

    /// Hydrostatic restoring forces and torques in the body frame. Zero for a
    /// neutrally buoyant vehicle with coincident centres.
    fn restoring_efforts(&self, orientation: &UnitQuaternion<f64>) -> Vector6<f64> {
        let up_body = orientation.inverse_transform_vector(&Vector3::z());
        let force = (self.buoyancy - self.weight) * up_body;
        let torque = self.centre_of_gravity.cross(&(-self.weight * up_body))
            + self.centre_of_buoyancy.cross(&(self.buoyancy * up_body));
        let mut efforts = Vector6::zeros();
        efforts.fixed_rows_mut::<3>(0).copy_from(&force);
        efforts.fixed_rows_mut::<3>(3).copy_from(&torque);
        efforts
    }
}

fn overwrite_planar_block(target: &mut Matrix6<f64>, block: &Matrix3<f64>) {
    for (block_row, &row) in PLANAR_AXES.iter().enumerate() {
        for (block_column, &column) in PLANAR_AXES.iter().enumerate() {
            target[(row, column)] = block[(block_row, block_column)];
        }
    }
}

/// Input scaler of the learned predictor: per-component mean and scale over
/// the six inputs `[v_x, v_y, ω_z, a_x, a_y, α_z]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScalerParameters {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

/// Per-axis support-vector coefficients.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SvrParameters {
    pub gamma: f64,
    pub intercept: f64,
    pub dual_coefficients: Vec<f64>,
}

/// Per-axis output denormalisation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputScaling {
    pub mean: f64,
    pub scale: f64,
}

/// The fixed, named bundle of parameter blocks identifying a trained
/// three-degree-of-freedom effort regressor. Deserialization fails when a
/// block is absent, which is surfaced at construction rather than at runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SvrModelBundle {
    pub scaler_params: ScalerParameters,
    pub params_x: SvrParameters,
    pub params_y: SvrParameters,
    pub params_yaw: SvrParameters,
    pub s_x: Vec<[f64; 6]>,
    pub s_y: Vec<[f64; 6]>,
    pub s_yaw: Vec<[f64; 6]>,
    pub fitout_x: OutputScaling,
    pub fitout_y: OutputScaling,
    pub fitout_yaw: OutputScaling,
}

#[derive(Clone, Debug)]
struct SvrAxis {
    support_vectors: Vec<Vector6<f64>>,
    dual_coefficients: Vec<f64>,
    gamma: f64,
    intercept: f64,
    output: OutputScaling,
}

impl SvrAxis {
    fn new(
        name: &str,
        parameters: SvrParameters,
        support_vectors: Vec<[f64; 6]>,
        output: OutputScaling,
    ) -> Result<Self, FilterError> {
        if support_vectors.is_empty() {
            return Err(FilterError::UnsupportedConfiguration(format!(
                "effort predictor axis {name} has no support vectors"
            )));
        }
        if parameters.dual_coefficients.len() != support_vectors.len() {
            return Err(FilterError::UnsupportedConfiguration(format!(
                "effort predictor axis {name}: {} dual coefficients for {} support vectors",
                parameters.dual_coefficients.len(),
                support_vectors.len()
            )));
        }
        if !parameters.gamma.is_finite() || parameters.gamma <= 0.0 {
            return Err(FilterError::UnsupportedConfiguration(format!(
                "effort predictor axis {name} has invalid kernel width {}",
                parameters.gamma
            )));
        }
        if !output.mean.is_finite() || !output.scale.is_finite() || output.scale == 0.0 {
            return Err(FilterError::UnsupportedConfiguration(format!(
                "effort predictor axis {name} has invalid output scaling"
            )));
        }
        Ok(SvrAxis {
            support_vectors: support_vectors
                .iter()
                .map(|support_vector| Vector6::from_column_slice(support_vector))
                .collect(),
            dual_coefficients: parameters.dual_coefficients,
            gamma: parameters.gamma,
            intercept: parameters.intercept,
            output,
        })
    }

    fn predict(&self, scaled_input: &Vector6<f64>) -> f64 {
        let mut accumulator = self.intercept;
        for (support_vector, coefficient) in
            self.support_vectors.iter().zip(&self.dual_coefficients)
        {
            let distance = (support_vector - scaled_input).norm_squared();
            accumulator += coefficient * (-self.gamma * distance).exp();
        }
        accumulator * self.output.scale + self.output.mean
    }
}

/// A trained RBF-kernel support-vector regressor predicting the surge, sway
/// and yaw efforts from the planar body motion `[v_x, v_y, ω_z, a_x, a_y,
/// α_z]`.
#[derive(Clone, Debug)]
pub struct SvrThreeDofModel {
    input_mean: Vector6<f64>,
    input_scale: Vector6<f64>,
    surge: SvrAxis,
    sway: SvrAxis,
    yaw: SvrAxis,
}

impl SvrThreeDofModel {
    pub fn new(bundle: SvrModelBundle) -> Result<Self, FilterError> {
        if bundle.scaler_params.mean.len() != 6 || bundle.scaler_params.scale.len() != 6 {
            return Err(FilterError::UnsupportedConfiguration(format!(
                "effort predictor scaler must have 6 components, got {}/{}",
                bundle.scaler_params.mean.len(),
                bundle.scaler_params.scale.len()
            )));
        }
        if bundle.scaler_params.scale.iter().any(|&s| !s.is_finite() || s == 0.0) {
            return Err(FilterError::UnsupportedConfiguration(
                "effort predictor scaler contains zero or non-finite scales".into(),
            ));
        }
        Ok(SvrThreeDofModel {
            input_mean: Vector6::from_column_slice(&bundle.scaler_params.mean),
            input_scale: Vector6::from_column_slice(&bundle.scaler_params.scale),
            surge: SvrAxis::new("x", bundle.params_x, bundle.s_x, bundle.fitout_x)?,
            sway: SvrAxis::new("y", bundle.params_y, bundle.s_y, bundle.fitout_y)?,
            yaw: SvrAxis::new("yaw", bundle.params_yaw, bundle.s_yaw, bundle.fitout_yaw)?,
        })
    }

    /// Loads the bundle from its JSON representation. A missing parameter
    /// block fails here, at construction time.
    pub fn from_json(text: &str) -> Result<Self, FilterError> {
        let bundle: SvrModelBundle = serde_json::from_str(text).map_err(|error| {
            FilterError::UnsupportedConfiguration(format!(
                "effort predictor bundle does not parse: {error}"
            ))
        })?;
        Self::new(bundle)
    }

    /// Predicted `[surge, sway, yaw]` efforts for the given planar motion
    /// vector `[v_x, v_y, ω_z, a_x, a_y, α_z]`.
    pub fn predict(&self, input: &Vector6<f64>) -> Vector3<f64> {
        let scaled = (input - self.input_mean).component_div(&self.input_scale);
        Vector3::new(
            self.surge.predict(&scaled),
            self.sway.predict(&scaled),
            self.yaw.predict(&scaled),
        )
    }
}
