//! The model-aided pose filter.
//!
//! [`PoseUkf`] owns a manifold UKF over [`PoseState`] and binds it to its
//! collaborators: the geographic projection, the vehicle motion model and the
//! optional learned effort predictor. Measurements are integrated one at a
//! time through the typed `integrate_*` methods or the tagged
//! [`PoseMeasurement`] dispatcher; prediction advances the state by a caller
//! supplied time step. All calls are synchronous and atomic with respect to
//! the estimator state: a dropped or gated measurement leaves mean and
//! covariance untouched.
//!
//! Visual marker observations use a scoped state augmentation: the marker
//! pose joins the state for the duration of one feature batch so its
//! uncertainty is consumed by the update, then the primary state block is
//! copied back and the augmentation discarded.

use log::warn;
use nalgebra::{DMatrix, DVector, Isometry3, Matrix3, Point3, Translation3, UnitQuaternion, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use crate::dynamics::{SvrThreeDofModel, UwvModelParameters};
use crate::earth::{self, GeographicProjection};
use crate::kalman::{UnscentedKalmanFilter, UpdateOutcome};
use crate::measurements::{
    Acceleration, BodyEfforts, GeographicPosition, MeasurementModel, PoseMeasurement, Pressure,
    RotationRate, Velocity, VisualFeatures, WaterCurrents, XyPosition, ZPosition,
};
use crate::{forward, linalg, tangent, Bearing, FilterError, Manifold, PoseState, ProcessContext, POSE_STATE_DOF};

/// Chi-squared threshold for 2 degrees of freedom at 95% likelihood.
pub const CHI2_2DOF_95: f64 = 5.991;
/// Chi-squared threshold for 2 degrees of freedom at 99% likelihood.
pub const CHI2_2DOF_99: f64 = 9.21;

/// Geodetic reference of the local navigation frame, radians.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LocationConfiguration {
    pub latitude: f64,
    pub longitude: f64,
}

/// Innovation gate thresholds per measurement kind (`None` accepts any
/// Mahalanobis distance). Thresholds belong to the measurement type, not to
/// the caller; the defaults reproduce the gating assignment of the filter
/// design: position-like 2-dof measurements gate at 95%, everything else is
/// accepted.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InnovationGates {
    pub xy_position: Option<f64>,
    pub geographic_position: Option<f64>,
    pub water_currents: Option<f64>,
    pub z_position: Option<f64>,
    pub pressure: Option<f64>,
    pub velocity: Option<f64>,
    pub acceleration: Option<f64>,
    pub body_efforts: Option<f64>,
    pub visual_features: Option<f64>,
}

impl Default for InnovationGates {
    fn default() -> Self {
        InnovationGates {
            xy_position: Some(CHI2_2DOF_95),
            geographic_position: Some(CHI2_2DOF_95),
            water_currents: Some(CHI2_2DOF_95),
            z_position: None,
            pressure: None,
            velocity: None,
            acceleration: None,
            body_efforts: None,
            visual_features: None,
        }
    }
}

/// Continuous-time process noise densities (1-sigma per square root second)
/// from which the base process noise matrix is built at construction. Water
/// current noise is derived from the first-order Markov stationary relation
/// `q = 2 * sigma^2 / tau` using the configured current limits instead.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessNoiseParameters {
    pub position_std: f64,
    pub orientation_std: f64,
    pub velocity_std: f64,
    pub acceleration_std: f64,
    pub gyro_bias_std: f64,
    pub acc_bias_std: f64,
    pub gravity_std: f64,
    pub inertia_std: f64,
    pub lin_damping_std: f64,
    pub quad_damping_std: f64,
    pub adcp_bias_std: f64,
    pub water_density_std: f64,
}

impl Default for ProcessNoiseParameters {
    fn default() -> Self {
        ProcessNoiseParameters {
            position_std: 0.0,
            orientation_std: 1e-3,
            velocity_std: 0.0,
            acceleration_std: 0.1,
            gyro_bias_std: 1e-6,
            acc_bias_std: 1e-5,
            gravity_std: 0.0,
            inertia_std: 1e-4,
            lin_damping_std: 1e-4,
            quad_damping_std: 1e-4,
            adcp_bias_std: 1e-5,
            water_density_std: 1e-2,
        }
    }
}

/// The recognised filter parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoseUkfParameters {
    /// IMU position in the body frame (m).
    pub imu_in_body: Vector3<f64>,
    pub gyro_bias_offset: Vector3<f64>,
    /// Gyro bias time constant (s).
    pub gyro_bias_tau: f64,
    pub acc_bias_offset: Vector3<f64>,
    pub acc_bias_tau: f64,
    pub inertia_tau: f64,
    pub lin_damping_tau: f64,
    pub quad_damping_tau: f64,
    /// Time constant for water currents (s).
    pub water_velocity_tau: f64,
    /// Long term 1-sigma bounds for currents (m/s).
    pub water_velocity_limits: f64,
    /// Spatial scale for water current change ((m/s)² per m²/s).
    pub water_velocity_scale: f64,
    pub adcp_bias_tau: f64,
    /// Atmospheric pressure in pascal (N/m²).
    pub atmospheric_pressure: f64,
    pub water_density_tau: f64,
    #[serde(default)]
    pub process_noise: ProcessNoiseParameters,
    #[serde(default)]
    pub gates: InnovationGates,
}

impl Default for PoseUkfParameters {
    fn default() -> Self {
        PoseUkfParameters {
            imu_in_body: Vector3::zeros(),
            gyro_bias_offset: Vector3::zeros(),
            gyro_bias_tau: 3600.0,
            acc_bias_offset: Vector3::zeros(),
            acc_bias_tau: 3600.0,
            inertia_tau: 3600.0,
            lin_damping_tau: 3600.0,
            quad_damping_tau: 3600.0,
            water_velocity_tau: 600.0,
            water_velocity_limits: 0.5,
            water_velocity_scale: 1e-3,
            adcp_bias_tau: 3600.0,
            atmospheric_pressure: 101_325.0,
            water_density_tau: 3600.0,
            process_noise: ProcessNoiseParameters::default(),
            gates: InnovationGates::default(),
        }
    }
}

impl PoseUkfParameters {
    pub fn validate(&self) -> Result<(), FilterError> {
        let taus = [
            ("gyro_bias_tau", self.gyro_bias_tau),
            ("acc_bias_tau", self.acc_bias_tau),
            ("inertia_tau", self.inertia_tau),
            ("lin_damping_tau", self.lin_damping_tau),
            ("quad_damping_tau", self.quad_damping_tau),
            ("water_velocity_tau", self.water_velocity_tau),
            ("adcp_bias_tau", self.adcp_bias_tau),
            ("water_density_tau", self.water_density_tau),
        ];
        for (name, tau) in taus {
            if !tau.is_finite() || tau <= 0.0 {
                return Err(FilterError::UnsupportedConfiguration(format!(
                    "{name} must be a positive time constant, got {tau}"
                )));
            }
        }
        let finite_vectors = self.imu_in_body.iter().all(|v| v.is_finite())
            && self.gyro_bias_offset.iter().all(|v| v.is_finite())
            && self.acc_bias_offset.iter().all(|v| v.is_finite());
        if !finite_vectors {
            return Err(FilterError::UnsupportedConfiguration(
                "lever arm or bias offsets contain non-finite values".into(),
            ));
        }
        let positives = [
            ("water_velocity_limits", self.water_velocity_limits),
            ("water_velocity_scale", self.water_velocity_scale),
            ("atmospheric_pressure", self.atmospheric_pressure),
        ];
        for (name, value) in positives {
            if !value.is_finite() || value < 0.0 {
                return Err(FilterError::UnsupportedConfiguration(format!(
                    "{name} must be non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Relaxation offsets of the drifting model parameters, captured from the
/// initial state at construction.
#[derive(Clone, Debug)]
pub struct ParameterOffsets {
    pub inertia: Matrix3<f64>,
    pub lin_damping: Matrix3<f64>,
    pub quad_damping: Matrix3<f64>,
    pub water_density: f64,
}

impl ParameterOffsets {
    pub fn from_state(state: &PoseState) -> Self {
        ParameterOffsets {
            inertia: state.inertia,
            lin_damping: state.lin_damping,
            quad_damping: state.quad_damping,
            water_density: state.water_density,
        }
    }
}

/// The pose state augmented with a visual marker pose, used for the duration
/// of one feature batch.
#[derive(Clone, Debug)]
pub struct MarkerAugmentedState {
    pub base: PoseState,
    /// Marker position in the navigation frame.
    pub marker_position: Vector3<f64>,
    /// Marker orientation in the navigation frame.
    pub marker_orientation: UnitQuaternion<f64>,
}

impl Manifold for MarkerAugmentedState {
    fn dof(&self) -> usize {
        POSE_STATE_DOF + 6
    }

    fn boxplus(&self, delta: &DVector<f64>) -> Self {
        debug_assert_eq!(delta.len(), POSE_STATE_DOF + 6);
        let rotation = UnitQuaternion::from_scaled_axis(
            delta.fixed_rows::<3>(POSE_STATE_DOF + 3).into_owned(),
        );
        let mut marker_orientation = self.marker_orientation * rotation;
        marker_orientation.renormalize();
        MarkerAugmentedState {
            base: self.base.boxplus(&delta.rows(0, POSE_STATE_DOF).into_owned()),
            marker_position: self.marker_position + delta.fixed_rows::<3>(POSE_STATE_DOF),
            marker_orientation,
        }
    }

    fn boxminus(&self, other: &Self) -> DVector<f64> {
        let mut delta = DVector::zeros(POSE_STATE_DOF + 6);
        delta
            .rows_mut(0, POSE_STATE_DOF)
            .copy_from(&self.base.boxminus(&other.base));
        delta
            .fixed_rows_mut::<3>(POSE_STATE_DOF)
            .copy_from(&(self.marker_position - other.marker_position));
        delta
            .fixed_rows_mut::<3>(POSE_STATE_DOF + 3)
            .copy_from(&(other.marker_orientation.inverse() * self.marker_orientation).scaled_axis());
        delta
    }
}

/// Full-model-aided inertial localization filter for an AUV.
///
/// As minimal input the filter relies on rotation rates and accelerations
/// from an IMU and velocities from a DVL. Given force and torque measurements
/// the motion model aids the velocity estimate during DVL drop outs, and ADCP
/// measurements further aid the estimation when bottom lock is lost.
pub struct PoseUkf {
    ukf: UnscentedKalmanFilter<PoseState>,
    projection: GeographicProjection,
    dynamic_model: UwvModelParameters,
    effort_model: Option<SvrThreeDofModel>,
    parameters: PoseUkfParameters,
    offsets: ParameterOffsets,
    rotation_rate: Vector3<f64>,
    process_noise: DMatrix<f64>,
}

impl PoseUkf {
    /// Builds the filter from an initial state and covariance, the geodetic
    /// reference of the navigation frame, the static motion model parameters
    /// and the filter parameter bundle. The optional learned effort model
    /// overrides the planar components of the motion model prediction; its
    /// parameter blocks have already been checked at its own construction.
    pub fn new(
        initial_state: PoseState,
        initial_covariance: DMatrix<f64>,
        location: &LocationConfiguration,
        model_parameters: UwvModelParameters,
        filter_parameter: PoseUkfParameters,
        effort_model: Option<SvrThreeDofModel>,
    ) -> Result<PoseUkf, FilterError> {
        filter_parameter.validate()?;
        model_parameters.validate()?;
        if !linalg::is_positive_semidefinite(&initial_covariance) {
            return Err(FilterError::UnsupportedConfiguration(
                "initial covariance is not symmetric positive semi-definite".into(),
            ));
        }
        let projection = GeographicProjection::new(location.latitude, location.longitude)?;
        let offsets = ParameterOffsets::from_state(&initial_state);
        let process_noise = build_process_noise(&filter_parameter);
        let ukf = UnscentedKalmanFilter::with_default_weights(initial_state, initial_covariance)?;
        Ok(PoseUkf {
            ukf,
            projection,
            dynamic_model: model_parameters,
            effort_model,
            parameters: filter_parameter,
            offsets,
            rotation_rate: Vector3::zeros(),
            process_noise,
        })
    }

    /// Current state estimate.
    pub fn state(&self) -> &PoseState {
        self.ukf.mean()
    }

    /// Current state covariance.
    pub fn covariance(&self) -> &DMatrix<f64> {
        self.ukf.covariance()
    }

    /// Replaces the base (per-second) process noise built at construction.
    pub fn set_process_noise(&mut self, process_noise: DMatrix<f64>) -> Result<(), FilterError> {
        if process_noise.nrows() != POSE_STATE_DOF || process_noise.ncols() != POSE_STATE_DOF {
            return Err(FilterError::UnsupportedConfiguration(format!(
                "process noise is {}x{}, expected {POSE_STATE_DOF}x{POSE_STATE_DOF}",
                process_noise.nrows(),
                process_noise.ncols()
            )));
        }
        if !linalg::is_positive_semidefinite(&process_noise) {
            return Err(FilterError::UnsupportedConfiguration(
                "process noise is not symmetric positive semi-definite".into(),
            ));
        }
        self.process_noise = process_noise;
        Ok(())
    }

    /// Advances the state by `delta_t` seconds using the latest cached
    /// rotation rate.
    ///
    /// The base process noise is modulated before the step: the orientation
    /// block is rotated into the navigation frame, the water current blocks
    /// are inflated with the travelled distance, and the whole matrix is
    /// scaled by `delta_t²`. A zero step is a no-op.
    ///
    /// A [`FilterError::NumericalFailure`] from this method is fatal for the
    /// filter instance: the covariance no longer matches the state and the
    /// caller must rebuild the filter.
    pub fn predict(&mut self, delta_t: f64) -> Result<(), FilterError> {
        if !delta_t.is_finite() || delta_t < 0.0 {
            return Err(FilterError::UnsupportedConfiguration(format!(
                "prediction step {delta_t} is not a valid duration"
            )));
        }
        if delta_t == 0.0 {
            return Ok(());
        }
        let rotation = *self.ukf.mean().orientation.to_rotation_matrix().matrix();
        let mut scaled_velocity = self.ukf.mean().velocity;
        scaled_velocity.z *= 10.0;

        let mut process_noise = self.process_noise.clone();
        let orientation_block = process_noise
            .fixed_view::<3, 3>(tangent::ORIENTATION, tangent::ORIENTATION)
            .into_owned();
        process_noise
            .fixed_view_mut::<3, 3>(tangent::ORIENTATION, tangent::ORIENTATION)
            .copy_from(&(rotation * orientation_block * rotation.transpose()));
        let inflation =
            self.parameters.water_velocity_scale * scaled_velocity.norm_squared() * delta_t;
        for offset in [tangent::WATER_VELOCITY, tangent::WATER_VELOCITY_BELOW] {
            process_noise[(offset, offset)] += inflation;
            process_noise[(offset + 1, offset + 1)] += inflation;
        }
        process_noise *= delta_t * delta_t;

        let context = ProcessContext {
            rotation_rate: self.rotation_rate,
            projection: &self.projection,
            parameters: &self.parameters,
            offsets: &self.offsets,
        };
        self.ukf
            .predict(|state| forward(state, &context, delta_t), &process_noise)
    }

    /// Rotation rate in the IMU frame, corrected for the estimated gyro bias
    /// and the Earth rotation at the current position.
    pub fn rotation_rate(&self) -> Vector3<f64> {
        let state = self.ukf.mean();
        let (latitude, _) = self
            .projection
            .nav_to_world(state.position.x, state.position.y);
        self.rotation_rate
            - state.bias_gyro
            - state
                .orientation
                .inverse_transform_vector(&earth::earth_rotation_nwu(latitude))
    }

    /// Caches the rotation rate for the next prediction. No update is
    /// applied; mean and covariance are unchanged.
    pub fn integrate_rotation_rate(&mut self, measurement: &RotationRate) -> Result<(), FilterError> {
        measurement
            .validate()
            .inspect_err(|error| warn!("rotation rate measurement rejected: {error}"))?;
        self.rotation_rate = measurement.mean;
        Ok(())
    }

    /// 2D position expressed in the navigation frame.
    pub fn integrate_xy_position(
        &mut self,
        measurement: &XyPosition,
    ) -> Result<UpdateOutcome, FilterError> {
        measurement
            .validate()
            .inspect_err(|error| warn!("XY position measurement rejected: {error}"))?;
        self.ukf.update(
            &measurement.vector(),
            &measurement.noise(),
            measurement_xy_position,
            self.parameters.gates.xy_position,
        )
    }

    /// Latitude/longitude fix, projected into the navigation frame and
    /// corrected for the antenna lever arm before being applied as an XY
    /// position update.
    pub fn integrate_geographic_position(
        &mut self,
        measurement: &GeographicPosition,
    ) -> Result<UpdateOutcome, FilterError> {
        measurement
            .validate()
            .inspect_err(|error| warn!("geographic position measurement rejected: {error}"))?;
        let (x, y) = self
            .projection
            .world_to_nav(measurement.latitude, measurement.longitude);
        let lever = self.ukf.mean().orientation * measurement.gps_in_body;
        let projected = DVector::from_vec(vec![x - lever.x, y - lever.y]);
        self.ukf.update(
            &projected,
            &measurement.noise(),
            measurement_xy_position,
            self.parameters.gates.geographic_position,
        )
    }

    /// Altitude of the IMU expressed in the navigation frame.
    pub fn integrate_z_position(
        &mut self,
        measurement: &ZPosition,
    ) -> Result<UpdateOutcome, FilterError> {
        measurement
            .validate()
            .inspect_err(|error| warn!("Z position measurement rejected: {error}"))?;
        self.ukf.update(
            &measurement.vector(),
            &measurement.noise(),
            measurement_z_position,
            self.parameters.gates.z_position,
        )
    }

    /// Liquid pressure at the pressure sensor in pascal.
    pub fn integrate_pressure(
        &mut self,
        measurement: &Pressure,
    ) -> Result<UpdateOutcome, FilterError> {
        measurement
            .validate()
            .inspect_err(|error| warn!("pressure measurement rejected: {error}"))?;
        let atmospheric_pressure = self.parameters.atmospheric_pressure;
        let sensor_in_imu = measurement.sensor_in_imu;
        self.ukf.update(
            &measurement.vector(),
            &measurement.noise(),
            |state: &PoseState| measurement_pressure(state, &sensor_in_imu, atmospheric_pressure),
            self.parameters.gates.pressure,
        )
    }

    /// Velocities expressed in the IMU frame.
    pub fn integrate_velocity(
        &mut self,
        measurement: &Velocity,
    ) -> Result<UpdateOutcome, FilterError> {
        measurement
            .validate()
            .inspect_err(|error| warn!("velocity measurement rejected: {error}"))?;
        self.ukf.update(
            &measurement.vector(),
            &measurement.noise(),
            measurement_velocity,
            self.parameters.gates.velocity,
        )
    }

    /// Accelerations of the IMU expressed in the IMU frame.
    pub fn integrate_acceleration(
        &mut self,
        measurement: &Acceleration,
    ) -> Result<UpdateOutcome, FilterError> {
        measurement
            .validate()
            .inspect_err(|error| warn!("acceleration measurement rejected: {error}"))?;
        self.ukf.update(
            &measurement.vector(),
            &measurement.noise(),
            measurement_acceleration,
            self.parameters.gates.acceleration,
        )
    }

    /// Water velocities from an ADCP expressed in the IMU frame.
    pub fn integrate_water_currents(
        &mut self,
        measurement: &WaterCurrents,
    ) -> Result<UpdateOutcome, FilterError> {
        measurement
            .validate()
            .inspect_err(|error| warn!("ADCP measurement rejected: {error}"))?;
        let cell_weighting = measurement.cell_weighting;
        self.ukf.update(
            &measurement.vector(),
            &measurement.noise(),
            |state: &PoseState| measurement_water_currents(state, cell_weighting),
            self.parameters.gates.water_currents,
        )
    }

    /// Forces and torques in the body frame.
    pub fn integrate_body_efforts(
        &mut self,
        measurement: &BodyEfforts,
    ) -> Result<UpdateOutcome, FilterError> {
        measurement
            .validate()
            .inspect_err(|error| warn!("body efforts measurement rejected: {error}"))?;
        let imu_in_body = self.parameters.imu_in_body;
        let rotation_rate_body = self.rotation_rate();
        if measurement.only_affect_velocity {
            let mean = self.ukf.mean().clone();
            let water_velocity = Vector3::new(mean.water_velocity.x, mean.water_velocity.y, 0.0);
            let orientation = mean.orientation;
            let acceleration_body = orientation.inverse_transform_vector(&mean.acceleration)
                - rotation_rate_body.cross(&rotation_rate_body.cross(&imu_in_body));
            self.ukf.update(
                &measurement.vector(),
                &measurement.noise(),
                |state: &PoseState| {
                    constrained_velocity_efforts(
                        state,
                        &self.dynamic_model,
                        &imu_in_body,
                        &rotation_rate_body,
                        &water_velocity,
                        &orientation,
                        &acceleration_body,
                    )
                },
                self.parameters.gates.body_efforts,
            )
        } else {
            self.ukf.update(
                &measurement.vector(),
                &measurement.noise(),
                |state: &PoseState| {
                    measurement_efforts(
                        state,
                        &self.dynamic_model,
                        self.effort_model.as_ref(),
                        &imu_in_body,
                        &rotation_rate_body,
                    )
                },
                self.parameters.gates.body_efforts,
            )
        }
    }

    /// Integrates a batch of visual marker features.
    ///
    /// The filter state is augmented with the marker pose and its covariance,
    /// every feature bearing is applied as an update on the augmented state,
    /// and the primary state block is copied back afterwards. The marker pose
    /// uncertainty is therefore consumed by the update but not stored.
    /// Returns the number of features that passed their gate.
    pub fn integrate_visual_features(
        &mut self,
        measurement: &VisualFeatures,
    ) -> Result<usize, FilterError> {
        measurement
            .validate()
            .inspect_err(|error| warn!("visual feature batch rejected: {error}"))?;
        let augmented = MarkerAugmentedState {
            base: self.ukf.mean().clone(),
            marker_position: measurement.marker_pose.translation.vector,
            marker_orientation: measurement.marker_pose.rotation,
        };
        let dof = POSE_STATE_DOF + 6;
        let mut covariance = DMatrix::zeros(dof, dof);
        covariance
            .view_mut((0, 0), (POSE_STATE_DOF, POSE_STATE_DOF))
            .copy_from(self.ukf.covariance());
        covariance
            .fixed_view_mut::<6, 6>(POSE_STATE_DOF, POSE_STATE_DOF)
            .copy_from(&measurement.marker_covariance);
        let mut augmented_ukf = UnscentedKalmanFilter::with_default_weights(augmented, covariance)?;

        let camera = measurement.camera;
        let camera_in_imu = measurement.camera_in_imu;
        let fx_squared = camera.fx * camera.fx;
        let fy_squared = camera.fy * camera.fy;
        let fxy = camera.fx * camera.fy;
        let gate = self.parameters.gates.visual_features;
        let mut applied = 0;
        for (feature, feature_position) in
            measurement.features.iter().zip(&measurement.feature_positions)
        {
            // project the image point onto the unit sphere
            let bearing = Bearing::new(Vector3::new(
                (feature.pixel.x - camera.cx) / camera.fx,
                (feature.pixel.y - camera.cy) / camera.fy,
                1.0,
            ))
            .unwrap_or_else(Bearing::forward);
            let noise = DMatrix::from_row_slice(
                2,
                2,
                &[
                    feature.covariance[(0, 0)] / fx_squared,
                    feature.covariance[(0, 1)] / fxy,
                    feature.covariance[(1, 0)] / fxy,
                    feature.covariance[(1, 1)] / fy_squared,
                ],
            );
            let outcome = augmented_ukf.update(
                &bearing,
                &noise,
                |state: &MarkerAugmentedState| {
                    measurement_visual_feature(state, feature_position, &camera_in_imu)
                },
                gate,
            )?;
            if outcome.is_applied() {
                applied += 1;
            }
        }

        let mean = augmented_ukf.mean().base.clone();
        let covariance = augmented_ukf
            .covariance()
            .view((0, 0), (POSE_STATE_DOF, POSE_STATE_DOF))
            .into_owned();
        self.ukf = UnscentedKalmanFilter::with_default_weights(mean, covariance)?;
        Ok(applied)
    }

    /// Thin dispatcher over the tagged measurement union.
    pub fn integrate(&mut self, measurement: &PoseMeasurement) -> Result<UpdateOutcome, FilterError> {
        match measurement {
            PoseMeasurement::XyPosition(inner) => self.integrate_xy_position(inner),
            PoseMeasurement::ZPosition(inner) => self.integrate_z_position(inner),
            PoseMeasurement::Pressure(inner) => self.integrate_pressure(inner),
            PoseMeasurement::RotationRate(inner) => {
                self.integrate_rotation_rate(inner)?;
                Ok(UpdateOutcome::Applied)
            }
            PoseMeasurement::Velocity(inner) => self.integrate_velocity(inner),
            PoseMeasurement::Acceleration(inner) => self.integrate_acceleration(inner),
            PoseMeasurement::WaterCurrents(inner) => self.integrate_water_currents(inner),
            PoseMeasurement::BodyEfforts(inner) => self.integrate_body_efforts(inner),
            PoseMeasurement::GeographicPosition(inner) => self.integrate_geographic_position(inner),
            PoseMeasurement::VisualFeatures(inner) => {
                self.integrate_visual_features(inner)?;
                Ok(UpdateOutcome::Applied)
            }
        }
    }
}

fn build_process_noise(parameters: &PoseUkfParameters) -> DMatrix<f64> {
    let densities = &parameters.process_noise;
    let mut noise = DMatrix::zeros(POSE_STATE_DOF, POSE_STATE_DOF);
    set_diagonal_block(&mut noise, tangent::POSITION, 3, densities.position_std.powi(2));
    set_diagonal_block(&mut noise, tangent::ORIENTATION, 3, densities.orientation_std.powi(2));
    set_diagonal_block(&mut noise, tangent::VELOCITY, 3, densities.velocity_std.powi(2));
    set_diagonal_block(&mut noise, tangent::ACCELERATION, 3, densities.acceleration_std.powi(2));
    set_diagonal_block(&mut noise, tangent::BIAS_GYRO, 3, densities.gyro_bias_std.powi(2));
    set_diagonal_block(&mut noise, tangent::BIAS_ACC, 3, densities.acc_bias_std.powi(2));
    noise[(tangent::GRAVITY, tangent::GRAVITY)] = densities.gravity_std.powi(2);
    set_diagonal_block(&mut noise, tangent::INERTIA, 9, densities.inertia_std.powi(2));
    set_diagonal_block(&mut noise, tangent::LIN_DAMPING, 9, densities.lin_damping_std.powi(2));
    set_diagonal_block(&mut noise, tangent::QUAD_DAMPING, 9, densities.quad_damping_std.powi(2));
    let water_velocity_noise =
        2.0 * parameters.water_velocity_limits.powi(2) / parameters.water_velocity_tau;
    set_diagonal_block(&mut noise, tangent::WATER_VELOCITY, 2, water_velocity_noise);
    set_diagonal_block(&mut noise, tangent::WATER_VELOCITY_BELOW, 2, water_velocity_noise);
    set_diagonal_block(&mut noise, tangent::BIAS_ADCP, 2, densities.adcp_bias_std.powi(2));
    noise[(tangent::WATER_DENSITY, tangent::WATER_DENSITY)] = densities.water_density_std.powi(2);
    noise
}

fn set_diagonal_block(noise: &mut DMatrix<f64>, offset: usize, length: usize, variance: f64) {
    for i in 0..length {
        noise[(offset + i, offset + i)] = variance;
    }
}

// predicted-observation functions, one per sensor modality

fn measurement_xy_position(state: &PoseState) -> DVector<f64> {
    DVector::from_vec(vec![state.position.x, state.position.y])
}

fn measurement_z_position(state: &PoseState) -> DVector<f64> {
    DVector::from_vec(vec![state.position.z])
}

fn measurement_pressure(
    state: &PoseState,
    sensor_in_imu: &Vector3<f64>,
    atmospheric_pressure: f64,
) -> DVector<f64> {
    let sensor_in_nav = state.position + state.orientation * sensor_in_imu;
    DVector::from_vec(vec![
        atmospheric_pressure - sensor_in_nav.z * state.gravity * state.water_density,
    ])
}

fn measurement_velocity(state: &PoseState) -> DVector<f64> {
    let velocity_imu = state.orientation.inverse_transform_vector(&state.velocity);
    DVector::from_column_slice(velocity_imu.as_slice())
}

fn measurement_acceleration(state: &PoseState) -> DVector<f64> {
    let specific_force = state
        .orientation
        .inverse_transform_vector(&(state.acceleration + Vector3::new(0.0, 0.0, state.gravity)))
        + state.bias_acc;
    DVector::from_column_slice(specific_force.as_slice())
}

fn measurement_water_currents(state: &PoseState, cell_weighting: f64) -> DVector<f64> {
    let surface = Vector3::new(state.water_velocity.x, state.water_velocity.y, 0.0);
    let below = Vector3::new(
        state.water_velocity_below.x,
        state.water_velocity_below.y,
        0.0,
    );
    let relative_surface = state
        .orientation
        .inverse_transform_vector(&(state.velocity - surface));
    let relative_below = state
        .orientation
        .inverse_transform_vector(&(state.velocity - below));
    DVector::from_vec(vec![
        cell_weighting * relative_below.x
            + (1.0 - cell_weighting) * relative_surface.x
            + state.bias_adcp.x,
        cell_weighting * relative_below.y
            + (1.0 - cell_weighting) * relative_surface.y
            + state.bias_adcp.y,
    ])
}

fn measurement_efforts(
    state: &PoseState,
    model: &UwvModelParameters,
    effort_model: Option<&SvrThreeDofModel>,
    imu_in_body: &Vector3<f64>,
    rotation_rate_body: &Vector3<f64>,
) -> DVector<f64> {
    let parameters =
        model.with_planar_blocks(&state.inertia, &state.lin_damping, &state.quad_damping);

    let water_velocity = Vector3::new(state.water_velocity.x, state.water_velocity.y, 0.0);
    // assume the centre of rotation to be the body frame
    let velocity_body = state.orientation.inverse_transform_vector(&state.velocity)
        - rotation_rate_body.cross(imu_in_body)
        - state.orientation.inverse_transform_vector(&water_velocity);
    let mut velocity = Vector6::zeros();
    velocity.fixed_rows_mut::<3>(0).copy_from(&velocity_body);
    velocity.fixed_rows_mut::<3>(3).copy_from(rotation_rate_body);

    let acceleration_body = state.orientation.inverse_transform_vector(&state.acceleration)
        - rotation_rate_body.cross(&rotation_rate_body.cross(imu_in_body));
    // the angular acceleration is assumed to be zero
    let mut acceleration = Vector6::zeros();
    acceleration
        .fixed_rows_mut::<3>(0)
        .copy_from(&acceleration_body);

    let mut efforts = parameters.efforts(&acceleration, &velocity, &state.orientation);
    if let Some(predictor) = effort_model {
        let planar_motion = Vector6::new(
            velocity[0],
            velocity[1],
            velocity[5],
            acceleration[0],
            acceleration[1],
            acceleration[5],
        );
        let predicted = predictor.predict(&planar_motion);
        efforts[0] = predicted[0];
        efforts[1] = predicted[1];
        efforts[5] = predicted[2];
    }
    DVector::from_column_slice(efforts.as_slice())
}

fn constrained_velocity_efforts(
    state: &PoseState,
    model: &UwvModelParameters,
    imu_in_body: &Vector3<f64>,
    rotation_rate_body: &Vector3<f64>,
    water_velocity: &Vector3<f64>,
    orientation: &UnitQuaternion<f64>,
    acceleration_body: &Vector3<f64>,
) -> DVector<f64> {
    let velocity_body = orientation.inverse_transform_vector(&state.velocity)
        - rotation_rate_body.cross(imu_in_body)
        - orientation.inverse_transform_vector(water_velocity);
    let mut velocity = Vector6::zeros();
    velocity.fixed_rows_mut::<3>(0).copy_from(&velocity_body);
    velocity.fixed_rows_mut::<3>(3).copy_from(rotation_rate_body);

    let mut acceleration = Vector6::zeros();
    acceleration
        .fixed_rows_mut::<3>(0)
        .copy_from(acceleration_body);

    let efforts = model.efforts(&acceleration, &velocity, orientation);
    DVector::from_column_slice(efforts.as_slice())
}

fn measurement_visual_feature(
    state: &MarkerAugmentedState,
    feature_position: &Vector3<f64>,
    camera_in_imu: &Isometry3<f64>,
) -> Bearing {
    let imu_in_nav = Isometry3::from_parts(
        Translation3::from(state.base.position),
        state.base.orientation,
    );
    let nav_in_camera = (imu_in_nav * camera_in_imu).inverse();
    let feature_nav = state.marker_orientation * feature_position + state.marker_position;
    let feature_camera = nav_in_camera.transform_point(&Point3::from(feature_nav));
    Bearing::new(feature_camera.coords).unwrap_or_else(Bearing::forward)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::VisualFeature;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::{Matrix2, Matrix3 as M3, Vector2};

    fn test_location() -> LocationConfiguration {
        LocationConfiguration {
            latitude: 0.5,
            longitude: 0.1,
        }
    }

    fn test_filter() -> PoseUkf {
        let covariance = DMatrix::from_diagonal(&DVector::from_element(POSE_STATE_DOF, 1e-9));
        PoseUkf::new(
            PoseState::default(),
            covariance,
            &test_location(),
            UwvModelParameters::default(),
            PoseUkfParameters::default(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn construction_rejects_mis_sized_covariance() {
        let result = PoseUkf::new(
            PoseState::default(),
            DMatrix::zeros(10, 10),
            &test_location(),
            UwvModelParameters::default(),
            PoseUkfParameters::default(),
            None,
        );
        assert!(matches!(
            result,
            Err(FilterError::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn construction_rejects_bad_time_constants() {
        let mut parameters = PoseUkfParameters::default();
        parameters.water_velocity_tau = 0.0;
        let result = PoseUkf::new(
            PoseState::default(),
            DMatrix::zeros(POSE_STATE_DOF, POSE_STATE_DOF),
            &test_location(),
            UwvModelParameters::default(),
            parameters,
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn zero_step_prediction_is_bit_for_bit_identity() {
        let mut filter = test_filter();
        let state_before = filter.state().clone();
        let covariance_before = filter.covariance().clone();
        filter.predict(0.0).unwrap();
        assert_eq!(filter.covariance(), &covariance_before);
        assert_eq!(filter.state().boxminus(&state_before).amax(), 0.0);
    }

    #[test]
    fn negative_step_prediction_is_rejected() {
        let mut filter = test_filter();
        assert!(filter.predict(-0.1).is_err());
        assert!(filter.predict(f64::NAN).is_err());
    }

    #[test]
    fn rotation_rate_is_cached_without_touching_the_state() {
        let mut filter = test_filter();
        let covariance_before = filter.covariance().clone();
        let state_before = filter.state().clone();
        filter
            .integrate_rotation_rate(&RotationRate {
                mean: Vector3::new(0.01, 0.02, 0.03),
                covariance: M3::identity() * 1e-6,
            })
            .unwrap();
        assert_eq!(filter.covariance(), &covariance_before);
        assert_eq!(filter.state().boxminus(&state_before).amax(), 0.0);

        // corrected rate: identity attitude, zero bias
        let earth_rotation = earth::earth_rotation_nwu(0.5);
        let corrected = filter.rotation_rate();
        assert_approx_eq!(corrected.x, 0.01 - earth_rotation.x, 1e-12);
        assert_approx_eq!(corrected.y, 0.02, 1e-12);
        assert_approx_eq!(corrected.z, 0.03 - earth_rotation.z, 1e-12);
    }

    #[test]
    fn pressure_observation_literal() {
        let mut state = PoseState::default();
        state.position = Vector3::new(0.0, 0.0, 10.0);
        state.gravity = 9.81;
        state.water_density = 1025.0;
        let predicted = measurement_pressure(&state, &Vector3::zeros(), 101_325.0);
        assert_approx_eq!(predicted[0], 772.5, 1e-9);
    }

    #[test]
    fn pressure_lever_arm_moves_the_sensed_depth() {
        let mut state = PoseState::default();
        state.position = Vector3::new(0.0, 0.0, -10.0);
        state.gravity = 9.81;
        state.water_density = 1025.0;
        let offset = Vector3::new(0.0, 0.0, -1.0);
        let at_imu = measurement_pressure(&state, &Vector3::zeros(), 101_325.0)[0];
        let at_sensor = measurement_pressure(&state, &offset, 101_325.0)[0];
        assert_approx_eq!(at_sensor - at_imu, 9.81 * 1025.0, 1e-9);
    }

    #[test]
    fn acceleration_observation_includes_gravity_and_bias() {
        let mut state = PoseState::default();
        state.gravity = 9.81;
        state.bias_acc = Vector3::new(0.1, 0.0, 0.0);
        let predicted = measurement_acceleration(&state);
        assert_approx_eq!(predicted[0], 0.1, 1e-12);
        assert_approx_eq!(predicted[2], 9.81, 1e-12);
    }

    #[test]
    fn water_current_observation_blends_cells() {
        let mut state = PoseState::default();
        state.velocity = Vector3::new(1.0, 0.0, 0.0);
        state.water_velocity = Vector2::new(0.4, 0.0);
        state.water_velocity_below = Vector2::new(0.2, 0.0);
        state.bias_adcp = Vector2::new(0.05, 0.0);
        let surface_only = measurement_water_currents(&state, 0.0);
        assert_approx_eq!(surface_only[0], 0.6 + 0.05, 1e-12);
        let blended = measurement_water_currents(&state, 0.5);
        assert_approx_eq!(blended[0], 0.5 * 0.8 + 0.5 * 0.6 + 0.05, 1e-12);
    }

    #[test]
    fn learned_effort_model_overrides_planar_axes() {
        use crate::dynamics::{
            OutputScaling, ScalerParameters, SvrModelBundle, SvrParameters,
        };

        let axis = SvrParameters {
            gamma: 0.5,
            intercept: 0.1,
            dual_coefficients: vec![2.0],
        };
        let output = OutputScaling { mean: 0.0, scale: 1.0 };
        let bundle = SvrModelBundle {
            scaler_params: ScalerParameters {
                mean: vec![0.0; 6],
                scale: vec![1.0; 6],
            },
            params_x: axis.clone(),
            params_y: axis.clone(),
            params_yaw: axis,
            s_x: vec![[0.0; 6]],
            s_y: vec![[0.0; 6]],
            s_yaw: vec![[0.0; 6]],
            fitout_x: output.clone(),
            fitout_y: output.clone(),
            fitout_yaw: output,
        };
        let predictor = SvrThreeDofModel::new(bundle).unwrap();

        let state = PoseState::default();
        let model = UwvModelParameters::default();
        let physics = measurement_efforts(&state, &model, None, &Vector3::zeros(), &Vector3::zeros());
        let learned = measurement_efforts(
            &state,
            &model,
            Some(&predictor),
            &Vector3::zeros(),
            &Vector3::zeros(),
        );
        // at rest the physics model predicts zero effort; the regressor
        // output replaces surge, sway and yaw only
        assert_approx_eq!(physics[0], 0.0, 1e-12);
        assert_approx_eq!(learned[0], 2.1, 1e-12);
        assert_approx_eq!(learned[1], 2.1, 1e-12);
        assert_approx_eq!(learned[5], 2.1, 1e-12);
        assert_eq!(learned[2], physics[2]);
        assert_eq!(learned[3], physics[3]);
        assert_eq!(learned[4], physics[4]);
    }

    #[test]
    fn invalid_measurement_leaves_state_untouched() {
        let mut filter = test_filter();
        let covariance_before = filter.covariance().clone();
        let result = filter.integrate_velocity(&Velocity {
            mean: Vector3::new(f64::NAN, 0.0, 0.0),
            covariance: M3::identity(),
        });
        assert!(matches!(result, Err(FilterError::InvalidMeasurement(_))));
        assert_eq!(filter.covariance(), &covariance_before);
    }

    #[test]
    fn dispatcher_routes_tagged_measurements() {
        let mut filter = test_filter();
        let outcome = filter
            .integrate(&PoseMeasurement::Velocity(Velocity {
                mean: Vector3::zeros(),
                covariance: M3::identity() * 1e-4,
            }))
            .unwrap();
        assert!(outcome.is_applied());

        let outcome = filter
            .integrate(&PoseMeasurement::RotationRate(RotationRate {
                mean: Vector3::new(0.0, 0.0, 0.1),
                covariance: M3::identity() * 1e-6,
            }))
            .unwrap();
        assert!(outcome.is_applied());
        assert_approx_eq!(filter.rotation_rate.z, 0.1, 1e-15);
    }

    #[test]
    fn geographic_fix_projects_to_the_navigation_frame() {
        let mut filter = test_filter();
        // a fix exactly at the reference with tight covariance keeps the
        // vehicle at the origin
        let outcome = filter
            .integrate_geographic_position(&GeographicPosition {
                latitude: 0.5,
                longitude: 0.1,
                covariance: Matrix2::identity() * 1e-4,
                gps_in_body: Vector3::zeros(),
            })
            .unwrap();
        assert!(outcome.is_applied());
        assert!(filter.state().position.norm() < 1e-6);
    }

    #[test]
    fn default_gates_follow_the_chi_squared_assignment() {
        let gates = InnovationGates::default();
        assert_eq!(gates.xy_position, Some(CHI2_2DOF_95));
        assert_eq!(gates.geographic_position, Some(CHI2_2DOF_95));
        assert_eq!(gates.water_currents, Some(CHI2_2DOF_95));
        assert_eq!(gates.velocity, None);
        assert_eq!(gates.pressure, None);
        assert_eq!(gates.visual_features, None);
    }

    #[test]
    fn augmented_state_round_trips_marker_pose() {
        let augmented = MarkerAugmentedState {
            base: PoseState::default(),
            marker_position: Vector3::new(10.0, 0.0, -2.0),
            marker_orientation: UnitQuaternion::identity(),
        };
        let mut delta = DVector::zeros(POSE_STATE_DOF + 6);
        delta[POSE_STATE_DOF] = 0.5;
        delta[POSE_STATE_DOF + 4] = 0.01;
        let moved = augmented.boxplus(&delta);
        assert_approx_eq!(moved.marker_position.x, 10.5, 1e-12);
        let recovered = moved.boxminus(&augmented);
        assert_approx_eq!(recovered[POSE_STATE_DOF], 0.5, 1e-12);
        assert_approx_eq!(recovered[POSE_STATE_DOF + 4], 0.01, 1e-10);
    }

    #[test]
    fn visual_feature_bearing_points_at_the_marker() {
        // camera looking north: camera z = body x, camera x = -body y,
        // camera y = -body z
        let rotation = UnitQuaternion::from_rotation_matrix(
            &nalgebra::Rotation3::from_matrix_unchecked(M3::from_columns(&[
                Vector3::new(0.0, -1.0, 0.0),
                Vector3::new(0.0, 0.0, -1.0),
                Vector3::new(1.0, 0.0, 0.0),
            ])),
        );
        let camera_in_imu = Isometry3::from_parts(Translation3::identity(), rotation);
        let state = MarkerAugmentedState {
            base: PoseState::default(),
            marker_position: Vector3::new(10.0, 0.0, -2.0),
            marker_orientation: UnitQuaternion::identity(),
        };
        let bearing = measurement_visual_feature(&state, &Vector3::zeros(), &camera_in_imu);
        let direction = bearing.direction();
        // marker 10 m ahead, 2 m below: bearing (0, 0.2, 1)/norm
        let expected = Vector3::new(0.0, 0.2, 1.0).normalize();
        assert_approx_eq!(direction.x, expected.x, 1e-12);
        assert_approx_eq!(direction.y, expected.y, 1e-12);
        assert_approx_eq!(direction.z, expected.z, 1e-12);
    }

    #[test]
    fn visual_batch_requires_matching_feature_lists() {
        let mut filter = test_filter();
        let batch = VisualFeatures {
            features: vec![VisualFeature {
                pixel: Vector2::new(320.0, 240.0),
                covariance: Matrix2::identity(),
            }],
            feature_positions: vec![],
            marker_pose: Isometry3::identity(),
            marker_covariance: nalgebra::Matrix6::identity() * 1e-4,
            camera: crate::measurements::CameraConfiguration {
                fx: 800.0,
                fy: 800.0,
                cx: 320.0,
                cy: 240.0,
            },
            camera_in_imu: Isometry3::identity(),
        };
        assert!(filter.integrate_visual_features(&batch).is_err());
    }
}
