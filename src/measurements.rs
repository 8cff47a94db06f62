//! Measurement containers for the pose filter.
//!
//! Each sensor modality gets a small struct carrying its mean and covariance
//! in the semantic frame of the sensor, plus whatever fixed parameters the
//! observation needs (lever arms, camera intrinsics, ADCP cell weighting).
//! The [`MeasurementModel`] trait exposes the uniform vector/noise view the
//! filter consumes and validates shape and definiteness before any state is
//! touched. [`PoseMeasurement`] is the tagged union used by the thin
//! dispatcher in [`crate::filter`].

use nalgebra::{DMatrix, DVector, Isometry3, Matrix2, Matrix3, Matrix6, SMatrix, Vector2, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use crate::linalg;
use crate::FilterError;

fn zero_vector3() -> Vector3<f64> {
    Vector3::zeros()
}

/// Checks a measurement mean and covariance for shape, finiteness and
/// positive semi-definiteness.
pub(crate) fn check_measurement(mean: &[f64], covariance: &DMatrix<f64>) -> Result<(), FilterError> {
    if mean.iter().any(|value| !value.is_finite()) {
        return Err(FilterError::InvalidMeasurement(
            "mean contains non-finite values".into(),
        ));
    }
    if !covariance.is_square() || covariance.nrows() != mean.len() {
        return Err(FilterError::InvalidMeasurement(format!(
            "covariance is {}x{} for a mean of dimension {}",
            covariance.nrows(),
            covariance.ncols(),
            mean.len()
        )));
    }
    if !linalg::is_positive_semidefinite(covariance) {
        return Err(FilterError::InvalidMeasurement(
            "covariance is not symmetric positive semi-definite".into(),
        ));
    }
    Ok(())
}

fn dynamic<const D: usize>(covariance: &SMatrix<f64, D, D>) -> DMatrix<f64> {
    DMatrix::from_iterator(D, D, covariance.iter().cloned())
}

/// Uniform vector view of a measurement, as consumed by the filter.
pub trait MeasurementModel {
    fn dimension(&self) -> usize;
    fn vector(&self) -> DVector<f64>;
    fn noise(&self) -> DMatrix<f64>;
    fn validate(&self) -> Result<(), FilterError> {
        check_measurement(self.vector().as_slice(), &self.noise())
    }
}

/// 2D position in the navigation frame (m).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct XyPosition {
    pub mean: Vector2<f64>,
    pub covariance: Matrix2<f64>,
}

impl MeasurementModel for XyPosition {
    fn dimension(&self) -> usize {
        2
    }
    fn vector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.mean.as_slice())
    }
    fn noise(&self) -> DMatrix<f64> {
        dynamic(&self.covariance)
    }
}

/// Altitude of the IMU in the navigation frame (m).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ZPosition {
    pub mean: f64,
    pub variance: f64,
}

impl MeasurementModel for ZPosition {
    fn dimension(&self) -> usize {
        1
    }
    fn vector(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.mean])
    }
    fn noise(&self) -> DMatrix<f64> {
        DMatrix::from_vec(1, 1, vec![self.variance])
    }
}

/// Liquid pressure in pascal, with the pressure sensor lever arm in the IMU
/// frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pressure {
    pub mean: f64,
    pub variance: f64,
    #[serde(default = "zero_vector3")]
    pub sensor_in_imu: Vector3<f64>,
}

impl MeasurementModel for Pressure {
    fn dimension(&self) -> usize {
        1
    }
    fn vector(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.mean])
    }
    fn noise(&self) -> DMatrix<f64> {
        DMatrix::from_vec(1, 1, vec![self.variance])
    }
    fn validate(&self) -> Result<(), FilterError> {
        check_measurement(self.vector().as_slice(), &self.noise())?;
        if self.sensor_in_imu.iter().any(|value| !value.is_finite()) {
            return Err(FilterError::InvalidMeasurement(
                "pressure sensor lever arm is not finite".into(),
            ));
        }
        Ok(())
    }
}

/// Rotation rates of the IMU in the IMU frame (rad/s). Not an update: the
/// value is cached as the input of the next prediction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RotationRate {
    pub mean: Vector3<f64>,
    pub covariance: Matrix3<f64>,
}

impl MeasurementModel for RotationRate {
    fn dimension(&self) -> usize {
        3
    }
    fn vector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.mean.as_slice())
    }
    fn noise(&self) -> DMatrix<f64> {
        dynamic(&self.covariance)
    }
}

/// Velocities in the IMU frame (m/s), typically from a DVL.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Velocity {
    pub mean: Vector3<f64>,
    pub covariance: Matrix3<f64>,
}

impl MeasurementModel for Velocity {
    fn dimension(&self) -> usize {
        3
    }
    fn vector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.mean.as_slice())
    }
    fn noise(&self) -> DMatrix<f64> {
        dynamic(&self.covariance)
    }
}

/// Accelerations of the IMU in the IMU frame (m/s²).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Acceleration {
    pub mean: Vector3<f64>,
    pub covariance: Matrix3<f64>,
}

impl MeasurementModel for Acceleration {
    fn dimension(&self) -> usize {
        3
    }
    fn vector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.mean.as_slice())
    }
    fn noise(&self) -> DMatrix<f64> {
        dynamic(&self.covariance)
    }
}

/// Horizontal water velocities from an ADCP, expressed in the IMU frame.
///
/// `cell_weighting` blends the deeper ADCP cell against the current at
/// vehicle depth: 0 observes only the surface cell, 1 only the deep cell.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WaterCurrents {
    pub mean: Vector2<f64>,
    pub covariance: Matrix2<f64>,
    #[serde(default)]
    pub cell_weighting: f64,
}

impl MeasurementModel for WaterCurrents {
    fn dimension(&self) -> usize {
        2
    }
    fn vector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.mean.as_slice())
    }
    fn noise(&self) -> DMatrix<f64> {
        dynamic(&self.covariance)
    }
    fn validate(&self) -> Result<(), FilterError> {
        check_measurement(self.vector().as_slice(), &self.noise())?;
        if !(0.0..=1.0).contains(&self.cell_weighting) {
            return Err(FilterError::InvalidMeasurement(format!(
                "cell weighting {} is outside [0, 1]",
                self.cell_weighting
            )));
        }
        Ok(())
    }
}

/// Forces and torques in the body frame (N, Nm), usually derived from
/// thruster commands.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BodyEfforts {
    pub mean: Vector6<f64>,
    pub covariance: Matrix6<f64>,
    /// When set, orientation, water velocity and body acceleration are
    /// frozen at the current filter mean so the measurement constrains the
    /// velocity only.
    #[serde(default)]
    pub only_affect_velocity: bool,
}

impl MeasurementModel for BodyEfforts {
    fn dimension(&self) -> usize {
        6
    }
    fn vector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.mean.as_slice())
    }
    fn noise(&self) -> DMatrix<f64> {
        dynamic(&self.covariance)
    }
}

/// Latitude and longitude in WGS84, radians; uncertainty expressed in meters
/// on the earth surface. `gps_in_body` is the antenna lever arm.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeographicPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub covariance: Matrix2<f64>,
    #[serde(default = "zero_vector3")]
    pub gps_in_body: Vector3<f64>,
}

impl MeasurementModel for GeographicPosition {
    fn dimension(&self) -> usize {
        2
    }
    fn vector(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.latitude, self.longitude])
    }
    fn noise(&self) -> DMatrix<f64> {
        dynamic(&self.covariance)
    }
    fn validate(&self) -> Result<(), FilterError> {
        check_measurement(self.vector().as_slice(), &self.noise())?;
        if self.gps_in_body.iter().any(|value| !value.is_finite()) {
            return Err(FilterError::InvalidMeasurement(
                "GPS lever arm is not finite".into(),
            ));
        }
        Ok(())
    }
}

/// Pinhole camera intrinsics of the undistorted image.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CameraConfiguration {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraConfiguration {
    fn validate(&self) -> Result<(), FilterError> {
        let values = [self.fx, self.fy, self.cx, self.cy];
        if values.iter().any(|value| !value.is_finite()) || self.fx == 0.0 || self.fy == 0.0 {
            return Err(FilterError::InvalidMeasurement(
                "camera intrinsics are degenerate".into(),
            ));
        }
        Ok(())
    }
}

/// One feature of a visual marker in undistorted image coordinates, with its
/// pixel covariance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VisualFeature {
    pub pixel: Vector2<f64>,
    pub covariance: Matrix2<f64>,
}

impl MeasurementModel for VisualFeature {
    fn dimension(&self) -> usize {
        2
    }
    fn vector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.pixel.as_slice())
    }
    fn noise(&self) -> DMatrix<f64> {
        dynamic(&self.covariance)
    }
}

/// A batch of visual marker features: the (usually four) corners of a marker
/// whose feature positions are known in the marker frame, plus the marker
/// pose estimate in the navigation frame with its 6×6 covariance.
///
/// `features` and `feature_positions` must be of equal size and order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VisualFeatures {
    pub features: Vec<VisualFeature>,
    pub feature_positions: Vec<Vector3<f64>>,
    pub marker_pose: Isometry3<f64>,
    pub marker_covariance: Matrix6<f64>,
    pub camera: CameraConfiguration,
    pub camera_in_imu: Isometry3<f64>,
}

impl VisualFeatures {
    pub fn validate(&self) -> Result<(), FilterError> {
        if self.features.len() != self.feature_positions.len() {
            return Err(FilterError::InvalidMeasurement(format!(
                "{} image features for {} marker-frame positions",
                self.features.len(),
                self.feature_positions.len()
            )));
        }
        self.camera.validate()?;
        for feature in &self.features {
            feature.validate()?;
        }
        for position in &self.feature_positions {
            if position.iter().any(|value| !value.is_finite()) {
                return Err(FilterError::InvalidMeasurement(
                    "marker feature position is not finite".into(),
                ));
            }
        }
        let pose_finite = self
            .marker_pose
            .translation
            .vector
            .iter()
            .chain(self.marker_pose.rotation.as_ref().coords.iter())
            .all(|value| value.is_finite());
        if !pose_finite {
            return Err(FilterError::InvalidMeasurement(
                "marker pose is not finite".into(),
            ));
        }
        if !linalg::is_positive_semidefinite(&dynamic(&self.marker_covariance)) {
            return Err(FilterError::InvalidMeasurement(
                "marker pose covariance is not symmetric positive semi-definite".into(),
            ));
        }
        Ok(())
    }
}

/// Tagged measurement accepted by the dispatcher in
/// [`PoseUkf::integrate`](crate::filter::PoseUkf::integrate).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PoseMeasurement {
    XyPosition(XyPosition),
    ZPosition(ZPosition),
    Pressure(Pressure),
    RotationRate(RotationRate),
    Velocity(Velocity),
    Acceleration(Acceleration),
    WaterCurrents(WaterCurrents),
    BodyEfforts(BodyEfforts),
    GeographicPosition(GeographicPosition),
    VisualFeatures(VisualFeatures),
}
