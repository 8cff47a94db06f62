//! Model-aided inertial localization for autonomous underwater vehicles.
//!
//! This crate implements the estimation core of a full-model-aided inertial
//! localization solution for AUVs: an Unscented Kalman Filter over a
//! manifold-valued state that fuses rotation rates and accelerations from an
//! IMU, velocities from a DVL, pressure, geographic position fixes, water
//! current profiles from an ADCP, visual marker observations and
//! motion-model derived body efforts into a single pose, velocity and
//! parameter estimate. Given gyroscopes capable of sensing the rotation of
//! the earth (e.g. a fiber optic gyro) the filter is able to estimate its
//! true heading.
//!
//! The crate is primarily built off of three dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): linear algebra for the
//!   filter and the state types.
//! - [`nav-types`](https://crates.io/crates/nav-types): geodetic coordinate
//!   types at the projection interface.
//! - [`serde`](https://crates.io/crates/serde): (de)serialization of
//!   configuration bundles and tagged measurements.
//!
//! ## Crate overview
//!
//! - [earth]: WGS84 constants, Earth rotation and the local NWU projection.
//! - [dynamics]: the rigid-body AUV motion model and the learned
//!   support-vector effort predictor.
//! - [measurements]: measurement containers and validation.
//! - [kalman]: the manifold unscented Kalman filter engine.
//! - [linalg]: matrix square root and robust solve helpers.
//! - [filter]: the [`PoseUkf`](filter::PoseUkf) estimator tying the pieces
//!   together.
//!
//! ## State manifold
//!
//! The filter state [`PoseState`] lives on a product manifold mixing vector
//! spaces, the rotation group SO(3) and (for bearing observations) the unit
//! sphere S². Instead of a parallel hierarchy of state types, the state is a
//! composite value with an explicit tangent-dimension map (the offsets in
//! [`tangent`]) and a single retraction operator dispatched per sub-block:
//! plain addition for vector blocks, right-multiplication with the
//! exponential of the tangent slice for the orientation, and the great-circle
//! retraction for sphere-valued observations. The pairing of
//! [`Manifold::boxplus`] and [`Manifold::boxminus`] is what the engine in
//! [kalman] uses to spread sigma points and to recombine means and
//! covariances without ever leaving the manifold.
//!
//! NOTE: In this filter the IMU frame is, in order to keep a certain
//! algorithmic simplicity, not considered to be rotated with respect to the
//! body frame. Rotation rates and accelerations, as well as the corresponding
//! configuration parameters, would need to be rotated to the body frame
//! before being integrated in this filter.

pub mod dynamics;
pub mod earth;
pub mod filter;
pub mod kalman;
pub mod linalg;
pub mod measurements;

use std::fmt;

use nalgebra::{DVector, Matrix3, Unit, UnitQuaternion, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::earth::GeographicProjection;
use crate::filter::{ParameterOffsets, PoseUkfParameters};

/// Errors surfaced by the filter.
///
/// Gate rejections are deliberately not an error: they are an expected
/// outcome reported through [`kalman::UpdateOutcome`].
#[derive(Clone, Debug, PartialEq)]
pub enum FilterError {
    /// A measurement mean or covariance contains non-finite values, or the
    /// covariance is not symmetric positive semi-definite. The measurement is
    /// dropped and the filter state is unchanged.
    InvalidMeasurement(String),
    /// A Cholesky factorization or linear solve failed. During an update the
    /// measurement is dropped and the state is unchanged; during a predict
    /// the covariance has lost meaning and the filter instance must be
    /// rebuilt.
    NumericalFailure(&'static str),
    /// A construction-time problem: mis-sized covariance, missing effort
    /// predictor parameter block, invalid projection reference or non-finite
    /// parameters.
    UnsupportedConfiguration(String),
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::InvalidMeasurement(reason) => {
                write!(f, "invalid measurement: {reason}")
            }
            FilterError::NumericalFailure(context) => {
                write!(f, "numerical failure in {context}")
            }
            FilterError::UnsupportedConfiguration(reason) => {
                write!(f, "unsupported configuration: {reason}")
            }
        }
    }
}

impl std::error::Error for FilterError {}

/// A point on a smooth manifold with a tangent-space retraction.
///
/// `boxplus` maps a tangent vector onto the manifold around `self`;
/// `boxminus` is its left inverse, lifting the difference to another point
/// into the tangent space at `other`. For plain vector spaces both operators
/// reduce to addition and subtraction.
pub trait Manifold: Clone {
    /// Tangent-space dimension.
    fn dof(&self) -> usize;
    /// Retraction: moves away from `self` along `delta`.
    fn boxplus(&self, delta: &DVector<f64>) -> Self;
    /// Lifting: the tangent vector `delta` with `other.boxplus(delta) ≈ self`
    /// for small differences.
    fn boxminus(&self, other: &Self) -> DVector<f64>;
}

impl Manifold for DVector<f64> {
    fn dof(&self) -> usize {
        self.len()
    }

    fn boxplus(&self, delta: &DVector<f64>) -> Self {
        debug_assert_eq!(delta.len(), self.len());
        self + delta
    }

    fn boxminus(&self, other: &Self) -> DVector<f64> {
        debug_assert_eq!(other.len(), self.len());
        self - other
    }
}

/// Tangent-space offsets of the [`PoseState`] sub-blocks.
///
/// The packing order matters: it fixes the meaning of every row and column of
/// the state covariance and of the process noise.
pub mod tangent {
    pub const POSITION: usize = 0;
    pub const ORIENTATION: usize = 3;
    pub const VELOCITY: usize = 6;
    pub const ACCELERATION: usize = 9;
    pub const BIAS_GYRO: usize = 12;
    pub const BIAS_ACC: usize = 15;
    pub const GRAVITY: usize = 18;
    pub const INERTIA: usize = 19;
    pub const LIN_DAMPING: usize = 28;
    pub const QUAD_DAMPING: usize = 37;
    pub const WATER_VELOCITY: usize = 46;
    pub const WATER_VELOCITY_BELOW: usize = 48;
    pub const BIAS_ADCP: usize = 50;
    pub const WATER_DENSITY: usize = 52;
}

/// Tangent dimension of [`PoseState`].
pub const POSE_STATE_DOF: usize = 53;

/// The filter state: a point on the product manifold
/// `R³ × SO(3) × R³ × R³ × R³ × R³ × R × R⁹ × R⁹ × R⁹ × R² × R² × R² × R`.
///
/// Positions and velocities are expressed in the local NWU navigation frame,
/// the orientation maps IMU-frame vectors into the navigation frame. The
/// 3×3 matrix-valued sub-states hold the planar+yaw block of the
/// hydrodynamic parameters estimated on-line; their tangent packing is
/// column-major. Scalar-positive quantities (gravity magnitude, water
/// density) are carried as unconstrained scalars whose process noise is small
/// relative to their magnitude.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoseState {
    /// AUV position in the navigation frame (m).
    pub position: Vector3<f64>,
    /// IMU-to-navigation rotation.
    pub orientation: UnitQuaternion<f64>,
    /// IMU velocity in the navigation frame (m/s).
    pub velocity: Vector3<f64>,
    /// IMU acceleration in the navigation frame (m/s²).
    pub acceleration: Vector3<f64>,
    /// Gyroscope bias (rad/s).
    pub bias_gyro: Vector3<f64>,
    /// Accelerometer bias (m/s²).
    pub bias_acc: Vector3<f64>,
    /// Local gravitational magnitude (m/s²).
    pub gravity: f64,
    /// Planar+yaw block of the inertia matrix.
    pub inertia: Matrix3<f64>,
    /// Planar+yaw block of the linear damping matrix.
    pub lin_damping: Matrix3<f64>,
    /// Planar+yaw block of the quadratic damping matrix.
    pub quad_damping: Matrix3<f64>,
    /// Horizontal water current at vehicle depth (m/s).
    pub water_velocity: Vector2<f64>,
    /// Horizontal water current in the deeper ADCP cell (m/s).
    pub water_velocity_below: Vector2<f64>,
    /// ADCP measurement bias (m/s).
    pub bias_adcp: Vector2<f64>,
    /// Water density (kg/m³).
    pub water_density: f64,
}

impl Default for PoseState {
    fn default() -> Self {
        PoseState {
            position: Vector3::zeros(),
            orientation: UnitQuaternion::identity(),
            velocity: Vector3::zeros(),
            acceleration: Vector3::zeros(),
            bias_gyro: Vector3::zeros(),
            bias_acc: Vector3::zeros(),
            gravity: 9.80665,
            inertia: Matrix3::identity(),
            lin_damping: Matrix3::zeros(),
            quad_damping: Matrix3::zeros(),
            water_velocity: Vector2::zeros(),
            water_velocity_below: Vector2::zeros(),
            bias_adcp: Vector2::zeros(),
            water_density: 1025.0,
        }
    }
}

impl Manifold for PoseState {
    fn dof(&self) -> usize {
        POSE_STATE_DOF
    }

    fn boxplus(&self, delta: &DVector<f64>) -> Self {
        debug_assert_eq!(delta.len(), POSE_STATE_DOF);
        let rotation = UnitQuaternion::from_scaled_axis(
            delta.fixed_rows::<3>(tangent::ORIENTATION).into_owned(),
        );
        let mut orientation = self.orientation * rotation;
        orientation.renormalize();
        PoseState {
            position: self.position + delta.fixed_rows::<3>(tangent::POSITION),
            orientation,
            velocity: self.velocity + delta.fixed_rows::<3>(tangent::VELOCITY),
            acceleration: self.acceleration + delta.fixed_rows::<3>(tangent::ACCELERATION),
            bias_gyro: self.bias_gyro + delta.fixed_rows::<3>(tangent::BIAS_GYRO),
            bias_acc: self.bias_acc + delta.fixed_rows::<3>(tangent::BIAS_ACC),
            gravity: self.gravity + delta[tangent::GRAVITY],
            inertia: self.inertia
                + Matrix3::from_iterator(delta.rows(tangent::INERTIA, 9).iter().cloned()),
            lin_damping: self.lin_damping
                + Matrix3::from_iterator(delta.rows(tangent::LIN_DAMPING, 9).iter().cloned()),
            quad_damping: self.quad_damping
                + Matrix3::from_iterator(delta.rows(tangent::QUAD_DAMPING, 9).iter().cloned()),
            water_velocity: self.water_velocity
                + delta.fixed_rows::<2>(tangent::WATER_VELOCITY),
            water_velocity_below: self.water_velocity_below
                + delta.fixed_rows::<2>(tangent::WATER_VELOCITY_BELOW),
            bias_adcp: self.bias_adcp + delta.fixed_rows::<2>(tangent::BIAS_ADCP),
            water_density: self.water_density + delta[tangent::WATER_DENSITY],
        }
    }

    fn boxminus(&self, other: &Self) -> DVector<f64> {
        let mut delta = DVector::zeros(POSE_STATE_DOF);
        delta
            .fixed_rows_mut::<3>(tangent::POSITION)
            .copy_from(&(self.position - other.position));
        delta
            .fixed_rows_mut::<3>(tangent::ORIENTATION)
            .copy_from(&(other.orientation.inverse() * self.orientation).scaled_axis());
        delta
            .fixed_rows_mut::<3>(tangent::VELOCITY)
            .copy_from(&(self.velocity - other.velocity));
        delta
            .fixed_rows_mut::<3>(tangent::ACCELERATION)
            .copy_from(&(self.acceleration - other.acceleration));
        delta
            .fixed_rows_mut::<3>(tangent::BIAS_GYRO)
            .copy_from(&(self.bias_gyro - other.bias_gyro));
        delta
            .fixed_rows_mut::<3>(tangent::BIAS_ACC)
            .copy_from(&(self.bias_acc - other.bias_acc));
        delta[tangent::GRAVITY] = self.gravity - other.gravity;
        for (k, (own, theirs)) in self.inertia.iter().zip(other.inertia.iter()).enumerate() {
            delta[tangent::INERTIA + k] = own - theirs;
        }
        for (k, (own, theirs)) in self
            .lin_damping
            .iter()
            .zip(other.lin_damping.iter())
            .enumerate()
        {
            delta[tangent::LIN_DAMPING + k] = own - theirs;
        }
        for (k, (own, theirs)) in self
            .quad_damping
            .iter()
            .zip(other.quad_damping.iter())
            .enumerate()
        {
            delta[tangent::QUAD_DAMPING + k] = own - theirs;
        }
        delta
            .fixed_rows_mut::<2>(tangent::WATER_VELOCITY)
            .copy_from(&(self.water_velocity - other.water_velocity));
        delta
            .fixed_rows_mut::<2>(tangent::WATER_VELOCITY_BELOW)
            .copy_from(&(self.water_velocity_below - other.water_velocity_below));
        delta
            .fixed_rows_mut::<2>(tangent::BIAS_ADCP)
            .copy_from(&(self.bias_adcp - other.bias_adcp));
        delta[tangent::WATER_DENSITY] = self.water_density - other.water_density;
        delta
    }
}

/// A unit bearing on the sphere S², used as the observation space of visual
/// features. Two intrinsic degrees of freedom; the retraction moves along a
/// great circle by the tangent-vector norm.
#[derive(Clone, Debug)]
pub struct Bearing(Unit<Vector3<f64>>);

impl Bearing {
    /// Creates a bearing from an (unnormalized) direction. Returns `None` for
    /// a near-zero direction.
    pub fn new(direction: Vector3<f64>) -> Option<Self> {
        Unit::try_new(direction, 1e-12).map(Bearing)
    }

    /// The +z bearing, used as a safe stand-in for degenerate directions.
    pub fn forward() -> Self {
        Bearing(Unit::new_unchecked(Vector3::z()))
    }

    /// The unit direction vector.
    pub fn direction(&self) -> &Vector3<f64> {
        self.0.as_ref()
    }

    /// Deterministic orthonormal basis of the tangent plane at this bearing.
    fn tangent_basis(&self) -> (Vector3<f64>, Vector3<f64>) {
        let normal = self.0.as_ref();
        let helper = if normal.x.abs() < 0.9 {
            Vector3::x()
        } else {
            Vector3::y()
        };
        let e1 = normal.cross(&helper).normalize();
        let e2 = normal.cross(&e1);
        (e1, e2)
    }
}

impl Manifold for Bearing {
    fn dof(&self) -> usize {
        2
    }

    fn boxplus(&self, delta: &DVector<f64>) -> Self {
        debug_assert_eq!(delta.len(), 2);
        let (e1, e2) = self.tangent_basis();
        let step = delta[0] * e1 + delta[1] * e2;
        let angle = step.norm();
        if angle < 1e-12 {
            return self.clone();
        }
        let direction = step / angle;
        let moved = angle.cos() * self.0.as_ref() + angle.sin() * direction;
        Bearing(Unit::new_normalize(moved))
    }

    fn boxminus(&self, other: &Self) -> DVector<f64> {
        let dot = self.0.dot(&other.0).clamp(-1.0, 1.0);
        let angle = dot.acos();
        let residual = self.0.as_ref() - dot * other.0.as_ref();
        let norm = residual.norm();
        if norm < 1e-12 {
            return DVector::zeros(2);
        }
        let direction = residual / norm;
        let (e1, e2) = other.tangent_basis();
        DVector::from_vec(vec![angle * direction.dot(&e1), angle * direction.dot(&e2)])
    }
}

/// Immutable collaborators of the process model for one prediction step.
///
/// The process model is a pure function over the input state; everything it
/// needs beyond the state is carried here instead of hiding in captured
/// state.
pub struct ProcessContext<'a> {
    /// Latest measured rotation rate in the IMU frame (rad/s).
    pub rotation_rate: Vector3<f64>,
    /// Projection used to recover the latitude at the current position.
    pub projection: &'a GeographicProjection,
    /// Filter parameter bundle (time constants and offsets).
    pub parameters: &'a PoseUkfParameters,
    /// Relaxation offsets for the on-line model parameters, captured at
    /// filter construction.
    pub offsets: &'a ParameterOffsets,
}

fn matrix_relaxation(
    delta: &mut DVector<f64>,
    offset: usize,
    current: &Matrix3<f64>,
    rest: &Matrix3<f64>,
    tau: f64,
) {
    for (k, (value, target)) in current.iter().zip(rest.iter()).enumerate() {
        delta[offset + k] = (-1.0 / tau) * (value - target);
    }
}

/// Advances the state by `delta_t` seconds through the discretized
/// continuous-time dynamics.
///
/// Position integrates velocity, velocity integrates acceleration, and the
/// orientation integrates the bias-corrected rotation rate expressed in the
/// navigation frame minus the Earth rotation at the current latitude. Every
/// drifting parameter sub-state relaxes towards its offset as a first-order
/// Markov process; water currents and the ADCP bias relax towards zero. The
/// gravity magnitude is constant unless explicitly updated by a measurement.
///
/// The whole step is a single tangent vector applied through
/// [`Manifold::boxplus`], which keeps the orientation normalized by
/// construction.
pub fn forward(state: &PoseState, context: &ProcessContext<'_>, delta_t: f64) -> PoseState {
    let parameters = context.parameters;
    let mut delta = DVector::zeros(POSE_STATE_DOF);

    delta
        .fixed_rows_mut::<3>(tangent::POSITION)
        .copy_from(&state.velocity);

    let (latitude, _) = context
        .projection
        .nav_to_world(state.position.x, state.position.y);
    let earth_rotation = earth::earth_rotation_nwu(latitude);
    let angular_velocity =
        state.orientation * (context.rotation_rate - state.bias_gyro) - earth_rotation;
    delta
        .fixed_rows_mut::<3>(tangent::ORIENTATION)
        .copy_from(&angular_velocity);

    delta
        .fixed_rows_mut::<3>(tangent::VELOCITY)
        .copy_from(&state.acceleration);

    delta.fixed_rows_mut::<3>(tangent::BIAS_GYRO).copy_from(
        &((state.bias_gyro - parameters.gyro_bias_offset) * (-1.0 / parameters.gyro_bias_tau)),
    );
    delta.fixed_rows_mut::<3>(tangent::BIAS_ACC).copy_from(
        &((state.bias_acc - parameters.acc_bias_offset) * (-1.0 / parameters.acc_bias_tau)),
    );

    matrix_relaxation(
        &mut delta,
        tangent::INERTIA,
        &state.inertia,
        &context.offsets.inertia,
        parameters.inertia_tau,
    );
    matrix_relaxation(
        &mut delta,
        tangent::LIN_DAMPING,
        &state.lin_damping,
        &context.offsets.lin_damping,
        parameters.lin_damping_tau,
    );
    matrix_relaxation(
        &mut delta,
        tangent::QUAD_DAMPING,
        &state.quad_damping,
        &context.offsets.quad_damping,
        parameters.quad_damping_tau,
    );

    delta
        .fixed_rows_mut::<2>(tangent::WATER_VELOCITY)
        .copy_from(&(state.water_velocity * (-1.0 / parameters.water_velocity_tau)));
    delta
        .fixed_rows_mut::<2>(tangent::WATER_VELOCITY_BELOW)
        .copy_from(&(state.water_velocity_below * (-1.0 / parameters.water_velocity_tau)));
    delta
        .fixed_rows_mut::<2>(tangent::BIAS_ADCP)
        .copy_from(&(state.bias_adcp * (-1.0 / parameters.adcp_bias_tau)));
    delta[tangent::WATER_DENSITY] = (-1.0 / parameters.water_density_tau)
        * (state.water_density - context.offsets.water_density);

    state.boxplus(&(delta * delta_t))
}
