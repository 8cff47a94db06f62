//! End-to-end scenarios for the pose filter: dead reckoning, sensor
//! anchoring, current partitioning, innovation gating and visual marker
//! updates.

use assert_approx_eq::assert_approx_eq;
use nalgebra::{
    DMatrix, Isometry3, Matrix2, Matrix3, Matrix6, Point3, Rotation3, Translation3,
    UnitQuaternion, Vector2, Vector3,
};

use auvnav::dynamics::UwvModelParameters;
use auvnav::earth;
use auvnav::filter::{LocationConfiguration, PoseUkf, PoseUkfParameters};
use auvnav::kalman::UpdateOutcome;
use auvnav::measurements::{
    CameraConfiguration, Pressure, Velocity, VisualFeature, VisualFeatures, WaterCurrents,
    XyPosition,
};
use auvnav::{tangent, PoseState, POSE_STATE_DOF};

const REFERENCE_LATITUDE: f64 = 0.5;

fn test_location() -> LocationConfiguration {
    LocationConfiguration {
        latitude: REFERENCE_LATITUDE,
        longitude: 0.1,
    }
}

/// Diagonal covariance with a small default variance and explicit values for
/// selected tangent blocks.
fn covariance_with(default: f64, blocks: &[(usize, usize, f64)]) -> DMatrix<f64> {
    let mut covariance =
        DMatrix::from_diagonal_element(POSE_STATE_DOF, POSE_STATE_DOF, default);
    for &(offset, length, variance) in blocks {
        for i in 0..length {
            covariance[(offset + i, offset + i)] = variance;
        }
    }
    covariance
}

fn build_filter(initial_state: PoseState, covariance: DMatrix<f64>) -> PoseUkf {
    PoseUkf::new(
        initial_state,
        covariance,
        &test_location(),
        UwvModelParameters::default(),
        PoseUkfParameters::default(),
        None,
    )
    .expect("filter construction")
}

#[test]
fn static_holding_preserves_position_and_velocity() {
    let mut filter = build_filter(PoseState::default(), DMatrix::zeros(POSE_STATE_DOF, POSE_STATE_DOF));
    for _ in 0..100 {
        filter.predict(0.01).unwrap();
    }
    assert!(
        filter.state().position.norm() < 1e-9,
        "position drifted to {:?}",
        filter.state().position
    );
    assert!(filter.state().velocity.norm() < 1e-9);

    // with no gyro input the orientation precesses against the earth
    // rotation at the reference latitude
    let drift = filter.state().orientation.scaled_axis();
    let expected = -earth::earth_rotation_nwu(REFERENCE_LATITUDE);
    assert_approx_eq!(drift.x, expected.x, 1e-8);
    assert_approx_eq!(drift.y, expected.y, 1e-8);
    assert_approx_eq!(drift.z, expected.z, 1e-8);
}

#[test]
fn dvl_only_straight_line() {
    let covariance = covariance_with(1e-12, &[(tangent::VELOCITY, 3, 1.0)]);
    let mut filter = build_filter(PoseState::default(), covariance);
    let measurement = Velocity {
        mean: Vector3::new(1.0, 0.0, 0.0),
        covariance: Matrix3::identity() * 1e-4,
    };
    for _ in 0..1000 {
        filter.predict(0.01).unwrap();
        let outcome = filter.integrate_velocity(&measurement).unwrap();
        assert!(outcome.is_applied());
    }
    assert_approx_eq!(filter.state().position.x, 10.0, 0.05);
    assert!(filter.state().position.y.abs() < 0.05);
    assert!(filter.state().position.z.abs() < 0.05);
    assert_approx_eq!(filter.state().velocity.x, 1.0, 0.01);
}

#[test]
fn pressure_anchors_depth() {
    let covariance = covariance_with(1e-12, &[(tangent::POSITION + 2, 1, 1e4)]);
    let mut state = PoseState::default();
    state.gravity = 9.81;
    let mut filter = build_filter(state, covariance);

    let depth_sigma_before = filter.covariance()[(2, 2)].sqrt();
    assert_approx_eq!(depth_sigma_before, 100.0, 1e-6);

    // pressure consistent with z = -5 m at rho = 1025 kg/m^3
    let observed = 101_325.0 + 5.0 * 9.81 * 1025.0;
    let outcome = filter
        .integrate_pressure(&Pressure {
            mean: observed,
            variance: 1e4,
            sensor_in_imu: Vector3::zeros(),
        })
        .unwrap();
    assert!(outcome.is_applied());

    assert_approx_eq!(filter.state().position.z, -5.0, 0.1);
    let depth_sigma_after = filter.covariance()[(2, 2)].sqrt();
    assert!(
        depth_sigma_after < depth_sigma_before / 10.0,
        "depth sigma only shrank from {depth_sigma_before} to {depth_sigma_after}"
    );
}

/// Posterior surface-cell current after one ADCP update with the given cell
/// weighting; the deeper cell is primed with a larger uncertainty, as after a
/// bottom-lock loss.
fn adcp_posterior_surface_current(cell_weighting: f64) -> f64 {
    let covariance = covariance_with(
        1e-12,
        &[
            (tangent::WATER_VELOCITY, 2, 1.0),
            (tangent::WATER_VELOCITY_BELOW, 2, 4.0),
        ],
    );
    let mut filter = build_filter(PoseState::default(), covariance);
    // a stationary vehicle in a 0.3 m/s northward current measures the water
    // moving at -0.3 m/s relative to the hull
    let measurement = WaterCurrents {
        mean: Vector2::new(-0.3, 0.0),
        covariance: Matrix2::identity() * 0.01,
        cell_weighting,
    };
    let outcome = filter.integrate_water_currents(&measurement).unwrap();
    assert!(outcome.is_applied());
    filter.state().water_velocity.x
}

#[test]
fn adcp_update_partitions_between_cells() {
    let surface_only = adcp_posterior_surface_current(0.0);
    assert!(
        surface_only > 0.2 && surface_only < 0.3,
        "surface-only posterior current {surface_only}"
    );
    let blended = adcp_posterior_surface_current(0.5);
    assert!(
        blended > 0.05 && blended < 0.15,
        "blended posterior current {blended}"
    );
}

#[test]
fn innovation_gate_rejects_gross_outliers() {
    let covariance = covariance_with(1e-12, &[(tangent::POSITION, 2, 0.5)]);
    let mut filter = build_filter(PoseState::default(), covariance);
    let trace_before = filter.covariance().trace();

    // 5 sigma off in each axis: d2 = 50 against S = I
    let outlier = XyPosition {
        mean: Vector2::new(5.0, 5.0),
        covariance: Matrix2::identity() * 0.5,
    };
    let outcome = filter.integrate_xy_position(&outlier).unwrap();
    assert!(matches!(outcome, UpdateOutcome::Rejected { .. }));
    assert_eq!(filter.covariance().trace(), trace_before);
    assert!(filter.state().position.norm() < 1e-12);

    // a 1 sigma measurement passes and tightens the estimate
    let inlier = XyPosition {
        mean: Vector2::new(0.5, 0.5),
        covariance: Matrix2::identity() * 0.5,
    };
    let outcome = filter.integrate_xy_position(&inlier).unwrap();
    assert!(outcome.is_applied());
    assert!(filter.covariance().trace() < trace_before);
}

#[test]
fn visual_marker_constrains_bearing_directions() {
    // attitude well known (fiber optic gyro grade), position uncertain
    let covariance = covariance_with(
        1e-9,
        &[
            (tangent::POSITION, 3, 1.0),
            (tangent::ORIENTATION, 3, 1e-6),
        ],
    );
    let mut filter = build_filter(PoseState::default(), covariance);

    let camera = CameraConfiguration {
        fx: 800.0,
        fy: 800.0,
        cx: 320.0,
        cy: 240.0,
    };
    // front-looking camera: camera z = body x, camera x = -body y (east),
    // camera y = -body z (down)
    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(
        Matrix3::from_columns(&[
            Vector3::new(0.0, -1.0, 0.0),
            Vector3::new(0.0, 0.0, -1.0),
            Vector3::new(1.0, 0.0, 0.0),
        ]),
    ));
    let camera_in_imu = Isometry3::from_parts(Translation3::identity(), rotation);
    let marker_pose = Isometry3::from_parts(
        Translation3::new(10.0, 0.0, -2.0),
        UnitQuaternion::identity(),
    );
    let corners = [
        Vector3::new(0.01, 0.01, 0.0),
        Vector3::new(-0.01, 0.01, 0.0),
        Vector3::new(-0.01, -0.01, 0.0),
        Vector3::new(0.01, -0.01, 0.0),
    ];

    // exact projections of the corners for a vehicle at the origin with
    // identity attitude, observed with 1 px sigma
    let features: Vec<VisualFeature> = corners
        .iter()
        .map(|corner| {
            let corner_nav = marker_pose * Point3::from(*corner);
            let in_camera = camera_in_imu.inverse_transform_point(&corner_nav);
            VisualFeature {
                pixel: Vector2::new(
                    camera.fx * in_camera.x / in_camera.z + camera.cx,
                    camera.fy * in_camera.y / in_camera.z + camera.cy,
                ),
                covariance: Matrix2::identity(),
            }
        })
        .collect();
    let batch = VisualFeatures {
        features,
        feature_positions: corners.to_vec(),
        marker_pose,
        marker_covariance: Matrix6::identity() * 1e-6,
        camera,
        camera_in_imu,
    };

    let prior = filter.covariance().clone();
    let applied = filter.integrate_visual_features(&batch).unwrap();
    assert_eq!(applied, 4);
    let posterior = filter.covariance();

    // the directions perpendicular to the camera boresight collapse
    assert!(
        posterior[(1, 1)] < 0.1 * prior[(1, 1)],
        "lateral position variance {} did not collapse",
        posterior[(1, 1)]
    );
    assert!(posterior[(2, 2)] < 0.1 * prior[(2, 2)]);
    // the range direction stays weakly observed by four near-coincident
    // corners
    assert!(posterior[(0, 0)] > 0.5 * prior[(0, 0)]);
    // roll about the camera boresight is not observable from features this
    // close to the optical axis
    let roll = tangent::ORIENTATION;
    assert!(posterior[(roll, roll)] > 0.5 * prior[(roll, roll)]);
}

#[test]
fn rotation_rate_feeds_the_prediction() {
    let mut filter = build_filter(
        PoseState::default(),
        DMatrix::zeros(POSE_STATE_DOF, POSE_STATE_DOF),
    );
    // gyro exactly cancelling the earth rotation keeps the attitude fixed
    let earth_rotation = earth::earth_rotation_nwu(REFERENCE_LATITUDE);
    filter
        .integrate_rotation_rate(&auvnav::measurements::RotationRate {
            mean: earth_rotation,
            covariance: Matrix3::identity() * 1e-10,
        })
        .unwrap();
    for _ in 0..100 {
        filter.predict(0.01).unwrap();
    }
    let drift = filter.state().orientation.scaled_axis();
    assert!(drift.norm() < 1e-9, "attitude drifted by {}", drift.norm());
}
