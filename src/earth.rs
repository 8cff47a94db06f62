//! Earth-related constants and the local navigation-frame projection.
//!
//! The Earth is modeled as the WGS84 ellipsoid. This module provides the
//! principal radii of curvature, the Earth rotation vector expressed in the
//! local navigation frame, and a small equirectangular projection between
//! geodetic coordinates and the filter's local tangent plane.
//!
//! # Coordinate system
//! The navigation frame is north-west-up (NWU): +x points north, +y west and
//! +z up, with the origin at a fixed geodetic reference. The projection uses
//! the meridian and normal radii of curvature evaluated at the reference, so
//! round trips are exact and the error against the ellipsoid stays below a
//! meter within the ~10 km operating radius typical for an AUV deployment.
//! The [`nav-types`](https://crates.io/crates/nav-types) crate provides the
//! geodetic [`WGS84`] type used at the interface.

use nalgebra::Vector3;
use nav_types::WGS84;

use crate::FilterError;

/// Earth rotation rate in rad/s (omega_ie).
pub const RATE: f64 = 7.2921159e-5;
/// WGS84 semi-major axis in meters.
pub const EQUATORIAL_RADIUS: f64 = 6378137.0;
/// WGS84 semi-minor axis in meters.
pub const POLAR_RADIUS: f64 = 6356752.31425;
/// WGS84 first eccentricity.
pub const ECCENTRICITY: f64 = 0.0818191908425;
pub const ECCENTRICITY_SQUARED: f64 = ECCENTRICITY * ECCENTRICITY;

/// Principal radii of curvature of the WGS84 ellipsoid at a given latitude.
///
/// Returns `(meridian, normal)`: the meridian (north-south) radius and the
/// normal (east-west, prime vertical) radius in meters. Latitude in radians.
pub fn principal_radii(latitude: f64) -> (f64, f64) {
    let sin_latitude = latitude.sin();
    let denominator = 1.0 - ECCENTRICITY_SQUARED * sin_latitude * sin_latitude;
    let meridian = EQUATORIAL_RADIUS * (1.0 - ECCENTRICITY_SQUARED) / denominator.powf(1.5);
    let normal = EQUATORIAL_RADIUS / denominator.sqrt();
    (meridian, normal)
}

/// Earth rotation vector expressed in the NWU navigation frame at a given
/// latitude (radians): `(RATE * cos(latitude), 0, RATE * sin(latitude))`.
pub fn earth_rotation_nwu(latitude: f64) -> Vector3<f64> {
    Vector3::new(RATE * latitude.cos(), 0.0, RATE * latitude.sin())
}

/// Bidirectional map between geodetic coordinates and the local NWU tangent
/// plane around a fixed reference.
#[derive(Clone, Debug)]
pub struct GeographicProjection {
    reference_latitude: f64,
    reference_longitude: f64,
    meridian_radius: f64,
    normal_radius: f64,
}

impl GeographicProjection {
    /// Creates a projection around a reference latitude/longitude in radians.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, FilterError> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return Err(FilterError::UnsupportedConfiguration(
                "projection reference must be finite".into(),
            ));
        }
        if latitude.abs() > std::f64::consts::FRAC_PI_2 {
            return Err(FilterError::UnsupportedConfiguration(format!(
                "reference latitude {latitude} rad is outside [-pi/2, pi/2]"
            )));
        }
        let (meridian_radius, normal_radius) = principal_radii(latitude);
        Ok(GeographicProjection {
            reference_latitude: latitude,
            reference_longitude: longitude,
            meridian_radius,
            normal_radius,
        })
    }

    /// Creates a projection from a geodetic reference point.
    pub fn from_wgs84(reference: &WGS84<f64>) -> Result<Self, FilterError> {
        Self::new(reference.latitude_radians(), reference.longitude_radians())
    }

    /// Converts local NWU coordinates (meters) to latitude/longitude in
    /// radians.
    pub fn nav_to_world(&self, x: f64, y: f64) -> (f64, f64) {
        let latitude = self.reference_latitude + x / self.meridian_radius;
        let longitude = self.reference_longitude
            - y / (self.normal_radius * self.reference_latitude.cos());
        (latitude, longitude)
    }

    /// Converts latitude/longitude in radians to local NWU coordinates in
    /// meters.
    pub fn world_to_nav(&self, latitude: f64, longitude: f64) -> (f64, f64) {
        let x = (latitude - self.reference_latitude) * self.meridian_radius;
        let y = -(longitude - self.reference_longitude)
            * self.normal_radius
            * self.reference_latitude.cos();
        (x, y)
    }

    /// Converts local NWU coordinates to a geodetic point at zero altitude.
    pub fn nav_to_wgs84(&self, x: f64, y: f64) -> WGS84<f64> {
        let (latitude, longitude) = self.nav_to_world(x, y);
        WGS84::from_radians_and_meters(latitude, longitude, 0.0)
    }

    /// Reference latitude in radians.
    pub fn reference_latitude(&self) -> f64 {
        self.reference_latitude
    }

    /// Reference longitude in radians.
    pub fn reference_longitude(&self) -> f64 {
        self.reference_longitude
    }
}
