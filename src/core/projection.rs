use crate::types::{GeosProjection, SweepAxis};
use std::f64::consts::FRAC_PI_4;

/// Web Mercator (EPSG:3857) sphere radius
pub const WEB_MERCATOR_RADIUS: f64 = 6_378_137.0;

/// Web Mercator is undefined at the poles; clamp to the usual tile limit
const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

/// Project geodetic lon/lat (degrees) to Web Mercator meters
pub fn lonlat_to_mercator(lon: f64, lat: f64) -> (f64, f64) {
    let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
    let x = WEB_MERCATOR_RADIUS * lon.to_radians();
    let y = WEB_MERCATOR_RADIUS * (FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln();
    (x, y)
}

/// Inverse of [`lonlat_to_mercator`]
pub fn mercator_to_lonlat(x: f64, y: f64) -> (f64, f64) {
    let lon = (x / WEB_MERCATOR_RADIUS).to_degrees();
    let lat = (2.0 * (y / WEB_MERCATOR_RADIUS).exp().atan() - std::f64::consts::FRAC_PI_2).to_degrees();
    (lon, lat)
}

impl GeosProjection {
    /// Forward geostationary projection of geodetic lon/lat (degrees).
    ///
    /// Returns native coordinates in meters (scan angle times perspective
    /// height), or `None` when the point is not visible from the satellite.
    pub fn forward(&self, lon: f64, lat: f64) -> Option<(f64, f64)> {
        let a = self.semi_major_axis;
        let b = self.semi_minor_axis;
        let h = self.perspective_height;

        // Everything below is normalized by the semi-major axis
        let radius_p = b / a;
        let radius_p2 = radius_p * radius_p;
        let radius_p_inv2 = 1.0 / radius_p2;
        let radius_g_1 = h / a;
        let radius_g = 1.0 + radius_g_1;

        let lam = (lon - self.longitude_of_origin).to_radians();
        let phi = (radius_p2 * lat.to_radians().tan()).atan();

        let r = radius_p / (radius_p * phi.cos()).hypot(phi.sin());
        let vx = r * lam.cos() * phi.cos();
        let vy = r * lam.sin() * phi.cos();
        let vz = r * phi.sin();

        if (radius_g - vx) * vx - vy * vy - vz * vz * radius_p_inv2 < 0.0 {
            return None;
        }

        let tmp = radius_g - vx;
        let (x, y) = match self.sweep {
            SweepAxis::X => (
                radius_g_1 * (vy / vz.hypot(tmp)).atan(),
                radius_g_1 * (vz / tmp).atan(),
            ),
            SweepAxis::Y => (
                radius_g_1 * (vy / tmp).atan(),
                radius_g_1 * (vz / vy.hypot(tmp)).atan(),
            ),
        };

        Some((x * a, y * a))
    }
}
