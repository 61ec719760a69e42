//! Great-circle distance helpers

use crate::domain::types::LatLng;

/// Mean Earth radius used for haversine distances
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance between two coordinates in meters
pub fn haversine_m(a: LatLng, b: LatLng) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Point at `fraction` of the way from `a` to `b`, linear in degrees.
/// Good enough for the short distances between route steps.
pub fn interpolate(a: LatLng, b: LatLng, fraction: f64) -> LatLng {
    let f = fraction.clamp(0.0, 1.0);
    LatLng::new(a.lat + (b.lat - a.lat) * f, a.lng + (b.lng - a.lng) * f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_zero() {
        let p = LatLng::new(52.3791, 4.9003);
        assert!(haversine_m(p, p) < 1e-6);
    }

    #[test]
    fn test_haversine_known_distance() {
        // Amsterdam Centraal to Westerkerk, roughly 1.2 km
        let centraal = LatLng::new(52.3791, 4.9003);
        let westerkerk = LatLng::new(52.3743, 4.8831);
        let d = haversine_m(centraal, westerkerk);
        assert!((1200.0..1350.0).contains(&d), "distance was {d}");
    }

    #[test]
    fn test_haversine_small_offset() {
        // 0.0002 degrees of latitude is about 22 m
        let a = LatLng::new(52.0, 4.0);
        let b = LatLng::new(52.0002, 4.0);
        let d = haversine_m(a, b);
        assert!((21.0..24.0).contains(&d), "distance was {d}");
    }

    #[test]
    fn test_interpolate_clamps() {
        let a = LatLng::new(0.0, 0.0);
        let b = LatLng::new(10.0, 20.0);
        assert_eq!(interpolate(a, b, 0.5), LatLng::new(5.0, 10.0));
        assert_eq!(interpolate(a, b, 2.0), b);
    }
}
