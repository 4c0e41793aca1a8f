//! Haversine great-circle distance, used to derive implied travel speed
//! between two successive observed locations.

const EARTH_RADIUS_KM: f64 = 6371.0;
const KM_TO_MILES: f64 = 0.621371;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coords {
    pub lat: f64,
    pub lng: f64,
}

/// Great-circle distance between two points, in miles.
pub fn haversine_miles(a: Coords, b: Coords) -> f64 {
    let (lat1, lng1) = (a.lat.to_radians(), a.lng.to_radians());
    let (lat2, lng2) = (b.lat.to_radians(), b.lng.to_radians());
    let dlat = lat2 - lat1;
    let dlng = lng2 - lng1;

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    let distance_km = 2.0 * EARTH_RADIUS_KM * h.sqrt().asin();
    distance_km * KM_TO_MILES
}

/// geo_velocity_mph = haversine(last, current) / Δt_hours. Returns 0 if
/// either point is missing or Δt < 1 second (avoids a divide-by-near-zero
/// blowup on back-to-back requests).
pub fn velocity_mph(last: Option<Coords>, current: Option<Coords>, delta_t_ms: i64) -> f64 {
    let (Some(last), Some(current)) = (last, current) else {
        return 0.0;
    };
    if delta_t_ms < 1000 {
        return 0.0;
    }
    let hours = delta_t_ms as f64 / 3_600_000.0;
    haversine_miles(last, current) / hours
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distance_yields_zero_velocity() {
        let p = Coords { lat: 40.0, lng: -74.0 };
        assert_eq!(haversine_miles(p, p), 0.0);
    }

    #[test]
    fn missing_history_yields_zero() {
        let p = Coords { lat: 40.0, lng: -74.0 };
        assert_eq!(velocity_mph(None, Some(p), 3_600_000), 0.0);
    }

    #[test]
    fn sub_second_delta_yields_zero() {
        let a = Coords { lat: 40.0, lng: -74.0 };
        let b = Coords { lat: 34.0, lng: -118.0 };
        assert_eq!(velocity_mph(Some(a), Some(b), 500), 0.0);
    }

    #[test]
    fn ny_to_la_in_one_hour_is_impossible_travel() {
        let ny = Coords { lat: 40.7128, lng: -74.0060 };
        let la = Coords { lat: 34.0522, lng: -118.2437 };
        let mph = velocity_mph(Some(ny), Some(la), 3_600_000);
        assert!(mph > 500.0);
    }
}
