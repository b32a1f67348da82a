//! Level conversions shared by gain staging and metrics.

/// Lowest level reported anywhere in the mixdown, in dBFS.
pub const FLOOR_DB: f32 = -120.0;

/// Samples below this magnitude count as silence.
pub const SILENCE_THRESHOLD: f32 = 1.0e-4;

#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    if db <= FLOOR_DB {
        0.0
    } else {
        10.0f32.powf(db * 0.05)
    }
}

#[inline]
pub fn linear_to_db(linear: f32) -> f32 {
    if linear <= 0.0 || !linear.is_finite() {
        FLOOR_DB
    } else {
        (20.0 * linear.log10()).max(FLOOR_DB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_round_trip_above_the_floor() {
        for db in [-96.0, -22.0, -6.0, 0.0, 6.0] {
            assert!((linear_to_db(db_to_linear(db)) - db).abs() < 1e-3);
        }
        assert_eq!(db_to_linear(-150.0), 0.0);
        assert_eq!(linear_to_db(0.0), FLOOR_DB);
    }
}
