//! Solar event times from the NOAA sunrise equation.
//!
//! Accuracy is within a couple of minutes for latitudes below the polar
//! circles, which is plenty for a scheduler that works at minute precision.

use chrono::{DateTime, NaiveDate, Utc};

use crate::error::{Result, SchedulerError};
use crate::types::SolarEvent;

const J2000: f64 = 2_451_545.0;
const UNIX_EPOCH_JD: f64 = 2_440_587.5;
const EARTH_OBLIQUITY_DEG: f64 = 23.4397;
/// Polar night or midnight sun can hide an event for months.
const SEARCH_HORIZON_DAYS: i64 = 370;

/// Materialized solar schedule for one event at one location.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolarRule {
    event: SolarEvent,
    latitude: f64,
    longitude: f64,
}

impl SolarRule {
    pub fn new(event: SolarEvent, latitude: f64, longitude: f64) -> Result<Self> {
        validate_coordinates(latitude, longitude)?;
        Ok(Self {
            event,
            latitude,
            longitude,
        })
    }

    pub fn event(&self) -> SolarEvent {
        self.event
    }

    /// The event's instant for the solar day centred on `date` (UTC), or
    /// `None` when the sun never crosses the event's altitude that day.
    pub fn event_on(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        let epoch = NaiveDate::from_ymd_opt(2000, 1, 1)?;
        let n = (date - epoch).num_days() as f64;

        // Mean solar time, then the sun's position along the ecliptic.
        let j_star = n - self.longitude / 360.0;
        let m = (357.5291 + 0.985_600_28 * j_star).rem_euclid(360.0);
        let m_rad = m.to_radians();
        let center =
            1.9148 * m_rad.sin() + 0.0200 * (2.0 * m_rad).sin() + 0.0003 * (3.0 * m_rad).sin();
        let lambda = (m + center + 180.0 + 102.9372).rem_euclid(360.0).to_radians();
        let transit = J2000 + j_star + 0.0053 * m_rad.sin() - 0.0069 * (2.0 * lambda).sin();

        let Some(altitude) = self.event.altitude_deg() else {
            return julian_to_utc(transit);
        };

        let sin_decl = lambda.sin() * EARTH_OBLIQUITY_DEG.to_radians().sin();
        let cos_decl = sin_decl.asin().cos();
        let lat = self.latitude.to_radians();
        let cos_hour_angle = (altitude.to_radians().sin() - lat.sin() * sin_decl)
            / (lat.cos() * cos_decl);
        if !(-1.0..=1.0).contains(&cos_hour_angle) {
            return None;
        }
        let offset = cos_hour_angle.acos().to_degrees() / 360.0;

        if self.event.is_rising() {
            julian_to_utc(transit - offset)
        } else {
            julian_to_utc(transit + offset)
        }
    }

    /// First event instant at or after `after`.
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        // Far east/west longitudes put the event on the neighbouring UTC day.
        let day = after.date_naive();
        let mut date = day.pred_opt().unwrap_or(day);
        for _ in 0..SEARCH_HORIZON_DAYS {
            if let Some(at) = self.event_on(date) {
                if at >= after {
                    return Some(at);
                }
            }
            date = date.succ_opt()?;
        }
        None
    }
}

/// Latitude must lie strictly between the poles: at ±90° every hour angle is
/// the same and the sunrise equation has no solution.
pub fn validate_coordinates(latitude: f64, longitude: f64) -> Result<()> {
    if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
        return Err(SchedulerError::invalid(
            "latitude",
            format!("{latitude} is outside -90..=90"),
        ));
    }
    if latitude.abs() == 90.0 {
        return Err(SchedulerError::invalid(
            "latitude",
            "the poles have no solar hour angle",
        ));
    }
    if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
        return Err(SchedulerError::invalid(
            "longitude",
            format!("{longitude} is outside -180..=180"),
        ));
    }
    Ok(())
}

fn julian_to_utc(jd: f64) -> Option<DateTime<Utc>> {
    let secs = ((jd - UNIX_EPOCH_JD) * 86_400.0).round();
    DateTime::from_timestamp(secs as i64, 0)
}
