//! Day/night ("dark time") decision.
//!
//! The capture job asks the [`DarkTimeOracle`] once per cycle whether night
//! mode is active. Three modes are supported:
//!
//! | Mode | Dark when |
//! |------|-----------|
//! | `Off` | never |
//! | `Fixed` | local time of day in `[start, stop)`, wrapping midnight |
//! | `Astronomical` | solar elevation below a threshold (default −2.5°) |
//!
//! [`is_dark`] is a pure function of `(now, mode)`. The oracle caches the
//! last result together with the instant of the next transition and reuses
//! it until that instant, so the ephemeris is computed a few times per day
//! rather than on every cycle.
//!
//! # Polar latitudes
//!
//! When the sun does not cross the threshold within the next 48 hours the
//! current state is reported as-is (polar night is dark, midnight sun is
//! light), `next_transition_at` is `None`, and the oracle re-evaluates after
//! [`POLAR_RECHECK_HOURS`].

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Timelike, Utc};
use serde::Serialize;

use crate::config::{parse_time_of_day, DarkConfig};
use crate::models::TimeWindow;

/// Hours before re-evaluating when no transition was found.
pub const POLAR_RECHECK_HOURS: i64 = 24;

const SCAN_STEP_MINUTES: i64 = 10;
const SCAN_HORIZON_HOURS: i64 = 48;

#[derive(Debug, Clone, PartialEq)]
pub enum DarkMode {
    Off,
    Fixed(TimeWindow),
    Astronomical {
        latitude: f64,
        longitude: f64,
        threshold_deg: f64,
    },
}

impl DarkMode {
    pub fn from_config(cfg: &DarkConfig) -> anyhow::Result<Self> {
        Ok(match cfg.mode.as_str() {
            "fixed" => DarkMode::Fixed(TimeWindow::new(
                parse_time_of_day(&cfg.start)?,
                parse_time_of_day(&cfg.stop)?,
            )),
            "astronomical" => DarkMode::Astronomical {
                latitude: cfg
                    .latitude
                    .ok_or_else(|| anyhow::anyhow!("dark.latitude is required"))?,
                longitude: cfg
                    .longitude
                    .ok_or_else(|| anyhow::anyhow!("dark.longitude is required"))?,
                threshold_deg: cfg.elevation_threshold_deg,
            },
            "off" => DarkMode::Off,
            other => anyhow::bail!("Unknown dark mode: '{}'", other),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DarkState {
    pub is_dark: bool,
    pub computed_at: DateTime<Utc>,
    /// `None` when no transition is expected (mode `Off`, polar day/night).
    pub next_transition_at: Option<DateTime<Utc>>,
}

/// Evaluate the dark state at `now`.
///
/// Fixed windows are interpreted in `now`'s own time zone.
pub fn is_dark<Tz: TimeZone>(now: &DateTime<Tz>, mode: &DarkMode) -> DarkState {
    let computed_at = now.with_timezone(&Utc);
    match mode {
        DarkMode::Off => DarkState {
            is_dark: false,
            computed_at,
            next_transition_at: None,
        },
        DarkMode::Fixed(window) => {
            let tod = now.time();
            let next = if window.start == window.stop {
                None
            } else {
                let until = secs_until(tod, window.start).min(secs_until(tod, window.stop));
                Some(computed_at + Duration::seconds(until))
            };
            DarkState {
                is_dark: window.contains(tod),
                computed_at,
                next_transition_at: next,
            }
        }
        DarkMode::Astronomical {
            latitude,
            longitude,
            threshold_deg,
        } => {
            let below =
                |t: DateTime<Utc>| solar_elevation(*latitude, *longitude, t) < *threshold_deg;
            DarkState {
                is_dark: below(computed_at),
                computed_at,
                next_transition_at: next_crossing(computed_at, below),
            }
        }
    }
}

/// Seconds from `from` to the next occurrence of `to`, in `(0, 86400]`.
fn secs_until(from: NaiveTime, to: NaiveTime) -> i64 {
    let from = from.num_seconds_from_midnight() as i64;
    let to = to.num_seconds_from_midnight() as i64;
    let delta = (to - from).rem_euclid(86_400);
    if delta == 0 {
        86_400
    } else {
        delta
    }
}

/// First instant after `start` where `below` flips, to one-second precision.
fn next_crossing(
    start: DateTime<Utc>,
    below: impl Fn(DateTime<Utc>) -> bool,
) -> Option<DateTime<Utc>> {
    let initial = below(start);
    let step = Duration::minutes(SCAN_STEP_MINUTES);
    let steps = SCAN_HORIZON_HOURS * 60 / SCAN_STEP_MINUTES;

    let mut lo = start;
    for _ in 0..steps {
        let hi = lo + step;
        if below(hi) != initial {
            // Bisect [lo, hi] down to one second.
            let (mut a, mut b) = (lo, hi);
            while b - a > Duration::seconds(1) {
                let mid = a + (b - a) / 2;
                if below(mid) == initial {
                    a = mid;
                } else {
                    b = mid;
                }
            }
            return Some(b);
        }
        lo = hi;
    }
    None
}

/// Solar elevation in degrees (NOAA solar position equations, no refraction).
pub fn solar_elevation(latitude: f64, longitude: f64, at: DateTime<Utc>) -> f64 {
    let unix = at.timestamp() as f64 + at.timestamp_subsec_millis() as f64 / 1000.0;
    let julian_day = unix / 86_400.0 + 2_440_587.5;
    let jc = (julian_day - 2_451_545.0) / 36_525.0;

    let mean_long = (280.46646 + jc * (36_000.76983 + jc * 0.000_303_2)).rem_euclid(360.0);
    let mean_anom = 357.52911 + jc * (35_999.05029 - 0.000_153_7 * jc);
    let eccent = 0.016_708_634 - jc * (0.000_042_037 + 0.000_000_126_7 * jc);

    let m = mean_anom.to_radians();
    let center = m.sin() * (1.914602 - jc * (0.004817 + 0.000014 * jc))
        + (2.0 * m).sin() * (0.019993 - 0.000101 * jc)
        + (3.0 * m).sin() * 0.000289;
    let true_long = mean_long + center;
    let omega = (125.04 - 1934.136 * jc).to_radians();
    let app_long = true_long - 0.00569 - 0.00478 * omega.sin();

    let mean_obliq =
        23.0 + (26.0 + (21.448 - jc * (46.815 + jc * (0.00059 - jc * 0.001813))) / 60.0) / 60.0;
    let obliq = (mean_obliq + 0.00256 * omega.cos()).to_radians();
    let decl = (obliq.sin() * app_long.to_radians().sin()).asin();

    let y = (obliq / 2.0).tan().powi(2);
    let l0 = mean_long.to_radians();
    let eq_time_min = 4.0
        * (y * (2.0 * l0).sin() - 2.0 * eccent * m.sin()
            + 4.0 * eccent * y * m.sin() * (2.0 * l0).cos()
            - 0.5 * y * y * (4.0 * l0).sin()
            - 1.25 * eccent * eccent * (2.0 * m).sin())
        .to_degrees();

    let minutes_utc = (unix.rem_euclid(86_400.0)) / 60.0;
    let true_solar = (minutes_utc + eq_time_min + 4.0 * longitude).rem_euclid(1440.0);
    let hour_angle = true_solar / 4.0 - 180.0;

    let lat = latitude.to_radians();
    let cos_zenith = (lat.sin() * decl.sin()
        + lat.cos() * decl.cos() * hour_angle.to_radians().cos())
    .clamp(-1.0, 1.0);
    90.0 - cos_zenith.acos().to_degrees()
}

/// Caching wrapper around [`is_dark`].
#[derive(Debug, Clone)]
pub struct DarkTimeOracle {
    mode: DarkMode,
    cached: Option<DarkState>,
}

impl DarkTimeOracle {
    pub fn new(mode: DarkMode) -> Self {
        Self { mode, cached: None }
    }

    pub fn mode(&self) -> &DarkMode {
        &self.mode
    }

    /// Current dark state, reusing the cached one while no transition is due.
    pub fn evaluate<Tz: TimeZone>(&mut self, now: &DateTime<Tz>) -> DarkState {
        let now_utc = now.with_timezone(&Utc);
        if let Some(cached) = &self.cached {
            let valid_until = cached
                .next_transition_at
                .unwrap_or(cached.computed_at + Duration::hours(POLAR_RECHECK_HOURS));
            let reusable = match self.mode {
                DarkMode::Off => true,
                _ => now_utc >= cached.computed_at && now_utc < valid_until,
            };
            if reusable {
                return cached.clone();
            }
        }
        let fresh = is_dark(now, &self.mode);
        self.cached = Some(fresh.clone());
        fresh
    }
}
