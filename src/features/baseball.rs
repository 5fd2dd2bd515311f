use chrono::Duration as ChronoDuration;

use crate::error::ComputeError;
use crate::models::Record;
use crate::registry::window::{self, Agg};

use super::{game_rolling_mean, ratio};

/// Pitch capacity of a reliever over three days.
const BULLPEN_CAPACITY: f64 = 150.0;
const BACK_TO_BACK_PENALTY: f64 = 0.15;

// wOBA linear weights
const W_BB: f64 = 0.690;
const W_HBP: f64 = 0.720;
const W_1B: f64 = 0.880;
const W_2B: f64 = 1.240;
const W_3B: f64 = 1.560;
const W_HR: f64 = 2.000;

const FIP_CONSTANT: f64 = 3.10;

/// Relief-pitcher fatigue: 3-day rolling pitch total per (team, pitcher)
/// over capacity, plus a back-to-back penalty. Starters score 0.
///
/// The raw value may exceed 1.0; the registry clips it to the declared range.
pub fn bullpen_fatigue_index_3d(rows: &[Record]) -> Result<Vec<Option<f64>>, ComputeError> {
    let keys = window::keys(rows, &["team_id", "pitcher_id"])?;
    let ts = window::timestamps(rows, "ts")?;
    let pitches = window::numbers(rows, "pitches")?;
    let roles = window::text_or(rows, "role", "RP");
    let back_to_back = window::flags_or(rows, "back_to_back", false);

    let load = window::grouped_rolling_time(
        &keys,
        &ts,
        &pitches,
        ChronoDuration::days(3),
        1,
        Agg::Sum,
    );

    Ok((0..rows.len())
        .map(|i| {
            if roles[i] != "RP" {
                return Some(0.0);
            }
            let penalty = if back_to_back[i] {
                BACK_TO_BACK_PENALTY
            } else {
                0.0
            };
            Some(load[i].unwrap_or(0.0) / BULLPEN_CAPACITY + penalty)
        })
        .collect())
}

/// Swing-and-miss percentage per pitcher over a 15-day window. Needs at
/// least ten pitches in the window.
pub fn pitcher_whiff_rate_15d(rows: &[Record]) -> Result<Vec<Option<f64>>, ComputeError> {
    let keys = window::keys(rows, &["pitcher_id"])?;
    let ts = window::timestamps(rows, "ts")?;
    let as_num = |flags: Vec<bool>| -> Vec<Option<f64>> {
        flags.into_iter().map(|f| Some(if f { 1.0 } else { 0.0 })).collect()
    };
    let swings = as_num(window::flags_or(rows, "swing", false));
    let whiffs = as_num(window::flags_or(rows, "whiff", false));

    let span = ChronoDuration::days(15);
    let swing_sum = window::grouped_rolling_time(&keys, &ts, &swings, span, 10, Agg::Sum);
    let whiff_sum = window::grouped_rolling_time(&keys, &ts, &whiffs, span, 3, Agg::Sum);

    Ok(swing_sum
        .iter()
        .zip(&whiff_sum)
        .map(|(s, w)| match (s, w) {
            (Some(s), Some(w)) => ratio(*w, *s).map(|r| r * 100.0),
            _ => None,
        })
        .collect())
}

/// Stuff+ (100 = average) from velocity, spin and movement, averaged per
/// game and rolled over the pitcher's last seven games (at least three).
pub fn pitcher_stuff_plus_rolling_7g(rows: &[Record]) -> Result<Vec<Option<f64>>, ComputeError> {
    let keys = window::keys(rows, &["pitcher_id"])?;
    let games = window::required_numbers(rows, "game_no")?;
    let velocity = window::numbers_or(rows, "velocity", 92.0);
    let spin = window::numbers_or(rows, "spin_rate", 2200.0);
    let movement = window::numbers_or(rows, "movement", 10.0);

    let raw: Vec<Option<f64>> = (0..rows.len())
        .map(|i| {
            let vel = (velocity[i] - 92.0) / 5.0;
            let spin = (spin[i] - 2200.0) / 300.0;
            let mov = (movement[i] - 10.0) / 5.0;
            Some(100.0 + (vel + spin + mov) * 20.0)
        })
        .collect();

    Ok(game_rolling_mean(&keys, &games, &raw, 7, 3))
}

/// Weighted on-base average from per-row counting stats. Rows with no
/// plate appearances are missing.
pub fn woba(rows: &[Record]) -> Result<Vec<Option<f64>>, ComputeError> {
    let ab = window::numbers(rows, "ab")?;
    let bb = window::numbers_or(rows, "bb", 0.0);
    let hbp = window::numbers_or(rows, "hbp", 0.0);
    let single = window::numbers_or(rows, "single", 0.0);
    let double = window::numbers_or(rows, "double", 0.0);
    let triple = window::numbers_or(rows, "triple", 0.0);
    let hr = window::numbers_or(rows, "hr", 0.0);
    let sf = window::numbers_or(rows, "sf", 0.0);

    Ok((0..rows.len())
        .map(|i| {
            let ab = ab[i]?;
            let numerator = W_BB * bb[i]
                + W_HBP * hbp[i]
                + W_1B * single[i]
                + W_2B * double[i]
                + W_3B * triple[i]
                + W_HR * hr[i];
            ratio(numerator, ab + bb[i] - hbp[i] + sf[i])
        })
        .collect())
}

/// Fielding-independent pitching. Rows with zero innings are missing.
pub fn fip(rows: &[Record]) -> Result<Vec<Option<f64>>, ComputeError> {
    let ip = window::numbers(rows, "ip")?;
    let k = window::numbers(rows, "k")?;
    let hr = window::numbers_or(rows, "hr", 0.0);
    let bb = window::numbers_or(rows, "bb", 0.0);
    let hbp = window::numbers_or(rows, "hbp", 0.0);

    Ok((0..rows.len())
        .map(|i| {
            let raw = 13.0 * hr[i] + 3.0 * (bb[i] + hbp[i]) - 2.0 * k[i]?;
            ratio(raw, ip[i]?).map(|v| v + FIP_CONSTANT)
        })
        .collect())
}
