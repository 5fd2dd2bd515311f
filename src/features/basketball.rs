use chrono::Duration as ChronoDuration;

use crate::error::ComputeError;
use crate::models::Record;
use crate::registry::window::{self, Agg};

use super::game_rolling_mean;

/// Offensive minus defensive rating, averaged per game and rolled over the
/// lineup's last five games (at least two).
pub fn lineup_net_rating_5g(rows: &[Record]) -> Result<Vec<Option<f64>>, ComputeError> {
    let keys = window::keys(rows, &["lineup_id"])?;
    let games = window::required_numbers(rows, "game_no")?;
    let off = window::numbers_or(rows, "off_rating", 100.0);
    let def = window::numbers_or(rows, "def_rating", 100.0);

    let net: Vec<Option<f64>> = off.iter().zip(&def).map(|(o, d)| Some(o - d)).collect();
    Ok(game_rolling_mean(&keys, &games, &net, 5, 2))
}

/// Season defensive-effort score: weighted hustle events per possession,
/// averaged per player, expressed as a percentile across players.
pub fn player_grit_grind_score_season(
    rows: &[Record],
) -> Result<Vec<Option<f64>>, ComputeError> {
    let keys = window::keys(rows, &["player_id"])?;
    let charges = window::numbers_or(rows, "charges_drawn", 0.0);
    let contested = window::numbers_or(rows, "contested_shots", 0.0);
    let deflections = window::numbers_or(rows, "deflections", 0.0);
    let hustle = window::numbers_or(rows, "hustle_plays", 0.0);

    let score: Vec<f64> = (0..rows.len())
        .map(|i| charges[i] * 3.0 + contested[i] * 0.5 + deflections[i] * 1.5 + hustle[i] * 2.0)
        .collect();

    let players = window::groups(&keys);
    let season_means: Vec<f64> = players
        .iter()
        .map(|idx| idx.iter().map(|&i| score[i]).sum::<f64>() / idx.len() as f64)
        .collect();
    let ranks = window::percentile_ranks(&season_means);

    let mut out = vec![None; rows.len()];
    for (idx, rank) in players.iter().zip(ranks) {
        for &i in idx {
            out[i] = Some(rank * 100.0);
        }
    }
    Ok(out)
}

/// Workload from minutes, distance and accelerations, averaged over the
/// player's trailing seven days (at least three appearances).
pub fn player_load_management_index_7d(
    rows: &[Record],
) -> Result<Vec<Option<f64>>, ComputeError> {
    let keys = window::keys(rows, &["player_id"])?;
    let ts = window::timestamps(rows, "ts")?;
    let minutes = window::numbers_or(rows, "minutes_played", 0.0);
    let distance = window::numbers_or(rows, "distance_covered", 0.0);
    let accels = window::numbers_or(rows, "accelerations", 0.0);

    let load: Vec<Option<f64>> = (0..rows.len())
        .map(|i| {
            Some(minutes[i] / 48.0 * 0.4 + distance[i] / 5000.0 * 0.3 + accels[i] / 100.0 * 0.3)
        })
        .collect();

    Ok(window::grouped_rolling_time(
        &keys,
        &ts,
        &load,
        ChronoDuration::days(7),
        3,
        Agg::Mean,
    ))
}
