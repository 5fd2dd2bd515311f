//! Built-in feature formulas and their registry definitions.

pub mod baseball;
pub mod basketball;
pub mod football;

use crate::registry::window::{self, Agg, GameBucket};
use crate::registry::{FeatureDefinition, LatencyClass};

/// Default features computed for each incoming event of a sport.
pub fn features_for_sport(sport: &str) -> &'static [&'static str] {
    match sport.to_ascii_lowercase().as_str() {
        "baseball" | "mlb" => &[
            "bullpen_fatigue_index_3d",
            "pitcher_whiff_rate_15d",
            "pitcher_stuff_plus_rolling_7g",
        ],
        "football" | "nfl" => &["epa", "dvoa", "qb_pressure_to_sack_rate_adj_4g"],
        "basketball" | "nba" => &[
            "lineup_net_rating_5g",
            "player_grit_grind_score_season",
            "player_load_management_index_7d",
        ],
        _ => &[],
    }
}

/// The definition table for every shipped formula.
pub fn builtin_definitions() -> Vec<FeatureDefinition> {
    use LatencyClass::*;

    vec![
        // ── Baseball ──────────────────────────────────────────────
        FeatureDefinition::new(
            "bullpen_fatigue_index_3d",
            baseball::bullpen_fatigue_index_3d,
            0.0,
            1.0,
        )
        .requires(&["team_id", "pitcher_id", "ts", "pitches"])
        .latency(RealTime)
        .tags(&["baseball", "pitching", "bullpen"]),
        FeatureDefinition::new(
            "pitcher_whiff_rate_15d",
            baseball::pitcher_whiff_rate_15d,
            0.0,
            60.0,
        )
        .requires(&["pitcher_id", "ts"])
        .latency(NearRealTime)
        .tags(&["baseball", "pitching"]),
        FeatureDefinition::new(
            "pitcher_stuff_plus_rolling_7g",
            baseball::pitcher_stuff_plus_rolling_7g,
            60.0,
            180.0,
        )
        .requires(&["pitcher_id", "game_no"])
        .latency(Batch)
        .tags(&["baseball", "pitching"]),
        FeatureDefinition::new("woba", baseball::woba, 0.0, 1.0)
            .requires(&["ab"])
            .latency(RealTime)
            .tags(&["baseball", "batting"]),
        FeatureDefinition::new("fip", baseball::fip, 1.0, 7.0)
            .requires(&["ip", "k"])
            .latency(RealTime)
            .tags(&["baseball", "pitching"]),
        // ── Football ──────────────────────────────────────────────
        FeatureDefinition::new("epa", football::epa, -7.0, 7.0)
            .requires(&["down", "yard_line"])
            .latency(RealTime)
            .tags(&["football", "efficiency"]),
        FeatureDefinition::new("dvoa", football::dvoa, -100.0, 100.0)
            .requires(&["yards_gained"])
            .latency(NearRealTime)
            .tags(&["football", "efficiency"]),
        FeatureDefinition::new(
            "qb_pressure_to_sack_rate_adj_4g",
            football::qb_pressure_to_sack_rate_adj_4g,
            0.0,
            1.0,
        )
        .requires(&["qb_id", "game_no", "pressure", "sack"])
        .latency(Batch)
        .tags(&["football", "quarterback"]),
        // ── Basketball ────────────────────────────────────────────
        FeatureDefinition::new(
            "lineup_net_rating_5g",
            basketball::lineup_net_rating_5g,
            -50.0,
            50.0,
        )
        .requires(&["lineup_id", "game_no"])
        .latency(NearRealTime)
        .tags(&["basketball", "lineup"]),
        FeatureDefinition::new(
            "player_grit_grind_score_season",
            basketball::player_grit_grind_score_season,
            0.0,
            100.0,
        )
        .requires(&["player_id"])
        .latency(Batch)
        .tags(&["basketball", "defense"]),
        FeatureDefinition::new(
            "player_load_management_index_7d",
            basketball::player_load_management_index_7d,
            0.0,
            1.0,
        )
        .requires(&["player_id", "ts"])
        .latency(NearRealTime)
        .tags(&["basketball", "workload"]),
    ]
}

// ── Shared formula helpers ──────────────────────────────────────────

/// `num / den`, missing when the denominator is zero.
pub(crate) fn ratio(num: f64, den: f64) -> Option<f64> {
    if den == 0.0 {
        None
    } else {
        Some(num / den)
    }
}

fn mean(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let (sum, n) = values
        .flatten()
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// Per-game mean of a row-level value for each entity, in game order.
pub(crate) fn game_means(entities: &[Vec<GameBucket>], values: &[Option<f64>]) -> Vec<Vec<Option<f64>>> {
    entities
        .iter()
        .map(|games| {
            games
                .iter()
                .map(|g| mean(g.rows.iter().map(|&i| values[i])))
                .collect()
        })
        .collect()
}

/// Write a per-game value back onto every row of that game.
pub(crate) fn broadcast(
    entities: &[Vec<GameBucket>],
    per_game: &[Vec<Option<f64>>],
    len: usize,
) -> Vec<Option<f64>> {
    let mut out = vec![None; len];
    for (games, values) in entities.iter().zip(per_game) {
        for (game, value) in games.iter().zip(values) {
            for &i in &game.rows {
                out[i] = *value;
            }
        }
    }
    out
}

/// Average a row value per game, roll the game means over the last
/// `games_window` games and broadcast the result back to the rows.
pub(crate) fn game_rolling_mean(
    keys: &[String],
    games: &[f64],
    values: &[Option<f64>],
    games_window: usize,
    min_games: usize,
) -> Vec<Option<f64>> {
    let entities = window::entity_games(keys, games);
    let rolled: Vec<Vec<Option<f64>>> = game_means(&entities, values)
        .iter()
        .map(|means| window::rolling_by_count(means, games_window, min_games, Agg::Mean))
        .collect();
    broadcast(&entities, &rolled, values.len())
}
