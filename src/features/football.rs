use crate::error::ComputeError;
use crate::models::Record;
use crate::registry::window::{self, Agg};

use super::{broadcast, ratio};

fn optional_numbers(rows: &[Record], column: &str) -> Vec<Option<f64>> {
    window::numbers(rows, column).unwrap_or_else(|_| vec![None; rows.len()])
}

/// Simplified expected-points model from field position and down/distance.
/// Unknown down or field position is worth nothing.
fn expected_points(down: Option<f64>, distance: Option<f64>, yard_line: Option<f64>) -> f64 {
    let (Some(down), Some(yard_line)) = (down, yard_line) else {
        return 0.0;
    };
    let field_position = (yard_line - 50.0) / 50.0 * 3.0;
    let shorter_than = |yards: f64| distance.is_some_and(|d| d < yards);
    let longer_than = |yards: f64| distance.is_some_and(|d| d > yards);

    let down_distance = if down == 1.0 {
        0.5
    } else if down == 2.0 {
        if shorter_than(7.0) {
            0.3
        } else {
            0.1
        }
    } else if down == 3.0 {
        if shorter_than(4.0) {
            0.1
        } else {
            -0.2
        }
    } else if longer_than(1.0) {
        -0.5
    } else {
        0.3
    };
    field_position + down_distance
}

/// Expected points added per play: EP of the next snap minus EP of this one.
pub fn epa(rows: &[Record]) -> Result<Vec<Option<f64>>, ComputeError> {
    let down = window::numbers(rows, "down")?;
    let yard_line = window::numbers(rows, "yard_line")?;
    let distance = optional_numbers(rows, "distance");
    let next_down = optional_numbers(rows, "next_down");
    let next_distance = optional_numbers(rows, "next_distance");
    let next_yard_line = optional_numbers(rows, "next_yard_line");

    Ok((0..rows.len())
        .map(|i| {
            let before = expected_points(down[i], distance[i], yard_line[i]);
            let after = expected_points(next_down[i], next_distance[i], next_yard_line[i]);
            Some(after - before)
        })
        .collect())
}

/// Yards over down-adjusted expectation, scaled by opponent defensive rank
/// (1..=32, ±20%), as a percentage.
pub fn dvoa(rows: &[Record]) -> Result<Vec<Option<f64>>, ComputeError> {
    let yards = window::numbers(rows, "yards_gained")?;
    let down = window::numbers_or(rows, "down", 1.0);
    let distance = window::numbers_or(rows, "distance", 10.0);
    let def_rank = window::numbers_or(rows, "opponent_def_rank", 16.0);

    Ok((0..rows.len())
        .map(|i| {
            let factor = match down[i] as i64 {
                1 => 0.45,
                2 => 0.60,
                3 => 0.85,
                _ => 1.0,
            };
            let expected = distance[i] * factor;
            let success = ratio(yards[i]? - expected, expected)?;
            let adjustment = (def_rank[i] - 16.5) / 16.5 * 0.2;
            Some(success * (1.0 + adjustment) * 100.0)
        })
        .collect())
}

/// Sacks per pressure over the QB's last four games (at least two),
/// divided by the opponents' rolling pass-block win rate when supplied.
pub fn qb_pressure_to_sack_rate_adj_4g(
    rows: &[Record],
) -> Result<Vec<Option<f64>>, ComputeError> {
    let keys = window::keys(rows, &["qb_id"])?;
    let games = window::required_numbers(rows, "game_no")?;
    let pressure = window::numbers(rows, "pressure")?;
    let sack = window::numbers(rows, "sack")?;
    let opp = optional_numbers(rows, "opp_pass_block_win_rate");

    let entities = window::entity_games(&keys, &games);
    let per_game: Vec<Vec<Option<f64>>> = entities
        .iter()
        .map(|buckets| {
            let raw: Vec<Option<f64>> = buckets
                .iter()
                .map(|g| {
                    let pressures: f64 = g.rows.iter().filter_map(|&i| pressure[i]).sum();
                    let sacks: f64 = g.rows.iter().filter_map(|&i| sack[i]).sum();
                    ratio(sacks, pressures).map(|r| r.clamp(0.0, 1.0))
                })
                .collect();
            let opp_by_game: Vec<Option<f64>> = buckets
                .iter()
                .map(|g| {
                    let present: Vec<f64> = g.rows.iter().filter_map(|&i| opp[i]).collect();
                    (!present.is_empty())
                        .then(|| present.iter().sum::<f64>() / present.len() as f64)
                })
                .collect();

            let raw_4g = window::rolling_by_count(&raw, 4, 2, Agg::Mean);
            let opp_4g = window::rolling_by_count(&opp_by_game, 4, 2, Agg::Mean);
            raw_4g
                .into_iter()
                .zip(opp_4g)
                .map(|(r, o)| match (r, o) {
                    (Some(r), Some(o)) => ratio(r, o).map(|v| v.clamp(0.0, 1.0)),
                    (Some(r), None) => Some(r),
                    _ => None,
                })
                .collect()
        })
        .collect();

    Ok(broadcast(&entities, &per_game, rows.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{record, Value};
    use approx::assert_relative_eq;

    #[test]
    fn test_epa_first_down_gain() {
        let rows = vec![record([
            ("down", Value::Int(1)),
            ("distance", Value::Int(10)),
            ("yard_line", Value::Int(25)),
            ("next_down", Value::Int(1)),
            ("next_distance", Value::Int(10)),
            ("next_yard_line", Value::Int(50)),
        ])];
        let out = epa(&rows).unwrap();
        // before: -1.5 + 0.5, after: 0.0 + 0.5
        assert_relative_eq!(out[0].unwrap(), 1.5);
    }

    #[test]
    fn test_epa_without_next_snap() {
        let rows = vec![record([("down", 3i64), ("distance", 2), ("yard_line", 75)])];
        // before: 1.5 + 0.1, after: nothing known
        assert_relative_eq!(epa(&rows).unwrap()[0].unwrap(), -1.6);
    }

    #[test]
    fn test_dvoa_adjusts_for_defense() {
        let rows = vec![
            record([("yards_gained", 9i64), ("down", 1), ("distance", 10)]),
            record([("yards_gained", 0i64), ("down", 1), ("distance", 0)]),
        ];
        let out = dvoa(&rows).unwrap();
        let expected = (9.0 - 4.5) / 4.5 * (1.0 + (16.0 - 16.5) / 16.5 * 0.2) * 100.0;
        assert_relative_eq!(out[0].unwrap(), expected);
        assert_eq!(out[1], None);
    }

    #[test]
    fn test_qb_sack_rate_rolls_game_level() {
        let play = |game: i64, pressure: i64, sack: i64| {
            record([
                ("qb_id", Value::from("qb1")),
                ("game_no", Value::from(game)),
                ("pressure", Value::from(pressure)),
                ("sack", Value::from(sack)),
                ("opp_pass_block_win_rate", Value::from(0.5)),
            ])
        };
        let rows = vec![
            play(1, 1, 1),
            play(1, 1, 0),
            play(2, 1, 0),
            play(2, 1, 0),
        ];
        let out = qb_pressure_to_sack_rate_adj_4g(&rows).unwrap();
        // one game of history is not enough
        assert_eq!(out[0], None);
        assert_eq!(out[1], None);
        // games: 0.5 and 0.0 → mean 0.25, over opponent 0.5
        assert_relative_eq!(out[2].unwrap(), 0.5);
        assert_eq!(out[2], out[3]);
    }
}
