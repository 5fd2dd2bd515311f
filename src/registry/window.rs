//! Column access and rolling-window helpers shared by the built-in formulas.
//!
//! Formulas receive rows in caller order. Windows are evaluated per group
//! (player, pitcher, lineup) after a stable sort on the ordering column, and
//! results are scattered back so output index `i` always belongs to input
//! row `i`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;

use crate::error::ComputeError;
use crate::models::{Record, Value};

const KEY_SEPARATOR: char = '\u{1f}';

pub fn column_present(rows: &[Record], column: &str) -> bool {
    rows.iter().any(|r| r.contains_key(column))
}

fn require(rows: &[Record], column: &str) -> Result<(), ComputeError> {
    if column_present(rows, column) {
        Ok(())
    } else {
        Err(ComputeError::MissingColumn(column.to_string()))
    }
}

/// Numeric column; absent cells and non-numeric values become `None`.
pub fn numbers(rows: &[Record], column: &str) -> Result<Vec<Option<f64>>, ComputeError> {
    require(rows, column)?;
    Ok(rows
        .iter()
        .map(|r| r.get(column).and_then(Value::as_f64))
        .collect())
}

/// Numeric column where every row must carry a value (e.g. `game_no`).
pub fn required_numbers(rows: &[Record], column: &str) -> Result<Vec<f64>, ComputeError> {
    numbers(rows, column)?
        .into_iter()
        .enumerate()
        .map(|(i, v)| {
            v.ok_or_else(|| ComputeError::InvalidValue {
                column: column.to_string(),
                reason: format!("row {} has no numeric value", i),
            })
        })
        .collect()
}

/// Optional numeric column with a per-cell default.
pub fn numbers_or(rows: &[Record], column: &str, default: f64) -> Vec<f64> {
    rows.iter()
        .map(|r| r.get(column).and_then(Value::as_f64).unwrap_or(default))
        .collect()
}

/// Optional boolean column with a per-cell default.
pub fn flags_or(rows: &[Record], column: &str, default: bool) -> Vec<bool> {
    rows.iter()
        .map(|r| r.get(column).and_then(Value::as_bool).unwrap_or(default))
        .collect()
}

/// Optional text column with a per-cell default.
pub fn text_or(rows: &[Record], column: &str, default: &str) -> Vec<String> {
    rows.iter()
        .map(|r| {
            r.get(column)
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        })
        .collect()
}

/// Composite group key per row built from the given identifier columns.
pub fn keys(rows: &[Record], columns: &[&str]) -> Result<Vec<String>, ComputeError> {
    for column in columns {
        require(rows, column)?;
    }
    Ok(rows
        .iter()
        .map(|r| {
            columns
                .iter()
                .map(|c| r.get(*c).map(Value::key_text).unwrap_or_default())
                .collect::<Vec<_>>()
                .join(&KEY_SEPARATOR.to_string())
        })
        .collect())
}

pub fn timestamps(rows: &[Record], column: &str) -> Result<Vec<DateTime<Utc>>, ComputeError> {
    require(rows, column)?;
    rows.iter()
        .enumerate()
        .map(|(i, r)| {
            r.get(column)
                .and_then(Value::as_timestamp)
                .ok_or_else(|| ComputeError::InvalidValue {
                    column: column.to_string(),
                    reason: format!("row {} is not a timestamp", i),
                })
        })
        .collect()
}

/// Row indices per distinct key, groups in first-appearance order and rows
/// in input order within each group.
pub fn groups(keys: &[String]) -> Vec<Vec<usize>> {
    let mut slot: HashMap<&str, usize> = HashMap::new();
    let mut out: Vec<Vec<usize>> = Vec::new();
    for (i, key) in keys.iter().enumerate() {
        let idx = *slot.entry(key.as_str()).or_insert_with(|| {
            out.push(Vec::new());
            out.len() - 1
        });
        out[idx].push(i);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Agg {
    Mean,
    Sum,
}

impl Agg {
    fn apply(self, window: &[f64]) -> f64 {
        let sum: f64 = window.iter().sum();
        match self {
            Agg::Sum => sum,
            Agg::Mean => sum / window.len() as f64,
        }
    }
}

/// Trailing window over the last `window` observations. Missing values do
/// not count towards `min_periods`.
pub fn rolling_by_count(
    values: &[Option<f64>],
    window: usize,
    min_periods: usize,
    agg: Agg,
) -> Vec<Option<f64>> {
    let window = window.max(1);
    (0..values.len())
        .map(|i| {
            let start = (i + 1).saturating_sub(window);
            let present: Vec<f64> = values[start..=i].iter().filter_map(|v| *v).collect();
            if present.is_empty() || present.len() < min_periods {
                None
            } else {
                Some(agg.apply(&present))
            }
        })
        .collect()
}

/// Trailing time window `(t - window, t]`. `times` must be ascending.
pub fn rolling_by_time(
    times: &[DateTime<Utc>],
    values: &[Option<f64>],
    window: ChronoDuration,
    min_periods: usize,
    agg: Agg,
) -> Vec<Option<f64>> {
    let mut left = 0usize;
    (0..values.len())
        .map(|i| {
            let cutoff = times[i] - window;
            while left < i && times[left] <= cutoff {
                left += 1;
            }
            let present: Vec<f64> = values[left..=i].iter().filter_map(|v| *v).collect();
            if present.is_empty() || present.len() < min_periods {
                None
            } else {
                Some(agg.apply(&present))
            }
        })
        .collect()
}

/// Per-group time-window aggregate, scattered back to input order.
pub fn grouped_rolling_time(
    keys: &[String],
    times: &[DateTime<Utc>],
    values: &[Option<f64>],
    window: ChronoDuration,
    min_periods: usize,
    agg: Agg,
) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    for mut idx in groups(keys) {
        idx.sort_by_key(|&i| times[i]);
        let t: Vec<DateTime<Utc>> = idx.iter().map(|&i| times[i]).collect();
        let v: Vec<Option<f64>> = idx.iter().map(|&i| values[i]).collect();
        for (pos, result) in rolling_by_time(&t, &v, window, min_periods, agg)
            .into_iter()
            .enumerate()
        {
            out[idx[pos]] = result;
        }
    }
    out
}

/// Per-group count-window aggregate ordered by `order` (e.g. `game_no`).
pub fn grouped_rolling_count(
    keys: &[String],
    order: &[f64],
    values: &[Option<f64>],
    window: usize,
    min_periods: usize,
    agg: Agg,
) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    for mut idx in groups(keys) {
        idx.sort_by(|&a, &b| order[a].total_cmp(&order[b]));
        let v: Vec<Option<f64>> = idx.iter().map(|&i| values[i]).collect();
        for (pos, result) in rolling_by_count(&v, window, min_periods, agg)
            .into_iter()
            .enumerate()
        {
            out[idx[pos]] = result;
        }
    }
    out
}

/// Rows of one entity in one game.
#[derive(Debug, Clone)]
pub struct GameBucket {
    pub game: f64,
    pub rows: Vec<usize>,
}

/// Group rows per entity, then per game number ascending. Used by formulas
/// that aggregate plays to game level before applying a game-count window.
pub fn entity_games(entity_keys: &[String], games: &[f64]) -> Vec<Vec<GameBucket>> {
    groups(entity_keys)
        .into_iter()
        .map(|idx| {
            let mut buckets: Vec<GameBucket> = Vec::new();
            let mut by_game: HashMap<u64, usize> = HashMap::new();
            for i in idx {
                let g = games[i];
                match by_game.get(&g.to_bits()) {
                    Some(&b) => buckets[b].rows.push(i),
                    None => {
                        by_game.insert(g.to_bits(), buckets.len());
                        buckets.push(GameBucket {
                            game: g,
                            rows: vec![i],
                        });
                    }
                }
            }
            buckets.sort_by(|a, b| a.game.total_cmp(&b.game));
            buckets
        })
        .collect()
}

/// Percentile rank in `(0, 1]` with ties sharing their average rank.
pub fn percentile_ranks(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        // 1-based ranks i+1..=j+1 share their mean
        let avg = (i + j) as f64 / 2.0 + 1.0;
        for &k in &order[i..=j] {
            ranks[k] = avg / n as f64;
        }
        i = j + 1;
    }
    ranks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::record;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_missing_column_is_reported() {
        let rows = vec![record([("a", Value::from(1i64))])];
        assert_eq!(
            numbers(&rows, "b"),
            Err(ComputeError::MissingColumn("b".into()))
        );
        assert_eq!(numbers_or(&rows, "b", 7.0), vec![7.0]);
    }

    #[test]
    fn test_groups_keep_first_appearance_order() {
        let keys: Vec<String> = ["b", "a", "b", "c", "a"].iter().map(|s| s.to_string()).collect();
        assert_eq!(groups(&keys), vec![vec![0, 2], vec![1, 4], vec![3]]);
    }

    #[test]
    fn test_rolling_by_count_min_periods() {
        let v = vec![Some(1.0), None, Some(3.0), Some(5.0)];
        let out = rolling_by_count(&v, 2, 2, Agg::Mean);
        assert_eq!(out[0], None);
        assert_eq!(out[1], None);
        assert_eq!(out[2], None); // window [None, 3.0] has one observation
        assert_relative_eq!(out[3].unwrap(), 4.0);
    }

    #[test]
    fn test_rolling_by_time_excludes_left_edge() {
        let times = vec![day(1), day(2), day(4), day(5)];
        let v = vec![Some(10.0), Some(20.0), Some(30.0), Some(40.0)];
        let out = rolling_by_time(&times, &v, ChronoDuration::days(3), 1, Agg::Sum);
        assert_eq!(out, vec![Some(10.0), Some(30.0), Some(50.0), Some(70.0)]);
    }

    #[test]
    fn test_grouped_rolling_time_scatters_back() {
        let keys: Vec<String> = ["x", "y", "x"].iter().map(|s| s.to_string()).collect();
        // x rows arrive out of order; results must land on their own rows.
        let times = vec![day(3), day(1), day(2)];
        let v = vec![Some(1.0), Some(100.0), Some(2.0)];
        let out = grouped_rolling_time(&keys, &times, &v, ChronoDuration::days(7), 1, Agg::Sum);
        assert_eq!(out, vec![Some(3.0), Some(100.0), Some(2.0)]);
    }

    #[test]
    fn test_entity_games_sorted_by_game() {
        let keys: Vec<String> = ["qb1", "qb1", "qb1", "qb2"].iter().map(|s| s.to_string()).collect();
        let games = vec![3.0, 1.0, 3.0, 1.0];
        let out = entity_games(&keys, &games);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0][0].game, 1.0);
        assert_eq!(out[0][1].rows, vec![0, 2]);
        assert_eq!(out[1][0].rows, vec![3]);
    }

    #[test]
    fn test_percentile_ranks_average_ties() {
        let ranks = percentile_ranks(&[10.0, 20.0, 20.0, 40.0]);
        assert_relative_eq!(ranks[0], 0.25);
        assert_relative_eq!(ranks[1], 0.625);
        assert_relative_eq!(ranks[2], 0.625);
        assert_relative_eq!(ranks[3], 1.0);
    }
}
