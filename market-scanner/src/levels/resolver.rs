use super::{ClosestKind, ClosestLevel, Level, LevelSummary, TimeframeLevels};

/// Distances less than this many percentage points from the nearest count as a tie.
pub const TIE_EPSILON_PCT: f64 = 0.01;

/// Aggregate per-timeframe levels into the closest actionable level and the strongest
/// support and resistance.
///
/// Candidates are each timeframe's support and resistance. Among the candidates within
/// [`TIE_EPSILON_PCT`] of the minimum distance, the heaviest timeframe wins.
pub fn resolve_closest<'a>(
    levels: impl IntoIterator<Item = &'a TimeframeLevels>,
    current_price: f64,
) -> LevelSummary {
    if !current_price.is_finite() || current_price <= 0.0 {
        return LevelSummary::default();
    }

    let mut candidates: Vec<(Level, f64)> = Vec::new();
    let mut strongest_support: Option<Level> = None;
    let mut strongest_resistance: Option<Level> = None;

    for timeframe_levels in levels {
        if let Some(support) = timeframe_levels.support {
            strongest_support = heavier(strongest_support, support);
            candidates.push((support, support.distance_pct(current_price)));
        }
        if let Some(resistance) = timeframe_levels.resistance {
            strongest_resistance = heavier(strongest_resistance, resistance);
            candidates.push((resistance, resistance.distance_pct(current_price)));
        }
    }

    let closest = candidates
        .iter()
        .map(|(_, distance)| *distance)
        .min_by(f64::total_cmp)
        .and_then(|min_distance| {
            candidates
                .iter()
                .filter(|(_, distance)| is_tie(*distance, min_distance))
                // Heaviest first, then nearest
                .max_by(|(a, a_distance), (b, b_distance)| {
                    a.weight
                        .cmp(&b.weight)
                        .then_with(|| b_distance.total_cmp(a_distance))
                })
                .map(|(level, distance)| ClosestLevel {
                    price: level.price,
                    timeframe: level.timeframe,
                    kind: ClosestKind::from(level.kind),
                    distance_pct: *distance,
                })
        });

    LevelSummary {
        closest,
        strongest_support,
        strongest_resistance,
    }
}

/// Strictly within [`TIE_EPSILON_PCT`] of the nearest distance.
fn is_tie(distance: f64, min_distance: f64) -> bool {
    distance - min_distance < TIE_EPSILON_PCT
}

fn heavier(current: Option<Level>, candidate: Level) -> Option<Level> {
    match current {
        Some(current) if current.weight >= candidate.weight => Some(current),
        _ => Some(candidate),
    }
}
