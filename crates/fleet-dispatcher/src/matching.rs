//! Candidate ranking for the matching engine.

use fleet_core::grid::manhattan;
use fleet_core::store::TaxiRow;

/// Order eligible taxis by Manhattan distance to the rider, then by taxi id.
/// The id tie-break makes assignment deterministic under equal distance.
pub fn rank_candidates(mut candidates: Vec<TaxiRow>, user_x: i64, user_y: i64) -> Vec<TaxiRow> {
    candidates.sort_by_key(|taxi| (manhattan(taxi.pos_x, taxi.pos_y, user_x, user_y), taxi.taxi_id));
    candidates
}
