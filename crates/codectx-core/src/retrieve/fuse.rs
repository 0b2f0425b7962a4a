//! Reciprocal Rank Fusion over retrieval lanes.
//!
//! Each lane contributes `w_L / (k + rank_L)` per candidate; candidates
//! absent from a lane contribute nothing there. The fold is a sum, so
//! the result is invariant under lane enumeration order, and the
//! tie-break (lexical rank ascending, then chunk id) is invariant under
//! reordering of equally ranked items.

use std::collections::BTreeMap;

use crate::policy::LaneWeights;
use crate::types::{ChunkId, Lane, LaneMask, RankedChunk};

/// One lane's ranked candidate list (best first; rank = index + 1).
#[derive(Debug, Clone)]
pub struct LaneList {
    /// Which lane produced this list.
    pub lane: Lane,
    /// Candidate ids, best first.
    pub ranked: Vec<ChunkId>,
}

/// Fuse lane lists into a single descending-score candidate list.
pub fn rrf_fuse(lanes: &[LaneList], weights: &LaneWeights, k_rrf: u32) -> Vec<RankedChunk> {
    let k = f64::from(k_rrf);

    // BTreeMap keys the fold by chunk id, so insertion (lane) order
    // cannot leak into iteration order.
    let mut fused: BTreeMap<ChunkId, RankedChunk> = BTreeMap::new();

    for lane_list in lanes {
        let weight = match lane_list.lane {
            Lane::Lexical => weights.lexical,
            Lane::Vector => weights.vector,
            Lane::Rerank => weights.rerank,
        };
        for (index, chunk_id) in lane_list.ranked.iter().enumerate() {
            let rank = index as u32 + 1;
            let entry = fused.entry(chunk_id.clone()).or_insert_with(|| RankedChunk {
                chunk_id: chunk_id.clone(),
                score: 0.0,
                lanes: LaneMask::default(),
                lexical_rank: None,
                vector_rank: None,
                rerank_score: None,
            });
            entry.score += weight / (k + f64::from(rank));
            match lane_list.lane {
                Lane::Lexical => {
                    entry.lanes.lexical = true;
                    entry.lexical_rank = Some(rank);
                }
                Lane::Vector => {
                    entry.lanes.vector = true;
                    entry.vector_rank = Some(rank);
                }
                Lane::Rerank => {
                    entry.lanes.rerank = true;
                }
            }
        }
    }

    let mut candidates: Vec<RankedChunk> = fused.into_values().collect();
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let a_lex = a.lexical_rank.unwrap_or(u32::MAX);
                let b_lex = b.lexical_rank.unwrap_or(u32::MAX);
                a_lex.cmp(&b_lex)
            })
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lane(lane: Lane, ids: &[&str]) -> LaneList {
        LaneList {
            lane,
            ranked: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_fusion_sums_lane_contributions() {
        let weights = LaneWeights {
            lexical: 1.0,
            vector: 1.0,
            rerank: 0.0,
        };
        let fused = rrf_fuse(
            &[
                lane(Lane::Lexical, &["a", "b"]),
                lane(Lane::Vector, &["a"]),
            ],
            &weights,
            60,
        );
        assert_eq!(fused[0].chunk_id, "a");
        let expected = 1.0 / 61.0 + 1.0 / 61.0;
        assert!((fused[0].score - expected).abs() < 1e-12);
        assert!(fused[0].lanes.lexical && fused[0].lanes.vector);
        assert_eq!(fused[1].chunk_id, "b");
        assert!((fused[1].score - 1.0 / 62.0).abs() < 1e-12);
    }

    #[test]
    fn test_fusion_commutative_in_lane_order() {
        let weights = LaneWeights::default();
        let a = lane(Lane::Lexical, &["x", "y", "z"]);
        let b = lane(Lane::Vector, &["z", "x"]);
        let forward = rrf_fuse(&[a.clone(), b.clone()], &weights, 60);
        let backward = rrf_fuse(&[b, a], &weights, 60);
        let ids =
            |v: &[RankedChunk]| v.iter().map(|c| c.chunk_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&forward), ids(&backward));
        for (f, r) in forward.iter().zip(backward.iter()) {
            assert!((f.score - r.score).abs() < 1e-12);
        }
    }

    #[test]
    fn test_tie_break_lexical_rank_then_chunk_id() {
        let weights = LaneWeights {
            lexical: 1.0,
            vector: 1.0,
            rerank: 0.0,
        };
        // "a" only in vector rank 1, "b" only in lexical rank 1:
        // equal scores, lexical presence wins.
        let fused = rrf_fuse(
            &[lane(Lane::Lexical, &["b"]), lane(Lane::Vector, &["a"])],
            &weights,
            60,
        );
        assert_eq!(fused[0].chunk_id, "b");
        assert_eq!(fused[1].chunk_id, "a");

        // Same lane, same rank positions across lanes: chunk id decides.
        let fused = rrf_fuse(
            &[lane(Lane::Lexical, &["d"]), lane(Lane::Lexical, &["c"])],
            &weights,
            60,
        );
        assert_eq!(fused[0].chunk_id, "c");
    }

    #[test]
    fn test_zero_weight_lane_contributes_nothing() {
        let weights = LaneWeights {
            lexical: 1.0,
            vector: 0.0,
            rerank: 0.0,
        };
        let fused = rrf_fuse(
            &[
                lane(Lane::Lexical, &["a"]),
                lane(Lane::Vector, &["b", "a"]),
            ],
            &weights,
            60,
        );
        assert_eq!(fused[0].chunk_id, "a");
        // "b" appears with zero score but keeps its lane provenance.
        assert_eq!(fused[1].chunk_id, "b");
        assert_eq!(fused[1].score, 0.0);
        assert!(fused[1].lanes.vector);
    }
}
