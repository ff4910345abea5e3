// Elo rating calculation.
//
// One independent rating track per difficulty, K=32 for everyone.
// Multi-player ranked games are scored as pairwise winner-vs-loser updates.

pub const STARTING_RATING: i32 = 1200;
const K_FACTOR: f64 = 32.0;

/// Expected score for player A against player B.
pub fn expected_score(rating_a: i32, rating_b: i32) -> f64 {
    1.0 / (1.0 + 10.0_f64.powf((rating_b - rating_a) as f64 / 400.0))
}

/// Rating points the winner takes from one loser.
///
/// The loser loses exactly this amount, so each pair is zero-sum.
pub fn pairwise_delta(winner_rating: i32, loser_rating: i32) -> i32 {
    let expected = expected_score(winner_rating, loser_rating);
    (K_FACTOR * (1.0 - expected)).round() as i32
}

/// Rating change for one participant of a ranked game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatingChange {
    pub old_rating: i32,
    pub new_rating: i32,
    pub change: i32,
}

impl RatingChange {
    pub fn unchanged(rating: i32) -> Self {
        Self {
            old_rating: rating,
            new_rating: rating,
            change: 0,
        }
    }
}

/// Compute rating changes for a completed ranked game.
///
/// `ratings[0]` is the winner; the rest are losers. The winner plays one
/// pairwise update against each loser and the deltas are summed.
pub fn rate_game(ratings: &[i32]) -> Vec<RatingChange> {
    let Some((&winner, losers)) = ratings.split_first() else {
        return Vec::new();
    };

    let mut changes: Vec<RatingChange> = Vec::with_capacity(ratings.len());
    let mut winner_gain = 0;
    changes.push(RatingChange::unchanged(winner)); // filled in below

    for &loser in losers {
        let delta = pairwise_delta(winner, loser);
        winner_gain += delta;
        changes.push(RatingChange {
            old_rating: loser,
            new_rating: loser - delta,
            change: -delta,
        });
    }

    changes[0] = RatingChange {
        old_rating: winner,
        new_rating: winner + winner_gain,
        change: winner_gain,
    };
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_score_equal_ratings() {
        let e = expected_score(1200, 1200);
        assert!((e - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_expected_score_higher_rated() {
        let e = expected_score(1500, 1200);
        assert!(e > 0.8);
        assert!(e < 1.0);
    }

    #[test]
    fn test_pairwise_equal_ratings() {
        // K=32, expected=0.5: winner takes 16
        assert_eq!(pairwise_delta(1200, 1200), 16);
    }

    #[test]
    fn test_rate_game_two_players() {
        let changes = rate_game(&[1200, 1200]);
        assert_eq!(changes[0].change, 16);
        assert_eq!(changes[0].new_rating, 1216);
        assert_eq!(changes[1].change, -16);
        assert_eq!(changes[1].new_rating, 1184);
    }

    #[test]
    fn test_rate_game_underdog_wins() {
        let changes = rate_game(&[1000, 1400]);
        // Underdog gains much more than 16
        assert!(changes[0].change > 16);
        assert_eq!(changes[0].change, -changes[1].change);
    }

    #[test]
    fn test_rate_game_zero_sum() {
        for ratings in [&[1200, 1200][..], &[1350, 1100, 1500, 1200][..]] {
            let changes = rate_game(ratings);
            let sum: i32 = changes.iter().map(|c| c.change).sum();
            assert_eq!(sum, 0, "ratings {ratings:?} must be zero-sum");
        }
    }

    #[test]
    fn test_rate_game_multiplayer_sums_pairwise() {
        let changes = rate_game(&[1200, 1200, 1200]);
        // Two equal pairings: 16 from each loser
        assert_eq!(changes[0].change, 32);
        assert_eq!(changes[1].change, -16);
        assert_eq!(changes[2].change, -16);
    }

    #[test]
    fn test_rate_game_empty() {
        assert!(rate_game(&[]).is_empty());
    }
}
