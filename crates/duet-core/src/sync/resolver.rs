//! Whole-record conflict resolution

use crate::models::{ConflictStrategy, Record, StoreId};

/// Decision for one pair of divergent copies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// This side's copy is written to both stores
    Winner(StoreId),
    /// Neither side is written until an operator decides
    Manual,
}

/// Decide between two divergent copies of the same record.
///
/// Pure: no I/O, no clock reads. Under `newest_wins` an exact `updated_at`
/// tie goes to the primary.
pub fn resolve(strategy: ConflictStrategy, primary: &Record, secondary: &Record) -> Resolution {
    match strategy {
        ConflictStrategy::PrimaryWins => Resolution::Winner(StoreId::Primary),
        ConflictStrategy::SecondaryWins => Resolution::Winner(StoreId::Secondary),
        ConflictStrategy::NewestWins => {
            if secondary.updated_at > primary.updated_at {
                Resolution::Winner(StoreId::Secondary)
            } else {
                Resolution::Winner(StoreId::Primary)
            }
        }
        ConflictStrategy::Manual => Resolution::Manual,
    }
}

/// Winning copy re-stamped so it supersedes both sides.
///
/// The version is one past the highest version seen on either side, so
/// both stores end up holding an identical (version, checksum) pair.
pub fn materialize(winner: &Record, loser_version: u64) -> Record {
    winner.with_version(winner.version.max(loser_version) + 1)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::*;
    use crate::models::{RecordKey, TenantId};

    fn copy(name: &str, version: u64, updated_at: i64) -> Record {
        let mut fields = Map::new();
        fields.insert("name".into(), json!(name));
        let key = RecordKey::new(TenantId::new("t").unwrap(), "patients", "p1").unwrap();
        Record::new(key, fields, version, updated_at)
    }

    #[test]
    fn fixed_side_strategies_ignore_timestamps() {
        let primary = copy("Ana", 5, 100);
        let secondary = copy("Anna", 5, 900);
        assert_eq!(
            resolve(ConflictStrategy::PrimaryWins, &primary, &secondary),
            Resolution::Winner(StoreId::Primary)
        );
        assert_eq!(
            resolve(ConflictStrategy::SecondaryWins, &primary, &secondary),
            Resolution::Winner(StoreId::Secondary)
        );
    }

    #[test]
    fn newest_wins_picks_later_timestamp() {
        let older = copy("Ana", 9, 100);
        let newer = copy("Anna", 2, 200);
        assert_eq!(
            resolve(ConflictStrategy::NewestWins, &older, &newer),
            Resolution::Winner(StoreId::Secondary)
        );
        assert_eq!(
            resolve(ConflictStrategy::NewestWins, &newer, &older),
            Resolution::Winner(StoreId::Primary)
        );
    }

    #[test]
    fn newest_wins_tie_goes_to_primary() {
        for at in [0, 1, 1_700_000_000_000] {
            assert_eq!(
                resolve(ConflictStrategy::NewestWins, &copy("Ana", 1, at), &copy("Anna", 7, at)),
                Resolution::Winner(StoreId::Primary)
            );
        }
    }

    #[test]
    fn manual_never_picks_a_side() {
        assert_eq!(
            resolve(ConflictStrategy::Manual, &copy("Ana", 1, 1), &copy("Anna", 1, 2)),
            Resolution::Manual
        );
    }

    #[test]
    fn materialized_winner_supersedes_both_versions() {
        let winner = copy("Ana", 5, 100);
        let stamped = materialize(&winner, 8);
        assert_eq!(stamped.version, 9);
        assert_eq!(stamped.checksum, winner.checksum);
        assert_eq!(materialize(&winner, 2).version, 6);
    }
}
