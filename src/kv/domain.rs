//! Economy keys shared with the balance and leaderboard collaborators

use super::{KvCommand, KvResult, KvStore};
use crate::snowflake;
use std::time::Duration;

/// Cached balances go stale after an hour
pub const BALANCE_TTL: Duration = Duration::from_secs(60 * 60);

#[must_use]
pub fn balance_key(guild_id: u64, user_id: u64) -> String {
    let mut key = String::with_capacity(48);
    key.push_str("balance:");
    snowflake::push_decimal(&mut key, guild_id);
    key.push(':');
    snowflake::push_decimal(&mut key, user_id);
    key
}

#[must_use]
pub fn leaderboard_key(guild_id: u64) -> String {
    let mut key = String::with_capacity(32);
    key.push_str("leaderboard:");
    snowflake::push_decimal(&mut key, guild_id);
    key
}

/// Cached balance for a member, if any.
///
/// # Errors
///
/// Returns the store error, or `InvalidValue` when the cached value is not
/// an integer.
pub async fn cached_balance(kv: &dyn KvStore, guild_id: u64, user_id: u64) -> KvResult<Option<i64>> {
    let key = balance_key(guild_id, user_id);
    match kv.get(&key).await? {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| super::KvError::InvalidValue {
                key,
                reason: "balance is not an integer".to_string(),
            }),
    }
}

/// Cache a balance and move the member on the guild leaderboard in one
/// round trip.
///
/// # Errors
///
/// Returns the store error.
pub async fn store_balance(kv: &dyn KvStore, guild_id: u64, user_id: u64, balance: i64) -> KvResult<()> {
    #[allow(clippy::cast_precision_loss)]
    let score = balance as f64;
    kv.pipeline(vec![
        KvCommand::Set {
            key: balance_key(guild_id, user_id),
            value: balance.to_string(),
            ttl: Some(BALANCE_TTL),
        },
        KvCommand::ZAdd {
            key: leaderboard_key(guild_id),
            score,
            member: snowflake::to_string(user_id),
        },
    ])
    .await
}

/// Drop a cached balance so the next read goes to the database.
///
/// # Errors
///
/// Returns the store error.
pub async fn invalidate_balance(kv: &dyn KvStore, guild_id: u64, user_id: u64) -> KvResult<()> {
    kv.del(&balance_key(guild_id, user_id)).await
}

/// Top `limit` members by score, highest first. Members whose name is not
/// a snowflake are skipped.
///
/// # Errors
///
/// Returns the store error.
pub async fn leaderboard_top(kv: &dyn KvStore, guild_id: u64, limit: usize) -> KvResult<Vec<(u64, f64)>> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
    let entries = kv
        .zrevrange_with_scores(&leaderboard_key(guild_id), 0, stop)
        .await?;
    Ok(entries
        .into_iter()
        .filter_map(|(member, score)| snowflake::parse(&member).map(|id| (id, score)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    #[test]
    fn test_key_layout() {
        assert_eq!(balance_key(10, 20), "balance:10:20");
        assert_eq!(leaderboard_key(0), "leaderboard:0");
    }

    #[tokio::test]
    async fn test_balance_roundtrip_updates_leaderboard() {
        let kv = MemoryKv::new();
        store_balance(&kv, 1, 100, 500).await.unwrap();
        store_balance(&kv, 1, 200, 900).await.unwrap();
        store_balance(&kv, 1, 300, 50).await.unwrap();

        assert_eq!(cached_balance(&kv, 1, 100).await.unwrap(), Some(500));

        let top = leaderboard_top(&kv, 1, 2).await.unwrap();
        assert_eq!(top, vec![(200, 900.0), (100, 500.0)]);

        invalidate_balance(&kv, 1, 100).await.unwrap();
        assert_eq!(cached_balance(&kv, 1, 100).await.unwrap(), None);
        // Leaderboard position survives balance invalidation
        assert_eq!(leaderboard_top(&kv, 1, 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_leaderboard_top_zero() {
        let kv = MemoryKv::new();
        store_balance(&kv, 1, 100, 5).await.unwrap();
        assert!(leaderboard_top(&kv, 1, 0).await.unwrap().is_empty());
    }
}
