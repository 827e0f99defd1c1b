use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::error;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;

use crate::analytics::fvr::Recommendation;
use crate::db::models::{
    Alert, AlertType, ApiUsageCounter, FvrHistoryPoint, HistoryWrite, ObservationStats, Pool,
    PoolAnalyticsSnapshot, PoolKey, PriceObservation, Tier, TrackedPool, VolatilityHistoryPoint,
};
use crate::db::postgres::PostgresClient;
use crate::db::Store;

/// Sanitize a string for PostgreSQL by removing null bytes (0x00)
/// which are invalid in UTF-8 text columns
fn sanitize_string(s: &str) -> String {
    s.replace('\0', "")
}

/// Build `($1,..,$n), ($n+1,..)` placeholders for a multi-row insert.
fn values_clauses(rows: usize, cols_per_row: usize) -> String {
    (0..rows)
        .map(|i| {
            let start = i * cols_per_row + 1;
            let placeholders: Vec<String> = (start..start + cols_per_row)
                .map(|n| format!("${}", n))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn history_write(rows_affected: u64) -> HistoryWrite {
    if rows_affected == 0 {
        HistoryWrite::AlreadyRecorded
    } else {
        HistoryWrite::Inserted
    }
}

#[async_trait]
impl Store for PostgresClient {
    // ==================== POOLS & TIERS ====================

    async fn upsert_pool(&self, pool: &Pool) -> Result<()> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO lpscope.pools (
                network, address, token0, token1, token0_symbol, token1_symbol,
                fee_tier, protocol, is_active, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (network, address) DO NOTHING
        "#;

        let fee_tier = pool.fee_tier as i32;
        client
            .execute(
                query,
                &[
                    &pool.network,
                    &pool.address,
                    &pool.token0,
                    &pool.token1,
                    &sanitize_string(&pool.token0_symbol),
                    &sanitize_string(&pool.token1_symbol),
                    &fee_tier,
                    &pool.protocol,
                    &pool.is_active,
                    &pool.created_at,
                ],
            )
            .await
            .map_err(|e| {
                error!("Failed to insert pool {}: {:?}", pool.key(), e);
                e
            })?;

        Ok(())
    }

    async fn set_pool_active(&self, key: &PoolKey, is_active: bool) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE lpscope.pools SET is_active = $3 WHERE network = $1 AND address = $2",
                &[&key.network, &key.address, &is_active],
            )
            .await?;
        Ok(())
    }

    async fn set_position_tier(&self, key: &PoolKey, position: &str, tier: Tier) -> Result<()> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO lpscope.user_positions (network, pool_address, position, tier, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (network, pool_address, position) DO UPDATE SET
                tier = EXCLUDED.tier,
                updated_at = EXCLUDED.updated_at
        "#;

        client
            .execute(query, &[&key.network, &key.address, &position, &tier])
            .await?;
        Ok(())
    }

    async fn tracked_pools(&self) -> Result<Vec<TrackedPool>> {
        let client = self.pool.get().await?;
        // Enum order is active < watchlist < screening, so MIN is the most urgent tier
        let query = r#"
            SELECT
                p.network, p.address, p.token0, p.token1, p.token0_symbol, p.token1_symbol,
                p.fee_tier, p.protocol, p.is_active, p.created_at,
                MIN(u.tier) AS tier, a.last_updated, a.last_error_at
            FROM lpscope.pools p
            JOIN lpscope.user_positions u
                ON u.network = p.network AND u.pool_address = p.address
            LEFT JOIN lpscope.pool_analytics a
                ON a.network = p.network AND a.pool_address = p.address
            WHERE p.is_active
            GROUP BY p.network, p.address, a.last_updated, a.last_error_at
            ORDER BY p.network, p.address
        "#;

        let rows = client.query(query, &[]).await?;
        let tracked = rows
            .iter()
            .map(|row| TrackedPool {
                pool: row_to_pool(row),
                tier: row.get("tier"),
                last_updated: row.get("last_updated"),
                last_error_at: row.get("last_error_at"),
            })
            .collect();

        Ok(tracked)
    }

    // ==================== OBSERVATIONS ====================

    async fn latest_observation_before(
        &self,
        key: &PoolKey,
        before: DateTime<Utc>,
    ) -> Result<Option<PriceObservation>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT network, pool_address, timestamp, price, volume_usd, log_return
            FROM lpscope.price_data
            WHERE network = $1 AND pool_address = $2 AND timestamp < $3
            ORDER BY timestamp DESC
            LIMIT 1
        "#;

        let row = client
            .query_opt(query, &[&key.network, &key.address, &before])
            .await?;
        Ok(row.as_ref().map(row_to_observation))
    }

    async fn observations_between(
        &self,
        key: &PoolKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PriceObservation>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT network, pool_address, timestamp, price, volume_usd, log_return
            FROM lpscope.price_data
            WHERE network = $1 AND pool_address = $2 AND timestamp BETWEEN $3 AND $4
            ORDER BY timestamp ASC
        "#;

        let rows = client
            .query(query, &[&key.network, &key.address, &from, &to])
            .await?;
        Ok(rows.iter().map(row_to_observation).collect())
    }

    async fn insert_observations(&self, observations: &[PriceObservation]) -> Result<u64> {
        if observations.is_empty() {
            return Ok(0);
        }

        const COLS_PER_ROW: usize = 6;
        const BATCH_SIZE: usize = 1000;

        let client = self.pool.get().await?;
        let mut inserted = 0;

        for chunk in observations.chunks(BATCH_SIZE) {
            let query = format!(
                r#"
                INSERT INTO lpscope.price_data (
                    network, pool_address, timestamp, price, volume_usd, log_return
                ) VALUES {}
                ON CONFLICT (network, pool_address, timestamp) DO NOTHING
                "#,
                values_clauses(chunk.len(), COLS_PER_ROW)
            );

            let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(chunk.len() * COLS_PER_ROW);
            for obs in chunk {
                params.push(&obs.pool.network);
                params.push(&obs.pool.address);
                params.push(&obs.timestamp);
                params.push(&obs.price);
                params.push(&obs.volume_usd);
                params.push(&obs.log_return);
            }

            inserted += client.execute(&query, &params).await.map_err(|e| {
                error!("Failed to batch insert {} observations: {:?}", chunk.len(), e);
                e
            })?;
        }

        Ok(inserted)
    }

    async fn recent_log_returns(&self, key: &PoolKey, limit: usize) -> Result<Vec<Option<f64>>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT log_return FROM (
                SELECT timestamp, log_return
                FROM lpscope.price_data
                WHERE network = $1 AND pool_address = $2
                ORDER BY timestamp DESC
                LIMIT $3
            ) recent
            ORDER BY timestamp ASC
        "#;

        let limit = limit as i64;
        let rows = client
            .query(query, &[&key.network, &key.address, &limit])
            .await?;
        Ok(rows.iter().map(|row| row.get("log_return")).collect())
    }

    async fn observation_stats(&self, key: &PoolKey) -> Result<ObservationStats> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT COUNT(*) AS count, MIN(timestamp) AS oldest, MAX(timestamp) AS newest
            FROM lpscope.price_data
            WHERE network = $1 AND pool_address = $2
        "#;

        let row = client
            .query_one(query, &[&key.network, &key.address])
            .await?;
        Ok(ObservationStats {
            count: row.get("count"),
            oldest: row.get("oldest"),
            newest: row.get("newest"),
        })
    }

    // ==================== SNAPSHOTS ====================

    async fn get_snapshot(&self, key: &PoolKey) -> Result<Option<PoolAnalyticsSnapshot>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT
                network, pool_address, tvl_usd, volume_24h_usd, volume_7d_usd, fees_24h_usd,
                fee_apr, volatility_1d, volatility_7d, volatility_30d, fvr, recommendation,
                il_risk_score, expected_il_30d, breakeven_fee_apr, data_points_count,
                oldest_data_point, newest_data_point, last_error, last_error_at, last_updated
            FROM lpscope.pool_analytics
            WHERE network = $1 AND pool_address = $2
        "#;

        let row = client
            .query_opt(query, &[&key.network, &key.address])
            .await?;
        Ok(row.as_ref().map(row_to_snapshot))
    }

    async fn upsert_snapshot(&self, s: &PoolAnalyticsSnapshot) -> Result<bool> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO lpscope.pool_analytics (
                network, pool_address, tvl_usd, volume_24h_usd, volume_7d_usd, fees_24h_usd,
                fee_apr, volatility_1d, volatility_7d, volatility_30d, fvr, recommendation,
                il_risk_score, expected_il_30d, breakeven_fee_apr, data_points_count,
                oldest_data_point, newest_data_point, last_error, last_error_at, last_updated
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                      $17, $18, $19, $20, $21)
            ON CONFLICT (network, pool_address) DO UPDATE SET
                tvl_usd = EXCLUDED.tvl_usd,
                volume_24h_usd = EXCLUDED.volume_24h_usd,
                volume_7d_usd = EXCLUDED.volume_7d_usd,
                fees_24h_usd = EXCLUDED.fees_24h_usd,
                fee_apr = EXCLUDED.fee_apr,
                volatility_1d = EXCLUDED.volatility_1d,
                volatility_7d = EXCLUDED.volatility_7d,
                volatility_30d = EXCLUDED.volatility_30d,
                fvr = EXCLUDED.fvr,
                recommendation = EXCLUDED.recommendation,
                il_risk_score = EXCLUDED.il_risk_score,
                expected_il_30d = EXCLUDED.expected_il_30d,
                breakeven_fee_apr = EXCLUDED.breakeven_fee_apr,
                data_points_count = EXCLUDED.data_points_count,
                oldest_data_point = EXCLUDED.oldest_data_point,
                newest_data_point = EXCLUDED.newest_data_point,
                last_error = EXCLUDED.last_error,
                last_error_at = EXCLUDED.last_error_at,
                last_updated = EXCLUDED.last_updated
            WHERE lpscope.pool_analytics.last_updated IS NULL
               OR lpscope.pool_analytics.last_updated <= EXCLUDED.last_updated
        "#;

        let recommendation = s.recommendation.map(|r| r.as_str());
        let last_error = s.last_error.as_deref().map(sanitize_string);
        let written = client
            .execute(
                query,
                &[
                    &s.pool.network,
                    &s.pool.address,
                    &s.tvl_usd,
                    &s.volume_24h_usd,
                    &s.volume_7d_usd,
                    &s.fees_24h_usd,
                    &s.fee_apr,
                    &s.volatility_1d,
                    &s.volatility_7d,
                    &s.volatility_30d,
                    &s.fvr,
                    &recommendation,
                    &s.il_risk_score,
                    &s.expected_il_30d,
                    &s.breakeven_fee_apr,
                    &s.data_points_count,
                    &s.oldest_data_point,
                    &s.newest_data_point,
                    &last_error,
                    &s.last_error_at,
                    &s.last_updated,
                ],
            )
            .await
            .map_err(|e| {
                error!("Failed to upsert analytics for {}: {:?}", s.pool, e);
                e
            })?;

        Ok(written > 0)
    }

    async fn record_pool_failure(
        &self,
        key: &PoolKey,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO lpscope.pool_analytics (network, pool_address, last_error, last_error_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (network, pool_address) DO UPDATE SET
                last_error = EXCLUDED.last_error,
                last_error_at = EXCLUDED.last_error_at
        "#;

        client
            .execute(
                query,
                &[&key.network, &key.address, &sanitize_string(error), &at],
            )
            .await?;
        Ok(())
    }

    // ==================== HISTORY ====================

    async fn insert_volatility_history(
        &self,
        point: &VolatilityHistoryPoint,
    ) -> Result<HistoryWrite> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO lpscope.volatility_history (network, pool_address, date, period_days, value)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (network, pool_address, date, period_days) DO NOTHING
        "#;

        let written = client
            .execute(
                query,
                &[
                    &point.pool.network,
                    &point.pool.address,
                    &point.date,
                    &point.period_days,
                    &point.value,
                ],
            )
            .await?;
        Ok(history_write(written))
    }

    async fn insert_fvr_history(&self, point: &FvrHistoryPoint) -> Result<HistoryWrite> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO lpscope.fvr_history (
                network, pool_address, date, fvr, fee_apr, volatility, recommendation
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (network, pool_address, date) DO NOTHING
        "#;

        let written = client
            .execute(
                query,
                &[
                    &point.pool.network,
                    &point.pool.address,
                    &point.date,
                    &point.fvr,
                    &point.fee_apr,
                    &point.volatility,
                    &point.recommendation.as_str(),
                ],
            )
            .await?;
        Ok(history_write(written))
    }

    async fn volatility_history(&self, key: &PoolKey) -> Result<Vec<VolatilityHistoryPoint>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT date, period_days, value
            FROM lpscope.volatility_history
            WHERE network = $1 AND pool_address = $2
            ORDER BY date ASC, period_days ASC
        "#;

        let rows = client
            .query(query, &[&key.network, &key.address])
            .await?;
        Ok(rows
            .iter()
            .map(|row| VolatilityHistoryPoint {
                pool: key.clone(),
                date: row.get("date"),
                period_days: row.get("period_days"),
                value: row.get("value"),
            })
            .collect())
    }

    async fn fvr_history(&self, key: &PoolKey) -> Result<Vec<FvrHistoryPoint>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT date, fvr, fee_apr, volatility, recommendation
            FROM lpscope.fvr_history
            WHERE network = $1 AND pool_address = $2
            ORDER BY date ASC
        "#;

        let rows = client
            .query(query, &[&key.network, &key.address])
            .await?;

        rows.iter()
            .map(|row| {
                let recommendation: String = row.get("recommendation");
                Ok(FvrHistoryPoint {
                    pool: key.clone(),
                    date: row.get("date"),
                    fvr: row.get("fvr"),
                    fee_apr: row.get("fee_apr"),
                    volatility: row.get("volatility"),
                    recommendation: recommendation.parse()?,
                })
            })
            .collect()
    }

    // ==================== API USAGE ====================

    async fn increment_api_usage(
        &self,
        service: &str,
        endpoint: &str,
        hour_bucket: DateTime<Utc>,
    ) -> Result<()> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO lpscope.api_usage (service, endpoint, hour_bucket, request_count)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (service, endpoint, hour_bucket) DO UPDATE SET
                request_count = lpscope.api_usage.request_count + 1
        "#;

        client
            .execute(query, &[&service, &endpoint, &hour_bucket])
            .await?;
        Ok(())
    }

    async fn api_usage_since(
        &self,
        service: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ApiUsageCounter>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT service, endpoint, hour_bucket, request_count
            FROM lpscope.api_usage
            WHERE service = $1 AND hour_bucket >= $2
            ORDER BY endpoint ASC, hour_bucket ASC
        "#;

        let rows = client.query(query, &[&service, &since]).await?;
        Ok(rows
            .iter()
            .map(|row| ApiUsageCounter {
                service: row.get("service"),
                endpoint: row.get("endpoint"),
                hour_bucket: row.get("hour_bucket"),
                request_count: row.get("request_count"),
            })
            .collect())
    }

    // ==================== ALERTS ====================

    async fn create_alert(
        &self,
        key: &PoolKey,
        alert_type: AlertType,
        threshold_value: f64,
    ) -> Result<i64> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO lpscope.alerts (network, pool_address, alert_type, threshold_value)
            VALUES ($1, $2, $3, $4)
            RETURNING id
        "#;

        let row = client
            .query_one(
                query,
                &[&key.network, &key.address, &alert_type.as_str(), &threshold_value],
            )
            .await?;
        Ok(row.get("id"))
    }

    async fn active_alerts(&self, key: &PoolKey) -> Result<Vec<Alert>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT id, alert_type, threshold_value, is_active, last_triggered
            FROM lpscope.alerts
            WHERE network = $1 AND pool_address = $2 AND is_active
            ORDER BY id ASC
        "#;

        let rows = client
            .query(query, &[&key.network, &key.address])
            .await?;

        rows.iter()
            .map(|row| {
                let alert_type: String = row.get("alert_type");
                Ok(Alert {
                    id: row.get("id"),
                    pool: key.clone(),
                    alert_type: alert_type.parse()?,
                    threshold_value: row.get("threshold_value"),
                    is_active: row.get("is_active"),
                    last_triggered: row.get("last_triggered"),
                })
            })
            .collect()
    }

    async fn mark_alert_triggered(&self, alert_id: i64, at: DateTime<Utc>) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE lpscope.alerts SET last_triggered = $2 WHERE id = $1",
                &[&alert_id, &at],
            )
            .await?;
        Ok(())
    }
}

// ==================== HELPER FUNCTIONS ====================

fn row_to_pool(row: &Row) -> Pool {
    let fee_tier: i32 = row.get("fee_tier");
    Pool {
        network: row.get("network"),
        address: row.get("address"),
        token0: row.get("token0"),
        token1: row.get("token1"),
        token0_symbol: row.get("token0_symbol"),
        token1_symbol: row.get("token1_symbol"),
        fee_tier: fee_tier.max(0) as u32,
        protocol: row.get("protocol"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
    }
}

fn row_to_observation(row: &Row) -> PriceObservation {
    PriceObservation {
        pool: PoolKey {
            network: row.get("network"),
            address: row.get("pool_address"),
        },
        timestamp: row.get("timestamp"),
        price: row.get("price"),
        volume_usd: row.get("volume_usd"),
        log_return: row.get("log_return"),
    }
}

fn row_to_snapshot(row: &Row) -> PoolAnalyticsSnapshot {
    let recommendation: Option<String> = row.get("recommendation");
    PoolAnalyticsSnapshot {
        pool: PoolKey {
            network: row.get("network"),
            address: row.get("pool_address"),
        },
        tvl_usd: row.get("tvl_usd"),
        volume_24h_usd: row.get("volume_24h_usd"),
        volume_7d_usd: row.get("volume_7d_usd"),
        fees_24h_usd: row.get("fees_24h_usd"),
        fee_apr: row.get("fee_apr"),
        volatility_1d: row.get("volatility_1d"),
        volatility_7d: row.get("volatility_7d"),
        volatility_30d: row.get("volatility_30d"),
        fvr: row.get("fvr"),
        // Unknown labels read back as absent rather than failing the whole row
        recommendation: recommendation.and_then(|r| r.parse::<Recommendation>().ok()),
        il_risk_score: row.get("il_risk_score"),
        expected_il_30d: row.get("expected_il_30d"),
        breakeven_fee_apr: row.get("breakeven_fee_apr"),
        data_points_count: row.get("data_points_count"),
        oldest_data_point: row.get("oldest_data_point"),
        newest_data_point: row.get("newest_data_point"),
        last_error: row.get("last_error"),
        last_error_at: row.get("last_error_at"),
        last_updated: row.get("last_updated"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_clauses() {
        assert_eq!(values_clauses(1, 3), "($1, $2, $3)");
        assert_eq!(values_clauses(2, 2), "($1, $2), ($3, $4)");
    }

    #[test]
    fn test_sanitize_string() {
        assert_eq!(sanitize_string("WE\0TH"), "WETH");
    }
}
