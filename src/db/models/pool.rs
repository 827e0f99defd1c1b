use std::fmt;

use chrono::{DateTime, Duration, Utc};
use postgres_types::{FromSql, ToSql};
use serde::{Deserialize, Serialize};

/// Pool identity: (network, address).
///
/// Addresses are lowercased on construction so lookups are case-insensitive
/// regardless of how a provider or config file spelled them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolKey {
    pub network: String,
    pub address: String,
}

impl PoolKey {
    pub fn new(network: impl Into<String>, address: impl AsRef<str>) -> Self {
        Self {
            network: network.into().to_lowercase(),
            address: address.as_ref().to_lowercase(),
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.address)
    }
}

/// Protocols whose positions are range-bound rather than full-range.
const CONCENTRATED_PROTOCOLS: &[&str] = &[
    "uniswap-v3",
    "uniswap-v4",
    "pancakeswap-v3",
    "sushiswap-v3",
    "aerodrome-slipstream",
    "velodrome-slipstream",
    "orca-whirlpool",
    "raydium-clmm",
    "meteora-dlmm",
];

/// Liquidity pool metadata (PostgreSQL)
///
/// Primary Key: (network, address)
/// Owned by external configuration. Only `is_active` ever changes after
/// creation; pools are deactivated, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pool {
    pub network: String,
    pub address: String,

    // Token pair
    pub token0: String,
    pub token1: String,
    pub token0_symbol: String,
    pub token1_symbol: String,

    /// Fee in hundredths of a bip (3000 = 0.30%)
    pub fee_tier: u32,
    pub protocol: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Pool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        network: &str,
        address: &str,
        token0: &str,
        token1: &str,
        token0_symbol: &str,
        token1_symbol: &str,
        fee_tier: u32,
        protocol: &str,
    ) -> Self {
        Self {
            network: network.to_lowercase(),
            address: address.to_lowercase(),
            token0: token0.to_lowercase(),
            token1: token1.to_lowercase(),
            token0_symbol: token0_symbol.to_string(),
            token1_symbol: token1_symbol.to_string(),
            fee_tier,
            protocol: protocol.to_lowercase(),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> PoolKey {
        PoolKey::new(self.network.as_str(), &self.address)
    }

    /// Swap fee as a fraction (3000 -> 0.003)
    pub fn fee_rate(&self) -> f64 {
        self.fee_tier as f64 / 1_000_000.0
    }

    /// Whether LP positions in this pool are range-bound.
    pub fn is_concentrated(&self) -> bool {
        let protocol = self.protocol.as_str();
        if CONCENTRATED_PROTOCOLS.contains(&protocol) {
            return true;
        }
        protocol
            .split(['-', '_', ' '])
            .any(|part| matches!(part, "v3" | "v4" | "clmm" | "cl" | "dlmm"))
    }

    pub fn pair_label(&self) -> String {
        format!("{}/{}", self.token0_symbol, self.token1_symbol)
    }
}

/// Update-frequency classification of a tracked pool.
///
/// Ordered by urgency: `Active` sorts first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSql, FromSql,
)]
#[serde(rename_all = "lowercase")]
#[postgres(name = "position_tier", rename_all = "lowercase")]
pub enum Tier {
    Active,
    Watchlist,
    Screening,
}

impl Tier {
    /// Minimum time between two refreshes of a pool in this tier.
    pub fn cadence(&self) -> Duration {
        match self {
            Tier::Active => Duration::hours(1),
            Tier::Watchlist => Duration::hours(6),
            Tier::Screening => Duration::hours(24),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Active => "active",
            Tier::Watchlist => "watchlist",
            Tier::Screening => "screening",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pool as the scheduler sees it: its most urgent position tier plus the
/// timestamps that decide whether it is due.
#[derive(Debug, Clone)]
pub struct TrackedPool {
    pub pool: Pool,
    pub tier: Tier,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(protocol: &str) -> Pool {
        Pool::new(
            "Ethereum",
            "0x88E6A0c2dDD26FEEb64F039a2c41296FcB3f5640",
            "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48",
            "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2",
            "USDC",
            "WETH",
            500,
            protocol,
        )
    }

    #[test]
    fn test_identity_is_lowercased() {
        let pool = pool("uniswap-v3");
        assert_eq!(pool.network, "ethereum");
        assert_eq!(pool.address, "0x88e6a0c2ddd26feeb64f039a2c41296fcb3f5640");
        assert_eq!(
            pool.key(),
            PoolKey::new("ETHEREUM", "0x88e6a0c2ddd26feeb64f039a2c41296fcb3f5640")
        );
    }

    #[test]
    fn test_concentrated_detection() {
        assert!(pool("uniswap-v3").is_concentrated());
        assert!(pool("Raydium-CLMM").is_concentrated());
        assert!(pool("pancakeswap-v3").is_concentrated());
        assert!(!pool("uniswap-v2").is_concentrated());
        assert!(!pool("curve").is_concentrated());
    }

    #[test]
    fn test_fee_rate() {
        assert!((pool("uniswap-v3").fee_rate() - 0.0005).abs() < 1e-12);
    }

    #[test]
    fn test_tier_cadence_and_order() {
        assert_eq!(Tier::Active.cadence(), Duration::hours(1));
        assert_eq!(Tier::Watchlist.cadence(), Duration::hours(6));
        assert_eq!(Tier::Screening.cadence(), Duration::hours(24));
        assert!(Tier::Active < Tier::Watchlist);
        assert!(Tier::Watchlist < Tier::Screening);
    }
}
