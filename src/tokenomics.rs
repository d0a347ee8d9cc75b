//! Tokenomics Engine
//!
//! Pure conversions between reported token usage and MULE, the broker's
//! internal unit of account (six decimal places, rounded half away from
//! zero), plus the platform fee split applied to every settlement.

use crate::classifier::Tier;
use crate::config::TokenomicsConfig;

/// Number of fractional digits carried by every MULE amount.
pub const MULE_DECIMALS: u32 = 6;

const SCALE: f64 = 1_000_000.0;

/// Round a MULE amount to six decimal places, half away from zero.
pub fn round6(value: f64) -> f64 {
    (value * SCALE).round() / SCALE
}

/// Pricing engine configured once at startup.
#[derive(Debug, Clone)]
pub struct Tokenomics {
    config: TokenomicsConfig,
}

impl Tokenomics {
    pub fn new(config: TokenomicsConfig) -> Self {
        Self { config }
    }

    /// MULE granted to a freshly created balance.
    pub fn welcome_amount(&self) -> f64 {
        round6(self.config.welcome_amount)
    }

    /// Fraction of every consumption amount retained by the broker.
    pub fn platform_fee_rate(&self) -> f64 {
        self.config.platform_fee_rate
    }

    /// Convert a token count to MULE for the given tier.
    ///
    /// Defensive: a non-finite or negative count prices as zero, since token
    /// counts arrive from untrusted provider reports.
    pub fn tokens_to_mules(&self, tokens: f64, tier: Tier) -> f64 {
        if !tokens.is_finite() || tokens < 0.0 {
            return 0.0;
        }
        let rate = self.config.conversion_rates.rate(tier) as f64;
        round6(tokens / rate)
    }

    /// Convert a MULE amount to the number of whole tokens it buys.
    pub fn mules_to_tokens(&self, mules: f64, tier: Tier) -> u64 {
        if !mules.is_finite() || mules <= 0.0 {
            return 0;
        }
        let rate = self.config.conversion_rates.rate(tier) as f64;
        (mules * rate).floor() as u64
    }

    /// The provider's share of a consumption amount.
    pub fn provider_earnings(&self, mules: f64) -> f64 {
        round6(mules * (1.0 - self.config.platform_fee_rate))
    }

    /// The broker's share of a consumption amount.
    pub fn platform_fee(&self, mules: f64) -> f64 {
        round6(mules * self.config.platform_fee_rate)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
