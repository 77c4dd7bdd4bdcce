//! Virtual trader: a configured strategy profile with its own balance.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};

/// Thresholds gating whether a trader takes a signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionParams {
    /// Minimum signal confidence (0.0 to 1.0)
    pub confidence_threshold: f64,

    /// Minimum weighted score for LONG signals (0.0 to 1.0)
    pub buy_threshold: f64,

    /// Minimum weighted score for SHORT signals (0.0 to 1.0)
    pub sell_threshold: f64,
}

impl Default for DecisionParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            buy_threshold: 0.6,
            sell_threshold: 0.6,
        }
    }
}

/// Sizing, exit defaults and fees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskParams {
    /// Percentage of current balance committed as margin per position
    pub max_position_pct: Decimal,

    /// Default stop-loss distance from entry, in percent
    pub stop_loss_pct: Decimal,

    /// Default take-profit distance from entry, in percent
    pub take_profit_pct: Decimal,

    /// Fee charged on entry and exit notional (e.g. 0.0004 = 0.04%)
    pub fee_rate: Decimal,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            max_position_pct: dec!(10),
            stop_loss_pct: dec!(5),
            take_profit_pct: dec!(10),
            fee_rate: dec!(0.0004),
        }
    }
}

/// Configured strategy profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualTrader {
    pub id: String,
    pub name: String,
    pub initial_balance: Decimal,

    /// Changed only by realized PnL on close
    pub current_balance: Decimal,
    pub leverage: u32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub decision: DecisionParams,
    pub risk: RiskParams,

    /// Indicator name -> weight for the confluence score
    #[serde(default)]
    pub indicator_weights: HashMap<String, f64>,
}

impl VirtualTrader {
    /// Build a trader from a creation request.
    pub fn from_new(new: NewTrader) -> SimResult<Self> {
        new.validate()?;
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: new.name,
            initial_balance: new.initial_balance,
            current_balance: new.initial_balance,
            leverage: new.leverage,
            enabled: new.enabled,
            created_at: Utc::now(),
            decision: new.decision,
            risk: new.risk,
            indicator_weights: new.indicator_weights,
        })
    }

    /// Copy of this configuration under a new identity with a fresh balance.
    pub fn cloned_as(&self, name: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            current_balance: self.initial_balance,
            created_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Apply a partial update; balances are never touched here.
    pub fn apply(&mut self, update: TraderUpdate) -> SimResult<()> {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        if let Some(leverage) = update.leverage {
            self.leverage = leverage;
        }
        if let Some(decision) = update.decision {
            self.decision = decision;
        }
        if let Some(risk) = update.risk {
            self.risk = risk;
        }
        if let Some(weights) = update.indicator_weights {
            self.indicator_weights = weights;
        }

        validate_config(&self.name, self.leverage, &self.decision, &self.risk, &self.indicator_weights)
    }

    /// Return on initial balance, in percent.
    pub fn return_pct(&self) -> Decimal {
        if self.initial_balance.is_zero() {
            return Decimal::ZERO;
        }
        (self.current_balance - self.initial_balance) / self.initial_balance * Decimal::ONE_HUNDRED
    }
}

/// Request to create a trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTrader {
    pub name: String,
    pub initial_balance: Decimal,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub decision: DecisionParams,
    #[serde(default)]
    pub risk: RiskParams,
    #[serde(default)]
    pub indicator_weights: HashMap<String, f64>,
}

fn default_leverage() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl NewTrader {
    pub fn new(name: impl Into<String>, initial_balance: Decimal) -> Self {
        Self {
            name: name.into(),
            initial_balance,
            leverage: 1,
            enabled: true,
            decision: DecisionParams::default(),
            risk: RiskParams::default(),
            indicator_weights: HashMap::new(),
        }
    }

    pub fn validate(&self) -> SimResult<()> {
        if self.initial_balance <= Decimal::ZERO {
            return Err(SimError::InvalidInput(
                "initial_balance must be positive".to_string(),
            ));
        }
        validate_config(&self.name, self.leverage, &self.decision, &self.risk, &self.indicator_weights)
    }
}

/// Partial update of trader configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraderUpdate {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub leverage: Option<u32>,
    pub decision: Option<DecisionParams>,
    pub risk: Option<RiskParams>,
    pub indicator_weights: Option<HashMap<String, f64>>,
}

fn validate_config(
    name: &str,
    leverage: u32,
    decision: &DecisionParams,
    risk: &RiskParams,
    weights: &HashMap<String, f64>,
) -> SimResult<()> {
    if name.trim().is_empty() {
        return Err(SimError::InvalidInput("name must not be empty".to_string()));
    }
    if leverage < 1 {
        return Err(SimError::InvalidInput("leverage must be >= 1".to_string()));
    }

    for (label, value) in [
        ("confidence_threshold", decision.confidence_threshold),
        ("buy_threshold", decision.buy_threshold),
        ("sell_threshold", decision.sell_threshold),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(SimError::InvalidInput(format!(
                "{} must be within [0, 1], got {}",
                label, value
            )));
        }
    }

    if risk.max_position_pct <= Decimal::ZERO || risk.max_position_pct > Decimal::ONE_HUNDRED {
        return Err(SimError::InvalidInput(
            "max_position_pct must be within (0, 100]".to_string(),
        ));
    }
    if risk.stop_loss_pct <= Decimal::ZERO || risk.take_profit_pct <= Decimal::ZERO {
        return Err(SimError::InvalidInput(
            "stop_loss_pct and take_profit_pct must be positive".to_string(),
        ));
    }
    if risk.fee_rate < Decimal::ZERO {
        return Err(SimError::InvalidInput("fee_rate must not be negative".to_string()));
    }
    if let Some((name, _)) = weights.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
        return Err(SimError::InvalidInput(format!(
            "indicator weight for {} must be a non-negative number",
            name
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_trader_starts_at_initial_balance() {
        let trader = VirtualTrader::from_new(NewTrader::new("alpha", dec!(10000))).unwrap();
        assert_eq!(trader.current_balance, dec!(10000));
        assert_eq!(trader.leverage, 1);
        assert!(trader.enabled);
    }

    #[test]
    fn test_validation_rejects_bad_config() {
        let mut new = NewTrader::new("alpha", dec!(10000));
        new.leverage = 0;
        assert!(matches!(new.validate(), Err(SimError::InvalidInput(_))));

        let mut new = NewTrader::new("alpha", dec!(10000));
        new.decision.buy_threshold = 1.5;
        assert!(new.validate().is_err());

        let new = NewTrader::new("alpha", dec!(0));
        assert!(new.validate().is_err());

        let mut new = NewTrader::new("  ", dec!(100));
        new.leverage = 3;
        assert!(new.validate().is_err());
    }

    #[test]
    fn test_clone_resets_balance_and_identity() {
        let mut trader = VirtualTrader::from_new(NewTrader::new("alpha", dec!(5000))).unwrap();
        trader.current_balance = dec!(7300);
        trader.indicator_weights.insert("rsi".to_string(), 2.0);

        let copy = trader.cloned_as("alpha-2".to_string());
        assert_ne!(copy.id, trader.id);
        assert_eq!(copy.current_balance, dec!(5000));
        assert_eq!(copy.indicator_weights.get("rsi"), Some(&2.0));
    }

    #[test]
    fn test_update_keeps_balance() {
        let mut trader = VirtualTrader::from_new(NewTrader::new("alpha", dec!(5000))).unwrap();
        trader.current_balance = dec!(4200);

        trader
            .apply(TraderUpdate {
                leverage: Some(20),
                enabled: Some(false),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(trader.leverage, 20);
        assert!(!trader.enabled);
        assert_eq!(trader.current_balance, dec!(4200));
        assert_eq!(trader.return_pct(), dec!(-16));
    }
}
