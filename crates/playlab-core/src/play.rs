//! Play document model: the declarative strategy definition the engine runs.
//!
//! A Play arrives as an already-parsed serde document (YAML loading and full
//! schema validation live outside this crate). The subset modeled here is
//! what the engine honors: symbol, timeframes, account, per-role features and
//! structures, action rules, position policy, and risk settings.
//!
//! Rule conditions reference snapshot values by dotted path. In a rule,
//! `{"path": "..."}` is a snapshot reference, a bare number is a constant,
//! a `{"text": "..."}` object is a string literal (for state comparisons),
//! and `{"expr": {...}}` is an arithmetic sub-expression.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::bar::timeframe_ms;
use crate::detectors::{DetectorSpec, Params};
use crate::error::{CoreError, Result};

/// Timeframe role labels used to key features and structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TfRole {
    Exec,
    LowTf,
    MedTf,
    HighTf,
}

/// Declared timeframes per role. `exec` is mandatory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeframes {
    pub exec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_tf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub med_tf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_tf: Option<String>,
}

impl Timeframes {
    pub fn resolve(&self, role: TfRole) -> Option<&str> {
        match role {
            TfRole::Exec => Some(&self.exec),
            TfRole::LowTf => self.low_tf.as_deref(),
            TfRole::MedTf => self.med_tf.as_deref(),
            TfRole::HighTf => self.high_tf.as_deref(),
        }
    }

    /// Declared non-exec roles with their labels.
    pub fn htf_roles(&self) -> Vec<(TfRole, &str)> {
        let mut out = Vec::new();
        for role in [TfRole::LowTf, TfRole::MedTf, TfRole::HighTf] {
            if let Some(label) = self.resolve(role) {
                out.push((role, label));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MarginMode {
    #[default]
    Isolated,
}

/// Fee model (rates as decimals, e.g. 0.0006 = 6 bps taker).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeModel {
    pub taker_rate: f64,
    pub maker_rate: f64,
}

impl Default for FeeModel {
    fn default() -> Self {
        Self {
            taker_rate: 0.0006,
            maker_rate: 0.0001,
        }
    }
}

/// Account settings for the simulated exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub starting_equity: f64,
    pub leverage: f64,
    #[serde(default)]
    pub margin_mode: MarginMode,
    #[serde(default)]
    pub fees: FeeModel,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: f64,
}

fn default_slippage_bps() -> f64 {
    5.0
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            starting_equity: 10_000.0,
            leverage: 1.0,
            margin_mode: MarginMode::Isolated,
            fees: FeeModel::default(),
            slippage_bps: default_slippage_bps(),
        }
    }
}

/// One declared indicator for a TF role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    /// Indicator id (e.g. "atr", "ema")
    pub name: String,
    /// Output key; defaults to `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub params: Params,
}

impl FeatureSpec {
    pub fn output_key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.name)
    }
}

/// A rule operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Num(f64),
    Ref { path: String },
    Lit { text: String },
    Expr { expr: Box<ValueExpr> },
}

/// Arithmetic / selector sub-expressions producing numeric values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ValueExpr {
    Add { left: Value, right: Value },
    Sub { left: Value, right: Value },
    Mul { left: Value, right: Value },
    Div { left: Value, right: Value },
    CasesWhen { cases: Vec<Case>, default: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub when: Condition,
    pub value: Value,
}

/// Boolean condition tree over snapshot paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Gt { left: Value, right: Value },
    Lt { left: Value, right: Value },
    Ge { left: Value, right: Value },
    Le { left: Value, right: Value },
    Eq { left: Value, right: Value },
    Ne { left: Value, right: Value },
    CrossAbove { left: Value, right: Value },
    CrossBelow { left: Value, right: Value },
    Between { value: Value, lower: Value, upper: Value },
    NearPct { left: Value, right: Value, pct: f64 },
    NearAbs { left: Value, right: Value, abs: f64 },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
    HoldsFor { condition: Box<Condition>, bars: u32 },
    OccurredWithin { condition: Box<Condition>, bars: u32 },
}

/// What a triggered rule does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    EnterLong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size_usdt: Option<f64>,
    },
    EnterShort {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size_usdt: Option<f64>,
    },
    ClosePosition,
    CancelOrders,
    SetLeverage { leverage: f64 },
}

/// One named action rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub when: Condition,
    pub then: Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PositionMode {
    LongOnly,
    ShortOnly,
    #[default]
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExitMode {
    SlTpOnly,
    SignalOnly,
    #[default]
    SlTpAndSignal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionPolicy {
    #[serde(default)]
    pub mode: PositionMode,
    #[serde(default)]
    pub exit_mode: ExitMode,
    #[serde(default = "default_max_positions")]
    pub max_positions_per_symbol: u32,
}

fn default_max_positions() -> u32 {
    1
}

impl Default for PositionPolicy {
    fn default() -> Self {
        Self {
            mode: PositionMode::default(),
            exit_mode: ExitMode::default(),
            max_positions_per_symbol: default_max_positions(),
        }
    }
}

/// Risk settings: SL/TP percentages relative to the signal close, sizing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit_pct: Option<f64>,
    /// Fraction of equity committed per entry (leveraged), when
    /// `notional_usdt` is not set. Defaults to 1.0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notional_usdt: Option<f64>,
}

/// The Play document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Play {
    pub play_id: String,
    pub symbol: String,
    pub timeframes: Timeframes,
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub features: BTreeMap<TfRole, Vec<FeatureSpec>>,
    #[serde(default)]
    pub structures: BTreeMap<TfRole, Vec<DetectorSpec>>,
    #[serde(default)]
    pub actions: Vec<ActionRule>,
    #[serde(default)]
    pub position_policy: PositionPolicy,
    #[serde(default)]
    pub risk: RiskConfig,
}

impl Play {
    /// Structural validation surfaced before the first bar.
    pub fn validate(&self) -> Result<()> {
        if self.play_id.is_empty() {
            return Err(CoreError::Config("play_id must not be empty".into()));
        }
        if !self.symbol.ends_with("USDT") {
            return Err(CoreError::Config(format!(
                "Symbol '{}' is not USDT-quoted; this engine supports USDT linear perpetuals only\n\n\
                 Fix: symbol: BTCUSDT",
                self.symbol
            )));
        }
        timeframe_ms(&self.timeframes.exec)?;
        let mut seen_labels = vec![self.timeframes.exec.clone()];
        for (_, label) in self.timeframes.htf_roles() {
            timeframe_ms(label)?;
            if seen_labels.iter().any(|l| l == label) {
                return Err(CoreError::Config(format!(
                    "Timeframe label '{}' is declared for more than one role",
                    label
                )));
            }
            seen_labels.push(label.to_string());
        }
        if self.account.starting_equity <= 0.0 {
            return Err(CoreError::Config(
                "account.starting_equity must be > 0".into(),
            ));
        }
        if self.account.leverage < 1.0 {
            return Err(CoreError::Config("account.leverage must be >= 1".into()));
        }
        if self.position_policy.max_positions_per_symbol != 1 {
            return Err(CoreError::Config(
                "position_policy.max_positions_per_symbol: only 1 is supported".into(),
            ));
        }
        for (pct, name) in [
            (self.risk.stop_loss_pct, "risk.stop_loss_pct"),
            (self.risk.take_profit_pct, "risk.take_profit_pct"),
            (self.risk.size_pct, "risk.size_pct"),
        ] {
            if let Some(v) = pct {
                if v <= 0.0 {
                    return Err(CoreError::Config(format!("{} must be > 0", name)));
                }
            }
        }
        for (role, _) in self.structures.iter() {
            if self.timeframes.resolve(*role).is_none() {
                return Err(CoreError::Config(format!(
                    "structures declared for role '{:?}' but no timeframe is configured for it\n\n\
                     Fix: add the matching timeframes entry (e.g. high_tf: \"1h\")",
                    role
                )));
            }
        }
        for (role, _) in self.features.iter() {
            if self.timeframes.resolve(*role).is_none() {
                return Err(CoreError::Config(format!(
                    "features declared for role '{:?}' but no timeframe is configured for it",
                    role
                )));
            }
        }
        Ok(())
    }

    /// Exec-role structure specs (empty slice when none declared).
    pub fn exec_structures(&self) -> &[DetectorSpec] {
        self.structures
            .get(&TfRole::Exec)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Non-exec structure specs keyed by resolved TF label.
    pub fn htf_structures(&self) -> BTreeMap<String, Vec<DetectorSpec>> {
        let mut out = BTreeMap::new();
        for (role, specs) in &self.structures {
            if *role == TfRole::Exec {
                continue;
            }
            if let Some(label) = self.timeframes.resolve(*role) {
                out.entry(label.to_string())
                    .or_insert_with(Vec::new)
                    .extend(specs.iter().cloned());
            }
        }
        out
    }

    /// SHA-256 over the canonical (serde round-tripped) JSON form.
    ///
    /// Normalize -> hash -> normalize is idempotent because serialization
    /// order is fixed by the struct definitions and sorted maps.
    pub fn play_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }
}
