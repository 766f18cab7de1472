//! Play rule evaluator: compiled boolean condition trees over snapshots.
//!
//! Temporal operators (`cross_above`, `cross_below`, `holds_for`,
//! `occurred_within`) carry per-node state. Nodes are numbered by a single
//! pre-order walk at compile time; evaluation visits nodes in the same
//! pre-order every bar, so state slots stay aligned. For that reason `all`
//! and `any` evaluate all children eagerly; short-circuiting would both
//! misalign slots and freeze temporal counters.

use playlab_core::detectors::OutputValue;
use playlab_core::error::{CoreError, Result};
use playlab_core::play::{Action, ActionRule, Case, Condition, Value, ValueExpr};

use crate::snapshot::Snapshot;

/// An action whose rule condition evaluated true this bar.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggeredAction {
    pub rule_name: Option<String>,
    pub action: Action,
}

#[derive(Debug, Clone, Default)]
struct NodeState {
    /// Previous (left, right) pair for cross operators.
    prev: Option<(f64, f64)>,
    /// Consecutive-true run length for holds_for.
    run_length: u32,
    /// Bar index of the most recent true for occurred_within (-1 = never).
    last_true_bar: i64,
}

struct CompiledRule {
    name: Option<String>,
    when: Condition,
    then: Action,
    state: Vec<NodeState>,
}

/// Evaluates a Play's action rules each bar.
pub struct RuleEvaluator {
    rules: Vec<CompiledRule>,
}

impl RuleEvaluator {
    pub fn new(rules: &[ActionRule]) -> Self {
        let compiled = rules
            .iter()
            .map(|rule| {
                let mut count = 0usize;
                count_condition_state(&rule.when, &mut count);
                CompiledRule {
                    name: rule.name.clone(),
                    when: rule.when.clone(),
                    then: rule.then.clone(),
                    state: vec![
                        NodeState {
                            last_true_bar: -1,
                            ..NodeState::default()
                        };
                        count
                    ],
                }
            })
            .collect();
        Self { rules: compiled }
    }

    /// Evaluate every rule against the snapshot, in declaration order.
    pub fn evaluate(&mut self, snapshot: &Snapshot<'_>) -> Result<Vec<TriggeredAction>> {
        let mut triggered = Vec::new();
        for rule in &mut self.rules {
            let mut cursor = 0usize;
            let fired = eval_condition(&rule.when, snapshot, &mut rule.state, &mut cursor)?;
            if fired {
                triggered.push(TriggeredAction {
                    rule_name: rule.name.clone(),
                    action: rule.then.clone(),
                });
            }
        }
        Ok(triggered)
    }

    /// Drop all temporal state (new run).
    pub fn reset(&mut self) {
        for rule in &mut self.rules {
            for node in &mut rule.state {
                *node = NodeState {
                    last_true_bar: -1,
                    ..NodeState::default()
                };
            }
        }
    }
}

fn count_condition_state(cond: &Condition, count: &mut usize) {
    match cond {
        Condition::Gt { left, right }
        | Condition::Lt { left, right }
        | Condition::Ge { left, right }
        | Condition::Le { left, right }
        | Condition::Eq { left, right }
        | Condition::Ne { left, right }
        | Condition::NearPct { left, right, .. }
        | Condition::NearAbs { left, right, .. } => {
            count_value_state(left, count);
            count_value_state(right, count);
        }
        Condition::CrossAbove { left, right } | Condition::CrossBelow { left, right } => {
            *count += 1;
            count_value_state(left, count);
            count_value_state(right, count);
        }
        Condition::Between { value, lower, upper } => {
            count_value_state(value, count);
            count_value_state(lower, count);
            count_value_state(upper, count);
        }
        Condition::All { conditions } | Condition::Any { conditions } => {
            for c in conditions {
                count_condition_state(c, count);
            }
        }
        Condition::Not { condition } => count_condition_state(condition, count),
        Condition::HoldsFor { condition, .. } | Condition::OccurredWithin { condition, .. } => {
            *count += 1;
            count_condition_state(condition, count);
        }
    }
}

fn count_value_state(value: &Value, count: &mut usize) {
    if let Value::Expr { expr } = value {
        match expr.as_ref() {
            ValueExpr::Add { left, right }
            | ValueExpr::Sub { left, right }
            | ValueExpr::Mul { left, right }
            | ValueExpr::Div { left, right } => {
                count_value_state(left, count);
                count_value_state(right, count);
            }
            ValueExpr::CasesWhen { cases, default } => {
                for case in cases {
                    count_condition_state(&case.when, count);
                    count_value_state(&case.value, count);
                }
                count_value_state(default, count);
            }
        }
    }
}

/// Evaluated operand value.
#[derive(Debug, Clone, PartialEq)]
enum EvalVal {
    Num(f64),
    Text(String),
    Bool(bool),
}

impl EvalVal {
    fn from_output(value: OutputValue) -> EvalVal {
        match value {
            OutputValue::Float(v) => EvalVal::Num(v),
            OutputValue::Int(v) => EvalVal::Num(v as f64),
            OutputValue::Bool(v) => EvalVal::Bool(v),
            OutputValue::Text(v) => EvalVal::Text(v),
            OutputValue::None => EvalVal::Num(f64::NAN),
        }
    }

    fn as_num(&self) -> Result<f64> {
        match self {
            EvalVal::Num(v) => Ok(*v),
            other => Err(CoreError::Config(format!(
                "Expected a numeric operand, got {:?}",
                other
            ))),
        }
    }
}

fn eval_value(
    value: &Value,
    snapshot: &Snapshot<'_>,
    state: &mut [NodeState],
    cursor: &mut usize,
) -> Result<EvalVal> {
    match value {
        Value::Num(v) => Ok(EvalVal::Num(*v)),
        Value::Lit { text } => Ok(EvalVal::Text(text.clone())),
        Value::Ref { path } => Ok(EvalVal::from_output(snapshot.value(path)?)),
        Value::Expr { expr } => eval_value_expr(expr, snapshot, state, cursor),
    }
}

fn eval_value_expr(
    expr: &ValueExpr,
    snapshot: &Snapshot<'_>,
    state: &mut [NodeState],
    cursor: &mut usize,
) -> Result<EvalVal> {
    match expr {
        ValueExpr::Add { left, right } => {
            let l = eval_value(left, snapshot, state, cursor)?.as_num()?;
            let r = eval_value(right, snapshot, state, cursor)?.as_num()?;
            Ok(EvalVal::Num(l + r))
        }
        ValueExpr::Sub { left, right } => {
            let l = eval_value(left, snapshot, state, cursor)?.as_num()?;
            let r = eval_value(right, snapshot, state, cursor)?.as_num()?;
            Ok(EvalVal::Num(l - r))
        }
        ValueExpr::Mul { left, right } => {
            let l = eval_value(left, snapshot, state, cursor)?.as_num()?;
            let r = eval_value(right, snapshot, state, cursor)?.as_num()?;
            Ok(EvalVal::Num(l * r))
        }
        ValueExpr::Div { left, right } => {
            let l = eval_value(left, snapshot, state, cursor)?.as_num()?;
            let r = eval_value(right, snapshot, state, cursor)?.as_num()?;
            Ok(EvalVal::Num(l / r))
        }
        ValueExpr::CasesWhen { cases, default } => {
            // Evaluate every case eagerly to keep node slots aligned; the
            // first true case wins.
            let mut selected: Option<EvalVal> = None;
            for Case { when, value } in cases {
                let fired = eval_condition(when, snapshot, state, cursor)?;
                let candidate = eval_value(value, snapshot, state, cursor)?;
                if fired && selected.is_none() {
                    selected = Some(candidate);
                }
            }
            let fallback = eval_value(default, snapshot, state, cursor)?;
            Ok(selected.unwrap_or(fallback))
        }
    }
}

fn eval_condition(
    cond: &Condition,
    snapshot: &Snapshot<'_>,
    state: &mut [NodeState],
    cursor: &mut usize,
) -> Result<bool> {
    match cond {
        Condition::Gt { left, right } => {
            let l = eval_value(left, snapshot, state, cursor)?.as_num()?;
            let r = eval_value(right, snapshot, state, cursor)?.as_num()?;
            Ok(l > r)
        }
        Condition::Lt { left, right } => {
            let l = eval_value(left, snapshot, state, cursor)?.as_num()?;
            let r = eval_value(right, snapshot, state, cursor)?.as_num()?;
            Ok(l < r)
        }
        Condition::Ge { left, right } => {
            let l = eval_value(left, snapshot, state, cursor)?.as_num()?;
            let r = eval_value(right, snapshot, state, cursor)?.as_num()?;
            Ok(l >= r)
        }
        Condition::Le { left, right } => {
            let l = eval_value(left, snapshot, state, cursor)?.as_num()?;
            let r = eval_value(right, snapshot, state, cursor)?.as_num()?;
            Ok(l <= r)
        }
        Condition::Eq { left, right } => {
            let l = eval_value(left, snapshot, state, cursor)?;
            let r = eval_value(right, snapshot, state, cursor)?;
            Ok(eval_eq(&l, &r))
        }
        Condition::Ne { left, right } => {
            let l = eval_value(left, snapshot, state, cursor)?;
            let r = eval_value(right, snapshot, state, cursor)?;
            Ok(!eval_eq(&l, &r))
        }
        Condition::CrossAbove { left, right } => {
            let slot = *cursor;
            *cursor += 1;
            let l = eval_value(left, snapshot, state, cursor)?.as_num()?;
            let r = eval_value(right, snapshot, state, cursor)?.as_num()?;
            let crossed = match state[slot].prev {
                Some((pl, pr)) => pl <= pr && l > r,
                None => false,
            };
            state[slot].prev = Some((l, r));
            Ok(crossed)
        }
        Condition::CrossBelow { left, right } => {
            let slot = *cursor;
            *cursor += 1;
            let l = eval_value(left, snapshot, state, cursor)?.as_num()?;
            let r = eval_value(right, snapshot, state, cursor)?.as_num()?;
            let crossed = match state[slot].prev {
                Some((pl, pr)) => pl >= pr && l < r,
                None => false,
            };
            state[slot].prev = Some((l, r));
            Ok(crossed)
        }
        Condition::Between { value, lower, upper } => {
            let v = eval_value(value, snapshot, state, cursor)?.as_num()?;
            let lo = eval_value(lower, snapshot, state, cursor)?.as_num()?;
            let hi = eval_value(upper, snapshot, state, cursor)?.as_num()?;
            Ok(lo <= v && v <= hi)
        }
        Condition::NearPct { left, right, pct } => {
            let l = eval_value(left, snapshot, state, cursor)?.as_num()?;
            let r = eval_value(right, snapshot, state, cursor)?.as_num()?;
            Ok((l - r).abs() <= r.abs() * pct)
        }
        Condition::NearAbs { left, right, abs } => {
            let l = eval_value(left, snapshot, state, cursor)?.as_num()?;
            let r = eval_value(right, snapshot, state, cursor)?.as_num()?;
            Ok((l - r).abs() <= *abs)
        }
        Condition::All { conditions } => {
            let mut result = true;
            for c in conditions {
                result &= eval_condition(c, snapshot, state, cursor)?;
            }
            Ok(result)
        }
        Condition::Any { conditions } => {
            let mut result = false;
            for c in conditions {
                result |= eval_condition(c, snapshot, state, cursor)?;
            }
            Ok(result)
        }
        Condition::Not { condition } => Ok(!eval_condition(condition, snapshot, state, cursor)?),
        Condition::HoldsFor { condition, bars } => {
            let slot = *cursor;
            *cursor += 1;
            let inner = eval_condition(condition, snapshot, state, cursor)?;
            state[slot].run_length = if inner {
                state[slot].run_length + 1
            } else {
                0
            };
            Ok(state[slot].run_length >= *bars)
        }
        Condition::OccurredWithin { condition, bars } => {
            let slot = *cursor;
            *cursor += 1;
            let inner = eval_condition(condition, snapshot, state, cursor)?;
            if inner {
                state[slot].last_true_bar = snapshot.bar_idx;
            }
            let last = state[slot].last_true_bar;
            Ok(last >= 0 && snapshot.bar_idx - last <= *bars as i64)
        }
    }
}

fn eval_eq(l: &EvalVal, r: &EvalVal) -> bool {
    match (l, r) {
        (EvalVal::Num(a), EvalVal::Num(b)) => a == b,
        (EvalVal::Text(a), EvalVal::Text(b)) => a == b,
        (EvalVal::Bool(a), EvalVal::Bool(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playlab_core::bar::{Bar, BarData};
    use playlab_core::detectors::{DetectorSpec, ParamValue};
    use playlab_core::rationalize::StateRationalizer;
    use playlab_core::registry::Registry;
    use playlab_core::sim::types::{ExchangeStateView, LedgerState};
    use playlab_core::state::MultiTfState;
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::BTreeMap;

    fn exchange_view() -> ExchangeStateView {
        ExchangeStateView {
            symbol: "BTCUSDT".to_string(),
            ledger: LedgerState {
                cash_balance_usdt: 10_000.0,
                unrealized_pnl_usdt: 0.0,
                equity_usdt: 10_000.0,
                used_margin_usdt: 0.0,
                free_margin_usdt: 10_000.0,
                available_balance_usdt: 10_000.0,
                maintenance_margin_usdt: 0.0,
                total_fees_paid: 0.0,
            },
            position: None,
            pending_order_count: 0,
            entries_disabled: false,
            entries_disabled_reason: None,
            entry_attempts_count: 0,
            entry_rejections_count: 0,
            last_rejection_code: None,
            leverage: 1.0,
            is_liquidatable: false,
        }
    }

    /// Drives an evaluator over a close-price series, exposing the close as
    /// both the bar close and `features.exec.x`.
    fn run_over_closes(
        evaluator: &mut RuleEvaluator,
        closes: &[f64],
    ) -> Vec<Vec<TriggeredAction>> {
        let registry = Registry::builtin();
        let specs = vec![DetectorSpec::new("swing", "swing")
            .with_param("left", ParamValue::Int(1))
            .with_param("right", ParamValue::Int(1))];
        let mut structures =
            MultiTfState::new("15m", &specs, &BTreeMap::new(), &registry).unwrap();
        let mut rationalizer = StateRationalizer::default();
        let exchange = exchange_view();
        let base = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        let mut out = Vec::new();
        for (i, &close) in closes.iter().enumerate() {
            let bar = Bar::new(
                "BTCUSDT",
                "15m",
                base + Duration::minutes(15 * i as i64),
                base + Duration::minutes(15 * (i as i64 + 1)),
                close,
                close + 1.0,
                close - 1.0,
                close,
                10.0,
            );
            let bar_data = BarData::new(i as i64, close, close + 1.0, close - 1.0, close, 10.0);
            structures.update_exec(&bar_data).unwrap();
            let rationalized = rationalizer.rationalize(i as i64, &structures);

            let mut features = BTreeMap::new();
            features.insert("exec.x".to_string(), close);

            let snapshot = Snapshot {
                ts_close: bar.ts_close,
                bar_idx: i as i64,
                mark_price: close,
                mark_price_source: "close",
                bar: &bar,
                features: &features,
                structures: &structures,
                rationalized: &rationalized,
                exchange: &exchange,
                ready: true,
            };
            out.push(evaluator.evaluate(&snapshot).unwrap());
        }
        out
    }

    fn rule(when: Condition) -> ActionRule {
        ActionRule {
            name: Some("r".to_string()),
            when,
            then: Action::EnterLong { size_usdt: None },
        }
    }

    #[test]
    fn test_gt_simple() {
        let mut evaluator = RuleEvaluator::new(&[rule(Condition::Gt {
            left: Value::Ref {
                path: "close".to_string(),
            },
            right: Value::Num(100.0),
        })]);
        let fired = run_over_closes(&mut evaluator, &[99.0, 101.0]);
        assert!(fired[0].is_empty());
        assert_eq!(fired[1].len(), 1);
    }

    #[test]
    fn test_cross_above_fires_once_per_cross() {
        let mut evaluator = RuleEvaluator::new(&[rule(Condition::CrossAbove {
            left: Value::Ref {
                path: "close".to_string(),
            },
            right: Value::Num(100.0),
        })]);
        // Below, below, cross, stay above, dip below, cross again.
        let fired = run_over_closes(&mut evaluator, &[98.0, 99.0, 101.0, 102.0, 99.5, 100.5]);
        let counts: Vec<usize> = fired.iter().map(|f| f.len()).collect();
        assert_eq!(counts, vec![0, 0, 1, 0, 0, 1]);
    }

    #[test]
    fn test_cross_below() {
        let mut evaluator = RuleEvaluator::new(&[rule(Condition::CrossBelow {
            left: Value::Ref {
                path: "close".to_string(),
            },
            right: Value::Num(100.0),
        })]);
        let fired = run_over_closes(&mut evaluator, &[101.0, 99.0, 98.0]);
        let counts: Vec<usize> = fired.iter().map(|f| f.len()).collect();
        assert_eq!(counts, vec![0, 1, 0]);
    }

    #[test]
    fn test_holds_for_requires_run() {
        let mut evaluator = RuleEvaluator::new(&[rule(Condition::HoldsFor {
            condition: Box::new(Condition::Gt {
                left: Value::Ref {
                    path: "close".to_string(),
                },
                right: Value::Num(100.0),
            }),
            bars: 3,
        })]);
        let fired = run_over_closes(
            &mut evaluator,
            &[101.0, 102.0, 99.0, 101.0, 102.0, 103.0, 104.0],
        );
        let counts: Vec<usize> = fired.iter().map(|f| f.len()).collect();
        // Run resets at bar 2; satisfied from bar 5 on.
        assert_eq!(counts, vec![0, 0, 0, 0, 0, 1, 1]);
    }

    #[test]
    fn test_occurred_within_window_expires() {
        let mut evaluator = RuleEvaluator::new(&[rule(Condition::OccurredWithin {
            condition: Box::new(Condition::Gt {
                left: Value::Ref {
                    path: "close".to_string(),
                },
                right: Value::Num(100.0),
            }),
            bars: 2,
        })]);
        let fired = run_over_closes(&mut evaluator, &[101.0, 99.0, 99.0, 99.0, 99.0]);
        let counts: Vec<usize> = fired.iter().map(|f| f.len()).collect();
        // True at bar 0, remembered through bar 2, expired at bar 3.
        assert_eq!(counts, vec![1, 1, 1, 0, 0]);
    }

    #[test]
    fn test_between_and_near() {
        let mut evaluator = RuleEvaluator::new(&[
        rule(Condition::Between {
            value: Value::Ref {
                path: "close".to_string(),
            },
            lower: Value::Num(99.0),
            upper: Value::Num(101.0),
        })]);
        let fired = run_over_closes(&mut evaluator, &[98.0, 100.0, 102.0]);
        let counts: Vec<usize> = fired.iter().map(|f| f.len()).collect();
        assert_eq!(counts, vec![0, 1, 0]);

        let mut evaluator = RuleEvaluator::new(&[rule(Condition::NearPct {
            left: Value::Ref {
                path: "close".to_string(),
            },
            right: Value::Num(100.0),
            pct: 0.01,
        })]);
        let fired = run_over_closes(&mut evaluator, &[100.5, 102.0]);
        let counts: Vec<usize> = fired.iter().map(|f| f.len()).collect();
        assert_eq!(counts, vec![1, 0]);
    }

    #[test]
    fn test_arithmetic_and_cases_when() {
        // close > x * 1.01 where x is the same close: never true.
        let mut evaluator = RuleEvaluator::new(&[rule(Condition::Gt {
            left: Value::Ref {
                path: "close".to_string(),
            },
            right: Value::Expr {
                expr: Box::new(ValueExpr::Mul {
                    left: Value::Ref {
                        path: "features.exec.x".to_string(),
                    },
                    right: Value::Num(1.01),
                }),
            },
        })]);
        let fired = run_over_closes(&mut evaluator, &[100.0, 105.0]);
        assert!(fired.iter().all(|f| f.is_empty()));

        // cases_when selects a threshold based on a condition.
        let mut evaluator = RuleEvaluator::new(&[rule(Condition::Gt {
            left: Value::Ref {
                path: "close".to_string(),
            },
            right: Value::Expr {
                expr: Box::new(ValueExpr::CasesWhen {
                    cases: vec![Case {
                        when: Condition::Gt {
                            left: Value::Ref {
                                path: "close".to_string(),
                            },
                            right: Value::Num(100.0),
                        },
                        value: Value::Num(104.0),
                    }],
                    default: Value::Num(98.0),
                }),
            },
        })]);
        // close 99: default threshold 98 -> fires. close 103: threshold 104 -> no.
        let fired = run_over_closes(&mut evaluator, &[99.0, 103.0, 105.0]);
        let counts: Vec<usize> = fired.iter().map(|f| f.len()).collect();
        assert_eq!(counts, vec![1, 0, 1]);
    }

    #[test]
    fn test_eq_on_detector_text_output() {
        let mut evaluator = RuleEvaluator::new(&[rule(Condition::Eq {
            left: Value::Ref {
                path: "exec.swing.last_confirmed_pivot_type".to_string(),
            },
            right: Value::Lit {
                text: "high".to_string(),
            },
        })]);
        // swing(1,1): high pivot at bar 1 confirmed at bar 2.
        let fired = run_over_closes(&mut evaluator, &[100.0, 105.0, 101.0]);
        let counts: Vec<usize> = fired.iter().map(|f| f.len()).collect();
        assert_eq!(counts, vec![0, 0, 1]);
    }

    #[test]
    fn test_all_any_not_eager() {
        let cond = Condition::All {
            conditions: vec![
                Condition::Gt {
                    left: Value::Ref {
                        path: "close".to_string(),
                    },
                    right: Value::Num(100.0),
                },
                Condition::Not {
                    condition: Box::new(Condition::Any {
                        conditions: vec![Condition::Lt {
                            left: Value::Ref {
                                path: "close".to_string(),
                            },
                            right: Value::Num(90.0),
                        }],
                    }),
                },
            ],
        };
        let mut evaluator = RuleEvaluator::new(&[rule(cond)]);
        let fired = run_over_closes(&mut evaluator, &[101.0, 89.0]);
        let counts: Vec<usize> = fired.iter().map(|f| f.len()).collect();
        assert_eq!(counts, vec![1, 0]);
    }

    #[test]
    fn test_unknown_path_is_loud() {
        let mut evaluator = RuleEvaluator::new(&[rule(Condition::Gt {
            left: Value::Ref {
                path: "exec.missing.value".to_string(),
            },
            right: Value::Num(0.0),
        })]);
        let registry = Registry::builtin();
        let structures =
            MultiTfState::new("15m", &[], &BTreeMap::new(), &registry).unwrap();
        let mut rationalizer = StateRationalizer::default();
        // One synthetic snapshot is enough to observe the error.
        let base = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let bar = Bar::new("BTCUSDT", "15m", base, base + Duration::minutes(15), 100.0, 101.0, 99.0, 100.0, 1.0);
        let rationalized = rationalizer.rationalize(0, &structures);
        let features = BTreeMap::new();
        let exchange = exchange_view();
        let snapshot = Snapshot {
            ts_close: bar.ts_close,
            bar_idx: 0,
            mark_price: 100.0,
            mark_price_source: "close",
            bar: &bar,
            features: &features,
            structures: &structures,
            rationalized: &rationalized,
            exchange: &exchange,
            ready: true,
        };
        assert!(evaluator.evaluate(&snapshot).is_err());
    }
}
