//! Condition gating for tasks and steps.
//!
//! Every check returns a [`ConditionCheck`] with a human-readable reason;
//! evaluation never fails with an error.

use chrono::{Datelike, Local, NaiveDateTime, NaiveTime, Weekday};
use larkbot_core::types::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::expression::ExpressionEngine;

/// A gate evaluated before a task runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Local time within `[start, end]` (`HH:MM` or `HH:MM:SS`).
    TimeRange {
        #[serde(default)]
        start: Option<String>,
        #[serde(default)]
        end: Option<String>,
    },
    /// Current weekday, short (`mon`) or full (`monday`) name.
    DayOfWeek {
        #[serde(default)]
        days: Vec<String>,
    },
    /// `context["environment"]` must equal this name.
    Environment {
        #[serde(default)]
        environment: Option<String>,
    },
    /// Boolean expression over `context`.
    Custom { expression: String },
}

/// Outcome of a condition check.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionCheck {
    pub passed: bool,
    pub reason: String,
}

impl ConditionCheck {
    pub fn pass(reason: impl Into<String>) -> Self {
        Self { passed: true, reason: reason.into() }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self { passed: false, reason: reason.into() }
    }
}

/// Evaluates [`Condition`]s against a context.
#[derive(Clone)]
pub struct ConditionEvaluator {
    expressions: Arc<ExpressionEngine>,
}

impl ConditionEvaluator {
    pub fn new(expressions: Arc<ExpressionEngine>) -> Self {
        Self { expressions }
    }

    pub fn evaluate(&self, condition: &Condition, context: &Context) -> ConditionCheck {
        self.evaluate_at(condition, context, Local::now().naive_local())
    }

    /// Evaluate against a fixed local time.
    pub fn evaluate_at(&self, condition: &Condition, context: &Context, now: NaiveDateTime) -> ConditionCheck {
        match condition {
            Condition::TimeRange { start, end } => check_time_range(start.as_deref(), end.as_deref(), now.time()),
            Condition::DayOfWeek { days } => check_day_of_week(days, now.weekday()),
            Condition::Environment { environment } => check_environment(environment.as_deref(), context),
            Condition::Custom { expression } => match self.expressions.evaluate_bool(expression, context) {
                Ok(true) => ConditionCheck::pass(format!("Custom condition passed: {expression}")),
                Ok(false) => ConditionCheck::fail(format!("Custom condition failed: {expression}")),
                Err(e) => ConditionCheck::fail(format!("Custom condition error: {e}")),
            },
        }
    }

    /// All conditions must pass; stops at the first failure and returns its reason.
    pub fn evaluate_all(&self, conditions: &[Condition], context: &Context) -> ConditionCheck {
        self.evaluate_all_at(conditions, context, Local::now().naive_local())
    }

    pub fn evaluate_all_at(&self, conditions: &[Condition], context: &Context, now: NaiveDateTime) -> ConditionCheck {
        for condition in conditions {
            let check = self.evaluate_at(condition, context, now);
            if !check.passed {
                return check;
            }
        }
        ConditionCheck::pass("All conditions met")
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new(Arc::new(ExpressionEngine::new()))
    }
}

fn parse_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .ok()
}

fn check_time_range(start: Option<&str>, end: Option<&str>, now: NaiveTime) -> ConditionCheck {
    let (Some(start_raw), Some(end_raw)) = (start, end) else {
        return ConditionCheck::pass("No time range configured");
    };
    let (Some(start), Some(end)) = (parse_time(start_raw), parse_time(end_raw)) else {
        return ConditionCheck::fail(format!("Invalid time range {start_raw}-{end_raw}"));
    };
    // inclusive; an inverted range never matches
    if start <= now && now <= end {
        ConditionCheck::pass(format!("Current time {} within {start_raw}-{end_raw}", now.format("%H:%M")))
    } else {
        ConditionCheck::fail(format!("Current time {} not in range {start_raw}-{end_raw}", now.format("%H:%M")))
    }
}

fn weekday_names(day: Weekday) -> (&'static str, &'static str) {
    match day {
        Weekday::Mon => ("mon", "monday"),
        Weekday::Tue => ("tue", "tuesday"),
        Weekday::Wed => ("wed", "wednesday"),
        Weekday::Thu => ("thu", "thursday"),
        Weekday::Fri => ("fri", "friday"),
        Weekday::Sat => ("sat", "saturday"),
        Weekday::Sun => ("sun", "sunday"),
    }
}

fn check_day_of_week(days: &[String], today: Weekday) -> ConditionCheck {
    if days.is_empty() {
        return ConditionCheck::pass("No day restriction");
    }
    let (short, full) = weekday_names(today);
    let allowed = days.iter().any(|d| {
        let d = d.trim().to_lowercase();
        d == short || d == full
    });
    if allowed {
        ConditionCheck::pass(format!("Today ({full}) is allowed"))
    } else {
        ConditionCheck::fail(format!("Today ({full}) not in {}", days.join(", ")))
    }
}

fn check_environment(expected: Option<&str>, context: &Context) -> ConditionCheck {
    let Some(expected) = expected else {
        return ConditionCheck::pass("No environment restriction");
    };
    match context.get("environment") {
        Some(Value::String(current)) if current == expected => {
            ConditionCheck::pass(format!("Environment is {expected}"))
        }
        Some(other) => ConditionCheck::fail(format!(
            "Environment {} does not match {expected}",
            crate::template::display_value(other)
        )),
        None => ConditionCheck::fail(format!("Environment not set, expected {expected}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        // 2024-01-01 is a Monday
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    fn range(start: &str, end: &str) -> Condition {
        Condition::TimeRange { start: Some(start.into()), end: Some(end.into()) }
    }

    #[test]
    fn test_time_range_inclusive() {
        let eval = ConditionEvaluator::default();
        let ctx = Context::new();
        assert!(eval.evaluate_at(&range("09:00", "18:00"), &ctx, at(9, 0)).passed);
        assert!(eval.evaluate_at(&range("09:00", "18:00"), &ctx, at(18, 0)).passed);
        let check = eval.evaluate_at(&range("09:00", "18:00"), &ctx, at(20, 15));
        assert!(!check.passed);
        assert!(check.reason.contains("20:15"));
    }

    #[test]
    fn test_time_range_missing_bound_passes() {
        let eval = ConditionEvaluator::default();
        let cond = Condition::TimeRange { start: Some("09:00".into()), end: None };
        assert!(eval.evaluate_at(&cond, &Context::new(), at(3, 0)).passed);
    }

    #[test]
    fn test_inverted_time_range_never_matches() {
        let eval = ConditionEvaluator::default();
        let ctx = Context::new();
        let check = eval.evaluate_at(&range("22:00", "02:00"), &ctx, at(23, 30));
        assert!(!check.passed);
        assert!(check.reason.contains("not in range"));
        assert!(!eval.evaluate_at(&range("22:00", "02:00"), &ctx, at(1, 0)).passed);
        assert!(!eval.evaluate_at(&range("22:00", "02:00"), &ctx, at(12, 0)).passed);
    }

    #[test]
    fn test_day_of_week() {
        let eval = ConditionEvaluator::default();
        let ctx = Context::new();
        let short = Condition::DayOfWeek { days: vec!["mon".into(), "wed".into()] };
        let full = Condition::DayOfWeek { days: vec!["Monday".into()] };
        let weekend = Condition::DayOfWeek { days: vec!["sat".into(), "sunday".into()] };
        let empty = Condition::DayOfWeek { days: vec![] };
        assert!(eval.evaluate_at(&short, &ctx, at(10, 0)).passed);
        assert!(eval.evaluate_at(&full, &ctx, at(10, 0)).passed);
        assert!(!eval.evaluate_at(&weekend, &ctx, at(10, 0)).passed);
        assert!(eval.evaluate_at(&empty, &ctx, at(10, 0)).passed);
    }

    #[test]
    fn test_environment() {
        let eval = ConditionEvaluator::default();
        let prod = json!({"environment": "prod"}).as_object().cloned().unwrap();
        let cond = Condition::Environment { environment: Some("prod".into()) };
        assert!(eval.evaluate(&cond, &prod).passed);
        assert!(!eval.evaluate(&cond, &Context::new()).passed);
        assert!(eval.evaluate(&Condition::Environment { environment: None }, &Context::new()).passed);
    }

    #[test]
    fn test_custom_error_is_a_failed_check() {
        let eval = ConditionEvaluator::default();
        let cond = Condition::Custom { expression: "context.count >".into() };
        let check = eval.evaluate(&cond, &Context::new());
        assert!(!check.passed);
        assert!(check.reason.contains("error"));
    }

    #[test]
    fn test_evaluate_all_short_circuits() {
        let eval = ConditionEvaluator::default();
        let ctx = json!({"n": 1}).as_object().cloned().unwrap();
        let conditions = vec![
            Condition::Custom { expression: "context.n == 1".into() },
            Condition::Custom { expression: "context.n == 2".into() },
            Condition::Custom { expression: "this is not rhai (".into() },
        ];
        let check = eval.evaluate_all(&conditions, &ctx);
        assert!(!check.passed);
        assert_eq!(check.reason, "Custom condition failed: context.n == 2");
        assert!(eval.evaluate_all(&[], &ctx).passed);
    }

    #[test]
    fn test_condition_from_toml() {
        let cond: Condition = toml::from_str("type = \"day_of_week\"\ndays = [\"fri\"]").unwrap();
        assert_eq!(cond, Condition::DayOfWeek { days: vec!["fri".into()] });
    }
}
