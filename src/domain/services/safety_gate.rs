use serde::{Deserialize, Serialize};

/// Risk thresholds for admission control
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyThresholds {
    /// Drift at or above this halts all trading
    pub drift_halt_threshold: f64,
    /// Realized volatility at or above this flattens positions
    pub volatility_flat_threshold: f64,
    /// Coherence at or below this stops new trades
    pub coherence_break_threshold: f64,
    /// Either reliability input below this waits for confirmation
    pub min_reliability: f64,
}

impl Default for SafetyThresholds {
    fn default() -> Self {
        Self {
            drift_halt_threshold: 0.5,
            volatility_flat_threshold: 0.05,
            coherence_break_threshold: 0.3,
            min_reliability: 0.5,
        }
    }
}

/// Risk-signal bundle for one candidate trade
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RiskSignals {
    pub drift_score: f64,
    pub volatility: f64,
    pub coherence_score: f64,
    pub model_reliability: f64,
    pub trust_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyIssue {
    DriftSpike,
    HighVolatility,
    CoherenceBreak,
    LowConfidence,
}

impl SafetyIssue {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyIssue::DriftSpike => "DRIFT_SPIKE",
            SafetyIssue::HighVolatility => "HIGH_VOLATILITY",
            SafetyIssue::CoherenceBreak => "COHERENCE_BREAK",
            SafetyIssue::LowConfidence => "LOW_CONFIDENCE",
        }
    }

    /// Action the issue demands when it is the highest priority one
    pub fn action(&self) -> BlockingAction {
        match self {
            SafetyIssue::DriftSpike => BlockingAction::HaltTrading,
            SafetyIssue::HighVolatility => BlockingAction::FlattenPositions,
            SafetyIssue::CoherenceBreak => BlockingAction::StopNewTrades,
            SafetyIssue::LowConfidence => BlockingAction::WaitForConfirmation,
        }
    }
}

impl std::fmt::Display for SafetyIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockingAction {
    Proceed,
    HaltTrading,
    FlattenPositions,
    StopNewTrades,
    WaitForConfirmation,
}

impl BlockingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockingAction::Proceed => "PROCEED",
            BlockingAction::HaltTrading => "HALT_TRADING",
            BlockingAction::FlattenPositions => "FLATTEN_POSITIONS",
            BlockingAction::StopNewTrades => "STOP_NEW_TRADES",
            BlockingAction::WaitForConfirmation => "WAIT_FOR_CONFIRMATION",
        }
    }
}

impl std::fmt::Display for BlockingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyEvaluation {
    pub all_clear: bool,
    pub issues: Vec<SafetyIssue>,
    pub blocking_action: BlockingAction,
}

impl SafetyEvaluation {
    pub fn reason(&self) -> String {
        if self.all_clear {
            return BlockingAction::Proceed.to_string();
        }
        let issues: Vec<&str> = self.issues.iter().map(|i| i.as_str()).collect();
        format!("{} ({})", self.blocking_action, issues.join(", "))
    }
}

/// Admission control over a risk-signal bundle.
///
/// Checks run in fixed priority. Every failing check is reported, the first
/// one decides the blocking action. NaN or infinite inputs fail their check.
#[derive(Debug, Clone, Default)]
pub struct SafetyGate {
    thresholds: SafetyThresholds,
}

impl SafetyGate {
    pub fn new(thresholds: SafetyThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &SafetyThresholds {
        &self.thresholds
    }

    pub fn evaluate(&self, signals: &RiskSignals) -> SafetyEvaluation {
        let t = &self.thresholds;
        let mut issues = Vec::new();

        if !signals.drift_score.is_finite() || signals.drift_score >= t.drift_halt_threshold {
            issues.push(SafetyIssue::DriftSpike);
        }

        if !signals.volatility.is_finite() || signals.volatility >= t.volatility_flat_threshold {
            issues.push(SafetyIssue::HighVolatility);
        }

        if !signals.coherence_score.is_finite()
            || signals.coherence_score <= t.coherence_break_threshold
        {
            issues.push(SafetyIssue::CoherenceBreak);
        }

        let unreliable = |x: f64| !x.is_finite() || x < t.min_reliability;
        if unreliable(signals.model_reliability) || unreliable(signals.trust_score) {
            issues.push(SafetyIssue::LowConfidence);
        }

        let blocking_action = issues
            .first()
            .map(|issue| issue.action())
            .unwrap_or(BlockingAction::Proceed);

        SafetyEvaluation {
            all_clear: issues.is_empty(),
            issues,
            blocking_action,
        }
    }
}
