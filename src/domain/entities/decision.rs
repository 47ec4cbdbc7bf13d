use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::entities::account_mode::AccountMode;
use crate::domain::entities::trade_request::TradeStatus;
use crate::domain::repositories::oracles::Forecast;

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    FetchData,
    Forecast,
    TrustEvaluation,
    SafetyGate,
    Reasoning,
    Audit,
    Handoff,
}

impl Stage {
    pub fn number(&self) -> u8 {
        match self {
            Stage::FetchData => 1,
            Stage::Forecast => 2,
            Stage::TrustEvaluation => 3,
            Stage::SafetyGate => 4,
            Stage::Reasoning => 5,
            Stage::Audit => 6,
            Stage::Handoff => 7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::FetchData => "fetch_data",
            Stage::Forecast => "forecast",
            Stage::TrustEvaluation => "trust_evaluation",
            Stage::SafetyGate => "safety_gate",
            Stage::Reasoning => "reasoning",
            Stage::Audit => "audit",
            Stage::Handoff => "handoff",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReasoningDecision {
    Approve,
    Reject,
    Wait,
}

impl ReasoningDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningDecision::Approve => "APPROVE",
            ReasoningDecision::Reject => "REJECT",
            ReasoningDecision::Wait => "WAIT",
        }
    }
}

impl std::fmt::Display for ReasoningDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ReasoningDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "APPROVE" | "APPROVED" => Ok(ReasoningDecision::Approve),
            "REJECT" | "REJECTED" => Ok(ReasoningDecision::Reject),
            "WAIT" | "HOLD" => Ok(ReasoningDecision::Wait),
            other => Err(format!("Unknown reasoning decision: {}", other)),
        }
    }
}

/// What happened to one symbol in one pipeline pass
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// Early exit at a stage, this symbol only
    Aborted { stage: Stage, reason: String },
    /// Reasoning oracle did not produce an actionable approval
    Declined {
        decision: ReasoningDecision,
        confidence: f64,
        reason: String,
    },
    /// Confirmation requested, waiting for a human
    AwaitingApproval { trade_id: String },
    /// Sent straight to the gateway
    Executed { trade_id: String, status: TradeStatus },
    HandoffFailed { reason: String },
    /// Safety gate raised HALT_TRADING
    Halted { reason: String },
}

impl DecisionOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            DecisionOutcome::Aborted { .. } => "aborted",
            DecisionOutcome::Declined { .. } => "declined",
            DecisionOutcome::AwaitingApproval { .. } => "awaiting_approval",
            DecisionOutcome::Executed { .. } => "executed",
            DecisionOutcome::HandoffFailed { .. } => "handoff_failed",
            DecisionOutcome::Halted { .. } => "halted",
        }
    }

    pub fn trade_id(&self) -> Option<&str> {
        match self {
            DecisionOutcome::AwaitingApproval { trade_id }
            | DecisionOutcome::Executed { trade_id, .. } => Some(trade_id),
            _ => None,
        }
    }

    pub fn is_halt(&self) -> bool {
        matches!(self, DecisionOutcome::Halted { .. })
    }
}

/// Result of `PipelineCoordinator::process`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub symbol: String,
    pub account_mode: AccountMode,
    pub outcome: DecisionOutcome,
    pub audit_id: Option<i64>,
    pub decided_at: DateTime<Utc>,
}

/// One audit row per processed symbol
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionAudit {
    pub symbol: String,
    pub account_mode: AccountMode,
    pub outcome_kind: String,
    pub stage_reached: Stage,
    pub reason: Option<String>,
    pub forecast: Option<Forecast>,
    pub reasoning_decision: Option<ReasoningDecision>,
    pub confidence: Option<f64>,
    pub rationale: Option<String>,
    pub safety_issues: Vec<String>,
    pub trade_id: Option<String>,
    pub decided_at: DateTime<Utc>,
}

impl DecisionAudit {
    pub fn new(symbol: &str, account_mode: AccountMode, decided_at: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            account_mode,
            outcome_kind: String::new(),
            stage_reached: Stage::FetchData,
            reason: None,
            forecast: None,
            reasoning_decision: None,
            confidence: None,
            rationale: None,
            safety_issues: Vec::new(),
            trade_id: None,
            decided_at,
        }
    }

    pub fn apply_outcome(&mut self, outcome: &DecisionOutcome) {
        self.outcome_kind = outcome.kind().to_string();
        match outcome {
            DecisionOutcome::Aborted { stage, reason } => {
                self.stage_reached = *stage;
                self.reason = Some(reason.clone());
            }
            DecisionOutcome::Declined { reason, .. } => {
                self.stage_reached = Stage::Reasoning;
                self.reason = Some(reason.clone());
            }
            DecisionOutcome::Halted { reason } => {
                self.stage_reached = Stage::SafetyGate;
                self.reason = Some(reason.clone());
            }
            DecisionOutcome::HandoffFailed { reason } => {
                self.stage_reached = Stage::Handoff;
                self.reason = Some(reason.clone());
            }
            DecisionOutcome::AwaitingApproval { trade_id }
            | DecisionOutcome::Executed { trade_id, .. } => {
                self.stage_reached = Stage::Handoff;
                self.trade_id = Some(trade_id.clone());
            }
        }
    }
}
