//! Per-symbol decision pipeline.
//!
//! fetch data -> forecast -> trust -> safety gate -> reasoning -> audit ->
//! hand-off. Every stage can abort the current symbol; only a HALT_TRADING
//! verdict from the safety gate stops the whole run, and it stays latched
//! until `reset_halt` is called.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::domain::entities::account_mode::AccountMode;
use crate::domain::entities::decision::{
    Decision, DecisionAudit, DecisionOutcome, ReasoningDecision, Stage,
};
use crate::domain::entities::trade_request::{OrderType, TradeAction, TradeDetails, TradeStatus};
use crate::domain::errors::{ErrorKind, PipelineError};
use crate::domain::repositories::oracles::{
    ForecastOracle, MarketDataSource, ReasoningContext, ReasoningOracle, TrustOracle,
};
use crate::domain::repositories::trade_store::DecisionLog;
use crate::domain::services::safety_gate::{BlockingAction, RiskSignals, SafetyGate};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub account_mode: AccountMode,
    /// Bars requested from the market data source
    pub lookback: usize,
    /// Fewer bars than this aborts the symbol
    pub min_history_points: usize,
    pub forecast_horizon: usize,
    /// Reasoning confidence must be strictly above this
    pub actionability_threshold: f64,
    pub order_quantity: f64,
    pub order_type: OrderType,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            account_mode: AccountMode::Paper,
            lookback: 120,
            min_history_points: 30,
            forecast_horizon: 5,
            actionability_threshold: 0.6,
            order_quantity: 1.0,
            order_type: OrderType::Market,
        }
    }
}

/// Where an approved candidate went
#[derive(Debug, Clone, PartialEq)]
pub enum HandoffReceipt {
    AwaitingApproval { trade_id: String },
    Executed { trade_id: String, status: TradeStatus },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct HandoffError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Stage 7 seam: routes an approved candidate to execution or confirmation
#[async_trait]
pub trait TradeHandoff: Send + Sync {
    async fn hand_off(&self, details: TradeDetails) -> Result<HandoffReceipt, HandoffError>;
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub decisions: Vec<Decision>,
    pub halted: bool,
    pub halt_reason: Option<String>,
    /// Symbols never reached because of a halt
    pub skipped: Vec<String>,
    /// Symbols that failed on storage errors
    pub errors: Vec<(String, String)>,
}

impl RunSummary {
    pub fn count(&self, kind: &str) -> usize {
        self.decisions
            .iter()
            .filter(|d| d.outcome.kind() == kind)
            .count()
    }
}

/// Collaborators of the pipeline
pub struct PipelinePorts {
    pub market_data: Arc<dyn MarketDataSource>,
    pub forecaster: Arc<dyn ForecastOracle>,
    pub trust: Arc<dyn TrustOracle>,
    pub reasoning: Arc<dyn ReasoningOracle>,
    pub decisions: Arc<dyn DecisionLog>,
    pub handoff: Arc<dyn TradeHandoff>,
}

enum StageResult {
    Candidate(TradeDetails),
    Stop(DecisionOutcome),
}

pub struct PipelineCoordinator {
    ports: PipelinePorts,
    gate: SafetyGate,
    config: PipelineConfig,
    halted: AtomicBool,
    halt_reason: Mutex<Option<String>>,
}

impl PipelineCoordinator {
    pub fn new(ports: PipelinePorts, gate: SafetyGate, config: PipelineConfig) -> Self {
        Self {
            ports,
            gate,
            config,
            halted: AtomicBool::new(false),
            halt_reason: Mutex::new(None),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub async fn halt_reason(&self) -> Option<String> {
        self.halt_reason.lock().await.clone()
    }

    /// Manual reset after a safety halt
    pub async fn reset_halt(&self) {
        let previous = self.halt_reason.lock().await.take();
        self.halted.store(false, Ordering::SeqCst);
        if let Some(reason) = previous {
            warn!("Safety halt manually reset (was: {})", reason);
        }
    }

    async fn refuse_if_halted(&self) -> Result<(), PipelineError> {
        if self.is_halted() {
            let reason = self
                .halt_reason
                .lock()
                .await
                .clone()
                .unwrap_or_else(|| BlockingAction::HaltTrading.to_string());
            return Err(PipelineError::SafetyHalt { reason });
        }
        Ok(())
    }

    /// Process symbols in order, stopping at the first safety halt
    pub async fn run(&self, symbols: &[String]) -> Result<RunSummary, PipelineError> {
        self.refuse_if_halted().await?;

        let mut summary = RunSummary::default();
        for (index, symbol) in symbols.iter().enumerate() {
            match self.process(symbol).await {
                Ok(decision) => {
                    let halted = decision.outcome.is_halt();
                    summary.decisions.push(decision);
                    if halted {
                        summary.halted = true;
                        summary.halt_reason = self.halt_reason().await;
                        summary.skipped = symbols[index + 1..].to_vec();
                        break;
                    }
                }
                Err(PipelineError::SafetyHalt { reason }) => {
                    summary.halted = true;
                    summary.halt_reason = Some(reason);
                    summary.skipped = symbols[index..].to_vec();
                    break;
                }
                Err(e) => {
                    error!("Pipeline failed for {}: {}", symbol, e);
                    summary.errors.push((symbol.clone(), e.to_string()));
                }
            }
        }

        info!(
            "Pipeline run finished: {} processed, {} awaiting approval, {} executed, halted={}",
            summary.decisions.len(),
            summary.count("awaiting_approval"),
            summary.count("executed"),
            summary.halted
        );
        Ok(summary)
    }

    pub async fn process(&self, symbol: &str) -> Result<Decision, PipelineError> {
        self.refuse_if_halted().await?;

        let symbol = symbol.trim().to_uppercase();
        let decided_at = Utc::now();
        let mut audit = DecisionAudit::new(&symbol, self.config.account_mode, decided_at);

        let stage_result = self.evaluate(&symbol, &mut audit).await;

        match &stage_result {
            StageResult::Stop(outcome) => audit.apply_outcome(outcome),
            StageResult::Candidate(_) => {
                audit.outcome_kind = "approved".to_string();
                audit.stage_reached = Stage::Audit;
            }
        }
        let audit_id = self.ports.decisions.record_decision(&audit).await?;

        let outcome = match stage_result {
            StageResult::Stop(outcome) => outcome,
            StageResult::Candidate(details) => self.hand_off(&symbol, details, audit_id).await?,
        };

        Ok(Decision {
            symbol,
            account_mode: self.config.account_mode,
            outcome,
            audit_id: Some(audit_id),
            decided_at,
        })
    }

    async fn evaluate(&self, symbol: &str, audit: &mut DecisionAudit) -> StageResult {
        let abort = |stage: Stage, reason: String| {
            debug!("{} aborted at {}: {}", symbol, stage, reason);
            StageResult::Stop(DecisionOutcome::Aborted { stage, reason })
        };

        // 1. Price history
        let bars = match self
            .ports
            .market_data
            .price_history(symbol, self.config.lookback)
            .await
        {
            Ok(bars) => bars,
            Err(e) => return abort(Stage::FetchData, format!("market data unavailable: {}", e)),
        };
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        if closes.len() < self.config.min_history_points.max(2) {
            return abort(Stage::FetchData, "insufficient data".to_string());
        }
        if closes.iter().any(|c| !c.is_finite() || *c <= 0.0) {
            return abort(Stage::FetchData, "invalid price data".to_string());
        }
        let last_price = closes[closes.len() - 1];

        // 2. Forecast
        let forecast = match self
            .ports
            .forecaster
            .forecast(symbol, &closes, self.config.forecast_horizon)
            .await
        {
            Ok(forecast) => forecast,
            Err(e) => return abort(Stage::Forecast, format!("forecast failed: {}", e)),
        };
        audit.forecast = Some(forecast.clone());

        // 3. Trust
        let trust = match self.ports.trust.evaluate(&forecast, &closes).await {
            Ok(trust) => trust,
            Err(e) => return abort(Stage::TrustEvaluation, format!("trust evaluation failed: {}", e)),
        };
        if !trust.is_trusted {
            let reason = if trust.rejection_reasons.is_empty() {
                "forecast not trusted".to_string()
            } else {
                trust.rejection_reasons.join("; ")
            };
            return abort(Stage::TrustEvaluation, reason);
        }

        // 4. Safety gate
        let volatility = realized_volatility(&closes);
        let signals = RiskSignals {
            drift_score: trust.drift_score,
            volatility,
            coherence_score: trust.coherence_score,
            model_reliability: trust.model_reliability,
            trust_score: trust.trust_score,
        };
        let evaluation = self.gate.evaluate(&signals);
        audit.safety_issues = evaluation.issues.iter().map(|i| i.to_string()).collect();

        if !evaluation.all_clear {
            let reason = evaluation.reason();
            if evaluation.blocking_action == BlockingAction::HaltTrading {
                error!("🛑 Safety halt raised on {}: {}", symbol, reason);
                *self.halt_reason.lock().await = Some(format!("{}: {}", symbol, reason));
                self.halted.store(true, Ordering::SeqCst);
                return StageResult::Stop(DecisionOutcome::Halted { reason });
            }
            warn!("Safety gate blocked {}: {}", symbol, reason);
            return abort(Stage::SafetyGate, reason);
        }

        // 5. Reasoning
        let context = ReasoningContext {
            symbol: symbol.to_string(),
            account_mode: self.config.account_mode,
            last_price,
            volatility,
            forecast: forecast.clone(),
            trust_score: trust.trust_score,
        };
        let verdict = match self.ports.reasoning.decide(&context).await {
            Ok(verdict) => verdict,
            Err(e) => return abort(Stage::Reasoning, format!("reasoning failed: {}", e)),
        };
        audit.reasoning_decision = Some(verdict.decision);
        audit.confidence = Some(verdict.confidence);
        audit.rationale = Some(verdict.rationale.clone());

        let actionable = verdict.decision == ReasoningDecision::Approve
            && verdict.confidence > self.config.actionability_threshold;
        if !actionable {
            return StageResult::Stop(DecisionOutcome::Declined {
                decision: verdict.decision,
                confidence: verdict.confidence,
                reason: format!(
                    "{} with confidence {:.2} (threshold {:.2})",
                    verdict.decision, verdict.confidence, self.config.actionability_threshold
                ),
            });
        }

        let action = if forecast.point > last_price {
            TradeAction::Buy
        } else if forecast.point < last_price {
            TradeAction::Sell
        } else {
            return StageResult::Stop(DecisionOutcome::Declined {
                decision: verdict.decision,
                confidence: verdict.confidence,
                reason: "forecast implies no price move".to_string(),
            });
        };

        let limit_price = match self.config.order_type {
            OrderType::Limit => Some(last_price),
            OrderType::Market => None,
        };
        let details = TradeDetails::new(
            symbol,
            action,
            self.config.order_quantity,
            self.config.order_type,
            limit_price,
            self.config.account_mode,
        )
        .and_then(|d| d.with_confidence(verdict.confidence.clamp(0.0, 1.0)))
        .map(|d| d.with_rationale(verdict.rationale.clone()));

        match details {
            Ok(details) => match forecast.forecast_id {
                Some(id) => StageResult::Candidate(details.with_forecast_id(id)),
                None => StageResult::Candidate(details),
            },
            Err(e) => abort(Stage::Reasoning, format!("invalid trade candidate: {}", e)),
        }
    }

    async fn hand_off(
        &self,
        symbol: &str,
        details: TradeDetails,
        audit_id: i64,
    ) -> Result<DecisionOutcome, PipelineError> {
        info!("➡️  Handing off {}", details.summary());
        let receipt = match self.ports.handoff.hand_off(details).await {
            Ok(receipt) => receipt,
            Err(e) => {
                error!("Hand-off failed for {} [{}]: {}", symbol, e.kind.error_code(), e);
                return Ok(DecisionOutcome::HandoffFailed { reason: e.message });
            }
        };

        let outcome = match receipt {
            HandoffReceipt::AwaitingApproval { trade_id } => {
                DecisionOutcome::AwaitingApproval { trade_id }
            }
            HandoffReceipt::Executed { trade_id, status } => {
                DecisionOutcome::Executed { trade_id, status }
            }
        };
        if let Some(trade_id) = outcome.trade_id() {
            self.ports.decisions.link_trade(audit_id, trade_id).await?;
        }
        Ok(outcome)
    }
}

/// Sample standard deviation of log returns
pub fn realized_volatility(closes: &[f64]) -> f64 {
    let returns: Vec<f64> = closes
        .windows(2)
        .map(|w| (w[1] / w[0]).ln())
        .collect();
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    variance.sqrt()
}
