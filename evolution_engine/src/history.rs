use serde::{Deserialize, Serialize};
use shared_models::error::Result;
use shared_models::EvolutionEvent;
use std::sync::Arc;

use crate::persistence::Persistence;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamCategory {
    Risk,
    Signal,
    Timing,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeMagnitude {
    Minor,
    Moderate,
    Major,
}

/// One parameter's movement inside an evolution event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamChange {
    pub name: String,
    pub old_value: f64,
    pub new_value: f64,
    pub change_pct: f64,
    pub category: ParamCategory,
    pub magnitude: ChangeMagnitude,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzedEvent {
    pub event: EvolutionEvent,
    pub changes: Vec<ParamChange>,
    pub recommended_action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub strategy_id: String,
    pub page: usize,
    pub page_size: usize,
    pub total_events: usize,
    pub entries: Vec<AnalyzedEvent>,
}

pub fn categorize(name: &str) -> ParamCategory {
    let n = name.to_ascii_lowercase();
    if ["stop_loss", "take_profit", "drawdown", "position_size", "capital", "slippage"]
        .iter()
        .any(|k| n.contains(k))
    {
        ParamCategory::Risk
    } else if ["threshold", "entry", "exit", "zscore", "momentum", "imbalance", "spread"]
        .iter()
        .any(|k| n.contains(k))
    {
        ParamCategory::Signal
    } else if ["period", "lookback", "window", "cooldown", "hold", "interval"]
        .iter()
        .any(|k| n.contains(k))
    {
        ParamCategory::Timing
    } else {
        ParamCategory::General
    }
}

fn magnitude_of(change_pct: f64) -> ChangeMagnitude {
    let abs = change_pct.abs();
    if abs < 10.0 {
        ChangeMagnitude::Minor
    } else if abs < 30.0 {
        ChangeMagnitude::Moderate
    } else {
        ChangeMagnitude::Major
    }
}

/// Diff the two genomes of an event into per-parameter changes.
pub fn diff_event(event: &EvolutionEvent) -> Vec<ParamChange> {
    let mut changes = Vec::new();
    for (name, &new_value) in &event.new_params {
        let old_value = event.old_params.get(name).copied().unwrap_or(new_value);
        if (new_value - old_value).abs() < 1e-12 {
            continue;
        }
        let change_pct = if old_value.abs() > 1e-12 {
            (new_value - old_value) / old_value.abs() * 100.0
        } else {
            100.0
        };
        changes.push(ParamChange {
            name: name.clone(),
            old_value,
            new_value,
            change_pct,
            category: categorize(name),
            magnitude: magnitude_of(change_pct),
        });
    }
    changes
}

fn recommend(event: &EvolutionEvent, changes: &[ParamChange]) -> String {
    if event.improvement < 0.0 {
        return "fitness regressed; consider rolling back to the previous genome".to_string();
    }
    let touched_risk = changes.iter().any(|c| {
        c.category == ParamCategory::Risk && c.magnitude != ChangeMagnitude::Minor
    });
    if touched_risk {
        return "risk parameters moved substantially; monitor drawdown closely".to_string();
    }
    if changes
        .iter()
        .any(|c| c.magnitude == ChangeMagnitude::Major)
    {
        return "large parameter shift; verify behavior over the next validation window"
            .to_string();
    }
    "no follow-up needed".to_string()
}

pub fn analyze(event: EvolutionEvent) -> AnalyzedEvent {
    let changes = diff_event(&event);
    let recommended_action = recommend(&event, &changes);
    AnalyzedEvent {
        event,
        changes,
        recommended_action,
    }
}

/// Paginated evolution history with per-entry parameter diff and impact
/// analysis, newest first.
pub async fn get_evolution_history(
    persistence: &Arc<Persistence>,
    strategy_id: &str,
    page: usize,
    page_size: usize,
) -> Result<HistoryPage> {
    // Surface unknown strategies as a structured error instead of an empty
    // page.
    persistence.get(strategy_id).await?;
    let (events, total_events) = persistence.events_for(strategy_id, page, page_size).await;
    Ok(HistoryPage {
        strategy_id: strategy_id.to_string(),
        page,
        page_size,
        total_events,
        entries: events.into_iter().map(analyze).collect(),
    })
}
