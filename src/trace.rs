use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Lifecycle of one dispatch pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Init,
    Normalizing,
    Grouping,
    Splitting,
    Executing,
    Succeeded,
    Failed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::Normalizing => "normalizing",
            Phase::Grouping => "grouping",
            Phase::Splitting => "splitting",
            Phase::Executing => "executing",
            Phase::Succeeded => "succeeded",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct DispatchTrace {
    pub dispatch_id: String,
    pub events: Vec<TraceEvent>,
    phase: Phase,
    started_ms: u128,
    unit_started_ms: HashMap<String, u128>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    PhaseEntered {
        ts_ms: u128,
        phase: Phase,
    },
    UnitStarted {
        ts_ms: u128,
        unit_id: String,
        target: String,
        batch: bool,
    },
    CredentialReloaded {
        ts_ms: u128,
        unit_id: String,
        credential: String,
    },
    UnitFinished {
        ts_ms: u128,
        unit_id: String,
        success: bool,
        elapsed_ms: u128,
    },
    DispatchFailed {
        ts_ms: u128,
        message: String,
    },
    DispatchFinished {
        ts_ms: u128,
        success: bool,
        elapsed_ms: u128,
    },
}

impl TraceEvent {
    pub fn summarize(&self, verbose: bool) -> String {
        match self {
            TraceEvent::PhaseEntered { ts_ms, phase } => format!("{ts_ms} PhaseEntered phase={phase}"),
            TraceEvent::UnitStarted {
                ts_ms,
                unit_id,
                target,
                batch,
            } => format!("{ts_ms} UnitStarted unit={unit_id} target={target} batch={batch}"),
            TraceEvent::CredentialReloaded {
                ts_ms,
                unit_id,
                credential,
            } => format!("{ts_ms} CredentialReloaded unit={unit_id} credential={credential}"),
            TraceEvent::UnitFinished {
                ts_ms,
                unit_id,
                success,
                elapsed_ms,
            } => {
                if verbose {
                    format!(
                        "{ts_ms} UnitFinished unit={unit_id} success={success} elapsed={}",
                        format_elapsed_ms(*elapsed_ms)
                    )
                } else {
                    format!("{ts_ms} UnitFinished unit={unit_id} success={success}")
                }
            }
            TraceEvent::DispatchFailed { ts_ms, message } => {
                format!("{ts_ms} DispatchFailed message={message}")
            }
            TraceEvent::DispatchFinished {
                ts_ms,
                success,
                elapsed_ms,
            } => {
                if verbose {
                    format!(
                        "{ts_ms} DispatchFinished success={success} elapsed={}",
                        format_elapsed_ms(*elapsed_ms)
                    )
                } else {
                    format!("{ts_ms} DispatchFinished success={success}")
                }
            }
        }
    }
}

impl DispatchTrace {
    pub fn new(dispatch_id: impl Into<String>) -> Self {
        Self {
            dispatch_id: dispatch_id.into(),
            events: Vec::new(),
            phase: Phase::Init,
            started_ms: Self::now_ms(),
            unit_started_ms: HashMap::new(),
        }
    }

    fn now_ms() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.events.push(TraceEvent::PhaseEntered {
            ts_ms: Self::now_ms(),
            phase,
        });
    }

    pub fn unit_started(&mut self, unit_id: &str, target: &str, batch: bool) {
        let ts_ms = Self::now_ms();
        self.events.push(TraceEvent::UnitStarted {
            ts_ms,
            unit_id: unit_id.to_string(),
            target: target.to_string(),
            batch,
        });
        self.unit_started_ms.insert(unit_id.to_string(), ts_ms);
    }

    /// `credential` must already be a fingerprint, never the raw token.
    pub fn credential_reloaded(&mut self, unit_id: &str, credential: &str) {
        self.events.push(TraceEvent::CredentialReloaded {
            ts_ms: Self::now_ms(),
            unit_id: unit_id.to_string(),
            credential: credential.to_string(),
        });
    }

    pub fn unit_finished(&mut self, unit_id: &str, success: bool) {
        let ts_ms = Self::now_ms();
        let elapsed_ms = self
            .unit_started_ms
            .remove(unit_id)
            .map(|started| ts_ms.saturating_sub(started))
            .unwrap_or(0);
        self.events.push(TraceEvent::UnitFinished {
            ts_ms,
            unit_id: unit_id.to_string(),
            success,
            elapsed_ms,
        });
    }

    pub fn dispatch_failed(&mut self, message: &str) {
        self.events.push(TraceEvent::DispatchFailed {
            ts_ms: Self::now_ms(),
            message: message.to_string(),
        });
    }

    /// Enter the terminal phase and record the overall outcome.
    pub fn dispatch_finished(&mut self, success: bool) {
        self.enter(if success {
            Phase::Succeeded
        } else {
            Phase::Failed
        });
        let ts_ms = Self::now_ms();
        self.events.push(TraceEvent::DispatchFinished {
            ts_ms,
            success,
            elapsed_ms: ts_ms.saturating_sub(self.started_ms),
        });
    }
}

/// Print a human-readable trace to stdout (stable + diff-friendly).
pub fn print_trace(tr: &DispatchTrace, verbose: bool) {
    println!("TRACE dispatch_id={}", tr.dispatch_id);
    for ev in &tr.events {
        println!("{}", ev.summarize(verbose));
    }
}

fn format_elapsed_ms(elapsed_ms: u128) -> String {
    let secs = elapsed_ms as f64 / 1000.0;
    format!("{secs:.2}s")
}
