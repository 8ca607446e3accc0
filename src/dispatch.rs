use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::auth::Authenticator;
use crate::backend::{Backend, ModuleRegistry};
use crate::error::DispatchError;
use crate::execute::ExecutionScheduler;
use crate::grouping::GroupingAnalyzer;
use crate::normalize::{normalize, CallRequest, MethodRef};
use crate::request::RawRequest;
use crate::rules::RuleBook;
use crate::split::ExecutionPlan;
use crate::trace::{DispatchTrace, Phase};

/// What a successful dispatch hands to the response formatter.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// One value per call, in call order.
    Bulk(Vec<JsonValue>),
    /// A plain request; `target` is the method that answered it.
    Single { target: MethodRef, value: JsonValue },
}

/// Normalized calls together with the plan that would run them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDispatch {
    pub calls: Vec<CallRequest>,
    pub plan: ExecutionPlan,
}

/// Drives one request through normalize, group, split, execute and merge.
///
/// Holds no per-request state; the same dispatcher can serve any number of
/// requests in turn.
pub struct Dispatcher<'a> {
    rules: &'a RuleBook,
    registry: &'a dyn ModuleRegistry,
    backend: &'a dyn Backend,
    auth: &'a dyn Authenticator,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        rules: &'a RuleBook,
        registry: &'a dyn ModuleRegistry,
        backend: &'a dyn Backend,
        auth: &'a dyn Authenticator,
    ) -> Self {
        Self {
            rules,
            registry,
            backend,
            auth,
        }
    }

    /// Plan a request without touching the backend.
    ///
    /// A non-bulk request plans to exactly the one call `process` would run.
    pub fn plan(&self, raw: &RawRequest) -> Result<PlannedDispatch, DispatchError> {
        let mut scratch = DispatchTrace::new("plan");
        if raw.is_bulk() {
            self.prepare(raw, &mut scratch)
        } else {
            self.prepare_single(raw, &mut scratch)
                .map(|(_, planned)| planned)
        }
    }

    pub fn process(
        &self,
        raw: &RawRequest,
        tr: &mut DispatchTrace,
    ) -> Result<Reply, DispatchError> {
        info!(dispatch = %tr.dispatch_id, bulk = raw.is_bulk(), "dispatch started");

        let outcome = if raw.is_bulk() {
            self.process_bulk(raw, tr).map(Reply::Bulk)
        } else {
            self.process_single(raw, tr)
        };

        match &outcome {
            Ok(_) => {
                tr.dispatch_finished(true);
                info!(dispatch = %tr.dispatch_id, "dispatch succeeded");
            }
            Err(err) => {
                warn!(dispatch = %tr.dispatch_id, phase = %tr.phase(), error = %err, "dispatch failed");
                tr.dispatch_failed(&err.to_string());
                tr.dispatch_finished(false);
            }
        }
        outcome
    }

    fn prepare(
        &self,
        raw: &RawRequest,
        tr: &mut DispatchTrace,
    ) -> Result<PlannedDispatch, DispatchError> {
        tr.enter(Phase::Normalizing);
        let normalized = normalize(raw)?;

        tr.enter(Phase::Grouping);
        let groups = GroupingAnalyzer::new(self.rules, self.registry).analyze(&normalized)?;

        tr.enter(Phase::Splitting);
        let plan = ExecutionPlan::build(&groups, &normalized.calls)?;

        Ok(PlannedDispatch {
            calls: normalized.calls,
            plan,
        })
    }

    fn process_bulk(
        &self,
        raw: &RawRequest,
        tr: &mut DispatchTrace,
    ) -> Result<Vec<JsonValue>, DispatchError> {
        let PlannedDispatch { calls, plan } = self.prepare(raw, tr)?;
        info!(
            calls = calls.len(),
            batches = plan.splits.len(),
            singles = plan.singles.len(),
            "bulk request planned"
        );

        tr.enter(Phase::Executing);
        ExecutionScheduler::new(self.backend, self.auth).run(&calls, &plan, tr)
    }

    /// A non-bulk request is exactly one call: the first normalized call.
    fn prepare_single(
        &self,
        raw: &RawRequest,
        tr: &mut DispatchTrace,
    ) -> Result<(MethodRef, PlannedDispatch), DispatchError> {
        tr.enter(Phase::Normalizing);
        let mut normalized = normalize(raw)?;
        normalized.calls.truncate(1);

        let Some(call) = normalized.calls.first() else {
            return Err(DispatchError::MissingMethod { index: 0 });
        };
        let target = call
            .method_ref()
            .ok_or(DispatchError::MissingMethod { index: 0 })??;
        if !self.registry.is_active(&target.module) {
            return Err(DispatchError::ModuleNotActivated {
                module: target.module,
            });
        }

        let plan = ExecutionPlan::build(&[], &normalized.calls)?;
        Ok((
            target,
            PlannedDispatch {
                calls: normalized.calls,
                plan,
            },
        ))
    }

    fn process_single(
        &self,
        raw: &RawRequest,
        tr: &mut DispatchTrace,
    ) -> Result<Reply, DispatchError> {
        let (target, PlannedDispatch { calls, plan }) = self.prepare_single(raw, tr)?;

        tr.enter(Phase::Executing);
        let mut values = ExecutionScheduler::new(self.backend, self.auth).run(&calls, &plan, tr)?;
        let value = values.pop().ok_or(DispatchError::Incomplete { index: 0 })?;

        Ok(Reply::Single { target, value })
    }
}
