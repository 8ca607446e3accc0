use tracing::{debug, warn};

use crate::auth::{fingerprint, AuthContext, Authenticator};
use crate::backend::Backend;
use crate::error::DispatchError;
use crate::merge::ResultBuffer;
use crate::normalize::{CallParams, CallRequest};
use crate::rules::Target;
use crate::split::{ExecutionPlan, PlanUnit, Split};
use crate::trace::DispatchTrace;

pub type DispatchOutcome = Result<Vec<serde_json::Value>, DispatchError>;

/// Runs an execution plan against a backend, one unit at a time in ascending
/// call order, stopping at the first failure.
pub struct ExecutionScheduler<'a> {
    backend: &'a dyn Backend,
    auth: &'a dyn Authenticator,
}

impl<'a> ExecutionScheduler<'a> {
    pub fn new(backend: &'a dyn Backend, auth: &'a dyn Authenticator) -> Self {
        Self { backend, auth }
    }

    /// Returns one value per call, in call order. Values produced before a
    /// failure are dropped.
    ///
    /// `plan` must have been built from `calls`; a plan for a different number
    /// of calls is rejected before anything runs.
    pub fn run(
        &self,
        calls: &[CallRequest],
        plan: &ExecutionPlan,
        tr: &mut DispatchTrace,
    ) -> DispatchOutcome {
        if plan.call_count != calls.len() {
            return Err(DispatchError::InvalidPlan {
                message: format!(
                    "plan covers {} call(s) but {} were given",
                    plan.call_count,
                    calls.len()
                ),
            });
        }

        let mut results = ResultBuffer::new(calls.len());
        let mut auth_ctx = AuthContext::new();

        for unit in plan.units() {
            let unit_id = unit_id(&unit);
            let outcome = match unit {
                PlanUnit::Batch(split) => {
                    self.run_batch(split, calls, &unit_id, &mut auth_ctx, &mut results, tr)
                }
                PlanUnit::Single(index) => {
                    self.run_single(&calls[index], &unit_id, &mut auth_ctx, &mut results, tr)
                }
            };

            if let Err(err) = outcome {
                warn!(unit = %unit_id, error = %err, "dispatch aborted");
                tr.unit_finished(&unit_id, false);
                return Err(err);
            }
            tr.unit_finished(&unit_id, true);
        }

        results.into_ordered()
    }

    fn run_batch(
        &self,
        split: &Split,
        calls: &[CallRequest],
        unit_id: &str,
        auth_ctx: &mut AuthContext,
        results: &mut ResultBuffer,
        tr: &mut DispatchTrace,
    ) -> Result<(), DispatchError> {
        let target = &split.target;
        tr.unit_started(unit_id, &target.to_string(), true);
        debug!(unit = %unit_id, target = %target, calls = split.indices.len(), "running batch");

        // Every member of a split shares the first member's credential.
        let Some(&first) = split.indices.first() else {
            return Ok(());
        };
        self.reload(&calls[first], unit_id, auth_ctx, tr);

        let params: Vec<&CallParams> = split.indices.iter().map(|&i| &calls[i].params).collect();
        let values = self
            .backend
            .call_batch(target, &params)
            .map_err(|err| DispatchError::backend(&target.module, &target.method, &err))?;
        results.put_batch(target, &split.indices, values)
    }

    fn run_single(
        &self,
        call: &CallRequest,
        unit_id: &str,
        auth_ctx: &mut AuthContext,
        results: &mut ResultBuffer,
        tr: &mut DispatchTrace,
    ) -> Result<(), DispatchError> {
        let method_ref = call
            .method_ref()
            .ok_or(DispatchError::MissingMethod { index: call.index })??;
        let target = Target::new(method_ref.module, method_ref.method);
        tr.unit_started(unit_id, &target.to_string(), false);
        debug!(unit = %unit_id, target = %target, "running call");

        self.reload(call, unit_id, auth_ctx, tr);

        let value = self
            .backend
            .call(&target, &call.params)
            .map_err(|err| DispatchError::backend(&target.module, &target.method, &err))?;
        results.put(call.index, value);
        Ok(())
    }

    fn reload(
        &self,
        call: &CallRequest,
        unit_id: &str,
        auth_ctx: &mut AuthContext,
        tr: &mut DispatchTrace,
    ) {
        let token = call.token_auth();
        if auth_ctx.ensure(token, self.auth) {
            tr.credential_reloaded(unit_id, &fingerprint(token));
        }
    }
}

/// Stable label for a unit in traces and logs: `batch:0,1` or `call:3`.
pub fn unit_id(unit: &PlanUnit<'_>) -> String {
    match unit {
        PlanUnit::Batch(split) => {
            let indices: Vec<String> = split.indices.iter().map(|i| i.to_string()).collect();
            format!("batch:{}", indices.join(","))
        }
        PlanUnit::Single(index) => format!("call:{index}"),
    }
}
