use crate::execute::unit_id;
use crate::normalize::CallRequest;
use crate::split::{ExecutionPlan, PlanUnit};

/// Human-readable plan: one line per execution unit, in run order.
pub fn format_plan(calls: &[CallRequest], plan: &ExecutionPlan) -> Vec<String> {
    let mut lines = vec![
        format!("Calls:   {}", plan.call_count),
        format!("Batches: {}", plan.splits.len()),
        format!("Singles: {}", plan.singles.len()),
    ];

    for (idx, unit) in plan.units().iter().enumerate() {
        let detail = match unit {
            PlanUnit::Batch(split) => format!("target={}", split.target),
            PlanUnit::Single(i) => format!(
                "method={}",
                calls
                    .get(*i)
                    .and_then(|c| c.method())
                    .unwrap_or("<missing-method>")
            ),
        };
        lines.push(format!("  {idx}. {}  {detail}", unit_id(unit)));
    }
    lines
}

pub fn print_plan(calls: &[CallRequest], plan: &ExecutionPlan) {
    for line in format_plan(calls, plan) {
        println!("{line}");
    }
}
