//! Step-graph construction for the three execution strategies.
//!
//! - `handoff`: roles in request order; step i's input is
//!   `prev_output:original_input`.
//! - `parallel_map`: all roles share the original input.
//! - `router`: roles sorted into the fixed pipeline ordering; unknown
//!   roles keep their relative order after the known ones.

use crate::models::{AgentRequest, ExecutionStrategy, Step};

/// Fixed pipeline ordering used by the `router` strategy.
const ROUTER_ORDER: &[&str] = &[
    "planner",
    "researcher",
    "architect",
    "coder",
    "reviewer",
    "tester",
    "summarizer",
];

fn router_rank(role: &str) -> usize {
    let role_lower = role.to_lowercase();
    ROUTER_ORDER
        .iter()
        .position(|known| *known == role_lower)
        .unwrap_or(ROUTER_ORDER.len())
}

/// Roles in execution order for the given strategy.
pub fn ordered_roles(request: &AgentRequest) -> Vec<String> {
    match request.strategy {
        ExecutionStrategy::Handoff | ExecutionStrategy::ParallelMap => request.roles.clone(),
        ExecutionStrategy::Router => {
            let mut indexed: Vec<(usize, usize, &String)> = request
                .roles
                .iter()
                .enumerate()
                .map(|(position, role)| (router_rank(role), position, role))
                .collect();
            indexed.sort();
            indexed.into_iter().map(|(_, _, role)| role.clone()).collect()
        }
    }
}

/// Input for one step given the previous step's output.
pub fn step_input(
    strategy: ExecutionStrategy,
    original_input: &str,
    previous_output: Option<&str>,
) -> String {
    match (strategy, previous_output) {
        (ExecutionStrategy::Handoff, Some(previous)) => {
            format!("{previous}:{original_input}")
        }
        _ => original_input.to_string(),
    }
}

/// Build the initial step list for a run.
pub fn build_steps(request: &AgentRequest) -> Vec<Step> {
    ordered_roles(request)
        .iter()
        .map(|role| Step::new(role, request.input.clone()))
        .collect()
}
