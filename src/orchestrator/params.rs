//! Parameter-constraint filter. Runs before dispatch and produces the
//! canonical parameter map the adapters receive.

use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::domain::{GatewayError, ModelConstraints, ParameterConstraint, Result};

#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    pub params: Map<String, Value>,
    pub warnings: Vec<String>,
}

/// Apply a model's parameter constraints:
/// unsupported params drop with a warning, supported params are checked
/// against `allowed_values` or `[min, max]`, omitted params pick up defaults,
/// mutually exclusive pairs reject, `alternative_name` renames last. Unknown
/// params pass through with a warning unless `custom_parameters` covers them.
pub fn filter_params(
    constraints: &ModelConstraints,
    params: &Map<String, Value>,
) -> Result<FilterOutcome> {
    let mut outcome = FilterOutcome::default();
    let mut defaulted: HashSet<String> = HashSet::new();

    for (name, value) in params {
        let constraint = constraints
            .parameters
            .get(name)
            .or_else(|| constraints.custom_parameters.get(name));

        match constraint {
            None => {
                outcome
                    .warnings
                    .push(format!("unknown parameter '{}' passed through", name));
                outcome.params.insert(name.clone(), value.clone());
            }
            Some(c) if !c.supported => {
                let reason = c.reason.as_deref().unwrap_or("not supported by this model");
                outcome
                    .warnings
                    .push(format!("parameter '{}' dropped: {}", name, reason));
            }
            Some(c) => {
                validate_value(name, value, c)?;
                outcome.params.insert(name.clone(), value.clone());
            }
        }
    }

    // Defaults for omitted supported parameters.
    for (name, constraint) in &constraints.parameters {
        if !constraint.supported {
            continue;
        }
        if let Some(default) = &constraint.default {
            if !outcome.params.contains_key(name) {
                outcome.params.insert(name.clone(), default.clone());
                defaulted.insert(name.clone());
            }
        }
    }

    // Mutual exclusion, checked on canonical names before any rename. A
    // defaulted value yields to an explicit one instead of erroring.
    let names: Vec<String> = outcome.params.keys().cloned().collect();
    for name in &names {
        let Some(constraint) = constraints.parameters.get(name) else {
            continue;
        };
        let Some(exclusions) = &constraint.mutually_exclusive_with else {
            continue;
        };
        for other in exclusions {
            if !outcome.params.contains_key(other) {
                continue;
            }
            if defaulted.contains(name) {
                outcome.params.remove(name);
                break;
            } else if defaulted.contains(other) {
                outcome.params.remove(other);
            } else {
                return Err(GatewayError::validation(format!(
                    "parameters '{}' and '{}' are mutually exclusive",
                    name, other
                )));
            }
        }
    }

    // Renames last, so every earlier rule saw canonical names.
    for (name, constraint) in constraints
        .parameters
        .iter()
        .chain(constraints.custom_parameters.iter())
    {
        if let Some(alt) = &constraint.alternative_name {
            if let Some(value) = outcome.params.remove(name) {
                outcome.params.insert(alt.clone(), value);
            }
        }
    }

    Ok(outcome)
}

fn validate_value(name: &str, value: &Value, constraint: &ParameterConstraint) -> Result<()> {
    if let Some(allowed) = &constraint.allowed_values {
        if !allowed.contains(value) {
            return Err(GatewayError::validation(format!(
                "parameter '{}' must be one of {}",
                name,
                serde_json::to_string(allowed).unwrap_or_default()
            )));
        }
        return Ok(());
    }

    if constraint.min.is_some() || constraint.max.is_some() {
        let number = value.as_f64().ok_or_else(|| {
            GatewayError::validation(format!("parameter '{}' must be numeric", name))
        })?;
        if let Some(min) = constraint.min {
            if number < min {
                return Err(GatewayError::validation(format!(
                    "parameter '{}' must be >= {}",
                    name, min
                )));
            }
        }
        if let Some(max) = constraint.max {
            if number > max {
                return Err(GatewayError::validation(format!(
                    "parameter '{}' must be <= {}",
                    name, max
                )));
            }
        }
    }

    Ok(())
}
