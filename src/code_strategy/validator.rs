//! Static and contract validation of user strategy code.
//!
//! A strategy source is accepted iff it compiles in the embedded evaluator,
//! defines the three required entry points with fixed arities, and each entry
//! point returns the required shape when invoked on empty inputs.

use rhai::{Array, Dynamic, Engine, Map, Scope};
use serde_json::{json, Value};

use crate::error::{FinError, FinResult};

/// Required entry points and their arities.
pub const REQUIRED_SIGNATURES: &[(&str, usize)] = &[
    ("prepare", 2),
    ("generate_signals", 3),
    ("risk_rules", 2),
];

/// Operation cap for the contract check so a looping strategy cannot hang
/// validation; real runs execute in the sandbox under wall-clock limits.
const CONTRACT_CHECK_MAX_OPERATIONS: u64 = 5_000_000;

fn contract_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(CONTRACT_CHECK_MAX_OPERATIONS);
    engine
}

fn assert_required_functions(ast: &rhai::AST) -> FinResult<()> {
    for (name, expected_params) in REQUIRED_SIGNATURES {
        let found = ast
            .iter_functions()
            .find(|f| f.name == *name)
            .ok_or_else(|| FinError::invalid(format!("missing required function: {}", name)))?;
        if found.params.len() != *expected_params {
            return Err(FinError::invalid(format!(
                "invalid signature for {}: expected {} args, got {}",
                name,
                expected_params,
                found.params.len()
            )));
        }
    }
    Ok(())
}

fn call_entry(
    engine: &Engine,
    ast: &rhai::AST,
    name: &str,
    args: impl rhai::FuncArgs,
) -> FinResult<Dynamic> {
    let mut scope = Scope::new();
    engine
        .call_fn::<Dynamic>(&mut scope, ast, name, args)
        .map_err(|e| {
            FinError::invalid(format!(
                "{} raised exception during contract check: {}",
                name, e
            ))
        })
}

/// Validate a strategy source string, returning the validation payload that
/// is stored with the saved version.
pub fn validate_code_strategy_source(source_code: &str) -> FinResult<Value> {
    if source_code.trim().is_empty() {
        return Err(FinError::invalid("source_code is empty"));
    }
    let engine = contract_engine();
    let ast = engine
        .compile(source_code)
        .map_err(|e| FinError::invalid(format!("syntax error in source_code: {}", e)))?;

    assert_required_functions(&ast)?;

    let prepared = call_entry(&engine, &ast, "prepare", (Map::new(), Map::new()))?;
    if !prepared.is_map() {
        return Err(FinError::invalid("prepare must return map"));
    }

    let signals = call_entry(
        &engine,
        &ast,
        "generate_signals",
        (Array::new(), prepared.clone(), Map::new()),
    )?;
    let Some(signal_rows) = signals.read_lock::<Array>().map(|a| a.clone()) else {
        return Err(FinError::invalid("generate_signals must return array"));
    };
    for row in &signal_rows {
        let Some(item) = row.read_lock::<Map>() else {
            return Err(FinError::invalid("generate_signals items must be map"));
        };
        let missing: Vec<&str> = ["symbol", "signal"]
            .into_iter()
            .filter(|key| !item.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            return Err(FinError::invalid(format!(
                "generate_signals item missing keys: {:?}",
                missing
            )));
        }
    }

    let risk = call_entry(&engine, &ast, "risk_rules", (Array::new(), Map::new()))?;
    if !risk.is_map() {
        return Err(FinError::invalid("risk_rules must return map"));
    }

    let mut required: Vec<&str> = REQUIRED_SIGNATURES.iter().map(|(name, _)| *name).collect();
    required.sort_unstable();
    Ok(json!({
        "valid": true,
        "required_functions": required,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const VALID_STRATEGY: &str = r#"
fn prepare(data_bundle, context) {
    #{ universe: data_bundle.universe }
}

fn generate_signals(frame, state, context) {
    let signals = [];
    if frame.len() > 0 {
        signals.push(#{ symbol: frame[0].symbol, signal: "buy", strength: 0.9 });
    }
    signals
}

fn risk_rules(positions, context) {
    #{ max_positions: 5 }
}
"#;

    #[test]
    fn test_accepts_valid_strategy() {
        let validation = validate_code_strategy_source(VALID_STRATEGY).unwrap();
        assert_eq!(validation["valid"], true);
        assert_eq!(
            validation["required_functions"],
            serde_json::json!(["generate_signals", "prepare", "risk_rules"])
        );
    }

    #[test]
    fn test_rejects_empty_source() {
        let err = validate_code_strategy_source("   ").unwrap_err();
        assert!(err.to_string().contains("source_code is empty"));
    }

    #[test]
    fn test_rejects_syntax_errors() {
        let err = validate_code_strategy_source("fn prepare(a, b) {").unwrap_err();
        assert!(err.to_string().contains("syntax error in source_code"));
    }

    #[test]
    fn test_rejects_missing_functions() {
        let err = validate_code_strategy_source("fn prepare(a, b) { #{} }").unwrap_err();
        assert!(err.to_string().contains("missing required function: generate_signals"));
    }

    #[test]
    fn test_rejects_wrong_arity() {
        let source = r#"
fn prepare(a) { #{} }
fn generate_signals(a, b, c) { [] }
fn risk_rules(a, b) { #{} }
"#;
        let err = validate_code_strategy_source(source).unwrap_err();
        assert!(err
            .to_string()
            .contains("invalid signature for prepare: expected 2 args, got 1"));
    }

    #[test]
    fn test_rejects_wrong_prepare_shape() {
        let source = r#"
fn prepare(a, b) { 42 }
fn generate_signals(a, b, c) { [] }
fn risk_rules(a, b) { #{} }
"#;
        let err = validate_code_strategy_source(source).unwrap_err();
        assert!(err.to_string().contains("prepare must return map"));
    }

    #[test]
    fn test_rejects_signal_rows_without_keys() {
        let source = r#"
fn prepare(a, b) { #{} }
fn generate_signals(a, b, c) { [#{ symbol: "ABC" }] }
fn risk_rules(a, b) { #{} }
"#;
        let err = validate_code_strategy_source(source).unwrap_err();
        assert!(err.to_string().contains("missing keys"));
        assert!(err.to_string().contains("signal"));
    }

    #[test]
    fn test_contract_check_bounds_runaway_code() {
        let source = r#"
fn prepare(a, b) { let x = 0; loop { x += 1; } }
fn generate_signals(a, b, c) { [] }
fn risk_rules(a, b) { #{} }
"#;
        let err = validate_code_strategy_source(source).unwrap_err();
        assert!(err.to_string().contains("prepare raised exception"));
    }
}
