//! Child-process side of the sandbox.
//!
//! Invoked as the `sandbox-worker` subcommand inside a resource-limited
//! process. Reads the strategy source and JSON input bundle from the paths in
//! the environment, evaluates the three entry points, and writes the result
//! JSON into the per-run artifact directory. The only filesystem write
//! surface exposed to user code is `write_file(path, text)`, which rejects
//! any target outside the artifact directory.

use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context};
use rhai::{Array, Dynamic, Engine, Scope};
use serde_json::{json, Value};

pub const ARTIFACT_DIR_ENV: &str = "FIN_AGENT_ARTIFACT_DIR";
pub const STRATEGY_PATH_ENV: &str = "FIN_AGENT_STRATEGY_PATH";
pub const INPUT_PATH_ENV: &str = "FIN_AGENT_INPUT_PATH";

/// Marker string the host greps from stderr to classify policy failures.
pub const WRITE_BLOCKED_MARKER: &str = "write outside artifact dir blocked";

/// Lexically resolve a path against the working directory, folding `.`/`..`.
fn resolve_for_guard(raw: &str) -> PathBuf {
    let path = Path::new(raw);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    };
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn build_engine(artifact_dir: PathBuf) -> Engine {
    let mut engine = Engine::new();
    engine.register_fn(
        "write_file",
        move |path: &str, contents: &str| -> Result<(), Box<rhai::EvalAltResult>> {
            let resolved = resolve_for_guard(path);
            if resolved != artifact_dir && !resolved.starts_with(&artifact_dir) {
                return Err(format!("{}: {}", WRITE_BLOCKED_MARKER, resolved.display()).into());
            }
            std::fs::write(&resolved, contents)
                .map_err(|e| format!("write failed for {}: {}", resolved.display(), e))?;
            Ok(())
        },
    );
    engine
}

fn env_path(name: &str) -> anyhow::Result<PathBuf> {
    let raw = std::env::var(name).with_context(|| format!("{} is not set", name))?;
    Ok(PathBuf::from(raw))
}

fn json_field(input: &Value, key: &str) -> Dynamic {
    let value = input.get(key).cloned().unwrap_or(Value::Null);
    rhai::serde::to_dynamic(value).unwrap_or(Dynamic::UNIT)
}

fn call_entry(
    engine: &Engine,
    ast: &rhai::AST,
    name: &str,
    args: impl rhai::FuncArgs,
) -> anyhow::Result<Dynamic> {
    let mut scope = Scope::new();
    engine
        .call_fn::<Dynamic>(&mut scope, ast, name, args)
        .map_err(|e| anyhow!("{} failed: {}", name, e))
}

fn dynamic_to_json(value: &Dynamic) -> Value {
    rhai::serde::from_dynamic::<Value>(value).unwrap_or(Value::Null)
}

/// Entry point for the `sandbox-worker` subcommand.
pub fn run_sandbox_worker() -> anyhow::Result<()> {
    let artifact_dir = resolve_for_guard(
        env_path(ARTIFACT_DIR_ENV)?
            .to_str()
            .ok_or_else(|| anyhow!("artifact dir is not valid UTF-8"))?,
    );
    let strategy_path = env_path(STRATEGY_PATH_ENV)?;
    let input_path = env_path(INPUT_PATH_ENV)?;
    let result_path = artifact_dir.join("result.json");

    let source = std::fs::read_to_string(&strategy_path)
        .with_context(|| format!("failed to read strategy source {}", strategy_path.display()))?;
    let input: Value = serde_json::from_str(
        &std::fs::read_to_string(&input_path)
            .with_context(|| format!("failed to read input bundle {}", input_path.display()))?,
    )
    .context("input bundle is not valid JSON")?;

    let engine = build_engine(artifact_dir.clone());
    let ast = engine
        .compile(&source)
        .map_err(|e| anyhow!("strategy failed to compile: {}", e))?;

    let data_bundle = json_field(&input, "data_bundle");
    let frame = json_field(&input, "frame");
    let context = json_field(&input, "context");

    let prepared = call_entry(&engine, &ast, "prepare", (data_bundle, context.clone()))?;
    let signals = call_entry(
        &engine,
        &ast,
        "generate_signals",
        (frame, prepared.clone(), context.clone()),
    )?;
    let risk = call_entry(&engine, &ast, "risk_rules", (Array::new(), context))?;

    let signals_count = signals.read_lock::<Array>().map(|a| a.len() as i64);
    let result = json!({
        "prepare_type": prepared.type_name(),
        "signals_type": signals.type_name(),
        "signals_count": signals_count,
        "risk_type": risk.type_name(),
        "prepared": dynamic_to_json(&prepared),
        "signals": dynamic_to_json(&signals),
        "risk": dynamic_to_json(&risk),
    });
    std::fs::write(&result_path, serde_json::to_string(&result)?)
        .with_context(|| format!("failed to write result {}", result_path.display()))?;
    println!("{}", result_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_folds_parent_components() {
        let resolved = resolve_for_guard("/a/b/../c/./d.txt");
        assert_eq!(resolved, PathBuf::from("/a/c/d.txt"));
    }

    #[test]
    fn test_guard_blocks_escape() {
        let dir = tempfile::tempdir().unwrap();
        let artifact_dir = resolve_for_guard(dir.path().to_str().unwrap());
        let engine = build_engine(artifact_dir.clone());
        let escape = format!(
            "write_file(\"{}/../escape.txt\", \"nope\")",
            artifact_dir.display()
        );
        let err = engine.run(&escape).unwrap_err();
        assert!(err.to_string().contains(WRITE_BLOCKED_MARKER));

        let allowed = format!("write_file(\"{}/ok.txt\", \"yes\")", artifact_dir.display());
        engine.run(&allowed).unwrap();
        assert_eq!(
            std::fs::read_to_string(artifact_dir.join("ok.txt")).unwrap(),
            "yes"
        );
    }

    #[test]
    fn test_guard_blocks_absolute_paths() {
        let dir = tempfile::tempdir().unwrap();
        let engine = build_engine(resolve_for_guard(dir.path().to_str().unwrap()));
        let err = engine
            .run("write_file(\"/tmp/forbidden-write.txt\", \"nope\")")
            .unwrap_err();
        assert!(err.to_string().contains("outside artifact dir"));
    }
}
