//! LoRA adapter stack checks
//!
//! Every adapter of a requested stack is checked against the base model
//! before the native layer touches the attached stack.

use crate::error::EngineError;
use crate::inference::gguf::GgufFile;
use crate::inference::params::AdapterSpec;

/// Validates each adapter in order; the first failure is reported with its index
pub fn check_stack(base_architecture: &str, adapters: &[AdapterSpec]) -> Result<(), EngineError> {
    for (index, adapter) in adapters.iter().enumerate() {
        check_one(base_architecture, adapter)
            .map_err(|reason| EngineError::AdapterLoadFailed { index, reason })?;
    }
    Ok(())
}

fn check_one(base_architecture: &str, adapter: &AdapterSpec) -> Result<(), String> {
    if !adapter.scale.is_finite() {
        return Err(format!("scale {} is not finite", adapter.scale));
    }
    if !adapter.path.is_file() {
        return Err(format!("file not found: {}", adapter.path.display()));
    }

    let gguf = GgufFile::open(&adapter.path).map_err(|e| e.to_string())?;

    if let Some(kind) = gguf.get("general.type").and_then(|v| v.as_str()) {
        if kind != "adapter" {
            return Err(format!("not an adapter file (general.type = {kind})"));
        }
    }

    match gguf.architecture() {
        Some(arch) if arch == base_architecture => Ok(()),
        Some(arch) => Err(format!(
            "architecture '{arch}' does not match base model '{base_architecture}'"
        )),
        None => Err("missing general.architecture".to_string()),
    }
}
