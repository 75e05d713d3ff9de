//! Embedded policy backend.
//!
//! Loads a compiled policy module from a bytecode artifact at startup and
//! evaluates it in-process, sandboxed by the wasm runtime. The guest ABI is
//! memory-in/memory-out JSON: the host writes the canonical policy input,
//! calls `decide(ptr, len)`, and reads back a JSON result from the packed
//! pointer/length the guest returns. Each evaluation gets a fresh store, so
//! no guest state leaks between requests.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::task;
use tracing::warn;
use wasmtime::{Engine, Instance, Module, Store};

use super::input::PolicyInput;
use super::{Decision, Explanation, PolicyEngine};

#[derive(serde::Deserialize, Debug)]
struct GuestResult {
    #[serde(default)]
    allow: bool,
    package: Option<String>,
    rule: Option<String>,
}

/// [`PolicyEngine`] evaluating an embedded wasm policy module.
pub struct WasmPolicyEngine {
    engine: Engine,
    module: Arc<Module>,
}

impl WasmPolicyEngine {
    /// Load and validate the policy artifact.
    ///
    /// # Errors
    /// Returns an error when the artifact cannot be read or compiled.
    pub fn from_artifact(path: &Path) -> Result<Self> {
        let engine = Engine::default();
        let module = Module::from_file(&engine, path)
            .with_context(|| format!("Failed to load policy artifact: {}", path.display()))?;
        Ok(Self {
            engine,
            module: Arc::new(module),
        })
    }

    fn evaluate_blocking(engine: &Engine, module: &Module, input_json: &str) -> Result<Decision> {
        let mut store = Store::new(engine, ());
        let instance = Instance::new(&mut store, module, &[])
            .context("Failed to instantiate policy module")?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| anyhow!("policy module exports no memory"))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, "alloc")
            .context("policy module exports no alloc")?;
        let decide = instance
            .get_typed_func::<(i32, i32), i64>(&mut store, "decide")
            .context("policy module exports no decide")?;

        let bytes = input_json.as_bytes();
        let len = i32::try_from(bytes.len()).context("policy input too large")?;
        let ptr = alloc.call(&mut store, len)?;
        memory
            .write(&mut store, usize::try_from(ptr).context("bad guest pointer")?, bytes)
            .context("Failed to write policy input")?;

        let packed = decide.call(&mut store, (ptr, len))?;
        let out_ptr = usize::try_from((packed >> 32) & 0xffff_ffff).context("bad result pointer")?;
        let out_len = usize::try_from(packed & 0xffff_ffff).context("bad result length")?;
        let mut out = vec![0u8; out_len];
        memory
            .read(&store, out_ptr, &mut out)
            .context("Failed to read policy result")?;

        let result: GuestResult =
            serde_json::from_slice(&out).context("Policy module returned invalid JSON")?;
        Ok(Decision {
            allow: result.allow,
            explain: match (result.package, result.rule) {
                (Some(package), Some(rule)) => Some(Explanation { package, rule }),
                _ => None,
            },
            reason: None,
        })
    }
}

#[async_trait]
impl PolicyEngine for WasmPolicyEngine {
    async fn decide(&self, input: &PolicyInput) -> Decision {
        let engine = self.engine.clone();
        let module = Arc::clone(&self.module);
        let input_json = input.canonical();

        // Guest evaluation is CPU-bound; keep it off the request executor.
        let outcome = task::spawn_blocking(move || {
            Self::evaluate_blocking(&engine, &module, &input_json)
        })
        .await;

        match outcome {
            Ok(Ok(decision)) => decision,
            Ok(Err(err)) => {
                warn!("embedded policy evaluation failed, denying: {err}");
                Decision::unavailable()
            }
            Err(err) => {
                warn!("embedded policy task failed, denying: {err}");
                Decision::unavailable()
            }
        }
    }
}
