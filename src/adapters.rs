use anyhow::Result;

use crate::chunk::Chunk;
use crate::config::AdapterEntry;

// ---------------------------------------------------------------------------
// Plugin adapters — opaque chunk producers with error isolation.
//
// From the engine's point of view an adapter is a named capability that
// turns its config into chunks. A failing adapter logs and contributes
// nothing; it can never take down a reindex or affect other adapters.
// ---------------------------------------------------------------------------

pub trait ContextAdapter: Send {
    fn name(&self) -> &str;
    fn description(&self) -> &str {
        ""
    }
    /// Optional config validation before first use.
    fn validate(&self, _config: &serde_json::Value) -> Result<()> {
        Ok(())
    }
    fn init(&mut self, _config: &serde_json::Value) -> Result<()> {
        Ok(())
    }
    fn collect(&mut self, config: &serde_json::Value) -> Result<Vec<Chunk>>;
    fn destroy(&mut self) {}
}

struct Registered {
    adapter: Box<dyn ContextAdapter>,
    config: serde_json::Value,
}

#[derive(Default)]
pub struct AdapterRegistry {
    registered: Vec<Registered>,
}

impl AdapterRegistry {
    /// Build the registry from config entries. External module loading is
    /// host-specific; entries that name a module nothing has provided are
    /// reported once and skipped.
    pub fn from_config(entries: &[AdapterEntry]) -> Self {
        for entry in entries.iter().filter(|e| e.enabled) {
            eprintln!(
                "[contextengine] adapter '{}' declared (module {}) but no loader is registered; skipping",
                entry.name, entry.module
            );
        }
        Self::default()
    }

    /// Register an in-process adapter. `validate` failure rejects it.
    pub fn register(
        &mut self,
        mut adapter: Box<dyn ContextAdapter>,
        config: serde_json::Value,
    ) -> Result<()> {
        adapter.validate(&config)?;
        adapter.init(&config)?;
        self.registered.push(Registered { adapter, config });
        Ok(())
    }

    /// Run every adapter; each one's chunks are tagged with its name.
    /// Failures are isolated per adapter.
    pub fn collect_all(&mut self) -> Vec<Chunk> {
        let mut chunks: Vec<Chunk> = Vec::new();
        for reg in &mut self.registered {
            let name = reg.adapter.name().to_string();
            match reg.adapter.collect(&reg.config) {
                Ok(mut produced) => {
                    for c in &mut produced {
                        c.source = format!("adapter:{}/{}", name, c.source);
                    }
                    chunks.extend(produced);
                }
                Err(e) => {
                    eprintln!("[contextengine] adapter '{name}' failed: {e}");
                }
            }
        }
        chunks
    }
}

impl Drop for AdapterRegistry {
    fn drop(&mut self) {
        for reg in &mut self.registered {
            reg.adapter.destroy();
        }
    }
}
