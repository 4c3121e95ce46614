//! Temporary edits to the DPDK build configuration.
//!
//! A [`ConfigPatch`] rewrites whole lines of a text file by key. Applying it
//! yields a [`PatchGuard`] holding the file's original bytes, which are put
//! back by [`PatchGuard::revert`] or, failing that, when the guard drops.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::error::{DoatError, Result};
use crate::shutdown::ShutdownRegistry;

pub const MEMPOOL_OPS_KEY: &str = "RTE_MBUF_DEFAULT_MEMPOOL_OPS";
pub const MEMPOOL_CACHE_KEY: &str = "RTE_MEMPOOL_CACHE_MAX_SIZE";
const RING_OPS: &str = "ring_mp_mc";

/// Replace every line containing `key` with `line`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineReplacement {
    pub key: String,
    pub line: String,
}

/// An ordered set of line replacements against one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigPatch {
    pub path: PathBuf,
    pub replacements: Vec<LineReplacement>,
}

impl ConfigPatch {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            replacements: Vec::new(),
        }
    }

    pub fn replace(mut self, key: impl Into<String>, line: impl Into<String>) -> Self {
        self.replacements.push(LineReplacement {
            key: key.into(),
            line: line.into(),
        });
        self
    }

    /// Patched copy of `text`. A line is rewritten by the first replacement
    /// whose key it contains; line endings are preserved. Every key must
    /// match at least one line.
    pub fn apply_to(&self, text: &str) -> Result<String> {
        let mut hits = vec![0usize; self.replacements.len()];
        let mut out = String::with_capacity(text.len());
        for line in text.split_inclusive('\n') {
            let (body, ending) = split_ending(line);
            match self
                .replacements
                .iter()
                .position(|r| body.contains(r.key.as_str()))
            {
                Some(i) => {
                    hits[i] += 1;
                    out.push_str(&self.replacements[i].line);
                    out.push_str(ending);
                }
                None => out.push_str(line),
            }
        }

        if let Some(i) = hits.iter().position(|&n| n == 0) {
            return Err(DoatError::Mutation {
                path: self.path.clone(),
                detail: format!("no line contains {}", self.replacements[i].key),
            });
        }
        Ok(out)
    }

    /// Rewrite the file in place and return the guard that undoes it.
    pub fn apply(&self, registry: Option<&ShutdownRegistry>) -> Result<PatchGuard> {
        let original = std::fs::read(&self.path).map_err(|e| self.error(e))?;
        let text = String::from_utf8(original.clone())
            .map_err(|_| self.error("file is not valid UTF-8"))?;
        let patched = self.apply_to(&text)?;

        if let Some(registry) = registry {
            registry.track_restore(&self.path, original.clone());
        }
        let guard = PatchGuard {
            path: self.path.clone(),
            original,
            registry: registry.cloned(),
            reverted: false,
        };
        std::fs::write(&self.path, patched).map_err(|e| self.error(e))?;
        log::info!(
            "patched {} ({} replacement(s))",
            self.path.display(),
            self.replacements.len()
        );
        Ok(guard)
    }

    fn error(&self, detail: impl std::fmt::Display) -> DoatError {
        DoatError::Mutation {
            path: self.path.clone(),
            detail: detail.to_string(),
        }
    }
}

fn split_ending(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

/// Restores a patched file to its original bytes.
#[derive(Debug)]
pub struct PatchGuard {
    path: PathBuf,
    original: Vec<u8>,
    registry: Option<ShutdownRegistry>,
    reverted: bool,
}

impl PatchGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_reverted(&self) -> bool {
        self.reverted
    }

    /// Put the original content back. Safe to call more than once.
    pub fn revert(&mut self) -> Result<()> {
        if self.reverted {
            return Ok(());
        }
        std::fs::write(&self.path, &self.original).map_err(|e| DoatError::Mutation {
            path: self.path.clone(),
            detail: format!("revert failed: {e}"),
        })?;
        self.reverted = true;
        if let Some(registry) = &self.registry {
            registry.release_restore(&self.path);
        }
        log::info!("restored {}", self.path.display());
        Ok(())
    }
}

impl Drop for PatchGuard {
    fn drop(&mut self) {
        if let Err(e) = self.revert() {
            log::error!("{e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Memory optimisation step
// ---------------------------------------------------------------------------

/// Mempool settings read from `rte_config.h`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolSettings {
    pub ops_line: Option<String>,
    pub cache_size: Option<u32>,
}

impl MempoolSettings {
    /// The step only applies to builds using the ring mempool driver.
    pub fn uses_ring(&self) -> bool {
        self.ops_line.as_deref().is_some_and(|l| l.contains(RING_OPS))
    }
}

/// First `RTE_MBUF_DEFAULT_MEMPOOL_OPS` line and the digits of the first
/// `RTE_MEMPOOL_CACHE_MAX_SIZE` line.
pub fn inspect_mempool(text: &str) -> MempoolSettings {
    let ops_line = text
        .lines()
        .find(|l| l.contains(MEMPOOL_OPS_KEY))
        .map(|l| l.trim().to_string());
    let cache_size = text
        .lines()
        .find(|l| l.contains(MEMPOOL_CACHE_KEY))
        .and_then(|l| l.split_once(MEMPOOL_CACHE_KEY))
        .and_then(|(_, rest)| {
            let digits: String = rest.chars().filter(char::is_ascii_digit).collect();
            digits.parse().ok()
        });
    MempoolSettings {
        ops_line,
        cache_size,
    }
}

/// The planned mutation and what it replaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryOptimisation {
    pub patch: ConfigPatch,
    pub original_cache: Option<u32>,
    pub new_cache: Option<u32>,
}

pub fn rte_config_path(dpdk_location: &Path) -> PathBuf {
    dpdk_location.join("config").join("rte_config.h")
}

/// Plan the stack-mempool switch for `config`, or `None` when optimisation
/// or its memory step is off, or the build does not use ring mempools.
pub fn plan_memory_optimisation(config: &RunConfig) -> Result<Option<MemoryOptimisation>> {
    if !(config.optimisation.enabled && config.optimisation.mem_op) {
        return Ok(None);
    }
    let path = rte_config_path(&config.app.dpdk_location);
    let text = std::fs::read_to_string(&path).map_err(|e| DoatError::Mutation {
        path: path.clone(),
        detail: e.to_string(),
    })?;
    let settings = inspect_mempool(&text);
    if !settings.uses_ring() {
        log::warn!(
            "memory optimisation step disabled: {MEMPOOL_OPS_KEY} is not set to \"{RING_OPS}\""
        );
        return Ok(None);
    }

    let mut patch = ConfigPatch::new(path).replace(
        MEMPOOL_OPS_KEY,
        format!("#define {MEMPOOL_OPS_KEY} \"stack\""),
    );
    let new_cache = config.optimisation.cache_adjust.then_some(config.optimisation.new_cache);
    if let Some(size) = new_cache {
        patch = patch.replace(MEMPOOL_CACHE_KEY, format!("#define {MEMPOOL_CACHE_KEY} {size}"));
        log::info!(
            "mempool cache will be adjusted: {size} (was {})",
            settings
                .cache_size
                .map_or_else(|| "unset".to_string(), |s| s.to_string())
        );
    }
    Ok(Some(MemoryOptimisation {
        patch,
        original_cache: settings.cache_size,
        new_cache,
    }))
}
