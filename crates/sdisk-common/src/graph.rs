//! Layer-id graph validation
//!
//! A manifest describes its chain twice: by list order and by `parent_id`
//! pointers. Both must describe the same acyclic, bounded chain before any
//! file is fetched or rebuilt.

use std::collections::{HashMap, HashSet};

use crate::error::{DiskError, DiskResult};
use crate::types::RemoteManifest;

/// Safety limit for backing chains, by path or by layer id
pub const MAX_CHAIN_DEPTH: usize = 1000;

/// Parent pointers keyed by layer id
#[derive(Debug, Default)]
pub struct LayerGraph {
    parents: HashMap<String, Option<String>>,
}

impl LayerGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node; duplicate ids are rejected
    pub fn add(&mut self, id: &str, parent: Option<&str>) -> DiskResult<()> {
        if self
            .parents
            .insert(id.to_string(), parent.map(str::to_string))
            .is_some()
        {
            return Err(DiskError::integrity(format!("duplicate layer id {id}")));
        }
        Ok(())
    }

    /// Walk parent pointers from `top` and return the chain from base to top
    pub fn chain_from(&self, top: &str, max_depth: usize) -> DiskResult<Vec<String>> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut current = Some(top.to_string());

        while let Some(id) = current {
            if !visited.insert(id.clone()) {
                return Err(DiskError::integrity(format!(
                    "layer graph has a cycle at {id}"
                )));
            }
            if chain.len() >= max_depth {
                return Err(DiskError::integrity(format!(
                    "layer chain exceeds maximum depth {max_depth}"
                )));
            }
            let parent = self
                .parents
                .get(&id)
                .ok_or_else(|| DiskError::integrity(format!("unknown parent layer {id}")))?;
            chain.push(id);
            current = parent.clone();
        }

        chain.reverse();
        Ok(chain)
    }

    /// Validate a manifest's layer list and return its ids from base to top
    pub fn validate_manifest(manifest: &RemoteManifest) -> DiskResult<Vec<String>> {
        if manifest.layers.is_empty() {
            if manifest.top_layer_id.is_some() || manifest.base_layer_id.is_some() {
                return Err(DiskError::integrity(format!(
                    "manifest for {} names layers but lists none",
                    manifest.name
                )));
            }
            return Ok(Vec::new());
        }

        let mut graph = Self::new();
        for layer in &manifest.layers {
            graph.add(&layer.id, layer.parent_id.as_deref())?;
        }

        let top = manifest.top_layer_id.as_deref().ok_or_else(|| {
            DiskError::integrity(format!("manifest for {} has no top layer", manifest.name))
        })?;
        let chain = graph.chain_from(top, MAX_CHAIN_DEPTH)?;

        let listed = manifest.layer_ids();
        if chain != listed {
            return Err(DiskError::integrity(format!(
                "manifest for {} lists layers out of chain order",
                manifest.name
            )));
        }
        if manifest.base_layer_id.as_deref() != chain.first().map(String::as_str) {
            return Err(DiskError::integrity(format!(
                "manifest for {} has a mismatched base layer",
                manifest.name
            )));
        }
        Ok(chain)
    }
}
