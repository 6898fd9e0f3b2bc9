//! Version migration of stored documents.
//!
//! Each step upgrades a [`BackendIr`] from one version to the next. Steps are
//! chained until the current model version is reached; the document is
//! checked after every step. A version with no outgoing step fails the whole
//! load rather than opening an empty or half-converted document.
//!
//! ```text
//! v1 ──drop patcher_name──► v2 ──(unchanged)──► v3 ──random inlets, prune links──► v4
//! ```

use std::collections::HashMap;

use kiwi_core::atom::{self, ParsingFlags};
use kiwi_core::model::ir::{stored_inlet_types, stored_outlet_types};
use kiwi_core::model::IrNode;
use kiwi_core::{BackendIr, MODEL_VERSION};

use crate::storage::StoreError;

pub type Transform = fn(&mut BackendIr) -> bool;

/// One `from -> to` migration.
#[derive(Clone)]
pub struct ConverterStep {
    pub from: &'static str,
    pub to: &'static str,
    pub name: &'static str,
    pub transform: Transform,
}

impl std::fmt::Debug for ConverterStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConverterStep")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ConverterChain {
    target: String,
    steps: Vec<ConverterStep>,
}

impl Default for ConverterChain {
    fn default() -> Self {
        Self::new(MODEL_VERSION)
            .with_step(ConverterStep {
                from: "v1",
                to: "v2",
                name: "remove_patcher_name",
                transform: remove_patcher_name,
            })
            .with_step(ConverterStep {
                from: "v2",
                to: "v3",
                name: "unchanged",
                transform: |_| true,
            })
            .with_step(ConverterStep {
                from: "v3",
                to: "v4",
                name: "random_inlets",
                transform: convert_random_inlets,
            })
    }
}

impl ConverterChain {
    /// An empty chain converting towards `target`.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: ConverterStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn steps(&self) -> &[ConverterStep] {
        &self.steps
    }

    /// Whether a document at `version` can be brought to the target.
    pub fn can_convert(&self, version: &str) -> bool {
        self.path(version).is_some()
    }

    fn path(&self, version: &str) -> Option<Vec<&ConverterStep>> {
        let by_source: HashMap<&str, &ConverterStep> =
            self.steps.iter().map(|step| (step.from, step)).collect();
        let mut path = Vec::new();
        let mut current = version;
        while current != self.target {
            let step = by_source.get(current)?;
            if path.len() > self.steps.len() {
                return None;
            }
            path.push(*step);
            current = step.to;
        }
        Some(path)
    }

    /// Upgrade `ir` in place. On error `ir` is left as it was.
    pub fn process(&self, ir: &mut BackendIr) -> Result<(), StoreError> {
        let path = self.path(&ir.version).ok_or_else(|| StoreError::NoMigrationPath {
            from: ir.version.clone(),
            to: self.target.clone(),
        })?;
        if path.is_empty() {
            return Ok(());
        }

        let mut converted = ir.clone();
        for step in path {
            if !(step.transform)(&mut converted) {
                return Err(StoreError::MigrationFailed {
                    step: step.name.to_string(),
                    reason: format!("{} -> {} refused the document", step.from, step.to),
                });
            }
            converted.version = step.to.to_string();
            check_structure(&converted).map_err(|reason| StoreError::MigrationFailed {
                step: step.name.to_string(),
                reason,
            })?;
            log::info!("Converted document {} -> {} ({})", step.from, step.to, step.name);
        }

        *ir = converted;
        Ok(())
    }
}

/// Structural check run between steps.
fn check_structure(ir: &BackendIr) -> Result<(), String> {
    if ir.root.kind != "patcher" {
        return Err(format!("root is {}, expected patcher", ir.root.kind));
    }
    for object in ir.root.nodes("objects") {
        if object.kind != "object" || object.text("id").is_none() || object.text("text").is_none() {
            return Err("object without id or text".to_string());
        }
    }
    for link in ir.root.nodes("links") {
        let complete = link.text("sender").is_some()
            && link.text("receiver").is_some()
            && link.int("outlet").is_some()
            && link.int("inlet").is_some();
        if link.kind != "link" || !complete {
            return Err("link with missing endpoint".to_string());
        }
    }
    Ok(())
}

fn remove_patcher_name(ir: &mut BackendIr) -> bool {
    ir.root.remove("patcher_name");
    true
}

/// `random` lost its seed inlet, and its range inlet when the range is given
/// as an argument. Links left pointing at missing pins are removed.
fn convert_random_inlets(ir: &mut BackendIr) -> bool {
    if let Some(objects) = ir.root.list_mut("objects") {
        for object in objects.iter_mut().filter_map(|o| o.as_node_mut()) {
            convert_random(object);
        }
    }
    remove_invalid_links(ir);
    true
}

fn convert_random(object: &mut IrNode) {
    let atoms = atom::parse(object.text("text").unwrap_or_default(), ParsingFlags::NONE);
    if atoms.first().and_then(|a| a.as_str()) != Some("random") {
        return;
    }
    let has_range = atoms.get(1).is_some_and(|a| a.is_number());
    if let Some(inlets) = object.list_mut("inlets") {
        if inlets.len() == 3 {
            inlets.remove(0);
            if has_range {
                inlets.remove(0);
            }
        }
    }
}

/// Drop links whose objects are gone or whose pin indices are out of range.
fn remove_invalid_links(ir: &mut BackendIr) {
    let pins: HashMap<String, (usize, usize)> = ir
        .root
        .nodes("objects")
        .filter_map(|object| {
            let id = object.text("id")?.to_string();
            Some((id, (stored_inlet_types(object).len(), stored_outlet_types(object).len())))
        })
        .collect();

    let Some(links) = ir.root.list_mut("links") else {
        return;
    };
    let before = links.len();
    links.retain(|link| {
        let Some(link) = link.as_node() else {
            return false;
        };
        let sender = link.text("sender").and_then(|id| pins.get(id));
        let receiver = link.text("receiver").and_then(|id| pins.get(id));
        let outlet = link.int("outlet").and_then(|i| usize::try_from(i).ok());
        let inlet = link.int("inlet").and_then(|i| usize::try_from(i).ok());
        match (sender, outlet, receiver, inlet) {
            (Some(&(_, outlets)), Some(outlet), Some(&(inlets, _)), Some(inlet)) => {
                outlet < outlets && inlet < inlets
            }
            _ => false,
        }
    });
    if links.len() != before {
        log::warn!("Removed {} invalid links", before - links.len());
    }
}
