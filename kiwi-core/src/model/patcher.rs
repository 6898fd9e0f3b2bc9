//! The patcher graph and its change tracking.
//!
//! All mutations go through [`Patcher::apply_op`], which applies one [`Op`],
//! updates the change bits observers read, and optionally records the op so
//! the document layer can commit it. Recorded ops always carry the value that
//! was actually replaced, so their inverse restores the exact prior state even
//! when the op came from a stale remote view.

use std::sync::Arc;

use uuid::Uuid;

use crate::model::{Factory, Link, ModelError, Object, Parameter, Point, Size, Status};
use crate::transaction::{Op, Transaction};

/// Prior state saved while a transaction is applied.
#[derive(Debug)]
enum Undo {
    Object { index: usize, object: Object },
    InsertedObject(Uuid),
    RemovedObject { index: usize, object: Object },
    InsertedLink(Uuid),
    RemovedLink { index: usize, link: Link },
}

/// Patcher-level observation state at the start of a transaction.
struct Observed {
    name: String,
    name_before: Option<String>,
    links_changed: bool,
    removed_objects: Vec<Object>,
    removed_links: Vec<Link>,
}

#[derive(Debug, Clone)]
pub struct Patcher {
    name: String,
    objects: Vec<Object>,
    links: Vec<Link>,
    factory: Arc<Factory>,

    /// Ops applied locally since the last commit
    pending: Vec<Op>,

    // Observation state, reset by clear_changes()
    removed_objects: Vec<Object>,
    removed_links: Vec<Link>,
    name_before: Option<String>,
    links_changed: bool,
}

impl Default for Patcher {
    fn default() -> Self {
        Self::new(Arc::new(Factory::with_builtin_classes()))
    }
}

impl Patcher {
    pub fn new(factory: Arc<Factory>) -> Self {
        Self {
            name: String::new(),
            objects: Vec::new(),
            links: Vec::new(),
            factory,
            pending: Vec::new(),
            removed_objects: Vec::new(),
            removed_links: Vec::new(),
            name_before: None,
            links_changed: false,
        }
    }

    pub fn factory(&self) -> &Arc<Factory> {
        &self.factory
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn objects(&self) -> &[Object] {
        &self.objects
    }

    pub fn object(&self, id: Uuid) -> Option<&Object> {
        self.objects.iter().find(|o| o.id == id)
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn link(&self, id: Uuid) -> Option<&Link> {
        self.links.iter().find(|l| l.id == id)
    }

    pub fn links_of(&self, object: Uuid) -> impl Iterator<Item = &Link> {
        self.links.iter().filter(move |l| l.touches(object))
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.links.is_empty()
    }

    pub fn io_description(&self, id: Uuid, is_inlet: bool, index: usize) -> Option<String> {
        self.object(id)
            .map(|object| self.factory.io_description(object, is_inlet, index))
    }

    fn object_index(&self, id: Uuid) -> Option<usize> {
        self.objects.iter().position(|o| o.id == id)
    }

    fn object_mut(&mut self, id: Uuid) -> Option<&mut Object> {
        self.objects.iter_mut().find(|o| o.id == id)
    }

    // ---------------------------------------------------------------------
    // Local edits. Each one records its ops for the next commit.
    // ---------------------------------------------------------------------

    /// Create an object from its text. The first atom names the class.
    pub fn add_object(&mut self, text: &str) -> Result<Uuid, ModelError> {
        self.add_object_at(text, Point::default())
    }

    pub fn add_object_at(&mut self, text: &str, position: Point) -> Result<Uuid, ModelError> {
        let mut object = self.factory.create_from_text(text)?;
        object.position = position;
        let id = object.id;
        self.apply_op(Op::InsertObject { object }, true)?;
        Ok(id)
    }

    /// Replace `old` by an object built from `text` at the same position.
    /// Links whose pins still exist on the new object are re-created.
    pub fn replace_object(&mut self, old: Uuid, text: &str) -> Result<Uuid, ModelError> {
        let previous = self.object(old).ok_or(ModelError::ObjectNotFound(old))?;
        let mut object = self.factory.create_from_text(text)?;
        object.position = previous.position;
        if object.has_flag(crate::model::ObjectFlag::DefinedSize) {
            object.size = object.clamp_size(previous.size);
        }
        let new = object.id;

        let relinks: Vec<Link> = self.links_of(old).cloned().collect();
        self.remove_object(old)?;
        self.apply_op(Op::InsertObject { object }, true)?;

        for link in relinks {
            let sender = if link.sender == old { new } else { link.sender };
            let receiver = if link.receiver == old { new } else { link.receiver };
            self.add_link(sender, link.outlet, receiver, link.inlet);
        }
        Ok(new)
    }

    /// Remove an object and every link attached to it.
    pub fn remove_object(&mut self, id: Uuid) -> Result<(), ModelError> {
        let object = self
            .object(id)
            .ok_or(ModelError::ObjectNotFound(id))?
            .detached();
        self.apply_op(Op::RemoveObject { object }, true)?;
        Ok(())
    }

    /// Whether a link may join these pins: both objects exist, indices are in
    /// range, the link is not a duplicate and the inlet accepts the outlet type.
    pub fn can_connect(&self, sender: Uuid, outlet: usize, receiver: Uuid, inlet: usize) -> bool {
        let (Some(from), Some(to)) = (self.object(sender), self.object(receiver)) else {
            return false;
        };
        let (Some(out_pin), Some(in_pin)) = (from.outlet(outlet), to.inlet(inlet)) else {
            return false;
        };
        if !in_pin.accepts(out_pin.pin_type()) {
            return false;
        }
        !self.links.iter().any(|l| {
            l.sender == sender && l.outlet == outlet && l.receiver == receiver && l.inlet == inlet
        })
    }

    pub fn add_link(
        &mut self,
        sender: Uuid,
        outlet: usize,
        receiver: Uuid,
        inlet: usize,
    ) -> Option<Uuid> {
        if !self.can_connect(sender, outlet, receiver, inlet) {
            return None;
        }
        let pin_type = self.object(sender)?.outlet(outlet)?.pin_type();
        let link = Link::new(sender, outlet, receiver, inlet, pin_type);
        let id = link.id;
        match self.apply_op(Op::InsertLink { link }, true) {
            Ok(true) => Some(id),
            _ => None,
        }
    }

    pub fn remove_link(&mut self, id: Uuid) -> Result<(), ModelError> {
        let link = self.link(id).ok_or(ModelError::LinkNotFound(id))?.detached();
        self.apply_op(Op::RemoveLink { link }, true)?;
        Ok(())
    }

    pub fn set_position(&mut self, id: Uuid, position: Point) -> Result<(), ModelError> {
        let from = self.object(id).ok_or(ModelError::ObjectNotFound(id))?.position;
        self.apply_op(Op::SetPosition { id, from, to: position }, true)?;
        Ok(())
    }

    pub fn set_size(&mut self, id: Uuid, size: Size) -> Result<(), ModelError> {
        let from = self.object(id).ok_or(ModelError::ObjectNotFound(id))?.size;
        self.apply_op(Op::SetSize { id, from, to: size }, true)?;
        Ok(())
    }

    /// Set a replicated attribute declared by the object's class.
    pub fn set_attribute(&mut self, id: Uuid, name: &str, value: Parameter) -> Result<(), ModelError> {
        let object = self.object(id).ok_or(ModelError::ObjectNotFound(id))?;
        let from = object
            .attribute(name)
            .cloned()
            .ok_or_else(|| ModelError::InvalidAttribute {
                class: object.name.clone(),
                name: name.to_string(),
            })?;
        self.apply_op(
            Op::SetAttribute {
                id,
                name: name.to_string(),
                from,
                to: value,
            },
            true,
        )?;
        Ok(())
    }

    /// Set a local parameter. Parameters are not recorded or replicated.
    pub fn set_parameter(&mut self, id: Uuid, name: &str, value: Parameter) -> Result<(), ModelError> {
        let factory = Arc::clone(&self.factory);
        let object = self.object_mut(id).ok_or(ModelError::ObjectNotFound(id))?;
        let declared = factory
            .class_by_name(&object.name)
            .and_then(|class| class.parameter(name))
            .ok_or_else(|| ModelError::InvalidParameter(format!("{} has no parameter {}", object.name, name)))?;
        if declared.default.kind() != value.kind() {
            return Err(ModelError::InvalidParameter(format!(
                "{} expects {}",
                name,
                declared.default.kind().as_str()
            )));
        }
        object.set_parameter(name, value);
        Ok(())
    }

    pub fn set_name(&mut self, name: &str) {
        let from = self.name.clone();
        // SetName cannot fail
        let _ = self.apply_op(
            Op::SetName {
                from,
                to: name.to_string(),
            },
            true,
        );
    }

    // ---------------------------------------------------------------------
    // Op application
    // ---------------------------------------------------------------------

    /// Apply one op. Returns `Ok(false)` when the op is a no-op or its target
    /// no longer exists, and an error when the op is structurally invalid.
    pub fn apply_op(&mut self, op: Op, record: bool) -> Result<bool, ModelError> {
        let mut applied = Vec::new();
        let changed = self.apply_logged(op, &mut applied, &mut Vec::new())?;
        if record {
            self.pending.append(&mut applied);
        }
        Ok(changed)
    }

    /// Apply `op`, pushing the ops actually applied to `applied` and the
    /// prior state of whatever they touched to `journal`.
    fn apply_logged(
        &mut self,
        op: Op,
        applied: &mut Vec<Op>,
        journal: &mut Vec<Undo>,
    ) -> Result<bool, ModelError> {
        let done = match op {
            Op::InsertObject { object } => self.insert_object(object, journal)?,
            Op::RemoveObject { object } => self.remove_object_op(object.id, applied, journal)?,
            Op::InsertLink { link } => self.insert_link(link, journal)?,
            Op::RemoveLink { link } => self.remove_link_op(link.id, journal),
            Op::SetPosition { id, to, .. } => {
                if !to.is_finite() {
                    return Err(ModelError::InvalidParameter("position must be finite".into()));
                }
                self.object_logged(id, journal).and_then(|object| {
                    let from = object.position;
                    object.set_position(to).then_some(Op::SetPosition { id, from, to })
                })
            }
            Op::SetSize { id, to, .. } => {
                if !to.is_finite() {
                    return Err(ModelError::InvalidParameter("size must be finite".into()));
                }
                self.object_logged(id, journal).and_then(|object| {
                    let from = object.size;
                    object.set_size(to).then(|| Op::SetSize {
                        id,
                        from,
                        to: object.size,
                    })
                })
            }
            Op::SetAttribute { id, name, to, .. } => self.set_attribute_op(id, name, to, journal)?,
            Op::SetName { to, .. } => {
                if self.name == to {
                    None
                } else {
                    let from = std::mem::replace(&mut self.name, to.clone());
                    self.name_before.get_or_insert_with(|| from.clone());
                    Some(Op::SetName { from, to })
                }
            }
        };

        match done {
            Some(op) => {
                applied.push(op);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Mutable access to an object after saving its current state.
    fn object_logged(&mut self, id: Uuid, journal: &mut Vec<Undo>) -> Option<&mut Object> {
        let index = self.object_index(id)?;
        journal.push(Undo::Object {
            index,
            object: self.objects[index].clone(),
        });
        Some(&mut self.objects[index])
    }

    fn insert_object(&mut self, object: Object, journal: &mut Vec<Undo>) -> Result<Option<Op>, ModelError> {
        if self.object_index(object.id).is_some() {
            return Ok(None);
        }
        if !object.position.is_finite() || !object.size.is_finite() {
            return Err(ModelError::InvalidParameter("bounds must be finite".into()));
        }
        self.factory.check(&object)?;

        let mut inserted = object.detached();
        inserted.status = Status::Added;
        self.removed_objects.retain(|o| o.id != inserted.id);
        journal.push(Undo::InsertedObject(inserted.id));
        self.objects.push(inserted);
        Ok(Some(Op::InsertObject {
            object: object.detached(),
        }))
    }

    fn remove_object_op(
        &mut self,
        id: Uuid,
        applied: &mut Vec<Op>,
        journal: &mut Vec<Undo>,
    ) -> Result<Option<Op>, ModelError> {
        let Some(index) = self.object_index(id) else {
            return Ok(None);
        };

        let attached: Vec<Link> = self.links_of(id).cloned().collect();
        for link in attached {
            self.apply_logged(Op::RemoveLink { link }, applied, journal)?;
        }

        let mut removed = self.objects.remove(index);
        let op = Op::RemoveObject {
            object: removed.detached(),
        };
        journal.push(Undo::RemovedObject {
            index,
            object: removed.clone(),
        });
        removed.status = Status::Removed;
        self.removed_objects.push(removed);
        Ok(Some(op))
    }

    fn insert_link(&mut self, link: Link, journal: &mut Vec<Undo>) -> Result<Option<Op>, ModelError> {
        if self.link(link.id).is_some() {
            return Ok(None);
        }
        let (Some(sender), Some(receiver)) = (self.object(link.sender), self.object(link.receiver))
        else {
            return Ok(None);
        };
        let outlet = sender.outlet(link.outlet).ok_or_else(|| {
            ModelError::InvalidLink(format!("{} has no outlet {}", sender.name, link.outlet))
        })?;
        let inlet = receiver.inlet(link.inlet).ok_or_else(|| {
            ModelError::InvalidLink(format!("{} has no inlet {}", receiver.name, link.inlet))
        })?;
        if !inlet.accepts(outlet.pin_type()) {
            return Err(ModelError::InvalidLink(format!(
                "{} inlet {} does not accept {}",
                receiver.name,
                link.inlet,
                outlet.pin_type().as_str()
            )));
        }
        if self.links.iter().any(|l| l.same_endpoints(&link)) {
            return Ok(None);
        }

        let mut inserted = link.detached();
        inserted.pin_type = outlet.pin_type();
        let op = Op::InsertLink {
            link: inserted.clone(),
        };
        inserted.status = Status::Added;
        self.removed_links.retain(|l| l.id != inserted.id);
        journal.push(Undo::InsertedLink(inserted.id));
        self.links.push(inserted);
        self.links_changed = true;
        Ok(Some(op))
    }

    fn remove_link_op(&mut self, id: Uuid, journal: &mut Vec<Undo>) -> Option<Op> {
        let index = self.links.iter().position(|l| l.id == id)?;
        let mut removed = self.links.remove(index);
        let op = Op::RemoveLink {
            link: removed.detached(),
        };
        journal.push(Undo::RemovedLink {
            index,
            link: removed.clone(),
        });
        removed.status = Status::Removed;
        self.removed_links.push(removed);
        self.links_changed = true;
        Some(op)
    }

    fn set_attribute_op(
        &mut self,
        id: Uuid,
        name: String,
        to: Parameter,
        journal: &mut Vec<Undo>,
    ) -> Result<Option<Op>, ModelError> {
        let Some(object) = self.object(id) else {
            return Ok(None);
        };
        let declared = self
            .factory
            .class_by_name(&object.name)
            .and_then(|class| class.attribute(&name));
        if declared.map(|d| d.default.kind()) != Some(to.kind()) {
            return Err(ModelError::InvalidAttribute {
                class: object.name.clone(),
                name,
            });
        }
        if object.attribute(&name) == Some(&to) {
            return Ok(None);
        }

        let Some(object) = self.object_logged(id, journal) else {
            return Ok(None);
        };
        let from = object.attribute(&name).cloned().unwrap_or_else(|| to.clone());
        object.set_attribute(&name, to.clone());
        Ok(Some(Op::SetAttribute { id, name, from, to }))
    }

    /// Apply a whole transaction without recording it. Either every op is
    /// applied or, on the first invalid op, the patcher is left unchanged.
    pub fn apply(&mut self, tx: &Transaction) -> Result<(), ModelError> {
        self.apply_ops(&tx.ops, false)
    }

    /// As [`apply`](Self::apply), recording the ops actually applied.
    pub fn apply_recorded(&mut self, tx: &Transaction) -> Result<(), ModelError> {
        self.apply_ops(&tx.ops, true)
    }

    fn apply_ops(&mut self, ops: &[Op], record: bool) -> Result<(), ModelError> {
        let observed = Observed {
            name: self.name.clone(),
            name_before: self.name_before.clone(),
            links_changed: self.links_changed,
            removed_objects: self.removed_objects.clone(),
            removed_links: self.removed_links.clone(),
        };
        let mut applied = Vec::new();
        let mut journal = Vec::new();
        for op in ops {
            if let Err(e) = self.apply_logged(op.clone(), &mut applied, &mut journal) {
                self.roll_back(journal, observed);
                return Err(e);
            }
        }
        if record {
            self.pending.append(&mut applied);
        }
        Ok(())
    }

    /// Undo journaled changes, newest first.
    fn roll_back(&mut self, journal: Vec<Undo>, observed: Observed) {
        for undo in journal.into_iter().rev() {
            match undo {
                Undo::Object { index, object } => self.objects[index] = object,
                Undo::InsertedObject(id) => {
                    if let Some(index) = self.object_index(id) {
                        self.objects.remove(index);
                    }
                }
                Undo::RemovedObject { index, object } => self.objects.insert(index, object),
                Undo::InsertedLink(id) => self.links.retain(|l| l.id != id),
                Undo::RemovedLink { index, link } => self.links.insert(index, link),
            }
        }
        self.name = observed.name;
        self.name_before = observed.name_before;
        self.links_changed = observed.links_changed;
        self.removed_objects = observed.removed_objects;
        self.removed_links = observed.removed_links;
    }

    /// Check that `tx` would apply cleanly, without changing `self`.
    pub fn validate(&self, tx: &Transaction) -> Result<(), ModelError> {
        let mut scratch = self.clone();
        scratch.clear_changes();
        scratch.apply(tx)
    }

    // ---------------------------------------------------------------------
    // Pending ops
    // ---------------------------------------------------------------------

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending(&self) -> &[Op] {
        &self.pending
    }

    pub fn take_pending(&mut self) -> Vec<Op> {
        std::mem::take(&mut self.pending)
    }

    // ---------------------------------------------------------------------
    // Change queries
    // ---------------------------------------------------------------------

    pub fn objects_changed(&self) -> bool {
        !self.removed_objects.is_empty() || self.objects.iter().any(Object::is_changed)
    }

    pub fn links_changed(&self) -> bool {
        self.links_changed
    }

    pub fn name_changed(&self) -> bool {
        self.name_before.is_some()
    }

    pub fn name_before(&self) -> &str {
        self.name_before.as_deref().unwrap_or(&self.name)
    }

    pub fn has_changes(&self) -> bool {
        self.objects_changed() || self.links_changed() || self.name_changed()
    }

    pub fn added_objects(&self) -> impl Iterator<Item = &Object> {
        self.objects.iter().filter(|o| o.is_added())
    }

    /// Objects removed in the current transaction, with their last values.
    pub fn removed_objects(&self) -> &[Object] {
        &self.removed_objects
    }

    pub fn added_links(&self) -> impl Iterator<Item = &Link> {
        self.links.iter().filter(|l| l.is_added())
    }

    pub fn removed_links(&self) -> &[Link] {
        &self.removed_links
    }

    /// End an observation pass: reset change bits and purge tombstones.
    pub fn clear_changes(&mut self) {
        for object in &mut self.objects {
            object.clear_changes();
        }
        for link in &mut self.links {
            link.status = Status::Resident;
        }
        self.removed_objects.clear();
        self.removed_links.clear();
        self.name_before = None;
        self.links_changed = false;
    }

    /// Replace the whole content with `other`'s, reporting every current
    /// object as removed and every new one as added.
    pub fn reset_to(&mut self, other: &Patcher) {
        for mut object in self.objects.drain(..) {
            object.status = Status::Removed;
            self.removed_objects.push(object);
        }
        for mut link in self.links.drain(..) {
            link.status = Status::Removed;
            self.removed_links.push(link);
        }
        self.objects = other.objects.iter().map(Object::detached).collect();
        for object in &mut self.objects {
            object.status = Status::Added;
        }
        self.links = other.links.iter().map(Link::detached).collect();
        for link in &mut self.links {
            link.status = Status::Added;
        }
        if self.name != other.name {
            let from = std::mem::replace(&mut self.name, other.name.clone());
            self.name_before.get_or_insert(from);
        }
        self.links_changed = true;
        self.pending.clear();
    }
}
