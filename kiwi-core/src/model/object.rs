use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::atom::{self, Atom, ParsingFlags};
use crate::model::factory::ObjectShape;
use crate::model::{Inlet, Outlet, Parameter};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn is_finite(&self) -> bool {
        self.width.is_finite() && self.height.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectFlag {
    /// Box size is stored with the object instead of derived from its text
    DefinedSize,
    ResizeWidth,
    ResizeHeight,
}

/// Lifecycle of an object or link within the transaction being observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Resident,
    Added,
    Removed,
}

/// Values as they were before the current transaction.
#[derive(Debug, Clone, PartialEq, Default)]
struct Changes {
    position: Option<Point>,
    size: Option<Size>,
    attributes: BTreeMap<String, Parameter>,
}

impl Changes {
    fn is_empty(&self) -> bool {
        self.position.is_none()
            && self.size.is_none()
            && self.attributes.is_empty()
    }
}

/// A box in the patcher graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub(crate) id: Uuid,
    pub(crate) name: String,
    pub(crate) text: String,
    pub(crate) inlets: Vec<Inlet>,
    pub(crate) outlets: Vec<Outlet>,
    pub(crate) position: Point,
    pub(crate) size: Size,
    pub(crate) min_size: Size,
    pub(crate) ratio: f64,
    pub(crate) flags: Vec<ObjectFlag>,
    pub(crate) attributes: BTreeMap<String, Parameter>,

    /// Local runtime state, never replicated
    #[serde(skip)]
    pub(crate) parameters: BTreeMap<String, Parameter>,
    #[serde(skip)]
    pub(crate) status: Status,
    #[serde(skip)]
    changes: Changes,
}

impl Object {
    pub const DEFAULT_SIZE: Size = Size {
        width: 60.0,
        height: 20.0,
    };

    pub(crate) fn new(id: Uuid, name: String, text: String, shape: ObjectShape) -> Self {
        let mut object = Self {
            id,
            name,
            text,
            inlets: shape.inlets,
            outlets: shape.outlets,
            position: Point::default(),
            size: Self::DEFAULT_SIZE,
            min_size: shape.min_size,
            ratio: shape.ratio,
            flags: shape.flags,
            attributes: BTreeMap::new(),
            parameters: BTreeMap::new(),
            status: Status::Resident,
            changes: Changes::default(),
        };
        object.size = object.clamp_size(shape.size.unwrap_or(Self::DEFAULT_SIZE));
        object
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Registered class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Atoms following the class name in the object text.
    pub fn arguments(&self) -> Vec<Atom> {
        atom::parse(&self.text, ParsingFlags::ALL)
            .into_iter()
            .skip(1)
            .collect()
    }

    pub fn inlets(&self) -> &[Inlet] {
        &self.inlets
    }

    pub fn outlets(&self) -> &[Outlet] {
        &self.outlets
    }

    pub fn inlet(&self, index: usize) -> Option<&Inlet> {
        self.inlets.get(index)
    }

    pub fn outlet(&self, index: usize) -> Option<&Outlet> {
        self.outlets.get(index)
    }

    pub fn position(&self) -> Point {
        self.position
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn min_size(&self) -> Size {
        self.min_size
    }

    /// Height to width ratio, zero when free.
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn flags(&self) -> &[ObjectFlag] {
        &self.flags
    }

    pub fn has_flag(&self, flag: ObjectFlag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn attributes(&self) -> &BTreeMap<String, Parameter> {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&Parameter> {
        self.attributes.get(name)
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.get(name)
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_added(&self) -> bool {
        self.status == Status::Added
    }

    pub fn is_removed(&self) -> bool {
        self.status == Status::Removed
    }

    pub fn is_changed(&self) -> bool {
        self.status != Status::Resident || !self.changes.is_empty()
    }

    pub fn position_changed(&self) -> bool {
        self.changes.position.is_some()
    }

    pub fn size_changed(&self) -> bool {
        self.changes.size.is_some()
    }

    pub fn bounds_changed(&self) -> bool {
        self.position_changed() || self.size_changed()
    }

    /// Pins follow the text, so a new layout arrives as a replacement object.
    pub fn inlets_changed(&self) -> bool {
        self.is_added()
    }

    pub fn outlets_changed(&self) -> bool {
        self.is_added()
    }

    pub fn attribute_changed(&self, name: &str) -> bool {
        self.changes.attributes.contains_key(name)
    }

    /// Text is fixed for the object's lifetime; editing it replaces the object.
    pub fn text_changed(&self) -> bool {
        self.is_added()
    }

    pub fn position_before(&self) -> Point {
        self.changes.position.unwrap_or(self.position)
    }

    pub fn size_before(&self) -> Size {
        self.changes.size.unwrap_or(self.size)
    }

    pub fn attribute_before(&self, name: &str) -> Option<&Parameter> {
        self.changes
            .attributes
            .get(name)
            .or_else(|| self.attributes.get(name))
    }

    pub(crate) fn clamp_size(&self, size: Size) -> Size {
        let width = size.width.max(self.min_size.width).max(0.0);
        let height = if self.ratio > 0.0 {
            width * self.ratio
        } else {
            size.height.max(self.min_size.height).max(0.0)
        };
        Size::new(width, height)
    }

    pub(crate) fn set_position(&mut self, position: Point) -> bool {
        if self.position == position {
            return false;
        }
        self.changes.position.get_or_insert(self.position);
        self.position = position;
        true
    }

    pub(crate) fn set_size(&mut self, size: Size) -> bool {
        let size = self.clamp_size(size);
        if self.size == size {
            return false;
        }
        self.changes.size.get_or_insert(self.size);
        self.size = size;
        true
    }

    pub(crate) fn set_attribute(&mut self, name: &str, value: Parameter) -> bool {
        if self.attributes.get(name) == Some(&value) {
            return false;
        }
        if let Some(before) = self.attributes.insert(name.to_string(), value) {
            self.changes
                .attributes
                .entry(name.to_string())
                .or_insert(before);
        }
        true
    }

    pub(crate) fn set_parameter(&mut self, name: &str, value: Parameter) {
        self.parameters.insert(name.to_string(), value);
    }

    pub(crate) fn clear_changes(&mut self) {
        self.changes = Changes::default();
        if self.status == Status::Added {
            self.status = Status::Resident;
        }
    }

    /// Copy without observation state, as carried by transactions.
    pub(crate) fn detached(&self) -> Self {
        let mut object = self.clone();
        object.status = Status::Resident;
        object.changes = Changes::default();
        object
    }
}
