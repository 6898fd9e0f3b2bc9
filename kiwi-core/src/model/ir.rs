//! Backend intermediate representation.
//!
//! An untyped, self-describing tree that documents are persisted as. The
//! version tag is what the migration chain keys on; the tree layout for the
//! current version is:
//!
//! ```text
//! patcher { name, objects: [object], links: [link] }
//! object  { id, name, text, x, y, width, height,
//!           inlets: [inlet { types: [text] }], outlets: [outlet { type }],
//!           attributes: attributes { <name>: parameter { type, value } } }
//! link    { id, sender, outlet, receiver, inlet }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::atom::Atom;
use crate::model::{
    Factory, Link, ModelError, Object, Parameter, ParameterType, Patcher, PinType, Point, Size,
};
use crate::transaction::Op;

/// Version written by this build.
pub const MODEL_VERSION: &str = "v4";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IrValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Atoms(Vec<Atom>),
    List(Vec<IrValue>),
    Node(IrNode),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IrNode {
    pub kind: String,
    pub members: BTreeMap<String, IrValue>,
}

impl IrNode {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            members: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: IrValue) -> Self {
        self.members.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&IrValue> {
        self.members.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: IrValue) {
        self.members.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<IrValue> {
        self.members.remove(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            IrValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            IrValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Numeric member, ints widened.
    pub fn float(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            IrValue::Float(value) => Some(*value),
            IrValue::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn list(&self, name: &str) -> Option<&[IrValue]> {
        match self.get(name)? {
            IrValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn list_mut(&mut self, name: &str) -> Option<&mut Vec<IrValue>> {
        match self.members.get_mut(name)? {
            IrValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn node(&self, name: &str) -> Option<&IrNode> {
        match self.get(name)? {
            IrValue::Node(node) => Some(node),
            _ => None,
        }
    }

    /// Nodes of a list member, skipping other values.
    pub fn nodes<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a IrNode> + 'a {
        self.list(name)
            .unwrap_or_default()
            .iter()
            .filter_map(IrValue::as_node)
    }
}

impl IrValue {
    pub fn as_node(&self) -> Option<&IrNode> {
        match self {
            IrValue::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_node_mut(&mut self) -> Option<&mut IrNode> {
        match self {
            IrValue::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            IrValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Versioned snapshot of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendIr {
    pub version: String,
    pub root: IrNode,
}

fn invalid(reason: impl Into<String>) -> ModelError {
    ModelError::InvalidIr(reason.into())
}

fn uuid_member(node: &IrNode, name: &str) -> Result<Uuid, ModelError> {
    node.text(name)
        .and_then(|text| Uuid::parse_str(text).ok())
        .ok_or_else(|| invalid(format!("{} has no valid {}", node.kind, name)))
}

fn index_member(node: &IrNode, name: &str) -> Result<usize, ModelError> {
    node.int(name)
        .and_then(|value| usize::try_from(value).ok())
        .ok_or_else(|| invalid(format!("{} has no valid {}", node.kind, name)))
}

fn object_to_ir(object: &Object) -> IrNode {
    let inlets = object
        .inlets()
        .iter()
        .map(|inlet| {
            let types = inlet
                .types()
                .iter()
                .map(|t| IrValue::Text(t.as_str().to_string()))
                .collect();
            IrValue::Node(IrNode::new("inlet").with("types", IrValue::List(types)))
        })
        .collect();
    let outlets = object
        .outlets()
        .iter()
        .map(|outlet| {
            IrValue::Node(
                IrNode::new("outlet")
                    .with("type", IrValue::Text(outlet.pin_type().as_str().to_string())),
            )
        })
        .collect();

    let mut attributes = IrNode::new("attributes");
    for (name, value) in object.attributes() {
        attributes.set(
            name.clone(),
            IrValue::Node(
                IrNode::new("parameter")
                    .with("type", IrValue::Text(value.kind().as_str().to_string()))
                    .with("value", IrValue::Atoms(value.value().to_vec())),
            ),
        );
    }

    IrNode::new("object")
        .with("id", IrValue::Text(object.id().to_string()))
        .with("name", IrValue::Text(object.name().to_string()))
        .with("text", IrValue::Text(object.text().to_string()))
        .with("x", IrValue::Float(object.position().x))
        .with("y", IrValue::Float(object.position().y))
        .with("width", IrValue::Float(object.size().width))
        .with("height", IrValue::Float(object.size().height))
        .with("inlets", IrValue::List(inlets))
        .with("outlets", IrValue::List(outlets))
        .with("attributes", IrValue::Node(attributes))
}

fn link_to_ir(link: &Link) -> IrNode {
    IrNode::new("link")
        .with("id", IrValue::Text(link.id().to_string()))
        .with("sender", IrValue::Text(link.sender().to_string()))
        .with("outlet", IrValue::Int(link.outlet() as i64))
        .with("receiver", IrValue::Text(link.receiver().to_string()))
        .with("inlet", IrValue::Int(link.inlet() as i64))
}

fn object_from_ir(node: &IrNode, factory: &Factory) -> Result<Object, ModelError> {
    let text = node.text("text").unwrap_or_default();
    let mut object = factory.create_from_text(text)?;
    object.id = uuid_member(node, "id")?;
    object.position = Point::new(
        node.float("x").unwrap_or_default(),
        node.float("y").unwrap_or_default(),
    );
    if let (Some(width), Some(height)) = (node.float("width"), node.float("height")) {
        object.size = object.clamp_size(Size::new(width, height));
    }
    if !object.position.is_finite() || !object.size.is_finite() {
        return Err(invalid("object bounds must be finite"));
    }

    if let Some(attributes) = node.node("attributes") {
        for (name, value) in &attributes.members {
            let parameter = value
                .as_node()
                .ok_or_else(|| invalid(format!("attribute {name} is not a parameter")))?;
            let kind = parameter
                .text("type")
                .and_then(ParameterType::from_name)
                .ok_or_else(|| invalid(format!("attribute {name} has no valid type")))?;
            let atoms = match parameter.get("value") {
                Some(IrValue::Atoms(atoms)) => atoms.clone(),
                _ => return Err(invalid(format!("attribute {name} has no value"))),
            };
            let value = Parameter::new(kind, atoms)?;
            let declared = object.attribute(name).map(Parameter::kind);
            if declared != Some(kind) {
                return Err(ModelError::InvalidAttribute {
                    class: object.name.clone(),
                    name: name.clone(),
                });
            }
            object.attributes.insert(name.clone(), value);
        }
    }
    Ok(object)
}

/// Pin types stored with an object node, used to check links before the
/// object is rebuilt from its text.
pub fn stored_outlet_types(object: &IrNode) -> Vec<Option<PinType>> {
    object
        .nodes("outlets")
        .map(|outlet| outlet.text("type").and_then(PinType::from_name))
        .collect()
}

pub fn stored_inlet_types(object: &IrNode) -> Vec<Vec<PinType>> {
    object
        .nodes("inlets")
        .map(|inlet| {
            inlet
                .list("types")
                .unwrap_or_default()
                .iter()
                .filter_map(|t| t.as_text().and_then(PinType::from_name))
                .collect()
        })
        .collect()
}

impl Patcher {
    /// Snapshot of the current state at [`MODEL_VERSION`].
    pub fn to_ir(&self) -> BackendIr {
        let objects = self
            .objects()
            .iter()
            .map(|o| IrValue::Node(object_to_ir(o)))
            .collect();
        let links = self
            .links()
            .iter()
            .map(|l| IrValue::Node(link_to_ir(l)))
            .collect();

        BackendIr {
            version: MODEL_VERSION.to_string(),
            root: IrNode::new("patcher")
                .with("name", IrValue::Text(self.name().to_string()))
                .with("objects", IrValue::List(objects))
                .with("links", IrValue::List(links)),
        }
    }

    /// Materialize a snapshot. The snapshot must be at [`MODEL_VERSION`];
    /// objects are rebuilt from their text and every link must be valid.
    pub fn from_ir(ir: &BackendIr, factory: Arc<Factory>) -> Result<Patcher, ModelError> {
        if ir.version != MODEL_VERSION {
            return Err(ModelError::VersionMismatch {
                found: ir.version.clone(),
                expected: MODEL_VERSION.to_string(),
            });
        }
        if ir.root.kind != "patcher" {
            return Err(invalid(format!("unexpected root {}", ir.root.kind)));
        }

        let mut patcher = Patcher::new(Arc::clone(&factory));
        if let Some(name) = ir.root.text("name") {
            patcher.apply_op(
                Op::SetName {
                    from: String::new(),
                    to: name.to_string(),
                },
                false,
            )?;
        }

        for node in ir.root.nodes("objects") {
            let object = object_from_ir(node, &factory)?;
            let id = object.id();
            if !patcher.apply_op(Op::InsertObject { object }, false)? {
                return Err(invalid(format!("duplicate object {id}")));
            }
        }

        for node in ir.root.nodes("links") {
            let id = uuid_member(node, "id")?;
            let sender = uuid_member(node, "sender")?;
            let outlet = index_member(node, "outlet")?;
            let receiver = uuid_member(node, "receiver")?;
            let inlet = index_member(node, "inlet")?;
            if !patcher.can_connect(sender, outlet, receiver, inlet) {
                return Err(ModelError::InvalidLink(format!("link {id} does not fit its objects")));
            }
            let pin_type = patcher
                .object(sender)
                .and_then(|o| o.outlet(outlet))
                .map(|o| o.pin_type())
                .ok_or_else(|| ModelError::InvalidLink(format!("link {id} has no sender outlet")))?;
            let mut link = Link::new(sender, outlet, receiver, inlet, pin_type);
            link.id = id;
            patcher.apply_op(Op::InsertLink { link }, false)?;
        }

        patcher.clear_changes();
        Ok(patcher)
    }
}
