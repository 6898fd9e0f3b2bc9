//! Object class registry.
//!
//! A class is looked up by its name or one of its aliases, and its constructor
//! turns the parsed argument atoms into the pins and geometry of a new object.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::atom::{self, Atom, ParsingFlags};
use crate::model::{Inlet, ModelError, Object, ObjectFlag, Outlet, Parameter, Size};

/// Pins and geometry produced by a class constructor.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectShape {
    pub inlets: Vec<Inlet>,
    pub outlets: Vec<Outlet>,
    /// Overrides [`Object::DEFAULT_SIZE`]
    pub size: Option<Size>,
    pub min_size: Size,
    pub ratio: f64,
    pub flags: Vec<ObjectFlag>,
}

impl ObjectShape {
    pub fn new(inlets: Vec<Inlet>, outlets: Vec<Outlet>) -> Self {
        Self {
            inlets,
            outlets,
            size: None,
            min_size: Size::default(),
            ratio: 0.0,
            flags: Vec::new(),
        }
    }

    pub fn with_size(mut self, size: Size) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_min_size(mut self, min_size: Size) -> Self {
        self.min_size = min_size;
        self
    }

    pub fn with_ratio(mut self, ratio: f64) -> Self {
        self.ratio = ratio;
        self
    }

    pub fn with_flag(mut self, flag: ObjectFlag) -> Self {
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
        self
    }
}

pub type Constructor = fn(&[Atom]) -> Result<ObjectShape, ModelError>;

/// Tooltip text for pin `index`, inlet when the flag is set.
pub type IoDescriber = fn(&Object, bool, usize) -> String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassFlag {
    /// Hidden from user-facing class listings
    Internal,
    DefinedSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterScope {
    /// Replicated with the document
    Attribute,
    /// Local to one client
    Parameter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterClass {
    pub name: String,
    pub scope: ParameterScope,
    pub default: Parameter,
}

#[derive(Debug, Clone)]
pub struct ObjectClass {
    name: String,
    aliases: Vec<String>,
    flags: Vec<ClassFlag>,
    parameters: Vec<ParameterClass>,
    constructor: Constructor,
    io_description: Option<IoDescriber>,
}

impl ObjectClass {
    pub fn new(name: impl Into<String>, constructor: Constructor) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            flags: Vec::new(),
            parameters: Vec::new(),
            constructor,
            io_description: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn with_flag(mut self, flag: ClassFlag) -> Self {
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, default: Parameter) -> Self {
        self.parameters.push(ParameterClass {
            name: name.into(),
            scope: ParameterScope::Attribute,
            default,
        });
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, default: Parameter) -> Self {
        self.parameters.push(ParameterClass {
            name: name.into(),
            scope: ParameterScope::Parameter,
            default,
        });
        self
    }

    pub fn with_io_description(mut self, describer: IoDescriber) -> Self {
        self.io_description = Some(describer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn has_flag(&self, flag: ClassFlag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn is_internal(&self) -> bool {
        self.has_flag(ClassFlag::Internal)
    }

    pub fn attribute(&self, name: &str) -> Option<&ParameterClass> {
        self.declared(name, ParameterScope::Attribute)
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterClass> {
        self.declared(name, ParameterScope::Parameter)
    }

    fn declared(&self, name: &str, scope: ParameterScope) -> Option<&ParameterClass> {
        self.parameters
            .iter()
            .find(|p| p.scope == scope && p.name == name)
    }
}

/// Registry of object classes.
#[derive(Debug, Clone, Default)]
pub struct Factory {
    classes: Vec<Arc<ObjectClass>>,
    /// Name or alias to index in `classes`
    names: HashMap<String, usize>,
}

impl Factory {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in classes.
    pub fn with_builtin_classes() -> Self {
        let mut factory = Self::new();
        if let Err(err) = super::classes::register_builtins(&mut factory) {
            log::error!("Failed to register builtin classes: {}", err);
        }
        factory
    }

    /// Register `class`. Fails without side effects if its name or an alias is taken.
    pub fn add(&mut self, class: ObjectClass) -> Result<(), ModelError> {
        let mut keys = vec![class.name.clone()];
        keys.extend(class.aliases.iter().cloned());
        for (i, key) in keys.iter().enumerate() {
            if key.is_empty() || self.names.contains_key(key) || keys[..i].contains(key) {
                return Err(ModelError::DuplicateClass(key.clone()));
            }
        }

        let index = self.classes.len();
        self.classes.push(Arc::new(class));
        for key in keys {
            self.names.insert(key, index);
        }
        Ok(())
    }

    pub fn has(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn class_by_name(&self, name: &str) -> Option<&ObjectClass> {
        self.names
            .get(name)
            .and_then(|&index| self.classes.get(index))
            .map(|class| class.as_ref())
    }

    /// Registered names, optionally without aliases or internal classes.
    pub fn names(&self, ignore_aliases: bool, ignore_internals: bool) -> Vec<String> {
        let mut names = Vec::new();
        for class in &self.classes {
            if ignore_internals && class.is_internal() {
                continue;
            }
            names.push(class.name.clone());
            if !ignore_aliases {
                names.extend(class.aliases.iter().cloned());
            }
        }
        names
    }

    /// Build an object of class `name` with a fresh id.
    ///
    /// The object text is normalized to `name args`.
    pub fn create(&self, name: &str, args: &[Atom]) -> Result<Object, ModelError> {
        let class = self
            .class_by_name(name)
            .ok_or_else(|| ModelError::UnknownClass(name.to_string()))?;

        let mut shape = (class.constructor)(args)?;
        if class.has_flag(ClassFlag::DefinedSize) {
            shape = shape.with_flag(ObjectFlag::DefinedSize);
        }

        let mut words = Vec::with_capacity(args.len() + 1);
        words.push(Atom::string(name));
        words.extend_from_slice(args);
        let text = if name == "newbox" && args.is_empty() {
            String::new()
        } else {
            atom::to_string(&words, true)
        };

        let mut object = Object::new(Uuid::new_v4(), class.name.clone(), text, shape);
        for declared in &class.parameters {
            match declared.scope {
                ParameterScope::Attribute => {
                    object
                        .attributes
                        .insert(declared.name.clone(), declared.default.clone());
                }
                ParameterScope::Parameter => {
                    object
                        .parameters
                        .insert(declared.name.clone(), declared.default.clone());
                }
            }
        }
        Ok(object)
    }

    /// Parse `text` and build the object it names. Empty text gives a `newbox`.
    pub fn create_from_text(&self, text: &str) -> Result<Object, ModelError> {
        let atoms = atom::parse(text, ParsingFlags::ALL);
        match atoms.split_first() {
            None => self.create("newbox", &[]),
            Some((Atom::String(name), args)) => self.create(name, args),
            Some(_) => Err(ModelError::UnknownClass(text.to_string())),
        }
    }

    /// Rebuild `object` from its text and check the result has the same pins.
    pub(crate) fn check(&self, object: &Object) -> Result<(), ModelError> {
        let rebuilt = self.create_from_text(&object.text)?;
        if rebuilt.name != object.name
            || rebuilt.inlets != object.inlets
            || rebuilt.outlets != object.outlets
        {
            return Err(ModelError::InvalidArguments {
                class: object.name.clone(),
                reason: "pins do not match the object text".to_string(),
            });
        }
        Ok(())
    }

    pub fn io_description(&self, object: &Object, is_inlet: bool, index: usize) -> String {
        match self
            .class_by_name(&object.name)
            .and_then(|class| class.io_description)
        {
            Some(describe) => describe(object, is_inlet, index),
            None => {
                let kind = if is_inlet { "Inlet" } else { "Outlet" };
                format!("{} {}", kind, index + 1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare(_args: &[Atom]) -> Result<ObjectShape, ModelError> {
        Ok(ObjectShape::new(vec![Inlet::control()], vec![Outlet::control()]))
    }

    #[test]
    fn test_duplicate_name_and_alias_rejected() {
        let mut factory = Factory::new();
        factory
            .add(ObjectClass::new("send", bare).with_alias("s"))
            .unwrap();

        assert_eq!(
            factory.add(ObjectClass::new("send", bare)),
            Err(ModelError::DuplicateClass("send".into()))
        );
        assert_eq!(
            factory.add(ObjectClass::new("sender", bare).with_alias("s")),
            Err(ModelError::DuplicateClass("s".into()))
        );
        assert!(!factory.has("sender"));
    }

    #[test]
    fn test_alias_lookup() {
        let mut factory = Factory::new();
        factory
            .add(ObjectClass::new("send", bare).with_alias("s"))
            .unwrap();

        let object = factory.create("s", &[Atom::string("foo")]).unwrap();
        assert_eq!(object.name(), "send");
        assert_eq!(object.text(), "s foo");
    }

    #[test]
    fn test_names_filters() {
        let mut factory = Factory::new();
        factory
            .add(ObjectClass::new("send", bare).with_alias("s"))
            .unwrap();
        factory
            .add(ObjectClass::new("hidden", bare).with_flag(ClassFlag::Internal))
            .unwrap();

        assert_eq!(factory.names(false, false), vec!["send", "s", "hidden"]);
        assert_eq!(factory.names(true, true), vec!["send"]);
    }

    #[test]
    fn test_declared_defaults_applied() {
        let mut factory = Factory::new();
        factory
            .add(
                ObjectClass::new("box", bare)
                    .with_attribute("color", Parameter::string("red"))
                    .with_parameter("value", Parameter::float(0.5)),
            )
            .unwrap();

        let object = factory.create_from_text("box").unwrap();
        assert_eq!(object.attribute("color"), Some(&Parameter::string("red")));
        assert_eq!(object.parameter("value"), Some(&Parameter::float(0.5)));
        assert!(object.attribute("value").is_none());
    }

    #[test]
    fn test_unknown_class() {
        let factory = Factory::new();
        assert_eq!(
            factory.create_from_text("nope 1").unwrap_err(),
            ModelError::UnknownClass("nope".into())
        );
        assert!(factory.create_from_text("42").is_err());
    }

    #[test]
    fn test_default_io_description() {
        let mut factory = Factory::new();
        factory.add(ObjectClass::new("send", bare)).unwrap();
        let object = factory.create_from_text("send").unwrap();
        assert_eq!(factory.io_description(&object, true, 0), "Inlet 1");
    }
}
