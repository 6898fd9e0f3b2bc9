use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PinType {
    Control,
    Signal,
}

impl PinType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PinType::Control => "control",
            PinType::Signal => "signal",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "control" => Some(PinType::Control),
            "signal" => Some(PinType::Signal),
            _ => None,
        }
    }
}

/// Input pin: the ordered set of pin types it accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inlet {
    types: Vec<PinType>,
}

impl Inlet {
    /// Duplicates are dropped, first occurrence wins.
    pub fn new(types: impl IntoIterator<Item = PinType>) -> Self {
        let mut unique = Vec::new();
        for pin_type in types {
            if !unique.contains(&pin_type) {
                unique.push(pin_type);
            }
        }
        Self { types: unique }
    }

    pub fn control() -> Self {
        Self::new([PinType::Control])
    }

    pub fn signal() -> Self {
        Self::new([PinType::Signal])
    }

    pub fn types(&self) -> &[PinType] {
        &self.types
    }

    pub fn accepts(&self, pin_type: PinType) -> bool {
        self.types.contains(&pin_type)
    }
}

/// Output pin of exactly one type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outlet {
    pin_type: PinType,
}

impl Outlet {
    pub fn new(pin_type: PinType) -> Self {
        Self { pin_type }
    }

    pub fn control() -> Self {
        Self::new(PinType::Control)
    }

    pub fn signal() -> Self {
        Self::new(PinType::Signal)
    }

    pub fn pin_type(&self) -> PinType {
        self.pin_type
    }
}
