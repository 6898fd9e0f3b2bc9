use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{PinType, Status};

/// Connection from outlet `outlet` of `sender` to inlet `inlet` of `receiver`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub(crate) id: Uuid,
    pub(crate) sender: Uuid,
    pub(crate) outlet: usize,
    pub(crate) receiver: Uuid,
    pub(crate) inlet: usize,
    /// Type of the sender outlet
    pub(crate) pin_type: PinType,
    #[serde(skip)]
    pub(crate) status: Status,
}

impl Link {
    pub(crate) fn new(
        sender: Uuid,
        outlet: usize,
        receiver: Uuid,
        inlet: usize,
        pin_type: PinType,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            outlet,
            receiver,
            inlet,
            pin_type,
            status: Status::Resident,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn sender(&self) -> Uuid {
        self.sender
    }

    pub fn outlet(&self) -> usize {
        self.outlet
    }

    pub fn receiver(&self) -> Uuid {
        self.receiver
    }

    pub fn inlet(&self) -> usize {
        self.inlet
    }

    pub fn is_signal(&self) -> bool {
        self.pin_type == PinType::Signal
    }

    pub fn is_added(&self) -> bool {
        self.status == Status::Added
    }

    pub fn is_removed(&self) -> bool {
        self.status == Status::Removed
    }

    pub fn touches(&self, object: Uuid) -> bool {
        self.sender == object || self.receiver == object
    }

    pub(crate) fn same_endpoints(&self, other: &Link) -> bool {
        self.sender == other.sender
            && self.outlet == other.outlet
            && self.receiver == other.receiver
            && self.inlet == other.inlet
    }

    pub(crate) fn detached(&self) -> Self {
        Self {
            status: Status::Resident,
            ..self.clone()
        }
    }
}
