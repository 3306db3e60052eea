//! Entity taxonomy: the record types the client can create while offline.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Kind of remote document a queued write targets.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Customer,
    Quotation,
    SalesOrder,
    Task,
    CheckIn,
}

impl EntityType {
    pub const ALL: [EntityType; 5] = [
        EntityType::Customer,
        EntityType::Quotation,
        EntityType::SalesOrder,
        EntityType::Task,
        EntityType::CheckIn,
    ];

    /// Stable storage key (used in persisted rows).
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Customer => "customer",
            EntityType::Quotation => "quotation",
            EntityType::SalesOrder => "sales_order",
            EntityType::Task => "task",
            EntityType::CheckIn => "check_in",
        }
    }

    /// Remote document type name (path segment of `/api/resource/{doctype}`).
    pub fn doctype(&self) -> &'static str {
        match self {
            EntityType::Customer => "Customer",
            EntityType::Quotation => "Quotation",
            EntityType::SalesOrder => "Sales Order",
            EntityType::Task => "Task",
            EntityType::CheckIn => "Employee Checkin",
        }
    }
}

impl core::fmt::Display for EntityType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::unknown_entity_type(s))
    }
}

/// Compile-time binding between a marker type and its `EntityType`.
///
/// Gateways are generic over this trait so a `CustomerGateway` can only ever
/// write customers.
pub trait Entity: Send + Sync + 'static {
    const ENTITY_TYPE: EntityType;

    /// Field the UI uses as the record's display title.
    const TITLE_FIELD: &'static str;
}

macro_rules! entity_marker {
    ($(#[$doc:meta])* $name:ident, $ty:expr, $title:literal) => {
        $(#[$doc])*
        #[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
        pub struct $name;

        impl Entity for $name {
            const ENTITY_TYPE: EntityType = $ty;
            const TITLE_FIELD: &'static str = $title;
        }
    };
}

entity_marker!(
    /// Customer master record.
    Customer,
    EntityType::Customer,
    "customer_name"
);
entity_marker!(Quotation, EntityType::Quotation, "party_name");
entity_marker!(SalesOrder, EntityType::SalesOrder, "customer");
entity_marker!(Task, EntityType::Task, "subject");
entity_marker!(
    /// Employee check-in captured in the field.
    CheckIn,
    EntityType::CheckIn,
    "employee"
);
