use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::models::{Connection, Entity, EntityType};

/// Where an attribute is used. Part of the attribute's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AttributeScope {
    Dish,
    Restaurant,
}

impl AttributeScope {
    pub fn entity_type(self) -> EntityType {
        match self {
            Self::Dish => EntityType::DishAttribute,
            Self::Restaurant => EntityType::RestaurantAttribute,
        }
    }
}

/// A dish entity together with the menu connection that sells it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MenuItemContext {
    pub entity: Entity,
    pub connection: Connection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryContext {
    pub entity: Entity,
    /// Connections whose `categories` list this entity.
    pub category_usage: u64,
}

/// A `dish_or_category` entity used both ways.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DualPurposeEntity {
    pub entity: Entity,
    pub menu_item_usage: u64,
    pub category_usage: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_maps_to_attribute_kind() {
        assert_eq!(AttributeScope::Dish.entity_type(), EntityType::DishAttribute);
        assert_eq!(
            "restaurant".parse::<AttributeScope>().unwrap().entity_type(),
            EntityType::RestaurantAttribute
        );
    }
}
