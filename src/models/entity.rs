//! Catalog entities: restaurants, dishes/categories and scoped attributes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumIter, EnumString};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::normalize::{clean_aliases, clean_name, fold_name, merge_aliases};

/// Kind of catalog row. Immutable once the row exists.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityType {
    Restaurant,
    DishOrCategory,
    DishAttribute,
    RestaurantAttribute,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Restaurant => "restaurant",
            Self::DishOrCategory => "dish_or_category",
            Self::DishAttribute => "dish_attribute",
            Self::RestaurantAttribute => "restaurant_attribute",
        }
    }

    pub fn is_attribute(&self) -> bool {
        matches!(self, Self::DishAttribute | Self::RestaurantAttribute)
    }
}

/// A unified catalog row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub aliases: Vec<String>,

    // Restaurant-only fields; empty/None for every other kind.
    pub restaurant_attributes: Vec<Uuid>,
    pub restaurant_quality_score: f64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address: Option<String>,
    pub google_place_id: Option<String>,
    pub restaurant_metadata: Map<String, Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn is(&self, kind: EntityType) -> bool {
        self.entity_type == kind
    }

    /// Case-insensitive substring on the name, or exact match on an alias.
    pub fn matches_name_or_alias(&self, term: &str) -> bool {
        fold_name(&self.name).contains(&fold_name(term)) || self.aliases.iter().any(|a| a == term)
    }

    pub fn from_draft(draft: &NewEntity, entity_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            entity_id,
            name: draft.name.clone(),
            entity_type: draft.entity_type,
            aliases: draft.aliases.clone(),
            restaurant_attributes: draft.restaurant_attributes.clone(),
            restaurant_quality_score: draft.restaurant_quality_score.unwrap_or(0.0),
            latitude: draft.latitude,
            longitude: draft.longitude,
            address: draft.address.clone(),
            google_place_id: draft.google_place_id.clone(),
            restaurant_metadata: draft.restaurant_metadata.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Upsert merge rule for a later draft with the same `(type, name)`.
    ///
    /// Aliases and restaurant attributes are unioned in order, metadata keys
    /// from the draft win, and absent draft fields keep the stored value.
    pub fn absorb(&mut self, draft: &NewEntity, now: DateTime<Utc>) {
        self.aliases = merge_aliases(&self.aliases, &draft.aliases);
        for id in &draft.restaurant_attributes {
            if !self.restaurant_attributes.contains(id) {
                self.restaurant_attributes.push(*id);
            }
        }
        if let Some(score) = draft.restaurant_quality_score {
            self.restaurant_quality_score = score;
        }
        self.latitude = draft.latitude.or(self.latitude);
        self.longitude = draft.longitude.or(self.longitude);
        if draft.address.is_some() {
            self.address = draft.address.clone();
        }
        if draft.google_place_id.is_some() {
            self.google_place_id = draft.google_place_id.clone();
        }
        self.restaurant_metadata
            .extend(draft.restaurant_metadata.clone());
        self.updated_at = now;
    }

    /// Overwrite every `Some` field of a validated patch.
    pub fn apply_fields(&mut self, fields: &EntityFields, now: DateTime<Utc>) {
        if let Some(name) = &fields.name {
            self.name = clean_name(name);
        }
        if let Some(aliases) = &fields.aliases {
            self.aliases = clean_aliases(aliases);
        }
        if fields.latitude.is_some() {
            self.latitude = fields.latitude;
        }
        if fields.longitude.is_some() {
            self.longitude = fields.longitude;
        }
        if fields.address.is_some() {
            self.address = fields.address.clone();
        }
        if fields.google_place_id.is_some() {
            self.google_place_id = fields.google_place_id.clone();
        }
        if let Some(metadata) = &fields.restaurant_metadata {
            self.restaurant_metadata = metadata.clone();
        }
        if let Some(score) = fields.restaurant_quality_score {
            self.restaurant_quality_score = score;
        }
        if let Some(attributes) = &fields.restaurant_attributes {
            self.restaurant_attributes = attributes.clone();
        }
        self.updated_at = now;
    }
}

/// Shared create/update payload for every kind.
///
/// All fields are optional so the same shape can carry partial updates;
/// [`EntityFields::into_new_entity`] and [`EntityFields::validate_patch`]
/// decide which fields a kind may use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityFields {
    pub name: Option<String>,
    pub aliases: Option<Vec<String>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address: Option<String>,
    pub google_place_id: Option<String>,
    pub restaurant_metadata: Option<Map<String, Value>>,
    pub restaurant_quality_score: Option<f64>,
    pub restaurant_attributes: Option<Vec<Uuid>>,
}

impl EntityFields {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = Some(aliases.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_coordinates(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_google_place_id(mut self, place_id: impl Into<String>) -> Self {
        self.google_place_id = Some(place_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.restaurant_metadata = Some(metadata);
        self
    }

    pub fn with_quality_score(mut self, score: f64) -> Self {
        self.restaurant_quality_score = Some(score);
        self
    }

    pub fn with_restaurant_attributes(mut self, attributes: Vec<Uuid>) -> Self {
        self.restaurant_attributes = Some(attributes);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Populated fields that only a restaurant may carry.
    pub fn restaurant_only_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.latitude.is_some() {
            fields.push("latitude");
        }
        if self.longitude.is_some() {
            fields.push("longitude");
        }
        if self.address.is_some() {
            fields.push("address");
        }
        if self.google_place_id.is_some() {
            fields.push("google_place_id");
        }
        if self.restaurant_metadata.is_some() {
            fields.push("restaurant_metadata");
        }
        if self.restaurant_quality_score.is_some() {
            fields.push("restaurant_quality_score");
        }
        if self.restaurant_attributes.is_some() {
            fields.push("restaurant_attributes");
        }
        fields
    }

    fn missing_location(&self) -> Vec<&'static str> {
        let has_address = self
            .address
            .as_deref()
            .is_some_and(|a| !a.trim().is_empty());
        match (self.latitude, self.longitude) {
            (Some(_), Some(_)) => Vec::new(),
            _ if has_address => Vec::new(),
            (Some(_), None) => vec!["longitude"],
            (None, Some(_)) => vec!["latitude"],
            (None, None) => vec!["address or coordinates"],
        }
    }

    fn check_values(&self) -> Result<(), ValidationError> {
        if let Some(lat) = self.latitude {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(ValidationError::InvalidValue {
                    field: "latitude",
                    reason: format!("{lat} is outside [-90, 90]"),
                });
            }
        }
        if let Some(lon) = self.longitude {
            if !(-180.0..=180.0).contains(&lon) {
                return Err(ValidationError::InvalidValue {
                    field: "longitude",
                    reason: format!("{lon} is outside [-180, 180]"),
                });
            }
        }
        if let Some(score) = self.restaurant_quality_score {
            if !score.is_finite() {
                return Err(ValidationError::InvalidValue {
                    field: "restaurant_quality_score",
                    reason: "must be a finite number".to_string(),
                });
            }
        }
        if self
            .google_place_id
            .as_deref()
            .is_some_and(|p| p.trim().is_empty())
        {
            return Err(ValidationError::InvalidValue {
                field: "google_place_id",
                reason: "must not be blank".to_string(),
            });
        }
        Ok(())
    }

    /// Validate for `kind` and build the draft handed to the store.
    pub fn into_new_entity(self, kind: EntityType) -> Result<NewEntity, ValidationError> {
        let name = self
            .name
            .as_deref()
            .map(clean_name)
            .filter(|n| !n.is_empty());

        let mut missing = Vec::new();
        if name.is_none() {
            missing.push("name");
        }
        if kind == EntityType::Restaurant {
            missing.extend(self.missing_location());
        }
        if !missing.is_empty() {
            return Err(ValidationError::MissingFields {
                record: kind.as_str(),
                fields: missing,
            });
        }

        if kind != EntityType::Restaurant {
            let forbidden = self.restaurant_only_fields();
            if !forbidden.is_empty() {
                return Err(ValidationError::ForbiddenFields {
                    record: kind.as_str(),
                    fields: forbidden,
                });
            }
        }
        self.check_values()?;

        Ok(NewEntity {
            entity_type: kind,
            name: name.unwrap_or_default(),
            aliases: clean_aliases(self.aliases.unwrap_or_default()),
            restaurant_attributes: self.restaurant_attributes.unwrap_or_default(),
            restaurant_quality_score: self.restaurant_quality_score,
            latitude: self.latitude,
            longitude: self.longitude,
            address: self.address.map(|a| a.trim().to_string()),
            google_place_id: self.google_place_id,
            restaurant_metadata: self.restaurant_metadata.unwrap_or_default(),
        })
    }

    /// Validate a partial update against the kind it targets.
    pub fn validate_patch(&self, kind: EntityType) -> Result<(), ValidationError> {
        if self
            .name
            .as_deref()
            .is_some_and(|n| clean_name(n).is_empty())
        {
            return Err(ValidationError::InvalidValue {
                field: "name",
                reason: "must not be empty".to_string(),
            });
        }
        if kind != EntityType::Restaurant {
            let forbidden = self.restaurant_only_fields();
            if !forbidden.is_empty() {
                return Err(ValidationError::ForbiddenFields {
                    record: kind.as_str(),
                    fields: forbidden,
                });
            }
        }
        self.check_values()
    }

    /// Copy of the patch with the name and aliases cleaned.
    pub fn normalized(&self) -> Self {
        Self {
            name: self.name.as_deref().map(clean_name),
            aliases: self.aliases.as_ref().map(clean_aliases),
            ..self.clone()
        }
    }
}

/// A validated row ready for insertion. The store assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntity {
    pub entity_type: EntityType,
    pub name: String,
    pub aliases: Vec<String>,
    pub restaurant_attributes: Vec<Uuid>,
    /// `None` keeps the stored score on upsert and defaults to 0 on insert.
    pub restaurant_quality_score: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address: Option<String>,
    pub google_place_id: Option<String>,
    pub restaurant_metadata: Map<String, Value>,
}

impl NewEntity {
    /// Human-readable natural key, used in conflict errors.
    pub fn natural_key(&self) -> String {
        format!("{} ({})", self.name, self.entity_type)
    }
}

/// How an [`EntityQuery`] matches names.
#[derive(Debug, Clone, PartialEq)]
pub enum NameMatch {
    /// Case-insensitive equality on the name.
    ExactIgnoreCase(String),
    /// Case-insensitive substring on the name, or exact alias match.
    NameOrAlias(String),
}

/// Keyset position: the last `(name, entity_id)` of the previous page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityCursor {
    pub name: String,
    pub entity_id: Uuid,
}

impl EntityCursor {
    pub fn after(entity: &Entity) -> Self {
        Self {
            name: entity.name.clone(),
            entity_id: entity.entity_id,
        }
    }
}

/// Entity lookup. Results order by name ascending, quality score descending.
///
/// With `after` set the query is a keyset page instead: rows strictly past
/// the cursor, ordered by `(name, entity_id)` with names compared bytewise.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityQuery {
    pub kind: Option<EntityType>,
    pub name: Option<NameMatch>,
    pub after: Option<EntityCursor>,
    pub limit: Option<i64>,
}

impl EntityQuery {
    pub fn of_kind(kind: EntityType) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn kind_opt(mut self, kind: Option<EntityType>) -> Self {
        self.kind = kind;
        self
    }

    pub fn named_ignore_case(mut self, name: impl Into<String>) -> Self {
        self.name = Some(NameMatch::ExactIgnoreCase(name.into()));
        self
    }

    pub fn name_or_alias(mut self, term: impl Into<String>) -> Self {
        self.name = Some(NameMatch::NameOrAlias(term.into()));
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn after(mut self, cursor: Option<EntityCursor>) -> Self {
        self.after = cursor;
        self
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        if self.kind.is_some_and(|k| entity.entity_type != k) {
            return false;
        }
        if let Some(cursor) = &self.after {
            if (entity.name.as_str(), entity.entity_id) <= (cursor.name.as_str(), cursor.entity_id) {
                return false;
            }
        }
        match &self.name {
            None => true,
            Some(NameMatch::ExactIgnoreCase(name)) => fold_name(&entity.name) == fold_name(name),
            Some(NameMatch::NameOrAlias(term)) => entity.matches_name_or_alias(term),
        }
    }

    /// The ordering every backend applies for this query.
    pub fn sort(&self, entities: &mut [Entity]) {
        if self.after.is_some() {
            entities.sort_by(|a, b| (a.name.as_str(), a.entity_id).cmp(&(b.name.as_str(), b.entity_id)));
            return;
        }
        entities.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| {
                    b.restaurant_quality_score
                        .total_cmp(&a.restaurant_quality_score)
                })
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_every_kind_requires_a_name() {
        for kind in EntityType::iter() {
            let err = EntityFields::named("   ")
                .with_address("1 Main St")
                .into_new_entity(kind)
                .unwrap_err();
            match err {
                ValidationError::MissingFields { fields, record } => {
                    assert!(fields.contains(&"name"));
                    assert_eq!(record, kind.as_str());
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[test]
    fn test_restaurant_requires_location() {
        let err = EntityFields::named("Joe's")
            .into_new_entity(EntityType::Restaurant)
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingFields {
                record: "restaurant",
                fields: vec!["address or coordinates"],
            }
        );

        let err = EntityFields {
            latitude: Some(30.2),
            ..EntityFields::named("Joe's")
        }
        .into_new_entity(EntityType::Restaurant)
        .unwrap_err();
        assert!(matches!(err, ValidationError::MissingFields { fields, .. } if fields == vec!["longitude"]));
    }

    #[test]
    fn test_restaurant_accepts_address_or_coordinates() {
        assert!(EntityFields::named("A")
            .with_address("12 Elm")
            .into_new_entity(EntityType::Restaurant)
            .is_ok());
        assert!(EntityFields::named("B")
            .with_coordinates(30.27, -97.74)
            .into_new_entity(EntityType::Restaurant)
            .is_ok());
    }

    #[test]
    fn test_non_restaurant_rejects_restaurant_fields() {
        let err = EntityFields::named("Tacos")
            .with_address("nowhere")
            .with_quality_score(4.0)
            .into_new_entity(EntityType::DishOrCategory)
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::ForbiddenFields {
                record: "dish_or_category",
                fields: vec!["address", "restaurant_quality_score"],
            }
        );
    }

    #[test]
    fn test_coordinates_are_range_checked() {
        let err = EntityFields::named("Far")
            .with_coordinates(91.0, 0.0)
            .into_new_entity(EntityType::Restaurant)
            .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidValue {
                field: "latitude",
                ..
            }
        ));
    }

    #[test]
    fn test_draft_cleans_name_and_aliases() {
        let draft = EntityFields::named("  Pad   Thai ")
            .with_aliases(["Phad Thai", "phad thai", " "])
            .into_new_entity(EntityType::DishOrCategory)
            .unwrap();
        assert_eq!(draft.name, "Pad Thai");
        assert_eq!(draft.aliases, vec!["Phad Thai".to_string()]);
        assert_eq!(draft.restaurant_quality_score, None);
    }

    #[test]
    fn test_patch_for_attribute_rejects_coordinates() {
        let patch = EntityFields::default().with_coordinates(1.0, 1.0);
        assert!(patch.validate_patch(EntityType::DishAttribute).is_err());
        assert!(patch.validate_patch(EntityType::Restaurant).is_ok());
    }

    #[test]
    fn test_absorb_merges_aliases_and_keeps_absent_fields() {
        let now = Utc::now();
        let first = EntityFields::named("Franklin Barbecue")
            .with_address("900 E 11th St")
            .with_aliases(["Franklin"])
            .into_new_entity(EntityType::Restaurant)
            .unwrap();
        let mut stored = Entity::from_draft(&first, Uuid::new_v4(), now);

        let later = EntityFields::named("Franklin Barbecue")
            .with_coordinates(30.27, -97.73)
            .with_aliases(["franklin", "Franklin BBQ"])
            .into_new_entity(EntityType::Restaurant)
            .unwrap();
        stored.absorb(&later, now);

        assert_eq!(stored.aliases, vec!["Franklin", "Franklin BBQ"]);
        assert_eq!(stored.address.as_deref(), Some("900 E 11th St"));
        assert_eq!(stored.latitude, Some(30.27));
        assert_eq!(stored.restaurant_quality_score, 0.0);
    }

    #[test]
    fn test_entity_type_parses_from_snake_case() {
        let kind: EntityType = "restaurant_attribute".parse().unwrap();
        assert_eq!(kind, EntityType::RestaurantAttribute);
        assert_eq!(kind.to_string(), kind.as_str());
    }
}
