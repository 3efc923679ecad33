//! Restaurant ↔ dish-or-category connections and their engagement metrics

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use super::mention::Mention;

/// Window for `recent_mention_count`.
pub const RECENT_WINDOW_DAYS: i64 = 30;
/// Window for the trending tier.
pub const TRENDING_WINDOW_DAYS: i64 = 7;
/// Mentions inside the trending window needed to be `Trending`.
pub const TRENDING_MIN_MENTIONS: usize = 3;
/// Size of the `top_mentions` snapshot.
pub const TOP_MENTIONS_LIMIT: usize = 5;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActivityLevel {
    Trending,
    Active,
    #[default]
    Normal,
}

/// One entry of the ranked mention snapshot kept on a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopMention {
    pub mention_id: Uuid,
    pub upvotes: i64,
    pub content_excerpt: String,
    pub source_url: String,
    pub created_at: DateTime<Utc>,
}

/// Engagement metrics carried by a connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub mention_count: i64,
    pub total_upvotes: i64,
    /// Distinct communities the mentions came from.
    pub source_diversity: i64,
    pub recent_mention_count: i64,
    pub last_mentioned_at: Option<DateTime<Utc>>,
    pub activity_level: ActivityLevel,
    pub top_mentions: Vec<TopMention>,
    pub dish_quality_score: f64,
}

impl ConnectionMetrics {
    /// Derive metrics from the full mention set of one connection.
    ///
    /// `dish_quality_score` is owned by the external scorer and is left at 0.
    pub fn from_mentions(mentions: &[Mention], now: DateTime<Utc>) -> Self {
        let recent_cutoff = now - Duration::days(RECENT_WINDOW_DAYS);
        let trending_cutoff = now - Duration::days(TRENDING_WINDOW_DAYS);

        let communities: std::collections::HashSet<String> = mentions
            .iter()
            .map(|m| crate::normalize::fold_name(&m.subreddit))
            .collect();
        let recent = mentions
            .iter()
            .filter(|m| m.created_at >= recent_cutoff)
            .count();
        let trending = mentions
            .iter()
            .filter(|m| m.created_at >= trending_cutoff)
            .count();

        let activity_level = if trending >= TRENDING_MIN_MENTIONS {
            ActivityLevel::Trending
        } else if recent > 0 {
            ActivityLevel::Active
        } else {
            ActivityLevel::Normal
        };

        let mut ranked: Vec<&Mention> = mentions.iter().collect();
        ranked.sort_by(|a, b| {
            b.upvotes
                .cmp(&a.upvotes)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        let top_mentions = ranked
            .into_iter()
            .take(TOP_MENTIONS_LIMIT)
            .map(|m| TopMention {
                mention_id: m.mention_id,
                upvotes: m.upvotes,
                content_excerpt: m.content_excerpt.clone(),
                source_url: m.source_url.clone(),
                created_at: m.created_at,
            })
            .collect();

        Self {
            mention_count: mentions.len() as i64,
            total_upvotes: mentions.iter().map(|m| m.upvotes).sum(),
            source_diversity: communities.len() as i64,
            recent_mention_count: recent as i64,
            last_mentioned_at: mentions.iter().map(|m| m.created_at).max(),
            activity_level,
            top_mentions,
            dish_quality_score: 0.0,
        }
    }

    /// Whether these metrics were derived from at least one mention.
    pub fn has_evidence(&self) -> bool {
        self.mention_count > 0 || self.last_mentioned_at.is_some()
    }

    /// Merge a later refresh into stored metrics.
    ///
    /// Cumulative counters never decrease. The windowed snapshot
    /// (`recent_mention_count`, `activity_level`) follows the incoming value
    /// only when it carries mention evidence, so it may decay as mentions
    /// age out of the window but is never reset by an evidence-free draft.
    /// `dish_quality_score` is kept as stored; only a correction changes it.
    pub fn merge_monotone(&self, incoming: &ConnectionMetrics) -> ConnectionMetrics {
        let (recent_mention_count, activity_level) = if incoming.has_evidence() {
            (incoming.recent_mention_count, incoming.activity_level)
        } else {
            (self.recent_mention_count, self.activity_level)
        };
        ConnectionMetrics {
            mention_count: self.mention_count.max(incoming.mention_count),
            total_upvotes: self.total_upvotes.max(incoming.total_upvotes),
            source_diversity: self.source_diversity.max(incoming.source_diversity),
            last_mentioned_at: self.last_mentioned_at.max(incoming.last_mentioned_at),
            recent_mention_count,
            activity_level,
            top_mentions: if incoming.top_mentions.is_empty() {
                self.top_mentions.clone()
            } else {
                incoming.top_mentions.clone()
            },
            dish_quality_score: self.dish_quality_score,
        }
    }
}

/// Relationship between one restaurant and one dish-or-category entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub connection_id: Uuid,
    pub restaurant_id: Uuid,
    pub dish_or_category_id: Uuid,
    /// The dish is sold at this restaurant.
    pub is_menu_item: bool,
    /// Dish-or-category entities this pairing is classified under.
    pub categories: Vec<Uuid>,
    pub dish_attributes: Vec<Uuid>,
    #[serde(flatten)]
    pub metrics: ConnectionMetrics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    /// Apply the pair-upsert merge rule for a later draft of the same pair.
    pub fn absorb(&mut self, draft: &NewConnection, now: DateTime<Utc>) {
        self.is_menu_item |= draft.is_menu_item;
        union_into(&mut self.categories, &draft.categories);
        union_into(&mut self.dish_attributes, &draft.dish_attributes);
        self.metrics = self.metrics.merge_monotone(&draft.metrics);
        self.updated_at = now;
    }

    pub fn apply_patch(&mut self, patch: &ConnectionPatch, now: DateTime<Utc>) {
        if let Some(is_menu_item) = patch.is_menu_item {
            self.is_menu_item = is_menu_item;
        }
        if let Some(categories) = &patch.categories {
            self.categories = categories.clone();
        }
        if let Some(dish_attributes) = &patch.dish_attributes {
            self.dish_attributes = dish_attributes.clone();
        }
        if let Some(metrics) = &patch.metrics {
            self.metrics = metrics.clone();
        }
        self.updated_at = now;
    }
}

fn union_into(target: &mut Vec<Uuid>, incoming: &[Uuid]) {
    for id in incoming {
        if !target.contains(id) {
            target.push(*id);
        }
    }
}

/// Caller-facing payload for [`crate::repository::ConnectionRepository::upsert_by_pair`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionFields {
    pub is_menu_item: bool,
    pub categories: Vec<Uuid>,
    pub dish_attributes: Vec<Uuid>,
    pub metrics: ConnectionMetrics,
}

impl ConnectionFields {
    pub fn menu_item() -> Self {
        Self {
            is_menu_item: true,
            ..Self::default()
        }
    }

    pub fn with_categories(mut self, categories: Vec<Uuid>) -> Self {
        self.categories = categories;
        self
    }

    pub fn with_dish_attributes(mut self, attributes: Vec<Uuid>) -> Self {
        self.dish_attributes = attributes;
        self
    }

    pub fn with_metrics(mut self, metrics: ConnectionMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn for_pair(self, restaurant_id: Uuid, dish_or_category_id: Uuid) -> NewConnection {
        NewConnection {
            restaurant_id,
            dish_or_category_id,
            is_menu_item: self.is_menu_item,
            categories: dedup(self.categories),
            dish_attributes: dedup(self.dish_attributes),
            metrics: self.metrics,
        }
    }
}

fn dedup(ids: Vec<Uuid>) -> Vec<Uuid> {
    let mut out = Vec::with_capacity(ids.len());
    union_into(&mut out, &ids);
    out
}

/// A connection row ready for insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewConnection {
    pub restaurant_id: Uuid,
    pub dish_or_category_id: Uuid,
    pub is_menu_item: bool,
    pub categories: Vec<Uuid>,
    pub dish_attributes: Vec<Uuid>,
    pub metrics: ConnectionMetrics,
}

impl NewConnection {
    pub fn pair_key(&self) -> String {
        format!("{}/{}", self.restaurant_id, self.dish_or_category_id)
    }
}

/// Explicit correction; every `Some` field overwrites verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionPatch {
    pub is_menu_item: Option<bool>,
    pub categories: Option<Vec<Uuid>>,
    pub dish_attributes: Option<Vec<Uuid>>,
    pub metrics: Option<ConnectionMetrics>,
}

/// Connection lookup. Results order by mention count descending.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionFilter {
    pub restaurant_id: Option<Uuid>,
    pub dish_or_category_id: Option<Uuid>,
    pub is_menu_item: Option<bool>,
    /// Connections whose `categories` contains this entity.
    pub category_contains: Option<Uuid>,
    pub dish_attribute_contains: Option<Uuid>,
    pub activity_level: Option<ActivityLevel>,
    pub min_mention_count: Option<i64>,
    pub limit: Option<i64>,
}

impl ConnectionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restaurant(mut self, restaurant_id: Uuid) -> Self {
        self.restaurant_id = Some(restaurant_id);
        self
    }

    pub fn dish(mut self, dish_or_category_id: Uuid) -> Self {
        self.dish_or_category_id = Some(dish_or_category_id);
        self
    }

    pub fn menu_items(mut self) -> Self {
        self.is_menu_item = Some(true);
        self
    }

    pub fn in_category(mut self, category_id: Uuid) -> Self {
        self.category_contains = Some(category_id);
        self
    }

    pub fn with_dish_attribute(mut self, attribute_id: Uuid) -> Self {
        self.dish_attribute_contains = Some(attribute_id);
        self
    }

    pub fn activity(mut self, level: ActivityLevel) -> Self {
        self.activity_level = Some(level);
        self
    }

    pub fn min_mentions(mut self, count: i64) -> Self {
        self.min_mention_count = Some(count);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, c: &Connection) -> bool {
        self.restaurant_id.map_or(true, |id| c.restaurant_id == id)
            && self
                .dish_or_category_id
                .map_or(true, |id| c.dish_or_category_id == id)
            && self.is_menu_item.map_or(true, |m| c.is_menu_item == m)
            && self
                .category_contains
                .map_or(true, |id| c.categories.contains(&id))
            && self
                .dish_attribute_contains
                .map_or(true, |id| c.dish_attributes.contains(&id))
            && self
                .activity_level
                .map_or(true, |level| c.metrics.activity_level == level)
            && self
                .min_mention_count
                .map_or(true, |min| c.metrics.mention_count >= min)
    }

    pub fn sort(connections: &mut [Connection]) {
        connections.sort_by(|a, b| {
            b.metrics
                .mention_count
                .cmp(&a.metrics.mention_count)
                .then_with(|| a.connection_id.cmp(&b.connection_id))
        });
    }
}
