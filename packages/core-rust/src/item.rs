//! Published pub-sub items and the leaf nodes that own them.
//!
//! A [`PublishedItem`] is addressed by its [`ItemKey`] (owning node id plus
//! item id). The key is the unit of identity for the item cache, the pending
//! write queues, and every storage backend.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Separator used in the string form of an [`ItemKey`].
pub const ITEM_KEY_SEPARATOR: char = ':';

/// Globally unique address of a published item: node id + item id.
///
/// Kept as two fields rather than a joined string so that node ids containing
/// the separator cannot collide with other keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemKey {
    /// Identifier of the owning node.
    pub node_id: String,
    /// Identifier of the item, unique within the node.
    pub item_id: String,
}

impl ItemKey {
    /// Creates a key from its two parts.
    #[must_use]
    pub fn new(node_id: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            item_id: item_id.into(),
        }
    }

    /// Returns `true` if this key addresses an item of `node_id`.
    #[must_use]
    pub fn belongs_to(&self, node_id: &str) -> bool {
        self.node_id == node_id
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{ITEM_KEY_SEPARATOR}{}", self.node_id, self.item_id)
    }
}

/// A pub-sub leaf node, as far as persistence is concerned.
///
/// Only the identifier and the retention cap matter here; subscriptions,
/// affiliations and access models live in the protocol layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeafNode {
    /// Unique node identifier within its service.
    pub node_id: String,
    /// Maximum number of items the node retains. `None` = unbounded.
    pub max_published_items: Option<usize>,
}

impl LeafNode {
    /// Creates a node with no retention cap.
    #[must_use]
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            max_published_items: None,
        }
    }

    /// Sets the maximum number of retained items.
    #[must_use]
    pub fn with_max_published_items(mut self, max: usize) -> Self {
        self.max_published_items = Some(max);
        self
    }

    /// Key of the item `item_id` in this node.
    #[must_use]
    pub fn item_key(&self, item_id: &str) -> ItemKey {
        ItemKey::new(self.node_id.clone(), item_id)
    }
}

/// One payload published to a leaf node.
///
/// The payload is opaque to the persistence layer (serialized XML in
/// practice). `creation_date` is milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedItem {
    /// Identifier of the owning node.
    pub node_id: String,
    /// Identifier of the item, unique within the node.
    pub item_id: String,
    /// Bare JID of the publisher.
    pub publisher: String,
    /// Serialized item content.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Publication time in milliseconds since the Unix epoch.
    pub creation_date: u64,
}

impl PublishedItem {
    /// Creates an item for `node` with a caller-chosen id.
    #[must_use]
    pub fn new(
        node: &LeafNode,
        item_id: impl Into<String>,
        publisher: impl Into<String>,
        payload: Vec<u8>,
        creation_date: u64,
    ) -> Self {
        Self {
            node_id: node.node_id.clone(),
            item_id: item_id.into(),
            publisher: publisher.into(),
            payload,
            creation_date,
        }
    }

    /// Creates an item for `node` with a server-generated id.
    #[must_use]
    pub fn with_generated_id(
        node: &LeafNode,
        publisher: impl Into<String>,
        payload: Vec<u8>,
        creation_date: u64,
    ) -> Self {
        Self::new(
            node,
            uuid::Uuid::new_v4().to_string(),
            publisher,
            payload,
            creation_date,
        )
    }

    /// Returns the key addressing this item.
    #[must_use]
    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.node_id.clone(), self.item_id.clone())
    }
}
