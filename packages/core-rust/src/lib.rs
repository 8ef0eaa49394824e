//! Aerie core: published pub-sub items, id blocks, clock, and cluster task messages.

pub mod clock;
pub mod ids;
pub mod item;
pub mod messages;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use ids::{IdBlock, IdType};
pub use item::{ItemKey, LeafNode, PublishedItem, ITEM_KEY_SEPARATOR};
pub use messages::ClusterTask;
