//! Tunables of the pub-sub persistence engine.

use std::time::Duration;

use tracing::warn;

use crate::properties::ServerProperties;
use crate::storage::RetentionPolicy;

/// Shortest period the flush timer may run at.
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_secs(20);
/// Shortest period the purge timer may run at.
pub const MIN_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Property holding [`PubSubConfig::max_items_flush`].
pub const PROP_FLUSH_MAX: &str = "xmpp.pubsub.flush.max";
/// Property holding [`PubSubConfig::max_rows_fetch`].
pub const PROP_FETCH_MAX: &str = "xmpp.pubsub.fetch.max";
/// Property holding the flush timer period in seconds.
pub const PROP_FLUSH_TIMER: &str = "xmpp.pubsub.flush.timer";
/// Property holding the purge timer period in seconds.
pub const PROP_PURGE_TIMER: &str = "xmpp.pubsub.purge.timer";
/// Property holding the maximum item age in seconds.
pub const PROP_PURGE_MAX_AGE: &str = "xmpp.pubsub.purge.max_age";
/// Property holding the per-node item cap applied by the purge.
pub const PROP_PURGE_MAX_ITEMS: &str = "xmpp.pubsub.purge.max_items";

/// Configuration for [`PubSubPersistence`](crate::pubsub::PubSubPersistence).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubConfig {
    /// Pending inserts above which a save triggers a flush. `0` flushes on
    /// every save and disables the flush timer.
    pub max_items_flush: usize,
    /// Upper bound on rows returned by a multi-item fetch.
    pub max_rows_fetch: usize,
    /// Requested flush timer period.
    pub flush_interval: Duration,
    /// Requested purge timer period.
    pub purge_interval: Duration,
    /// What the purge timer removes.
    pub retention: RetentionPolicy,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            max_items_flush: 1000,
            max_rows_fetch: 2000,
            flush_interval: Duration::from_secs(120),
            purge_interval: Duration::from_secs(300),
            retention: RetentionPolicy::default(),
        }
    }
}

impl PubSubConfig {
    /// Reads the configuration from server properties.
    ///
    /// Absent or malformed values fall back to the defaults. Negative counts
    /// are clamped to zero with a warning.
    #[must_use]
    pub fn from_properties(props: &ServerProperties) -> Self {
        let defaults = Self::default();

        let max_items_flush = non_negative(
            PROP_FLUSH_MAX,
            props.get_int(PROP_FLUSH_MAX, as_i64(defaults.max_items_flush)),
        );
        let max_rows_fetch = non_negative(
            PROP_FETCH_MAX,
            props.get_int(PROP_FETCH_MAX, as_i64(defaults.max_rows_fetch)),
        );
        let flush_interval = seconds(
            PROP_FLUSH_TIMER,
            props.get_int(PROP_FLUSH_TIMER, as_i64(defaults.flush_interval.as_secs())),
        );
        let purge_interval = seconds(
            PROP_PURGE_TIMER,
            props.get_int(PROP_PURGE_TIMER, as_i64(defaults.purge_interval.as_secs())),
        );

        let max_item_age = props
            .get(PROP_PURGE_MAX_AGE)
            .map(|_| seconds(PROP_PURGE_MAX_AGE, props.get_int(PROP_PURGE_MAX_AGE, 0)))
            .filter(|age| !age.is_zero());
        let max_items_per_node = props.get(PROP_PURGE_MAX_ITEMS).map(|_| {
            non_negative(PROP_PURGE_MAX_ITEMS, props.get_int(PROP_PURGE_MAX_ITEMS, 0))
        });

        Self {
            max_items_flush,
            max_rows_fetch,
            flush_interval,
            purge_interval,
            retention: RetentionPolicy {
                max_item_age,
                max_items_per_node,
            },
        }
    }

    /// Whether the periodic flush runs at all.
    #[must_use]
    pub fn flush_timer_enabled(&self) -> bool {
        self.max_items_flush > 0
    }

    /// Flush period after applying [`MIN_FLUSH_INTERVAL`].
    #[must_use]
    pub fn effective_flush_interval(&self) -> Duration {
        self.flush_interval.max(MIN_FLUSH_INTERVAL)
    }

    /// Purge period after applying [`MIN_PURGE_INTERVAL`].
    #[must_use]
    pub fn effective_purge_interval(&self) -> Duration {
        self.purge_interval.max(MIN_PURGE_INTERVAL)
    }
}

fn as_i64<T: TryInto<i64>>(value: T) -> i64 {
    value.try_into().unwrap_or(i64::MAX)
}

fn non_negative(name: &str, value: i64) -> usize {
    usize::try_from(value).unwrap_or_else(|_| {
        warn!(property = name, value, "negative value clamped to 0");
        0
    })
}

fn seconds(name: &str, value: i64) -> Duration {
    Duration::from_secs(u64::try_from(non_negative(name, value)).unwrap_or(u64::MAX))
}
