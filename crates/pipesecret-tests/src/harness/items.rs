use pipesecret_item::{ItemError, ItemSource};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Counters shared between a [`FakeItems`] and the test observing it.
#[derive(Debug, Default)]
pub struct ItemStats {
    pub lookups: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

/// In-memory item source with an optional per-lookup delay.
#[derive(Clone)]
pub struct FakeItems {
    items: Arc<HashMap<String, String>>,
    delay: Duration,
    pub stats: Arc<ItemStats>,
}

impl FakeItems {
    pub fn new<I, K, V>(items: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            items: Arc::new(
                items
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
            delay: Duration::ZERO,
            stats: Arc::default(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl ItemSource for FakeItems {
    async fn get_item(&self, name: &str) -> Result<String, ItemError> {
        self.stats.lookups.fetch_add(1, Ordering::SeqCst);
        let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = self
            .items
            .get(name)
            .cloned()
            .ok_or_else(|| ItemError::NotFound(name.to_string()));

        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// A 1Password-style login item.
pub fn login_item(username: &str, password: &str) -> String {
    serde_json::json!({
        "id": "id1",
        "title": "test1",
        "category": "LOGIN",
        "fields": [
            {"id": "username", "type": "STRING", "purpose": "USERNAME", "value": username},
            {"id": "password", "type": "CONCEALED", "purpose": "PASSWORD", "value": password},
            {"id": "notesPlain", "type": "STRING", "purpose": "NOTES"}
        ]
    })
    .to_string()
}
