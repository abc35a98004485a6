use crate::types::{BatchResult, Campaign, HashedRecipient};
use anyhow::Result;
use chrono::{DateTime, Utc};

pub mod dynamo;
pub use dynamo::DynamoStorage;

// ============================================================================
// Storage trait
// ============================================================================

#[allow(async_fn_in_trait)]
pub trait Storage: Send + Sync {
    /// The campaign with its recipient list and every recorded batch, oldest
    /// batch first.
    async fn get_campaign(&self, id: &str) -> Result<Option<Campaign>>;

    /// Persist a new campaign, recipient list included. Fails if the id is
    /// already taken.
    async fn create_campaign(&self, campaign: &Campaign) -> Result<()>;

    /// Write state, counters and timestamps. The recipient list, the batch
    /// history and the cancel flag are left as stored.
    async fn update_campaign(&self, campaign: &Campaign) -> Result<()>;

    /// Record batch number `seq` (0-based, in recording order). Fails rather
    /// than overwrite an existing entry.
    async fn append_batch(
        &self,
        campaign_id: &str,
        seq: usize,
        batch: &BatchResult,
    ) -> Result<()>;

    /// Set or clear the cancel flag without touching the rest of the record.
    /// Returns `false` when no such campaign exists.
    async fn set_cancel_requested(&self, id: &str, requested: bool) -> Result<bool>;

    /// Read only the cancel flag. Unknown campaigns read as not cancelled.
    async fn cancel_requested(&self, id: &str) -> Result<bool>;

    async fn get_recipient(&self, hash: &str) -> Result<Option<HashedRecipient>>;

    /// Insert-if-absent. Returns `false` when a record with the same hash
    /// already existed, in which case nothing is written.
    async fn insert_recipient(&self, recipient: &HashedRecipient) -> Result<bool>;

    async fn mark_recipient_sent(&self, hash: &str, at: DateTime<Utc>) -> Result<()>;

    /// Persist `candidate` as the hashing salt unless one already exists, and
    /// return whichever salt ended up stored.
    async fn insert_salt_if_absent(&self, candidate: &str) -> Result<String>;
}

// ============================================================================
// Test utilities: InMemoryStorage for in-crate tests
// ============================================================================

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    pub(crate) struct InMemoryStorage {
        pub campaigns: Mutex<HashMap<String, Campaign>>,
        pub recipients: Mutex<HashMap<String, HashedRecipient>>,
        pub salt: Mutex<Option<String>>,
        pub lookups_in_flight: AtomicUsize,
        pub peak_lookups: AtomicUsize,
        pub fail_salt: AtomicBool,
    }

    impl InMemoryStorage {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn with_salt(self, salt: &str) -> Self {
            *self.salt.lock().unwrap() = Some(salt.to_string());
            self
        }

        pub(crate) fn failing_salt(self) -> Self {
            self.fail_salt.store(true, Ordering::SeqCst);
            self
        }

        pub(crate) fn campaign(&self, id: &str) -> Campaign {
            self.campaigns.lock().unwrap().get(id).cloned().unwrap()
        }

        pub(crate) fn recipient_count(&self) -> usize {
            self.recipients.lock().unwrap().len()
        }

        pub(crate) fn recipient(&self, hash: &str) -> Option<HashedRecipient> {
            self.recipients.lock().unwrap().get(hash).cloned()
        }
    }

    impl Storage for InMemoryStorage {
        async fn get_campaign(&self, id: &str) -> Result<Option<Campaign>> {
            Ok(self.campaigns.lock().unwrap().get(id).cloned())
        }

        async fn create_campaign(&self, campaign: &Campaign) -> Result<()> {
            let mut campaigns = self.campaigns.lock().unwrap();
            if campaigns.contains_key(&campaign.id) {
                anyhow::bail!("campaign {} already exists", campaign.id);
            }
            campaigns.insert(campaign.id.clone(), campaign.clone());
            Ok(())
        }

        async fn update_campaign(&self, campaign: &Campaign) -> Result<()> {
            let mut campaigns = self.campaigns.lock().unwrap();
            let Some(stored) = campaigns.get_mut(&campaign.id) else {
                anyhow::bail!("campaign {} does not exist", campaign.id);
            };
            stored.state = campaign.state;
            stored.total_chunks = campaign.total_chunks;
            stored.chunk_size = campaign.chunk_size;
            stored.total_sent = campaign.total_sent;
            stored.total_failed = campaign.total_failed;
            stored.retry_cycles = campaign.retry_cycles;
            stored.started_at = campaign.started_at;
            stored.completed_at = campaign.completed_at;
            Ok(())
        }

        async fn append_batch(
            &self,
            campaign_id: &str,
            seq: usize,
            batch: &BatchResult,
        ) -> Result<()> {
            let mut campaigns = self.campaigns.lock().unwrap();
            let Some(stored) = campaigns.get_mut(campaign_id) else {
                anyhow::bail!("campaign {} does not exist", campaign_id);
            };
            if stored.batch_results.len() != seq {
                anyhow::bail!("batch {} of campaign {} already recorded", seq, campaign_id);
            }
            stored.batch_results.push(batch.clone());
            Ok(())
        }

        async fn set_cancel_requested(&self, id: &str, requested: bool) -> Result<bool> {
            match self.campaigns.lock().unwrap().get_mut(id) {
                Some(campaign) => {
                    campaign.cancel_requested = requested;
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn cancel_requested(&self, id: &str) -> Result<bool> {
            Ok(self
                .campaigns
                .lock()
                .unwrap()
                .get(id)
                .is_some_and(|c| c.cancel_requested))
        }

        async fn get_recipient(&self, hash: &str) -> Result<Option<HashedRecipient>> {
            let now = self.lookups_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_lookups.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            let found = self.recipients.lock().unwrap().get(hash).cloned();
            self.lookups_in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(found)
        }

        async fn insert_recipient(&self, recipient: &HashedRecipient) -> Result<bool> {
            let mut recipients = self.recipients.lock().unwrap();
            if recipients.contains_key(&recipient.hash) {
                return Ok(false);
            }
            recipients.insert(recipient.hash.clone(), recipient.clone());
            Ok(true)
        }

        async fn mark_recipient_sent(&self, hash: &str, at: DateTime<Utc>) -> Result<()> {
            if let Some(r) = self.recipients.lock().unwrap().get_mut(hash) {
                r.last_sent_at = Some(at);
            }
            Ok(())
        }

        async fn insert_salt_if_absent(&self, candidate: &str) -> Result<String> {
            if self.fail_salt.load(Ordering::SeqCst) {
                anyhow::bail!("salt table unavailable");
            }
            let mut salt = self.salt.lock().unwrap();
            Ok(salt.get_or_insert_with(|| candidate.to_string()).clone())
        }
    }

    #[tokio::test]
    async fn update_keeps_history_and_cancel_flag() {
        let storage = InMemoryStorage::new();
        let mut campaign = Campaign::new(
            "s".to_string(),
            "b".to_string(),
            vec!["a@example.com".to_string()],
        );
        storage.create_campaign(&campaign).await.unwrap();
        storage.set_cancel_requested(&campaign.id, true).await.unwrap();

        campaign.total_sent = 7;
        campaign.recipients.clear();
        storage.update_campaign(&campaign).await.unwrap();

        let stored = storage.campaign(&campaign.id);
        assert_eq!(stored.total_sent, 7);
        assert_eq!(stored.recipients, vec!["a@example.com"]);
        assert!(stored.cancel_requested);
    }
}
