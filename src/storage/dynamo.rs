use super::Storage;
use crate::types::{BatchResult, Campaign, CampaignState, HashedRecipient};
use anyhow::{Context, Result};
use aws_sdk_dynamodb::{Client, types::AttributeValue};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::str::FromStr;

// Each campaign owns a partition: one HEAD item with state and counters, the
// recipient list split over RECIPIENTS# pages, and one BATCH# item per
// recorded batch. Zero-padded sort keys keep pages and batches in order.
const CAMPAIGN_PREFIX: &str = "CAMPAIGN#";
const HEAD_SORT_KEY: &str = "HEAD";
const RECIPIENTS_PREFIX: &str = "RECIPIENTS#";
const BATCH_PREFIX: &str = "BATCH#";
const RECIPIENT_PARTITION_KEY: &str = "RECIPIENT";
const CONFIG_PARTITION_KEY: &str = "CONFIG";
const SALT_SORT_KEY: &str = "EMAIL_SALT";
const ABSENT_CONDITION: &str = "attribute_not_exists(PK)";
const EXISTS_CONDITION: &str = "attribute_exists(PK)";

/// Addresses per recipient page. At the 254-byte address limit a page stays
/// well under DynamoDB's 400 KB item cap.
pub const RECIPIENT_PAGE_SIZE: usize = 1_000;

// ============================================================================
// DynamoStorage: DynamoDB-backed Storage implementation
// ============================================================================

pub struct DynamoStorage {
    client: Client,
    table_name: String,
}

impl DynamoStorage {
    pub fn new(client: Client, table_name: String) -> Self {
        Self { client, table_name }
    }

    async fn read_salt(&self) -> Result<Option<String>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(CONFIG_PARTITION_KEY.to_string()))
            .key("SK", AttributeValue::S(SALT_SORT_KEY.to_string()))
            .consistent_read(true)
            .send()
            .await
            .context("Failed to read salt")?;

        Ok(output
            .item
            .and_then(|item| item.get("value").and_then(|v| v.as_s().ok()).cloned()))
    }

    async fn put(&self, item: HashMap<String, AttributeValue>, condition: Option<&str>) -> Result<()> {
        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .set_condition_expression(condition.map(str::to_string))
            .send()
            .await?;
        Ok(())
    }
}

impl Storage for DynamoStorage {
    async fn get_campaign(&self, id: &str) -> Result<Option<Campaign>> {
        let mut items = Vec::new();
        let mut exclusive_start_key = None;

        loop {
            let mut req = self
                .client
                .query()
                .table_name(&self.table_name)
                .key_condition_expression("PK = :pk")
                .expression_attribute_values(":pk", AttributeValue::S(campaign_pk(id)))
                .consistent_read(true);

            if let Some(start_key) = exclusive_start_key {
                req = req.set_exclusive_start_key(Some(start_key));
            }

            let output = req.send().await.context("Failed to query campaign")?;
            items.extend(output.items.unwrap_or_default());

            exclusive_start_key = output.last_evaluated_key;
            if exclusive_start_key.is_none() {
                break;
            }
        }

        campaign_from_items(items)
    }

    async fn create_campaign(&self, campaign: &Campaign) -> Result<()> {
        // Pages first: a campaign only becomes visible once its head exists.
        for page in recipient_page_items(campaign) {
            self.put(page, None)
                .await
                .context("Failed to store campaign recipients")?;
        }
        self.put(head_item(campaign), Some(ABSENT_CONDITION))
            .await
            .context("Failed to create campaign")
    }

    async fn update_campaign(&self, campaign: &Campaign) -> Result<()> {
        self.client
            .update_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(campaign_pk(&campaign.id)))
            .key("SK", AttributeValue::S(HEAD_SORT_KEY.to_string()))
            .update_expression(
                "SET #state = :state, total_chunks = :total_chunks, chunk_size = :chunk_size, \
                 total_sent = :total_sent, total_failed = :total_failed, \
                 retry_cycles = :retry_cycles, started_at = :started_at, \
                 completed_at = :completed_at",
            )
            .condition_expression(EXISTS_CONDITION)
            .expression_attribute_names("#state", "state")
            .expression_attribute_values(":state", AttributeValue::S(campaign.state.to_string()))
            .expression_attribute_values(":total_chunks", number(campaign.total_chunks))
            .expression_attribute_values(":chunk_size", number(campaign.chunk_size))
            .expression_attribute_values(":total_sent", number(campaign.total_sent))
            .expression_attribute_values(":total_failed", number(campaign.total_failed))
            .expression_attribute_values(":retry_cycles", number(campaign.retry_cycles))
            .expression_attribute_values(":started_at", timestamp(campaign.started_at))
            .expression_attribute_values(":completed_at", timestamp(campaign.completed_at))
            .send()
            .await
            .context("Failed to update campaign")?;

        Ok(())
    }

    async fn append_batch(
        &self,
        campaign_id: &str,
        seq: usize,
        batch: &BatchResult,
    ) -> Result<()> {
        self.put(batch_item(campaign_id, seq, batch)?, Some(ABSENT_CONDITION))
            .await
            .with_context(|| format!("Failed to record batch {} of campaign {}", seq, campaign_id))
    }

    async fn set_cancel_requested(&self, id: &str, requested: bool) -> Result<bool> {
        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(campaign_pk(id)))
            .key("SK", AttributeValue::S(HEAD_SORT_KEY.to_string()))
            .update_expression("SET cancel_requested = :flag")
            .condition_expression(EXISTS_CONDITION)
            .expression_attribute_values(":flag", AttributeValue::Bool(requested))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_conditional_check_failed_exception()) =>
            {
                Ok(false)
            }
            Err(err) => Err(err).context("Failed to update campaign cancellation"),
        }
    }

    async fn cancel_requested(&self, id: &str) -> Result<bool> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(campaign_pk(id)))
            .key("SK", AttributeValue::S(HEAD_SORT_KEY.to_string()))
            .projection_expression("cancel_requested")
            .consistent_read(true)
            .send()
            .await
            .context("Failed to read campaign cancellation")?;

        Ok(output
            .item
            .and_then(|item| item.get("cancel_requested").and_then(|v| v.as_bool().ok()).copied())
            .unwrap_or(false))
    }

    async fn get_recipient(&self, hash: &str) -> Result<Option<HashedRecipient>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(RECIPIENT_PARTITION_KEY.to_string()))
            .key("SK", AttributeValue::S(hash.to_string()))
            .send()
            .await
            .context("Failed to fetch recipient")?;

        output.item.map(recipient_from_item).transpose()
    }

    async fn insert_recipient(&self, recipient: &HashedRecipient) -> Result<bool> {
        let mut item = HashMap::from([
            (
                "PK".to_string(),
                AttributeValue::S(RECIPIENT_PARTITION_KEY.to_string()),
            ),
            ("SK".to_string(), AttributeValue::S(recipient.hash.clone())),
            ("id".to_string(), AttributeValue::S(recipient.id.clone())),
            (
                "first_seen_at".to_string(),
                AttributeValue::S(recipient.first_seen_at.to_rfc3339()),
            ),
        ]);
        if let Some(last_sent_at) = recipient.last_sent_at {
            item.insert(
                "last_sent_at".to_string(),
                AttributeValue::S(last_sent_at.to_rfc3339()),
            );
        }

        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .condition_expression(ABSENT_CONDITION)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_conditional_check_failed_exception()) =>
            {
                Ok(false)
            }
            Err(err) => Err(err).context("Failed to insert recipient"),
        }
    }

    async fn mark_recipient_sent(&self, hash: &str, at: DateTime<Utc>) -> Result<()> {
        self.client
            .update_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(RECIPIENT_PARTITION_KEY.to_string()))
            .key("SK", AttributeValue::S(hash.to_string()))
            .update_expression("SET last_sent_at = :ts")
            .condition_expression("attribute_exists(PK)")
            .expression_attribute_values(":ts", AttributeValue::S(at.to_rfc3339()))
            .send()
            .await
            .context("Failed to update recipient last_sent_at")?;

        Ok(())
    }

    async fn insert_salt_if_absent(&self, candidate: &str) -> Result<String> {
        let item = HashMap::from([
            (
                "PK".to_string(),
                AttributeValue::S(CONFIG_PARTITION_KEY.to_string()),
            ),
            ("SK".to_string(), AttributeValue::S(SALT_SORT_KEY.to_string())),
            ("value".to_string(), AttributeValue::S(candidate.to_string())),
            (
                "created_at".to_string(),
                AttributeValue::S(Utc::now().to_rfc3339()),
            ),
        ]);

        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .condition_expression(ABSENT_CONDITION)
            .send()
            .await;

        match result {
            Ok(_) => Ok(candidate.to_string()),
            // Lost the race (or the salt predates this call): use the stored one.
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_conditional_check_failed_exception()) =>
            {
                self.read_salt()
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("Salt item exists but has no value"))
            }
            Err(err) => Err(err).context("Failed to store salt"),
        }
    }
}

// ============================================================================
// Serialization helpers
// ============================================================================

fn campaign_pk(id: &str) -> String {
    format!("{}{}", CAMPAIGN_PREFIX, id)
}

fn number(n: impl ToString) -> AttributeValue {
    AttributeValue::N(n.to_string())
}

fn timestamp(at: Option<DateTime<Utc>>) -> AttributeValue {
    match at {
        Some(at) => AttributeValue::S(at.to_rfc3339()),
        None => AttributeValue::Null(true),
    }
}

pub(crate) fn head_item(campaign: &Campaign) -> HashMap<String, AttributeValue> {
    HashMap::from([
        ("PK".to_string(), AttributeValue::S(campaign_pk(&campaign.id))),
        ("SK".to_string(), AttributeValue::S(HEAD_SORT_KEY.to_string())),
        ("id".to_string(), AttributeValue::S(campaign.id.clone())),
        ("subject".to_string(), AttributeValue::S(campaign.subject.clone())),
        ("body".to_string(), AttributeValue::S(campaign.body.clone())),
        ("state".to_string(), AttributeValue::S(campaign.state.to_string())),
        ("recipient_count".to_string(), number(campaign.recipient_count)),
        ("total_chunks".to_string(), number(campaign.total_chunks)),
        ("chunk_size".to_string(), number(campaign.chunk_size)),
        ("total_sent".to_string(), number(campaign.total_sent)),
        ("total_failed".to_string(), number(campaign.total_failed)),
        ("retry_cycles".to_string(), number(campaign.retry_cycles)),
        (
            "cancel_requested".to_string(),
            AttributeValue::Bool(campaign.cancel_requested),
        ),
        (
            "created_at".to_string(),
            AttributeValue::S(campaign.created_at.to_rfc3339()),
        ),
        ("started_at".to_string(), timestamp(campaign.started_at)),
        ("completed_at".to_string(), timestamp(campaign.completed_at)),
    ])
}

pub(crate) fn recipient_page_items(campaign: &Campaign) -> Vec<HashMap<String, AttributeValue>> {
    campaign
        .recipients
        .chunks(RECIPIENT_PAGE_SIZE)
        .enumerate()
        .map(|(page, emails)| {
            HashMap::from([
                ("PK".to_string(), AttributeValue::S(campaign_pk(&campaign.id))),
                (
                    "SK".to_string(),
                    AttributeValue::S(format!("{}{:05}", RECIPIENTS_PREFIX, page)),
                ),
                (
                    "emails".to_string(),
                    AttributeValue::L(emails.iter().cloned().map(AttributeValue::S).collect()),
                ),
            ])
        })
        .collect()
}

pub(crate) fn batch_item(
    campaign_id: &str,
    seq: usize,
    batch: &BatchResult,
) -> Result<HashMap<String, AttributeValue>> {
    Ok(HashMap::from([
        ("PK".to_string(), AttributeValue::S(campaign_pk(campaign_id))),
        (
            "SK".to_string(),
            AttributeValue::S(format!("{}{:08}", BATCH_PREFIX, seq)),
        ),
        (
            "batch".to_string(),
            json_to_av(&serde_json::to_value(batch)?)?,
        ),
    ]))
}

/// Reassemble a campaign from every item in its partition. `None` when the
/// head item is missing.
pub(crate) fn campaign_from_items(
    items: Vec<HashMap<String, AttributeValue>>,
) -> Result<Option<Campaign>> {
    let mut head = None;
    let mut pages = Vec::new();
    let mut batches = Vec::new();

    for item in items {
        let sk = string_attr(&item, "SK")?;
        if sk == HEAD_SORT_KEY {
            head = Some(item);
        } else if sk.starts_with(RECIPIENTS_PREFIX) {
            let emails = item
                .get("emails")
                .and_then(|v| v.as_l().ok())
                .ok_or_else(|| anyhow::anyhow!("Missing emails field on {}", sk))?
                .iter()
                .map(|v| v.as_s().cloned())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| anyhow::anyhow!("Non-string address on {}", sk))?;
            pages.push((sk, emails));
        } else if sk.starts_with(BATCH_PREFIX) {
            let av = item
                .get("batch")
                .ok_or_else(|| anyhow::anyhow!("Missing batch field on {}", sk))?;
            let batch: BatchResult = serde_json::from_value(av_to_json(av)?)
                .with_context(|| format!("Invalid batch record {}", sk))?;
            batches.push((sk, batch));
        }
    }

    let Some(head) = head else {
        return Ok(None);
    };

    pages.sort_by(|a, b| a.0.cmp(&b.0));
    batches.sort_by(|a, b| a.0.cmp(&b.0));

    let mut campaign = campaign_head_from_item(&head)?;
    campaign.recipients = pages.into_iter().flat_map(|(_, emails)| emails).collect();
    campaign.batch_results = batches.into_iter().map(|(_, batch)| batch).collect();
    Ok(Some(campaign))
}

fn campaign_head_from_item(item: &HashMap<String, AttributeValue>) -> Result<Campaign> {
    Ok(Campaign {
        id: string_attr(item, "id")?,
        subject: string_attr(item, "subject")?,
        body: string_attr(item, "body")?,
        state: string_attr(item, "state")?.parse::<CampaignState>()?,
        recipients: Vec::new(),
        recipient_count: number_attr(item, "recipient_count")?,
        total_chunks: number_attr(item, "total_chunks")?,
        chunk_size: number_attr(item, "chunk_size")?,
        batch_results: Vec::new(),
        total_sent: number_attr(item, "total_sent")?,
        total_failed: number_attr(item, "total_failed")?,
        retry_cycles: number_attr(item, "retry_cycles")?,
        cancel_requested: item
            .get("cancel_requested")
            .and_then(|v| v.as_bool().ok())
            .copied()
            .unwrap_or(false),
        created_at: time_attr(item, "created_at")?
            .ok_or_else(|| anyhow::anyhow!("Missing created_at field"))?,
        started_at: time_attr(item, "started_at")?,
        completed_at: time_attr(item, "completed_at")?,
    })
}

fn string_attr(item: &HashMap<String, AttributeValue>, name: &str) -> Result<String> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("Missing {} field", name))
}

fn number_attr<T: FromStr>(item: &HashMap<String, AttributeValue>, name: &str) -> Result<T> {
    item.get(name)
        .and_then(|v| v.as_n().ok())
        .ok_or_else(|| anyhow::anyhow!("Missing {} field", name))?
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid {} field", name))
}

/// Absent and NULL both read as `None`.
fn time_attr(item: &HashMap<String, AttributeValue>, name: &str) -> Result<Option<DateTime<Utc>>> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .map(|s| s.parse::<DateTime<Utc>>())
        .transpose()
        .with_context(|| format!("Invalid {} timestamp", name))
}

pub(crate) fn recipient_from_item(item: HashMap<String, AttributeValue>) -> Result<HashedRecipient> {
    let hash = item
        .get("SK")
        .and_then(|v| v.as_s().ok())
        .ok_or_else(|| anyhow::anyhow!("Missing SK field"))?
        .clone();

    let id = item
        .get("id")
        .and_then(|v| v.as_s().ok())
        .ok_or_else(|| anyhow::anyhow!("Missing id field"))?
        .clone();

    let first_seen_at = item
        .get("first_seen_at")
        .and_then(|v| v.as_s().ok())
        .ok_or_else(|| anyhow::anyhow!("Missing first_seen_at field"))?
        .parse::<DateTime<Utc>>()
        .context("Invalid first_seen_at timestamp")?;

    let last_sent_at = item
        .get("last_sent_at")
        .and_then(|v| v.as_s().ok())
        .map(|s| s.parse::<DateTime<Utc>>())
        .transpose()
        .context("Invalid last_sent_at timestamp")?;

    Ok(HashedRecipient {
        id,
        hash,
        first_seen_at,
        last_sent_at,
    })
}

fn json_to_av(json: &serde_json::Value) -> Result<AttributeValue> {
    Ok(match json {
        serde_json::Value::Null => AttributeValue::Null(true),
        serde_json::Value::Bool(b) => AttributeValue::Bool(*b),
        serde_json::Value::Number(n) => AttributeValue::N(n.to_string()),
        serde_json::Value::String(s) => AttributeValue::S(s.clone()),
        serde_json::Value::Array(arr) => {
            AttributeValue::L(arr.iter().map(json_to_av).collect::<Result<_>>()?)
        }
        serde_json::Value::Object(map) => AttributeValue::M(
            map.iter()
                .map(|(k, v)| json_to_av(v).map(|av| (k.clone(), av)))
                .collect::<Result<_>>()?,
        ),
    })
}

fn av_to_json(av: &AttributeValue) -> Result<serde_json::Value> {
    Ok(match av {
        AttributeValue::Null(_) => serde_json::Value::Null,
        AttributeValue::Bool(b) => serde_json::Value::Bool(*b),
        AttributeValue::N(n) => n
            .parse::<i64>()
            .map(Into::into)
            .or_else(|_| n.parse::<f64>().map(Into::into))
            .unwrap_or_else(|_| serde_json::Value::String(n.clone())),
        AttributeValue::S(s) => serde_json::Value::String(s.clone()),
        AttributeValue::L(list) => {
            serde_json::Value::Array(list.iter().map(av_to_json).collect::<Result<_>>()?)
        }
        AttributeValue::M(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| av_to_json(v).map(|json| (k.clone(), json)))
                .collect::<Result<_>>()?,
        ),
        _ => serde_json::Value::Null, // binary/set types are never written
    })
}

// ============================================================================
// Tests: DynamoDB item conversion (no network required)
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BatchResult, CampaignState, RecipientOutcome};
    use chrono::TimeZone;

    fn make_recipient_item(hash: &str, first_seen: &str) -> HashMap<String, AttributeValue> {
        HashMap::from([
            ("SK".to_string(), AttributeValue::S(hash.to_string())),
            ("id".to_string(), AttributeValue::S("rec-1".to_string())),
            (
                "first_seen_at".to_string(),
                AttributeValue::S(first_seen.to_string()),
            ),
        ])
    }

    #[test]
    fn recipient_from_item_without_last_sent() {
        let item = make_recipient_item("abc123", "2024-01-01T00:00:00+00:00");
        let recipient = recipient_from_item(item).unwrap();
        assert_eq!(recipient.hash, "abc123");
        assert_eq!(recipient.id, "rec-1");
        assert!(recipient.last_sent_at.is_none());
    }

    #[test]
    fn recipient_from_item_with_last_sent() {
        let mut item = make_recipient_item("abc123", "2024-01-01T00:00:00+00:00");
        item.insert(
            "last_sent_at".to_string(),
            AttributeValue::S("2024-02-01T12:00:00+00:00".to_string()),
        );
        let recipient = recipient_from_item(item).unwrap();
        assert_eq!(
            recipient.last_sent_at,
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn recipient_from_item_missing_first_seen() {
        let mut item = make_recipient_item("abc123", "ignored");
        item.remove("first_seen_at");
        assert!(recipient_from_item(item).is_err());
    }

    #[test]
    fn recipient_from_item_invalid_timestamp() {
        let item = make_recipient_item("abc123", "yesterday");
        assert!(recipient_from_item(item).is_err());
    }

    fn sample_campaign(recipients: usize) -> Campaign {
        let emails = (0..recipients)
            .map(|i| format!("subscriber-{:05}@mail.example-newsletter.com", i))
            .collect();
        Campaign::new("Weekly {date}".to_string(), "<p>Hello</p>".repeat(60), emails)
    }

    fn sample_batch(index: usize, emails: &[String]) -> BatchResult {
        BatchResult {
            chunk_index: index,
            total_chunks: 100,
            completed_at: Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
            results: emails
                .iter()
                .enumerate()
                .map(|(i, email)| {
                    if i % 10 == 0 {
                        RecipientOutcome::failed(email, "permanent error (550): no such user", 1)
                    } else {
                        RecipientOutcome::delivered(email, 1)
                    }
                })
                .collect(),
        }
    }

    /// Rough DynamoDB item size: attribute names plus value bytes.
    fn approx_size(item: &HashMap<String, AttributeValue>) -> usize {
        item.iter().map(|(k, v)| k.len() + value_size(v)).sum()
    }

    fn value_size(v: &AttributeValue) -> usize {
        match v {
            AttributeValue::S(s) | AttributeValue::N(s) => s.len(),
            AttributeValue::L(list) => 3 + list.iter().map(|v| 1 + value_size(v)).sum::<usize>(),
            AttributeValue::M(map) => {
                3 + map
                    .iter()
                    .map(|(k, v)| 1 + k.len() + value_size(v))
                    .sum::<usize>()
            }
            _ => 1,
        }
    }

    fn partition(campaign: &Campaign) -> Vec<HashMap<String, AttributeValue>> {
        let mut items = vec![head_item(campaign)];
        items.extend(recipient_page_items(campaign));
        for (seq, batch) in campaign.batch_results.iter().enumerate() {
            items.push(batch_item(&campaign.id, seq, batch).unwrap());
        }
        items
    }

    #[test]
    fn large_campaign_items_stay_under_the_item_limit() {
        let mut campaign = sample_campaign(5_000);
        campaign.total_chunks = 100;
        campaign.batch_results = campaign
            .recipients
            .chunks(50)
            .enumerate()
            .map(|(i, emails)| sample_batch(i, emails))
            .collect();

        let items = partition(&campaign);
        // head + 5 recipient pages + 100 batches
        assert_eq!(items.len(), 106);
        let largest = items.iter().map(approx_size).max().unwrap();
        assert!(largest < 100 * 1024, "largest item ~{} bytes", largest);
    }

    #[test]
    fn campaign_partition_round_trips() {
        let mut campaign = sample_campaign(2_500);
        campaign.state = CampaignState::Retrying;
        campaign.chunk_size = 50;
        campaign.total_chunks = 50;
        campaign.total_sent = 45;
        campaign.total_failed = 5;
        campaign.retry_cycles = 1;
        campaign.cancel_requested = true;
        campaign.started_at = Some(Utc.with_ymd_and_hms(2024, 3, 1, 7, 0, 0).unwrap());
        campaign.batch_results = (0..12)
            .map(|i| sample_batch(i, &campaign.recipients[i * 50..(i + 1) * 50]))
            .collect();

        // query order is not relied on
        let mut items = partition(&campaign);
        items.reverse();
        let restored = campaign_from_items(items).unwrap().unwrap();

        assert_eq!(restored.id, campaign.id);
        assert_eq!(restored.state, CampaignState::Retrying);
        assert_eq!(restored.recipients, campaign.recipients);
        assert_eq!(restored.batch_results, campaign.batch_results);
        assert_eq!(restored.total_failed, 5);
        assert_eq!(restored.retry_cycles, 1);
        assert!(restored.cancel_requested);
        assert_eq!(restored.started_at, campaign.started_at);
        assert!(restored.completed_at.is_none());
    }

    #[test]
    fn batches_sort_numerically_past_ten() {
        let campaign = sample_campaign(3);
        let a = batch_item(&campaign.id, 9, &sample_batch(9, &campaign.recipients)).unwrap();
        let b = batch_item(&campaign.id, 10, &sample_batch(10, &campaign.recipients)).unwrap();
        let restored = campaign_from_items(vec![head_item(&campaign), b, a])
            .unwrap()
            .unwrap();
        let order: Vec<usize> = restored.batch_results.iter().map(|b| b.chunk_index).collect();
        assert_eq!(order, vec![9, 10]);
    }

    #[test]
    fn partition_without_head_is_absent() {
        let campaign = sample_campaign(10);
        assert!(
            campaign_from_items(recipient_page_items(&campaign))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn head_with_bad_state_is_an_error() {
        let campaign = sample_campaign(1);
        let mut head = head_item(&campaign);
        head.insert("state".to_string(), AttributeValue::S("paused".to_string()));
        assert!(campaign_from_items(vec![head]).is_err());
    }
}
