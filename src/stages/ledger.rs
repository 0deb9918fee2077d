//! Cost Ledger - records every completed call with per-module savings
//! attribution and closes the accounting loop after the provider responds.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::broadcast::{BroadcastChannel, BroadcastMessage};
use crate::events::{EventSink, PipelineEvent};
use crate::logging::log_debug;
use crate::pricing::{cost, ModelPricingTable};
use crate::storage::StorageAdapter;

const LEDGER_STORAGE_PREFIX: &str = "ledger:";

/// Per-module decomposition of the dollar difference between what a call
/// would have cost without the pipeline and what it actually cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Savings {
    pub guard: f64,
    pub cache: f64,
    pub context: f64,
    pub router: f64,
    pub prefix: f64,
    pub compressor: f64,
    pub delta: f64,
}

impl Savings {
    pub fn total(&self) -> f64 {
        self.guard + self.cache + self.context + self.router + self.prefix + self.compressor + self.delta
    }
}

/// Input to [`CostLedger::record`]. Only `model`, `input_tokens`, and
/// `output_tokens` are required - everything else defaults to "no savings
/// attributed, no feature tag".
#[derive(Debug, Clone, Default)]
pub struct RecordInput {
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cached_tokens: u32,
    pub savings: Savings,
    pub feature: Option<String>,
    pub latency_ms: Option<u64>,
    pub cache_hit: bool,
    pub original_model: Option<String>,
    pub original_input_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub timestamp: i64,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cached_tokens: u32,
    pub actual_cost: f64,
    pub cost_without_shield: f64,
    pub total_saved: f64,
    pub savings: Savings,
    pub feature: Option<String>,
    pub latency_ms: Option<u64>,
    pub cache_hit: bool,
}

impl LedgerEntry {
    /// A deterministic fixture used by broadcast/merge tests that need a
    /// real entry but don't care about its accounting values.
    pub fn test_fixture() -> Self {
        Self {
            id: "fixture-0001".to_string(),
            timestamp: 1_700_000_000,
            model: "gpt-4o-mini".to_string(),
            input_tokens: 100,
            output_tokens: 50,
            cached_tokens: 0,
            actual_cost: 0.001,
            cost_without_shield: 0.002,
            total_saved: 0.001,
            savings: Savings {
                cache: 0.001,
                ..Default::default()
            },
            feature: None,
            latency_ms: None,
            cache_hit: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelSummary {
    pub calls: u64,
    pub cost: f64,
    pub tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FeatureSummary {
    pub calls: u64,
    pub cost: f64,
    pub saved: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerSummary {
    pub total_calls: u64,
    pub total_spent: f64,
    pub total_saved: f64,
    pub total_cost_without_shield: f64,
    pub savings: Savings,
    pub by_model: HashMap<String, ModelSummary>,
    pub by_feature: HashMap<String, FeatureSummary>,
    pub cache_hits: u64,
    pub calls_blocked: u64,
    pub cache_hit_rate: f64,
    pub savings_rate: f64,
    pub avg_cost_per_call: f64,
    pub avg_savings_per_call: f64,
    pub entries: Vec<LedgerEntry>,
}

const UNTAGGED_FEATURE: &str = "_untagged";

/// Records every completed provider call. Capped at `max_entries` with
/// FIFO eviction on overflow, and able to merge entries broadcast from
/// sibling ledger instances in the same process.
pub struct CostLedger {
    max_entries: usize,
    pricing: Arc<ModelPricingTable>,
    entries: Mutex<VecDeque<LedgerEntry>>,
    storage: Arc<dyn StorageAdapter>,
    broadcast: Arc<dyn BroadcastChannel>,
    event_sink: Arc<dyn EventSink>,
    persist: bool,
    listeners: Mutex<Vec<Box<dyn Fn(&LedgerEntry) + Send + Sync>>>,
}

impl std::fmt::Debug for CostLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostLedger")
            .field("max_entries", &self.max_entries)
            .field("persist", &self.persist)
            .finish_non_exhaustive()
    }
}

impl CostLedger {
    pub fn new(
        max_entries: usize,
        persist: bool,
        pricing: Arc<ModelPricingTable>,
        storage: Arc<dyn StorageAdapter>,
        broadcast: Arc<dyn BroadcastChannel>,
        event_sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            max_entries,
            pricing,
            entries: Mutex::new(VecDeque::new()),
            storage,
            broadcast,
            event_sink,
            persist,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add_listener<F>(&self, f: F)
    where
        F: Fn(&LedgerEntry) + Send + Sync + 'static,
    {
        self.listeners.lock().unwrap().push(Box::new(f));
    }

    fn notify(&self, entry: &LedgerEntry) {
        for listener in self.listeners.lock().unwrap().iter() {
            listener(entry);
        }
        self.event_sink.emit(PipelineEvent::LedgerEntry {
            id: entry.id.clone(),
            total_saved: entry.total_saved,
        });
    }

    fn push(&self, entry: LedgerEntry) {
        let mut entries = self.entries.lock().unwrap();
        entries.push_back(entry);
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    async fn persist_entry(&self, entry: &LedgerEntry) {
        if !self.persist {
            return;
        }
        match serde_json::to_string(entry) {
            Ok(payload) => {
                let key = format!("{LEDGER_STORAGE_PREFIX}{}", entry.id);
                if let Err(e) = self.storage.set(&key, &payload).await {
                    log_debug!(error = %e, "ledger persistence failed");
                }
            }
            Err(e) => log_debug!(error = %e, "ledger entry serialization failed"),
        }
    }

    async fn broadcast_entry(&self, entry: &LedgerEntry) {
        let _ = self.broadcast.publish(BroadcastMessage::NewEntry(entry.clone())).await;
    }

    /// Record a completed provider call and compute its cost/savings.
    pub async fn record(&self, input: RecordInput) -> LedgerEntry {
        let actual_cost = cost(
            &self.pricing,
            &input.model,
            input.input_tokens,
            input.output_tokens,
            input.cached_tokens,
        );
        let baseline_model = input.original_model.as_deref().unwrap_or(&input.model);
        let baseline_input = input.original_input_tokens.unwrap_or(input.input_tokens);
        let cost_without_shield = cost(&self.pricing, baseline_model, baseline_input, input.output_tokens, 0);
        let total_saved = cost_without_shield - actual_cost;

        let entry = LedgerEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now(),
            model: input.model,
            input_tokens: input.input_tokens,
            output_tokens: input.output_tokens,
            cached_tokens: input.cached_tokens,
            actual_cost,
            cost_without_shield,
            total_saved,
            savings: input.savings,
            feature: input.feature,
            latency_ms: input.latency_ms,
            cache_hit: input.cache_hit,
        };

        self.push(entry.clone());
        self.persist_entry(&entry).await;
        self.broadcast_entry(&entry).await;
        self.notify(&entry);
        entry
    }

    /// Synthesize a zero-cost entry for a request the Request Guard or
    /// Circuit Breaker denied before it ever reached the provider.
    pub async fn record_blocked(&self, model: &str, est_input_tokens: u32, est_output_tokens: u32) -> LedgerEntry {
        let would_have_cost = cost(&self.pricing, model, est_input_tokens, est_output_tokens, 0);
        self.record(RecordInput {
            model: model.to_string(),
            input_tokens: 0,
            output_tokens: 0,
            savings: Savings {
                guard: would_have_cost,
                ..Default::default()
            },
            cache_hit: false,
            ..Default::default()
        })
        .await
    }

    /// Synthesize a zero-cost entry for a request the Response Cache
    /// answered without a provider call.
    pub async fn record_cache_hit(&self, model: &str, input_tokens: u32, output_tokens: u32) -> LedgerEntry {
        let would_have_cost = cost(&self.pricing, model, input_tokens, output_tokens, 0);
        self.record(RecordInput {
            model: model.to_string(),
            input_tokens: 0,
            output_tokens: 0,
            savings: Savings {
                cache: would_have_cost,
                ..Default::default()
            },
            cache_hit: true,
            ..Default::default()
        })
        .await
    }

    /// Merge entries received from a sibling process's broadcast. Only
    /// entries whose ID is not already present are inserted; the full list
    /// is then stable-sorted by timestamp.
    pub fn merge(&self, incoming: Vec<LedgerEntry>) {
        if incoming.is_empty() {
            return;
        }
        let mut entries = self.entries.lock().unwrap();
        let existing_ids: std::collections::HashSet<String> = entries.iter().map(|e| e.id.clone()).collect();
        let mut inserted = Vec::new();
        for entry in incoming {
            if !existing_ids.contains(&entry.id) {
                inserted.push(entry.clone());
                entries.push_back(entry);
            }
        }
        let mut as_vec: Vec<LedgerEntry> = entries.drain(..).collect();
        as_vec.sort_by_key(|e| e.timestamp);
        while as_vec.len() > self.max_entries {
            as_vec.remove(0);
        }
        *entries = as_vec.into();
        drop(entries);
        for entry in &inserted {
            self.notify(entry);
        }
    }

    /// Drain and merge any entries published by sibling ledgers since the
    /// last poll.
    pub async fn sync_from_broadcast(&self) {
        if let Ok(messages) = self.broadcast.poll().await {
            let incoming: Vec<LedgerEntry> = messages
                .into_iter()
                .map(|BroadcastMessage::NewEntry(e)| e)
                .collect();
            self.merge(incoming);
        }
    }

    pub fn summary(&self) -> LedgerSummary {
        let entries = self.entries.lock().unwrap();
        let mut summary = LedgerSummary::default();
        summary.total_calls = entries.len() as u64;

        for entry in entries.iter() {
            summary.total_spent += entry.actual_cost;
            summary.total_saved += entry.total_saved;
            summary.total_cost_without_shield += entry.cost_without_shield;
            summary.savings.guard += entry.savings.guard;
            summary.savings.cache += entry.savings.cache;
            summary.savings.context += entry.savings.context;
            summary.savings.router += entry.savings.router;
            summary.savings.prefix += entry.savings.prefix;
            summary.savings.compressor += entry.savings.compressor;
            summary.savings.delta += entry.savings.delta;

            let model_entry = summary.by_model.entry(entry.model.clone()).or_default();
            model_entry.calls += 1;
            model_entry.cost += entry.actual_cost;
            model_entry.tokens += (entry.input_tokens + entry.output_tokens) as u64;

            let feature_key = entry.feature.clone().unwrap_or_else(|| UNTAGGED_FEATURE.to_string());
            let feature_entry = summary.by_feature.entry(feature_key).or_default();
            feature_entry.calls += 1;
            feature_entry.cost += entry.actual_cost;
            feature_entry.saved += entry.total_saved;

            if entry.cache_hit {
                summary.cache_hits += 1;
            }
            if entry.input_tokens == 0 && entry.savings.guard > 0.0 {
                summary.calls_blocked += 1;
            }
        }

        summary.cache_hit_rate = if summary.total_calls > 0 {
            summary.cache_hits as f64 / summary.total_calls as f64
        } else {
            0.0
        };
        let denom = summary.total_spent + summary.total_saved;
        summary.savings_rate = if denom > 0.0 { summary.total_saved / denom } else { 0.0 };
        summary.avg_cost_per_call = if summary.total_calls > 0 {
            summary.total_spent / summary.total_calls as f64
        } else {
            0.0
        };
        summary.avg_savings_per_call = if summary.total_calls > 0 {
            summary.total_saved / summary.total_calls as f64
        } else {
            0.0
        };
        summary.entries = entries.iter().cloned().collect();
        summary
    }

    /// JSON export: `{exportedAt, summary, entries}`.
    pub fn export_json(&self) -> ShieldJsonResult {
        let summary = self.summary();
        let exported_at = chrono::Utc::now().to_rfc3339();
        let payload = serde_json::json!({
            "exportedAt": exported_at,
            "summary": &summary,
            "entries": &summary.entries,
        });
        serde_json::to_string_pretty(&payload).unwrap_or_else(|_| "{}".to_string())
    }

    /// CSV export with the bit-exact header and RFC-4180 quoting required
    /// by the external-interface contract.
    pub fn export_csv(&self) -> String {
        let entries = self.entries.lock().unwrap();
        let mut out = String::from(
            "id,timestamp,model,inputTokens,outputTokens,cachedTokens,actualCost,costWithoutShield,totalSaved,feature,cacheHit,guard,cache,context,router,prefix\n",
        );
        for entry in entries.iter() {
            let timestamp = chrono::DateTime::from_timestamp(entry.timestamp, 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();
            let fields: Vec<String> = vec![
                entry.id.clone(),
                timestamp,
                entry.model.clone(),
                entry.input_tokens.to_string(),
                entry.output_tokens.to_string(),
                entry.cached_tokens.to_string(),
                format!("{:.6}", entry.actual_cost),
                format!("{:.6}", entry.cost_without_shield),
                format!("{:.6}", entry.total_saved),
                entry.feature.clone().unwrap_or_default(),
                entry.cache_hit.to_string(),
                format!("{:.6}", entry.savings.guard),
                format!("{:.6}", entry.savings.cache),
                format!("{:.6}", entry.savings.context),
                format!("{:.6}", entry.savings.router),
                format!("{:.6}", entry.savings.prefix),
            ];
            out.push_str(&fields.iter().map(|f| csv_quote(f)).collect::<Vec<_>>().join(","));
            out.push('\n');
        }
        out
    }

    /// Idempotent load of persisted entries. A second call with no new
    /// writes since the first is a no-op (every key was already present).
    pub async fn hydrate(&self) {
        let Ok(keys) = self.storage.keys().await else {
            return;
        };
        let mut loaded = Vec::new();
        for key in keys {
            if !key.starts_with(LEDGER_STORAGE_PREFIX) {
                continue;
            }
            if let Ok(Some(raw)) = self.storage.get(&key).await {
                if let Ok(entry) = serde_json::from_str::<LedgerEntry>(&raw) {
                    loaded.push(entry);
                }
            }
        }
        if loaded.is_empty() {
            return;
        }
        loaded.sort_by_key(|e| e.timestamp);
        self.merge(loaded);
    }
}

type ShieldJsonResult = String;

fn csv_quote(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod ledger_tests {
    use super::*;
    use crate::broadcast::NullBroadcastChannel;
    use crate::events::NullEventSink;
    use crate::storage::InMemoryStorageAdapter;

    // UNIT UNDER TEST: CostLedger accounting invariants
    // BUSINESS RESPONSIBILITY: total_saved must always reconcile with
    //   cost_without_shield - actual_cost, unknown models must never cost
    //   zero, FIFO eviction must cap entries at max_entries, and CSV export
    //   must quote exactly the fields the contract requires.
    // TEST COVERAGE:
    //   - total_saved == cost_without_shield - actual_cost
    //   - unknown model record produces nonzero actual_cost
    //   - FIFO prune retains only the most recent max_entries
    //   - record_blocked marks calls_blocked in the summary
    //   - CSV quoting wraps fields containing comma/quote/newline
    //   - merge is idempotent on duplicate IDs

    fn ledger(max_entries: usize) -> CostLedger {
        CostLedger::new(
            max_entries,
            false,
            Arc::new(ModelPricingTable::with_common_models()),
            Arc::new(InMemoryStorageAdapter::new()),
            Arc::new(NullBroadcastChannel),
            Arc::new(NullEventSink),
        )
    }

    #[tokio::test]
    async fn total_saved_reconciles_with_cost_difference() {
        // Arrange
        let l = ledger(100);

        // Act
        let entry = l
            .record(RecordInput {
                model: "gpt-4o".to_string(),
                input_tokens: 1000,
                output_tokens: 500,
                savings: Savings {
                    cache: 0.01,
                    ..Default::default()
                },
                ..Default::default()
            })
            .await;

        // Assert
        assert!((entry.total_saved - (entry.cost_without_shield - entry.actual_cost)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unknown_model_record_has_nonzero_actual_cost() {
        // Arrange
        let l = ledger(100);

        // Act
        let entry = l
            .record(RecordInput {
                model: "totally-unknown".to_string(),
                input_tokens: 1_000_000,
                output_tokens: 0,
                ..Default::default()
            })
            .await;

        // Assert
        assert!((entry.actual_cost - 0.15).abs() < 1e-9);
    }

    #[tokio::test]
    async fn fifo_prune_retains_only_max_entries_most_recent() {
        // Arrange
        let l = ledger(3);

        // Act
        for i in 0..5 {
            l.record(RecordInput {
                model: "gpt-4o-mini".to_string(),
                input_tokens: i,
                output_tokens: 0,
                ..Default::default()
            })
            .await;
        }
        let summary = l.summary();

        // Assert
        assert_eq!(summary.total_calls, 3);
        let input_tokens: Vec<u32> = summary.entries.iter().map(|e| e.input_tokens).collect();
        assert_eq!(input_tokens, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn record_blocked_is_counted_in_calls_blocked() {
        // Arrange
        let l = ledger(100);

        // Act
        l.record_blocked("gpt-4o", 500, 100).await;
        let summary = l.summary();

        // Assert
        assert_eq!(summary.calls_blocked, 1);
        assert!(summary.savings.guard > 0.0);
    }

    #[test]
    fn csv_quote_wraps_fields_with_special_characters() {
        // Act / Assert
        assert_eq!(csv_quote("plain"), "plain");
        assert_eq!(csv_quote("a,b"), "\"a,b\"");
        assert_eq!(csv_quote("a\"b"), "\"a\"\"b\"");
        assert_eq!(csv_quote("a\nb"), "\"a\nb\"");
    }

    #[tokio::test]
    async fn merge_ignores_entries_with_already_present_ids() {
        // Arrange
        let l = ledger(100);
        let entry = l
            .record(RecordInput {
                model: "gpt-4o-mini".to_string(),
                input_tokens: 10,
                output_tokens: 5,
                ..Default::default()
            })
            .await;

        // Act
        l.merge(vec![entry.clone()]);
        let summary = l.summary();

        // Assert
        assert_eq!(summary.total_calls, 1);
    }
}
