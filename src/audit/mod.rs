//! Tracing, audit records, and budget metering.
//!
//! Every request carries a [`PipelineTrace`]: an append-only record of stage
//! events, query rewrites, corrective actions, and the final source
//! attributions. Traces and audit records are written as JSON lines through a
//! [`TraceSink`]. The [`BudgetMeter`] enforces per-request hard caps on LLM
//! calls and output tokens.
//!
//! Invariant: every result surfaced to the caller has exactly one
//! attribution entry in the trace, keyed by its chunk identifier.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{CoreError, EvidenceLevel, Result, RetrievalResult};

/// Install the process-wide tracing subscriber.
///
/// Host services call this once at startup; `RUST_LOG` controls the filter.
/// Safe to call more than once (later calls are no-ops).
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}

// ============================================================================
// Stage Events
// ============================================================================

/// One per event kind; downstream tools are the ones that stay loose.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StageEvent {
    QueryRewrite {
        rewrite_type: QueryRewriteKind,
        original: String,
        rewritten: Vec<String>,
        latency_ms: u64,
    },
    Routing {
        datasets: Vec<String>,
        refined_query: Option<String>,
    },
    LexicalGating {
        pattern_matched: bool,
        top_score: f32,
        vector_skipped: bool,
    },
    Retrieval {
        retriever: String,
        datasets: Vec<String>,
        result_count: usize,
        latency_ms: u64,
    },
    Fusion {
        input_lists: usize,
        merged_count: usize,
    },
    CragGate {
        gate_passed: bool,
        evidence_level: EvidenceLevel,
        best_score: f32,
        avg_top3: f32,
        result_count: usize,
    },
    Rerank {
        provider: String,
        candidate_count: usize,
        latency_ms: u64,
    },
    ChunkExpansion {
        extra_chunks: usize,
        merged: usize,
    },
    Compression {
        compressed_count: usize,
        total_chars_saved: usize,
    },
    GraphEnrichment {
        seed_entities: usize,
        paths: usize,
        triples: usize,
        latency_ms: u64,
    },
    CacheHit {
        cache: String,
    },
    BudgetSkip {
        stage: String,
        reason: String,
    },
    StageError {
        stage: String,
        error: String,
    },
    StageTimeout {
        stage: String,
        deadline_ms: u64,
    },
}

/// Types of query rewrites, for audit bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryRewriteKind {
    Conversational,
    Hyde,
    MultiQuery,
    Crag,
    Decomposition,
}

/// A stage event with its timestamp, as appended to the trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracedEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: StageEvent,
}

// ============================================================================
// Attribution & Corrective Actions
// ============================================================================

/// A single source attribution with score and evidence level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceAttribution {
    pub chunk_uid: String,
    /// Which retrievers produced the chunk, comma-joined ("lexical,vector").
    pub retrievers: String,
    pub dataset: String,
    pub score: f32,
    pub rank: usize,
    pub evidence_level: EvidenceLevel,
    pub doc_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_snippet: Option<String>,
}

impl SourceAttribution {
    /// Build the attribution for a final-list entry.
    pub fn from_result(result: &RetrievalResult, rank: usize, level: EvidenceLevel) -> Self {
        let retrievers = result
            .retrievers
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(",");
        Self {
            chunk_uid: result.chunk.chunk_uid.clone(),
            retrievers,
            dataset: result.chunk.dataset.clone(),
            score: result.final_score(),
            rank,
            evidence_level: level,
            doc_id: result.chunk.doc_id.clone(),
            text_snippet: Some(result.working_text().chars().take(220).collect()),
        }
    }
}

/// Record of a single corrective action attempted by the CRAG orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectiveActionRecord {
    pub strategy: String,
    pub success: bool,
    pub duration_ms: u64,
    pub result_count: usize,
    pub best_score: f32,
    pub avg_top3: f32,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Pipeline Trace
// ============================================================================

/// Per-request trace. Append-only within a request; owned exclusively by the
/// orchestrator task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineTrace {
    pub request_id: String,
    pub tenant_id: String,
    pub query_original: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_rewritten: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub events: Vec<TracedEvent>,
    pub corrective_actions: Vec<CorrectiveActionRecord>,
    pub attributions: Vec<SourceAttribution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_level: Option<EvidenceLevel>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub total_latency_ms: u64,
}

impl PipelineTrace {
    /// Start a trace for a request.
    pub fn new(tenant_id: &str, query: &str) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            query_original: query.to_string(),
            query_rewritten: None,
            started_at: Utc::now(),
            finished_at: None,
            events: Vec::new(),
            corrective_actions: Vec::new(),
            attributions: Vec::new(),
            evidence_level: None,
            warnings: Vec::new(),
            errors: Vec::new(),
            total_latency_ms: 0,
        }
    }

    /// Append a stage event.
    pub fn record(&mut self, event: StageEvent) {
        self.events.push(TracedEvent {
            at: Utc::now(),
            event,
        });
    }

    /// Append a corrective action.
    pub fn record_corrective_action(&mut self, action: CorrectiveActionRecord) {
        self.corrective_actions.push(action);
    }

    /// Whether a corrective strategy already appears in the trail.
    pub fn strategy_used(&self, strategy: &str) -> bool {
        self.corrective_actions.iter().any(|a| a.strategy == strategy)
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// Attach one attribution per final result, in rank order.
    pub fn attribute_results(&mut self, results: &[RetrievalResult], level: EvidenceLevel) {
        self.attributions = results
            .iter()
            .enumerate()
            .map(|(i, r)| SourceAttribution::from_result(r, i + 1, level))
            .collect();
    }

    /// Close the trace and stamp the total latency.
    pub fn finalize(&mut self, level: EvidenceLevel) {
        self.evidence_level = Some(level);
        let now = Utc::now();
        self.total_latency_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.finished_at = Some(now);
    }
}

// ============================================================================
// Trace Sink
// ============================================================================

/// Append-only sink for finished traces and audit records.
pub trait TraceSink: Send + Sync {
    /// Append one JSON-serializable record.
    fn append(&self, record: &serde_json::Value) -> Result<()>;
}

/// JSON-lines file sink, one record per line.
///
/// The parent directory is created on first write. Writes are serialized
/// through a mutex; the file handle is kept open for the process lifetime.
pub struct JsonlTraceSink {
    file: Mutex<Option<std::fs::File>>,
    path: String,
}

impl JsonlTraceSink {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            file: Mutex::new(None),
            path: path.into(),
        }
    }

    fn open(&self) -> Result<std::fs::File> {
        if let Some(parent) = Path::new(&self.path).parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CoreError::Internal(format!("Failed to create trace dir: {}", e)))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| CoreError::Internal(format!("Failed to open trace log: {}", e)))
    }
}

impl TraceSink for JsonlTraceSink {
    fn append(&self, record: &serde_json::Value) -> Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| CoreError::Internal(format!("Failed to serialize trace: {}", e)))?;

        let mut guard = self.file.lock();
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        let file = guard.as_mut().expect("file opened above");
        writeln!(file, "{}", line)
            .map_err(|e| CoreError::Internal(format!("Failed to write trace: {}", e)))?;
        Ok(())
    }
}

/// A sink that drops every record. Used when tracing is disabled.
#[derive(Debug, Default)]
pub struct NoopTraceSink;

impl TraceSink for NoopTraceSink {
    fn append(&self, _record: &serde_json::Value) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Budget Meter
// ============================================================================

/// Per-request cost counters with hard caps.
///
/// Cumulative LLM calls and output tokens are tracked with atomics so stages
/// can charge concurrently. Exceeding either cap aborts the request with
/// [`CoreError::BudgetExceeded`].
pub struct BudgetMeter {
    llm_calls: AtomicU64,
    output_tokens: AtomicU64,
    started: Instant,
    max_llm_calls: u64,
    max_tokens: u64,
    warn_at_percent: f32,
}

impl BudgetMeter {
    pub fn new(max_llm_calls: u64, max_tokens: u64, warn_at_percent: f32) -> Self {
        Self {
            llm_calls: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
            started: Instant::now(),
            max_llm_calls,
            max_tokens,
            warn_at_percent,
        }
    }

    /// Charge one LLM call and its output tokens.
    ///
    /// Fails when either cap would be surpassed; the counters are still
    /// incremented so the trace reflects the attempted spend.
    pub fn charge(&self, output_tokens: u64) -> Result<()> {
        let calls = self.llm_calls.fetch_add(1, Ordering::Relaxed) + 1;
        let tokens = self.output_tokens.fetch_add(output_tokens, Ordering::Relaxed) + output_tokens;

        if calls > self.max_llm_calls {
            return Err(CoreError::BudgetExceeded(format!(
                "LLM call budget exhausted: {} > {}",
                calls, self.max_llm_calls
            )));
        }
        if tokens > self.max_tokens {
            return Err(CoreError::BudgetExceeded(format!(
                "Token budget exhausted: {} > {}",
                tokens, self.max_tokens
            )));
        }

        if calls as f32 >= self.max_llm_calls as f32 * self.warn_at_percent {
            tracing::warn!(
                llm_calls = calls,
                max = self.max_llm_calls,
                "request approaching LLM call budget"
            );
        }
        Ok(())
    }

    /// Whether another LLM call fits the budget, without charging.
    pub fn can_afford_call(&self) -> bool {
        self.llm_calls.load(Ordering::Relaxed) < self.max_llm_calls
            && self.output_tokens.load(Ordering::Relaxed) < self.max_tokens
    }

    pub fn llm_calls(&self) -> u64 {
        self.llm_calls.load(Ordering::Relaxed)
    }

    pub fn output_tokens(&self) -> u64 {
        self.output_tokens.load(Ordering::Relaxed)
    }

    /// Wall time since the request started.
    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chunk, ChunkMetadata, RetrieverKind, SourceType};

    fn result(uid_seed: usize, score: f32) -> RetrievalResult {
        let chunk = Chunk {
            chunk_uid: Chunk::uid("doc", uid_seed),
            source_type: SourceType::Statute,
            dataset: "rag-lei".to_string(),
            text: format!("chunk {}", uid_seed),
            position: uid_seed,
            doc_id: "doc".to_string(),
            metadata: ChunkMetadata::default(),
        };
        let mut r = RetrievalResult::from_hit(chunk, score, RetrieverKind::Lexical);
        r.fused_score = score;
        r
    }

    #[test]
    fn test_trace_is_append_only_ordering() {
        let mut trace = PipelineTrace::new("t1", "query");
        trace.record(StageEvent::Fusion {
            input_lists: 2,
            merged_count: 5,
        });
        trace.record(StageEvent::Rerank {
            provider: "local".to_string(),
            candidate_count: 5,
            latency_ms: 12,
        });
        assert_eq!(trace.events.len(), 2);
        assert!(matches!(trace.events[0].event, StageEvent::Fusion { .. }));
    }

    #[test]
    fn test_attribution_cardinality_matches_results() {
        let results = vec![result(0, 0.9), result(1, 0.7), result(2, 0.5)];
        let mut trace = PipelineTrace::new("t1", "q");
        trace.attribute_results(&results, EvidenceLevel::Strong);

        assert_eq!(trace.attributions.len(), results.len());
        for (i, (attr, r)) in trace.attributions.iter().zip(&results).enumerate() {
            assert_eq!(attr.chunk_uid, r.chunk.chunk_uid);
            assert_eq!(attr.rank, i + 1);
        }
    }

    #[test]
    fn test_strategy_used_lookup() {
        let mut trace = PipelineTrace::new("t1", "q");
        assert!(!trace.strategy_used("multi_query"));
        trace.record_corrective_action(CorrectiveActionRecord {
            strategy: "multi_query".to_string(),
            success: false,
            duration_ms: 40,
            result_count: 2,
            best_score: 0.2,
            avg_top3: 0.15,
            parameters: serde_json::json!({}),
            error: None,
        });
        assert!(trace.strategy_used("multi_query"));
        assert!(!trace.strategy_used("hyde"));
    }

    #[test]
    fn test_budget_meter_caps_calls() {
        let meter = BudgetMeter::new(2, 1000, 0.8);
        assert!(meter.charge(10).is_ok());
        assert!(meter.charge(10).is_ok());
        assert!(matches!(
            meter.charge(10),
            Err(CoreError::BudgetExceeded(_))
        ));
        assert!(!meter.can_afford_call());
    }

    #[test]
    fn test_budget_meter_caps_tokens() {
        let meter = BudgetMeter::new(10, 100, 0.8);
        assert!(meter.charge(90).is_ok());
        assert!(matches!(
            meter.charge(50),
            Err(CoreError::BudgetExceeded(_))
        ));
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");
        let sink = JsonlTraceSink::new(path.to_string_lossy().to_string());

        sink.append(&serde_json::json!({"a": 1})).unwrap();
        sink.append(&serde_json::json!({"b": 2})).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"a\":1"));
    }

    #[test]
    fn test_finalize_stamps_level_and_latency() {
        let mut trace = PipelineTrace::new("t1", "q");
        trace.finalize(EvidenceLevel::Moderate);
        assert_eq!(trace.evidence_level, Some(EvidenceLevel::Moderate));
        assert!(trace.finished_at.is_some());
    }
}
