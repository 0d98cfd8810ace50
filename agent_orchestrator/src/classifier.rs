//! Intent classification: free text to ranked (task type, confidence) pairs.
//!
//! The pattern pass is pure and deterministic. When it is not confident enough, an
//! optional model pass runs through the [`ModelSelector`] and its answers are merged in;
//! model output is advisory and any failure degrades to pattern-only results.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{OrchestratorError, Result};
use crate::selector::{CompletionParams, ModelSelector, SelectionPolicy};
use crate::settings::ClassifierConfig;
use crate::task::{SubmitContext, TaskType};

/// Metadata key callers may set to name the task type outright.
pub const TASK_TYPE_HINT: &str = "task_type";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub task_type: TaskType,
    pub confidence: f32,
}

struct CompiledRule {
    task_type: TaskType,
    patterns: Vec<Regex>,
    keywords: Vec<String>,
    confidence: f32,
}

struct ModelAssist {
    selector: Arc<ModelSelector>,
    task_type: TaskType,
    policy: SelectionPolicy,
}

#[derive(Deserialize)]
struct ModelIntent {
    task_type: String,
    confidence: f32,
}

pub struct IntentClassifier {
    rules: Vec<CompiledRule>,
    known: BTreeSet<TaskType>,
    min_confidence: f32,
    short_circuit_threshold: f32,
    keyword_weight: f32,
    keyword_cap: f32,
    model_task_type: Option<TaskType>,
    model: Option<ModelAssist>,
}

impl IntentClassifier {
    /// `known` is the set of task types the model pass may answer with.
    pub fn new(config: &ClassifierConfig, known: BTreeSet<TaskType>) -> Result<Self> {
        let mut rules = Vec::with_capacity(config.rules.len());
        for rule in &config.rules {
            let patterns = rule
                .patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        OrchestratorError::Config(format!(
                            "invalid pattern for '{}': {}",
                            rule.task_type, e
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            rules.push(CompiledRule {
                task_type: TaskType::from(rule.task_type.as_str()),
                patterns,
                keywords: rule.keywords.iter().map(|k| k.to_lowercase()).collect(),
                confidence: rule.confidence.clamp(0.0, 1.0),
            });
        }

        let mut known = known;
        known.extend(rules.iter().map(|r| r.task_type.clone()));

        Ok(Self {
            rules,
            known,
            min_confidence: config.min_confidence,
            short_circuit_threshold: config.short_circuit_threshold,
            keyword_weight: config.keyword_weight,
            keyword_cap: config.keyword_cap,
            model_task_type: config.model_task_type.as_deref().map(TaskType::from),
            model: None,
        })
    }

    /// Enable the model pass. A no-op unless a model task type is configured.
    pub fn with_model(mut self, selector: Arc<ModelSelector>, policy: SelectionPolicy) -> Self {
        if let Some(task_type) = self.model_task_type.clone() {
            self.model = Some(ModelAssist {
                selector,
                task_type,
                policy,
            });
        }
        self
    }

    pub fn known_types(&self) -> &BTreeSet<TaskType> {
        &self.known
    }

    /// Pattern, keyword and hint scoring. Pure.
    pub fn pattern_pass(&self, text: &str, ctx: &SubmitContext) -> Vec<Intent> {
        let mut scores: BTreeMap<TaskType, f32> = BTreeMap::new();

        if let Some(hint) = ctx.metadata.get(TASK_TYPE_HINT) {
            let hinted = TaskType::from(hint.as_str());
            if self.known.contains(&hinted) {
                scores.insert(hinted, 1.0);
            } else {
                debug!("Ignoring hint for unknown task type '{}'", hint);
            }
        }

        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect();

        for rule in &self.rules {
            let pattern_score = if rule.patterns.iter().any(|p| p.is_match(text)) {
                rule.confidence
            } else {
                0.0
            };

            // keywords match word prefixes, so "deal" also counts "deals"
            let hits = rule
                .keywords
                .iter()
                .filter(|k| words.iter().any(|w| w.starts_with(k.as_str())))
                .count();
            let keyword_score = (hits as f32 * self.keyword_weight).min(self.keyword_cap);

            let score = pattern_score.max(keyword_score);
            if score > 0.0 {
                let entry = scores.entry(rule.task_type.clone()).or_insert(0.0);
                *entry = entry.max(score);
            }
        }

        self.rank(scores)
    }

    fn rank(&self, scores: BTreeMap<TaskType, f32>) -> Vec<Intent> {
        let mut intents: Vec<Intent> = scores
            .into_iter()
            .map(|(task_type, confidence)| Intent {
                task_type,
                confidence: confidence.clamp(0.0, 1.0),
            })
            .filter(|i| i.confidence >= self.min_confidence)
            .collect();
        intents.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.task_type.as_str().cmp(b.task_type.as_str()))
        });
        intents
    }

    /// Full classification: pattern pass, then the model pass if not short-circuited.
    #[instrument(skip(self, text, ctx, cancel))]
    pub async fn classify(
        &self,
        text: &str,
        ctx: &SubmitContext,
        cancel: &CancellationToken,
    ) -> Vec<Intent> {
        let pattern = self.pattern_pass(text, ctx);

        if let Some(top) = pattern.first() {
            if top.confidence >= self.short_circuit_threshold {
                debug!("Confident pattern match '{}' ({:.2})", top.task_type, top.confidence);
                return pattern;
            }
        }

        let Some(model) = &self.model else {
            return pattern;
        };

        match self.model_pass(model, text, cancel).await {
            Ok(suggested) => {
                let mut merged: BTreeMap<TaskType, f32> = BTreeMap::new();
                for intent in pattern.into_iter().chain(suggested) {
                    let entry = merged.entry(intent.task_type).or_insert(0.0);
                    *entry = entry.max(intent.confidence);
                }
                self.rank(merged)
            }
            Err(e) => {
                warn!("Model-assisted classification unavailable, using patterns only: {}", e);
                pattern
            }
        }
    }

    async fn model_pass(
        &self,
        model: &ModelAssist,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Intent>> {
        let types: Vec<&str> = self.known.iter().map(|t| t.as_str()).collect();
        let prompt = format!(
            "Classify the request into any of these task types: {}.\n\
             Answer only with a JSON array of {{\"task_type\": string, \"confidence\": number}}.\n\
             Request: {}",
            types.join(", "),
            text
        );

        let invocation = model
            .selector
            .invoke(
                &model.task_type,
                &model.policy,
                &prompt,
                &CompletionParams::default(),
                cancel,
            )
            .await?;

        let intents = parse_model_intents(&invocation.text, &self.known).ok_or_else(|| {
            OrchestratorError::provider(
                invocation.backend.clone(),
                "classification answer was not a JSON array of intents",
            )
        })?;
        debug!("Model pass suggested {} intent(s)", intents.len());
        Ok(intents)
    }
}

/// Extract the first JSON array in `text`; unknown types are dropped, confidences clamped.
fn parse_model_intents(text: &str, known: &BTreeSet<TaskType>) -> Option<Vec<Intent>> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end < start {
        return None;
    }
    let raw: Vec<serde_json::Value> = serde_json::from_str(&text[start..=end]).ok()?;

    Some(
        raw.into_iter()
            .filter_map(|v| serde_json::from_value::<ModelIntent>(v).ok())
            .map(|m| Intent {
                task_type: TaskType::from(m.task_type),
                confidence: if m.confidence.is_finite() {
                    m.confidence.clamp(0.0, 1.0)
                } else {
                    0.0
                },
            })
            .filter(|i| known.contains(&i.task_type))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::{Budget, Completion, CompletionBackend, CompletionError};
    use crate::settings::{BackendConfig, SelectorConfig};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    fn known() -> BTreeSet<TaskType> {
        ["metrics_report", "crm_sync", "general", "translate"]
            .into_iter()
            .map(TaskType::from)
            .collect()
    }

    fn classifier() -> IntentClassifier {
        IntentClassifier::new(&ClassifierConfig::default(), known()).unwrap()
    }

    #[test]
    fn test_pattern_match_ranks_first() {
        let c = classifier();
        let intents = c.pattern_pass("Please build the weekly KPI report", &SubmitContext::default());
        assert_eq!(intents[0].task_type, TaskType::named("metrics_report"));
        assert!((intents[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_keywords_accumulate_up_to_cap() {
        let c = classifier();
        let one = c.pattern_pass("update the crm", &SubmitContext::default());
        assert_eq!(one[0].task_type, TaskType::named("crm_sync"));
        assert!((one[0].confidence - 0.25).abs() < 1e-6);

        let three = c.pattern_pass("crm deals and contacts", &SubmitContext::default());
        assert!((three[0].confidence - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_nothing_above_floor_is_empty() {
        let c = classifier();
        assert!(c.pattern_pass("hello there", &SubmitContext::default()).is_empty());
    }

    #[test]
    fn test_hint_wins_only_for_known_types() {
        let c = classifier();
        let ctx = SubmitContext::default().with_meta(TASK_TYPE_HINT, "translate");
        let intents = c.pattern_pass("bonjour", &ctx);
        assert_eq!(intents, vec![Intent { task_type: TaskType::named("translate"), confidence: 1.0 }]);

        let ctx = SubmitContext::default().with_meta(TASK_TYPE_HINT, "poetry");
        assert!(c.pattern_pass("bonjour", &ctx).is_empty());
    }

    #[test]
    fn test_equal_confidence_ordered_by_name() {
        let c = classifier();
        let intents = c.pattern_pass("crm dashboard", &SubmitContext::default());
        let names: Vec<_> = intents.iter().map(|i| i.task_type.to_string()).collect();
        assert_eq!(names, vec!["crm_sync", "metrics_report"]);
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let mut config = ClassifierConfig::default();
        config.rules[0].patterns.push("(unclosed".to_string());
        assert!(matches!(
            IntentClassifier::new(&config, known()),
            Err(OrchestratorError::Config(_))
        ));
    }

    #[test]
    fn test_parse_model_intents_is_lenient() {
        let text = "Sure! [{\"task_type\": \"translate\", \"confidence\": 1.7}, \
                    {\"task_type\": \"poetry\", \"confidence\": 0.9}, {\"bogus\": 1}]";
        let parsed = parse_model_intents(text, &known()).unwrap();
        assert_eq!(parsed, vec![Intent { task_type: TaskType::named("translate"), confidence: 1.0 }]);
        assert!(parse_model_intents("no json here", &known()).is_none());
    }

    struct CannedBackend {
        answer: Result<String, CompletionError>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionBackend for CannedBackend {
        fn id(&self) -> &str {
            "intent-llm"
        }

        async fn complete(&self, _prompt: &str, _p: &CompletionParams) -> std::result::Result<Completion, CompletionError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            self.answer.clone().map(Completion::text)
        }
    }

    fn with_model(answer: std::result::Result<String, CompletionError>) -> (IntentClassifier, Arc<CannedBackend>) {
        let backend = Arc::new(CannedBackend { answer, calls: AtomicUsize::new(0) });
        let mut selector_config = SelectorConfig::default();
        selector_config.max_attempts = 1;
        selector_config.backends = vec![BackendConfig {
            id: "intent-llm".into(),
            provider: "canned".into(),
            cost_per_call: 0.001,
            latency_ms: 10,
            local: false,
        }];
        selector_config.routes = HashMap::from([("intent".to_string(), vec!["intent-llm".to_string()])]);
        let backends: HashMap<String, Arc<dyn CompletionBackend>> =
            HashMap::from([("intent-llm".to_string(), backend.clone() as Arc<dyn CompletionBackend>)]);
        let selector = ModelSelector::new(
            &selector_config,
            backends,
            Arc::new(Budget::new(1.0, Duration::from_secs(60))),
        )
        .unwrap();

        let mut config = ClassifierConfig::default();
        config.model_task_type = Some("intent".to_string());
        let classifier = IntentClassifier::new(&config, known())
            .unwrap()
            .with_model(Arc::new(selector), SelectionPolicy::default());
        (classifier, backend)
    }

    #[tokio::test]
    async fn test_confident_pattern_skips_model() {
        let (c, backend) = with_model(Ok("[]".into()));
        let intents = c
            .classify("metrics report please", &SubmitContext::default(), &CancellationToken::new())
            .await;
        assert_eq!(intents[0].task_type, TaskType::named("metrics_report"));
        assert_eq!(backend.calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_model_results_merged_by_max() {
        let (c, backend) = with_model(Ok(
            r#"[{"task_type":"translate","confidence":0.7},{"task_type":"crm_sync","confidence":0.3}]"#.into(),
        ));
        let intents = c
            .classify("move this crm note into french", &SubmitContext::default(), &CancellationToken::new())
            .await;
        assert_eq!(backend.calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(
            intents,
            vec![
                Intent { task_type: TaskType::named("translate"), confidence: 0.7 },
                Intent { task_type: TaskType::named("crm_sync"), confidence: 0.3 },
            ]
        );
    }

    #[tokio::test]
    async fn test_model_failure_degrades_to_patterns() {
        let (c, backend) = with_model(Err(CompletionError::RateLimited));
        let intents = c
            .classify("crm", &SubmitContext::default(), &CancellationToken::new())
            .await;
        assert_eq!(backend.calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(intents, vec![Intent { task_type: TaskType::named("crm_sync"), confidence: 0.25 }]);
    }
}
