//! Randomized checks of pool capacity, classifier determinism, budget accounting
//! and consolidation replay.

use agent_orchestrator::{
    agent::DefaultAgentFactory,
    classifier::IntentClassifier,
    memory::{Consolidator, FactContent, FactStore, Importance, InMemoryFactStore, MemoryFact},
    pool::{AgentPoolManager, ReleaseOutcome},
    registry::{AgentKind, CapabilityRegistry},
    selector::Budget,
    settings::{ClassifierConfig, PoolConfig},
    task::{SubmitContext, TaskType},
};
use chrono::{TimeZone, Utc};
use futures::future::join_all;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn busy_instances_never_exceed_capacity(
        max in 1usize..4,
        holds in prop::collection::vec(0u64..4, 1..12),
    ) {
        tokio_test::block_on(async {
            let registry = Arc::new(
                CapabilityRegistry::new(vec![AgentKind::new("Worker", &["work"], max)]).unwrap(),
            );
            let pools = Arc::new(AgentPoolManager::new(
                registry,
                Arc::new(DefaultAgentFactory::new()),
                &PoolConfig::default(),
            ));
            let holding = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));

            let runs = holds.iter().map(|hold| {
                let pools = pools.clone();
                let holding = holding.clone();
                let peak = peak.clone();
                let hold = *hold;
                async move {
                    let lease = pools.acquire("Worker").await.unwrap();
                    let now = holding.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    let stats = pools.stats("Worker").unwrap();
                    assert!(stats.busy <= max);
                    assert!(stats.live <= max);
                    tokio::time::sleep(Duration::from_millis(hold)).await;
                    holding.fetch_sub(1, Ordering::SeqCst);
                    lease.release(ReleaseOutcome::Success);
                }
            });
            join_all(runs).await;

            assert!(peak.load(Ordering::SeqCst) <= max);
            let stats = pools.stats("Worker").unwrap();
            assert_eq!(stats.busy, 0);
            assert_eq!(stats.waiting, 0);
        });
    }

    #[test]
    fn pattern_pass_is_deterministic(text in "[a-z ]{0,40}(kpi report|sync crm|deal|metrics)?[a-z ]{0,20}") {
        let known: BTreeSet<TaskType> =
            ["metrics_report", "crm_sync"].iter().map(|t| TaskType::named(*t)).collect();
        let classifier = IntentClassifier::new(&ClassifierConfig::default(), known).unwrap();
        let ctx = SubmitContext::default();

        let first = classifier.pattern_pass(&text, &ctx);
        let second = classifier.pattern_pass(&text, &ctx);
        prop_assert_eq!(&first, &second);
        for pair in first.windows(2) {
            prop_assert!(pair[0].confidence >= pair[1].confidence);
        }
        for intent in &first {
            prop_assert!((0.0..=1.0).contains(&intent.confidence));
        }
    }

    #[test]
    fn budget_never_goes_negative(ops in prop::collection::vec((0u8..3, 0.0f64..3.0, 0.0f64..4.0), 1..40)) {
        let limit = 5.0;
        let budget = Budget::new(limit, Duration::from_secs(3600));
        let mut open = Vec::new();

        for (op, amount, actual) in ops {
            match op {
                0 => {
                    if let Ok(reservation) = budget.reserve(amount) {
                        open.push(reservation);
                    }
                }
                1 => {
                    if let Some(reservation) = open.pop() {
                        budget.settle(reservation, actual);
                    }
                }
                _ => {
                    if let Some(reservation) = open.pop() {
                        budget.refund(reservation);
                    }
                }
            }
            let snap = budget.snapshot();
            prop_assert!(snap.spent >= 0.0);
            prop_assert!(snap.spent <= limit + 1e-9);
            prop_assert!(budget.remaining() >= 0.0);
        }
    }

    #[test]
    fn consolidation_replay_is_idempotent(
        facts in prop::collection::vec((0usize..2, 0usize..3, 0i64..5, 0usize..4), 1..16),
    ) {
        tokio_test::block_on(async {
            let subjects = ["Acme", "Globex"];
            let values = ["prospect", "negotiation", "closed"];
            let levels = [Importance::Low, Importance::Normal, Importance::High, Importance::Critical];

            let store: Arc<dyn FactStore> = Arc::new(InMemoryFactStore::new());
            for (position, (s, v, t, i)) in facts.iter().enumerate() {
                let fact = MemoryFact::new(
                    Uuid::new_v4(),
                    position,
                    FactContent::Triple {
                        subject: subjects[*s].to_string(),
                        predicate: "deal_stage".to_string(),
                        value: values[*v].to_string(),
                    },
                    Utc.timestamp_opt(1_700_000_000 + t, 0).unwrap(),
                )
                .with_importance(levels[*i]);
                store.append(fact).await.unwrap();
            }

            let consolidator = Consolidator::new(store.clone(), 3);
            consolidator.run_until_idle().await.unwrap();
            let settled = store.since(0, 100).await.unwrap();

            let replay = consolidator.reconsolidate_all().await.unwrap();
            assert_eq!(replay.superseded, 0);
            assert_eq!(replay.activated, 0);
            assert_eq!(store.since(0, 100).await.unwrap(), settled);

            // every subject ends with a single surviving value
            for subject in subjects {
                let live: BTreeSet<String> = settled
                    .iter()
                    .filter(|f| f.content.subject() == Some(subject) && !f.is_superseded())
                    .filter_map(|f| f.content.value().map(str::to_lowercase))
                    .collect();
                assert!(live.len() <= 1, "{} has values {:?}", subject, live);
            }
        });
    }
}
