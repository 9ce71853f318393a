//! Orchestrator-level integration tests exercising the crate's public
//! surface end to end, rather than a single module's internals.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::stream;
use futures::StreamExt;
use pretty_assertions::assert_eq;

use tokenshield_core::{
    Budget, Config, DoGenerate, GenerateOutcome, Message, ModelSpec, Params, PricingTable,
    Provider, TokenCounter, TokenShield, Usage,
};

fn test_pricing() -> PricingTable {
    PricingTable::new(vec![ModelSpec::new(
        "gpt-4o-mini",
        Provider::OpenAi,
        0.15,
        0.60,
    )])
}

fn shield(config: Config) -> TokenShield {
    TokenShield::new(config, test_pricing(), TokenCounter::new(Provider::OpenAi)).unwrap()
}

fn params(prompt: &str) -> Params {
    Params {
        model: "gpt-4o-mini".to_string(),
        messages: vec![Message::user(prompt)],
        user_id: None,
        expected_output_tokens: Some(5),
    }
}

fn ok_generate(text: &'static str, input: usize, output: usize) -> DoGenerate {
    Box::new(move |_p| {
        Box::pin(async move {
            Ok(GenerateOutcome {
                text: text.to_string(),
                usage: Usage {
                    prompt_tokens: input,
                    completion_tokens: output,
                },
                finish_reason: "stop".to_string(),
                cache_hit: false,
            })
        })
    })
}

#[tokio::test]
async fn cache_miss_then_store_then_hit() {
    let mut config = Config::default();
    // Isolated from the guard's dedup window (covered separately by
    // `guard_dedup_blocks_second_identical_call`) so the repeated identical
    // prompt here reaches the cache stage on both calls.
    config.modules.guard = false;
    let shield = shield(config);

    let (_p1, ctx1) = shield
        .transform_params(params("What is the capital of France?"))
        .await
        .unwrap();
    assert!(ctx1.cache_hit.is_none());
    let result1 = shield
        .wrap_generate(ok_generate("Paris", 20, 5), ctx1)
        .await
        .unwrap();
    assert!(!result1.cache_hit);
    assert_eq!(result1.text, "Paris");

    let (_p2, ctx2) = shield
        .transform_params(params("What is the capital of France?"))
        .await
        .unwrap();
    assert!(ctx2.cache_hit.is_some());
    let result2 = shield
        .wrap_generate(
            Box::new(|_p| {
                Box::pin(async move { panic!("doGenerate must not be called on a cache hit") })
            }),
            ctx2,
        )
        .await
        .unwrap();
    assert!(result2.cache_hit);
    assert_eq!(result2.text, "Paris");
    assert_eq!(result2.usage, Usage::default());

    let health = shield.health_check().await;
    assert_eq!(health.cache_hit_rate, Some(0.5));
}

#[tokio::test]
async fn guard_dedup_blocks_second_identical_call() {
    let mut config = Config::default();
    config.guard.deduplicate_window_ms = 5_000;
    config.modules.cache = false;
    let shield = shield(config);

    shield
        .transform_params(params("Tell me a joke about cats"))
        .await
        .unwrap();
    let err = shield
        .transform_params(params("Tell me a joke about cats"))
        .await
        .unwrap_err();
    assert!(err.is_blocked());
}

#[tokio::test]
async fn breaker_session_limit_blocks_second_call() {
    let mut config = Config::default();
    config.breaker.per_session = Some(0.002);
    config.modules.cache = false;
    config.modules.guard = false;
    let shield = shield(config);

    let (_p, ctx) = shield
        .transform_params(params("First request"))
        .await
        .unwrap();
    shield
        .wrap_generate(ok_generate("ok", 5_000, 5_000), ctx)
        .await
        .unwrap();

    let err = shield
        .transform_params(params("Second request"))
        .await
        .unwrap_err();
    assert!(err.is_blocked());

    let health = shield.health_check().await;
    assert_eq!(health.breaker_tripped, Some(true));
}

#[tokio::test]
async fn context_trim_keeps_system_message_under_tight_budget() {
    let mut config = Config::default();
    config.modules.guard = false;
    config.modules.cache = false;
    config.context.max_context_tokens = 50;
    config.context.reserve_for_output = 20;
    let shield = shield(config);

    let mut messages = vec![Message::system("be terse")];
    for i in 0..6 {
        messages.push(Message::user(format!(
            "this is message number {i} with some padding text to use tokens"
        )));
    }
    let p = Params {
        model: "gpt-4o-mini".to_string(),
        messages,
        user_id: None,
        expected_output_tokens: Some(5),
    };

    let (transformed, _ctx) = shield.transform_params(p).await.unwrap();
    assert!(transformed.messages.len() < 7, "some messages must be trimmed");
    assert!(
        transformed
            .messages
            .first()
            .map(|m| m.content.contains("be terse") || m.pinned)
            .unwrap_or(false),
        "the pinned system message must survive trimming"
    );
}

#[tokio::test]
async fn release_on_cache_hit_zeroes_inflight() {
    let mut config = Config::default();
    let mut users = std::collections::HashMap::new();
    users.insert(
        "alice".to_string(),
        Budget {
            daily: 10.0,
            monthly: 100.0,
        },
    );
    config.user_budget.users = users;
    config.modules.guard = false;
    let shield = shield(config);

    let mut p = params("cache me please");
    p.user_id = Some("alice".to_string());

    let (_p1, ctx1) = shield.transform_params(p.clone()).await.unwrap();
    shield
        .wrap_generate(ok_generate("cached answer", 10, 5), ctx1)
        .await
        .unwrap();
    let spent_after_first = shield.health_check().await.total_spent;

    let (_p2, ctx2) = shield.transform_params(p).await.unwrap();
    assert!(ctx2.cache_hit.is_some());
    shield
        .wrap_generate(
            Box::new(|_p| Box::pin(async move { panic!("must not call on cache hit") })),
            ctx2,
        )
        .await
        .unwrap();

    // A cache hit records zero additional spend: the reservation the second
    // call opened must have been released, not settled as a real charge.
    assert_eq!(shield.health_check().await.total_spent, spent_after_first);
}

#[tokio::test]
async fn stream_cancel_records_ledger_entry_exactly_once() {
    let shield = shield(Config::default());
    let (_p, ctx) = shield
        .transform_params(params("stream this please"))
        .await
        .unwrap();

    let chunks = stream::iter(vec![
        Ok("Hello ".to_string()),
        Ok("world".to_string()),
        Ok(" this keeps going".to_string()),
    ]);
    let (mut wrapped, cancel) = shield.wrap_stream(chunks, ctx);

    let _ = wrapped.next().await;
    let _ = wrapped.next().await;
    cancel.store(true, Ordering::SeqCst);
    while wrapped.next().await.is_some() {}

    let health = shield.health_check().await;
    assert!(health.total_spent.unwrap_or(0.0) > 0.0);

    // A second cancel signal must not double-record: polling an already
    // finished stream is a no-op, not a second ledger entry.
    cancel.store(true, Ordering::SeqCst);
    let total_after_first = health.total_spent;
    let health_again = shield.health_check().await;
    assert_eq!(health_again.total_spent, total_after_first);
}

#[tokio::test]
async fn breaker_tripped_event_fires_alongside_block() {
    let mut config = Config::default();
    config.breaker.per_session = Some(0.0001);
    config.modules.cache = false;
    config.modules.guard = false;
    let shield = shield(config);

    let tripped = Arc::new(AtomicU32::new(0));
    {
        let tripped = tripped.clone();
        shield
            .events()
            .on(tokenshield_core::EventName::BreakerTripped, move |_event| {
                tripped.fetch_add(1, Ordering::SeqCst);
            })
            .await;
    }

    let err = shield
        .transform_params(params("this should trip the session ceiling"))
        .await
        .unwrap_err();
    assert!(err.is_blocked());
    assert_eq!(tripped.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn ledger_survives_across_shield_instances_via_file_persistence() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("tokenshield.db");
    let path = path.to_str().unwrap().to_string();

    let mut config = Config::default();
    config.ledger.persist = true;
    config.persistence.path = Some(path.clone());
    config.modules.guard = false;
    config.modules.cache = false;

    let shield = shield(config.clone());
    let (_p, ctx) = shield
        .transform_params(params("remember this across restarts"))
        .await
        .unwrap();
    shield
        .wrap_generate(ok_generate("noted", 10, 5), ctx)
        .await
        .unwrap();
    let entries_before = shield.health_check().await.total_spent;

    let reopened = shield(config);
    reopened.hydrate_from_persistence().await;
    let summary = reopened.health_check().await;
    assert_eq!(summary.total_spent, entries_before);
}

#[tokio::test]
async fn events_fire_for_cache_miss_then_hit() {
    let mut config = Config::default();
    config.modules.guard = false;
    let shield = shield(config);
    let hits = Arc::new(AtomicU32::new(0));
    let misses = Arc::new(AtomicU32::new(0));

    {
        let hits = hits.clone();
        shield
            .events()
            .on(tokenshield_core::EventName::CacheHit, move |_event| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        let misses = misses.clone();
        shield
            .events()
            .on(tokenshield_core::EventName::CacheMiss, move |_event| {
                misses.fetch_add(1, Ordering::SeqCst);
            })
            .await;
    }

    let (_p1, ctx1) = shield
        .transform_params(params("Recommend a recipe for banana bread"))
        .await
        .unwrap();
    shield
        .wrap_generate(ok_generate("Try banana walnut bread.", 15, 10), ctx1)
        .await
        .unwrap();

    let (_p2, _ctx2) = shield
        .transform_params(params("Recommend a recipe for banana bread"))
        .await
        .unwrap();

    // Delivery is synchronous within `emit`, so counts are already final.
    assert_eq!(misses.load(Ordering::SeqCst), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

