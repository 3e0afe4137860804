//! Session runs against the simulated engine: streaming, exclusivity and
//! cooperative cancellation

use engine_bridge::session::{ContextMode, FinishReason, GrammarConfig, SessionPhase};
use engine_bridge::{
    GenerationEvent, Input, ModelDownloadState, ModelRef, Output, RunConfig, Runtime, Session,
    SessionConfig, SessionError, SimulatedEngine,
};
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const REPLY: &str = "the quick brown fox jumps over the lazy dog";

async fn session_with_delay(token_delay: Duration) -> (Arc<Runtime>, Arc<Session>) {
    let engine = SimulatedEngine::new()
        .with_valid_key("good-key")
        .with_local_model("local", 100)
        .with_reply("local", REPLY)
        .with_token_delay(token_delay);
    let runtime = Runtime::start(Arc::new(engine.clone()));
    runtime.activate("good-key").await.unwrap();

    engine.emit_state("local", ModelDownloadState::downloaded(100));
    runtime.flush().await;

    let session = runtime
        .create_session(&ModelRef::Local("local".into()), Some(SessionConfig::default()))
        .unwrap();
    (runtime, session)
}

async fn wait_until_ready(session: &Session) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.phase() != SessionPhase::Ready {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session never returned to ready");
}

#[tokio::test]
async fn test_stream_yields_cumulative_partials_then_final() {
    let (_runtime, session) = session_with_delay(Duration::ZERO).await;

    let events: Vec<_> = session
        .stream(Input::from("hello"), RunConfig::default())
        .unwrap()
        .collect()
        .await;

    let partials: Vec<String> = events
        .iter()
        .filter_map(|event| match event {
            GenerationEvent::Partial(output) => Some(output.text.clone()),
            GenerationEvent::Finished(_) => None,
        })
        .collect();
    assert_eq!(partials.len(), REPLY.split_whitespace().count());
    assert_eq!(partials.first().map(String::as_str), Some("the "));
    for pair in partials.windows(2) {
        assert!(pair[1].starts_with(&pair[0]));
    }

    let Some(GenerationEvent::Finished(Ok(output))) = events.last() else {
        panic!("last event must be the final result");
    };
    assert_eq!(output.text, REPLY);
    assert_eq!(output.finish_reason, Some(FinishReason::Stop));
    assert_eq!(session.phase(), SessionPhase::Ready);
    assert_eq!(session.stats().runs, 1);
}

#[tokio::test]
async fn test_second_run_while_generating_is_busy() {
    let (_runtime, session) = session_with_delay(Duration::from_millis(20)).await;

    let first = session
        .stream(Input::from("one"), RunConfig::default())
        .unwrap();
    assert_eq!(session.phase(), SessionPhase::Generating);

    let err = session
        .run(&Input::from("two"), &RunConfig::default(), |_| true)
        .unwrap_err();
    assert_eq!(err, SessionError::Busy);

    assert!(matches!(
        session.stream(Input::from("three"), RunConfig::default()),
        Err(SessionError::Busy)
    ));

    // The first run is untouched by the rejected calls
    let output = first.finish().await.unwrap();
    assert_eq!(output.text, REPLY);
    assert_eq!(session.stats().runs, 1);
}

#[tokio::test]
async fn test_cancel_stops_at_next_partial() {
    let (_runtime, session) = session_with_delay(Duration::from_millis(10)).await;

    let mut stream = session
        .stream(Input::from("hi"), RunConfig::default())
        .unwrap();

    let first = stream.next().await.unwrap();
    assert!(matches!(first, GenerationEvent::Partial(_)));
    stream.cancel();

    let output = tokio::time::timeout(Duration::from_secs(2), stream.finish())
        .await
        .expect("cancelled run did not terminate")
        .unwrap();

    assert!(output.was_cancelled());
    assert!(output.text.len() < REPLY.len());
    assert_eq!(session.phase(), SessionPhase::Ready);
    assert_eq!(session.stats().cancelled_runs, 1);
}

#[tokio::test]
async fn test_dropping_stream_cancels_run() {
    let (_runtime, session) = session_with_delay(Duration::from_millis(10)).await;

    let mut stream = session
        .stream(Input::from("hi"), RunConfig::default())
        .unwrap();
    stream.next().await.unwrap();
    drop(stream);

    wait_until_ready(&session).await;
    assert_eq!(session.stats().cancelled_runs, 1);

    // The session is reusable afterwards
    let output = session
        .run(&Input::from("again"), &RunConfig::default(), |_| true)
        .unwrap();
    assert_eq!(output.text, REPLY);
}

#[tokio::test]
async fn test_run_async_with_cancellation_token() {
    let (_runtime, session) = session_with_delay(Duration::from_millis(5)).await;

    let cancel = CancellationToken::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let on_partial = {
        let cancel = cancel.clone();
        let seen = seen.clone();
        move |_: &Output| {
            if seen.fetch_add(1, Ordering::SeqCst) == 2 {
                cancel.cancel();
            }
            true
        }
    };

    let output = session
        .run_async(Input::from("hi"), RunConfig::default(), cancel, on_partial)
        .await
        .unwrap();

    // The callback that cancelled still answered true; the next one never reached it
    assert_eq!(seen.load(Ordering::SeqCst), 3);
    assert_eq!(output.finish_reason, Some(FinishReason::Cancelled));
    assert_eq!(output.text, "the quick brown fox");
}

#[tokio::test]
async fn test_caller_callback_can_stop_run() {
    let (_runtime, session) = session_with_delay(Duration::ZERO).await;

    let output = session
        .run(&Input::from("hi"), &RunConfig::default(), |partial| {
            !partial.text.contains("fox")
        })
        .unwrap();
    assert_eq!(output.text, "the quick brown fox");
    assert!(output.was_cancelled());
}

#[tokio::test]
async fn test_tokens_limit_finishes_with_length() {
    let (_runtime, session) = session_with_delay(Duration::ZERO).await;

    let output = session
        .stream(Input::from("hi"), RunConfig::default().with_tokens_limit(2))
        .unwrap()
        .finish()
        .await
        .unwrap();
    assert_eq!(output.text, "the quick");
    assert_eq!(output.finish_reason, Some(FinishReason::Length));
}

#[tokio::test]
async fn test_structured_output_with_grammar() {
    let (_runtime, session) = session_with_delay(Duration::ZERO).await;
    let schema = serde_json::json!({
        "type": "object",
        "properties": { "model": { "type": "string" } }
    });

    let output = session
        .run(
            &Input::from("describe yourself"),
            &RunConfig::default().with_grammar(GrammarConfig::json_schema(&schema)),
            |_| true,
        )
        .unwrap();

    let value: serde_json::Value = output.structured().unwrap();
    assert_eq!(value["model"], "local");
}

#[tokio::test]
async fn test_structured_output_reads_response_after_thinking() {
    let engine = SimulatedEngine::new()
        .with_valid_key("good-key")
        .with_cloud_model("remote")
        .with_reasoning("remote", "the schema wants the model name");
    let runtime = Runtime::start(Arc::new(engine));
    runtime.activate("good-key").await.unwrap();
    let session = runtime
        .create_session(&ModelRef::Cloud("remote".into()), Some(SessionConfig::default()))
        .unwrap();

    let schema = serde_json::json!({ "type": "object" });
    let output = session
        .run(
            &Input::from("describe yourself"),
            &RunConfig::default().with_grammar(GrammarConfig::json_schema(&schema)),
            |_| true,
        )
        .unwrap();

    assert!(output.text.starts_with("<think>"));
    let parsed = output.parsed();
    assert_eq!(parsed.reasoning.as_deref(), Some("the schema wants the model name"));
    let value: serde_json::Value = output.structured().unwrap();
    assert_eq!(value["model"], "remote");
}

#[tokio::test]
async fn test_reload_with_other_context_mode_fails() {
    let (_runtime, session) = session_with_delay(Duration::ZERO).await;

    let dynamic = SessionConfig::default().with_context_mode(ContextMode::Dynamic);
    assert_eq!(session.load(dynamic), Err(SessionError::AlreadyLoaded));
    assert_eq!(session.config(), Some(SessionConfig::default()));
    assert_eq!(session.phase(), SessionPhase::Ready);
}

#[tokio::test]
async fn test_unloadable_model_makes_session_unusable() {
    let engine = SimulatedEngine::new()
        .with_valid_key("good-key")
        .with_cloud_model("remote")
        .with_unloadable("remote");
    let runtime = Runtime::start(Arc::new(engine));
    runtime.activate("good-key").await.unwrap();

    let session = runtime
        .create_session(&ModelRef::Cloud("remote".into()), None)
        .unwrap();
    let err = session.load(SessionConfig::default()).unwrap_err();
    assert!(matches!(err, SessionError::EngineUnavailable(_)));
    assert_eq!(session.phase(), SessionPhase::Failed);

    let err = session
        .run(&Input::from("hi"), &RunConfig::default(), |_| true)
        .unwrap_err();
    assert_eq!(err, SessionError::Unusable);
}

#[tokio::test]
async fn test_run_before_load_fails() {
    let engine = SimulatedEngine::new()
        .with_valid_key("good-key")
        .with_cloud_model("remote");
    let runtime = Runtime::start(Arc::new(engine));
    runtime.activate("good-key").await.unwrap();

    let session = runtime
        .create_session(&ModelRef::Cloud("remote".into()), None)
        .unwrap();
    assert_eq!(session.phase(), SessionPhase::Unloaded);
    assert!(matches!(
        session.stream(Input::from("hi"), RunConfig::default()),
        Err(SessionError::NotLoaded)
    ));
}
