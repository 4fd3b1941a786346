use super::*;
use crate::config::{CollectorConfig, ConnectionConfig};
use crate::connection::testing::{wait_until, MockConnector};
use crate::performance::{parse_frame_header, PerformanceCollector};
use crate::source::mock::{MockProvider, MockSource};
use crate::source::SourceId;

struct Harness {
    ctx: StrategyContext,
    connector: Arc<MockConnector>,
}

fn settings(target_fps: u32) -> StreamSettings {
    StreamSettings {
        target_fps,
        ..Default::default()
    }
}

fn harness(provider: Arc<MockProvider>, settings: StreamSettings) -> Harness {
    harness_with(provider, settings, MockConnector::new(), 8)
}

fn harness_with(
    provider: Arc<MockProvider>,
    settings: StreamSettings,
    connector: Arc<MockConnector>,
    send_queue_capacity: usize,
) -> Harness {
    let connection_config = ConnectionConfig {
        address: "ws://test".to_string(),
        reconnect_delay_ms: 100,
        send_queue_capacity,
    };
    let connection = ConnectionManager::new("ws://test/session", &connection_config, connector.clone());
    let collector_config = CollectorConfig {
        capacity: 100,
        log_interval: 0,
        stats_interval: 0,
    };
    let collector =
        PerformanceCollector::new("session", &collector_config, settings.target_fps as f64).shared();

    Harness {
        ctx: StrategyContext {
            session_id: "session".to_string(),
            provider,
            settings,
            controller: ControllerOverrides::default(),
            connection,
            collector,
            registry: Arc::new(SubscriptionRegistry::new()),
        },
        connector,
    }
}

async fn connect(harness: &Harness) {
    harness.ctx.connection.connect();
    assert!(wait_until(|| harness.ctx.connection.is_ready()).await);
}

#[test]
fn test_strategy_selection() {
    let plain = MockSource::new("plain");
    let screencast = MockSource::new("cast").with_screencast();

    assert!(CaptureStrategy::Poll.is_supported(&plain));
    assert!(!CaptureStrategy::Push.is_supported(&plain));
    assert!(CaptureStrategy::Push.is_supported(&screencast));

    assert_eq!(
        CaptureStrategy::select(StrategyPreference::Auto, &screencast),
        CaptureStrategy::Push
    );
    assert_eq!(
        CaptureStrategy::select(StrategyPreference::Auto, &plain),
        CaptureStrategy::Poll
    );
    assert_eq!(
        CaptureStrategy::select(StrategyPreference::Push, &plain),
        CaptureStrategy::Poll
    );
    assert_eq!(
        CaptureStrategy::select(StrategyPreference::Poll, &screencast),
        CaptureStrategy::Poll
    );
}

#[tokio::test]
async fn test_poll_rejects_invalid_controller_config() {
    let source = Arc::new(MockSource::new("page-1"));
    let mut harness = harness(MockProvider::new(source), settings(10));
    harness.ctx.controller = ControllerOverrides {
        min_fps: Some(20.0),
        max_fps: Some(5.0),
        ..Default::default()
    };

    assert!(CaptureStrategy::Poll.start(harness.ctx).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_poll_converges_for_slow_source() {
    let source = Arc::new(MockSource::new("page-1").with_capture_delay(Duration::from_millis(80)));
    let harness = harness(MockProvider::new(source), settings(15));
    connect(&harness).await;

    let handle = CaptureStrategy::Poll.start(harness.ctx.clone()).unwrap();
    assert!(wait_until(|| handle.frame_count() >= 30).await);

    let fps = handle.effective_fps();
    let interval_ms = (1000 / fps) as f64;
    assert!(80.0 / interval_ms < 1.0, "fps {} still too high", fps);
    assert!((2..=30).contains(&fps));

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_poll_skips_duplicate_frames() {
    let source = Arc::new(MockSource::new("page-1").identical_frames());
    let harness = harness(MockProvider::new(source), settings(10));
    connect(&harness).await;

    let handle = CaptureStrategy::Poll.start(harness.ctx.clone()).unwrap();
    assert!(wait_until(|| handle.frame_count() >= 5).await);
    handle.stop().await;

    let frames = harness.connector.frames();
    assert_eq!(frames.len(), 1);
    let (header, payload) = parse_frame_header(&frames[0]).unwrap();
    assert_eq!(header.frame_id, 1);
    assert_eq!(header.frame_bytes, 6);
    assert_eq!(payload, &[0xFF, 0xD8, 1, 2, 0xFF, 0xD9]);

    let collector = harness.ctx.collector.lock();
    assert!(collector.skipped_frames() >= 4);
    assert_eq!(collector.total_frames(), handle.frame_count());
}

#[tokio::test(start_paused = true)]
async fn test_poll_waits_while_not_ready() {
    let source = Arc::new(MockSource::new("page-1"));
    let harness = harness(MockProvider::new(source.clone()), settings(10));

    let handle = CaptureStrategy::Poll.start(harness.ctx.clone()).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(source.capture_count(), 0);
    assert!(handle.is_active());

    connect(&harness).await;
    assert!(wait_until(|| source.capture_count() > 0).await);
    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_poll_circuit_breaker_backs_off() {
    let source = Arc::new(MockSource::new("page-1").failing());
    let mut stream = settings(10);
    stream.max_consecutive_failures = 3;
    stream.failure_backoff_multiplier = 5;
    let harness = harness(MockProvider::new(source.clone()), stream);
    connect(&harness).await;

    let handle = CaptureStrategy::Poll.start(harness.ctx.clone()).unwrap();
    assert!(wait_until(|| source.capture_count() >= 4).await);
    handle.stop().await;

    let captures = source.captures();
    let regular = captures[1].0 - captures[0].0;
    let after_breaker = captures[3].0 - captures[2].0;
    assert!(regular < Duration::from_millis(200));
    assert!(after_breaker >= Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn test_poll_timeout_lowers_rate() {
    let source = Arc::new(MockSource::new("page-1").with_capture_delay(Duration::from_secs(10)));
    let mut stream = settings(20);
    stream.capture_timeout_ms = 200;
    let harness = harness(MockProvider::new(source), stream);
    connect(&harness).await;

    let handle = CaptureStrategy::Poll.start(harness.ctx.clone()).unwrap();
    assert_eq!(handle.effective_fps(), 20);
    assert!(wait_until(|| handle.effective_fps() <= 15).await);
    assert!(handle.effective_fps() >= 2);

    handle.stop().await;
    assert!(harness.ctx.collector.lock().skipped_frames() >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_poll_live_updates() {
    let source = Arc::new(MockSource::new("page-1").with_capture_delay(Duration::from_millis(10)));
    let harness = harness(MockProvider::new(source.clone()), settings(10));
    connect(&harness).await;

    let handle = CaptureStrategy::Poll.start(harness.ctx.clone()).unwrap();
    assert!(wait_until(|| source.capture_count() >= 2).await);

    handle.update_quality(40);
    assert!(
        wait_until(|| source
            .captures()
            .last()
            .map_or(false, |(_, request)| request.quality == 40))
        .await
    );

    handle.update_target_fps(5);
    assert!(wait_until(|| handle.effective_fps() == 5).await);
    assert_eq!(handle.settings(), LiveSettings { quality: 40, target_fps: 5 });

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_prompt_and_idempotent() {
    let source = Arc::new(MockSource::new("page-1"));
    let harness = harness(MockProvider::new(source.clone()), settings(2));
    connect(&harness).await;

    let handle = CaptureStrategy::Poll.start(harness.ctx.clone()).unwrap();
    assert!(wait_until(|| source.capture_count() >= 1).await);

    let started = tokio::time::Instant::now();
    handle.stop().await;
    assert!(started.elapsed() < Duration::from_millis(100));
    handle.stop().await;
    assert!(!handle.is_active());

    let count = source.capture_count();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(source.capture_count(), count);
}

#[tokio::test(start_paused = true)]
async fn test_poll_ends_when_source_gone() {
    let source = Arc::new(MockSource::new("page-1"));
    let provider = MockProvider::new(source);
    let harness = harness(provider.clone(), settings(10));
    connect(&harness).await;

    let handle = CaptureStrategy::Poll.start(harness.ctx.clone()).unwrap();
    provider.clear();
    assert!(wait_until(|| !handle.is_active()).await);
}

#[tokio::test(start_paused = true)]
async fn test_push_acks_frames_while_not_ready() {
    let source = Arc::new(MockSource::new("page-1").with_screencast());
    let harness = harness(MockProvider::new(source.clone()), settings(10));

    let handle = CaptureStrategy::Push.start(harness.ctx.clone()).unwrap();
    assert!(wait_until(|| source.subscriptions().len() == 1).await);

    for index in 1..=3 {
        assert!(source.emit(index).await);
    }
    assert!(wait_until(|| source.acks().len() == 3).await);
    assert_eq!(source.acks(), vec![1, 2, 3]);
    assert_eq!(handle.frame_count(), 3);
    assert_eq!(harness.ctx.collector.lock().skipped_frames(), 3);
    assert!(harness.connector.frames().is_empty());

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_push_forwards_with_header() {
    let source = Arc::new(MockSource::new("page-1").with_screencast());
    let harness = harness(MockProvider::new(source.clone()), settings(10));
    connect(&harness).await;

    let handle = CaptureStrategy::Push.start(harness.ctx.clone()).unwrap();
    assert!(wait_until(|| source.subscriptions().len() == 1).await);
    assert_eq!(source.subscriptions()[0].max_fps, 10);

    assert!(source.emit(1).await);
    assert!(source.emit(2).await);
    assert!(wait_until(|| harness.connector.frames().len() == 2).await);
    assert!(wait_until(|| source.acks().len() == 2).await);

    let frames = harness.connector.frames();
    let (header, payload) = parse_frame_header(&frames[1]).unwrap();
    assert_eq!(header.frame_id, 2);
    assert_eq!(header.frame_bytes, 8);
    assert_eq!(payload, &[2u8; 8]);
    assert_eq!(harness.ctx.collector.lock().skipped_frames(), 0);

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_push_continues_after_ack_timeouts() {
    let source = Arc::new(
        MockSource::new("page-1")
            .with_screencast()
            .with_ack_delay(Duration::from_secs(5)),
    );
    let mut stream = settings(10);
    stream.ack_timeout_ms = 100;
    stream.ack_failure_threshold = 2;
    let harness = harness(MockProvider::new(source.clone()), stream);
    connect(&harness).await;

    let handle = CaptureStrategy::Push.start(harness.ctx.clone()).unwrap();
    assert!(wait_until(|| source.subscriptions().len() == 1).await);

    assert!(source.emit(1).await);
    assert!(wait_until(|| handle.ack_failures() == 1).await);
    for index in 2..=3 {
        assert!(source.emit(index).await);
    }
    assert!(wait_until(|| harness.connector.frames().len() == 3).await);
    assert!(wait_until(|| handle.ack_failures() == 3).await);
    assert!(handle.ack_failures() >= harness.ctx.settings.ack_failure_threshold);
    assert!(source.acks().is_empty());
    assert!(handle.is_active());

    source.set_ack_delay(Duration::ZERO);
    assert!(source.emit(4).await);
    assert!(wait_until(|| source.acks() == vec![4]).await);
    assert_eq!(handle.ack_failures(), 0);

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_push_resubscribes_on_source_change() {
    let first = Arc::new(MockSource::new("page-1").with_screencast());
    let second = Arc::new(MockSource::new("page-2").with_screencast());
    let provider = MockProvider::new(first.clone());
    let harness = harness(provider.clone(), settings(10));
    connect(&harness).await;

    let handle = CaptureStrategy::Push.start(harness.ctx.clone()).unwrap();
    assert!(wait_until(|| first.subscriptions().len() == 1).await);
    assert!(harness.ctx.registry.contains(&SourceId::new("page-1")));

    provider.set(second.clone());
    assert!(wait_until(|| second.subscriptions().len() == 1).await);
    assert_eq!(first.stops(), 1);
    assert!(!harness.ctx.registry.contains(&SourceId::new("page-1")));
    assert!(harness.ctx.registry.contains(&SourceId::new("page-2")));

    assert!(second.emit(1).await);
    assert!(wait_until(|| second.acks() == vec![1]).await);
    assert!(handle.is_active());

    handle.stop().await;
    assert!(harness.ctx.registry.is_empty());
    assert_eq!(second.stops(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_push_resubscribes_on_settings_change() {
    let source = Arc::new(MockSource::new("page-1").with_screencast());
    let harness = harness(MockProvider::new(source.clone()), settings(10));

    let handle = CaptureStrategy::Push.start(harness.ctx.clone()).unwrap();
    assert!(wait_until(|| source.subscriptions().len() == 1).await);

    handle.update_quality(50);
    handle.update_target_fps(5);
    assert!(wait_until(|| {
        source
            .subscriptions()
            .last()
            .map_or(false, |options| options.quality == 50 && options.max_fps == 5)
    })
    .await);
    assert_eq!(handle.effective_fps(), 5);
    assert_eq!(harness.ctx.registry.len(), 1);

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_push_ends_when_source_gone() {
    let source = Arc::new(MockSource::new("page-1").with_screencast());
    let provider = MockProvider::new(source.clone());
    let harness = harness(provider.clone(), settings(10));

    let handle = CaptureStrategy::Push.start(harness.ctx.clone()).unwrap();
    assert!(wait_until(|| source.subscriptions().len() == 1).await);

    provider.clear();
    assert!(wait_until(|| !handle.is_active()).await);
    assert!(harness.ctx.registry.is_empty());
    assert_eq!(source.stops(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_poll_unavailable_source_trips_breaker() {
    let source = Arc::new(MockSource::new("page-1").unavailable());
    let mut stream = settings(10);
    stream.max_consecutive_failures = 3;
    stream.failure_backoff_multiplier = 5;
    let harness = harness(MockProvider::new(source.clone()), stream);
    connect(&harness).await;

    let handle = CaptureStrategy::Poll.start(harness.ctx.clone()).unwrap();
    assert!(wait_until(|| source.capture_count() >= 2).await);
    handle.stop().await;

    let captures = source.captures();
    assert!(captures[1].0 - captures[0].0 >= Duration::from_millis(500));
    assert_eq!(harness.ctx.collector.lock().skipped_frames(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_poll_stalled_consumer_does_not_block_stop() {
    let source = Arc::new(MockSource::new("page-1"));
    let harness = harness_with(
        MockProvider::new(source.clone()),
        settings(10),
        MockConnector::stalled(),
        1,
    );
    connect(&harness).await;

    let handle = CaptureStrategy::Poll.start(harness.ctx.clone()).unwrap();
    assert!(wait_until(|| !harness.ctx.connection.is_ready()).await);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(handle.is_active());

    let started = tokio::time::Instant::now();
    handle.stop().await;
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(harness.connector.frames().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_push_stalled_consumer_skips_and_acks() {
    let source = Arc::new(MockSource::new("page-1").with_screencast());
    let harness = harness_with(
        MockProvider::new(source.clone()),
        settings(10),
        MockConnector::stalled(),
        1,
    );
    connect(&harness).await;

    let handle = CaptureStrategy::Push.start(harness.ctx.clone()).unwrap();
    assert!(wait_until(|| source.subscriptions().len() == 1).await);

    for index in 1..=6 {
        assert!(source.emit(index).await);
    }
    assert!(wait_until(|| source.acks().len() == 6).await);
    assert_eq!(handle.frame_count(), 6);
    assert!(harness.ctx.collector.lock().skipped_frames() >= 4);

    let started = tokio::time::Instant::now();
    handle.stop().await;
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(source.stops(), 1);
}
