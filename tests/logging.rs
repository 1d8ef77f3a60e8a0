use bulkline::{BatchOrchestrator, BulkError, CircuitBreaker, ConcurrencyManager, Context};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone)]
struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

struct SharedGuard(Arc<Mutex<Vec<u8>>>);
impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn capture() -> (Arc<Mutex<Vec<u8>>>, tracing::subscriber::DefaultGuard) {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::fmt()
        .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
        .with_target(true)
        .with_max_level(tracing::Level::DEBUG)
        .without_time()
        .with_ansi(false)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (buffer, guard)
}

fn logs(buffer: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8(buffer.lock().unwrap().clone()).unwrap()
}

#[tokio::test]
async fn breaker_transitions_are_logged_with_its_name() {
    let (buffer, _guard) = capture();
    let breaker = CircuitBreaker::new("zones/purge_cache", 2, Duration::from_secs(30)).unwrap();
    for _ in 0..2 {
        let _: Result<(), BulkError<String>> =
            breaker.execute(|| async { Err(BulkError::Inner("HTTP 500".to_string())) }).await;
    }
    breaker.reset();

    let out = logs(&buffer);
    assert!(out.contains("circuit breaker → open"), "{out}");
    assert!(out.contains("zones/purge_cache"), "{out}");
    assert!(out.contains("circuit breaker reset"), "{out}");
    assert!(out.contains("bulkline::circuit_breaker"), "target missing: {out}");
}

#[test]
fn reactive_concurrency_cut_is_logged() {
    let (buffer, _guard) = capture();
    let manager = ConcurrencyManager::new(2, 20);
    manager.set_target(16);
    manager.record_failure(true);

    let out = logs(&buffer);
    assert!(out.contains("rate limited; cutting concurrency"), "{out}");
    assert!(out.contains("from=16"), "{out}");
    assert!(out.contains("to=8"), "{out}");
}

#[tokio::test]
async fn failed_batches_are_logged_with_their_class() {
    let (buffer, _guard) = capture();
    let orchestrator = BatchOrchestrator::<String>::new(2, 1).unwrap();
    let op = |_ctx: Context, batch: Vec<u32>| async move {
        if batch.contains(&2) {
            Err("HTTP 404: namespace not found".to_string())
        } else {
            Ok(batch)
        }
    };
    let report = orchestrator.run(&Context::new(), (0..4).collect(), op).await;
    assert_eq!(report.errors.len(), 1);

    let out = logs(&buffer);
    assert!(out.contains("batch failed"), "{out}");
    assert!(out.contains("class=client"), "{out}");
}
