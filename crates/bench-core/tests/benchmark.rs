use bench_core::fcgi::{decode_name_values, read_record, write_record, RecordType};
use bench_core::{
    fetch_once, run_benchmark, Dialer, FcgiDialer, LoadConfig, MockDialer, Network,
    RequestParams, WorkerExit,
};
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

fn params() -> Arc<RequestParams> {
    Arc::new(RequestParams::for_script("/srv/www", "index.php"))
}

fn load(workers: usize, rate: f64, duration_ms: u64) -> LoadConfig {
    LoadConfig {
        workers,
        rate,
        duration_ms,
    }
}

#[tokio::test(start_paused = true)]
async fn test_single_worker_fixed_latency() {
    let dialer = MockDialer::new(Duration::from_millis(5));
    let report = run_benchmark(&load(1, 10.0, 1000), Arc::new(dialer.clone()), params())
        .await
        .unwrap();

    let count = report.count();
    assert!((9..=11).contains(&count), "count: {}", count);

    let summary = report.latency.unwrap();
    let five = Duration::from_millis(5);
    assert_eq!(summary.mean, five);
    assert_eq!(summary.min, five);
    assert_eq!(summary.p50, five);
    assert_eq!(summary.p90, five);
    assert_eq!(summary.p95, five);
    assert_eq!(summary.p99, five);
    assert_eq!(summary.max, five);

    assert_eq!(report.failed_workers(), 0);
    assert_eq!(dialer.dials(), 1);
    assert_eq!(dialer.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_error_status_yields_no_samples() {
    let dialer = MockDialer::new(Duration::from_millis(5)).with_status(500);
    let report = run_benchmark(&load(3, 10.0, 1000), Arc::new(dialer.clone()), params())
        .await
        .unwrap();

    assert_eq!(report.count(), 0);
    assert!(report.latency.is_none());
    assert_eq!(report.workers.len(), 3);
    assert_eq!(report.failed_workers(), 3);
    for outcome in &report.workers {
        assert!(matches!(outcome.exit, WorkerExit::Status(500)));
        assert_eq!(outcome.samples, 0);
    }
    assert_eq!(dialer.closes(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_dial_failures_do_not_block_completion() {
    let dialer = MockDialer::new(Duration::ZERO).failing_dial();
    let report = run_benchmark(&load(4, 10.0, 60_000), Arc::new(dialer), params())
        .await
        .unwrap();

    assert_eq!(report.count(), 0);
    assert_eq!(report.failed_workers(), 4);
    // the run ends as soon as the last worker is gone, not when the window closes
    assert!(report.elapsed < Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_sample_count_bounded_by_rate() {
    let dialer = MockDialer::new(Duration::from_millis(2));
    let workers = 4;
    let report = run_benchmark(&load(workers, 50.0, 1000), Arc::new(dialer.clone()), params())
        .await
        .unwrap();

    let count = report.count();
    assert!(count <= 50 + workers, "count: {}", count);
    assert!(count >= 45, "count: {}", count);
    assert_eq!(dialer.requests(), count);

    let per_worker: u64 = report.workers.iter().map(|w| w.samples).sum();
    assert_eq!(per_worker as usize, count);
    assert!(report
        .workers
        .iter()
        .all(|w| matches!(w.exit, WorkerExit::Shutdown)));
}

/// Serve every request on the connection with the script filename as body.
async fn serve_connection(mut stream: TcpStream) {
    loop {
        let mut keep_conn = false;
        let mut raw_params = Vec::new();
        loop {
            let record = match read_record(&mut stream).await {
                Ok(record) => record,
                Err(_) => return,
            };
            match RecordType::from_u8(record.record_type) {
                Some(RecordType::BeginRequest) => keep_conn = record.content[2] & 1 == 1,
                Some(RecordType::Params) => raw_params.extend_from_slice(&record.content),
                Some(RecordType::Stdin) if record.content.is_empty() => break,
                _ => {}
            }
        }

        let pairs = decode_name_values(&raw_params).unwrap();
        let script = pairs
            .iter()
            .find(|(name, _)| name == "SCRIPT_FILENAME")
            .map(|(_, value)| value.clone())
            .unwrap_or_default();

        let stdout = format!("Status: 200 OK\r\nContent-Type: text/plain\r\n\r\n{script}");
        let mut buf = BytesMut::new();
        write_record(&mut buf, RecordType::Stderr, 1, b"PHP Notice: test");
        write_record(&mut buf, RecordType::Stdout, 1, stdout.as_bytes());
        write_record(&mut buf, RecordType::Stdout, 1, &[]);
        write_record(&mut buf, RecordType::EndRequest, 1, &[0; 8]);
        if stream.write_all(&buf).await.is_err() {
            return;
        }
        if !keep_conn {
            return;
        }
    }
}

async fn spawn_responder() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_connection(stream));
        }
    });
    address
}

#[tokio::test]
async fn test_fetch_once_against_fastcgi_responder() {
    let address = spawn_responder().await;
    let dialer = FcgiDialer::new(Network::Tcp, address);

    let fetched = fetch_once(&dialer, &params()).await.unwrap();
    assert_eq!(fetched.status, 200);
    assert!(fetched.is_success());
    assert_eq!(fetched.headers["Content-Type"], vec!["text/plain"]);
    assert_eq!(&fetched.body.read_all().unwrap()[..], b"/srv/www/index.php");
}

#[tokio::test]
async fn test_benchmark_against_fastcgi_responder() {
    let address = spawn_responder().await;
    let dialer: Arc<dyn Dialer> = Arc::new(FcgiDialer::new(Network::Tcp, address));

    let report = run_benchmark(&load(2, 50.0, 400), dialer, params())
        .await
        .unwrap();

    assert!(report.count() > 0);
    assert!(report.count() <= 20 + 2, "count: {}", report.count());
    assert_eq!(report.failed_workers(), 0);
    let summary = report.latency.unwrap();
    assert!(summary.min <= summary.p50 && summary.p99 <= summary.max);
}

#[tokio::test]
async fn test_dial_refused_is_reported() {
    // Bind then drop to get a port nothing listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let dialer = FcgiDialer::new(Network::Tcp, address);
    assert!(fetch_once(&dialer, &params()).await.is_err());
}
