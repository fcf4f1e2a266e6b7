use http_body_util::Full;
use hyper::{Request, Response, body::Bytes, service::service_fn};
use hyper_util::rt::TokioIo;
use owo_colors::OwoColorize;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, TextEncoder};
use tokio::net::TcpListener;

/// Per-controller reconciliation metrics, registered against the process
/// default registry.
pub struct ControllerMetrics {
    /// Total reconcile invocations, by resource.
    pub reconcile_counter: IntCounterVec,

    /// Actions decided by the read phase, by resource and action.
    pub action_counter: IntCounterVec,

    /// Duration of the read (decision) phase.
    pub read_histogram: HistogramVec,

    /// Duration of the write (execution) phase.
    pub write_histogram: HistogramVec,
}

impl ControllerMetrics {
    pub fn new(controller: &str) -> Self {
        let reconcile_counter = IntCounterVec::new(
            Opts::new(
                "coral_operator_reconcile_total",
                "Total number of reconcile invocations",
            )
            .const_label("controller", controller),
            &["name", "namespace"],
        )
        .unwrap();
        let action_counter = IntCounterVec::new(
            Opts::new(
                "coral_operator_action_total",
                "Actions selected during reconciliation",
            )
            .const_label("controller", controller),
            &["name", "namespace", "action"],
        )
        .unwrap();
        let read_histogram = HistogramVec::new(
            HistogramOpts::new(
                "coral_operator_read_phase_seconds",
                "Duration of the read phase of reconciliation",
            )
            .const_label("controller", controller),
            &["name", "namespace", "action"],
        )
        .unwrap();
        let write_histogram = HistogramVec::new(
            HistogramOpts::new(
                "coral_operator_write_phase_seconds",
                "Duration of the write phase of reconciliation",
            )
            .const_label("controller", controller),
            &["name", "namespace", "action"],
        )
        .unwrap();

        let registry = prometheus::default_registry();
        registry.register(Box::new(reconcile_counter.clone())).ok();
        registry.register(Box::new(action_counter.clone())).ok();
        registry.register(Box::new(read_histogram.clone())).ok();
        registry.register(Box::new(write_histogram.clone())).ok();

        ControllerMetrics {
            reconcile_counter,
            action_counter,
            read_histogram,
            write_histogram,
        }
    }
}

fn render(req: Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/metrics" => {
            let encoder = TextEncoder::new();
            let families = prometheus::default_registry().gather();
            let mut buf = Vec::new();
            if encoder.encode(&families, &mut buf).is_err() {
                return Response::builder()
                    .status(500)
                    .body(Full::new(Bytes::from_static(b"encode error")))
                    .unwrap();
            }
            Response::builder()
                .header("Content-Type", encoder.format_type())
                .body(Full::new(Bytes::from(buf)))
                .unwrap()
        }
        "/healthz" | "/readyz" => Response::new(Full::new(Bytes::from_static(b"ok"))),
        _ => Response::builder()
            .status(404)
            .body(Full::new(Bytes::from_static(b"not found")))
            .unwrap(),
    }
}

/// Serve `/metrics` and the health endpoints until the process exits.
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    println!(
        "{}{}",
        "📈 Starting metrics server • port=".green(),
        format!("{}", port).green().dimmed(),
    );
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            let service = service_fn(|req| async { Ok::<_, hyper::Error>(render(req)) });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                eprintln!("metrics connection error: {e}");
            }
        });
    }
}
