use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use task_broker::config::Config;
use task_broker::email::{
    EMAIL_EXCHANGE, EMAIL_QUEUE, LogEmailSender, SendEmailHandler, SmtpEmailSender,
};
use task_broker::messaging::{Consumer, MessageHandler, Worker};
use task_broker::metrics::{Metrics, server::start_metrics_server};

#[tokio::main]
async fn main() {
    setup_panic_handler();
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    setup_logging(&config.rust_log);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        service_name = %config.service_name,
        queue = EMAIL_QUEUE,
        "Email worker starting"
    );

    let metrics = match Metrics::new() {
        Ok(metrics) => metrics,
        Err(e) => {
            error!(error = %e, "Failed to create metrics");
            std::process::exit(1);
        }
    };

    let consumer = Consumer::new(config.rabbitmq.clone(), metrics.clone())
        .with_shutdown_grace(config.shutdown_grace);
    let mut worker = Worker::new(consumer, EMAIL_QUEUE, EMAIL_EXCHANGE);
    let shutdown = worker.shutdown_token();

    let metrics_shutdown = shutdown.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics, metrics_port, metrics_shutdown).await {
            error!(error = %e, "Metrics server error");
        }
    });

    tokio::spawn(wait_for_signal(shutdown.clone()));

    let email_handler: Arc<dyn MessageHandler> = match &config.smtp {
        Some(smtp) => match SmtpEmailSender::new(smtp, &config.email_from) {
            Ok(sender) => Arc::new(SendEmailHandler::new(sender)),
            Err(e) => {
                error!(error = %e, "Failed to configure SMTP sender");
                shutdown.cancel();
                std::process::exit(1);
            }
        },
        None => {
            warn!("SMTP_SERVER not set, emails will be logged instead of sent");
            Arc::new(SendEmailHandler::new(LogEmailSender::new(
                config.email_from.clone(),
            )))
        }
    };
    let handlers = vec![email_handler];

    if let Err(e) = worker.initialize(handlers).await {
        error!(error = %e, "Failed to initialize email worker");
        shutdown.cancel();
        std::process::exit(1);
    }

    info!("Ready to process email tasks");

    match worker.start().await {
        Ok(()) => info!("Email worker stopped"),
        Err(e) => {
            error!(error = %e, "Email worker exited with error");
            std::process::exit(1);
        }
    }
}

/// Cancels `shutdown` on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => return,
    }

    warn!("Shutdown signal received, stopping email worker...");
    shutdown.cancel();
}

fn setup_logging(rust_log: &str) {
    let filter = EnvFilter::try_new(rust_log).unwrap_or_else(|_| EnvFilter::new("info"));

    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .try_init();

    if let Err(e) = result {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            message,
            location = %location,
            thread = ?std::thread::current().name(),
            "Panic"
        );
        eprintln!("PANIC: {} at {}", message, location);
    }));
}
