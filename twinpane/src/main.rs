use std::process::ExitCode;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;
use twinpane::commands::{App, Command, USAGE, parse_args};
use twinpane::profiles::ProfileStore;
use twinpane::settings::Settings;
use twinpane_core::{Activity, Notification, NotificationSink};
use twinpane_integrations::ids::LOG_PREFIX;
use twinpane_integrations::{notification_line, progress_label};

/// Prints user-facing notifications on stderr.
struct StderrNotifier;

impl NotificationSink for StderrNotifier {
    fn notify(&self, notification: Notification) {
        eprintln!(
            "{LOG_PREFIX} {}",
            notification_line(&notification.title, &notification.message)
        );
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn spawn_progress_reporter(activity: &Arc<Activity>) -> JoinHandle<()> {
    let mut overall = activity.subscribe();
    tokio::spawn(async move {
        while overall.changed().await.is_ok() {
            let value = *overall.borrow_and_update();
            if value > 0.0 {
                eprintln!("{LOG_PREFIX} {}", progress_label(Some(value)));
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    init_tracing();

    let invocation = parse_args(std::env::args())?;
    if invocation.command == Command::Help {
        print!("{USAGE}");
        return Ok(ExitCode::SUCCESS);
    }

    let settings = Settings::from_env();
    let store = ProfileStore::load(&settings.profiles_path).await?;
    let mut app = App::new(settings.clone(), store, Arc::new(StderrNotifier));
    let ticker = app.activity().spawn_ticker(settings.tick);
    let reporter = invocation
        .progress
        .then(|| spawn_progress_reporter(app.activity()));

    let mut stdout = std::io::stdout().lock();
    let result = app.execute(invocation.command, &mut stdout).await;
    app.close().await;
    ticker.abort();
    if let Some(reporter) = reporter {
        reporter.abort();
    }

    if result? {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
