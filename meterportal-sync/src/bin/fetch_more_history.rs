use anyhow::{bail, Context, Result};
use meterportal_sync::{app::App, backfill::BackfillRequest, config::AppConfig, observability};
use std::env;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || args.len() > 4 {
        bail!("usage: fetch_more_history <statistic_id> [from_days_ago] [to_days_ago]");
    }
    let mut request = BackfillRequest::new(args[1].as_str());
    if let Some(from) = args.get(2) {
        request.from_days_ago = from.parse().context("from_days_ago must be an integer")?;
    }
    if let Some(to) = args.get(3) {
        request.to_days_ago = to.parse().context("to_days_ago must be an integer")?;
    }
    request.window(time::OffsetDateTime::now_utc())?;

    // Can point METERPORTAL_CONFIG at the service's file; the same state file is used.
    let cfg = AppConfig::load()?;
    let app = App::build(&cfg).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let outcome = app.backfill.fetch_more_history(request, &cancel).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    Ok(())
}
