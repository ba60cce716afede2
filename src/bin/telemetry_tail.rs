//! telemetry-tail entry point.
//!
//! Connects with `TELEMETRY_*` settings, subscribes to the topics given as
//! arguments and logs every envelope until Ctrl-C.
//!
//! ```text
//! TELEMETRY_ADDRESS=ws://127.0.0.1:9000/ws telemetry-tail gen/server
//! ```

use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use telemetry_channel::{Channel, ChannelNotice, ChannelOptions, Error, Params};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let options = ChannelOptions::from_env();
    let channel = Channel::builder().options(options).build()?;
    tracing::info!(
        address = channel.address(),
        transport = channel.transport_name(),
        "starting telemetry-tail"
    );

    // Log every envelope
    let _tail = channel.on_any(|envelope| {
        tracing::info!(
            message_type = %envelope.message_type,
            topic = envelope.topic_id.as_ref().map(|t| t.as_str()),
            data = %envelope.data,
            "envelope"
        );
        Ok(())
    });

    let subscriptions: Vec<_> = std::env::args()
        .skip(1)
        .map(|topic| channel.subscribe(topic, Params::new()))
        .collect();
    tracing::info!(topics = subscriptions.len(), "topics registered");

    let mut notices = channel.notices();
    let watcher = tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(ChannelNotice::GivenUp { attempts }) => {
                    tracing::error!(attempts, "server unreachable");
                }
                Ok(notice) => tracing::info!(?notice, "channel notice"),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "notices lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    match channel.connect().await {
        Ok(()) => {}
        Err(Error::GivenUp { attempts }) => {
            tracing::error!(attempts, "could not connect");
            channel.dispose();
            return Err(Error::given_up(attempts).into());
        }
        Err(e) => return Err(e.into()),
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    drop(subscriptions);
    channel.dispose();
    watcher.abort();

    Ok(())
}
