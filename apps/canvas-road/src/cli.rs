use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::signal;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::config::WatchArgs;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Join a room, subscribe to the requested regions and print each envelope
/// as one JSON line.
pub async fn run_watch(args: WatchArgs) -> Result<()> {
    let ws_url = format!("{}/ws/{}", args.url.trim_end_matches('/'), args.room);
    debug!("connecting to {}", ws_url);

    let (ws_stream, _) = timeout(CONNECT_TIMEOUT, connect_async(&ws_url))
        .await
        .map_err(|_| anyhow!("connection timeout - is the canvas server running?"))?
        .with_context(|| format!("failed to connect to {ws_url}"))?;
    let (mut write, mut read) = ws_stream.split();

    let subscribe = json!({
        "type": "subscribe",
        "data": { "regions": args.regions },
    });
    write
        .send(Message::Text(subscribe.to_string().into()))
        .await
        .context("failed to send subscribe")?;

    let mut received = 0usize;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    println!("{}", text.as_str());
                    received += 1;
                    if args.count.is_some_and(|count| received >= count) {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err).context("websocket error"),
            },
        }
    }

    let _ = write.send(Message::Close(None)).await;
    Ok(())
}
