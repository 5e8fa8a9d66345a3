use std::error::Error;

use issue_chat_realtime::{RealtimeClient, RealtimeClientOptions};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:8787".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client =
            RealtimeClient::with_options(RealtimeClientOptions::default().with_endpoint(endpoint))?;

        client.on_message(|message| println!("chat: {message}"));
        client.on_file_received(|file| println!("file: {file}"));
        client.on_trace_update(|trace| println!("trace: {trace}"));
        client.on_connect(|| println!("connected"));
        client.on_disconnect(|event| {
            println!(
                "disconnected code={:?} reconnecting={}",
                event.code, event.reconnecting
            );
        });
        client.on_retries_exhausted(|attempts| {
            println!("gave up after {attempts} reconnect attempts");
        });

        // Lines typed before the socket opens are queued and flushed on connect.
        client.connect();

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            client.send_chat_message(json!({ "text": text }));
        }

        client.disconnect();
        Ok::<(), Box<dyn Error>>(())
    })
}
