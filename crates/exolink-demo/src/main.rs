//! Drives a `Fetch` object living in a worker context through a proxy.
//!
//! Run with `RUST_LOG=debug` to watch the request traffic.

mod fetch;

use std::collections::BTreeMap;

use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use exolink::Bridge;
use exolink::Value;
use exolink::Worker;

const PAGES: [&str; 4] = ["a.html", "a/aurora.html", "lyrics/aurora/runaway.html", "b.html"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let worker = Worker::spawn("fetch", fetch::root)?;
    let bridge = Bridge::new();
    let root = worker.proxy(&bridge)?;

    let api = root.access("Fetch").construct(vec![]).await?;
    api.access("setBaseUrl")
        .call(vec![Value::from("https://lyrics.example/")])
        .await?;

    let mut headers = BTreeMap::new();
    headers.insert("Content-Type".to_string(), Value::from("text/html"));
    api.access("setDefaultHeaders").call(vec![Value::Map(headers)]).await?;

    let mut body = BTreeMap::new();
    body.insert("lang".to_string(), Value::from("en"));
    api.access("setDefaultBody").call(vec![Value::Map(body)]).await?;

    let mut tasks = Vec::new();
    for path in PAGES {
        let get = api.access("get");
        tasks.push(tokio::spawn(async move { (path, get.call(vec![Value::from(path)]).await) }));
    }

    for task in tasks {
        let (path, result) = task.await?;
        match result {
            Ok(page) => {
                let status = page.get("status").await?;
                let body = page.get("body").await?;
                info!(path, status = ?status, body = %body.describe(), "fetched");
            }
            Err(e) => warn!(path, "fetch failed: {}", e),
        }
    }

    worker.terminate()?;
    Ok(())
}
