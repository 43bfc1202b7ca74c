//! The worker side of the demo: a `Fetch` constructor over an in-memory page
//! store. Instances keep a base URL plus default headers and body, and resolve
//! `get(path)` against the store.

use std::collections::BTreeMap;
use std::sync::Arc;

use exolink::Exception;
use exolink::Function;
use exolink::Record;
use exolink::Value;

type Pages = Arc<BTreeMap<String, String>>;

fn pages() -> Pages {
    let mut pages = BTreeMap::new();
    pages.insert(
        "https://lyrics.example/a.html".to_string(),
        "<a href=\"/a/aurora.html\">Aurora</a>".to_string(),
    );
    pages.insert(
        "https://lyrics.example/a/aurora.html".to_string(),
        "<a href=\"/lyrics/aurora/runaway.html\">Runaway</a>".to_string(),
    );
    pages.insert(
        "https://lyrics.example/lyrics/aurora/runaway.html".to_string(),
        "<div class=\"lyrics\">I was listening to the ocean</div>".to_string(),
    );
    Arc::new(pages)
}

/// The root value the worker exposes.
pub fn root() -> Record {
    let pages = pages();
    Record::new().with(
        "Fetch",
        Function::sync("Fetch", move |_, _| Ok(instance(pages.clone()).into_value())),
    )
}

fn instance(pages: Pages) -> Record {
    Record::new()
        .with("baseUrl", "")
        .with("headers", Value::Map(BTreeMap::new()))
        .with("body", Value::Map(BTreeMap::new()))
        .with("setBaseUrl", setter("setBaseUrl", "baseUrl"))
        .with("setDefaultHeaders", setter("setDefaultHeaders", "headers"))
        .with("setDefaultBody", setter("setDefaultBody", "body"))
        .with("get", get(pages))
}

/// A method assigning its first argument to `field` on the receiver.
fn setter(name: &str, field: &'static str) -> Function {
    Function::new(name, move |this, args| async move {
        let value = args.into_iter().next().unwrap_or(Value::Null);
        this.set(field, value).await?;
        Ok::<Value, Exception>(Value::Null)
    })
}

fn get(pages: Pages) -> Function {
    Function::new("get", move |this, args| {
        let pages = pages.clone();
        async move {
            let path = args.first().and_then(Value::as_str).unwrap_or("").to_string();
            let base = this.get("baseUrl").await?;
            let url = join(base.as_str().unwrap_or(""), &path);

            let Some(page) = pages.get(&url) else {
                return Err(Exception::new(format!("404 Not Found: {}", url)).with_trace("at Fetch.get"));
            };

            let headers = this.get("headers").await?;
            let content_type = headers.get("Content-Type").await?;

            let mut response = BTreeMap::new();
            response.insert("url".to_string(), Value::from(url));
            response.insert("status".to_string(), Value::Int(200));
            response.insert("contentType".to_string(), content_type);
            response.insert("body".to_string(), Value::from(page.as_str()));
            Ok::<Value, Exception>(Value::Map(response))
        }
    })
}

fn join(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) if !base.is_empty() => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}
