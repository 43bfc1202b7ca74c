//! # Worker Contexts
//!
//! A worker is a separate execution context: its own OS thread, its own
//! current-thread runtime and its own [`Bridge`]. The root value it builds is
//! exposed on one end of a fresh channel; the caller keeps the other end.
//!
//! Nothing is shared with the caller except that channel.

use std::thread::JoinHandle;

use tokio::sync::oneshot;
use tracing::debug;
use tracing::error;

use crate::bridge::Bridge;
use crate::error::Error;
use crate::error::Result;
use crate::port::MessageChannel;
use crate::port::Port;
use crate::proxy::Proxy;
use crate::value::Value;

pub struct Worker {
    name: String,
    port: Port,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Starts a worker whose root value is built by `init` on the worker thread.
    ///
    /// Requests may be sent immediately; they queue until the worker is serving.
    pub fn spawn<F, V>(name: &str, init: F) -> Result<Worker>
    where
        F: FnOnce() -> V + Send + 'static,
        V: Into<Value>,
    {
        let (outer, inner) = MessageChannel::pair();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let thread_name = name.to_string();

        let thread = std::thread::Builder::new()
            .name(format!("worker-{}", name))
            .spawn(move || run(thread_name, inner, init, stop_rx))
            .map_err(|e| Error::Worker(format!("failed to spawn worker thread: {}", e)))?;

        debug!(worker = name, port = outer.id(), "worker spawned");
        Ok(Worker {
            name: name.to_string(),
            port: outer,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The caller's end of the worker channel.
    pub fn port(&self) -> &Port {
        &self.port
    }

    /// A root proxy onto the worker's exposed value.
    pub fn proxy(&self, bridge: &Bridge) -> Result<Proxy> {
        bridge.proxy(self.port.clone())
    }

    /// Stops the worker and waits for its thread to exit. Requests still in
    /// flight fail with `ChannelClosed`.
    pub fn terminate(mut self) -> Result<()> {
        self.signal_stop();
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| Error::Worker(format!("worker '{}' panicked", self.name))),
            None => Ok(()),
        }
    }

    fn signal_stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // the thread exits on its own once it sees the signal
        self.signal_stop();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("port", &self.port)
            .finish()
    }
}

fn run<F, V>(name: String, port: Port, init: F, stop: oneshot::Receiver<()>)
where
    F: FnOnce() -> V,
    V: Into<Value>,
{
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(worker = %name, "failed to build worker runtime: {}", e);
            port.close();
            return;
        }
    };

    runtime.block_on(async {
        let bridge = Bridge::new();
        let root = init().into();
        if let Err(e) = bridge.expose(root, port.clone()) {
            error!(worker = %name, "failed to expose worker root: {}", e);
            port.close();
            return;
        }
        debug!(worker = %name, seed = bridge.ids().seed(), "worker serving");

        // a dropped handle counts as a stop signal
        let _ = stop.await;
        port.close();
    });

    drop(runtime);
    debug!(worker = %name, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Record;

    #[tokio::test]
    async fn test_worker_serves_its_root() {
        let worker = Worker::spawn("echo", || {
            Record::new().method("echo", |_, args| Ok(args.into_iter().next().unwrap_or(Value::Null)))
        })
        .unwrap();

        let bridge = Bridge::new();
        let proxy = worker.proxy(&bridge).unwrap();
        let echoed = proxy.access("echo").call(vec![Value::from("ping")]).await.unwrap();
        assert_eq!(echoed, Value::from("ping"));

        worker.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_terminate_fails_requests_in_flight() {
        let worker = Worker::spawn("stall", || {
            Record::new().with(
                "stall",
                crate::value::Function::new("stall", |_, _| async {
                    futures::future::pending::<()>().await;
                    Ok::<Value, crate::value::Exception>(Value::Null)
                }),
            )
        })
        .unwrap();

        let bridge = Bridge::new();
        let proxy = worker.proxy(&bridge).unwrap();
        let pending = tokio::spawn(async move { proxy.access("stall").call(vec![]).await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        worker.terminate().unwrap();
        assert_eq!(pending.await.unwrap().unwrap_err(), Error::ChannelClosed);
    }
}
