//! Process-wide pod readiness watcher.
//!
//! A single label-selector watch scoped to this process's lineage label feeds
//! one event loop that maintains pod readiness state and wakes waiters. A
//! waiter always registers its channel before consulting the ready map, so a
//! readiness edge that happened earlier is still observed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, WatchEvent, WatchParams};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::browser::kubernetes::converter::LINEAGE_LABEL;
use crate::error::{Error, Result};

enum PodState {
    Pending,
    Ready(String),
}

struct WatcherState {
    waiters: HashMap<String, oneshot::Sender<Result<String>>>,
    pods: HashMap<String, PodState>,
    closed: bool,
}

pub struct PodWatcher {
    state: Arc<Mutex<WatcherState>>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PodWatcher {
    /// Open the lineage-scoped watch and start the event loop. Fails when
    /// the initial watch request is rejected.
    pub async fn start(api: Api<Pod>, lineage: &str) -> Result<Arc<Self>> {
        let params = WatchParams::default().labels(&format!("{LINEAGE_LABEL}={lineage}"));
        let stream = api
            .watch(&params, "0")
            .await
            .map_err(|e| Error::internal(format!("failed to open pod watch: {e}")))?
            .boxed();

        let state = Arc::new(Mutex::new(WatcherState {
            waiters: HashMap::new(),
            pods: HashMap::new(),
            closed: false,
        }));
        let cancel = CancellationToken::new();

        let loop_state = Arc::clone(&state);
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run_event_loop(stream, loop_state, loop_cancel).await;
        });

        Ok(Arc::new(PodWatcher {
            state,
            cancel,
            handle: Mutex::new(Some(handle)),
        }))
    }

    /// Wait until the named pod reports every container ready, returning its
    /// IP. Fails when the pod is deleted, the watch closes, `timeout` passes,
    /// or the caller's `cancel` fires first.
    pub async fn wait_pod_ready(
        &self,
        pod_name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let rx = {
            let mut st = self.state.lock().expect("watcher lock poisoned");
            if st.closed {
                return Err(Error::internal("pod watcher is closed"));
            }
            let (tx, rx) = oneshot::channel();
            st.waiters.insert(pod_name.to_string(), tx);
            // the readiness edge may already have passed; the map remembers it
            if let Some(PodState::Ready(ip)) = st.pods.get(pod_name) {
                let ip = ip.clone();
                st.waiters.remove(pod_name);
                return Ok(ip);
            }
            rx
        };

        let result = tokio::select! {
            res = rx => match res {
                Ok(res) => res,
                Err(_) => Err(Error::internal("pod watcher was closed")),
            },
            _ = tokio::time::sleep(timeout) => Err(Error::gateway_timeout(format!(
                "pod {pod_name} did not become ready within {timeout:?}"
            ))),
            _ = cancel.cancelled() => Err(Error::canceled(format!(
                "canceled while waiting for pod {pod_name} to become ready"
            ))),
        };
        {
            let mut st = self.state.lock().expect("watcher lock poisoned");
            st.waiters.remove(pod_name);
        }
        result
    }

    /// Cancel the watch and wait for the event loop to drain.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        tracing::info!("pod watcher is shutting down...");
        self.cancel.cancel();
        let handle = self.handle.lock().expect("watcher lock poisoned").take();
        if let Some(handle) = handle {
            tokio::time::timeout(timeout, handle)
                .await
                .map_err(|_| Error::internal("pod watcher shutdown timed out"))?
                .map_err(|e| Error::internal(format!("pod watcher event loop failed: {e}")))?;
        }
        Ok(())
    }
}

async fn run_event_loop(
    mut stream: futures::stream::BoxStream<'_, kube::Result<WatchEvent<Pod>>>,
    state: Arc<Mutex<WatcherState>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.try_next() => event,
        };
        match event {
            Ok(Some(event)) => handle_event(&state, event),
            Ok(None) => {
                tracing::warn!("pod watch stream ended");
                break;
            }
            Err(err) => {
                tracing::error!(error = %err, "pod watch stream failed");
                break;
            }
        }
    }

    let mut st = state.lock().expect("watcher lock poisoned");
    st.closed = true;
    for (_, waiter) in st.waiters.drain() {
        let _ = waiter.send(Err(Error::internal("pod watcher was closed")));
    }
    tracing::info!("pod events watcher shutdown completed");
}

fn handle_event(state: &Arc<Mutex<WatcherState>>, event: WatchEvent<Pod>) {
    let mut st = state.lock().expect("watcher lock poisoned");
    match event {
        WatchEvent::Added(pod) => {
            if let Some(name) = pod.metadata.name {
                st.pods.entry(name).or_insert(PodState::Pending);
            }
        }
        WatchEvent::Modified(pod) => {
            let name = match pod.metadata.name.clone() {
                Some(name) => name,
                None => return,
            };
            // readiness edges are reported once; later Modified events for a
            // ready pod are coalesced away here
            if matches!(st.pods.get(&name), Some(PodState::Ready(_))) {
                return;
            }
            if let Some(ip) = ready_ip(&pod) {
                st.pods.insert(name.clone(), PodState::Ready(ip.clone()));
                if let Some(waiter) = st.waiters.remove(&name) {
                    let _ = waiter.send(Ok(ip));
                }
            }
        }
        WatchEvent::Deleted(pod) => {
            if let Some(name) = pod.metadata.name {
                st.pods.remove(&name);
                if let Some(waiter) = st.waiters.remove(&name) {
                    let _ = waiter.send(Err(Error::internal(format!("pod {name} was deleted"))));
                }
            }
        }
        WatchEvent::Bookmark(_) => {}
        WatchEvent::Error(err) => {
            tracing::warn!(error = %err, "pod watch reported an error event");
        }
    }
}

/// A pod is ready when a status exists for every container and all of them
/// report ready.
fn ready_ip(pod: &Pod) -> Option<String> {
    let spec = pod.spec.as_ref()?;
    let status = pod.status.as_ref()?;
    let statuses = status.container_statuses.as_ref()?;
    if statuses.len() != spec.containers.len() {
        return None;
    }
    if statuses.iter().all(|cs| cs.ready) {
        status.pod_ip.clone()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, ContainerStatus, PodSpec, PodStatus};

    fn pod(name: &str, containers: usize, ready: &[bool], ip: Option<&str>) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.spec = Some(PodSpec {
            containers: (0..containers)
                .map(|i| Container {
                    name: format!("c{i}"),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        });
        pod.status = Some(PodStatus {
            pod_ip: ip.map(String::from),
            container_statuses: Some(
                ready
                    .iter()
                    .map(|r| ContainerStatus {
                        ready: *r,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        });
        pod
    }

    fn fresh_state() -> Arc<Mutex<WatcherState>> {
        Arc::new(Mutex::new(WatcherState {
            waiters: HashMap::new(),
            pods: HashMap::new(),
            closed: false,
        }))
    }

    #[test]
    fn readiness_requires_all_container_statuses() {
        assert!(ready_ip(&pod("p", 2, &[true, true], Some("10.0.0.1"))).is_some());
        assert!(ready_ip(&pod("p", 2, &[true, false], Some("10.0.0.1"))).is_none());
        // statuses lagging behind the spec
        assert!(ready_ip(&pod("p", 2, &[true], Some("10.0.0.1"))).is_none());
    }

    #[tokio::test]
    async fn waiter_receives_readiness_edge() {
        let state = fresh_state();
        let (tx, rx) = oneshot::channel();
        state
            .lock()
            .unwrap()
            .waiters
            .insert("p1".to_string(), tx);

        handle_event(&state, WatchEvent::Added(pod("p1", 1, &[false], None)));
        handle_event(
            &state,
            WatchEvent::Modified(pod("p1", 1, &[true], Some("10.1.2.3"))),
        );
        assert_eq!(rx.await.unwrap().unwrap(), "10.1.2.3");
    }

    #[tokio::test]
    async fn deletion_fails_outstanding_waiter() {
        let state = fresh_state();
        let (tx, rx) = oneshot::channel();
        state
            .lock()
            .unwrap()
            .waiters
            .insert("p1".to_string(), tx);

        handle_event(&state, WatchEvent::Deleted(pod("p1", 1, &[false], None)));
        assert!(rx.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn duplicate_ready_events_are_coalesced() {
        let state = fresh_state();
        handle_event(
            &state,
            WatchEvent::Modified(pod("p1", 1, &[true], Some("10.1.2.3"))),
        );
        // a second edge must not re-signal: register a waiter afterwards and
        // feed another ready event; the waiter set stays untouched because
        // the pod is already marked ready
        let (tx, _rx) = oneshot::channel();
        state
            .lock()
            .unwrap()
            .waiters
            .insert("p1".to_string(), tx);
        handle_event(
            &state,
            WatchEvent::Modified(pod("p1", 1, &[true], Some("10.1.2.3"))),
        );
        assert!(state.lock().unwrap().waiters.contains_key("p1"));
    }
}
