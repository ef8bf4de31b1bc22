//! Bridge from the synchronous connection ports to async `reqwest`.
//!
//! The runtime is picked per call, not when the app is built:
//! - inside a multi-thread runtime, the caller's runtime is reused through
//!   `block_in_place`;
//! - inside a current-thread runtime, the future runs on a helper thread
//!   driven by the bridge's own runtime (`block_in_place` would panic there);
//! - with no runtime at all, the bridge's own runtime drives it directly.
//!
//! The owned runtime is only built the first time it is needed and is shut
//! down in the background on drop, so dropping an app from async code is fine.

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use domain::RemoteError;
use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};
use tracing::debug;

#[derive(Clone, Default)]
pub(crate) struct Bridge {
    owned: Arc<OnceLock<Result<OwnedRuntime, String>>>,
}

struct OwnedRuntime {
    handle: Handle,
    // None only while dropping
    rt: Option<Runtime>,
}

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        if let Some(rt) = self.rt.take() {
            rt.shutdown_background();
        }
    }
}

impl Bridge {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn owned(&self) -> Result<&Handle, RemoteError> {
        self.owned
            .get_or_init(|| {
                let rt = Builder::new_multi_thread()
                    .worker_threads(2)
                    .thread_name("firestore-bridge")
                    .enable_all()
                    .build()
                    .map_err(|e| format!("tokio runtime init: {e}"))?;
                debug!("firestore: started bridge runtime");
                Ok(OwnedRuntime {
                    handle: rt.handle().clone(),
                    rt: Some(rt),
                })
            })
            .as_ref()
            .map(|owned| &owned.handle)
            .map_err(|e| RemoteError::Transport(e.clone()))
    }

    /// Run `fut` to completion, failing with `DeadlineExceeded` once `timeout`
    /// has elapsed.
    pub(crate) fn run<T, F>(&self, timeout: Option<Duration>, fut: F) -> Result<T, RemoteError>
    where
        F: Future<Output = Result<T, RemoteError>> + Send,
        T: Send,
    {
        let fut = with_deadline(timeout, fut);
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| handle.block_on(fut))
            }
            Ok(_) => thread::scope(|s| {
                s.spawn(|| self.owned()?.block_on(fut))
                    .join()
                    .unwrap_or_else(|_| {
                        Err(RemoteError::Transport("bridge thread panicked".into()))
                    })
            }),
            Err(_) => self.owned()?.block_on(fut),
        }
    }
}

// The timer is created on first poll, inside whichever runtime drives it.
async fn with_deadline<T, F>(timeout: Option<Duration>, fut: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| RemoteError::DeadlineExceeded)?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(v: u32) -> impl Future<Output = Result<u32, RemoteError>> + Send {
        async move { Ok(v) }
    }

    #[test]
    fn runs_without_an_ambient_runtime() {
        let bridge = Bridge::new();
        assert_eq!(bridge.run(None, ready(1)).unwrap(), 1);
        assert_eq!(bridge.run(Some(Duration::from_secs(1)), ready(2)).unwrap(), 2);
    }

    #[tokio::test]
    async fn runs_inside_a_current_thread_runtime() {
        let bridge = Bridge::new();
        assert_eq!(bridge.run(Some(Duration::from_secs(1)), ready(3)).unwrap(), 3);
        // owned runtime is dropped here, inside async code
        drop(bridge);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_inside_a_multi_thread_runtime() {
        let bridge = Bridge::new();
        assert_eq!(bridge.run(None, ready(4)).unwrap(), 4);
    }

    #[test]
    fn built_outside_then_used_inside_a_runtime() {
        let bridge = Bridge::new();
        assert_eq!(bridge.run(None, ready(5)).unwrap(), 5);

        let current = Builder::new_current_thread().enable_all().build().unwrap();
        assert_eq!(current.block_on(async { bridge.run(None, ready(6)) }).unwrap(), 6);

        let multi = Builder::new_multi_thread().enable_all().build().unwrap();
        assert_eq!(multi.block_on(async { bridge.run(None, ready(7)) }).unwrap(), 7);
    }

    #[tokio::test]
    async fn deadline_applies_on_the_helper_thread() {
        let bridge = Bridge::new();
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, RemoteError>(())
        };
        assert_eq!(
            bridge.run(Some(Duration::from_millis(20)), slow),
            Err(RemoteError::DeadlineExceeded)
        );
    }
}
