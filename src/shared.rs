// Thread-safe handle around a segment server
//
// State transitions take the write lock for their whole duration; queries
// share the read lock. CPU-heavy work can be pushed onto tokio's blocking
// pool so async callers are never stalled by a wide-window feature pass.

use crate::error::{Result, SegsrvError};
use crate::features::CancellationToken;
use crate::server::SegmentServer;
use crate::source::RecordingSource;
use crate::types::{FeatureRequest, SignalRequest, SignalResponse};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

pub struct SharedSegmentServer<R: RecordingSource> {
    inner: Arc<RwLock<SegmentServer<R>>>,
    cancel: Arc<CancellationToken>,
}

impl<R: RecordingSource> Clone for SharedSegmentServer<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            cancel: Arc::clone(&self.cancel),
        }
    }
}

impl<R> SharedSegmentServer<R>
where
    R: RecordingSource + Send + Sync + 'static,
{
    pub fn new(server: SegmentServer<R>) -> Self {
        let cancel = server.cancel_handle();
        Self {
            inner: Arc::new(RwLock::new(server)),
            cancel,
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, SegmentServer<R>> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, SegmentServer<R>> {
        self.inner.write()
    }

    /// Run `f` with exclusive access, e.g. `populate` followed by `set_window`
    pub fn with_exclusive<T>(&self, f: impl FnOnce(&mut SegmentServer<R>) -> T) -> T {
        let mut server = self.inner.write();
        f(&mut server)
    }

    /// Abort the feature pass running right now, without taking the lock
    pub fn cancel(&self) {
        log::warn!("[SEGSRV] cancellation requested");
        self.cancel.cancel();
    }

    pub async fn calc_features_offloaded(&self, request: FeatureRequest) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.write().calc_features(&request))
            .await
            .map_err(|e| {
                log::error!("[SEGSRV] feature task join error: {}", e);
                SegsrvError::Worker(e.to_string())
            })?
    }

    pub async fn calc_bands_offloaded(&self, channels: Vec<String>) -> Result<()> {
        self.calc_features_offloaded(FeatureRequest::bands().channels(channels))
            .await
    }

    pub async fn calc_hjorths_offloaded(&self, channels: Vec<String>) -> Result<()> {
        self.calc_features_offloaded(FeatureRequest::hjorths().channels(channels))
            .await
    }

    pub async fn get_signal_offloaded(&self, request: SignalRequest) -> Result<SignalResponse> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.read().get_signal(&request))
            .await
            .map_err(|e| {
                log::error!("[SEGSRV] signal task join error: {}", e);
                SegsrvError::Worker(e.to_string())
            })?
    }
}
