//! Scriptable media backend for tests
//!
//! Records every description and candidate applied to it and lets tests
//! emit media events (gathered candidates, establishment) on demand.

use super::{
    IceCandidate, MediaError, MediaEvent, MediaFactory, MediaSession, MediaSource,
    SessionDescription,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Factory producing [`MockMediaSession`]s and counting source lifecycle
#[derive(Default)]
pub struct MockMediaFactory {
    fail_acquisition: AtomicBool,
    sources_acquired: AtomicUsize,
    sessions: Mutex<Vec<Arc<MockMediaSession>>>,
}

impl MockMediaFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `acquire_source` calls fail
    pub fn fail_acquisition(&self, fail: bool) {
        self.fail_acquisition.store(fail, Ordering::Relaxed);
    }

    /// Sessions created so far, in creation order
    pub fn sessions(&self) -> Vec<Arc<MockMediaSession>> {
        self.sessions.lock().clone()
    }

    pub fn sources_acquired(&self) -> usize {
        self.sources_acquired.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MediaFactory for MockMediaFactory {
    async fn acquire_source(&self) -> Result<Arc<dyn MediaSource>, MediaError> {
        if self.fail_acquisition.load(Ordering::Relaxed) {
            return Err(MediaError::Acquisition("mock device unavailable".to_string()));
        }
        self.sources_acquired.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(MockMediaSource {
            id: format!("mock-source-{}", uuid::Uuid::new_v4()),
            stops: AtomicUsize::new(0),
        }))
    }

    async fn create_session(
        &self,
        source: Option<Arc<dyn MediaSource>>,
    ) -> Result<(Arc<dyn MediaSession>, mpsc::UnboundedReceiver<MediaEvent>), MediaError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Arc::new(MockMediaSession {
            source_id: source.map(|s| s.id()),
            state: Mutex::new(SessionState::default()),
            events_tx,
        });
        self.sessions.lock().push(session.clone());
        Ok((session, events_rx))
    }
}

/// Local capture stand-in
pub struct MockMediaSource {
    id: String,
    stops: AtomicUsize,
}

impl MockMediaSource {
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct SessionState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    closed: bool,
}

/// Recording media session
pub struct MockMediaSession {
    source_id: Option<String>,
    state: Mutex<SessionState>,
    events_tx: mpsc::UnboundedSender<MediaEvent>,
}

impl MockMediaSession {
    /// Id of the local source attached at creation, if any
    pub fn source_id(&self) -> Option<String> {
        self.source_id.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    /// Candidates applied so far, in application order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Test hook: report a locally gathered candidate
    pub fn emit_candidate(&self, candidate: IceCandidate) {
        let _ = self.events_tx.send(MediaEvent::IceCandidate(candidate));
    }

    /// Test hook: report media establishment
    pub fn emit_established(&self) {
        let _ = self.events_tx.send(MediaEvent::Established);
    }
}

#[async_trait]
impl MediaSession for MockMediaSession {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let state = self.state.lock();
        if state.closed {
            return Err(MediaError::Closed);
        }
        Ok(SessionDescription::offer(format!(
            "v=0 mock-offer from {:?}",
            self.source_id
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let state = self.state.lock();
        if state.closed {
            return Err(MediaError::Closed);
        }
        if state.remote.is_none() {
            return Err(MediaError::Sdp("no remote offer to answer".to_string()));
        }
        Ok(SessionDescription::answer(format!(
            "v=0 mock-answer from {:?}",
            self.source_id
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(MediaError::Closed);
        }
        state.local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(MediaError::Closed);
        }
        state.remote = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(MediaError::Closed);
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.state.lock().closed = true;
        let _ = self.events_tx.send(MediaEvent::Closed);
        Ok(())
    }
}
