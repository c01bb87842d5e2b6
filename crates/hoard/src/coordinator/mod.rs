//! Per-manifest download controller.
//!
//! A single aggregator task owns every counter of a download. Discovery
//! requests run as detached tasks that post [`Message`]s back; resource
//! fetches run in a [`JoinSet`] whose completions the aggregator consumes
//! directly. Nothing else mutates the state, so progress checkpoints are
//! written in the order the counters change.

mod state;
mod task;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};
use uuid::Uuid;

use self::state::{Channel, DownloadState};
use self::task::{ResourceTask, TaskOutcome};
use crate::error::{CacheError, Result};
use crate::facade::EngineContext;
use crate::handle::{DownloadHandle, DownloadProgress, Phase};
use crate::manifest::{DiscoveryEvent, RootManifest, SubManifest, TrackRef};
use crate::store::{Progress, Record, RecordKind};

/// Which discovery request failed.
#[derive(Debug, Clone, Copy)]
enum Stage {
    Root,
    Primary,
    Side(usize),
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Primary => "primary",
            Self::Side(_) => "side",
        }
    }

    fn side_index(self) -> Option<usize> {
        match self {
            Self::Side(index) => Some(index),
            _ => None,
        }
    }
}

enum Message {
    Root(RootManifest),
    Event(DiscoveryEvent),
    ChannelDone(Channel),
    DiscoveryFailed { stage: Stage, error: CacheError },
}

pub(crate) struct Coordinator {
    ctx: Arc<EngineContext>,
    owner: String,
    handle_id: Uuid,
    token: CancellationToken,
    progress_tx: watch::Sender<DownloadProgress>,
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
    state: DownloadState,
    root: Option<Arc<RootManifest>>,
    root_raw: Bytes,
    workers: JoinSet<(String, TaskOutcome)>,
}

impl Coordinator {
    /// Build a coordinator and the handle observing it. Nothing runs until
    /// [`Coordinator::spawn`].
    pub(crate) fn new(ctx: Arc<EngineContext>, owner: String) -> (Self, DownloadHandle) {
        let token = CancellationToken::new();
        let (progress_tx, progress_rx) = watch::channel(DownloadProgress::default());
        let handle = DownloadHandle::new(owner.clone(), token.clone(), progress_rx);
        let (tx, rx) = mpsc::unbounded_channel();
        let state = DownloadState::new(&owner, ctx.concurrency, ctx.checkpoint_interval);

        let coordinator = Self {
            ctx,
            owner,
            handle_id: handle.id(),
            token,
            progress_tx,
            tx,
            rx,
            state,
            root: None,
            root_raw: Bytes::new(),
            workers: JoinSet::new(),
        };
        (coordinator, handle)
    }

    pub(crate) fn spawn(self) {
        let span = info_span!("download", owner = %self.owner, id = %self.handle_id);
        tokio::spawn(self.run().instrument(span));
    }

    async fn run(mut self) {
        info!("Download started");
        self.spawn_root_discovery();

        let phase = match self.drive().await {
            Ok(()) => Phase::Finished,
            Err(CacheError::Cancelled) => Phase::Cancelled,
            Err(error) => {
                error!(error = %error, "Download aborted");
                Phase::Aborted
            }
        };

        // Stop discovery and let in-flight writes land before anyone deletes.
        self.token.cancel();
        while self.workers.join_next().await.is_some() {}

        // The final checkpoint was written inside drive(). Only now may
        // watchers see a terminal phase, and only once this run has left the
        // in-flight map. A delete in progress keeps the entry until its
        // cascade is done.
        self.ctx.in_flight.remove_if(&self.owner, |_, handle| {
            handle.id() == self.handle_id && !handle.is_deleting()
        });
        self.state.stop(phase);
        self.publish();

        let progress = self.state.progress();
        info!(
            completed = progress.completed,
            total = progress.total,
            failed = progress.failed,
            phase = ?progress.phase,
            "Download stopped"
        );
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            if self.state.is_finished() {
                return Ok(());
            }

            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(CacheError::Cancelled),
                Some(joined) = self.workers.join_next(), if !self.workers.is_empty() => {
                    self.on_task_finished(joined).await;
                }
                message = self.rx.recv() => match message {
                    Some(message) => self.on_message(message).await?,
                    None => {
                        return Err(CacheError::Internal {
                            reason: "discovery channel closed".to_string(),
                        });
                    }
                },
            }
        }
    }

    async fn on_message(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Root(root) => self.on_root(root).await,
            Message::Event(event) => self.on_event(event).await,
            Message::ChannelDone(channel) => {
                self.on_channel_done(channel).await;
                Ok(())
            }
            Message::DiscoveryFailed { stage, error } => {
                error!(
                    stage = stage.name(),
                    side_track = ?stage.side_index(),
                    error = %error,
                    "Manifest discovery failed"
                );
                self.state.stop(Phase::Stalled);
                self.publish();
                Ok(())
            }
        }
    }

    async fn on_root(&mut self, root: RootManifest) -> Result<()> {
        let root = Arc::new(root);
        self.on_event(DiscoveryEvent::RootManifestReady {
            url: root.url.clone(),
            raw: root.raw.clone(),
        })
        .await?;

        self.root = Some(Arc::clone(&root));
        self.spawn_primary_discovery(Arc::clone(&root));
        self.on_event(DiscoveryEvent::SideTrackListReady {
            tracks: root.side_tracks.clone(),
        })
        .await
    }

    async fn on_event(&mut self, event: DiscoveryEvent) -> Result<()> {
        match event {
            DiscoveryEvent::RootManifestReady { url, raw } => {
                let record = Record::root(&self.owner, raw.clone(), Progress::default());
                self.ctx.store.put(&record).await?;
                self.root_raw = raw;
                debug!(manifest = %url, "Root manifest persisted");
            }
            DiscoveryEvent::SideTrackListReady { tracks } => {
                debug!(tracks = tracks.len(), "Side tracks listed");
                self.request_side_track(0).await;
            }
            DiscoveryEvent::SubManifestReady { track, manifest } => {
                self.enqueue_manifest(track, manifest);
                self.publish();
                if let TrackRef::Side(index) = track {
                    self.request_side_track(index + 1).await;
                }
            }
        }
        Ok(())
    }

    fn enqueue_manifest(&mut self, track: TrackRef, manifest: SubManifest) {
        let (manifest_kind, fragment_kind) = match track {
            TrackRef::Primary(_) => (RecordKind::SubManifest, RecordKind::Segment),
            TrackRef::Side(_) => (RecordKind::SideTrack, RecordKind::SideTrack),
        };

        let fragments = manifest.fragments.len();
        // A root that is itself a media playlist must not be overwritten by its child.
        if manifest.url != self.owner {
            self.enqueue(ResourceTask::inline(manifest.url.clone(), manifest_kind, manifest.raw));
        }
        for fragment in manifest.fragments {
            self.enqueue(ResourceTask::remote(
                fragment.url,
                fragment_kind,
                fragment.playback_offset,
            ));
        }

        debug!(
            playlist = %manifest.url,
            track = ?track,
            fragments,
            total = self.state.progress().total,
            "Sub-manifest enqueued"
        );
    }

    fn enqueue(&mut self, task: ResourceTask) {
        if let Some(task) = self.state.enqueue(task) {
            self.start(task);
        }
    }

    fn start(&mut self, task: ResourceTask) {
        let store = Arc::clone(&self.ctx.store);
        let fetcher = Arc::clone(&self.ctx.fetcher);
        let owner = self.owner.clone();
        let token = self.token.clone();
        self.workers.spawn(
            async move {
                let outcome = task
                    .run(store.as_ref(), fetcher.as_ref(), &owner, &token)
                    .await;
                (task.key, outcome)
            }
            .in_current_span(),
        );
    }

    async fn on_task_finished(
        &mut self,
        joined: std::result::Result<(String, TaskOutcome), JoinError>,
    ) {
        let failed = match joined {
            Ok((key, TaskOutcome::Stored)) => {
                trace!(key = %key, "Resource stored");
                false
            }
            Ok((key, TaskOutcome::AlreadyPresent)) => {
                debug!(key = %key, "Resource already cached");
                false
            }
            Ok((key, TaskOutcome::Failed(error))) => {
                warn!(key = %key, error = %error, "Resource failed");
                true
            }
            // Only produced after the token fired; drive() returns on the next poll.
            Ok((_, TaskOutcome::Cancelled)) => return,
            Err(error) => {
                error!(error = %error, "Resource task panicked");
                true
            }
        };

        let step = self.state.complete(failed);
        self.publish();
        if step.checkpoint {
            self.checkpoint().await;
        }
        if let Some(next) = step.next {
            self.start(next);
        }
    }

    async fn on_channel_done(&mut self, channel: Channel) {
        self.state.channel_done(channel);
        self.publish();
        if self.state.is_finished() {
            self.checkpoint().await;
        }
    }

    async fn request_side_track(&mut self, index: usize) {
        let Some(root) = self.root.clone() else {
            return;
        };
        if index >= root.side_tracks.len() {
            self.on_channel_done(Channel::Side).await;
            return;
        }
        self.spawn_side_discovery(root, index);
    }

    async fn checkpoint(&self) {
        let progress = self.state.checkpoint();
        let record = Record::root(&self.owner, self.root_raw.clone(), progress);
        match self.ctx.store.put(&record).await {
            Ok(()) => debug!(
                completed = progress.completed,
                expected = progress.expected,
                settled = progress.settled,
                "Progress checkpointed"
            ),
            Err(error) => warn!(error = %error, "Progress checkpoint failed"),
        }
    }

    fn publish(&self) {
        self.progress_tx.send_replace(self.state.progress());
    }

    fn spawn_root_discovery(&self) {
        let source = Arc::clone(&self.ctx.source);
        let tx = self.tx.clone();
        let token = self.token.clone();
        let url = self.owner.clone();
        tokio::spawn(
            async move {
                let message = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    result = source.load_root(&url) => match result {
                        Ok(root) => Message::Root(root),
                        Err(error) => Message::DiscoveryFailed { stage: Stage::Root, error },
                    },
                };
                let _ = tx.send(message);
            }
            .in_current_span(),
        );
    }

    fn spawn_primary_discovery(&self, root: Arc<RootManifest>) {
        let source = Arc::clone(&self.ctx.source);
        let tx = self.tx.clone();
        let token = self.token.clone();
        tokio::spawn(
            async move {
                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    result = source.load_primary(&root) => result,
                };
                match result {
                    Ok(manifests) => {
                        for (index, manifest) in manifests.into_iter().enumerate() {
                            let event = DiscoveryEvent::SubManifestReady {
                                track: TrackRef::Primary(index),
                                manifest,
                            };
                            if tx.send(Message::Event(event)).is_err() {
                                return;
                            }
                        }
                        let _ = tx.send(Message::ChannelDone(Channel::Primary));
                    }
                    Err(error) => {
                        let _ = tx.send(Message::DiscoveryFailed {
                            stage: Stage::Primary,
                            error,
                        });
                    }
                }
            }
            .in_current_span(),
        );
    }

    fn spawn_side_discovery(&self, root: Arc<RootManifest>, index: usize) {
        let source = Arc::clone(&self.ctx.source);
        let tx = self.tx.clone();
        let token = self.token.clone();
        tokio::spawn(
            async move {
                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    result = source.load_side_track(&root, index) => result,
                };
                let message = match result {
                    Ok(manifest) => Message::Event(DiscoveryEvent::SubManifestReady {
                        track: TrackRef::Side(index),
                        manifest,
                    }),
                    Err(error) => Message::DiscoveryFailed {
                        stage: Stage::Side(index),
                        error,
                    },
                };
                let _ = tx.send(message);
            }
            .in_current_span(),
        );
    }
}
