// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The scanner task: polls the camera, gates detection ticks, drives the
// session state machine, and runs captures in the background.
//
// Everything that mutates the session (controls, detection ticks, capture
// completions) is applied inside one `select!` loop, so observers only ever
// see whole transitions.  Observers read a `watch` snapshot and a
// `broadcast` event stream.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sortwerk_core::error::{Result, SortwerkError};
use sortwerk_core::types::{CardMatch, DetectionResult, Frame, ScanStatus};
use sortwerk_core::SorterConfig;
use sortwerk_vision::{CardDetector, CardNormalizer};
use tokio::sync::{Notify, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::services::{FrameSource, IdentificationService};
use crate::session::{AcceptedCard, Capture, CaptureTicket, Effect, JamAlert, ScanSession, ScannerSnapshot};
use crate::stability::{StabilityTracker, TickGate};

const CONTROL_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 64;

/// Notifications published by the scanner.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    StatusChanged { from: ScanStatus, to: ScanStatus },
    CardAccepted(AcceptedCard),
    /// Identification found nothing.
    FailureCue,
    JamAlert(JamAlert),
}

#[derive(Debug, Clone, Copy)]
enum Control {
    Start,
    Retry,
    Pause,
    Resume,
    ForceScan,
    ForceAddDuplicate,
    DismissAlert,
    Precondition(bool),
    Jam(Option<u8>),
}

struct Request {
    control: Control,
    reply: oneshot::Sender<bool>,
}

struct Completion {
    ticket: CaptureTicket,
    outcome: Result<Option<CardMatch>>,
}

/// Handle to a running scanner.  Clones control the same scanner.
#[derive(Clone)]
pub struct Scanner {
    controls: mpsc::Sender<Request>,
    snapshot: watch::Receiver<ScannerSnapshot>,
    events: broadcast::Sender<ScanEvent>,
    shutdown: Arc<Notify>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Scanner {
    /// Spawn the scanner task.  The scanner waits in `Initializing` until
    /// [`start`](Self::start) is called.
    pub fn spawn<F, I>(config: &SorterConfig, frames: F, identifier: I) -> Self
    where
        F: FrameSource,
        I: IdentificationService,
    {
        let session = ScanSession::new(StabilityTracker::new(config.stable_frames));
        let (snapshot_tx, snapshot) = watch::channel(session.snapshot());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (controls, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (completions, completion_rx) = mpsc::channel(CONTROL_CAPACITY);
        let shutdown = Arc::new(Notify::new());

        let scan_loop = ScanLoop {
            reported_status: session.status(),
            session,
            frames,
            identifier: Arc::new(identifier),
            detector: CardDetector::from_config(config),
            normalizer: CardNormalizer::from_config(config),
            gate: TickGate::new(config.detection_interval())
                .with_tolerance(config.frame_poll_interval() / 2),
            snapshot: snapshot_tx,
            events: events.clone(),
            completions,
            camera_open: false,
            last_frame: None,
        };

        let poll = config.frame_poll_interval();
        let signal = Arc::clone(&shutdown);
        let handle = tokio::spawn(scan_loop.run(control_rx, completion_rx, signal, poll));

        Self {
            controls,
            snapshot,
            events,
            shutdown,
            task: Arc::new(Mutex::new(Some(handle))),
        }
    }

    // -- Observation ----------------------------------------------------------

    pub fn snapshot(&self) -> ScannerSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> ScanStatus {
        self.snapshot.borrow().status
    }

    pub fn watch(&self) -> watch::Receiver<ScannerSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    // -- Controls -------------------------------------------------------------
    //
    // Each control resolves once the scanner has applied it and published the
    // resulting snapshot.  `false` means the control was not valid in the
    // current state (or the scanner has stopped).

    /// Open the camera.
    pub async fn start(&self) -> bool {
        self.request(Control::Start).await
    }

    /// Leave `Error` and re-acquire the camera.
    pub async fn retry(&self) -> bool {
        self.request(Control::Retry).await
    }

    pub async fn pause(&self) -> bool {
        self.request(Control::Pause).await
    }

    pub async fn resume(&self) -> bool {
        self.request(Control::Resume).await
    }

    /// Capture immediately, without waiting for the card to settle.
    pub async fn force_scan(&self) -> bool {
        self.request(Control::ForceScan).await
    }

    /// Accept the held duplicate.
    pub async fn force_add_duplicate(&self) -> bool {
        self.request(Control::ForceAddDuplicate).await
    }

    pub async fn dismiss_alert(&self) -> bool {
        self.request(Control::DismissAlert).await
    }

    /// Report whether the sorter is ready to take cards.
    pub async fn set_precondition(&self, met: bool) -> bool {
        self.request(Control::Precondition(met)).await
    }

    /// Report a sorter jam.
    pub async fn hardware_jam(&self, module: Option<u8>) -> bool {
        self.request(Control::Jam(module)).await
    }

    /// Stop the scanner task and release the camera.
    ///
    /// Identification calls already in flight are not cancelled; their
    /// results are discarded when they finish.
    pub async fn shutdown(&self) {
        self.shutdown.notify_one();
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "scanner task ended abnormally");
            }
        }
    }

    async fn request(&self, control: Control) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.controls.send(Request { control, reply }).await.is_err() {
            debug!(?control, "scanner stopped, control ignored");
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

/// State owned by the scanner task.
struct ScanLoop<F, I> {
    session: ScanSession,
    frames: F,
    identifier: Arc<I>,
    detector: CardDetector,
    normalizer: CardNormalizer,
    gate: TickGate,
    snapshot: watch::Sender<ScannerSnapshot>,
    events: broadcast::Sender<ScanEvent>,
    completions: mpsc::Sender<Completion>,
    reported_status: ScanStatus,
    camera_open: bool,
    last_frame: Option<Arc<Frame>>,
}

impl<F, I> ScanLoop<F, I>
where
    F: FrameSource,
    I: IdentificationService,
{
    #[instrument(skip_all, fields(session = %self.session.id()))]
    async fn run(
        mut self,
        mut controls: mpsc::Receiver<Request>,
        mut completions: mpsc::Receiver<Completion>,
        shutdown: Arc<Notify>,
        poll: Duration,
    ) {
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("scanner task started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => {
                    debug!("scanner received shutdown signal");
                    break;
                }

                request = controls.recv() => {
                    let Some(Request { control, reply }) = request else {
                        debug!("all scanner handles dropped");
                        break;
                    };
                    let accepted = self.apply_control(control);
                    self.publish();
                    let _ = reply.send(accepted);
                }

                Some(Completion { ticket, outcome }) = completions.recv() => {
                    if let Some(effect) = self.session.on_identified(ticket, outcome) {
                        self.emit(effect);
                    }
                }

                _ = ticker.tick(), if self.camera_open => {
                    self.tick().await;
                }
            }
            self.publish();
        }

        self.close_camera();
        info!("scanner task stopped");
    }

    fn apply_control(&mut self, control: Control) -> bool {
        debug!(?control, status = %self.session.status(), "control");
        match control {
            Control::Start => self.open_camera(),
            Control::Retry => {
                if !self.session.retry() {
                    return false;
                }
                self.close_camera();
                self.open_camera()
            }
            Control::Pause => self.session.pause(),
            Control::Resume => self.session.resume(),
            Control::ForceScan => self.force_scan(),
            Control::ForceAddDuplicate => match self.session.force_add_duplicate() {
                Some(effect) => {
                    self.emit(effect);
                    true
                }
                None => false,
            },
            Control::DismissAlert => self.session.dismiss_alert(),
            Control::Precondition(met) => {
                self.session.set_precondition(met);
                true
            }
            Control::Jam(module) => {
                let effect = self.session.hardware_jam(module);
                self.emit(effect);
                true
            }
        }
    }

    // -- Camera ---------------------------------------------------------------

    fn open_camera(&mut self) -> bool {
        if !self.session.begin_camera_request() {
            return false;
        }
        self.publish();

        match self.frames.open() {
            Ok(()) => {
                self.camera_open = true;
                self.gate.reset();
                self.session.camera_ready();
            }
            Err(err) => self.session.camera_failed(&err),
        }
        true
    }

    fn close_camera(&mut self) {
        if self.camera_open {
            self.frames.close();
            self.camera_open = false;
            self.last_frame = None;
            debug!("camera released");
        }
    }

    // -- Detection ------------------------------------------------------------

    /// Poll the camera and, if the gate opens, run detection on the blocking
    /// pool.  The loop waits for the result; the runtime worker does not.
    async fn tick(&mut self) {
        if let Some(frame) = self.frames.latest_frame() {
            self.last_frame = Some(Arc::new(frame));
        }
        if !self.session.status().is_active() || !self.gate.try_pass(Instant::now()) {
            return;
        }
        let Some(frame) = self.last_frame.clone() else {
            return;
        };

        let detector = self.detector.clone();
        let input = Arc::clone(&frame);
        let result = match tokio::task::spawn_blocking(move || detector.detect(&input)).await {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "detection task failed, treating tick as a miss");
                DetectionResult::miss()
            }
        };
        if let Some(capture) = self.session.on_detection(result) {
            self.spawn_capture(capture, frame);
        }
    }

    fn force_scan(&mut self) -> bool {
        let Some(frame) = self.last_frame.clone() else {
            warn!("force scan refused: no frame yet");
            return false;
        };
        match self.session.force_scan() {
            Some(capture) => {
                self.spawn_capture(capture, frame);
                true
            }
            None => false,
        }
    }

    /// Normalize on the blocking pool, identify, and report back by ticket.
    fn spawn_capture(&self, capture: Capture, frame: Arc<Frame>) {
        let Capture { ticket, quad, forced } = capture;
        let normalizer = self.normalizer.clone();
        let identifier = Arc::clone(&self.identifier);
        let completions = self.completions.clone();
        debug!(?ticket, forced, whole_frame = quad.is_none(), "capture dispatched");

        tokio::spawn(async move {
            let prepared = tokio::task::spawn_blocking(move || {
                normalizer.prepare_for_identification(&frame.image, quad.as_ref())
            })
            .await;

            let outcome = match prepared {
                Ok(Ok(png)) => identifier.identify(png).await,
                Ok(Err(err)) => Err(err),
                Err(join) => Err(SortwerkError::Vision(format!(
                    "normalization task failed: {join}"
                ))),
            };

            if completions.send(Completion { ticket, outcome }).await.is_err() {
                debug!(?ticket, "scanner stopped before identification finished");
            }
        });
    }

    // -- Publishing -----------------------------------------------------------

    fn emit(&self, effect: Effect) {
        let event = match effect {
            Effect::Accepted(card) => ScanEvent::CardAccepted(card),
            Effect::FailureCue => ScanEvent::FailureCue,
            Effect::Jam(alert) => ScanEvent::JamAlert(alert),
        };
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish(&mut self) {
        let snapshot = self.session.snapshot();
        if snapshot.status != self.reported_status {
            let _ = self.events.send(ScanEvent::StatusChanged {
                from: self.reported_status,
                to: snapshot.status,
            });
            self.reported_status = snapshot.status;
        }
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Clone)]
    struct FakeCamera {
        scene: Arc<Mutex<DynamicImage>>,
        deny: Arc<AtomicBool>,
        closes: Arc<AtomicUsize>,
    }

    impl FakeCamera {
        fn new() -> Self {
            Self {
                scene: Arc::new(Mutex::new(card_scene())),
                deny: Arc::new(AtomicBool::new(false)),
                closes: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn show(&self, image: DynamicImage) {
            *self.scene.lock().expect("scene") = image;
        }
    }

    impl FrameSource for FakeCamera {
        fn open(&mut self) -> Result<()> {
            if self.deny.load(Ordering::SeqCst) {
                Err(SortwerkError::CameraPermissionDenied)
            } else {
                Ok(())
            }
        }

        fn latest_frame(&mut self) -> Option<Frame> {
            Some(Frame::new(self.scene.lock().expect("scene").clone()))
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Identification that answers only when the test says so.
    struct ScriptedIdentifier {
        calls: Arc<AtomicUsize>,
        answers: tokio::sync::Mutex<mpsc::Receiver<Result<Option<CardMatch>>>>,
    }

    impl IdentificationService for ScriptedIdentifier {
        async fn identify(&self, image_png: Vec<u8>) -> Result<Option<CardMatch>> {
            assert_eq!(&image_png[..4], b"\x89PNG");
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.answers.lock().await.recv().await {
                Some(answer) => answer,
                None => Err(SortwerkError::Identification("script ended".into())),
            }
        }
    }

    struct Harness {
        scanner: Scanner,
        camera: FakeCamera,
        calls: Arc<AtomicUsize>,
        answers: mpsc::Sender<Result<Option<CardMatch>>>,
    }

    fn card_scene() -> DynamicImage {
        let mut img = RgbImage::from_pixel(400, 500, Rgb([25, 30, 35]));
        for y in 110..390 {
            for x in 100..300 {
                img.put_pixel(x, y, Rgb([235, 230, 220]));
            }
        }
        DynamicImage::ImageRgb8(img)
    }

    fn empty_scene() -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_pixel(400, 500, Luma([30u8])))
    }

    fn card(id: &str) -> CardMatch {
        CardMatch {
            match_id: id.into(),
            distance: 0.05,
        }
    }

    fn harness() -> Harness {
        let camera = FakeCamera::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (answers, rx) = mpsc::channel(8);
        let identifier = ScriptedIdentifier {
            calls: Arc::clone(&calls),
            answers: tokio::sync::Mutex::new(rx),
        };
        let scanner = Scanner::spawn(&SorterConfig::default(), camera.clone(), identifier);
        Harness {
            scanner,
            camera,
            calls,
            answers,
        }
    }

    async fn running() -> Harness {
        let h = harness();
        assert!(h.scanner.start().await);
        assert!(h.scanner.set_precondition(true).await);
        assert!(h.scanner.resume().await);
        h
    }

    async fn wait_for_status(scanner: &Scanner, status: ScanStatus) {
        let mut watch = scanner.watch();
        tokio::time::timeout(Duration::from_secs(30), watch.wait_for(|s| s.status == status))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {status}"))
            .expect("scanner alive");
    }

    async fn next_accepted(events: &mut broadcast::Receiver<ScanEvent>) -> AcceptedCard {
        loop {
            match events.recv().await.expect("event") {
                ScanEvent::CardAccepted(card) => return card,
                _ => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_opens_camera_and_waits_paused() {
        let h = harness();
        assert_eq!(h.scanner.status(), ScanStatus::Initializing);

        assert!(h.scanner.start().await);
        assert_eq!(h.scanner.status(), ScanStatus::Paused);
        assert!(!h.scanner.start().await);

        // Sorter not ready yet.
        assert!(!h.scanner.resume().await);
        h.scanner.set_precondition(true).await;
        assert!(h.scanner.resume().await);
        assert_eq!(h.scanner.status(), ScanStatus::Scanning);
        h.scanner.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn denied_camera_reports_error_until_retry() {
        let h = harness();
        h.camera.deny.store(true, Ordering::SeqCst);
        h.scanner.start().await;

        let snapshot = h.scanner.snapshot();
        assert_eq!(snapshot.status, ScanStatus::Error);
        assert!(snapshot.error.is_some());

        h.camera.deny.store(false, Ordering::SeqCst);
        assert!(h.scanner.retry().await);
        assert_eq!(h.scanner.status(), ScanStatus::Paused);
        assert_eq!(h.scanner.snapshot().error, None);
        h.scanner.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn settled_card_is_identified_once_then_flagged_duplicate() {
        let h = running().await;
        let mut events = h.scanner.subscribe();

        wait_for_status(&h.scanner, ScanStatus::Searching).await;
        // The card stays put; no second identification starts.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert!(h.scanner.snapshot().capture_in_flight);

        h.answers.send(Ok(Some(card("X")))).await.expect("answer");
        let accepted = next_accepted(&mut events).await;
        assert_eq!(accepted.card.match_id, "X");
        assert!(!accepted.forced);

        // Still in frame, so the next settle finds the same card.
        wait_for_status(&h.scanner, ScanStatus::Searching).await;
        h.answers.send(Ok(Some(card("X")))).await.expect("answer");
        wait_for_status(&h.scanner, ScanStatus::Duplicate).await;
        assert_eq!(h.scanner.snapshot().held_duplicate, Some(card("X")));
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);

        // Lifting the card clears the duplicate.
        h.camera.show(empty_scene());
        wait_for_status(&h.scanner, ScanStatus::Scanning).await;
        assert_eq!(h.scanner.snapshot().held_duplicate, None);
        h.scanner.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn force_scan_on_empty_frame_reports_no_match() {
        let h = running().await;
        h.camera.show(empty_scene());
        let mut events = h.scanner.subscribe();

        // Let at least one frame arrive.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.scanner.force_scan().await);
        assert_eq!(h.scanner.status(), ScanStatus::Searching);

        h.answers.send(Ok(None)).await.expect("answer");
        loop {
            if events.recv().await.expect("event") == ScanEvent::FailureCue {
                break;
            }
        }
        wait_for_status(&h.scanner, ScanStatus::NoMatch).await;
        h.scanner.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn jam_pauses_and_raises_alert() {
        let h = running().await;
        let mut events = h.scanner.subscribe();

        assert!(h.scanner.hardware_jam(Some(1)).await);
        let snapshot = h.scanner.snapshot();
        assert_eq!(snapshot.status, ScanStatus::Paused);
        assert_eq!(snapshot.jam_alert.map(|a| a.module), Some(Some(1)));

        let mut saw_alert = false;
        while let Ok(event) = events.try_recv() {
            saw_alert |= matches!(event, ScanEvent::JamAlert(_));
        }
        assert!(saw_alert);

        assert!(h.scanner.dismiss_alert().await);
        assert_eq!(h.scanner.snapshot().jam_alert, None);
        assert_eq!(h.scanner.status(), ScanStatus::Paused);
        h.scanner.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn losing_sorter_pauses_and_reconnect_resumes() {
        let h = running().await;
        h.scanner.set_precondition(false).await;
        assert_eq!(h.scanner.status(), ScanStatus::Paused);
        h.scanner.set_precondition(true).await;
        assert_eq!(h.scanner.status(), ScanStatus::Scanning);
        h.scanner.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_camera_and_ignores_late_results() {
        let h = running().await;
        wait_for_status(&h.scanner, ScanStatus::Searching).await;

        h.scanner.shutdown().await;
        assert_eq!(h.camera.closes.load(Ordering::SeqCst), 1);

        // The identification call is still pending and completes afterwards.
        h.answers.send(Ok(Some(card("late")))).await.expect("answer");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.scanner.status(), ScanStatus::Searching);
        assert!(!h.scanner.pause().await);
    }
}
