// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Scan session state machine.
//
// `ScanSession` is plain data plus transition methods.  It never performs
// I/O: transitions that need work done (a capture, an emitted card, a cue)
// return it to the caller, which owns the camera and the identification
// service.  One session exists per running scanner.

use chrono::{DateTime, Utc};
use sortwerk_core::error::SortwerkError;
use sortwerk_core::human_errors::humanize_error;
use sortwerk_core::types::{CardMatch, DetectionResult, Quadrilateral, ScanStatus, SessionId};
use tracing::{debug, info, warn};

use crate::stability::StabilityTracker;

/// Identifies one capture.  A completion is applied only if its ticket is
/// the one the session is still waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaptureTicket(u64);

/// Work the caller must start: normalize the current frame and identify it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Capture {
    pub ticket: CaptureTicket,
    /// Card outline to warp; `None` means use the whole frame.
    pub quad: Option<Quadrilateral>,
    /// Started by Force-Scan rather than by stability.
    pub forced: bool,
}

/// A card handed on for sorting.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedCard {
    pub card: CardMatch,
    /// Accepted through a manual override.
    pub forced: bool,
    pub session: SessionId,
    pub accepted_at: DateTime<Utc>,
}

/// Raised when the sorter reports a jam.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JamAlert {
    pub module: Option<u8>,
    pub raised_at: DateTime<Utc>,
}

/// Side effects of a transition, for the caller to publish.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Accepted(AcceptedCard),
    /// Identification found nothing; play the failure sound.
    FailureCue,
    Jam(JamAlert),
}

/// Everything an observer can see about the scanner at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannerSnapshot {
    pub session: SessionId,
    pub status: ScanStatus,
    pub error: Option<String>,
    pub stable: bool,
    pub held_duplicate: Option<CardMatch>,
    pub jam_alert: Option<JamAlert>,
    pub last_detection: DetectionResult,
    pub capture_in_flight: bool,
    pub precondition_met: bool,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    ticket: CaptureTicket,
    forced: bool,
}

/// Per-scanner mutable state.
#[derive(Debug)]
pub struct ScanSession {
    id: SessionId,
    status: ScanStatus,
    error: Option<String>,
    stability: StabilityTracker,
    last_detection: DetectionResult,
    /// Outline from the most recent positive detection.
    last_quad: Option<Quadrilateral>,
    last_accepted: Option<String>,
    in_flight: Option<InFlight>,
    next_ticket: u64,
    /// Set once a result was produced for the card in frame; cleared when a
    /// detection tick sees no card.
    needs_removal: bool,
    held_duplicate: Option<CardMatch>,
    /// Sorter connected and a catch-all bin configured.
    precondition_met: bool,
    /// The precondition was lost while scanning; resume when it returns.
    resume_on_restore: bool,
    jam_alert: Option<JamAlert>,
}

impl Default for ScanSession {
    fn default() -> Self {
        Self::new(StabilityTracker::default())
    }
}

impl ScanSession {
    pub fn new(stability: StabilityTracker) -> Self {
        Self {
            id: SessionId::new(),
            status: ScanStatus::Initializing,
            error: None,
            stability,
            last_detection: DetectionResult::miss(),
            last_quad: None,
            last_accepted: None,
            in_flight: None,
            next_ticket: 1,
            needs_removal: false,
            held_duplicate: None,
            precondition_met: false,
            resume_on_restore: false,
            jam_alert: None,
        }
    }

    // -- Accessors ------------------------------------------------------------

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn status(&self) -> ScanStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_stable(&self) -> bool {
        self.stability.is_stable()
    }

    pub fn capture_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn needs_removal(&self) -> bool {
        self.needs_removal
    }

    pub fn held_duplicate(&self) -> Option<&CardMatch> {
        self.held_duplicate.as_ref()
    }

    pub fn last_accepted(&self) -> Option<&str> {
        self.last_accepted.as_deref()
    }

    pub fn jam_alert(&self) -> Option<&JamAlert> {
        self.jam_alert.as_ref()
    }

    pub fn snapshot(&self) -> ScannerSnapshot {
        ScannerSnapshot {
            session: self.id,
            status: self.status,
            error: self.error.clone(),
            stable: self.stability.is_stable(),
            held_duplicate: self.held_duplicate.clone(),
            jam_alert: self.jam_alert,
            last_detection: self.last_detection,
            capture_in_flight: self.in_flight.is_some(),
            precondition_met: self.precondition_met,
        }
    }

    // -- Camera lifecycle -----------------------------------------------------

    /// `Initializing -> RequestingCamera`.
    pub fn begin_camera_request(&mut self) -> bool {
        if self.status != ScanStatus::Initializing {
            return false;
        }
        self.set_status(ScanStatus::RequestingCamera);
        true
    }

    /// The camera opened.  Detection starts paused.
    pub fn camera_ready(&mut self) {
        if self.status == ScanStatus::RequestingCamera {
            self.set_status(ScanStatus::Paused);
        }
    }

    pub fn camera_failed(&mut self, err: &SortwerkError) {
        warn!(error = %err, "camera acquisition failed");
        self.error = Some(humanize_error(err).message);
        self.in_flight = None;
        self.set_status(ScanStatus::Error);
    }

    /// `Error -> Initializing`.  The caller re-acquires the camera next.
    pub fn retry(&mut self) -> bool {
        if self.status != ScanStatus::Error {
            return false;
        }
        self.error = None;
        self.clear_card_state();
        self.set_status(ScanStatus::Initializing);
        true
    }

    // -- Detection --------------------------------------------------------------

    /// Apply one gated detection tick.  Returns a capture to start once the
    /// card has settled.
    pub fn on_detection(&mut self, result: DetectionResult) -> Option<Capture> {
        if !self.status.is_active() {
            return None;
        }
        self.last_detection = result;
        let stable = self.stability.observe(result.detected());

        let Some(quad) = result.quad() else {
            self.last_quad = None;
            if self.needs_removal {
                self.needs_removal = false;
                debug!("card removed from frame");
                if matches!(self.status, ScanStatus::Duplicate | ScanStatus::NoMatch) {
                    self.held_duplicate = None;
                    self.set_status(ScanStatus::Scanning);
                }
            }
            return None;
        };
        self.last_quad = Some(*quad);

        if self.status == ScanStatus::Scanning && stable && self.in_flight.is_none() {
            return Some(self.start_capture(false));
        }
        None
    }

    fn start_capture(&mut self, forced: bool) -> Capture {
        let ticket = CaptureTicket(self.next_ticket);
        self.next_ticket += 1;
        self.in_flight = Some(InFlight { ticket, forced });
        self.stability.reset();
        self.set_status(ScanStatus::Searching);
        debug!(ticket = ticket.0, forced, "capture started");
        Capture {
            ticket,
            quad: self.last_quad,
            forced,
        }
    }

    /// Apply the outcome of a capture.  Outcomes for abandoned captures are
    /// dropped.
    pub fn on_identified(
        &mut self,
        ticket: CaptureTicket,
        outcome: sortwerk_core::error::Result<Option<CardMatch>>,
    ) -> Option<Effect> {
        let Some(flight) = self.in_flight.filter(|f| f.ticket == ticket) else {
            warn!(ticket = ticket.0, "dropping result of an abandoned capture");
            return None;
        };
        self.in_flight = None;

        match outcome {
            Ok(Some(card)) => {
                let repeat = self.last_accepted.as_deref() == Some(card.match_id.as_str());
                if repeat && self.needs_removal && !flight.forced {
                    info!(match_id = %card.match_id, "card already accepted");
                    self.held_duplicate = Some(card);
                    self.set_status(ScanStatus::Duplicate);
                    return None;
                }
                self.needs_removal = true;
                self.set_status(ScanStatus::Scanning);
                Some(Effect::Accepted(self.accept(card, flight.forced)))
            }
            Ok(None) => {
                info!("no catalog match");
                self.needs_removal = true;
                self.set_status(ScanStatus::NoMatch);
                Some(Effect::FailureCue)
            }
            Err(err) => {
                warn!(error = %err, "identification failed");
                self.error = Some(humanize_error(&err).message);
                self.set_status(ScanStatus::Error);
                None
            }
        }
    }

    fn accept(&mut self, card: CardMatch, forced: bool) -> AcceptedCard {
        info!(match_id = %card.match_id, distance = card.distance, forced, "card accepted");
        self.last_accepted = Some(card.match_id.clone());
        AcceptedCard {
            card,
            forced,
            session: self.id,
            accepted_at: Utc::now(),
        }
    }

    // -- Manual overrides -------------------------------------------------------

    /// Capture now, ignoring stability.  Allowed from Scanning, NoMatch and
    /// Duplicate.
    pub fn force_scan(&mut self) -> Option<Capture> {
        let allowed = matches!(
            self.status,
            ScanStatus::Scanning | ScanStatus::NoMatch | ScanStatus::Duplicate
        );
        if !allowed || self.in_flight.is_some() {
            debug!(status = %self.status, "force scan refused");
            return None;
        }
        self.held_duplicate = None;
        Some(self.start_capture(true))
    }

    /// Accept the held duplicate anyway.
    pub fn force_add_duplicate(&mut self) -> Option<Effect> {
        if self.status != ScanStatus::Duplicate {
            return None;
        }
        let card = self.held_duplicate.take()?;
        self.set_status(ScanStatus::Scanning);
        Some(Effect::Accepted(self.accept(card, true)))
    }

    pub fn pause(&mut self) -> bool {
        if !self.status.is_active() {
            return false;
        }
        self.resume_on_restore = false;
        self.suspend();
        true
    }

    /// `Paused -> Scanning`.  Refused while the precondition is unmet.
    /// Resuming acknowledges any jam alert.
    pub fn resume(&mut self) -> bool {
        if self.status != ScanStatus::Paused {
            return false;
        }
        if !self.precondition_met {
            warn!("resume refused: sorter not ready");
            return false;
        }
        self.jam_alert = None;
        self.resume_on_restore = false;
        self.stability.reset();
        self.set_status(ScanStatus::Scanning);
        true
    }

    pub fn dismiss_alert(&mut self) -> bool {
        self.jam_alert.take().is_some()
    }

    // -- Hardware -----------------------------------------------------------------

    pub fn precondition_met(&self) -> bool {
        self.precondition_met
    }

    /// Track the sorter precondition, pausing when it is lost and resuming
    /// when it returns if scanning was interrupted by the loss.
    pub fn set_precondition(&mut self, met: bool) {
        if self.precondition_met == met {
            return;
        }
        self.precondition_met = met;

        if !met {
            if self.status.is_active() {
                info!("sorter not ready, pausing");
                self.suspend();
                self.resume_on_restore = true;
            }
            return;
        }

        let resume = std::mem::take(&mut self.resume_on_restore);
        if resume && self.status == ScanStatus::Paused && self.jam_alert.is_none() {
            info!("sorter ready again, resuming");
            self.stability.reset();
            self.set_status(ScanStatus::Scanning);
        }
    }

    /// The sorter reported a jam: stop and alert until the operator resumes.
    pub fn hardware_jam(&mut self, module: Option<u8>) -> Effect {
        warn!(?module, "sorter jam");
        if self.status.is_active() {
            self.suspend();
        }
        self.resume_on_restore = false;
        let alert = JamAlert {
            module,
            raised_at: Utc::now(),
        };
        self.jam_alert = Some(alert);
        Effect::Jam(alert)
    }

    // -- Internals ------------------------------------------------------------------

    fn suspend(&mut self) {
        self.clear_card_state();
        self.set_status(ScanStatus::Paused);
    }

    fn clear_card_state(&mut self) {
        self.stability.reset();
        self.held_duplicate = None;
        self.needs_removal = false;
        if let Some(flight) = self.in_flight.take() {
            debug!(ticket = flight.ticket.0, "capture abandoned");
        }
    }

    fn set_status(&mut self, next: ScanStatus) {
        if self.status != next {
            info!(from = %self.status, to = %next, "scanner status");
            self.status = next;
        }
    }
}
