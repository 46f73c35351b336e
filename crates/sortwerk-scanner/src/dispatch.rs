// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Sorter dispatch.  Routes accepted cards to bins over the hardware link,
// turns jam notifications into scanner alerts, keeps the scanner's
// precondition in step with the link, and replays calibration on connect.

use std::sync::Arc;

use sortwerk_core::error::{Result, SortwerkError};
use sortwerk_core::types::{BinConfig, CardMatch};
use sortwerk_hardware::calibration::ReplayReport;
use sortwerk_hardware::{Command, DeviceMessage, HardwareLink, LinkEvent, replay_calibration};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, instrument, warn};

use crate::scanner::{ScanEvent, Scanner};
use crate::services::{CalibrationStore, RoutingPolicy};

/// What happened to one accepted card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Routed { bin: u8 },
    /// The routing policy chose no bin; nothing was sent.
    Unrouted,
    Rejected { bin: u8, error: Option<String> },
    NoResponse { bin: u8 },
    Jammed { module: Option<u8> },
}

pub struct Sorter<P> {
    link: HardwareLink,
    policy: P,
    bins: Vec<BinConfig>,
    calibration: Option<Arc<dyn CalibrationStore>>,
}

impl<P: RoutingPolicy> Sorter<P> {
    pub fn new(link: HardwareLink, policy: P, bins: Vec<BinConfig>) -> Self {
        Self {
            link,
            policy,
            bins,
            calibration: None,
        }
    }

    /// Replay calibration from `store` whenever the sorter connects.
    pub fn with_calibration(mut self, store: impl CalibrationStore) -> Self {
        self.calibration = Some(Arc::new(store));
        self
    }

    pub fn link(&self) -> &HardwareLink {
        &self.link
    }

    pub fn has_catch_all(&self) -> bool {
        self.bins.iter().any(|b| b.is_catch_all)
    }

    /// The scanner may run only while the sorter is connected and every card
    /// has somewhere to go.
    pub fn precondition_met(&self) -> bool {
        self.link.is_connected() && self.has_catch_all()
    }

    /// Route `card` and tell the sorter which bin to drop it in.
    #[instrument(skip(self, card), fields(match_id = %card.match_id))]
    pub async fn dispatch(&self, card: &CardMatch) -> Result<DispatchOutcome> {
        let Some(assignment) = self.policy.route(card, &self.bins) else {
            warn!("no bin for card");
            return Ok(DispatchOutcome::Unrouted);
        };
        let bin = assignment.bin_number;

        let outcome = match self.link.send(&Command::bin(bin)).await? {
            Some(DeviceMessage::Ack { ok: true, .. }) => DispatchOutcome::Routed { bin },
            Some(DeviceMessage::Ack { ok: false, error }) => DispatchOutcome::Rejected { bin, error },
            // Positional matching hands a jam notice to the pending command.
            Some(DeviceMessage::Jam { module }) => DispatchOutcome::Jammed { module },
            Some(other) => {
                return Err(SortwerkError::Protocol(format!(
                    "unexpected reply to bin command: {other:?}"
                )));
            }
            None => DispatchOutcome::NoResponse { bin },
        };
        info!(bin, catch_all = assignment.is_catch_all, ?outcome, "card dispatched");
        Ok(outcome)
    }

    /// Push stored calibration to the sorter.  Without a store this is a
    /// no-op.
    pub async fn replay_calibration(&self) -> Result<Vec<ReplayReport>> {
        let Some(store) = &self.calibration else {
            return Ok(Vec::new());
        };
        let calibrations = store.load_all()?;
        replay_calibration(&self.link, &calibrations).await
    }

    /// Serve `scanner` until it stops.
    pub async fn run(self, scanner: Scanner) {
        let mut scan_events = scanner.subscribe();
        let mut link_events = self.link.subscribe();
        let mut connected = self.link.watch_connected();
        let mut alive = scanner.watch();

        scanner.set_precondition(self.precondition_met()).await;
        if self.link.is_connected() {
            self.replay_logged().await;
        }
        info!(bins = self.bins.len(), "sorter dispatch running");

        loop {
            tokio::select! {
                event = scan_events.recv() => match event {
                    Ok(ScanEvent::CardAccepted(accepted)) => {
                        match self.dispatch(&accepted.card).await {
                            Ok(DispatchOutcome::Jammed { module }) => {
                                scanner.hardware_jam(module).await;
                            }
                            Ok(_) => {}
                            Err(err) => warn!(error = %err, "dispatch failed"),
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => warn!(missed, "scanner events dropped"),
                    Err(RecvError::Closed) => break,
                },

                event = link_events.recv() => match event {
                    Ok(LinkEvent::Unsolicited(line)) => match DeviceMessage::parse(&line) {
                        Ok(DeviceMessage::Jam { module }) => {
                            scanner.hardware_jam(module).await;
                        }
                        Ok(DeviceMessage::Ready) => info!("sorter ready"),
                        Ok(message) => debug!(?message, "sorter message"),
                        Err(err) => warn!(error = %err, "unreadable sorter message"),
                    },
                    Ok(LinkEvent::Connected) => self.replay_logged().await,
                    Ok(LinkEvent::Disconnected { reason }) => warn!(%reason, "sorter disconnected"),
                    Err(RecvError::Lagged(missed)) => warn!(missed, "link events dropped"),
                    Err(RecvError::Closed) => break,
                },

                changed = connected.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    scanner.set_precondition(self.precondition_met()).await;
                }

                changed = alive.changed() => {
                    if changed.is_err() {
                        debug!("scanner stopped");
                        break;
                    }
                }
            }
        }
        info!("sorter dispatch stopped");
    }

    async fn replay_logged(&self) {
        match self.replay_calibration().await {
            Ok(reports) if reports.iter().all(|r| r.is_acknowledged()) => {}
            Ok(reports) => {
                let failed = reports.iter().filter(|r| !r.is_acknowledged()).count();
                warn!(failed, "some modules kept their old calibration");
            }
            Err(err) => warn!(error = %err, "calibration replay failed"),
        }
    }
}
