//! Layer records shared by the crossfade manager and the ramp scheduler
//!
//! One record per configured layer. All mutation goes through [`LayerTable`],
//! whose lock is only held for short synchronous updates, never across an
//! await point.

use crate::config::LayerSettings;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Crossfade lifecycle of a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossfadeState {
    /// No transaction
    Idle,
    /// Waiting for the target resource
    Preloading,
    /// Gains of outgoing and incoming sources are moving
    Fading,
    /// Outgoing source being released and the new track committed
    Settling,
}

impl CrossfadeState {
    /// True while the crossfade is writing the layer's gain
    pub fn owns_gain(&self) -> bool {
        matches!(self, CrossfadeState::Fading | CrossfadeState::Settling)
    }
}

impl std::fmt::Display for CrossfadeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrossfadeState::Idle => write!(f, "Idle"),
            CrossfadeState::Preloading => write!(f, "Preloading"),
            CrossfadeState::Fading => write!(f, "Fading"),
            CrossfadeState::Settling => write!(f, "Settling"),
        }
    }
}

/// In-flight crossfade transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossfadeTransaction {
    /// Sequence number, unique per layer
    pub id: u64,
    pub layer_id: String,
    pub from_track: Option<String>,
    pub to_track: String,
    pub start_time: DateTime<Utc>,
    pub duration_ms: u64,
    /// 0.0-1.0 through the fade
    pub progress: f32,
    pub status: CrossfadeState,
}

/// Committed state of one layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub id: String,
    pub current_track_id: Option<String>,
    pub current_volume: f32,
    pub crossfade_state: CrossfadeState,
    /// True while a volume ramp owns this layer
    pub ramping: bool,
    pub transaction: Option<CrossfadeTransaction>,
}

impl LayerRecord {
    fn from_settings(settings: &LayerSettings) -> Self {
        Self {
            id: settings.id.clone(),
            current_track_id: settings.track.clone(),
            current_volume: settings.volume,
            crossfade_state: CrossfadeState::Idle,
            ramping: false,
            transaction: None,
        }
    }
}

struct LayerSlot {
    record: LayerRecord,
    /// Bumped to pre-empt the running ramp
    ramp_generation: u64,
    next_transaction_id: u64,
    /// Cancels this layer's transaction and ramp; replaced after use
    cancel: CancellationToken,
}

/// Thread-safe table of layer records
pub struct LayerTable {
    /// Configured order
    order: Vec<String>,
    slots: Mutex<HashMap<String, LayerSlot>>,
}

impl LayerTable {
    pub fn new(layers: &[LayerSettings]) -> Self {
        let order = layers.iter().map(|l| l.id.clone()).collect();
        let slots = layers
            .iter()
            .map(|l| {
                (
                    l.id.clone(),
                    LayerSlot {
                        record: LayerRecord::from_settings(l),
                        ramp_generation: 0,
                        next_transaction_id: 1,
                        cancel: CancellationToken::new(),
                    },
                )
            })
            .collect();

        Self {
            order,
            slots: Mutex::new(slots),
        }
    }

    fn with_slot<T>(&self, layer_id: &str, f: impl FnOnce(&mut LayerSlot) -> T) -> Result<T> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = slots
            .get_mut(layer_id)
            .ok_or_else(|| Error::UnknownLayer(layer_id.to_string()))?;
        Ok(f(slot))
    }

    /// Configured layer ids, in order
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    pub fn contains(&self, layer_id: &str) -> bool {
        self.order.iter().any(|id| id == layer_id)
    }

    pub fn get(&self, layer_id: &str) -> Result<LayerRecord> {
        self.with_slot(layer_id, |slot| slot.record.clone())
    }

    /// All records, in configured order
    pub fn snapshot(&self) -> Vec<LayerRecord> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        self.order
            .iter()
            .filter_map(|id| slots.get(id).map(|s| s.record.clone()))
            .collect()
    }

    pub fn crossfade_state(&self, layer_id: &str) -> Result<CrossfadeState> {
        self.with_slot(layer_id, |slot| slot.record.crossfade_state)
    }

    /// Open a transaction on an Idle layer
    ///
    /// Fails fast with `ConcurrentTransitionConflict` if the layer already
    /// has one in flight. On success the layer is `Preloading`.
    pub fn begin_transaction(
        &self,
        layer_id: &str,
        to_track: &str,
        duration_ms: u64,
    ) -> Result<CrossfadeTransaction> {
        self.with_slot(layer_id, |slot| {
            if slot.record.crossfade_state != CrossfadeState::Idle {
                return Err(Error::ConcurrentTransitionConflict(layer_id.to_string()));
            }
            let id = slot.next_transaction_id;
            slot.next_transaction_id += 1;
            let transaction = CrossfadeTransaction {
                id,
                layer_id: layer_id.to_string(),
                from_track: slot.record.current_track_id.clone(),
                to_track: to_track.to_string(),
                start_time: Utc::now(),
                duration_ms,
                progress: 0.0,
                status: CrossfadeState::Preloading,
            };
            slot.record.crossfade_state = CrossfadeState::Preloading;
            slot.record.transaction = Some(transaction.clone());
            Ok(transaction)
        })?
    }

    /// Advance the state of transaction `transaction_id`
    ///
    /// Returns false (and changes nothing) if that transaction was cancelled
    /// or superseded.
    pub fn set_crossfade_state(
        &self,
        layer_id: &str,
        transaction_id: u64,
        state: CrossfadeState,
    ) -> Result<bool> {
        self.with_slot(layer_id, |slot| match slot.record.transaction.as_mut() {
            Some(tx) if tx.id == transaction_id => {
                tx.status = state;
                slot.record.crossfade_state = state;
                true
            }
            _ => false,
        })
    }

    pub fn set_transaction_progress(
        &self,
        layer_id: &str,
        transaction_id: u64,
        progress: f32,
    ) -> Result<()> {
        self.with_slot(layer_id, |slot| {
            if let Some(tx) = slot.record.transaction.as_mut() {
                if tx.id == transaction_id {
                    tx.progress = progress.clamp(0.0, 1.0);
                }
            }
        })
    }

    /// Close transaction `transaction_id` and return the layer to Idle
    ///
    /// `committed` carries the track and gain now audible on the layer; None
    /// leaves the committed state untouched. A transaction that was cancelled
    /// still commits what it already swapped, but never touches a newer
    /// transaction on the same layer.
    pub fn finish_transaction(
        &self,
        layer_id: &str,
        transaction_id: u64,
        committed: Option<(&str, f32)>,
    ) -> Result<()> {
        self.with_slot(layer_id, |slot| {
            let owns = match &slot.record.transaction {
                Some(tx) => tx.id == transaction_id,
                None => slot.next_transaction_id == transaction_id + 1,
            };
            if !owns {
                return;
            }
            if let Some((track, volume)) = committed {
                slot.record.current_track_id = Some(track.to_string());
                slot.record.current_volume = volume.clamp(0.0, 1.0);
            }
            slot.record.crossfade_state = CrossfadeState::Idle;
            slot.record.transaction = None;
        })
    }

    /// True if no transaction was opened on the layer after `transaction_id`
    pub fn is_latest_transaction(&self, layer_id: &str, transaction_id: u64) -> bool {
        self.with_slot(layer_id, |slot| slot.next_transaction_id == transaction_id + 1)
            .unwrap_or(false)
    }

    pub fn commit_volume(&self, layer_id: &str, volume: f32) -> Result<()> {
        self.with_slot(layer_id, |slot| {
            slot.record.current_volume = volume.clamp(0.0, 1.0);
        })
    }

    /// Claim the layer for a new ramp, pre-empting any running one
    ///
    /// Returns the generation the ramp must hold to keep writing.
    pub fn begin_ramp(&self, layer_id: &str) -> Result<u64> {
        self.with_slot(layer_id, |slot| {
            slot.ramp_generation += 1;
            slot.record.ramping = true;
            slot.ramp_generation
        })
    }

    /// True while `generation` still owns the layer's ramp
    pub fn ramp_is_current(&self, layer_id: &str, generation: u64) -> bool {
        self.with_slot(layer_id, |slot| {
            slot.record.ramping && slot.ramp_generation == generation
        })
        .unwrap_or(false)
    }

    /// Release the ramp claim if `generation` still holds it
    pub fn end_ramp(&self, layer_id: &str, generation: u64) {
        let _ = self.with_slot(layer_id, |slot| {
            if slot.ramp_generation == generation {
                slot.record.ramping = false;
            }
        });
    }

    /// Pre-empt whatever ramp is running on the layer
    pub fn preempt_ramp(&self, layer_id: &str) -> Result<()> {
        self.with_slot(layer_id, |slot| {
            slot.ramp_generation += 1;
            slot.record.ramping = false;
        })
    }

    /// Token cancelled by `cancel_layer` / `cancel_all`
    pub fn cancel_token(&self, layer_id: &str) -> Result<CancellationToken> {
        self.with_slot(layer_id, |slot| slot.cancel.clone())
    }

    /// Cancel one layer's transaction and ramp
    ///
    /// The layer is Idle on return; the cancelled futures observe their
    /// token and resolve as failures.
    pub fn cancel_layer(&self, layer_id: &str) -> Result<()> {
        self.with_slot(layer_id, Self::cancel_slot)
    }

    /// Cancel every layer
    pub fn cancel_all(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        for slot in slots.values_mut() {
            Self::cancel_slot(slot);
        }
    }

    fn cancel_slot(slot: &mut LayerSlot) {
        slot.cancel.cancel();
        slot.cancel = CancellationToken::new();
        slot.ramp_generation += 1;
        slot.record.ramping = false;
        slot.record.crossfade_state = CrossfadeState::Idle;
        slot.record.transaction = None;
    }

    /// Layers with a transaction currently Fading
    pub fn fading_layers(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter(|r| r.crossfade_state == CrossfadeState::Fading)
            .map(|r| r.id)
            .collect()
    }

    /// True when every layer is Idle and not ramping
    pub fn all_settled(&self) -> bool {
        self.snapshot()
            .iter()
            .all(|r| r.crossfade_state == CrossfadeState::Idle && !r.ramping)
    }
}
