//! Phase registry
//!
//! Ordered list of phase markers along session progress. Phases are
//! authored elsewhere and handed over as a batch through
//! [`PhaseRegistry::update_phases`]; the registry validates them, keeps them
//! sorted by position, and answers "which phase is active at this progress".
//!
//! Equal positions: the phase later in the submitted list wins, except that
//! the locked entry phase always owns position 0.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Snapshot of desired layer state for a phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapturedState {
    /// Layer id -> gain (0.0-1.0)
    #[serde(default)]
    pub volumes: BTreeMap<String, f32>,

    /// Layer id -> track id
    #[serde(default)]
    pub active_track: BTreeMap<String, String>,
}

impl CapturedState {
    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty() && self.active_track.is_empty()
    }
}

/// Named point along session progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Percent of session duration (0-100)
    pub position: f64,

    /// Opaque display tag
    #[serde(default)]
    pub color: String,

    #[serde(default)]
    pub locked: bool,

    #[serde(default)]
    pub captured_state: Option<CapturedState>,
}

impl Phase {
    pub fn new(id: &str, name: &str, position: f64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            position,
            color: String::new(),
            locked: false,
            captured_state: None,
        }
    }

    /// The locked entry phase at position 0
    pub fn entry(id: &str, name: &str) -> Self {
        Self {
            locked: true,
            ..Self::new(id, name, 0.0)
        }
    }

    pub fn with_state(mut self, state: CapturedState) -> Self {
        self.captured_state = Some(state);
        self
    }

    pub fn with_color(mut self, color: &str) -> Self {
        self.color = color.to_string();
        self
    }

    /// Label-only phases carry no layer changes
    pub fn is_label_only(&self) -> bool {
        self.captured_state.is_none()
    }
}

/// Validated, position-sorted phase list
#[derive(Debug, Clone, Default)]
pub struct PhaseRegistry {
    /// Ascending by (position, locked); submission order among ties
    phases: Vec<Phase>,
}

impl PhaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the phase list
    ///
    /// On any validation failure the previous list is kept and
    /// `InvalidPhaseData` is returned.
    pub fn update_phases(&mut self, phases: Vec<Phase>) -> Result<()> {
        validate_phases(&phases)?;

        let mut sorted = phases;
        // Stable: equal positions keep submission order, so a descending scan
        // meets the later-submitted phase first. The locked phase sorts after
        // other position-0 phases and therefore always wins position 0.
        sorted.sort_by(|a, b| {
            a.position
                .total_cmp(&b.position)
                .then(a.locked.cmp(&b.locked))
        });
        self.phases = sorted;
        Ok(())
    }

    /// Phase with the greatest `position <= pct`
    ///
    /// Falls back to the locked entry phase; None only while empty.
    pub fn phase_for_progress(&self, pct: f64) -> Option<&Phase> {
        let pct = if pct.is_nan() { 0.0 } else { pct };
        self.phases
            .iter()
            .rev()
            .find(|p| p.position <= pct)
            .or_else(|| self.locked_phase())
    }

    pub fn locked_phase(&self) -> Option<&Phase> {
        self.phases.iter().find(|p| p.locked)
    }

    pub fn get(&self, phase_id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == phase_id)
    }

    /// Phases in ascending position order
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Replace (or clear) one phase's captured state
    pub fn set_captured_state(
        &mut self,
        phase_id: &str,
        state: Option<CapturedState>,
    ) -> Result<()> {
        if let Some(state) = &state {
            validate_captured_state(phase_id, state)?;
        }
        let phase = self
            .phases
            .iter_mut()
            .find(|p| p.id == phase_id)
            .ok_or_else(|| Error::UnknownPhase(phase_id.to_string()))?;
        phase.captured_state = state;
        Ok(())
    }

    /// Next phase position strictly after `pct`, for display
    pub fn next_boundary_after(&self, pct: f64) -> Option<&Phase> {
        self.phases.iter().find(|p| p.position > pct)
    }
}

fn validate_phases(phases: &[Phase]) -> Result<()> {
    if phases.is_empty() {
        return Err(Error::InvalidPhaseData("Phase list is empty".to_string()));
    }

    let mut ids = HashSet::new();
    let mut locked = Vec::new();

    for phase in phases {
        if phase.id.trim().is_empty() {
            return Err(Error::InvalidPhaseData("Phase id must not be empty".to_string()));
        }
        if !ids.insert(phase.id.as_str()) {
            return Err(Error::InvalidPhaseData(format!("Duplicate phase id: {}", phase.id)));
        }
        if !phase.position.is_finite() || !(0.0..=100.0).contains(&phase.position) {
            return Err(Error::InvalidPhaseData(format!(
                "Phase {} position {} outside 0-100",
                phase.id, phase.position
            )));
        }
        if phase.locked {
            locked.push(phase);
        }
        if let Some(state) = &phase.captured_state {
            validate_captured_state(&phase.id, state)?;
        }
    }

    match locked.as_slice() {
        [entry] if entry.position == 0.0 => Ok(()),
        [entry] => Err(Error::InvalidPhaseData(format!(
            "Locked phase {} must stay at position 0, got {}",
            entry.id, entry.position
        ))),
        [] => Err(Error::InvalidPhaseData("No locked entry phase".to_string())),
        many => Err(Error::InvalidPhaseData(format!(
            "Exactly one locked phase allowed, got {}",
            many.len()
        ))),
    }
}

fn validate_captured_state(phase_id: &str, state: &CapturedState) -> Result<()> {
    for (layer, volume) in &state.volumes {
        if !volume.is_finite() || !(0.0..=1.0).contains(volume) {
            return Err(Error::InvalidPhaseData(format!(
                "Phase {} volume {} for layer {} outside 0.0-1.0",
                phase_id, volume, layer
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(phases: Vec<Phase>) -> PhaseRegistry {
        let mut registry = PhaseRegistry::new();
        registry.update_phases(phases).unwrap();
        registry
    }

    fn ids(registry: &PhaseRegistry) -> Vec<&str> {
        registry.phases().iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn test_sorted_ascending() {
        let r = registry(vec![
            Phase::new("c", "Cool down", 80.0),
            Phase::entry("a", "Settle"),
            Phase::new("b", "Deepen", 40.0),
        ]);
        assert_eq!(ids(&r), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_lookup_greatest_position_not_above() {
        let r = registry(vec![
            Phase::entry("a", "Settle"),
            Phase::new("b", "Deepen", 40.0),
            Phase::new("c", "Cool down", 80.0),
        ]);
        assert_eq!(r.phase_for_progress(0.0).unwrap().id, "a");
        assert_eq!(r.phase_for_progress(39.999).unwrap().id, "a");
        assert_eq!(r.phase_for_progress(40.0).unwrap().id, "b");
        assert_eq!(r.phase_for_progress(79.0).unwrap().id, "b");
        assert_eq!(r.phase_for_progress(99.9).unwrap().id, "c");
        assert_eq!(r.phase_for_progress(100.0).unwrap().id, "c");
    }

    #[test]
    fn test_negative_progress_falls_back_to_locked() {
        let r = registry(vec![Phase::entry("a", "Settle"), Phase::new("b", "B", 10.0)]);
        assert_eq!(r.phase_for_progress(-5.0).unwrap().id, "a");
        assert_eq!(r.phase_for_progress(f64::NAN).unwrap().id, "a");
    }

    #[test]
    fn test_tie_later_submission_wins() {
        let r = registry(vec![
            Phase::entry("a", "Settle"),
            Phase::new("first", "First", 50.0),
            Phase::new("second", "Second", 50.0),
        ]);
        assert_eq!(r.phase_for_progress(50.0).unwrap().id, "second");
        assert_eq!(r.phase_for_progress(75.0).unwrap().id, "second");
    }

    #[test]
    fn test_locked_phase_owns_position_zero() {
        let r = registry(vec![
            Phase::entry("entry", "Entry"),
            Phase::new("also_zero", "Also zero", 0.0),
        ]);
        assert_eq!(r.phase_for_progress(0.0).unwrap().id, "entry");

        // Even when the locked phase is submitted first and the other last
        let r = registry(vec![
            Phase::new("also_zero", "Also zero", 0.0),
            Phase::entry("entry", "Entry"),
        ]);
        assert_eq!(r.phase_for_progress(0.0).unwrap().id, "entry");
    }

    #[test]
    fn test_duplicate_ids_rejected_and_previous_kept() {
        let mut r = registry(vec![Phase::entry("a", "Settle"), Phase::new("b", "B", 50.0)]);
        let result = r.update_phases(vec![
            Phase::entry("x", "X"),
            Phase::new("y", "Y", 10.0),
            Phase::new("y", "Y again", 20.0),
        ]);
        assert!(matches!(result, Err(Error::InvalidPhaseData(_))));
        assert_eq!(ids(&r), vec!["a", "b"]);
    }

    #[test]
    fn test_malformed_positions_rejected() {
        let mut r = PhaseRegistry::new();
        for position in [-1.0, 100.5, f64::NAN, f64::INFINITY] {
            let result = r.update_phases(vec![
                Phase::entry("a", "A"),
                Phase::new("b", "B", position),
            ]);
            assert!(result.is_err(), "position {} should be rejected", position);
        }
        assert!(r.is_empty());
    }

    #[test]
    fn test_locked_phase_rules() {
        let mut r = PhaseRegistry::new();

        // No locked phase
        assert!(r.update_phases(vec![Phase::new("a", "A", 0.0)]).is_err());

        // Two locked phases
        assert!(r
            .update_phases(vec![Phase::entry("a", "A"), Phase::entry("b", "B")])
            .is_err());

        // Locked phase moved away from 0
        let mut moved = Phase::entry("a", "A");
        moved.position = 10.0;
        assert!(r.update_phases(vec![moved]).is_err());
    }

    #[test]
    fn test_captured_volume_range_validated() {
        let mut state = CapturedState::default();
        state.volumes.insert("A".to_string(), 1.5);
        let mut r = PhaseRegistry::new();
        let result = r.update_phases(vec![Phase::entry("a", "A").with_state(state)]);
        assert!(matches!(result, Err(Error::InvalidPhaseData(_))));
    }

    #[test]
    fn test_set_captured_state() {
        let mut r = registry(vec![Phase::entry("a", "Settle"), Phase::new("b", "B", 50.0)]);
        assert!(r.get("b").unwrap().is_label_only());

        let mut state = CapturedState::default();
        state.volumes.insert("A".to_string(), 0.4);
        r.set_captured_state("b", Some(state.clone())).unwrap();
        assert_eq!(r.get("b").unwrap().captured_state.as_ref(), Some(&state));

        r.set_captured_state("b", None).unwrap();
        assert!(r.get("b").unwrap().is_label_only());

        assert!(matches!(
            r.set_captured_state("zzz", None),
            Err(Error::UnknownPhase(_))
        ));
    }

    #[test]
    fn test_next_boundary() {
        let r = registry(vec![Phase::entry("a", "A"), Phase::new("b", "B", 50.0)]);
        assert_eq!(r.next_boundary_after(0.0).unwrap().id, "b");
        assert!(r.next_boundary_after(50.0).is_none());
    }

    #[test]
    fn test_phase_json_shape() {
        let json = r##"{
            "id": "p2",
            "name": "Deepen",
            "position": 50,
            "color": "#336699",
            "captured_state": {
                "volumes": {"A": 0.1, "B": 0.5},
                "active_track": {"B": "ocean"}
            }
        }"##;
        let phase: Phase = serde_json::from_str(json).unwrap();
        assert_eq!(phase.position, 50.0);
        assert!(!phase.locked);
        let state = phase.captured_state.unwrap();
        assert_eq!(state.volumes["B"], 0.5);
        assert_eq!(state.active_track["B"], "ocean");
    }
}
