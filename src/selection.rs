use std::fmt;

use crate::datapackage::Datapackage;
use crate::error::ScenarioLinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionEvent {
    Changed { included: usize, total: usize },
    /// Emitted when superstructure output becomes available or unavailable.
    SuperstructureAvailability(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    Included,
    Excluded,
    /// The toggle would have left no scenario included; nothing changed.
    Rejected,
}

type Observer = Box<dyn FnMut(&SelectionEvent) + Send>;

/// Which scenarios of the open datapackage are included. Every scenario
/// starts included; the model never lets the last included scenario be
/// dropped.
#[derive(Default)]
pub struct SelectionModel {
    included: Vec<bool>,
    observers: Vec<Observer>,
}

impl fmt::Debug for SelectionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionModel")
            .field("included", &self.included)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl SelectionModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_package(package: &Datapackage) -> Self {
        let mut model = Self::new();
        model.open(package);
        model
    }

    pub fn open(&mut self, package: &Datapackage) {
        self.reset(package.scenario_count());
    }

    pub fn reset(&mut self, scenario_count: usize) {
        self.included = vec![true; scenario_count];
        self.notify_changed(None);
    }

    pub fn subscribe<F>(&mut self, observer: F)
    where
        F: FnMut(&SelectionEvent) + Send + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    pub fn toggle(&mut self, index: usize) -> Result<ToggleOutcome, ScenarioLinkError> {
        let total = self.included.len();
        let current = *self
            .included
            .get(index)
            .ok_or(ScenarioLinkError::ScenarioIndexOutOfRange { index, count: total })?;
        if current && self.included_count() == 1 {
            return Ok(ToggleOutcome::Rejected);
        }
        let previously_available = self.superstructure_available();
        self.included[index] = !current;
        self.notify_changed(Some(previously_available));
        Ok(if current {
            ToggleOutcome::Excluded
        } else {
            ToggleOutcome::Included
        })
    }

    /// Replaces the selection with exactly `indices`.
    pub fn select_only(&mut self, indices: &[usize]) -> Result<(), ScenarioLinkError> {
        let total = self.included.len();
        if let Some(&index) = indices.iter().find(|&&index| index >= total) {
            return Err(ScenarioLinkError::ScenarioIndexOutOfRange { index, count: total });
        }
        if indices.is_empty() {
            return Err(ScenarioLinkError::InvalidSelection(
                "at least one scenario must be included".to_string(),
            ));
        }
        let previously_available = self.superstructure_available();
        self.included = vec![false; total];
        for &index in indices {
            self.included[index] = true;
        }
        self.notify_changed(Some(previously_available));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.included.len()
    }

    pub fn is_empty(&self) -> bool {
        self.included.is_empty()
    }

    pub fn is_included(&self, index: usize) -> bool {
        self.included.get(index).copied().unwrap_or(false)
    }

    pub fn included_count(&self) -> usize {
        self.included.iter().filter(|included| **included).count()
    }

    pub fn included_indices(&self) -> Vec<usize> {
        self.included
            .iter()
            .enumerate()
            .filter_map(|(idx, included)| included.then_some(idx))
            .collect()
    }

    pub fn is_single_selection(&self) -> bool {
        self.included_count() == 1
    }

    /// Generation is disabled while this holds.
    pub fn is_empty_selection(&self) -> bool {
        self.included_count() == 0
    }

    pub fn superstructure_available(&self) -> bool {
        self.included_count() > 1
    }

    fn notify_changed(&mut self, previously_available: Option<bool>) {
        let changed = SelectionEvent::Changed {
            included: self.included_count(),
            total: self.included.len(),
        };
        let available = self.superstructure_available();
        let availability = (previously_available != Some(available))
            .then_some(SelectionEvent::SuperstructureAvailability(available));
        for observer in &mut self.observers {
            observer(&changed);
            if let Some(event) = &availability {
                observer(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn opens_with_everything_included() {
        let mut model = SelectionModel::new();
        model.reset(3);
        assert_eq!(model.included_indices(), vec![0, 1, 2]);
        assert!(model.superstructure_available());
    }

    #[test]
    fn last_included_scenario_cannot_be_dropped() {
        let mut model = SelectionModel::new();
        model.reset(2);
        assert_eq!(model.toggle(0).unwrap(), ToggleOutcome::Excluded);
        assert_eq!(model.toggle(1).unwrap(), ToggleOutcome::Rejected);
        assert_eq!(model.included_indices(), vec![1]);
        assert!(model.is_single_selection());
        assert_eq!(model.toggle(0).unwrap(), ToggleOutcome::Included);
        assert_eq!(model.included_indices(), vec![0, 1]);
    }

    #[test]
    fn included_count_stays_within_bounds() {
        let mut model = SelectionModel::new();
        model.reset(4);
        let sequence = [0, 1, 2, 3, 3, 2, 0, 1, 1, 1, 3, 2, 0, 0, 2, 3];
        for index in sequence {
            model.toggle(index).unwrap();
            let count = model.included_count();
            assert!((1..=4).contains(&count));
        }
    }

    #[test]
    fn single_scenario_disables_superstructure() {
        let mut model = SelectionModel::new();
        model.reset(1);
        assert!(model.is_single_selection());
        assert!(!model.superstructure_available());
        assert_eq!(model.toggle(0).unwrap(), ToggleOutcome::Rejected);
    }

    #[test]
    fn out_of_range_toggle_is_error() {
        let mut model = SelectionModel::new();
        model.reset(2);
        assert_matches!(
            model.toggle(5),
            Err(ScenarioLinkError::ScenarioIndexOutOfRange { index: 5, count: 2 })
        );
    }

    #[test]
    fn select_only_validates_input() {
        let mut model = SelectionModel::new();
        model.reset(3);
        model.select_only(&[2, 0]).unwrap();
        assert_eq!(model.included_indices(), vec![0, 2]);
        assert_matches!(
            model.select_only(&[]),
            Err(ScenarioLinkError::InvalidSelection(_))
        );
        assert_matches!(
            model.select_only(&[3]),
            Err(ScenarioLinkError::ScenarioIndexOutOfRange { .. })
        );
        assert_eq!(model.included_indices(), vec![0, 2]);
    }

    #[test]
    fn observers_see_availability_transitions() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut model = SelectionModel::new();
        let sink = events.clone();
        model.subscribe(move |event| sink.lock().unwrap().push(*event));

        model.reset(2);
        model.toggle(0).unwrap();
        model.toggle(1).unwrap();

        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                SelectionEvent::Changed { included: 2, total: 2 },
                SelectionEvent::SuperstructureAvailability(true),
                SelectionEvent::Changed { included: 1, total: 2 },
                SelectionEvent::SuperstructureAvailability(false),
            ]
        );
    }
}
