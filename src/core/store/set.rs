use super::{QuestionStore, SlottedStore, StoreKind, StoreSnapshot};
use crate::core::error::{QcodeError, Result};

/// The primary store plus every secondary store of the same corpus
pub struct StoreSet {
    primary: Box<dyn QuestionStore>,
    secondaries: Vec<Box<dyn QuestionStore>>,
}

impl StoreSet {
    /// A set around `primary`, which must hold full records
    pub fn new(primary: Box<dyn QuestionStore>) -> Result<Self> {
        if !primary.kind().holds_primary_records() {
            return Err(QcodeError::UnsupportedStore {
                store: primary.name().to_string(),
                reason: format!("a {} store cannot be the primary store", primary.kind()),
            });
        }
        Ok(StoreSet {
            primary,
            secondaries: Vec::new(),
        })
    }

    pub fn with_secondary(mut self, store: Box<dyn QuestionStore>) -> Self {
        self.secondaries.push(store);
        self
    }

    pub fn push(&mut self, store: Box<dyn QuestionStore>) {
        self.secondaries.push(store);
    }

    pub fn primary(&self) -> &dyn QuestionStore {
        self.primary.as_ref()
    }

    pub fn primary_mut(&mut self) -> &mut dyn QuestionStore {
        self.primary.as_mut()
    }

    pub fn secondaries(&self) -> &[Box<dyn QuestionStore>] {
        &self.secondaries
    }

    pub fn len(&self) -> usize {
        1 + self.secondaries.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// All stores, primary first
    pub fn iter(&self) -> impl Iterator<Item = &(dyn QuestionStore + 'static)> {
        std::iter::once(self.primary.as_ref()).chain(self.secondaries.iter().map(|s| s.as_ref()))
    }

    /// Store by position in [`StoreSet::iter`] order
    pub fn get_mut(&mut self, index: usize) -> Option<&mut dyn QuestionStore> {
        let store: &mut dyn QuestionStore = match index {
            0 => self.primary.as_mut(),
            n => self.secondaries.get_mut(n - 1)?.as_mut(),
        };
        Some(store)
    }

    /// Positions in write order: primary, list/dict, slotted, tabular
    pub fn apply_order(&self) -> Vec<usize> {
        let rank = |kind: StoreKind| match kind {
            StoreKind::List | StoreKind::Dict => 0,
            StoreKind::Slotted => 1,
            StoreKind::Tabular => 2,
        };
        let mut order: Vec<usize> = (1..self.len()).collect();
        order.sort_by_key(|&i| rank(self.secondaries[i - 1].kind()));
        order.insert(0, 0);
        order
    }

    /// First slotted secondary
    pub fn slotted(&self) -> Option<&SlottedStore> {
        self.secondaries.iter().find_map(|s| s.as_slotted())
    }

    pub fn slotted_mut(&mut self) -> Option<&mut SlottedStore> {
        self.secondaries.iter_mut().find_map(|s| s.as_slotted_mut())
    }

    /// Reload every store from disk
    pub fn load_all(&mut self) -> Result<()> {
        self.primary.load()?;
        for store in &mut self.secondaries {
            store.load()?;
        }
        Ok(())
    }

    pub fn snapshots(&self) -> Vec<StoreSnapshot> {
        self.iter().map(|s| s.snapshot()).collect()
    }

    /// Every identifier held by any store, derived ones included
    pub fn all_identifiers(&self) -> Vec<String> {
        self.iter()
            .flat_map(|s| {
                let mut ids = s.identifiers();
                ids.extend(s.derived_identifiers());
                ids
            })
            .collect()
    }
}

impl std::fmt::Debug for StoreSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|s| format!("{} ({})", s.name(), s.kind())))
            .finish()
    }
}
