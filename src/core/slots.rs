//! Derived-question slots
//!
//! Every primary question owns exactly eight slots, `B1`..`B8`, each holding
//! at most one true/false question derived from it. Slots are never removed;
//! they are filled and cleared in place. The filled/total counters are always
//! computed from slot state, so they cannot drift from it.

use crate::core::error::{QcodeError, Result};
use crate::core::record::format_timestamp;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Number of slots under every primary identifier
pub const SLOT_COUNT: usize = 8;

/// Fixed slot tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SlotTag {
    B1,
    B2,
    B3,
    B4,
    B5,
    B6,
    B7,
    B8,
}

impl SlotTag {
    pub const ALL: [SlotTag; SLOT_COUNT] = [
        SlotTag::B1,
        SlotTag::B2,
        SlotTag::B3,
        SlotTag::B4,
        SlotTag::B5,
        SlotTag::B6,
        SlotTag::B7,
        SlotTag::B8,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SlotTag::B1 => "B1",
            SlotTag::B2 => "B2",
            SlotTag::B3 => "B3",
            SlotTag::B4 => "B4",
            SlotTag::B5 => "B5",
            SlotTag::B6 => "B6",
            SlotTag::B7 => "B7",
            SlotTag::B8 => "B8",
        }
    }
}

impl fmt::Display for SlotTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SlotTag {
    type Err = QcodeError;

    fn from_str(s: &str) -> Result<Self> {
        SlotTag::ALL
            .into_iter()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| QcodeError::InvalidSlot(s.to_string()))
    }
}

/// Compose a derived identifier `{parent}-{tag}`
pub fn derived_identifier(parent: &str, tag: SlotTag) -> String {
    format!("{}-{}", parent, tag)
}

/// One derived question slot
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Slot {
    #[serde(default)]
    pub question: String,

    #[serde(default)]
    pub answer: String,

    #[serde(default)]
    pub exists: bool,

    #[serde(default)]
    pub created_date: Option<String>,

    #[serde(default)]
    pub modified_date: Option<String>,

    /// Identifier the derived question had before it was slotted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_qcode: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_info: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Ways a slot can break the exists/text invariant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotViolation {
    /// `exists=true` but question or answer is empty
    FilledWithoutText,
    /// Text present but `exists=false`
    TextWithoutFlag,
}

impl Slot {
    fn violation(&self) -> Option<SlotViolation> {
        let has_text = !self.question.trim().is_empty() && !self.answer.trim().is_empty();
        let any_text = !self.question.trim().is_empty() || !self.answer.trim().is_empty();
        match (self.exists, has_text, any_text) {
            (true, false, _) => Some(SlotViolation::FilledWithoutText),
            (false, _, true) => Some(SlotViolation::TextWithoutFlag),
            _ => None,
        }
    }
}

/// Derived slot counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotCounters {
    pub total_slots: usize,
    pub filled_slots: usize,
}

/// Result of a fill
#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    Filled,
    /// The slot already held content, returned here
    Overwrote(Box<Slot>),
}

/// Exactly eight slots, keyed by tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, Slot>",
    into = "BTreeMap<String, Slot>"
)]
pub struct SlotSet(BTreeMap<SlotTag, Slot>);

impl SlotSet {
    /// Eight empty slots
    pub fn empty() -> Self {
        SlotSet(SlotTag::ALL.into_iter().map(|tag| (tag, Slot::default())).collect())
    }

    pub fn get(&self, tag: SlotTag) -> &Slot {
        // Construction guarantees all eight keys.
        &self.0[&tag]
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotTag, &Slot)> {
        self.0.iter().map(|(tag, slot)| (*tag, slot))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SlotTag, &mut Slot)> {
        self.0.iter_mut().map(|(tag, slot)| (*tag, slot))
    }

    pub fn filled_count(&self) -> usize {
        self.0.values().filter(|slot| slot.exists).count()
    }

    pub fn counters(&self) -> SlotCounters {
        SlotCounters {
            total_slots: self.0.len(),
            filled_slots: self.filled_count(),
        }
    }

    /// Tags of filled slots, in order
    pub fn filled_tags(&self) -> Vec<SlotTag> {
        self.iter().filter(|(_, s)| s.exists).map(|(tag, _)| tag).collect()
    }

    /// Slots breaking the exists/text invariant
    pub fn violations(&self) -> Vec<(SlotTag, SlotViolation)> {
        self.iter()
            .filter_map(|(tag, slot)| slot.violation().map(|v| (tag, v)))
            .collect()
    }

    fn slot_mut(&mut self, tag: SlotTag) -> &mut Slot {
        self.0.entry(tag).or_default()
    }
}

impl Default for SlotSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl TryFrom<BTreeMap<String, Slot>> for SlotSet {
    type Error = QcodeError;

    fn try_from(raw: BTreeMap<String, Slot>) -> Result<Self> {
        let mut set = SlotSet::empty();
        for (name, slot) in raw {
            let tag: SlotTag = name.parse()?;
            set.0.insert(tag, slot);
        }
        Ok(set)
    }
}

impl From<SlotSet> for BTreeMap<String, Slot> {
    fn from(set: SlotSet) -> Self {
        set.0
            .into_iter()
            .map(|(tag, slot)| (tag.as_str().to_string(), slot))
            .collect()
    }
}

/// Fills and clears slots
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotAllocator;

impl SlotAllocator {
    /// Eight slots, all `exists=false`
    pub fn create_empty_slots(&self) -> SlotSet {
        SlotSet::empty()
    }

    /// Fill a slot with question and answer text
    ///
    /// # Errors
    ///
    /// - `InvalidSlot` if `tag` is not one of `B1`..`B8`
    /// - `EmptySlotContent` if either text is blank
    ///
    /// Overwriting a filled slot succeeds and returns the previous content.
    pub fn fill(
        &self,
        slots: &mut SlotSet,
        tag: &str,
        question: &str,
        answer: &str,
        now: NaiveDateTime,
    ) -> Result<FillOutcome> {
        let tag: SlotTag = tag.parse()?;
        if question.trim().is_empty() || answer.trim().is_empty() {
            return Err(QcodeError::EmptySlotContent(tag.to_string()));
        }

        let stamp = format_timestamp(now);
        let slot = slots.slot_mut(tag);
        let outcome = if slot.exists {
            warn!("Overwriting filled slot {}", tag);
            FillOutcome::Overwrote(Box::new(slot.clone()))
        } else {
            slot.created_date = Some(stamp.clone());
            FillOutcome::Filled
        };

        slot.question = question.to_string();
        slot.answer = answer.to_string();
        slot.exists = true;
        slot.modified_date = Some(stamp);
        debug!("Filled slot {}", tag);

        Ok(outcome)
    }

    /// Clear a slot back to empty, returning what it held
    pub fn clear(&self, slots: &mut SlotSet, tag: &str) -> Result<Slot> {
        let tag: SlotTag = tag.parse()?;
        let slot = slots.slot_mut(tag);
        let previous = slot.clone();

        // Provenance (original_qcode, parent_info, unknown fields) stays.
        slot.question.clear();
        slot.answer.clear();
        slot.exists = false;
        slot.created_date = None;
        slot.modified_date = None;

        debug!("Cleared slot {}", tag);
        Ok(previous)
    }
}
