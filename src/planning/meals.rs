use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::catalog::{Meal, SideDish};
use crate::error::ValidationError;
use crate::order::{DayLabel, MealSelection, SideDishChoice};

/// One edit inside the meal step. Dishes and side dishes come from the
/// catalog, so their prices are the ones shown to the customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "value", rename_all = "snake_case")]
pub enum MealAction {
    /// Choose the main dish for the current day. Clears tier and sides.
    PickDish(Meal),
    PickTier(String),
    AddSide(SideDish),
    RemoveSide(i64),
    /// Freeze the current day's selection and move to the next open day.
    ConfirmDay,
    /// Reopen the previous day for editing.
    PreviousDay,
}

/// Day being edited: the catalog objects the selection is priced from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MealDraft {
    meal: Meal,
    tier: Option<String>,
    sides: Vec<SideDish>,
}

impl MealDraft {
    fn new(meal: Meal) -> Self {
        Self {
            meal,
            tier: None,
            sides: Vec::new(),
        }
    }

    fn price(&self) -> Result<i64, ValidationError> {
        let base = self
            .meal
            .base_price(self.tier.as_deref())
            .ok_or_else(|| match &self.tier {
                Some(tier) => ValidationError::UnknownTier {
                    dish: self.meal.name.clone(),
                    tier: tier.clone(),
                },
                None => ValidationError::TierRequired {
                    dish: self.meal.name.clone(),
                },
            })?;

        self.sides
            .iter()
            .try_fold(base, |total, side| total.checked_add(side.price))
            .ok_or(ValidationError::AmountOverflow)
    }

    fn to_selection(&self) -> Result<MealSelection, ValidationError> {
        Ok(MealSelection {
            main_dish: self.meal.name.clone(),
            tier: self.tier.clone(),
            price: self.price()?,
            side_dishes: self
                .sides
                .iter()
                .map(|side| SideDishChoice {
                    id: side.id,
                    name: side.name.clone(),
                    price: side.price,
                })
                .collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ConfirmedMeal {
    draft: MealDraft,
    selection: MealSelection,
}

/// Walks the selected days in order, one meal per day.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MealPlanner {
    days: Vec<DayLabel>,
    cursor: usize,
    confirmed: BTreeMap<DayLabel, ConfirmedMeal>,
    /// Drafts left behind with [`MealAction::PreviousDay`]. They are
    /// restored when the day is reached again but never count as confirmed.
    #[serde(default)]
    unconfirmed: BTreeMap<DayLabel, MealDraft>,
    editing: Option<MealDraft>,
}

impl MealPlanner {
    /// Replaces the day list. Confirmed meals of days still selected are
    /// kept; the cursor restarts at the first day without one.
    pub fn set_days(&mut self, days: Vec<DayLabel>) {
        self.confirmed.retain(|day, _| days.contains(day));
        self.unconfirmed.retain(|day, _| days.contains(day));
        self.days = days;
        self.editing = None;
        self.cursor = self.first_open_day();
        self.resume_current_day();
    }

    /// Picks up the unconfirmed draft of the day under the cursor, if any.
    fn resume_current_day(&mut self) {
        self.editing = self
            .days
            .get(self.cursor)
            .and_then(|day| self.unconfirmed.remove(day));
    }

    fn first_open_day(&self) -> usize {
        self.days
            .iter()
            .position(|day| !self.confirmed.contains_key(day))
            .unwrap_or(self.days.len())
    }

    pub fn current_day(&self) -> Option<&DayLabel> {
        self.days.get(self.cursor)
    }

    pub fn is_complete(&self) -> bool {
        !self.days.is_empty() && self.days.iter().all(|day| self.confirmed.contains_key(day))
    }

    pub fn missing_day(&self) -> Option<&DayLabel> {
        self.days
            .iter()
            .find(|day| !self.confirmed.contains_key(*day))
    }

    /// Confirmed selections keyed by day.
    pub fn selections(&self) -> BTreeMap<DayLabel, MealSelection> {
        self.confirmed
            .iter()
            .map(|(day, confirmed)| (day.clone(), confirmed.selection.clone()))
            .collect()
    }

    /// Price of the day being edited, when it can already be computed.
    pub fn pending_price(&self) -> Option<i64> {
        self.editing.as_ref().and_then(|draft| draft.price().ok())
    }

    fn editing_mut(&mut self) -> Result<&mut MealDraft, ValidationError> {
        let day = self.current_day().cloned().unwrap_or_default();
        self.editing
            .as_mut()
            .ok_or(ValidationError::NoDishSelected { day })
    }

    /// Applies one edit. Returns `true` once every day has a confirmed meal.
    pub fn apply(&mut self, action: MealAction) -> Result<bool, ValidationError> {
        match action {
            MealAction::PickDish(meal) => {
                if !meal.active {
                    return Err(ValidationError::UnknownDish(meal.name));
                }
                self.current_open_day()?;
                self.editing = Some(MealDraft::new(meal));
            }
            MealAction::PickTier(label) => {
                let draft = self.editing_mut()?;
                let label = label.trim();
                if !draft.meal.tiers.iter().any(|tier| tier.label == label) {
                    return Err(ValidationError::UnknownTier {
                        dish: draft.meal.name.clone(),
                        tier: label.to_string(),
                    });
                }
                draft.tier = Some(label.to_string());
            }
            MealAction::AddSide(side) => {
                let draft = self.editing_mut()?;
                if side.meal_id != draft.meal.id {
                    return Err(ValidationError::SideDishNotForDish {
                        side: side.name,
                        dish: draft.meal.name.clone(),
                    });
                }
                if draft.sides.iter().any(|existing| existing.id == side.id) {
                    return Err(ValidationError::DuplicateSideDish(side.name));
                }
                draft.sides.push(side);
            }
            MealAction::RemoveSide(side_id) => {
                self.editing_mut()?.sides.retain(|side| side.id != side_id);
            }
            MealAction::ConfirmDay => {
                let day = self.current_open_day()?.clone();
                let draft = self.editing_mut()?;
                let selection = draft.to_selection()?;
                let draft = draft.clone();

                self.unconfirmed.remove(&day);
                self.confirmed
                    .insert(day, ConfirmedMeal { draft, selection });
                self.cursor = self.first_open_day();
                self.resume_current_day();
            }
            MealAction::PreviousDay => {
                if self.cursor == 0 {
                    return Err(ValidationError::CannotGoBack {
                        step: "meal selection",
                    });
                }
                // The day being left keeps its draft, still unconfirmed.
                if let (Some(day), Some(draft)) = (self.current_day().cloned(), self.editing.take()) {
                    self.unconfirmed.insert(day, draft);
                }

                self.cursor -= 1;
                let reopened = self
                    .days
                    .get(self.cursor)
                    .and_then(|day| self.confirmed.remove(day))
                    .map(|confirmed| confirmed.draft);
                match reopened {
                    Some(draft) => self.editing = Some(draft),
                    None => self.resume_current_day(),
                }
            }
        }

        Ok(self.is_complete())
    }

    fn current_open_day(&self) -> Result<&DayLabel, ValidationError> {
        self.current_day()
            .ok_or(ValidationError::UnexpectedInput {
                step: "meal selection",
            })
    }
}
