//! Guided multi-step order assembly.
//!
//! A [`PlanningSession`] collects one decision per step and refuses to move
//! on until the current step is valid, so the payment step can only be
//! reached with a complete order. The session is plain data: it can be
//! serialized between requests and resumed.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

pub mod meals;

pub use meals::{MealAction, MealPlanner};

use crate::checkout::{Checkout, CheckoutError};
use crate::error::ValidationError;
use crate::order::validation::{check_password_policy, non_blank, validate_days};
use crate::order::{Customer, DayLabel, OrderDraft, OrderId, PaymentMode};
use crate::payment::PaymentHandoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    DaySelection,
    MealSelection,
    LocationSelection,
    DeliveryTime,
    /// Informational screen; nothing to decide.
    Motivation,
    CustomerIdentity,
    Payment,
    HandedOff,
}

impl Step {
    pub const fn name(self) -> &'static str {
        match self {
            Self::DaySelection => "day selection",
            Self::MealSelection => "meal selection",
            Self::LocationSelection => "location selection",
            Self::DeliveryTime => "delivery time",
            Self::Motivation => "motivation",
            Self::CustomerIdentity => "customer identity",
            Self::Payment => "payment",
            Self::HandedOff => "handed off",
        }
    }

    const fn previous(self) -> Option<Self> {
        match self {
            Self::DaySelection | Self::HandedOff => None,
            Self::MealSelection => Some(Self::DaySelection),
            Self::LocationSelection => Some(Self::MealSelection),
            Self::DeliveryTime => Some(Self::LocationSelection),
            Self::Motivation => Some(Self::DeliveryTime),
            Self::CustomerIdentity => Some(Self::Motivation),
            Self::Payment => Some(Self::CustomerIdentity),
        }
    }
}

/// The decision submitted for the current step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "input", content = "value", rename_all = "snake_case")]
pub enum StepInput {
    Days(Vec<String>),
    Meal(MealAction),
    Location(String),
    DeliveryTime(String),
    Continue,
    Identity {
        full_name: String,
        phone_number: String,
        #[serde(default)]
        password: Option<String>,
    },
    Payment(PaymentMode),
}

/// Where the customer was sent to pay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandoff {
    pub order_id: OrderId,
    pub payment_url: Url,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanningSession {
    step: Step,
    selected_days: Vec<DayLabel>,
    meals: MealPlanner,
    delivery_address: Option<String>,
    delivery_time: Option<String>,
    customer: Option<Customer>,
    /// Handed to the authentication collaborator only.
    #[serde(skip)]
    account_password: Option<String>,
    payment_mode: Option<PaymentMode>,
    /// Order stored by an earlier hand-off attempt whose payment failed.
    placed_order_id: Option<OrderId>,
    handoff: Option<SessionHandoff>,
}

impl Default for PlanningSession {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanningSession {
    pub fn new() -> Self {
        Self {
            step: Step::DaySelection,
            selected_days: Vec::new(),
            meals: MealPlanner::default(),
            delivery_address: None,
            delivery_time: None,
            customer: None,
            account_password: None,
            payment_mode: None,
            placed_order_id: None,
            handoff: None,
        }
    }

    pub const fn step(&self) -> Step {
        self.step
    }

    pub fn selected_days(&self) -> &[DayLabel] {
        &self.selected_days
    }

    pub const fn meals(&self) -> &MealPlanner {
        &self.meals
    }

    pub const fn placed_order_id(&self) -> Option<OrderId> {
        self.placed_order_id
    }

    pub const fn handoff(&self) -> Option<&SessionHandoff> {
        self.handoff.as_ref()
    }

    /// Applies `input` to the current step and returns the step the
    /// session is now on. Rejected input leaves the session unchanged.
    pub fn submit(&mut self, input: StepInput) -> Result<Step, ValidationError> {
        let step = self.step;

        match (step, input) {
            (Step::HandedOff, _) => return Err(ValidationError::AlreadyHandedOff),
            (Step::DaySelection, StepInput::Days(days)) => {
                let days = validate_days(&days)?;
                if days != self.selected_days {
                    self.meals.set_days(days.clone());
                    self.selected_days = days;
                    self.placed_order_id = None;
                }
                self.step = Step::MealSelection;
            }
            (Step::MealSelection, StepInput::Meal(action)) => {
                let mut meals = self.meals.clone();
                let complete = meals.apply(action)?;
                self.meals = meals;
                self.placed_order_id = None;
                if complete {
                    self.step = Step::LocationSelection;
                }
            }
            (Step::MealSelection, StepInput::Continue) => {
                self.ensure_meals_complete()?;
                self.step = Step::LocationSelection;
            }
            (Step::LocationSelection, StepInput::Location(address)) => {
                self.delivery_address = Some(non_blank(&address, "Delivery address")?);
                self.placed_order_id = None;
                self.step = Step::DeliveryTime;
            }
            (Step::DeliveryTime, StepInput::DeliveryTime(time)) => {
                self.delivery_time = Some(non_blank(&time, "Delivery time")?);
                self.placed_order_id = None;
                self.step = Step::Motivation;
            }
            (Step::Motivation, StepInput::Continue) => {
                self.step = Step::CustomerIdentity;
            }
            (
                Step::CustomerIdentity,
                StepInput::Identity {
                    full_name,
                    phone_number,
                    password,
                },
            ) => {
                let customer = Customer {
                    full_name,
                    phone_number,
                }
                .validated()?;
                if let Some(password) = &password {
                    check_password_policy(password)?;
                }
                self.ensure_meals_complete()?;

                self.customer = Some(customer);
                self.account_password = password;
                self.placed_order_id = None;
                self.step = Step::Payment;
            }
            (Step::Payment, StepInput::Payment(mode)) => {
                if self.payment_mode != Some(mode) {
                    self.payment_mode = Some(mode);
                    self.placed_order_id = None;
                }
            }
            (step, _) => {
                return Err(ValidationError::UnexpectedInput { step: step.name() });
            }
        }

        if self.step != step {
            debug!(from = step.name(), to = self.step.name(), "Planning session advanced");
        }
        Ok(self.step)
    }

    /// Moves exactly one step back. Everything entered so far is kept.
    pub fn prev(&mut self) -> Result<Step, ValidationError> {
        let previous = self
            .step
            .previous()
            .ok_or(ValidationError::CannotGoBack {
                step: self.step.name(),
            })?;
        self.step = previous;
        Ok(previous)
    }

    fn ensure_meals_complete(&self) -> Result<(), ValidationError> {
        if self.selected_days.is_empty() {
            return Err(ValidationError::EmptyDaySelection);
        }
        match self.meals.missing_day() {
            Some(day) => Err(ValidationError::MissingMeal { day: day.clone() }),
            None => Ok(()),
        }
    }

    /// The order as decided so far. Only available on the payment step
    /// once a payment mode is chosen.
    pub fn draft(&self) -> Result<OrderDraft, ValidationError> {
        if self.step != Step::Payment {
            return Err(ValidationError::UnexpectedInput {
                step: self.step.name(),
            });
        }
        self.ensure_meals_complete()?;

        let payment_mode = self
            .payment_mode
            .ok_or(ValidationError::PaymentModeMissing)?;
        let customer = self
            .customer
            .clone()
            .ok_or(ValidationError::BlankField("Full name"))?;

        Ok(OrderDraft {
            customer,
            delivery_address: self
                .delivery_address
                .clone()
                .ok_or(ValidationError::BlankField("Delivery address"))?,
            delivery_time: self
                .delivery_time
                .clone()
                .ok_or(ValidationError::BlankField("Delivery time"))?,
            selected_days: self.selected_days.clone(),
            meals_by_day: self.meals.selections(),
            payment_mode,
            account_password: self.account_password.clone(),
        })
    }

    /// Stores the order (once) and opens its payment transaction. The
    /// session only moves to [`Step::HandedOff`] when the gateway accepted
    /// the transaction; after a failure it stays on the payment step and a
    /// retry reuses the stored order, provided it is still unpaid and
    /// matches the draft. Anything else gets a new order.
    pub async fn hand_off(&mut self, checkout: &Checkout) -> Result<PaymentHandoff, CheckoutError> {
        if self.step == Step::HandedOff {
            return Err(ValidationError::AlreadyHandedOff.into());
        }
        let draft = self.draft()?;

        let reusable = match self.placed_order_id {
            Some(order_id) => checkout.reusable_order(order_id, &draft).await?,
            None => None,
        };

        let order_id = match reusable {
            Some(order) => order.id,
            None => {
                if let Some(stale) = self.placed_order_id {
                    warn!(order_id = %stale, "Earlier order cannot be reused for this session; placing a new one");
                }
                let order = checkout.place_order(&draft).await?;
                self.placed_order_id = Some(order.id);
                order.id
            }
        };

        let handoff = checkout.start_payment(order_id).await?;

        self.handoff = Some(SessionHandoff {
            order_id,
            payment_url: handoff.payment_url.clone(),
            token: handoff.token.clone(),
        });
        self.step = Step::HandedOff;

        info!(%order_id, transaction_id = %handoff.transaction_id, "Planning session handed off to payment");
        Ok(handoff)
    }
}
