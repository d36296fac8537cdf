use chrono::Utc;
use meal_gateway::TestGateway;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::catalog::{DynCatalog, SqliteCatalog};
use crate::checkout::Checkout;
use crate::payment::{CoordinatorSettings, PaymentCoordinator};
use crate::resolver::VendorResolver;

use crate::order::{
    Customer, FulfillmentStatus, MealSelection, Order, OrderDraft, PaymentMode, PaymentStatus,
    PricingConfig,
};

/// In-memory database with all migrations applied. A single long-lived
/// connection keeps every query on the same in-memory database.
pub async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect(":memory:")
        .await
        .unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

/// Seeds a small catalog:
///
/// - Amiwo (400) with sides Piment (50) and Poisson frit (300), sold by
///   vendors 1 (inactive), 2 and 3
/// - Atassi (500) with side Fromage peulh (250), sold by vendor 2
/// - Riz au gras (450) in Small (350) and Large (600), sold by vendor 3
/// - Gboma (500), sold only by inactive vendor 1
pub async fn seed_catalog(pool: &SqlitePool) {
    sqlx::query(
        "
        INSERT INTO meals (id, name, price, active) VALUES
            (1, 'Amiwo', 400, 1),
            (2, 'Atassi', 500, 1),
            (3, 'Riz au gras', 450, 1),
            (4, 'Gboma', 500, 1);

        INSERT INTO meal_price_tiers (id, meal_id, label, price) VALUES
            (1, 3, 'Large', 600),
            (2, 3, 'Small', 350);

        INSERT INTO side_dishes (id, meal_id, name, price) VALUES
            (1, 1, 'Piment', 50),
            (2, 1, 'Poisson frit', 300),
            (3, 2, 'Fromage peulh', 250);

        INSERT INTO vendors (id, name, active) VALUES
            (1, 'Chez Tanti', 0),
            (2, 'Maman Benin', 1),
            (3, 'Cuisine Express', 1);

        INSERT INTO vendor_meals (vendor_id, meal_name) VALUES
            (1, 'Amiwo'),
            (2, 'Amiwo'),
            (2, 'Atassi'),
            (3, 'Amiwo'),
            (3, 'Riz au gras'),
            (1, 'Gboma');
        ",
    )
    .execute(pool)
    .await
    .unwrap();
}

pub fn meal(name: &str, price: i64) -> MealSelection {
    MealSelection {
        main_dish: name.to_string(),
        tier: None,
        price,
        side_dishes: Vec::new(),
    }
}

/// Draft for two days: Amiwo (400) on Monday and Atassi (500) on Tuesday,
/// paid daily. Totals 1300 with the default pricing.
pub struct OrderDraftBuilder {
    draft: OrderDraft,
}

impl OrderDraftBuilder {
    pub fn new() -> Self {
        Self {
            draft: OrderDraft {
                customer: Customer {
                    full_name: "Afi Mensah".to_string(),
                    phone_number: "+22997000000".to_string(),
                },
                delivery_address: "12 rue des Cocotiers, Cotonou".to_string(),
                delivery_time: "12:30".to_string(),
                selected_days: vec!["Monday".to_string(), "Tuesday".to_string()],
                meals_by_day: BTreeMap::from([
                    ("Monday".to_string(), meal("Amiwo", 400)),
                    ("Tuesday".to_string(), meal("Atassi", 500)),
                ]),
                payment_mode: PaymentMode::Daily,
                account_password: None,
            },
        }
    }

    pub fn with_phone(mut self, phone_number: &str) -> Self {
        self.draft.customer.phone_number = phone_number.to_string();
        self
    }

    /// Replaces the selected days without touching the meals.
    pub fn with_days(mut self, days: &[&str]) -> Self {
        self.draft.selected_days = days.iter().map(ToString::to_string).collect();
        self
    }

    pub fn with_mode(mut self, payment_mode: PaymentMode) -> Self {
        self.draft.payment_mode = payment_mode;
        self
    }

    pub fn with_meal(mut self, day: &str, selection: MealSelection) -> Self {
        self.draft.meals_by_day.insert(day.to_string(), selection);
        self
    }

    pub fn build(self) -> OrderDraft {
        self.draft
    }
}

/// Stored-order counterpart of [`OrderDraftBuilder`], priced with the
/// default configuration.
pub struct OrderBuilder {
    order: Order,
}

impl OrderBuilder {
    pub fn new() -> Self {
        Self::from_draft(OrderDraftBuilder::new().build())
    }

    pub fn from_draft(draft: OrderDraft) -> Self {
        let total = crate::order::compute_total(
            &draft.meal_prices(),
            draft.payment_mode,
            &PricingConfig::default(),
        )
        .unwrap();
        Self {
            order: Order::from_draft(draft, total, Utc::now()),
        }
    }

    pub fn with_phone(mut self, phone_number: &str) -> Self {
        self.order.customer.phone_number = phone_number.to_string();
        self
    }

    pub fn with_transaction_ref(mut self, transaction_ref: &str) -> Self {
        self.order.payment_transaction_ref = Some(transaction_ref.to_string());
        self
    }

    pub fn with_payment_status(mut self, status: PaymentStatus) -> Self {
        self.order.payment_status = status;
        self
    }

    pub fn with_fulfillment_status(mut self, status: FulfillmentStatus) -> Self {
        self.order.fulfillment_status = status;
        self
    }

    pub fn build(self) -> Order {
        self.order
    }
}

/// Inserts `order` and returns it as stored.
pub async fn insert_test_order(pool: &SqlitePool, order: &Order) -> Order {
    let mut conn = pool.acquire().await.unwrap();
    crate::order::repository::insert_order(&mut conn, order)
        .await
        .unwrap();
    crate::order::repository::get_order(&mut conn, order.id)
        .await
        .unwrap()
}

pub fn test_settings() -> CoordinatorSettings {
    CoordinatorSettings {
        pricing: PricingConfig::default(),
        callback_url: Url::parse("http://127.0.0.1:8080/payments/callback").unwrap(),
        gateway_timeout: Duration::from_secs(5),
    }
}

/// Coordinator over `pool`'s catalog using the given test gateway.
pub fn test_coordinator(pool: &SqlitePool, gateway: TestGateway) -> PaymentCoordinator {
    let catalog: DynCatalog = Arc::new(SqliteCatalog::new(pool.clone()));
    PaymentCoordinator::new(
        pool.clone(),
        Arc::new(gateway),
        VendorResolver::new(catalog),
        test_settings(),
    )
}

pub fn test_checkout(pool: &SqlitePool, gateway: TestGateway) -> Checkout {
    Checkout::new(
        pool.clone(),
        Arc::new(SqliteCatalog::new(pool.clone())),
        PricingConfig::default(),
        Arc::new(test_coordinator(pool, gateway)),
    )
}

/// Checkout over a freshly seeded database with a succeeding gateway.
pub async fn seeded_checkout() -> (Checkout, SqlitePool) {
    let pool = setup_test_db().await;
    seed_catalog(&pool).await;
    (test_checkout(&pool, TestGateway::new()), pool)
}
