use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::BTreeSet;

use super::{CatalogReader, Meal, PriceTier, SideDish, Vendor, VendorId};
use crate::error::CatalogLookupError;

#[derive(sqlx::FromRow)]
struct MealRow {
    id: i64,
    name: String,
    price: i64,
    active: bool,
}

#[derive(sqlx::FromRow)]
struct TierRow {
    label: String,
    price: i64,
}

#[derive(sqlx::FromRow)]
struct SideDishRow {
    id: i64,
    meal_id: i64,
    name: String,
    price: i64,
}

#[derive(sqlx::FromRow)]
struct VendorRow {
    id: i64,
    name: String,
    active: bool,
}

/// Catalog backed by the tables the administrative screens maintain.
#[derive(Debug, Clone)]
pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_tiers(&self, meal_id: i64) -> Result<Vec<PriceTier>, CatalogLookupError> {
        let rows = sqlx::query_as::<_, TierRow>(
            "SELECT label, price FROM meal_price_tiers WHERE meal_id = ?1 ORDER BY price ASC, id ASC",
        )
        .bind(meal_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|TierRow { label, price }| PriceTier { label, price })
            .collect())
    }

    async fn row_to_meal(&self, row: MealRow) -> Result<Meal, CatalogLookupError> {
        if row.price < 0 {
            return Err(CatalogLookupError::InvalidRow(format!(
                "meal {} has negative price {}",
                row.name, row.price
            )));
        }

        Ok(Meal {
            tiers: self.load_tiers(row.id).await?,
            id: row.id,
            name: row.name,
            price: row.price,
            active: row.active,
        })
    }
}

#[async_trait]
impl CatalogReader for SqliteCatalog {
    async fn list_active_meals(&self) -> Result<Vec<Meal>, CatalogLookupError> {
        let rows = sqlx::query_as::<_, MealRow>(
            "SELECT id, name, price, active FROM meals WHERE active = 1 ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut meals = Vec::with_capacity(rows.len());
        for row in rows {
            meals.push(self.row_to_meal(row).await?);
        }
        Ok(meals)
    }

    async fn find_meal_by_name(&self, name: &str) -> Result<Option<Meal>, CatalogLookupError> {
        let row = sqlx::query_as::<_, MealRow>(
            "SELECT id, name, price, active FROM meals WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.row_to_meal(row).await?)),
            None => Ok(None),
        }
    }

    async fn list_side_dishes_for_meal(
        &self,
        meal_id: i64,
    ) -> Result<Vec<SideDish>, CatalogLookupError> {
        let rows = sqlx::query_as::<_, SideDishRow>(
            "SELECT id, meal_id, name, price FROM side_dishes WHERE meal_id = ?1 ORDER BY id ASC",
        )
        .bind(meal_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |SideDishRow {
                     id,
                     meal_id,
                     name,
                     price,
                 }| SideDish {
                    id,
                    meal_id,
                    name,
                    price,
                },
            )
            .collect())
    }

    async fn list_vendors_for_meal(
        &self,
        meal_name: &str,
    ) -> Result<Vec<Vendor>, CatalogLookupError> {
        let rows = sqlx::query_as::<_, VendorRow>(
            "
            SELECT v.id, v.name, v.active
            FROM vendors v
            JOIN vendor_meals vm ON vm.vendor_id = v.id
            WHERE vm.meal_name = ?1
            ORDER BY v.id ASC
            ",
        )
        .bind(meal_name)
        .fetch_all(&self.pool)
        .await?;

        let mut vendors = Vec::with_capacity(rows.len());
        for VendorRow { id, name, active } in rows {
            let sold_meal_names = sqlx::query_scalar::<_, String>(
                "SELECT meal_name FROM vendor_meals WHERE vendor_id = ?1",
            )
            .bind(id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .collect::<BTreeSet<_>>();

            vendors.push(Vendor {
                id: VendorId(id),
                name,
                active,
                sold_meal_names,
            });
        }

        Ok(vendors)
    }
}
