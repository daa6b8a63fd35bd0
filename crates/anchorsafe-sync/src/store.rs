use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use anchorsafe_core::EntityKind;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

/// `as_logs.log_type_id` values written by the sync pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum LogType {
    DataPull = 9,
}

/// Fallback `inspection_status.id` ("Unassigned").
pub const DEFAULT_INSPECTION_STATUS_ID: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewClient {
    pub client_name: String,
    pub simpro_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSite {
    pub client_id: i64,
    pub site_name: String,
    pub street: String,
    pub city: String,
    pub state: String,
    pub post_code: String,
    pub is_active: bool,
    pub simpro_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLocation {
    pub site_id: i64,
    pub location_name: String,
    pub simpro_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInspection {
    pub client_id: i64,
    pub site_id: i64,
    pub inspection_status_id: i64,
    pub user_id: i64,
    pub created_user_id: i64,
    pub modified_user_id: i64,
    pub simpro_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ClientRow {
    pub id: i64,
    pub client_name: String,
    pub simpro_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SiteRow {
    pub id: i64,
    pub client_id: i64,
    pub site_name: String,
    pub street: String,
    pub city: String,
    pub state: String,
    pub post_code: String,
    pub is_active: bool,
    pub simpro_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct LocationRow {
    pub id: i64,
    pub site_id: i64,
    pub location_name: String,
    pub simpro_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct InspectionRow {
    pub id: i64,
    pub client_id: i64,
    pub site_id: i64,
    pub inspection_status_id: i64,
    pub user_id: i64,
    pub created_user_id: i64,
    pub modified_user_id: i64,
    pub simpro_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRow {
    pub id: i64,
    pub message: String,
    pub log_type_id: i64,
    pub user_id: Option<i64>,
    pub date_created: DateTime<Utc>,
}

fn table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Clients => "clients",
        EntityKind::Sites => "sites",
        EntityKind::Locations => "locations",
        EntityKind::Inspections => "inspections",
    }
}

/// Relational store the reconciler writes into.
#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database; one long-lived connection keeps it alive.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parsing in-memory database url")?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("opening in-memory database")?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")
    }

    /// Remote ids already linked to a row of `kind`.
    pub async fn simpro_ids(&self, kind: EntityKind) -> Result<HashSet<i64>> {
        let sql = format!(
            "SELECT simpro_id FROM {} WHERE simpro_id IS NOT NULL",
            table(kind)
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("loading {kind} simpro ids"))?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("simpro_id").map_err(Into::into))
            .collect()
    }

    /// Local primary key of the `kind` row linked to `simpro_id`.
    pub async fn id_for_simpro_id(&self, kind: EntityKind, simpro_id: i64) -> Result<Option<i64>> {
        let sql = format!("SELECT id FROM {} WHERE simpro_id = ?", table(kind));
        let row = sqlx::query(&sql)
            .bind(simpro_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("looking up {kind} for simpro id {simpro_id}"))?;
        row.map(|r| r.try_get::<i64, _>("id"))
            .transpose()
            .map_err(Into::into)
    }

    pub async fn inspection_status_id(&self, description: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT id FROM inspection_status WHERE description = ?")
            .bind(description)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("looking up inspection status {description}"))?;
        row.map(|r| r.try_get::<i64, _>("id"))
            .transpose()
            .map_err(Into::into)
    }

    /// Each insert returns whether a row was actually added; a row already
    /// linked to the same remote id is left untouched.
    pub async fn insert_client(&self, client: &NewClient) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO clients (client_name, is_active, simpro_id, date_created, date_modified)
            VALUES (?, 1, ?, ?, ?)
            ON CONFLICT (simpro_id) DO NOTHING
            "#,
        )
        .bind(&client.client_name)
        .bind(client.simpro_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting client for simpro id {}", client.simpro_id))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn insert_site(&self, site: &NewSite) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO sites (
                client_id, site_name, street, city, state, post_code,
                is_active, simpro_id, date_created, date_modified
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (simpro_id) DO NOTHING
            "#,
        )
        .bind(site.client_id)
        .bind(&site.site_name)
        .bind(&site.street)
        .bind(&site.city)
        .bind(&site.state)
        .bind(&site.post_code)
        .bind(site.is_active)
        .bind(site.simpro_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting site for simpro id {}", site.simpro_id))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn insert_location(&self, location: &NewLocation) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO locations (site_id, location_name, simpro_id, date_created, date_modified)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (simpro_id) DO NOTHING
            "#,
        )
        .bind(location.site_id)
        .bind(&location.location_name)
        .bind(location.simpro_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting location for simpro id {}", location.simpro_id))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn insert_inspection(&self, inspection: &NewInspection) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO inspections (
                client_id, site_id, inspection_status_id, user_id,
                created_user_id, modified_user_id, simpro_id, date_created, date_modified
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (simpro_id) DO NOTHING
            "#,
        )
        .bind(inspection.client_id)
        .bind(inspection.site_id)
        .bind(inspection.inspection_status_id)
        .bind(inspection.user_id)
        .bind(inspection.created_user_id)
        .bind(inspection.modified_user_id)
        .bind(inspection.simpro_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting inspection for simpro id {}", inspection.simpro_id))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn add_log_entry(
        &self,
        message: &str,
        log_type: LogType,
        user_id: Option<i64>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO as_logs (message, log_type_id, user_id, date_created) VALUES (?, ?, ?, ?)",
        )
        .bind(message)
        .bind(log_type as i64)
        .bind(user_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("writing as_logs entry")?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list_clients(&self) -> Result<Vec<ClientRow>> {
        sqlx::query_as::<_, ClientRow>(
            "SELECT id, client_name, simpro_id FROM clients ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing clients")
    }

    pub async fn list_sites(&self) -> Result<Vec<SiteRow>> {
        sqlx::query_as::<_, SiteRow>(
            r#"
            SELECT id, client_id, site_name, street, city, state, post_code, is_active, simpro_id
              FROM sites
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing sites")
    }

    pub async fn list_locations(&self) -> Result<Vec<LocationRow>> {
        sqlx::query_as::<_, LocationRow>(
            "SELECT id, site_id, location_name, simpro_id FROM locations ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing locations")
    }

    pub async fn list_inspections(&self) -> Result<Vec<InspectionRow>> {
        sqlx::query_as::<_, InspectionRow>(
            r#"
            SELECT id, client_id, site_id, inspection_status_id, user_id,
                   created_user_id, modified_user_id, simpro_id
              FROM inspections
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing inspections")
    }

    pub async fn recent_logs(&self, limit: i64) -> Result<Vec<LogRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, message, log_type_id, user_id, date_created
              FROM as_logs
             ORDER BY id DESC
             LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("listing as_logs")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(LogRow {
                id: row.try_get("id")?,
                message: row.try_get("message")?,
                log_type_id: row.try_get("log_type_id")?,
                user_id: row.try_get("user_id")?,
                date_created: row.try_get("date_created")?,
            });
        }
        Ok(out)
    }
}
