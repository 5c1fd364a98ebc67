use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Acquire, PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::domain::entities::{
    Collection, Credential, DeliveryMechanism, Hold, Library, LibrarySettings, LicensePool,
    LicensePoolDeliveryMechanism, Loan, Patron, Resource,
};
use crate::domain::reconcile::{HoldReconciliation, LoanReconciliation, ReconciliationPlan};
use crate::domain::records::DeliveryMechanismInfo;
use crate::domain::value_objects::{
    rights_uri_is_open_access, CollectionId, DeliveryMechanismId, HoldId, Identifier, LibraryId,
    LicensePoolId, LoanId, LpdmId, PatronId,
};
use crate::domain::views::{HoldView, LoanView};
use crate::ports::circulation_store::{CirculationStore, HoldCommit, LoanCommit, Result};

/// PostgreSQL implementation of CirculationStore.
///
/// Each composite mutation runs inside a transaction with a savepoint, so
/// that a failure halfway through (say, deleting the promoted hold after
/// upserting the loan) rolls the whole operation back. The loan/hold
/// uniqueness constraints on (patron_id, license_pool_id) are authoritative
/// under concurrency; a constraint violation surfaces to the caller.
pub struct PostgresCirculationStore {
    pool: PgPool,
}

impl PostgresCirculationStore {
    /// Create a store backed by a PostgreSQL connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_patron(row: &PgRow) -> Result<Patron> {
        Ok(Patron {
            id: PatronId::from_uuid(row.get("id")),
            library_id: LibraryId::from_uuid(row.get("library_id")),
            authorization_identifier: row.get("authorization_identifier"),
            authorization_expires: row.get("authorization_expires"),
            fines: row.get("fines"),
            block_reason: row.get("block_reason"),
            neighborhood: row.get("neighborhood"),
            external_type: row.get("external_type"),
            last_loan_activity_sync: row.get("last_loan_activity_sync"),
        })
    }

    fn row_to_library(row: &PgRow) -> Result<Library> {
        let settings: serde_json::Value = row.get("settings");
        let settings: LibrarySettings = serde_json::from_value(settings)?;
        Ok(Library {
            id: LibraryId::from_uuid(row.get("id")),
            name: row.get("name"),
            settings,
        })
    }

    fn row_to_collection(row: &PgRow) -> Collection {
        Collection {
            id: CollectionId::new(row.get::<i64, _>("id")),
            library_id: LibraryId::from_uuid(row.get("library_id")),
            name: row.get("name"),
            protocol: row.get("protocol"),
            integration_configuration: row.get("integration_configuration"),
        }
    }

    fn row_to_loan(row: &PgRow) -> Loan {
        Loan {
            id: LoanId::from_uuid(row.get("id")),
            patron_id: PatronId::from_uuid(row.get("patron_id")),
            license_pool_id: LicensePoolId::from_uuid(row.get("license_pool_id")),
            start: row.get("start_date"),
            end: row.get("end_date"),
            fulfillment_id: row
                .get::<Option<Uuid>, _>("fulfillment_id")
                .map(LpdmId::from_uuid),
            external_identifier: row.get("external_identifier"),
        }
    }

    fn row_to_hold(row: &PgRow) -> Hold {
        Hold {
            id: HoldId::from_uuid(row.get("id")),
            patron_id: PatronId::from_uuid(row.get("patron_id")),
            license_pool_id: LicensePoolId::from_uuid(row.get("license_pool_id")),
            start: row.get("start_date"),
            end: row.get("end_date"),
            position: row
                .get::<Option<i32>, _>("hold_position")
                .map(|position| position as u32),
            external_identifier: row.get("external_identifier"),
        }
    }

    fn row_to_lpdm(row: &PgRow) -> Result<LicensePoolDeliveryMechanism> {
        let resource: Option<serde_json::Value> = row.get("resource");
        let resource: Option<Resource> = match resource {
            Some(value) => Some(serde_json::from_value(value)?),
            None => None,
        };
        Ok(LicensePoolDeliveryMechanism {
            id: LpdmId::from_uuid(row.get("id")),
            license_pool_id: LicensePoolId::from_uuid(row.get("license_pool_id")),
            data_source: row.get("data_source"),
            identifier: Identifier::new(
                row.get::<String, _>("identifier_type"),
                row.get::<String, _>("identifier"),
            ),
            mechanism: DeliveryMechanism {
                id: DeliveryMechanismId::from_uuid(row.get("delivery_mechanism_id")),
                content_type: row.get("content_type"),
                drm_scheme: row.get("drm_scheme"),
            },
            rights_uri: row.get("rights_uri"),
            resource,
        })
    }

    async fn load_pool_mechanisms(
        conn: &mut PgConnection,
        pool: LicensePoolId,
    ) -> Result<Vec<LicensePoolDeliveryMechanism>> {
        let rows = sqlx::query(
            r#"
            SELECT lpdm.id, lpdm.license_pool_id, lpdm.data_source,
                   lpdm.identifier_type, lpdm.identifier,
                   lpdm.delivery_mechanism_id, dm.content_type, dm.drm_scheme,
                   lpdm.rights_uri, lpdm.resource
            FROM license_pool_delivery_mechanisms lpdm
            JOIN delivery_mechanisms dm ON dm.id = lpdm.delivery_mechanism_id
            WHERE lpdm.license_pool_id = $1
            "#,
        )
        .bind(pool.value())
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(Self::row_to_lpdm).collect()
    }

    async fn load_pool(
        conn: &mut PgConnection,
        id: LicensePoolId,
    ) -> Result<Option<LicensePool>> {
        let row = sqlx::query(
            r#"
            SELECT id, collection_id, data_source, identifier_type, identifier,
                   open_access, unlimited_access, licenses_owned,
                   licenses_available, patrons_in_hold_queue
            FROM license_pools
            WHERE id = $1
            "#,
        )
        .bind(id.value())
        .fetch_optional(&mut *conn)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mechanisms = Self::load_pool_mechanisms(conn, id).await?;
        Ok(Some(LicensePool {
            id,
            collection_id: CollectionId::new(row.get::<i64, _>("collection_id")),
            data_source: row.get("data_source"),
            identifier: Identifier::new(
                row.get::<String, _>("identifier_type"),
                row.get::<String, _>("identifier"),
            ),
            open_access: row.get("open_access"),
            unlimited_access: row.get("unlimited_access"),
            licenses_owned: row.get("licenses_owned"),
            licenses_available: row.get("licenses_available"),
            patrons_in_hold_queue: row.get("patrons_in_hold_queue"),
            delivery_mechanisms: mechanisms,
        }))
    }

    async fn clear_sync_stamp(conn: &mut PgConnection, patron: PatronId) -> Result<()> {
        sqlx::query("UPDATE patrons SET last_loan_activity_sync = NULL WHERE id = $1")
            .bind(patron.value())
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Get-or-create a delivery mechanism for a (content type, DRM scheme)
    /// combination.
    async fn ensure_delivery_mechanism(
        conn: &mut PgConnection,
        content_type: Option<&str>,
        drm_scheme: Option<&str>,
    ) -> Result<Uuid> {
        let existing = sqlx::query(
            r#"
            SELECT id FROM delivery_mechanisms
            WHERE COALESCE(content_type, '') = COALESCE($1, '')
              AND COALESCE(drm_scheme, '') = COALESCE($2, '')
            "#,
        )
        .bind(content_type)
        .bind(drm_scheme)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(row) = existing {
            return Ok(row.get("id"));
        }
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO delivery_mechanisms (id, content_type, drm_scheme) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(content_type)
            .bind(drm_scheme)
            .execute(&mut *conn)
            .await?;
        Ok(id)
    }

    /// Get-or-create the pool a remote record refers to.
    async fn ensure_pool(
        conn: &mut PgConnection,
        collection_id: CollectionId,
        data_source: &str,
        identifier: &Identifier,
    ) -> Result<Uuid> {
        let existing = sqlx::query(
            r#"
            SELECT id FROM license_pools
            WHERE collection_id = $1 AND data_source = $2
              AND identifier_type = $3 AND identifier = $4
            "#,
        )
        .bind(collection_id.value())
        .bind(data_source)
        .bind(&identifier.identifier_type)
        .bind(&identifier.identifier)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(row) = existing {
            return Ok(row.get("id"));
        }
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO license_pools
                (id, collection_id, data_source, identifier_type, identifier)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(collection_id.value())
        .bind(data_source)
        .bind(&identifier.identifier_type)
        .bind(&identifier.identifier)
        .execute(&mut *conn)
        .await?;
        Ok(id)
    }

    /// Bind a loan to the delivery mechanism a vendor reports it is locked
    /// to, creating the mechanism and the LPDM if necessary.
    async fn apply_locked_mechanism(
        conn: &mut PgConnection,
        loan: LoanId,
        info: &DeliveryMechanismInfo,
    ) -> Result<()> {
        // No-op when the loan is already bound to this mechanism.
        let current = sqlx::query(
            r#"
            SELECT dm.content_type, dm.drm_scheme
            FROM loans l
            JOIN license_pool_delivery_mechanisms lpdm ON lpdm.id = l.fulfillment_id
            JOIN delivery_mechanisms dm ON dm.id = lpdm.delivery_mechanism_id
            WHERE l.id = $1
            "#,
        )
        .bind(loan.value())
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(row) = current {
            let content_type: Option<String> = row.get("content_type");
            let drm_scheme: Option<String> = row.get("drm_scheme");
            if content_type == info.content_type && drm_scheme == info.drm_scheme {
                return Ok(());
            }
        }

        let loan_row = sqlx::query("SELECT license_pool_id FROM loans WHERE id = $1")
            .bind(loan.value())
            .fetch_optional(&mut *conn)
            .await?;
        let Some(loan_row) = loan_row else {
            return Ok(());
        };
        let pool_id: Uuid = loan_row.get("license_pool_id");

        let mechanism_id = Self::ensure_delivery_mechanism(
            conn,
            info.content_type.as_deref(),
            info.drm_scheme.as_deref(),
        )
        .await?;

        let existing_lpdm = sqlx::query(
            r#"
            SELECT id FROM license_pool_delivery_mechanisms
            WHERE license_pool_id = $1 AND delivery_mechanism_id = $2
            "#,
        )
        .bind(pool_id)
        .bind(mechanism_id)
        .fetch_optional(&mut *conn)
        .await?;
        let lpdm_id = match existing_lpdm {
            Some(row) => row.get::<Uuid, _>("id"),
            None => {
                let id = Uuid::new_v4();
                let resource = match &info.resource {
                    Some(resource) => Some(serde_json::to_value(resource)?),
                    None => None,
                };
                sqlx::query(
                    r#"
                    INSERT INTO license_pool_delivery_mechanisms
                        (id, license_pool_id, delivery_mechanism_id, data_source,
                         identifier_type, identifier, rights_uri, resource)
                    SELECT $1, p.id, $2, p.data_source, p.identifier_type,
                           p.identifier, $3, $4
                    FROM license_pools p
                    WHERE p.id = $5
                    "#,
                )
                .bind(id)
                .bind(mechanism_id)
                .bind(&info.rights_uri)
                .bind(resource)
                .bind(pool_id)
                .execute(&mut *conn)
                .await?;
                // An open-access mechanism with a resource makes the pool
                // itself open access.
                if info.resource.is_some()
                    && info
                        .rights_uri
                        .as_deref()
                        .is_some_and(rights_uri_is_open_access)
                {
                    sqlx::query("UPDATE license_pools SET open_access = TRUE WHERE id = $1")
                        .bind(pool_id)
                        .execute(&mut *conn)
                        .await?;
                }
                id
            }
        };

        sqlx::query("UPDATE loans SET fulfillment_id = $1 WHERE id = $2")
            .bind(lpdm_id)
            .bind(loan.value())
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn upsert_loan(
        conn: &mut PgConnection,
        patron: PatronId,
        reconciliation: &LoanReconciliation,
    ) -> Result<Uuid> {
        match reconciliation.existing {
            Some(id) => {
                sqlx::query(
                    r#"
                    UPDATE loans SET
                        start_date = COALESCE($1, start_date),
                        end_date = COALESCE($2, end_date),
                        external_identifier = COALESCE($3, external_identifier)
                    WHERE id = $4
                    "#,
                )
                .bind(reconciliation.start)
                .bind(reconciliation.end)
                .bind(&reconciliation.external_identifier)
                .bind(id.value())
                .execute(conn)
                .await?;
                Ok(id.value())
            }
            None => {
                let pool_id = Self::ensure_pool(
                    conn,
                    reconciliation.collection_id,
                    &reconciliation.data_source,
                    &reconciliation.identifier,
                )
                .await?;
                let id = Uuid::new_v4();
                sqlx::query(
                    r#"
                    INSERT INTO loans
                        (id, patron_id, license_pool_id, start_date, end_date,
                         external_identifier)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(id)
                .bind(patron.value())
                .bind(pool_id)
                .bind(reconciliation.start)
                .bind(reconciliation.end)
                .bind(&reconciliation.external_identifier)
                .execute(conn)
                .await?;
                Ok(id)
            }
        }
    }

    async fn upsert_hold(
        conn: &mut PgConnection,
        patron: PatronId,
        reconciliation: &HoldReconciliation,
    ) -> Result<Uuid> {
        match reconciliation.existing {
            Some(id) => {
                sqlx::query(
                    r#"
                    UPDATE holds SET
                        start_date = COALESCE($1, start_date),
                        end_date = COALESCE($2, end_date),
                        hold_position = $3,
                        external_identifier = COALESCE($4, external_identifier)
                    WHERE id = $5
                    "#,
                )
                .bind(reconciliation.start)
                .bind(reconciliation.end)
                .bind(reconciliation.position.map(|position| position as i32))
                .bind(&reconciliation.external_identifier)
                .bind(id.value())
                .execute(conn)
                .await?;
                Ok(id.value())
            }
            None => {
                let pool_id = Self::ensure_pool(
                    conn,
                    reconciliation.collection_id,
                    &reconciliation.data_source,
                    &reconciliation.identifier,
                )
                .await?;
                let id = Uuid::new_v4();
                sqlx::query(
                    r#"
                    INSERT INTO holds
                        (id, patron_id, license_pool_id, start_date, end_date,
                         hold_position, external_identifier)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    "#,
                )
                .bind(id)
                .bind(patron.value())
                .bind(pool_id)
                .bind(reconciliation.start)
                .bind(reconciliation.end)
                .bind(reconciliation.position.map(|position| position as i32))
                .bind(&reconciliation.external_identifier)
                .execute(conn)
                .await?;
                Ok(id)
            }
        }
    }
}

#[async_trait]
impl CirculationStore for PostgresCirculationStore {
    async fn patron(&self, id: PatronId) -> Result<Option<Patron>> {
        let row = sqlx::query("SELECT * FROM patrons WHERE id = $1")
            .bind(id.value())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_patron).transpose()
    }

    async fn library(&self, id: LibraryId) -> Result<Option<Library>> {
        let row = sqlx::query("SELECT id, name, settings FROM libraries WHERE id = $1")
            .bind(id.value())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_library).transpose()
    }

    async fn collections_for_library(&self, id: LibraryId) -> Result<Vec<Collection>> {
        let rows = sqlx::query(
            r#"
            SELECT id, library_id, name, protocol, integration_configuration
            FROM collections
            WHERE library_id = $1
            ORDER BY id
            "#,
        )
        .bind(id.value())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::row_to_collection).collect())
    }

    async fn license_pool(&self, id: LicensePoolId) -> Result<Option<LicensePool>> {
        let mut conn = self.pool.acquire().await?;
        Self::load_pool(&mut conn, id).await
    }

    async fn delivery_mechanism(
        &self,
        id: LpdmId,
    ) -> Result<Option<LicensePoolDeliveryMechanism>> {
        let row = sqlx::query(
            r#"
            SELECT lpdm.id, lpdm.license_pool_id, lpdm.data_source,
                   lpdm.identifier_type, lpdm.identifier,
                   lpdm.delivery_mechanism_id, dm.content_type, dm.drm_scheme,
                   lpdm.rights_uri, lpdm.resource
            FROM license_pool_delivery_mechanisms lpdm
            JOIN delivery_mechanisms dm ON dm.id = lpdm.delivery_mechanism_id
            WHERE lpdm.id = $1
            "#,
        )
        .bind(id.value())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_lpdm).transpose()
    }

    async fn loan_for(&self, patron: PatronId, pool: LicensePoolId) -> Result<Option<Loan>> {
        let row = sqlx::query(
            "SELECT * FROM loans WHERE patron_id = $1 AND license_pool_id = $2",
        )
        .bind(patron.value())
        .bind(pool.value())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::row_to_loan))
    }

    async fn hold_for(&self, patron: PatronId, pool: LicensePoolId) -> Result<Option<Hold>> {
        let row = sqlx::query(
            "SELECT * FROM holds WHERE patron_id = $1 AND license_pool_id = $2",
        )
        .bind(patron.value())
        .bind(pool.value())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::row_to_hold))
    }

    async fn patron_loans(&self, patron: PatronId) -> Result<Vec<LoanView>> {
        let rows = sqlx::query(
            r#"
            SELECT l.id, l.patron_id, l.license_pool_id, l.start_date,
                   l.end_date, l.fulfillment_id, l.external_identifier,
                   p.collection_id, p.identifier_type, p.identifier,
                   p.open_access
            FROM loans l
            JOIN license_pools p ON p.id = l.license_pool_id
            WHERE l.patron_id = $1
            "#,
        )
        .bind(patron.value())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| LoanView {
                loan: Self::row_to_loan(row),
                collection_id: CollectionId::new(row.get::<i64, _>("collection_id")),
                identifier: Identifier::new(
                    row.get::<String, _>("identifier_type"),
                    row.get::<String, _>("identifier"),
                ),
                open_access: row.get("open_access"),
            })
            .collect())
    }

    async fn patron_holds(&self, patron: PatronId) -> Result<Vec<HoldView>> {
        let rows = sqlx::query(
            r#"
            SELECT h.id, h.patron_id, h.license_pool_id, h.start_date,
                   h.end_date, h.hold_position, h.external_identifier,
                   p.collection_id, p.identifier_type, p.identifier
            FROM holds h
            JOIN license_pools p ON p.id = h.license_pool_id
            WHERE h.patron_id = $1
            "#,
        )
        .bind(patron.value())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| HoldView {
                hold: Self::row_to_hold(row),
                collection_id: CollectionId::new(row.get::<i64, _>("collection_id")),
                identifier: Identifier::new(
                    row.get::<String, _>("identifier_type"),
                    row.get::<String, _>("identifier"),
                ),
            })
            .collect())
    }

    async fn commit_loan(
        &self,
        patron: PatronId,
        pool: LicensePoolId,
        commit: LoanCommit,
    ) -> Result<(Loan, bool)> {
        let mut tx = self.pool.begin().await?;
        let mut savepoint = tx.begin().await?;

        let existing = sqlx::query(
            "SELECT id FROM loans WHERE patron_id = $1 AND license_pool_id = $2 FOR UPDATE",
        )
        .bind(patron.value())
        .bind(pool.value())
        .fetch_optional(&mut *savepoint)
        .await?;

        let (loan_id, is_new) = match existing {
            Some(row) => {
                let id: Uuid = row.get("id");
                sqlx::query(
                    r#"
                    UPDATE loans SET
                        start_date = COALESCE($1, start_date),
                        end_date = $2,
                        external_identifier = COALESCE($3, external_identifier),
                        fulfillment_id = COALESCE($4, fulfillment_id)
                    WHERE id = $5
                    "#,
                )
                .bind(commit.start)
                .bind(commit.end)
                .bind(&commit.external_identifier)
                .bind(commit.fulfillment.map(|f| f.value()))
                .bind(id)
                .execute(&mut *savepoint)
                .await?;
                (id, false)
            }
            None => {
                let id = Uuid::new_v4();
                sqlx::query(
                    r#"
                    INSERT INTO loans
                        (id, patron_id, license_pool_id, start_date, end_date,
                         fulfillment_id, external_identifier)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    "#,
                )
                .bind(id)
                .bind(patron.value())
                .bind(pool.value())
                .bind(commit.start)
                .bind(commit.end)
                .bind(commit.fulfillment.map(|f| f.value()))
                .bind(&commit.external_identifier)
                .execute(&mut *savepoint)
                .await?;
                (id, true)
            }
        };

        // The book was on hold, and now we have a loan: delete the hold.
        sqlx::query("DELETE FROM holds WHERE patron_id = $1 AND license_pool_id = $2")
            .bind(patron.value())
            .bind(pool.value())
            .execute(&mut *savepoint)
            .await?;
        Self::clear_sync_stamp(&mut savepoint, patron).await?;

        let row = sqlx::query("SELECT * FROM loans WHERE id = $1")
            .bind(loan_id)
            .fetch_one(&mut *savepoint)
            .await?;
        let loan = Self::row_to_loan(&row);

        savepoint.commit().await?;
        tx.commit().await?;
        Ok((loan, is_new))
    }

    async fn commit_hold(
        &self,
        patron: PatronId,
        pool: LicensePoolId,
        commit: HoldCommit,
    ) -> Result<(Hold, bool)> {
        let mut tx = self.pool.begin().await?;
        let mut savepoint = tx.begin().await?;

        let existing = sqlx::query(
            "SELECT id FROM holds WHERE patron_id = $1 AND license_pool_id = $2 FOR UPDATE",
        )
        .bind(patron.value())
        .bind(pool.value())
        .fetch_optional(&mut *savepoint)
        .await?;

        let (hold_id, is_new) = match existing {
            Some(row) => {
                let id: Uuid = row.get("id");
                sqlx::query(
                    r#"
                    UPDATE holds SET
                        start_date = COALESCE($1, start_date),
                        end_date = $2,
                        hold_position = $3,
                        external_identifier = COALESCE($4, external_identifier)
                    WHERE id = $5
                    "#,
                )
                .bind(commit.start)
                .bind(commit.end)
                .bind(commit.position.map(|position| position as i32))
                .bind(&commit.external_identifier)
                .bind(id)
                .execute(&mut *savepoint)
                .await?;
                (id, false)
            }
            None => {
                let id = Uuid::new_v4();
                sqlx::query(
                    r#"
                    INSERT INTO holds
                        (id, patron_id, license_pool_id, start_date, end_date,
                         hold_position, external_identifier)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    "#,
                )
                .bind(id)
                .bind(patron.value())
                .bind(pool.value())
                .bind(commit.start)
                .bind(commit.end)
                .bind(commit.position.map(|position| position as i32))
                .bind(&commit.external_identifier)
                .execute(&mut *savepoint)
                .await?;
                (id, true)
            }
        };

        // Going from a loan to a hold is rare, but we do check for it.
        sqlx::query("DELETE FROM loans WHERE patron_id = $1 AND license_pool_id = $2")
            .bind(patron.value())
            .bind(pool.value())
            .execute(&mut *savepoint)
            .await?;
        Self::clear_sync_stamp(&mut savepoint, patron).await?;

        let row = sqlx::query("SELECT * FROM holds WHERE id = $1")
            .bind(hold_id)
            .fetch_one(&mut *savepoint)
            .await?;
        let hold = Self::row_to_hold(&row);

        savepoint.commit().await?;
        tx.commit().await?;
        Ok((hold, is_new))
    }

    async fn delete_loan(&self, patron: PatronId, pool: LicensePoolId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut savepoint = tx.begin().await?;
        sqlx::query("DELETE FROM loans WHERE patron_id = $1 AND license_pool_id = $2")
            .bind(patron.value())
            .bind(pool.value())
            .execute(&mut *savepoint)
            .await?;
        Self::clear_sync_stamp(&mut savepoint, patron).await?;
        savepoint.commit().await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_hold(&self, patron: PatronId, pool: LicensePoolId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut savepoint = tx.begin().await?;
        sqlx::query("DELETE FROM holds WHERE patron_id = $1 AND license_pool_id = $2")
            .bind(patron.value())
            .bind(pool.value())
            .execute(&mut *savepoint)
            .await?;
        Self::clear_sync_stamp(&mut savepoint, patron).await?;
        savepoint.commit().await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_loan_fulfillment(&self, loan: LoanId, fulfillment: LpdmId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut savepoint = tx.begin().await?;
        sqlx::query("UPDATE loans SET fulfillment_id = $1 WHERE id = $2")
            .bind(fulfillment.value())
            .bind(loan.value())
            .execute(&mut *savepoint)
            .await?;
        savepoint.commit().await?;
        tx.commit().await?;
        Ok(())
    }

    async fn apply_reconciliation(
        &self,
        patron: PatronId,
        plan: ReconciliationPlan,
        stamp: Option<DateTime<Utc>>,
    ) -> Result<(Vec<Loan>, Vec<Hold>)> {
        let mut tx = self.pool.begin().await?;
        let mut savepoint = tx.begin().await?;

        let mut active_loans = Vec::new();
        let mut active_holds = Vec::new();

        for reconciliation in &plan.loan_upserts {
            let loan_id = Self::upsert_loan(&mut savepoint, patron, reconciliation).await?;
            if let Some(locked_to) = &reconciliation.locked_to {
                Self::apply_locked_mechanism(
                    &mut savepoint,
                    LoanId::from_uuid(loan_id),
                    locked_to,
                )
                .await?;
            }
            let row = sqlx::query("SELECT * FROM loans WHERE id = $1")
                .bind(loan_id)
                .fetch_one(&mut *savepoint)
                .await?;
            active_loans.push(Self::row_to_loan(&row));
        }
        for reconciliation in &plan.hold_upserts {
            let hold_id = Self::upsert_hold(&mut savepoint, patron, reconciliation).await?;
            let row = sqlx::query("SELECT * FROM holds WHERE id = $1")
                .bind(hold_id)
                .fetch_one(&mut *savepoint)
                .await?;
            active_holds.push(Self::row_to_hold(&row));
        }
        for loan_id in &plan.delete_loans {
            sqlx::query("DELETE FROM loans WHERE id = $1")
                .bind(loan_id.value())
                .execute(&mut *savepoint)
                .await?;
        }
        for hold_id in &plan.delete_holds {
            sqlx::query("DELETE FROM holds WHERE id = $1")
                .bind(hold_id.value())
                .execute(&mut *savepoint)
                .await?;
        }
        sqlx::query("UPDATE patrons SET last_loan_activity_sync = $1 WHERE id = $2")
            .bind(stamp)
            .bind(patron.value())
            .execute(&mut *savepoint)
            .await?;

        savepoint.commit().await?;
        tx.commit().await?;
        Ok((active_loans, active_holds))
    }

    async fn set_last_loan_activity_sync(
        &self,
        patron: PatronId,
        value: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query("UPDATE patrons SET last_loan_activity_sync = $1 WHERE id = $2")
            .bind(value)
            .bind(patron.value())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_pool_availability(
        &self,
        pool: LicensePoolId,
        licenses_owned: i32,
        licenses_available: i32,
        patrons_in_hold_queue: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE license_pools SET
                licenses_owned = $1,
                licenses_available = $2,
                patrons_in_hold_queue = $3
            WHERE id = $4
            "#,
        )
        .bind(licenses_owned)
        .bind(licenses_available)
        .bind(patrons_in_hold_queue)
        .bind(pool.value())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn credential(
        &self,
        data_source: &str,
        credential_type: &str,
        collection: Option<CollectionId>,
        patron: Option<PatronId>,
    ) -> Result<Option<Credential>> {
        let row = sqlx::query(
            r#"
            SELECT data_source, credential_type, collection_id, patron_id,
                   credential, expires
            FROM credentials
            WHERE data_source = $1 AND credential_type = $2
              AND collection_id IS NOT DISTINCT FROM $3
              AND patron_id IS NOT DISTINCT FROM $4
            "#,
        )
        .bind(data_source)
        .bind(credential_type)
        .bind(collection.map(|id| id.value()))
        .bind(patron.map(|id| id.value()))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| Credential {
            data_source: row.get("data_source"),
            credential_type: row.get("credential_type"),
            collection_id: row.get::<Option<i64>, _>("collection_id").map(CollectionId::new),
            patron_id: row.get::<Option<Uuid>, _>("patron_id").map(PatronId::from_uuid),
            credential: row.get("credential"),
            expires: row.get("expires"),
        }))
    }

    async fn store_credential(&self, credential: Credential) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            DELETE FROM credentials
            WHERE data_source = $1 AND credential_type = $2
              AND collection_id IS NOT DISTINCT FROM $3
              AND patron_id IS NOT DISTINCT FROM $4
            "#,
        )
        .bind(&credential.data_source)
        .bind(&credential.credential_type)
        .bind(credential.collection_id.map(|id| id.value()))
        .bind(credential.patron_id.map(|id| id.value()))
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            INSERT INTO credentials
                (id, data_source, credential_type, collection_id, patron_id,
                 credential, expires)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&credential.data_source)
        .bind(&credential.credential_type)
        .bind(credential.collection_id.map(|id| id.value()))
        .bind(credential.patron_id.map(|id| id.value()))
        .bind(&credential.credential)
        .bind(credential.expires)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}
