use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::entities::{
    Collection, Credential, DeliveryMechanism, Hold, Library, LicensePool,
    LicensePoolDeliveryMechanism, Loan, Patron,
};
use crate::domain::reconcile::{HoldReconciliation, LoanReconciliation, ReconciliationPlan};
use crate::domain::records::DeliveryMechanismInfo;
use crate::domain::value_objects::{
    rights_uri_is_open_access, CollectionId, DeliveryMechanismId, HoldId, Identifier, LibraryId,
    LicensePoolId, LoanId, LpdmId, PatronId,
};
use crate::domain::views::{HoldView, LoanView};
use crate::ports::circulation_store::{CirculationStore, HoldCommit, LoanCommit, Result};

#[derive(Default)]
struct StoreInner {
    libraries: HashMap<LibraryId, Library>,
    patrons: HashMap<PatronId, Patron>,
    collections: HashMap<CollectionId, Collection>,
    pools: HashMap<LicensePoolId, LicensePool>,
    loans: HashMap<LoanId, Loan>,
    holds: HashMap<HoldId, Hold>,
    credentials: Vec<Credential>,
}

impl StoreInner {
    fn loan_for(&self, patron: PatronId, pool: LicensePoolId) -> Option<&Loan> {
        self.loans
            .values()
            .find(|loan| loan.patron_id == patron && loan.license_pool_id == pool)
    }

    fn hold_for(&self, patron: PatronId, pool: LicensePoolId) -> Option<&Hold> {
        self.holds
            .values()
            .find(|hold| hold.patron_id == patron && hold.license_pool_id == pool)
    }

    fn clear_sync_stamp(&mut self, patron: PatronId) {
        if let Some(patron) = self.patrons.get_mut(&patron) {
            patron.last_loan_activity_sync = None;
        }
    }

    /// Resolve the pool for a remote record, creating it if this is the
    /// first time we hear about the title.
    fn pool_for_remote(
        &mut self,
        collection_id: CollectionId,
        data_source: &str,
        identifier: &Identifier,
    ) -> LicensePoolId {
        if let Some(pool) = self.pools.values().find(|pool| {
            pool.collection_id == collection_id
                && pool.data_source == data_source
                && pool.identifier == *identifier
        }) {
            return pool.id;
        }
        let pool = LicensePool {
            id: LicensePoolId::new(),
            collection_id,
            data_source: data_source.to_string(),
            identifier: identifier.clone(),
            open_access: false,
            unlimited_access: false,
            licenses_owned: 0,
            licenses_available: 0,
            patrons_in_hold_queue: 0,
            delivery_mechanisms: Vec::new(),
        };
        let id = pool.id;
        self.pools.insert(id, pool);
        id
    }

    /// Apply a locked-to delivery mechanism report to a loan, creating the
    /// delivery mechanism and the LPDM on the loan's pool if necessary.
    fn apply_locked_mechanism(&mut self, loan_id: LoanId, info: &DeliveryMechanismInfo) {
        let Some(loan) = self.loans.get(&loan_id).cloned() else {
            return;
        };
        // If the loan is already bound to this mechanism, the work has
        // already been done.
        if let Some(current_id) = loan.fulfillment_id {
            let already_bound = self
                .pools
                .values()
                .flat_map(|pool| &pool.delivery_mechanisms)
                .any(|lpdm| {
                    lpdm.id == current_id
                        && lpdm.mechanism.content_type == info.content_type
                        && lpdm.mechanism.drm_scheme == info.drm_scheme
                });
            if already_bound {
                return;
            }
        }
        let Some(pool) = self.pools.get_mut(&loan.license_pool_id) else {
            return;
        };
        let lpdm_id = match pool.delivery_mechanisms.iter().find(|lpdm| {
            lpdm.mechanism.content_type == info.content_type
                && lpdm.mechanism.drm_scheme == info.drm_scheme
        }) {
            Some(lpdm) => lpdm.id,
            None => {
                let lpdm = LicensePoolDeliveryMechanism {
                    id: LpdmId::new(),
                    license_pool_id: pool.id,
                    data_source: pool.data_source.clone(),
                    identifier: pool.identifier.clone(),
                    mechanism: DeliveryMechanism {
                        id: DeliveryMechanismId::new(),
                        content_type: info.content_type.clone(),
                        drm_scheme: info.drm_scheme.clone(),
                    },
                    rights_uri: info.rights_uri.clone(),
                    resource: info.resource.clone(),
                };
                let id = lpdm.id;
                // An open-access mechanism with a resource makes the whole
                // pool open access.
                if info.resource.is_some()
                    && info
                        .rights_uri
                        .as_deref()
                        .is_some_and(rights_uri_is_open_access)
                {
                    pool.open_access = true;
                }
                pool.delivery_mechanisms.push(lpdm);
                id
            }
        };
        if let Some(loan) = self.loans.get_mut(&loan_id) {
            loan.fulfillment_id = Some(lpdm_id);
        }
    }

    fn upsert_loan(&mut self, patron: PatronId, reconciliation: &LoanReconciliation) -> LoanId {
        match reconciliation.existing {
            Some(id) => {
                if let Some(loan) = self.loans.get_mut(&id) {
                    if let Some(start) = reconciliation.start {
                        loan.start = Some(start);
                    }
                    if let Some(end) = reconciliation.end {
                        loan.end = Some(end);
                    }
                    if reconciliation.external_identifier.is_some() {
                        loan.external_identifier = reconciliation.external_identifier.clone();
                    }
                }
                id
            }
            None => {
                let pool_id = self.pool_for_remote(
                    reconciliation.collection_id,
                    &reconciliation.data_source,
                    &reconciliation.identifier,
                );
                let loan = Loan {
                    id: LoanId::new(),
                    patron_id: patron,
                    license_pool_id: pool_id,
                    start: reconciliation.start,
                    end: reconciliation.end,
                    fulfillment_id: None,
                    external_identifier: reconciliation.external_identifier.clone(),
                };
                let id = loan.id;
                self.loans.insert(id, loan);
                id
            }
        }
    }

    fn upsert_hold(&mut self, patron: PatronId, reconciliation: &HoldReconciliation) -> HoldId {
        match reconciliation.existing {
            Some(id) => {
                if let Some(hold) = self.holds.get_mut(&id) {
                    if let Some(start) = reconciliation.start {
                        hold.start = Some(start);
                    }
                    if let Some(end) = reconciliation.end {
                        hold.end = Some(end);
                    }
                    hold.position = reconciliation.position;
                    if reconciliation.external_identifier.is_some() {
                        hold.external_identifier = reconciliation.external_identifier.clone();
                    }
                }
                id
            }
            None => {
                let pool_id = self.pool_for_remote(
                    reconciliation.collection_id,
                    &reconciliation.data_source,
                    &reconciliation.identifier,
                );
                let hold = Hold {
                    id: HoldId::new(),
                    patron_id: patron,
                    license_pool_id: pool_id,
                    start: reconciliation.start,
                    end: reconciliation.end,
                    position: reconciliation.position,
                    external_identifier: reconciliation.external_identifier.clone(),
                };
                let id = hold.id;
                self.holds.insert(id, hold);
                id
            }
        }
    }
}

/// In-memory implementation of CirculationStore.
///
/// Backs the integration tests and doubles as the reference implementation
/// for the composite atomic operations: every mutation happens under one
/// mutex acquisition, which gives the same all-or-nothing visibility the
/// Postgres adapter gets from a transaction with a savepoint.
#[derive(Default)]
pub struct InMemoryCirculationStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryCirculationStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Seeding helpers for tests
    // ------------------------------------------------------------------

    pub fn insert_library(&self, library: Library) {
        self.inner
            .lock()
            .unwrap()
            .libraries
            .insert(library.id, library);
    }

    pub fn insert_patron(&self, patron: Patron) {
        self.inner.lock().unwrap().patrons.insert(patron.id, patron);
    }

    pub fn insert_collection(&self, collection: Collection) {
        self.inner
            .lock()
            .unwrap()
            .collections
            .insert(collection.id, collection);
    }

    pub fn insert_pool(&self, pool: LicensePool) {
        self.inner.lock().unwrap().pools.insert(pool.id, pool);
    }

    pub fn insert_loan(&self, loan: Loan) {
        self.inner.lock().unwrap().loans.insert(loan.id, loan);
    }

    pub fn insert_hold(&self, hold: Hold) {
        self.inner.lock().unwrap().holds.insert(hold.id, hold);
    }

    /// Number of loan rows across all patrons (test assertions).
    pub fn loan_count(&self) -> usize {
        self.inner.lock().unwrap().loans.len()
    }

    pub fn hold_count(&self) -> usize {
        self.inner.lock().unwrap().holds.len()
    }
}

#[async_trait]
impl CirculationStore for InMemoryCirculationStore {
    async fn patron(&self, id: PatronId) -> Result<Option<Patron>> {
        Ok(self.inner.lock().unwrap().patrons.get(&id).cloned())
    }

    async fn library(&self, id: LibraryId) -> Result<Option<Library>> {
        Ok(self.inner.lock().unwrap().libraries.get(&id).cloned())
    }

    async fn collections_for_library(&self, id: LibraryId) -> Result<Vec<Collection>> {
        let inner = self.inner.lock().unwrap();
        let mut collections: Vec<Collection> = inner
            .collections
            .values()
            .filter(|collection| collection.library_id == id)
            .cloned()
            .collect();
        collections.sort_by_key(|collection| collection.id.value());
        Ok(collections)
    }

    async fn license_pool(&self, id: LicensePoolId) -> Result<Option<LicensePool>> {
        Ok(self.inner.lock().unwrap().pools.get(&id).cloned())
    }

    async fn delivery_mechanism(
        &self,
        id: LpdmId,
    ) -> Result<Option<LicensePoolDeliveryMechanism>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .pools
            .values()
            .flat_map(|pool| &pool.delivery_mechanisms)
            .find(|lpdm| lpdm.id == id)
            .cloned())
    }

    async fn loan_for(&self, patron: PatronId, pool: LicensePoolId) -> Result<Option<Loan>> {
        Ok(self.inner.lock().unwrap().loan_for(patron, pool).cloned())
    }

    async fn hold_for(&self, patron: PatronId, pool: LicensePoolId) -> Result<Option<Hold>> {
        Ok(self.inner.lock().unwrap().hold_for(patron, pool).cloned())
    }

    async fn patron_loans(&self, patron: PatronId) -> Result<Vec<LoanView>> {
        let inner = self.inner.lock().unwrap();
        let mut views = Vec::new();
        for loan in inner.loans.values() {
            if loan.patron_id != patron {
                continue;
            }
            let Some(pool) = inner.pools.get(&loan.license_pool_id) else {
                continue;
            };
            views.push(LoanView {
                loan: loan.clone(),
                collection_id: pool.collection_id,
                identifier: pool.identifier.clone(),
                open_access: pool.open_access,
            });
        }
        Ok(views)
    }

    async fn patron_holds(&self, patron: PatronId) -> Result<Vec<HoldView>> {
        let inner = self.inner.lock().unwrap();
        let mut views = Vec::new();
        for hold in inner.holds.values() {
            if hold.patron_id != patron {
                continue;
            }
            let Some(pool) = inner.pools.get(&hold.license_pool_id) else {
                continue;
            };
            views.push(HoldView {
                hold: hold.clone(),
                collection_id: pool.collection_id,
                identifier: pool.identifier.clone(),
            });
        }
        Ok(views)
    }

    async fn commit_loan(
        &self,
        patron: PatronId,
        pool: LicensePoolId,
        commit: LoanCommit,
    ) -> Result<(Loan, bool)> {
        let mut inner = self.inner.lock().unwrap();
        let existing_id = inner.loan_for(patron, pool).map(|loan| loan.id);
        let (loan_id, is_new) = match existing_id {
            Some(id) => {
                let loan = inner.loans.get_mut(&id).expect("loan id just looked up");
                if let Some(start) = commit.start {
                    loan.start = Some(start);
                }
                loan.end = commit.end;
                if commit.external_identifier.is_some() {
                    loan.external_identifier = commit.external_identifier.clone();
                }
                if commit.fulfillment.is_some() {
                    loan.fulfillment_id = commit.fulfillment;
                }
                (id, false)
            }
            None => {
                let loan = Loan {
                    id: LoanId::new(),
                    patron_id: patron,
                    license_pool_id: pool,
                    start: commit.start,
                    end: commit.end,
                    fulfillment_id: commit.fulfillment,
                    external_identifier: commit.external_identifier.clone(),
                };
                let id = loan.id;
                inner.loans.insert(id, loan);
                (id, true)
            }
        };
        // The book was on hold, and now we have a loan: delete the hold.
        if let Some(hold_id) = inner.hold_for(patron, pool).map(|hold| hold.id) {
            inner.holds.remove(&hold_id);
        }
        inner.clear_sync_stamp(patron);
        Ok((inner.loans[&loan_id].clone(), is_new))
    }

    async fn commit_hold(
        &self,
        patron: PatronId,
        pool: LicensePoolId,
        commit: HoldCommit,
    ) -> Result<(Hold, bool)> {
        let mut inner = self.inner.lock().unwrap();
        let existing_id = inner.hold_for(patron, pool).map(|hold| hold.id);
        let (hold_id, is_new) = match existing_id {
            Some(id) => {
                let hold = inner.holds.get_mut(&id).expect("hold id just looked up");
                if let Some(start) = commit.start {
                    hold.start = Some(start);
                }
                hold.end = commit.end;
                hold.position = commit.position;
                if commit.external_identifier.is_some() {
                    hold.external_identifier = commit.external_identifier.clone();
                }
                (id, false)
            }
            None => {
                let hold = Hold {
                    id: HoldId::new(),
                    patron_id: patron,
                    license_pool_id: pool,
                    start: commit.start,
                    end: commit.end,
                    position: commit.position,
                    external_identifier: commit.external_identifier.clone(),
                };
                let id = hold.id;
                inner.holds.insert(id, hold);
                (id, true)
            }
        };
        // Going from a loan to a hold is rare, but we do check for it.
        if let Some(loan_id) = inner.loan_for(patron, pool).map(|loan| loan.id) {
            inner.loans.remove(&loan_id);
        }
        inner.clear_sync_stamp(patron);
        Ok((inner.holds[&hold_id].clone(), is_new))
    }

    async fn delete_loan(&self, patron: PatronId, pool: LicensePoolId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(loan_id) = inner.loan_for(patron, pool).map(|loan| loan.id) {
            inner.loans.remove(&loan_id);
        }
        inner.clear_sync_stamp(patron);
        Ok(())
    }

    async fn delete_hold(&self, patron: PatronId, pool: LicensePoolId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(hold_id) = inner.hold_for(patron, pool).map(|hold| hold.id) {
            inner.holds.remove(&hold_id);
        }
        inner.clear_sync_stamp(patron);
        Ok(())
    }

    async fn set_loan_fulfillment(&self, loan: LoanId, fulfillment: LpdmId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(loan) = inner.loans.get_mut(&loan) {
            loan.fulfillment_id = Some(fulfillment);
        }
        Ok(())
    }

    async fn apply_reconciliation(
        &self,
        patron: PatronId,
        plan: ReconciliationPlan,
        stamp: Option<DateTime<Utc>>,
    ) -> Result<(Vec<Loan>, Vec<Hold>)> {
        let mut inner = self.inner.lock().unwrap();
        let mut active_loans = Vec::new();
        let mut active_holds = Vec::new();

        for reconciliation in &plan.loan_upserts {
            let loan_id = inner.upsert_loan(patron, reconciliation);
            if let Some(locked_to) = &reconciliation.locked_to {
                inner.apply_locked_mechanism(loan_id, locked_to);
            }
            if let Some(loan) = inner.loans.get(&loan_id) {
                active_loans.push(loan.clone());
            }
        }
        for reconciliation in &plan.hold_upserts {
            let hold_id = inner.upsert_hold(patron, reconciliation);
            if let Some(hold) = inner.holds.get(&hold_id) {
                active_holds.push(hold.clone());
            }
        }
        for loan_id in &plan.delete_loans {
            inner.loans.remove(loan_id);
        }
        for hold_id in &plan.delete_holds {
            inner.holds.remove(hold_id);
        }
        if let Some(patron) = inner.patrons.get_mut(&patron) {
            patron.last_loan_activity_sync = stamp;
        }
        Ok((active_loans, active_holds))
    }

    async fn set_last_loan_activity_sync(
        &self,
        patron: PatronId,
        value: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(patron) = inner.patrons.get_mut(&patron) {
            patron.last_loan_activity_sync = value;
        }
        Ok(())
    }

    async fn update_pool_availability(
        &self,
        pool: LicensePoolId,
        licenses_owned: i32,
        licenses_available: i32,
        patrons_in_hold_queue: i32,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pool) = inner.pools.get_mut(&pool) {
            pool.licenses_owned = licenses_owned;
            pool.licenses_available = licenses_available;
            pool.patrons_in_hold_queue = patrons_in_hold_queue;
        }
        Ok(())
    }

    async fn credential(
        &self,
        data_source: &str,
        credential_type: &str,
        collection: Option<CollectionId>,
        patron: Option<PatronId>,
    ) -> Result<Option<Credential>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .credentials
            .iter()
            .find(|credential| {
                credential.data_source == data_source
                    && credential.credential_type == credential_type
                    && credential.collection_id == collection
                    && credential.patron_id == patron
            })
            .cloned())
    }

    async fn store_credential(&self, credential: Credential) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.credentials.retain(|existing| {
            !(existing.data_source == credential.data_source
                && existing.credential_type == credential.credential_type
                && existing.collection_id == credential.collection_id
                && existing.patron_id == credential.patron_id)
        });
        inner.credentials.push(credential);
        Ok(())
    }
}
