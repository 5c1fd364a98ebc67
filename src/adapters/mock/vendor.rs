use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::entities::{Collection, LicensePool, LicensePoolDeliveryMechanism, Patron};
use crate::domain::errors::{CirculationError, CirculationResult};
use crate::domain::fulfillment::Fulfillment;
use crate::domain::records::{ActivityItem, CheckoutOutcome, HoldActivity};
use crate::domain::value_objects::{CollectionId, LicensePoolId};
use crate::ports::circulation_store::CirculationStore;
use crate::ports::vendor_adapter::{
    internal_format, AdapterCapabilities, DeliveryMechanismStep, InternalFormatMap, VendorAdapter,
};

fn default_true() -> bool {
    true
}

/// Integration configuration understood by the mock vendor adapter.
///
/// Deserialized from `Collection::integration_configuration`; a malformed
/// document or an unknown `set_delivery_mechanism_at` value fails adapter
/// construction with ConfigurationError, exactly like a real vendor adapter
/// with bad credentials would.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockVendorSettings {
    /// "borrow", "fulfill" or "never"
    #[serde(default)]
    pub set_delivery_mechanism_at: Option<String>,
    #[serde(default = "default_true")]
    pub can_revoke_hold_when_reserved: bool,
    #[serde(default)]
    pub supports_patron_activity: bool,
}

impl MockVendorSettings {
    fn capabilities(&self) -> CirculationResult<AdapterCapabilities> {
        let set_delivery_mechanism_at = match self.set_delivery_mechanism_at.as_deref() {
            None | Some("fulfill") => DeliveryMechanismStep::Fulfill,
            Some("borrow") => DeliveryMechanismStep::Borrow,
            Some("never") => DeliveryMechanismStep::Never,
            Some(other) => {
                return Err(CirculationError::ConfigurationError {
                    reason: format!("unknown delivery mechanism step: {other}"),
                });
            }
        };
        Ok(AdapterCapabilities {
            set_delivery_mechanism_at,
            can_revoke_hold_when_reserved: self.can_revoke_hold_when_reserved,
            supports_patron_activity: self.supports_patron_activity,
        })
    }
}

/// Scriptable mock implementation of VendorAdapter.
///
/// Tests queue one response (or error) per operation; each call pops the
/// next queued entry. An empty queue surfaces as a remote server error so a
/// test that makes an unexpected vendor call fails loudly instead of
/// silently succeeding.
///
/// `update_availability` records every call and, when a count override was
/// scripted with `set_availability`, writes it back through the store the
/// adapter was constructed with -- the same write path a real adapter uses.
pub struct MockVendorAdapter {
    collection_id: CollectionId,
    capabilities: Mutex<AdapterCapabilities>,
    store: Option<Arc<dyn CirculationStore>>,
    format_map: Mutex<InternalFormatMap>,
    checkout_responses: Mutex<Vec<CirculationResult<CheckoutOutcome>>>,
    checkin_responses: Mutex<Vec<CirculationResult<()>>>,
    fulfill_responses: Mutex<Vec<CirculationResult<Fulfillment>>>,
    hold_responses: Mutex<Vec<CirculationResult<HoldActivity>>>,
    release_hold_responses: Mutex<Vec<CirculationResult<()>>>,
    activity_responses: Mutex<Vec<CirculationResult<Vec<ActivityItem>>>>,
    remote_activity: Mutex<Vec<ActivityItem>>,
    availability_updated_for: Mutex<Vec<LicensePoolId>>,
    availability_overrides: Mutex<Vec<(LicensePoolId, i32, i32, i32)>>,
    fulfill_without_loan: Mutex<bool>,
}

impl MockVendorAdapter {
    /// Create a mock adapter with default capabilities and no store handle.
    pub fn new(collection_id: CollectionId) -> Self {
        Self {
            collection_id,
            capabilities: Mutex::new(AdapterCapabilities::default()),
            store: None,
            format_map: Mutex::new(InternalFormatMap::new()),
            checkout_responses: Mutex::new(Vec::new()),
            checkin_responses: Mutex::new(Vec::new()),
            fulfill_responses: Mutex::new(Vec::new()),
            hold_responses: Mutex::new(Vec::new()),
            release_hold_responses: Mutex::new(Vec::new()),
            activity_responses: Mutex::new(Vec::new()),
            remote_activity: Mutex::new(Vec::new()),
            availability_updated_for: Mutex::new(Vec::new()),
            availability_overrides: Mutex::new(Vec::new()),
            fulfill_without_loan: Mutex::new(false),
        }
    }

    /// Construct from a collection, the way the adapter registry does it.
    ///
    /// Reads `MockVendorSettings` from the collection's integration
    /// configuration and fails with ConfigurationError on a bad document.
    pub fn from_collection(
        store: Arc<dyn CirculationStore>,
        collection: &Collection,
    ) -> CirculationResult<Self> {
        let settings: MockVendorSettings =
            serde_json::from_value(collection.integration_configuration.clone()).map_err(
                |error| CirculationError::ConfigurationError {
                    reason: format!("invalid mock vendor configuration: {error}"),
                },
            )?;
        let mut adapter = Self::new(collection.id);
        *adapter.capabilities.lock().unwrap() = settings.capabilities()?;
        adapter.store = Some(store);
        Ok(adapter)
    }

    pub fn set_capabilities(&self, capabilities: AdapterCapabilities) {
        *self.capabilities.lock().unwrap() = capabilities;
    }

    /// Install a (content type, DRM scheme) -> vendor format code table.
    ///
    /// When non-empty, checkout with a delivery mechanism resolves the
    /// vendor format first and fails with DeliveryMechanismError on an
    /// unmapped pair.
    pub fn set_format_map(&self, map: InternalFormatMap) {
        *self.format_map.lock().unwrap() = map;
    }

    pub fn set_fulfill_without_loan(&self, value: bool) {
        *self.fulfill_without_loan.lock().unwrap() = value;
    }

    pub fn queue_checkout(&self, response: CirculationResult<CheckoutOutcome>) {
        self.checkout_responses.lock().unwrap().push(response);
    }

    pub fn queue_checkin(&self, response: CirculationResult<()>) {
        self.checkin_responses.lock().unwrap().push(response);
    }

    pub fn queue_fulfill(&self, response: CirculationResult<Fulfillment>) {
        self.fulfill_responses.lock().unwrap().push(response);
    }

    pub fn queue_hold(&self, response: CirculationResult<HoldActivity>) {
        self.hold_responses.lock().unwrap().push(response);
    }

    pub fn queue_release_hold(&self, response: CirculationResult<()>) {
        self.release_hold_responses.lock().unwrap().push(response);
    }

    /// Queue a one-shot patron activity response (takes precedence over the
    /// standing remote loans and holds).
    pub fn queue_activity(&self, response: CirculationResult<Vec<ActivityItem>>) {
        self.activity_responses.lock().unwrap().push(response);
    }

    /// Add to the standing set of remote activity returned by default.
    pub fn add_remote_activity(&self, item: ActivityItem) {
        self.remote_activity.lock().unwrap().push(item);
    }

    pub fn clear_remote_activity(&self) {
        self.remote_activity.lock().unwrap().clear();
    }

    /// Script the counts that the next `update_availability` for this pool
    /// will write back through the store.
    pub fn set_availability(
        &self,
        pool: LicensePoolId,
        licenses_owned: i32,
        licenses_available: i32,
        patrons_in_hold_queue: i32,
    ) {
        self.availability_overrides.lock().unwrap().push((
            pool,
            licenses_owned,
            licenses_available,
            patrons_in_hold_queue,
        ));
    }

    /// Pools whose availability the engine asked us to refresh.
    pub fn availability_updated_for(&self) -> Vec<LicensePoolId> {
        self.availability_updated_for.lock().unwrap().clone()
    }

    /// Total number of vendor calls the engine made, per operation.
    pub fn remaining_checkout_responses(&self) -> usize {
        self.checkout_responses.lock().unwrap().len()
    }

    pub fn remaining_hold_responses(&self) -> usize {
        self.hold_responses.lock().unwrap().len()
    }

    fn pop<T>(queue: &Mutex<Vec<CirculationResult<T>>>, operation: &str) -> CirculationResult<T> {
        let mut queue = queue.lock().unwrap();
        if queue.is_empty() {
            return Err(CirculationError::RemoteInitiatedServerError {
                service: "mock vendor".to_string(),
                reason: format!("no queued response for {operation}"),
            });
        }
        queue.remove(0)
    }
}

#[async_trait]
impl VendorAdapter for MockVendorAdapter {
    fn collection_id(&self) -> CollectionId {
        self.collection_id
    }

    fn capabilities(&self) -> AdapterCapabilities {
        *self.capabilities.lock().unwrap()
    }

    async fn checkout(
        &self,
        _patron: &Patron,
        _pin: &str,
        _pool: &LicensePool,
        delivery_mechanism: Option<&LicensePoolDeliveryMechanism>,
    ) -> CirculationResult<CheckoutOutcome> {
        if let Some(lpdm) = delivery_mechanism {
            let map = self.format_map.lock().unwrap().clone();
            if !map.is_empty() {
                internal_format(&map, &lpdm.mechanism)?;
            }
        }
        Self::pop(&self.checkout_responses, "checkout")
    }

    async fn checkin(
        &self,
        _patron: &Patron,
        _pin: &str,
        _pool: &LicensePool,
    ) -> CirculationResult<()> {
        Self::pop(&self.checkin_responses, "checkin")
    }

    async fn fulfill(
        &self,
        _patron: &Patron,
        _pin: &str,
        _pool: &LicensePool,
        _delivery_mechanism: &LicensePoolDeliveryMechanism,
    ) -> CirculationResult<Fulfillment> {
        Self::pop(&self.fulfill_responses, "fulfill")
    }

    async fn place_hold(
        &self,
        _patron: &Patron,
        _pin: &str,
        _pool: &LicensePool,
        _notification_email: Option<&str>,
    ) -> CirculationResult<HoldActivity> {
        Self::pop(&self.hold_responses, "place_hold")
    }

    async fn release_hold(
        &self,
        _patron: &Patron,
        _pin: &str,
        _pool: &LicensePool,
    ) -> CirculationResult<()> {
        Self::pop(&self.release_hold_responses, "release_hold")
    }

    async fn update_availability(&self, pool: &LicensePool) -> CirculationResult<()> {
        self.availability_updated_for.lock().unwrap().push(pool.id);
        let override_for_pool = {
            let mut overrides = self.availability_overrides.lock().unwrap();
            match overrides.iter().position(|(id, ..)| *id == pool.id) {
                Some(index) => Some(overrides.remove(index)),
                None => None,
            }
        };
        if let (Some(store), Some((id, owned, available, queue))) =
            (self.store.as_ref(), override_for_pool)
        {
            store
                .update_pool_availability(id, owned, available, queue)
                .await
                .map_err(CirculationError::store)?;
        }
        Ok(())
    }

    async fn patron_activity(
        &self,
        _patron: &Patron,
        _pin: &str,
    ) -> CirculationResult<Vec<ActivityItem>> {
        let queued = {
            let mut queue = self.activity_responses.lock().unwrap();
            if queue.is_empty() {
                None
            } else {
                Some(queue.remove(0))
            }
        };
        match queued {
            Some(response) => response,
            None => Ok(self.remote_activity.lock().unwrap().clone()),
        }
    }

    async fn can_fulfill_without_loan(
        &self,
        _patron: Option<&Patron>,
        _pool: &LicensePool,
        _delivery_mechanism: &LicensePoolDeliveryMechanism,
    ) -> bool {
        *self.fulfill_without_loan.lock().unwrap()
    }
}
