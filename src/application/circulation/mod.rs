mod engine;
mod limits;
mod registry;
mod sync;

#[allow(unused_imports)]
pub use engine::{
    borrow, can_fulfill_without_loan, can_revoke_hold, default_notification_email_address,
    fulfill, release_hold, revoke_loan, RequestContext,
};
#[allow(unused_imports)]
pub use limits::enforce_limits;
#[allow(unused_imports)]
pub use registry::{AdapterBuilder, AdapterRegistry, CirculationDeps};
#[allow(unused_imports)]
pub use sync::{patron_activity, sync_bookshelf, sync_patron_bookshelf};
