#[allow(unused_imports)]
pub mod analytics;
#[allow(unused_imports)]
pub mod circulation_store;
#[allow(unused_imports)]
pub mod vendor_adapter;

#[allow(unused_imports)]
pub use analytics::*;
#[allow(unused_imports)]
pub use circulation_store::*;
#[allow(unused_imports)]
pub use vendor_adapter::*;
