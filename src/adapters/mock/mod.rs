pub mod analytics;
pub mod store;
pub mod vendor;

#[allow(unused_imports)]
pub use analytics::MockAnalyticsSink;
#[allow(unused_imports)]
pub use store::InMemoryCirculationStore;
#[allow(unused_imports)]
pub use vendor::{MockVendorAdapter, MockVendorSettings};
