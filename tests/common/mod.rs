#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use rusty_circulation::adapters::mock::{
    InMemoryCirculationStore, MockAnalyticsSink, MockVendorAdapter,
};
use rusty_circulation::application::circulation::{AdapterRegistry, CirculationDeps};
use rusty_circulation::domain::commands::BorrowBook;
use rusty_circulation::domain::entities::{
    Collection, DeliveryMechanism, Hold, Library, LibrarySettings, LicensePool,
    LicensePoolDeliveryMechanism, Loan, Patron, Representation, Resource,
};
use rusty_circulation::domain::fulfillment::{Fulfillment, FulfillmentData};
use rusty_circulation::domain::records::{CirculationSource, HoldActivity, LoanActivity};
use rusty_circulation::domain::value_objects::{
    CollectionId, DeliveryMechanismId, HoldId, Identifier, LibraryId, LicensePoolId, LoanId,
    LpdmId, PatronId, RIGHTS_IN_COPYRIGHT, STREAMING_PROFILE,
};
use rusty_circulation::ports::circulation_store::CirculationStore;
use rusty_circulation::ports::vendor_adapter::{AdapterCapabilities, VendorAdapter};

pub const DATA_SOURCE: &str = "Example Distributor";
pub const PROTOCOL: &str = "Mock Vendor";
pub const EPUB_MEDIA_TYPE: &str = "application/epub+zip";
pub const ADOBE_DRM: &str = "application/vnd.adobe.adept+xml";

/// テストログの初期化
///
/// RUST_LOG で出力を制御する。多重初期化は無視する。
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// 統合テスト用フィクスチャ
///
/// インメモリストア・モック分析シンク・スクリプト可能なモックベンダー
/// アダプタを1コレクション構成で束ね、循環エンジンの依存関係を組み立てる。
/// 各テストはアダプタへ応答をキューイングしてからエンジンを呼ぶ。
pub struct CirculationFixture {
    pub store: Arc<InMemoryCirculationStore>,
    pub analytics: Arc<MockAnalyticsSink>,
    pub adapter: Arc<MockVendorAdapter>,
    pub deps: CirculationDeps,
    pub library: Library,
    pub patron: Patron,
    pub pool: LicensePool,
    pub lpdm: LicensePoolDeliveryMechanism,
}

impl CirculationFixture {
    /// デフォルト設定（上限なし・同期可能アダプタ）のフィクスチャ
    pub async fn new() -> Self {
        Self::with_settings(LibrarySettings::default()).await
    }

    pub async fn with_settings(settings: LibrarySettings) -> Self {
        Self::build(
            settings,
            AdapterCapabilities {
                supports_patron_activity: true,
                ..AdapterCapabilities::default()
            },
        )
        .await
    }

    pub async fn with_capabilities(capabilities: AdapterCapabilities) -> Self {
        Self::build(LibrarySettings::default(), capabilities).await
    }

    pub async fn build(settings: LibrarySettings, capabilities: AdapterCapabilities) -> Self {
        init_tracing();
        let store = Arc::new(InMemoryCirculationStore::new());
        let analytics = Arc::new(MockAnalyticsSink::new());

        let library = Library {
            id: LibraryId::new(),
            name: "Main Street Library".to_string(),
            settings,
        };
        store.insert_library(library.clone());

        let collection = Collection {
            id: CollectionId::new(1),
            library_id: library.id,
            name: "Mock Collection".to_string(),
            protocol: PROTOCOL.to_string(),
            integration_configuration: serde_json::json!({}),
        };
        store.insert_collection(collection.clone());

        let patron = Patron {
            id: PatronId::new(),
            library_id: library.id,
            authorization_identifier: "200100".to_string(),
            authorization_expires: None,
            fines: 0.0,
            block_reason: None,
            neighborhood: None,
            external_type: None,
            last_loan_activity_sync: None,
        };
        store.insert_patron(patron.clone());

        let (pool, lpdm) = pool_with_mechanism(
            collection.id,
            "9780000000001",
            Some(EPUB_MEDIA_TYPE),
            Some(ADOBE_DRM),
        );
        store.insert_pool(pool.clone());

        let adapter = Arc::new(MockVendorAdapter::new(collection.id));
        adapter.set_capabilities(capabilities);

        let mut registry = AdapterRegistry::new();
        let shared = Arc::clone(&adapter);
        registry.register(
            PROTOCOL,
            Arc::new(move |_store, _collection| Ok(Arc::clone(&shared) as Arc<dyn VendorAdapter>)),
        );

        let store_handle: Arc<dyn CirculationStore> = store.clone();
        let deps = CirculationDeps::build(
            store_handle,
            analytics.clone(),
            library.id,
            &registry,
        )
        .await
        .expect("fixture deps should build");

        Self {
            store,
            analytics,
            adapter,
            deps,
            library,
            patron,
            pool,
            lpdm,
        }
    }

    // ------------------------------------------------------------------
    // コマンド・転送レコードのヘルパー
    // ------------------------------------------------------------------

    pub fn borrow_cmd(&self) -> BorrowBook {
        BorrowBook {
            patron_id: self.patron.id,
            pin: "1234".to_string(),
            license_pool_id: self.pool.id,
            delivery_mechanism: Some(self.lpdm.id),
            hold_notification_email: None,
        }
    }

    pub fn source(&self) -> CirculationSource {
        CirculationSource::new(
            Some(self.pool.collection_id),
            DATA_SOURCE,
            self.pool.identifier.clone(),
        )
    }

    pub fn loan_info(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> LoanActivity {
        LoanActivity::new(self.source(), start, end)
    }

    pub fn hold_info(&self, position: Option<u32>) -> HoldActivity {
        HoldActivity::new(
            self.source(),
            Some(Utc::now()),
            Some(Utc::now() + Duration::days(10)),
            position,
        )
    }

    pub fn link_fulfillment(&self) -> Fulfillment {
        Fulfillment::eager(FulfillmentData {
            content_link: Some("https://cdn.example.com/book.acsm".to_string()),
            content_type: Some(EPUB_MEDIA_TYPE.to_string()),
            content: None,
            content_expires: Some(Utc::now() + Duration::hours(1)),
            content_link_redirect: false,
            response_override: None,
        })
    }

    // ------------------------------------------------------------------
    // ローカル状態の準備
    // ------------------------------------------------------------------

    /// 利用者の既存貸出を挿入する
    pub fn add_local_loan(&self, start: Option<DateTime<Utc>>) -> Loan {
        let loan = Loan {
            id: LoanId::new(),
            patron_id: self.patron.id,
            license_pool_id: self.pool.id,
            start,
            end: Some(Utc::now() + Duration::days(7)),
            fulfillment_id: None,
            external_identifier: None,
        };
        self.store.insert_loan(loan.clone());
        loan
    }

    /// 利用者の既存予約を挿入する
    pub fn add_local_hold(&self, position: Option<u32>) -> Hold {
        let hold = Hold {
            id: HoldId::new(),
            patron_id: self.patron.id,
            license_pool_id: self.pool.id,
            start: Some(Utc::now() - Duration::days(1)),
            end: None,
            position,
            external_identifier: None,
        };
        self.store.insert_hold(hold.clone());
        hold
    }

    /// 上限カウント用：別タイトルへの貸出を n 件作る（期限付き・非OA）
    pub fn add_countable_loans(&self, count: usize) {
        for index in 0..count {
            let (pool, _) = pool_with_mechanism(
                self.pool.collection_id,
                &format!("97811000000{index:02}"),
                Some(EPUB_MEDIA_TYPE),
                Some(ADOBE_DRM),
            );
            self.store.insert_pool(pool.clone());
            self.store.insert_loan(Loan {
                id: LoanId::new(),
                patron_id: self.patron.id,
                license_pool_id: pool.id,
                start: Some(Utc::now() - Duration::days(1)),
                end: Some(Utc::now() + Duration::days(13)),
                fulfillment_id: None,
                external_identifier: None,
            });
        }
    }

    /// 上限カウント用：別タイトルへの予約を n 件作る
    pub fn add_extra_holds(&self, count: usize) {
        for index in 0..count {
            let (pool, _) = pool_with_mechanism(
                self.pool.collection_id,
                &format!("97812000000{index:02}"),
                Some(EPUB_MEDIA_TYPE),
                Some(ADOBE_DRM),
            );
            self.store.insert_pool(pool.clone());
            self.store.insert_hold(Hold {
                id: HoldId::new(),
                patron_id: self.patron.id,
                license_pool_id: pool.id,
                start: Some(Utc::now() - Duration::days(2)),
                end: None,
                position: Some(3),
                external_identifier: None,
            });
        }
    }

    /// 利用者スナップショットを書き換えて保存し直す
    pub fn update_patron(&self, patron: Patron) {
        self.store.insert_patron(patron);
    }

    pub async fn reload_patron(&self) -> Patron {
        self.store
            .patron(self.patron.id)
            .await
            .expect("store should not fail")
            .expect("fixture patron should exist")
    }

    pub async fn local_loan(&self) -> Option<Loan> {
        self.store
            .loan_for(self.patron.id, self.pool.id)
            .await
            .expect("store should not fail")
    }

    pub async fn local_hold(&self) -> Option<Hold> {
        self.store
            .hold_for(self.patron.id, self.pool.id)
            .await
            .expect("store should not fail")
    }
}

/// プールと配信方式（LPDM）を組で作る
pub fn pool_with_mechanism(
    collection_id: CollectionId,
    identifier: &str,
    content_type: Option<&str>,
    drm_scheme: Option<&str>,
) -> (LicensePool, LicensePoolDeliveryMechanism) {
    let pool_id = LicensePoolId::new();
    let lpdm = LicensePoolDeliveryMechanism {
        id: LpdmId::new(),
        license_pool_id: pool_id,
        data_source: DATA_SOURCE.to_string(),
        identifier: Identifier::new("ISBN", identifier),
        mechanism: DeliveryMechanism {
            id: DeliveryMechanismId::new(),
            content_type: content_type.map(String::from),
            drm_scheme: drm_scheme.map(String::from),
        },
        rights_uri: Some(RIGHTS_IN_COPYRIGHT.to_string()),
        resource: None,
    };
    let pool = LicensePool {
        id: pool_id,
        collection_id,
        data_source: DATA_SOURCE.to_string(),
        identifier: Identifier::new("ISBN", identifier),
        open_access: false,
        unlimited_access: false,
        licenses_owned: 1,
        licenses_available: 1,
        patrons_in_hold_queue: 0,
        delivery_mechanisms: vec![lpdm.clone()],
    };
    (pool, lpdm)
}

/// ストリーミング配信方式のLPDMをプールへ追加した版を作る
pub fn streaming_mechanism(pool: &LicensePool) -> LicensePoolDeliveryMechanism {
    LicensePoolDeliveryMechanism {
        id: LpdmId::new(),
        license_pool_id: pool.id,
        data_source: pool.data_source.clone(),
        identifier: pool.identifier.clone(),
        mechanism: DeliveryMechanism {
            id: DeliveryMechanismId::new(),
            content_type: Some(format!("text/html{STREAMING_PROFILE}")),
            drm_scheme: None,
        },
        rights_uri: Some(RIGHTS_IN_COPYRIGHT.to_string()),
        resource: None,
    }
}

/// オープンアクセス配信可能なLPDM（リソース付き）を作る
pub fn open_access_mechanism(pool: &LicensePool) -> LicensePoolDeliveryMechanism {
    LicensePoolDeliveryMechanism {
        id: LpdmId::new(),
        license_pool_id: pool.id,
        data_source: pool.data_source.clone(),
        identifier: pool.identifier.clone(),
        mechanism: DeliveryMechanism {
            id: DeliveryMechanismId::new(),
            content_type: Some(EPUB_MEDIA_TYPE.to_string()),
            drm_scheme: None,
        },
        rights_uri: None,
        resource: Some(Resource {
            url: "https://archive.example.org/book".to_string(),
            representation: Some(Representation {
                media_type: Some(EPUB_MEDIA_TYPE.to_string()),
                content: None,
                public_url: Some("https://archive.example.org/book.epub".to_string()),
            }),
        }),
    }
}
