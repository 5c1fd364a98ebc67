use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::entities::{Collection, Library, LicensePool};
use crate::domain::errors::{CirculationError, CirculationResult};
use crate::domain::value_objects::{CollectionId, LibraryId};
use crate::ports::analytics::AnalyticsSink;
use crate::ports::circulation_store::CirculationStore;
use crate::ports::vendor_adapter::VendorAdapter;

/// プロトコル名からベンダーアダプタを構築するビルダー
///
/// 構築は (ストアハンドル, コレクション) から行われ、コレクションの
/// 統合設定の解釈に失敗した場合は ConfigurationError を返す。
pub type AdapterBuilder = Arc<
    dyn Fn(Arc<dyn CirculationStore>, &Collection) -> CirculationResult<Arc<dyn VendorAdapter>>
        + Send
        + Sync,
>;

/// アダプタレジストリ
///
/// コレクションの `protocol` と、対応するアダプタのビルダーの対応表。
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    builders: HashMap<String, AdapterBuilder>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// プロトコルにビルダーを登録する
    pub fn register(&mut self, protocol: impl Into<String>, builder: AdapterBuilder) {
        self.builders.insert(protocol.into(), builder);
    }

    pub fn contains(&self, protocol: &str) -> bool {
        self.builders.contains_key(protocol)
    }

    fn builder(&self, protocol: &str) -> Option<&AdapterBuilder> {
        self.builders.get(protocol)
    }
}

/// 循環エンジンの依存関係
///
/// 関数型DDDの原則に従い、データ構造として定義。
/// 振る舞い（borrow / fulfill / sync など）は純粋な関数に依存関係を渡す。
///
/// アダプタの構築はAPI呼び出し（認証ハンドシェイク等）を伴いうるため、
/// 図書館ごとに1回だけ構築し、エンジンの生存期間を通じて保持する。
pub struct CirculationDeps {
    pub store: Arc<dyn CirculationStore>,
    pub analytics: Arc<dyn AnalyticsSink>,
    pub library: Library,
    /// コレクションIDからアダプタへの対応
    pub adapters: HashMap<CollectionId, Arc<dyn VendorAdapter>>,
    /// `patron_activity` を提供するアダプタのコレクションID
    ///
    /// 蔵書棚同期はこの集合のコレクションだけを対象にする。
    pub sync_collection_ids: Vec<CollectionId>,
    /// アダプタ構築時の失敗
    ///
    /// 構築時には送出せず保存のみ行う。壊れたコレクションのアダプタを
    /// 参照しようとしたときに初めて表面化する。
    pub initialization_exceptions: HashMap<CollectionId, CirculationError>,
}

impl CirculationDeps {
    /// 図書館の全コレクションに対してアダプタを構築し、依存関係を組み立てる
    ///
    /// ビジネスルール：
    /// - レジストリに登録のないプロトコルのコレクションは黙って無視する
    /// - アダプタ構築の失敗は `initialization_exceptions` に保存し、
    ///   構築処理全体は失敗させない
    ///
    /// # エラー
    /// - LibraryNotFound: 図書館が存在しない
    /// - Store: コレクション一覧の読み取り失敗
    pub async fn build(
        store: Arc<dyn CirculationStore>,
        analytics: Arc<dyn AnalyticsSink>,
        library_id: LibraryId,
        registry: &AdapterRegistry,
    ) -> CirculationResult<Self> {
        let library = store
            .library(library_id)
            .await
            .map_err(CirculationError::store)?
            .ok_or(CirculationError::LibraryNotFound)?;
        let collections = store
            .collections_for_library(library_id)
            .await
            .map_err(CirculationError::store)?;

        let mut adapters: HashMap<CollectionId, Arc<dyn VendorAdapter>> = HashMap::new();
        let mut sync_collection_ids = Vec::new();
        let mut initialization_exceptions = HashMap::new();

        for collection in &collections {
            let Some(builder) = registry.builder(&collection.protocol) else {
                continue;
            };
            match builder(Arc::clone(&store), collection) {
                Ok(adapter) => {
                    if adapter.capabilities().supports_patron_activity {
                        sync_collection_ids.push(collection.id);
                    }
                    adapters.insert(collection.id, adapter);
                }
                Err(error) => {
                    tracing::error!(
                        collection = %collection.name,
                        %error,
                        "error loading adapter configuration"
                    );
                    initialization_exceptions.insert(collection.id, error);
                }
            }
        }

        Ok(Self {
            store,
            analytics,
            library,
            adapters,
            sync_collection_ids,
            initialization_exceptions,
        })
    }

    /// ライセンスプールを担当するアダプタを引く
    pub fn adapter_for(&self, pool: &LicensePool) -> Option<Arc<dyn VendorAdapter>> {
        self.adapters.get(&pool.collection_id).cloned()
    }

    /// コレクションIDからアダプタを引く
    pub fn adapter_for_collection(&self, id: CollectionId) -> Option<Arc<dyn VendorAdapter>> {
        self.adapters.get(&id).cloned()
    }

    /// コレクションのアダプタ構築失敗を引く
    pub fn initialization_exception(&self, id: CollectionId) -> Option<&CirculationError> {
        self.initialization_exceptions.get(&id)
    }
}
