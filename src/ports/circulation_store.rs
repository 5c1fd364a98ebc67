use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::entities::{
    Collection, Credential, Hold, Library, LicensePool, LicensePoolDeliveryMechanism, Loan, Patron,
};
use crate::domain::reconcile::ReconciliationPlan;
use crate::domain::value_objects::{
    CollectionId, LibraryId, LicensePoolId, LoanId, LpdmId, PatronId,
};
use crate::domain::views::{HoldView, LoanView};

#[allow(dead_code)]
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// 貸出1件の書き込み指示
///
/// `start == None` は「不明のまま保存」を意味する（borrow 側は now で
/// 解決してから渡す。同期側は生の値を渡す）。
#[derive(Debug, Clone, Default)]
pub struct LoanCommit {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub external_identifier: Option<String>,
    /// 貸出時点で配信方式を確定するアダプタの場合のみ Some
    pub fulfillment: Option<LpdmId>,
}

/// 予約1件の書き込み指示
#[derive(Debug, Clone, Default)]
pub struct HoldCommit {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub position: Option<u32>,
    pub external_identifier: Option<String>,
}

/// 循環ストアポート
///
/// 利用者・図書館・コレクション・ライセンスプール・貸出・予約の永続化を
/// 抽象化する。複合書き込み操作（commit_loan / commit_hold / delete_* /
/// apply_reconciliation）は、実装側で1つのトランザクション＋セーブポイント
/// の中で原子的に実行されなければならない。ベンダー呼び出しが成功した
/// 後にのみ呼ばれ、途中で失敗した場合は部分状態を残さない。
///
/// 同期ファンアウトの各タスクから並行に呼ばれるため、実装は共有利用に
/// 対して安全であること（コネクションプールまたはロックで保護する）。
#[async_trait]
pub trait CirculationStore: Send + Sync {
    // ------------------------------------------------------------------
    // 読み取り
    // ------------------------------------------------------------------
    async fn patron(&self, id: PatronId) -> Result<Option<Patron>>;

    async fn library(&self, id: LibraryId) -> Result<Option<Library>>;

    async fn collections_for_library(&self, id: LibraryId) -> Result<Vec<Collection>>;

    async fn license_pool(&self, id: LicensePoolId) -> Result<Option<LicensePool>>;

    async fn delivery_mechanism(&self, id: LpdmId)
        -> Result<Option<LicensePoolDeliveryMechanism>>;

    /// (利用者, プール) の貸出。高々1件
    async fn loan_for(&self, patron: PatronId, pool: LicensePoolId) -> Result<Option<Loan>>;

    /// (利用者, プール) の予約。高々1件
    async fn hold_for(&self, patron: PatronId, pool: LicensePoolId) -> Result<Option<Hold>>;

    /// 利用者の全貸出の非正規化ビュー
    ///
    /// 貸出上限の判定と蔵書棚同期の両方が使う。
    async fn patron_loans(&self, patron: PatronId) -> Result<Vec<LoanView>>;

    /// 利用者の全予約の非正規化ビュー
    async fn patron_holds(&self, patron: PatronId) -> Result<Vec<HoldView>>;

    // ------------------------------------------------------------------
    // 複合書き込み（原子的に実行される）
    // ------------------------------------------------------------------

    /// 貸出を upsert する
    ///
    /// 同一 (利用者, プール) の予約があれば削除する（予約からの昇格）。
    /// 変更操作なので鮮度スタンプもクリアする。
    /// 戻り値の bool は行が新規作成されたかどうか。
    async fn commit_loan(
        &self,
        patron: PatronId,
        pool: LicensePoolId,
        commit: LoanCommit,
    ) -> Result<(Loan, bool)>;

    /// 予約を upsert する
    ///
    /// 同一 (利用者, プール) の貸出があれば削除する（稀な降格）。
    /// 変更操作なので鮮度スタンプもクリアする。
    async fn commit_hold(
        &self,
        patron: PatronId,
        pool: LicensePoolId,
        commit: HoldCommit,
    ) -> Result<(Hold, bool)>;

    /// 貸出行を削除し、鮮度スタンプをクリアする
    async fn delete_loan(&self, patron: PatronId, pool: LicensePoolId) -> Result<()>;

    /// 予約行を削除し、鮮度スタンプをクリアする
    async fn delete_hold(&self, patron: PatronId, pool: LicensePoolId) -> Result<()>;

    /// 貸出の配信方式を確定する
    ///
    /// フルフィルメント成立時に、利用者が選んだLPDMを貸出へ記録する。
    /// 鮮度スタンプには触れない。
    async fn set_loan_fulfillment(&self, loan: LoanId, fulfillment: LpdmId) -> Result<()>;

    /// 蔵書棚同期の反映計画を単一トランザクションで実行する
    ///
    /// - 貸出・予約の作成・更新（未知のプールは (data_source, identifier,
    ///   collection) で get-or-create する）
    /// - `locked_to` の適用：配信方式とLPDMを必要なら作成し、貸出の
    ///   fulfillment に設定する（既に同方式に束縛済みなら何もしない）
    /// - 計画された削除
    /// - 鮮度スタンプを `stamp` に設定（部分失敗時は None が渡される）
    ///
    /// 戻り値は反映後のアクティブな貸出・予約（upsert対象のみ）。
    async fn apply_reconciliation(
        &self,
        patron: PatronId,
        plan: ReconciliationPlan,
        stamp: Option<DateTime<Utc>>,
    ) -> Result<(Vec<Loan>, Vec<Hold>)>;

    /// 鮮度スタンプを直接設定する
    async fn set_last_loan_activity_sync(
        &self,
        patron: PatronId,
        value: Option<DateTime<Utc>>,
    ) -> Result<()>;

    // ------------------------------------------------------------------
    // アダプタ向け
    // ------------------------------------------------------------------

    /// 在庫数をライセンスプールへ書き戻す
    ///
    /// `update_availability` を実装するアダプタが使う。
    async fn update_pool_availability(
        &self,
        pool: LicensePoolId,
        licenses_owned: i32,
        licenses_available: i32,
        patrons_in_hold_queue: i32,
    ) -> Result<()>;

    /// 資格情報（ベアラートークン等）を取得する
    ///
    /// コアは内容を解釈しない。
    async fn credential(
        &self,
        data_source: &str,
        credential_type: &str,
        collection: Option<CollectionId>,
        patron: Option<PatronId>,
    ) -> Result<Option<Credential>>;

    /// 資格情報を保存する（同一キーは上書き）
    async fn store_credential(&self, credential: Credential) -> Result<()>;
}
