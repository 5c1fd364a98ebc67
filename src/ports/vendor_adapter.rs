use std::collections::HashMap;

use async_trait::async_trait;

use crate::domain::entities::{DeliveryMechanism, LicensePool, LicensePoolDeliveryMechanism, Patron};
use crate::domain::errors::{CirculationError, CirculationResult};
use crate::domain::fulfillment::Fulfillment;
use crate::domain::records::{ActivityItem, CheckoutOutcome, HoldActivity};
use crate::domain::value_objects::CollectionId;

/// 利用者が配信方式（DRM・フォーマット）を確定すべき時点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMechanismStep {
    /// 貸出時点で確定が必要（Axis 360 型）
    Borrow,
    /// フルフィルメント時点まで確定を遅らせられる（Overdrive 型）
    Fulfill,
    /// 配信方式の選択肢がそもそもない
    Never,
}

/// アダプタが宣言する能力
///
/// 継承階層ではなく宣言的なデータとして公開する。エンジンはこの値を見て
/// 貸出フローの分岐（配信方式の必須チェック、取り置き済み予約の解除可否、
/// 同期ファンアウトへの参加）を決める。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterCapabilities {
    pub set_delivery_mechanism_at: DeliveryMechanismStep,
    /// 取り置き済み（position == 0）の予約を解除できるか
    ///
    /// 一部のベンダーは複製が取り置かれた時点で予約を固定する。
    pub can_revoke_hold_when_reserved: bool,
    /// `patron_activity` を実装しているか
    pub supports_patron_activity: bool,
}

impl Default for AdapterCapabilities {
    fn default() -> Self {
        Self {
            set_delivery_mechanism_at: DeliveryMechanismStep::Fulfill,
            can_revoke_hold_when_reserved: true,
            supports_patron_activity: false,
        }
    }
}

/// (コンテンツ種別, DRM方式) からベンダー内部フォーマット名への対応表
///
/// 例えば ("application/epub+zip", Adobe DRM) の組は、あるベンダーでは
/// "ePub"、別のベンダーでは "ebook-epub-adobe" と呼ばれる。
pub type InternalFormatMap = HashMap<(Option<String>, Option<String>), String>;

/// 配信方式をベンダー内部フォーマット名へ解決する
///
/// # エラー
/// 対応表にない組は DeliveryMechanismError
pub fn internal_format(
    map: &InternalFormatMap,
    mechanism: &DeliveryMechanism,
) -> CirculationResult<String> {
    let key = (mechanism.content_type.clone(), mechanism.drm_scheme.clone());
    map.get(&key)
        .cloned()
        .ok_or_else(|| CirculationError::DeliveryMechanismError {
            reason: format!(
                "no internal format for ({:?}, {:?})",
                mechanism.content_type, mechanism.drm_scheme
            ),
        })
}

/// ベンダーアダプタポート
///
/// 配信事業者ごとの実装（Overdrive, Axis 360, OPDS配信など）が満たす
/// コレクション単位の統一操作。ワイヤプロトコルはこの境界の下に隠れ、
/// 結果は転送レコード（LoanActivity / HoldActivity / Fulfillment）と
/// 循環エラー分類へ翻訳されて返る。
///
/// アダプタは (ストアハンドル, コレクション) から構築され、コレクションの
/// 統合設定を自身で解釈する。構築の失敗は ConfigurationError となり、
/// レジストリに保存される（送出はされない）。
///
/// アダプタのインスタンスはリクエスト間で共有されるため Send + Sync を
/// 要求する。可変状態はストア経由のキャッシュ済み資格情報に限ること。
#[async_trait]
pub trait VendorAdapter: Send + Sync {
    /// このアダプタが担当するコレクション
    fn collection_id(&self) -> CollectionId;

    /// 宣言的な能力
    fn capabilities(&self) -> AdapterCapabilities;

    /// 書籍を貸し出す
    ///
    /// `capabilities().set_delivery_mechanism_at == Borrow` の場合のみ
    /// `delivery_mechanism` が渡される。ベンダーは貸出を作れない場合、
    /// エラーの代わりに予約へ格下げして返すことがある。
    async fn checkout(
        &self,
        patron: &Patron,
        pin: &str,
        pool: &LicensePool,
        delivery_mechanism: Option<&LicensePoolDeliveryMechanism>,
    ) -> CirculationResult<CheckoutOutcome>;

    /// 書籍を返却する
    async fn checkin(&self, patron: &Patron, pin: &str, pool: &LicensePool)
        -> CirculationResult<()>;

    /// 貸出をフルフィルする（即値または遅延フルフィルメントを返す）
    async fn fulfill(
        &self,
        patron: &Patron,
        pin: &str,
        pool: &LicensePool,
        delivery_mechanism: &LicensePoolDeliveryMechanism,
    ) -> CirculationResult<Fulfillment>;

    /// 書籍を予約する
    async fn place_hold(
        &self,
        patron: &Patron,
        pin: &str,
        pool: &LicensePool,
        notification_email: Option<&str>,
    ) -> CirculationResult<HoldActivity>;

    /// 予約を解除する
    async fn release_hold(
        &self,
        patron: &Patron,
        pin: &str,
        pool: &LicensePool,
    ) -> CirculationResult<()>;

    /// 在庫情報を更新する
    ///
    /// アダプタはベンダーから最新の複製数を取得し、ストア経由で
    /// ライセンスプールへ書き戻す。呼び出し側はプールを読み直すこと。
    async fn update_availability(&self, pool: &LicensePool) -> CirculationResult<()>;

    /// 利用者の現在の貸出・予約をベンダーから取得する（任意機能）
    ///
    /// `capabilities().supports_patron_activity` が true のアダプタのみ
    /// 実装する。デフォルト実装は PatronActivityUnsupported を返す。
    async fn patron_activity(
        &self,
        patron: &Patron,
        pin: &str,
    ) -> CirculationResult<Vec<ActivityItem>> {
        let _ = (patron, pin);
        Err(CirculationError::PatronActivityUnsupported)
    }

    /// 貸出なしでフルフィルできるか
    ///
    /// 原則として不可。オープンアクセスや一部の配信モデルのみ true。
    async fn can_fulfill_without_loan(
        &self,
        patron: Option<&Patron>,
        pool: &LicensePool,
        delivery_mechanism: &LicensePoolDeliveryMechanism,
    ) -> bool {
        let _ = (patron, pool, delivery_mechanism);
        false
    }
}
